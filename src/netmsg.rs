//! Network message containers and local IPv4 delivery
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{debug, trace, warn};
use smoltcp::wire::{IpProtocol, Ipv4Address, Ipv4Packet};

use crate::error::StackError;
use crate::mem::{Arena, Handle};
use crate::socket::Sockets;
use crate::{StackConfig, Warnings};

/// Maximum messages held across all netmsg queues
pub const NETMSG_MAX_MESSAGES: usize = 16;

/// Largest IPv4 packet carried by the stack
pub const IP_MTU: usize = 1023;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

pub const ICMP_CODE_HOST_UNREACHABLE: u8 = 1;

bitflags::bitflags! {
    pub struct NetmsgFlags: u8 {
        /// Carried without an authentication header
        const SECURITY_DISABLE = 0x01;
        /// Never forwarded over the radio
        const NO_WIRELESS      = 0x02;
    }
}

/// Netmsg queues. A netmsg is an arena block holding a flag byte
/// followed by one IPv4 packet.
pub struct NetQueues {
    tx: heapless::Vec<Handle, NETMSG_MAX_MESSAGES>,
    rx: heapless::Vec<Handle, NETMSG_MAX_MESSAGES>,
    outstanding: u8,
}

impl NetQueues {
    pub fn new() -> Self {
        Self {
            tx: heapless::Vec::new(),
            rx: heapless::Vec::new(),
            outstanding: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.outstanding as usize
    }

    /// Allocate a netmsg holding a copy of `packet`
    pub fn create(
        &mut self,
        mem: &mut Arena,
        warnings: &mut Warnings,
        packet: &[u8],
    ) -> Result<Handle, StackError<()>> {
        if self.outstanding as usize >= NETMSG_MAX_MESSAGES || packet.len() > IP_MTU {
            warnings.insert(Warnings::NETMSG_FULL);
            return Err(StackError::QueueFull);
        }

        let h = match mem.alloc(1 + packet.len()) {
            Ok(h) => h,
            Err(e) => {
                warnings.insert(Warnings::MEM_FULL);
                return Err(StackError::Mem(e));
            }
        };

        let _ = mem.with(h, |buf| {
            buf[0] = 0;
            buf[1..].copy_from_slice(packet);
        });

        self.outstanding += 1;
        Ok(h)
    }

    pub fn release(&mut self, mem: &mut Arena, h: Handle) {
        if mem.free(h).is_ok() {
            self.outstanding = self.outstanding.saturating_sub(1);
        }
    }

    pub fn flags(&self, mem: &Arena, h: Handle) -> NetmsgFlags {
        mem.bytes(h)
            .map(|b| NetmsgFlags::from_bits_truncate(b[0]))
            .unwrap_or(NetmsgFlags::empty())
    }

    pub fn set_flags(&mut self, mem: &mut Arena, h: Handle, flags: NetmsgFlags) {
        let _ = mem.with(h, |b| b[0] = flags.bits());
    }

    /// IPv4 packet bytes of a netmsg
    pub fn data<'a>(&self, mem: &'a Arena, h: Handle) -> &'a [u8] {
        match mem.bytes(h) {
            Ok(b) => &b[1..],
            Err(_) => &[],
        }
    }

    pub fn push_tx(&mut self, mem: &mut Arena, warnings: &mut Warnings, h: Handle) {
        if self.tx.push(h).is_err() {
            warn!("netmsg tx queue full");
            warnings.insert(Warnings::NETMSG_FULL);
            self.release(mem, h);
        }
    }

    pub fn push_rx(&mut self, mem: &mut Arena, warnings: &mut Warnings, h: Handle) {
        if self.rx.push(h).is_err() {
            warn!("netmsg rx queue full");
            warnings.insert(Warnings::NETMSG_FULL);
            self.release(mem, h);
        }
    }

    pub fn pop_tx(&mut self) -> Option<Handle> {
        if self.tx.is_empty() {
            None
        } else {
            Some(self.tx.remove(0))
        }
    }

    pub fn pop_rx(&mut self) -> Option<Handle> {
        if self.rx.is_empty() {
            None
        } else {
            Some(self.rx.remove(0))
        }
    }

    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }
}

/// RFC 1071 internet checksum
pub fn inet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}

/// Build a minimal IPv4 header in front of `payload_len` bytes
pub fn emit_ipv4_header(
    buf: &mut [u8],
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: IpProtocol,
    ttl: u8,
    payload_len: usize,
) -> usize {
    let total = 20 + payload_len;

    let mut packet = Ipv4Packet::new_unchecked(&mut buf[..total]);
    packet.set_version(4);
    packet.set_header_len(20);
    packet.set_dscp(0);
    packet.set_ecn(0);
    packet.set_total_len(total as u16);
    packet.set_ident(0);
    packet.clear_flags();
    packet.set_frag_offset(0);
    packet.set_hop_limit(ttl);
    packet.set_protocol(protocol);
    packet.set_src_addr(src);
    packet.set_dst_addr(dst);
    packet.fill_checksum();

    total
}

/// Emit an ICMP error quoting the offending packet's header + 8 bytes
fn send_icmp_error(
    netq: &mut NetQueues,
    mem: &mut Arena,
    warnings: &mut Warnings,
    cfg: &StackConfig,
    orig: &[u8],
    msg_type: u8,
    msg_code: u8,
) {
    if orig.len() < 20 {
        return;
    }

    let orig_src = Ipv4Address::from_bytes(&orig[12..16]);
    if orig_src.is_unspecified() {
        return;
    }

    let ihl = ((orig[0] & 0x0f) as usize) * 4;
    let quote_len = orig.len().min(ihl + 8);
    let icmp_len = 8 + quote_len;

    let mut buf = [0u8; 20 + 8 + 60 + 8];
    let total = emit_ipv4_header(&mut buf, cfg.ip, orig_src, IpProtocol::Icmp, 64, icmp_len);

    let icmp = &mut buf[20..total];
    icmp[0] = msg_type;
    icmp[1] = msg_code;
    icmp[2] = 0;
    icmp[3] = 0;
    icmp[4..8].fill(0);
    icmp[8..8 + quote_len].copy_from_slice(&orig[..quote_len]);

    let csum = inet_checksum(&buf[20..total]);
    buf[22..24].copy_from_slice(&csum.to_be_bytes());

    if let Ok(h) = netq.create(mem, warnings, &buf[..total]) {
        netq.push_tx(mem, warnings, h);
    }
}

/// Destination unreachable towards the originator of `orig`
pub fn send_dest_unreachable(
    netq: &mut NetQueues,
    mem: &mut Arena,
    warnings: &mut Warnings,
    cfg: &StackConfig,
    orig: &[u8],
) {
    debug!("sending destination unreachable");
    send_icmp_error(
        netq,
        mem,
        warnings,
        cfg,
        orig,
        ICMP_DEST_UNREACHABLE,
        ICMP_CODE_HOST_UNREACHABLE,
    );
}

/// TTL expiry notice towards the originator of `orig`
pub fn send_ttl_exceeded(
    netq: &mut NetQueues,
    mem: &mut Arena,
    warnings: &mut Warnings,
    cfg: &StackConfig,
    orig: &[u8],
) {
    debug!("sending time exceeded");
    send_icmp_error(netq, mem, warnings, cfg, orig, ICMP_TIME_EXCEEDED, 0);
}

fn icmp_input(
    netq: &mut NetQueues,
    mem: &mut Arena,
    warnings: &mut Warnings,
    cfg: &StackConfig,
    packet: &[u8],
) {
    let ihl = ((packet[0] & 0x0f) as usize) * 4;
    if packet.len() < ihl + 8 {
        return;
    }

    let icmp = &packet[ihl..];
    if inet_checksum(icmp) != 0 {
        trace!("icmp checksum mismatch");
        return;
    }

    if icmp[0] != ICMP_ECHO_REQUEST {
        return;
    }

    let src = Ipv4Address::from_bytes(&packet[12..16]);

    // echo the packet back, addresses swapped
    let mut buf = [0u8; IP_MTU];
    let total = packet.len();
    buf[..total].copy_from_slice(packet);

    {
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[..total]);
        ip.set_src_addr(cfg.ip);
        ip.set_dst_addr(src);
        ip.set_hop_limit(64);
        ip.fill_checksum();
    }

    buf[ihl] = ICMP_ECHO_REPLY;
    buf[ihl + 2] = 0;
    buf[ihl + 3] = 0;
    let csum = inet_checksum(&buf[ihl..total]);
    buf[ihl + 2..ihl + 4].copy_from_slice(&csum.to_be_bytes());

    if let Ok(h) = netq.create(mem, warnings, &buf[..total]) {
        netq.push_tx(mem, warnings, h);
    }
}

/// Deliver a received (or looped back) netmsg to local consumers
pub fn local_receive(
    netq: &mut NetQueues,
    mem: &mut Arena,
    sockets: &mut Sockets,
    cfg: &StackConfig,
    warnings: &mut Warnings,
    h: Handle,
) {
    // copy out, replies below allocate from the same arena
    let mut buf = [0u8; IP_MTU];
    let len = {
        let data = netq.data(mem, h);
        if data.len() < 20 || data.len() > IP_MTU {
            return;
        }
        buf[..data.len()].copy_from_slice(data);
        data.len()
    };
    let packet = &buf[..len];

    let parsed = match Ipv4Packet::new_checked(packet) {
        Ok(p) => p,
        Err(_) => return,
    };
    if !parsed.verify_checksum() {
        debug!("ip header checksum failed");
        return;
    }

    let dst = parsed.dst_addr();
    let broadcast = dst.is_broadcast();
    if dst != cfg.ip && !broadcast {
        return;
    }

    match parsed.protocol() {
        IpProtocol::Icmp => icmp_input(netq, mem, warnings, cfg, packet),
        IpProtocol::Udp => sockets.udp_input(mem, packet),
        _ => (),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> StackConfig {
        StackConfig {
            ip: Ipv4Address::new(10, 0, 0, 1),
            ..Default::default()
        }
    }

    fn echo_request(src: Ipv4Address, dst: Ipv4Address, seq: u16) -> std::vec::Vec<u8> {
        let payload = [0x61u8; 16];
        let mut buf = std::vec![0u8; 20 + 8 + payload.len()];

        let icmp_len = 8 + payload.len();
        emit_ipv4_header(&mut buf, src, dst, IpProtocol::Icmp, 64, icmp_len);

        buf[20] = ICMP_ECHO_REQUEST;
        buf[24..26].copy_from_slice(&0x1234u16.to_be_bytes());
        buf[26..28].copy_from_slice(&seq.to_be_bytes());
        buf[28..].copy_from_slice(&payload);
        let csum = inet_checksum(&buf[20..]);
        buf[22..24].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    #[test]
    fn checksum_known_value() {
        // RFC 1071 example words
        let data = [0x00u8, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(inet_checksum(&data), !0xddf2);
    }

    #[test]
    fn create_release_accounting() {
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();

        let h = netq.create(&mut mem, &mut warnings, &[1, 2, 3]).unwrap();
        assert_eq!(netq.count(), 1);
        assert_eq!(netq.data(&mem, h), &[1, 2, 3]);

        netq.release(&mut mem, h);
        assert_eq!(netq.count(), 0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn message_limit_warns() {
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();

        let mut held = std::vec::Vec::new();
        for _ in 0..NETMSG_MAX_MESSAGES {
            held.push(netq.create(&mut mem, &mut warnings, &[0u8; 8]).unwrap());
        }
        assert!(netq.create(&mut mem, &mut warnings, &[0u8; 8]).is_err());
        assert!(warnings.contains(Warnings::NETMSG_FULL));
    }

    #[test]
    fn echo_request_generates_reply() {
        let c = cfg();
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();
        let mut sockets = Sockets::new();

        let req = echo_request(Ipv4Address::new(10, 0, 0, 2), c.ip, 7);
        let h = netq.create(&mut mem, &mut warnings, &req).unwrap();

        local_receive(&mut netq, &mut mem, &mut sockets, &c, &mut warnings, h);
        netq.release(&mut mem, h);

        let reply = netq.pop_tx().unwrap();
        let data = netq.data(&mem, reply);

        let ip = Ipv4Packet::new_checked(data).unwrap();
        assert!(ip.verify_checksum());
        assert_eq!(ip.dst_addr(), Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(ip.src_addr(), c.ip);

        assert_eq!(data[20], ICMP_ECHO_REPLY);
        assert_eq!(inet_checksum(&data[20..]), 0);
        // ident/seq/payload preserved
        assert_eq!(&data[24..26], &0x1234u16.to_be_bytes());
        assert_eq!(&data[26..28], &7u16.to_be_bytes());
    }

    #[test]
    fn echo_for_other_host_ignored() {
        let c = cfg();
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();
        let mut sockets = Sockets::new();

        let req = echo_request(Ipv4Address::new(10, 0, 0, 2), Ipv4Address::new(10, 0, 0, 3), 1);
        let h = netq.create(&mut mem, &mut warnings, &req).unwrap();
        local_receive(&mut netq, &mut mem, &mut sockets, &c, &mut warnings, h);

        assert!(netq.pop_tx().is_none());
    }

    #[test]
    fn corrupt_checksum_dropped() {
        let c = cfg();
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();
        let mut sockets = Sockets::new();

        let mut req = echo_request(Ipv4Address::new(10, 0, 0, 2), c.ip, 1);
        req[10] ^= 0xff; // smash the header checksum
        let h = netq.create(&mut mem, &mut warnings, &req).unwrap();
        local_receive(&mut netq, &mut mem, &mut sockets, &c, &mut warnings, h);
        assert!(netq.pop_tx().is_none());
    }

    #[test]
    fn icmp_error_quotes_original() {
        let c = cfg();
        let mut mem = Arena::new();
        let mut warnings = Warnings::empty();
        let mut netq = NetQueues::new();

        let orig = echo_request(Ipv4Address::new(10, 0, 0, 2), Ipv4Address::new(10, 0, 0, 9), 3);
        send_dest_unreachable(&mut netq, &mut mem, &mut warnings, &c, &orig);

        let h = netq.pop_tx().unwrap();
        let data = netq.data(&mem, h);

        let ip = Ipv4Packet::new_checked(data).unwrap();
        assert_eq!(ip.dst_addr(), Ipv4Address::new(10, 0, 0, 2));
        assert_eq!(ip.protocol(), IpProtocol::Icmp);

        assert_eq!(data[20], ICMP_DEST_UNREACHABLE);
        assert_eq!(data[21], ICMP_CODE_HOST_UNREACHABLE);
        assert_eq!(inet_checksum(&data[20..]), 0);
        // quoted header + 8 bytes of the original
        assert_eq!(&data[28..48], &orig[..20]);
        assert_eq!(&data[48..56], &orig[20..28]);
    }
}
