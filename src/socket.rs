//! Datagram sockets and reliable UDPX framing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{debug, trace, warn};
use rand_core::RngCore;
use smoltcp::wire::{IpAddress, IpProtocol, Ipv4Address, UdpPacket};

use crate::error::StackError;
use crate::mem::{Arena, Handle};
use crate::netmsg::{emit_ipv4_header, NetQueues, IP_MTU};
use crate::{time_reached, StackConfig, Ts, Warnings};

pub const MAX_SOCKETS: usize = 8;
/// Receive queue depth per socket
pub const SOCKET_RX_DEPTH: usize = 4;

pub const EPHEMERAL_PORT_BASE: u16 = 32768;

pub const UDP_HEADER_SIZE: usize = 8;

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SockAddr {
    pub ip: Ipv4Address,
    pub port: u16,
}

bitflags::bitflags! {
    pub struct SockOptions: u8 {
        /// Send with TTL 1 (link local traffic)
        const TTL_1 = 0x01;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SocketHandle(u8);

struct DgramSocket {
    lport: u16,
    options: SockOptions,
    rx: heapless::Vec<(SockAddr, Handle), SOCKET_RX_DEPTH>,
}

pub struct Sockets {
    slots: [Option<DgramSocket>; MAX_SOCKETS],
    next_ephemeral: u16,
}

impl Sockets {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            next_ephemeral: EPHEMERAL_PORT_BASE,
        }
    }

    pub fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|s| s.lport == port)
    }

    fn alloc_ephemeral(&mut self) -> u16 {
        loop {
            let port = self.next_ephemeral;
            self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
            if !self.port_in_use(port) {
                return port;
            }
        }
    }

    pub fn create(&mut self) -> Result<SocketHandle, StackError<()>> {
        let slot = match self.slots.iter().position(|s| s.is_none()) {
            Some(s) => s,
            None => return Err(StackError::TableFull),
        };

        self.slots[slot] = Some(DgramSocket {
            lport: 0,
            options: SockOptions::empty(),
            rx: heapless::Vec::new(),
        });

        Ok(SocketHandle(slot as u8))
    }

    pub fn release(&mut self, mem: &mut Arena, sock: SocketHandle) {
        if let Some(s) = self.slots[sock.0 as usize].take() {
            for (_, h) in s.rx.iter() {
                let _ = mem.free(*h);
            }
        }
    }

    pub fn bind(&mut self, sock: SocketHandle, port: u16) -> Result<(), StackError<()>> {
        if self.port_in_use(port) {
            return Err(StackError::Busy);
        }
        if let Some(s) = &mut self.slots[sock.0 as usize] {
            s.lport = port;
        }
        Ok(())
    }

    pub fn set_options(&mut self, sock: SocketHandle, options: SockOptions) {
        if let Some(s) = &mut self.slots[sock.0 as usize] {
            s.options = options;
        }
    }

    pub fn local_port(&self, sock: SocketHandle) -> u16 {
        self.slots[sock.0 as usize]
            .as_ref()
            .map(|s| s.lport)
            .unwrap_or(0)
    }

    /// Build a UDP datagram into a netmsg on the transmit queue
    pub fn sendto(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sock: SocketHandle,
        data: &[u8],
        raddr: &SockAddr,
    ) -> Result<(), StackError<()>> {
        let (lport, options) = {
            let s = match &self.slots[sock.0 as usize] {
                Some(s) => s,
                None => return Err(StackError::Decode),
            };
            (s.lport, s.options)
        };

        let lport = if lport == 0 {
            let port = self.alloc_ephemeral();
            if let Some(s) = &mut self.slots[sock.0 as usize] {
                s.lport = port;
            }
            port
        } else {
            lport
        };

        let udp_len = UDP_HEADER_SIZE + data.len();
        if 20 + udp_len > IP_MTU {
            return Err(StackError::Decode);
        }

        let ttl = if options.contains(SockOptions::TTL_1) {
            1
        } else {
            64
        };

        let mut buf = [0u8; IP_MTU];
        let total = emit_ipv4_header(&mut buf, cfg.ip, raddr.ip, IpProtocol::Udp, ttl, udp_len);

        {
            let mut udp = UdpPacket::new_unchecked(&mut buf[20..total]);
            udp.set_src_port(lport);
            udp.set_dst_port(raddr.port);
            udp.set_len(udp_len as u16);
            udp.payload_mut()[..data.len()].copy_from_slice(data);
            udp.fill_checksum(&IpAddress::Ipv4(cfg.ip), &IpAddress::Ipv4(raddr.ip));
        }

        let h = netq.create(mem, warnings, &buf[..total])?;
        netq.push_tx(mem, warnings, h);

        trace!("udp {} -> {}:{} ({} bytes)", lport, raddr.ip, raddr.port, data.len());

        Ok(())
    }

    /// Pop a received datagram. The returned handle owns the payload
    /// and must be freed by the caller.
    pub fn recvfrom(&mut self, sock: SocketHandle) -> Option<(SockAddr, Handle)> {
        let s = self.slots[sock.0 as usize].as_mut()?;
        if s.rx.is_empty() {
            None
        } else {
            Some(s.rx.remove(0))
        }
    }

    pub fn rx_pending(&self, sock: SocketHandle) -> bool {
        self.slots[sock.0 as usize]
            .as_ref()
            .map(|s| !s.rx.is_empty())
            .unwrap_or(false)
    }

    /// Deliver a verified local IPv4/UDP packet to the bound socket
    pub fn udp_input(&mut self, mem: &mut Arena, packet: &[u8]) {
        let ihl = ((packet[0] & 0x0f) as usize) * 4;
        if packet.len() < ihl + UDP_HEADER_SIZE {
            return;
        }

        let udp = match UdpPacket::new_checked(&packet[ihl..]) {
            Ok(u) => u,
            Err(_) => return,
        };

        let src = SockAddr {
            ip: Ipv4Address::from_bytes(&packet[12..16]),
            port: udp.src_port(),
        };
        let dst_port = udp.dst_port();
        let payload = udp.payload();

        let slot = self
            .slots
            .iter_mut()
            .flatten()
            .find(|s| s.lport != 0 && s.lport == dst_port);

        let s = match slot {
            Some(s) => s,
            None => {
                trace!("no socket bound to port {}", dst_port);
                return;
            }
        };

        if s.rx.len() >= SOCKET_RX_DEPTH {
            warn!("socket rx overflow on port {}", dst_port);
            return;
        }

        let h = match mem.alloc(payload.len()) {
            Ok(h) => h,
            Err(_) => return,
        };
        let _ = mem.with(h, |buf| buf.copy_from_slice(payload));
        let _ = s.rx.push((src, h));

        debug!("udp rx {} bytes on port {}", payload.len(), dst_port);
    }
}

// UDPX: reliable unicast datagrams with ids, acks and retries

pub const UDPX_MAX_TRIES: u8 = 5;
pub const UDPX_INITIAL_TIMEOUT_MS: Ts = 500;

pub const UDPX_HEADER_SIZE: usize = 2;

bitflags::bitflags! {
    pub struct UdpxFlags: u8 {
        const VER1 = 0x80;
        const VER0 = 0x40;
        const SVR  = 0x20;
        const ARQ  = 0x10;
        const ACK  = 0x08;
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UdpxHeader {
    pub flags: UdpxFlags,
    pub id: u8,
}

impl UdpxHeader {
    pub fn encode(&self) -> [u8; UDPX_HEADER_SIZE] {
        [self.flags.bits(), self.id]
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDPX_HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: UdpxFlags::from_bits_truncate(buf[0]),
            id: buf[1],
        })
    }

    /// Server acknowledgement for a request header
    pub fn ack_for(req: &UdpxHeader) -> Self {
        Self {
            flags: UdpxFlags::SVR | UdpxFlags::ACK,
            id: req.id,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UdpxPoll {
    Idle,
    /// Retransmit with the same id
    Resend(UdpxHeader),
    /// Retries exhausted
    Failed,
}

/// Client side retry state for one outstanding UDPX exchange
pub struct UdpxClient {
    id: u8,
    tries: u8,
    timeout: Ts,
    deadline: Ts,
    awaiting: bool,
}

impl UdpxClient {
    pub fn new() -> Self {
        Self {
            id: 0,
            tries: 0,
            timeout: 0,
            deadline: 0,
            awaiting: false,
        }
    }

    pub fn busy(&self) -> bool {
        self.awaiting
    }

    /// Begin an exchange, returning the request header to send
    pub fn start<G: RngCore>(&mut self, rng: &mut G, now: Ts) -> UdpxHeader {
        self.id = rng.next_u32() as u8;
        self.tries = 1;
        self.timeout = UDPX_INITIAL_TIMEOUT_MS;
        self.deadline = now.wrapping_add(self.timeout);
        self.awaiting = true;

        UdpxHeader {
            flags: UdpxFlags::ARQ,
            id: self.id,
        }
    }

    /// Drive timeouts, doubling the retry interval each attempt
    pub fn poll(&mut self, now: Ts) -> UdpxPoll {
        if !self.awaiting || !time_reached(now, self.deadline) {
            return UdpxPoll::Idle;
        }

        if self.tries >= UDPX_MAX_TRIES {
            self.awaiting = false;
            return UdpxPoll::Failed;
        }

        self.tries += 1;
        self.timeout = self.timeout.saturating_mul(2);
        self.deadline = now.wrapping_add(self.timeout);

        UdpxPoll::Resend(UdpxHeader {
            flags: UdpxFlags::ARQ,
            id: self.id,
        })
    }

    /// Feed a received header, true when it completes the exchange
    pub fn acked(&mut self, header: &UdpxHeader) -> bool {
        if self.awaiting && header.flags.contains(UdpxFlags::ACK) && header.id == self.id {
            self.awaiting = false;
            true
        } else {
            false
        }
    }
}
