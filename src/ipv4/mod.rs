//! IPv4 over 802.15.4: fragmentation, authentication, forwarding
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Composite frame body, fragmented across MAC frames:
//
//   [auth header][source route header][IPv4 packet]
//
// The auth header holds a replay counter and a 96 bit tag computed with
// the sender's session IV standing in for the tag bytes; the IV itself
// travels via the neighbor protocol, never per message.

use log::{debug, trace, warn};
use smoltcp::wire::{Ipv4Address, Ipv4Packet};

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::{tag_eq, Crypto, AUTH_TAG_SIZE};
use crate::error::StackError;
use crate::mac::{frame, Mac, MacAddr, MsgId, MsgStatus, Protocol, TxOptions};
use crate::mem::{Arena, Handle};
use crate::neighbor::Neighbors;
use crate::netmsg::{self, NetQueues, NetmsgFlags, IP_MTU};
use crate::route::{messages as route_messages, RouteQuery, Routing};
use crate::sched::Disposition;
use crate::socket::Sockets;
use crate::{StackConfig, Warnings, BROADCAST_SHORT};

pub mod frag;
use frag::{FragHeader, FrameFlags, FRAG_HEADER_SIZE};

/// Concurrent reassembly entries
pub const MAX_RX_STREAMS: usize = 4;
/// Outbound message queue depth
pub const MAX_TX_MESSAGES: usize = 4;
/// Messages parked awaiting route discovery
pub const MAX_TX_ROUTES: usize = 4;

pub const REPLAY_CACHE_ENTRIES: usize = 16;

/// Housekeeping tick, drives reassembly and replay aging
pub const TIMEOUT_TICK_MS: u32 = 100;
/// Replay cache entry lifetime, in ticks
pub const REPLAY_MAX_AGE_TICKS: u8 = 20;
/// Reassembly timeout, in ticks of silence
pub const RX_FRAGMENT_TIMEOUT_TICKS: u8 = 10;

/// Auth header: replay counter + tag
pub const AUTH_HEADER_SIZE: usize = 4 + AUTH_TAG_SIZE;
/// Source route header before the hop list
pub const ROUTE_HEADER_BASE: usize = 4;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ipv4Stats {
    pub fragments_sent: u32,
    pub fragments_received: u32,
    pub packets_received: u32,
    pub tx_failures: u32,
    pub replay_hits: u32,
    pub auth_fails: u32,
    pub ttl_expired: u32,
}

#[derive(Copy, Clone, Debug)]
struct ReplayEntry {
    source: Ipv4Address,
    tag: u8,
    age: u8,
}

impl Default for ReplayEntry {
    fn default() -> Self {
        Self {
            source: Ipv4Address::UNSPECIFIED,
            tag: 0,
            age: REPLAY_MAX_AGE_TICKS,
        }
    }
}

/// One in-flight message, transmit or reassembly side
#[derive(Clone, Debug)]
struct Ipv4Msg {
    flags: FrameFlags,
    age: u8,
    tag: u8,
    source_addr: u16,
    next_hop: u16,
    /// Transmit: bytes sent. Receive: bytes reassembled.
    offset: u16,
    len: u16,
    data: Handle,
}

// body geometry helpers

fn route_hdr_offset(flags: FrameFlags) -> usize {
    if flags.contains(FrameFlags::AUTH) {
        AUTH_HEADER_SIZE
    } else {
        0
    }
}

fn route_hdr_size(hop_count: u8) -> usize {
    ROUTE_HEADER_BASE + 2 * hop_count as usize
}

fn ip_offset(flags: FrameFlags, body: &[u8]) -> usize {
    let mut offset = route_hdr_offset(flags);
    if flags.contains(FrameFlags::SOURCE_ROUTE) {
        let hop_count = body[offset + 2];
        offset += route_hdr_size(hop_count);
    }
    offset
}

fn read_route_hop(body: &[u8], route_off: usize, index: u8) -> u16 {
    LittleEndian::read_u16(&body[route_off + ROUTE_HEADER_BASE + 2 * index as usize..])
}

/// Sign the composite body in place with the local session
pub fn sign_msg(mac: &mut Mac, crypto: &Crypto, flags: FrameFlags, body: &mut [u8]) {
    if !flags.contains(FrameFlags::AUTH) {
        return;
    }

    LittleEndian::write_u32(&mut body[..4], mac.next_replay_counter());

    // the IV stands in for the tag while the MAC is computed, the tag
    // then overwrites it; this keeps the message in one buffer
    let iv = *mac.session_iv();
    body[4..AUTH_HEADER_SIZE].copy_from_slice(&iv[..AUTH_TAG_SIZE]);

    let tag = crypto.xcbc_mac_96(&[body]);
    body[4..AUTH_HEADER_SIZE].copy_from_slice(&tag);
}

/// Verify a received composite body against the sender's session.
/// Updates the stored replay counter on success.
pub fn verify_msg(
    crypto: &Crypto,
    neighbors: &mut Neighbors,
    source_addr: u16,
    flags: FrameFlags,
    body: &mut [u8],
) -> bool {
    if !flags.contains(FrameFlags::AUTH) || body.len() < AUTH_HEADER_SIZE {
        return false;
    }

    let (iv, stored) = match neighbors.get(source_addr) {
        Some(n) => (n.iv, n.replay_counter),
        None => return false,
    };

    let counter = LittleEndian::read_u32(&body[..4]);
    if counter <= stored {
        return false;
    }

    let mut msg_tag = [0u8; AUTH_TAG_SIZE];
    msg_tag.copy_from_slice(&body[4..AUTH_HEADER_SIZE]);

    body[4..AUTH_HEADER_SIZE].copy_from_slice(&iv[..AUTH_TAG_SIZE]);
    let tag = crypto.xcbc_mac_96(&[body]);

    if !tag_eq(&tag, &msg_tag) {
        return false;
    }

    if let Some(n) = neighbors.get_mut(source_addr) {
        n.replay_counter = counter;
    }
    true
}

pub struct Ipv4 {
    tx_q: heapless::Vec<Ipv4Msg, MAX_TX_MESSAGES>,
    rx_list: heapless::Vec<Ipv4Msg, MAX_RX_STREAMS>,
    /// Netmsgs parked while a route discovery runs
    route_q: heapless::Vec<Handle, MAX_TX_ROUTES>,

    replay: [ReplayEntry; REPLAY_CACHE_ENTRIES],

    next_tag: u8,
    /// Payload budget per MAC frame, fragmentation header included
    mac_payload: usize,

    tx_cur: Option<Ipv4Msg>,
    tx_mac: Option<MsgId>,

    stats: Ipv4Stats,
}

impl Ipv4 {
    pub fn new() -> Self {
        // frame budget for the addressing this layer always uses
        let addr = MacAddr::short(0, 0, 0);
        let options = TxOptions {
            ack_request: true,
            secure_frame: false,
            protocol: Protocol::Ipv4,
        };

        Self {
            tx_q: heapless::Vec::new(),
            rx_list: heapless::Vec::new(),
            route_q: heapless::Vec::new(),
            replay: Default::default(),
            next_tag: 0,
            mac_payload: frame::max_payload(&addr, &options),
            tx_cur: None,
            tx_mac: None,
            stats: Ipv4Stats::default(),
        }
    }

    pub fn stats(&self) -> &Ipv4Stats {
        &self.stats
    }

    pub fn busy(&self) -> bool {
        self.tx_q.len() >= MAX_TX_MESSAGES
    }

    /// Record (source ip, tag), reporting whether it was already
    /// cached. Entries age out with the housekeeping tick.
    fn add_to_replay_cache(&mut self, source: Ipv4Address, tag: u8) -> bool {
        let mut oldest = 0;

        for i in 0..REPLAY_CACHE_ENTRIES {
            if self.replay[i].age > self.replay[oldest].age {
                oldest = i;
            }
            if self.replay[i].source == source && self.replay[i].tag == tag {
                self.replay[i].age = 0;
                self.stats.replay_hits += 1;
                return true;
            }
        }

        self.replay[oldest] = ReplayEntry {
            source,
            tag,
            age: 0,
        };
        false
    }

    /// Queue an IPv4 packet (held in a netmsg) for wireless delivery.
    /// Without a route the packet is parked and a discovery started.
    pub fn send_packet(
        &mut self,
        mem: &mut Arena,
        crypto: &Crypto,
        mac: &mut Mac,
        neighbors: &Neighbors,
        routes: &mut Routing,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        msg: Handle,
    ) -> Result<(), StackError<()>> {
        if self.busy() {
            return Err(StackError::QueueFull);
        }

        let mut packet = [0u8; IP_MTU];
        let packet_len = {
            let data = netq.data(mem, msg);
            if data.len() < 20 || data.len() > IP_MTU {
                return Err(StackError::Decode);
            }
            packet[..data.len()].copy_from_slice(data);
            data.len()
        };
        let packet = &packet[..packet_len];

        let dest = Ipv4Address::from_bytes(&packet[16..20]);
        let secure = !netq
            .flags(mem, msg)
            .contains(NetmsgFlags::SECURITY_DISABLE);

        let query = RouteQuery::by_ip(dest);
        let route = match routes.get(&query, neighbors, cfg) {
            Some(r) => r,
            None => {
                // no route for a zero destination either
                if dest.is_unspecified() {
                    return Err(StackError::NoRoute);
                }

                routes.discover(&query).map_err(|_| StackError::NoRoute)?;

                if self.route_q.len() >= MAX_TX_ROUTES {
                    return Err(StackError::QueueFull);
                }

                let parked = netq.create(mem, warnings, packet)?;
                // full cannot happen, checked above
                let _ = self.route_q.push(parked);

                debug!("parked packet for {} awaiting route", dest);
                return Ok(());
            }
        };

        // source + destination are on the hop list, more than two
        // means intermediate routers
        let source_route = route.hop_count > 2;

        let mut flags = FrameFlags::IPV4;
        let mut body_len = packet_len;
        if secure {
            flags |= FrameFlags::AUTH;
            body_len += AUTH_HEADER_SIZE;
        }
        if source_route {
            flags |= FrameFlags::SOURCE_ROUTE;
            body_len += route_hdr_size(route.hop_count);
        }

        let handle = match mem.alloc(body_len) {
            Ok(h) => h,
            Err(e) => {
                warnings.insert(Warnings::MEM_FULL);
                return Err(StackError::Mem(e));
            }
        };

        let next_hop = route.hops[1];

        let _ = mem.with(handle, |body| {
            let mut offset = if secure { AUTH_HEADER_SIZE } else { 0 };

            if source_route {
                LittleEndian::write_u16(&mut body[offset..], neighbors.cost(next_hop) as u16);
                body[offset + 2] = route.hop_count;
                body[offset + 3] = 1;
                for i in 0..route.hop_count as usize {
                    LittleEndian::write_u16(
                        &mut body[offset + ROUTE_HEADER_BASE + 2 * i..],
                        route.hops[i],
                    );
                }
                offset += route_hdr_size(route.hop_count);
            }

            body[offset..offset + packet_len].copy_from_slice(packet);
        });

        if source_route {
            routes.traffic(&route);
        }

        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        if secure {
            let _ = mem.with(handle, |body| sign_msg(mac, crypto, flags, body));
        }

        let entry = Ipv4Msg {
            flags,
            age: 0,
            tag,
            source_addr: cfg.short_addr,
            next_hop,
            offset: 0,
            len: body_len as u16,
            data: handle,
        };

        // full cannot happen, busy() checked above
        let _ = self.tx_q.push(entry);

        Ok(())
    }

    fn release_msg(&mut self, mem: &mut Arena, msg: Ipv4Msg) {
        let _ = mem.free(msg.data);
    }

    /// Transmit task: fragments the head of the queue through the MAC,
    /// one fragment in flight at a time
    pub fn pump_tx(
        &mut self,
        mem: &mut Arena,
        crypto: &Crypto,
        mac: &mut Mac,
        cfg: &StackConfig,
    ) -> Disposition {
        loop {
            // reap a completed fragment first
            if let Some(id) = self.tx_mac {
                if !mac.msg_done(id) {
                    return Disposition::Wait;
                }
                let status = mac.msg_status(id);
                mac.release_msg(mem, id);
                self.tx_mac = None;

                match status {
                    MsgStatus::Ok => {
                        self.stats.fragments_sent += 1;
                        let done = self
                            .tx_cur
                            .as_ref()
                            .map(|m| m.offset >= m.len)
                            .unwrap_or(true);
                        if done {
                            if let Some(msg) = self.tx_cur.take() {
                                self.release_msg(mem, msg);
                            }
                            return Disposition::Yield;
                        }
                    }
                    _ => {
                        self.stats.tx_failures += 1;
                        if let Some(msg) = self.tx_cur.take() {
                            debug!("fragment tx failed, dropping message {}", msg.tag);
                            self.release_msg(mem, msg);
                        }
                        return Disposition::Yield;
                    }
                }
            }

            if self.tx_cur.is_none() {
                if self.tx_q.is_empty() {
                    return Disposition::Wait;
                }
                let msg = self.tx_q.remove(0);

                // our own traffic must not bounce back through the
                // forwarding path
                let source_ip = {
                    let body = match mem.bytes(msg.data) {
                        Ok(b) => b,
                        Err(_) => {
                            self.release_msg(mem, msg);
                            continue;
                        }
                    };
                    let off = ip_offset(msg.flags, body);
                    Ipv4Address::from_bytes(&body[off + 12..off + 16])
                };
                let tag = msg.tag;
                self.add_to_replay_cache(source_ip, tag);

                self.tx_cur = Some(msg);
            }

            if mac.busy() {
                return Disposition::Wait;
            }

            let (buf, frame_len, dest, tag) = {
                let msg = self.tx_cur.as_mut().unwrap();

                let chunk = (self.mac_payload - FRAG_HEADER_SIZE)
                    .min(msg.len as usize - msg.offset as usize);

                let header = FragHeader {
                    flags: msg.flags,
                    tag: msg.tag,
                    size: msg.len,
                    offset: msg.offset,
                };

                let mut buf = [0u8; 127];
                buf[..FRAG_HEADER_SIZE].copy_from_slice(&header.encode());

                match mem.bytes(msg.data) {
                    Ok(body) => {
                        buf[FRAG_HEADER_SIZE..FRAG_HEADER_SIZE + chunk].copy_from_slice(
                            &body[msg.offset as usize..msg.offset as usize + chunk],
                        );
                    }
                    Err(_) => {
                        let bad = self.tx_cur.take().unwrap();
                        self.release_msg(mem, bad);
                        continue;
                    }
                }

                msg.offset += chunk as u16;
                (buf, FRAG_HEADER_SIZE + chunk, msg.next_hop, msg.tag)
            };

            let options = TxOptions {
                ack_request: dest != BROADCAST_SHORT && cfg.ack_request,
                secure_frame: false,
                protocol: Protocol::Ipv4,
            };
            let addr = MacAddr::short(dest, cfg.pan_id, cfg.short_addr);

            match mac.create_tx_msg(mem, crypto, addr, options, &buf[..frame_len], false) {
                Ok(id) => {
                    trace!("fragment {} offset sent", tag);
                    self.tx_mac = Some(id);
                    return Disposition::Yield;
                }
                Err(_) => {
                    // out of queue or memory, retry next pass
                    if let Some(msg) = self.tx_cur.as_mut() {
                        msg.offset -= (frame_len - FRAG_HEADER_SIZE) as u16;
                    }
                    return Disposition::Wait;
                }
            }
        }
    }

    /// Fragment receive path, called from the MAC dispatch for frames
    /// sourced by established neighbors
    pub fn process_fragment(
        &mut self,
        mem: &mut Arena,
        crypto: &Crypto,
        mac: &mut Mac,
        neighbors: &mut Neighbors,
        routes: &mut Routing,
        sockets: &mut Sockets,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        source_addr: u16,
        payload: &[u8],
    ) {
        let header = match FragHeader::decode(payload) {
            Some(h) => h,
            None => return,
        };
        if !header.flags.contains(FrameFlags::IPV4) {
            return;
        }
        let data = &payload[FRAG_HEADER_SIZE..];

        let idx = self
            .rx_list
            .iter()
            .position(|m| m.source_addr == source_addr && m.tag == header.tag);

        let idx = match idx {
            Some(i) => i,
            None => {
                // only an initial fragment opens a stream
                if header.offset != 0 {
                    return;
                }
                if header.size < 20 || header.size as usize > IP_MTU {
                    return;
                }
                if self.rx_list.len() >= MAX_RX_STREAMS {
                    debug!("no reassembly slot for {:04x}", source_addr);
                    return;
                }

                let handle = match mem.alloc(header.size as usize) {
                    Ok(h) => h,
                    Err(_) => {
                        warnings.insert(Warnings::MEM_FULL);
                        return;
                    }
                };

                let _ = self.rx_list.push(Ipv4Msg {
                    flags: header.flags,
                    age: 0,
                    tag: header.tag,
                    source_addr,
                    next_hop: 0,
                    offset: 0,
                    len: header.size,
                    data: handle,
                });
                self.rx_list.len() - 1
            }
        };

        {
            let entry = &self.rx_list[idx];

            if entry.len != header.size || entry.flags != header.flags {
                return;
            }

            // fragments must arrive strictly in order
            if entry.offset != header.offset
                || entry.offset as usize + data.len() > entry.len as usize
            {
                debug!(
                    "fragment order violation from {:04x} tag {}",
                    source_addr, header.tag
                );
                let dead = self.rx_list.remove(idx);
                self.release_msg(mem, dead);
                return;
            }
        }

        let offset = self.rx_list[idx].offset as usize;
        let handle = self.rx_list[idx].data;
        let _ = mem.with(handle, |body| {
            body[offset..offset + data.len()].copy_from_slice(data)
        });
        self.rx_list[idx].offset += data.len() as u16;
        self.rx_list[idx].age = 0;
        self.stats.fragments_received += 1;

        if self.rx_list[idx].offset < self.rx_list[idx].len {
            return;
        }

        // message complete
        let mut msg = self.rx_list.remove(idx);
        self.complete_rx(
            mem, crypto, mac, neighbors, routes, sockets, netq, warnings, cfg, &mut msg,
        );
    }

    fn complete_rx(
        &mut self,
        mem: &mut Arena,
        crypto: &Crypto,
        mac: &mut Mac,
        neighbors: &mut Neighbors,
        routes: &mut Routing,
        sockets: &mut Sockets,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        msg: &mut Ipv4Msg,
    ) {
        let handle = msg.data;

        // lift geometry and addresses out of the body
        let (ip_off, source_ip, dest_ip, broadcast) = {
            let body = match mem.bytes(handle) {
                Ok(b) => b,
                Err(_) => return,
            };
            let ip_off = ip_offset(msg.flags, body);
            if body.len() < ip_off + 20 {
                let _ = mem.free(handle);
                return;
            }
            let source_ip = Ipv4Address::from_bytes(&body[ip_off + 12..ip_off + 16]);
            let dest_ip = Ipv4Address::from_bytes(&body[ip_off + 16..ip_off + 20]);
            (ip_off, source_ip, dest_ip, dest_ip.is_broadcast())
        };

        if self.add_to_replay_cache(source_ip, msg.tag) {
            debug!("replay cache hit from {}", source_ip);
            let _ = mem.free(handle);
            return;
        }

        if msg.flags.contains(FrameFlags::AUTH) {
            let verified = mem
                .with(handle, |body| {
                    verify_msg(crypto, neighbors, msg.source_addr, msg.flags, body)
                })
                .unwrap_or(false);
            if !verified {
                debug!("auth fail from {:04x}", msg.source_addr);
                self.stats.auth_fails += 1;
                let _ = mem.free(handle);
                return;
            }
        }

        // hand the packet to the local stack
        {
            let mut packet = [0u8; IP_MTU];
            let len = {
                let body = match mem.bytes(handle) {
                    Ok(b) => b,
                    Err(_) => return,
                };
                let ip = &body[ip_off..];
                packet[..ip.len()].copy_from_slice(ip);
                ip.len()
            };

            if let Ok(h) = netq.create(mem, warnings, &packet[..len]) {
                if !msg.flags.contains(FrameFlags::AUTH) {
                    netq.set_flags(mem, h, NetmsgFlags::SECURITY_DISABLE);
                }
                self.stats.packets_received += 1;
                netq.push_rx(mem, warnings, h);
            }
        }

        // forwarding decisions
        if !broadcast {
            if !msg.flags.contains(FrameFlags::SOURCE_ROUTE) {
                let _ = mem.free(handle);
                return;
            }

            let (next_index, hop_count) = {
                let body = match mem.bytes(handle) {
                    Ok(b) => b,
                    Err(_) => return,
                };
                let route_off = route_hdr_offset(msg.flags);
                (body[route_off + 3], body[route_off + 2])
            };

            // last hop, nothing to forward
            if next_index + 1 >= hop_count {
                let _ = mem.free(handle);
                return;
            }

            // advance the hop index and accumulate the link cost
            let next_hop = {
                let route_off = route_hdr_offset(msg.flags);
                let next_hop = mem
                    .bytes(handle)
                    .map(|b| read_route_hop(b, route_off, next_index + 1))
                    .unwrap_or(0);

                let cost = neighbors.cost(next_hop) as u16;
                let _ = mem.with(handle, |body| {
                    body[route_off + 3] = next_index + 1;
                    let fwd = LittleEndian::read_u16(&body[route_off..]);
                    LittleEndian::write_u16(&mut body[route_off..], fwd.saturating_add(cost));
                });
                next_hop
            };

            let error = if !cfg.enable_routing {
                Some(route_messages::ERROR_NOT_A_ROUTER)
            } else if !neighbors.is_neighbor(next_hop) {
                Some(route_messages::ERROR_NEXT_HOP_UNAVAILABLE)
            } else {
                None
            };

            if let Some(error) = error {
                debug!("route error {} towards {}", error, dest_ip);

                let (hops, hop_count) = {
                    let body = match mem.bytes(handle) {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    let route_off = route_hdr_offset(msg.flags);
                    let hop_count = body[route_off + 2].min(8);
                    let mut hops = [0u16; 8];
                    for i in 0..hop_count {
                        hops[i as usize] = read_route_hop(body, route_off, i);
                    }
                    (hops, hop_count)
                };

                let _ = routes.send_error(
                    mem,
                    netq,
                    warnings,
                    cfg,
                    sockets,
                    neighbors,
                    dest_ip,
                    source_ip,
                    &hops[..hop_count as usize],
                    next_hop,
                    error,
                );

                let _ = mem.free(handle);
                return;
            }

            msg.next_hop = next_hop;
        } else {
            msg.next_hop = BROADCAST_SHORT;
        }

        // TTL accounting before the packet goes back on the air
        let (ttl, proto) = {
            let body = match mem.bytes(handle) {
                Ok(b) => b,
                Err(_) => return,
            };
            (body[ip_off + 8], body[ip_off + 9])
        };

        if ttl <= 1 {
            self.stats.ttl_expired += 1;

            if proto == 1 {
                // quote the packet with its arrival TTL so the embedded
                // checksum stays valid
                let mut packet = [0u8; IP_MTU];
                let len = {
                    let body = match mem.bytes(handle) {
                        Ok(b) => b,
                        Err(_) => return,
                    };
                    let ip = &body[ip_off..];
                    packet[..ip.len()].copy_from_slice(ip);
                    ip.len()
                };
                netmsg::send_ttl_exceeded(netq, mem, warnings, cfg, &packet[..len]);
            }

            let _ = mem.free(handle);
            return;
        }

        let _ = mem.with(handle, |body| {
            let mut ip = Ipv4Packet::new_unchecked(&mut body[ip_off..]);
            ip.set_hop_limit(ttl - 1);
            ip.fill_checksum();
        });

        debug!(
            "routing {} -> {} next hop {:04x}",
            source_ip, dest_ip, msg.next_hop
        );

        msg.offset = 0;
        let _ = mem.with(handle, |body| {
            sign_msg(mac, crypto, msg.flags, body);
        });

        if self.tx_q.push(msg.clone()).is_err() {
            warn!("forward queue full, dropping");
            let _ = mem.free(handle);
        }
    }

    /// Deferred sends: retry messages parked for route discovery
    pub fn route_task(
        &mut self,
        mem: &mut Arena,
        crypto: &Crypto,
        mac: &mut Mac,
        neighbors: &Neighbors,
        routes: &mut Routing,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
    ) -> Disposition {
        if self.route_q.is_empty() {
            return Disposition::Wait;
        }

        let msg = self.route_q.remove(0);

        let dest = {
            let data = netq.data(mem, msg);
            if data.len() < 20 {
                netq.release(mem, msg);
                return Disposition::Yield;
            }
            Ipv4Address::from_bytes(&data[16..20])
        };
        let query = RouteQuery::by_ip(dest);

        if routes.get(&query, neighbors, cfg).is_some() {
            let _ = self.send_packet(
                mem, crypto, mac, neighbors, routes, netq, warnings, cfg, msg,
            );
            netq.release(mem, msg);
            return Disposition::Yield;
        }

        if routes.in_progress(&query) {
            // still discovering, keep it parked
            let _ = self.route_q.push(msg);
            return Disposition::Wait;
        }

        // discovery gave up
        debug!("discovery failed for {}", dest);
        let mut packet = [0u8; IP_MTU];
        let len = {
            let data = netq.data(mem, msg);
            packet[..data.len()].copy_from_slice(data);
            data.len()
        };
        netmsg::send_dest_unreachable(netq, mem, warnings, cfg, &packet[..len]);
        netq.release(mem, msg);

        Disposition::Yield
    }

    /// Housekeeping tick: reassembly expiry and replay cache aging
    pub fn tick_task(&mut self, mem: &mut Arena) -> Disposition {
        let mut i = 0;
        while i < self.rx_list.len() {
            self.rx_list[i].age = self.rx_list[i].age.saturating_add(1);
            if self.rx_list[i].age > RX_FRAGMENT_TIMEOUT_TICKS {
                warn!(
                    "reassembly timeout for tag {} from {:04x}",
                    self.rx_list[i].tag, self.rx_list[i].source_addr
                );
                let dead = self.rx_list.remove(i);
                let _ = mem.free(dead.data);
            } else {
                i += 1;
            }
        }

        for entry in self.replay.iter_mut() {
            if entry.age < REPLAY_MAX_AGE_TICKS {
                entry.age += 1;
                if entry.age >= REPLAY_MAX_AGE_TICKS {
                    entry.source = Ipv4Address::UNSPECIFIED;
                    entry.tag = 0;
                }
            }
        }

        Disposition::Wait
    }
}
