//! On-demand mesh routing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Route discovery floods RREQs link-local; the destination (or a proxy)
// answers with an RREP walked back along the recorded hop list. RERRs
// walk failed-forwarding reports back the same way, purging stale
// routes as they go.

use log::{debug, info, warn};
use rand_core::RngCore;
use smoltcp::wire::Ipv4Address;

use crate::mem::Arena;
use crate::neighbor::Neighbors;
use crate::netmsg::NetQueues;
use crate::sched::Disposition;
use crate::socket::{SockAddr, SockOptions, SocketHandle, Sockets};
use crate::timer::Timer;
use crate::{StackConfig, Warnings, BROADCAST_SHORT};

pub mod messages;
use messages::{RouteMsg, Rerr, Rrep, Rreq};

pub const SERVER_PORT: u16 = 24002;

pub const MAX_HOPS: usize = 8;

pub const REPLAY_CACHE_ENTRIES: usize = 8;

/// Route lifetime without traffic, in seconds
pub const MAX_ROUTE_AGE_S: u8 = 120;

pub const DISCOVERY_TRIES: u8 = 3;

/// Average cost per hop below which a discovered route is considered
/// good enough to stop discovering
pub const ACCEPTABLE_COST_PER_HOP: u16 = 24;

/// Compile time table bound, runtime limit comes from configuration
pub const ROUTE_TABLE_CAP: usize = 16;
pub const DISCOVERY_CAP: usize = 8;

bitflags::bitflags! {
    pub struct DestFlags: u8 {
        const IS_GATEWAY = 0x01;
        /// Answered on behalf of the destination
        const PROXY      = 0x40;
    }
}

/// A route destination selector; any populated axis may match
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RouteQuery {
    pub ip: Ipv4Address,
    pub short_addr: u16,
    pub flags: DestFlags,
}

impl RouteQuery {
    pub fn by_ip(ip: Ipv4Address) -> Self {
        Self {
            ip,
            short_addr: 0,
            flags: DestFlags::empty(),
        }
    }

    pub fn by_short(short_addr: u16) -> Self {
        Self {
            ip: Ipv4Address::UNSPECIFIED,
            short_addr,
            flags: DestFlags::empty(),
        }
    }

    pub fn by_flags(flags: DestFlags) -> Self {
        Self {
            ip: Ipv4Address::UNSPECIFIED,
            short_addr: 0,
            flags,
        }
    }

    pub fn for_self(cfg: &StackConfig) -> Self {
        Self {
            ip: cfg.ip,
            short_addr: cfg.short_addr,
            flags: if cfg.gateway {
                DestFlags::IS_GATEWAY
            } else {
                DestFlags::empty()
            },
        }
    }
}

/// Match `wanted` against `candidate` on any populated axis
pub fn evaluate(wanted: &RouteQuery, candidate: &RouteQuery) -> bool {
    if !wanted.ip.is_unspecified() && wanted.ip == candidate.ip {
        return true;
    }
    if wanted.short_addr != 0 && wanted.short_addr == candidate.short_addr {
        return true;
    }
    if wanted.flags.contains(DestFlags::IS_GATEWAY)
        && candidate.flags.contains(DestFlags::IS_GATEWAY)
    {
        return true;
    }
    false
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Route {
    pub dest_ip: Ipv4Address,
    pub dest_short: u16,
    pub dest_flags: DestFlags,
    pub cost: u16,
    pub age: u8,
    pub hop_count: u8,
    pub hops: [u16; MAX_HOPS],
}

impl Route {
    fn query(&self) -> RouteQuery {
        RouteQuery {
            ip: self.dest_ip,
            short_addr: self.dest_short,
            flags: self.dest_flags,
        }
    }

    /// Two-hop synthetic route (self plus one destination)
    fn direct(dest_ip: Ipv4Address, dest_short: u16, cost: u16, own_short: u16) -> Self {
        let mut hops = [0u16; MAX_HOPS];
        hops[0] = own_short;
        hops[1] = dest_short;
        Self {
            dest_ip,
            dest_short,
            dest_flags: DestFlags::empty(),
            cost,
            age: 0,
            hop_count: 2,
            hops,
        }
    }
}

fn same_dest(a: &Route, b: &Route) -> bool {
    if !a.dest_ip.is_unspecified() && a.dest_ip == b.dest_ip {
        return true;
    }
    if a.dest_short != 0
        && !a.dest_flags.contains(DestFlags::PROXY)
        && a.dest_short == b.dest_short
    {
        return true;
    }
    false
}

#[derive(Copy, Clone, Debug)]
struct Discovery {
    query: RouteQuery,
    tries: u8,
}

pub struct Routing {
    table: heapless::Vec<Route, ROUTE_TABLE_CAP>,
    disc: heapless::Vec<Discovery, DISCOVERY_CAP>,

    replay: [(u16, u16); REPLAY_CACHE_ENTRIES],
    replay_ptr: u8,

    sock: Option<SocketHandle>,

    max_routes: usize,
    max_discoveries: usize,

    /// Hook for gateway proxy answering, checked on every RREQ
    pub proxy: Option<fn(&RouteQuery) -> bool>,
}

impl Routing {
    pub fn new(cfg: &StackConfig) -> Self {
        Self {
            table: heapless::Vec::new(),
            disc: heapless::Vec::new(),
            replay: [(0, 0); REPLAY_CACHE_ENTRIES],
            replay_ptr: 0,
            sock: None,
            max_routes: (cfg.max_routes.max(2) as usize).min(ROUTE_TABLE_CAP),
            max_discoveries: (cfg.max_discoveries.max(2) as usize).min(DISCOVERY_CAP),
            proxy: None,
        }
    }

    /// Bind the control socket, link-local TTL
    pub fn init(&mut self, sockets: &mut Sockets) -> Result<(), ()> {
        let sock = sockets.create().map_err(|_| ())?;
        sockets.set_options(sock, SockOptions::TTL_1);
        sockets.bind(sock, SERVER_PORT).map_err(|_| ())?;
        self.sock = Some(sock);
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.table.len()
    }

    pub fn discovery_count(&self) -> usize {
        self.disc.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.table.iter()
    }

    fn add_to_replay(&mut self, source: u16, tag: u16) -> bool {
        if self.replay.iter().any(|e| *e == (source, tag)) {
            return true;
        }
        self.replay[self.replay_ptr as usize] = (source, tag);
        self.replay_ptr += 1;
        if self.replay_ptr as usize >= REPLAY_CACHE_ENTRIES {
            self.replay_ptr = 0;
        }
        false
    }

    /// Resolve a query from local knowledge only: loopback, broadcast,
    /// the route table and direct neighbors. No discovery is started.
    pub fn get(
        &self,
        query: &RouteQuery,
        neighbors: &Neighbors,
        cfg: &StackConfig,
    ) -> Option<Route> {
        let self_query = RouteQuery::for_self(cfg);
        if evaluate(query, &self_query) {
            let mut r = Route::direct(cfg.ip, cfg.short_addr, 0, cfg.short_addr);
            r.dest_flags = self_query.flags;
            return Some(r);
        }

        if query.ip.is_broadcast() {
            return Some(Route::direct(query.ip, BROADCAST_SHORT, 0, cfg.short_addr));
        }

        let mut best: Option<Route> = None;

        for route in self.table.iter() {
            if evaluate(query, &route.query()) {
                match &best {
                    Some(b) if b.cost <= route.cost => (),
                    _ => best = Some(*route),
                }
            }
        }

        // a direct neighbor may undercut the table
        let short = if query.short_addr != 0 && neighbors.is_neighbor(query.short_addr) {
            query.short_addr
        } else if !query.ip.is_unspecified() {
            neighbors.short_of_ip(query.ip)
        } else if query.flags.contains(DestFlags::IS_GATEWAY) {
            neighbors.gateway()
        } else {
            0
        };

        if short != 0 {
            let cost = neighbors.cost(short) as u16;
            if best.as_ref().map(|b| cost < b.cost).unwrap_or(true) {
                best = Some(Route::direct(
                    neighbors.ip_of(short),
                    short,
                    cost,
                    cfg.short_addr,
                ));
            }
        }

        best
    }

    pub fn ip_of(&self, short_addr: u16, neighbors: &Neighbors, cfg: &StackConfig) -> Ipv4Address {
        self.get(&RouteQuery::by_short(short_addr), neighbors, cfg)
            .map(|r| r.dest_ip)
            .unwrap_or(Ipv4Address::UNSPECIFIED)
    }

    /// Reset the age of the route carrying this traffic
    pub fn traffic(&mut self, route: &Route) {
        for r in self.table.iter_mut() {
            if same_dest(route, r) {
                r.age = 0;
                return;
            }
        }
    }

    pub fn has_loop(route: &Route) -> bool {
        let n = (route.hop_count as usize).min(MAX_HOPS);
        for i in 0..n.saturating_sub(1) {
            for j in (i + 1)..n {
                if route.hops[i] == route.hops[j] {
                    return true;
                }
            }
        }
        false
    }

    fn check(route: &Route, neighbors: &Neighbors) -> bool {
        if Self::has_loop(route) {
            debug!("route to {:04x} has a loop", route.dest_short);
            return false;
        }
        if !neighbors.is_neighbor(route.hops[1]) {
            debug!(
                "route to {:04x} missing next hop {:04x}",
                route.dest_short, route.hops[1]
            );
            return false;
        }
        true
    }

    /// Install a route. An existing route to the same destination is
    /// replaced only when the new cost is equal or better.
    pub fn add(&mut self, mut route: Route, neighbors: &Neighbors) -> Result<(), ()> {
        if !Self::check(&route, neighbors) {
            return Err(());
        }

        for existing in self.table.iter_mut() {
            if same_dest(&route, existing) {
                if route.cost <= existing.cost {
                    route.age = 0;
                    *existing = route;
                }
                return Ok(());
            }
        }

        if self.table.len() >= self.max_routes {
            warn!("route list full");
            return Err(());
        }

        route.age = 0;
        self.table.push(route).map_err(|_| ())
    }

    /// Remove the first route matching the query
    pub fn delete(&mut self, query: &RouteQuery) -> bool {
        for i in 0..self.table.len() {
            if evaluate(query, &self.table[i].query()) {
                self.table.remove(i);
                return true;
            }
        }
        false
    }

    // discovery management

    pub fn in_progress(&self, query: &RouteQuery) -> bool {
        self.disc.iter().any(|d| evaluate(&d.query, query))
    }

    pub fn cancel(&mut self, query: &RouteQuery) {
        if let Some(i) = self.disc.iter().position(|d| evaluate(&d.query, query)) {
            self.disc.remove(i);
        }
    }

    /// Queue a discovery for later transmission by the discovery task
    pub fn discover(&mut self, query: &RouteQuery) -> Result<(), ()> {
        if self.in_progress(query) {
            return Ok(());
        }
        if self.disc.len() >= self.max_discoveries {
            warn!("discovery queue full");
            return Err(());
        }

        debug!(
            "route discovery for {:04x} @ {}",
            query.short_addr, query.ip
        );

        self.disc
            .push(Discovery {
                query: *query,
                tries: DISCOVERY_TRIES,
            })
            .map_err(|_| ())
    }

    fn send_request<G: RngCore>(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        rng: &mut G,
        query: &RouteQuery,
    ) -> Result<(), ()> {
        let sock = self.sock.ok_or(())?;

        let mut hops = [0u16; MAX_HOPS];
        hops[0] = cfg.short_addr;

        let rreq = Rreq {
            flags: 0,
            tag: rng.next_u32() as u16,
            query: *query,
            forward_cost: 0,
            reverse_cost: 0,
            hop_count: 1,
            hops,
        };

        let mut buf = [0u8; Rreq::LEN];
        rreq.encode(&mut buf);

        let raddr = SockAddr {
            ip: Ipv4Address::BROADCAST,
            port: SERVER_PORT,
        };
        sockets
            .sendto(mem, netq, warnings, cfg, sock, &buf, &raddr)
            .map_err(|_| ())
    }

    /// Report a forwarding failure back towards the packet originator
    pub fn send_error(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
        dest_ip: Ipv4Address,
        origin_ip: Ipv4Address,
        hops: &[u16],
        unreachable_hop: u16,
        error: u8,
    ) -> Result<(), ()> {
        let sock = self.sock.ok_or(())?;
        if hops.len() > MAX_HOPS {
            return Err(());
        }

        let mut rerr = Rerr {
            flags: 0,
            error,
            dest_ip,
            origin_ip,
            error_ip: cfg.ip,
            unreachable_hop,
            hop_count: hops.len() as u8,
            hop_index: 0,
            hops: [0u16; MAX_HOPS],
        };
        rerr.hops[..hops.len()].copy_from_slice(hops);

        // walk backwards from our own position
        for (i, hop) in hops.iter().enumerate() {
            if *hop == cfg.short_addr && i > 0 {
                rerr.hop_index = (i - 1) as u8;
                break;
            }
        }

        let next_hop = rerr.hops[rerr.hop_index as usize];
        let raddr = SockAddr {
            ip: neighbors.ip_of(next_hop),
            port: SERVER_PORT,
        };
        if raddr.ip.is_unspecified() {
            return Err(());
        }

        debug!(
            "route error {} for {} via {:04x}",
            error, dest_ip, next_hop
        );

        let mut buf = [0u8; Rerr::LEN];
        rerr.encode(&mut buf);

        sockets
            .sendto(mem, netq, warnings, cfg, sock, &buf, &raddr)
            .map_err(|_| ())
    }

    fn process_rreq(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
        mut rreq: Rreq,
    ) {
        let self_query = RouteQuery::for_self(cfg);
        let proxy_hit = self.proxy.map(|f| f(&rreq.query)).unwrap_or(false);
        let destination = evaluate(&rreq.query, &self_query) || proxy_hit;

        if !destination && !cfg.enable_routing {
            return;
        }

        if self.add_to_replay(rreq.hops[0], rreq.tag) {
            return;
        }

        let hop_count = rreq.hop_count as usize;
        if hop_count == 0 || hop_count >= MAX_HOPS {
            return;
        }
        if rreq.hops[..hop_count].contains(&cfg.short_addr) {
            return;
        }

        let last_hop = rreq.hops[hop_count - 1];
        rreq.reverse_cost = rreq
            .reverse_cost
            .saturating_add(neighbors.cost(last_hop) as u16);
        rreq.hop_count += 1;
        rreq.hops[hop_count] = cfg.short_addr;

        let sock = match self.sock {
            Some(s) => s,
            None => return,
        };

        if destination {
            // answer with a reply routed back along the request's hops
            let query = if proxy_hit {
                let mut q = rreq.query;
                q.flags = DestFlags::PROXY;
                q.short_addr = 0xfffe;
                q
            } else {
                self_query
            };

            let rrep = Rrep {
                flags: 0,
                tag: rreq.tag,
                query,
                forward_cost: 0,
                reverse_cost: rreq.reverse_cost,
                hop_count: rreq.hop_count,
                hop_index: rreq.hop_count - 2,
                hops: rreq.hops,
            };

            let raddr = SockAddr {
                ip: neighbors.ip_of(rrep.hops[rrep.hop_index as usize]),
                port: SERVER_PORT,
            };

            debug!(
                "request from {:04x} for {:04x} @ {}, {} hops",
                rreq.hops[0], rreq.query.short_addr, rreq.query.ip, rreq.hop_count
            );

            let mut buf = [0u8; Rrep::LEN];
            rrep.encode(&mut buf);
            let _ = sockets.sendto(mem, netq, warnings, cfg, sock, &buf, &raddr);
        } else {
            // flood onwards
            let raddr = SockAddr {
                ip: Ipv4Address::BROADCAST,
                port: SERVER_PORT,
            };
            let mut buf = [0u8; Rreq::LEN];
            rreq.encode(&mut buf);
            let _ = sockets.sendto(mem, netq, warnings, cfg, sock, &buf, &raddr);
        }
    }

    fn process_rrep(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
        mut rrep: Rrep,
    ) {
        let origin = rrep.hops[0] == cfg.short_addr;

        if !origin && !cfg.enable_routing {
            return;
        }

        let hop_index = rrep.hop_index as usize;
        if hop_index >= MAX_HOPS || rrep.hops[hop_index] != cfg.short_addr {
            return;
        }
        if hop_index + 1 >= rrep.hop_count.min(MAX_HOPS as u8) as usize {
            return;
        }

        let last_hop = rrep.hops[hop_index + 1];
        rrep.forward_cost = rrep
            .forward_cost
            .saturating_add(neighbors.cost(last_hop) as u16);

        if origin {
            if rrep.hop_count < 2 {
                return;
            }
            // direct neighbors need no table entry
            if neighbors.is_neighbor(rrep.query.short_addr) {
                return;
            }

            let mut route = Route {
                dest_ip: rrep.query.ip,
                dest_short: rrep.query.short_addr,
                dest_flags: rrep.query.flags,
                cost: rrep.forward_cost,
                age: 0,
                hop_count: rrep.hop_count,
                hops: [0u16; MAX_HOPS],
            };
            route.hops = rrep.hops;

            let _ = self.add(route, neighbors);

            info!(
                "route reply for {} cost {} hops {}",
                rrep.query.ip, route.cost, route.hop_count
            );

            let cost_per_hop = route.cost / route.hop_count.max(1) as u16;
            if cost_per_hop < ACCEPTABLE_COST_PER_HOP {
                self.cancel(&rrep.query);
            } else {
                info!(
                    "marginal route to {:04x}: cost {} over {} hops",
                    route.dest_short, route.cost, route.hop_count
                );
            }
            return;
        }

        // walk the reply towards the originator
        if hop_index == 0 {
            return;
        }
        rrep.hop_index -= 1;

        let sock = match self.sock {
            Some(s) => s,
            None => return,
        };

        let mut next_ip = neighbors.ip_of(rrep.hops[rrep.hop_index as usize]);
        if next_ip.is_unspecified() {
            next_ip = Ipv4Address::BROADCAST;
        }
        let raddr = SockAddr {
            ip: next_ip,
            port: SERVER_PORT,
        };

        let mut buf = [0u8; Rrep::LEN];
        rrep.encode(&mut buf);
        let _ = sockets.sendto(mem, netq, warnings, cfg, sock, &buf, &raddr);
    }

    fn process_rerr(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
        mut rerr: Rerr,
    ) {
        if rerr.hop_count as usize > MAX_HOPS {
            return;
        }

        // every node on the path drops its route to the failed
        // destination
        let query = RouteQuery::by_ip(rerr.dest_ip);
        if self.delete(&query) {
            info!(
                "route error {}: purged route to {}",
                rerr.error, rerr.dest_ip
            );
        }

        if rerr.hop_index == 0 {
            return;
        }

        rerr.hop_index -= 1;
        let next_hop = rerr.hops[rerr.hop_index as usize];

        let raddr = SockAddr {
            ip: neighbors.ip_of(next_hop),
            port: SERVER_PORT,
        };
        if raddr.ip.is_unspecified() {
            debug!("no next hop {:04x} for route error", next_hop);
            return;
        }

        let sock = match self.sock {
            Some(s) => s,
            None => return,
        };

        let mut buf = [0u8; Rerr::LEN];
        rerr.encode(&mut buf);
        let _ = sockets.sendto(mem, netq, warnings, cfg, sock, &buf, &raddr);
    }

    /// Control message dispatch
    pub fn handle_msg(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
        data: &[u8],
    ) {
        match messages::decode(data) {
            Ok(RouteMsg::Rreq(m)) => {
                self.process_rreq(mem, netq, warnings, cfg, sockets, neighbors, m)
            }
            Ok(RouteMsg::Rrep(m)) => {
                self.process_rrep(mem, netq, warnings, cfg, sockets, neighbors, m)
            }
            Ok(RouteMsg::Rerr(m)) => {
                self.process_rerr(mem, netq, warnings, cfg, sockets, neighbors, m)
            }
            Err(_) => (),
        }
    }

    /// Drain the control socket
    pub fn server_task(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        neighbors: &Neighbors,
    ) -> Disposition {
        let sock = match self.sock {
            Some(s) => s,
            None => return Disposition::Wait,
        };

        while let Some((_raddr, h)) = sockets.recvfrom(sock) {
            let mut buf = [0u8; 64];
            let len = match mem.bytes(h) {
                Ok(b) if b.len() <= buf.len() => {
                    buf[..b.len()].copy_from_slice(b);
                    b.len()
                }
                _ => 0,
            };
            let _ = mem.free(h);

            if len > 0 {
                self.handle_msg(mem, netq, warnings, cfg, sockets, neighbors, &buf[..len]);
            }
        }

        Disposition::Wait
    }

    /// Re-broadcast outstanding discoveries with randomised spacing;
    /// exhausted entries are dropped, releasing any deferred senders
    pub fn discovery_task<T: Timer, G: RngCore>(
        &mut self,
        mem: &mut Arena,
        netq: &mut NetQueues,
        warnings: &mut Warnings,
        cfg: &StackConfig,
        sockets: &mut Sockets,
        rng: &mut G,
        timer: &T,
    ) -> Disposition {
        if self.disc.is_empty() {
            return Disposition::Wait;
        }

        let mut i = 0;
        while i < self.disc.len() {
            if self.disc[i].tries > 0 {
                let query = self.disc[i].query;
                if self
                    .send_request(mem, netq, warnings, cfg, sockets, rng, &query)
                    .is_ok()
                {
                    self.disc[i].tries -= 1;
                }
            }

            if self.disc[i].tries == 0 {
                debug!(
                    "no route found for {:04x} @ {}",
                    self.disc[i].query.short_addr, self.disc[i].query.ip
                );
                self.disc.remove(i);
            } else {
                i += 1;
            }
        }

        let now = timer.ticks_ms();
        let spacing = 128 + (rng.next_u32() % 512);
        Disposition::TimedWait(now.wrapping_add(spacing))
    }

    /// One second route aging and liveness sweep
    pub fn age_task<T: Timer>(&mut self, neighbors: &Neighbors, timer: &T) -> Disposition {
        let mut i = 0;
        while i < self.table.len() {
            self.table[i].age = self.table[i].age.saturating_add(1);

            if self.table[i].age >= MAX_ROUTE_AGE_S {
                info!("purging route to {:04x}", self.table[i].dest_short);
                self.table.remove(i);
                continue;
            }
            if !Self::check(&self.table[i], neighbors) {
                self.table.remove(i);
                continue;
            }
            i += 1;
        }

        Disposition::TimedWait(timer.ticks_ms().wrapping_add(1000))
    }
}
