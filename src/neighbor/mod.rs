//! Beacon driven neighbor discovery and authenticated pairing
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// Every node is either the mesh root (gateway) or holds exactly one
// upstream neighbor. Without an upstream the node cycles channels
// broadcasting beacons; once parked it beacons with exponential
// interval backoff, reset on any topology change.
//
// Pairing is a four way exchange: Beacon(JOIN) -> Flash(challenge) ->
// Thunder(challenge+1), each side handing over its session IV.

use log::{debug, info, warn};
use rand_core::RngCore;
use smoltcp::wire::Ipv4Address;

use crate::crypto::{tag_eq, Crypto, AUTH_TAG_SIZE};
use crate::mac::{Mac, MacAddr, Protocol, RxOptions, TxOptions};
use crate::mem::Arena;
use crate::radio::{Radio, HIGHEST_CHANNEL, LOWEST_CHANNEL};
use crate::sched::Disposition;
use crate::timer::Timer;
use crate::{time_elapsed, time_reached, StackConfig, Ts, BROADCAST_SHORT};

pub mod messages;
use messages::{Beacon, Evict, Flash, NeighborMsg, Thunder};

/// Dwell per channel while scanning, in milliseconds
pub const CHANNEL_SCAN_BEACON_WAIT_MS: Ts = 50;
/// Countdown before falling back to channel scan, in seconds
pub const CHANNEL_RESET_WAIT_S: u8 = 20;

/// Beacon interval bounds, in seconds
pub const BEACON_INTERVAL_MIN: u8 = 1;
pub const BEACON_INTERVAL_MAX: u8 = 32;

/// Ages (seconds of silence) that trigger eviction
pub const MAX_AGE_NEW: u8 = 30;
pub const MAX_AGE: u8 = 90;

/// Maximum upstream tree depth
pub const MAX_DEPTH: u8 = 8;

/// Link cost that triggers eviction
pub const DROP_ETX: u8 = 96;

/// Provisional join timeout in milliseconds
pub const PROV_TIMEOUT_MS: Ts = 1000;

/// Compile time table bounds, runtime limits come from configuration
pub const NEIGHBOR_TABLE_CAP: usize = 16;
pub const PROV_TABLE_CAP: usize = 8;

bitflags::bitflags! {
    pub struct NeighborFlags: u16 {
        const ROUTER     = 0x0001;
        const GATEWAY    = 0x0002;
        const DOWNSTREAM = 0x0004;
        const UPSTREAM   = 0x0008;
        const FULL       = 0x0010;
        const NO_JOIN    = 0x0020;
        const TIME_SYNC  = 0x0040;
        const JOIN       = 0x0080;
        const NEW        = 0x0100;
    }
}

/// Flags copied into a record from the peer's latest beacon
const BEACON_FLAGS: NeighborFlags = NeighborFlags::from_bits_truncate(
    NeighborFlags::ROUTER.bits()
        | NeighborFlags::GATEWAY.bits()
        | NeighborFlags::TIME_SYNC.bits()
        | NeighborFlags::FULL.bits()
        | NeighborFlags::NO_JOIN.bits(),
);

/// x/128 exponential smoothing
pub fn ewma_filter(filter: u8, current: u8, avg: u8) -> u8 {
    (((filter as u16 * current as u16) / 128) + (((128 - filter as u16) * avg as u16) / 128)) as u8
}

/// An established peer session
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbor {
    pub flags: NeighborFlags,
    pub ip: Ipv4Address,
    pub short_addr: u16,
    pub iv: [u8; 16],
    pub replay_counter: u32,
    pub lqi: u8,
    pub rssi: u8,
    /// Packet reception ratio, 128 = perfect
    pub prr: u8,
    pub etx: u8,
    /// Smoothed transmit latency in milliseconds
    pub delay: u8,
    pub traffic_accumulator: u8,
    pub traffic_avg: u8,
    /// Seconds since last heard
    pub age: u8,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum ProvState {
    WaitFlash,
    WaitThunder,
}

/// Transient state for an in-flight four way join
#[derive(Clone, Debug)]
struct Provisional {
    state: ProvState,
    short_addr: u16,
    flags: NeighborFlags,
    ip: Ipv4Address,
    upstream: u16,
    depth: u8,
    challenge: u64,
    started: Ts,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Mode {
    ChannelScan,
    Parked,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum BeaconPhase {
    StartupDelay,
    Top,
    ScanWait,
    ParkedWait,
}

pub struct Neighbors {
    list: heapless::Vec<Neighbor, NEIGHBOR_TABLE_CAP>,
    prov: heapless::Vec<Provisional, PROV_TABLE_CAP>,

    mode: Mode,
    upstream: u16,
    depth: u8,
    channel_reset_countdown: u8,

    beacon_interval: u8,
    beacon_flags: NeighborFlags,
    beacon_phase: BeaconPhase,
    beacon_deadline: Ts,
    beacon_kick: bool,

    monitor_ticks: u8,

    max_neighbors: usize,
    max_prov: usize,
}

impl Neighbors {
    pub fn new(cfg: &StackConfig) -> Self {
        let max_neighbors = (cfg.max_neighbors.max(1)) as usize;
        // bounded by the neighbor limit so queued joins always have a
        // slot to land in
        let max_prov = (cfg.max_provisional.max(1) as usize).min(max_neighbors);

        let mut s = Self {
            list: heapless::Vec::new(),
            prov: heapless::Vec::new(),
            mode: Mode::ChannelScan,
            upstream: 0,
            depth: 0,
            channel_reset_countdown: 0,
            beacon_interval: BEACON_INTERVAL_MIN,
            beacon_flags: NeighborFlags::empty(),
            beacon_phase: BeaconPhase::StartupDelay,
            beacon_deadline: 0,
            beacon_kick: false,
            monitor_ticks: 0,
            max_neighbors: max_neighbors.min(NEIGHBOR_TABLE_CAP),
            max_prov: max_prov.min(PROV_TABLE_CAP),
        };

        // the root is its own upstream
        if cfg.gateway {
            s.upstream = cfg.short_addr;
            s.depth = 0;
            s.mode = Mode::Parked;
        }

        s
    }

    /// Randomised start-up delay before the first beacon
    pub fn seed_beacon_delay(&mut self, delay_ms: Ts) {
        self.beacon_deadline = delay_ms;
    }

    // table queries

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_full(&self) -> bool {
        self.list.len() >= self.max_neighbors
    }

    fn index_of(&self, short_addr: u16) -> Option<usize> {
        self.list.iter().position(|n| n.short_addr == short_addr)
    }

    pub fn get(&self, short_addr: u16) -> Option<&Neighbor> {
        self.index_of(short_addr).map(|i| &self.list[i])
    }

    pub fn get_mut(&mut self, short_addr: u16) -> Option<&mut Neighbor> {
        let i = self.index_of(short_addr)?;
        Some(&mut self.list[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.list.iter()
    }

    pub fn is_neighbor(&self, short_addr: u16) -> bool {
        self.index_of(short_addr).is_some()
    }

    pub fn ip_of(&self, short_addr: u16) -> Ipv4Address {
        self.get(short_addr)
            .map(|n| n.ip)
            .unwrap_or(Ipv4Address::UNSPECIFIED)
    }

    pub fn short_of_ip(&self, ip: Ipv4Address) -> u16 {
        self.list
            .iter()
            .find(|n| n.ip == ip)
            .map(|n| n.short_addr)
            .unwrap_or(0)
    }

    pub fn gateway(&self) -> u16 {
        self.list
            .iter()
            .find(|n| n.flags.contains(NeighborFlags::GATEWAY))
            .map(|n| n.short_addr)
            .unwrap_or(0)
    }

    pub fn upstream(&self) -> u16 {
        self.upstream
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn beacon_interval(&self) -> u8 {
        self.beacon_interval
    }

    pub fn flags_of(&self, short_addr: u16) -> NeighborFlags {
        self.get(short_addr)
            .map(|n| n.flags)
            .unwrap_or(NeighborFlags::empty())
    }

    pub fn etx(&self, short_addr: u16) -> u8 {
        self.get(short_addr).map(|n| n.etx).unwrap_or(255)
    }

    /// Link cost towards a neighbor. Cost is ETX today, kept separate
    /// so the metric can change without touching other modules.
    pub fn cost(&self, short_addr: u16) -> u8 {
        match self.etx(short_addr) {
            0 => 32,
            v => v,
        }
    }

    // link statistics

    /// Fold receive quality metrics from any accepted frame
    pub fn received_from(&mut self, short_addr: u16, options: &RxOptions, cfg: &StackConfig) {
        let filter = cfg.rssi_filter;
        if let Some(n) = self.get_mut(short_addr) {
            n.lqi = if n.lqi != 0 {
                ewma_filter(filter, options.lqi, n.lqi)
            } else {
                options.lqi
            };
            n.rssi = if n.rssi != 0 {
                ewma_filter(filter, options.ed, n.rssi)
            } else {
                options.ed
            };
        }
    }

    /// Count desired traffic towards a peer, independent of retries
    pub fn sent_to(&mut self, short_addr: u16) {
        if let Some(n) = self.get_mut(short_addr) {
            n.traffic_accumulator = n.traffic_accumulator.saturating_add(1);
        }
    }

    fn etx_estimator(n: &mut Neighbor, filter: u8, acked: bool) {
        let ack_value = if acked { 128 } else { 0 };
        n.prr = ewma_filter(filter, ack_value, n.prr);
        n.etx = if n.prr > 8 {
            (2048 / n.prr as u16) as u8
        } else {
            255
        };
    }

    pub fn tx_ack(&mut self, short_addr: u16, cfg: &StackConfig) {
        let filter = cfg.etx_filter;
        if let Some(n) = self.get_mut(short_addr) {
            Self::etx_estimator(n, filter, true);
        }
    }

    pub fn tx_failure(&mut self, short_addr: u16, cfg: &StackConfig) {
        let filter = cfg.etx_filter;
        if let Some(n) = self.get_mut(short_addr) {
            Self::etx_estimator(n, filter, false);
        }
    }

    pub fn delay(&mut self, short_addr: u16, delay_ms: u16) {
        if let Some(n) = self.get_mut(short_addr) {
            n.delay = ewma_filter(32, delay_ms.min(255) as u8, n.delay);
        }
    }

    // membership management

    fn add_neighbor(&mut self, short_addr: u16) -> Option<&mut Neighbor> {
        if self.is_full() || self.is_neighbor(short_addr) {
            return None;
        }

        let n = Neighbor {
            flags: NeighborFlags::empty(),
            ip: Ipv4Address::UNSPECIFIED,
            short_addr,
            iv: [0u8; 16],
            replay_counter: 0,
            lqi: 0,
            rssi: 0,
            prr: 0,
            etx: 0,
            delay: 0,
            traffic_accumulator: 0,
            traffic_avg: 0,
            age: 0,
        };

        if self.list.push(n).is_err() {
            return None;
        }
        let last = self.list.len() - 1;
        Some(&mut self.list[last])
    }

    fn remove_neighbor(&mut self, short_addr: u16) {
        if short_addr == self.upstream {
            self.reset_upstream();
        }
        if let Some(i) = self.index_of(short_addr) {
            self.list.remove(i);
        }
    }

    /// Pick a peer eligible for eviction: not upstream, not a
    /// downstream child, and past the protected NEW phase
    pub fn drop_candidate(&self) -> Option<u16> {
        self.list
            .iter()
            .find(|n| {
                n.short_addr != self.upstream
                    && !n.flags.contains(NeighborFlags::DOWNSTREAM)
                    && !n.flags.contains(NeighborFlags::NEW)
            })
            .map(|n| n.short_addr)
    }

    fn reset_upstream(&mut self) {
        let upstream = self.upstream;
        if let Some(n) = self.get_mut(upstream) {
            n.flags.remove(NeighborFlags::UPSTREAM);
            debug!("lost upstream {:04x}", upstream);
            self.reset_beacon_interval();
            self.channel_reset_countdown = CHANNEL_RESET_WAIT_S;
        }
        self.upstream = 0;
        self.depth = 0;
    }

    pub fn reset_beacon_interval(&mut self) {
        self.beacon_interval = BEACON_INTERVAL_MIN;
        self.beacon_kick = true;
    }

    /// Send an eviction notice and drop the session
    pub fn evict(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        short_addr: u16,
    ) {
        let _ = self.send_evict(mac, mem, crypto, cfg, short_addr);
        self.remove_neighbor(short_addr);
        self.reset_beacon_interval();
    }

    /// Drop every session, broadcasting the eviction notice
    pub fn flush(&mut self, mac: &mut Mac, mem: &mut Arena, crypto: &Crypto, cfg: &StackConfig) {
        for _ in 0..3 {
            let _ = self.send_evict(mac, mem, crypto, cfg, BROADCAST_SHORT);
        }
        self.prov.clear();
        self.list.clear();
    }

    // provisional bookkeeping

    pub fn prov_count(&self) -> usize {
        self.prov.len()
    }

    fn prov_index(&self, short_addr: u16) -> Option<usize> {
        self.prov.iter().position(|p| p.short_addr == short_addr)
    }

    fn add_prov(&mut self, short_addr: u16, now: Ts) -> Option<&mut Provisional> {
        if self.prov.len() >= self.max_prov {
            info!("prov list full");
            return None;
        }
        if self.prov_index(short_addr).is_some() {
            info!("prov {:04x} already on list", short_addr);
            return None;
        }

        let p = Provisional {
            state: ProvState::WaitFlash,
            short_addr,
            flags: NeighborFlags::empty(),
            ip: Ipv4Address::UNSPECIFIED,
            upstream: 0,
            depth: 0,
            challenge: 0,
            started: now,
        };
        if self.prov.push(p).is_err() {
            return None;
        }
        let last = self.prov.len() - 1;
        Some(&mut self.prov[last])
    }

    fn remove_prov(&mut self, short_addr: u16) {
        if let Some(i) = self.prov_index(short_addr) {
            self.prov.remove(i);
        }
    }

    // message transmit

    /// Flags advertised in our beacons
    pub fn my_flags(&self, cfg: &StackConfig, time_synced: bool) -> NeighborFlags {
        let mut flags = NeighborFlags::empty();

        if cfg.enable_routing {
            flags |= NeighborFlags::ROUTER;
        }
        if cfg.gateway {
            flags |= NeighborFlags::GATEWAY;
        }
        if self.is_full() {
            flags |= NeighborFlags::FULL;
            if self.drop_candidate().is_none() {
                flags |= NeighborFlags::NO_JOIN;
            }
        }
        if time_synced {
            flags |= NeighborFlags::TIME_SYNC;
        }

        flags
    }

    fn neighbor_tx_options(ack: bool) -> TxOptions {
        TxOptions {
            ack_request: ack,
            secure_frame: false,
            protocol: Protocol::Neighbor,
        }
    }

    pub fn send_beacon(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        time_synced: bool,
        dest_addr: u16,
        join: bool,
    ) -> Result<(), ()> {
        self.beacon_flags = self.my_flags(cfg, time_synced);

        let mut flags = self.beacon_flags;
        if join {
            flags |= NeighborFlags::JOIN;
            // no-join is incompatible with a join request
            flags.remove(NeighborFlags::NO_JOIN);
        }

        let mut beacon = Beacon {
            flags,
            ip: cfg.ip,
            upstream: self.upstream,
            depth: self.depth,
            counter: mac.next_replay_counter(),
            auth_tag: [0u8; AUTH_TAG_SIZE],
        };

        let mut buf = [0u8; Beacon::LEN];
        beacon.encode(&mut buf);
        beacon.auth_tag = mac.sign_session(crypto, &buf[..Beacon::SIGNED_LEN]);
        beacon.encode(&mut buf);

        let addr = MacAddr::short(dest_addr, cfg.pan_id, cfg.short_addr);
        let options = Self::neighbor_tx_options(dest_addr != BROADCAST_SHORT);

        mac.transmit_frame(mem, crypto, addr, options, &buf)
            .map_err(|_| {
                info!("beacon failed at mac queue");
            })
    }

    fn send_flash(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        dest_addr: u16,
        challenge: u64,
    ) -> Result<(), ()> {
        let mut flash = Flash {
            challenge,
            iv: *mac.session_iv(),
            auth_tag: [0u8; AUTH_TAG_SIZE],
        };

        let mut buf = [0u8; Flash::LEN];
        flash.encode(&mut buf);
        flash.auth_tag = mac.sign_session(crypto, &buf[..Flash::SIGNED_LEN]);
        flash.encode(&mut buf);

        let addr = MacAddr::short(dest_addr, cfg.pan_id, cfg.short_addr);
        mac.transmit_frame(mem, crypto, addr, Self::neighbor_tx_options(true), &buf)
            .map_err(|_| {
                info!("flash failed at mac queue");
            })
    }

    fn send_thunder(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        dest_addr: u16,
        challenge: u64,
    ) -> Result<(), ()> {
        let mut thunder = Thunder {
            response: challenge.wrapping_add(1),
            iv: *mac.session_iv(),
            counter: mac.next_replay_counter(),
            auth_tag: [0u8; AUTH_TAG_SIZE],
        };

        let mut buf = [0u8; Thunder::LEN];
        thunder.encode(&mut buf);
        thunder.auth_tag = mac.sign_session(crypto, &buf[..Thunder::SIGNED_LEN]);
        thunder.encode(&mut buf);

        let addr = MacAddr::short(dest_addr, cfg.pan_id, cfg.short_addr);
        mac.transmit_frame(mem, crypto, addr, Self::neighbor_tx_options(true), &buf)
            .map_err(|_| {
                info!("thunder failed at mac queue");
            })
    }

    fn send_evict(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        dest_addr: u16,
    ) -> Result<(), ()> {
        debug!("sending eviction to {:04x}", dest_addr);

        let mut msg = Evict {
            counter: mac.next_replay_counter(),
            auth_tag: [0u8; AUTH_TAG_SIZE],
        };

        let mut buf = [0u8; Evict::LEN];
        msg.encode(&mut buf);
        msg.auth_tag = mac.sign_session(crypto, &buf[..Evict::SIGNED_LEN]);
        msg.encode(&mut buf);

        let addr = MacAddr::short(dest_addr, cfg.pan_id, cfg.short_addr);
        mac.transmit_frame(mem, crypto, addr, Self::neighbor_tx_options(true), &buf)
            .map_err(|_| {
                info!("evict failed at mac queue");
            })
    }

    // join state machine

    /// Open a join towards a beaconing peer: record provisional state
    /// and answer with a unicast JOIN beacon
    fn initiate_join(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        time_synced: bool,
        now: Ts,
        source_addr: u16,
        beacon: &Beacon,
    ) -> Result<(), ()> {
        let (flags, ip, upstream, depth) = (beacon.flags, beacon.ip, beacon.upstream, beacon.depth);

        if self.add_prov(source_addr, now).is_none() {
            return Err(());
        }

        if self
            .send_beacon(mac, mem, crypto, cfg, time_synced, source_addr, true)
            .is_err()
        {
            self.remove_prov(source_addr);
            return Err(());
        }

        let prov_len = self.prov.len();
        let p = &mut self.prov[prov_len - 1];
        p.state = ProvState::WaitFlash;
        p.flags = flags;
        p.ip = ip;
        p.upstream = upstream;
        p.depth = depth;

        debug!("initiate join with {:04x}", source_addr);
        Ok(())
    }

    /// Accept a JOIN beacon: issue the challenge flash
    fn accept_join<G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        now: Ts,
        source_addr: u16,
        beacon: &Beacon,
    ) -> Result<(), ()> {
        let (flags, ip, upstream, depth) = (beacon.flags, beacon.ip, beacon.upstream, beacon.depth);

        // re-joins replace any stale provisional state
        self.remove_prov(source_addr);
        if self.add_prov(source_addr, now).is_none() {
            return Err(());
        }

        debug!("accept join from {:04x}", source_addr);

        let challenge = rng.next_u64();
        if self
            .send_flash(mac, mem, crypto, cfg, source_addr, challenge)
            .is_err()
        {
            self.remove_prov(source_addr);
            return Err(());
        }

        let i = self.prov_index(source_addr).unwrap_or(0);
        let p = &mut self.prov[i];
        p.state = ProvState::WaitThunder;
        p.flags = flags;
        p.ip = ip;
        p.upstream = upstream;
        p.depth = depth;
        p.challenge = challenge;

        Ok(())
    }

    fn prov_received_flash<G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        source_addr: u16,
    ) {
        let i = match self.prov_index(source_addr) {
            Some(i) => i,
            None => return,
        };
        if self.prov[i].state != ProvState::WaitFlash {
            return;
        }

        let challenge = rng.next_u64();
        if self
            .send_flash(mac, mem, crypto, cfg, source_addr, challenge)
            .is_ok()
        {
            if let Some(i) = self.prov_index(source_addr) {
                self.prov[i].state = ProvState::WaitThunder;
                self.prov[i].challenge = challenge;
            }
        }
    }

    fn prov_received_thunder(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        source_addr: u16,
        thunder: &Thunder,
    ) {
        let i = match self.prov_index(source_addr) {
            Some(i) => i,
            None => return,
        };
        if self.prov[i].state != ProvState::WaitThunder {
            return;
        }
        if thunder.response != self.prov[i].challenge.wrapping_add(1) {
            info!("invalid join response from {:04x}", source_addr);
            return;
        }

        let prov = self.prov[i].clone();

        if !self.is_neighbor(source_addr) {
            if self.is_full() {
                if let Some(dropped) = self.drop_candidate() {
                    self.evict(mac, mem, crypto, cfg, dropped);
                    info!("evicting {:04x} in favor of {:04x}", dropped, source_addr);
                }
            }

            if self.add_neighbor(source_addr).is_none() {
                warn!("no room for neighbor {:04x}", source_addr);
                return;
            }
            info!("adding neighbor {:04x}", source_addr);
        } else {
            info!("rejoined neighbor {:04x}", source_addr);
        }

        if let Some(n) = self.get_mut(source_addr) {
            n.flags = (prov.flags & BEACON_FLAGS) | NeighborFlags::NEW;
            n.short_addr = source_addr;
            n.age = 0;
            n.replay_counter = thunder.counter;
            n.ip = prov.ip;
            n.iv = thunder.iv;

            // seed link state optimistic
            n.rssi = 10;
            n.lqi = 230;
            n.prr = 128;
            n.etx = 16;
        }

        if (self.upstream == 0 || self.upstream == source_addr)
            && prov.upstream != 0
            && prov.depth < MAX_DEPTH
        {
            self.upstream = source_addr;
            self.depth = prov.depth + 1;
            debug!("upstream {:04x} depth {}", self.upstream, self.depth);

            if let Some(n) = self.get_mut(source_addr) {
                n.flags |= NeighborFlags::UPSTREAM;
            }
        }

        self.reset_beacon_interval();
        self.remove_prov(source_addr);
    }

    /// Pairing policy for an unknown beaconing peer
    fn should_pair(&self, beacon: &Beacon, source_addr: u16) -> bool {
        if beacon.flags.contains(NeighborFlags::NO_JOIN) {
            return false;
        }

        // an orphan takes any peer with a path to the root
        if self.upstream == 0
            && (beacon.upstream != 0 || beacon.flags.contains(NeighborFlags::GATEWAY))
        {
            debug!("should pair {:04x}: root path", source_addr);
            return true;
        }

        // while scanning, nothing else is worth parking for
        if self.mode == Mode::ChannelScan {
            return false;
        }

        if !self.is_full()
            && (!beacon.flags.contains(NeighborFlags::FULL)
                || beacon.flags.contains(NeighborFlags::JOIN))
        {
            debug!("should pair {:04x}: space", source_addr);
            return true;
        }

        if beacon.upstream == 0 && self.drop_candidate().is_some() {
            debug!("should pair {:04x}: drop", source_addr);
            return true;
        }

        false
    }

    fn process_beacon<G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        time_synced: bool,
        now: Ts,
        source_addr: u16,
        beacon: &Beacon,
        raw: &[u8],
    ) {
        let known = self.is_neighbor(source_addr);

        if !known {
            if self.should_pair(beacon, source_addr) {
                if !beacon.flags.contains(NeighborFlags::JOIN) {
                    let _ = self.initiate_join(
                        mac,
                        mem,
                        crypto,
                        cfg,
                        time_synced,
                        now,
                        source_addr,
                        beacon,
                    );
                } else {
                    let _ = self
                        .accept_join(mac, mem, crypto, cfg, rng, now, source_addr, beacon);
                }
            }
            return;
        }

        if beacon.flags.contains(NeighborFlags::JOIN) {
            debug!("re-pairing {:04x}", source_addr);
            let _ = self.accept_join(mac, mem, crypto, cfg, rng, now, source_addr, beacon);
            return;
        }

        // steady state: authenticate against the stored session
        let (auth_ok, was_new) = {
            let n = self.get(source_addr).unwrap();
            let tag = crypto.xcbc_mac_96(&[&n.iv, &raw[..Beacon::SIGNED_LEN]]);
            (
                tag_eq(&tag, &beacon.auth_tag) && beacon.counter > n.replay_counter,
                n.flags.contains(NeighborFlags::NEW),
            )
        };

        if !auth_ok {
            // a rebooted peer will answer the join with a fresh session
            debug!("beacon auth fail on active session for {:04x}", source_addr);
            let _ =
                self.initiate_join(mac, mem, crypto, cfg, time_synced, now, source_addr, beacon);
            return;
        }

        if was_new {
            debug!("clearing new flag on {:04x}", source_addr);
        }

        if let Some(n) = self.get_mut(source_addr) {
            n.ip = beacon.ip;
            n.replay_counter = beacon.counter;
            n.age = 0;
            n.flags.remove(NeighborFlags::NEW);

            n.flags.remove(BEACON_FLAGS | NeighborFlags::DOWNSTREAM);
            n.flags |= beacon.flags & BEACON_FLAGS;

            if beacon.upstream == cfg.short_addr {
                n.flags |= NeighborFlags::DOWNSTREAM;
            }
        }

        // upstream maintenance
        if source_addr == self.upstream {
            if beacon.upstream == 0 {
                self.reset_upstream();
            } else {
                self.depth = beacon.depth + 1;
                if self.depth > MAX_DEPTH {
                    debug!("upstream depth invalid");
                    self.reset_upstream();
                } else if let Some(n) = self.get_mut(source_addr) {
                    n.flags |= NeighborFlags::UPSTREAM;
                }
            }
        } else if self.upstream == 0 && beacon.upstream != 0 && beacon.depth < MAX_DEPTH {
            self.upstream = source_addr;
            self.depth = beacon.depth + 1;
            debug!("upstream {:04x} depth {}", self.upstream, self.depth);
            if let Some(n) = self.get_mut(source_addr) {
                n.flags |= NeighborFlags::UPSTREAM;
            }
        } else if beacon.upstream != 0 && beacon.depth + 1 < self.depth {
            // a better upstream is on offer
            self.reset_upstream();
            self.upstream = source_addr;
            self.depth = beacon.depth + 1;
            debug!("upstream {:04x} depth {}", self.upstream, self.depth);
            if let Some(n) = self.get_mut(source_addr) {
                n.flags |= NeighborFlags::UPSTREAM;
            }
        }
    }

    fn process_flash<G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        source_addr: u16,
        flash: &Flash,
        raw: &[u8],
    ) {
        let tag = crypto.xcbc_mac_96(&[&flash.iv, &raw[..Flash::SIGNED_LEN]]);
        if !tag_eq(&tag, &flash.auth_tag) {
            debug!("flash auth fail");
            return;
        }

        let _ = self.send_thunder(mac, mem, crypto, cfg, source_addr, flash.challenge);

        self.prov_received_flash(mac, mem, crypto, cfg, rng, source_addr);
    }

    fn process_thunder(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        source_addr: u16,
        thunder: &Thunder,
        raw: &[u8],
    ) {
        let tag = crypto.xcbc_mac_96(&[&thunder.iv, &raw[..Thunder::SIGNED_LEN]]);
        if !tag_eq(&tag, &thunder.auth_tag) {
            debug!("thunder auth fail");
            return;
        }

        self.prov_received_thunder(mac, mem, crypto, cfg, source_addr, thunder);
    }

    fn process_evict(&mut self, crypto: &Crypto, source_addr: u16, evict: &Evict, raw: &[u8]) {
        let iv = match self.get(source_addr) {
            Some(n) => n.iv,
            None => {
                debug!("evict from unknown neighbor {:04x}", source_addr);
                return;
            }
        };

        let tag = crypto.xcbc_mac_96(&[&iv, &raw[..Evict::SIGNED_LEN]]);
        if !tag_eq(&tag, &evict.auth_tag) {
            debug!("evict auth fail");
            return;
        }

        debug!("evicted by {:04x}", source_addr);
        self.remove_neighbor(source_addr);
        self.reset_beacon_interval();
    }

    /// Neighbor protocol dispatch from the MAC receive path
    pub fn receive_msg<G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        time_synced: bool,
        now: Ts,
        source_addr: u16,
        payload: &[u8],
    ) {
        let msg = match messages::decode(payload) {
            Ok(m) => m,
            Err(_) => return,
        };

        match msg {
            NeighborMsg::Beacon(b) => self.process_beacon(
                mac,
                mem,
                crypto,
                cfg,
                rng,
                time_synced,
                now,
                source_addr,
                &b,
                payload,
            ),
            NeighborMsg::Flash(f) => {
                self.process_flash(mac, mem, crypto, cfg, rng, source_addr, &f, payload)
            }
            NeighborMsg::Thunder(t) => {
                self.process_thunder(mac, mem, crypto, cfg, source_addr, &t, payload)
            }
            NeighborMsg::Evict(e) => self.process_evict(crypto, source_addr, &e, payload),
        }
    }

    /// MAC-level session verification for authenticated frames.
    /// Updates the stored replay counter on success.
    pub fn verify_session_msg(
        &mut self,
        crypto: &Crypto,
        source_addr: u16,
        counter: u32,
        signed: &[u8],
        tag: &[u8],
    ) -> bool {
        let (iv, stored) = match self.get(source_addr) {
            Some(n) => (n.iv, n.replay_counter),
            None => return false,
        };

        if counter <= stored {
            return false;
        }

        let computed = crypto.xcbc_mac_96(&[&iv, signed]);
        if !tag_eq(&computed, tag) {
            return false;
        }

        if let Some(n) = self.get_mut(source_addr) {
            n.replay_counter = counter;
        }
        true
    }

    /// Test support: install a bare session record, bypassing the
    /// four way join
    #[cfg(any(test, feature = "mocks"))]
    pub fn test_install(&mut self, short_addr: u16) -> &mut Neighbor {
        match self.add_neighbor(short_addr) {
            Some(n) => n,
            None => panic!("neighbor table full"),
        }
    }

    /// Test support: drop a session record without notifying the peer
    #[cfg(any(test, feature = "mocks"))]
    pub fn test_remove(&mut self, short_addr: u16) {
        self.remove_neighbor(short_addr);
    }

    /// Test support: force the upstream selection
    #[cfg(any(test, feature = "mocks"))]
    pub fn test_set_upstream(&mut self, short_addr: u16, depth: u8) {
        self.upstream = short_addr;
        self.depth = depth;
        self.mode = Mode::Parked;
    }

    // tasks

    /// Beacon sender: channel scan while orphaned, exponential
    /// interval backoff once parked
    pub fn beacon_task<R: Radio, T: Timer, G: RngCore>(
        &mut self,
        radio: &mut R,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        rng: &mut G,
        timer: &T,
        time_synced: bool,
    ) -> Disposition {
        let now = timer.ticks_ms();

        if self.beacon_kick {
            self.beacon_kick = false;
            self.beacon_interval = BEACON_INTERVAL_MIN;
            if self.beacon_phase != BeaconPhase::StartupDelay {
                self.beacon_phase = BeaconPhase::Top;
            }
        }

        match self.beacon_phase {
            BeaconPhase::StartupDelay => {
                if !time_reached(now, self.beacon_deadline) {
                    return Disposition::Wait;
                }
                self.beacon_phase = BeaconPhase::Top;
                Disposition::Yield
            }
            BeaconPhase::Top => {
                if self.upstream != 0 {
                    if self.mode == Mode::ChannelScan {
                        debug!("parked on channel {}", radio.channel());
                    }
                    self.mode = Mode::Parked;
                }

                match self.mode {
                    Mode::ChannelScan => {
                        let mut channel = radio.channel() + 1;
                        if channel > HIGHEST_CHANNEL {
                            channel = LOWEST_CHANNEL;
                        }
                        let _ = radio.set_channel(channel);

                        let _ = self.send_beacon(
                            mac,
                            mem,
                            crypto,
                            cfg,
                            time_synced,
                            BROADCAST_SHORT,
                            false,
                        );

                        self.beacon_deadline = now.wrapping_add(CHANNEL_SCAN_BEACON_WAIT_MS);
                        self.beacon_phase = BeaconPhase::ScanWait;
                    }
                    Mode::Parked => {
                        let _ = self.send_beacon(
                            mac,
                            mem,
                            crypto,
                            cfg,
                            time_synced,
                            BROADCAST_SHORT,
                            false,
                        );

                        let jitter = rng.next_u32() & 0x3ff;
                        self.beacon_deadline = now
                            .wrapping_add(self.beacon_interval as Ts * 1000)
                            .wrapping_add(jitter);

                        self.beacon_interval = self.beacon_interval.saturating_mul(2);
                        if self.beacon_interval > BEACON_INTERVAL_MAX {
                            self.beacon_interval = BEACON_INTERVAL_MAX;
                        }
                        self.beacon_phase = BeaconPhase::ParkedWait;
                    }
                }
                Disposition::Wait
            }
            BeaconPhase::ScanWait => {
                if !time_reached(now, self.beacon_deadline) {
                    return Disposition::Wait;
                }
                // let in-flight joins complete before hopping away
                if !self.prov.is_empty() {
                    return Disposition::Wait;
                }
                self.beacon_phase = BeaconPhase::Top;
                Disposition::Yield
            }
            BeaconPhase::ParkedWait => {
                if !time_reached(now, self.beacon_deadline) {
                    return Disposition::Wait;
                }
                self.beacon_phase = BeaconPhase::Top;
                Disposition::Yield
            }
        }
    }

    /// Expire provisional joins
    pub fn join_timeout_task<T: Timer>(&mut self, timer: &T) -> Disposition {
        let now = timer.ticks_ms();

        let mut i = 0;
        while i < self.prov.len() {
            if time_elapsed(now, self.prov[i].started) > PROV_TIMEOUT_MS {
                info!("join timeout {:04x}", self.prov[i].short_addr);
                self.prov.remove(i);
            } else {
                i += 1;
            }
        }

        Disposition::TimedWait(now.wrapping_add(200))
    }

    /// One second sweep: aging, link-quality eviction, traffic
    /// averaging, channel reset countdown
    pub fn monitor_task<T: Timer>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        timer: &T,
        time_synced: bool,
    ) -> Disposition {
        let now = timer.ticks_ms();
        self.monitor_ticks = self.monitor_ticks.wrapping_add(1);

        let mut evictions: heapless::Vec<u16, NEIGHBOR_TABLE_CAP> = heapless::Vec::new();

        for n in self.list.iter_mut() {
            n.age = n.age.saturating_add(1);

            if n.age >= MAX_AGE
                || (n.flags.contains(NeighborFlags::NEW) && n.age > MAX_AGE_NEW)
            {
                debug!("haven't heard from {:04x}", n.short_addr);
                let _ = evictions.push(n.short_addr);
            } else if n.etx >= DROP_ETX {
                debug!("dropping {:04x}, poor link", n.short_addr);
                let _ = evictions.push(n.short_addr);
            } else if self.monitor_ticks % 8 == 0 {
                n.traffic_avg = ewma_filter(cfg.traffic_filter, n.traffic_accumulator, n.traffic_avg);
                n.traffic_accumulator = 0;
            }
        }

        for addr in evictions.iter() {
            self.evict(mac, mem, crypto, cfg, *addr);
        }

        // advertise time sync status changes promptly
        if self.beacon_flags.contains(NeighborFlags::TIME_SYNC) != time_synced {
            self.reset_beacon_interval();
        }

        if self.channel_reset_countdown > 0 && self.upstream == 0 {
            self.channel_reset_countdown -= 1;
            if self.channel_reset_countdown == 0 {
                debug!("channel reset");
                self.mode = Mode::ChannelScan;
                self.reset_beacon_interval();
                self.flush(mac, mem, crypto, cfg);
            }
        }

        Disposition::TimedWait(now.wrapping_add(1000))
    }
}
