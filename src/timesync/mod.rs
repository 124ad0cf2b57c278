//! Upstream driven time synchronisation
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// A synced node offers timestamps to its downstream children; an
// unsynced node requests them from its upstream. The receive ISR
// latches the arrival microsecond of every frame, which becomes the
// local anchor of each synchronisation point. A drift ratio relates
// local to network elapsed time between points.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use rand_core::RngCore;

use crate::crypto::Crypto;
use crate::mac::{Mac, MacAddr, Protocol, RxOptions, TxOptions};
use crate::mem::Arena;
use crate::neighbor::{NeighborFlags, Neighbors};
use crate::radio::{Radio, TxMode, TxStatus};
use crate::sched::Disposition;
use crate::timer::Timer;
use crate::{time_reached, StackConfig, Ts};

/// Delay between requests until the drift filter has two points, in
/// seconds
pub const SYNC_DRIFT_INIT_TIME_S: u32 = 4;
/// Steady state request interval, in seconds
pub const SYNC_INTERVAL_MIN_S: u32 = 120;
/// Age of the last point after which sync is declared lost, in seconds
pub const SYNC_LOSS_SECONDS: u32 = 480;

/// Clock source tag of the mesh root
pub const CLOCK_SOURCE_GATEWAY: u8 = 127;

pub const MSG_TYPE_TIMESTAMP: u8 = 1;
pub const MSG_TYPE_REQUEST: u8 = 2;

bitflags::bitflags! {
    pub struct TimeFlags: u8 {
        const NTP_SYNC     = 0x01;
        const INITIAL_SYNC = 0x02;
        const SYNC         = 0x04;
    }
}

/// Seconds + 2^-32 fraction, NTP era format
#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NtpTimestamp {
    pub seconds: u32,
    pub fraction: u32,
}

#[derive(Clone, Debug)]
pub struct TimeInfo {
    pub flags: TimeFlags,
    pub source_addr: u16,
    pub clk_source: u8,
    pub depth: u8,
    pub sequence: u8,
    /// Ratio of actual to estimated elapsed network time; the
    /// correction applied is elapsed_local / drift
    pub drift: i32,
    /// Local microseconds at the last synchronisation point
    pub local_time: u32,
    /// Network microseconds at the last synchronisation point
    pub network_time: u32,
    pub ntp_time: NtpTimestamp,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            flags: TimeFlags::empty(),
            source_addr: 0,
            clk_source: 0,
            depth: 0,
            sequence: 0,
            drift: 0,
            local_time: 0,
            network_time: 0,
            ntp_time: NtpTimestamp::default(),
        }
    }
}

/// Timestamp offer, sent in response to a request
#[derive(Clone, Debug, PartialEq)]
pub struct TimestampMsg {
    pub flags: TimeFlags,
    pub depth: u8,
    pub clk_source: u8,
    pub sequence: u8,
    /// Network microseconds latched at transmit
    pub timestamp: u32,
    pub ntp_time: NtpTimestamp,
}

impl TimestampMsg {
    pub const LEN: usize = 5 + 4 + 8 + 8;

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        buf[0] = MSG_TYPE_TIMESTAMP;
        buf[1] = self.flags.bits();
        buf[2] = self.depth;
        buf[3] = self.clk_source;
        buf[4] = self.sequence;
        LittleEndian::write_u32(&mut buf[5..], self.timestamp);
        LittleEndian::write_u32(&mut buf[9..], self.ntp_time.seconds);
        LittleEndian::write_u32(&mut buf[13..], self.ntp_time.fraction);
        buf[17..25].fill(0);
        Self::LEN
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::LEN {
            return None;
        }
        Some(Self {
            flags: TimeFlags::from_bits_truncate(buf[1]),
            depth: buf[2],
            clk_source: buf[3],
            sequence: buf[4],
            timestamp: LittleEndian::read_u32(&buf[5..]),
            ntp_time: NtpTimestamp {
                seconds: LittleEndian::read_u32(&buf[9..]),
                fraction: LittleEndian::read_u32(&buf[13..]),
            },
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum SyncPhase {
    Reset,
    WaitInitial,
    Request,
    WaitInterval,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum TsTxPhase {
    Idle,
    AwaitStatus,
}

pub struct TimeSync {
    info: TimeInfo,
    enabled: bool,
    /// This node is the reference clock
    root: bool,

    phase: SyncPhase,
    deadline: Ts,

    /// Requesters awaiting a timestamp
    pending_ts: heapless::Vec<u16, 4>,
    ts_phase: TsTxPhase,
}

impl TimeSync {
    pub fn new(cfg: &StackConfig) -> Self {
        let mut s = Self {
            info: TimeInfo::default(),
            enabled: cfg.enable_time_sync,
            root: cfg.gateway && cfg.enable_time_sync,
            phase: SyncPhase::Reset,
            deadline: 0,
            pending_ts: heapless::Vec::new(),
            ts_phase: TsTxPhase::Idle,
        };

        if s.root {
            s.info.flags = TimeFlags::SYNC;
            s.info.clk_source = CLOCK_SOURCE_GATEWAY;
        }

        s
    }

    pub fn info(&self) -> &TimeInfo {
        &self.info
    }

    pub fn flags(&self) -> TimeFlags {
        self.info.flags
    }

    pub fn synced(&self) -> bool {
        self.info.flags.contains(TimeFlags::SYNC)
    }

    pub fn ntp_synced(&self) -> bool {
        self.info.flags.contains(TimeFlags::NTP_SYNC)
    }

    /// Install the wall-clock base, root side hook
    pub fn set_ntp_base(&mut self, ntp: NtpTimestamp) {
        self.info.ntp_time = ntp;
        if ntp.seconds != 0 {
            self.info.flags |= TimeFlags::NTP_SYNC;
        }
    }

    pub fn reset(&mut self) {
        self.info = TimeInfo::default();
        if self.root {
            self.info.flags = TimeFlags::SYNC;
            self.info.clk_source = CLOCK_SOURCE_GATEWAY;
        }
    }

    /// Local microseconds elapsed since the last synchronisation point
    pub fn elapsed_local(&self, local_us: u32) -> u32 {
        local_us.wrapping_sub(self.info.local_time)
    }

    /// Drift compensated network time for a local microsecond reading
    pub fn compensated_network_time(&self, local_us: u32) -> u32 {
        let elapsed = self.elapsed_local(local_us);

        let correction = if self.info.drift != 0 {
            ((elapsed as i32) / self.info.drift) as u32
        } else {
            0
        };

        self.info
            .network_time
            .wrapping_add(elapsed)
            .wrapping_add(correction)
    }

    pub fn network_time<T: Timer>(&self, timer: &T) -> u32 {
        self.compensated_network_time(timer.time_us())
    }

    pub fn network_time_ms<T: Timer>(&self, timer: &T) -> u32 {
        self.network_time(timer) / 1000
    }

    /// NTP wall clock derived from the network time base
    pub fn ntp_time<T: Timer>(&self, timer: &T) -> NtpTimestamp {
        let compensated = self.network_time(timer);
        let elapsed_net = compensated.wrapping_sub(self.info.network_time);

        let mut seconds = elapsed_net / 1_000_000;
        let microseconds = elapsed_net % 1_000_000;

        // 2^32 / 1e6 rounds to 4294, good to roughly 0.02 percent over
        // one second; 4295 would overflow
        let fraction = microseconds * 4294;

        let frac_sum = fraction.wrapping_add(self.info.ntp_time.fraction);
        if frac_sum < self.info.ntp_time.fraction {
            seconds += 1;
        }

        NtpTimestamp {
            seconds: seconds.wrapping_add(self.info.ntp_time.seconds),
            fraction: frac_sum,
        }
    }

    /// Fold one synchronisation point into the drift filter
    pub fn sync(
        &mut self,
        source_addr: u16,
        depth: u8,
        clk_source: u8,
        sequence: u8,
        local_timestamp: u32,
        network_timestamp: u32,
        ntp_time: NtpTimestamp,
    ) {
        let elapsed_local = self.elapsed_local(local_timestamp);
        let est_network = elapsed_local.wrapping_add(self.info.network_time);

        let actual_elapsed = network_timestamp.wrapping_sub(self.info.network_time) as i32;
        let est_elapsed = network_timestamp.wrapping_sub(est_network) as i32;

        let current_drift = if est_elapsed != 0 {
            actual_elapsed / est_elapsed
        } else {
            0
        };

        let new_drift;
        if self.info.flags.contains(TimeFlags::SYNC) {
            if current_drift != 0 {
                // alpha = 8/128
                new_drift = ((8 * current_drift) / 128) + ((120 * self.info.drift) / 128);
            } else {
                new_drift = self.info.drift;
            }
        } else if self.info.flags.contains(TimeFlags::INITIAL_SYNC) {
            new_drift = current_drift;
            self.info.flags |= TimeFlags::SYNC;
            self.info.flags.remove(TimeFlags::INITIAL_SYNC);
        } else {
            new_drift = 0;
            self.info.flags |= TimeFlags::INITIAL_SYNC;
        }

        self.info.source_addr = source_addr;
        self.info.drift = new_drift;
        self.info.local_time = local_timestamp;
        self.info.depth = depth;
        self.info.clk_source = clk_source;
        self.info.sequence = sequence;
        self.info.network_time = network_timestamp;
        self.info.ntp_time = ntp_time;

        if ntp_time.seconds != 0 {
            self.info.flags |= TimeFlags::NTP_SYNC;
        }

        debug!(
            "sync point: net {} drift {} flags {:?}",
            network_timestamp, new_drift, self.info.flags
        );
    }

    /// TimeSync protocol dispatch from the MAC receive path. The frame
    /// has already been session authenticated.
    pub fn receive_msg(&mut self, source_addr: u16, options: &RxOptions, payload: &[u8]) {
        if !self.enabled || payload.is_empty() {
            return;
        }

        match payload[0] {
            MSG_TYPE_TIMESTAMP => {
                let msg = match TimestampMsg::decode(payload) {
                    Some(m) => m,
                    None => return,
                };
                // only synced peers can offer time
                if !msg.flags.contains(TimeFlags::SYNC) {
                    return;
                }

                self.sync(
                    source_addr,
                    msg.depth,
                    msg.clk_source,
                    msg.sequence,
                    options.timestamp,
                    msg.timestamp,
                    msg.ntp_time,
                );
            }
            MSG_TYPE_REQUEST => {
                if self.pending_ts.iter().any(|d| *d == source_addr) {
                    return;
                }
                let _ = self.pending_ts.push(source_addr);
            }
            _ => (),
        }
    }

    fn send_request(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        cfg: &StackConfig,
        dest_addr: u16,
    ) {
        let addr = MacAddr::short(dest_addr, cfg.pan_id, cfg.short_addr);
        let options = TxOptions {
            ack_request: false,
            secure_frame: true,
            protocol: Protocol::TimeSync,
        };

        let _ = mac.transmit_frame(mem, crypto, addr, options, &[MSG_TYPE_REQUEST]);
    }

    fn upstream_synced(&self, neighbors: &Neighbors) -> bool {
        neighbors
            .flags_of(neighbors.upstream())
            .contains(NeighborFlags::TIME_SYNC)
    }

    fn sync_holds<T: Timer>(&self, neighbors: &Neighbors, timer: &T) -> bool {
        self.upstream_synced(neighbors)
            && neighbors.upstream() == self.info.source_addr
            && !self.info.flags.is_empty()
            && self.elapsed_local(timer.time_us()) < SYNC_LOSS_SECONDS * 1_000_000
    }

    /// Synchronisation loop: request timestamps from the upstream,
    /// tightly at first, then at the steady interval while sync holds
    pub fn sync_task<T: Timer, G: RngCore>(
        &mut self,
        mac: &mut Mac,
        mem: &mut Arena,
        crypto: &Crypto,
        neighbors: &Neighbors,
        cfg: &StackConfig,
        rng: &mut G,
        timer: &T,
    ) -> Disposition {
        if !self.enabled || self.root {
            return Disposition::Sleep;
        }

        let now = timer.ticks_ms();

        match self.phase {
            SyncPhase::Reset => {
                self.reset();
                if !self.upstream_synced(neighbors) {
                    return Disposition::Wait;
                }

                self.send_request(mac, mem, crypto, cfg, neighbors.upstream());
                self.deadline = now
                    .wrapping_add(SYNC_DRIFT_INIT_TIME_S * 1000)
                    .wrapping_add(rng.next_u32() & 0x3ff);
                self.phase = SyncPhase::WaitInitial;
                Disposition::Wait
            }
            SyncPhase::WaitInitial => {
                if !time_reached(now, self.deadline) {
                    return Disposition::Wait;
                }
                if self.info.flags.is_empty() {
                    // nothing heard, start over
                    self.phase = SyncPhase::Reset;
                    return Disposition::Yield;
                }
                self.phase = SyncPhase::Request;
                Disposition::Yield
            }
            SyncPhase::Request => {
                if !self.sync_holds(neighbors, timer) {
                    warn!("sync loss");
                    self.phase = SyncPhase::Reset;
                    return Disposition::Yield;
                }

                self.send_request(mac, mem, crypto, cfg, neighbors.upstream());

                let delay = if self.info.flags.contains(TimeFlags::INITIAL_SYNC) {
                    SYNC_DRIFT_INIT_TIME_S * 1000 + (rng.next_u32() & 0x3ff)
                } else {
                    SYNC_INTERVAL_MIN_S * 1000 + (rng.next_u32() & 0xffff)
                };
                self.deadline = now.wrapping_add(delay);
                self.phase = SyncPhase::WaitInterval;
                Disposition::Wait
            }
            SyncPhase::WaitInterval => {
                if !self.sync_holds(neighbors, timer) {
                    warn!("sync loss");
                    self.phase = SyncPhase::Reset;
                    return Disposition::Yield;
                }
                if !time_reached(now, self.deadline) {
                    return Disposition::Wait;
                }
                self.phase = SyncPhase::Request;
                Disposition::Yield
            }
        }
    }

    /// Timestamp transmit task. Bypasses the MAC queue (basic transmit
    /// mode) so the network time is latched as close to the air as
    /// possible.
    pub fn ts_tx_task<R: Radio, T: Timer>(
        &mut self,
        radio: &mut R,
        mac: &mut Mac,
        crypto: &Crypto,
        cfg: &StackConfig,
        timer: &T,
    ) -> Disposition {
        match self.ts_phase {
            TsTxPhase::Idle => {
                let dest = match self.pending_ts.first() {
                    Some(d) => *d,
                    None => return Disposition::Wait,
                };
                if !self.synced() {
                    self.pending_ts.remove(0);
                    return Disposition::Yield;
                }

                if radio.request_tx_mode(TxMode::Basic).is_err() {
                    return Disposition::Wait;
                }

                // latch the network time at the last possible moment
                let msg = TimestampMsg {
                    flags: self.info.flags,
                    depth: self.info.depth + 1,
                    clk_source: self.info.clk_source,
                    sequence: self.info.sequence,
                    timestamp: self.network_time(timer),
                    ntp_time: self.ntp_time(timer),
                };

                let mut payload = [0u8; TimestampMsg::LEN];
                msg.encode(&mut payload);

                let addr = MacAddr::short(dest, cfg.pan_id, cfg.short_addr);
                let options = TxOptions {
                    ack_request: false,
                    secure_frame: true,
                    protocol: Protocol::TimeSync,
                };

                let mut buf = [0u8; 127];
                let len = match mac.build_frame(crypto, addr, options, &payload, &mut buf) {
                    Ok(l) => l,
                    Err(_) => {
                        self.pending_ts.remove(0);
                        return Disposition::Yield;
                    }
                };

                if radio.write_frame(&buf[..len]).is_err() || radio.transmit().is_err() {
                    self.pending_ts.remove(0);
                    return Disposition::Yield;
                }

                self.ts_phase = TsTxPhase::AwaitStatus;
                Disposition::Yield
            }
            TsTxPhase::AwaitStatus => {
                if radio.tx_status() == TxStatus::Busy {
                    return Disposition::Wait;
                }
                if !self.pending_ts.is_empty() {
                    self.pending_ts.remove(0);
                }
                self.ts_phase = TsTxPhase::Idle;
                Disposition::Yield
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::radio::mock::{MockRadio, MockRng};
    use crate::timer::mock::MockTimer;

    fn cfg() -> StackConfig {
        StackConfig {
            short_addr: 2,
            ..Default::default()
        }
    }

    fn rx_options(timestamp: u32) -> RxOptions {
        RxOptions {
            protocol: Protocol::TimeSync,
            security_enabled: true,
            lqi: 200,
            ed: 20,
            timestamp,
        }
    }

    #[test]
    fn timestamp_roundtrip() {
        let msg = TimestampMsg {
            flags: TimeFlags::SYNC | TimeFlags::NTP_SYNC,
            depth: 2,
            clk_source: CLOCK_SOURCE_GATEWAY,
            sequence: 9,
            timestamp: 123_456_789,
            ntp_time: NtpTimestamp {
                seconds: 0xd000_0000,
                fraction: 0x8000_0000,
            },
        };

        let mut buf = [0u8; TimestampMsg::LEN];
        assert_eq!(msg.encode(&mut buf), TimestampMsg::LEN);
        assert_eq!(TimestampMsg::decode(&buf), Some(msg));
    }

    #[test]
    fn flag_ladder() {
        let mut ts = TimeSync::new(&cfg());
        let ntp = NtpTimestamp::default();

        ts.sync(5, 1, CLOCK_SOURCE_GATEWAY, 0, 1_000, 2_000, ntp);
        assert_eq!(ts.flags(), TimeFlags::INITIAL_SYNC);
        assert!(!ts.synced());

        ts.sync(5, 1, CLOCK_SOURCE_GATEWAY, 1, 2_000, 3_000, ntp);
        assert_eq!(ts.flags(), TimeFlags::SYNC);
        assert!(ts.synced());
    }

    #[test]
    fn ntp_sync_needs_nonzero_base() {
        let mut ts = TimeSync::new(&cfg());
        let ntp = NtpTimestamp {
            seconds: 0xd950_0000,
            fraction: 0,
        };

        ts.sync(5, 1, 0, 0, 0, 0, NtpTimestamp::default());
        assert!(!ts.ntp_synced());

        ts.sync(5, 1, 0, 1, 1, 1, ntp);
        assert!(ts.ntp_synced());
    }

    #[test]
    fn drift_converges_under_ppm_offset() {
        let mut ts = TimeSync::new(&cfg());

        // local clock runs slow by 1.0001
        let ratio = 1.0001f64;
        let mut net: u32 = 1_000_000;

        for i in 0..10 {
            let local = (net as f64 / ratio) as u32;
            ts.sync(5, 1, CLOCK_SOURCE_GATEWAY, i, local, net, NtpTimestamp::default());
            net = net.wrapping_add(120_000_000);
        }
        assert!(ts.synced());

        // probe a minute past the last sync point
        let true_net = net.wrapping_sub(120_000_000).wrapping_add(60_000_000);
        let local_probe = (true_net as f64 / ratio) as u32;
        let compensated = ts.compensated_network_time(local_probe);

        let error = (compensated as i64 - true_net as i64).abs();
        assert!(error < 1_000, "compensated error {} us", error);
    }

    #[test]
    fn uncompensated_clock_misses() {
        // the same scenario without drift correction overshoots 1 ms,
        // showing the filter is doing the work
        let ratio = 1.0001f64;
        let last_net: u32 = 1_000_000;
        let last_local = (last_net as f64 / ratio) as u32;

        let true_net = last_net + 60_000_000;
        let local_probe = (true_net as f64 / ratio) as u32;

        let naive = last_net.wrapping_add(local_probe.wrapping_sub(last_local));
        assert!((naive as i64 - true_net as i64).abs() > 1_000);
    }

    #[test]
    fn ntp_fraction_scale() {
        let mut ts = TimeSync::new(&cfg());
        ts.sync(
            5,
            1,
            0,
            0,
            0,
            0,
            NtpTimestamp {
                seconds: 1000,
                fraction: 0,
            },
        );
        ts.sync(
            5,
            1,
            0,
            1,
            1_000_000,
            1_000_000,
            NtpTimestamp {
                seconds: 1000,
                fraction: 0,
            },
        );

        let timer = MockTimer::new();
        // half a second past the sync point
        timer.set_us(1_500_000);
        let ntp = ts.ntp_time(&timer);

        assert_eq!(ntp.seconds, 1000);
        // 500000 us * 4294 ~= 2^31, within the documented 0.02 percent
        let expect = 0x8000_0000u32;
        let err = (ntp.fraction as i64 - expect as i64).abs();
        assert!(err < (expect as i64 / 1000) * 2);
    }

    #[test]
    fn timestamp_from_unsynced_peer_ignored() {
        let mut ts = TimeSync::new(&cfg());

        let msg = TimestampMsg {
            flags: TimeFlags::empty(),
            depth: 1,
            clk_source: 0,
            sequence: 0,
            timestamp: 1000,
            ntp_time: NtpTimestamp::default(),
        };
        let mut buf = [0u8; TimestampMsg::LEN];
        msg.encode(&mut buf);

        ts.receive_msg(5, &rx_options(500), &buf);
        assert!(ts.flags().is_empty());
    }

    #[test]
    fn request_queues_timestamp_tx() {
        let c = StackConfig {
            gateway: true,
            short_addr: 1,
            ..Default::default()
        };
        let mut ts = TimeSync::new(&c);
        assert!(ts.synced());

        ts.receive_msg(7, &rx_options(100), &[MSG_TYPE_REQUEST]);
        // duplicate requests collapse
        ts.receive_msg(7, &rx_options(101), &[MSG_TYPE_REQUEST]);
        assert_eq!(ts.pending_ts.len(), 1);

        let mut radio = MockRadio::new(3);
        let mut mac = Mac::new();
        mac.init_session(&mut radio);
        let crypto = Crypto::new(&c.auth_key);
        let timer = MockTimer::new();
        timer.set_us(5_000_000);

        ts.ts_tx_task(&mut radio, &mut mac, &crypto, &c, &timer);
        ts.ts_tx_task(&mut radio, &mut mac, &crypto, &c, &timer);
        assert_eq!(ts.pending_ts.len(), 0);

        let tx = radio.take_tx().unwrap();
        assert_eq!(tx.mode, TxMode::Basic);

        let parsed = crate::mac::frame::decode(&tx.data).unwrap();
        assert_eq!(parsed.protocol, Protocol::TimeSync);
        assert!(parsed.secured);

        let msg = TimestampMsg::decode(parsed.payload(&tx.data)).unwrap();
        assert!(msg.flags.contains(TimeFlags::SYNC));
        // the root offers depth 1 to its children
        assert_eq!(msg.depth, 1);
        // network time of the root tracks its local clock
        assert_eq!(msg.timestamp, 5_000_000);
    }

    #[test]
    fn sync_task_requires_synced_upstream() {
        let c = cfg();
        let mut ts = TimeSync::new(&c);
        let mut radio = MockRadio::new(3);
        let mut mac = Mac::new();
        mac.init_session(&mut radio);
        let crypto = Crypto::new(&c.auth_key);
        let mut neighbors = Neighbors::new(&c);
        let mut mem = Arena::new();
        let mut rng = MockRng(1);
        let timer = MockTimer::new();

        // no upstream: idles
        ts.sync_task(&mut mac, &mut mem, &crypto, &neighbors, &c, &mut rng, &timer);
        assert_eq!(mac.tx_q_len(), 0);

        // upstream present and time synced: a request goes out
        let rec = neighbors.test_install(9);
        rec.flags = NeighborFlags::UPSTREAM | NeighborFlags::TIME_SYNC;
        neighbors.test_set_upstream(9, 1);

        ts.sync_task(&mut mac, &mut mem, &crypto, &neighbors, &c, &mut rng, &timer);
        assert_eq!(mac.tx_q_len(), 1);
    }

    #[test]
    fn sync_loss_resets() {
        let c = cfg();
        let mut ts = TimeSync::new(&c);
        let mut radio = MockRadio::new(3);
        let mut mac = Mac::new();
        mac.init_session(&mut radio);
        let crypto = Crypto::new(&c.auth_key);
        let mut neighbors = Neighbors::new(&c);
        let mut mem = Arena::new();
        let mut rng = MockRng(1);
        let timer = MockTimer::new();

        let rec = neighbors.test_install(9);
        rec.flags = NeighborFlags::UPSTREAM | NeighborFlags::TIME_SYNC;
        neighbors.test_set_upstream(9, 1);

        // initial request, then two sync points
        ts.sync_task(&mut mac, &mut mem, &crypto, &neighbors, &c, &mut rng, &timer);
        ts.sync(9, 1, CLOCK_SOURCE_GATEWAY, 0, 0, 0, NtpTimestamp::default());
        ts.sync(9, 1, CLOCK_SOURCE_GATEWAY, 1, 1_000_000, 1_000_000, NtpTimestamp::default());
        assert!(ts.synced());

        // the last point ages beyond the loss window
        timer.set_us((SYNC_LOSS_SECONDS as u64 + 10) * 1_000_000 + 1_000_000);

        for _ in 0..4 {
            ts.sync_task(&mut mac, &mut mem, &crypto, &neighbors, &c, &mut rng, &timer);
        }
        assert!(!ts.synced());
    }
}
