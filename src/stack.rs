//! Stack assembly: shared context, scheduler wiring, receive dispatch
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use log::{error, warn};
use rand_core::RngCore;

use crate::crypto::Crypto;
use crate::error::StackError;
use crate::ipv4::{Ipv4, TIMEOUT_TICK_MS};
use crate::mac::{frame, Address, Mac, Protocol, RxOptions};
use crate::mem::Arena;
use crate::neighbor::Neighbors;
use crate::netmsg::{self, NetQueues, NetmsgFlags};
use crate::radio::{CcaMode, Mode, Radio, RxFrame, PLL_CAL_INTERVAL_MS};
use crate::route::Routing;
use crate::sched::{
    Disposition, GuardLevel, PassResult, Scheduler, Signals, TaskState, SIG_RF_RECEIVE,
};
use crate::socket::Sockets;
use crate::timer::Timer;
use crate::timesync::TimeSync;
use crate::{StackConfig, Warnings, BROADCAST_SHORT};

use smoltcp::wire::Ipv4Address;

/// All protocol state, shared by every task through disjoint borrows
pub struct Core<R, T, G> {
    pub cfg: StackConfig,
    pub warnings: Warnings,

    pub radio: R,
    pub timer: T,
    pub rng: G,

    pub mem: Arena,
    pub crypto: Crypto,

    pub mac: Mac,
    pub neighbors: Neighbors,
    pub ipv4: Ipv4,
    pub routes: Routing,
    pub timesync: TimeSync,
    pub netq: NetQueues,
    pub sockets: Sockets,
}

/// The assembled node: protocol state plus the cooperative scheduler
pub struct Stack<R, T, G> {
    pub core: Core<R, T, G>,
    sched: Scheduler<Core<R, T, G>>,
    signals: Signals,
}

impl<R, T, G> Stack<R, T, G>
where
    R: Radio,
    T: Timer,
    G: RngCore,
{
    pub fn new(cfg: StackConfig, mut radio: R, timer: T, mut rng: G) -> Result<Self, StackError<R::Error>> {
        radio
            .set_addresses(cfg.pan_id, cfg.short_addr, cfg.long_addr)
            .map_err(StackError::Radio)?;
        radio.set_channel(cfg.channel).map_err(StackError::Radio)?;
        radio
            .set_tx_power(cfg.tx_power.min(15))
            .map_err(StackError::Radio)?;
        radio
            .set_cca_mode(CcaMode::EnergyThreshold)
            .map_err(StackError::Radio)?;
        radio
            .set_be(cfg.min_be, cfg.max_be)
            .map_err(StackError::Radio)?;
        radio.set_csma_retries(4).map_err(StackError::Radio)?;
        radio
            .set_frame_retries(cfg.tx_sw_tries)
            .map_err(StackError::Radio)?;
        radio.set_mode(Mode::Normal).map_err(StackError::Radio)?;

        let crypto = Crypto::new(&cfg.auth_key);

        let mut mac = Mac::new();
        mac.init_session(&mut radio);

        let mut neighbors = Neighbors::new(&cfg);
        neighbors.seed_beacon_delay(rng.next_u32() & 0x3ff);

        let mut sockets = Sockets::new();
        let mut routes = Routing::new(&cfg);
        if routes.init(&mut sockets).is_err() {
            return Err(StackError::TableFull);
        }

        let timesync = TimeSync::new(&cfg);

        let mut s = Self {
            core: Core {
                cfg,
                warnings: Warnings::empty(),
                radio,
                timer,
                rng,
                mem: Arena::new(),
                crypto,
                mac,
                neighbors,
                ipv4: Ipv4::new(),
                routes,
                timesync,
                netq: NetQueues::new(),
                sockets,
            },
            sched: Scheduler::new(),
            signals: Signals::new(),
        };

        s.spawn_tasks();

        Ok(s)
    }

    fn spawn_tasks(&mut self) {
        let sched = &mut self.sched;

        // frames first, the receive signal preempts the pass order
        let _ = sched.spawn_with(
            rx_dispatch_task::<R, T, G>,
            "mac_receive",
            1 << SIG_RF_RECEIVE,
            None,
        );
        let _ = sched.spawn(mac_tx_task::<R, T, G>, "mac_transmit");

        let _ = sched.spawn(beacon_task::<R, T, G>, "neighbor_beacon");
        let _ = sched.spawn(join_timeout_task::<R, T, G>, "neighbor_join_timeout");
        let _ = sched.spawn(neighbor_monitor_task::<R, T, G>, "neighbor_monitor");

        let _ = sched.spawn(ipv4_tick_task::<R, T, G>, "ipv4_timeout");
        let _ = sched.spawn(ipv4_route_task::<R, T, G>, "ipv4_route");
        let _ = sched.spawn(ipv4_tx_task::<R, T, G>, "ipv4_transmit");

        let _ = sched.spawn(netmsg_tx_task::<R, T, G>, "netmsg_transmit");
        let _ = sched.spawn(netmsg_rx_task::<R, T, G>, "netmsg_receive");

        let _ = sched.spawn(route_server_task::<R, T, G>, "route_server");
        let _ = sched.spawn(route_discovery_task::<R, T, G>, "route_discovery");
        let _ = sched.spawn(route_age_task::<R, T, G>, "route_aging");

        let _ = sched.spawn(timesync_task::<R, T, G>, "time_sync");
        let _ = sched.spawn(timesync_tx_task::<R, T, G>, "time_sync_tx");

        let _ = sched.spawn(mem_gc_task::<R, T, G>, "mem_defrag");
        let _ = sched.spawn(pll_cal_task::<R, T, G>, "radio_pll_cal");
    }

    pub fn task_count(&self) -> usize {
        self.sched.task_count()
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    /// Run one scheduler pass. The caller may sleep the processor when
    /// the result reports no active task.
    pub fn poll(&mut self) -> PassResult {
        if self.core.radio.rx_pending() {
            self.signals.set(SIG_RF_RECEIVE);
        }

        let now = self.core.timer.ticks_ms();
        let result = self.sched.run(&mut self.core, now, &self.signals);
        self.sched.reap(&mut self.core.mem);

        if !self.core.radio.rx_pending() {
            self.signals.clear(SIG_RF_RECEIVE);
        }

        match result.guard {
            GuardLevel::Warn => warn!("stack watermark high"),
            GuardLevel::Fatal => error!("stack guard breached"),
            GuardLevel::Ok => (),
        }

        result
    }
}

/// Decode and dispatch one received frame
fn dispatch_frame<R: Radio, T: Timer, G: RngCore>(core: &mut Core<R, T, G>, rx: &RxFrame) {
    let data = rx.data();
    let parsed = match frame::decode(data) {
        Ok(p) => p,
        Err(_) => return,
    };

    // accept frames addressed to us or to broadcast
    let for_us = match parsed.addr.dest {
        Address::Short(d) => d == core.cfg.short_addr || d == BROADCAST_SHORT,
        Address::Long(l) => l == core.cfg.long_addr,
        Address::None => false,
    };
    if !for_us {
        return;
    }

    if !core.mac.filter_rx(&parsed) {
        return;
    }

    let source = parsed.addr.source.short();
    let options = RxOptions {
        protocol: parsed.protocol,
        security_enabled: parsed.secured,
        lqi: rx.lqi,
        ed: rx.ed,
        timestamp: rx.timestamp,
    };

    // session authentication for secured frames; IPv4 authenticates a
    // layer up, on the reassembled message
    if parsed.secured && parsed.protocol != Protocol::Ipv4 {
        let Core {
            crypto,
            neighbors,
            mac,
            ..
        } = core;
        let ok = neighbors.verify_session_msg(
            crypto,
            source,
            parsed.replay_counter,
            parsed.signed(data),
            parsed.tag(data),
        );
        if !ok {
            mac.stats_mut().auth_fails += 1;
            return;
        }
    }

    // every accepted frame feeds the link estimators
    let cfg = core.cfg.clone();
    core.neighbors.received_from(source, &options, &cfg);

    let time_synced = core.timesync.synced();
    let now = core.timer.ticks_ms();
    let payload = parsed.payload(data);

    match parsed.protocol {
        Protocol::Ipv4 => {
            // only established neighbors may inject traffic
            if !core.neighbors.is_neighbor(source) {
                return;
            }
            let Core {
                mem,
                crypto,
                mac,
                neighbors,
                routes,
                sockets,
                netq,
                warnings,
                cfg,
                ipv4,
                ..
            } = core;
            ipv4.process_fragment(
                mem, crypto, mac, neighbors, routes, sockets, netq, warnings, cfg, source, payload,
            );
        }
        Protocol::Neighbor => {
            let Core {
                mem,
                crypto,
                mac,
                neighbors,
                cfg,
                rng,
                ..
            } = core;
            neighbors.receive_msg(
                mac,
                mem,
                crypto,
                cfg,
                rng,
                time_synced,
                now,
                source,
                payload,
            );
        }
        Protocol::TimeSync => core.timesync.receive_msg(source, &options, payload),
        Protocol::Raw => (),
    }
}

// task bodies

fn rx_dispatch_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let mut active = false;

    while let Some(frame) = core.radio.take_received() {
        active = true;
        dispatch_frame(core, &frame);
    }

    if active {
        Disposition::Yield
    } else {
        Disposition::Wait
    }
}

fn mac_tx_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        mac,
        radio,
        timer,
        neighbors,
        mem,
        cfg,
        ..
    } = core;
    mac.pump_tx(radio, timer, neighbors, mem, cfg)
}

fn beacon_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        neighbors,
        radio,
        mac,
        mem,
        crypto,
        cfg,
        rng,
        timer,
        timesync,
        ..
    } = core;
    neighbors.beacon_task(radio, mac, mem, crypto, cfg, rng, timer, timesync.synced())
}

fn join_timeout_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    core.neighbors.join_timeout_task(&core.timer)
}

fn neighbor_monitor_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        neighbors,
        mac,
        mem,
        crypto,
        cfg,
        timer,
        timesync,
        ..
    } = core;
    neighbors.monitor_task(mac, mem, crypto, cfg, timer, timesync.synced())
}

fn ipv4_tick_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let _ = core.ipv4.tick_task(&mut core.mem);
    Disposition::TimedWait(core.timer.ticks_ms().wrapping_add(TIMEOUT_TICK_MS))
}

fn ipv4_route_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        ipv4,
        mem,
        crypto,
        mac,
        neighbors,
        routes,
        netq,
        warnings,
        cfg,
        ..
    } = core;
    ipv4.route_task(mem, crypto, mac, neighbors, routes, netq, warnings, cfg)
}

fn ipv4_tx_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        ipv4,
        mem,
        crypto,
        mac,
        cfg,
        ..
    } = core;
    ipv4.pump_tx(mem, crypto, mac, cfg)
}

fn netmsg_tx_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let msg = match core.netq.pop_tx() {
        Some(m) => m,
        None => return Disposition::Wait,
    };

    let dest = {
        let data = core.netq.data(&core.mem, msg);
        if data.len() < 20 {
            core.netq.release(&mut core.mem, msg);
            return Disposition::Yield;
        }
        Ipv4Address::from_bytes(&data[16..20])
    };

    let loopback = dest == core.cfg.ip || dest.as_bytes()[0] == 127;

    if loopback {
        let Core {
            netq,
            mem,
            sockets,
            cfg,
            warnings,
            ..
        } = core;
        netmsg::local_receive(netq, mem, sockets, cfg, warnings, msg);
    } else if !core
        .netq
        .flags(&core.mem, msg)
        .contains(NetmsgFlags::NO_WIRELESS)
    {
        let Core {
            ipv4,
            mem,
            crypto,
            mac,
            neighbors,
            routes,
            netq,
            warnings,
            cfg,
            ..
        } = core;
        let _ = ipv4.send_packet(mem, crypto, mac, neighbors, routes, netq, warnings, cfg, msg);
    }

    core.netq.release(&mut core.mem, msg);
    Disposition::Yield
}

fn netmsg_rx_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let msg = match core.netq.pop_rx() {
        Some(m) => m,
        None => return Disposition::Wait,
    };

    {
        let Core {
            netq,
            mem,
            sockets,
            cfg,
            warnings,
            ..
        } = core;
        netmsg::local_receive(netq, mem, sockets, cfg, warnings, msg);
    }

    core.netq.release(&mut core.mem, msg);
    Disposition::Yield
}

fn route_server_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        routes,
        mem,
        netq,
        warnings,
        cfg,
        sockets,
        neighbors,
        ..
    } = core;
    routes.server_task(mem, netq, warnings, cfg, sockets, neighbors)
}

fn route_discovery_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        routes,
        mem,
        netq,
        warnings,
        cfg,
        sockets,
        rng,
        timer,
        ..
    } = core;
    routes.discovery_task(mem, netq, warnings, cfg, sockets, rng, timer)
}

fn route_age_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    core.routes.age_task(&core.neighbors, &core.timer)
}

fn timesync_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        timesync,
        mac,
        mem,
        crypto,
        neighbors,
        cfg,
        rng,
        timer,
        ..
    } = core;
    timesync.sync_task(mac, mem, crypto, neighbors, cfg, rng, timer)
}

fn timesync_tx_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let Core {
        timesync,
        radio,
        mac,
        crypto,
        cfg,
        timer,
        ..
    } = core;
    timesync.ts_tx_task(radio, mac, crypto, cfg, timer)
}

fn mem_gc_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    if core.mem.needs_compaction() {
        if core.mem.compact().is_err() {
            error!("arena corruption detected");
        }
    }
    Disposition::Wait
}

fn pll_cal_task<R: Radio, T: Timer, G: RngCore>(
    core: &mut Core<R, T, G>,
    _task: &mut TaskState,
) -> Disposition {
    let _ = core.radio.calibrate_pll();
    Disposition::TimedWait(core.timer.ticks_ms().wrapping_add(PLL_CAL_INTERVAL_MS))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::radio::mock::{MockRadio, MockRng};
    use crate::timer::mock::MockTimer;

    fn stack(short: u16, ip_last: u8, gateway: bool) -> (Stack<MockRadio, MockTimer, MockRng>, MockRadio, MockTimer) {
        let cfg = StackConfig {
            short_addr: short,
            long_addr: 0x1122_3344_0000_0000 | short as u64,
            ip: Ipv4Address::new(10, 0, 0, ip_last),
            gateway,
            ..Default::default()
        };
        let radio = MockRadio::new(short as u32 * 77 + 1);
        let timer = MockTimer::new();

        let stack = Stack::new(cfg, radio.clone(), timer.clone(), MockRng(short as u64 + 1)).unwrap();
        (stack, radio, timer)
    }

    #[test]
    fn construction_spawns_tasks() {
        let (stack, _radio, _timer) = stack(1, 1, false);
        assert_eq!(stack.task_count(), 17);
    }

    #[test]
    fn poll_is_quiescent_without_work() {
        let (mut stack, _radio, timer) = stack(1, 1, false);

        // settle startup activity
        for _ in 0..32 {
            stack.poll();
            timer.advance_ms(10);
        }

        // between beacons nothing should want the processor awake
        let result = stack.poll();
        assert_eq!(result.guard, GuardLevel::Ok);
    }

    #[test]
    fn orphan_scans_channels() {
        let (mut stack, radio, timer) = stack(1, 1, false);

        let start = radio.channel();
        let mut hops = 0;

        for _ in 0..2000 {
            stack.poll();
            timer.advance_ms(5);
            if radio.channel() != start {
                hops += 1;
                break;
            }
        }
        assert!(hops > 0, "channel scan never advanced");
        // scan beacons were broadcast
        assert!(radio.tx_count() > 0);
    }

    #[test]
    fn gateway_beacons_on_fixed_channel() {
        let (mut stack, radio, timer) = stack(0x10, 10, true);

        for _ in 0..2000 {
            stack.poll();
            timer.advance_ms(5);
        }

        assert_eq!(radio.channel(), stack.core.cfg.channel);
        assert!(radio.tx_count() > 0);

        // all transmissions are beacons from the parked sender
        let tx = radio.take_tx().unwrap();
        let parsed = frame::decode(&tx.data).unwrap();
        assert_eq!(parsed.protocol, Protocol::Neighbor);
        assert_eq!(parsed.addr.dest, Address::Short(BROADCAST_SHORT));
    }

    #[test]
    fn pll_calibration_interval() {
        let (mut stack, radio, timer) = stack(1, 1, false);

        stack.poll();
        let initial = radio.pll_cals();

        timer.advance_ms(PLL_CAL_INTERVAL_MS + 100);
        stack.poll();
        assert_eq!(radio.pll_cals(), initial + 1);
    }
}
