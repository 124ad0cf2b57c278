//! 802.15.4 transceiver abstraction
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

/// Maximum PHY frame size in bytes, including the FCS
pub const MAX_FRAME_SIZE: usize = 127;

pub const LOWEST_CHANNEL: u8 = 11;
pub const HIGHEST_CHANNEL: u8 = 26;

/// Receive ring depth
pub const RX_RING_SIZE: usize = 4;

/// PLL calibration interval in milliseconds
pub const PLL_CAL_INTERVAL_MS: u32 = 30_000;

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Normal,
    Promiscuous,
    TxOnly,
    Sleep,
}

/// Clear channel assessment modes
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CcaMode {
    EnergyThreshold,
    CarrierSense,
    ThresholdAndCarrierSense,
}

/// Transmit arbitration modes
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxMode {
    /// Hardware CSMA backoff and frame retries
    AutoRetry,
    /// Single shot, no CCA, no retry
    Basic,
}

/// Latched transmit completion status
#[derive(Copy, Clone, Debug, PartialEq, strum::Display)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    Ok,
    Busy,
    NoAck,
    CcaFailed,
}

/// Received frame with PHY metadata, filled from interrupt context
#[derive(Clone, Debug)]
pub struct RxFrame {
    pub len: u8,
    pub lqi: u8,
    pub ed: u8,
    /// Arrival timestamp in microseconds, latched in the receive ISR
    pub timestamp: u32,
    pub data: [u8; MAX_FRAME_SIZE],
}

impl RxFrame {
    pub fn new(data: &[u8], lqi: u8, ed: u8, timestamp: u32) -> Self {
        let mut f = RxFrame {
            len: data.len() as u8,
            lqi,
            ed,
            timestamp,
            data: [0u8; MAX_FRAME_SIZE],
        };
        f.data[..data.len()].copy_from_slice(data);
        f
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Radio interface required by the stack.
///
/// The driver owns a small receive ring; frames are tagged with LQI, ED
/// and the arrival microsecond timestamp. A "frame received" wake is
/// reported through `rx_pending`.
pub trait Radio {
    type Error: core::fmt::Debug;

    fn set_mode(&mut self, mode: Mode) -> Result<(), Self::Error>;
    fn set_channel(&mut self, channel: u8) -> Result<(), Self::Error>;
    fn channel(&self) -> u8;
    fn set_addresses(&mut self, pan_id: u16, short: u16, long: u64) -> Result<(), Self::Error>;

    fn set_tx_power(&mut self, power: u8) -> Result<(), Self::Error>;
    fn set_cca_mode(&mut self, mode: CcaMode) -> Result<(), Self::Error>;
    fn set_be(&mut self, min_be: u8, max_be: u8) -> Result<(), Self::Error>;
    fn set_csma_retries(&mut self, retries: u8) -> Result<(), Self::Error>;
    fn set_frame_retries(&mut self, retries: u8) -> Result<(), Self::Error>;

    /// Request the transmitter. Returns `Busy` while a prior
    /// transmission is still in flight.
    fn request_tx_mode(&mut self, mode: TxMode) -> Result<(), Self::Error>;
    fn write_frame(&mut self, data: &[u8]) -> Result<(), Self::Error>;
    fn transmit(&mut self) -> Result<(), Self::Error>;
    /// Latched status of the last transmission
    fn tx_status(&self) -> TxStatus;

    /// True when the receive ring holds at least one frame
    fn rx_pending(&self) -> bool;
    /// Pop the oldest received frame from the ring
    fn take_received(&mut self) -> Option<RxFrame>;

    fn sleep(&mut self) -> Result<(), Self::Error>;
    fn wake(&mut self) -> Result<(), Self::Error>;

    /// Hardware entropy, used for CSMA seeding and challenge nonces
    fn random_byte(&mut self) -> u8;

    fn calibrate_pll(&mut self) -> Result<(), Self::Error>;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::*;
    use std::rc::Rc;
    use core::cell::RefCell;
    use std::vec::Vec;
    use std::collections::VecDeque;

    /// A transmitted frame captured by the mock
    #[derive(Clone, Debug)]
    pub struct TxRecord {
        pub channel: u8,
        pub mode: TxMode,
        pub data: Vec<u8>,
    }

    struct Shared {
        channel: u8,
        mode: Mode,
        tx_mode: Option<TxMode>,
        tx_status: TxStatus,
        /// Scripted status for upcoming transmissions, `Ok` when drained
        tx_script: VecDeque<TxStatus>,
        pending_tx: Vec<u8>,
        tx_log: VecDeque<TxRecord>,
        rx_ring: VecDeque<RxFrame>,
        rng: u32,
        pll_cals: u32,
    }

    /// Scriptable radio double. Clones share state so a test harness can
    /// inject receive frames and drain transmissions while the stack
    /// holds its own copy.
    #[derive(Clone)]
    pub struct MockRadio(Rc<RefCell<Shared>>);

    impl MockRadio {
        pub fn new(seed: u32) -> Self {
            MockRadio(Rc::new(RefCell::new(Shared {
                channel: LOWEST_CHANNEL,
                mode: Mode::Normal,
                tx_mode: None,
                tx_status: TxStatus::Ok,
                tx_script: VecDeque::new(),
                pending_tx: Vec::new(),
                tx_log: VecDeque::new(),
                rx_ring: VecDeque::new(),
                rng: seed | 1,
                pll_cals: 0,
            })))
        }

        /// Queue a status for the next transmission
        pub fn script_tx_status(&self, status: TxStatus) {
            self.0.borrow_mut().tx_script.push_back(status);
        }

        /// Pop the oldest captured transmission
        pub fn take_tx(&self) -> Option<TxRecord> {
            self.0.borrow_mut().tx_log.pop_front()
        }

        pub fn tx_count(&self) -> usize {
            self.0.borrow().tx_log.len()
        }

        /// Inject a received frame, dropped when the ring is full
        pub fn inject_rx(&self, frame: RxFrame) {
            let mut s = self.0.borrow_mut();
            if s.rx_ring.len() < RX_RING_SIZE {
                s.rx_ring.push_back(frame);
            }
        }

        pub fn pll_cals(&self) -> u32 {
            self.0.borrow().pll_cals
        }
    }

    impl Radio for MockRadio {
        type Error = ();

        fn set_mode(&mut self, mode: Mode) -> Result<(), ()> {
            self.0.borrow_mut().mode = mode;
            Ok(())
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), ()> {
            self.0.borrow_mut().channel = channel;
            Ok(())
        }

        fn channel(&self) -> u8 {
            self.0.borrow().channel
        }

        fn set_addresses(&mut self, _pan: u16, _short: u16, _long: u64) -> Result<(), ()> {
            Ok(())
        }

        fn set_tx_power(&mut self, _power: u8) -> Result<(), ()> {
            Ok(())
        }

        fn set_cca_mode(&mut self, _mode: CcaMode) -> Result<(), ()> {
            Ok(())
        }

        fn set_be(&mut self, _min: u8, _max: u8) -> Result<(), ()> {
            Ok(())
        }

        fn set_csma_retries(&mut self, _retries: u8) -> Result<(), ()> {
            Ok(())
        }

        fn set_frame_retries(&mut self, _retries: u8) -> Result<(), ()> {
            Ok(())
        }

        fn request_tx_mode(&mut self, mode: TxMode) -> Result<(), ()> {
            let mut s = self.0.borrow_mut();
            if s.tx_mode.is_some() {
                return Err(());
            }
            s.tx_mode = Some(mode);
            Ok(())
        }

        fn write_frame(&mut self, data: &[u8]) -> Result<(), ()> {
            let mut s = self.0.borrow_mut();
            s.pending_tx.clear();
            s.pending_tx.extend_from_slice(data);
            Ok(())
        }

        fn transmit(&mut self) -> Result<(), ()> {
            let mut s = self.0.borrow_mut();
            let mode = s.tx_mode.take().unwrap_or(TxMode::Basic);
            let data = core::mem::replace(&mut s.pending_tx, Vec::new());
            let channel = s.channel;
            s.tx_log.push_back(TxRecord { channel, mode, data });
            s.tx_status = s.tx_script.pop_front().unwrap_or(TxStatus::Ok);
            Ok(())
        }

        fn tx_status(&self) -> TxStatus {
            self.0.borrow().tx_status
        }

        fn rx_pending(&self) -> bool {
            !self.0.borrow().rx_ring.is_empty()
        }

        fn take_received(&mut self) -> Option<RxFrame> {
            self.0.borrow_mut().rx_ring.pop_front()
        }

        fn sleep(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().mode = Mode::Sleep;
            Ok(())
        }

        fn wake(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().mode = Mode::Normal;
            Ok(())
        }

        fn random_byte(&mut self) -> u8 {
            let mut s = self.0.borrow_mut();
            // xorshift32
            let mut x = s.rng;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            s.rng = x;
            x as u8
        }

        fn calibrate_pll(&mut self) -> Result<(), ()> {
            self.0.borrow_mut().pll_cals += 1;
            Ok(())
        }
    }

    /// Deterministic xorshift RNG for tests
    pub struct MockRng(pub u64);

    impl rand_core::RngCore for MockRng {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for chunk in dest.chunks_mut(8) {
                let v = self.next_u64().to_le_bytes();
                chunk.copy_from_slice(&v[..chunk.len()]);
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }
}
