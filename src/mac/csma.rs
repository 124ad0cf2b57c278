//! Adaptive CSMA backoff
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

// The local backoff exponent is tracked on a finer grid than the
// hardware BE (resolution steps per exponent). CCA failures push it up,
// successful transmissions pull it down.

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Minimum backoff exponent
    pub min_be: u8,
    /// Maximum backoff exponent
    pub max_be: u8,
    /// Grid steps per exponent
    pub resolution: u8,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_be: 3,
            max_be: 8,
            resolution: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBackoff {
    config: BackoffConfig,
    local_be: u8,
}

impl AdaptiveBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let local_be = config.min_be * config.resolution;
        Self { config, local_be }
    }

    fn floor(&self) -> u8 {
        self.config.min_be * self.config.resolution
    }

    fn ceiling(&self) -> u8 {
        (self.config.max_be + 1) * self.config.resolution - 1
    }

    /// Exponent programmed into the transceiver
    pub fn hardware_be(&self) -> u8 {
        self.local_be / self.config.resolution
    }

    /// Raw grid value
    pub fn raw(&self) -> u8 {
        self.local_be
    }

    pub fn on_tx_ok(&mut self) {
        if self.local_be > self.floor() {
            self.local_be -= 1;
        }
    }

    pub fn on_cca_failure(&mut self) {
        if self.local_be < self.ceiling() {
            self.local_be += 1;
        }
    }
}
