//! Instrument configuration.

use crate::chain::MAX_DEVICES;
use crate::wiper::MAX_CHANNELS;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("device count {0} is outside 1..=12")]
    Devices(usize),
    #[error("channel count {0} is outside 1..=4")]
    Channels(usize),
    #[error("total resistance {0} must be positive")]
    TotalOhms(f64),
    #[error("wiper resistance {0} must not be negative")]
    WiperOhms(f64),
}

/// Shape and ratings of the digipot chain.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    /// Digipots in the chain, also the number of relays and calibration slots.
    pub devices: usize,
    /// Wipers per digipot.
    pub channels: usize,
    /// End-to-end resistance of one channel.
    pub r_total: f64,
    /// Wiper contact resistance.
    pub r_wiper: f64,
}

impl Default for InstrumentConfig {
    // Two AD8403-1 parts: four 1 kOhm channels each.
    fn default() -> Self {
        Self {
            devices: 2,
            channels: 4,
            r_total: 1000.0,
            r_wiper: 0.0,
        }
    }
}

impl InstrumentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DEVICES).contains(&self.devices) {
            return Err(ConfigError::Devices(self.devices));
        }
        if !(1..=MAX_CHANNELS).contains(&self.channels) {
            return Err(ConfigError::Channels(self.channels));
        }
        // Written so NaN fails too.
        if !(self.r_total > 0.0) {
            return Err(ConfigError::TotalOhms(self.r_total));
        }
        if !(self.r_wiper >= 0.0) {
            return Err(ConfigError::WiperOhms(self.r_wiper));
        }
        Ok(())
    }
}
