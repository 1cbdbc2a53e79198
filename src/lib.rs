//! # TraceR Library
//!
//! This library contains the core logic of the TraceR resistance emulator.
//! A chain of AD840x digipots is driven over SPI with loopback verification,
//! their wiper counts are turned into ohms, calibration tables map requested
//! resistances onto verified register settings, and a character-driven
//! interpreter exposes all of it on an operator console.

pub mod calibration;
pub mod chain;
pub mod config;
pub mod instrument;
pub mod interpreter;
pub mod panel;
pub mod resistance;
pub mod sim;
pub mod wiper;

pub use calibration::{CalibrationRow, CalibrationTable, LoadError, LookupError};
pub use chain::{ChainError, ChainStatus, ChainTransport, Daisychain};
pub use config::{ConfigError, InstrumentConfig};
pub use instrument::{Instrument, InstrumentError};
pub use interpreter::{Action, InputError, Interpreter, State};
pub use panel::{FrontPanel, Oled, PanelFrame, RelayState};
pub use resistance::{ModelError, Terminal, Topology};
pub use wiper::{Channels, CommandWord, Digipot, WiperError};
