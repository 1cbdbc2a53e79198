//! # Wiper Bank
//!
//! Shadow state of one AD840x digipot. The parts cannot be read back, so the
//! last requested count of every channel is kept here together with the
//! 10-bit command word that sets it and the resistances it produces.
//!
//! Each command word is composed as follows, sent MSB first:
//!
//! * bits 9..8: channel address `[A1, A0]`
//! * bits 7..0: wiper count `[D7 .. D0]`

use std::fmt;

use crate::resistance::{self, ModelError, Terminal, Topology, WiperOhms};

/// Width of one command word on the wire.
pub const COMMAND_BITS: usize = 10;

/// Highest channel count addressable by the 2-bit address field.
pub const MAX_CHANNELS: usize = 4;

/// Wiper count every channel takes after a reset.
pub const MID_SCALE: u8 = 0x80;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum WiperError {
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Neither one value for all channels nor one value per channel.
    #[error("{values} values given for {channels} channels")]
    ValueCount { values: usize, channels: usize },
}

/// 10-bit register write for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandWord(u16);

impl CommandWord {
    const MASK: u16 = 0x3ff;

    pub fn new(channel: usize, count: u8) -> Self {
        // Only the low two bits of the channel reach the address field.
        let address = (channel & 0x3) as u16;
        Self(address << 8 | u16::from(count))
    }

    /// Rebuilds a word from raw bits, ignoring anything above bit 9.
    pub fn from_bits(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn channel(self) -> usize {
        usize::from(self.0 >> 8)
    }

    pub fn count(self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Display for CommandWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.v{}", self.channel(), self.count())
    }
}

/// Selection of channels for an operation.
///
/// Indices outside the device are dropped when the selection is resolved,
/// so a partial list aimed at a wider part quietly applies to what exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Channels {
    #[default]
    All,
    /// A single channel. Naming the channel count itself means all channels.
    One(usize),
    List(Vec<usize>),
}

impl Channels {
    /// Channels as requested, before dropping the ones the device lacks.
    fn requested(&self, width: usize) -> Vec<usize> {
        match self {
            Channels::All => (0..width).collect(),
            Channels::One(channel) if *channel == width => (0..width).collect(),
            Channels::One(channel) => vec![*channel],
            Channels::List(list) => list.clone(),
        }
    }

    /// Channel indices present on a device with `width` channels, in request order.
    pub fn resolve(&self, width: usize) -> Vec<usize> {
        self.requested(width)
            .into_iter()
            .filter(|&channel| channel < width)
            .collect()
    }
}

impl From<usize> for Channels {
    fn from(channel: usize) -> Self {
        Channels::One(channel)
    }
}

impl From<Vec<usize>> for Channels {
    fn from(list: Vec<usize>) -> Self {
        Channels::List(list)
    }
}

/// Shadow of one multi-channel digipot.
#[derive(Debug, Clone, PartialEq)]
pub struct Digipot {
    r_total: f64,
    r_wiper: f64,
    // Wiper counts, 0 to 255.
    counts: Vec<u8>,
    // Command words matching `counts`.
    commands: Vec<CommandWord>,
    // Resistances matching `counts`.
    ohms: Vec<WiperOhms>,
}

impl Digipot {
    /// Creates a digipot with every wiper at mid-scale, as after a reset.
    pub fn new(channels: usize, r_total: f64, r_wiper: f64) -> Self {
        let mut pot = Self {
            r_total,
            r_wiper,
            counts: Vec::new(),
            commands: Vec::new(),
            ohms: Vec::new(),
        };
        // Mid-scale is always a valid count.
        let ohms = resistance::wiper_ohms(u32::from(MID_SCALE), r_total, r_wiper).unwrap_or_default();
        for channel in 0..channels {
            pot.counts.push(MID_SCALE);
            pot.commands.push(CommandWord::new(channel, MID_SCALE));
            pot.ohms.push(ohms);
        }
        pot
    }

    pub fn width(&self) -> usize {
        self.counts.len()
    }

    pub fn counts(&self) -> &[u8] {
        &self.counts
    }

    pub fn count(&self, channel: usize) -> Option<u8> {
        self.counts.get(channel).copied()
    }

    pub fn command(&self, channel: usize) -> Option<CommandWord> {
        self.commands.get(channel).copied()
    }

    /// Sets wiper counts and their command words for the selected channels.
    ///
    /// `values` holds either one count for every selected channel or one count
    /// per requested channel, paired in order. Requested channels the device
    /// does not have are skipped along with their value. Nothing changes when
    /// any value is out of range.
    pub fn set_counts(&mut self, values: &[u32], channels: &Channels) -> Result<(), WiperError> {
        let requested = channels.requested(self.width());
        let paired: Vec<(usize, u32)> = match values {
            [value] => requested.iter().map(|&channel| (channel, *value)).collect(),
            _ if values.len() == requested.len() => requested.iter().copied().zip(values.iter().copied()).collect(),
            _ => {
                return Err(WiperError::ValueCount {
                    values: values.len(),
                    channels: requested.len(),
                })
            }
        };

        let mut updates = Vec::with_capacity(paired.len());
        for (channel, value) in paired.into_iter().filter(|&(channel, _)| channel < self.width()) {
            let ohms = resistance::wiper_ohms(value, self.r_total, self.r_wiper)?;
            updates.push((channel, value as u8, ohms));
        }
        for (channel, count, ohms) in updates {
            self.counts[channel] = count;
            self.commands[channel] = CommandWord::new(channel, count);
            self.ohms[channel] = ohms;
        }
        Ok(())
    }

    /// Cached resistance of one channel, as of the last `set_counts`.
    pub fn channel_ohms(&self, channel: usize, terminal: Terminal) -> Option<f64> {
        self.ohms.get(channel).map(|ohms| ohms.at(terminal))
    }

    /// Resistance of the selected channels wired together at one terminal.
    pub fn combined(&self, channels: &Channels, topology: Topology, terminal: Terminal) -> Result<f64, ModelError> {
        let values: Vec<f64> = channels
            .resolve(self.width())
            .into_iter()
            .map(|channel| self.ohms[channel].at(terminal))
            .collect();
        resistance::combine(&values, topology)
    }
}
