//! # Digipot Daisy Chain
//!
//! Writes wiper commands to a chain of AD840x digipots sharing one SPI bus
//! and checks that they were latched, using the only evidence the parts
//! give: the bits shifted out of the far end of the chain.
//!
//! The chain is driven with a select line that idles *asserted*. Releasing
//! select is what copies the shift registers into the wiper registers, and a
//! released chain ignores the bus entirely, so there is no way to shift the
//! previous command out without latching it. Every channel is written as:
//!
//! 1. shift in the combined command (what comes back is stale, discarded)
//! 2. pulse select released then asserted, latching the wipers
//! 3. shift in the same number of dummy bytes, capturing the loopback
//! 4. compare the loopback with the command
//!
//! The bus moves whole bytes, so a frame of `10 * N` bits travels with
//! `8 * bytes - 10 * N` padding bits. They lead the transmitted frame and
//! trail the loopback, where they are shifted away before comparing.

use std::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;
use log::{debug, warn};

use crate::wiper::{Channels, CommandWord, Digipot, COMMAND_BITS};

/// Longest chain whose frame fits in a `u128`.
pub const MAX_DEVICES: usize = 12;

/// Fill for the receive buffer of the command transfer.
const STALE_FILL: u8 = 0xAA;
/// Dummy bytes clocked out to read the loopback.
const LOOPBACK_PATTERN: u8 = 0x55;

/// Time reset is held, and time allowed after releasing it.
const RESET_PULSE_MS: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ChainError<S: fmt::Debug, P: fmt::Debug> {
    #[error("SPI transfer failed: {0:?}")]
    Spi(S),
    #[error("control line could not be driven: {0:?}")]
    Pin(P),
    #[error("a chain of {0} devices is not supported (1 to 12)")]
    Devices(usize),
    #[error("device {device} has no channel {channel}")]
    MissingChannel { device: usize, channel: usize },
}

/// Chain-wide command for one channel index, one word per device in bank order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinedCommand {
    bits: u128,
    devices: usize,
}

impl CombinedCommand {
    /// Concatenates the words, first word most significant.
    pub fn from_words(words: &[CommandWord]) -> Self {
        let bits = words
            .iter()
            .fold(0u128, |acc, word| acc << COMMAND_BITS | u128::from(word.bits()));
        Self {
            bits,
            devices: words.len(),
        }
    }

    /// Recovers a command from the bytes shifted out of the chain.
    pub fn from_loopback(received: &[u8], devices: usize) -> Self {
        let raw = received.iter().fold(0u128, |acc, &byte| acc << 8 | u128::from(byte));
        let padding = 8 * received.len() - (COMMAND_BITS * devices).min(8 * received.len());
        Self {
            bits: raw >> padding,
            devices,
        }
    }

    pub fn bits(&self) -> u128 {
        self.bits
    }

    pub fn width(&self) -> usize {
        COMMAND_BITS * self.devices
    }

    pub fn byte_len(&self) -> usize {
        self.width().div_ceil(8)
    }

    /// Bits of byte padding carried with the frame.
    pub fn padding_bits(&self) -> usize {
        8 * self.byte_len() - self.width()
    }

    /// Big-endian bytes, padding in the leading bits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let all = self.bits.to_be_bytes();
        all[all.len() - self.byte_len()..].to_vec()
    }

    /// Splits the frame back into per-device words, bank order.
    pub fn words(&self) -> Vec<CommandWord> {
        (0..self.devices)
            .map(|device| {
                let shift = COMMAND_BITS * (self.devices - 1 - device);
                CommandWord::from_bits((self.bits >> shift) as u16)
            })
            .collect()
    }
}

impl fmt::LowerHex for CombinedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.bits, f)
    }
}

/// Verification of one channel index across the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackCheck {
    pub channel: usize,
    pub command: CombinedCommand,
    pub loopback: CombinedCommand,
}

impl LoopbackCheck {
    pub fn mismatch(&self) -> bool {
        self.command != self.loopback
    }

    pub fn command_hex(&self) -> String {
        format!("{:#x}", self.command)
    }

    pub fn loopback_hex(&self) -> String {
        format!("{:#x}", self.loopback)
    }

    /// Devices whose loopback word differs from the command, bank order.
    pub fn mismatched_devices(&self) -> Vec<usize> {
        self.command
            .words()
            .into_iter()
            .zip(self.loopback.words())
            .enumerate()
            .filter(|(_, (sent, seen))| sent != seen)
            .map(|(device, _)| device)
            .collect()
    }
}

impl fmt::Display for LoopbackCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.mismatch() { "MISMATCH" } else { "ok" };
        write!(
            f,
            "ch{} {} cmd {} loopback {}",
            self.channel,
            verdict,
            self.command_hex(),
            self.loopback_hex()
        )?;
        if self.mismatch() {
            for device in self.mismatched_devices() {
                let sent = self.command.words()[device];
                let seen = self.loopback.words()[device];
                write!(f, " u{}.{sent} vs u{}.{seen}", device + 1, device + 1)?;
            }
        }
        Ok(())
    }
}

/// Outcome of one `send`, consumed by the caller.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChainStatus {
    pub checks: Vec<LoopbackCheck>,
}

impl ChainStatus {
    /// True when any channel's loopback disagreed with its command.
    pub fn mismatch(&self) -> bool {
        self.checks.iter().any(LoopbackCheck::mismatch)
    }

    pub fn mismatched_channels(&self) -> Vec<usize> {
        self.checks
            .iter()
            .filter(|check| check.mismatch())
            .map(|check| check.channel)
            .collect()
    }
}

/// Pushes the current command words of a bank of digipots onto the wire.
pub trait ChainTransport {
    type Error: fmt::Debug + fmt::Display;

    /// Brings the chain out of reset, ready to accept commands.
    fn power_up(&mut self) -> Result<(), Self::Error>;

    /// Writes and verifies the selected channels of every device, in
    /// ascending channel order. A loopback mismatch is reported in the
    /// returned status, never as an error.
    fn send(&mut self, pots: &[Digipot], channels: &Channels) -> Result<ChainStatus, Self::Error>;
}

/// Control line that is active when driven low.
#[derive(Debug)]
pub struct ActiveLow<P> {
    pin: P,
    asserted: bool,
}

impl<P: OutputPin> ActiveLow<P> {
    /// Wraps a pin and drives it to its released level.
    pub fn new(pin: P) -> Result<Self, P::Error> {
        let mut line = Self { pin, asserted: true };
        line.release()?;
        Ok(line)
    }

    pub fn assert(&mut self) -> Result<(), P::Error> {
        self.pin.set_low()?;
        self.asserted = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), P::Error> {
        self.pin.set_high()?;
        self.asserted = false;
        Ok(())
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }
}

/// Levels of the three chain control lines, true when asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineStates {
    pub select: bool,
    pub shutdown: bool,
    pub reset: bool,
}

/// AD840x chain on an SPI bus with shared select, shutdown and reset lines.
pub struct Daisychain<SPI, PIN, D> {
    spi: SPI,
    select: ActiveLow<PIN>,
    shutdown: ActiveLow<PIN>,
    reset: ActiveLow<PIN>,
    delay: D,
}

impl<SPI, PIN, D> Daisychain<SPI, PIN, D>
where
    SPI: SpiBus<u8>,
    PIN: OutputPin,
    D: DelayNs,
{
    /// Takes over the bus and lines, leaving every line released.
    pub fn new(
        spi: SPI,
        select: PIN,
        shutdown: PIN,
        reset: PIN,
        delay: D,
    ) -> Result<Self, ChainError<SPI::Error, PIN::Error>> {
        Ok(Self {
            spi,
            select: ActiveLow::new(select).map_err(ChainError::Pin)?,
            shutdown: ActiveLow::new(shutdown).map_err(ChainError::Pin)?,
            reset: ActiveLow::new(reset).map_err(ChainError::Pin)?,
            delay,
        })
    }

    pub fn select(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.select.assert().map_err(ChainError::Pin)
    }

    pub fn unselect(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.select.release().map_err(ChainError::Pin)
    }

    pub fn operate(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.shutdown.release().map_err(ChainError::Pin)
    }

    /// Opens terminal A and shorts B to the wiper on every channel.
    pub fn shutdown(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.shutdown.assert().map_err(ChainError::Pin)
    }

    /// Returns every wiper of every device to mid-scale.
    pub fn reset(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.reset.assert().map_err(ChainError::Pin)?;
        self.delay.delay_ms(RESET_PULSE_MS);
        self.reset.release().map_err(ChainError::Pin)?;
        self.delay.delay_ms(RESET_PULSE_MS);
        Ok(())
    }

    pub fn lines(&self) -> LineStates {
        LineStates {
            select: self.select.is_asserted(),
            shutdown: self.shutdown.is_asserted(),
            reset: self.reset.is_asserted(),
        }
    }

    fn exchange(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.spi.transfer(read, write).map_err(ChainError::Spi)?;
        self.spi.flush().map_err(ChainError::Spi)
    }

    fn latch(&mut self) -> Result<(), ChainError<SPI::Error, PIN::Error>> {
        self.unselect()?;
        self.select()
    }
}

impl<SPI, PIN, D> ChainTransport for Daisychain<SPI, PIN, D>
where
    SPI: SpiBus<u8>,
    PIN: OutputPin,
    D: DelayNs,
{
    type Error = ChainError<SPI::Error, PIN::Error>;

    /// Running, selected, wipers at mid-scale.
    fn power_up(&mut self) -> Result<(), Self::Error> {
        self.operate()?;
        self.select()?;
        self.reset()
    }

    fn send(&mut self, pots: &[Digipot], channels: &Channels) -> Result<ChainStatus, Self::Error> {
        if pots.is_empty() || pots.len() > MAX_DEVICES {
            return Err(ChainError::Devices(pots.len()));
        }
        let mut selected = channels.resolve(pots[0].width());
        selected.sort_unstable();
        selected.dedup();

        let mut status = ChainStatus::default();
        for channel in selected {
            let words = pots
                .iter()
                .enumerate()
                .map(|(device, pot)| pot.command(channel).ok_or(ChainError::MissingChannel { device, channel }))
                .collect::<Result<Vec<_>, _>>()?;
            let command = CombinedCommand::from_words(&words);
            let transmit = command.to_bytes();

            let mut stale = vec![STALE_FILL; transmit.len()];
            self.exchange(&mut stale, &transmit)?;
            debug!("ch{channel} xmt {transmit:02x?} rcv {stale:02x?}");

            self.latch()?;

            let dummy = vec![LOOPBACK_PATTERN; transmit.len()];
            let mut received = vec![0u8; transmit.len()];
            self.exchange(&mut received, &dummy)?;
            let loopback = CombinedCommand::from_loopback(&received, pots.len());
            debug!("ch{channel} cmd {command:#x} loopback {loopback:#x}");

            let check = LoopbackCheck {
                channel,
                command,
                loopback,
            };
            if check.mismatch() {
                warn!("loopback mismatch: {check}");
            }
            status.checks.push(check);
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use crate::sim::{Line, SimulatedChain, StdDelay};

    /// Bus that plays back every command frame on the following transfer,
    /// optionally flipping one bit of the n-th loopback.
    struct EchoBus {
        devices: usize,
        last: Vec<u8>,
        transfers: usize,
        corrupt: Option<(usize, u32)>,
    }

    impl EchoBus {
        fn new(devices: usize) -> Self {
            Self {
                devices,
                last: Vec::new(),
                transfers: 0,
                corrupt: None,
            }
        }
    }

    impl embedded_hal::spi::ErrorType for EchoBus {
        type Error = Infallible;
    }

    impl SpiBus<u8> for EchoBus {
        fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            words.fill(0xFF);
            Ok(())
        }

        fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
            self.transfers += 1;
            if self.transfers % 2 == 1 {
                self.last = write.to_vec();
                read.fill(0xFF);
                return Ok(());
            }
            let sent = self.last.iter().fold(0u128, |acc, &byte| acc << 8 | u128::from(byte));
            let padding = 8 * self.last.len() - COMMAND_BITS * self.devices;
            let mut echoed = sent << padding;
            if let Some((loopback, bit)) = self.corrupt {
                if self.transfers / 2 == loopback {
                    echoed ^= 1 << (bit as usize + padding);
                }
            }
            let bytes = echoed.to_be_bytes();
            read.copy_from_slice(&bytes[bytes.len() - read.len()..]);
            Ok(())
        }

        fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), Infallible> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct NoPin;

    impl embedded_hal::digital::ErrorType for NoPin {
        type Error = Infallible;
    }

    impl OutputPin for NoPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn echo_chain(bus: EchoBus) -> Daisychain<EchoBus, NoPin, NoDelay> {
        Daisychain::new(bus, NoPin, NoPin, NoPin, NoDelay).unwrap()
    }

    fn bank() -> Vec<Digipot> {
        let mut pots = vec![Digipot::new(4, 1000.0, 0.0), Digipot::new(4, 1000.0, 0.0)];
        pots[0].set_counts(&[0xC0], &Channels::All).unwrap();
        pots[1].set_counts(&[0x40], &Channels::All).unwrap();
        pots
    }

    // --- Tests for frame layout ---

    #[test]
    fn two_device_frame_layout() {
        let command = CombinedCommand::from_words(&[CommandWord::new(1, 0xC0), CommandWord::new(1, 0x40)]);
        assert_eq!(command.bits(), 0x1C0 << 10 | 0x140);
        assert_eq!(command.width(), 20);
        assert_eq!(command.byte_len(), 3);
        assert_eq!(command.padding_bits(), 4);
        assert_eq!(command.to_bytes(), vec![0x07, 0x01, 0x40]);
    }

    #[test]
    fn padding_follows_device_count() {
        let padding: Vec<usize> = (1..=MAX_DEVICES)
            .map(|devices| CombinedCommand::from_words(&vec![CommandWord::new(0, 0); devices]).padding_bits())
            .collect();
        assert_eq!(padding, vec![6, 4, 2, 0, 6, 4, 2, 0, 6, 4, 2, 0]);
    }

    #[test]
    fn loopback_discards_trailing_padding() {
        let command = CombinedCommand::from_words(&[CommandWord::new(2, 0x12), CommandWord::new(2, 0x34)]);
        let echoed = (command.bits() << 4 | 0x5).to_be_bytes();
        let loopback = CombinedCommand::from_loopback(&echoed[echoed.len() - 3..], 2);
        assert_eq!(loopback, command);
        assert_eq!(loopback.words(), vec![CommandWord::new(2, 0x12), CommandWord::new(2, 0x34)]);
    }

    // --- Tests for send ---

    #[test]
    fn exact_echo_verifies() {
        let mut chain = echo_chain(EchoBus::new(2));
        let status = chain.send(&bank(), &Channels::All).unwrap();
        assert!(!status.mismatch());
        assert_eq!(status.checks.len(), 4);
        assert_eq!(status.checks[2].command_hex(), "0xb0240");
        assert_eq!(status.checks[2].loopback_hex(), "0xb0240");
    }

    #[test]
    fn corrupted_echo_pinpoints_channel_and_device() {
        let mut bus = EchoBus::new(2);
        // Third loopback, bit 3 of the second device's word.
        bus.corrupt = Some((3, 3));
        let mut chain = echo_chain(bus);
        let status = chain.send(&bank(), &Channels::All).unwrap();
        assert!(status.mismatch());
        assert_eq!(status.mismatched_channels(), vec![2]);
        assert_eq!(status.checks[2].mismatched_devices(), vec![1]);
        assert!(status.checks[2].to_string().contains("u2.w2.v64 vs u2.w2.v72"), "{}", status.checks[2]);
    }

    #[test]
    fn channels_go_out_in_ascending_order() {
        let mut chain = echo_chain(EchoBus::new(2));
        let status = chain.send(&bank(), &Channels::List(vec![3, 1, 9, 1])).unwrap();
        let order: Vec<usize> = status.checks.iter().map(|check| check.channel).collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn empty_bank_is_rejected() {
        let mut chain = echo_chain(EchoBus::new(2));
        assert!(matches!(chain.send(&[], &Channels::All), Err(ChainError::Devices(0))));
    }

    #[test]
    fn simulated_chain_latches_and_verifies() {
        let sim = SimulatedChain::new(2, 4);
        let mut chain = Daisychain::new(
            sim.spi(),
            sim.pin(Line::Select),
            sim.pin(Line::Shutdown),
            sim.pin(Line::Reset),
            StdDelay,
        )
        .unwrap();
        chain.power_up().unwrap();
        assert_eq!(
            chain.lines(),
            LineStates {
                select: true,
                shutdown: false,
                reset: false
            }
        );

        let mut pots = bank();
        pots[1].set_counts(&[1, 2, 3, 4], &Channels::All).unwrap();
        let status = chain.send(&pots, &Channels::All).unwrap();
        assert!(!status.mismatch(), "{status:?}");
        assert_eq!(sim.wipers(), vec![vec![0xC0; 4], vec![1, 2, 3, 4]]);
        assert_eq!(sim.latches(), 4);

        chain.reset().unwrap();
        assert_eq!(sim.wipers(), vec![vec![0x80; 4], vec![0x80; 4]]);
    }

    #[test]
    fn shutdown_and_operate_drive_the_shutdown_line() {
        let sim = SimulatedChain::new(2, 4);
        let mut chain = Daisychain::new(
            sim.spi(),
            sim.pin(Line::Select),
            sim.pin(Line::Shutdown),
            sim.pin(Line::Reset),
            StdDelay,
        )
        .unwrap();
        chain.power_up().unwrap();
        assert!(!sim.is_shutdown());

        chain.shutdown().unwrap();
        assert!(sim.is_shutdown());
        assert!(chain.lines().shutdown);

        chain.operate().unwrap();
        assert!(!sim.is_shutdown());
        assert!(!chain.lines().shutdown);
        assert!(chain.lines().select);
    }

    #[test]
    fn unselected_chain_fails_verification() {
        let sim = SimulatedChain::new(2, 4);
        let mut chain = Daisychain::new(
            sim.spi(),
            sim.pin(Line::Select),
            sim.pin(Line::Shutdown),
            sim.pin(Line::Reset),
            StdDelay,
        )
        .unwrap();
        // Skipping power-up leaves select released, the chain never hears us.
        let status = chain.send(&bank(), &Channels::One(0)).unwrap();
        assert!(status.mismatch());
    }
}
