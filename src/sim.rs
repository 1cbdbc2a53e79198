//! # Simulated Chain
//!
//! Bench stand-in for a chain of AD840x parts wired for loopback: MOSI into
//! the first device, each SDO into the next SDI, the last SDO back to MISO.
//! The whole chain behaves as one shift register of `10 * N` bits.
//!
//! Bus and pin handles share one state, so they can be handed to a
//! [`Daisychain`](crate::chain::Daisychain) while the test bench keeps the
//! [`SimulatedChain`] to inspect what was latched.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};
use log::trace;

use crate::wiper::{CommandWord, COMMAND_BITS, MID_SCALE};

/// Control lines of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Select,
    Shutdown,
    Reset,
}

#[derive(Debug)]
struct ChainState {
    devices: usize,
    shift: u128,
    selected: bool,
    shutdown: bool,
    miso_stuck: bool,
    wipers: Vec<Vec<u8>>,
    latches: usize,
}

impl ChainState {
    fn width(&self) -> usize {
        COMMAND_BITS * self.devices
    }

    fn clock_byte(&mut self, input: u8) -> u8 {
        if !self.selected {
            // Released chain ignores the clock; MISO idles high.
            return 0xFF;
        }
        let width = self.width();
        let mask = (1u128 << width) - 1;
        let mut output = 0u8;
        for bit in (0..8).rev() {
            let out = (self.shift >> (width - 1)) & 1;
            output = output << 1 | out as u8;
            self.shift = (self.shift << 1 | u128::from(input >> bit & 1)) & mask;
        }
        if self.miso_stuck {
            0xFF
        } else {
            output
        }
    }

    fn latch(&mut self) {
        for device in 0..self.devices {
            let shift = COMMAND_BITS * (self.devices - 1 - device);
            let word = CommandWord::from_bits((self.shift >> shift) as u16);
            if let Some(wiper) = self.wipers[device].get_mut(word.channel()) {
                *wiper = word.count();
            }
        }
        self.latches += 1;
        trace!("latched {:?}", self.wipers);
    }

    fn drive(&mut self, line: Line, asserted: bool) {
        match line {
            Line::Select => {
                if self.selected && !asserted {
                    self.latch();
                }
                self.selected = asserted;
            }
            Line::Shutdown => self.shutdown = asserted,
            Line::Reset => {
                if asserted {
                    self.wipers.iter_mut().for_each(|device| device.fill(MID_SCALE));
                }
            }
        }
    }
}

/// Chain of `devices` parts with `channels` wipers each.
#[derive(Debug, Clone)]
pub struct SimulatedChain {
    state: Rc<RefCell<ChainState>>,
}

impl SimulatedChain {
    pub fn new(devices: usize, channels: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(ChainState {
                devices,
                shift: 0,
                selected: false,
                shutdown: false,
                miso_stuck: false,
                wipers: vec![vec![MID_SCALE; channels]; devices],
                latches: 0,
            })),
        }
    }

    pub fn spi(&self) -> SimSpi {
        SimSpi {
            state: Rc::clone(&self.state),
        }
    }

    pub fn pin(&self, line: Line) -> SimPin {
        SimPin {
            line,
            state: Rc::clone(&self.state),
        }
    }

    /// Latched wiper counts, one row per device in bank order.
    pub fn wipers(&self) -> Vec<Vec<u8>> {
        self.state.borrow().wipers.clone()
    }

    /// Number of select releases seen while selected.
    pub fn latches(&self) -> usize {
        self.state.borrow().latches
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown
    }

    /// Breaks the return path: MISO reads high regardless of the chain.
    pub fn set_miso_stuck(&self, stuck: bool) {
        self.state.borrow_mut().miso_stuck = stuck;
    }
}

/// SPI bus handle into a [`SimulatedChain`].
#[derive(Debug)]
pub struct SimSpi {
    state: Rc<RefCell<ChainState>>,
}

impl spi::ErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for SimSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        for word in words.iter_mut() {
            *word = state.clock_byte(0x00);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        for &word in words {
            state.clock_byte(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        for i in 0..read.len().max(write.len()) {
            let received = state.clock_byte(write.get(i).copied().unwrap_or(0x00));
            if let Some(slot) = read.get_mut(i) {
                *slot = received;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        for word in words.iter_mut() {
            *word = state.clock_byte(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Control line handle into a [`SimulatedChain`]. Driving it low asserts the line.
#[derive(Debug)]
pub struct SimPin {
    line: Line,
    state: Rc<RefCell<ChainState>>,
}

impl digital::ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().drive(self.line, true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().drive(self.line, false);
        Ok(())
    }
}

/// Delay backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(u64::from(ns)));
    }
}
