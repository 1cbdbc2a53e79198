//! # Instrument
//!
//! The TraceR as a whole: the digipot bank, its shunt relays, the calibration
//! tables and the chain they are written through, owned by one context
//! object. The interpreter decides *what* to do with each keystroke; this
//! module does it and renders the console text.

use std::fmt;
use std::path::Path;

use log::{info, warn};

use crate::calibration::{CalibrationRow, CalibrationTable};
use crate::chain::{ChainStatus, ChainTransport};
use crate::config::{ConfigError, InstrumentConfig};
use crate::interpreter::{Action, InputError, Interpreter, Surface, Verb};
use crate::panel::{FrontPanel, PanelFrame, RelayState};
use crate::resistance::{Terminal, Topology};
use crate::wiper::{Channels, Digipot};

pub const NAME: &str = "TraceR";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const PROMPT: &str = "\n> ";

const HELP: &str = "
X<n>=<0-255>  set every wiper of device n
K<n>=<0|1>    open or shunt relay n
R<n>=<0-300>  apply calibrated ohms to device n
X<n>?         show counts, likewise K<n>? and R<n>?
I             identity
H             this help
<enter>       status
Q             quit";

#[derive(thiserror::Error, Debug)]
pub enum InstrumentError<E: fmt::Debug + fmt::Display> {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("digipot chain failed to start: {0}")]
    Chain(E),
}

/// Loads one calibration table per device, in device order.
///
/// A device whose table is missing or unreadable runs uncalibrated.
pub fn load_tables<P: AsRef<Path>>(paths: &[P], devices: usize) -> Vec<Option<CalibrationTable>> {
    if paths.len() > devices {
        warn!("{} calibration files given for {devices} devices, extras ignored", paths.len());
    }
    (0..devices)
        .map(|device| {
            let path = paths.get(device)?;
            match CalibrationTable::load(path) {
                Ok(table) => {
                    info!("device {} calibrated from {}", device + 1, path.as_ref().display());
                    Some(table)
                }
                Err(err) => {
                    warn!("device {} running uncalibrated: {err}", device + 1);
                    None
                }
            }
        })
        .collect()
}

pub struct Instrument<T, P> {
    config: InstrumentConfig,
    pots: Vec<Digipot>,
    relays: Vec<RelayState>,
    tables: Vec<Option<CalibrationTable>>,
    // Calibration row behind each device's current counts, if any.
    applied: Vec<Option<CalibrationRow>>,
    transport: T,
    panel: P,
    interpreter: Interpreter,
    last_status: Option<ChainStatus>,
}

impl<T, P> Instrument<T, P>
where
    T: ChainTransport,
    P: FrontPanel,
{
    /// Boots the instrument: mid-scale wipers, open relays, chain powered
    /// up and written once.
    pub fn new(
        config: InstrumentConfig,
        tables: Vec<Option<CalibrationTable>>,
        transport: T,
        panel: P,
    ) -> Result<Self, InstrumentError<T::Error>> {
        config.validate()?;
        let devices = config.devices;
        let pots = (0..devices)
            .map(|_| Digipot::new(config.channels, config.r_total, config.r_wiper))
            .collect();
        let mut tables = tables;
        tables.resize(devices, None);
        let surface = Surface {
            calibrated: tables.iter().map(Option::is_some).collect(),
        };

        let mut instrument = Self {
            config,
            pots,
            relays: vec![RelayState::Open; devices],
            tables,
            applied: vec![None; devices],
            transport,
            panel,
            interpreter: Interpreter::new(surface),
            last_status: None,
        };
        for relay in 0..devices {
            instrument.panel.set_relay(relay, RelayState::Open);
        }
        instrument.transport.power_up().map_err(InstrumentError::Chain)?;
        let status = instrument
            .transport
            .send(&instrument.pots, &Channels::All)
            .map_err(InstrumentError::Chain)?;
        if status.mismatch() {
            warn!("chain did not verify at power-up");
        }
        instrument.last_status = Some(status);
        instrument.refresh_panel();
        info!("{NAME} {VERSION} ready, {devices} devices");
        Ok(instrument)
    }

    pub fn pots(&self) -> &[Digipot] {
        &self.pots
    }

    pub fn relays(&self) -> &[RelayState] {
        &self.relays
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn last_status(&self) -> Option<&ChainStatus> {
        self.last_status.as_ref()
    }

    pub fn is_quit(&self) -> bool {
        self.interpreter.is_quit()
    }

    /// Banner and first prompt for a fresh console.
    pub fn greeting(&self) -> String {
        format!("{NAME} {VERSION}, H for help{PROMPT}")
    }

    /// Presented resistance of one device: all channels in parallel at Rwb.
    pub fn device_ohms(&self, device: usize) -> f64 {
        self.pots
            .get(device)
            .and_then(|pot| pot.combined(&Channels::All, Topology::Parallel, Terminal::Wb).ok())
            .unwrap_or(0.0)
    }

    /// Feeds one keystroke and returns the console output it produced.
    pub fn feed(&mut self, input: char) -> String {
        let mut out = String::new();
        for action in self.interpreter.feed(input) {
            self.execute(action, &mut out);
        }
        out
    }

    pub fn feed_str(&mut self, input: &str) -> String {
        input.chars().map(|ch| self.feed(ch)).collect()
    }

    fn execute(&mut self, action: Action, out: &mut String) {
        match action {
            Action::Echo(ch) => out.push(ch),
            Action::Prompt => out.push_str(PROMPT),
            Action::Fault(err) => fault(out, err),
            Action::Help => out.push_str(HELP),
            Action::Status => self.render_status(out),
            Action::Identity => self.render_identity(out),
            Action::Report { verb, device } => self.render_report(verb, device, out),
            Action::Commit { verb, device, value } => self.commit(verb, device, value, out),
            Action::Quit => info!("operator quit"),
        }
    }

    fn commit(&mut self, verb: Verb, device: usize, value: u32, out: &mut String) {
        match verb {
            Verb::Counts => {
                if let Err(err) = self.pots[device].set_counts(&[value], &Channels::All) {
                    return fault(out, err);
                }
                self.applied[device] = None;
                info!("device {} counts set to {value}", device + 1);
                self.write_chain(out);
            }
            Verb::Ohms => {
                let row = match self.tables[device].as_ref().map(|table| table.lookup(f64::from(value))) {
                    Some(Ok(row)) => row.clone(),
                    Some(Err(err)) => return fault(out, err),
                    None => return fault(out, InputError::Uncalibrated(device + 1)),
                };
                let registers: Vec<u32> = row.registers.iter().map(|&r| u32::from(r)).collect();
                let channels = Channels::List((0..registers.len()).collect());
                if let Err(err) = self.pots[device].set_counts(&registers, &channels) {
                    return fault(out, err);
                }
                info!("device {} set to {:.1} ohms, actual {:.3}", device + 1, row.nominal_ohms, row.actual_ohms);
                out.push_str(&format!("\nR{}={:.1} actual {:.3}", device + 1, row.nominal_ohms, row.actual_ohms));
                self.applied[device] = Some(row);
                self.write_chain(out);
            }
            Verb::Relay => {
                let state = RelayState::from_digit(value as u8);
                self.relays[device] = state;
                self.panel.set_relay(device, state);
                info!("relay {} {state:?}", device + 1);
                self.refresh_panel();
            }
        }
    }

    /// Sends every channel and reports anything other than a clean verify.
    fn write_chain(&mut self, out: &mut String) {
        match self.transport.send(&self.pots, &Channels::All) {
            Ok(status) => {
                if status.mismatch() {
                    out.push_str(&format!("\n?? loopback mismatch on channels {:?}", status.mismatched_channels()));
                }
                self.last_status = Some(status);
            }
            Err(err) => {
                warn!("chain write failed: {err}");
                out.push_str(&format!("\n?? chain write failed: {err}"));
                self.last_status = None;
            }
        }
        self.refresh_panel();
    }

    fn refresh_panel(&mut self) {
        let readings: Vec<(f64, RelayState)> = (0..self.pots.len())
            .map(|device| (self.device_ohms(device), self.relays[device]))
            .collect();
        self.panel.show(PanelFrame::new(&readings));
    }

    fn render_report(&self, verb: Verb, device: usize, out: &mut String) {
        let number = device + 1;
        let line = match verb {
            Verb::Counts => format!("\nX{number}={}", join_counts(&self.pots[device])),
            Verb::Relay => format!("\nK{number}={}", self.relays[device].as_digit()),
            Verb::Ohms => match &self.applied[device] {
                Some(row) => format!(
                    "\nR{number}={:.1} actual {:.3} error {:+.3}",
                    row.nominal_ohms, row.actual_ohms, row.error_ohms
                ),
                None => format!("\nR{number} uncalibrated, {:.1} ohms", self.device_ohms(device)),
            },
        };
        out.push_str(&line);
    }

    fn render_status(&self, out: &mut String) {
        for (device, pot) in self.pots.iter().enumerate() {
            out.push_str(&format!(
                "\nU{} X={} R={:.1} K={}",
                device + 1,
                join_counts(pot),
                self.device_ohms(device),
                self.relays[device].as_digit()
            ));
            if let Some(row) = &self.applied[device] {
                out.push_str(&format!(" cal={:.1}", row.nominal_ohms));
            }
        }
        match &self.last_status {
            Some(status) if status.mismatch() => {
                out.push_str("\nchain MISMATCH");
                for check in status.checks.iter().filter(|check| check.mismatch()) {
                    out.push_str(&format!("\n  {check}"));
                }
            }
            Some(_) => out.push_str("\nchain verified"),
            None => out.push_str("\nchain not written"),
        }
    }

    fn render_identity(&self, out: &mut String) {
        let config = &self.config;
        out.push_str(&format!(
            "\n{NAME} {VERSION}\n{} devices, {} channels of {:.0} ohms, wiper {:.1} ohms",
            config.devices, config.channels, config.r_total, config.r_wiper
        ));
        for (device, table) in self.tables.iter().enumerate() {
            let line = match table {
                Some(table) => {
                    let header = table.header();
                    format!(
                        "\nU{} serial {} resistor {} range {:.1}-{:.1}",
                        device + 1,
                        header.serial,
                        header.resistor_id,
                        header.range_begin,
                        header.range_end
                    )
                }
                None => format!("\nU{} uncalibrated", device + 1),
            };
            out.push_str(&line);
        }
    }
}

fn fault(out: &mut String, err: impl fmt::Display) {
    out.push_str(&format!("\n?? {err}"));
}

fn join_counts(pot: &Digipot) -> String {
    pot.counts()
        .iter()
        .map(|count| count.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
