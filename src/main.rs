use clap::Parser as _;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::widgets::{Block, Borders, Paragraph};
use ratatui::{Frame, Terminal};
use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracer::chain::ChainError;
use tracer::config::{ConfigError, InstrumentConfig};
use tracer::instrument::{self, Instrument, InstrumentError};
use tracer::panel::Oled;
use tracer::sim::{Line, SimPin, SimSpi, SimulatedChain, StdDelay};
use tracer::{CalibrationTable, Daisychain, LoadError};

type SimInstrument = Instrument<Daisychain<SimSpi, SimPin, StdDelay>, Oled>;

// Pause between console ticks.
const TICK: Duration = Duration::from_millis(20);
// Lines of console history kept on screen.
const HISTORY: usize = 500;

#[derive(clap::Parser)]
#[clap(version, about = "TraceR resistance emulator")]
struct Cli {
    /// Digipots in the chain.
    #[clap(long, global = true, default_value_t = 2)]
    devices: usize,
    /// Wipers per digipot.
    #[clap(long, global = true, default_value_t = 4)]
    channels: usize,
    /// End-to-end resistance of one channel, in ohms.
    #[clap(long, global = true, default_value_t = 1000.0)]
    r_total: f64,
    /// Wiper contact resistance, in ohms.
    #[clap(long, global = true, default_value_t = 0.0)]
    r_wiper: f64,
    /// Calibration table, once per device in chain order.
    #[clap(long, global = true, value_name = "FILE")]
    calibration: Vec<PathBuf>,
    /// Write the log here. The full-screen console logs nowhere otherwise.
    #[clap(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,
    #[clap(subcommand)]
    mode: Option<Mode>,
}

#[derive(clap::Subcommand)]
enum Mode {
    /// Full-screen operator console (default).
    Console,
    /// Operator console on a serial port.
    Serial {
        #[clap(long)]
        port: String,
        #[clap(long, default_value_t = 115_200)]
        baud: u32,
    },
    /// List available serial ports.
    Ports,
    /// Print a calibration table.
    Table { file: PathBuf },
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("I/O failed")]
    Io(#[from] io::Error),
    #[error("serial port failed")]
    Serial(#[from] serialport::Error),
    #[error("invalid instrument configuration")]
    Config(#[from] ConfigError),
    #[error("could not load calibration table")]
    Load(#[from] LoadError),
    #[error("digipot chain unavailable")]
    Chain(#[from] ChainError<Infallible, Infallible>),
    #[error("instrument failed to boot")]
    Boot(#[from] InstrumentError<ChainError<Infallible, Infallible>>),
    #[error("could not set up logging")]
    Logger(#[from] log::SetLoggerError),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let cli = Cli::parse();
    end(run(cli));
}

fn run(cli: Cli) -> Result<(), CliError> {
    let full_screen = matches!(cli.mode, None | Some(Mode::Console));
    init_logging(cli.log_file.as_deref(), full_screen)?;

    match &cli.mode {
        None | Some(Mode::Console) => run_console_mode(&mut boot(&cli)?),
        Some(Mode::Serial { port, baud }) => run_serial_mode(&mut boot(&cli)?, port, *baud),
        Some(Mode::Ports) => list_ports(),
        Some(Mode::Table { file }) => {
            let table = CalibrationTable::load(file)?;
            print!("{table}");
            Ok(())
        }
    }
}

// Filter from TRACER_LOG, default warn. A full-screen console only logs to a file.
fn init_logging(log_file: Option<&Path>, full_screen: bool) -> Result<(), CliError> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::new().filter_or("TRACER_LOG", "warn"));
    match log_file {
        Some(path) => {
            builder.target(env_logger::Target::Pipe(Box::new(File::create(path)?)));
        }
        None if full_screen => return Ok(()),
        None => {}
    }
    builder.try_init()?;
    Ok(())
}

// Builds the instrument on a simulated chain.
fn boot(cli: &Cli) -> Result<SimInstrument, CliError> {
    let config = InstrumentConfig {
        devices: cli.devices,
        channels: cli.channels,
        r_total: cli.r_total,
        r_wiper: cli.r_wiper,
    };
    config.validate()?;
    let devices = config.devices;

    let sim = SimulatedChain::new(devices, config.channels);
    let chain = Daisychain::new(
        sim.spi(),
        sim.pin(Line::Select),
        sim.pin(Line::Shutdown),
        sim.pin(Line::Reset),
        StdDelay,
    )?;
    let tables = instrument::load_tables(&cli.calibration, devices);
    Ok(Instrument::new(config, tables, chain, Oled::new(devices))?)
}

// Handles the full-screen console: interpreter output on the left, front panel on the right.
fn run_console_mode(instrument: &mut SimInstrument) -> Result<(), CliError> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;

    let result = console_loop(&mut terminal, instrument);

    // Restore the terminal even when the loop failed.
    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn console_loop<B: Backend>(terminal: &mut Terminal<B>, instrument: &mut SimInstrument) -> Result<(), CliError> {
    let mut transcript = instrument.greeting();
    loop {
        terminal.draw(|frame| draw_console(frame, &transcript, instrument))?;

        // Drain whatever keys are ready, never wait for one.
        while event::poll(Duration::ZERO)? {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                return Ok(());
            }
            if let Some(ch) = map_key(key) {
                transcript.push_str(&instrument.feed(ch));
            }
        }
        if instrument.is_quit() {
            return Ok(());
        }
        trim_history(&mut transcript);
        thread::sleep(TICK);
    }
}

// Chorded keys are shortcuts, not console input.
fn map_key(key: KeyEvent) -> Option<char> {
    if key.modifiers.intersects(KeyModifiers::CONTROL | KeyModifiers::ALT) {
        return None;
    }
    match key.code {
        KeyCode::Enter => Some('\n'),
        KeyCode::Char(ch) => Some(ch),
        _ => None,
    }
}

fn trim_history(transcript: &mut String) {
    let lines = transcript.lines().count();
    if lines > HISTORY {
        let keep_from = transcript
            .match_indices('\n')
            .nth(lines - HISTORY - 1)
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        transcript.drain(..keep_from);
    }
}

fn draw_console(frame: &mut Frame, transcript: &str, instrument: &SimInstrument) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(30), Constraint::Length(20)])
        .split(frame.size());

    let console = Block::default().borders(Borders::ALL).title("Console");
    let visible = console.inner(chunks[0]).height as usize;
    let lines = transcript.lines().count() + usize::from(transcript.ends_with('\n'));
    let scroll = lines.saturating_sub(visible) as u16;
    frame.render_widget(Paragraph::new(transcript).block(console).scroll((scroll, 0)), chunks[0]);

    let panel = Block::default().borders(Borders::ALL).title("Panel");
    let inner = panel.inner(chunks[1]);
    frame.render_widget(panel, chunks[1]);
    frame.render_widget(instrument.panel().frame(), inner);
}

// Handles the serial port console.
fn run_serial_mode(instrument: &mut SimInstrument, port_name: &str, baud_rate: u32) -> Result<(), CliError> {
    let mut port = serialport::new(port_name, baud_rate)
        .timeout(Duration::from_millis(10))
        .open()?;

    println!("Listening on {} at {} baud. Send Q to stop.", port_name, baud_rate);
    write_crlf(&mut port, &instrument.greeting())?;

    let mut serial_buf: Vec<u8> = vec![0; 128];
    while !instrument.is_quit() {
        match port.read(serial_buf.as_mut_slice()) {
            Ok(bytes_read) => {
                let response: String = serial_buf[..bytes_read]
                    .iter()
                    .map(|&byte| instrument.feed(char::from(byte)))
                    .collect();
                if !response.is_empty() {
                    write_crlf(&mut port, &response)?;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => (),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_crlf<W: Write>(port: &mut W, text: &str) -> io::Result<()> {
    port.write_all(text.replace('\n', "\r\n").as_bytes())?;
    port.flush()
}

fn list_ports() -> Result<(), CliError> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{}", port.port_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Tests for key mapping ---

    #[test]
    fn plain_and_shifted_keys_are_input() {
        assert_eq!(map_key(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::NONE)), Some('x'));
        assert_eq!(map_key(KeyEvent::new(KeyCode::Char('X'), KeyModifiers::SHIFT)), Some('X'));
        assert_eq!(map_key(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)), Some('\n'));
        assert_eq!(map_key(KeyEvent::new(KeyCode::Left, KeyModifiers::NONE)), None);
    }

    #[test]
    fn chorded_keys_are_dropped() {
        assert_eq!(map_key(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::CONTROL)), None);
        assert_eq!(map_key(KeyEvent::new(KeyCode::Char('q'), KeyModifiers::ALT)), None);
        assert_eq!(
            map_key(KeyEvent::new(KeyCode::Enter, KeyModifiers::CONTROL | KeyModifiers::SHIFT)),
            None
        );
    }

    #[test]
    fn history_keeps_the_newest_lines() {
        let mut transcript: String = (0..HISTORY + 5).map(|line| format!("{line}\n")).collect();
        trim_history(&mut transcript);
        assert_eq!(transcript.lines().count(), HISTORY);
        assert!(transcript.starts_with("5\n"));
    }
}
