//! # Front Panel
//!
//! Relays that shunt each emulated resistor and the small display that shows
//! what the instrument is presenting. The instrument only pushes to the
//! panel; nothing is ever read back from it.

use ratatui::buffer::Buffer;
use ratatui::layout::Rect;
use ratatui::style::Style;
use ratatui::widgets::Widget;

/// Position of one shunt relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayState {
    #[default]
    Open,
    /// Contacts closed across the resistor: it reads as a short.
    Shunted,
}

impl RelayState {
    pub fn from_digit(value: u8) -> Self {
        if value == 0 {
            RelayState::Open
        } else {
            RelayState::Shunted
        }
    }

    pub fn as_digit(self) -> u8 {
        match self {
            RelayState::Open => 0,
            RelayState::Shunted => 1,
        }
    }
}

/// One display row per emulated resistor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PanelFrame {
    rows: Vec<String>,
}

impl PanelFrame {
    /// Builds the rows from each resistor's ohms and relay.
    pub fn new(readings: &[(f64, RelayState)]) -> Self {
        let rows = readings
            .iter()
            .enumerate()
            .map(|(index, (ohms, relay))| match relay {
                RelayState::Shunted => format!("R{} SHORT", index + 1),
                RelayState::Open => format!("R{}={ohms:.1}", index + 1),
            })
            .collect();
        Self { rows }
    }

    /// Splash shown while the instrument boots.
    pub fn welcome() -> Self {
        Self {
            rows: vec!["Welcome".into(), "to the".into(), "TraceR".into()],
        }
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }
}

impl Widget for &PanelFrame {
    fn render(self, area: Rect, buf: &mut Buffer) {
        for (line, row) in self.rows.iter().take(usize::from(area.height)).enumerate() {
            buf.set_stringn(
                area.x,
                area.y + line as u16,
                row,
                usize::from(area.width),
                Style::default(),
            );
        }
    }
}

/// Sink for relay commands and display frames.
pub trait FrontPanel {
    /// Drives relay `relay` (0-based).
    fn set_relay(&mut self, relay: usize, state: RelayState);
    fn show(&mut self, frame: PanelFrame);
}

/// Panel that keeps what it was told, for the host front ends to draw.
#[derive(Debug, Clone, Default)]
pub struct Oled {
    relays: Vec<RelayState>,
    frame: PanelFrame,
}

impl Oled {
    pub fn new(relays: usize) -> Self {
        Self {
            relays: vec![RelayState::Open; relays],
            frame: PanelFrame::welcome(),
        }
    }

    pub fn relays(&self) -> &[RelayState] {
        &self.relays
    }

    pub fn frame(&self) -> &PanelFrame {
        &self.frame
    }
}

impl FrontPanel for Oled {
    fn set_relay(&mut self, relay: usize, state: RelayState) {
        if let Some(slot) = self.relays.get_mut(relay) {
            *slot = state;
        }
    }

    fn show(&mut self, frame: PanelFrame) {
        self.frame = frame;
    }
}
