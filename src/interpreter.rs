//! # Command Interpreter
//!
//! Operator protocol of the instrument, one character at a time. The machine
//! is a pure function from `(state, character)` to `(state, actions)`; the
//! caller carries out the actions (bus writes, relay changes, reports), so
//! the protocol can be tested without any hardware.
//!
//! Commands, input is case-insensitive:
//!
//! | input          | effect                                    |
//! |----------------|-------------------------------------------|
//! | `X<n>=<count>` | set every wiper of device `n` (0..=255)   |
//! | `K<n>=<0/1>`   | open or shunt relay `n`                   |
//! | `R<n>=<ohms>`  | apply calibrated resistance (0..=300)     |
//! | `X<n>?`        | report, likewise `K<n>?` and `R<n>?`      |
//! | `I`            | identity                                  |
//! | `H`            | help                                      |
//! | newline        | full status                               |
//! | `Q`            | quit                                      |
//!
//! Accepted characters are echoed upper-cased, so the transcript shows the
//! command as it was understood. Control characters are never echoed.

use log::trace;

const NEWLINE: char = '\n';
const CARRIAGE_RETURN: char = '\r';

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InputError {
    /// The digit just typed would take the value past its limit.
    #[error("{value} is out of range 0..={max}")]
    Range { value: u32, max: u32 },
    #[error("unexpected {0:?}")]
    Syntax(char),
    #[error("value missing")]
    MissingValue,
    #[error("device {0} has no calibration")]
    Uncalibrated(usize),
    #[error("no calibration loaded")]
    NoCalibration,
}

/// What a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Wiper counts, `X`.
    Counts,
    /// Shunt relay, `K`.
    Relay,
    /// Calibrated resistance, `R`.
    Ohms,
}

impl Verb {
    pub fn letter(self) -> char {
        match self {
            Verb::Counts => 'X',
            Verb::Relay => 'K',
            Verb::Ohms => 'R',
        }
    }

    /// Largest value a set command accepts.
    pub fn limit(self) -> u32 {
        match self {
            Verb::Counts => 255,
            Verb::Relay => 1,
            Verb::Ohms => 300,
        }
    }
}

/// Digits typed so far for a set command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    digits: String,
    value: u32,
}

impl Entry {
    fn push(&self, digit: u32, max: u32) -> Result<Entry, InputError> {
        let value = self.value * 10 + digit;
        if value > max {
            return Err(InputError::Range { value, max });
        }
        let mut digits = self.digits.clone();
        digits.extend(char::from_digit(digit, 10));
        Ok(Entry { digits, value })
    }

    pub fn digits(&self) -> &str {
        &self.digits
    }
}

/// Resting states. Reports and identity complete within the character that
/// asks for them, so they never persist as a state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Cmd,
    DeviceSelect(Verb),
    Operation { verb: Verb, device: usize },
    Set { verb: Verb, device: usize, entry: Entry },
    Quit,
}

/// Side effects requested by a transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Echo(char),
    Prompt,
    Fault(InputError),
    Help,
    Status,
    Identity,
    /// Show the current value of `verb` on `device` (0-based).
    Report { verb: Verb, device: usize },
    /// Apply `value` to `device` (0-based).
    Commit { verb: Verb, device: usize, value: u32 },
    Quit,
}

/// What the instrument offers the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Surface {
    /// Calibration availability, one entry per device.
    pub calibrated: Vec<bool>,
}

impl Surface {
    pub fn devices(&self) -> usize {
        self.calibrated.len()
    }

    fn any_calibrated(&self) -> bool {
        self.calibrated.iter().any(|&calibrated| calibrated)
    }
}

fn fault(error: InputError) -> (State, Vec<Action>) {
    (State::Cmd, vec![Action::Fault(error), Action::Prompt])
}

fn settle(actions: Vec<Action>) -> (State, Vec<Action>) {
    let mut actions = actions;
    actions.push(Action::Prompt);
    (State::Cmd, actions)
}

/// Advances the machine by one input character.
pub fn transition(state: &State, input: char, surface: &Surface) -> (State, Vec<Action>) {
    if input == CARRIAGE_RETURN {
        return (state.clone(), Vec::new());
    }
    let input = input.to_ascii_uppercase();

    match state {
        State::Quit => (State::Quit, Vec::new()),
        State::Cmd => match input {
            'X' => (State::DeviceSelect(Verb::Counts), vec![Action::Echo(input)]),
            'K' => (State::DeviceSelect(Verb::Relay), vec![Action::Echo(input)]),
            'R' if surface.any_calibrated() => (State::DeviceSelect(Verb::Ohms), vec![Action::Echo(input)]),
            'R' => fault(InputError::NoCalibration),
            'I' => settle(vec![Action::Echo(input), Action::Identity]),
            'H' => settle(vec![Action::Echo(input), Action::Help]),
            NEWLINE => settle(vec![Action::Status]),
            'Q' => (State::Quit, vec![Action::Echo(input), Action::Quit]),
            _ => fault(InputError::Syntax(input)),
        },
        State::DeviceSelect(verb) => {
            let device = input
                .to_digit(10)
                .map(|digit| digit as usize)
                .filter(|digit| (1..=surface.devices()).contains(digit));
            match device {
                Some(number) if *verb == Verb::Ohms && !surface.calibrated[number - 1] => {
                    fault(InputError::Uncalibrated(number))
                }
                Some(number) => (
                    State::Operation {
                        verb: *verb,
                        device: number - 1,
                    },
                    vec![Action::Echo(input)],
                ),
                None => fault(InputError::Syntax(input)),
            }
        }
        State::Operation { verb, device } => match input {
            '=' => (
                State::Set {
                    verb: *verb,
                    device: *device,
                    entry: Entry::default(),
                },
                vec![Action::Echo(input)],
            ),
            '?' => settle(vec![
                Action::Echo(input),
                Action::Report {
                    verb: *verb,
                    device: *device,
                },
            ]),
            NEWLINE => settle(vec![Action::Report {
                verb: *verb,
                device: *device,
            }]),
            _ => fault(InputError::Syntax(input)),
        },
        State::Set { verb, device, entry } => match input {
            NEWLINE if entry.digits.is_empty() => fault(InputError::MissingValue),
            NEWLINE => settle(vec![Action::Commit {
                verb: *verb,
                device: *device,
                value: entry.value,
            }]),
            _ => match input.to_digit(10) {
                Some(digit) => match entry.push(digit, verb.limit()) {
                    Ok(entry) => (
                        State::Set {
                            verb: *verb,
                            device: *device,
                            entry,
                        },
                        vec![Action::Echo(input)],
                    ),
                    Err(error) => fault(error),
                },
                None => fault(InputError::Syntax(input)),
            },
        },
    }
}

/// The machine together with its current state.
#[derive(Debug, Clone)]
pub struct Interpreter {
    state: State,
    surface: Surface,
}

impl Interpreter {
    pub fn new(surface: Surface) -> Self {
        Self {
            state: State::Cmd,
            surface,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_quit(&self) -> bool {
        self.state == State::Quit
    }

    pub fn feed(&mut self, input: char) -> Vec<Action> {
        let (next, actions) = transition(&self.state, input, &self.surface);
        trace!("{:?} --{input:?}--> {next:?}", self.state);
        self.state = next;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreter() -> Interpreter {
        Interpreter::new(Surface {
            calibrated: vec![true, false],
        })
    }

    fn feed_all(interpreter: &mut Interpreter, input: &str) -> Vec<Action> {
        input.chars().flat_map(|ch| interpreter.feed(ch)).collect()
    }

    fn faults(actions: &[Action]) -> Vec<InputError> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Fault(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    // --- Tests for set commands ---

    #[test]
    fn set_counts_commits_on_newline() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X1=128\n");
        assert_eq!(
            actions,
            vec![
                Action::Echo('X'),
                Action::Echo('1'),
                Action::Echo('='),
                Action::Echo('1'),
                Action::Echo('2'),
                Action::Echo('8'),
                Action::Commit {
                    verb: Verb::Counts,
                    device: 0,
                    value: 128
                },
                Action::Prompt,
            ]
        );
        assert_eq!(interp.state(), &State::Cmd);
    }

    #[test]
    fn digit_past_limit_aborts_before_newline() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X1=256");
        assert_eq!(faults(&actions), vec![InputError::Range { value: 256, max: 255 }]);
        assert_eq!(interp.state(), &State::Cmd);
        assert!(!actions.iter().any(|action| matches!(action, Action::Commit { .. })));
    }

    #[test]
    fn limits_per_verb() {
        let mut interp = interpreter();
        assert_eq!(
            faults(&feed_all(&mut interp, "K2=2")),
            vec![InputError::Range { value: 2, max: 1 }]
        );
        assert_eq!(
            faults(&feed_all(&mut interp, "R1=301")),
            vec![InputError::Range { value: 301, max: 300 }]
        );
        let actions = feed_all(&mut interp, "R1=300\n");
        assert!(actions.contains(&Action::Commit {
            verb: Verb::Ohms,
            device: 0,
            value: 300
        }));
    }

    #[test]
    fn relay_commit() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "k2=1\n");
        assert!(actions.contains(&Action::Commit {
            verb: Verb::Relay,
            device: 1,
            value: 1
        }));
    }

    #[test]
    fn newline_without_digits_is_an_error() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X2=\n");
        assert_eq!(faults(&actions), vec![InputError::MissingValue]);
        assert_eq!(interp.state(), &State::Cmd);
    }

    #[test]
    fn non_digit_aborts_entry() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X1=1a");
        assert_eq!(faults(&actions), vec![InputError::Syntax('A')]);
        assert_eq!(actions.last(), Some(&Action::Prompt));
    }

    // --- Tests for reports ---

    #[test]
    fn query_and_bare_newline_report() {
        let mut interp = interpreter();
        let report = Action::Report {
            verb: Verb::Counts,
            device: 1,
        };
        assert_eq!(
            feed_all(&mut interp, "X2?"),
            vec![Action::Echo('X'), Action::Echo('2'), Action::Echo('?'), report.clone(), Action::Prompt]
        );
        assert_eq!(
            feed_all(&mut interp, "X2\n"),
            vec![Action::Echo('X'), Action::Echo('2'), report, Action::Prompt]
        );
    }

    #[test]
    fn newline_at_prompt_shows_status() {
        let mut interp = interpreter();
        assert_eq!(feed_all(&mut interp, "\n"), vec![Action::Status, Action::Prompt]);
        assert_eq!(
            feed_all(&mut interp, "h"),
            vec![Action::Echo('H'), Action::Help, Action::Prompt]
        );
        assert_eq!(
            feed_all(&mut interp, "I"),
            vec![Action::Echo('I'), Action::Identity, Action::Prompt]
        );
    }

    // --- Tests for device selection and calibration gating ---

    #[test]
    fn unknown_device_is_rejected() {
        let mut interp = interpreter();
        assert_eq!(faults(&feed_all(&mut interp, "X3")), vec![InputError::Syntax('3')]);
        assert_eq!(faults(&feed_all(&mut interp, "X0")), vec![InputError::Syntax('0')]);
        assert_eq!(interp.state(), &State::Cmd);
    }

    #[test]
    fn ohms_needs_a_calibrated_device() {
        let mut interp = interpreter();
        assert_eq!(faults(&feed_all(&mut interp, "R2")), vec![InputError::Uncalibrated(2)]);

        let mut bare = Interpreter::new(Surface {
            calibrated: vec![false, false],
        });
        assert_eq!(faults(&feed_all(&mut bare, "R")), vec![InputError::NoCalibration]);
        assert_eq!(bare.state(), &State::Cmd);
    }

    #[test]
    fn unknown_command_stays_at_prompt() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "Z");
        assert_eq!(actions, vec![Action::Fault(InputError::Syntax('Z')), Action::Prompt]);
        assert_eq!(interp.state(), &State::Cmd);
    }

    // --- Tests for input handling ---

    #[test]
    fn carriage_return_is_ignored_everywhere() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X\r1\r=\r4\r2\r\n");
        assert!(faults(&actions).is_empty());
        assert!(actions.contains(&Action::Commit {
            verb: Verb::Counts,
            device: 0,
            value: 42
        }));
    }

    #[test]
    fn control_characters_are_not_echoed() {
        let mut interp = interpreter();
        let actions = feed_all(&mut interp, "X1=5\n");
        assert!(!actions.contains(&Action::Echo('\n')));

        for control in ['\t', '\x07', '\x7f'] {
            for lead in ["", "X", "X1="] {
                let mut interp = interpreter();
                feed_all(&mut interp, lead);
                let actions = interp.feed(control);
                assert!(!actions.contains(&Action::Echo(control)), "{lead:?} then {control:?}");
                assert_eq!(faults(&actions), vec![InputError::Syntax(control)]);
                assert_eq!(interp.state(), &State::Cmd);
            }
        }
    }

    #[test]
    fn echo_is_upper_cased() {
        let mut interp = interpreter();
        assert_eq!(
            feed_all(&mut interp, "x1=7"),
            vec![Action::Echo('X'), Action::Echo('1'), Action::Echo('='), Action::Echo('7')]
        );
    }

    #[test]
    fn quit_is_terminal() {
        let mut interp = interpreter();
        assert_eq!(feed_all(&mut interp, "q"), vec![Action::Echo('Q'), Action::Quit]);
        assert!(interp.is_quit());
        assert!(feed_all(&mut interp, "X1=1\n").is_empty());
    }

    #[test]
    fn transition_is_pure() {
        let surface = Surface {
            calibrated: vec![false],
        };
        let state = State::Operation {
            verb: Verb::Relay,
            device: 0,
        };
        let first = transition(&state, '=', &surface);
        let second = transition(&state, '=', &surface);
        assert_eq!(first, second);
    }
}
