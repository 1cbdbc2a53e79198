//! # Resistance Model
//!
//! Conversion between wiper counts and ohms for one digipot channel, and the
//! series/parallel math used to combine several channels at one terminal.
//!
//! Every channel has three terminals, A, B and the wiper W:
//!
//! * `Rwb = Rwiper + Rtotal * (count / 256)`
//! * `Rwa = Rwiper + Rtotal * ((256 - count) / 256)`
//!
//! so a count of `0x00` puts the wiper at the B end and `0xFF` one step short
//! of the A end.

/// Highest wiper count accepted by the 8-bit data field.
pub const MAX_COUNT: u32 = 255;

/// Number of wiper steps across the full resistor.
const STEPS: f64 = 256.0;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ModelError {
    /// The wiper count does not fit the 8-bit data field.
    #[error("wiper count {0} is outside 0..=255")]
    CountOutOfRange(u32),
    /// Nothing to combine.
    #[error("no channels selected to combine")]
    EmptyChannelSet,
}

/// Which end terminal the resistance is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Wa,
    Wb,
}

/// How several channels are wired together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Series,
    Parallel,
}

/// Resistance seen from the wiper to each end terminal.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WiperOhms {
    pub rwa: f64,
    pub rwb: f64,
}

impl WiperOhms {
    pub fn at(&self, terminal: Terminal) -> f64 {
        match terminal {
            Terminal::Wa => self.rwa,
            Terminal::Wb => self.rwb,
        }
    }
}

/// Computes `Rwa` and `Rwb` for a wiper count.
///
/// A count above 255 is a caller error and is reported, not clamped.
pub fn wiper_ohms(count: u32, total_ohms: f64, wiper_ohms: f64) -> Result<WiperOhms, ModelError> {
    if count > MAX_COUNT {
        return Err(ModelError::CountOutOfRange(count));
    }
    let count = f64::from(count);
    Ok(WiperOhms {
        rwa: wiper_ohms + total_ohms * ((STEPS - count) / STEPS),
        rwb: wiper_ohms + total_ohms * (count / STEPS),
    })
}

/// Combines resistances under one topology.
///
/// A parallel combination containing a zero-ohm branch is a short: the result
/// is exactly zero.
pub fn combine(values: &[f64], topology: Topology) -> Result<f64, ModelError> {
    match values {
        [] => Err(ModelError::EmptyChannelSet),
        [single] => Ok(*single),
        _ => match topology {
            Topology::Series => Ok(values.iter().sum()),
            Topology::Parallel => {
                if values.iter().any(|&r| r == 0.0) {
                    return Ok(0.0);
                }
                let conductance: f64 = values.iter().map(|r| 1.0 / r).sum();
                Ok(1.0 / conductance)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f64 = 1e-9;

    #[test]
    fn terminals_always_sum_to_total_plus_two_wipers() {
        for count in 0..=MAX_COUNT {
            let ohms = wiper_ohms(count, 1000.0, 52.0).unwrap();
            assert!((ohms.rwa + ohms.rwb - (1000.0 + 2.0 * 52.0)).abs() < TOLERANCE, "count {count}");
        }
    }

    #[test]
    fn known_wiper_positions() {
        let ends = wiper_ohms(0, 1000.0, 0.0).unwrap();
        assert_eq!(ends.rwb, 0.0);
        assert_eq!(ends.rwa, 1000.0);

        let mid = wiper_ohms(0x80, 1000.0, 0.0).unwrap();
        assert_eq!(mid.rwa, 500.0);
        assert_eq!(mid.rwb, 500.0);
        assert_eq!(mid.at(Terminal::Wb), 500.0);

        let top = wiper_ohms(255, 10_000.0, 50.0).unwrap();
        assert!((top.rwb - (50.0 + 10_000.0 * 255.0 / 256.0)).abs() < TOLERANCE);
    }

    #[test]
    fn count_above_range_is_reported() {
        assert_eq!(wiper_ohms(256, 1000.0, 0.0), Err(ModelError::CountOutOfRange(256)));
    }

    #[test]
    fn empty_combination_fails_for_both_topologies() {
        assert_eq!(combine(&[], Topology::Series), Err(ModelError::EmptyChannelSet));
        assert_eq!(combine(&[], Topology::Parallel), Err(ModelError::EmptyChannelSet));
    }

    #[test]
    fn single_value_is_unchanged() {
        for x in [1.0, 49.0, 333.3, 1e6] {
            assert_eq!(combine(&[x], Topology::Series), Ok(x));
            assert_eq!(combine(&[x], Topology::Parallel), Ok(x));
        }
    }

    #[test]
    fn zero_branch_shorts_parallel_combination() {
        assert_eq!(combine(&[0.0, 470.0], Topology::Parallel), Ok(0.0));
        assert_eq!(combine(&[470.0, 220.0, 0.0], Topology::Parallel), Ok(0.0));
        assert_eq!(combine(&[0.0, 470.0], Topology::Series), Ok(470.0));
    }

    #[test]
    fn series_and_parallel_math() {
        assert_eq!(combine(&[100.0, 200.0, 300.0], Topology::Series), Ok(600.0));
        let parallel = combine(&[100.0, 100.0, 100.0, 100.0], Topology::Parallel).unwrap();
        assert!((parallel - 25.0).abs() < TOLERANCE);
    }
}
