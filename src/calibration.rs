//! # Calibration Tables
//!
//! A calibration table maps a desired nominal resistance to the four wiper
//! register values that were measured to produce it. Tables are produced on
//! the bench, stored as tab-separated text, loaded once at startup and never
//! modified afterwards.
//!
//! File layout, one field group per line:
//!
//! ```text
//! # comments start with a hash
//! 0042            # serial number
//! 1               # resistor number
//! 10              # minimum resistance value
//! 100             # maximum resistance value
//! 3               # number of resistances
//! 10.0    40  40  40  40  9.800   -0.200
//! ```
//!
//! Data rows are `nominal, reg0..reg3, actual, error`.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// Register values per calibration row, one per digipot channel.
pub const REGISTERS: usize = 4;

/// Fields in one data row.
const ROW_FIELDS: usize = 3 + REGISTERS;

/// Header scalars in the order they appear in the file.
const HEADER_FIELDS: [&str; 5] = [
    "serial number",
    "resistor number",
    "minimum resistance value",
    "maximum resistance value",
    "number of resistances",
];

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("could not open the calibration table at {1:?}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("could not read the calibration table")]
    Read(#[source] std::io::Error),
    #[error("calibration table ends before its {0} header line")]
    MissingHeader(&'static str),
    #[error("line {line}: `{field}` is not a valid {expected}")]
    Field {
        line: usize,
        field: String,
        expected: &'static str,
    },
    #[error("line {line}: expected 7 fields, found {found}")]
    Columns { line: usize, found: usize },
    #[error("calibration table has no data rows")]
    NoRows,
    #[error("line {line}: rows must be in ascending order of nominal resistance")]
    Unsorted { line: usize },
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum LookupError {
    #[error("no calibration row for {0} ohms")]
    NoExactMatch(f64),
    #[error("calibration table has too few rows to answer")]
    TooFewRows,
}

/// One measured setting.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRow {
    pub nominal_ohms: f64,
    pub registers: [u8; REGISTERS],
    pub actual_ohms: f64,
    pub error_ohms: f64,
}

impl fmt::Display for CalibrationRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r0, r1, r2, r3] = self.registers;
        write!(
            f,
            "{:.1}\t{r0}\t{r1}\t{r2}\t{r3}\t{:.3}\t{:+.3}",
            self.nominal_ohms, self.actual_ohms, self.error_ohms
        )
    }
}

/// Identity and coverage of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHeader {
    pub serial: String,
    pub resistor_id: String,
    pub range_begin: f64,
    pub range_end: f64,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    header: TableHeader,
    // Sorted by ascending nominal resistance.
    rows: Vec<CalibrationRow>,
}

impl CalibrationTable {
    /// Loads a table from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LoadError::Open(e, path.to_path_buf()))?;
        let table = Self::parse(BufReader::new(file))?;
        debug!(
            "loaded calibration {} / {} from {:?}: {} rows",
            table.header.serial,
            table.header.resistor_id,
            path,
            table.rows.len()
        );
        Ok(table)
    }

    /// Parses a table from any buffered source.
    pub fn parse(source: impl BufRead) -> Result<Self, LoadError> {
        let mut scalars: Vec<(usize, String)> = Vec::with_capacity(HEADER_FIELDS.len());
        let mut rows: Vec<CalibrationRow> = Vec::new();

        for (index, line) in source.lines().enumerate() {
            let line = line.map_err(LoadError::Read)?;
            let number = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line
                .split('\t')
                .map(str::trim)
                .take_while(|field| !field.starts_with('#'))
                .collect();
            if fields.is_empty() {
                continue;
            }

            if scalars.len() < HEADER_FIELDS.len() {
                scalars.push((number, fields[0].to_string()));
                continue;
            }
            let row = parse_row(number, &fields)?;
            if rows.last().is_some_and(|last| row.nominal_ohms < last.nominal_ohms) {
                return Err(LoadError::Unsorted { line: number });
            }
            rows.push(row);
        }

        let header = build_header(scalars)?;
        if rows.is_empty() {
            return Err(LoadError::NoRows);
        }
        if header.row_count != rows.len() {
            warn!(
                "calibration {} declares {} rows but holds {}",
                header.serial,
                header.row_count,
                rows.len()
            );
        }
        Ok(Self { header, rows })
    }

    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    pub fn rows(&self) -> &[CalibrationRow] {
        &self.rows
    }

    /// Finds the row for a requested resistance.
    ///
    /// The request is rounded to whole ohms. Requests above the covered range
    /// answer with the last row. Requests below it answer with the second
    /// row, not the first.
    pub fn lookup(&self, nominal_ohms: f64) -> Result<&CalibrationRow, LookupError> {
        let wanted = (nominal_ohms + 0.5).trunc() as i64;
        if wanted < self.header.range_begin.trunc() as i64 {
            return self.rows.get(1).ok_or(LookupError::TooFewRows);
        }
        if wanted > self.header.range_end.trunc() as i64 {
            return self.rows.last().ok_or(LookupError::TooFewRows);
        }
        self.rows
            .iter()
            .find(|row| row.nominal_ohms.trunc() as i64 == wanted)
            .ok_or(LookupError::NoExactMatch(nominal_ohms))
    }
}

impl fmt::Display for CalibrationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        writeln!(f, "{}\t# {}", header.serial, HEADER_FIELDS[0])?;
        writeln!(f, "{}\t# {}", header.resistor_id, HEADER_FIELDS[1])?;
        writeln!(f, "{}\t# {}", header.range_begin, HEADER_FIELDS[2])?;
        writeln!(f, "{}\t# {}", header.range_end, HEADER_FIELDS[3])?;
        writeln!(f, "{}\t# {}", header.row_count, HEADER_FIELDS[4])?;
        writeln!(f, "# Rnominal, Registers[1-4], Ractual, Rerror")?;
        for row in &self.rows {
            writeln!(f, "{row}")?;
        }
        Ok(())
    }
}

fn build_header(scalars: Vec<(usize, String)>) -> Result<TableHeader, LoadError> {
    if let Some(missing) = HEADER_FIELDS.get(scalars.len()) {
        return Err(LoadError::MissingHeader(missing));
    }
    let mut scalars = scalars.into_iter();
    // Length checked above, five entries follow.
    let mut next = || scalars.next().unwrap_or_default();
    let (_, serial) = next();
    let (_, resistor_id) = next();
    let (line, begin) = next();
    let range_begin = parse_field(line, &begin, "resistance")?;
    let (line, end) = next();
    let range_end = parse_field(line, &end, "resistance")?;
    let (line, count) = next();
    let row_count = parse_field(line, &count, "row count")?;
    Ok(TableHeader {
        serial,
        resistor_id,
        range_begin,
        range_end,
        row_count,
    })
}

fn parse_row(line: usize, fields: &[&str]) -> Result<CalibrationRow, LoadError> {
    if fields.len() != ROW_FIELDS {
        return Err(LoadError::Columns {
            line,
            found: fields.len(),
        });
    }
    let mut registers = [0u8; REGISTERS];
    for (register, field) in registers.iter_mut().zip(&fields[1..=REGISTERS]) {
        *register = parse_field(line, field, "register value")?;
    }
    Ok(CalibrationRow {
        nominal_ohms: parse_field(line, fields[0], "resistance")?,
        registers,
        actual_ohms: parse_field(line, fields[REGISTERS + 1], "resistance")?,
        error_ohms: parse_field(line, fields[REGISTERS + 2], "resistance")?,
    })
}

fn parse_field<T: std::str::FromStr>(
    line: usize,
    field: &str,
    expected: &'static str,
) -> Result<T, LoadError> {
    field.parse().map_err(|_| LoadError::Field {
        line,
        field: field.to_string(),
        expected,
    })
}
