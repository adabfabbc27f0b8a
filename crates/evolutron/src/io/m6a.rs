//! m6A proto-array binding measurements.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

use crate::building_blocks::featurize::SequenceEncoder;
use crate::error::EvolutronError;
use crate::io::Padding;
use crate::utils::data_handling::Dataset;
use crate::utils::literal::{parse_literal, Literal};

/// Which array replicate to read. Replicates are interleaved row by row in
/// the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Probe {
    First,
    Second,
    #[default]
    Both,
}

impl FromStr for Probe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(Probe::First),
            "2" => Ok(Probe::Second),
            "both" => Ok(Probe::Both),
            other => Err(anyhow!(EvolutronError::configuration(format!(
                "unknown probe '{}', expected 1, 2 or both",
                other
            )))),
        }
    }
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Probe::First => write!(f, "1"),
            Probe::Second => write!(f, "2"),
            Probe::Both => write!(f, "both"),
        }
    }
}

impl Probe {
    fn keeps(&self, index: usize) -> bool {
        match self {
            Probe::First => index % 2 == 0,
            Probe::Second => index % 2 == 1,
            Probe::Both => true,
        }
    }
}

/// Short or unknown-residue cells are unusable.
fn is_usable(cell: &str) -> bool {
    cell.len() > 5 && !cell.contains('U') && !cell.contains('X')
}

/// First element of the first element of a `[['SEQ', ...], ...]` cell.
fn leading_sequence(cell: &str) -> Result<String> {
    let literal = parse_literal(cell)
        .map_err(|e| anyhow!(EvolutronError::format(format!("AA cell {:?}: {}", cell, e))))?;
    literal
        .items()
        .and_then(|outer| outer.first())
        .and_then(Literal::items)
        .and_then(|inner| inner.first())
        .and_then(Literal::as_str)
        .map(|s| s.to_ascii_uppercase())
        .ok_or_else(|| {
            anyhow!(EvolutronError::format(format!(
                "AA cell {:?} holds no nested sequence",
                cell
            )))
        })
}

fn parse_float(record: &csv::StringRecord, idx: usize, name: &str) -> Result<f32> {
    let text = record.get(idx).unwrap_or("").trim();
    text.parse::<f32>().map_err(|e| {
        anyhow!(EvolutronError::format(format!(
            "invalid value '{}' in column {}: {}",
            text, name, e
        )))
    })
}

/// Reads the proto-array table. Targets are `[Array_60531, Array_60690, mean]`.
pub fn m6a<P: AsRef<Path>>(path: P, probe: Probe, padding: Padding) -> Result<Dataset<Vec<f32>>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open proto-array file: {:?}", path))?;

    let headers = reader.headers()?.clone();
    let index_of = |name: &str| {
        headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
            anyhow!(EvolutronError::format(format!(
                "proto-array table is missing column '{}'",
                name
            )))
        })
    };
    let aa_idx = index_of("AA")?;
    let targets = [
        ("Array_60531", index_of("Array_60531")?),
        ("Array_60690", index_of("Array_60690")?),
        ("mean", index_of("mean")?),
    ];

    let encoder = SequenceEncoder::new(20)?;
    let mut data = Dataset::default();
    let mut passed = 0usize;
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read {:?}", path))?;
        let cell = record.get(aa_idx).unwrap_or("");
        if !is_usable(cell) {
            data.skip();
            continue;
        }
        let index = passed;
        passed += 1;
        if !probe.keeps(index) {
            continue;
        }

        let sequence = leading_sequence(cell)?;
        let y = targets
            .iter()
            .map(|(name, idx)| parse_float(&record, *idx, name))
            .collect::<Result<Vec<f32>>>()?;
        match encoder.encode(&sequence) {
            Ok(x) => data.push(x, y),
            Err(e) => {
                log::trace!("Dropping {}: {}", sequence, e);
                data.skip();
            }
        }
    }

    log::info!(
        "Read {} proteins for probe {} from {:?} ({} unusable rows)",
        data.len(),
        probe,
        path,
        data.skipped
    );
    padding.apply(&mut data);
    Ok(data)
}
