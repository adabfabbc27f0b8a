//! Bacterial one-hybrid zinc-finger motifs: protein sequence plus the 4x4
//! recognition-site weight matrix.

use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::building_blocks::featurize::{SequenceEncoder, NT_4};
use crate::error::EvolutronError;
use crate::io::Padding;
use crate::utils::data_handling::Dataset;

const SEQUENCE_COLUMN: &str = "ZF protein sequence";
const SITE_POSITIONS: usize = 4;

/// One row of the motif table.
#[derive(Debug, Clone, PartialEq)]
pub struct ZincFinger {
    pub name: String,
    pub organism: String,
    pub sequence: String,
    /// `0.25 * 2^pwm`, nucleotide-major (`A1..A4, C1..C4, ...`).
    pub recognition_site: Vec<f32>,
}

fn column(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers.iter().position(|h| h.trim() == name).ok_or_else(|| {
        anyhow!(EvolutronError::format(format!(
            "motif table is missing column '{}'",
            name
        )))
    })
}

/// Reads every row of a B1H motif CSV file.
pub fn read_motifs<P: AsRef<Path>>(path: P) -> Result<Vec<ZincFinger>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open motif file: {:?}", path))?;

    let headers = reader.headers()?.clone();
    let name_idx = column(&headers, "Gene/Range")?;
    let organism_idx = column(&headers, "Organism")?;
    let sequence_idx = column(&headers, SEQUENCE_COLUMN)?;
    let mut pwm_idx = Vec::with_capacity(NT_4.len() * SITE_POSITIONS);
    for nt in NT_4.chars() {
        for pos in 1..=SITE_POSITIONS {
            pwm_idx.push(column(&headers, &format!("{}{}", nt, pos))?);
        }
    }

    let mut motifs = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read row {} of {:?}", row, path))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").trim();
        let recognition_site = pwm_idx
            .iter()
            .map(|&idx| {
                field(idx)
                    .parse::<f32>()
                    .map(|pwm| 0.25 * 2f32.powf(pwm))
                    .map_err(|e| {
                        anyhow!(EvolutronError::format(format!(
                            "row {}: invalid weight '{}': {}",
                            row,
                            field(idx),
                            e
                        )))
                    })
            })
            .collect::<Result<Vec<f32>>>()?;

        motifs.push(ZincFinger {
            name: field(name_idx).to_string(),
            organism: field(organism_idx).to_string(),
            sequence: field(sequence_idx).to_ascii_uppercase(),
            recognition_site,
        });
    }
    Ok(motifs)
}

/// Encodes the B1H motif table. Sequences containing `X` (or any other
/// symbol outside the 20 amino acids) are dropped.
pub fn b1h<P: AsRef<Path>>(path: P, padding: Padding) -> Result<Dataset<Vec<f32>>> {
    let path = path.as_ref();
    let encoder = SequenceEncoder::new(20)?;

    let mut data = Dataset::default();
    for motif in read_motifs(path)? {
        match encoder.encode(&motif.sequence) {
            Ok(x) => data.push(x, motif.recognition_site),
            Err(e) => {
                log::trace!("Dropping {} ({}): {}", motif.name, motif.organism, e);
                data.skip();
            }
        }
    }

    if data.skipped > 0 {
        log::info!("Dropped {} zinc fingers with unknown residues", data.skipped);
    }
    padding.apply(&mut data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_table(name: &str) -> std::path::PathBuf {
        let mut header = vec!["Gene/Range", "Organism", SEQUENCE_COLUMN]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        for nt in NT_4.chars() {
            for pos in 1..=4 {
                header.push(format!("{}{}", nt, pos));
            }
        }
        let weights = vec!["0"; 15].join(",");
        let body = format!(
            "{}\nzf1,human,RSDELTR,2,{}\nzf2,mouse,RSDXLTR,0,{}\nzf3,fly,QSGHLQR,-2,{}\n",
            header.join(","),
            weights,
            weights,
            weights
        );
        let path = std::env::temp_dir().join(name);
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_b1h_drops_unknown_residues() {
        let path = write_table("evolutron_b1h_test.csv");
        let data = b1h(&path, Padding::Fixed { max_len: Some(10) }).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(data.len(), 2);
        assert_eq!(data.skipped, 1);
        assert!(data.x.iter().all(|x| x.dim() == (20, 10)));
        assert_eq!(data.y[0].len(), 16);
        assert!((data.y[0][0] - 1.0).abs() < 1e-6);
        assert!((data.y[0][1] - 0.25).abs() < 1e-6);
        assert!((data.y[1][0] - 0.0625).abs() < 1e-6);
    }

    #[test]
    fn test_missing_column() {
        let path = std::env::temp_dir().join("evolutron_b1h_bad.csv");
        fs::write(&path, "Gene/Range,Organism\nzf1,human\n").unwrap();
        let err = read_motifs(&path).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(matches!(
            crate::error::kind_of(&err),
            Some(EvolutronError::Format(_))
        ));
    }
}
