//! CullPDB-style profile arrays: `(N, 700, 57)` float records stored as a
//! `.npy` file or as the first array of an `.npz` archive.
//!
//! Channel layout per position: `0..22` amino acids (CullPDB order, last is
//! `NoSeq`), `22..30` eight-class secondary structure, `31..33` N/C-terminal
//! flags, `35..57` sequence profile (PSSM).

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{concatenate, s, Array2, Array3, ArrayView2, Axis};
use rayon::prelude::*;

use crate::building_blocks::featurize::{aa_to_codon, hot_to_aa, CODONS};
use crate::error::EvolutronError;
use crate::utils::data_handling::Dataset;
use crate::utils::literal::{parse_literal, Literal};

pub const PROFILE_LENGTH: usize = 700;
pub const PROFILE_CHANNELS: usize = 57;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const CULLPDB_AA_CHANNELS: usize = 22;

#[derive(Debug, Clone)]
pub struct NpzOptions {
    /// Leading amino-acid channels kept (at most 22).
    pub nb_aa: usize,
    pub pssm: bool,
    pub extra_features: bool,
    pub codon_table: bool,
}

impl Default for NpzOptions {
    fn default() -> Self {
        Self {
            nb_aa: CULLPDB_AA_CHANNELS,
            pssm: false,
            extra_features: false,
            codon_table: false,
        }
    }
}

impl NpzOptions {
    /// Feature rows of each returned `x` array.
    pub fn nb_features(&self) -> usize {
        let mut features = self.nb_aa;
        if self.pssm {
            features += self.nb_aa;
        }
        if self.extra_features {
            features += 2;
        }
        if self.codon_table {
            features += CODONS.len();
        }
        features
    }
}

fn format_error(msg: impl Into<String>) -> anyhow::Error {
    anyhow!(EvolutronError::format(msg))
}

/// Decodes a little-endian float `.npy` payload into `(shape, values)`.
pub fn read_npy<R: Read>(mut reader: R) -> Result<(Vec<usize>, Vec<f32>)> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if magic != NPY_MAGIC {
        return Err(format_error("not an .npy array"));
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = if version[0] == 1 {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        u16::from_le_bytes(len) as usize
    } else {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        u32::from_le_bytes(len) as usize
    };
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);
    let header = parse_literal(header.trim())
        .map_err(|e| format_error(format!("bad .npy header: {}", e)))?;

    if header.get("fortran_order").and_then(Literal::as_bool) != Some(false) {
        return Err(format_error("only C-ordered arrays are supported"));
    }
    let shape = header
        .get("shape")
        .and_then(Literal::items)
        .ok_or_else(|| format_error(".npy header has no shape"))?
        .iter()
        .map(|dim| {
            dim.as_int()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or_else(|| format_error("invalid .npy dimension"))
        })
        .collect::<Result<Vec<usize>>>()?;

    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let values: Vec<f32> = match header.get("descr").and_then(Literal::as_str) {
        Some("<f4") => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Some("<f8") => bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
        other => {
            return Err(format_error(format!(
                "unsupported .npy dtype {:?}",
                other.unwrap_or("<missing>")
            )))
        }
    };

    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(format_error(format!(
            ".npy payload holds {} values but shape {:?} needs {}",
            values.len(),
            shape,
            expected
        )));
    }
    Ok((shape, values))
}

/// Values of a `.npy` file, or of the first `.npy` member of an archive.
fn load_array(path: &Path) -> Result<Vec<f32>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read array file: {:?}", path))?;
    let (shape, values) = if bytes.starts_with(ZIP_MAGIC) {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .with_context(|| format!("Failed to open archive: {:?}", path))?;
        let index = (0..archive.len())
            .find(|&i| {
                archive
                    .by_index(i)
                    .map(|entry| entry.name().ends_with(".npy"))
                    .unwrap_or(false)
            })
            .ok_or_else(|| format_error(format!("{:?} contains no .npy member", path)))?;
        let entry = archive.by_index(index)?;
        log::debug!("Reading {} from {:?}", entry.name(), path);
        read_npy(entry)?
    } else {
        read_npy(Cursor::new(bytes))?
    };
    log::debug!("Loaded array of shape {:?} from {:?}", shape, path);
    Ok(values)
}

fn record_features(record: ArrayView2<f32>, options: &NpzOptions) -> Result<Array2<f32>> {
    let mut parts = vec![record.slice(s![.., ..options.nb_aa]).to_owned()];
    if options.pssm {
        parts.push(record.slice(s![.., 35..35 + options.nb_aa]).to_owned());
    }
    if options.extra_features {
        parts.push(record.slice(s![.., 31..33]).to_owned());
    }
    if options.codon_table {
        let residues = hot_to_aa(record.slice(s![.., 0..CULLPDB_AA_CHANNELS]));
        parts.push(aa_to_codon(&residues, PROFILE_LENGTH));
    }
    let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
    Ok(concatenate(Axis(1), &views)?)
}

/// Reads a profile array file. `x` arrays are `(features, 700)` and `y`
/// arrays the eight-class labels `(8, 700)`; padded positions are all zero.
pub fn npz_parser<P: AsRef<Path>>(path: P, options: &NpzOptions) -> Result<Dataset<Array2<f32>>> {
    let path = path.as_ref();
    if options.nb_aa == 0 || options.nb_aa > CULLPDB_AA_CHANNELS {
        return Err(anyhow!(EvolutronError::configuration(format!(
            "nb_aa must be between 1 and {}, got {}",
            CULLPDB_AA_CHANNELS, options.nb_aa
        ))));
    }

    let values = load_array(path)?;
    let record_size = PROFILE_LENGTH * PROFILE_CHANNELS;
    if values.is_empty() || values.len() % record_size != 0 {
        return Err(format_error(format!(
            "{} values cannot be reshaped to (-1, {}, {})",
            values.len(),
            PROFILE_LENGTH,
            PROFILE_CHANNELS
        )));
    }
    let n = values.len() / record_size;
    let data = Array3::from_shape_vec((n, PROFILE_LENGTH, PROFILE_CHANNELS), values)?;

    let pairs = (0..n)
        .into_par_iter()
        .map(|i| {
            let record = data.slice(s![i, .., ..]);
            let x = record_features(record, options)?.t().to_owned();
            let y = record.slice(s![.., 22..30]).t().to_owned();
            Ok((x, y))
        })
        .collect::<Result<Vec<(Array2<f32>, Array2<f32>)>>>()?;

    let mut dataset = Dataset::default();
    for (x, y) in pairs {
        dataset.push(x, y);
    }
    log::info!(
        "Read {} profiles with {} features from {:?}",
        dataset.len(),
        options.nb_features(),
        path
    );
    Ok(dataset)
}
