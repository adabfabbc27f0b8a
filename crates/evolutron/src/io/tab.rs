//! Tab-separated protein tables (UniProt-style exports) with family labels
//! derived from the `protein_families` column.
//!
//! The derived rows are cached as JSON next to the source. The cache records
//! the source's size and modification time and is rebuilt when either changes.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::building_blocks::featurize::SequenceEncoder;
use crate::error::EvolutronError;
use crate::io::Padding;
use crate::utils::data_handling::Dataset;

pub const UNASSIGNED: &str = "Unassigned";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinRow {
    pub sequence: String,
    pub family: String,
    pub superfamily: String,
    pub subfamily: String,
}

/// Family level used as the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKey {
    Family,
    Superfamily,
    Subfamily,
}

impl FromStr for FamilyKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fam" | "family" => Ok(FamilyKey::Family),
            "sup" | "superfamily" => Ok(FamilyKey::Superfamily),
            "sub" | "subfamily" => Ok(FamilyKey::Subfamily),
            other => Err(anyhow!(EvolutronError::configuration(format!(
                "unknown family key '{}'",
                other
            )))),
        }
    }
}

impl ProteinRow {
    pub fn label(&self, key: FamilyKey) -> &str {
        match key {
            FamilyKey::Family => &self.family,
            FamilyKey::Superfamily => &self.superfamily,
            FamilyKey::Subfamily => &self.subfamily,
        }
    }
}

/// First comma-separated entry of `families` containing `marker`.
fn family_entry(families: &str, marker: &str) -> String {
    families
        .split(',')
        .find(|entry| entry.contains(marker))
        .map(|entry| entry.trim().to_string())
        .unwrap_or_else(|| UNASSIGNED.to_string())
}

fn normalize_column(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

#[derive(Debug, Serialize, Deserialize)]
struct TabCache {
    source_len: u64,
    source_modified_secs: u64,
    source_modified_nanos: u32,
    rows: Vec<ProteinRow>,
}

/// Size and modification time of the source file.
fn source_identity(path: &Path) -> Result<(u64, u64, u32)> {
    let metadata =
        fs::metadata(path).with_context(|| format!("Failed to stat table: {:?}", path))?;
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    Ok((metadata.len(), modified.as_secs(), modified.subsec_nanos()))
}

pub fn cache_path(path: &Path) -> PathBuf {
    path.with_extension("cache.json")
}

fn load_cache(path: &Path, identity: (u64, u64, u32)) -> Option<Vec<ProteinRow>> {
    let text = fs::read_to_string(cache_path(path)).ok()?;
    let cache: TabCache = match serde_json::from_str(&text) {
        Ok(cache) => cache,
        Err(e) => {
            log::warn!("Ignoring unreadable table cache for {:?}: {}", path, e);
            return None;
        }
    };
    if (
        cache.source_len,
        cache.source_modified_secs,
        cache.source_modified_nanos,
    ) != identity
    {
        log::debug!("Table cache for {:?} is stale", path);
        return None;
    }
    Some(cache.rows)
}

fn parse_rows(path: &Path) -> Result<Vec<ProteinRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open table: {:?}", path))?;

    let headers: Vec<String> = reader.headers()?.iter().map(normalize_column).collect();
    let index_of = |name: &str| {
        headers.iter().position(|h| h == name).ok_or_else(|| {
            anyhow!(EvolutronError::format(format!(
                "table {:?} is missing column '{}'",
                path, name
            )))
        })
    };
    let sequence_idx = index_of("sequence")?;
    let families_idx = index_of("protein_families")?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read table: {:?}", path))?;
        let families = record.get(families_idx).unwrap_or("");
        rows.push(ProteinRow {
            sequence: record.get(sequence_idx).unwrap_or("").trim().to_ascii_uppercase(),
            family: family_entry(families, " family"),
            superfamily: family_entry(families, "superfamily"),
            subfamily: family_entry(families, "subfamily"),
        });
    }
    Ok(rows)
}

/// Rows of a tab table, served from the side cache when it is fresh.
pub fn read_table<P: AsRef<Path>>(path: P) -> Result<Vec<ProteinRow>> {
    let path = path.as_ref();
    let identity = source_identity(path)?;
    if let Some(rows) = load_cache(path, identity) {
        log::debug!("Loaded {} rows of {:?} from cache", rows.len(), path);
        return Ok(rows);
    }

    let rows = parse_rows(path)?;
    let cache = TabCache {
        source_len: identity.0,
        source_modified_secs: identity.1,
        source_modified_nanos: identity.2,
        rows,
    };
    let written = serde_json::to_string(&cache)
        .map_err(anyhow::Error::from)
        .and_then(|text| fs::write(cache_path(path), text).map_err(anyhow::Error::from));
    if let Err(e) = written {
        log::warn!("Could not write table cache for {:?}: {}", path, e);
    }
    Ok(cache.rows)
}

/// Encodes a tab table. With a `key`, labels are category codes over the
/// sorted distinct values of that family level: rows with code 0 are dropped
/// and the rest are labelled `code + 1`. Without a key every row is kept and
/// unlabelled.
pub fn tab_parser<P: AsRef<Path>>(
    path: P,
    key: Option<FamilyKey>,
    alphabet_size: usize,
    padding: Padding,
) -> Result<Dataset<Option<usize>>> {
    let path = path.as_ref();
    let rows = read_table(path)?;
    let encoder = SequenceEncoder::new(alphabet_size)?;

    let categories: Vec<&str> = match key {
        Some(key) => rows
            .iter()
            .map(|r| r.label(key))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        None => Vec::new(),
    };

    let mut data = Dataset::default();
    for row in &rows {
        let label = match key {
            Some(key) => match categories.binary_search(&row.label(key)) {
                Ok(0) | Err(_) => continue,
                Ok(code) => Some(code + 1),
            },
            None => None,
        };
        match encoder.encode(&row.sequence) {
            Ok(x) => data.push(x, label),
            Err(e) => {
                log::trace!("Dropping row: {}", e);
                data.skip();
            }
        }
    }

    if data.skipped > 0 {
        log::warn!("Skipped {} rows with unknown residues in {:?}", data.skipped, path);
    }
    log::info!(
        "Read {} of {} rows from {:?} ({} categories)",
        data.len(),
        rows.len(),
        path,
        categories.len()
    );
    padding.apply(&mut data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_table(name: &str) -> PathBuf {
        let body = "Entry\tSequence\tProtein families \n\
            P1\tMKV\tProtein kinase superfamily, CAMK family, Sub1 subfamily\n\
            P2\tACD\tABC family\n\
            P3\tWWY\t\n\
            P4\tMKX\tCAMK family\n";
        let path = std::env::temp_dir().join(name);
        fs::write(&path, body).unwrap();
        fs::remove_file(cache_path(&path)).ok();
        path
    }

    #[test]
    fn test_family_entry() {
        let families = "Protein kinase superfamily, CAMK Ser/Thr family, PIM subfamily";
        assert_eq!(family_entry(families, " family"), "CAMK Ser/Thr family");
        assert_eq!(family_entry(families, "superfamily"), "Protein kinase superfamily");
        assert_eq!(family_entry(families, "subfamily"), "PIM subfamily");
        assert_eq!(family_entry("", " family"), UNASSIGNED);
    }

    #[test]
    fn test_codes_drop_first_category() {
        let path = write_table("evolutron_tab_codes.tab");
        let data = tab_parser(&path, Some(FamilyKey::Family), 20, Padding::default()).unwrap();
        fs::remove_file(cache_path(&path)).ok();
        fs::remove_file(&path).ok();

        // sorted categories: "ABC family", "CAMK family", "Unassigned"
        assert_eq!(data.len(), 2);
        assert_eq!(data.y, vec![Some(2), Some(3)]);
        // the X-containing CAMK row is skipped, not aborted
        assert_eq!(data.skipped, 1);
    }

    #[test]
    fn test_cache_roundtrip_and_invalidation() {
        let path = write_table("evolutron_tab_cache.tab");
        let first = read_table(&path).unwrap();
        assert!(cache_path(&path).exists());
        let cached = read_table(&path).unwrap();
        assert_eq!(first, cached);

        fs::write(&path, "Sequence\tProtein families\nAAA\tXYZ family\n").unwrap();
        let rebuilt = read_table(&path).unwrap();
        fs::remove_file(cache_path(&path)).ok();
        fs::remove_file(&path).ok();

        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].family, "XYZ family");
    }

    #[test]
    fn test_without_key_keeps_all_rows() {
        let path = write_table("evolutron_tab_nokey.tab");
        let data = tab_parser(&path, None, 22, Padding::default()).unwrap();
        fs::remove_file(cache_path(&path)).ok();
        fs::remove_file(&path).ok();
        assert_eq!(data.len(), 4);
        assert!(data.y.iter().all(Option::is_none));
    }

    #[test]
    fn test_fixed_padding() {
        let path = write_table("evolutron_tab_padding.tab");
        let data = tab_parser(
            &path,
            Some(FamilyKey::Family),
            20,
            Padding::Fixed { max_len: Some(6) },
        )
        .unwrap();
        fs::remove_file(cache_path(&path)).ok();
        fs::remove_file(&path).ok();

        assert!(data.x.iter().all(|x| x.dim() == (20, 6)));
        let first = &data.x[0];
        assert_eq!(first.column(2).sum(), 1.0);
        for j in 3..6 {
            assert_eq!(first.column(j).sum(), 0.0);
        }
        // class labels are per sequence and untouched by padding
        assert_eq!(data.y, vec![Some(2), Some(3)]);
    }
}
