//! FASTA readers: plain sequence files, files with per-record codes, and
//! interleaved sequence / secondary-structure files.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::Array2;

use crate::building_blocks::featurize::{
    nt_to_flat, secs_to_hot, AmbiguityPolicy, SecSScheme, SequenceEncoder,
};
use crate::error::EvolutronError;
use crate::io::Padding;
use crate::utils::data_handling::Dataset;

#[derive(Debug, Clone, PartialEq)]
pub struct FastaRecord {
    pub id: String,
    pub desc: Option<String>,
    pub seq: String,
}

impl FastaRecord {
    /// The full header line without the leading `>`.
    pub fn description(&self) -> String {
        match &self.desc {
            Some(desc) => format!("{} {}", self.id, desc),
            None => self.id.clone(),
        }
    }
}

pub struct FastaReader<R: BufRead> {
    reader: R,
    buf: String,
    done: bool,
    peek_header: Option<String>,
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            done: false,
            peek_header: None,
        }
    }

    pub fn next_record(&mut self) -> Result<Option<FastaRecord>> {
        if self.done {
            return Ok(None);
        }

        let header = if let Some(h) = self.peek_header.take() {
            h
        } else {
            loop {
                self.buf.clear();
                let n = self.reader.read_line(&mut self.buf)?;
                if n == 0 {
                    self.done = true;
                    return Ok(None);
                }
                if let Some(h) = self.buf.strip_prefix('>') {
                    break h.trim().to_string();
                }
            }
        };

        let mut parts = header.splitn(2, char::is_whitespace);
        let id = parts.next().unwrap_or("").to_string();
        let desc = parts
            .next()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut seq = String::new();
        loop {
            self.buf.clear();
            let n = self.reader.read_line(&mut self.buf)?;
            if n == 0 {
                self.done = true;
                break;
            }
            if let Some(h) = self.buf.strip_prefix('>') {
                self.peek_header = Some(h.trim().to_string());
                break;
            }
            seq.extend(
                self.buf
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .map(|c| c.to_ascii_uppercase()),
            );
        }

        Ok(Some(FastaRecord { id, desc, seq }))
    }
}

impl<R: BufRead> Iterator for FastaReader<R> {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Reads every record of a FASTA file.
pub fn read_fasta<P: AsRef<Path>>(path: P) -> Result<Vec<FastaRecord>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open FASTA file: {:?}", path))?;
    FastaReader::new(BufReader::new(file))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Failed to read FASTA file: {:?}", path))
}

/// Which per-record target to extract from FASTA headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeKind {
    #[default]
    None,
    /// Last `|`-separated field of the header (SCOP-style class labels).
    LastField,
    /// Type-II restriction enzyme recognition site: the last whitespace token
    /// of the header, nucleotide-encoded and flattened.
    RecognitionSite,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FastaCode {
    None,
    Label(String),
    Site(Vec<f32>),
}

#[derive(Debug, Clone)]
pub struct FastaOptions {
    pub alphabet_size: usize,
    pub codes: CodeKind,
    /// Symbols outside the alphabet fail the record under `Strict`.
    pub policy: AmbiguityPolicy,
    pub padding: Padding,
}

impl Default for FastaOptions {
    fn default() -> Self {
        Self {
            alphabet_size: 20,
            codes: CodeKind::None,
            policy: AmbiguityPolicy::Strict,
            padding: Padding::default(),
        }
    }
}

/// Recognition site of a REBASE-style header, one-hot over `ACGT` and
/// flattened position-major.
pub fn type2p_code(description: &str) -> Result<Vec<f32>> {
    let site = description.split_whitespace().last().ok_or_else(|| {
        anyhow!(EvolutronError::format("empty description has no recognition site"))
    })?;
    nt_to_flat(site)
}

fn record_code(record: &FastaRecord, kind: CodeKind) -> Result<FastaCode> {
    match kind {
        CodeKind::None => Ok(FastaCode::None),
        CodeKind::LastField => {
            let description = record.description();
            let label = description.rsplit('|').next().unwrap_or_default();
            Ok(FastaCode::Label(label.trim().to_string()))
        }
        CodeKind::RecognitionSite => Ok(FastaCode::Site(type2p_code(&record.description())?)),
    }
}

/// Encodes every record of a FASTA file, optionally with a code per record.
/// Records that fail to encode are skipped and counted.
pub fn fasta_parser<P: AsRef<Path>>(path: P, options: &FastaOptions) -> Result<Dataset<FastaCode>> {
    let path = path.as_ref();
    let encoder = SequenceEncoder::new(options.alphabet_size)?.with_policy(options.policy);

    let mut data = Dataset::default();
    for record in read_fasta(path)? {
        let encoded = encoder
            .encode(&record.seq)
            .and_then(|x| Ok((x, record_code(&record, options.codes)?)));
        match encoded {
            Ok((x, code)) => data.push(x, code),
            Err(e) => {
                log::debug!("Skipping record {}: {}", record.id, e);
                data.skip();
            }
        }
    }

    if data.skipped > 0 {
        log::warn!("Skipped {} malformed records in {:?}", data.skipped, path);
    }
    options.padding.apply(&mut data);
    log::info!("Read {} records from {:?}", data.len(), path);
    Ok(data)
}

/// Reads interleaved sequence / secondary-structure records. Odd records are
/// amino-acid sequences, even records their per-residue labels.
///
/// An odd record count is a format error. Pairs whose symbols cannot be
/// encoded, or whose two strings differ in length, are skipped and counted.
/// Padding applies to the label arrays too; padded label columns are all zero.
pub fn secs_parser<P: AsRef<Path>>(
    path: P,
    nb_categories: usize,
    alphabet_size: usize,
    padding: Padding,
) -> Result<Dataset<Array2<f32>>> {
    let path = path.as_ref();
    let scheme = SecSScheme::from_categories(nb_categories)?;
    let encoder = SequenceEncoder::new(alphabet_size)?;

    let records = read_fasta(path)?;
    if records.len() % 2 != 0 {
        return Err(anyhow!(EvolutronError::format(format!(
            "{:?} holds {} records; sequence and structure records must alternate",
            path,
            records.len()
        ))));
    }

    let mut data = Dataset::default();
    for pair in records.chunks_exact(2) {
        let (sequence, structure) = (&pair[0], &pair[1]);
        if sequence.seq.len() != structure.seq.len() {
            log::debug!(
                "Skipping {}: {} residues but {} labels",
                sequence.id,
                sequence.seq.len(),
                structure.seq.len()
            );
            data.skip();
            continue;
        }
        match encoder
            .encode(&sequence.seq)
            .and_then(|x| Ok((x, secs_to_hot(&structure.seq, scheme)?)))
        {
            Ok((x, y)) => data.push(x, y),
            Err(e) => {
                log::debug!("Skipping {}: {}", sequence.id, e);
                data.skip();
            }
        }
    }

    if data.skipped > 0 {
        log::warn!("Skipped {} malformed record pairs in {:?}", data.skipped, path);
    }
    padding.apply_with_targets(&mut data);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_multiline_fasta() {
        let data = b">sp|P1|ONE first protein\nMKV\nla\n>two\n\nAAA\n";
        let mut r = FastaReader::new(Cursor::new(&data[..]));

        let r1 = r.next_record().unwrap().unwrap();
        assert_eq!(r1.id, "sp|P1|ONE");
        assert_eq!(r1.desc.as_deref(), Some("first protein"));
        assert_eq!(r1.seq, "MKVLA");

        let r2 = r.next_record().unwrap().unwrap();
        assert_eq!(r2.description(), "two");
        assert_eq!(r2.seq, "AAA");

        assert!(r.next_record().unwrap().is_none());
    }

    #[test]
    fn parse_crlf_and_leading_lines() {
        let data = b"\r\n>a x\r\nAC D\r\n";
        let records: Vec<FastaRecord> = FastaReader::new(Cursor::new(&data[..]))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, "ACD");
    }

    #[test]
    fn test_type2p_code() {
        let code = type2p_code("EcoRI Escherichia coli GAATTC").unwrap();
        assert_eq!(code.len(), 24);
        assert_eq!(&code[0..4], &[0.0, 0.0, 1.0, 0.0]);
        assert!(type2p_code("EcoRI site NNN").is_err());
    }

    #[test]
    fn test_last_field_code() {
        let record = FastaRecord {
            id: "d1a|b.1.1".to_string(),
            desc: Some("x|1000002".to_string()),
            seq: "ACD".to_string(),
        };
        assert_eq!(
            record_code(&record, CodeKind::LastField).unwrap(),
            FastaCode::Label("1000002".to_string())
        );
    }

    #[test]
    fn test_tolerant_policy_keeps_ambiguous_records() {
        let path = std::env::temp_dir().join("evolutron_fasta_policy.fasta");
        std::fs::write(&path, ">a\nMKBV\n>b\nMKV\n").unwrap();
        let strict = fasta_parser(&path, &FastaOptions::default()).unwrap();
        let tolerant = fasta_parser(
            &path,
            &FastaOptions {
                policy: AmbiguityPolicy::Zero,
                ..Default::default()
            },
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((strict.len(), strict.skipped), (1, 1));
        assert_eq!(tolerant.len(), 2);
        assert_eq!(tolerant.x[0].column(2).sum(), 0.0);
    }
}
