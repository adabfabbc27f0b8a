use anyhow::{anyhow, Result};
use ndarray::{Array2, ArrayView2, Axis};
use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::error::EvolutronError;

/// The 20 standard amino acids.
pub const AA_20: &str = "ACDEFGHIKLMNPQRSTVWY";
/// Standard amino acids plus the ambiguity code `X` and the stop code `*`.
pub const AA_22: &str = "ACDEFGHIKLMNPQRSTVWYX*";
/// Nucleotides.
pub const NT_4: &str = "ACGT";
/// Channel order of the CullPDB / CB513 profile arrays. The 22nd channel is
/// the `NoSeq` padding marker and decodes to nothing.
pub const CULLPDB_AA: &str = "ACEDGFIHKMLNQPSRTWVYX";
/// Eight-class DSSP labels in CullPDB channel order (`L` is coil).
pub const SECS_8: &str = "LBEGIHST";
/// Three-class labels: helix, strand, coil.
pub const SECS_3: &str = "HEC";

/// Alphabet sizes accepted by the encoder and the network builder.
pub const ALPHABET_WHITELIST: [usize; 3] = [4, 20, 22];

fn index_map(symbols: &str) -> HashMap<char, usize> {
    symbols.chars().enumerate().map(|(i, c)| (c, i)).collect()
}

pub static AA_20_MAP: Lazy<HashMap<char, usize>> = Lazy::new(|| index_map(AA_20));
pub static AA_22_MAP: Lazy<HashMap<char, usize>> = Lazy::new(|| index_map(AA_22));
pub static NT_MAP: Lazy<HashMap<char, usize>> = Lazy::new(|| index_map(NT_4));
pub static SECS_8_MAP: Lazy<HashMap<char, usize>> = Lazy::new(|| {
    let mut map = index_map(SECS_8);
    // DSSP writes coil as blank, '-' or 'C' depending on the exporter
    map.insert('-', 0);
    map.insert(' ', 0);
    map.insert('C', 0);
    map
});

/// Many-to-one collapse of the eight DSSP classes onto helix / strand / coil:
/// H, G, I -> H; E, B -> E; L, S, T -> C.
pub static SECS_8_TO_3: Lazy<HashMap<char, char>> = Lazy::new(|| {
    [
        ('H', 'H'),
        ('G', 'H'),
        ('I', 'H'),
        ('E', 'E'),
        ('B', 'E'),
        ('L', 'C'),
        ('S', 'C'),
        ('T', 'C'),
    ]
    .into_iter()
    .collect()
});

/// All 64 codons in lexicographic order over `ACGT`.
pub static CODONS: Lazy<Vec<String>> = Lazy::new(|| {
    let mut codons = Vec::with_capacity(64);
    for a in NT_4.chars() {
        for b in NT_4.chars() {
            for c in NT_4.chars() {
                codons.push(format!("{}{}{}", a, b, c));
            }
        }
    }
    codons
});

pub static CODON_MAP: Lazy<HashMap<String, usize>> =
    Lazy::new(|| CODONS.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect());

/// Most frequent human codon for each amino acid; used to lift protein inputs
/// into codon space.
pub static AA_TO_CODON: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    [
        ('A', "GCC"),
        ('C', "TGC"),
        ('D', "GAC"),
        ('E', "GAG"),
        ('F', "TTC"),
        ('G', "GGC"),
        ('H', "CAC"),
        ('I', "ATC"),
        ('K', "AAG"),
        ('L', "CTG"),
        ('M', "ATG"),
        ('N', "AAC"),
        ('P', "CCC"),
        ('Q', "CAG"),
        ('R', "CGG"),
        ('S', "AGC"),
        ('T', "ACC"),
        ('V', "GTG"),
        ('W', "TGG"),
        ('Y', "TAC"),
        ('*', "TGA"),
    ]
    .into_iter()
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alphabet {
    Nucleotide,
    AminoAcid20,
    AminoAcid22,
}

impl Alphabet {
    pub fn from_size(size: usize) -> Result<Self> {
        match size {
            4 => Ok(Alphabet::Nucleotide),
            20 => Ok(Alphabet::AminoAcid20),
            22 => Ok(Alphabet::AminoAcid22),
            other => Err(anyhow!(EvolutronError::configuration(format!(
                "alphabet size {} is not one of {:?}",
                other, ALPHABET_WHITELIST
            )))),
        }
    }

    pub fn size(&self) -> usize {
        self.symbols().len()
    }

    pub fn symbols(&self) -> &'static str {
        match self {
            Alphabet::Nucleotide => NT_4,
            Alphabet::AminoAcid20 => AA_20,
            Alphabet::AminoAcid22 => AA_22,
        }
    }

    pub fn index_of(&self, symbol: char) -> Option<usize> {
        let symbol = symbol.to_ascii_uppercase();
        match self {
            Alphabet::Nucleotide => NT_MAP.get(&symbol).copied(),
            Alphabet::AminoAcid20 => AA_20_MAP.get(&symbol).copied(),
            Alphabet::AminoAcid22 => AA_22_MAP.get(&symbol).copied(),
        }
    }

    pub fn symbol_at(&self, index: usize) -> Option<char> {
        self.symbols().chars().nth(index)
    }
}

/// What to do with a symbol that has no entry in the alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmbiguityPolicy {
    /// Fail with a `DecodeError`.
    #[default]
    Strict,
    /// Leave the column all zero.
    Zero,
    /// Set a fixed column instead.
    Column(usize),
}

/// One-hot encoder producing `(alphabet_size, length)` arrays.
#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    alphabet: Alphabet,
    policy: AmbiguityPolicy,
}

impl SequenceEncoder {
    pub fn new(alphabet_size: usize) -> Result<Self> {
        Ok(Self {
            alphabet: Alphabet::from_size(alphabet_size)?,
            policy: AmbiguityPolicy::Strict,
        })
    }

    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn alphabet(&self) -> Alphabet {
        self.alphabet
    }

    pub fn encode(&self, sequence: &str) -> Result<Array2<f32>> {
        let symbols: Vec<char> = sequence.trim().chars().collect();
        let width = symbols.len();
        let mut encoded = Array2::<f32>::zeros((self.alphabet.size(), width));
        for (j, &symbol) in symbols.iter().enumerate() {
            match self.alphabet.index_of(symbol) {
                Some(row) => encoded[[row, j]] = 1.0,
                None => match self.policy {
                    AmbiguityPolicy::Strict => {
                        return Err(anyhow!(EvolutronError::Decode {
                            symbol,
                            position: j
                        }))
                    }
                    AmbiguityPolicy::Zero => {}
                    AmbiguityPolicy::Column(row) if row < self.alphabet.size() => {
                        encoded[[row, j]] = 1.0
                    }
                    AmbiguityPolicy::Column(row) => {
                        return Err(anyhow!(EvolutronError::configuration(format!(
                            "designated column {} is outside an alphabet of size {}",
                            row,
                            self.alphabet.size()
                        ))))
                    }
                },
            }
        }
        Ok(encoded)
    }
}

/// Strict one-hot encoding of `sequence` over the alphabet of the given size.
pub fn encode(sequence: &str, alphabet_size: usize) -> Result<Array2<f32>> {
    SequenceEncoder::new(alphabet_size)?.encode(sequence)
}

/// Arg-max decoding of a `(alphabet_size, length)` array. All-zero columns are
/// padding and produce no symbol. Lossy for inputs that are not near one-hot.
pub fn decode(encoded: ArrayView2<f32>) -> Result<String> {
    let alphabet = Alphabet::from_size(encoded.nrows())?;
    let mut out = String::with_capacity(encoded.ncols());
    for column in encoded.axis_iter(Axis(1)) {
        if let Some(row) = argmax(column.iter().copied()) {
            if let Some(symbol) = alphabet.symbol_at(row) {
                out.push(symbol);
            }
        }
    }
    Ok(out)
}

/// Index of the largest value, or `None` when every value is zero.
pub fn argmax(values: impl Iterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.enumerate() {
        if v != 0.0 && best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecSScheme {
    EightClass,
    ThreeClass,
}

impl SecSScheme {
    pub fn from_categories(nb_categories: usize) -> Result<Self> {
        match nb_categories {
            8 => Ok(SecSScheme::EightClass),
            3 => Ok(SecSScheme::ThreeClass),
            other => Err(anyhow!(EvolutronError::configuration(format!(
                "Number of categories should be 8 or 3, got {}",
                other
            )))),
        }
    }

    pub fn nb_categories(&self) -> usize {
        match self {
            SecSScheme::EightClass => 8,
            SecSScheme::ThreeClass => 3,
        }
    }

    pub fn labels(&self) -> &'static str {
        match self {
            SecSScheme::EightClass => SECS_8,
            SecSScheme::ThreeClass => SECS_3,
        }
    }
}

/// Collapses an eight-class label onto the three-class scheme.
pub fn collapse_8_to_3(label: char) -> Option<char> {
    let label = label.to_ascii_uppercase();
    let canonical = SECS_8_MAP.get(&label).and_then(|&i| SECS_8.chars().nth(i))?;
    SECS_8_TO_3.get(&canonical).copied()
}

/// One-hot encodes a secondary-structure string into `(nb_categories, length)`.
pub fn secs_to_hot(labels: &str, scheme: SecSScheme) -> Result<Array2<f32>> {
    let labels: Vec<char> = labels.trim_end_matches(['\n', '\r']).chars().collect();
    let mut encoded = Array2::<f32>::zeros((scheme.nb_categories(), labels.len()));
    for (j, &label) in labels.iter().enumerate() {
        let row = match scheme {
            SecSScheme::EightClass => SECS_8_MAP.get(&label.to_ascii_uppercase()).copied(),
            SecSScheme::ThreeClass => {
                collapse_8_to_3(label).and_then(|c| SECS_3.chars().position(|s| s == c))
            }
        };
        match row {
            Some(row) => encoded[[row, j]] = 1.0,
            None => {
                return Err(anyhow!(EvolutronError::Decode {
                    symbol: label,
                    position: j
                }))
            }
        }
    }
    Ok(encoded)
}

/// Nucleotide encoding of a DNA string, flattened position-major
/// (`length * 4` values).
pub fn nt_to_flat(sequence: &str) -> Result<Vec<f32>> {
    let encoded = encode(sequence, NT_4.len())?;
    Ok(encoded.t().iter().copied().collect())
}

/// Decodes CullPDB amino-acid channels `(length, 22)` into a string. `NoSeq`
/// and empty positions are dropped.
pub fn hot_to_aa(profile: ArrayView2<f32>) -> String {
    profile
        .axis_iter(Axis(0))
        .filter_map(|row| argmax(row.iter().copied()))
        .filter_map(|i| CULLPDB_AA.chars().nth(i))
        .collect()
}

/// Codon one-hot `(length, 64)` of each residue's representative codon;
/// residues without one (e.g. `X`) stay all zero.
pub fn aa_to_codon(sequence: &str, length: usize) -> Array2<f32> {
    let mut encoded = Array2::<f32>::zeros((length, CODONS.len()));
    for (j, aa) in sequence.chars().take(length).enumerate() {
        if let Some(idx) = AA_TO_CODON
            .get(&aa.to_ascii_uppercase())
            .and_then(|codon| CODON_MAP.get(*codon))
        {
            encoded[[j, *idx]] = 1.0;
        }
    }
    encoded
}
