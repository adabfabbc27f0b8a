use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::building_blocks::featurize::ALPHABET_WHITELIST;
use crate::error::EvolutronError;
use crate::utils::literal::{parse_literal, Literal};

/// Network family assembled by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Multiscale dilated convolution blocks with skip paths, optional
    /// bidirectional LSTM blocks and locally-connected blocks.
    #[default]
    Multiscale,
    /// Plain convolution stack, optional LSTM with `nb_categories` units and
    /// fully-connected layers over the flattened sequence.
    Sequential,
}

/// A count that is either shared by every layer or given per layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerParam {
    Scalar(usize),
    PerLayer(Vec<usize>),
}

impl LayerParam {
    /// Value for layer `i`; lists shorter than the layer count repeat their
    /// last entry.
    pub fn get(&self, i: usize) -> Option<usize> {
        match self {
            LayerParam::Scalar(v) => Some(*v),
            LayerParam::PerLayer(values) => values.get(i).or_else(|| values.last()).copied(),
        }
    }

    fn values(&self) -> Vec<usize> {
        match self {
            LayerParam::Scalar(v) => vec![*v],
            LayerParam::PerLayer(values) => values.clone(),
        }
    }
}

impl Default for LayerParam {
    fn default() -> Self {
        LayerParam::Scalar(100)
    }
}

/// Convolution filter lengths: one per multiscale branch.
///
/// Accepted forms are a positive integer, a list of positive integers, or a
/// string holding either (`"5"`, `"[3, 5, 7]"`). Anything else is a
/// configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FilterLengthsRepr", into = "Vec<usize>")]
pub struct FilterLengths(Vec<usize>);

#[derive(Deserialize)]
#[serde(untagged)]
enum FilterLengthsRepr {
    Scalar(i64),
    List(Vec<i64>),
    Text(String),
}

impl FilterLengths {
    pub fn new(lengths: Vec<usize>) -> Result<Self> {
        if lengths.is_empty() {
            return Err(anyhow!(EvolutronError::configuration(
                "filter length list is empty"
            )));
        }
        if lengths.contains(&0) {
            return Err(anyhow!(EvolutronError::configuration(format!(
                "filter lengths must be positive, got {:?}",
                lengths
            ))));
        }
        Ok(Self(lengths))
    }

    /// Parses `"7"` or `"[3, 5, 7]"`.
    pub fn parse(text: &str) -> Result<Self> {
        let literal = parse_literal(text).map_err(|e| {
            anyhow!(EvolutronError::configuration(format!(
                "malformed filter length '{}': {}",
                text, e
            )))
        })?;
        match &literal {
            Literal::Int(v) => Self::from_ints(&[*v]),
            Literal::List(items) => {
                let ints: Option<Vec<i64>> = items.iter().map(Literal::as_int).collect();
                match ints {
                    Some(ints) => Self::from_ints(&ints),
                    None => Err(anyhow!(EvolutronError::configuration(format!(
                        "filter length list '{}' must contain integers only",
                        text
                    )))),
                }
            }
            _ => Err(anyhow!(EvolutronError::configuration(format!(
                "filter length '{}' must be an integer or a list of integers",
                text
            )))),
        }
    }

    fn from_ints(values: &[i64]) -> Result<Self> {
        let lengths = values
            .iter()
            .map(|&v| {
                usize::try_from(v).map_err(|_| {
                    anyhow!(EvolutronError::configuration(format!(
                        "filter length {} is negative",
                        v
                    )))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Self::new(lengths)
    }

    pub fn values(&self) -> &[usize] {
        &self.0
    }

    pub fn first(&self) -> usize {
        self.0[0]
    }
}

impl Default for FilterLengths {
    fn default() -> Self {
        FilterLengths(vec![3])
    }
}

impl TryFrom<FilterLengthsRepr> for FilterLengths {
    type Error = EvolutronError;

    fn try_from(repr: FilterLengthsRepr) -> std::result::Result<Self, Self::Error> {
        let parsed = match repr {
            FilterLengthsRepr::Scalar(v) => FilterLengths::from_ints(&[v]),
            FilterLengthsRepr::List(values) => FilterLengths::from_ints(&values),
            FilterLengthsRepr::Text(text) => FilterLengths::parse(&text),
        };
        parsed.map_err(|e| match e.downcast::<EvolutronError>() {
            Ok(kind) => kind,
            Err(other) => EvolutronError::configuration(other.to_string()),
        })
    }
}

impl From<FilterLengths> for Vec<usize> {
    fn from(lengths: FilterLengths) -> Self {
        lengths.0
    }
}

/// Immutable hyperparameter record consumed by the network builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureSpec {
    pub variant: Variant,
    /// `(seq_length, alphabet_size)`
    pub input_shape: Vec<usize>,
    pub n_conv_layers: usize,
    pub n_fc_layers: usize,
    /// Filters per convolution block; with a list, entries past the conv
    /// blocks size the locally-connected blocks.
    pub nb_filter: LayerParam,
    pub filter_length: FilterLengths,
    /// Block `i` dilates its multiscale convolutions by `dilation_rate^i`.
    pub dilation_rate: usize,
    /// Number of recurrent blocks; 0 disables the recurrent stage.
    pub use_lstm: usize,
    pub lstm_units: usize,
    pub fc_filter_length: usize,
    pub dropout: f32,
    /// Weight decay applied by the optimizer.
    pub l2: f64,
    pub nb_categories: usize,
}

impl Default for ArchitectureSpec {
    fn default() -> Self {
        ArchitectureSpec {
            variant: Variant::Multiscale,
            input_shape: vec![700, 22],
            n_conv_layers: 1,
            n_fc_layers: 0,
            nb_filter: LayerParam::default(),
            filter_length: FilterLengths::default(),
            dilation_rate: 2,
            use_lstm: 0,
            lstm_units: 100,
            fc_filter_length: 11,
            dropout: 0.3,
            l2: 0.0,
            nb_categories: 8,
        }
    }
}

fn config_error(msg: String) -> anyhow::Error {
    anyhow!(EvolutronError::configuration(msg))
}

impl ArchitectureSpec {
    pub fn new(seq_length: usize, alphabet: usize, nb_categories: usize) -> Self {
        Self {
            input_shape: vec![seq_length, alphabet],
            nb_categories,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let spec: ArchitectureSpec = serde_json::from_str(json)
            .map_err(|e| config_error(format!("invalid architecture: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read architecture file: {:?}", path))?;
        Self::from_json(&json)
    }

    pub fn seq_length(&self) -> usize {
        self.input_shape.first().copied().unwrap_or(0)
    }

    pub fn alphabet(&self) -> usize {
        self.input_shape.get(1).copied().unwrap_or(0)
    }

    /// Filters of convolution block `block`.
    pub fn conv_filters(&self, block: usize) -> usize {
        self.nb_filter.get(block).unwrap_or(0)
    }

    /// Filters of locally-connected block `block`.
    pub fn fc_filters(&self, block: usize) -> usize {
        self.nb_filter.get(self.n_conv_layers + block).unwrap_or(0)
    }

    pub fn dilation(&self, block: usize) -> Result<usize> {
        u32::try_from(block)
            .ok()
            .and_then(|exp| self.dilation_rate.checked_pow(exp))
            .ok_or_else(|| {
                config_error(format!(
                    "dilation {}^{} overflows",
                    self.dilation_rate, block
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_shape.len() != 2 {
            return Err(config_error(format!(
                "Unrecognizable input dimensions {:?}, expected (seq_length, alphabet)",
                self.input_shape
            )));
        }
        if !ALPHABET_WHITELIST.contains(&self.alphabet()) {
            return Err(config_error(format!(
                "Input dimensions error, alphabet size {} is not one of {:?} (check order)",
                self.alphabet(),
                ALPHABET_WHITELIST
            )));
        }
        if self.seq_length() == 0 {
            return Err(config_error("sequence length must be positive".to_string()));
        }
        if self.nb_categories == 0 {
            return Err(config_error("nb_categories must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(config_error(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.l2.is_nan() || self.l2 < 0.0 {
            return Err(config_error(format!("l2 must be non-negative, got {}", self.l2)));
        }
        if self.n_conv_layers == 0 && self.use_lstm == 0 && self.n_fc_layers == 0 {
            return Err(config_error(
                "degenerate network: n_conv_layers, use_lstm and n_fc_layers are all zero"
                    .to_string(),
            ));
        }
        let filters = self.nb_filter.values();
        if filters.is_empty() || filters.contains(&0) {
            return Err(config_error(format!(
                "nb_filter must be positive, got {:?}",
                self.nb_filter
            )));
        }
        if self.dilation_rate == 0 {
            return Err(config_error("dilation_rate must be positive".to_string()));
        }
        if self.n_conv_layers > 0 {
            self.dilation(self.n_conv_layers - 1)?;
        }
        if self.use_lstm > 0 && self.lstm_units == 0 {
            return Err(config_error("lstm_units must be positive".to_string()));
        }
        if self.n_fc_layers > 0 && self.variant == Variant::Multiscale && self.fc_filter_length == 0
        {
            return Err(config_error("fc_filter_length must be positive".to_string()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    fn is_configuration_error(err: &anyhow::Error) -> bool {
        matches!(kind_of(err), Some(EvolutronError::Configuration(_)))
    }

    #[test]
    fn test_filter_lengths_forms() {
        assert_eq!(FilterLengths::parse("7").unwrap().values(), &[7]);
        assert_eq!(FilterLengths::parse("[3, 5, 7]").unwrap().values(), &[3, 5, 7]);

        for bad in ["[3, 'a']", "[]", "[-1]", "3.5", "range(3)", "[3, [5]]", "(3, 5)"] {
            let err = FilterLengths::parse(bad).unwrap_err();
            assert!(is_configuration_error(&err), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_deeply_nested_filter_length_is_configuration_error() {
        let err = FilterLengths::parse(&"[".repeat(1_000_000)).unwrap_err();
        assert!(is_configuration_error(&err));
    }

    #[test]
    fn test_spec_from_json_accepts_all_filter_forms() {
        for form in ["5", "[3, 5]", "\"[3, 5]\"", "\"5\""] {
            let json = format!(
                r#"{{"input_shape": [50, 20], "filter_length": {}, "nb_categories": 3}}"#,
                form
            );
            let spec = ArchitectureSpec::from_json(&json).unwrap();
            assert_eq!(spec.filter_length.first(), if form.contains('3') { 3 } else { 5 });
        }
        let err = ArchitectureSpec::from_json(r#"{"filter_length": "[3, x]"}"#).unwrap_err();
        assert!(is_configuration_error(&err));
    }

    #[test]
    fn test_validate_input_shape() {
        let spec = ArchitectureSpec {
            input_shape: vec![100, 20, 1],
            ..Default::default()
        };
        assert!(is_configuration_error(&spec.validate().unwrap_err()));

        let spec = ArchitectureSpec::new(100, 21, 8);
        assert!(is_configuration_error(&spec.validate().unwrap_err()));

        for alphabet in [4, 20, 22] {
            assert!(ArchitectureSpec::new(100, alphabet, 8).validate().is_ok());
        }
    }

    #[test]
    fn test_degenerate_network_rejected() {
        let spec = ArchitectureSpec {
            n_conv_layers: 0,
            use_lstm: 0,
            n_fc_layers: 0,
            ..ArchitectureSpec::new(100, 20, 8)
        };
        assert!(is_configuration_error(&spec.validate().unwrap_err()));
    }

    #[test]
    fn test_per_layer_filters() {
        let spec = ArchitectureSpec {
            n_conv_layers: 2,
            n_fc_layers: 2,
            nb_filter: LayerParam::PerLayer(vec![64, 32, 16]),
            ..ArchitectureSpec::new(100, 20, 8)
        };
        assert_eq!(spec.conv_filters(0), 64);
        assert_eq!(spec.conv_filters(1), 32);
        assert_eq!(spec.fc_filters(0), 16);
        assert_eq!(spec.fc_filters(1), 16);
        assert_eq!(spec.dilation(0).unwrap(), 1);
        assert_eq!(spec.dilation(3).unwrap(), 8);
    }

    #[test]
    fn test_json_roundtrip() {
        let spec = ArchitectureSpec {
            filter_length: FilterLengths::new(vec![3, 9]).unwrap(),
            use_lstm: 1,
            ..ArchitectureSpec::new(64, 22, 3)
        };
        let json = spec.to_json().unwrap();
        assert_eq!(ArchitectureSpec::from_json(&json).unwrap(), spec);
    }
}
