//! Artifact naming.
//!
//! A [`Handle`] renders as
//! `<dataset>/<filters>_<filter_size>_<epochs>_<n_conv>_<n_fc>_<model>.<file_type>`
//! and parses back to the same value.

use std::fmt;
use std::ops::Add;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::EvolutronError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub dataset: String,
    pub filters: usize,
    pub filter_size: usize,
    pub epochs: usize,
    pub n_conv: usize,
    pub n_fc: usize,
    pub model: String,
    pub file_type: String,
}

impl Handle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: &str,
        filters: usize,
        filter_size: usize,
        epochs: usize,
        n_conv: usize,
        n_fc: usize,
        model: &str,
        file_type: &str,
    ) -> Result<Self> {
        let handle = Self {
            dataset: dataset.to_string(),
            filters,
            filter_size,
            epochs,
            n_conv,
            n_fc,
            model: model.to_string(),
            file_type: file_type.to_string(),
        };
        handle.validate()?;
        Ok(handle)
    }

    /// Rejects field values whose rendered path would not parse back to the
    /// same handle.
    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(anyhow!(EvolutronError::parse(reason)));
        if self.dataset.is_empty() {
            return invalid("empty dataset name".to_string());
        }
        if self.model.is_empty() {
            return invalid("empty model name".to_string());
        }
        if self.model.contains(['.', '/']) {
            return invalid(format!("model name '{}' may not contain '.' or '/'", self.model));
        }
        if self.file_type.is_empty() {
            return invalid("empty file type".to_string());
        }
        if self.file_type.contains('/') {
            return invalid(format!("file type '{}' may not contain '/'", self.file_type));
        }
        Ok(())
    }

    /// Final path component, without the dataset directory.
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}_{}.{}",
            self.filters,
            self.filter_size,
            self.epochs,
            self.n_conv,
            self.n_fc,
            self.model,
            self.file_type
        )
    }

    /// Same handle with a different file type, e.g. for the weights next to a
    /// descriptor.
    pub fn with_file_type(&self, file_type: &str) -> Result<Self> {
        let handle = Self {
            file_type: file_type.to_string(),
            ..self.clone()
        };
        handle.validate()?;
        Ok(handle)
    }

    pub fn from_filename(path: &str) -> Result<Self> {
        path.parse()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.filename())
    }
}

fn parse_error(path: &str, reason: &str) -> anyhow::Error {
    anyhow!(EvolutronError::parse(format!("'{}': {}", path, reason)))
}

fn parse_field(path: &str, name: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| parse_error(path, &format!("{} '{}' is not a non-negative integer", name, value)))
}

impl FromStr for Handle {
    type Err = anyhow::Error;

    fn from_str(path: &str) -> Result<Self> {
        let (dataset, filename) = path
            .rsplit_once('/')
            .ok_or_else(|| parse_error(path, "missing dataset directory"))?;
        if dataset.is_empty() {
            return Err(parse_error(path, "empty dataset name"));
        }

        let (stem, file_type) = filename
            .split_once('.')
            .ok_or_else(|| parse_error(path, "missing file extension"))?;
        if file_type.is_empty() {
            return Err(parse_error(path, "empty file extension"));
        }

        let fields: Vec<&str> = stem.splitn(6, '_').collect();
        if fields.len() != 6 {
            return Err(parse_error(
                path,
                "expected <filters>_<filter_size>_<epochs>_<n_conv>_<n_fc>_<model>",
            ));
        }
        let model = fields[5];
        if model.is_empty() {
            return Err(parse_error(path, "empty model name"));
        }

        Ok(Handle {
            dataset: dataset.to_string(),
            filters: parse_field(path, "filters", fields[0])?,
            filter_size: parse_field(path, "filter size", fields[1])?,
            epochs: parse_field(path, "epochs", fields[2])?,
            n_conv: parse_field(path, "conv count", fields[3])?,
            n_fc: parse_field(path, "fc count", fields[4])?,
            model: model.to_string(),
            file_type: file_type.to_string(),
        })
    }
}

impl Add<&str> for &Handle {
    type Output = String;

    fn add(self, rhs: &str) -> String {
        self.to_string() + rhs
    }
}

impl Add<&Handle> for String {
    type Output = String;

    fn add(mut self, rhs: &Handle) -> String {
        self.push_str(&rhs.to_string());
        self
    }
}

impl Add<&Handle> for &str {
    type Output = String;

    fn add(self, rhs: &Handle) -> String {
        format!("{}{}", self, rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    fn sample() -> Handle {
        Handle::new("cb513", 100, 30, 20, 2, 1, "DeepCoDER", "safetensors").unwrap()
    }

    #[test]
    fn test_render() {
        assert_eq!(
            sample().to_string(),
            "cb513/100_30_20_2_1_DeepCoDER.safetensors"
        );
        assert_eq!(sample().filename(), "100_30_20_2_1_DeepCoDER.safetensors");
    }

    #[test]
    fn test_roundtrip() {
        let handle = sample();
        let parsed: Handle = handle.to_string().parse().unwrap();
        assert_eq!(parsed, handle);

        let nested =
            Handle::new("models/secs", 8, 3, 1, 0, 0, "multi_scale", "arch.json").unwrap();
        assert_eq!(Handle::from_filename(&nested.to_string()).unwrap(), nested);
    }

    #[test]
    fn test_concatenation() {
        let handle = sample();
        assert_eq!(&handle + ".bak", "cb513/100_30_20_2_1_DeepCoDER.safetensors.bak");
        assert_eq!(
            "runs/" + &handle,
            "runs/cb513/100_30_20_2_1_DeepCoDER.safetensors"
        );
        assert_eq!(
            String::from("/tmp/") + &handle,
            "/tmp/cb513/100_30_20_2_1_DeepCoDER.safetensors"
        );
    }

    #[test]
    fn test_malformed_paths() {
        for path in [
            "100_30_20_2_1_DeepCoDER.safetensors",
            "cb513/100_30_20_2_1_DeepCoDER",
            "cb513/100_30_20_DeepCoDER.h5",
            "cb513/a_30_20_2_1_DeepCoDER.h5",
            "cb513/100_30_20_2_1_.h5",
        ] {
            let err = Handle::from_filename(path).unwrap_err();
            assert!(
                matches!(kind_of(&err), Some(EvolutronError::Parse(_))),
                "{} should not parse",
                path
            );
        }
    }

    #[test]
    fn test_unrenderable_fields_rejected() {
        let cases = [
            ("", "net", "h5"),
            ("cb513", "", "h5"),
            ("cb513", "net.v2", "h5"),
            ("cb513", "net/v2", "h5"),
            ("cb513", "net", ""),
            ("cb513", "net", "h5/x"),
        ];
        for (dataset, model, file_type) in cases {
            let err = Handle::new(dataset, 100, 3, 10, 1, 0, model, file_type).unwrap_err();
            assert!(
                matches!(kind_of(&err), Some(EvolutronError::Parse(_))),
                "{:?} should be rejected",
                (dataset, model, file_type)
            );
        }
        assert!(sample().with_file_type("").is_err());

        let weights = sample().with_file_type("arch.json").unwrap();
        assert_eq!(weights.to_string().parse::<Handle>().unwrap(), weights);
    }
}
