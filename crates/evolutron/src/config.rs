use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::EvolutronError;
use crate::utils::utils::get_device;

/// Optimisation settings for [`crate::models::model_interface::ModelInterface::fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epochs: usize,
    /// `"cpu"`, `"cuda"`, `"cuda:N"` or `"metal"`.
    pub device: String,
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Fraction of examples, taken from the end, held out for validation.
    pub validation_split: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: 64,
            learning_rate: 1e-3,
            epochs: 10,
            device: String::from("cpu"),
            shuffle: true,
            seed: None,
            validation_split: 0.0,
        }
    }
}

impl TrainConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: TrainConfig = serde_json::from_str(&json).map_err(|e| {
            anyhow!(EvolutronError::configuration(format!(
                "invalid training config {:?}: {}",
                path, e
            )))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the configured device string.
    pub fn device(&self) -> Result<Device> {
        get_device(&self.device)
            .map_err(|e| anyhow!(EvolutronError::configuration(e.to_string())))
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(anyhow!(EvolutronError::configuration(msg)));
        if self.batch_size == 0 {
            return fail("batch_size must be positive".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return fail(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_fills_defaults() {
        let path = std::env::temp_dir().join("evolutron_train_config_test.json");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, r#"{{"batch_size": 16, "epochs": 3, "seed": 7}}"#).unwrap();

        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.device, "cpu");
        assert!(config.shuffle);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_validate() {
        assert!(TrainConfig::default().validate().is_ok());
        let bad = TrainConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = TrainConfig {
            validation_split: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_device() {
        assert!(matches!(TrainConfig::default().device().unwrap(), Device::Cpu));
        let bad = TrainConfig {
            device: "tpu".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            crate::error::kind_of(&bad.device().unwrap_err()),
            Some(EvolutronError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(TrainConfig::from_file("/nonexistent/evolutron.json").is_err());
    }
}
