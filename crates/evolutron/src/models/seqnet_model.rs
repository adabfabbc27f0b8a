use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use serde::{Deserialize, Serialize};

use crate::building_blocks::graph::{ComputationGraph, NodeDescriptor};
use crate::error::EvolutronError;
use crate::models::architecture::ArchitectureSpec;
use crate::models::builder::build_network;
use crate::models::model_interface::{LossKind, ModelInterface};
use crate::utils::handle::Handle;
use crate::utils::stats::MetricKind;

/// Version of the architecture descriptor written next to the weights.
pub const DESCRIPTOR_FORMAT_VERSION: u32 = 1;
const DESCRIPTOR_EXTENSION: &str = "arch.json";

/// Everything needed to rebuild a model before its weights are loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub format_version: u32,
    pub model_name: String,
    pub spec: ArchitectureSpec,
    pub loss: LossKind,
    pub metrics: Vec<MetricKind>,
    pub topology: Vec<NodeDescriptor>,
    pub created_at: String,
}

/// A built network together with its parameters, loss and metrics.
pub struct SeqNetModel {
    name: String,
    spec: ArchitectureSpec,
    graph: ComputationGraph,
    varmap: VarMap,
    device: Device,
    loss: LossKind,
    metrics: Vec<MetricKind>,
    is_training: bool,
}

impl SeqNetModel {
    /// Builds a freshly initialised model from hyperparameters.
    pub fn from_options(spec: ArchitectureSpec, name: &str, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let graph = build_network(&spec, vb)?;
        info!(
            "Created {} model ({:?}, {} parameter tensors)",
            name,
            spec.variant,
            varmap.all_vars().len()
        );
        Ok(Self {
            name: name.to_string(),
            spec,
            graph,
            varmap,
            device,
            loss: LossKind::default(),
            metrics: MetricKind::default_set(),
            is_training: false,
        })
    }

    pub fn with_loss(mut self, loss: LossKind) -> Self {
        self.loss = loss;
        self
    }

    pub fn with_metrics(mut self, metrics: Vec<MetricKind>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.spec
    }

    pub fn graph(&self) -> &ComputationGraph {
        &self.graph
    }

    pub fn is_training(&self) -> bool {
        self.is_training
    }

    pub fn descriptor(&self) -> ArchitectureDescriptor {
        ArchitectureDescriptor {
            format_version: DESCRIPTOR_FORMAT_VERSION,
            model_name: self.name.clone(),
            spec: self.spec.clone(),
            loss: self.loss,
            metrics: self.metrics.clone(),
            topology: self.graph.topology(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Path of the descriptor that accompanies a weights file.
    pub fn descriptor_path(weights_path: &Path) -> PathBuf {
        weights_path.with_extension(DESCRIPTOR_EXTENSION)
    }

    /// Handle naming this model's artifacts for a dataset and epoch count.
    pub fn handle(&self, dataset: &str, epochs: usize) -> Result<Handle> {
        Handle::new(
            dataset,
            self.spec.conv_filters(0),
            self.spec.filter_length.first(),
            epochs,
            self.spec.n_conv_layers,
            self.spec.n_fc_layers,
            &self.name,
            "safetensors",
        )
    }

    /// Writes the weights (safetensors) and the architecture descriptor.
    pub fn save<P: AsRef<Path>>(&self, weights_path: P) -> Result<()> {
        let weights_path = weights_path.as_ref();
        if let Some(parent) = weights_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        self.save_weights(weights_path)?;

        let descriptor_path = Self::descriptor_path(weights_path);
        let json = serde_json::to_string_pretty(&self.descriptor())?;
        fs::write(&descriptor_path, json)
            .with_context(|| format!("Failed to write descriptor {:?}", descriptor_path))?;
        Ok(())
    }

    /// Saves under `root` at the path rendered by `handle`.
    pub fn save_to_handle(&self, root: &Path, handle: &Handle) -> Result<PathBuf> {
        let path = root.join(handle.to_string());
        self.save(&path)?;
        Ok(path)
    }

    /// Rebuilds a model from its descriptor and loads the saved weights.
    pub fn load<P: AsRef<Path>>(weights_path: P, device: Device) -> Result<Self> {
        let weights_path = weights_path.as_ref();
        let descriptor_path = Self::descriptor_path(weights_path);
        let json = fs::read_to_string(&descriptor_path)
            .with_context(|| format!("Failed to read descriptor {:?}", descriptor_path))?;
        let descriptor: ArchitectureDescriptor = serde_json::from_str(&json).map_err(|e| {
            anyhow!(EvolutronError::format(format!(
                "invalid architecture descriptor {:?}: {}",
                descriptor_path, e
            )))
        })?;

        if descriptor.format_version != DESCRIPTOR_FORMAT_VERSION {
            return Err(anyhow!(EvolutronError::format(format!(
                "unsupported descriptor format version {} (expected {})",
                descriptor.format_version, DESCRIPTOR_FORMAT_VERSION
            ))));
        }

        let mut model = Self::from_options(descriptor.spec, &descriptor.model_name, device)?
            .with_loss(descriptor.loss)
            .with_metrics(descriptor.metrics);

        if model.graph.topology() != descriptor.topology {
            return Err(anyhow!(EvolutronError::format(format!(
                "saved topology in {:?} does not match the rebuilt network",
                descriptor_path
            ))));
        }

        model
            .varmap
            .load(weights_path)
            .with_context(|| format!("Failed to load weights from {:?}", weights_path))?;
        info!("Loaded {} model from {:?}", model.name, weights_path);
        Ok(model)
    }

    pub fn load_from_handle(root: &Path, handle: &Handle, device: Device) -> Result<Self> {
        Self::load(root.join(handle.to_string()), device)
    }
}

impl fmt::Debug for SeqNetModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeqNetModel")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("loss", &self.loss)
            .field("metrics", &self.metrics)
            .field("is_training", &self.is_training)
            .finish()
    }
}

impl ModelInterface for SeqNetModel {
    fn model_arch(&self) -> &str {
        &self.name
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error> {
        self.graph.forward_t(xs, self.is_training)
    }

    fn set_evaluation_mode(&mut self) {
        self.is_training = false;
    }

    fn set_training_mode(&mut self) {
        self.is_training = true;
    }

    fn get_device(&self) -> &Device {
        &self.device
    }

    fn get_varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn get_mut_varmap(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    fn loss_kind(&self) -> LossKind {
        self.loss
    }

    fn metric_kinds(&self) -> &[MetricKind] {
        &self.metrics
    }

    fn weight_decay(&self) -> f64 {
        self.spec.l2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::architecture::LayerParam;

    fn small_spec() -> ArchitectureSpec {
        ArchitectureSpec {
            nb_filter: LayerParam::Scalar(4),
            ..ArchitectureSpec::new(10, 20, 3)
        }
    }

    #[test]
    fn test_descriptor_contents() -> Result<()> {
        let model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu)?
            .with_loss(LossKind::MeanSquaredError);
        let descriptor = model.descriptor();
        assert_eq!(descriptor.format_version, DESCRIPTOR_FORMAT_VERSION);
        assert_eq!(descriptor.loss, LossKind::MeanSquaredError);
        assert_eq!(descriptor.topology.len(), model.graph().nodes().len());
        assert_eq!(descriptor.topology.last().map(|n| n.name.as_str()), Some("output"));
        Ok(())
    }

    #[test]
    fn test_descriptor_path() {
        assert_eq!(
            SeqNetModel::descriptor_path(Path::new("run/8_3_1_1_0_secs.safetensors")),
            PathBuf::from("run/8_3_1_1_0_secs.arch.json")
        );
    }

    #[test]
    fn test_handle_naming() -> Result<()> {
        let model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu)?;
        assert_eq!(
            model.handle("cb513", 5)?.to_string(),
            "cb513/4_3_5_1_0_secs.safetensors"
        );
        Ok(())
    }

    #[test]
    fn test_training_mode_toggles() -> Result<()> {
        let mut model = SeqNetModel::from_options(small_spec(), "secs", Device::Cpu)?;
        assert!(!model.is_training());
        model.set_training_mode();
        assert!(model.is_training());
        let xs = Tensor::zeros((1, 10, 20), DType::F32, &Device::Cpu)?;
        let ys = model.predict(&xs)?;
        assert!(!model.is_training());
        assert_eq!(ys.dims(), &[1, 10, 3]);
        Ok(())
    }

    #[test]
    fn test_load_rejects_other_descriptor_versions() -> Result<()> {
        let dir = std::env::temp_dir().join("evolutron_descriptor_versions");
        let weights = dir.join("model.safetensors");
        SeqNetModel::from_options(small_spec(), "secs", Device::Cpu)?.save(&weights)?;
        let descriptor_path = SeqNetModel::descriptor_path(&weights);
        let original = fs::read_to_string(&descriptor_path)?;

        for version in [0, DESCRIPTOR_FORMAT_VERSION + 1] {
            let mut json: serde_json::Value = serde_json::from_str(&original)?;
            json["format_version"] = serde_json::json!(version);
            fs::write(&descriptor_path, json.to_string())?;
            let err = SeqNetModel::load(&weights, Device::Cpu).unwrap_err();
            assert!(matches!(
                crate::error::kind_of(&err),
                Some(EvolutronError::Format(_))
            ));
        }

        fs::write(&descriptor_path, &original)?;
        let reloaded = SeqNetModel::load(&weights, Device::Cpu);
        fs::remove_dir_all(&dir).ok();
        assert!(reloaded.is_ok());
        Ok(())
    }
}
