use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Optimizer, VarMap};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::TrainConfig;
use crate::error::EvolutronError;
use crate::utils::logging::Progress;
use crate::utils::stats::{ConfusionMatrix, MetricKind, MetricValue, TrainingPhase, TrainingStepMetrics};

/// Probabilities are clamped away from zero before taking the log.
const PROB_EPSILON: f64 = 1e-7;

/// Training objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Mean over positions of `-sum(y * log(p))`, with the category axis last.
    #[default]
    CategoricalCrossentropy,
    MeanSquaredError,
}

impl LossKind {
    pub fn compute(&self, y_pred: &Tensor, y_true: &Tensor) -> candle_core::Result<Tensor> {
        if y_pred.dims() != y_true.dims() {
            candle_core::bail!(
                "prediction shape {:?} does not match target shape {:?}",
                y_pred.dims(),
                y_true.dims()
            );
        }
        match self {
            LossKind::CategoricalCrossentropy => {
                let nb_categories = y_true.dims().last().copied().unwrap_or(1);
                let y_pred = y_pred.reshape(((), nb_categories))?;
                let y_true = y_true.reshape(((), nb_categories))?.to_dtype(y_pred.dtype())?;
                let log_p = y_pred.clamp(PROB_EPSILON, 1.0)?.log()?;
                (y_true * log_p)?.sum(1)?.neg()?.mean_all()
            }
            LossKind::MeanSquaredError => {
                candle_nn::loss::mse(y_pred, &y_true.to_dtype(y_pred.dtype())?)
            }
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LossKind::CategoricalCrossentropy => write!(f, "categorical_crossentropy"),
            LossKind::MeanSquaredError => write!(f, "mse"),
        }
    }
}

impl FromStr for LossKind {
    type Err = EvolutronError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "categorical_crossentropy" | "cce" => Ok(LossKind::CategoricalCrossentropy),
            "mse" | "mean_squared_error" => Ok(LossKind::MeanSquaredError),
            _ => Err(EvolutronError::configuration(format!("unknown loss '{}'", s))),
        }
    }
}

/// Loss and metric values over one evaluation pass.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub loss: f32,
    pub metrics: Vec<(MetricKind, MetricValue)>,
}

impl EvaluationReport {
    pub fn get(&self, kind: MetricKind) -> Option<&MetricValue> {
        self.metrics.iter().find(|(k, _)| *k == kind).map(|(_, v)| v)
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "loss: {:.4}", self.loss)?;
        for (kind, value) in &self.metrics {
            write!(f, " - {}: {}", kind, value)?;
        }
        Ok(())
    }
}

fn num_batches(len: usize, batch_size: usize) -> usize {
    len.div_ceil(batch_size).max(1)
}

fn check_pair(x: &Tensor, y: &Tensor) -> Result<usize> {
    let n = x.dim(0)?;
    if y.dim(0)? != n {
        return Err(anyhow!(EvolutronError::configuration(format!(
            "{} inputs but {} targets",
            n,
            y.dim(0)?
        ))));
    }
    if n == 0 {
        return Err(anyhow!(EvolutronError::configuration("no training examples")));
    }
    Ok(n)
}

/// A trainable sequence-labelling network: inputs `(batch, seq_len, alphabet)`,
/// outputs `(batch, seq_len, nb_categories)`.
pub trait ModelInterface {
    fn model_arch(&self) -> &str;

    /// Forward pass honouring the current training/evaluation mode.
    fn forward(&self, xs: &Tensor) -> Result<Tensor, candle_core::Error>;

    /// Set model to evaluation mode for inference
    /// This disables dropout and freezes batch-norm statistics.
    fn set_evaluation_mode(&mut self);

    /// Set model to training mode for training
    /// This enables dropout and batch statistics.
    fn set_training_mode(&mut self);

    fn get_device(&self) -> &Device;

    fn get_varmap(&self) -> &VarMap;

    fn get_mut_varmap(&mut self) -> &mut VarMap;

    fn loss_kind(&self) -> LossKind;

    fn metric_kinds(&self) -> &[MetricKind];

    /// Decoupled weight decay used by the optimizer.
    fn weight_decay(&self) -> f64 {
        0.0
    }

    fn predict(&mut self, xs: &Tensor) -> Result<Tensor> {
        self.set_evaluation_mode();
        Ok(self.forward(&xs.to_device(self.get_device())?)?)
    }

    /// Mini-batch AdamW training. Returns the step-wise history.
    fn fit(&mut self, x: &Tensor, y: &Tensor, config: &TrainConfig) -> Result<TrainingStepMetrics> {
        config.validate()?;
        let n = check_pair(x, y)?;
        let n_val = (n as f32 * config.validation_split).floor() as usize;
        let n_train = n - n_val;
        if n_train == 0 {
            return Err(anyhow!(EvolutronError::configuration(
                "validation_split leaves no training examples"
            )));
        }

        let device = self.get_device().clone();
        let x = x.to_device(&device)?.to_dtype(DType::F32)?;
        let y = y.to_device(&device)?.to_dtype(DType::F32)?;
        let batches = num_batches(n_train, config.batch_size);

        info!(
            "Training {} model on {} examples ({} batches, {} held out) for {} epochs",
            self.model_arch(),
            n_train,
            batches,
            n_val,
            config.epochs
        );

        let params = candle_nn::ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: self.weight_decay(),
            ..Default::default()
        };
        let mut opt = candle_nn::AdamW::new(self.get_varmap().all_vars(), params)?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let loss_kind = self.loss_kind();
        let mut history = TrainingStepMetrics::default();

        for epoch in 0..config.epochs {
            self.set_training_mode();
            let mut indices: Vec<u32> = (0..n_train as u32).collect();
            if config.shuffle {
                indices.shuffle(&mut rng);
            }

            let progress = Progress::new(batches, &format!("[training] Epoch {}: ", epoch));
            for (step, chunk) in indices.chunks(config.batch_size).enumerate() {
                let idx = Tensor::from_slice(chunk, chunk.len(), &device)?;
                let x_batch = x.index_select(&idx, 0)?;
                let y_batch = y.index_select(&idx, 0)?;

                let predicted = self.forward(&x_batch)?;
                let loss = loss_kind.compute(&predicted, &y_batch)?;
                opt.backward_step(&loss)?;

                let accuracy = ConfusionMatrix::from_tensors(&y_batch, &predicted)?.accuracy();
                history.push(
                    epoch,
                    step,
                    opt.learning_rate(),
                    loss.to_scalar::<f32>()?,
                    TrainingPhase::Train,
                    Some(accuracy),
                );
                progress.inc();
            }
            progress.finish();

            if n_val > 0 {
                let report = self.evaluate(
                    &x.narrow(0, n_train, n_val)?,
                    &y.narrow(0, n_train, n_val)?,
                    config.batch_size,
                )?;
                let accuracy = report
                    .get(MetricKind::CategoricalAccuracy)
                    .and_then(MetricValue::as_scalar);
                history.push(
                    epoch,
                    0,
                    opt.learning_rate(),
                    report.loss,
                    TrainingPhase::Validation,
                    accuracy,
                );
                info!("Epoch {}: validation {}", epoch, report);
            }

            if let Some((avg, _)) = history
                .summarize_by_epoch_phase()
                .get(&(epoch, TrainingPhase::Train))
            {
                info!(
                    "Epoch {}: avg. batch loss {:.4}, accuracy {:.4}",
                    epoch,
                    avg,
                    history
                        .mean_accuracy(epoch, TrainingPhase::Train)
                        .unwrap_or(f32::NAN)
                );
            }
        }

        self.set_evaluation_mode();
        Ok(history)
    }

    /// Loss and the configured metrics in evaluation mode. Positions whose
    /// target is all zero (padding) are left out of the metrics.
    fn evaluate(&mut self, x: &Tensor, y: &Tensor, batch_size: usize) -> Result<EvaluationReport> {
        let n = check_pair(x, y)?;
        if batch_size == 0 {
            return Err(anyhow!(EvolutronError::configuration("batch_size must be positive")));
        }
        self.set_evaluation_mode();

        let device = self.get_device().clone();
        let loss_kind = self.loss_kind();
        let nb_categories = y.dims().last().copied().unwrap_or(0);
        let mut matrix = ConfusionMatrix::new(nb_categories);
        let mut total_loss = 0f32;

        for start in (0..n).step_by(batch_size) {
            let len = batch_size.min(n - start);
            let x_batch = x.narrow(0, start, len)?.to_device(&device)?.to_dtype(DType::F32)?;
            let y_batch = y.narrow(0, start, len)?.to_device(&device)?.to_dtype(DType::F32)?;
            let predicted = self.forward(&x_batch)?;
            total_loss += loss_kind.compute(&predicted, &y_batch)?.to_scalar::<f32>()? * len as f32;
            let batch_matrix = ConfusionMatrix::from_tensors(&y_batch, &predicted)?;
            matrix.merge(&batch_matrix);
        }

        let metrics = self
            .metric_kinds()
            .iter()
            .map(|kind| (*kind, kind.compute(&matrix)))
            .collect();
        Ok(EvaluationReport {
            loss: total_loss / n as f32,
            metrics,
        })
    }

    /// Save model weights to a file in safetensors format.
    fn save_weights(&self, path: &Path) -> Result<()> {
        info!("Saving {} model weights to: {:?}", self.model_arch(), path);
        self.get_varmap().save(path)?;
        Ok(())
    }
}
