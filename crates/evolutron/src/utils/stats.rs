use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::building_blocks::featurize::argmax;
use crate::error::EvolutronError;

/// Represents a single phase of training: either Training or Validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainingPhase {
    Train,
    Validation,
}

/// Step-wise training history in a Struct of Arrays layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingStepMetrics {
    pub epochs: Vec<usize>,
    pub steps: Vec<usize>,
    pub learning_rates: Vec<f64>,
    pub losses: Vec<f32>,
    pub phases: Vec<TrainingPhase>,
    pub accuracies: Vec<Option<f32>>,
}

impl TrainingStepMetrics {
    pub fn push(
        &mut self,
        epoch: usize,
        step: usize,
        learning_rate: f64,
        loss: f32,
        phase: TrainingPhase,
        accuracy: Option<f32>,
    ) {
        self.epochs.push(epoch);
        self.steps.push(step);
        self.learning_rates.push(learning_rate);
        self.losses.push(loss);
        self.phases.push(phase);
        self.accuracies.push(accuracy);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Average and standard deviation of the loss grouped by epoch and phase.
    pub fn summarize_by_epoch_phase(&self) -> HashMap<(usize, TrainingPhase), (f32, f32)> {
        let mut grouped: HashMap<(usize, TrainingPhase), Vec<f32>> = HashMap::new();
        for i in 0..self.epochs.len() {
            let key = (self.epochs[i], self.phases[i].clone());
            grouped.entry(key).or_default().push(self.losses[i]);
        }
        grouped
            .into_iter()
            .map(|(key, values)| (key, compute_loss_stats(&values)))
            .collect()
    }

    /// Mean accuracy of one epoch and phase, ignoring steps without one.
    pub fn mean_accuracy(&self, epoch: usize, phase: TrainingPhase) -> Option<f32> {
        let values: Vec<f32> = (0..self.epochs.len())
            .filter(|&i| self.epochs[i] == epoch && self.phases[i] == phase)
            .filter_map(|i| self.accuracies[i])
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f32>() / values.len() as f32)
        }
    }
}

/// Compute average and std deviation from a slice of loss values.
pub fn compute_loss_stats(losses: &[f32]) -> (f32, f32) {
    if losses.is_empty() {
        return (f32::NAN, f32::NAN);
    }
    let avg = losses.iter().copied().sum::<f32>() / losses.len() as f32;
    let std = (losses.iter().map(|l| (l - avg).powi(2)).sum::<f32>() / losses.len() as f32).sqrt();
    (avg, std)
}

/// How per-class scores are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    /// One score per class.
    Multiclass,
    /// Unweighted mean of the per-class scores.
    Macro,
    /// Score of the pooled counts.
    Micro,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f32),
    PerClass(Vec<f32>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::PerClass(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MetricValue::Scalar(v) => write!(f, "{:.4}", v),
            MetricValue::PerClass(values) => {
                let rendered: Vec<String> = values.iter().map(|v| format!("{:.4}", v)).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
        }
    }
}

/// Confusion counts over one-hot targets and probability predictions.
///
/// Positions whose target row is all zero are padding and are not counted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    nb_categories: usize,
    /// `counts[true][predicted]`
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(nb_categories: usize) -> Self {
        Self {
            nb_categories,
            counts: vec![vec![0; nb_categories]; nb_categories],
        }
    }

    /// Accumulates rows of length `nb_categories`.
    pub fn update(&mut self, y_true: &[Vec<f32>], y_pred: &[Vec<f32>]) {
        for (t, p) in y_true.iter().zip(y_pred) {
            let Some(true_class) = argmax(t.iter().copied()) else {
                continue;
            };
            let pred_class = argmax(p.iter().copied()).unwrap_or(0);
            if true_class < self.nb_categories && pred_class < self.nb_categories {
                self.counts[true_class][pred_class] += 1;
            }
        }
    }

    /// Builds the matrix from `(..., nb_categories)` target and prediction tensors.
    pub fn from_tensors(y_true: &Tensor, y_pred: &Tensor) -> Result<Self> {
        let nb_categories = y_true.dims().last().copied().unwrap_or(0);
        if y_true.dims() != y_pred.dims() || nb_categories == 0 {
            return Err(anyhow!(EvolutronError::configuration(format!(
                "target shape {:?} does not match prediction shape {:?}",
                y_true.dims(),
                y_pred.dims()
            ))));
        }
        let t = y_true
            .to_dtype(DType::F32)?
            .reshape(((), nb_categories))?
            .to_vec2::<f32>()?;
        let p = y_pred
            .to_dtype(DType::F32)?
            .reshape(((), nb_categories))?
            .to_vec2::<f32>()?;
        let mut matrix = Self::new(nb_categories);
        matrix.update(&t, &p);
        Ok(matrix)
    }

    /// Adds the counts of another matrix over the same categories.
    pub fn merge(&mut self, other: &ConfusionMatrix) {
        for (row, other_row) in self.counts.iter_mut().zip(&other.counts) {
            for (count, other_count) in row.iter_mut().zip(other_row) {
                *count += other_count;
            }
        }
    }

    pub fn nb_categories(&self) -> usize {
        self.nb_categories
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    fn true_positives(&self, class: usize) -> usize {
        self.counts[class][class]
    }

    fn predicted(&self, class: usize) -> usize {
        self.counts.iter().map(|row| row[class]).sum()
    }

    fn actual(&self, class: usize) -> usize {
        self.counts[class].iter().sum()
    }

    /// Fraction of counted positions whose arg-max matches the target.
    pub fn accuracy(&self) -> f32 {
        let correct: usize = (0..self.nb_categories).map(|c| self.true_positives(c)).sum();
        ratio(correct, self.total())
    }

    pub fn precision(&self, aggregation: Aggregation) -> MetricValue {
        self.aggregate(aggregation, |c| ratio(self.true_positives(c), self.predicted(c)))
    }

    pub fn recall(&self, aggregation: Aggregation) -> MetricValue {
        self.aggregate(aggregation, |c| ratio(self.true_positives(c), self.actual(c)))
    }

    /// Balanced F-score.
    pub fn fmeasure(&self, aggregation: Aggregation) -> MetricValue {
        match aggregation {
            Aggregation::Micro => {
                let p = ratio(self.pooled_tp(), self.total());
                MetricValue::Scalar(f_score(p, p))
            }
            _ => self.aggregate(aggregation, |c| {
                let p = ratio(self.true_positives(c), self.predicted(c));
                let r = ratio(self.true_positives(c), self.actual(c));
                f_score(p, r)
            }),
        }
    }

    fn pooled_tp(&self) -> usize {
        (0..self.nb_categories).map(|c| self.true_positives(c)).sum()
    }

    fn aggregate(&self, aggregation: Aggregation, per_class: impl Fn(usize) -> f32) -> MetricValue {
        match aggregation {
            Aggregation::Multiclass => {
                MetricValue::PerClass((0..self.nb_categories).map(per_class).collect())
            }
            Aggregation::Macro => {
                let scores: Vec<f32> = (0..self.nb_categories).map(per_class).collect();
                MetricValue::Scalar(scores.iter().sum::<f32>() / scores.len().max(1) as f32)
            }
            // single-label targets: pooled FP and FN both equal total - TP
            Aggregation::Micro => MetricValue::Scalar(ratio(self.pooled_tp(), self.total())),
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f32 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f32 / denominator as f32
    }
}

fn f_score(precision: f32, recall: f32) -> f32 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// Named metrics that can be attached to a model and persisted by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MetricKind {
    CategoricalAccuracy,
    Precision(Aggregation),
    Recall(Aggregation),
    FMeasure(Aggregation),
}

impl MetricKind {
    pub fn compute(&self, matrix: &ConfusionMatrix) -> MetricValue {
        match self {
            MetricKind::CategoricalAccuracy => MetricValue::Scalar(matrix.accuracy()),
            MetricKind::Precision(agg) => matrix.precision(*agg),
            MetricKind::Recall(agg) => matrix.recall(*agg),
            MetricKind::FMeasure(agg) => matrix.fmeasure(*agg),
        }
    }

    pub fn default_set() -> Vec<MetricKind> {
        vec![
            MetricKind::CategoricalAccuracy,
            MetricKind::Precision(Aggregation::Macro),
            MetricKind::Recall(Aggregation::Macro),
            MetricKind::FMeasure(Aggregation::Macro),
        ]
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (base, agg) = match self {
            MetricKind::CategoricalAccuracy => return write!(f, "categorical_accuracy"),
            MetricKind::Precision(agg) => ("precision", agg),
            MetricKind::Recall(agg) => ("recall", agg),
            MetricKind::FMeasure(agg) => ("fmeasure", agg),
        };
        match agg {
            Aggregation::Multiclass => write!(f, "{}", base),
            Aggregation::Macro => write!(f, "{}_macro", base),
            Aggregation::Micro => write!(f, "{}_micro", base),
        }
    }
}

impl FromStr for MetricKind {
    type Err = EvolutronError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "categorical_accuracy" || s == "accuracy" {
            return Ok(MetricKind::CategoricalAccuracy);
        }
        let (base, agg) = match s.rsplit_once('_') {
            Some((base, "macro")) => (base, Aggregation::Macro),
            Some((base, "micro")) => (base, Aggregation::Micro),
            _ => (s, Aggregation::Multiclass),
        };
        match base {
            "precision" => Ok(MetricKind::Precision(agg)),
            "recall" => Ok(MetricKind::Recall(agg)),
            "fmeasure" | "f1" => Ok(MetricKind::FMeasure(agg)),
            _ => Err(EvolutronError::configuration(format!("unknown metric '{}'", s))),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = EvolutronError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MetricKind> for String {
    fn from(kind: MetricKind) -> Self {
        kind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn rows(classes: &[Option<usize>], n: usize) -> Vec<Vec<f32>> {
        classes
            .iter()
            .map(|c| {
                let mut row = vec![0.0; n];
                if let Some(c) = c {
                    row[*c] = 1.0;
                }
                row
            })
            .collect()
    }

    fn sample_matrix() -> ConfusionMatrix {
        // true:  0 0 1 1 2 pad
        // pred:  0 1 1 1 0 2
        let y_true = rows(&[Some(0), Some(0), Some(1), Some(1), Some(2), None], 3);
        let y_pred = rows(&[Some(0), Some(1), Some(1), Some(1), Some(0), Some(2)], 3);
        let mut matrix = ConfusionMatrix::new(3);
        matrix.update(&y_true, &y_pred);
        matrix
    }

    #[test]
    fn test_padding_is_excluded() {
        let matrix = sample_matrix();
        assert_eq!(matrix.total(), 5);
        assert!((matrix.accuracy() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_precision_recall_aggregations() {
        let matrix = sample_matrix();
        assert_eq!(
            matrix.precision(Aggregation::Multiclass),
            MetricValue::PerClass(vec![0.5, 2.0 / 3.0, 0.0])
        );
        assert_eq!(
            matrix.recall(Aggregation::Multiclass),
            MetricValue::PerClass(vec![0.5, 1.0, 0.0])
        );
        let macro_recall = matrix.recall(Aggregation::Macro).as_scalar().unwrap();
        assert!((macro_recall - 0.5).abs() < 1e-6);
        let micro = matrix.precision(Aggregation::Micro).as_scalar().unwrap();
        assert!((micro - matrix.accuracy()).abs() < 1e-6);
    }

    #[test]
    fn test_fmeasure() {
        let matrix = sample_matrix();
        let MetricValue::PerClass(f) = matrix.fmeasure(Aggregation::Multiclass) else {
            panic!("expected per-class scores");
        };
        assert!((f[0] - 0.5).abs() < 1e-6);
        assert!((f[1] - 0.8).abs() < 1e-6);
        assert_eq!(f[2], 0.0);
        let micro = matrix.fmeasure(Aggregation::Micro).as_scalar().unwrap();
        assert!((micro - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_from_tensors() {
        let device = Device::Cpu;
        let y_true = Tensor::new(&[[[1f32, 0.], [0., 1.]], [[0., 1.], [0., 0.]]], &device).unwrap();
        let y_pred =
            Tensor::new(&[[[0.9f32, 0.1], [0.4, 0.6]], [[0.7, 0.3], [0.5, 0.5]]], &device).unwrap();
        let matrix = ConfusionMatrix::from_tensors(&y_true, &y_pred).unwrap();
        assert_eq!(matrix.total(), 3);
        assert!((matrix.accuracy() - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_metric_names() {
        for name in ["categorical_accuracy", "precision", "recall_macro", "fmeasure_micro"] {
            let kind: MetricKind = name.parse().unwrap();
            assert_eq!(kind.to_string(), name);
        }
        assert!("top_k".parse::<MetricKind>().is_err());
        let json = serde_json::to_string(&MetricKind::Recall(Aggregation::Macro)).unwrap();
        assert_eq!(json, "\"recall_macro\"");
    }

    #[test]
    fn test_compute_loss_stats() {
        let (avg, std) = compute_loss_stats(&[1.0, 3.0]);
        assert_eq!(avg, 2.0);
        assert_eq!(std, 1.0);
    }
}
