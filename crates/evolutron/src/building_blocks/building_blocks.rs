use anyhow::{anyhow, Result as AnyHowResult};
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn as nn;

use crate::building_blocks::bilstm::BidirectionalLSTM;
use crate::building_blocks::graph::{GraphBuilder, Layer, NodeId, RecurrentLayer};
use crate::error::EvolutronError;

/// Batch norm epsilon and running-statistics momentum.
const BN_EPS: f64 = 1e-3;
const BN_MOMENTUM: f64 = 0.01;

/// 1-D convolution over `(batch, seq_len, channels)` with "same" padding: the
/// output keeps `seq_len` positions for any kernel size and dilation.
#[derive(Debug, Clone)]
pub struct SameConv1d {
    conv: nn::Conv1d,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    dilation: usize,
}

impl SameConv1d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        vb: nn::VarBuilder,
    ) -> Result<Self> {
        if kernel_size == 0 || dilation == 0 {
            candle_core::bail!(
                "convolution needs a positive kernel size and dilation, got {} and {}",
                kernel_size,
                dilation
            );
        }
        let padding = (dilation * (kernel_size - 1) + 1) / 2;
        let conv = nn::conv1d(
            in_channels,
            out_channels,
            kernel_size,
            nn::Conv1dConfig {
                padding,
                dilation,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self {
            conv,
            in_channels,
            out_channels,
            kernel_size,
            dilation,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }
}

impl Module for SameConv1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let seq_len = xs.dim(1)?;
        let ys = self.conv.forward(&xs.transpose(1, 2)?.contiguous()?)?;
        // symmetric padding overshoots by one position for odd total padding;
        // dropping the first keeps the extra context on the right
        let extra = ys.dim(2)? - seq_len;
        ys.narrow(2, extra, seq_len)?.transpose(1, 2)?.contiguous()
    }
}

/// Dense layer applied to the last axis (position-wise on 3-D input).
#[derive(Debug, Clone)]
pub struct DenseLayer {
    linear: nn::Linear,
    in_features: usize,
    out_features: usize,
}

impl DenseLayer {
    pub fn new(in_features: usize, out_features: usize, vb: nn::VarBuilder) -> Result<Self> {
        let linear = nn::linear(in_features, out_features, vb)?;
        Ok(Self {
            linear,
            in_features,
            out_features,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for DenseLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear.forward(&xs.contiguous()?)
    }
}

/// Batch normalisation over the feature axis of `(batch, seq_len, features)`.
#[derive(Debug, Clone)]
pub struct NormLayer {
    bn: nn::BatchNorm,
    features: usize,
}

impl NormLayer {
    pub fn new(features: usize, vb: nn::VarBuilder) -> Result<Self> {
        let config = nn::BatchNormConfig {
            eps: BN_EPS,
            momentum: BN_MOMENTUM,
            ..Default::default()
        };
        let bn = nn::batch_norm(features, config, vb)?;
        Ok(Self { bn, features })
    }

    pub fn features(&self) -> usize {
        self.features
    }
}

impl ModuleT for NormLayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let channels_first = xs.transpose(1, 2)?.contiguous()?;
        self.bn
            .forward_t(&channels_first, train)?
            .transpose(1, 2)?
            .contiguous()
    }
}

fn relu(g: &mut GraphBuilder, name: String, input: NodeId) -> AnyHowResult<NodeId> {
    g.add(name, Layer::Relu, &[input])
}

/// Multiscale convolution block with a skip path.
///
/// One convolution per filter length reads the block input (dilated by
/// `dilation`); their outputs are concatenated, normalised and rectified, then
/// refined by a uniscale convolution with the first filter length. A 1-wide
/// skip convolution on the block input is concatenated with the refined path
/// and the result goes through dropout. Output width is `2 * nb_filter`.
#[allow(clippy::too_many_arguments)]
pub fn multiscale_conv_block(
    g: &mut GraphBuilder,
    input: NodeId,
    name: &str,
    nb_filter: usize,
    filter_lengths: &[usize],
    dilation: usize,
    dropout: f32,
    vb: nn::VarBuilder,
) -> AnyHowResult<NodeId> {
    let first_length = *filter_lengths.first().ok_or_else(|| {
        anyhow!(EvolutronError::configuration(format!(
            "{}: at least one filter length is required",
            name
        )))
    })?;
    let in_channels = g.features(input);

    let mut branches = Vec::with_capacity(filter_lengths.len());
    for (i, &length) in filter_lengths.iter().enumerate() {
        let conv = SameConv1d::new(
            in_channels,
            nb_filter,
            length,
            dilation,
            vb.pp(format!("multiscale_{}", i)),
        )?;
        branches.push(g.add(
            format!("{}_multiscale_{}", name, i),
            Layer::Conv1d(conv),
            &[input],
        )?);
    }
    let merged = if branches.len() > 1 {
        g.add(format!("{}_multiscale_concat", name), Layer::Concatenate, &branches)?
    } else {
        branches[0]
    };

    let merged_features = g.features(merged);
    let bn = NormLayer::new(merged_features, vb.pp("multiscale_bn"))?;
    let merged = g.add(format!("{}_multiscale_bn", name), Layer::BatchNorm(bn), &[merged])?;
    let merged = relu(g, format!("{}_multiscale_relu", name), merged)?;

    let uniscale = SameConv1d::new(merged_features, nb_filter, first_length, 1, vb.pp("uniscale"))?;
    let refined = g.add(format!("{}_uniscale", name), Layer::Conv1d(uniscale), &[merged])?;
    let bn = NormLayer::new(nb_filter, vb.pp("uniscale_bn"))?;
    let refined = g.add(format!("{}_uniscale_bn", name), Layer::BatchNorm(bn), &[refined])?;
    let refined = relu(g, format!("{}_uniscale_relu", name), refined)?;

    let skip = SameConv1d::new(in_channels, nb_filter, 1, 1, vb.pp("skip"))?;
    let skip = g.add(format!("{}_skip", name), Layer::Conv1d(skip), &[input])?;

    let joined = g.add(format!("{}_concat", name), Layer::Concatenate, &[skip, refined])?;
    g.add(format!("{}_dropout", name), Layer::Dropout(dropout), &[joined])
}

/// Bidirectional LSTM followed by two position-wise dense layers, with dropout
/// after each sub-stage. Output width is `units`.
pub fn bidirectional_recurrent_block(
    g: &mut GraphBuilder,
    input: NodeId,
    name: &str,
    units: usize,
    dropout: f32,
    vb: nn::VarBuilder,
) -> AnyHowResult<NodeId> {
    let bilstm = BidirectionalLSTM::new(g.features(input), units, vb.pp("lstm"))?;
    let x = g.add(
        format!("{}_bilstm", name),
        Layer::Recurrent(RecurrentLayer::Bidirectional(bilstm)),
        &[input],
    )?;
    let x = g.add(format!("{}_bilstm_dropout", name), Layer::Dropout(dropout), &[x])?;

    let mut x = x;
    let mut in_features = 2 * units;
    for i in 1..=2 {
        let dense = DenseLayer::new(in_features, units, vb.pp(format!("dense_{}", i)))?;
        x = g.add(format!("{}_dense_{}", name, i), Layer::Dense(dense), &[x])?;
        x = relu(g, format!("{}_dense_{}_relu", name, i), x)?;
        x = g.add(
            format!("{}_dense_{}_dropout", name, i),
            Layer::Dropout(dropout),
            &[x],
        )?;
        in_features = units;
    }
    Ok(x)
}

/// Fixed-width convolution applied at every position, rectified, then dropout.
pub fn locally_connected_block(
    g: &mut GraphBuilder,
    input: NodeId,
    name: &str,
    nb_filter: usize,
    filter_length: usize,
    dropout: f32,
    vb: nn::VarBuilder,
) -> AnyHowResult<NodeId> {
    let conv = SameConv1d::new(g.features(input), nb_filter, filter_length, 1, vb.pp("conv"))?;
    let x = g.add(format!("{}_conv", name), Layer::Conv1d(conv), &[input])?;
    let x = relu(g, format!("{}_relu", name), x)?;
    g.add(format!("{}_dropout", name), Layer::Dropout(dropout), &[x])
}

/// Position-wise dense projection to `nb_categories` followed by a softmax over
/// categories.
pub fn output_head(
    g: &mut GraphBuilder,
    input: NodeId,
    nb_categories: usize,
    vb: nn::VarBuilder,
) -> AnyHowResult<NodeId> {
    let dense = DenseLayer::new(g.features(input), nb_categories, vb.pp("dense"))?;
    let x = g.add("output_dense", Layer::Dense(dense), &[input])?;
    g.add("output", Layer::Softmax, &[x])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, D};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_same_conv_keeps_length() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let xs = Tensor::rand(0f32, 1f32, (2, 11, 4), &device)?;
        for (i, (kernel, dilation)) in [(1, 1), (3, 1), (4, 1), (3, 2), (5, 3), (2, 4)]
            .into_iter()
            .enumerate()
        {
            let conv = SameConv1d::new(4, 6, kernel, dilation, vb.pp(format!("c{}", i)))?;
            assert_eq!(conv.forward(&xs)?.dims(), &[2, 11, 6]);
        }
        Ok(())
    }

    #[test]
    fn test_norm_layer_eval_and_train() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = NormLayer::new(3, vb)?;
        let xs = Tensor::rand(0f32, 1f32, (4, 6, 3), &device)?;
        assert_eq!(norm.forward_t(&xs, true)?.dims(), &[4, 6, 3]);
        assert_eq!(norm.forward_t(&xs, false)?.dims(), &[4, 6, 3]);
        Ok(())
    }

    #[test]
    fn test_multiscale_block_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut g = GraphBuilder::new();
        let inp = g.input("aa_seq", &[12, 20])?;
        let block = multiscale_conv_block(&mut g, inp, "conv_0", 8, &[3, 5, 7], 2, 0.1, vb.pp("conv_0"))?;
        assert_eq!(g.shape(block), &[12, 16]);
        let head = output_head(&mut g, block, 3, vb.pp("output"))?;
        let graph = g.finish(head)?;

        let ys = graph.forward_t(&Tensor::rand(0f32, 1f32, (2, 12, 20), &device)?, true)?;
        assert_eq!(ys.dims(), &[2, 12, 3]);
        let sums = ys.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn test_recurrent_and_local_blocks() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut g = GraphBuilder::new();
        let inp = g.input("aa_seq", &[6, 4])?;
        let masked = g.add("mask", Layer::Masking, &[inp])?;
        let rnn = bidirectional_recurrent_block(&mut g, masked, "lstm_0", 5, 0.0, vb.pp("lstm_0"))?;
        assert_eq!(g.shape(rnn), &[6, 5]);
        let local = locally_connected_block(&mut g, rnn, "fc_0", 7, 3, 0.0, vb.pp("fc_0"))?;
        assert_eq!(g.shape(local), &[6, 7]);
        Ok(())
    }

    #[test]
    fn test_empty_filter_lengths_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut g = GraphBuilder::new();
        let inp = g.input("aa_seq", &[6, 4]).unwrap();
        assert!(multiscale_conv_block(&mut g, inp, "conv_0", 8, &[], 1, 0.0, vb).is_err());
    }
}
