//! Layer graph executed position-wise over `(batch, seq_len, features)` tensors.
//!
//! Nodes are stored in insertion order and may only read nodes added before
//! them, so the node list is always a valid topological order and the graph is
//! acyclic by construction. Per-example shapes are inferred when a node is
//! added; a graph that builds has consistent shapes end to end.

use std::collections::HashSet;
use std::fmt;

use anyhow::{anyhow, Result};
use candle_core::{DType, Module, ModuleT, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::building_blocks::bilstm::{BidirectionalLSTM, MaskedLSTM};
use crate::building_blocks::building_blocks::{DenseLayer, NormLayer, SameConv1d};
use crate::error::EvolutronError;

pub type NodeId = usize;

#[derive(Debug, Clone)]
pub enum RecurrentLayer {
    Unidirectional(MaskedLSTM),
    Bidirectional(BidirectionalLSTM),
}

impl RecurrentLayer {
    pub fn input_size(&self) -> usize {
        match self {
            RecurrentLayer::Unidirectional(lstm) => lstm.input_size(),
            RecurrentLayer::Bidirectional(lstm) => lstm.input_size(),
        }
    }

    pub fn output_size(&self) -> usize {
        match self {
            RecurrentLayer::Unidirectional(lstm) => lstm.hidden_size(),
            RecurrentLayer::Bidirectional(lstm) => lstm.output_size(),
        }
    }

    fn forward_masked(&self, xs: &Tensor, mask: Option<&Tensor>) -> candle_core::Result<Tensor> {
        match self {
            RecurrentLayer::Unidirectional(lstm) => lstm.forward_masked(xs, mask),
            RecurrentLayer::Bidirectional(lstm) => lstm.forward_masked(xs, mask),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Input,
    /// Passes values through and marks all-zero positions as padding for
    /// every recurrent layer downstream.
    Masking,
    Conv1d(SameConv1d),
    BatchNorm(NormLayer),
    Relu,
    /// Concatenation along the feature axis.
    Concatenate,
    Dropout(f32),
    Recurrent(RecurrentLayer),
    Dense(DenseLayer),
    Flatten,
    Reshape(Vec<usize>),
    /// Softmax over the last axis.
    Softmax,
}

/// Registry of layer kinds that may appear in a saved topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Masking,
    Conv1d,
    BatchNorm,
    Relu,
    Concatenate,
    Dropout,
    Lstm,
    BidirectionalLstm,
    Dense,
    Flatten,
    Reshape,
    Softmax,
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Input => LayerKind::Input,
            Layer::Masking => LayerKind::Masking,
            Layer::Conv1d(_) => LayerKind::Conv1d,
            Layer::BatchNorm(_) => LayerKind::BatchNorm,
            Layer::Relu => LayerKind::Relu,
            Layer::Concatenate => LayerKind::Concatenate,
            Layer::Dropout(_) => LayerKind::Dropout,
            Layer::Recurrent(RecurrentLayer::Unidirectional(_)) => LayerKind::Lstm,
            Layer::Recurrent(RecurrentLayer::Bidirectional(_)) => LayerKind::BidirectionalLstm,
            Layer::Dense(_) => LayerKind::Dense,
            Layer::Flatten => LayerKind::Flatten,
            Layer::Reshape(_) => LayerKind::Reshape,
            Layer::Softmax => LayerKind::Softmax,
        }
    }

    /// Per-example output shape for the given per-example input shapes.
    fn infer_shape(&self, inputs: &[&[usize]]) -> std::result::Result<Vec<usize>, String> {
        let first = match inputs.first() {
            Some(shape) => *shape,
            None => return Err("layer has no inputs".to_string()),
        };
        if !matches!(self, Layer::Concatenate) && inputs.len() != 1 {
            return Err(format!("expected a single input, got {}", inputs.len()));
        }
        let last = first.last().copied().unwrap_or(0);

        match self {
            Layer::Input => Err("input nodes are created with GraphBuilder::input".to_string()),
            Layer::Masking | Layer::Relu | Layer::Dropout(_) | Layer::Softmax => Ok(first.to_vec()),
            Layer::BatchNorm(norm) => {
                if first.len() != 2 || last != norm.features() {
                    return Err(format!(
                        "batch norm over {} features cannot read shape {:?}",
                        norm.features(),
                        first
                    ));
                }
                Ok(first.to_vec())
            }
            Layer::Conv1d(conv) => {
                if first.len() != 2 || last != conv.in_channels() {
                    return Err(format!(
                        "convolution with {} input channels cannot read shape {:?}",
                        conv.in_channels(),
                        first
                    ));
                }
                Ok(vec![first[0], conv.out_channels()])
            }
            Layer::Recurrent(rnn) => {
                if first.len() != 2 || last != rnn.input_size() {
                    return Err(format!(
                        "recurrent layer with {} input features cannot read shape {:?}",
                        rnn.input_size(),
                        first
                    ));
                }
                Ok(vec![first[0], rnn.output_size()])
            }
            Layer::Concatenate => {
                let prefix = &first[..first.len().saturating_sub(1)];
                let mut features = 0;
                for shape in inputs {
                    if shape.is_empty() || &shape[..shape.len() - 1] != prefix {
                        return Err(format!(
                            "cannot concatenate shapes {:?} and {:?} along features",
                            first, shape
                        ));
                    }
                    features += shape[shape.len() - 1];
                }
                let mut shape = prefix.to_vec();
                shape.push(features);
                Ok(shape)
            }
            Layer::Dense(dense) => {
                if first.is_empty() || last != dense.in_features() {
                    return Err(format!(
                        "dense layer with {} inputs cannot read shape {:?}",
                        dense.in_features(),
                        first
                    ));
                }
                let mut shape = first.to_vec();
                let n = shape.len();
                shape[n - 1] = dense.out_features();
                Ok(shape)
            }
            Layer::Flatten => Ok(vec![first.iter().product()]),
            Layer::Reshape(target) => {
                let from: usize = first.iter().product();
                let to: usize = target.iter().product();
                if from != to {
                    return Err(format!("cannot reshape {:?} into {:?}", first, target));
                }
                Ok(target.clone())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub layer: Layer,
    pub inputs: Vec<NodeId>,
    /// Output shape without the batch axis.
    pub shape: Vec<usize>,
}

/// Serializable summary of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<NodeId>,
    pub shape: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    names: HashSet<String>,
    input: Option<NodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(&mut self, name: &str, shape: &[usize]) -> Result<NodeId> {
        if self.input.is_some() {
            return Err(anyhow!(EvolutronError::configuration(
                "graph already has an input node"
            )));
        }
        let id = self.push(name.to_string(), Layer::Input, Vec::new(), shape.to_vec())?;
        self.input = Some(id);
        Ok(id)
    }

    pub fn add(&mut self, name: impl Into<String>, layer: Layer, inputs: &[NodeId]) -> Result<NodeId> {
        let name = name.into();
        if let Some(missing) = inputs.iter().find(|&&id| id >= self.nodes.len()) {
            return Err(anyhow!(EvolutronError::configuration(format!(
                "node '{}' reads unknown node {}",
                name, missing
            ))));
        }
        let shapes: Vec<&[usize]> = inputs.iter().map(|&id| self.nodes[id].shape.as_slice()).collect();
        let shape = layer
            .infer_shape(&shapes)
            .map_err(|msg| anyhow!(EvolutronError::configuration(format!("node '{}': {}", name, msg))))?;
        log::trace!("{} ({:?}) -> {:?}", name, layer.kind(), shape);
        self.push(name, layer, inputs.to_vec(), shape)
    }

    fn push(&mut self, name: String, layer: Layer, inputs: Vec<NodeId>, shape: Vec<usize>) -> Result<NodeId> {
        if !self.names.insert(name.clone()) {
            return Err(anyhow!(EvolutronError::configuration(format!(
                "duplicate node name '{}'",
                name
            ))));
        }
        self.nodes.push(Node {
            name,
            layer,
            inputs,
            shape,
        });
        Ok(self.nodes.len() - 1)
    }

    /// Per-example output shape of a node.
    pub fn shape(&self, id: NodeId) -> &[usize] {
        &self.nodes[id].shape
    }

    /// Feature count (last axis) of a node's output.
    pub fn features(&self, id: NodeId) -> usize {
        self.nodes[id].shape.last().copied().unwrap_or(0)
    }

    pub fn finish(self, output: NodeId) -> Result<ComputationGraph> {
        let input = self
            .input
            .ok_or_else(|| anyhow!(EvolutronError::configuration("graph has no input node")))?;
        if output >= self.nodes.len() {
            return Err(anyhow!(EvolutronError::configuration(format!(
                "output node {} does not exist",
                output
            ))));
        }
        Ok(ComputationGraph {
            nodes: self.nodes,
            input,
            output,
        })
    }
}

/// An immutable, executable layer graph with one input and one output node.
#[derive(Debug, Clone)]
pub struct ComputationGraph {
    nodes: Vec<Node>,
    input: NodeId,
    output: NodeId,
}

impl ComputationGraph {
    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.nodes[self.input].shape
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.nodes[self.output].shape
    }

    pub fn contains(&self, kind: LayerKind) -> bool {
        self.nodes.iter().any(|n| n.layer.kind() == kind)
    }

    pub fn topology(&self) -> Vec<NodeDescriptor> {
        self.nodes
            .iter()
            .map(|n| NodeDescriptor {
                name: n.name.clone(),
                kind: n.layer.kind(),
                inputs: n.inputs.clone(),
                shape: n.shape.clone(),
            })
            .collect()
    }

    /// Runs the graph on a `(batch, ..input_shape)` tensor. Dropout is only
    /// active and batch norm only uses batch statistics when `train` is set.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        if xs.dims().get(1..) != Some(self.input_shape()) {
            candle_core::bail!(
                "expected input of shape (batch, {:?}), got {:?}",
                self.input_shape(),
                xs.dims()
            );
        }

        let mut values: Vec<Option<Tensor>> = vec![None; self.nodes.len()];
        let mut mask: Option<Tensor> = None;

        for (id, node) in self.nodes.iter().enumerate() {
            let inputs: Vec<&Tensor> = node
                .inputs
                .iter()
                .filter_map(|&i| values[i].as_ref())
                .collect();
            if inputs.len() != node.inputs.len() {
                candle_core::bail!("node '{}' reads a value that was never computed", node.name);
            }

            let value = match &node.layer {
                Layer::Input => xs.clone(),
                Layer::Masking => {
                    let x = inputs[0];
                    mask = Some(padding_mask(x)?.to_dtype(x.dtype())?);
                    x.clone()
                }
                Layer::Conv1d(conv) => conv.forward(inputs[0])?,
                Layer::BatchNorm(norm) => norm.forward_t(inputs[0], train)?,
                Layer::Relu => inputs[0].relu()?,
                Layer::Concatenate => {
                    if inputs.len() == 1 {
                        inputs[0].clone()
                    } else {
                        Tensor::cat(&inputs, D::Minus1)?
                    }
                }
                Layer::Dropout(p) => candle_nn::Dropout::new(*p).forward(inputs[0], train)?,
                Layer::Recurrent(rnn) => rnn.forward_masked(inputs[0], mask.as_ref())?,
                Layer::Dense(dense) => dense.forward(inputs[0])?,
                Layer::Flatten => inputs[0].flatten_from(1)?,
                Layer::Reshape(target) => {
                    let mut dims = vec![inputs[0].dim(0)?];
                    dims.extend_from_slice(target);
                    inputs[0].reshape(dims)?
                }
                Layer::Softmax => candle_nn::ops::softmax(inputs[0], D::Minus1)?,
            };
            values[id] = Some(value);
        }

        match values[self.output].take() {
            Some(out) => Ok(out),
            None => candle_core::bail!("output node was not computed"),
        }
    }

    /// One line per node, for logging.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl Module for ComputationGraph {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_t(xs, false)
    }
}

impl fmt::Display for ComputationGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (id, node) in self.nodes.iter().enumerate() {
            let inputs: Vec<&str> = node.inputs.iter().map(|&i| self.nodes[i].name.as_str()).collect();
            writeln!(
                f,
                "{:>3} {:<24} {:<20} {:?} <- {:?}",
                id,
                node.name,
                format!("{:?}", node.layer.kind()),
                node.shape,
                inputs
            )?;
        }
        Ok(())
    }
}

/// Float mask `(batch, seq_len)` with 1 where any feature is non-zero.
pub fn padding_mask(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.abs()?.sum(D::Minus1)?.gt(0f32)?.to_dtype(DType::F32)
}
