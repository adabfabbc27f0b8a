//! Assembles an [`ArchitectureSpec`] into a [`ComputationGraph`].
//!
//! Stages run in order: input (plus masking when a recurrent stage exists),
//! convolution blocks, recurrent blocks, locally-connected or fully-connected
//! blocks, and the softmax head. Any stage with a zero count is skipped and the
//! next stage reads whatever tensor came last.

use anyhow::Result;
use candle_nn::VarBuilder;

use crate::building_blocks::bilstm::MaskedLSTM;
use crate::building_blocks::building_blocks::{
    bidirectional_recurrent_block, locally_connected_block, multiscale_conv_block, output_head,
    DenseLayer, SameConv1d,
};
use crate::building_blocks::graph::{ComputationGraph, GraphBuilder, Layer, NodeId, RecurrentLayer};
use crate::models::architecture::{ArchitectureSpec, Variant};

pub const INPUT_NAME: &str = "aa_seq";

/// Validates `spec` and builds its graph, creating parameters through `vb`.
pub fn build_network(spec: &ArchitectureSpec, vb: VarBuilder) -> Result<ComputationGraph> {
    spec.validate()?;

    let mut g = GraphBuilder::new();
    let input = g.input(INPUT_NAME, &spec.input_shape)?;
    let x = if spec.use_lstm > 0 {
        g.add("mask", Layer::Masking, &[input])?
    } else {
        input
    };

    let output = match spec.variant {
        Variant::Multiscale => build_multiscale(&mut g, x, spec, &vb)?,
        Variant::Sequential => build_sequential(&mut g, x, spec, &vb)?,
    };

    let graph = g.finish(output)?;
    log::debug!(
        "Built {:?} network with {} nodes, output shape {:?}",
        spec.variant,
        graph.nodes().len(),
        graph.output_shape()
    );
    log::trace!("\n{}", graph.summary());
    Ok(graph)
}

fn build_multiscale(
    g: &mut GraphBuilder,
    mut x: NodeId,
    spec: &ArchitectureSpec,
    vb: &VarBuilder,
) -> Result<NodeId> {
    for block in 0..spec.n_conv_layers {
        let name = format!("conv_{}", block);
        x = multiscale_conv_block(
            g,
            x,
            &name,
            spec.conv_filters(block),
            spec.filter_length.values(),
            spec.dilation(block)?,
            spec.dropout,
            vb.pp(&name),
        )?;
    }

    for block in 0..spec.use_lstm {
        let name = format!("lstm_{}", block);
        x = bidirectional_recurrent_block(g, x, &name, spec.lstm_units, spec.dropout, vb.pp(&name))?;
    }

    for block in 0..spec.n_fc_layers {
        let name = format!("fc_{}", block);
        x = locally_connected_block(
            g,
            x,
            &name,
            spec.fc_filters(block),
            spec.fc_filter_length,
            spec.dropout,
            vb.pp(&name),
        )?;
    }

    output_head(g, x, spec.nb_categories, vb.pp("output"))
}

fn build_sequential(
    g: &mut GraphBuilder,
    masked: NodeId,
    spec: &ArchitectureSpec,
    vb: &VarBuilder,
) -> Result<NodeId> {
    let seq_length = spec.seq_length();
    let nb_categories = spec.nb_categories;

    // fc-only networks still get one convolution in front of the flatten
    let n_conv = if spec.n_conv_layers == 0 && spec.use_lstm == 0 {
        1
    } else {
        spec.n_conv_layers
    };

    let mut x = masked;
    for i in 0..n_conv {
        let name = format!("conv_{}", i);
        let conv = SameConv1d::new(
            g.features(x),
            spec.conv_filters(i),
            spec.filter_length.first(),
            1,
            vb.pp(&name),
        )?;
        x = g.add(name.clone(), Layer::Conv1d(conv), &[x])?;
        x = g.add(format!("{}_relu", name), Layer::Relu, &[x])?;
    }

    for i in 0..spec.use_lstm {
        let name = format!("lstm_{}", i);
        let lstm = MaskedLSTM::new(g.features(x), nb_categories, false, vb.pp(&name))?;
        x = g.add(name, Layer::Recurrent(RecurrentLayer::Unidirectional(lstm)), &[x])?;
    }

    if spec.n_fc_layers > 0 {
        let width = seq_length * nb_categories;
        x = g.add("flatten", Layer::Flatten, &[x])?;
        for i in 0..spec.n_fc_layers {
            let name = format!("fc_{}", i);
            let dense = DenseLayer::new(g.features(x), width, vb.pp(&name))?;
            x = g.add(name, Layer::Dense(dense), &[x])?;
        }
        x = g.add("unflatten", Layer::Reshape(vec![seq_length, nb_categories]), &[x])?;
        g.add("output", Layer::Softmax, &[x])
    } else if spec.use_lstm > 0 {
        g.add("output", Layer::Softmax, &[x])
    } else {
        output_head(g, x, nb_categories, vb.pp("output"))
    }
}
