use candle_core::{IndexOp, Result, Tensor};
use candle_nn::{rnn, Module, VarBuilder, RNN};

/// Single-direction LSTM over `(batch, seq_len, input_size)` that returns the
/// hidden state at every position.
///
/// When a `(batch, seq_len)` mask is supplied, masked positions (value 0)
/// carry the previous state through unchanged, so padding never updates the
/// recurrence and its output repeats the last real hidden state.
#[derive(Debug, Clone)]
pub struct MaskedLSTM {
    lstm: rnn::LSTM,
    input_size: usize,
    hidden_size: usize,
    reverse: bool,
}

impl MaskedLSTM {
    pub fn new(input_size: usize, hidden_size: usize, reverse: bool, vb: VarBuilder) -> Result<Self> {
        let direction = if reverse {
            rnn::Direction::Backward
        } else {
            rnn::Direction::Forward
        };
        let lstm = rnn::lstm(
            input_size,
            hidden_size,
            rnn::LSTMConfig {
                direction,
                ..Default::default()
            },
            vb,
        )?;
        Ok(Self {
            lstm,
            input_size,
            hidden_size,
            reverse,
        })
    }

    pub fn forward_masked(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch_size, seq_len, input_size) = xs.dims3()?;
        if input_size != self.input_size {
            candle_core::bail!(
                "LSTM expects {} input features, got {}",
                self.input_size,
                input_size
            );
        }

        let mut state = self.lstm.zero_state(batch_size)?;
        let mut outputs: Vec<Option<Tensor>> = vec![None; seq_len];
        let order: Box<dyn Iterator<Item = usize>> = if self.reverse {
            Box::new((0..seq_len).rev())
        } else {
            Box::new(0..seq_len)
        };

        for t in order {
            let x_t = xs.i((.., t, ..))?.contiguous()?;
            let next = self.lstm.step(&x_t, &state)?;
            state = match mask {
                Some(mask) => {
                    let keep = mask.i((.., t))?.unsqueeze(1)?;
                    let hold = keep.affine(-1.0, 1.0)?;
                    rnn::LSTMState {
                        h: (next.h.broadcast_mul(&keep)? + state.h.broadcast_mul(&hold)?)?,
                        c: (next.c.broadcast_mul(&keep)? + state.c.broadcast_mul(&hold)?)?,
                    }
                }
                None => next,
            };
            outputs[t] = Some(state.h.clone());
        }

        let outputs: Vec<Tensor> = outputs.into_iter().flatten().collect();
        if outputs.is_empty() {
            return Tensor::zeros(
                (batch_size, 0, self.hidden_size),
                xs.dtype(),
                xs.device(),
            );
        }
        Tensor::stack(&outputs, 1)
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl Module for MaskedLSTM {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_masked(xs, None)
    }
}

/// Forward and backward [`MaskedLSTM`]s whose outputs are concatenated along
/// the feature axis, giving `2 * hidden_size` features per position.
#[derive(Debug, Clone)]
pub struct BidirectionalLSTM {
    forward_lstm: MaskedLSTM,
    backward_lstm: MaskedLSTM,
}

impl BidirectionalLSTM {
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let forward_lstm = MaskedLSTM::new(input_size, hidden_size, false, vb.clone())?;
        let backward_lstm = MaskedLSTM::new(input_size, hidden_size, true, vb)?;
        Ok(Self {
            forward_lstm,
            backward_lstm,
        })
    }

    pub fn forward_masked(&self, xs: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let forward = self.forward_lstm.forward_masked(xs, mask)?;
        let backward = self.backward_lstm.forward_masked(xs, mask)?;
        Tensor::cat(&[forward, backward], 2)
    }

    pub fn input_size(&self) -> usize {
        self.forward_lstm.input_size()
    }

    pub fn hidden_size(&self) -> usize {
        self.forward_lstm.hidden_size()
    }

    pub fn output_size(&self) -> usize {
        2 * self.hidden_size()
    }
}

impl Module for BidirectionalLSTM {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_masked(xs, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn input(device: &Device) -> Result<Tensor> {
        Tensor::new(
            &[
                0.3241f32, -0.0404, -0.6861, 0.5437, -1.5626, 0.8695, 0.2145, -0.7496, -0.4951,
                1.3849, 0.7240, 0.1449, 2.2349, 0.0219, 0.3207,
            ],
            device,
        )?
        .reshape((1, 5, 3))
    }

    #[test]
    fn test_bilstm_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = BidirectionalLSTM::new(3, 4, vb.pp("rnn"))?;

        let output = model.forward(&input(&device)?)?;
        assert_eq!(output.dims(), &[1, 5, 8]);
        assert_eq!(model.output_size(), 8);
        Ok(())
    }

    #[test]
    fn test_masked_positions_carry_state() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let lstm = MaskedLSTM::new(3, 4, false, vb)?;

        let xs = input(&device)?;
        let mask = Tensor::new(&[[1f32, 1., 1., 0., 0.]], &device)?;
        let output = lstm.forward_masked(&xs, Some(&mask))?.to_vec3::<f32>()?;
        assert_eq!(output[0][3], output[0][2]);
        assert_eq!(output[0][4], output[0][2]);

        // unmasked prefix matches a plain pass over the same prefix
        let prefix = xs.narrow(1, 0, 3)?;
        let plain = lstm.forward(&prefix)?.to_vec3::<f32>()?;
        for (a, b) in plain[0][2].iter().zip(output[0][2].iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_reverse_direction_ignores_leading_padding() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let lstm = MaskedLSTM::new(3, 4, true, vb)?;

        let xs = input(&device)?;
        let mask = Tensor::new(&[[1f32, 1., 0., 0., 0.]], &device)?;
        let output = lstm.forward_masked(&xs, Some(&mask))?.to_vec3::<f32>()?;
        // the backward pass starts on padding, so the state stays at zero there
        assert!(output[0][4].iter().all(|v| *v == 0.0));
        assert!(output[0][0].iter().any(|v| *v != 0.0));
        Ok(())
    }
}
