//! Dataset readers. Each reader returns encoded sequences `(alphabet, length)`
//! with one target per sequence and a count of records it dropped.

pub mod fasta;
pub mod m6a;
pub mod npz;
pub mod tab;
pub mod zinc_finger;

pub use fasta::{fasta_parser, secs_parser, FastaOptions, FastaReader, FastaRecord};
pub use m6a::{m6a, Probe};
pub use npz::{npz_parser, NpzOptions};
pub use tab::{tab_parser, FamilyKey};
pub use zinc_finger::b1h;

use ndarray::Array2;

use crate::utils::data_handling::{pad_columns, resolve_padding, Dataset};

/// Output length handling shared by the readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Every sequence keeps its own length, floored at `min_len` columns.
    Ragged { min_len: usize },
    /// Every sequence is padded (or truncated) to `max_len`, or to the longest
    /// sequence read when `max_len` is `None`.
    Fixed { max_len: Option<usize> },
}

impl Default for Padding {
    fn default() -> Self {
        Padding::Ragged { min_len: 0 }
    }
}

impl Padding {
    pub(crate) fn apply<Y>(&self, data: &mut Dataset<Y>) {
        match *self {
            Padding::Ragged { min_len } => {
                if data.x.iter().any(|x| x.ncols() < min_len) {
                    data.x = data
                        .x
                        .iter()
                        .map(|x| pad_columns(x, x.ncols().max(min_len)))
                        .collect();
                }
            }
            Padding::Fixed { max_len } => {
                let length = resolve_padding(data.x.iter().map(|x| x.ncols()), max_len, 0);
                log::debug!("Padding {} sequences to length {}", data.len(), length);
                data.pad_to(length);
            }
        }
    }

    /// Pads sequences like [`Padding::apply`] and gives every per-position
    /// target the same number of columns as its sequence.
    pub(crate) fn apply_with_targets(&self, data: &mut Dataset<Array2<f32>>) {
        self.apply(data);
        for (x, y) in data.x.iter().zip(data.y.iter_mut()) {
            if y.ncols() != x.ncols() {
                *y = pad_columns(y, x.ncols());
            }
        }
    }
}
