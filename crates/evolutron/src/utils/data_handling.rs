use candle_core::{Device, Tensor};
use ndarray::{s, Array2};
use rayon::prelude::*;

/// Parsed records of one source: encoded sequences `(alphabet, length)`, one
/// target per sequence, and the number of records dropped while reading.
#[derive(Debug, Clone)]
pub struct Dataset<Y> {
    pub x: Vec<Array2<f32>>,
    pub y: Vec<Y>,
    pub skipped: usize,
}

impl<Y> Default for Dataset<Y> {
    fn default() -> Self {
        Self {
            x: Vec::new(),
            y: Vec::new(),
            skipped: 0,
        }
    }
}

impl<Y> Dataset<Y> {
    pub fn push(&mut self, x: Array2<f32>, y: Y) {
        self.x.push(x);
        self.y.push(y);
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Longest encoded sequence.
    pub fn max_len(&self) -> usize {
        self.x.iter().map(|x| x.ncols()).max().unwrap_or(0)
    }

    /// Zero-pads (or truncates) every sequence to `length` columns.
    pub fn pad_to(&mut self, length: usize) {
        self.x = self.x.par_iter().map(|x| pad_columns(x, length)).collect();
    }
}

/// Copies `array` into a `(rows, length)` array; missing columns are zero.
pub fn pad_columns(array: &Array2<f32>, length: usize) -> Array2<f32> {
    let keep = array.ncols().min(length);
    let mut padded = Array2::<f32>::zeros((array.nrows(), length));
    padded
        .slice_mut(s![.., ..keep])
        .assign(&array.slice(s![.., ..keep]));
    padded
}

/// Target length for padding: the caller's value, or the longest sequence
/// floored at `min_len`.
pub fn resolve_padding(lengths: impl Iterator<Item = usize>, max_len: Option<usize>, min_len: usize) -> usize {
    match max_len {
        Some(max_len) => max_len,
        None => lengths.max().unwrap_or(0).max(min_len),
    }
}

/// Stacks `(features, length)` arrays into one `(batch, length, features)`
/// tensor, zero-padding every example to `length`.
pub fn to_batch_tensor(
    arrays: &[&Array2<f32>],
    length: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let features = arrays.first().map(|a| a.nrows()).unwrap_or(0);
    if let Some(bad) = arrays.iter().find(|a| a.nrows() != features) {
        candle_core::bail!(
            "cannot batch arrays with {} and {} feature rows",
            features,
            bad.nrows()
        );
    }
    let flat: Vec<f32> = arrays
        .par_iter()
        .flat_map_iter(|array| {
            let padded = pad_columns(array, length);
            padded.t().iter().copied().collect::<Vec<f32>>()
        })
        .collect();
    Tensor::from_vec(flat, (arrays.len(), length, features), device)
}

/// Row-major `(batch, width)` tensor from per-example vectors.
pub fn to_matrix_tensor(rows: &[&Vec<f32>], device: &Device) -> candle_core::Result<Tensor> {
    let width = rows.first().map(|r| r.len()).unwrap_or(0);
    if rows.iter().any(|r| r.len() != width) {
        candle_core::bail!("cannot batch target vectors of different widths");
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), width), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pad_columns() {
        let a = array![[1.0f32, 0.0], [0.0, 1.0]];
        let padded = pad_columns(&a, 4);
        assert_eq!(padded.shape(), &[2, 4]);
        assert_eq!(padded.slice(s![.., 2..]).sum(), 0.0);
        assert_eq!(pad_columns(&a, 1), array![[1.0f32], [0.0]]);
    }

    #[test]
    fn test_resolve_padding() {
        assert_eq!(resolve_padding([3, 9, 4].into_iter(), None, 0), 9);
        assert_eq!(resolve_padding([3, 9, 4].into_iter(), None, 12), 12);
        assert_eq!(resolve_padding([3, 9, 4].into_iter(), Some(5), 12), 5);
    }

    #[test]
    fn test_to_batch_tensor_layout() {
        let a = array![[1.0f32, 0.0], [0.0, 1.0]];
        let b = array![[0.0f32], [1.0]];
        let batch = to_batch_tensor(&[&a, &b], 3, &Device::Cpu).unwrap();
        assert_eq!(batch.dims(), &[2, 3, 2]);
        let values = batch.to_vec3::<f32>().unwrap();
        assert_eq!(values[0][0], vec![1.0, 0.0]);
        assert_eq!(values[0][1], vec![0.0, 1.0]);
        assert_eq!(values[1][0], vec![0.0, 1.0]);
        assert_eq!(values[1][2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_dataset_padding() {
        let mut data: Dataset<usize> = Dataset::default();
        data.push(Array2::ones((4, 2)), 0);
        data.push(Array2::ones((4, 5)), 1);
        data.skip();
        assert_eq!(data.max_len(), 5);
        data.pad_to(6);
        assert!(data.x.iter().all(|x| x.shape() == [4, 6]));
        assert_eq!(data.skipped, 1);
    }

    #[test]
    fn test_to_matrix_tensor() {
        let targets = vec![vec![1.0f32, 2.0, 3.0], vec![4.0, 5.0, 6.0]];
        let refs: Vec<&Vec<f32>> = targets.iter().collect();
        let m = to_matrix_tensor(&refs, &Device::Cpu).unwrap();
        assert_eq!(m.to_vec2::<f32>().unwrap(), targets);

        let ragged = vec![vec![1.0f32], vec![1.0, 2.0]];
        let refs: Vec<&Vec<f32>> = ragged.iter().collect();
        assert!(to_matrix_tensor(&refs, &Device::Cpu).is_err());
    }
}
