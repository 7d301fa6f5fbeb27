//! Tensor datasets, batching and input conversion
//!
//! A [`TensorDataset`] is a set of aligned tensor columns indexed along the
//! first dimension; by convention the last column is the target, unless the
//! dataset carries per-sample weights, in which case the weight column comes
//! last and the loop strips it before batch decomposition. The [`DataLoader`]
//! slices the dataset into batches, optionally shuffled with a caller
//! supplied RNG so runs are reproducible.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{Error, Result};

/// Aligned tensor columns indexed along the first dimension.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    columns: Vec<Tensor>,
    len: usize,
    weighted: bool,
}

impl TensorDataset {
    /// Build a dataset from columns. All columns must share their first
    /// dimension.
    pub fn new(columns: Vec<Tensor>) -> Result<Self> {
        let first = columns
            .first()
            .ok_or_else(|| Error::data("dataset needs at least one column"))?;
        let len = first.dim(0)?;
        for (i, column) in columns.iter().enumerate() {
            let n = column.dim(0)?;
            if n != len {
                return Err(Error::data(format!(
                    "column {i} has {n} rows, expected {len}"
                )));
            }
        }
        Ok(Self {
            columns,
            len,
            weighted: false,
        })
    }

    /// Convenience constructor for the common `(x, y)` case.
    pub fn from_xy(x: Tensor, y: Tensor) -> Result<Self> {
        Self::new(vec![x, y])
    }

    /// `(x, y)` plus a per-sample weight column. The loop multiplies the
    /// per-sample loss by the weights before reduction and weights the loss
    /// metric the same way.
    pub fn from_xyw(x: Tensor, y: Tensor, weights: Tensor) -> Result<Self> {
        let mut dataset = Self::new(vec![x, y, weights])?;
        dataset.weighted = true;
        Ok(dataset)
    }

    /// True when the last column holds per-sample weights.
    pub fn has_sample_weights(&self) -> bool {
        self.weighted
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The tensor columns, target last by convention.
    pub fn columns(&self) -> &[Tensor] {
        &self.columns
    }

    /// Select a subset of rows into a new dataset.
    pub fn select(&self, indices: &[u32], device: &Device) -> Result<Self> {
        let idx = Tensor::from_slice(indices, indices.len(), device)?;
        let columns = self
            .columns
            .iter()
            .map(|c| Ok(c.index_select(&idx, 0)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            columns,
            len: indices.len(),
            weighted: self.weighted,
        })
    }

    /// Contiguous rows `[start, start + count)` as raw batch tensors.
    fn narrow(&self, start: usize, count: usize) -> Result<Vec<Tensor>> {
        self.columns
            .iter()
            .map(|c| Ok(c.narrow(0, start, count)?))
            .collect()
    }
}

/// Split a dataset into `(train, validation)` with a seeded permutation.
pub fn random_split(
    dataset: &TensorDataset,
    val_fraction: f64,
    seed: u64,
) -> Result<(TensorDataset, TensorDataset)> {
    if val_fraction <= 0.0 || val_fraction >= 1.0 {
        return Err(Error::data(format!(
            "validation fraction {val_fraction} not in (0, 1)"
        )));
    }
    let n = dataset.len();
    let val_len = (n as f64 * val_fraction) as usize;
    if val_len == 0 {
        return Err(Error::data(format!(
            "validation fraction {val_fraction} selects no samples out of {n}"
        )));
    }
    let mut indices: Vec<u32> = (0..n as u32).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let device = dataset.columns()[0].device().clone();
    let train = dataset.select(&indices[val_len..], &device)?;
    let val = dataset.select(&indices[..val_len], &device)?;
    debug!(train = train.len(), val = val.len(), "split dataset");
    Ok((train, val))
}

/// Batched view over a [`TensorDataset`].
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: TensorDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
}

impl DataLoader {
    /// Create a loader. Batches are sequential unless shuffling is enabled.
    pub fn new(dataset: TensorDataset, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::data("batch_size must be positive"));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle: false,
            drop_last: false,
        })
    }

    /// Reshuffle sample order every epoch.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Drop the trailing incomplete batch.
    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Number of samples in the underlying dataset.
    pub fn num_samples(&self) -> usize {
        self.dataset.len()
    }

    /// True when batches carry a trailing per-sample weight column.
    pub fn has_sample_weights(&self) -> bool {
        self.dataset.weighted
    }

    /// Number of batches one epoch yields.
    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    /// Iterate one epoch of raw batches. The RNG is only consulted when
    /// shuffling is enabled.
    pub fn epoch_iter(&self, rng: &mut StdRng) -> Result<BatchIter<'_>> {
        let order = if self.shuffle {
            let mut indices: Vec<u32> = (0..self.dataset.len() as u32).collect();
            indices.shuffle(rng);
            Some(indices)
        } else {
            None
        };
        Ok(BatchIter {
            loader: self,
            order,
            cursor: 0,
        })
    }
}

/// Iterator over the raw batches of one epoch.
pub struct BatchIter<'a> {
    loader: &'a DataLoader,
    order: Option<Vec<u32>>,
    cursor: usize,
}

impl BatchIter<'_> {
    fn slice(&self, start: usize, count: usize) -> Result<Vec<Tensor>> {
        match &self.order {
            None => self.loader.dataset.narrow(start, count),
            Some(indices) => {
                let device = self.loader.dataset.columns()[0].device().clone();
                let batch = self
                    .loader
                    .dataset
                    .select(&indices[start..start + count], &device)?;
                Ok(batch.columns().to_vec())
            }
        }
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Vec<Tensor>>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.loader.dataset.len();
        let remaining = n.saturating_sub(self.cursor);
        if remaining == 0 {
            return None;
        }
        let count = remaining.min(self.loader.batch_size);
        if count < self.loader.batch_size && self.loader.drop_last {
            return None;
        }
        let start = self.cursor;
        self.cursor += count;
        Some(self.slice(start, count))
    }
}

/// Convert an `f32` ndarray into a tensor on the given device.
pub fn tensor_from_f32<D: ndarray::Dimension>(
    array: &ndarray::Array<f32, D>,
    device: &Device,
) -> Result<Tensor> {
    let shape: Vec<usize> = array.shape().to_vec();
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Convert a `u32` label ndarray into a tensor on the given device.
pub fn tensor_from_u32<D: ndarray::Dimension>(
    array: &ndarray::Array<u32, D>,
    device: &Device,
) -> Result<Tensor> {
    let shape: Vec<usize> = array.shape().to_vec();
    let data: Vec<u32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(n: usize) -> TensorDataset {
        let x: Vec<f32> = (0..n * 2).map(|v| v as f32).collect();
        let y: Vec<f32> = (0..n).map(|v| v as f32).collect();
        TensorDataset::new(vec![
            Tensor::from_vec(x, (n, 2), &Device::Cpu).unwrap(),
            Tensor::from_vec(y, n, &Device::Cpu).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_misaligned_columns() {
        let x = Tensor::zeros((4, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(TensorDataset::new(vec![x, y]).is_err());
    }

    #[test]
    fn sequential_batches_cover_all_rows() {
        let loader = DataLoader::new(dataset(10), 4).unwrap();
        assert_eq!(loader.num_batches(), 3);
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<_> = loader
            .epoch_iter(&mut rng)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0][0].dims(), &[4, 2]);
        assert_eq!(batches[2][0].dims(), &[2, 2]);
        // Last column of the first batch holds targets 0..4 in order.
        assert_eq!(
            batches[0][1].to_vec1::<f32>().unwrap(),
            vec![0.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn drop_last_discards_partial_batch() {
        let loader = DataLoader::new(dataset(10), 4).unwrap().with_drop_last(true);
        assert_eq!(loader.num_batches(), 2);
        let mut rng = StdRng::seed_from_u64(0);
        let batches: Vec<_> = loader
            .epoch_iter(&mut rng)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn shuffle_permutes_but_preserves_pairing() {
        let loader = DataLoader::new(dataset(8), 8).unwrap().with_shuffle(true);
        let mut rng = StdRng::seed_from_u64(13);
        let batch = loader
            .epoch_iter(&mut rng)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let xs = batch[0].to_vec2::<f32>().unwrap();
        let ys = batch[1].to_vec1::<f32>().unwrap();
        // Row (2k, 2k+1) pairs with target k, whatever the order.
        for (x, y) in xs.iter().zip(ys.iter()) {
            assert_eq!(x[0], y * 2.0);
            assert_eq!(x[1], y * 2.0 + 1.0);
        }
        let mut sorted = ys.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(sorted, (0..8).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn same_seed_gives_same_order() {
        let loader = DataLoader::new(dataset(16), 16).unwrap().with_shuffle(true);
        let order = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            loader
                .epoch_iter(&mut rng)
                .unwrap()
                .next()
                .unwrap()
                .unwrap()[1]
                .to_vec1::<f32>()
                .unwrap()
        };
        assert_eq!(order(5), order(5));
        assert_ne!(order(5), order(6));
    }

    #[test]
    fn random_split_rejects_degenerate_fractions() {
        assert!(random_split(&dataset(10), 0.0, 7).is_err());
        assert!(random_split(&dataset(10), 1.0, 7).is_err());
        assert!(random_split(&dataset(10), -0.1, 7).is_err());
        // Fraction too small to select a single sample.
        assert!(random_split(&dataset(10), 0.05, 7).is_err());
    }

    #[test]
    fn sample_weight_column_survives_split_and_batching() {
        let n = 10;
        let x = Tensor::zeros((n, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let y = Tensor::zeros(n, candle_core::DType::F32, &Device::Cpu).unwrap();
        let w = Tensor::ones(n, candle_core::DType::F32, &Device::Cpu).unwrap();
        let ds = TensorDataset::from_xyw(x, y, w).unwrap();
        assert!(ds.has_sample_weights());
        assert_eq!(ds.columns().len(), 3);

        let (train, val) = random_split(&ds, 0.3, 7).unwrap();
        assert!(train.has_sample_weights());
        assert!(val.has_sample_weights());

        let loader = DataLoader::new(train, 4).unwrap();
        assert!(loader.has_sample_weights());
        let mut rng = StdRng::seed_from_u64(0);
        let batch = loader.epoch_iter(&mut rng).unwrap().next().unwrap().unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn random_split_partitions_without_overlap() {
        let (train, val) = random_split(&dataset(10), 0.3, 7).unwrap();
        assert_eq!(train.len(), 7);
        assert_eq!(val.len(), 3);
        let mut all: Vec<f32> = train.columns()[1]
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .chain(val.columns()[1].to_vec1::<f32>().unwrap())
            .collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, (0..10).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn ndarray_roundtrip() {
        let arr = ndarray::Array2::<f32>::from_shape_vec((2, 3), (0..6).map(|v| v as f32).collect())
            .unwrap();
        let t = tensor_from_f32(&arr, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3]);
        assert_eq!(t.to_vec2::<f32>().unwrap()[1], vec![3.0, 4.0, 5.0]);
    }
}
