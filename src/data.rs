use ndarray::{Array2, ArrayView2, Axis, s};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::error::{Result, TrainError};

/// A borrowed batch of training data (zero-copy).
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub input: ArrayView2<'a, f32>,
    pub label: ArrayView2<'a, f32>,
}

impl Batch<'_> {
    /// The number of samples in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.input.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A source of borrowed batches, consumed epoch by epoch.
///
/// When several ranks train together every rank must yield the same number
/// of batches per epoch; the core trusts its loaders on this.
pub trait DataLoader: Send {
    /// Rewinds to the first batch of a fresh epoch.
    fn reset(&mut self);

    /// Returns the next borrowed batch, or `None` when the epoch is done.
    fn next_batch(&mut self) -> Option<Batch<'_>>;

    /// The number of batches one epoch yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A minimal in-memory dataset of `(input, label)` matrix pairs.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Array2<f32>,
    labels: Array2<f32>,
}

impl TensorDataset {
    /// Creates a new dataset from owned matrices, one sample per row.
    ///
    /// # Errors
    /// Rejects empty data and row-count mismatches.
    pub fn new(inputs: Array2<f32>, labels: Array2<f32>) -> Result<Self> {
        if inputs.nrows() == 0 {
            return Err(TrainError::Config("dataset must be non-empty".into()));
        }

        if inputs.nrows() != labels.nrows() {
            return Err(TrainError::Config(format!(
                "inputs have {} rows, labels {}",
                inputs.nrows(),
                labels.nrows()
            )));
        }

        Ok(Self { inputs, labels })
    }

    /// One-hot encodes class indices into a label matrix.
    pub fn one_hot(classes: &[usize], num_classes: usize) -> Array2<f32> {
        let mut labels = Array2::zeros((classes.len(), num_classes));
        for (row, &class) in classes.iter().enumerate() {
            labels[[row, class]] = 1.0;
        }
        labels
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inputs.nrows() == 0
    }
}

/// Yields fixed-size borrowed batches over a `TensorDataset`.
///
/// Only full batches are yielded; a trailing remainder smaller than
/// `batch_rows` is skipped so every step sees the same shape.
#[derive(Debug)]
pub struct TensorLoader {
    inputs: Array2<f32>,
    labels: Array2<f32>,
    batch_rows: usize,
    cursor: usize,
    shuffle: Option<StdRng>,
}

impl TensorLoader {
    /// Creates a loader yielding batches in dataset order.
    ///
    /// # Errors
    /// Rejects a zero batch size and a dataset smaller than one batch.
    pub fn new(dataset: TensorDataset, batch_rows: usize) -> Result<Self> {
        if batch_rows == 0 {
            return Err(TrainError::Config("batch_rows must be positive".into()));
        }

        if dataset.len() < batch_rows {
            return Err(TrainError::Config(format!(
                "dataset of {} samples cannot fill a batch of {batch_rows}",
                dataset.len()
            )));
        }

        Ok(Self {
            inputs: dataset.inputs,
            labels: dataset.labels,
            batch_rows,
            cursor: 0,
            shuffle: None,
        })
    }

    /// Creates a loader that reshuffles sample order on every `reset`.
    pub fn shuffled(dataset: TensorDataset, batch_rows: usize, seed: u64) -> Result<Self> {
        let mut loader = Self::new(dataset, batch_rows)?;
        loader.shuffle = Some(StdRng::seed_from_u64(seed));
        loader.reshuffle();
        Ok(loader)
    }

    fn reshuffle(&mut self) {
        let Some(rng) = &mut self.shuffle else {
            return;
        };

        let mut order: Vec<usize> = (0..self.inputs.nrows()).collect();
        order.shuffle(rng);

        self.inputs = self.inputs.select(Axis(0), &order);
        self.labels = self.labels.select(Axis(0), &order);
    }
}

impl DataLoader for TensorLoader {
    fn reset(&mut self) {
        self.cursor = 0;
        self.reshuffle();
    }

    fn next_batch(&mut self) -> Option<Batch<'_>> {
        let end = self.cursor + self.batch_rows;

        if end > self.inputs.nrows() {
            return None;
        }

        let input = self.inputs.slice(s![self.cursor..end, ..]);
        let label = self.labels.slice(s![self.cursor..end, ..]);
        self.cursor = end;

        Some(Batch { input, label })
    }

    fn len(&self) -> usize {
        self.inputs.nrows() / self.batch_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn dataset() -> TensorDataset {
        let inputs = Array2::from_shape_fn((5, 2), |(i, j)| (i * 2 + j) as f32);
        let labels = TensorDataset::one_hot(&[0, 1, 0, 1, 0], 2);
        TensorDataset::new(inputs, labels).unwrap()
    }

    #[test]
    fn batches_cover_full_rows_and_skip_the_remainder() {
        let mut loader = TensorLoader::new(dataset(), 2).unwrap();
        assert_eq!(loader.len(), 2);

        let first = loader.next_batch().unwrap();
        assert_eq!(first.input, array![[0.0, 1.0], [2.0, 3.0]]);
        assert_eq!(first.len(), 2);

        let second = loader.next_batch().unwrap();
        assert_eq!(second.input, array![[4.0, 5.0], [6.0, 7.0]]);

        // The fifth sample cannot fill a batch.
        assert!(loader.next_batch().is_none());

        loader.reset();
        assert_eq!(loader.next_batch().unwrap().input, array![[0.0, 1.0], [2.0, 3.0]]);
    }

    #[test]
    fn shuffled_loader_keeps_rows_paired() {
        let inputs = Array2::from_shape_fn((6, 1), |(i, _)| i as f32);
        let labels = Array2::from_shape_fn((6, 1), |(i, _)| i as f32 + 100.0);
        let dataset = TensorDataset::new(inputs, labels).unwrap();

        let mut loader = TensorLoader::shuffled(dataset, 3, 9).unwrap();

        for _ in 0..2 {
            loader.reset();
            while let Some(batch) = loader.next_batch() {
                for (x, y) in batch.input.iter().zip(batch.label.iter()) {
                    assert_eq!(*y, *x + 100.0);
                }
            }
        }
    }

    #[test]
    fn one_hot_sets_single_columns() {
        let labels = TensorDataset::one_hot(&[2, 0], 3);
        assert_eq!(labels, array![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0]]);
    }

    #[test]
    fn undersized_dataset_is_rejected() {
        let inputs = Array2::zeros((2, 1));
        let labels = Array2::zeros((2, 1));
        let dataset = TensorDataset::new(inputs, labels).unwrap();

        assert!(matches!(
            TensorLoader::new(dataset, 4),
            Err(TrainError::Config(_))
        ));
    }
}
