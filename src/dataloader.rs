//! Data loader

use std::collections::HashSet;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_pcg::Pcg64Mcg;
use thiserror::Error;

use crate::{mnist::Mnist, value::Value};

/// Errors for the dataloader
#[derive(Debug, Error)]
pub enum DataLoaderError {
    #[error(
        "All input vectors must have the same dimension. Received different sizes: {input_dims:?}"
    )]
    InputDimensionMismatch { input_dims: HashSet<usize> },
    #[error("Labels must have the same length as the data, got {label_len} labels for {data_len} inputs")]
    LabelLengthMismatch { label_len: usize, data_len: usize },
    #[error("Batch size must be positive")]
    ZeroBatchSize,
}

/// One mini batch, inputs are fresh leaf values so every batch builds its own graph
#[derive(Debug, PartialEq)]
pub struct Batch {
    pub inputs: Vec<Vec<Value>>,
    pub targets: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Data loader, returns batches of data and class labels optionally shuffled
/// Takes inspiration from the PyTorch DataLoader
/// <https://pytorch.org/docs/stable/data.html#torch.utils.data.DataLoader>
pub struct DataLoader {
    data: Vec<Vec<f32>>,
    labels: Vec<usize>,
    batch_size: usize,
    shuffle: bool,
}

impl DataLoader {
    pub fn new(
        data: Vec<Vec<f32>>,
        labels: Vec<usize>,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        if batch_size == 0 {
            return Err(DataLoaderError::ZeroBatchSize);
        }
        if data.len() != labels.len() {
            return Err(DataLoaderError::LabelLengthMismatch {
                label_len: labels.len(),
                data_len: data.len(),
            });
        }
        let input_dims = data.iter().map(|d| d.len()).collect::<HashSet<_>>();
        if input_dims.len() > 1 {
            return Err(DataLoaderError::InputDimensionMismatch { input_dims });
        }
        Ok(Self {
            data,
            labels,
            batch_size,
            shuffle,
        })
    }

    /// Wraps an IDX dataset
    pub fn from_mnist(
        dataset: Mnist,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self, DataLoaderError> {
        let labels = dataset.labels.iter().map(|&l| l as usize).collect();
        Self::new(dataset.images, labels, batch_size, shuffle)
    }

    /// Number of samples
    pub fn n_samples(&self) -> usize {
        self.data.len()
    }

    /// Number of batches per pass, counting a final partial batch
    pub fn len(&self) -> usize {
        self.data.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Iterates with a reproducible shuffle order (when shuffling is enabled)
    pub fn seeded_iter(&self, seed: u64) -> DataLoaderIterator<'_> {
        self.iter_with(&mut Pcg64Mcg::seed_from_u64(seed))
    }

    pub fn iter(&self) -> DataLoaderIterator<'_> {
        self.iter_with(&mut rand::rng())
    }

    fn iter_with<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoaderIterator<'_> {
        let mut indices = (0..self.data.len()).collect::<Vec<_>>();
        if self.shuffle {
            indices.shuffle(rng);
        }
        DataLoaderIterator {
            loader: self,
            indices,
            curr_iter: 0,
        }
    }
}

/// An iterator which returns mini batches of data and labels until the end of the dataset.
/// The last batch is smaller when the dataset size is not a multiple of the batch size.
pub struct DataLoaderIterator<'a> {
    loader: &'a DataLoader,
    // optionally shuffled indices
    indices: Vec<usize>,
    curr_iter: usize,
}

impl Iterator for DataLoaderIterator<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr_iter >= self.indices.len() {
            return None;
        }
        let end = (self.curr_iter + self.loader.batch_size).min(self.indices.len());
        let batch_indices = &self.indices[self.curr_iter..end];
        let inputs = batch_indices
            .iter()
            .map(|&i| self.loader.data[i].iter().map(|v| Value::new(*v)).collect())
            .collect();
        let targets = batch_indices.iter().map(|&i| self.loader.labels[i]).collect();
        self.curr_iter = end;
        Some(Batch { inputs, targets })
    }
}
