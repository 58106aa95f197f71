//! Batch iteration for training and evaluation.

use crate::types::{DatasetResult, DomainSample, IMAGE_CHANNELS, IMAGE_ELEMS, IMAGE_SIDE};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

pub struct DomainBatch<B: Backend> {
    /// Images in `[0, 1]`, shape `[batch, 3, 28, 28]`.
    pub images: Tensor<B, 4>,
    /// Class indices, present only when every sample in the batch is labeled.
    pub labels: Option<Tensor<B, 1, Int>>,
}

impl<B: Backend> DomainBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resettable pass over one split. Each `reset` starts a new pass with a fresh order derived
/// from the seed and the pass number, so a run is reproducible end to end.
pub struct BatchIter {
    samples: Arc<Vec<DomainSample>>,
    order: Vec<usize>,
    cursor: usize,
    shuffle: bool,
    seed: u64,
    pass: u64,
    images_buf: Vec<f32>,
    labels_buf: Vec<i64>,
}

impl BatchIter {
    pub fn new(samples: Arc<Vec<DomainSample>>, shuffle: bool, seed: u64) -> Self {
        let mut iter = Self {
            order: (0..samples.len()).collect(),
            samples,
            cursor: 0,
            shuffle,
            seed,
            pass: 0,
            images_buf: Vec::new(),
            labels_buf: Vec::new(),
        };
        iter.reorder();
        iter
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of batches one pass yields, counting a trailing partial batch.
    pub fn batches_per_pass(&self, batch_size: usize) -> usize {
        self.samples.len().div_ceil(batch_size.max(1))
    }

    /// Rewind to the start of a new pass.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.pass += 1;
        self.reorder();
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.order.len()
    }

    fn reorder(&mut self) {
        self.order = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.pass));
            self.order.shuffle(&mut rng);
        }
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> DatasetResult<Option<DomainBatch<B>>> {
        if self.is_exhausted() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size.max(1)).min(self.order.len());
        let picked = &self.order[self.cursor..end];
        self.cursor = end;

        self.images_buf.clear();
        self.labels_buf.clear();
        let batch_len = picked.len();
        if self.images_buf.capacity() < batch_len * IMAGE_ELEMS {
            self.images_buf.reserve(batch_len * IMAGE_ELEMS);
        }

        let mut all_labeled = true;
        for &idx in picked {
            let sample = &self.samples[idx];
            self.images_buf
                .extend(sample.pixels.iter().map(|&p| p as f32 / 255.0));
            match sample.label {
                Some(label) => self.labels_buf.push(label as i64),
                None => all_labeled = false,
            }
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(
                self.images_buf.clone(),
                [batch_len, IMAGE_CHANNELS, IMAGE_SIDE, IMAGE_SIDE],
            ),
            device,
        );
        let labels = all_labeled.then(|| {
            Tensor::<B, 1, Int>::from_data(
                TensorData::new(self.labels_buf.clone(), [batch_len]),
                device,
            )
        });
        Ok(Some(DomainBatch { images, labels }))
    }
}
