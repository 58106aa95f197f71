//! Pairing source and target batches for one training pass.

use crate::config::PairingPolicy;
use burn::tensor::backend::Backend;
use domain_dataset::{BatchIter, DatasetResult, DomainBatch};

/// One epoch's worth of (source, target) batch pairs.
///
/// Both iterators are reset on construction. The pass length is fixed up front by the
/// policy; under `CycleShorter` the shorter iterator is reset whenever it runs dry.
pub struct PairedBatches<'a> {
    source: &'a mut BatchIter,
    target: &'a mut BatchIter,
    batch_size: usize,
    remaining: usize,
}

impl<'a> PairedBatches<'a> {
    pub fn new(
        source: &'a mut BatchIter,
        target: &'a mut BatchIter,
        batch_size: usize,
        policy: PairingPolicy,
    ) -> Self {
        source.reset();
        target.reset();
        let remaining = policy.steps(
            source.batches_per_pass(batch_size),
            target.batches_per_pass(batch_size),
        );
        Self {
            source,
            target,
            batch_size,
            remaining,
        }
    }

    /// Pairs left in this pass.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn next_pair<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> DatasetResult<Option<(DomainBatch<B>, DomainBatch<B>)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let source = pull(&mut *self.source, self.batch_size, device)?;
        let target = pull(&mut *self.target, self.batch_size, device)?;
        match (source, target) {
            (Some(s), Some(t)) => {
                self.remaining -= 1;
                Ok(Some((s, t)))
            }
            _ => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }
}

fn pull<B: Backend>(
    iter: &mut BatchIter,
    batch_size: usize,
    device: &B::Device,
) -> DatasetResult<Option<DomainBatch<B>>> {
    if iter.is_exhausted() {
        iter.reset();
    }
    iter.next_batch(batch_size, device)
}
