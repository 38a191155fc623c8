//! Batching: padding collation and length-grouped sampling.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{Result, TuneError};
use crate::prompt::{TokenizedExample, IGNORE_INDEX};

/// Upper bound on how many batches one sorted mega-batch spans.
const MAX_MEGA_BATCH_MULT: usize = 50;

/// A padded batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids, `(batch, seq)` `u32`.
    pub input_ids: Tensor,
    /// 1 for real tokens, 0 for padding, `(batch, seq)` `u32`.
    pub attention_mask: Tensor,
    /// Loss targets, `(batch, seq)` `i64`, [`IGNORE_INDEX`] on prompt and padding.
    pub labels: Tensor,
}

impl Batch {
    /// Number of sequences in the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not two-dimensional.
    pub fn size(&self) -> Result<usize> {
        Ok(self.input_ids.dim(0)?)
    }

    /// Padded sequence length.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not two-dimensional.
    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.input_ids.dim(1)?)
    }
}

/// Pad examples to the longest one and stack them into tensors.
///
/// # Errors
///
/// Returns an error if `examples` is empty or tensor creation fails.
pub fn collate(examples: &[&TokenizedExample], pad_token_id: u32, device: &Device) -> Result<Batch> {
    let max_len = examples
        .iter()
        .map(|e| e.length())
        .max()
        .ok_or_else(|| TuneError::Training("cannot collate an empty batch".into()))?;
    let n = examples.len();

    let mut input_ids = Vec::with_capacity(n * max_len);
    let mut attention_mask = Vec::with_capacity(n * max_len);
    let mut labels = Vec::with_capacity(n * max_len);

    for example in examples {
        let pad = max_len - example.length();
        input_ids.extend_from_slice(&example.input_ids);
        input_ids.extend(std::iter::repeat(pad_token_id).take(pad));
        attention_mask.extend_from_slice(&example.attention_mask);
        attention_mask.extend(std::iter::repeat(0u32).take(pad));
        labels.extend_from_slice(&example.labels);
        labels.extend(std::iter::repeat(IGNORE_INDEX).take(pad));
    }

    Ok(Batch {
        input_ids: Tensor::from_vec(input_ids, (n, max_len), device)?,
        attention_mask: Tensor::from_vec(attention_mask, (n, max_len), device)?,
        labels: Tensor::from_vec(labels, (n, max_len), device)?,
    })
}

/// Shuffles indices so that examples of similar length share a batch.
///
/// Indices are shuffled, cut into mega-batches of up to `50 × batch_size`,
/// each mega-batch is sorted by length descending, and the overall longest
/// example is moved to the very first position so an out-of-memory error
/// surfaces on the first step.
#[derive(Debug, Clone)]
pub struct LengthGroupedSampler {
    lengths: Vec<usize>,
    batch_size: usize,
    seed: u64,
}

impl LengthGroupedSampler {
    /// Create a sampler over examples with the given lengths.
    #[must_use]
    pub fn new(lengths: Vec<usize>, batch_size: usize, seed: u64) -> Self {
        Self {
            lengths,
            batch_size: batch_size.max(1),
            seed,
        }
    }

    /// Build a sampler from tokenized examples.
    #[must_use]
    pub fn from_examples(examples: &[TokenizedExample], batch_size: usize, seed: u64) -> Self {
        Self::new(
            examples.iter().map(TokenizedExample::length).collect(),
            batch_size,
            seed,
        )
    }

    fn mega_batch_size(&self) -> usize {
        let mult = (self.lengths.len() / (self.batch_size * 4)).clamp(1, MAX_MEGA_BATCH_MULT);
        mult * self.batch_size
    }

    /// Index order for one epoch. Different epochs give different orders.
    #[must_use]
    pub fn indices(&self, epoch: usize) -> Vec<usize> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        let mut indices: Vec<usize> = (0..self.lengths.len()).collect();
        indices.shuffle(&mut rng);

        let mut megabatches: Vec<Vec<usize>> = indices
            .chunks(self.mega_batch_size())
            .map(|chunk| {
                let mut mb = chunk.to_vec();
                mb.sort_by(|&a, &b| self.lengths[b].cmp(&self.lengths[a]));
                mb
            })
            .collect();

        let longest = megabatches
            .iter()
            .enumerate()
            .max_by_key(|(i, mb)| (self.lengths[mb[0]], std::cmp::Reverse(*i)))
            .map(|(i, _)| i);
        if let Some(longest) = longest {
            if longest != 0 {
                let head = megabatches[0][0];
                megabatches[0][0] = megabatches[longest][0];
                megabatches[longest][0] = head;
            }
        }

        megabatches.into_iter().flatten().collect()
    }
}

/// Split an index order into batches.
#[must_use]
pub fn batch_indices(order: &[usize], batch_size: usize, drop_last: bool) -> Vec<Vec<usize>> {
    order
        .chunks(batch_size.max(1))
        .filter(|chunk| !drop_last || chunk.len() == batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Uniformly shuffled index order for one epoch.
#[must_use]
pub fn shuffled_indices(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rng);
    indices
}
