use rand::{
    distributions::{Distribution, WeightedIndex},
    seq::SliceRandom,
    Rng,
};

use crate::{binned_length, BucketError, LengthIndex, Result, DEFAULT_GRANULARITY};

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerConfig {
    pub batch_size: usize,
    /// Bucket width `k`; keys are positive multiples of it.
    pub granularity: usize,
    /// Half-width of the neighbourhood used after narrowing, in buckets.
    pub window: usize,
    /// Chance that a batch is restricted to buckets near its first draw.
    pub narrow_probability: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            granularity: DEFAULT_GRANULARITY,
            window: 2,
            narrow_probability: 0.8,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }
        if self.granularity == 0 {
            errors.push("granularity must be greater than 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.narrow_probability) {
            errors.push(format!(
                "narrow_probability must be in [0, 1] (got {})",
                self.narrow_probability
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BucketError::Config(errors.join("; ")))
        }
    }
}

/// Batch sampler that groups rows of similar length.
///
/// Every epoch covers each row exactly once in `ceil(rows / batch_size)`
/// batches; only the last batch may be short. Within a batch, rows are drawn
/// bucket by bucket proportionally to how many rows each bucket still holds,
/// and most batches are confined to the buckets around their first draw.
#[derive(Debug, Clone)]
pub struct LengthBucketSampler {
    config: SamplerConfig,
    slots: Vec<usize>,
    num_slots: usize,
}

impl LengthBucketSampler {
    pub fn new(index: &LengthIndex, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        if index.is_empty() {
            return Err(BucketError::EmptyDataset);
        }

        let k = config.granularity;
        let slots: Vec<usize> = index
            .lengths()
            .iter()
            .map(|&len| binned_length(len, k) / k - 1)
            .collect();
        let num_slots = slots.iter().copied().max().map_or(0, |max| max + 1);

        Ok(Self {
            config,
            slots,
            num_slots,
        })
    }

    /// Number of batches produced per epoch.
    pub fn len(&self) -> usize {
        self.slots.len().div_ceil(self.config.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn num_rows(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Shuffles the dataset into a fresh bucket arena and returns the
    /// batches of one epoch. The arena is owned by the returned value and is
    /// drained as batches are pulled.
    pub fn epoch<R: Rng>(&self, mut rng: R) -> EpochBatches<R> {
        let mut order: Vec<usize> = (0..self.slots.len()).collect();
        order.shuffle(&mut rng);

        let mut arena: Vec<Vec<usize>> = vec![Vec::new(); self.num_slots];
        for index in order {
            arena[self.slots[index]].push(index);
        }

        EpochBatches {
            arena,
            remaining: self.slots.len(),
            batch_size: self.config.batch_size,
            window: self.config.window,
            narrow_probability: self.config.narrow_probability,
            emitted: 0,
            batches: self.len(),
            rng,
        }
    }
}

/// One epoch worth of batches drawn from a bucket arena.
#[derive(Debug)]
pub struct EpochBatches<R> {
    arena: Vec<Vec<usize>>,
    remaining: usize,
    batch_size: usize,
    window: usize,
    narrow_probability: f64,
    emitted: usize,
    batches: usize,
    rng: R,
}

impl<R: Rng> EpochBatches<R> {
    /// Batches not yet produced this epoch.
    pub fn remaining_batches(&self) -> usize {
        self.batches - self.emitted
    }

    /// Rows still sitting in the arena.
    pub fn remaining_rows(&self) -> usize {
        self.remaining
    }

    pub fn next_batch(&mut self) -> Result<Option<Vec<usize>>> {
        if self.emitted >= self.batches {
            return Ok(None);
        }

        let last_batch = self.emitted + 1 == self.batches;
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut candidates = self.all_slots();

        while batch.len() < self.batch_size {
            let weights: Vec<usize> = candidates
                .iter()
                .map(|&slot| self.arena[slot].len())
                .collect();

            if weights.iter().all(|&weight| weight == 0) {
                if self.remaining == 0 {
                    if last_batch {
                        break;
                    }
                    return Err(BucketError::InvariantViolation {
                        batch: self.emitted,
                        batches: self.batches,
                    });
                }
                // Local neighbourhood ran dry; widen to the whole arena.
                candidates = self.all_slots();
                continue;
            }

            let distribution = WeightedIndex::new(&weights)
                .map_err(|err| BucketError::Config(format!("bucket weights: {err}")))?;
            let slot = candidates[distribution.sample(&mut self.rng)];
            let Some(index) = self.arena[slot].pop() else {
                continue;
            };
            self.remaining -= 1;

            if batch.is_empty() && self.rng.gen_bool(self.narrow_probability) {
                candidates = self.neighbourhood(slot);
            }
            batch.push(index);
        }

        self.emitted += 1;
        Ok(Some(batch))
    }

    /// Draws and discards `count` batches, leaving the arena exactly as a
    /// run that consumed them would.
    pub fn skip_batches(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count {
            if self.next_batch()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    fn all_slots(&self) -> Vec<usize> {
        (0..self.arena.len()).collect()
    }

    fn neighbourhood(&self, slot: usize) -> Vec<usize> {
        let low = slot.saturating_sub(self.window);
        let high = (slot + self.window).min(self.arena.len().saturating_sub(1));
        (low..=high).collect()
    }
}

impl<R: Rng> Iterator for EpochBatches<R> {
    type Item = Result<Vec<usize>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

/// Plain shuffled batching used when length bucketing is switched off.
pub fn shuffled_batches<R: Rng + ?Sized>(
    rows: usize,
    batch_size: usize,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..rows).collect();
    order.shuffle(rng);
    order
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
