pub mod dataset;
pub mod encode;

use std::{collections::VecDeque, sync::Arc};

use bucketing::{shuffled_batches, EpochBatches, LengthBucketSampler, LengthIndex, SamplerConfig};
use candle_core::{Device, Tensor};
use futures::future::BoxFuture;
use rand::{rngs::StdRng, SeedableRng};
use rayon::{prelude::*, ThreadPool};
use tracing::debug;

use crate::TrainingError;

pub use dataset::{
    build_targets, read_labelled_csv, read_text_csv, split_train_valid, LabelledRows, TextRows,
    AUX_COLUMNS, IDENTITY_COLUMNS, TARGET_WIDTH,
};
pub use encode::{encode_corpus, encode_fixed, EncodedTexts, SpecialTokens};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct DataBatch {
    /// `(batch, width)` token ids.
    pub input_ids: Tensor,
    /// `(batch, width)`, 1 where `input_ids` is not padding.
    pub attention_mask: Tensor,
    /// `(batch, target_width)` when the split is labelled.
    pub targets: Option<Tensor>,
    /// Dataset rows in batch order.
    pub indices: Vec<usize>,
    pub lengths: Vec<usize>,
    pub epoch: usize,
    pub batch_index: usize,
}

impl DataBatch {
    pub fn size(&self) -> usize {
        self.indices.len()
    }
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn batches_per_epoch(&self) -> usize;

    /// Resets the loader to the first batch of `epoch`.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Advances past `count` batches of the current epoch without building
    /// them; returns how many were skipped.
    fn skip_batches(&mut self, count: usize) -> Result<usize>;

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inner.batches_per_epoch()
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn skip_batches(&mut self, count: usize) -> Result<usize> {
        self.inner.skip_batches(count)
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

/// Encoded rows held in host memory, materialized into tensors per batch.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    tokens: Vec<u32>,
    width: usize,
    pad_id: u32,
    targets: Option<Vec<f32>>,
    target_width: usize,
}

impl TokenDataset {
    pub fn new(
        tokens: Vec<u32>,
        width: usize,
        pad_id: u32,
        targets: Option<(Vec<f32>, usize)>,
    ) -> Result<Self> {
        if width == 0 || tokens.len() % width != 0 {
            return Err(TrainingError::data(format!(
                "token buffer of {} ids does not divide into rows of width {}",
                tokens.len(),
                width
            )));
        }
        let rows = tokens.len() / width;
        let (targets, target_width) = match targets {
            Some((values, target_width)) => {
                if target_width == 0 || values.len() != rows * target_width {
                    return Err(TrainingError::data(format!(
                        "expected {} target values for {} rows, found {}",
                        rows * target_width,
                        rows,
                        values.len()
                    )));
                }
                (Some(values), target_width)
            }
            None => (None, 0),
        };
        Ok(Self {
            tokens,
            width,
            pad_id,
            targets,
            target_width,
        })
    }

    pub fn from_encoded(encoded: EncodedTexts, pad_id: u32, targets: Option<(Vec<f32>, usize)>) -> Result<Self> {
        Self::new(encoded.tokens, encoded.width, pad_id, targets)
    }

    pub fn rows(&self) -> usize {
        self.tokens.len() / self.width
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn is_labelled(&self) -> bool {
        self.targets.is_some()
    }

    pub fn length_index(&self) -> Result<LengthIndex> {
        Ok(LengthIndex::from_rows(&self.tokens, self.width, self.pad_id)?)
    }

    /// Copies `indices` into freshly allocated tensors on `device`.
    pub fn gather(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Option<Tensor>, Vec<usize>)> {
        let mut ids = Vec::with_capacity(indices.len() * self.width);
        let mut lengths = Vec::with_capacity(indices.len());
        for &index in indices {
            let row = self.tokens.get(index * self.width..(index + 1) * self.width).ok_or_else(|| {
                TrainingError::data(format!("row {index} out of range for {} rows", self.rows()))
            })?;
            lengths.push(row.iter().filter(|&&id| id != self.pad_id).count());
            ids.extend_from_slice(row);
        }
        let input_ids = Tensor::from_vec(ids, (indices.len(), self.width), device)?;

        let targets = match &self.targets {
            Some(values) => {
                let mut rows = Vec::with_capacity(indices.len() * self.target_width);
                for &index in indices {
                    rows.extend_from_slice(&values[index * self.target_width..(index + 1) * self.target_width]);
                }
                Some(Tensor::from_vec(rows, (indices.len(), self.target_width), device)?)
            }
            None => None,
        };

        Ok((input_ids, targets, lengths))
    }
}

/// How a loader orders rows into batches.
#[derive(Debug, Clone)]
pub enum BatchOrder {
    /// Length-bucketed sampling, reseeded every epoch.
    Bucketed(SamplerConfig),
    /// Uniform shuffle, reseeded every epoch.
    Shuffled { batch_size: usize },
    /// Dataset order, for validation and inference.
    Sequential { batch_size: usize },
}

enum Plan {
    Bucketed(LengthBucketSampler),
    Shuffled(usize),
    Sequential(usize),
}

enum EpochPlan {
    Bucketed(EpochBatches<StdRng>),
    Listed(VecDeque<Vec<usize>>),
}

impl EpochPlan {
    fn next_indices(&mut self) -> Result<Option<Vec<usize>>> {
        match self {
            EpochPlan::Bucketed(batches) => Ok(batches.next_batch()?),
            EpochPlan::Listed(batches) => Ok(batches.pop_front()),
        }
    }
}

/// Loader over an in-memory [`TokenDataset`] that builds batches on a worker
/// pool, `prefetch` batches at a time, and hands them out in plan order.
pub struct BucketedDataLoader {
    dataset: Arc<TokenDataset>,
    plan: Plan,
    device: Device,
    pool: Arc<ThreadPool>,
    prefetch: usize,
    seed: u64,
    epoch: usize,
    produced: usize,
    current: Option<EpochPlan>,
    ready: VecDeque<DataBatch>,
}

impl BucketedDataLoader {
    pub fn new(
        dataset: Arc<TokenDataset>,
        order: BatchOrder,
        device: Device,
        pool: Arc<ThreadPool>,
        seed: u64,
    ) -> Result<Self> {
        if dataset.rows() == 0 {
            return Err(TrainingError::data("cannot load batches from an empty dataset"));
        }
        let plan = match order {
            BatchOrder::Bucketed(config) => {
                let index = dataset.length_index()?;
                Plan::Bucketed(LengthBucketSampler::new(&index, config)?)
            }
            BatchOrder::Shuffled { batch_size } | BatchOrder::Sequential { batch_size }
                if batch_size == 0 =>
            {
                return Err(TrainingError::data("batch size must be greater than zero"));
            }
            BatchOrder::Shuffled { batch_size } => Plan::Shuffled(batch_size),
            BatchOrder::Sequential { batch_size } => Plan::Sequential(batch_size),
        };
        let prefetch = pool.current_num_threads().max(1);

        Ok(Self {
            dataset,
            plan,
            device,
            pool,
            prefetch,
            seed,
            epoch: 0,
            produced: 0,
            current: None,
            ready: VecDeque::new(),
        })
    }

    pub fn dataset(&self) -> &TokenDataset {
        &self.dataset
    }

    fn epoch_plan(&self, epoch: usize) -> EpochPlan {
        let rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        match &self.plan {
            Plan::Bucketed(sampler) => EpochPlan::Bucketed(sampler.epoch(rng)),
            Plan::Shuffled(batch_size) => {
                let mut rng = rng;
                EpochPlan::Listed(shuffled_batches(self.dataset.rows(), *batch_size, &mut rng).into())
            }
            Plan::Sequential(batch_size) => {
                let rows: Vec<usize> = (0..self.dataset.rows()).collect();
                EpochPlan::Listed(rows.chunks(*batch_size).map(<[usize]>::to_vec).collect())
            }
        }
    }

    fn fill(&mut self) -> Result<()> {
        if !self.ready.is_empty() {
            return Ok(());
        }
        if self.current.is_none() {
            self.current = Some(self.epoch_plan(self.epoch));
        }
        let Some(plan) = self.current.as_mut() else {
            return Ok(());
        };

        let mut pending = Vec::with_capacity(self.prefetch);
        while pending.len() < self.prefetch {
            match plan.next_indices()? {
                Some(indices) => pending.push(indices),
                None => break,
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        let dataset = Arc::clone(&self.dataset);
        let device = self.device.clone();
        let built = self.pool.install(|| {
            pending
                .par_iter()
                .map(|indices| dataset.gather(indices, &device))
                .collect::<Result<Vec<_>>>()
        })?;

        for (indices, (input_ids, targets, lengths)) in pending.into_iter().zip(built) {
            let attention_mask = input_ids.ne(self.dataset.pad_id())?;
            self.ready.push_back(DataBatch {
                input_ids,
                attention_mask,
                targets,
                indices,
                lengths,
                epoch: self.epoch,
                batch_index: self.produced,
            });
            self.produced += 1;
        }
        debug!(epoch = self.epoch, buffered = self.ready.len(), "prefetched batches");
        Ok(())
    }
}

impl DataLoader for BucketedDataLoader {
    fn batches_per_epoch(&self) -> usize {
        match &self.plan {
            Plan::Bucketed(sampler) => sampler.len(),
            Plan::Shuffled(batch_size) | Plan::Sequential(batch_size) => {
                self.dataset.rows().div_ceil(*batch_size)
            }
        }
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.epoch = epoch;
        self.produced = 0;
        self.ready.clear();
        self.current = Some(self.epoch_plan(epoch));
        Ok(())
    }

    fn skip_batches(&mut self, count: usize) -> Result<usize> {
        let mut skipped = 0;
        while skipped < count {
            if self.ready.pop_front().is_some() {
                skipped += 1;
                continue;
            }
            if self.current.is_none() {
                self.current = Some(self.epoch_plan(self.epoch));
            }
            let Some(plan) = self.current.as_mut() else {
                break;
            };
            if plan.next_indices()?.is_none() {
                break;
            }
            self.produced += 1;
            skipped += 1;
        }
        Ok(skipped)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move {
            self.fill()?;
            Ok(self.ready.pop_front())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::ThreadPoolBuilder;

    fn dataset(lengths: &[usize], width: usize) -> Arc<TokenDataset> {
        let mut tokens = Vec::new();
        let mut targets = Vec::new();
        for (row, &len) in lengths.iter().enumerate() {
            tokens.extend(std::iter::repeat(5u32).take(len));
            tokens.extend(std::iter::repeat(0u32).take(width - len));
            targets.extend([row as f32, 1.0]);
        }
        Arc::new(TokenDataset::new(tokens, width, 0, Some((targets, 2))).unwrap())
    }

    fn pool(threads: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPoolBuilder::new().num_threads(threads).build().unwrap())
    }

    fn drain(loader: &mut BlockingDataLoader<BucketedDataLoader>) -> Vec<DataBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = loader.next_batch().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn sequential_order_is_preserved_across_workers() {
        let data = dataset(&[3; 23], 8);
        let loader = BucketedDataLoader::new(
            data,
            BatchOrder::Sequential { batch_size: 5 },
            Device::Cpu,
            pool(3),
            0,
        )
        .unwrap();
        let mut loader = BlockingDataLoader::new(loader);
        loader.start_epoch(0).unwrap();

        let batches = drain(&mut loader);
        let order: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
        assert_eq!(order, (0..23).collect::<Vec<_>>());
        assert_eq!(batches.len(), loader.batches_per_epoch());
        assert_eq!(batches.last().unwrap().size(), 3);

        let targets = batches[1].targets.as_ref().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(targets[0], vec![5.0, 1.0]);
    }

    #[test]
    fn bucketed_epochs_cover_every_row_once() {
        let lengths: Vec<usize> = (0..50).map(|i| i % 16 + 1).collect();
        let loader = BucketedDataLoader::new(
            dataset(&lengths, 16),
            BatchOrder::Bucketed(SamplerConfig {
                batch_size: 8,
                ..SamplerConfig::default()
            }),
            Device::Cpu,
            pool(2),
            7,
        )
        .unwrap();
        let mut loader = BlockingDataLoader::new(loader);

        for epoch in 0..2 {
            loader.start_epoch(epoch).unwrap();
            let batches = drain(&mut loader);
            assert_eq!(batches.len(), 7);
            let mut rows: Vec<usize> = batches.iter().flat_map(|b| b.indices.clone()).collect();
            rows.sort_unstable();
            assert_eq!(rows, (0..50).collect::<Vec<_>>());
            for batch in &batches {
                assert_eq!(batch.epoch, epoch);
                for (&row, &len) in batch.indices.iter().zip(&batch.lengths) {
                    assert_eq!(len, lengths[row]);
                }
            }
        }
    }

    #[test]
    fn skipping_resumes_the_same_sequence() {
        let lengths: Vec<usize> = (0..40).map(|i| i % 12 + 1).collect();
        let build = || {
            let loader = BucketedDataLoader::new(
                dataset(&lengths, 12),
                BatchOrder::Shuffled { batch_size: 4 },
                Device::Cpu,
                pool(2),
                3,
            )
            .unwrap();
            BlockingDataLoader::new(loader)
        };

        let mut full = build();
        full.start_epoch(1).unwrap();
        let expected: Vec<Vec<usize>> = drain(&mut full).into_iter().map(|b| b.indices).collect();

        let mut resumed = build();
        resumed.start_epoch(1).unwrap();
        assert_eq!(resumed.skip_batches(4).unwrap(), 4);
        let rest: Vec<Vec<usize>> = drain(&mut resumed).into_iter().map(|b| b.indices).collect();
        assert_eq!(rest, expected[4..].to_vec());
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let err = TokenDataset::new(vec![1, 2, 3, 4], 2, 0, Some((vec![1.0], 1))).unwrap_err();
        assert!(matches!(err, TrainingError::Data(_)));
    }
}
