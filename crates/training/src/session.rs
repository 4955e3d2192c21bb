//! Wires configuration, data, model and checkpoints into the three run
//! modes of the `train` binary.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use bucketing::DynamicTrimmer;
use candle_core::Device;
use model::{ClassifierConfig, SequenceClassifier};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{self, CheckpointStore, TrainingProgress, MODEL_FILENAME},
    data::{
        encode_corpus, read_labelled_csv, read_text_csv, split_train_valid, BatchOrder,
        BlockingDataLoader, BucketedDataLoader, LabelledRows, SpecialTokens, TokenDataset,
        TARGET_WIDTH,
    },
    device::select_device,
    evaluation::{self, ValidationReport},
    learner::{CandleLearner, TrainableModel},
    logging::{Logger, LoggingSettings, MetricsJournal},
    loss::WeightedBceLoss,
    metrics::ValidationSummary,
    optimizer::AdamWConfig,
    scheduler::WarmupLinear,
    trainer::{
        CheckpointSink, Handoff, HandoffReason, LoopSettings, ResumePoint, SinkDecision,
        TrainOutcome, TrainingLoop,
    },
    TrainingConfig, TrainingError,
};

pub const PARAMS_FILENAME: &str = "params.json";
pub const METRICS_FILENAME: &str = "metrics.jsonl";
pub const VALID_PREDICTIONS_FILENAME: &str = "valid-predictions.csv";
pub const SUBMISSION_FILENAME: &str = "submission.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    /// Scores the validation split with the best checkpoint.
    Validate,
    /// Scores the test file with the best checkpoint.
    Submission,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Delete an existing run root before training.
    pub clean: bool,
    /// Continue from the run root's checkpoint.
    pub resume: bool,
}

pub struct Session {
    config: TrainingConfig,
    options: SessionOptions,
    device: Device,
    tokenizer: Tokenizer,
    special: SpecialTokens,
    pool: Arc<ThreadPool>,
    store: CheckpointStore,
    logger: Logger,
}

impl Session {
    pub fn new(config: TrainingConfig, options: SessionOptions, mode: RunMode) -> Result<Self, TrainingError> {
        config.validate()?;
        let run_root = config.runtime.run_root.clone();
        match mode {
            RunMode::Train => prepare_run_root(&run_root, &config, options)?,
            RunMode::Validate | RunMode::Submission => {
                if !run_root.is_dir() {
                    return Err(TrainingError::initialization(format!(
                        "run root {} does not exist",
                        run_root.display()
                    )));
                }
            }
        }

        let device = select_device(config.runtime.device)?;
        if let Err(err) = device.set_seed(config.runtime.seed) {
            debug!(error = %err, "device RNG not seeded");
        }

        let tokenizer = Tokenizer::from_file(&config.tokenizer.tokenizer_json).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer {}: {err}",
                config.tokenizer.tokenizer_json.display()
            ))
        })?;
        let special = SpecialTokens::from_tokenizer(&tokenizer, &config.tokenizer)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.data.num_workers.max(1))
            .thread_name(|index| format!("batch-worker-{index}"))
            .build()
            .map_err(|err| TrainingError::initialization(format!("failed to start worker pool: {err}")))?;

        let store = CheckpointStore::new(run_root, &config)?;
        let logger = Logger::new(LoggingSettings::from_config(&config.runtime.logging))?;

        Ok(Self {
            config,
            options,
            device,
            tokenizer,
            special,
            pool: Arc::new(pool),
            store,
            logger,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn train<F>(&self, should_stop: F) -> Result<TrainOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let (train_rows, valid_rows) = self.load_split()?;
        let loss = WeightedBceLoss::new(train_rows.loss_weight());
        info!(
            train = train_rows.len(),
            valid = valid_rows.len(),
            loss_weight = loss.loss_weight(),
            "data split"
        );

        let data = &self.config.data;
        let train_dataset = self.labelled_dataset(&train_rows, data.train_seq_length)?;
        let order = if self.config.bucketing.enabled {
            BatchOrder::Bucketed(self.config.sampler_config(data.batch_size))
        } else {
            BatchOrder::Shuffled {
                batch_size: data.batch_size,
            }
        };
        let mut train_loader = BlockingDataLoader::new(BucketedDataLoader::new(
            Arc::new(train_dataset),
            order,
            self.device.clone(),
            Arc::clone(&self.pool),
            self.config.runtime.seed,
        )?);
        let valid_loader = self.validation_loader(&valid_rows)?;

        let runtime = &self.config.runtime;
        let batches_per_epoch = train_loader.batches_per_epoch();
        let total_steps = (runtime.epochs * batches_per_epoch / runtime.accumulation_steps).max(1);
        let scheduler = WarmupLinear::new(
            self.config.optimizer.learning_rate,
            total_steps,
            self.config.optimizer.warmup_proportion,
        )?;
        let mut learner = CandleLearner::new(
            self.build_model()?,
            AdamWConfig::from(&self.config.optimizer),
            &self.config.optimizer.no_decay,
            Box::new(scheduler),
        )?;

        let settings = LoopSettings {
            epochs: runtime.epochs,
            accumulation_steps: runtime.accumulation_steps,
            yield_steps: self.config.checkpoint_interval(valid_rows.len()),
            batch_size: data.batch_size,
        };
        let trimmer = self
            .config
            .bucketing
            .enabled
            .then(|| DynamicTrimmer::new(self.config.bucketing.granularity, self.special.pad_id));
        let mut training = TrainingLoop::new(settings, trimmer, self.device.clone())?
            .with_logger(self.logger.clone());

        let mut best_auc = None;
        if self.options.resume && self.store.has_checkpoint() {
            let loaded = self.store.load(&self.device)?;
            let progress = loaded.manifest.progress.clone();
            learner.restore(loaded.snapshot)?;
            training.resume_from(ResumePoint {
                global_step: progress.global_step,
                smoothed_loss: progress.smoothed_loss,
            });
            best_auc = self.store.best_validation()?.and_then(|summary| summary.auc);
            info!(
                global_step = progress.global_step,
                optimizer_step = progress.optimizer_step,
                best_auc = ?best_auc,
                "restored checkpoint"
            );
        } else if self.options.resume {
            warn!("no checkpoint to resume from; starting fresh");
        }

        info!(
            batches_per_epoch,
            total_steps,
            yield_steps = settings.yield_steps,
            device = ?self.device,
            "starting training"
        );
        let mut sink = RunSink {
            store: self.store.clone(),
            loss,
            valid_loader,
            valid_rows,
            logger: self.logger.clone(),
            journal: MetricsJournal::open(self.run_root().join(METRICS_FILENAME))?,
            run_root: self.run_root().to_path_buf(),
            best_auc,
        };
        let outcome = training.run(&mut learner, &loss, &mut train_loader, &mut sink, should_stop)?;
        if training.state().skipped_steps > 0 {
            warn!(
                skipped = training.state().skipped_steps,
                "steps were skipped after running out of device memory"
            );
        }
        info!(?outcome, "training finished");
        Ok(outcome)
    }

    /// Re-scores the validation split with the best checkpoint and writes its
    /// predictions.
    pub fn validate(&self) -> Result<Option<ValidationSummary>, TrainingError> {
        let (train_rows, valid_rows) = self.load_split()?;
        let loss = WeightedBceLoss::new(train_rows.loss_weight());
        let model = self.load_best_model()?;
        let mut loader = self.validation_loader(&valid_rows)?;
        let report = evaluation::validate(&model, &loss, &mut loader)?;
        evaluation::write_valid_predictions(
            &self.run_root().join(VALID_PREDICTIONS_FILENAME),
            &valid_rows.ids,
            &valid_rows.scores,
            &report.predictions,
        )?;
        if let Some(summary) = report.summary.as_ref() {
            let mut logger = self.logger.clone();
            logger.log_validation(0, summary);
            logger.flush();
        }
        Ok(report.summary)
    }

    /// Scores the test file with the best checkpoint and writes
    /// `submission.csv`; returns its path.
    pub fn submission(&self) -> Result<PathBuf, TrainingError> {
        let data = &self.config.data;
        let test_csv = data
            .test_csv
            .as_ref()
            .ok_or_else(|| TrainingError::validation(vec!["data.test_csv must be set for submission".into()]))?;
        let rows = read_text_csv(test_csv, data)?;
        if rows.ids.is_empty() {
            return Err(TrainingError::data(format!("{} contains no rows", test_csv.display())));
        }
        let encoded = encode_corpus(&self.pool, &self.tokenizer, &rows.texts, data.test_seq_length, &self.special)?;
        let dataset = TokenDataset::from_encoded(encoded, self.special.pad_id, None)?;
        let mut loader = BlockingDataLoader::new(BucketedDataLoader::new(
            Arc::new(dataset),
            BatchOrder::Sequential {
                batch_size: data.eval_batch_size,
            },
            self.device.clone(),
            Arc::clone(&self.pool),
            self.config.runtime.seed,
        )?);

        let model = self.load_best_model()?;
        let predictions = evaluation::predict(&model, &mut loader)?;
        let path = self.run_root().join(SUBMISSION_FILENAME);
        evaluation::write_submission(&path, &rows.ids, &predictions)?;
        info!(rows = predictions.len(), path = %path.display(), "submission written");
        Ok(path)
    }

    fn run_root(&self) -> &Path {
        &self.config.runtime.run_root
    }

    fn load_split(&self) -> Result<(LabelledRows, LabelledRows), TrainingError> {
        let data = &self.config.data;
        let rows = read_labelled_csv(&data.train_csv, data)?;
        let (train, valid) = split_train_valid(&rows, data)?;
        Ok((
            rows.select(&train).sample(data.train_size),
            rows.select(&valid).sample(data.valid_size),
        ))
    }

    fn labelled_dataset(&self, rows: &LabelledRows, width: usize) -> Result<TokenDataset, TrainingError> {
        let encoded = encode_corpus(&self.pool, &self.tokenizer, &rows.texts, width, &self.special)?;
        TokenDataset::from_encoded(encoded, self.special.pad_id, Some((rows.targets.clone(), TARGET_WIDTH)))
    }

    fn validation_loader(&self, rows: &LabelledRows) -> Result<BlockingDataLoader<BucketedDataLoader>, TrainingError> {
        let dataset = self.labelled_dataset(rows, self.config.data.test_seq_length)?;
        Ok(BlockingDataLoader::new(BucketedDataLoader::new(
            Arc::new(dataset),
            BatchOrder::Sequential {
                batch_size: self.config.data.eval_batch_size,
            },
            self.device.clone(),
            Arc::clone(&self.pool),
            self.config.runtime.seed,
        )?))
    }

    fn classifier_config(&self) -> ClassifierConfig {
        let settings = &self.config.model;
        let vocab_size = settings
            .vocab_size
            .unwrap_or_else(|| self.tokenizer.get_vocab_size(true));
        let mut config = ClassifierConfig::new(
            vocab_size,
            settings.hidden_size,
            settings.num_labels,
            self.device.clone(),
        );
        config.pad_id = self.special.pad_id;
        config
    }

    fn build_model(&self) -> Result<SequenceClassifier, TrainingError> {
        let model = SequenceClassifier::new(self.classifier_config())?;
        if let Some(path) = self.config.model.init_weights.as_ref() {
            let report = model.load_weights(path)?;
            info!(
                path = %path.display(),
                loaded = report.loaded.len(),
                "initial weights loaded"
            );
            if !report.missing.is_empty() {
                warn!(missing = ?report.missing, "parameters left at random initialization");
            }
            if !report.unexpected.is_empty() {
                warn!(unexpected = ?report.unexpected, "ignored tensors in initial weights");
            }
        }
        Ok(model)
    }

    fn load_best_model(&self) -> Result<SequenceClassifier, TrainingError> {
        let path = self.store.best_dir().join(MODEL_FILENAME);
        if !path.is_file() {
            return Err(TrainingError::checkpoint(format!(
                "no best checkpoint at {}",
                path.display()
            )));
        }
        let model = SequenceClassifier::new(self.classifier_config())?;
        let report = model.load_weights(&path)?;
        if !report.missing.is_empty() {
            return Err(TrainingError::checkpoint(format!(
                "best checkpoint lacks parameters {:?}",
                report.missing
            )));
        }
        Ok(model)
    }
}

/// Refuses to reuse a run root unless asked to clean or resume, then records
/// the effective configuration in it.
fn prepare_run_root(
    run_root: &Path,
    config: &TrainingConfig,
    options: SessionOptions,
) -> Result<(), TrainingError> {
    let params = run_root.join(PARAMS_FILENAME);
    if params.exists() {
        if options.clean {
            info!(dir = %run_root.display(), "removing previous run");
            fs::remove_dir_all(run_root)?;
        } else if !options.resume {
            return Err(TrainingError::initialization(format!(
                "run root {} already holds a run; pass --clean or --resume",
                run_root.display()
            )));
        }
    }
    fs::create_dir_all(run_root)?;
    checkpoint::write_json(&params, config)
}

#[derive(Debug, Serialize)]
struct CheckpointRecord {
    step: usize,
    epoch: usize,
    samples_seen: usize,
    smoothed_loss: Option<f64>,
    valid_loss: Option<f64>,
    auc: Option<f64>,
    best: bool,
}

/// Persists, validates and promotes at every handoff of a training run.
struct RunSink {
    store: CheckpointStore,
    loss: WeightedBceLoss,
    valid_loader: BlockingDataLoader<BucketedDataLoader>,
    valid_rows: LabelledRows,
    logger: Logger,
    journal: MetricsJournal,
    run_root: PathBuf,
    best_auc: Option<f64>,
}

impl RunSink {
    fn save<M: TrainableModel>(&self, handoff: &Handoff<'_, M>) -> Result<(), TrainingError> {
        let snapshot = handoff.model.snapshot()?;
        let progress = TrainingProgress {
            global_step: handoff.global_step,
            optimizer_step: snapshot.optimizer_step,
            epoch: handoff.epoch,
            smoothed_loss: handoff.smoothed_loss,
            samples_seen: handoff.samples_seen,
        };
        self.store.save(&snapshot, progress)?;
        Ok(())
    }

    fn improves(&self, summary: &ValidationSummary) -> bool {
        match (summary.auc, self.best_auc) {
            (Some(auc), Some(best)) => auc > best,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn record(&mut self, handoff: &Handoff<'_, impl TrainableModel>, report: &ValidationReport) -> Result<(), TrainingError> {
        let summary = report.summary;
        let best = summary.as_ref().is_some_and(|s| self.improves(s));
        if let Some(summary) = summary {
            self.logger.log_validation(handoff.global_step, &summary);
            self.logger.flush();
            if best {
                self.best_auc = summary.auc;
                self.store.promote_best(summary)?;
                evaluation::write_valid_predictions(
                    &self.run_root.join(VALID_PREDICTIONS_FILENAME),
                    &self.valid_rows.ids,
                    &self.valid_rows.scores,
                    &report.predictions,
                )?;
            }
        }
        self.journal.append(&CheckpointRecord {
            step: handoff.global_step,
            epoch: handoff.epoch,
            samples_seen: handoff.samples_seen,
            smoothed_loss: handoff.smoothed_loss,
            valid_loss: summary.map(|s| s.valid_loss),
            auc: summary.and_then(|s| s.auc),
            best,
        })
    }
}

impl<M: TrainableModel> CheckpointSink<M> for RunSink {
    fn on_checkpoint(&mut self, handoff: Handoff<'_, M>) -> Result<SinkDecision, TrainingError> {
        match handoff.reason {
            HandoffReason::Start => {}
            HandoffReason::Interrupted => self.save(&handoff)?,
            HandoffReason::Periodic | HandoffReason::EpochEnd => {
                self.save(&handoff)?;
                let report = evaluation::validate(handoff.model, &self.loss, &mut self.valid_loader)?;
                self.record(&handoff, &report)?;
            }
        }
        Ok(SinkDecision::Continue)
    }
}
