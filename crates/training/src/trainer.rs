//! The accumulation-aware training loop and its checkpoint handoff protocol.

use bucketing::DynamicTrimmer;
use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::{
    data::{BlockingDataLoader, DataBatch, DataLoader},
    learner::{is_resource_exhaustion, LossFunction, TrainableModel},
    logging::Logger,
    metrics::{ExponentialMovingAverage, StepSnapshot, ThroughputMeter, LOSS_SMOOTHING},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub epochs: usize,
    /// Batches whose gradients are summed into one optimizer update.
    pub accumulation_steps: usize,
    /// Global steps between periodic handoffs.
    pub yield_steps: usize,
    pub batch_size: usize,
}

impl LoopSettings {
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("epochs", self.epochs),
            ("accumulation_steps", self.accumulation_steps),
            ("yield_steps", self.yield_steps),
            ("batch_size", self.batch_size),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    Stepping,
    /// A handoff is in flight; the sink may persist and validate.
    Checkpointing,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffReason {
    /// Before the first step. Never needs persisting.
    Start,
    Periodic,
    EpochEnd,
    /// Cancellation was observed after at least one step.
    Interrupted,
}

/// Read-only view of the loop state handed to a [`CheckpointSink`].
#[derive(Debug)]
pub struct Handoff<'a, M: ?Sized> {
    pub reason: HandoffReason,
    pub global_step: usize,
    pub epoch: usize,
    pub samples_seen: usize,
    pub smoothed_loss: Option<f64>,
    pub model: &'a M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkDecision {
    Continue,
    Stop,
}

pub trait CheckpointSink<M: ?Sized> {
    fn on_checkpoint(&mut self, handoff: Handoff<'_, M>) -> Result<SinkDecision, TrainingError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainOutcome {
    Completed {
        global_step: usize,
        smoothed_loss: Option<f64>,
    },
    Interrupted {
        global_step: usize,
    },
    /// The sink asked the loop to stop.
    Stopped {
        global_step: usize,
    },
}

/// Where a previous run left off.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumePoint {
    pub global_step: usize,
    pub smoothed_loss: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub global_step: usize,
    pub epoch: usize,
    pub smoothed_loss: Option<f64>,
    pub optimizer_updates: usize,
    /// Steps abandoned after device memory exhaustion.
    pub skipped_steps: usize,
}

pub struct TrainingLoop {
    settings: LoopSettings,
    trimmer: DynamicTrimmer,
    device: Device,
    phase: LoopPhase,
    state: TrainingState,
    smoother: ExponentialMovingAverage,
    throughput: ThroughputMeter,
    logger: Option<Logger>,
}

impl TrainingLoop {
    pub fn new(
        settings: LoopSettings,
        trimmer: Option<DynamicTrimmer>,
        device: Device,
    ) -> Result<Self, TrainingError> {
        settings.validate()?;
        Ok(Self {
            settings,
            trimmer: trimmer.unwrap_or_else(DynamicTrimmer::disabled),
            device,
            phase: LoopPhase::Idle,
            state: TrainingState::default(),
            smoother: ExponentialMovingAverage::new(LOSS_SMOOTHING),
            throughput: ThroughputMeter::new(),
            logger: None,
        })
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Continues counting from `point` on the next [`run`](Self::run).
    pub fn resume_from(&mut self, point: ResumePoint) {
        self.state.global_step = point.global_step;
        self.state.smoothed_loss = point.smoothed_loss;
        self.smoother = ExponentialMovingAverage::with_value(LOSS_SMOOTHING, point.smoothed_loss);
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn run<M, L, S, F>(
        &mut self,
        model: &mut M,
        loss: &dyn LossFunction,
        loader: &mut BlockingDataLoader<L>,
        sink: &mut S,
        mut should_stop: F,
    ) -> Result<TrainOutcome, TrainingError>
    where
        M: TrainableModel,
        L: DataLoader,
        S: CheckpointSink<M> + ?Sized,
        F: FnMut() -> bool,
    {
        let batches_per_epoch = loader.batches_per_epoch();
        if batches_per_epoch == 0 {
            return Err(TrainingError::data("training split produced no batches"));
        }

        if should_stop() {
            return self.interrupt(model, sink);
        }
        if self.handoff(HandoffReason::Start, model, sink)? == SinkDecision::Stop {
            return Ok(self.stopped());
        }

        let first_epoch = self.state.global_step / batches_per_epoch;
        let mut resume_offset = self.state.global_step % batches_per_epoch;
        if self.state.global_step > 0 {
            info!(
                global_step = self.state.global_step,
                epoch = first_epoch,
                offset = resume_offset,
                "resuming training"
            );
        }

        for epoch in first_epoch..self.settings.epochs {
            self.state.epoch = epoch;
            loader.start_epoch(epoch)?;
            if resume_offset > 0 {
                let skipped = loader.skip_batches(resume_offset)?;
                if skipped != resume_offset {
                    return Err(TrainingError::runtime(format!(
                        "could only skip {skipped} of {resume_offset} batches while resuming"
                    )));
                }
                resume_offset = 0;
            }
            model.zero_grad();
            self.phase = LoopPhase::Stepping;
            let mut last_handoff_step = None;

            loop {
                if should_stop() {
                    return self.interrupt(model, sink);
                }
                let Some(batch) = loader.next_batch()? else {
                    break;
                };

                self.state.global_step += 1;
                let step = self.state.global_step;
                self.train_step(model, loss, &batch)?;

                if step % self.settings.yield_steps == 0 {
                    last_handoff_step = Some(step);
                    if self.handoff(HandoffReason::Periodic, model, sink)? == SinkDecision::Stop {
                        return Ok(self.stopped());
                    }
                }
            }

            if last_handoff_step != Some(self.state.global_step)
                && self.handoff(HandoffReason::EpochEnd, model, sink)? == SinkDecision::Stop
            {
                return Ok(self.stopped());
            }
            debug!(epoch, global_step = self.state.global_step, "epoch finished");
        }

        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
        self.phase = LoopPhase::Completed;
        Ok(TrainOutcome::Completed {
            global_step: self.state.global_step,
            smoothed_loss: self.state.smoothed_loss,
        })
    }

    fn train_step<M: TrainableModel>(
        &mut self,
        model: &mut M,
        loss: &dyn LossFunction,
        batch: &DataBatch,
    ) -> Result<(), TrainingError> {
        let step = self.state.global_step;
        let targets = batch
            .targets
            .as_ref()
            .ok_or_else(|| TrainingError::data("training batch carries no targets"))?;
        let (input_ids, _) = self.trimmer.trim(&batch.input_ids, &[])?;

        let accumulation = self.settings.accumulation_steps;
        let computed = (|| -> candle_core::Result<f64> {
            let input_ids = input_ids.to_device(&self.device)?;
            let targets = targets.to_device(&self.device)?;
            let predictions = model.forward(&input_ids)?;
            let value = loss.loss(&predictions, &targets)?;
            let step_loss = value.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            let scaled = scale_loss(&value, accumulation)?;
            model.backward(&scaled)?;
            Ok(step_loss)
        })();

        let step_loss = match computed {
            Ok(value) => value,
            // Gradients from earlier steps of the window are already merged
            // and stay pending.
            Err(err) if is_resource_exhaustion(&err) => {
                warn!(step, error = %err, "out of device memory; skipping step");
                model.release_memory();
                self.state.skipped_steps += 1;
                return Ok(());
            }
            Err(err) => return Err(TrainingError::Compute(err)),
        };

        if step % accumulation == 0 {
            model.step()?;
            model.zero_grad();
            self.state.optimizer_updates += 1;
        }

        let smoothed = self.smoother.update(step_loss);
        self.state.smoothed_loss = Some(smoothed);
        self.throughput.record(batch.size());

        if let Some(logger) = self.logger.as_mut() {
            if logger.should_log(step) {
                let snapshot = StepSnapshot {
                    step,
                    step_loss,
                    smoothed_loss: smoothed,
                    learning_rate: model.learning_rate(),
                    rows_per_sec: self.throughput.take_rate(),
                };
                logger.log_training_step(&snapshot);
            }
        }
        Ok(())
    }

    fn handoff<M, S>(
        &mut self,
        reason: HandoffReason,
        model: &M,
        sink: &mut S,
    ) -> Result<SinkDecision, TrainingError>
    where
        M: TrainableModel,
        S: CheckpointSink<M> + ?Sized,
    {
        let previous = self.phase;
        self.phase = LoopPhase::Checkpointing;
        debug!(?reason, step = self.state.global_step, "checkpoint handoff");
        let decision = sink.on_checkpoint(Handoff {
            reason,
            global_step: self.state.global_step,
            epoch: self.state.epoch,
            samples_seen: self.state.global_step * self.settings.batch_size,
            smoothed_loss: self.state.smoothed_loss,
            model,
        })?;
        self.phase = previous;
        Ok(decision)
    }

    fn interrupt<M, S>(&mut self, model: &M, sink: &mut S) -> Result<TrainOutcome, TrainingError>
    where
        M: TrainableModel,
        S: CheckpointSink<M> + ?Sized,
    {
        if self.state.global_step > 0 {
            info!(step = self.state.global_step, "cancellation requested; saving state");
            self.handoff(HandoffReason::Interrupted, model, sink)?;
        } else {
            info!("cancellation requested before the first step");
        }
        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
        self.phase = LoopPhase::Interrupted;
        Ok(TrainOutcome::Interrupted {
            global_step: self.state.global_step,
        })
    }

    fn stopped(&mut self) -> TrainOutcome {
        info!(step = self.state.global_step, "checkpoint sink requested stop");
        if let Some(logger) = self.logger.as_mut() {
            logger.flush();
        }
        self.phase = LoopPhase::Completed;
        TrainOutcome::Stopped {
            global_step: self.state.global_step,
        }
    }
}

fn scale_loss(loss: &Tensor, accumulation_steps: usize) -> candle_core::Result<Tensor> {
    if accumulation_steps <= 1 {
        Ok(loss.clone())
    } else {
        loss.affine(1.0 / accumulation_steps as f64, 0.0)
    }
}
