use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
};

use bucketing::DynamicTrimmer;
use candle_core::{DType, Device, Tensor};
use futures::future::BoxFuture;
use training::{
    BlockingDataLoader, CheckpointSink, DataBatch, DataLoader, Handoff, HandoffReason, LoopPhase,
    LoopSettings, LossFunction, Predictor, ResumePoint, SinkDecision, StateSnapshot,
    TrainOutcome, TrainableModel, TrainingError, TrainingLoop,
};

const BATCH_SIZE: usize = 2;
const WIDTH: usize = 24;

/// Records every optimizer interaction; fails chosen forward calls.
///
/// Gradients are tracked by the forward call that produced them: `pending`
/// holds the calls accumulated since the last update, `applied` every call
/// that reached an update.
#[derive(Default)]
struct ScriptedModel {
    forwards: Rc<Cell<usize>>,
    oom_on: HashSet<usize>,
    fail_on: HashSet<usize>,
    widths: RefCell<Vec<usize>>,
    backward_losses: Vec<f32>,
    pending: Vec<usize>,
    applied: Vec<usize>,
    updates: Vec<usize>,
    zero_grads: usize,
    releases: usize,
}

impl Predictor for ScriptedModel {
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let call = self.forwards.get() + 1;
        self.forwards.set(call);
        self.widths.borrow_mut().push(input_ids.dim(1)?);
        if self.oom_on.contains(&call) {
            return Err(candle_core::Error::Msg("CUDA_ERROR_OUT_OF_MEMORY".into()));
        }
        if self.fail_on.contains(&call) {
            return Err(candle_core::Error::Msg("shape mismatch in matmul".into()));
        }
        Tensor::zeros((input_ids.dim(0)?, 7), DType::F32, input_ids.device())
    }
}

impl TrainableModel for ScriptedModel {
    fn backward(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        self.backward_losses.push(loss.to_scalar::<f32>()?);
        self.pending.push(self.forwards.get());
        Ok(())
    }

    fn step(&mut self) -> Result<(), TrainingError> {
        self.updates.push(self.forwards.get());
        self.applied.append(&mut self.pending);
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.zero_grads += 1;
        self.pending.clear();
    }

    fn release_memory(&mut self) {
        self.releases += 1;
    }

    fn learning_rate(&self) -> f64 {
        1e-3
    }

    fn snapshot(&self) -> Result<StateSnapshot, TrainingError> {
        Ok(StateSnapshot {
            optimizer_step: self.updates.len(),
            ..StateSnapshot::default()
        })
    }

    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), TrainingError> {
        self.updates = (0..snapshot.optimizer_step).collect();
        Ok(())
    }
}

/// Replays a fixed loss sequence, cycling when exhausted.
struct ScriptedLoss {
    values: Vec<f32>,
    calls: Cell<usize>,
}

impl ScriptedLoss {
    fn constant(value: f32) -> Self {
        Self::sequence(vec![value])
    }

    fn sequence(values: Vec<f32>) -> Self {
        Self {
            values,
            calls: Cell::new(0),
        }
    }
}

impl LossFunction for ScriptedLoss {
    fn loss(&self, predictions: &Tensor, _targets: &Tensor) -> candle_core::Result<Tensor> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        Tensor::new(self.values[call % self.values.len()], predictions.device())
    }
}

/// Serves `batches` identical batches per epoch. Every row holds `real_len`
/// tokens followed by padding (id 0) up to `WIDTH`.
struct FixedLoader {
    batches: usize,
    real_len: usize,
    position: usize,
    epochs_started: Vec<usize>,
    skipped: Vec<usize>,
}

impl FixedLoader {
    fn new(batches: usize) -> Self {
        Self::padded(batches, WIDTH)
    }

    fn padded(batches: usize, real_len: usize) -> Self {
        Self {
            batches,
            real_len,
            position: 0,
            epochs_started: Vec::new(),
            skipped: Vec::new(),
        }
    }

    fn batch(&self) -> Result<DataBatch, TrainingError> {
        let device = Device::Cpu;
        let ids: Vec<u32> = (0..BATCH_SIZE * WIDTH)
            .map(|i| u32::from(i % WIDTH < self.real_len))
            .collect();
        let input_ids = Tensor::from_vec(ids, (BATCH_SIZE, WIDTH), &device)?;
        Ok(DataBatch {
            attention_mask: input_ids.clone(),
            input_ids,
            targets: Some(Tensor::zeros((BATCH_SIZE, 8), DType::F32, &device)?),
            indices: (0..BATCH_SIZE).collect(),
            lengths: vec![self.real_len; BATCH_SIZE],
            epoch: self.epochs_started.last().copied().unwrap_or(0),
            batch_index: self.position,
        })
    }
}

impl DataLoader for FixedLoader {
    fn batches_per_epoch(&self) -> usize {
        self.batches
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<(), TrainingError> {
        self.epochs_started.push(epoch);
        self.position = 0;
        Ok(())
    }

    fn skip_batches(&mut self, count: usize) -> Result<usize, TrainingError> {
        let skipped = count.min(self.batches - self.position);
        self.position += skipped;
        self.skipped.push(skipped);
        Ok(skipped)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>, TrainingError>> {
        Box::pin(async move {
            if self.position == self.batches {
                return Ok(None);
            }
            let batch = self.batch()?;
            self.position += 1;
            Ok(Some(batch))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Recorded {
    reason: HandoffReason,
    global_step: usize,
    epoch: usize,
    samples_seen: usize,
    smoothed_loss: Option<f64>,
    optimizer_step: usize,
}

#[derive(Default)]
struct RecordingSink {
    handoffs: Vec<Recorded>,
    stop_on_periodic: bool,
}

impl RecordingSink {
    fn non_start(&self) -> Vec<(HandoffReason, usize)> {
        self.handoffs
            .iter()
            .filter(|h| h.reason != HandoffReason::Start)
            .map(|h| (h.reason, h.global_step))
            .collect()
    }
}

impl<M: TrainableModel> CheckpointSink<M> for RecordingSink {
    fn on_checkpoint(&mut self, handoff: Handoff<'_, M>) -> Result<SinkDecision, TrainingError> {
        let snapshot = handoff.model.snapshot()?;
        self.handoffs.push(Recorded {
            reason: handoff.reason,
            global_step: handoff.global_step,
            epoch: handoff.epoch,
            samples_seen: handoff.samples_seen,
            smoothed_loss: handoff.smoothed_loss,
            optimizer_step: snapshot.optimizer_step,
        });
        if self.stop_on_periodic && handoff.reason == HandoffReason::Periodic {
            return Ok(SinkDecision::Stop);
        }
        Ok(SinkDecision::Continue)
    }
}

fn settings(epochs: usize, accumulation_steps: usize, yield_steps: usize) -> LoopSettings {
    LoopSettings {
        epochs,
        accumulation_steps,
        yield_steps,
        batch_size: BATCH_SIZE,
    }
}

fn training_loop(settings: LoopSettings) -> TrainingLoop {
    TrainingLoop::new(settings, None, Device::Cpu).unwrap()
}

#[test]
fn accumulation_updates_only_on_even_steps() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 2, 100));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    assert_eq!(
        outcome,
        TrainOutcome::Completed {
            global_step: 10,
            smoothed_loss: Some(1.0)
        }
    );
    assert_eq!(model.updates, vec![2, 4, 6, 8, 10]);
    assert_eq!(training.state().optimizer_updates, 5);
    assert_eq!(training.phase(), LoopPhase::Completed);
    // Each backward sees the loss divided by the accumulation factor.
    assert!(model.backward_losses.iter().all(|&loss| (loss - 0.5).abs() < 1e-6));
}

#[test]
fn out_of_memory_step_is_skipped_and_epoch_completes() {
    let mut model = ScriptedModel {
        oom_on: HashSet::from([3]),
        ..ScriptedModel::default()
    };
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 1, 100));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    assert!(matches!(outcome, TrainOutcome::Completed { global_step: 10, .. }));
    assert_eq!(model.updates, vec![1, 2, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(model.backward_losses.len(), 9);
    assert_eq!(model.releases, 1);
    assert_eq!(training.state().skipped_steps, 1);
}

#[test]
fn out_of_memory_keeps_earlier_gradients_of_the_window() {
    let mut model = ScriptedModel {
        oom_on: HashSet::from([4]),
        ..ScriptedModel::default()
    };
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 2, 100));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    assert!(matches!(outcome, TrainOutcome::Completed { global_step: 10, .. }));
    // Step 4 fails after step 3 already accumulated; no update at 4, and
    // step 3 is applied together with 5 and 6.
    assert_eq!(model.updates, vec![2, 6, 8, 10]);
    assert_eq!(model.applied, vec![1, 2, 3, 5, 6, 7, 8, 9, 10]);
    assert!(model.pending.is_empty());
    assert_eq!(model.releases, 1);
    // One reset per epoch start and one after each update; none for the failure.
    assert_eq!(model.zero_grads, 5);
    assert_eq!(training.state().optimizer_updates, 4);
    assert_eq!(training.state().skipped_steps, 1);
}

#[test]
fn trimmer_narrows_batches_before_forward() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::padded(3, 10));
    let mut sink = RecordingSink::default();
    let mut training =
        TrainingLoop::new(settings(1, 1, 100), Some(DynamicTrimmer::new(8, 0)), Device::Cpu).unwrap();

    training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();
    assert_eq!(*model.widths.borrow(), vec![16, 16, 16]);

    let mut untrimmed = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::padded(3, 10));
    training_loop(settings(1, 1, 100))
        .run(&mut untrimmed, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();
    assert_eq!(*untrimmed.widths.borrow(), vec![WIDTH; 3]);
}

#[test]
fn other_compute_failures_are_fatal() {
    let mut model = ScriptedModel {
        fail_on: HashSet::from([2]),
        ..ScriptedModel::default()
    };
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 1, 100));

    let result = training.run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false);

    assert!(matches!(result, Err(TrainingError::Compute(_))));
    assert_eq!(model.updates, vec![1]);
}

#[test]
fn cancellation_after_step_five_saves_once() {
    let forwards = Rc::new(Cell::new(0));
    let mut model = ScriptedModel {
        forwards: Rc::clone(&forwards),
        ..ScriptedModel::default()
    };
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 1, 100));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || {
            forwards.get() >= 5
        })
        .unwrap();

    assert_eq!(outcome, TrainOutcome::Interrupted { global_step: 5 });
    assert_eq!(sink.non_start(), vec![(HandoffReason::Interrupted, 5)]);
    let saved = sink.handoffs.last().unwrap();
    assert_eq!(saved.optimizer_step, 5);
    assert_eq!(saved.samples_seen, 5 * BATCH_SIZE);
    assert_eq!(training.phase(), LoopPhase::Interrupted);
}

#[test]
fn cancellation_before_first_step_hands_off_nothing() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 1, 100));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || true)
        .unwrap();

    assert_eq!(outcome, TrainOutcome::Interrupted { global_step: 0 });
    assert!(sink.handoffs.is_empty());
    assert_eq!(model.forwards.get(), 0);
}

#[test]
fn smoothed_loss_follows_the_moving_average() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(3));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(1, 1, 1));

    training
        .run(&mut model, &ScriptedLoss::sequence(vec![2.0, 1.0, 0.0]), &mut loader, &mut sink, || false)
        .unwrap();

    let smoothed: Vec<f64> = sink
        .handoffs
        .iter()
        .filter(|h| h.reason == HandoffReason::Periodic)
        .map(|h| h.smoothed_loss.unwrap())
        .collect();
    let expected = [2.0, 0.98 * 2.0 + 0.02 * 1.0, 0.98 * (0.98 * 2.0 + 0.02 * 1.0)];
    assert_eq!(smoothed.len(), 3);
    for (got, want) in smoothed.iter().zip(expected) {
        assert!((got - want).abs() < 1e-9, "{got} != {want}");
    }
    assert_eq!(sink.handoffs[0].reason, HandoffReason::Start);
    assert_eq!(sink.handoffs[0].smoothed_loss, None);
}

#[test]
fn handoffs_cover_periods_and_epoch_ends_once() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(5));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(2, 1, 3));

    training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    assert_eq!(
        sink.non_start(),
        vec![
            (HandoffReason::Periodic, 3),
            (HandoffReason::EpochEnd, 5),
            (HandoffReason::Periodic, 6),
            (HandoffReason::Periodic, 9),
            (HandoffReason::EpochEnd, 10),
        ]
    );
    let epochs: Vec<usize> = sink.handoffs.iter().map(|h| h.epoch).collect();
    assert_eq!(epochs, vec![0, 0, 0, 1, 1, 1]);

    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(5));
    let mut sink = RecordingSink::default();
    training_loop(settings(2, 1, 5))
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();
    assert_eq!(
        sink.non_start(),
        vec![(HandoffReason::Periodic, 5), (HandoffReason::Periodic, 10)]
    );
}

#[test]
fn sink_can_stop_the_run() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(10));
    let mut sink = RecordingSink {
        stop_on_periodic: true,
        ..RecordingSink::default()
    };
    let mut training = training_loop(settings(3, 1, 4));

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    assert_eq!(outcome, TrainOutcome::Stopped { global_step: 4 });
    assert_eq!(model.forwards.get(), 4);
}

#[test]
fn resume_skips_completed_work() {
    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(FixedLoader::new(5));
    let mut sink = RecordingSink::default();
    let mut training = training_loop(settings(2, 1, 100));
    training.resume_from(ResumePoint {
        global_step: 7,
        smoothed_loss: Some(3.0),
    });

    let outcome = training
        .run(&mut model, &ScriptedLoss::constant(1.0), &mut loader, &mut sink, || false)
        .unwrap();

    let expected_smoothed = 0.98f64.powi(3) * 3.0 + (1.0 - 0.98f64.powi(3));
    match outcome {
        TrainOutcome::Completed {
            global_step,
            smoothed_loss: Some(smoothed),
        } => {
            assert_eq!(global_step, 10);
            assert!((smoothed - expected_smoothed).abs() < 1e-9);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(loader.inner().epochs_started, vec![1]);
    assert_eq!(loader.inner().skipped, vec![2]);
    assert_eq!(model.forwards.get(), 3);
    assert_eq!(sink.handoffs[0].global_step, 7);
}

#[test]
fn batches_without_targets_are_rejected() {
    struct Unlabelled(FixedLoader);

    impl DataLoader for Unlabelled {
        fn batches_per_epoch(&self) -> usize {
            self.0.batches_per_epoch()
        }
        fn start_epoch(&mut self, epoch: usize) -> Result<(), TrainingError> {
            self.0.start_epoch(epoch)
        }
        fn skip_batches(&mut self, count: usize) -> Result<usize, TrainingError> {
            self.0.skip_batches(count)
        }
        fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>, TrainingError>> {
            Box::pin(async move {
                let batch = self.0.next_batch().await?;
                Ok(batch.map(|batch| DataBatch {
                    targets: None,
                    ..batch
                }))
            })
        }
    }

    let mut model = ScriptedModel::default();
    let mut loader = BlockingDataLoader::new(Unlabelled(FixedLoader::new(2)));
    let mut sink = RecordingSink::default();
    let result = training_loop(settings(1, 1, 100)).run(
        &mut model,
        &ScriptedLoss::constant(1.0),
        &mut loader,
        &mut sink,
        || false,
    );
    assert!(matches!(result, Err(TrainingError::Data(_))));
}
