//! Collaborator seams of the training loop and the candle-backed learner
//! that fills them for [`SequenceClassifier`].

use std::collections::HashMap;

use candle_core::{backprop::GradStore, Tensor, Var};
use model::SequenceClassifier;
use tracing::{debug, warn};

use crate::{
    optimizer::{AdamW, AdamWConfig},
    scheduler::LRScheduler,
    TrainingError,
};

/// Forward-only view of a model, shared by training, validation and
/// prediction.
pub trait Predictor {
    /// Maps `(batch, width)` token ids to `(batch, outputs)` logits.
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor>;
}

impl Predictor for SequenceClassifier {
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        SequenceClassifier::forward(self, input_ids)
    }
}

pub trait LossFunction {
    /// Scalar loss for one batch.
    fn loss(&self, predictions: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor>;
}

/// Everything needed to continue training where it stopped.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub model: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
    pub optimizer_step: usize,
}

/// Model plus optimizer as seen by the training loop.
pub trait TrainableModel: Predictor {
    /// Accumulates gradients of `loss` into the pending update. On error the
    /// pending gradients must be left as they were.
    fn backward(&mut self, loss: &Tensor) -> candle_core::Result<()>;

    /// Applies the pending update.
    fn step(&mut self) -> Result<(), TrainingError>;

    /// Drops pending gradients.
    fn zero_grad(&mut self);

    /// Called after a step was abandoned for lack of device memory.
    fn release_memory(&mut self) {}

    fn learning_rate(&self) -> f64;

    fn snapshot(&self) -> Result<StateSnapshot, TrainingError>;

    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), TrainingError>;
}

/// True when `err` reports device memory exhaustion. Such failures are
/// recoverable by skipping the step.
pub fn is_resource_exhaustion(err: &candle_core::Error) -> bool {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();
    lowered.contains("out of memory") || lowered.contains("out_of_memory") || message.contains("OOM")
}

/// [`SequenceClassifier`] trained with [`AdamW`] under a learning-rate
/// schedule, accumulating gradients across `backward` calls until `step`.
pub struct CandleLearner {
    model: SequenceClassifier,
    optimizer: AdamW,
    scheduler: Box<dyn LRScheduler>,
    parameters: Vec<(String, Var)>,
    accumulated: Option<GradStore>,
    last_grad_norm: Option<f64>,
}

impl CandleLearner {
    pub fn new(
        model: SequenceClassifier,
        optimizer_config: AdamWConfig,
        no_decay: &[String],
        scheduler: Box<dyn LRScheduler>,
    ) -> Result<Self, TrainingError> {
        let parameters = model.parameters()?;
        let optimizer = AdamW::new(parameters.clone(), optimizer_config, no_decay)?;
        debug!(
            parameters = parameters.len(),
            exempt = ?optimizer.decay_exempt(),
            "learner ready"
        );
        Ok(Self {
            model,
            optimizer,
            scheduler,
            parameters,
            accumulated: None,
            last_grad_norm: None,
        })
    }

    pub fn model(&self) -> &SequenceClassifier {
        &self.model
    }

    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Global gradient norm seen by the most recent update.
    pub fn last_grad_norm(&self) -> Option<f64> {
        self.last_grad_norm
    }

    /// Adds `new_grads` into `accum`. Sums are computed before anything is
    /// written, so a failed addition leaves `accum` unchanged.
    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> candle_core::Result<()> {
        let mut combined = Vec::with_capacity(self.parameters.len());
        for (_, var) in &self.parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = new_grads.remove(tensor) {
                let sum = match accum.get(tensor) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                combined.push((tensor, sum));
            }
        }
        for (tensor, sum) in combined {
            accum.insert(tensor, sum);
        }
        Ok(())
    }
}

impl Predictor for CandleLearner {
    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.model.forward(input_ids)
    }
}

impl TrainableModel for CandleLearner {
    fn backward(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        let grads = loss.backward()?;
        match self.accumulated.take() {
            Some(mut existing) => {
                let merged = self.merge_gradient_store(&mut existing, grads);
                self.accumulated = Some(existing);
                merged
            }
            None => {
                self.accumulated = Some(grads);
                Ok(())
            }
        }
    }

    fn step(&mut self) -> Result<(), TrainingError> {
        let Some(mut grads) = self.accumulated.take() else {
            return Ok(());
        };
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        let norm = self.optimizer.step(&mut grads)?;
        if !norm.is_finite() {
            warn!(step = self.optimizer.step_count(), "non-finite gradient norm");
        }
        self.last_grad_norm = Some(norm);
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.accumulated = None;
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn snapshot(&self) -> Result<StateSnapshot, TrainingError> {
        // Parameters are updated in place, so the snapshot needs its own storage.
        let model = self
            .parameters
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?.detach())))
            .collect::<Result<HashMap<_, _>, TrainingError>>()?;
        Ok(StateSnapshot {
            model,
            optimizer: self.optimizer.state_tensors(),
            optimizer_step: self.optimizer.step_count(),
        })
    }

    fn restore(&mut self, snapshot: StateSnapshot) -> Result<(), TrainingError> {
        let report = self.model.load_tensors(snapshot.model)?;
        if !report.missing.is_empty() || !report.unexpected.is_empty() {
            return Err(TrainingError::checkpoint(format!(
                "model state does not match: missing {:?}, unexpected {:?}",
                report.missing, report.unexpected
            )));
        }
        self.optimizer
            .load_state(&snapshot.optimizer, snapshot.optimizer_step)?;
        self.scheduler.seek(snapshot.optimizer_step);
        self.optimizer.set_learning_rate(self.scheduler.learning_rate());
        self.accumulated = None;
        Ok(())
    }
}
