use crate::TrainingError;

pub trait LRScheduler: Send {
    /// Learning rate for the next update; advances the schedule.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    /// Moves the schedule to `step` updates already applied.
    fn seek(&mut self, step: usize);
}

/// Linear warmup over the first `warmup_proportion` of updates, then linear
/// decay to zero at `total_steps`.
#[derive(Debug, Clone)]
pub struct WarmupLinear {
    base_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupLinear {
    pub fn new(
        base_lr: f64,
        total_steps: usize,
        warmup_proportion: f64,
    ) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        let warmup_steps = compute_warmup_steps(total_steps, warmup_proportion);
        Ok(Self {
            base_lr,
            total_steps,
            warmup_steps,
            step: 0,
            current_lr: 0.0,
        })
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }

    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let span = (self.total_steps - self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / span).clamp(0.0, 1.0)
    }
}

impl LRScheduler for WarmupLinear {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn seek(&mut self, step: usize) {
        self.step = step;
        self.current_lr = if step == 0 {
            0.0
        } else {
            self.compute_lr(step - 1)
        };
    }
}

fn compute_warmup_steps(total_steps: usize, warmup_proportion: f64) -> usize {
    let proportion = warmup_proportion.clamp(0.0, 1.0);
    ((total_steps as f64) * proportion).round() as usize
}
