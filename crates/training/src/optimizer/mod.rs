use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
    /// BERT-style Adam skips bias correction of the moment estimates.
    pub bias_correction: bool,
}

impl From<&config::OptimizerConfig> for AdamWConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
            max_grad_norm: value.max_grad_norm,
            bias_correction: false,
        }
    }
}

/// AdamW with decoupled weight decay, a name-based decay exclusion list and
/// optional global gradient-norm clipping.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl AdamW {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        no_decay: &[String],
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            let second_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
            let apply_weight_decay = !no_decay.iter().any(|pattern| matches_pattern(&name, pattern));

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Names of parameters updated without weight decay.
    pub fn decay_exempt(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|slot| !slot.apply_weight_decay)
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    /// Returns the global gradient norm before clipping.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?;
            let norm_sq = grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            processed.push((index, grad, norm_sq));
        }

        let total_norm = processed.iter().map(|(_, _, sq)| sq).sum::<f64>().sqrt();
        if processed.is_empty() {
            return Ok(total_norm);
        }

        let clip_scale = match self.config.max_grad_norm {
            Some(max_norm) if total_norm > max_norm => max_norm / (total_norm + EPS),
            _ => 1.0,
        };

        self.step += 1;
        let cfg = self.config;
        let (scale_m, scale_v) = if cfg.bias_correction {
            (
                1.0 / (1.0 - cfg.beta1.powi(self.step as i32)).max(EPS),
                1.0 / (1.0 - cfg.beta2.powi(self.step as i32)).max(EPS),
            )
        } else {
            (1.0, 1.0)
        };

        for (index, grad, _) in processed {
            let slot = &mut self.params[index];
            let grad = if clip_scale < 1.0 {
                grad.affine(clip_scale, 0.0)?
            } else {
                grad
            };

            let m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)?
                .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let denom = v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m
                .affine(scale_m, 0.0)?
                .div(&denom)?
                .affine(cfg.learning_rate, 0.0)?;

            let current = slot.param.as_tensor().to_dtype(DType::F32)?;
            let decayed = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                current.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                current
            };
            let next = decayed
                .sub(&update)?
                .to_dtype(slot.param.as_tensor().dtype())?;
            slot.param.set(&next)?;

            slot.first_moment = m;
            slot.second_moment = v;
        }

        Ok(total_norm)
    }

    /// Moment estimates keyed `<param>.exp_avg` / `<param>.exp_avg_sq`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::with_capacity(self.params.len() * 2);
        for slot in &self.params {
            tensors.insert(format!("{}.exp_avg", slot.name), slot.first_moment.clone());
            tensors.insert(format!("{}.exp_avg_sq", slot.name), slot.second_moment.clone());
        }
        tensors
    }

    pub fn load_state(
        &mut self,
        tensors: &HashMap<String, Tensor>,
        step: usize,
    ) -> Result<(), TrainingError> {
        for slot in &mut self.params {
            let fetch = |suffix: &str| -> Result<Tensor, TrainingError> {
                let key = format!("{}.{}", slot.name, suffix);
                let tensor = tensors.get(&key).ok_or_else(|| {
                    TrainingError::checkpoint(format!("optimizer state missing '{}'", key))
                })?;
                if tensor.dims() != slot.param.as_tensor().dims() {
                    return Err(TrainingError::checkpoint(format!(
                        "optimizer state shape mismatch for '{}'",
                        key
                    )));
                }
                Ok(tensor
                    .to_dtype(DType::F32)?
                    .to_device(slot.param.as_tensor().device())?)
            };
            let first = fetch("exp_avg")?;
            let second = fetch("exp_avg_sq")?;
            slot.first_moment = first;
            slot.second_moment = second;
        }

        if tensors.len() != self.params.len() * 2 {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra entries not present in the model",
            ));
        }
        self.step = step;
        Ok(())
    }
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    !pattern.is_empty() && name.contains(pattern)
}
