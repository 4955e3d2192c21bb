use candle_core::{Error, Result, Tensor};

use crate::learner::LossFunction;

/// Binary cross-entropy on raw logits, element-wise and numerically stable:
/// `max(x, 0) - x * y + ln(1 + exp(-|x|))`.
pub fn binary_cross_entropy_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    logits.relu()?.sub(&logits.mul(targets)?)?.add(&softplus)
}

/// Loss for a main label plus auxiliary scores.
///
/// Predictions are `(batch, 1 + aux)` logits; targets are
/// `(batch, 2 + aux)` laid out as `[label, sample_weight, aux...]`. The main
/// term is sample-weighted and scaled by `loss_weight`; the auxiliary term
/// is a plain mean.
#[derive(Debug, Clone, Copy)]
pub struct WeightedBceLoss {
    loss_weight: f64,
}

impl Default for WeightedBceLoss {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl WeightedBceLoss {
    pub fn new(loss_weight: f64) -> Self {
        Self { loss_weight }
    }

    pub fn loss_weight(&self) -> f64 {
        self.loss_weight
    }
}

impl LossFunction for WeightedBceLoss {
    fn loss(&self, predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (rows, outputs) = predictions.dims2()?;
        let (target_rows, target_cols) = targets.dims2()?;
        if rows != target_rows || target_cols != outputs + 1 {
            return Err(Error::Msg(format!(
                "targets {:?} do not match predictions {:?}",
                targets.dims(),
                predictions.dims()
            )));
        }
        let targets = targets.to_dtype(predictions.dtype())?;

        let main = binary_cross_entropy_with_logits(
            &predictions.narrow(1, 0, 1)?,
            &targets.narrow(1, 0, 1)?,
        )?
        .mul(&targets.narrow(1, 1, 1)?)?
        .mean_all()?
        .affine(self.loss_weight, 0.0)?;

        if outputs == 1 {
            return Ok(main);
        }
        let aux = binary_cross_entropy_with_logits(
            &predictions.narrow(1, 1, outputs - 1)?,
            &targets.narrow(1, 2, outputs - 1)?,
        )?
        .mean_all()?;
        main.add(&aux)
    }
}
