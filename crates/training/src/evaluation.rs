//! Validation and inference passes plus their CSV exports.

use std::path::Path;

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::{
    data::{BlockingDataLoader, DataLoader},
    learner::{LossFunction, Predictor},
    metrics::{ValidationMetrics, ValidationSummary},
    TrainingError,
};

#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// `None` when the split produced no batches.
    pub summary: Option<ValidationSummary>,
    /// Main-target probability per dataset row, in dataset order.
    pub predictions: Vec<f64>,
}

/// Scores a labelled split in loader order. Batches are not trimmed.
pub fn validate<P, L>(
    model: &P,
    loss: &dyn LossFunction,
    loader: &mut BlockingDataLoader<L>,
) -> Result<ValidationReport, TrainingError>
where
    P: Predictor + ?Sized,
    L: DataLoader,
{
    loader.start_epoch(0)?;
    let mut metrics = ValidationMetrics::default();
    let mut scored = Vec::new();

    while let Some(batch) = loader.next_batch()? {
        let targets = batch
            .targets
            .as_ref()
            .ok_or_else(|| TrainingError::data("validation batch carries no targets"))?;
        let logits = model.forward(&batch.input_ids)?;
        let batch_loss = loss
            .loss(&logits, targets)?
            .to_dtype(DType::F64)?
            .to_scalar::<f64>()?;
        let probabilities = main_probabilities(&logits)?;
        let labels = targets.narrow(1, 0, 1)?.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        metrics.update(batch_loss, &probabilities, &labels);
        scored.extend(batch.indices.iter().copied().zip(probabilities.iter().map(|&p| p as f64)));
    }

    let summary = metrics.finalize();
    debug!(?summary, "validation pass finished");
    Ok(ValidationReport {
        summary,
        predictions: in_dataset_order(scored)?,
    })
}

/// Main-target probability per dataset row.
pub fn predict<P, L>(model: &P, loader: &mut BlockingDataLoader<L>) -> Result<Vec<f64>, TrainingError>
where
    P: Predictor + ?Sized,
    L: DataLoader,
{
    loader.start_epoch(0)?;
    let mut scored = Vec::new();
    while let Some(batch) = loader.next_batch()? {
        let logits = model.forward(&batch.input_ids)?;
        let probabilities = main_probabilities(&logits)?;
        scored.extend(batch.indices.iter().copied().zip(probabilities.iter().map(|&p| p as f64)));
    }
    in_dataset_order(scored)
}

/// Sigmoid of the first logit column.
fn main_probabilities(logits: &Tensor) -> candle_core::Result<Vec<f32>> {
    let main = logits.narrow(1, 0, 1)?.flatten_all()?.to_dtype(DType::F32)?;
    candle_nn::ops::sigmoid(&main)?.to_vec1::<f32>()
}

fn in_dataset_order(mut scored: Vec<(usize, f64)>) -> Result<Vec<f64>, TrainingError> {
    scored.sort_unstable_by_key(|&(row, _)| row);
    for (position, &(row, _)) in scored.iter().enumerate() {
        if row != position {
            return Err(TrainingError::runtime(format!(
                "prediction pass did not cover row {position} exactly once"
            )));
        }
    }
    Ok(scored.into_iter().map(|(_, p)| p).collect())
}

/// Writes `id,prediction` rows.
pub fn write_submission(path: &Path, ids: &[String], predictions: &[f64]) -> Result<(), TrainingError> {
    if ids.len() != predictions.len() {
        return Err(TrainingError::runtime(format!(
            "{} ids but {} predictions",
            ids.len(),
            predictions.len()
        )));
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["id", "prediction"])?;
    for (id, prediction) in ids.iter().zip(predictions) {
        writer.write_record([id.as_str(), prediction.to_string().as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `id,target,prediction` rows for a validation split.
pub fn write_valid_predictions(
    path: &Path,
    ids: &[String],
    scores: &[f32],
    predictions: &[f64],
) -> Result<(), TrainingError> {
    if ids.len() != predictions.len() || scores.len() != predictions.len() {
        return Err(TrainingError::runtime(format!(
            "{} ids, {} targets and {} predictions",
            ids.len(),
            scores.len(),
            predictions.len()
        )));
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["id", "target", "prediction"])?;
    for ((id, score), prediction) in ids.iter().zip(scores).zip(predictions) {
        writer.write_record([
            id.as_str(),
            score.to_string().as_str(),
            prediction.to_string().as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn probabilities_use_first_column() {
        let logits = Tensor::new(&[[0.0f32, 5.0], [2.0, -5.0]], &Device::Cpu).unwrap();
        let probs = main_probabilities(&logits).unwrap();
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!((probs[1] - 0.880_797).abs() < 1e-5);
    }

    #[test]
    fn predictions_are_reordered_by_row() {
        let ordered = in_dataset_order(vec![(2, 0.3), (0, 0.1), (1, 0.2)]).unwrap();
        assert_eq!(ordered, vec![0.1, 0.2, 0.3]);
        assert!(in_dataset_order(vec![(0, 0.1), (2, 0.3)]).is_err());
    }

    #[test]
    fn submission_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("submission.csv");
        write_submission(&path, &["7".into(), "8".into()], &[0.25, 0.75]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "id,prediction\n7,0.25\n8,0.75\n");

        assert!(write_submission(&path, &["7".into()], &[0.1, 0.2]).is_err());
    }
}
