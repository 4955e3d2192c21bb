use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{ClassifierConfig, SequenceClassifier};

fn build_config() -> ClassifierConfig {
    ClassifierConfig::new(16, 8, 7, Device::Cpu)
}

#[test]
fn forward_produces_one_logit_per_label() -> Result<()> {
    let model = SequenceClassifier::new(build_config())?;
    let token_ids = Tensor::from_slice(&[2u32, 5, 6, 3, 2, 7, 3, 0], (2, 4), &Device::Cpu)?;

    let logits = model.forward(&token_ids)?;

    assert_eq!(logits.dims(), &[2, 7]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn trailing_padding_does_not_change_logits() -> Result<()> {
    let model = SequenceClassifier::new(build_config())?;
    let short = Tensor::from_slice(&[2u32, 9, 4, 3], (1, 4), &Device::Cpu)?;
    let padded = Tensor::from_slice(&[2u32, 9, 4, 3, 0, 0, 0, 0, 0, 0, 0, 0], (1, 12), &Device::Cpu)?;

    let a = model.forward(&short)?.flatten_all()?.to_vec1::<f32>()?;
    let b = model.forward(&padded)?.flatten_all()?.to_vec1::<f32>()?;

    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-5, "{x} != {y}");
    }
    Ok(())
}

#[test]
fn invalid_config_is_rejected() {
    let mut config = build_config();
    config.pad_id = 99;
    assert!(SequenceClassifier::new(config).is_err());
}

#[test]
fn weights_round_trip_through_safetensors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("weights.safetensors");

    let source = SequenceClassifier::new(build_config())?;
    source.save_weights(&path)?;

    let target = SequenceClassifier::new(build_config())?;
    let report = target.load_weights(&path)?;
    assert!(report.missing.is_empty());
    assert!(report.unexpected.is_empty());
    assert_eq!(report.loaded.len(), source.parameters()?.len());

    let ids = Tensor::from_slice(&[2u32, 4, 5, 3], (1, 4), &Device::Cpu)?;
    let a = source.forward(&ids)?.flatten_all()?.to_vec1::<f32>()?;
    let b = target.forward(&ids)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn partial_weights_report_missing_and_unexpected() -> Result<()> {
    let model = SequenceClassifier::new(build_config())?;
    let mut tensors = std::collections::HashMap::new();
    tensors.insert("classifier.bias".to_string(), Tensor::ones(7, DType::F32, &Device::Cpu)?);
    tensors.insert("bert.extra".to_string(), Tensor::zeros(3, DType::F32, &Device::Cpu)?);

    let report = model.load_tensors(tensors)?;

    assert_eq!(report.loaded, vec!["classifier.bias".to_string()]);
    assert_eq!(report.unexpected, vec!["bert.extra".to_string()]);
    assert!(report.missing.contains(&"classifier.weight".to_string()));
    Ok(())
}
