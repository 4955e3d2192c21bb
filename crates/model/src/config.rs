use candle_core::{DType, Device, Error, Result};

/// Shape and placement of a [`crate::SequenceClassifier`].
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    /// Output logits per row: the main target followed by auxiliary targets.
    pub num_labels: usize,
    pub pad_id: u32,
    pub layer_norm_eps: f64,
    pub dtype: DType,
    pub device: Device,
}

impl ClassifierConfig {
    pub fn new(vocab_size: usize, hidden_size: usize, num_labels: usize, device: Device) -> Self {
        Self {
            vocab_size,
            hidden_size,
            num_labels,
            pad_id: 0,
            layer_norm_eps: 1e-12,
            dtype: DType::F32,
            device,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.num_labels == 0 {
            return Err(Error::Msg("num_labels must be greater than zero".into()));
        }
        if self.pad_id as usize >= self.vocab_size {
            return Err(Error::Msg(format!(
                "pad_id ({}) must be smaller than vocab_size ({})",
                self.pad_id, self.vocab_size
            )));
        }
        if !self.dtype.is_float() {
            return Err(Error::Msg(format!(
                "classifier parameters must be floating point, got {:?}",
                self.dtype
            )));
        }
        if self.layer_norm_eps <= 0.0 {
            return Err(Error::Msg("layer_norm_eps must be positive".into()));
        }
        Ok(())
    }
}
