use std::{collections::HashMap, path::Path};

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{Embedding, LayerNorm, Linear, Module, VarBuilder, VarMap};

use crate::config::ClassifierConfig;

/// Outcome of a non-strict weight import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightLoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Token embeddings mean-pooled over non-padding positions, followed by a
/// tanh pooler and a linear head with one logit per label.
pub struct SequenceClassifier {
    config: ClassifierConfig,
    varmap: VarMap,
    embeddings: Embedding,
    norm: LayerNorm,
    pooler: Linear,
    head: Linear,
}

impl SequenceClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);

        let embeddings = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp("embeddings").pp("word_embeddings"),
        )?;
        let norm = candle_nn::layer_norm(
            config.hidden_size,
            config.layer_norm_eps,
            vb.pp("embeddings").pp("LayerNorm"),
        )?;
        let pooler = candle_nn::linear(
            config.hidden_size,
            config.hidden_size,
            vb.pp("pooler").pp("dense"),
        )?;
        let head = candle_nn::linear(config.hidden_size, config.num_labels, vb.pp("classifier"))?;

        Ok(Self {
            config,
            varmap,
            embeddings,
            norm,
            pooler,
            head,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Produces logits shaped `(batch, num_labels)` for `(batch, seq)` token ids.
    ///
    /// Padding positions never contribute, so the logits do not depend on how
    /// much right padding a batch carries.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        if seq == 0 {
            return Err(Error::Msg("sequence length must be non-zero".into()));
        }

        let hidden = self.embeddings.forward(input_ids)?;
        let hidden = self.norm.forward(&hidden)?;

        let mask = input_ids.ne(self.config.pad_id)?.to_dtype(hidden.dtype())?;
        let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
        let counts = mask.sum_keepdim(1)?.maximum(1f64)?;
        let pooled = summed.broadcast_div(&counts)?;

        let pooled = self.pooler.forward(&pooled)?.tanh()?;
        self.head.forward(&pooled)
    }

    /// Trainable parameters sorted by name.
    pub fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Msg("classifier parameter map is poisoned".into()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)
    }

    /// Copies every tensor from `tensors` whose name and shape match a
    /// parameter. Names on either side without a counterpart are reported
    /// instead of failing.
    pub fn load_tensors(&self, mut tensors: HashMap<String, Tensor>) -> Result<WeightLoadReport> {
        let mut report = WeightLoadReport::default();
        for (name, var) in self.parameters()? {
            match tensors.remove(&name) {
                Some(tensor) => {
                    if tensor.dims() != var.as_tensor().dims() {
                        return Err(Error::Msg(format!(
                            "parameter {name} expects shape {:?}, found {:?}",
                            var.as_tensor().dims(),
                            tensor.dims()
                        )));
                    }
                    let tensor = tensor
                        .to_dtype(var.as_tensor().dtype())?
                        .to_device(var.as_tensor().device())?;
                    var.set(&tensor)?;
                    report.loaded.push(name);
                }
                None => report.missing.push(name),
            }
        }
        report.unexpected = tensors.into_keys().collect();
        report.unexpected.sort();
        Ok(report)
    }

    pub fn load_weights(&self, path: &Path) -> Result<WeightLoadReport> {
        let tensors = candle_core::safetensors::load(path, &self.config.device)?;
        self.load_tensors(tensors)
    }
}
