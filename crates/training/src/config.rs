use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use bucketing::SamplerConfig;

use crate::{device::DeviceKind, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    pub tokenizer: TokenizerConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub bucketing: BucketingConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if self.model.num_labels < 2 {
            errors.push(
                "model.num_labels must cover the main target and at least one auxiliary target"
                    .to_string(),
            );
        }

        if self.tokenizer.tokenizer_json.as_os_str().is_empty() {
            errors.push("tokenizer.tokenizer_json must be set".to_string());
        }

        if self.data.train_csv.as_os_str().is_empty() {
            errors.push("data.train_csv must be set".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.eval_batch_size == 0 {
            errors.push("data.eval_batch_size must be greater than 0".to_string());
        }

        if self.data.train_seq_length < 2 || self.data.test_seq_length < 2 {
            errors.push("sequence lengths must leave room for [CLS] and [SEP]".to_string());
        }

        if self.data.folds_json.is_none()
            && !(0.0 < self.data.valid_fraction && self.data.valid_fraction < 1.0)
        {
            errors.push("data.valid_fraction must be in (0, 1) when no folds file is given".to_string());
        }

        if self.bucketing.granularity == 0 {
            errors.push("bucketing.granularity must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.bucketing.narrow_probability) {
            errors.push("bucketing.narrow_probability must be in [0, 1]".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.warmup_proportion) {
            errors.push("optimizer.warmup_proportion must be in [0, 1)".to_string());
        }

        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.runtime.run_root.as_os_str().is_empty() {
            errors.push("runtime.run_root must be set".to_string());
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }

        if self.runtime.accumulation_steps == 0 {
            errors.push("runtime.accumulation_steps must be greater than 0".to_string());
        }

        if self.runtime.checkpoint_interval == Some(0) {
            errors.push("runtime.checkpoint_interval must be greater than 0".to_string());
        }

        if self.runtime.logging.log_every_n_steps == 0 {
            errors.push("runtime.logging.log_every_n_steps must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.tokenizer.tokenizer_json, base);
        self.data.apply_base_path(base);
        if let Some(path) = self.model.init_weights.as_mut() {
            absolutize_in_place(path, base);
        }
        absolutize_in_place(&mut self.runtime.run_root, base);
        if let Some(dir) = self.runtime.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Steps between checkpoint handoffs; defaults to an eighth of the
    /// validation split.
    pub fn checkpoint_interval(&self, valid_rows: usize) -> usize {
        self.runtime
            .checkpoint_interval
            .unwrap_or(valid_rows / 8)
            .max(1)
    }

    pub fn sampler_config(&self, batch_size: usize) -> SamplerConfig {
        SamplerConfig {
            batch_size,
            granularity: self.bucketing.granularity,
            window: self.bucketing.window,
            narrow_probability: self.bucketing.narrow_probability,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
    /// Taken from the tokenizer when absent.
    #[serde(default)]
    pub vocab_size: Option<usize>,
    /// Weights imported before training; names without a counterpart are
    /// reported and skipped.
    #[serde(default)]
    pub init_weights: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            num_labels: default_num_labels(),
            vocab_size: None,
            init_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    pub tokenizer_json: PathBuf,
    #[serde(default = "default_cls_token")]
    pub cls_token: String,
    #[serde(default = "default_sep_token")]
    pub sep_token: String,
    #[serde(default = "default_pad_token")]
    pub pad_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub train_csv: PathBuf,
    #[serde(default)]
    pub test_csv: Option<PathBuf>,
    /// JSON array of validation-row id lists, one per fold.
    #[serde(default)]
    pub folds_json: Option<PathBuf>,
    #[serde(default)]
    pub fold: usize,
    #[serde(default = "default_valid_fraction")]
    pub valid_fraction: f64,
    #[serde(default)]
    pub train_size: Option<usize>,
    #[serde(default)]
    pub valid_size: Option<usize>,
    #[serde(default = "default_train_seq_length")]
    pub train_seq_length: usize,
    #[serde(default = "default_test_seq_length")]
    pub test_seq_length: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_text_column")]
    pub text_column: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.train_csv, base);
        for path in [self.test_csv.as_mut(), self.folds_json.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_granularity")]
    pub granularity: usize,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_narrow_probability")]
    pub narrow_probability: f64,
}

impl Default for BucketingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            granularity: default_granularity(),
            window: default_window(),
            narrow_probability: default_narrow_probability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_warmup_proportion")]
    pub warmup_proportion: f64,
    /// Parameter-name fragments excluded from weight decay.
    #[serde(default = "default_no_decay")]
    pub no_decay: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            warmup_proportion: default_warmup_proportion(),
            no_decay: default_no_decay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub run_root: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,
    #[serde(default)]
    pub checkpoint_interval: Option<usize>,
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            flush_every_n: default_flush_every_n(),
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !path.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_hidden_size() -> usize {
    128
}

fn default_num_labels() -> usize {
    7
}

fn default_cls_token() -> String {
    "[CLS]".to_string()
}

fn default_sep_token() -> String {
    "[SEP]".to_string()
}

fn default_pad_token() -> String {
    "[PAD]".to_string()
}

fn default_valid_fraction() -> f64 {
    0.1
}

fn default_train_seq_length() -> usize {
    224
}

fn default_test_seq_length() -> usize {
    296
}

fn default_batch_size() -> usize {
    32
}

fn default_num_workers() -> usize {
    4
}

fn default_text_column() -> String {
    "comment_text".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_granularity() -> usize {
    bucketing::DEFAULT_GRANULARITY
}

fn default_window() -> usize {
    2
}

fn default_narrow_probability() -> f64 {
    0.8
}

fn default_learning_rate() -> f64 {
    2e-5
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-6
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_warmup_proportion() -> f64 {
    0.05
}

fn default_no_decay() -> Vec<String> {
    vec!["bias".to_string(), "LayerNorm".to_string()]
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    2
}

fn default_accumulation_steps() -> usize {
    2
}

fn default_flush_every_n() -> usize {
    10
}

fn default_log_every_n_steps() -> usize {
    50
}
