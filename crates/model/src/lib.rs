pub mod classifier;
pub mod config;

pub use classifier::{SequenceClassifier, WeightLoadReport};
pub use config::ClassifierConfig;
