pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod evaluation;
pub mod learner;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod scheduler;
pub mod session;
pub mod trainer;

pub use checkpoint::{CheckpointManifest, CheckpointStore, LoadedCheckpoint, TrainingProgress};
pub use config::TrainingConfig;
pub use data::{BatchOrder, BlockingDataLoader, BucketedDataLoader, DataBatch, DataLoader, TokenDataset};
pub use error::TrainingError;
pub use learner::{
    is_resource_exhaustion, CandleLearner, LossFunction, Predictor, StateSnapshot, TrainableModel,
};
pub use loss::WeightedBceLoss;
pub use metrics::{ExponentialMovingAverage, ValidationSummary};
pub use optimizer::{AdamW, AdamWConfig};
pub use scheduler::{LRScheduler, WarmupLinear};
pub use session::{RunMode, Session, SessionOptions};
pub use trainer::{
    CheckpointSink, Handoff, HandoffReason, LoopPhase, LoopSettings, ResumePoint, SinkDecision,
    TrainOutcome, TrainingLoop, TrainingState,
};
