use thiserror::Error;

pub type Result<T> = std::result::Result<T, BucketError>;

#[derive(Error, Debug)]
pub enum BucketError {
    #[error("invalid bucketing configuration: {0}")]
    Config(String),

    #[error("cannot build batches over an empty dataset")]
    EmptyDataset,

    #[error("row {row} contains no non-padding tokens")]
    EmptySequence { row: usize },

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("bucket arena exhausted while filling batch {batch} of {batches}")]
    InvariantViolation { batch: usize, batches: usize },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
