use candle_core::{DType, Tensor};

use crate::{BucketError, Result};

/// Bucket width used when none is configured.
pub const DEFAULT_GRANULARITY: usize = 8;

/// Rounds `len` up to the next multiple of `granularity`, never below one
/// full bucket.
///
/// The result is always a positive multiple of `granularity` and never
/// smaller than `len`, so it is safe to use both as a bucket key and as a
/// trim width.
pub fn binned_length(len: usize, granularity: usize) -> usize {
    let k = granularity.max(1);
    (k * len.div_ceil(k)).max(k)
}

/// Effective (non-padding) length of every row in a fixed-width token matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthIndex {
    lengths: Vec<usize>,
    width: usize,
}

impl LengthIndex {
    /// Scans a row-major `rows x width` token buffer.
    pub fn from_rows(tokens: &[u32], width: usize, pad_id: u32) -> Result<Self> {
        if width == 0 {
            return Err(BucketError::Shape("sequence width must be non-zero".into()));
        }
        if tokens.is_empty() {
            return Err(BucketError::EmptyDataset);
        }
        if tokens.len() % width != 0 {
            return Err(BucketError::Shape(format!(
                "token buffer of {} ids is not a multiple of width {}",
                tokens.len(),
                width
            )));
        }

        let lengths = tokens
            .chunks_exact(width)
            .enumerate()
            .map(|(row, ids)| {
                let len = ids.iter().filter(|&&id| id != pad_id).count();
                if len == 0 {
                    Err(BucketError::EmptySequence { row })
                } else {
                    Ok(len)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { lengths, width })
    }

    /// Same contract as [`LengthIndex::from_rows`] for a `(rows, width)` tensor.
    pub fn from_tensor(tokens: &Tensor, pad_id: u32) -> Result<Self> {
        let (_, width) = tokens.dims2()?;
        let flat = tokens
            .to_dtype(DType::U32)?
            .flatten_all()?
            .to_vec1::<u32>()?;
        Self::from_rows(&flat, width, pad_id)
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        self.lengths.get(index).copied()
    }

    pub fn max_length(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }

    /// Bucket key of every row for the given granularity.
    pub fn bucket_keys(&self, granularity: usize) -> Vec<usize> {
        self.lengths
            .iter()
            .map(|&len| binned_length(len, granularity))
            .collect()
    }
}
