use candle_core::{DType, Tensor};

use crate::{binned_length, BucketError, Result, DEFAULT_GRANULARITY};

/// Cuts shared right padding off a batch.
///
/// The kept width is the bucket key of the longest row in the batch, clamped
/// to the physical width, so no real token is ever dropped and batch widths
/// stay on a small set of multiples of the granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicTrimmer {
    granularity: usize,
    pad_id: u32,
    enabled: bool,
}

impl Default for DynamicTrimmer {
    fn default() -> Self {
        Self::new(DEFAULT_GRANULARITY, 0)
    }
}

impl DynamicTrimmer {
    pub fn new(granularity: usize, pad_id: u32) -> Self {
        Self {
            granularity: granularity.max(1),
            pad_id,
            enabled: true,
        }
    }

    /// A trimmer that hands batches through untouched.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    /// Width the batch will be narrowed to.
    pub fn target_width(&self, tokens: &Tensor) -> Result<usize> {
        let (rows, width) = tokens.dims2()?;
        if !self.enabled || rows == 0 || width == 0 {
            return Ok(width);
        }
        let longest = tokens
            .ne(self.pad_id)?
            .to_dtype(DType::U32)?
            .sum(1)?
            .max(0)?
            .to_scalar::<u32>()? as usize;
        Ok(binned_length(longest, self.granularity).min(width))
    }

    /// Narrows `tokens` and every sequence-aligned companion (attention
    /// masks, token type ids) to [`DynamicTrimmer::target_width`] columns.
    pub fn trim(&self, tokens: &Tensor, aligned: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
        let (rows, width) = tokens.dims2()?;
        for (position, tensor) in aligned.iter().enumerate() {
            let dims = tensor.dims();
            if dims.len() < 2 || dims[0] != rows || dims[1] != width {
                return Err(BucketError::Shape(format!(
                    "aligned tensor {position} has shape {dims:?}, expected leading ({rows}, {width})"
                )));
            }
        }

        let target = self.target_width(tokens)?;
        if target == width {
            return Ok((tokens.clone(), aligned.to_vec()));
        }

        let trimmed = tokens.narrow(1, 0, target)?;
        let companions = aligned
            .iter()
            .map(|tensor| tensor.narrow(1, 0, target).map_err(BucketError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok((trimmed, companions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn batch(rows: &[&[u32]], width: usize) -> Tensor {
        let mut data = Vec::with_capacity(rows.len() * width);
        for row in rows {
            data.extend_from_slice(row);
            data.extend(std::iter::repeat(0u32).take(width - row.len()));
        }
        Tensor::from_vec(data, (rows.len(), width), &Device::Cpu).unwrap()
    }

    #[test]
    fn trims_to_bucket_of_longest_row() {
        let tokens = batch(&[&[1, 2, 3], &[1; 10]], 32);
        let trimmer = DynamicTrimmer::new(8, 0);
        assert_eq!(trimmer.target_width(&tokens).unwrap(), 16);

        let mask = tokens.ne(0u32).unwrap();
        let (trimmed, aligned) = trimmer.trim(&tokens, &[mask]).unwrap();
        assert_eq!(trimmed.dims(), &[2, 16]);
        assert_eq!(aligned[0].dims(), &[2, 16]);

        let kept = trimmed.ne(0u32).unwrap().to_dtype(DType::U32).unwrap();
        let kept = kept.sum_all().unwrap().to_scalar::<u32>().unwrap();
        assert_eq!(kept, 13);
    }

    #[test]
    fn clamps_to_physical_width() {
        let tokens = batch(&[&[4; 10]], 10);
        let trimmer = DynamicTrimmer::new(8, 0);
        let (trimmed, _) = trimmer.trim(&tokens, &[]).unwrap();
        assert_eq!(trimmed.dims(), &[1, 10]);
    }

    #[test]
    fn disabled_trimmer_is_identity() {
        let tokens = batch(&[&[1, 2]], 24);
        let (trimmed, _) = DynamicTrimmer::disabled().trim(&tokens, &[]).unwrap();
        assert_eq!(trimmed.dims(), &[1, 24]);
    }

    #[test]
    fn rejects_misaligned_companions() {
        let tokens = batch(&[&[1, 2]], 16);
        let other = Tensor::zeros((1, 8), DType::U32, &Device::Cpu).unwrap();
        let err = DynamicTrimmer::new(8, 0).trim(&tokens, &[other]).unwrap_err();
        assert!(matches!(err, BucketError::Shape(_)));
    }
}
