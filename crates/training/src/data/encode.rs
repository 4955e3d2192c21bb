use rayon::{prelude::*, ThreadPool};
use tokenizers::Tokenizer;
use tracing::info;

use crate::{config::TokenizerConfig, data::Result, TrainingError};

/// Ids framing every encoded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub cls_id: u32,
    pub sep_id: u32,
    pub pad_id: u32,
}

impl SpecialTokens {
    pub fn from_tokenizer(tokenizer: &Tokenizer, config: &TokenizerConfig) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                TrainingError::initialization(format!("tokenizer has no id for '{token}'"))
            })
        };
        Ok(Self {
            cls_id: lookup(&config.cls_token)?,
            sep_id: lookup(&config.sep_token)?,
            pad_id: lookup(&config.pad_token)?,
        })
    }
}

/// Fixed-width token matrix produced from a column of texts.
#[derive(Debug, Clone)]
pub struct EncodedTexts {
    pub tokens: Vec<u32>,
    pub width: usize,
    /// Rows whose text filled the whole width and was possibly cut.
    pub saturated: usize,
}

impl EncodedTexts {
    pub fn rows(&self) -> usize {
        if self.width == 0 {
            0
        } else {
            self.tokens.len() / self.width
        }
    }

    pub fn row(&self, index: usize) -> &[u32] {
        &self.tokens[index * self.width..(index + 1) * self.width]
    }

    pub fn saturated_fraction(&self) -> f64 {
        let rows = self.rows();
        if rows == 0 {
            0.0
        } else {
            self.saturated as f64 / rows as f64
        }
    }
}

/// `[CLS] tokens [SEP]` right-padded to `width`; text beyond `width - 2`
/// tokens is dropped.
pub fn encode_fixed(
    tokenizer: &Tokenizer,
    text: &str,
    width: usize,
    special: &SpecialTokens,
) -> Result<Vec<u32>> {
    if width < 2 {
        return Err(TrainingError::data(format!(
            "sequence width {width} leaves no room for [CLS] and [SEP]"
        )));
    }
    let encoding = tokenizer
        .encode(text, false)
        .map_err(|err| TrainingError::data(format!("failed to tokenize text: {err}")))?;
    let body = encoding.get_ids();
    let keep = body.len().min(width - 2);

    let mut row = Vec::with_capacity(width);
    row.push(special.cls_id);
    row.extend_from_slice(&body[..keep]);
    row.push(special.sep_id);
    row.resize(width, special.pad_id);
    Ok(row)
}

/// Encodes `texts` on `pool`, keeping input order.
pub fn encode_corpus(
    pool: &ThreadPool,
    tokenizer: &Tokenizer,
    texts: &[String],
    width: usize,
    special: &SpecialTokens,
) -> Result<EncodedTexts> {
    let rows: Vec<Vec<u32>> = pool.install(|| {
        texts
            .par_iter()
            .map(|text| encode_fixed(tokenizer, text, width, special))
            .collect::<Result<Vec<_>>>()
    })?;

    let saturated = rows
        .iter()
        .filter(|row| row.last().is_some_and(|&id| id != special.pad_id))
        .count();
    let encoded = EncodedTexts {
        tokens: rows.into_iter().flatten().collect(),
        width,
        saturated,
    };
    info!(
        rows = encoded.rows(),
        width,
        "{:.1}% texts are at least {} tokens long",
        encoded.saturated_fraction() * 100.0,
        width
    );
    Ok(encoded)
}
