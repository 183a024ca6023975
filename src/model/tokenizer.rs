//! Prompt tokenization for the two encoder families.
//!
//! Both encoders see a fixed-length window:
//!
//! ```text
//! T5:    [content …, </s>, <pad> …]                       max_length = 256 | 512
//! CLIP:  [<|startoftext|>, content …, <|endoftext|> …]    max_length = 77
//! ```
//!
//! Content is truncated so the end-of-sequence token always fits. Padding
//! positions carry attention mask 0.

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer;

use crate::config::EncoderFamily;
use crate::{Error, Result};

/// Native context window of the CLIP text encoder.
pub const CLIP_MAX_SEQ_LEN: usize = 77;

/// Special tokens and the word-boundary glyph of one tokenizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub bos: Option<&'static str>,
    pub eos: &'static str,
    pub pad: &'static str,
    /// Marker the vocabulary uses for word boundaries (`▁` for SentencePiece,
    /// `</w>` for CLIP BPE).
    pub word_boundary: &'static str,
}

impl SpecialTokens {
    pub fn for_family(family: EncoderFamily) -> Self {
        match family {
            EncoderFamily::T5 => Self {
                bos: None,
                eos: "</s>",
                pad: "<pad>",
                word_boundary: "\u{2581}",
            },
            EncoderFamily::Clip => Self {
                bos: Some("<|startoftext|>"),
                eos: "<|endoftext|>",
                pad: "<|endoftext|>",
                word_boundary: "</w>",
            },
        }
    }
}

/// A prompt as the encoder sees it: one row of exactly `max_length` ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPrompt {
    pub ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Index of the end-of-sequence token.
    pub eos_position: usize,
}

impl TokenizedPrompt {
    pub fn max_length(&self) -> usize {
        self.ids.len()
    }

    /// Non-padding positions.
    pub fn used_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }

    /// `[1, max_length]` u32 tensor.
    pub fn input_ids(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.ids.as_slice(), device)?.unsqueeze(0)?)
    }
}

/// A HuggingFace tokenizer checked against one family's special tokens.
pub struct PromptTokenizer {
    inner: Tokenizer,
    family: EncoderFamily,
    special: SpecialTokens,
    bos_id: Option<u32>,
    eos_id: u32,
    pad_id: u32,
}

impl PromptTokenizer {
    /// Wrap `inner` for `family`.
    ///
    /// Fails with [`Error::Invariant`] when the vocabulary lacks the family's
    /// special tokens, i.e. the tokenizer belongs to a different encoder.
    /// Padding and truncation saved in `tokenizer.json` are dropped; the
    /// window is always laid out by [`PromptTokenizer::tokenize`].
    pub fn new(mut inner: Tokenizer, family: EncoderFamily) -> Result<Self> {
        inner.with_padding(None);
        inner.with_truncation(None)?;
        let special = SpecialTokens::for_family(family);
        let lookup = |token: &str| {
            inner.token_to_id(token).ok_or_else(|| {
                Error::Invariant(format!("{family} tokenizer has no {token:?} token"))
            })
        };
        let bos_id = special.bos.map(&lookup).transpose()?;
        let eos_id = lookup(special.eos)?;
        let pad_id = lookup(special.pad)?;
        Ok(Self {
            inner,
            family,
            special,
            bos_id,
            eos_id,
            pad_id,
        })
    }

    pub fn family(&self) -> EncoderFamily {
        self.family
    }

    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.inner.id_to_token(id)
    }

    /// Tokenize, truncate and pad `prompt` to exactly `max_length` ids.
    pub fn tokenize(&self, prompt: &str, max_length: usize) -> Result<TokenizedPrompt> {
        let reserved = usize::from(self.bos_id.is_some()) + 1;
        if max_length < reserved {
            return Err(Error::Config(format!(
                "{} max length {max_length} cannot hold the special tokens",
                self.family
            )));
        }

        let encoding = self.inner.encode(prompt, false)?;
        let content = encoding.get_ids();
        let kept = content.len().min(max_length - reserved);
        if kept < content.len() {
            tracing::debug!(
                family = %self.family,
                tokens = content.len(),
                max_length,
                "prompt truncated"
            );
        }

        let mut ids = Vec::with_capacity(max_length);
        ids.extend(self.bos_id);
        ids.extend_from_slice(&content[..kept]);
        ids.push(self.eos_id);
        let eos_position = ids.len() - 1;

        let mut attention_mask = vec![1u32; ids.len()];
        attention_mask.resize(max_length, 0);
        ids.resize(max_length, self.pad_id);

        Ok(TokenizedPrompt {
            ids,
            attention_mask,
            eos_position,
        })
    }
}
