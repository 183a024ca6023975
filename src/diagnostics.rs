//! Colorized tokenization breakdown for debugging truncation and padding.
//!
//! Each non-padding token is printed in an ANSI color: green for the start
//! token, red for the end token, and a rotating six-color palette for content.
//! The report never feeds back into encoding.

use crate::config::EncoderFamily;
use crate::model::tokenizer::PromptTokenizer;
use crate::Result;

const GREEN: &str = "\x1b[0;32m";
const RED: &str = "\x1b[0;31m";
const RESET: &str = "\x1b[0m";
const PALETTE_SIZE: usize = 6;

/// A rendered breakdown of one tokenized prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizationReport {
    pub family: EncoderFamily,
    /// Non-padding tokens, special tokens included.
    pub used_tokens: usize,
    pub max_length: usize,
    /// Colorized tokens, padding omitted.
    pub rendered: String,
}

impl TokenizationReport {
    pub fn header(&self) -> String {
        let label = match self.family {
            EncoderFamily::T5 => "T5",
            EncoderFamily::Clip => "CLIP",
        };
        format!(
            ">> [{label} TOKENLOG] Tokens ({}/{}):",
            self.used_tokens, self.max_length
        )
    }
}

/// Tokenize `prompt` exactly as the encoder will and render the result.
pub fn render(prompt: &str, tokenizer: &PromptTokenizer, max_length: usize) -> Result<TokenizationReport> {
    let tokens = tokenizer.tokenize(prompt, max_length)?;
    let special = tokenizer.special_tokens();

    let mut rendered = String::new();
    let mut used = 0;
    for (&id, &mask) in tokens.ids.iter().zip(&tokens.attention_mask) {
        if mask == 0 {
            continue;
        }
        let token = tokenizer
            .id_to_token(id)
            .unwrap_or_default()
            .replace(special.word_boundary, " ");
        let color = if Some(token.as_str()) == special.bos {
            GREEN.to_string()
        } else if token == special.eos {
            RED.to_string()
        } else {
            format!("\x1b[0;3{}m", used % PALETTE_SIZE + 1)
        };
        rendered.push_str(&format!("{color}{token}{RESET}"));
        used += 1;
    }

    Ok(TokenizationReport {
        family: tokenizer.family(),
        used_tokens: used,
        max_length,
        rendered,
    })
}

/// Render and emit the breakdown at info level.
pub fn log_tokenization(prompt: &str, tokenizer: &PromptTokenizer, max_length: usize) -> Result<()> {
    let report = render(prompt, tokenizer, max_length)?;
    tracing::info!("{}", report.header());
    tracing::info!("{}{RESET}", report.rendered);
    Ok(())
}
