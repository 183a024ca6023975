//! Error types for flux-text-encoder-rs.

use std::fmt;

use crate::config::{EncoderFamily, EncoderFormat};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The encoder's storage format has no patch strategy for its family.
    ///
    /// Raised before any tokenization or device work.
    #[error("unsupported model format for {family} encoder: {format}")]
    UnsupportedFormat {
        family: EncoderFamily,
        format: EncoderFormat,
    },

    /// A loaded resource does not match its expected contract.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A model, tokenizer or patch could not be loaded.
    #[error("resource acquisition: {0}")]
    ResourceAcquisition(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("hf-hub: {0}")]
    HfHub(String),

    /// Encode manager failure (worker gone, reply dropped).
    #[error("manager: {0}")]
    Manager(String),
}

impl Error {
    /// True for errors that stem from an unusable model configuration.
    ///
    /// These are never worth retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::UnsupportedFormat { .. } | Error::Config(_))
    }
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

impl From<hf_hub::api::sync::ApiError> for Error {
    fn from(error: hf_hub::api::sync::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_format_message() {
        let err = Error::UnsupportedFormat {
            family: EncoderFamily::Clip,
            format: EncoderFormat::BnbQuantizedLlmInt8b,
        };
        assert_eq!(
            err.to_string(),
            "unsupported model format for clip encoder: bnb_quantized_llm_int8b"
        );
        assert!(err.is_configuration());
    }

    #[test]
    fn test_resource_errors_are_not_configuration() {
        assert!(!Error::ResourceAcquisition("missing".into()).is_configuration());
        assert!(!Error::Invariant("bad tokenizer".into()).is_configuration());
    }
}
