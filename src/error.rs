//! Error type shared by the whole crate.
//!
//! Every variant is fatal for a training run: callers propagate with `?` up
//! to the binary, which reports the condition and exits.

use std::fmt;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GptError>;

#[derive(Debug)]
pub enum GptError {
    /// Configuration violates an invariant (detected eagerly at construction)
    Config(String),
    /// Input sequence is longer than the model's position capacity
    SequenceTooLong { len: usize, block_size: usize },
    /// Token id does not index the embedding table
    TokenOutOfRange { token: usize, vocab_size: usize },
    /// External checkpoint layout does not match the model layout
    CheckpointMismatch(String),
    /// Cross-process communication failed
    Distributed(String),
    /// Tokenizer file is malformed
    Tokenizer(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    SafeTensors(safetensors::SafeTensorError),
}

impl fmt::Display for GptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GptError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            GptError::SequenceTooLong { len, block_size } => write!(
                f,
                "cannot forward sequence of length {}, block size is only {}",
                len, block_size
            ),
            GptError::TokenOutOfRange { token, vocab_size } => write!(
                f,
                "token id {} is out of range for vocabulary of size {}",
                token, vocab_size
            ),
            GptError::CheckpointMismatch(msg) => write!(f, "checkpoint mismatch: {}", msg),
            GptError::Distributed(msg) => write!(f, "distributed error: {}", msg),
            GptError::Tokenizer(msg) => write!(f, "tokenizer error: {}", msg),
            GptError::Io(e) => write!(f, "io error: {}", e),
            GptError::Json(e) => write!(f, "json error: {}", e),
            GptError::SafeTensors(e) => write!(f, "safetensors error: {:?}", e),
        }
    }
}

impl std::error::Error for GptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GptError::Io(e) => Some(e),
            GptError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GptError {
    fn from(e: std::io::Error) -> Self {
        GptError::Io(e)
    }
}

impl From<serde_json::Error> for GptError {
    fn from(e: serde_json::Error) -> Self {
        GptError::Json(e)
    }
}

impl From<safetensors::SafeTensorError> for GptError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        GptError::SafeTensors(e)
    }
}
