use std::fmt;

use thiserror::Error;

/// The kind of Handle-holding entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Backend,
    Model,
    Tokenizer,
    Context,
    Batch,
    Sampler,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Backend => "backend",
            Self::Model => "model",
            Self::Tokenizer => "tokenizer",
            Self::Context => "context",
            Self::Batch => "batch",
            Self::Sampler => "sampler",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{entity} used after release")]
    UseAfterRelease { entity: Entity },

    /// The native library could not be brought up. Nothing else works until
    /// this is fixed outside the process.
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Model file not found: '{path}'")]
    NotFound { path: String },

    #[error("Failed to load model from '{path}': {reason}")]
    LoadFailure { path: String, reason: String },

    #[error("Failed to create context: {0}")]
    CreateFailure(String),

    #[error("Quantization failed with code {code}")]
    QuantizeFailure { code: u32 },

    #[error("I/O failure on '{path}': {reason}")]
    IoFailure { path: String, reason: String },

    #[error("Batch is full ({capacity} tokens)")]
    BatchFull { capacity: usize },

    #[error("Batch overflow: {requested} tokens requested, {available} available")]
    BatchOverflow { requested: usize, available: usize },

    #[error("No logits available: no batch has been processed successfully")]
    NoLogitsAvailable,

    #[error("Tokenization failed: {0}")]
    Tokenization(String),
}

impl BridgeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn released(entity: Entity) -> Self {
        Self::UseAfterRelease { entity }
    }

    /// Only a failed backend initialization is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendInit(_))
    }

    /// Errors a caller can act on without restarting the process.
    /// Use-after-release is a programming error and never recoverable.
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Self::UseAfterRelease { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
