//! Ownership-checked binding layer over a native LLM inference engine.
//!
//! Resources form a directed acquisition graph,
//! `Backend → Model → Context → {Batch, Sampler}`. Every Handle-holding type
//! releases on drop, `release()` is idempotent, and any other call on a
//! released value fails with [`BridgeError::UseAfterRelease`]. Native frees
//! always run in reverse-acquisition order, whatever order callers release in.
//!
//! The native library is reached only through the [`Engine`] trait; enable
//! the `llama-cpp` feature for the llama.cpp adapter.

pub mod backend;
pub mod batch;
pub mod context;
pub mod engine;
pub mod error;
pub mod generate;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod sampler;
pub mod tokenizer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Backend, Capabilities, NumaStrategy};
pub use batch::{Batch, BatchEntry};
pub use context::{BatchResult, Context, ContextId, ContextParams, ContextState, DecodeFailure};
pub use engine::{Engine, LogLevel};
pub use error::{BridgeError, Entity, Result};
pub use generate::{Completion, FinishReason, GenerateEvent, GenerateRequest, generate};
pub use manager::ModelManager;
pub use model::{Model, ModelInfo, ModelParams, QuantType, QuantizeParams};
pub use sampler::{Sampler, SamplerParams};
pub use tokenizer::{SpecialToken, Tokenizer};

#[cfg(feature = "llama-cpp")]
pub use engine::llama_cpp::LlamaCppEngine;
