//! The foreign-call seam.
//!
//! [`Engine`] is the complete surface the binding layer needs from a native
//! inference library. Everything above it (ownership, validation, sampling)
//! is engine-agnostic; only an adapter implements it.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use crate::backend::NumaStrategy;
use crate::context::ContextParams;
use crate::model::{ModelParams, QuantizeParams};
use crate::tokenizer::SpecialToken;

#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(NonZeroUsize);

        impl $name {
            /// Wrap an adapter-specific address or index. Zero is the null handle.
            pub fn from_addr(addr: usize) -> Option<Self> {
                NonZeroUsize::new(addr).map(Self)
            }

            pub fn addr(self) -> usize {
                self.0.get()
            }
        }
    };
}

raw_handle!(
    /// Opaque native model handle.
    RawModel
);
raw_handle!(
    /// Opaque native inference-context handle.
    RawContext
);
raw_handle!(
    /// Opaque native token-batch handle.
    RawBatch
);

/// Severity of a message emitted by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Process-wide receiver for native log lines.
pub type LogSink = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Native decode status codes as reported by [`Engine::decode`].
pub mod decode_status {
    pub const OK: i32 = 0;
    pub const NO_KV_SLOT: i32 = 1;
    pub const ABORTED: i32 = 2;
    pub const INVALID_INPUT: i32 = -1;
}

/// Foreign-call surface of a native inference engine.
///
/// Methods mirror the C API one-to-one and report failure the way the native
/// library does (null handles, status codes, `false`). Translating those into
/// [`BridgeError`](crate::BridgeError) is the caller's job. Implementations
/// may assume every raw handle they receive is live: the binding layer never
/// passes a handle after freeing it.
pub trait Engine: Send + Sync {
    /// Short adapter name for logs.
    fn name(&self) -> &str;

    //  Backend

    fn init(&self) -> std::result::Result<(), String>;
    fn free(&self);
    fn numa_init(&self, strategy: NumaStrategy);
    fn time_us(&self) -> i64;
    fn max_devices(&self) -> usize;
    fn supports_mmap(&self) -> bool;
    fn supports_mlock(&self) -> bool;
    fn supports_gpu_offload(&self) -> bool;
    fn supports_rpc(&self) -> bool;
    fn system_info(&self) -> String;
    /// Replace the log sink. `None` restores the library's default output.
    fn set_log_sink(&self, sink: Option<LogSink>);

    //  Model

    /// Load one file, or an ordered list of split files.
    fn model_load(&self, paths: &[&Path], params: &ModelParams) -> Option<RawModel>;
    fn model_free(&self, model: RawModel);
    fn model_n_params(&self, model: RawModel) -> u64;
    fn model_size(&self, model: RawModel) -> u64;
    fn model_n_ctx_train(&self, model: RawModel) -> i32;
    fn model_n_embd(&self, model: RawModel) -> i32;
    fn model_n_layer(&self, model: RawModel) -> i32;
    fn model_n_head(&self, model: RawModel) -> i32;
    fn model_n_head_kv(&self, model: RawModel) -> i32;
    fn model_rope_freq_scale_train(&self, model: RawModel) -> f32;
    fn model_rope_type(&self, model: RawModel) -> i32;
    fn model_meta_count(&self, model: RawModel) -> usize;
    fn model_meta_key(&self, model: RawModel, index: usize) -> Option<String>;
    fn model_meta_val(&self, model: RawModel, key: &str) -> Option<String>;
    fn model_desc(&self, model: RawModel) -> String;
    fn model_chat_template(&self, model: RawModel) -> Option<String>;
    fn model_has_encoder(&self, model: RawModel) -> bool;
    fn model_has_decoder(&self, model: RawModel) -> bool;
    /// `None` when the model has no dedicated decoder start token.
    fn model_decoder_start_token(&self, model: RawModel) -> Option<i32>;
    fn model_is_recurrent(&self, model: RawModel) -> bool;
    fn model_save(&self, model: RawModel, path: &Path) -> bool;
    /// Returns 0 on success.
    fn model_quantize(&self, input: &Path, output: &Path, params: &QuantizeParams) -> u32;

    //  Context

    fn context_create(&self, model: RawModel, params: &ContextParams) -> Option<RawContext>;
    fn context_free(&self, ctx: RawContext);
    fn context_n_ctx(&self, ctx: RawContext) -> u32;
    /// Returns one of [`decode_status`] (or another engine-specific code).
    fn decode(&self, ctx: RawContext, batch: RawBatch, logits_all: bool) -> i32;
    /// Copy the logits of the last token of the most recent decode into `out`.
    fn copy_logits(&self, ctx: RawContext, out: &mut Vec<f32>) -> bool;

    //  Batch

    fn batch_create(&self, max_tokens: usize) -> Option<RawBatch>;
    fn batch_add(&self, batch: RawBatch, token: i32, pos: i32) -> bool;
    fn batch_clear(&self, batch: RawBatch);
    fn batch_free(&self, batch: RawBatch);

    //  Tokenizer

    /// On failure returns the native status code.
    fn tokenize(
        &self,
        model: RawModel,
        text: &str,
        add_bos: bool,
        add_eos: bool,
    ) -> std::result::Result<Vec<i32>, i32>;
    fn detokenize(&self, model: RawModel, tokens: &[i32]) -> Option<String>;
    fn token_text(&self, model: RawModel, token: i32) -> String;
    fn vocab_size(&self, model: RawModel) -> usize;
    fn special_token(&self, model: RawModel, kind: SpecialToken) -> Option<i32>;
}
