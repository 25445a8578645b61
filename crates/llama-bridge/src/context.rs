//! Inference contexts: decode batches and hold the latest logits.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::engine::{RawContext, decode_status};
use crate::error::{BridgeError, Entity, Result};
use crate::model::{Model, ModelLink};
use crate::sampler::{Sampler, SamplerParams};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Context`]; samplers are bound to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Owns a native context handle. Holding the [`ModelLink`] keeps the native
/// model alive until this is dropped.
struct NativeContext {
    raw: RawContext,
    model: ModelLink,
}

impl Drop for NativeContext {
    fn drop(&mut self) {
        debug!("Freeing native context");
        self.model.native().engine().context_free(self.raw);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No batch processed successfully yet.
    Created,
    /// Logits available.
    Ready,
    Released,
}

/// Why the engine rejected a batch. An expected outcome during generation,
/// not a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    #[error("no KV slot available (context full)")]
    NoKvSlot,
    #[error("decode aborted")]
    Aborted,
    #[error("engine rejected the batch as invalid")]
    InvalidInput,
    #[error("decode succeeded but produced no logits")]
    MissingLogits,
    #[error("decode failed with engine code {0}")]
    Internal(i32),
}

impl DecodeFailure {
    fn from_code(code: i32) -> Self {
        match code {
            decode_status::NO_KV_SLOT => Self::NoKvSlot,
            decode_status::ABORTED => Self::Aborted,
            decode_status::INVALID_INPUT => Self::InvalidInput,
            other => Self::Internal(other),
        }
    }
}

/// Outcome of [`Context::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchResult {
    Processed { n_tokens: usize },
    Failed(DecodeFailure),
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }

    pub fn failure(&self) -> Option<DecodeFailure> {
        match self {
            Self::Failed(failure) => Some(*failure),
            Self::Processed { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.failure().map(|f| f.to_string())
    }
}

/// An inference context derived from exactly one [`Model`].
///
/// Not synchronized: calls against one Context must be serialized by the
/// caller, which `&mut self` on [`Context::process`] enforces.
pub struct Context {
    id: ContextId,
    native: Option<NativeContext>,
    params: ContextParams,
    n_ctx: u32,
    n_vocab: usize,
    logits: Option<Vec<f32>>,
    scratch: Vec<f32>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("n_ctx", &self.n_ctx)
            .field("n_vocab", &self.n_vocab)
            .field("state", &self.state())
            .finish()
    }
}

impl Context {
    pub fn new(model: &Model, params: &ContextParams) -> Result<Self> {
        params.validate()?;
        let link = model.link()?;
        let native_model = link.get()?;
        let engine = native_model.engine();

        let raw = engine
            .context_create(native_model.raw(), params)
            .ok_or_else(|| BridgeError::CreateFailure("native context_create returned null".into()))?;
        let n_ctx = engine.context_n_ctx(raw);
        let n_vocab = engine.vocab_size(native_model.raw());
        let id = ContextId::next();

        debug!(%id, n_ctx, n_batch = params.n_batch, n_threads = params.n_threads, "Context created");
        Ok(Self {
            id,
            native: Some(NativeContext { raw, model: link }),
            params: params.clone(),
            n_ctx,
            n_vocab,
            logits: None,
            scratch: Vec::with_capacity(n_vocab),
        })
    }

    fn native(&self) -> Result<&NativeContext> {
        self.native
            .as_ref()
            .ok_or(BridgeError::released(Entity::Context))
    }

    //  Accessors

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Effective context window reported by the engine.
    pub fn n_ctx(&self) -> Result<u32> {
        self.native()?;
        Ok(self.n_ctx)
    }

    pub fn n_vocab(&self) -> Result<usize> {
        self.native()?;
        Ok(self.n_vocab)
    }

    pub fn state(&self) -> ContextState {
        match (&self.native, &self.logits) {
            (None, _) => ContextState::Released,
            (Some(_), None) => ContextState::Created,
            (Some(_), Some(_)) => ContextState::Ready,
        }
    }

    //  Core operations

    /// New empty batch with room for `max_tokens` entries.
    pub fn create_batch(&self, max_tokens: usize) -> Result<Batch> {
        let native = self.native()?;
        let model = native.model.get()?;
        Batch::new(model.engine().clone(), model.backend().clone(), max_tokens)
    }

    /// Submit `batch` to the engine.
    ///
    /// Engine-reported decode failures come back as
    /// [`BatchResult::Failed`] and leave the previous logits untouched.
    pub fn process(&mut self, batch: &Batch) -> Result<BatchResult> {
        // Field access, not `self.native()`, so `scratch` and `logits` stay
        // borrowable below.
        let native = self
            .native
            .as_ref()
            .ok_or(BridgeError::released(Entity::Context))?;
        let model = native.model.get()?;
        let raw_batch = batch.raw()?;
        let n_tokens = batch.token_count()?;
        if n_tokens == 0 {
            return Err(BridgeError::invalid("cannot process an empty batch"));
        }

        let engine = model.engine();
        let code = engine.decode(native.raw, raw_batch, self.params.logits_all);
        if code != decode_status::OK {
            let failure = DecodeFailure::from_code(code);
            debug!(id = %self.id, code, %failure, "Decode failed");
            return Ok(BatchResult::Failed(failure));
        }

        if !engine.copy_logits(native.raw, &mut self.scratch) {
            warn!(id = %self.id, "Decode succeeded without logits");
            return Ok(BatchResult::Failed(DecodeFailure::MissingLogits));
        }
        match &mut self.logits {
            Some(logits) => std::mem::swap(logits, &mut self.scratch),
            None => self.logits = Some(std::mem::take(&mut self.scratch)),
        }
        Ok(BatchResult::Processed { n_tokens })
    }

    /// Logits from the most recent successful [`Context::process`].
    pub fn logits(&self) -> Result<&[f32]> {
        self.native()?;
        self.logits.as_deref().ok_or(BridgeError::NoLogitsAvailable)
    }

    /// New sampler bound to this context.
    pub fn create_sampler(&self, params: &SamplerParams) -> Result<Sampler> {
        let native = self.native()?;
        native.model.get()?;
        Sampler::new(self.id, params.clone())
    }

    //  Release

    /// Release the native context (idempotent). The model is not released.
    pub fn release(&mut self) {
        if self.native.take().is_some() {
            self.logits = None;
            debug!(id = %self.id, "Context released");
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.release();
    }
}

//  ContextParams

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    /// Context window in tokens.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    /// Maximum tokens per decode call.
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,
    #[serde(default = "default_n_threads")]
    pub n_threads: i32,
    /// Compute logits for every token, not only the last.
    #[serde(default)]
    pub logits_all: bool,
}

fn default_n_ctx() -> u32 {
    512
}
fn default_n_batch() -> u32 {
    512
}
fn default_n_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| i32::try_from(n.get()).unwrap_or(4))
        .unwrap_or(4)
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_threads: default_n_threads(),
            logits_all: false,
        }
    }
}

impl ContextParams {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(BridgeError::invalid("n_ctx must be positive"));
        }
        if self.n_batch == 0 {
            return Err(BridgeError::invalid("n_batch must be positive"));
        }
        if self.n_threads <= 0 {
            return Err(BridgeError::invalid(format!(
                "n_threads must be positive (got {})",
                self.n_threads
            )));
        }
        Ok(())
    }
}
