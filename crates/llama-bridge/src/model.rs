//! Loaded models, their cached metadata, and load/quantize parameters.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::NativeBackend;
use crate::context::{Context, ContextParams};
use crate::engine::{Engine, RawModel};
use crate::error::{BridgeError, Entity, Result};
use crate::tokenizer::Tokenizer;

/// Owns a native model handle; frees it exactly once on drop.
///
/// Contexts hold strong references, so the native free never runs before
/// the native contexts derived from it are gone.
pub(crate) struct NativeModel {
    raw: RawModel,
    engine: Arc<dyn Engine>,
    backend: Arc<NativeBackend>,
}

impl NativeModel {
    pub(crate) fn raw(&self) -> RawModel {
        self.raw
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn backend(&self) -> &Arc<NativeBackend> {
        &self.backend
    }
}

impl Drop for NativeModel {
    fn drop(&mut self) {
        debug!("Freeing native model");
        self.engine.model_free(self.raw);
    }
}

/// A dependent's view of a model: keeps the native handle alive and observes
/// whether the owning [`Model`] was released.
#[derive(Clone)]
pub(crate) struct ModelLink {
    native: Arc<NativeModel>,
    live: Arc<AtomicBool>,
}

impl ModelLink {
    pub(crate) fn get(&self) -> Result<&NativeModel> {
        if self.live.load(Ordering::Acquire) {
            Ok(&self.native)
        } else {
            Err(BridgeError::released(Entity::Model))
        }
    }

    /// The native model regardless of logical release, for freeing
    /// dependents.
    pub(crate) fn native(&self) -> &NativeModel {
        &self.native
    }
}

/// A loaded model.
///
/// Released explicitly with [`Model::release`] or on drop. A Model does not
/// track the Contexts created from it: releasing it invalidates them (they
/// fail with `UseAfterRelease`), while the native memory they still reference
/// is freed only after the last of them is released.
pub struct Model {
    native: Option<Arc<NativeModel>>,
    live: Arc<AtomicBool>,
    info: ModelInfo,
    path: PathBuf,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.path)
            .field("released", &self.is_released())
            .finish()
    }
}

impl Model {
    pub(crate) fn from_native(
        raw: RawModel,
        engine: Arc<dyn Engine>,
        backend: Arc<NativeBackend>,
        path: PathBuf,
        overrides: HashMap<String, String>,
    ) -> Self {
        let info = ModelInfo::query(engine.as_ref(), raw, overrides);
        Self {
            native: Some(Arc::new(NativeModel {
                raw,
                engine,
                backend,
            })),
            live: Arc::new(AtomicBool::new(true)),
            info,
            path,
        }
    }

    fn native(&self) -> Result<&Arc<NativeModel>> {
        self.native
            .as_ref()
            .ok_or(BridgeError::released(Entity::Model))
    }

    pub(crate) fn raw(&self) -> Result<RawModel> {
        Ok(self.native()?.raw)
    }

    pub(crate) fn engine(&self) -> Result<&Arc<dyn Engine>> {
        Ok(&self.native()?.engine)
    }

    pub(crate) fn link(&self) -> Result<ModelLink> {
        Ok(ModelLink {
            native: Arc::clone(self.native()?),
            live: Arc::clone(&self.live),
        })
    }

    //  Accessors

    pub fn info(&self) -> Result<&ModelInfo> {
        self.native()?;
        Ok(&self.info)
    }

    pub fn tokenizer(&self) -> Result<Tokenizer> {
        let native = self.native()?;
        Ok(Tokenizer::new(Arc::downgrade(native), Arc::clone(&self.live)))
    }

    /// Path of the (first) file this model was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_released(&self) -> bool {
        self.native.is_none()
    }

    /// Create an inference context; shorthand for [`Context::new`].
    pub fn create_context(&self, params: &ContextParams) -> Result<Context> {
        Context::new(self, params)
    }

    //  Release

    /// Release the model (idempotent).
    pub fn release(&mut self) {
        let Some(native) = self.native.take() else {
            return;
        };
        self.live.store(false, Ordering::Release);
        let dependents = Arc::strong_count(&native) - 1;
        if dependents > 0 {
            debug!(
                dependents,
                "Model released with live contexts; native free deferred"
            );
        }
        drop(native);
        debug!(path = %self.path.display(), "Model released");
    }
}

impl Drop for Model {
    fn drop(&mut self) {
        self.release();
    }
}

/// Tokenizers hold only a weak reference to the native model.
pub(crate) type WeakModel = Weak<NativeModel>;

//  ModelParams

/// Parameters for loading a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Use memory-mapped I/O.
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    /// Lock model memory (prevent swapping).
    #[serde(default)]
    pub use_mlock: bool,
    /// Layers to offload to GPU. `i32::MAX` offloads everything.
    #[serde(default)]
    pub n_gpu_layers: i32,
    /// Load only the vocabulary, no weights.
    #[serde(default)]
    pub vocab_only: bool,
    /// Metadata values reported instead of the file's own.
    #[serde(default)]
    pub metadata_overrides: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_mmap: true,
            use_mlock: false,
            n_gpu_layers: 0,
            vocab_only: false,
            metadata_overrides: HashMap::new(),
        }
    }
}

impl ModelParams {
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_overrides.insert(key.into(), value.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.n_gpu_layers < 0 {
            return Err(BridgeError::invalid(format!(
                "n_gpu_layers must not be negative (got {})",
                self.n_gpu_layers
            )));
        }
        if self.metadata_overrides.keys().any(|k| k.is_empty()) {
            return Err(BridgeError::invalid("metadata override keys must not be empty"));
        }
        Ok(())
    }
}

//  QuantizeParams

/// Target tensor type for quantization (llama.cpp `llama_ftype` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q2K,
    Q3KM,
    Q4KS,
    Q4KM,
    Q5KS,
    Q5KM,
    Q6K,
}

impl QuantType {
    pub fn as_raw(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q8_0 => 7,
            Self::Q5_0 => 8,
            Self::Q5_1 => 9,
            Self::Q2K => 10,
            Self::Q3KM => 12,
            Self::Q4KS => 14,
            Self::Q4KM => 15,
            Self::Q5KS => 16,
            Self::Q5KM => 17,
            Self::Q6K => 18,
        }
    }
}

impl FromStr for QuantType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let ty = match s.to_ascii_lowercase().as_str() {
            "f32" => Self::F32,
            "f16" => Self::F16,
            "q4_0" => Self::Q4_0,
            "q4_1" => Self::Q4_1,
            "q5_0" => Self::Q5_0,
            "q5_1" => Self::Q5_1,
            "q8_0" => Self::Q8_0,
            "q2_k" => Self::Q2K,
            "q3_k_m" => Self::Q3KM,
            "q4_k_s" => Self::Q4KS,
            "q4_k_m" => Self::Q4KM,
            "q5_k_s" => Self::Q5KS,
            "q5_k_m" => Self::Q5KM,
            "q6_k" => Self::Q6K,
            other => {
                return Err(BridgeError::invalid(format!(
                    "unknown quantization type '{other}'"
                )));
            }
        };
        Ok(ty)
    }
}

/// Parameters for [`ModelManager::quantize`](crate::ModelManager::quantize).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizeParams {
    #[serde(default = "default_ftype")]
    pub ftype: QuantType,
    /// Worker threads; 0 lets the engine decide.
    #[serde(default = "default_quantize_threads")]
    pub n_threads: u32,
    /// Allow re-quantizing tensors that are already quantized.
    #[serde(default)]
    pub allow_requantize: bool,
    #[serde(default = "default_true")]
    pub quantize_output_tensor: bool,
    /// Copy tensors without quantizing.
    #[serde(default)]
    pub only_copy: bool,
}

fn default_ftype() -> QuantType {
    QuantType::Q4_0
}
fn default_quantize_threads() -> u32 {
    4
}

impl Default for QuantizeParams {
    fn default() -> Self {
        Self {
            ftype: default_ftype(),
            n_threads: default_quantize_threads(),
            allow_requantize: false,
            quantize_output_tensor: true,
            only_copy: false,
        }
    }
}

//  ModelInfo

/// Immutable model metadata, read once at load time.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    parameter_count: u64,
    context_size: i32,
    embedding_size: i32,
    layer_count: i32,
    head_count: i32,
    kv_head_count: i32,
    rope_freq_scale_train: f32,
    rope_type: i32,
    metadata: HashMap<String, String>,
    overrides: HashMap<String, String>,
    description: String,
    size: u64,
    chat_template: Option<String>,
    has_encoder: bool,
    has_decoder: bool,
    decoder_start_token: Option<i32>,
    recurrent: bool,
    vocab_size: usize,
}

impl ModelInfo {
    fn query(engine: &dyn Engine, raw: RawModel, overrides: HashMap<String, String>) -> Self {
        let metadata = (0..engine.model_meta_count(raw))
            .filter_map(|i| engine.model_meta_key(raw, i))
            .filter_map(|key| engine.model_meta_val(raw, &key).map(|val| (key, val)))
            .collect();

        Self {
            parameter_count: engine.model_n_params(raw),
            context_size: engine.model_n_ctx_train(raw),
            embedding_size: engine.model_n_embd(raw),
            layer_count: engine.model_n_layer(raw),
            head_count: engine.model_n_head(raw),
            kv_head_count: engine.model_n_head_kv(raw),
            rope_freq_scale_train: engine.model_rope_freq_scale_train(raw),
            rope_type: engine.model_rope_type(raw),
            metadata,
            overrides,
            description: engine.model_desc(raw),
            size: engine.model_size(raw),
            chat_template: engine.model_chat_template(raw),
            has_encoder: engine.model_has_encoder(raw),
            has_decoder: engine.model_has_decoder(raw),
            decoder_start_token: engine.model_decoder_start_token(raw),
            recurrent: engine.model_is_recurrent(raw),
            vocab_size: engine.vocab_size(raw),
        }
    }

    pub fn parameter_count(&self) -> u64 {
        self.parameter_count
    }
    /// Context size used during training.
    pub fn context_size(&self) -> i32 {
        self.context_size
    }
    pub fn embedding_size(&self) -> i32 {
        self.embedding_size
    }
    pub fn layer_count(&self) -> i32 {
        self.layer_count
    }
    pub fn head_count(&self) -> i32 {
        self.head_count
    }
    pub fn kv_head_count(&self) -> i32 {
        self.kv_head_count
    }
    pub fn rope_freq_scale_train(&self) -> f32 {
        self.rope_freq_scale_train
    }
    pub fn rope_type(&self) -> i32 {
        self.rope_type
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    /// Total size of all tensors in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }
    pub fn has_encoder(&self) -> bool {
        self.has_encoder
    }
    pub fn has_decoder(&self) -> bool {
        self.has_decoder
    }
    pub fn decoder_start_token(&self) -> Option<i32> {
        self.decoder_start_token
    }
    pub fn is_recurrent(&self) -> bool {
        self.recurrent
    }
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Override value if present, else the value stored in the model file.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.overrides
            .get(key)
            .or_else(|| self.metadata.get(key))
            .map(String::as_str)
    }

    /// Union of override and native keys, in no particular order.
    pub fn metadata_keys(&self) -> HashSet<&str> {
        self.overrides
            .keys()
            .chain(self.metadata.keys())
            .map(String::as_str)
            .collect()
    }

    fn merged_metadata(&self) -> HashMap<&str, &str> {
        self.metadata_keys()
            .into_iter()
            .filter_map(|k| self.metadata(k).map(|v| (k, v)))
            .collect()
    }
}

impl Serialize for ModelInfo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct View<'a> {
            description: &'a str,
            parameter_count: u64,
            size: u64,
            context_size: i32,
            embedding_size: i32,
            layer_count: i32,
            head_count: i32,
            kv_head_count: i32,
            rope_freq_scale_train: f32,
            rope_type: i32,
            vocab_size: usize,
            has_encoder: bool,
            has_decoder: bool,
            decoder_start_token: Option<i32>,
            recurrent: bool,
            chat_template: Option<&'a str>,
            metadata: HashMap<&'a str, &'a str>,
        }

        View {
            description: &self.description,
            parameter_count: self.parameter_count,
            size: self.size,
            context_size: self.context_size,
            embedding_size: self.embedding_size,
            layer_count: self.layer_count,
            head_count: self.head_count,
            kv_head_count: self.kv_head_count,
            rope_freq_scale_train: self.rope_freq_scale_train,
            rope_type: self.rope_type,
            vocab_size: self.vocab_size,
            has_encoder: self.has_encoder,
            has_decoder: self.has_decoder,
            decoder_start_token: self.decoder_start_token,
            recurrent: self.recurrent,
            chat_template: self.chat_template.as_deref(),
            metadata: self.merged_metadata(),
        }
        .serialize(serializer)
    }
}
