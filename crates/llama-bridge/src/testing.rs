//! In-memory [`Engine`] for tests.
//!
//! `FakeEngine` stands in for the native library: a byte-level tokenizer, a
//! "next byte" language model, and strict bookkeeping of every handle it
//! hands out. Misuse the binding layer must make impossible (double free,
//! freeing a model before its contexts, touching a freed handle) panics.
//!
//! Vocabulary: `0` = PAD, `1` = BOS, `2` = EOS, byte `b` = `b + 3` (259 ids).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::backend::NumaStrategy;
use crate::context::ContextParams;
use crate::engine::{Engine, LogLevel, LogSink, RawBatch, RawContext, RawModel, decode_status};
use crate::model::{ModelParams, QuantizeParams};
use crate::tokenizer::SpecialToken;

pub const PAD: i32 = 0;
pub const BOS: i32 = 1;
pub const EOS: i32 = 2;
pub const VOCAB_SIZE: usize = 259;

/// Token id of a single byte.
pub fn byte_token(b: u8) -> i32 {
    i32::from(b) + 3
}

/// Logit given to the predicted next token; every other entry is 0.
pub const PEAK_LOGIT: f32 = 10.0;

/// Native calls recorded by the fake, in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeEvent {
    BackendInit,
    BackendFree,
    ModelLoad,
    ModelFree,
    ContextCreate,
    ContextFree,
    BatchCreate,
    BatchFree,
    Decode,
}

struct FakeModel {
    paths: Vec<PathBuf>,
    vocab_only: bool,
}

struct FakeContext {
    model: usize,
    n_ctx: u32,
    logits: Option<Vec<f32>>,
}

struct FakeBatch {
    capacity: usize,
    entries: Vec<(i32, i32)>,
}

#[derive(Default)]
struct State {
    init_calls: usize,
    initialized: bool,
    numa: Option<NumaStrategy>,
    events: Vec<NativeEvent>,
    models: HashMap<usize, FakeModel>,
    contexts: HashMap<usize, FakeContext>,
    batches: HashMap<usize, FakeBatch>,

    fail_init: Option<String>,
    fail_load: bool,
    fail_context: bool,
    fail_save: bool,
    next_decode_code: Option<i32>,
    quantize_code: u32,
    batch_adds_before_failure: Option<usize>,
}

pub struct FakeEngine {
    state: Mutex<State>,
    sink: Mutex<Option<LogSink>>,
    next_handle: AtomicUsize,
    started: Instant,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            sink: Mutex::default(),
            next_handle: AtomicUsize::new(1),
            started: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mint(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    //  Failure injection

    /// Make every `init` fail with `reason`.
    pub fn fail_init(&self, reason: &str) {
        self.state().fail_init = Some(reason.to_string());
    }

    pub fn fail_load(&self, fail: bool) {
        self.state().fail_load = fail;
    }

    pub fn fail_context_create(&self, fail: bool) {
        self.state().fail_context = fail;
    }

    pub fn fail_save(&self, fail: bool) {
        self.state().fail_save = fail;
    }

    /// The next `decode` returns `code` without touching the context.
    pub fn fail_next_decode(&self, code: i32) {
        self.state().next_decode_code = Some(code);
    }

    /// `model_quantize` returns `code` (0 restores success).
    pub fn set_quantize_code(&self, code: u32) {
        self.state().quantize_code = code;
    }

    /// Allow `n` more successful `batch_add` calls, then fail one.
    pub fn fail_batch_add_after(&self, n: usize) {
        self.state().batch_adds_before_failure = Some(n);
    }

    //  Inspection

    pub fn init_calls(&self) -> usize {
        self.state().init_calls
    }

    pub fn events(&self) -> Vec<NativeEvent> {
        self.state().events.clone()
    }

    pub fn count(&self, event: NativeEvent) -> usize {
        self.state().events.iter().filter(|e| **e == event).count()
    }

    pub fn live_models(&self) -> usize {
        self.state().models.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    pub fn live_batches(&self) -> usize {
        self.state().batches.len()
    }

    pub fn numa(&self) -> Option<NumaStrategy> {
        self.state().numa
    }

    /// Files the model with this handle was loaded from.
    pub fn model_paths(&self, model: RawModel) -> Vec<PathBuf> {
        self.state()
            .models
            .get(&model.addr())
            .map(|m| m.paths.clone())
            .unwrap_or_default()
    }

    /// Entries currently in the native batch buffer.
    pub fn batch_entries(&self, batch: RawBatch) -> Vec<(i32, i32)> {
        self.state()
            .batches
            .get(&batch.addr())
            .map(|b| b.entries.clone())
            .unwrap_or_default()
    }

    /// Deliver a log line to the installed sink, as the native library would.
    pub fn emit_log(&self, level: LogLevel, msg: &str) {
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink(level, msg);
        }
    }

    /// The token the fake model predicts after `token`.
    pub fn next_token(token: i32) -> i32 {
        match token {
            t if t == byte_token(b'.') => EOS,
            t if t >= byte_token(0) && t < byte_token(u8::MAX) => t + 1,
            _ => byte_token(b'a'),
        }
    }

    fn assert_model(state: &State, model: RawModel) {
        assert!(
            state.models.contains_key(&model.addr()),
            "use of freed or unknown model handle {model:?}"
        );
    }
}

impl Engine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    //  Backend

    fn init(&self) -> Result<(), String> {
        let mut state = self.state();
        state.init_calls += 1;
        if let Some(reason) = &state.fail_init {
            return Err(reason.clone());
        }
        assert!(!state.initialized, "backend initialized twice");
        state.initialized = true;
        state.events.push(NativeEvent::BackendInit);
        Ok(())
    }

    fn free(&self) {
        let mut state = self.state();
        assert!(state.initialized, "backend freed while not initialized");
        assert!(state.models.is_empty(), "backend freed with live models");
        state.initialized = false;
        state.events.push(NativeEvent::BackendFree);
    }

    fn numa_init(&self, strategy: NumaStrategy) {
        self.state().numa = Some(strategy);
    }

    fn time_us(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_micros()).unwrap_or(i64::MAX)
    }

    fn max_devices(&self) -> usize {
        1
    }

    fn supports_mmap(&self) -> bool {
        true
    }

    fn supports_mlock(&self) -> bool {
        true
    }

    fn supports_gpu_offload(&self) -> bool {
        false
    }

    fn supports_rpc(&self) -> bool {
        false
    }

    fn system_info(&self) -> String {
        "fake engine | CPU = 1".to_string()
    }

    fn set_log_sink(&self, sink: Option<LogSink>) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    //  Model

    fn model_load(&self, paths: &[&Path], params: &ModelParams) -> Option<RawModel> {
        let id = self.mint();
        let mut state = self.state();
        assert!(state.initialized, "model loaded before backend init");
        if state.fail_load {
            return None;
        }
        state.models.insert(
            id,
            FakeModel {
                paths: paths.iter().map(|p| p.to_path_buf()).collect(),
                vocab_only: params.vocab_only,
            },
        );
        state.events.push(NativeEvent::ModelLoad);
        RawModel::from_addr(id)
    }

    fn model_free(&self, model: RawModel) {
        let mut state = self.state();
        assert!(
            !state.contexts.values().any(|c| c.model == model.addr()),
            "model freed before its contexts"
        );
        assert!(
            state.models.remove(&model.addr()).is_some(),
            "double free of model {model:?}"
        );
        state.events.push(NativeEvent::ModelFree);
    }

    fn model_n_params(&self, _model: RawModel) -> u64 {
        (VOCAB_SIZE * VOCAB_SIZE) as u64
    }

    fn model_size(&self, _model: RawModel) -> u64 {
        (VOCAB_SIZE * VOCAB_SIZE * 4) as u64
    }

    fn model_n_ctx_train(&self, _model: RawModel) -> i32 {
        2048
    }

    fn model_n_embd(&self, _model: RawModel) -> i32 {
        16
    }

    fn model_n_layer(&self, _model: RawModel) -> i32 {
        2
    }

    fn model_n_head(&self, _model: RawModel) -> i32 {
        4
    }

    fn model_n_head_kv(&self, _model: RawModel) -> i32 {
        4
    }

    fn model_rope_freq_scale_train(&self, _model: RawModel) -> f32 {
        1.0
    }

    fn model_rope_type(&self, _model: RawModel) -> i32 {
        0
    }

    fn model_meta_count(&self, model: RawModel) -> usize {
        Self::assert_model(&self.state(), model);
        2
    }

    fn model_meta_key(&self, _model: RawModel, index: usize) -> Option<String> {
        ["general.architecture", "general.name"]
            .get(index)
            .map(|k| k.to_string())
    }

    fn model_meta_val(&self, _model: RawModel, key: &str) -> Option<String> {
        match key {
            "general.architecture" => Some("fake".to_string()),
            "general.name" => Some("fake byte model".to_string()),
            _ => None,
        }
    }

    fn model_desc(&self, _model: RawModel) -> String {
        "fake 259-token byte model".to_string()
    }

    fn model_chat_template(&self, _model: RawModel) -> Option<String> {
        None
    }

    fn model_has_encoder(&self, _model: RawModel) -> bool {
        false
    }

    fn model_has_decoder(&self, _model: RawModel) -> bool {
        true
    }

    fn model_decoder_start_token(&self, _model: RawModel) -> Option<i32> {
        None
    }

    fn model_is_recurrent(&self, _model: RawModel) -> bool {
        false
    }

    fn model_save(&self, model: RawModel, path: &Path) -> bool {
        let state = self.state();
        Self::assert_model(&state, model);
        !state.fail_save && std::fs::write(path, b"GGUF fake").is_ok()
    }

    fn model_quantize(&self, input: &Path, output: &Path, _params: &QuantizeParams) -> u32 {
        let code = self.state().quantize_code;
        if code != 0 {
            return code;
        }
        match std::fs::copy(input, output) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    }

    //  Context

    fn context_create(&self, model: RawModel, params: &ContextParams) -> Option<RawContext> {
        let id = self.mint();
        let mut state = self.state();
        Self::assert_model(&state, model);
        if state.fail_context || state.models[&model.addr()].vocab_only {
            return None;
        }
        state.contexts.insert(
            id,
            FakeContext {
                model: model.addr(),
                n_ctx: params.n_ctx,
                logits: None,
            },
        );
        state.events.push(NativeEvent::ContextCreate);
        RawContext::from_addr(id)
    }

    fn context_free(&self, ctx: RawContext) {
        let mut state = self.state();
        assert!(
            state.contexts.remove(&ctx.addr()).is_some(),
            "double free of context {ctx:?}"
        );
        state.events.push(NativeEvent::ContextFree);
    }

    fn context_n_ctx(&self, ctx: RawContext) -> u32 {
        self.state()
            .contexts
            .get(&ctx.addr())
            .map(|c| c.n_ctx)
            .expect("use of freed context handle")
    }

    fn decode(&self, ctx: RawContext, batch: RawBatch, _logits_all: bool) -> i32 {
        let mut state = self.state();
        state.events.push(NativeEvent::Decode);
        if let Some(code) = state.next_decode_code.take() {
            return code;
        }
        let entries = state
            .batches
            .get(&batch.addr())
            .map(|b| b.entries.clone())
            .expect("decode with freed batch handle");
        let context = state
            .contexts
            .get_mut(&ctx.addr())
            .expect("decode with freed context handle");

        let Some(&(last, _)) = entries.last() else {
            return decode_status::INVALID_INPUT;
        };
        if entries
            .iter()
            .any(|&(_, pos)| pos < 0 || pos as u32 >= context.n_ctx)
        {
            return decode_status::NO_KV_SLOT;
        }

        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[Self::next_token(last) as usize] = PEAK_LOGIT;
        context.logits = Some(logits);
        decode_status::OK
    }

    fn copy_logits(&self, ctx: RawContext, out: &mut Vec<f32>) -> bool {
        let state = self.state();
        match state.contexts.get(&ctx.addr()).and_then(|c| c.logits.as_ref()) {
            Some(logits) => {
                out.clear();
                out.extend_from_slice(logits);
                true
            }
            None => false,
        }
    }

    //  Batch

    fn batch_create(&self, max_tokens: usize) -> Option<RawBatch> {
        let id = self.mint();
        let mut state = self.state();
        state.batches.insert(
            id,
            FakeBatch {
                capacity: max_tokens,
                entries: Vec::with_capacity(max_tokens),
            },
        );
        state.events.push(NativeEvent::BatchCreate);
        RawBatch::from_addr(id)
    }

    fn batch_add(&self, batch: RawBatch, token: i32, pos: i32) -> bool {
        let mut state = self.state();
        match state.batch_adds_before_failure {
            Some(0) => {
                state.batch_adds_before_failure = None;
                return false;
            }
            Some(n) => state.batch_adds_before_failure = Some(n - 1),
            None => {}
        }
        let batch = state
            .batches
            .get_mut(&batch.addr())
            .expect("batch_add on freed batch handle");
        if batch.entries.len() >= batch.capacity {
            return false;
        }
        batch.entries.push((token, pos));
        true
    }

    fn batch_clear(&self, batch: RawBatch) {
        if let Some(batch) = self.state().batches.get_mut(&batch.addr()) {
            batch.entries.clear();
        }
    }

    fn batch_free(&self, batch: RawBatch) {
        let mut state = self.state();
        assert!(
            state.batches.remove(&batch.addr()).is_some(),
            "double free of batch {batch:?}"
        );
        state.events.push(NativeEvent::BatchFree);
    }

    //  Tokenizer

    /// Text containing a NUL byte is rejected with status -1.
    fn tokenize(
        &self,
        model: RawModel,
        text: &str,
        add_bos: bool,
        add_eos: bool,
    ) -> Result<Vec<i32>, i32> {
        Self::assert_model(&self.state(), model);
        if text.as_bytes().contains(&0) {
            return Err(-1);
        }
        let mut tokens = Vec::with_capacity(text.len() + 2);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(byte_token));
        if add_eos {
            tokens.push(EOS);
        }
        Ok(tokens)
    }

    fn detokenize(&self, model: RawModel, tokens: &[i32]) -> Option<String> {
        Self::assert_model(&self.state(), model);
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| u8::try_from(t - 3).ok())
            .collect();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn token_text(&self, _model: RawModel, token: i32) -> String {
        match token {
            PAD => "<pad>".to_string(),
            BOS => "<s>".to_string(),
            EOS => "</s>".to_string(),
            t => u8::try_from(t - 3)
                .map(|b| String::from_utf8_lossy(&[b]).into_owned())
                .unwrap_or_default(),
        }
    }

    fn vocab_size(&self, _model: RawModel) -> usize {
        VOCAB_SIZE
    }

    fn special_token(&self, _model: RawModel, kind: SpecialToken) -> Option<i32> {
        match kind {
            SpecialToken::Bos => Some(BOS),
            SpecialToken::Eos => Some(EOS),
            SpecialToken::Pad => Some(PAD),
            SpecialToken::Nl => Some(byte_token(b'\n')),
            SpecialToken::Eot | SpecialToken::Sep => None,
        }
    }
}

/// A fake engine with an initialized backend and a placeholder model file.
#[cfg(test)]
pub(crate) struct Fixture {
    pub engine: std::sync::Arc<FakeEngine>,
    pub backend: crate::backend::Backend,
    pub model_file: tempfile::NamedTempFile,
}

#[cfg(test)]
impl Fixture {
    pub fn new() -> Self {
        use std::io::Write;

        let engine = std::sync::Arc::new(FakeEngine::new());
        let backend = crate::backend::Backend::new(engine.clone());
        backend.initialize().unwrap();
        let mut model_file = tempfile::NamedTempFile::new().unwrap();
        model_file.write_all(b"GGUF fake").unwrap();
        Self {
            engine,
            backend,
            model_file,
        }
    }

    pub fn manager(&self) -> crate::manager::ModelManager {
        crate::manager::ModelManager::new(&self.backend)
    }

    pub fn load_model(&self, params: ModelParams) -> crate::model::Model {
        self.manager().load(self.model_file.path(), &params).unwrap()
    }

    pub fn context(&self, model: &crate::model::Model, n_ctx: u32) -> crate::context::Context {
        let params = ContextParams {
            n_ctx,
            ..ContextParams::default()
        };
        model.create_context(&params).unwrap()
    }
}
