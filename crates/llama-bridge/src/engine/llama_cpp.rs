//! [`Engine`] adapter over the llama.cpp C API.

use std::collections::HashMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::warn;

use super::{Engine, LogLevel, LogSink, RawBatch, RawContext, RawModel};
use crate::backend::NumaStrategy;
use crate::context::ContextParams;
use crate::model::{ModelParams, QuantizeParams};
use crate::tokenizer::SpecialToken;

const TOKEN_NULL: i32 = -1;

/// The installed sink. llama.cpp keeps one global callback, so this is
/// process-wide as well.
static LOG_SINK: RwLock<Option<LogSink>> = RwLock::new(None);

unsafe extern "C" fn log_trampoline(
    level: llama_sys::ggml_log_level,
    text: *const c_char,
    _user_data: *mut c_void,
) {
    if text.is_null() {
        return;
    }
    // Call the sink outside the lock so it may replace itself.
    let sink = match LOG_SINK.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return,
    };
    let Some(sink) = sink else {
        return;
    };
    let msg = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    // ggml_log_level: DEBUG=1, INFO=2, WARN=3, ERROR=4
    let level = match level {
        4 => LogLevel::Error,
        3 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    };
    sink(level, &msg);
}

/// A `llama_batch` plus the capacity it was allocated with.
struct BatchSlot {
    inner: llama_sys::llama_batch,
    capacity: i32,
}

// Safety: the batch buffers are only touched while holding the slot mutex.
unsafe impl Send for BatchSlot {}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        unsafe { llama_sys::llama_batch_free(self.inner) }
    }
}

type SharedSlot = Arc<Mutex<BatchSlot>>;

/// Engine backed by a statically linked llama.cpp.
///
/// Model and context handles are the native pointers. `llama_batch` is a
/// by-value struct, so batches live in a slot table keyed by a counter. The
/// table lock is held only to look a slot up; each slot has its own lock.
pub struct LlamaCppEngine {
    batches: Mutex<HashMap<usize, SharedSlot>>,
    next_batch: AtomicUsize,
}

impl Default for LlamaCppEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LlamaCppEngine {
    pub fn new() -> Self {
        Self {
            batches: Mutex::default(),
            next_batch: AtomicUsize::new(1),
        }
    }

    fn batches(&self) -> MutexGuard<'_, HashMap<usize, SharedSlot>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, batch: RawBatch) -> Option<SharedSlot> {
        self.batches().get(&batch.addr()).cloned()
    }

    fn model_ptr(model: RawModel) -> *mut llama_sys::llama_model {
        model.addr() as *mut llama_sys::llama_model
    }

    fn ctx_ptr(ctx: RawContext) -> *mut llama_sys::llama_context {
        ctx.addr() as *mut llama_sys::llama_context
    }

    fn vocab(model: RawModel) -> *const llama_sys::llama_vocab {
        unsafe { llama_sys::llama_model_get_vocab(Self::model_ptr(model)) }
    }

    fn c_path(path: &Path) -> Option<CString> {
        let Some(s) = path.to_str() else {
            warn!(path = %path.display(), "Path is not valid UTF-8");
            return None;
        };
        CString::new(s).ok()
    }
}

fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, BatchSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove a stale file at `path` so a failed save cannot pass for a
/// successful one. False if the path exists and cannot be removed.
fn clear_target(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot replace existing file");
            false
        }
    }
}

/// Read a NUL-terminated string written into a buffer by a native call that
/// returns the string length (or a negative value on failure).
fn read_buf(len: i32, buf: Vec<u8>) -> Option<String> {
    let len = usize::try_from(len).ok()?;
    let mut buf = buf;
    buf.truncate(len.min(buf.len()));
    Some(String::from_utf8_lossy(&buf).into_owned())
}

impl Engine for LlamaCppEngine {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    //  Backend

    fn init(&self) -> Result<(), String> {
        unsafe { llama_sys::llama_backend_init() };
        Ok(())
    }

    fn free(&self) {
        unsafe { llama_sys::llama_backend_free() }
    }

    fn numa_init(&self, strategy: NumaStrategy) {
        unsafe { llama_sys::llama_numa_init(strategy.as_raw() as _) }
    }

    fn time_us(&self) -> i64 {
        unsafe { llama_sys::llama_time_us() }
    }

    fn max_devices(&self) -> usize {
        unsafe { llama_sys::llama_max_devices() }
    }

    fn supports_mmap(&self) -> bool {
        unsafe { llama_sys::llama_supports_mmap() }
    }

    fn supports_mlock(&self) -> bool {
        unsafe { llama_sys::llama_supports_mlock() }
    }

    fn supports_gpu_offload(&self) -> bool {
        unsafe { llama_sys::llama_supports_gpu_offload() }
    }

    fn supports_rpc(&self) -> bool {
        unsafe { llama_sys::llama_supports_rpc() }
    }

    fn system_info(&self) -> String {
        unsafe {
            CStr::from_ptr(llama_sys::llama_print_system_info())
                .to_string_lossy()
                .into_owned()
        }
    }

    fn set_log_sink(&self, sink: Option<LogSink>) {
        let install = sink.is_some();
        *LOG_SINK.write().unwrap_or_else(PoisonError::into_inner) = sink;
        unsafe {
            if install {
                llama_sys::llama_log_set(Some(log_trampoline), ptr::null_mut());
            } else {
                llama_sys::llama_log_set(None, ptr::null_mut());
            }
        }
    }

    //  Model

    fn model_load(&self, paths: &[&Path], params: &ModelParams) -> Option<RawModel> {
        let c_paths = paths
            .iter()
            .map(|p| Self::c_path(p))
            .collect::<Option<Vec<CString>>>()?;

        let mut raw = unsafe { llama_sys::llama_model_default_params() };
        raw.n_gpu_layers = params.n_gpu_layers;
        raw.use_mmap = params.use_mmap;
        raw.use_mlock = params.use_mlock;
        raw.vocab_only = params.vocab_only;

        let model = unsafe {
            if let [single] = c_paths.as_slice() {
                llama_sys::llama_model_load_from_file(single.as_ptr(), raw)
            } else {
                let mut ptrs: Vec<*const c_char> = c_paths.iter().map(|c| c.as_ptr()).collect();
                llama_sys::llama_model_load_from_splits(ptrs.as_mut_ptr(), ptrs.len(), raw)
            }
        };
        RawModel::from_addr(model as usize)
    }

    fn model_free(&self, model: RawModel) {
        unsafe { llama_sys::llama_model_free(Self::model_ptr(model)) }
    }

    fn model_n_params(&self, model: RawModel) -> u64 {
        unsafe { llama_sys::llama_model_n_params(Self::model_ptr(model)) }
    }

    fn model_size(&self, model: RawModel) -> u64 {
        unsafe { llama_sys::llama_model_size(Self::model_ptr(model)) }
    }

    fn model_n_ctx_train(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_n_ctx_train(Self::model_ptr(model)) }
    }

    fn model_n_embd(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_n_embd(Self::model_ptr(model)) }
    }

    fn model_n_layer(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_n_layer(Self::model_ptr(model)) }
    }

    fn model_n_head(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_n_head(Self::model_ptr(model)) }
    }

    fn model_n_head_kv(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_n_head_kv(Self::model_ptr(model)) }
    }

    fn model_rope_freq_scale_train(&self, model: RawModel) -> f32 {
        unsafe { llama_sys::llama_model_rope_freq_scale_train(Self::model_ptr(model)) }
    }

    fn model_rope_type(&self, model: RawModel) -> i32 {
        unsafe { llama_sys::llama_model_rope_type(Self::model_ptr(model)) as i32 }
    }

    fn model_meta_count(&self, model: RawModel) -> usize {
        let n = unsafe { llama_sys::llama_model_meta_count(Self::model_ptr(model)) };
        usize::try_from(n).unwrap_or(0)
    }

    fn model_meta_key(&self, model: RawModel, index: usize) -> Option<String> {
        let index = i32::try_from(index).ok()?;
        let mut buf = vec![0u8; 256];
        let len = unsafe {
            llama_sys::llama_model_meta_key_by_index(
                Self::model_ptr(model),
                index,
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        };
        read_buf(len, buf)
    }

    fn model_meta_val(&self, model: RawModel, key: &str) -> Option<String> {
        let c_key = CString::new(key).ok()?;
        let mut buf = vec![0u8; 512];
        let len = unsafe {
            llama_sys::llama_model_meta_val_str(
                Self::model_ptr(model),
                c_key.as_ptr(),
                buf.as_mut_ptr() as *mut c_char,
                buf.len(),
            )
        };
        if usize::try_from(len).is_ok_and(|n| n >= buf.len()) {
            // Truncated: retry with the exact size.
            buf = vec![0u8; len as usize + 1];
            let len = unsafe {
                llama_sys::llama_model_meta_val_str(
                    Self::model_ptr(model),
                    c_key.as_ptr(),
                    buf.as_mut_ptr() as *mut c_char,
                    buf.len(),
                )
            };
            return read_buf(len, buf);
        }
        read_buf(len, buf)
    }

    fn model_desc(&self, model: RawModel) -> String {
        let mut buf = vec![0u8; 256];
        let len = unsafe {
            llama_sys::llama_model_desc(Self::model_ptr(model), buf.as_mut_ptr() as *mut c_char, buf.len())
        };
        read_buf(len, buf).unwrap_or_default()
    }

    fn model_chat_template(&self, model: RawModel) -> Option<String> {
        unsafe {
            let p = llama_sys::llama_model_chat_template(Self::model_ptr(model), ptr::null());
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        }
    }

    fn model_has_encoder(&self, model: RawModel) -> bool {
        unsafe { llama_sys::llama_model_has_encoder(Self::model_ptr(model)) }
    }

    fn model_has_decoder(&self, model: RawModel) -> bool {
        unsafe { llama_sys::llama_model_has_decoder(Self::model_ptr(model)) }
    }

    fn model_decoder_start_token(&self, model: RawModel) -> Option<i32> {
        let token = unsafe { llama_sys::llama_model_decoder_start_token(Self::model_ptr(model)) };
        (token != TOKEN_NULL).then_some(token)
    }

    fn model_is_recurrent(&self, model: RawModel) -> bool {
        unsafe { llama_sys::llama_model_is_recurrent(Self::model_ptr(model)) }
    }

    fn model_save(&self, model: RawModel, path: &Path) -> bool {
        let Some(c_path) = Self::c_path(path) else {
            return false;
        };
        if !clear_target(path) {
            return false;
        }
        unsafe { llama_sys::llama_model_save_to_file(Self::model_ptr(model), c_path.as_ptr()) };
        path.is_file()
    }

    fn model_quantize(&self, input: &Path, output: &Path, params: &QuantizeParams) -> u32 {
        let (Some(c_in), Some(c_out)) = (Self::c_path(input), Self::c_path(output)) else {
            return u32::MAX;
        };
        let mut raw = unsafe { llama_sys::llama_model_quantize_default_params() };
        raw.ftype = params.ftype.as_raw() as _;
        raw.nthread = params.n_threads as i32;
        raw.allow_requantize = params.allow_requantize;
        raw.quantize_output_tensor = params.quantize_output_tensor;
        raw.only_copy = params.only_copy;
        unsafe { llama_sys::llama_model_quantize(c_in.as_ptr(), c_out.as_ptr(), &raw) }
    }

    //  Context

    fn context_create(&self, model: RawModel, params: &ContextParams) -> Option<RawContext> {
        let mut raw = unsafe { llama_sys::llama_context_default_params() };
        raw.n_ctx = params.n_ctx;
        raw.n_batch = params.n_batch;
        raw.n_ubatch = params.n_batch;
        raw.n_threads = params.n_threads;
        raw.n_threads_batch = params.n_threads;

        let ctx = unsafe { llama_sys::llama_init_from_model(Self::model_ptr(model), raw) };
        RawContext::from_addr(ctx as usize)
    }

    fn context_free(&self, ctx: RawContext) {
        unsafe { llama_sys::llama_free(Self::ctx_ptr(ctx)) }
    }

    fn context_n_ctx(&self, ctx: RawContext) -> u32 {
        unsafe { llama_sys::llama_n_ctx(Self::ctx_ptr(ctx)) }
    }

    fn decode(&self, ctx: RawContext, batch: RawBatch, logits_all: bool) -> i32 {
        let Some(slot) = self.slot(batch) else {
            return super::decode_status::INVALID_INPUT;
        };
        let slot = lock_slot(&slot);
        let n = slot.inner.n_tokens;
        for i in 0..n {
            let wanted = logits_all || i == n - 1;
            unsafe { *slot.inner.logits.add(i as usize) = i8::from(wanted) };
        }
        unsafe { llama_sys::llama_decode(Self::ctx_ptr(ctx), slot.inner) }
    }

    fn copy_logits(&self, ctx: RawContext, out: &mut Vec<f32>) -> bool {
        unsafe {
            let ctx = Self::ctx_ptr(ctx);
            let p = llama_sys::llama_get_logits_ith(ctx, -1);
            if p.is_null() {
                return false;
            }
            let vocab = llama_sys::llama_model_get_vocab(llama_sys::llama_get_model(ctx));
            let n_vocab = usize::try_from(llama_sys::llama_vocab_n_tokens(vocab)).unwrap_or(0);
            out.clear();
            out.extend_from_slice(std::slice::from_raw_parts(p, n_vocab));
        }
        true
    }

    //  Batch

    fn batch_create(&self, max_tokens: usize) -> Option<RawBatch> {
        let capacity = i32::try_from(max_tokens).ok()?;
        let inner = unsafe { llama_sys::llama_batch_init(capacity, 0, 1) };
        if inner.token.is_null() {
            return None;
        }
        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        let slot = BatchSlot { inner, capacity };
        self.batches().insert(id, Arc::new(Mutex::new(slot)));
        RawBatch::from_addr(id)
    }

    fn batch_add(&self, batch: RawBatch, token: i32, pos: i32) -> bool {
        let Some(slot) = self.slot(batch) else {
            return false;
        };
        let mut slot = lock_slot(&slot);
        let i = slot.inner.n_tokens;
        if i >= slot.capacity {
            return false;
        }
        let i = i as usize;
        unsafe {
            *slot.inner.token.add(i) = token;
            *slot.inner.pos.add(i) = pos;
            *slot.inner.n_seq_id.add(i) = 1;
            *(*slot.inner.seq_id.add(i)).add(0) = 0;
            *slot.inner.logits.add(i) = 0;
        }
        slot.inner.n_tokens += 1;
        true
    }

    fn batch_clear(&self, batch: RawBatch) {
        if let Some(slot) = self.slot(batch) {
            lock_slot(&slot).inner.n_tokens = 0;
        }
    }

    fn batch_free(&self, batch: RawBatch) {
        // The native free runs when the last reference to the slot drops.
        self.batches().remove(&batch.addr());
    }

    //  Tokenizer

    fn tokenize(
        &self,
        model: RawModel,
        text: &str,
        add_bos: bool,
        add_eos: bool,
    ) -> Result<Vec<i32>, i32> {
        let vocab = Self::vocab(model);
        let text_len = i32::try_from(text.len()).map_err(|_| -1)?;

        // First call: query required buffer size (returns negative count).
        let n = unsafe {
            llama_sys::llama_tokenize(
                vocab,
                text.as_ptr() as *const c_char,
                text_len,
                ptr::null_mut(),
                0,
                false,
                false,
            )
        };
        let mut tokens = vec![0i32; n.unsigned_abs() as usize];
        if n != 0 {
            let actual = unsafe {
                llama_sys::llama_tokenize(
                    vocab,
                    text.as_ptr() as *const c_char,
                    text_len,
                    tokens.as_mut_ptr(),
                    tokens.len() as i32,
                    false,
                    false,
                )
            };
            if actual < 0 {
                return Err(actual);
            }
            tokens.truncate(actual as usize);
        }

        if add_bos {
            if let Some(bos) = self.special_token(model, SpecialToken::Bos) {
                tokens.insert(0, bos);
            }
        }
        if add_eos {
            tokens.extend(self.special_token(model, SpecialToken::Eos));
        }
        Ok(tokens)
    }

    fn detokenize(&self, model: RawModel, tokens: &[i32]) -> Option<String> {
        let vocab = Self::vocab(model);
        let n_tokens = i32::try_from(tokens.len()).ok()?;
        let mut buf = vec![0u8; tokens.len() * 16 + 1];
        let call = |buf: &mut Vec<u8>| unsafe {
            llama_sys::llama_detokenize(
                vocab,
                tokens.as_ptr(),
                n_tokens,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as i32,
                false,
                false,
            )
        };

        let mut len = call(&mut buf);
        if len < 0 {
            buf.resize(len.unsigned_abs() as usize, 0);
            len = call(&mut buf);
        }
        read_buf(len, buf)
    }

    fn token_text(&self, model: RawModel, token: i32) -> String {
        let vocab = Self::vocab(model);
        let mut buf = vec![0u8; 128];
        let call = |buf: &mut Vec<u8>| unsafe {
            llama_sys::llama_token_to_piece(
                vocab,
                token,
                buf.as_mut_ptr() as *mut c_char,
                buf.len() as i32,
                0,
                false,
            )
        };

        let mut len = call(&mut buf);
        if len < 0 {
            // Buffer too small: retry.
            buf.resize(len.unsigned_abs() as usize, 0);
            len = call(&mut buf);
        }
        read_buf(len, buf).unwrap_or_default()
    }

    fn vocab_size(&self, model: RawModel) -> usize {
        let n = unsafe { llama_sys::llama_vocab_n_tokens(Self::vocab(model)) };
        usize::try_from(n).unwrap_or(0)
    }

    fn special_token(&self, model: RawModel, kind: SpecialToken) -> Option<i32> {
        let vocab = Self::vocab(model);
        let token = unsafe {
            match kind {
                SpecialToken::Bos => llama_sys::llama_vocab_bos(vocab),
                SpecialToken::Eos => llama_sys::llama_vocab_eos(vocab),
                SpecialToken::Eot => llama_sys::llama_vocab_eot(vocab),
                SpecialToken::Pad => llama_sys::llama_vocab_pad(vocab),
                SpecialToken::Sep => llama_sys::llama_vocab_sep(vocab),
                SpecialToken::Nl => llama_sys::llama_vocab_nl(vocab),
            }
        };
        (token != TOKEN_NULL).then_some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_batch_does_not_block_other_batches() {
        let engine = LlamaCppEngine::new();
        let a = engine.batch_create(4).unwrap();
        let b = engine.batch_create(4).unwrap();

        // Stands in for a decode in progress on `a`.
        let busy = engine.slot(a).unwrap();
        let _guard = lock_slot(&busy);

        assert!(engine.batch_add(b, 7, 0));
        let c = engine.batch_create(1).unwrap();
        engine.batch_free(c);
        engine.batch_free(b);
        assert!(engine.slot(b).is_none());
        assert!(engine.slot(a).is_some());
    }

    #[test]
    fn test_batch_add_respects_capacity() {
        let engine = LlamaCppEngine::new();
        let batch = engine.batch_create(1).unwrap();
        assert!(engine.batch_add(batch, 1, 0));
        assert!(!engine.batch_add(batch, 2, 1));
        engine.batch_clear(batch);
        assert!(engine.batch_add(batch, 2, 1));
        engine.batch_free(batch);
        assert!(!engine.batch_add(batch, 3, 2));
    }

    #[test]
    fn test_log_sink_may_replace_itself() {
        let engine = Arc::new(LlamaCppEngine::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let sink: LogSink = {
            let engine = Arc::clone(&engine);
            let calls = Arc::clone(&calls);
            Arc::new(move |_level: LogLevel, _msg: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                engine.set_log_sink(None);
            })
        };
        engine.set_log_sink(Some(sink));

        unsafe { log_trampoline(2, c"first".as_ptr(), ptr::null_mut()) };
        unsafe { log_trampoline(2, c"second".as_ptr(), ptr::null_mut()) };

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(LOG_SINK.read().unwrap().is_none());
    }

    #[test]
    fn test_stale_save_target_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        std::fs::write(&path, b"old").unwrap();

        assert!(clear_target(&path));
        assert!(!path.exists());
        // Nothing to remove is fine too.
        assert!(clear_target(&path));
        // A directory cannot be replaced by a model file.
        assert!(!clear_target(dir.path()));
    }
}
