//! Shared application state injected into Axum handlers.

use std::sync::Arc;

use llama_bridge::{Backend, Model, Tokenizer};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    tokenizer: Tokenizer,
    model: Model,
    backend: Backend,
}

impl AppState {
    /// Serve `model`, which must have been loaded through `backend`.
    pub fn new(backend: Backend, model: Model) -> llama_bridge::Result<Self> {
        let tokenizer = model.tokenizer()?;
        Ok(Self {
            inner: Arc::new(Inner {
                tokenizer,
                model,
                backend,
            }),
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.inner.tokenizer
    }

    pub fn model(&self) -> &Model {
        &self.inner.model
    }

    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }
}
