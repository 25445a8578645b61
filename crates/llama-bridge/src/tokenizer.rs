//! Text ↔ token id mapping through the model's vocabulary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Entity, Result};
use crate::model::{NativeModel, WeakModel};

/// Special vocabulary entries a model may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialToken {
    Bos,
    Eos,
    /// End of turn.
    Eot,
    Pad,
    Sep,
    /// Newline.
    Nl,
}

/// Tokenizer of a loaded model.
///
/// Shares the validity of the [`Model`](crate::Model) it came from: once
/// the model is released every call fails with `UseAfterRelease`. Cheap to
/// clone and safe to use from several threads.
#[derive(Clone)]
pub struct Tokenizer {
    model: WeakModel,
    live: Arc<AtomicBool>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("live", &self.live.load(Ordering::Acquire))
            .finish()
    }
}

impl Tokenizer {
    pub(crate) fn new(model: WeakModel, live: Arc<AtomicBool>) -> Self {
        Self { model, live }
    }

    fn native(&self) -> Result<Arc<NativeModel>> {
        if !self.live.load(Ordering::Acquire) {
            return Err(BridgeError::released(Entity::Model));
        }
        self.model
            .upgrade()
            .ok_or(BridgeError::released(Entity::Model))
    }

    /// Tokenize without adding BOS/EOS.
    pub fn tokenize(&self, text: &str) -> Result<Vec<i32>> {
        self.tokenize_with(text, false, false)
    }

    pub fn tokenize_with(&self, text: &str, add_bos: bool, add_eos: bool) -> Result<Vec<i32>> {
        let model = self.native()?;
        model
            .engine()
            .tokenize(model.raw(), text, add_bos, add_eos)
            .map_err(|code| BridgeError::Tokenization(format!("native tokenizer returned {code}")))
    }

    pub fn detokenize(&self, tokens: &[i32]) -> Result<String> {
        let model = self.native()?;
        let vocab = model.engine().vocab_size(model.raw());
        if let Some(bad) = tokens.iter().find(|&&t| !in_vocab(t, vocab)) {
            return Err(BridgeError::invalid(format!(
                "token id {bad} outside vocabulary of {vocab}"
            )));
        }
        model
            .engine()
            .detokenize(model.raw(), tokens)
            .ok_or_else(|| BridgeError::Tokenization("native detokenizer failed".into()))
    }

    pub fn vocab_size(&self) -> Result<usize> {
        let model = self.native()?;
        Ok(model.engine().vocab_size(model.raw()))
    }

    /// Id of a special token, `None` if the model does not define it.
    pub fn special_token(&self, kind: SpecialToken) -> Result<Option<i32>> {
        let model = self.native()?;
        Ok(model.engine().special_token(model.raw(), kind))
    }

    /// Text piece of a single token.
    pub fn token_text(&self, token: i32) -> Result<String> {
        let model = self.native()?;
        let vocab = model.engine().vocab_size(model.raw());
        if !in_vocab(token, vocab) {
            return Err(BridgeError::invalid(format!(
                "token id {token} outside vocabulary of {vocab}"
            )));
        }
        Ok(model.engine().token_text(model.raw(), token))
    }

    /// True for EOS and EOT.
    pub fn is_end_of_generation(&self, token: i32) -> Result<bool> {
        Ok([SpecialToken::Eos, SpecialToken::Eot]
            .into_iter()
            .map(|kind| self.special_token(kind))
            .collect::<Result<Vec<_>>>()?
            .contains(&Some(token)))
    }
}

fn in_vocab(token: i32, vocab: usize) -> bool {
    usize::try_from(token).is_ok_and(|t| t < vocab)
}
