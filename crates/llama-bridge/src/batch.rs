//! Fixed-capacity token batches.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::NativeBackend;
use crate::engine::{Engine, RawBatch};
use crate::error::{BridgeError, Entity, Result};

/// One (token, position) entry of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: i32,
    pub pos: i32,
}

/// Owns a native batch buffer; frees it exactly once on drop.
struct NativeBatch {
    raw: RawBatch,
    engine: Arc<dyn Engine>,
    _backend: Arc<NativeBackend>,
}

impl Drop for NativeBatch {
    fn drop(&mut self) {
        self.engine.batch_free(self.raw);
    }
}

/// An ordered, fixed-capacity buffer of token entries.
///
/// Positions are assigned from a cursor that advances with every appended
/// token. [`Batch::clear`] empties the batch but keeps the cursor, so a
/// generation loop can clear and append the next token at the next position.
/// A Batch is not tied to a Context and may be reused across `process` calls.
pub struct Batch {
    native: Option<NativeBatch>,
    capacity: usize,
    /// Mirror of the native buffer.
    entries: Vec<BatchEntry>,
    next_pos: i32,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries)
            .field("next_pos", &self.next_pos)
            .field("released", &self.native.is_none())
            .finish()
    }
}

impl Batch {
    pub(crate) fn new(
        engine: Arc<dyn Engine>,
        backend: Arc<NativeBackend>,
        max_tokens: usize,
    ) -> Result<Self> {
        if max_tokens == 0 {
            return Err(BridgeError::invalid("batch capacity must be positive"));
        }
        let raw = engine
            .batch_create(max_tokens)
            .ok_or_else(|| BridgeError::CreateFailure("native batch allocation failed".into()))?;
        debug!(capacity = max_tokens, "Batch created");
        Ok(Self {
            native: Some(NativeBatch {
                raw,
                engine,
                _backend: backend,
            }),
            capacity: max_tokens,
            entries: Vec::with_capacity(max_tokens),
            next_pos: 0,
        })
    }

    fn native(&self) -> Result<&NativeBatch> {
        self.native
            .as_ref()
            .ok_or(BridgeError::released(Entity::Batch))
    }

    pub(crate) fn raw(&self) -> Result<RawBatch> {
        Ok(self.native()?.raw)
    }

    //  Accessors

    pub fn token_count(&self) -> Result<usize> {
        self.native()?;
        Ok(self.entries.len())
    }

    pub fn max_token_count(&self) -> Result<usize> {
        self.native()?;
        Ok(self.capacity)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.token_count()? == 0)
    }

    pub fn entries(&self) -> Result<&[BatchEntry]> {
        self.native()?;
        Ok(&self.entries)
    }

    /// Position the next appended token will get.
    pub fn next_position(&self) -> Result<i32> {
        self.native()?;
        Ok(self.next_pos)
    }

    //  Mutation

    /// Append one token at the next position.
    pub fn add_token(&mut self, token: i32) -> Result<()> {
        let native = self.native()?;
        if self.entries.len() == self.capacity {
            return Err(BridgeError::BatchFull {
                capacity: self.capacity,
            });
        }
        let pos = self.next_pos;
        if !native.engine.batch_add(native.raw, token, pos) {
            self.sync_native();
            return Err(BridgeError::BatchFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(BatchEntry { token, pos });
        self.next_pos += 1;
        Ok(())
    }

    /// Append all tokens or none.
    pub fn add_tokens(&mut self, tokens: &[i32]) -> Result<()> {
        let native = self.native()?;
        let available = self.capacity - self.entries.len();
        let overflow = BridgeError::BatchOverflow {
            requested: tokens.len(),
            available,
        };
        if tokens.len() > available {
            return Err(overflow);
        }

        let start = self.next_pos;
        for (offset, &token) in (0..).zip(tokens) {
            if !native.engine.batch_add(native.raw, token, start + offset) {
                warn!(
                    appended = offset,
                    requested = tokens.len(),
                    "Native batch rejected a token; restoring previous contents"
                );
                self.sync_native();
                return Err(overflow);
            }
        }

        self.entries.extend(
            (0..)
                .zip(tokens)
                .map(|(offset, &token)| BatchEntry {
                    token,
                    pos: start + offset,
                }),
        );
        self.next_pos = start + tokens.len() as i32;
        Ok(())
    }

    /// Remove all entries. The position cursor is kept.
    pub fn clear(&mut self) -> Result<()> {
        let native = self.native()?;
        native.engine.batch_clear(native.raw);
        self.entries.clear();
        Ok(())
    }

    /// Remove all entries and continue numbering at `pos`.
    pub fn clear_at(&mut self, pos: i32) -> Result<()> {
        self.set_next_position(pos)?;
        self.clear()
    }

    pub fn set_next_position(&mut self, pos: i32) -> Result<()> {
        self.native()?;
        if pos < 0 {
            return Err(BridgeError::invalid(format!("position must not be negative (got {pos})")));
        }
        self.next_pos = pos;
        Ok(())
    }

    /// Rebuild the native buffer from the mirror.
    fn sync_native(&self) {
        let Some(native) = &self.native else {
            return;
        };
        native.engine.batch_clear(native.raw);
        for entry in &self.entries {
            if !native.engine.batch_add(native.raw, entry.token, entry.pos) {
                warn!(pos = entry.pos, "Failed to restore native batch entry");
            }
        }
    }

    //  Release

    /// Free the native buffer (idempotent).
    pub fn release(&mut self) {
        if self.native.take().is_some() {
            self.entries.clear();
            debug!(capacity = self.capacity, "Batch released");
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.release();
    }
}
