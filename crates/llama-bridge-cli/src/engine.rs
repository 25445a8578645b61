//! Native engine selection.

use std::sync::Arc;

use llama_bridge::Engine;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(
        "no native engine compiled in; rebuild with `--features llama-cpp` \
         (or cuda / vulkan / rocm)"
    )]
    EngineUnavailable,
}

#[cfg(feature = "llama-cpp")]
pub fn native_engine() -> Result<Arc<dyn Engine>, EngineError> {
    Ok(Arc::new(llama_bridge::LlamaCppEngine::new()))
}

#[cfg(not(feature = "llama-cpp"))]
pub fn native_engine() -> Result<Arc<dyn Engine>, EngineError> {
    Err(EngineError::EngineUnavailable)
}

#[cfg(all(test, not(feature = "llama-cpp")))]
mod tests {
    use super::*;

    #[test]
    fn test_missing_engine_is_reported() {
        let err = native_engine().err().unwrap();
        assert!(err.to_string().contains("--features llama-cpp"));
    }
}
