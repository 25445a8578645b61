//! Loading, saving and quantizing model files.

use std::fs::File;
use std::path::Path;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::{BridgeError, Result};
use crate::model::{Model, ModelParams, QuantizeParams};

/// Entry point for everything that reads or writes model files.
pub struct ModelManager {
    backend: Backend,
}

impl ModelManager {
    pub fn new(backend: &Backend) -> Self {
        Self {
            backend: backend.clone(),
        }
    }

    pub fn default_model_params(&self) -> ModelParams {
        ModelParams::default()
    }

    /// Load a single model file.
    pub fn load(&self, path: impl AsRef<Path>, params: &ModelParams) -> Result<Model> {
        self.load_paths(&[path.as_ref()], params)
    }

    /// Load a model stored as an ordered list of split files.
    pub fn load_from_splits<P: AsRef<Path>>(&self, paths: &[P], params: &ModelParams) -> Result<Model> {
        if paths.is_empty() {
            return Err(BridgeError::invalid("split path list is empty"));
        }
        let paths: Vec<&Path> = paths.iter().map(AsRef::as_ref).collect();
        self.load_paths(&paths, params)
    }

    fn load_paths(&self, paths: &[&Path], params: &ModelParams) -> Result<Model> {
        for path in paths {
            require_path(path, "model path")?;
        }
        params.validate()?;
        let backend = self.backend.acquire()?;
        for path in paths {
            require_readable(path)?;
        }

        let first = paths[0];
        info!(
            path = %first.display(),
            splits = paths.len(),
            n_gpu_layers = params.n_gpu_layers,
            "Loading model"
        );
        let engine = self.backend.engine();
        let raw = engine
            .model_load(paths, params)
            .ok_or_else(|| BridgeError::LoadFailure {
                path: first.display().to_string(),
                reason: "native loader returned null".into(),
            })?;

        let model = Model::from_native(
            raw,
            engine.clone(),
            backend,
            first.to_path_buf(),
            params.metadata_overrides.clone(),
        );
        if let Ok(info) = model.info() {
            info!(
                n_params = info.parameter_count(),
                n_vocab = info.vocab_size(),
                n_ctx_train = info.context_size(),
                "Model loaded"
            );
        }
        Ok(model)
    }

    /// Write a live model to `path`.
    pub fn save(&self, model: &Model, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        require_path(path, "output path")?;
        let raw = model.raw()?;
        if !model.engine()?.model_save(raw, path) {
            return Err(BridgeError::IoFailure {
                path: path.display().to_string(),
                reason: "native save reported failure".into(),
            });
        }
        debug!(path = %path.display(), "Model saved");
        Ok(())
    }

    /// Quantize `input` into `output`. No [`Model`] is involved.
    pub fn quantize(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        params: &QuantizeParams,
    ) -> Result<()> {
        let (input, output) = (input.as_ref(), output.as_ref());
        require_path(input, "input path")?;
        require_path(output, "output path")?;
        let _backend = self.backend.acquire()?;
        require_readable(input)?;

        info!(
            input = %input.display(),
            output = %output.display(),
            ftype = ?params.ftype,
            "Quantizing model"
        );
        match self.backend.engine().model_quantize(input, output, params) {
            0 => {
                info!(output = %output.display(), "Quantization finished");
                Ok(())
            }
            code => Err(BridgeError::QuantizeFailure { code }),
        }
    }
}

fn require_path(path: &Path, what: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(BridgeError::invalid(format!("{what} must not be empty")));
    }
    Ok(())
}

fn require_readable(path: &Path) -> Result<()> {
    let not_found = || BridgeError::NotFound {
        path: path.display().to_string(),
    };
    let meta = std::fs::metadata(path).map_err(|_| not_found())?;
    if !meta.is_file() || File::open(path).is_err() {
        return Err(not_found());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::QuantType;
    use crate::testing::{FakeEngine, Fixture, NativeEvent};

    #[test]
    fn test_load_requires_initialized_backend() {
        let engine = Arc::new(FakeEngine::new());
        let backend = Backend::new(engine.clone());
        let file = tempfile::NamedTempFile::new().unwrap();
        let manager = ModelManager::new(&backend);

        let err = manager.load(file.path(), &ModelParams::default()).unwrap_err();
        assert!(matches!(err, BridgeError::BackendNotInitialized));
        assert_eq!(engine.count(NativeEvent::ModelLoad), 0);
    }

    #[test]
    fn test_load_missing_file_is_not_found() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let err = fx
            .manager()
            .load(dir.path().join("missing.gguf"), &ModelParams::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));

        // A directory is not a readable file either.
        let err = fx.manager().load(dir.path(), &ModelParams::default()).unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));
        assert_eq!(fx.engine.count(NativeEvent::ModelLoad), 0);
    }

    #[test]
    fn test_invalid_arguments_never_reach_native() {
        let fx = Fixture::new();
        let manager = fx.manager();

        let err = manager.load("", &ModelParams::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let params = ModelParams {
            n_gpu_layers: -5,
            ..Default::default()
        };
        let err = manager.load(fx.model_file.path(), &params).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        let none: [&Path; 0] = [];
        let err = manager.load_from_splits(&none, &ModelParams::default()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));

        assert_eq!(fx.engine.count(NativeEvent::ModelLoad), 0);
    }

    #[test]
    fn test_native_load_failure_then_retry() {
        let fx = Fixture::new();
        fx.engine.fail_load(true);
        let err = fx
            .manager()
            .load(fx.model_file.path(), &ModelParams::default())
            .unwrap_err();
        assert!(matches!(err, BridgeError::LoadFailure { .. }));
        assert!(err.is_recoverable());

        fx.engine.fail_load(false);
        let model = fx.load_model(ModelParams::default());
        assert!(!model.is_released());
    }

    #[test]
    fn test_load_from_splits_passes_paths_in_order() {
        let fx = Fixture::new();
        let second = tempfile::NamedTempFile::new().unwrap();
        let paths = [fx.model_file.path(), second.path()];
        let model = fx
            .manager()
            .load_from_splits(&paths, &ModelParams::default())
            .unwrap();

        let loaded = fx.engine.model_paths(model.raw().unwrap());
        assert_eq!(loaded, vec![paths[0].to_path_buf(), paths[1].to_path_buf()]);
        assert_eq!(model.path(), paths[0]);
    }

    #[test]
    fn test_save_writes_file_and_reports_io_failure() {
        let fx = Fixture::new();
        let model = fx.load_model(ModelParams::default());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("copy.gguf");

        fx.manager().save(&model, &out).unwrap();
        assert!(out.exists());

        fx.engine.fail_save(true);
        let err = fx.manager().save(&model, &out).unwrap_err();
        assert!(matches!(err, BridgeError::IoFailure { .. }));
    }

    #[test]
    fn test_save_released_model_fails() {
        let fx = Fixture::new();
        let mut model = fx.load_model(ModelParams::default());
        model.release();
        let dir = tempfile::tempdir().unwrap();
        let err = fx.manager().save(&model, dir.path().join("x.gguf")).unwrap_err();
        assert!(matches!(err, BridgeError::UseAfterRelease { .. }));
    }

    #[test]
    fn test_quantize_success_and_failure_code() {
        let fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("q.gguf");
        let params = QuantizeParams {
            ftype: QuantType::Q8_0,
            ..Default::default()
        };

        fx.manager().quantize(fx.model_file.path(), &out, &params).unwrap();
        assert!(out.exists());

        fx.engine.set_quantize_code(3);
        let err = fx.manager().quantize(fx.model_file.path(), &out, &params).unwrap_err();
        assert!(matches!(err, BridgeError::QuantizeFailure { code: 3 }));

        let err = fx
            .manager()
            .quantize(dir.path().join("absent.gguf"), &out, &params)
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));

        let err = fx.manager().quantize("", &out, &params).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArgument(_)));
    }
}
