use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use safetensors::SafeTensors;
use tracing::debug;

use crate::core::model::{ArtifactFormat, Backend, LoadOptions, ModelArtifact, ResolvedArtifact};
use crate::error::ValidationFailure;
use crate::infra::gguf::GgufHeader;

/// Integrity checks run before an artifact reaches a backend.
///
/// Order: readable file, per-format minimum size, declared size, format
/// probe, trial load. The first failing check decides the outcome.
#[derive(Clone)]
pub struct ArtifactValidator {
    trial: Option<(Arc<dyn Backend>, LoadOptions)>,
    probe_format: bool,
}

impl Default for ArtifactValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactValidator {
    pub fn new() -> Self {
        Self {
            trial: None,
            probe_format: true,
        }
    }

    pub fn with_trial_loader(mut self, backend: Arc<dyn Backend>, options: LoadOptions) -> Self {
        self.trial = Some((backend, options));
        self
    }

    pub fn without_format_probe(mut self) -> Self {
        self.probe_format = false;
        self
    }

    pub fn validate(&self, path: &Path, perform_load_test: bool) -> Result<ModelArtifact, ValidationFailure> {
        self.validate_resolved(&ResolvedArtifact::new(path), perform_load_test)
    }

    pub fn validate_resolved(
        &self,
        resolved: &ResolvedArtifact,
        perform_load_test: bool,
    ) -> Result<ModelArtifact, ValidationFailure> {
        let path = resolved.path.as_path();
        let not_found = |detail: String| ValidationFailure::NotFound {
            path: path.to_path_buf(),
            detail,
        };

        let mut file = File::open(path).map_err(|e| not_found(e.to_string()))?;
        let metadata = file.metadata().map_err(|e| not_found(e.to_string()))?;
        if !metadata.is_file() {
            return Err(not_found("not a regular file".into()));
        }

        let format = resolved.format.unwrap_or_else(|| ArtifactFormat::from_path(path));
        let size = metadata.len();
        if size < format.min_size() {
            return Err(ValidationFailure::TooSmall {
                path: path.to_path_buf(),
                format,
                actual: size,
                minimum: format.min_size(),
            });
        }

        let mismatch = |detail: String| ValidationFailure::FormatMismatch {
            path: path.to_path_buf(),
            format,
            detail,
        };

        if let Some(declared) = resolved.declared_size {
            if declared != size {
                return Err(mismatch(format!("declared {} bytes, found {}", declared, size)));
            }
        }

        if self.probe_format {
            probe(&mut file, format).map_err(mismatch)?;
        }
        drop(file);

        let artifact = ModelArtifact::new(path.to_path_buf(), format, resolved.declared_size, size);

        if perform_load_test {
            self.trial_load(&artifact)?;
        }

        debug!(path = %path.display(), %format, size, "artifact validated");
        Ok(artifact)
    }

    /// Loads `artifact` on CPU with the trial backend and releases it.
    pub fn trial_load(&self, artifact: &ModelArtifact) -> Result<(), ValidationFailure> {
        let failed = |detail: String| ValidationFailure::LoadTestFailed {
            path: artifact.path().to_path_buf(),
            detail,
        };

        let (backend, options) = self
            .trial
            .as_ref()
            .ok_or_else(|| failed("no backend available for a trial load".into()))?;

        let loaded = backend
            .load(artifact, &options.cpu_only())
            .map_err(|e| failed(format!("{:#}", e)))?;
        loaded.handle.release();
        Ok(())
    }
}

fn probe(file: &mut File, format: ArtifactFormat) -> Result<(), String> {
    match format {
        ArtifactFormat::Gguf => {
            GgufHeader::read(file).map_err(|e| format!("{:#}", e))?;
        }
        ArtifactFormat::SafeTensors => {
            // SAFETY: the map is read-only and dropped before this returns;
            // the artifact is not modified while the runtime is validating it.
            let mmap = unsafe { Mmap::map(&*file) }.map_err(|e| e.to_string())?;
            SafeTensors::read_metadata(&mmap).map_err(|e| format!("{:?}", e))?;
        }
        ArtifactFormat::TfLite => {
            let mut head = [0u8; 8];
            file.read_exact(&mut head).map_err(|e| e.to_string())?;
            if &head[4..8] != b"TFL3" {
                return Err(format!("missing TFL3 identifier, found {:?}", &head[4..8]));
            }
        }
        ArtifactFormat::Raw => {}
    }
    Ok(())
}
