use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::SlotArtifactConfig;
use crate::core::model::{ModelSource, ModelSlot, ModelTier, ResolvedArtifact};
use crate::error::ValidationFailure;

/// Resolves slots to files under a local models directory.
///
/// Layout: `<models_dir>/<slot>/<tier>/<file>` wins over
/// `<models_dir>/<slot>/<file>` when both exist.
pub struct DirectorySource {
    models_dir: PathBuf,
    slots: BTreeMap<ModelSlot, SlotArtifactConfig>,
}

impl DirectorySource {
    pub fn new<P: AsRef<Path>>(models_dir: P, slots: BTreeMap<ModelSlot, SlotArtifactConfig>) -> Self {
        Self {
            models_dir: models_dir.as_ref().to_path_buf(),
            slots,
        }
    }

    pub fn default_models_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".assistant-runtime")
            .join("models")
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Candidate paths for a slot, most specific first.
    pub fn candidates(&self, slot: ModelSlot, tier: ModelTier) -> Vec<PathBuf> {
        let Some(entry) = self.slots.get(&slot) else {
            return Vec::new();
        };
        let slot_dir = self.models_dir.join(slot.as_str());
        vec![
            slot_dir.join(tier.as_str()).join(&entry.file),
            slot_dir.join(&entry.file),
        ]
    }
}

impl ModelSource for DirectorySource {
    fn resolve(&self, slot: ModelSlot, tier: ModelTier) -> Result<ResolvedArtifact, ValidationFailure> {
        let entry = self.slots.get(&slot).ok_or_else(|| ValidationFailure::NotFound {
            path: self.models_dir.join(slot.as_str()),
            detail: format!("no artifact configured for slot {}", slot),
        })?;

        let candidates = self.candidates(slot, tier);
        // a missing file is reported by the validator against the fallback path
        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .or_else(|| candidates.last())
            .cloned()
            .unwrap_or_else(|| self.models_dir.join(&entry.file));

        Ok(ResolvedArtifact {
            path,
            format: entry.format,
            declared_size: entry.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ArtifactFormat;

    fn source(dir: &Path) -> DirectorySource {
        let mut slots = BTreeMap::new();
        slots.insert(
            ModelSlot::Chat,
            SlotArtifactConfig {
                file: "model.gguf".into(),
                format: Some(ArtifactFormat::Gguf),
                size: None,
            },
        );
        DirectorySource::new(dir, slots)
    }

    #[test]
    fn test_prefers_tier_specific_file() {
        let dir = tempfile::tempdir().unwrap();
        let tiered = dir.path().join("chat").join("lite");
        std::fs::create_dir_all(&tiered).unwrap();
        std::fs::write(tiered.join("model.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("chat").join("model.gguf"), b"x").unwrap();

        let src = source(dir.path());
        let lite = src.resolve(ModelSlot::Chat, ModelTier::Lite).unwrap();
        assert_eq!(lite.path, tiered.join("model.gguf"));
        assert_eq!(lite.format, Some(ArtifactFormat::Gguf));

        let pro = src.resolve(ModelSlot::Chat, ModelTier::Pro).unwrap();
        assert_eq!(pro.path, dir.path().join("chat").join("model.gguf"));
    }

    #[test]
    fn test_missing_file_falls_back_to_slot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = source(dir.path()).resolve(ModelSlot::Chat, ModelTier::Tiny).unwrap();
        assert_eq!(resolved.path, dir.path().join("chat").join("model.gguf"));
    }

    #[test]
    fn test_unconfigured_slot() {
        let dir = tempfile::tempdir().unwrap();
        let err = source(dir.path()).resolve(ModelSlot::Vision, ModelTier::Tiny).unwrap_err();
        assert!(matches!(err, ValidationFailure::NotFound { .. }));
    }
}
