pub mod traits;

pub use traits::{
    Accelerator, Backend, BackendHandle, CacheLayout, LoadOptions, LoadedModel, ModelSource,
    ResolvedArtifact,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named logical role that hosts at most one loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSlot {
    Speech,
    Chat,
    Gesture,
    Vision,
}

impl ModelSlot {
    pub const ALL: [ModelSlot; 4] = [
        ModelSlot::Speech,
        ModelSlot::Chat,
        ModelSlot::Gesture,
        ModelSlot::Vision,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSlot::Speech => "speech",
            ModelSlot::Chat => "chat",
            ModelSlot::Gesture => "gesture",
            ModelSlot::Vision => "vision",
        }
    }
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelSlot::ALL
            .into_iter()
            .find(|slot| slot.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown model slot: {}", s))
    }
}

/// Resource-requirement class, ordered from smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Tiny,
    Lite,
    Standard,
    Pro,
    Ultra,
}

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

impl ModelTier {
    /// Ascending by resource requirement.
    pub const ALL: [ModelTier; 5] = [
        ModelTier::Tiny,
        ModelTier::Lite,
        ModelTier::Standard,
        ModelTier::Pro,
        ModelTier::Ultra,
    ];

    /// Largest artifact, in bytes, a model of this tier may ship as.
    pub fn size_budget(&self) -> u64 {
        match self {
            ModelTier::Tiny => 64 * MIB,
            ModelTier::Lite => 256 * MIB,
            ModelTier::Standard => 768 * MIB,
            ModelTier::Pro => 3 * GIB / 2,
            ModelTier::Ultra => 4 * GIB,
        }
    }

    /// Working memory, in bytes, a model of this tier needs once loaded.
    pub fn memory_budget(&self) -> u64 {
        match self {
            ModelTier::Tiny => 128 * MIB,
            ModelTier::Lite => 512 * MIB,
            ModelTier::Standard => GIB,
            ModelTier::Pro => 3 * GIB / 2,
            ModelTier::Ultra => 3 * GIB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Tiny => "tiny",
            ModelTier::Lite => "lite",
            ModelTier::Standard => "standard",
            ModelTier::Pro => "pro",
            ModelTier::Ultra => "ultra",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk encoding of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Gguf,
    SafeTensors,
    TfLite,
    Raw,
}

impl ArtifactFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "gguf" => ArtifactFormat::Gguf,
            "safetensors" => ArtifactFormat::SafeTensors,
            "tflite" => ArtifactFormat::TfLite,
            _ => ArtifactFormat::Raw,
        }
    }

    /// Smallest file that can hold a well-formed header of this format.
    pub fn min_size(&self) -> u64 {
        match self {
            // magic + version + tensor count + metadata count
            ArtifactFormat::Gguf => 24,
            // header length prefix + "{}"
            ArtifactFormat::SafeTensors => 10,
            ArtifactFormat::TfLite => 8,
            ArtifactFormat::Raw => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Gguf => "gguf",
            ArtifactFormat::SafeTensors => "safetensors",
            ArtifactFormat::TfLite => "tflite",
            ArtifactFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gguf" => Ok(ArtifactFormat::Gguf),
            "safetensors" => Ok(ArtifactFormat::SafeTensors),
            "tflite" => Ok(ArtifactFormat::TfLite),
            "raw" | "bin" => Ok(ArtifactFormat::Raw),
            other => Err(format!("unknown artifact format: {}", other)),
        }
    }
}

/// A model file that passed validation. Only the validator constructs these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    path: PathBuf,
    format: ArtifactFormat,
    declared_size: Option<u64>,
    observed_size: u64,
}

impl ModelArtifact {
    pub(crate) fn new(
        path: PathBuf,
        format: ArtifactFormat,
        declared_size: Option<u64>,
        observed_size: u64,
    ) -> Self {
        Self {
            path,
            format,
            declared_size,
            observed_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ArtifactFormat {
        self.format
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn size(&self) -> u64 {
        self.observed_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_follows_budgets() {
        for pair in ModelTier::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].size_budget() < pair[1].size_budget());
            assert!(pair[0].memory_budget() < pair[1].memory_budget());
        }
    }

    #[test]
    fn test_slot_parse() {
        assert_eq!("chat".parse::<ModelSlot>(), Ok(ModelSlot::Chat));
        assert_eq!(" Vision ".parse::<ModelSlot>(), Ok(ModelSlot::Vision));
        assert!("camera".parse::<ModelSlot>().is_err());
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ArtifactFormat::from_path(Path::new("a/model.GGUF")), ArtifactFormat::Gguf);
        assert_eq!(
            ArtifactFormat::from_path(Path::new("w.safetensors")),
            ArtifactFormat::SafeTensors
        );
        assert_eq!(ArtifactFormat::from_path(Path::new("hand.tflite")), ArtifactFormat::TfLite);
        assert_eq!(ArtifactFormat::from_path(Path::new("weights")), ArtifactFormat::Raw);
    }
}
