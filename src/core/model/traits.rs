use super::{ArtifactFormat, ModelArtifact, ModelSlot, ModelTier, TokenId};
use crate::core::cache::KvCache;
use crate::core::tokenizer::Tokenizer;
use crate::error::ValidationFailure;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// One backend format's loader. Each slot is bound to exactly one.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, artifact: &ModelArtifact, options: &LoadOptions) -> anyhow::Result<LoadedModel>;
}

/// A loaded model instance owned by a single inference session.
pub trait BackendHandle: Send {
    /// Shape of the key/value arena this handle writes into.
    fn layout(&self) -> CacheLayout;

    /// Evaluates `tokens[cache.len()..]` and returns the logits for the
    /// position after the last token. On success the cache must hold
    /// exactly `tokens.len()` positions.
    fn forward_step(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> anyhow::Result<Vec<f32>>;

    /// How many of the `common` cached positions shared with the next
    /// prompt this handle can keep. Handles that cannot drop a cache
    /// suffix return 0 unless nothing needs dropping.
    fn reusable_prefix(&self, common: usize) -> usize {
        common
    }

    fn release(self: Box<Self>) {}
}

pub struct LoadedModel {
    pub handle: Box<dyn BackendHandle>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheLayout {
    pub layers: usize,
    pub hidden_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Cpu,
    Gpu,
    Npu,
}

impl std::str::FromStr for Accelerator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "none" => Ok(Accelerator::Cpu),
            "gpu" => Ok(Accelerator::Gpu),
            "npu" => Ok(Accelerator::Npu),
            other => Err(format!("unknown accelerator: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub threads: usize,
    pub accelerator: Accelerator,
}

impl LoadOptions {
    pub fn cpu_only(&self) -> Self {
        Self {
            accelerator: Accelerator::Cpu,
            ..*self
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            accelerator: Accelerator::Cpu,
        }
    }
}

/// Where a slot's artifact lives, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub path: PathBuf,
    pub format: Option<ArtifactFormat>,
    pub declared_size: Option<u64>,
}

impl ResolvedArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
            declared_size: None,
        }
    }
}

/// Maps a slot to a local artifact path. Downloading or copying assets is
/// the implementor's business and happens before this returns.
pub trait ModelSource: Send + Sync {
    fn resolve(&self, slot: ModelSlot, tier: ModelTier) -> Result<ResolvedArtifact, ValidationFailure>;
}
