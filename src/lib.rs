pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod format;
pub mod infra;

pub use app::{
    Event, EventBus, EventHandler, GenerationStream, ModelRuntime, ModelSlotRegistry, SlotStateKind, SlotStatus,
    StreamEvent,
};
pub use config::RuntimeConfig;
pub use core::model::{Accelerator, Backend, BackendHandle, LoadOptions, LoadedModel, ModelSource};
pub use core::{
    ArtifactFormat, ArtifactValidator, CancelToken, GenerateRequest, Generation, GenerationStats, KvCache,
    ModelArtifact, ModelSlot, ModelTier, ResourceBudgetAdvisor, ResourceDecision, ResourceProbe, ResourceSnapshot,
    SampleParams, StopReason, TokenId, Tokenizer,
};
pub use error::{Result, RuntimeError, ValidationFailure};
pub use infra::{DirectorySource, GgufBackend, SystemProbe};
