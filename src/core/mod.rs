pub mod cache;
pub mod context;
pub mod model;
pub mod resource;
pub mod sample;
pub mod session;
pub mod tokenizer;
pub mod validate;

pub use cache::{CacheError, CacheKey, KvCache};
pub use context::{ContextWindow, ConversationTurn, Role};
pub use model::{ArtifactFormat, ModelArtifact, ModelSlot, ModelTier, TokenId};
pub use resource::{ResourceBudgetAdvisor, ResourceDecision, ResourceProbe, ResourceSnapshot};
pub use sample::{SampleParams, Sampler};
pub use session::{CancelToken, GenerateRequest, Generation, GenerationStats, InferenceSession, StopReason};
pub use tokenizer::Tokenizer;
pub use validate::ArtifactValidator;
