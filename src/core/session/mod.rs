use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::core::cache::KvCache;
use crate::core::context::{ContextWindow, ConversationTurn};
use crate::core::model::{BackendHandle, LoadedModel, ModelArtifact, ModelSlot, TokenId};
use crate::core::sample::{SampleParams, Sampler};
use crate::core::tokenizer::Tokenizer;
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub context_limit: usize,
    pub max_new_tokens: usize,
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_limit: 2048,
            max_new_tokens: 512,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Falls back to the session default when unset.
    pub max_new_tokens: Option<usize>,
    pub params: SampleParams,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            max_new_tokens: None,
            params: SampleParams::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = Some(n);
        self
    }

    pub fn with_params(mut self, params: SampleParams) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Eos,
    MaxTokens,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub reused_tokens: usize,
    pub generated_tokens: usize,
    pub stop_reason: StopReason,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub stats: GenerationStats,
}

/// Shared flag checked between decode steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stateful decode engine for one loaded slot.
///
/// Owns the backend handle and the key/value cache. `cached_tokens` always
/// mirrors the positions committed in `cache`, so a later prompt that shares
/// a prefix with the previous one only prefills the difference.
pub struct InferenceSession {
    slot: ModelSlot,
    artifact: ModelArtifact,
    handle: Box<dyn BackendHandle>,
    tokenizer: Arc<dyn Tokenizer>,
    cache: KvCache,
    cached_tokens: Vec<TokenId>,
    history: Vec<ConversationTurn>,
    window: ContextWindow,
    default_max_new: usize,
    sampler: Sampler,
}

impl InferenceSession {
    pub fn new(slot: ModelSlot, artifact: ModelArtifact, model: LoadedModel, config: &SessionConfig) -> Self {
        let cache = KvCache::new(model.handle.layout(), config.context_limit);
        Self {
            slot,
            artifact,
            handle: model.handle,
            tokenizer: model.tokenizer,
            cache,
            cached_tokens: Vec::new(),
            history: Vec::new(),
            window: ContextWindow::new(config.context_limit),
            default_max_new: config.max_new_tokens,
            sampler: Sampler::new(config.seed),
        }
    }

    pub fn slot(&self) -> ModelSlot {
        self.slot
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    pub fn cache(&self) -> &KvCache {
        &self.cache
    }

    pub fn context_limit(&self) -> usize {
        self.window.limit()
    }

    /// Checks everything that can be rejected without touching the backend.
    pub fn check_request(&self, request: &GenerateRequest) -> Result<usize> {
        request.params.validate()?;
        let max_new = request.max_new_tokens.unwrap_or(self.default_max_new);
        self.window.input_budget(max_new)?;
        Ok(max_new)
    }

    pub fn generate(&mut self, request: &GenerateRequest) -> Result<Generation> {
        self.generate_streaming(request, &CancelToken::new(), |_| {})
    }

    /// Runs the decode loop, handing each newly complete piece of text to
    /// `on_text`. Cancellation ends the call with `StopReason::Cancelled`
    /// and keeps the partial output as the assistant turn.
    pub fn generate_streaming<F>(&mut self, request: &GenerateRequest, cancel: &CancelToken, on_text: F) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        let max_new = self.check_request(request)?;
        let system = request.system_prompt.as_deref().map(ConversationTurn::system);

        self.history.push(ConversationTurn::user(request.prompt.as_str()));
        match self.decode(system.as_ref(), max_new, &request.params, cancel, on_text) {
            Ok(generation) => {
                self.history.push(ConversationTurn::assistant(generation.text.as_str()));
                debug!(
                    slot = %self.slot,
                    prompt_tokens = generation.stats.prompt_tokens,
                    reused = generation.stats.reused_tokens,
                    generated = generation.stats.generated_tokens,
                    stop = ?generation.stats.stop_reason,
                    "generation finished"
                );
                Ok(generation)
            }
            Err(e) => {
                self.history.pop();
                Err(e)
            }
        }
    }

    fn decode<F>(
        &mut self,
        system: Option<&ConversationTurn>,
        max_new: usize,
        params: &SampleParams,
        cancel: &CancelToken,
        mut on_text: F,
    ) -> Result<Generation>
    where
        F: FnMut(&str),
    {
        let started = Instant::now();
        let prompt = self.window.assemble(&self.history, system, &*self.tokenizer, max_new)?;
        let mut tokens = prompt.tokens;
        if tokens.is_empty() {
            return Err(RuntimeError::BackendStepFailed("prompt encoded to no tokens".into()));
        }
        if prompt.truncated {
            debug!(slot = %self.slot, turns = prompt.turns_included, "history trimmed to fit context");
        }

        let prompt_tokens = tokens.len();
        let reused_tokens = self.reuse_prefix(&tokens);
        let eos = self.tokenizer.eos_token();

        let mut generated: Vec<TokenId> = Vec::new();
        let mut text = String::new();
        let mut emitted = 0;
        let mut stop_reason = StopReason::MaxTokens;

        for _ in 0..max_new {
            if cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }

            let logits = self.step(&tokens)?;
            let next = TokenId(self.sampler.sample(&logits, params)? as u32);
            if next == eos {
                stop_reason = StopReason::Eos;
                break;
            }
            tokens.push(next);
            generated.push(next);

            text = self.detokenize(&generated)?;
            // hold back a possibly incomplete multi-byte sequence
            let stable = text.trim_end_matches('\u{FFFD}');
            if stable.len() > emitted && stable.is_char_boundary(emitted) {
                on_text(&stable[emitted..]);
                emitted = stable.len();
            }
        }

        if text.len() > emitted && text.is_char_boundary(emitted) {
            on_text(&text[emitted..]);
        }

        Ok(Generation {
            text,
            stats: GenerationStats {
                prompt_tokens,
                reused_tokens,
                generated_tokens: generated.len(),
                stop_reason,
                elapsed: started.elapsed(),
            },
        })
    }

    /// Drops cached positions past the shared prefix and returns how many
    /// were kept. At least one prompt token is always left to evaluate.
    fn reuse_prefix(&mut self, tokens: &[TokenId]) -> usize {
        let common = self
            .cached_tokens
            .iter()
            .zip(tokens)
            .take_while(|(a, b)| a == b)
            .count()
            .min(tokens.len().saturating_sub(1));
        let common = self.handle.reusable_prefix(common).min(common);

        self.cache.truncate(common);
        self.cached_tokens.truncate(common);
        common
    }

    fn step(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let before = self.cache.len();
        let outcome = self.handle.forward_step(tokens, &mut self.cache);

        let failure = match outcome {
            Ok(logits) if self.cache.len() == tokens.len() => {
                self.cached_tokens.truncate(before);
                self.cached_tokens.extend_from_slice(&tokens[before..]);
                return Ok(logits);
            }
            Ok(_) => format!(
                "backend committed {} cache positions, expected {}",
                self.cache.len(),
                tokens.len()
            ),
            Err(e) => format!("{:#}", e),
        };

        self.cache.truncate(before);
        self.cached_tokens.truncate(before);
        Err(RuntimeError::BackendStepFailed(failure))
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        self.tokenizer
            .decode(tokens)
            .map_err(|e| RuntimeError::BackendStepFailed(format!("tokenizer: {:#}", e)))
    }

    /// History and cache are reset together.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.cache.clear();
        self.cached_tokens.clear();
    }

    pub fn release(self) {
        self.handle.release();
    }
}
