use std::cell::OnceCell;

use crate::core::model::TokenId;
use crate::core::tokenizer::Tokenizer;
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    tokens: OnceCell<Vec<TokenId>>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tokens: OnceCell::new(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn render(&self) -> String {
        format!("{}: {}\n", self.role.label(), self.text)
    }

    /// Encoded once, on first use.
    pub fn tokens(&self, tokenizer: &dyn Tokenizer) -> Result<&[TokenId]> {
        if let Some(tokens) = self.tokens.get() {
            return Ok(tokens);
        }
        let encoded = encode(tokenizer, &self.render())?;
        Ok(self.tokens.get_or_init(|| encoded))
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> Result<usize> {
        Ok(self.tokens(tokenizer)?.len())
    }
}

fn encode(tokenizer: &dyn Tokenizer, text: &str) -> Result<Vec<TokenId>> {
    tokenizer
        .encode(text)
        .map_err(|e| RuntimeError::BackendStepFailed(format!("tokenizer: {:#}", e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub tokens: Vec<TokenId>,
    /// How many of the newest history turns made it in.
    pub turns_included: usize,
    pub truncated: bool,
}

/// Fits conversation history into `limit - max_new_tokens` input tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextWindow {
    limit: usize,
}

impl ContextWindow {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn input_budget(&self, max_new_tokens: usize) -> Result<usize> {
        if max_new_tokens == 0 || max_new_tokens >= self.limit {
            return Err(RuntimeError::InvalidSampleParams("max_new_tokens"));
        }
        Ok(self.limit - max_new_tokens)
    }

    /// Builds the prompt: optional BOS, optional system turn, as many of the
    /// newest turns as fit, then the assistant cue.
    ///
    /// Turns are added newest to oldest and the walk stops at the first one
    /// that does not fit. The newest turn is always taken; if the result is
    /// still over budget only its last `budget` tokens are kept.
    pub fn assemble(
        &self,
        history: &[ConversationTurn],
        system: Option<&ConversationTurn>,
        tokenizer: &dyn Tokenizer,
        max_new_tokens: usize,
    ) -> Result<AssembledPrompt> {
        let budget = self.input_budget(max_new_tokens)?;

        let mut head: Vec<TokenId> = Vec::new();
        if let Some(bos) = tokenizer.bos_token() {
            head.push(bos);
        }
        if let Some(system) = system {
            head.extend_from_slice(system.tokens(tokenizer)?);
        }
        let cue = encode(tokenizer, &format!("{}:", Role::Assistant.label()))?;

        let mut running = head.len() + cue.len();
        let mut included: Vec<&[TokenId]> = Vec::new();
        for (n, turn) in history.iter().rev().enumerate() {
            let tokens = turn.tokens(tokenizer)?;
            if n > 0 && running + tokens.len() > budget {
                break;
            }
            running += tokens.len();
            included.push(tokens);
        }

        let turns_included = included.len();
        let mut tokens = head;
        for turn in included.into_iter().rev() {
            tokens.extend_from_slice(turn);
        }
        tokens.extend_from_slice(&cue);

        let mut truncated = turns_included < history.len();
        if tokens.len() > budget {
            tokens.drain(..tokens.len() - budget);
            truncated = true;
        }

        Ok(AssembledPrompt {
            tokens,
            turns_included,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per byte.
    struct ByteTokenizer;

    impl Tokenizer for ByteTokenizer {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
            Ok(text.bytes().map(|b| TokenId(b as u32 + 3)).collect())
        }

        fn decode(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
            let bytes: Vec<u8> = tokens.iter().filter(|t| t.0 >= 3).map(|t| (t.0 - 3) as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn vocab_size(&self) -> usize {
            259
        }

        fn eos_token(&self) -> TokenId {
            TokenId(2)
        }
    }

    #[test]
    fn test_max_new_tokens_bounds() {
        let window = ContextWindow::new(64);
        assert_eq!(window.input_budget(16).unwrap(), 48);
        assert_eq!(
            window.input_budget(0),
            Err(RuntimeError::InvalidSampleParams("max_new_tokens"))
        );
        assert!(window.input_budget(64).is_err());
    }

    #[test]
    fn test_all_turns_fit() {
        let history = vec![ConversationTurn::user("hi"), ConversationTurn::assistant("hello")];
        let prompt = ContextWindow::new(256).assemble(&history, None, &ByteTokenizer, 32).unwrap();

        let text = ByteTokenizer.decode(&prompt.tokens).unwrap();
        assert_eq!(text, "user: hi\nassistant: hello\nassistant:");
        assert_eq!(prompt.turns_included, 2);
        assert!(!prompt.truncated);
    }

    #[test]
    fn test_oldest_turns_dropped_first() {
        let history: Vec<_> = (0..20)
            .map(|i| ConversationTurn::user(format!("message number {:02}", i)))
            .collect();
        let window = ContextWindow::new(128);
        let prompt = window.assemble(&history, None, &ByteTokenizer, 32).unwrap();

        assert!(prompt.tokens.len() <= 96);
        assert!(prompt.truncated);
        let text = ByteTokenizer.decode(&prompt.tokens).unwrap();
        assert!(text.contains("message number 19"));
        assert!(!text.contains("message number 00"));
    }

    #[test]
    fn test_stops_at_first_turn_that_does_not_fit() {
        let history = vec![
            ConversationTurn::user("a"),
            ConversationTurn::user("x".repeat(40)),
            ConversationTurn::user("b"),
        ];
        let prompt = ContextWindow::new(64).assemble(&history, None, &ByteTokenizer, 24).unwrap();
        let text = ByteTokenizer.decode(&prompt.tokens).unwrap();
        assert_eq!(text, "user: b\nassistant:");
        assert_eq!(prompt.turns_included, 1);
    }

    #[test]
    fn test_oversized_newest_turn_keeps_tail() {
        let history = vec![ConversationTurn::user("y".repeat(500))];
        let prompt = ContextWindow::new(128).assemble(&history, None, &ByteTokenizer, 28).unwrap();
        assert_eq!(prompt.tokens.len(), 100);
        assert!(prompt.truncated);
        let text = ByteTokenizer.decode(&prompt.tokens).unwrap();
        assert!(text.ends_with("yyy\nassistant:"));
    }

    #[test]
    fn test_system_turn_is_reserved() {
        let history = vec![ConversationTurn::user("hi")];
        let system = ConversationTurn::system("be brief");
        let prompt = ContextWindow::new(256)
            .assemble(&history, Some(&system), &ByteTokenizer, 32)
            .unwrap();
        let text = ByteTokenizer.decode(&prompt.tokens).unwrap();
        assert_eq!(text, "system: be brief\nuser: hi\nassistant:");
    }

    #[test]
    fn test_turn_tokens_are_cached() {
        let turn = ConversationTurn::user("abc");
        assert_eq!(turn.token_count(&ByteTokenizer).unwrap(), 10);
        assert_eq!(turn.tokens(&ByteTokenizer).unwrap().len(), 10);
    }
}
