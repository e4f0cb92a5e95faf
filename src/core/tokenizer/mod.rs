pub mod sentencepiece;

pub use sentencepiece::VocabTokenizer;

use crate::core::model::TokenId;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>>;

    fn decode(&self, tokens: &[TokenId]) -> anyhow::Result<String>;

    fn vocab_size(&self) -> usize;

    fn eos_token(&self) -> TokenId;

    /// Token prepended once to every assembled prompt, if the model uses one.
    fn bos_token(&self) -> Option<TokenId> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    pub tokens: Vec<String>,
    pub types: Vec<TokenType>,
    pub bos_token: Option<TokenId>,
    pub eos_token: TokenId,
}

impl Vocabulary {
    pub fn new(tokens: Vec<String>, eos_token: TokenId) -> Self {
        let types = tokens.iter().map(|t| TokenType::infer(t)).collect();
        Self {
            tokens,
            types,
            bos_token: None,
            eos_token,
        }
    }

    pub fn with_bos(mut self, bos: TokenId) -> Self {
        self.bos_token = Some(bos);
        self
    }

    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    pub fn token(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id.index()).map(|s| s.as_str())
    }

    pub fn token_type(&self, id: TokenId) -> TokenType {
        self.types.get(id.index()).copied().unwrap_or(TokenType::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Normal,
    Unknown,
    Control,
    Byte,
}

impl TokenType {
    /// Matches the GGUF `tokenizer.ggml.token_type` numbering.
    pub fn from_ggml(value: i32) -> Self {
        match value {
            2 => TokenType::Unknown,
            3 => TokenType::Control,
            6 => TokenType::Byte,
            _ => TokenType::Normal,
        }
    }

    fn infer(token: &str) -> Self {
        if parse_byte_token(token).is_some() {
            TokenType::Byte
        } else if token.len() > 2 && token.starts_with('<') && token.ends_with('>') {
            TokenType::Control
        } else {
            TokenType::Normal
        }
    }
}

/// `<0x0A>` -> `0x0A`
pub(crate) fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
