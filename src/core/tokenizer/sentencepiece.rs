use super::{parse_byte_token, TokenType, Tokenizer, Vocabulary};
use crate::core::model::TokenId;
use std::collections::HashMap;

const SPACE: char = '▁';

/// Greedy longest-match tokenizer over a SentencePiece-style vocabulary,
/// with `<0xXX>` byte fallback for characters the vocabulary lacks.
pub struct VocabTokenizer {
    vocab: Vocabulary,
    encoder: HashMap<String, TokenId>,
    bytes: [Option<TokenId>; 256],
    max_token_chars: usize,
}

impl VocabTokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        let mut encoder = HashMap::new();
        let mut bytes = [None; 256];
        let mut max_token_chars = 1;

        for (i, token) in vocab.tokens.iter().enumerate() {
            let id = TokenId(i as u32);
            match vocab.token_type(id) {
                TokenType::Byte => {
                    if let Some(b) = parse_byte_token(token) {
                        bytes[b as usize] = Some(id);
                    }
                }
                TokenType::Control | TokenType::Unknown => {}
                TokenType::Normal => {
                    max_token_chars = max_token_chars.max(token.chars().count());
                    encoder.entry(token.clone()).or_insert(id);
                }
            }
        }

        Self {
            vocab,
            encoder,
            bytes,
            max_token_chars,
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        let normalized = text.replace(' ', &SPACE.to_string());
        let chars: Vec<char> = normalized.chars().collect();
        let mut tokens = Vec::with_capacity(chars.len());

        let mut i = 0;
        while i < chars.len() {
            let longest = self.max_token_chars.min(chars.len() - i);
            let mut matched = None;
            for len in (1..=longest).rev() {
                let piece: String = chars[i..i + len].iter().collect();
                if let Some(&id) = self.encoder.get(&piece) {
                    matched = Some((id, len));
                    break;
                }
            }

            match matched {
                Some((id, len)) => {
                    tokens.push(id);
                    i += len;
                }
                None => {
                    let ch = if chars[i] == SPACE { ' ' } else { chars[i] };
                    let mut buf = [0u8; 4];
                    for b in ch.encode_utf8(&mut buf).bytes() {
                        if let Some(id) = self.bytes[b as usize] {
                            tokens.push(id);
                        }
                    }
                    i += 1;
                }
            }
        }

        Ok(tokens)
    }

    fn decode(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        let mut out: Vec<u8> = Vec::new();

        for &id in tokens {
            let Some(token) = self.vocab.token(id) else {
                continue;
            };
            match self.vocab.token_type(id) {
                TokenType::Byte => {
                    if let Some(b) = parse_byte_token(token) {
                        out.push(b);
                    }
                }
                TokenType::Control | TokenType::Unknown => {}
                TokenType::Normal => {
                    out.extend_from_slice(token.replace(SPACE, " ").as_bytes());
                }
            }
        }

        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn vocab_size(&self) -> usize {
        self.vocab.size()
    }

    fn eos_token(&self) -> TokenId {
        self.vocab.eos_token
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.vocab.bos_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> VocabTokenizer {
        let mut tokens: Vec<String> = vec!["<unk>".into(), "<s>".into(), "</s>".into()];
        tokens.extend(["▁Hello", "▁world", "▁wor", "ld", "!", "H", "e"].map(String::from));
        tokens.extend((0..=255u8).map(|b| format!("<0x{:02X}>", b)));
        VocabTokenizer::new(Vocabulary::new(tokens, TokenId(2)).with_bos(TokenId(1)))
    }

    #[test]
    fn test_longest_match_wins() {
        let tok = tokenizer();
        let ids = tok.encode(" Hello world!").unwrap();
        assert_eq!(ids, vec![TokenId(3), TokenId(4), TokenId(7)]);
        assert_eq!(tok.decode(&ids).unwrap(), " Hello world!");
    }

    #[test]
    fn test_byte_fallback_roundtrips_unicode() {
        let tok = tokenizer();
        let ids = tok.encode("é\n").unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(tok.decode(&ids).unwrap(), "é\n");
    }

    #[test]
    fn test_control_tokens_are_silent() {
        let tok = tokenizer();
        assert_eq!(tok.decode(&[TokenId(1), TokenId(3), TokenId(2)]).unwrap(), " Hello");
        assert_eq!(tok.eos_token(), TokenId(2));
        assert_eq!(tok.bos_token(), Some(TokenId(1)));
        assert_eq!(tok.vocabulary().size(), 3 + 7 + 256);
        assert_eq!(tok.vocab_size(), tok.vocabulary().size());
    }

    #[test]
    fn test_split_multibyte_decodes_lossy() {
        let tok = tokenizer();
        let ids = tok.encode("é").unwrap();
        assert_eq!(tok.decode(&ids[..1]).unwrap(), "\u{FFFD}");
    }
}
