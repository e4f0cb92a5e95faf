use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt};
use candle_core::quantized::gguf_file::{Content, Value};
use std::io::Read;

use crate::core::model::TokenId;
use crate::core::tokenizer::{TokenType, Vocabulary};

pub const GGUF_MAGIC: u32 = 0x46554747;

/// Fixed-size prefix of a GGUF file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    pub const SIZE: u64 = 24;

    pub fn read<R: Read>(reader: &mut R) -> anyhow::Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            anyhow::bail!("invalid GGUF magic: expected 0x{:08X}, got 0x{:08X}", GGUF_MAGIC, magic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !(1..=3).contains(&version) {
            anyhow::bail!("unsupported GGUF version {}", version);
        }

        let tensor_count = reader.read_u64::<LittleEndian>()?;
        let metadata_kv_count = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            version,
            tensor_count,
            metadata_kv_count,
        })
    }
}

fn metadata<'a>(content: &'a Content, key: &str) -> anyhow::Result<&'a Value> {
    content
        .metadata
        .get(key)
        .with_context(|| format!("GGUF metadata is missing `{}`", key))
}

pub fn architecture(content: &Content) -> anyhow::Result<String> {
    Ok(metadata(content, "general.architecture")?.to_string()?.clone())
}

pub fn block_count(content: &Content) -> anyhow::Result<usize> {
    let arch = architecture(content)?;
    Ok(metadata(content, &format!("{}.block_count", arch))?.to_u32()? as usize)
}

/// Builds a vocabulary from the `tokenizer.ggml.*` keys.
pub fn vocabulary(content: &Content) -> anyhow::Result<Vocabulary> {
    let tokens = metadata(content, "tokenizer.ggml.tokens")?
        .to_vec()?
        .iter()
        .map(|v| v.to_string().cloned())
        .collect::<Result<Vec<String>, _>>()?;

    let eos = metadata(content, "tokenizer.ggml.eos_token_id")?.to_u32()?;
    let mut vocab = Vocabulary::new(tokens, TokenId(eos));

    if let Some(bos) = content.metadata.get("tokenizer.ggml.bos_token_id") {
        vocab = vocab.with_bos(TokenId(bos.to_u32()?));
    }

    if let Some(types) = content.metadata.get("tokenizer.ggml.token_type") {
        let types = types
            .to_vec()?
            .iter()
            .map(|v| v.to_i32().map(TokenType::from_ggml))
            .collect::<Result<Vec<_>, _>>()?;
        if types.len() == vocab.tokens.len() {
            vocab.types = types;
        }
    }

    Ok(vocab)
}
