use std::fs::File;
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use candle_core::quantized::gguf_file;
use tracing::info;

use crate::core::cache::KvCache;
use crate::core::model::{
    Accelerator, ArtifactFormat, Backend, BackendHandle, CacheLayout, LoadOptions, LoadedModel, ModelArtifact,
    TokenId,
};
use crate::core::tokenizer::VocabTokenizer;
use crate::infra::gguf;

/// Quantized llama-family checkpoints in GGUF, executed by candle.
#[derive(Debug, Default, Clone, Copy)]
pub struct GgufBackend;

impl GgufBackend {
    pub fn new() -> Self {
        Self
    }

    fn device(accelerator: Accelerator) -> anyhow::Result<Device> {
        match accelerator {
            Accelerator::Cpu => Ok(Device::Cpu),
            Accelerator::Gpu => Device::new_cuda(0)
                .or_else(|_| Device::new_metal(0))
                .context("no CUDA or Metal device available"),
            Accelerator::Npu => anyhow::bail!("NPU execution is not supported by the candle backend"),
        }
    }
}

impl Backend for GgufBackend {
    fn name(&self) -> &str {
        "gguf"
    }

    fn load(&self, artifact: &ModelArtifact, options: &LoadOptions) -> anyhow::Result<LoadedModel> {
        if artifact.format() != ArtifactFormat::Gguf {
            anyhow::bail!("gguf backend cannot load {} artifacts", artifact.format());
        }

        let device = Self::device(options.accelerator)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.threads.max(1))
            .build()
            .context("failed to build decode thread pool")?;

        let mut file = File::open(artifact.path())
            .with_context(|| format!("failed to open {}", artifact.path().display()))?;
        let content = gguf_file::Content::read(&mut file).context("failed to read GGUF metadata")?;

        let vocab = gguf::vocabulary(&content)?;
        let layers = gguf::block_count(&content)?;
        let arch = gguf::architecture(&content)?;
        let weights = ModelWeights::from_gguf(content, &mut file, &device).context("failed to load GGUF tensors")?;

        info!(
            path = %artifact.path().display(),
            arch = %arch,
            layers,
            vocab = vocab.size(),
            device = ?device,
            threads = options.threads,
            "loaded gguf weights"
        );

        Ok(LoadedModel {
            handle: Box::new(GgufHandle {
                weights,
                device,
                pool,
                layers,
                evaluated: 0,
            }),
            tokenizer: Arc::new(VocabTokenizer::new(vocab)),
        })
    }
}

struct GgufHandle {
    weights: ModelWeights,
    device: Device,
    pool: rayon::ThreadPool,
    layers: usize,
    /// Positions held by candle's internal attention cache.
    evaluated: usize,
}

fn run(weights: &mut ModelWeights, device: &Device, tokens: &[TokenId], index_pos: usize) -> anyhow::Result<Tensor> {
    let ids: Vec<u32> = tokens.iter().map(|t| t.0).collect();
    let input = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
    Ok(weights.forward(&input, index_pos)?)
}

impl BackendHandle for GgufHandle {
    /// Key/value tensors live device-side inside candle; the arena only
    /// tracks committed positions.
    fn layout(&self) -> CacheLayout {
        CacheLayout {
            layers: self.layers,
            hidden_size: 0,
        }
    }

    /// candle only appends to its cache, so a prefix survives only when it
    /// covers every evaluated position.
    fn reusable_prefix(&self, common: usize) -> usize {
        if common == self.evaluated {
            common
        } else {
            0
        }
    }

    fn forward_step(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> anyhow::Result<Vec<f32>> {
        let Self {
            weights,
            device,
            pool,
            evaluated,
            ..
        } = self;

        // candle can only drop its cache by restarting at position zero
        if cache.len() != *evaluated || cache.len() > tokens.len() {
            cache.truncate(0);
        }
        let start = cache.len();
        if start >= tokens.len() {
            anyhow::bail!("no new tokens to evaluate");
        }
        *evaluated = 0;

        let logits = pool.install(|| -> anyhow::Result<Tensor> {
            if start == 0 {
                return run(weights, device, tokens, 0);
            }
            // quantized_llama builds a (seq_len, seq_len) mask, which cannot
            // broadcast over cached positions; feed the suffix one token at a time
            let mut last = None;
            for (offset, token) in tokens[start..].iter().enumerate() {
                last = Some(run(weights, device, std::slice::from_ref(token), start + offset)?);
            }
            last.context("no new tokens to evaluate")
        })?;

        let logits = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        cache.advance(tokens.len() - start)?;
        *evaluated = tokens.len();
        Ok(logits)
    }
}
