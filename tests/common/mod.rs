#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assistant_runtime::core::cache::CacheKey;
use assistant_runtime::core::model::CacheLayout;
use assistant_runtime::core::resource::StaticProbe;
use assistant_runtime::core::session::SessionConfig;
use assistant_runtime::config::SlotArtifactConfig;
use assistant_runtime::{
    Accelerator, ArtifactFormat, Backend, BackendHandle, DirectorySource, KvCache, LoadOptions, LoadedModel,
    ModelArtifact, ModelRuntime, ModelSlot, ModelSlotRegistry, ResourceSnapshot, TokenId, Tokenizer,
};
use parking_lot::Mutex;
use tempfile::TempDir;

pub const EOS: u32 = 2;
pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

pub fn byte(b: u8) -> u32 {
    b as u32 + 3
}

/// One token per byte, offset past the control ids.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
        Ok(text.bytes().map(|b| TokenId(byte(b))).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> anyhow::Result<String> {
        let bytes: Vec<u8> = tokens.iter().filter(|t| t.0 >= 3).map(|t| (t.0 - 3) as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        259
    }

    fn eos_token(&self) -> TokenId {
        TokenId(EOS)
    }
}

/// Backend that replays a fixed reply and records how it was used.
#[derive(Default)]
pub struct ScriptedBackend {
    pub reply: Vec<u32>,
    pub load_delay: Duration,
    pub loads: AtomicUsize,
    pub fail_loads: AtomicBool,
    pub fail_accelerated: bool,
    pub fail_step: Arc<AtomicBool>,
    pub released: Arc<AtomicUsize>,
    pub accelerators: Mutex<Vec<Accelerator>>,
}

impl ScriptedBackend {
    pub fn replying(text: &str) -> Self {
        let mut reply: Vec<u32> = text.bytes().map(byte).collect();
        reply.push(EOS);
        Self {
            reply,
            ..Default::default()
        }
    }

    pub fn endless(b: u8) -> Self {
        Self {
            reply: vec![byte(b); 4096],
            ..Default::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn load(&self, _artifact: &ModelArtifact, options: &LoadOptions) -> anyhow::Result<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.accelerators.lock().push(options.accelerator);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            anyhow::bail!("weights are corrupt");
        }
        if self.fail_accelerated && options.accelerator != Accelerator::Cpu {
            anyhow::bail!("accelerator unavailable");
        }

        Ok(LoadedModel {
            handle: Box::new(ScriptedHandle {
                reply: self.reply.clone(),
                cursor: 0,
                fail_step: self.fail_step.clone(),
                released: self.released.clone(),
            }),
            tokenizer: Arc::new(ByteTokenizer),
        })
    }
}

struct ScriptedHandle {
    reply: Vec<u32>,
    cursor: usize,
    fail_step: Arc<AtomicBool>,
    released: Arc<AtomicUsize>,
}

impl BackendHandle for ScriptedHandle {
    fn layout(&self) -> CacheLayout {
        CacheLayout {
            layers: 2,
            hidden_size: 4,
        }
    }

    fn forward_step(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> anyhow::Result<Vec<f32>> {
        if self.fail_step.load(Ordering::SeqCst) {
            anyhow::bail!("device lost");
        }
        // a fresh prompt restarts the reply
        if tokens.len() - cache.len() > 1 {
            self.cursor = 0;
        }
        for pos in cache.len()..tokens.len() {
            for layer in 0..2 {
                let row = [tokens[pos].0 as f32, pos as f32, layer as f32, 1.0];
                cache.write(CacheKey::new(layer, pos), &row, &row)?;
            }
        }
        cache.advance(tokens.len() - cache.len())?;

        let next = self.reply.get(self.cursor).copied().unwrap_or(EOS);
        self.cursor += 1;
        let mut logits = vec![-20.0; 259];
        logits[next as usize] = 20.0;
        Ok(logits)
    }

    fn release(self: Box<Self>) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn snapshot(total_mem: u64, used_mem: u64, total_disk: u64, used_disk: u64) -> ResourceSnapshot {
    ResourceSnapshot {
        total_memory: total_mem,
        available_memory: total_mem - used_mem,
        total_storage: total_disk,
        available_storage: total_disk - used_disk,
        cpu_core_count: 4,
        approximate_cpu_load: 0.1,
    }
}

/// 8 GiB device, a quarter used.
pub fn roomy() -> ResourceSnapshot {
    snapshot(8 * GIB, 2 * GIB, 128 * GIB, 16 * GIB)
}

pub struct Setup {
    pub backend: ScriptedBackend,
    pub snapshot: ResourceSnapshot,
    pub session: SessionConfig,
    pub accelerator: Accelerator,
    /// `None` leaves the artifact missing.
    pub artifact_bytes: Option<u64>,
    pub load_test: bool,
}

impl Setup {
    pub fn new(backend: ScriptedBackend) -> Self {
        Self {
            backend,
            snapshot: roomy(),
            session: SessionConfig {
                context_limit: 256,
                max_new_tokens: 64,
                seed: Some(1),
            },
            accelerator: Accelerator::Cpu,
            artifact_bytes: Some(4096),
            load_test: false,
        }
    }

    pub fn build(self) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let chat_dir = dir.path().join("chat");
        std::fs::create_dir_all(&chat_dir).unwrap();
        if let Some(len) = self.artifact_bytes {
            let file = std::fs::File::create(chat_dir.join("model.bin")).unwrap();
            file.set_len(len).unwrap();
        }

        let mut slots = std::collections::BTreeMap::new();
        slots.insert(
            ModelSlot::Chat,
            SlotArtifactConfig {
                file: "model.bin".into(),
                format: Some(ArtifactFormat::Raw),
                size: None,
            },
        );

        let backend = Arc::new(self.backend);
        let registry = ModelSlotRegistry::builder(
            Arc::new(DirectorySource::new(dir.path(), slots)),
            Arc::new(StaticProbe(self.snapshot)),
        )
        .bind(ModelSlot::Chat, backend.clone())
        .session_config(self.session)
        .accelerator(self.accelerator)
        .load_test(self.load_test)
        .build();

        Fixture {
            _dir: dir,
            runtime: ModelRuntime::new(registry, self.session),
            backend,
        }
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub runtime: ModelRuntime,
    pub backend: Arc<ScriptedBackend>,
}
