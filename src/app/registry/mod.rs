use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::events::{Event, EventBus};
use crate::config::RuntimeConfig;
use crate::core::model::{Accelerator, Backend, LoadOptions, ModelSlot, ModelSource, ModelTier};
use crate::core::resource::{BudgetPolicy, ResourceBudgetAdvisor, ResourceDecision, ResourceProbe, ResourceSnapshot};
use crate::core::session::{InferenceSession, SessionConfig};
use crate::core::validate::ArtifactValidator;
use crate::error::{Result, RuntimeError};
use crate::format::human_bytes;
use crate::infra::storage::DirectorySource;
use crate::infra::system::SystemProbe;

/// A loaded session. `None` once the slot has been unloaded underneath a
/// caller that still holds the cell.
pub type SessionCell = Arc<Mutex<Option<InferenceSession>>>;

type SharedLoad = Shared<BoxFuture<'static, Result<()>>>;
type SharedUnload = Shared<BoxFuture<'static, ()>>;

enum SlotState {
    Unloaded,
    Loading(SharedLoad),
    Ready(SessionCell),
    Unloading(SharedUnload),
    Failed(RuntimeError),
}

impl SlotState {
    fn kind(&self) -> SlotStateKind {
        match self {
            SlotState::Unloaded => SlotStateKind::Unloaded,
            SlotState::Loading(_) => SlotStateKind::Loading,
            SlotState::Ready(_) => SlotStateKind::Ready,
            SlotState::Unloading(_) => SlotStateKind::Unloading,
            SlotState::Failed(_) => SlotStateKind::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStateKind {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotStatus {
    pub slot: ModelSlot,
    pub state: SlotStateKind,
    pub backend: Option<String>,
    /// Failure or refusal message of the last unsuccessful load.
    pub reason: Option<String>,
    pub last_loaded_at: Option<DateTime<Utc>>,
    /// Failed attempts since the last successful load.
    pub retry_count: u32,
    pub tier: Option<ModelTier>,
    pub artifact: Option<PathBuf>,
}

struct SlotInner {
    state: SlotState,
    last_loaded_at: Option<DateTime<Utc>>,
    retry_count: u32,
    reason: Option<String>,
    tier: Option<ModelTier>,
    artifact: Option<PathBuf>,
}

struct SlotEntry {
    slot: ModelSlot,
    backend: Option<Arc<dyn Backend>>,
    inner: Mutex<SlotInner>,
}

struct Loaded {
    session: InferenceSession,
    tier: ModelTier,
    backend: String,
}

/// Everything a load needs, shared with the blocking load task.
struct SlotLoader {
    advisor: ResourceBudgetAdvisor,
    source: Arc<dyn ModelSource>,
    session: SessionConfig,
    accelerator: Accelerator,
    load_test: bool,
    probe_format: bool,
}

impl SlotLoader {
    fn load(&self, entry: &SlotEntry) -> Result<Loaded> {
        let slot = entry.slot;
        let backend = entry
            .backend
            .clone()
            .ok_or_else(|| RuntimeError::BackendLoadFailed(format!("no backend bound to slot {}", slot)))?;

        let (snapshot, decision) = self.advisor.assess_now()?;
        info!(
            %slot,
            tier = %decision.tier,
            allowed = decision.allowed,
            "{} | {}",
            snapshot.summary(),
            decision.reason
        );
        if !decision.allowed {
            return Err(RuntimeError::InsufficientResources(decision.reason));
        }

        let resolved = self.source.resolve(slot, decision.tier)?;
        let options = LoadOptions {
            threads: decision.threads,
            accelerator: self.accelerator,
        };

        let mut validator = ArtifactValidator::new().with_trial_loader(backend.clone(), options);
        if !self.probe_format {
            validator = validator.without_format_probe();
        }
        let artifact = validator.validate_resolved(&resolved, false)?;

        if artifact.size() > decision.max_artifact_bytes {
            return Err(RuntimeError::InsufficientResources(format!(
                "{} is {} but the {} tier allows at most {}",
                artifact.path().display(),
                human_bytes(artifact.size()),
                decision.tier,
                human_bytes(decision.max_artifact_bytes)
            )));
        }
        // trial load only once the artifact fits the tier
        if self.load_test {
            validator.trial_load(&artifact)?;
        }

        let model = match backend.load(&artifact, &options) {
            Ok(model) => model,
            Err(e) if options.accelerator != Accelerator::Cpu => {
                warn!(%slot, accelerator = ?options.accelerator, "accelerated load failed, retrying on CPU: {:#}", e);
                backend
                    .load(&artifact, &options.cpu_only())
                    .map_err(|e| RuntimeError::BackendLoadFailed(format!("{:#}", e)))?
            }
            Err(e) => return Err(RuntimeError::BackendLoadFailed(format!("{:#}", e))),
        };

        Ok(Loaded {
            session: InferenceSession::new(slot, artifact, model, &self.session),
            tier: decision.tier,
            backend: backend.name().to_string(),
        })
    }
}

/// Owns one lifecycle state machine per [`ModelSlot`].
///
/// `Unloaded -> Loading -> Ready -> Unloading -> Unloaded`, with
/// `Loading -> Failed -> Loading` on retry. Concurrent `ensure_loaded`
/// calls share a single in-flight load and observe the same outcome.
pub struct ModelSlotRegistry {
    slots: HashMap<ModelSlot, Arc<SlotEntry>>,
    loader: Arc<SlotLoader>,
    events: Arc<EventBus>,
}

pub struct RegistryBuilder {
    backends: HashMap<ModelSlot, Arc<dyn Backend>>,
    source: Arc<dyn ModelSource>,
    probe: Arc<dyn ResourceProbe>,
    policy: BudgetPolicy,
    session: SessionConfig,
    accelerator: Accelerator,
    load_test: bool,
    probe_format: bool,
    events: Option<Arc<EventBus>>,
}

impl RegistryBuilder {
    pub fn bind(mut self, slot: ModelSlot, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(slot, backend);
        self
    }

    pub fn policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn load_test(mut self, enabled: bool) -> Self {
        self.load_test = enabled;
        self
    }

    pub fn probe_format(mut self, enabled: bool) -> Self {
        self.probe_format = enabled;
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> ModelSlotRegistry {
        let events = self.events.unwrap_or_default();
        let mut backends = self.backends;

        let slots = ModelSlot::ALL
            .into_iter()
            .map(|slot| {
                let entry = SlotEntry {
                    slot,
                    backend: backends.remove(&slot),
                    inner: Mutex::new(SlotInner {
                        state: SlotState::Unloaded,
                        last_loaded_at: None,
                        retry_count: 0,
                        reason: None,
                        tier: None,
                        artifact: None,
                    }),
                };
                (slot, Arc::new(entry))
            })
            .collect();

        let loader = SlotLoader {
            advisor: ResourceBudgetAdvisor::new(self.policy, self.probe),
            source: self.source,
            session: self.session,
            accelerator: self.accelerator,
            load_test: self.load_test,
            probe_format: self.probe_format,
        };

        ModelSlotRegistry {
            slots,
            loader: Arc::new(loader),
            events,
        }
    }
}

enum Pending {
    Load(SharedLoad),
    Unload(SharedUnload),
}

impl ModelSlotRegistry {
    pub fn builder(source: Arc<dyn ModelSource>, probe: Arc<dyn ResourceProbe>) -> RegistryBuilder {
        RegistryBuilder {
            backends: HashMap::new(),
            source,
            probe,
            policy: BudgetPolicy::default(),
            session: SessionConfig::default(),
            accelerator: Accelerator::Cpu,
            load_test: false,
            probe_format: true,
            events: None,
        }
    }

    /// Directory source and live system probe, tuned from `config`.
    pub fn from_config(config: &RuntimeConfig) -> RegistryBuilder {
        let source = DirectorySource::new(&config.models_dir, config.slots.clone());
        let probe = SystemProbe::new(&config.models_dir);
        Self::builder(Arc::new(source), Arc::new(probe))
            .policy(config.budget_policy())
            .session_config(config.session_config())
            .accelerator(config.accelerator)
            .load_test(config.load_test)
            .probe_format(config.probe_format)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn entry(&self, slot: ModelSlot) -> Result<&Arc<SlotEntry>> {
        self.slots
            .get(&slot)
            .ok_or_else(|| RuntimeError::BackendLoadFailed(format!("unknown slot {}", slot)))
    }

    /// Fresh resource assessment, as a load would see it right now.
    pub fn assess(&self) -> Result<(ResourceSnapshot, ResourceDecision)> {
        self.loader.advisor.assess_now()
    }

    pub async fn ensure_loaded(&self, slot: ModelSlot) -> Result<()> {
        let entry = self.entry(slot)?;
        loop {
            let pending = {
                let mut inner = entry.inner.lock();
                match &inner.state {
                    SlotState::Ready(_) => return Ok(()),
                    SlotState::Loading(load) => Pending::Load(load.clone()),
                    SlotState::Unloading(unload) => Pending::Unload(unload.clone()),
                    SlotState::Unloaded | SlotState::Failed(_) => {
                        let load = self.start_load(entry.clone());
                        inner.state = SlotState::Loading(load.clone());
                        Pending::Load(load)
                    }
                }
            };

            match pending {
                Pending::Load(load) => return load.await,
                Pending::Unload(unload) => unload.await,
            }
        }
    }

    fn start_load(&self, entry: Arc<SlotEntry>) -> SharedLoad {
        let loader = self.loader.clone();
        let events = self.events.clone();
        let slot = entry.slot;

        let task = tokio::spawn(async move {
            events.publish(Event::Loading { slot });
            info!(%slot, "loading slot");

            let job_entry = entry.clone();
            let outcome = tokio::task::spawn_blocking(move || loader.load(&job_entry))
                .await
                .unwrap_or_else(|e| Err(RuntimeError::BackendLoadFailed(format!("load task failed: {}", e))));

            let (result, event) = {
                let mut inner = entry.inner.lock();
                match outcome {
                    Ok(loaded) => {
                        inner.last_loaded_at = Some(Utc::now());
                        inner.retry_count = 0;
                        inner.reason = None;
                        inner.tier = Some(loaded.tier);
                        inner.artifact = Some(loaded.session.artifact().path().to_path_buf());
                        inner.state = SlotState::Ready(Arc::new(Mutex::new(Some(loaded.session))));
                        let event = Event::Loaded {
                            slot,
                            tier: loaded.tier,
                            backend: loaded.backend,
                        };
                        (Ok(()), event)
                    }
                    Err(e) => {
                        inner.retry_count += 1;
                        inner.reason = Some(e.to_string());
                        inner.state = SlotState::Failed(e.clone());
                        let event = Event::LoadFailed {
                            slot,
                            error: e.to_string(),
                        };
                        (Err(e), event)
                    }
                }
            };

            match &result {
                Ok(()) => info!(%slot, "slot ready"),
                Err(e) => warn!(%slot, retryable = e.is_retryable(), "slot load failed: {}", e),
            }
            events.publish(event);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(RuntimeError::BackendLoadFailed(format!("load task failed: {}", e))))
        }
        .boxed()
        .shared()
    }

    /// Releases the slot's session and cache. No-op when nothing is loaded;
    /// an in-flight load is awaited first.
    pub async fn unload(&self, slot: ModelSlot) -> Result<()> {
        let entry = self.entry(slot)?;
        loop {
            let pending = {
                let mut inner = entry.inner.lock();
                match &inner.state {
                    SlotState::Unloaded => return Ok(()),
                    SlotState::Failed(_) => {
                        inner.state = SlotState::Unloaded;
                        inner.reason = None;
                        inner.retry_count = 0;
                        return Ok(());
                    }
                    SlotState::Loading(load) => Pending::Load(load.clone()),
                    SlotState::Unloading(unload) => Pending::Unload(unload.clone()),
                    SlotState::Ready(cell) => {
                        let unload = self.start_unload(entry.clone(), cell.clone());
                        inner.state = SlotState::Unloading(unload.clone());
                        Pending::Unload(unload)
                    }
                }
            };

            match pending {
                Pending::Load(load) => {
                    let _ = load.await;
                }
                Pending::Unload(unload) => {
                    unload.await;
                    return Ok(());
                }
            }
        }
    }

    fn start_unload(&self, entry: Arc<SlotEntry>, cell: SessionCell) -> SharedUnload {
        let events = self.events.clone();
        let slot = entry.slot;

        let task = tokio::spawn(async move {
            // waits for any generation still holding the session
            let released = tokio::task::spawn_blocking(move || {
                if let Some(session) = cell.lock().take() {
                    session.release();
                }
            })
            .await;
            if let Err(e) = released {
                warn!(%slot, "session release failed: {}", e);
            }

            entry.inner.lock().state = SlotState::Unloaded;
            info!(%slot, "slot unloaded");
            events.publish(Event::Unloaded { slot });
        });

        async move {
            if let Err(e) = task.await {
                warn!(%slot, "unload task failed: {}", e);
            }
        }
        .boxed()
        .shared()
    }

    pub async fn unload_all(&self) {
        let unloads = ModelSlot::ALL.into_iter().map(|slot| self.unload(slot));
        for (slot, outcome) in ModelSlot::ALL.into_iter().zip(futures::future::join_all(unloads).await) {
            if let Err(e) = outcome {
                warn!(%slot, "unload failed: {}", e);
            }
        }
    }

    /// The ready session, or `SessionNotReady`.
    pub fn session(&self, slot: ModelSlot) -> Result<SessionCell> {
        let entry = self.entry(slot)?;
        let inner = entry.inner.lock();
        match &inner.state {
            SlotState::Ready(cell) => Ok(cell.clone()),
            state => {
                debug!(%slot, state = ?state.kind(), "session requested while not ready");
                Err(RuntimeError::SessionNotReady)
            }
        }
    }

    pub fn status(&self, slot: ModelSlot) -> Result<SlotStatus> {
        let entry = self.entry(slot)?;
        let inner = entry.inner.lock();
        let reason = match &inner.state {
            SlotState::Failed(e) => Some(e.to_string()),
            _ => inner.reason.clone(),
        };
        Ok(SlotStatus {
            slot,
            state: inner.state.kind(),
            backend: entry.backend.as_ref().map(|b| b.name().to_string()),
            reason,
            last_loaded_at: inner.last_loaded_at,
            retry_count: inner.retry_count,
            tier: inner.tier,
            artifact: inner.artifact.clone(),
        })
    }

    pub fn statuses(&self) -> Vec<SlotStatus> {
        ModelSlot::ALL.into_iter().filter_map(|slot| self.status(slot).ok()).collect()
    }
}
