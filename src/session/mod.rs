//! Session lifecycle: one live game session from `start` to `stop`.
//!
//! ## Design
//! - Single-valued state machine `Idle → Active → Idle`, serialized on one
//!   lock
//! - Construction is atomic: every acquired resource registers an async
//!   closer in a LIFO list, and any failure unwinds what was built
//! - The session's long-running work hangs off a background cancellation
//!   token independent of the caller's, so a request scope ending does not
//!   end the session
//! - `stop` runs a final consolidation pass, disconnects, cancels the
//!   background token, then invokes closers in reverse registration order

pub mod agent;
pub mod consolidator;
pub mod context;
pub mod router;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;
use crate::budget::TierSelector;
use crate::config::{EngineConfig, EngineKind};
use crate::ingest::IngestPipeline;
use crate::memory::{EntityDef, EntityStore, KnowledgeGraph, SessionStore};
use crate::mixer::{Mixer, OutputSink};
use crate::platform::{
    Connection, ParticipantChangeKind, Platform,
};
use crate::providers::{LlmProvider, S2sProvider, SttProvider, TtsProvider, VadEngine};

use agent::{CascadeEngine, EngineShared, NpcAgent, NpcEngine, S2sEngine};
use consolidator::Consolidator;
use context::HotContextAssembler;
use router::UtteranceRouter;

// ── Session info ─────────────────────────────────────────────────

/// Immutable description of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub campaign: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub dm_user_id: String,
    pub channel_id: String,
}

/// Deterministic session identifier: `session-{campaign}-{YYYYMMDDThhmmZ}`.
///
/// Sanitization is lowercase plus spaces-to-hyphens, nothing else; an
/// empty campaign name becomes `default`.
pub fn derive_session_id(campaign: &str, at: DateTime<Utc>) -> String {
    let sanitized = campaign.to_lowercase().replace(' ', "-");
    let sanitized = if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    };
    format!("session-{sanitized}-{}", at.format("%Y%m%dT%H%MZ"))
}

// ── Dependencies ─────────────────────────────────────────────────

/// Injected collaborators. Everything the engine consumes arrives here,
/// which is what makes the mock-based test harness possible.
#[derive(Clone)]
pub struct SessionDeps {
    pub platform: Arc<dyn Platform>,
    pub stt: Arc<dyn SttProvider>,
    pub vad: Arc<dyn VadEngine>,
    pub store: Arc<dyn SessionStore>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tts: Option<Arc<dyn TtsProvider>>,
    pub s2s: Option<Arc<dyn S2sProvider>>,
    pub entities: Option<Arc<dyn EntityStore>>,
    pub knowledge_graph: Option<Arc<dyn KnowledgeGraph>>,
}

// ── Orchestrator handle ──────────────────────────────────────────

/// Live control surface of the running session, for the host UI layer
/// (barge-in, DM overrides, queue-depth reporting).
#[derive(Clone)]
pub struct Orchestrator {
    pub mixer: Arc<Mixer>,
    pub router: Arc<UtteranceRouter>,
    pub selector: Arc<TierSelector>,
}

// ── Closers ──────────────────────────────────────────────────────

type CloserFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Closer {
    name: String,
    run: CloserFn,
}

fn closer<F, Fut>(name: impl Into<String>, f: F) -> Closer
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Closer {
        name: name.into(),
        run: Box::new(move || Box::pin(f())),
    }
}

/// Invoke closers in reverse registration order, logging failures.
async fn unwind_closers(closers: &mut Vec<Closer>) {
    while let Some(closer) = closers.pop() {
        if let Err(err) = (closer.run)().await {
            tracing::error!(closer = %closer.name, error = %err, "closer failed");
        }
    }
}

// ── Active session ───────────────────────────────────────────────

struct ActiveSession {
    info: SessionInfo,
    connection: Arc<dyn Connection>,
    mixer: Arc<Mixer>,
    router: Arc<UtteranceRouter>,
    selector: Arc<TierSelector>,
    consolidator: Arc<Consolidator>,
    background: CancellationToken,
    closers: Vec<Closer>,
}

// ── Session manager ──────────────────────────────────────────────

/// Owns at most one live session at a time.
pub struct SessionManager {
    config: EngineConfig,
    deps: SessionDeps,
    state: Mutex<Option<ActiveSession>>,
    /// Whether the most recent `stop` completed cleanly; makes a repeated
    /// `stop` a no-op success rather than an error.
    last_stop_clean: SyncMutex<bool>,
}

impl SessionManager {
    pub fn new(config: EngineConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            state: Mutex::new(None),
            last_stop_clean: SyncMutex::new(false),
        }
    }

    /// Start a session in the given channel. Fails if one is already
    /// active. `cancel` is honored for the duration of the platform
    /// connection attempt only.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        channel_id: &str,
        dm_user_id: &str,
    ) -> anyhow::Result<SessionInfo> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            anyhow::bail!("a session is already active");
        }

        let mut closers = Vec::new();
        match self
            .build(cancel, channel_id, dm_user_id, &mut closers)
            .await
        {
            Ok(mut active) => {
                active.closers = std::mem::take(&mut closers);
                let info = active.info.clone();
                tracing::info!(
                    session_id = %info.session_id,
                    channel_id = %info.channel_id,
                    npcs = self.config.npcs.len(),
                    "session started"
                );
                *state = Some(active);
                *self.last_stop_clean.lock() = false;
                Ok(info)
            }
            Err(err) => {
                tracing::error!(error = %err, "session start failed, unwinding");
                unwind_closers(&mut closers).await;
                Err(err)
            }
        }
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        channel_id: &str,
        dm_user_id: &str,
        closers: &mut Vec<Closer>,
    ) -> anyhow::Result<ActiveSession> {
        let started_at = Utc::now();
        let session_id = derive_session_id(&self.config.campaign, started_at);

        // Platform connection, under the caller's scope.
        let connection = tokio::select! {
            conn = self.deps.platform.connect(cancel, channel_id) => conn?,
            _ = cancel.cancelled() => anyhow::bail!("session start cancelled during connect"),
        };
        {
            let conn = Arc::clone(&connection);
            closers.push(closer("connection", move || async move {
                conn.disconnect().await
            }));
        }

        // Mixer, feeding the connection's output stream. The sender is
        // captured by the closure; once the connection is gone, sends are
        // dropped silently instead of faulting.
        let out_tx = connection.output();
        let (out_rate, out_channels) = connection.output_format();
        let output: OutputSink = Box::new(move |chunk| {
            let tx = out_tx.clone();
            Box::pin(async move {
                let frame = AudioFrame::new(chunk, out_rate, out_channels, Duration::ZERO);
                let _ = tx.send(frame).await;
            })
        });
        let mixer = Arc::new(Mixer::new(output, self.config.mixer.gap()));
        {
            let mixer = Arc::clone(&mixer);
            closers.push(closer("mixer", move || async move {
                mixer.close().await;
                Ok(())
            }));
        }

        let selector = Arc::new(TierSelector::new(self.config.selector.to_selector_config()));
        let hot_context = Arc::new(HotContextAssembler::new(
            Arc::clone(&self.deps.store),
            session_id.clone(),
            self.config.context_window.0,
        ));

        // Session-long work lives under its own token, not the caller's.
        let background = CancellationToken::new();

        let shared = EngineShared {
            mixer: Arc::clone(&mixer),
            store: Arc::clone(&self.deps.store),
            selector: Arc::clone(&selector),
            context: Arc::clone(&hot_context),
            session_id: session_id.clone(),
            output_format: (out_rate, out_channels),
            cancel: background.clone(),
        };

        // One engine and agent per configured NPC.
        let mut agents = Vec::with_capacity(self.config.npcs.len());
        for npc in &self.config.npcs {
            let voice = npc.voice_profile(&self.config.language);
            let engine: Box<dyn NpcEngine> = match npc.engine {
                EngineKind::Cascade => {
                    let llm = self.deps.llm.clone().ok_or_else(|| {
                        anyhow::anyhow!("npc '{}' uses a cascade engine but no llm provider is configured", npc.name)
                    })?;
                    let tts = self.deps.tts.clone().ok_or_else(|| {
                        anyhow::anyhow!("npc '{}' uses a cascade engine but no tts provider is configured", npc.name)
                    })?;
                    Box::new(CascadeEngine::new(
                        npc.name.clone(),
                        npc.persona.clone(),
                        voice.clone(),
                        npc.priority,
                        npc.tier_override,
                        llm,
                        tts,
                        shared.clone(),
                    ))
                }
                EngineKind::S2s => {
                    let s2s = self.deps.s2s.clone().ok_or_else(|| {
                        anyhow::anyhow!("npc '{}' uses an s2s engine but no s2s provider is configured", npc.name)
                    })?;
                    Box::new(
                        S2sEngine::connect(
                            npc.name.clone(),
                            npc.persona.clone(),
                            voice.clone(),
                            npc.priority,
                            npc.tier_override,
                            s2s,
                            shared.clone(),
                        )
                        .await?,
                    )
                }
            };

            let agent = Arc::new(NpcAgent::new(
                npc.name.clone(),
                voice,
                npc.knowledge_scope.clone(),
                npc.tier_override,
                engine,
            ));
            {
                let agent = Arc::clone(&agent);
                closers.push(closer(format!("engine:{}", npc.name), move || async move {
                    agent.close().await
                }));
            }
            agents.push(agent);
        }

        let router = Arc::new(UtteranceRouter::new(agents));

        // Ingest pipelines: one per participant, spawned for everyone
        // already in the channel and for every later join.
        self.watch_participants(&connection, &router, background.clone());

        // Background consolidation.
        let consolidator = Arc::new(Consolidator::new(
            Arc::clone(&self.deps.store),
            self.deps.llm.clone(),
            session_id.clone(),
            self.config.consolidation.interval(),
        ));
        tokio::spawn(Arc::clone(&consolidator).run(background.clone()));

        Ok(ActiveSession {
            info: SessionInfo {
                campaign: self.config.campaign.clone(),
                session_id,
                started_at,
                dm_user_id: dm_user_id.to_string(),
                channel_id: channel_id.to_string(),
            },
            connection,
            mixer,
            router,
            selector,
            consolidator,
            background,
            closers: Vec::new(),
        })
    }

    /// Spawn ingest pipelines for current participants and re-sweep the
    /// stream snapshot on every join event.
    fn watch_participants(
        &self,
        connection: &Arc<dyn Connection>,
        router: &Arc<UtteranceRouter>,
        background: CancellationToken,
    ) {
        // Keyed by the frame channel, not the participant id: an SSRC that
        // is later resolved to a user id keeps its channel, and must not
        // get a second pipeline.
        let spawned: Arc<SyncMutex<HashSet<usize>>> = Arc::new(SyncMutex::new(HashSet::new()));

        let sweep = {
            let connection = Arc::clone(connection);
            let router = Arc::clone(router);
            let stt = Arc::clone(&self.deps.stt);
            let vad = Arc::clone(&self.deps.vad);
            let language = self.config.language.0.clone();
            let spawned = Arc::clone(&spawned);
            Arc::new(move || {
                for stream in connection.input_streams() {
                    let channel_key = Arc::as_ptr(&stream.frames) as usize;
                    if !spawned.lock().insert(channel_key) {
                        continue;
                    }
                    tracing::info!(participant = %stream.participant_id, "starting ingest pipeline");
                    tokio::spawn(IngestPipeline::run(
                        stream,
                        Arc::clone(&stt),
                        Arc::clone(&vad),
                        Arc::clone(&router),
                        language.clone(),
                        background.child_token(),
                    ));
                }
            })
        };

        sweep();
        let sweep_on_join = Arc::clone(&sweep);
        connection.on_participant_change(Arc::new(move |change| {
            if change.kind == ParticipantChangeKind::Join {
                sweep_on_join();
            }
        }));
    }

    /// Stop the active session. A repeated `stop` after a clean one is a
    /// no-op success; `stop` before any `start` is an error.
    ///
    /// `cancel` is the caller's scope: when it fires mid-teardown the
    /// remaining closers are skipped and the cancellation is returned.
    pub async fn stop(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut active) = state.take() else {
            if *self.last_stop_clean.lock() {
                return Ok(());
            }
            anyhow::bail!("no active session");
        };

        let session_id = active.info.session_id.clone();

        // Final consolidation pass; failure never blocks teardown.
        if let Err(err) = active.consolidator.consolidate_once().await {
            tracing::warn!(session_id = %session_id, error = %err, "final consolidation failed");
        }

        if let Err(err) = active.connection.disconnect().await {
            tracing::warn!(session_id = %session_id, error = %err, "disconnect failed");
        }

        active.background.cancel();

        let mut cancelled = false;
        while let Some(closer) = active.closers.pop() {
            if cancel.is_cancelled() {
                tracing::warn!(session_id = %session_id, closer = %closer.name, "stop deadline hit, skipping remaining closers");
                cancelled = true;
                break;
            }
            tokio::select! {
                res = (closer.run)() => {
                    if let Err(err) = res {
                        tracing::error!(session_id = %session_id, closer = %closer.name, error = %err, "closer failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::warn!(session_id = %session_id, closer = %closer.name, "stop deadline hit, skipping remaining closers");
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            anyhow::bail!("stop cancelled before teardown completed");
        }
        *self.last_stop_clean.lock() = true;
        tracing::info!(session_id = %session_id, "session stopped");
        Ok(())
    }

    /// Whether a session is currently active.
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Snapshot of the active session's info.
    pub async fn info(&self) -> Option<SessionInfo> {
        self.state.lock().await.as_ref().map(|a| a.info.clone())
    }

    /// Live control surface of the active session.
    pub async fn orchestrator(&self) -> Option<Orchestrator> {
        self.state.lock().await.as_ref().map(|a| Orchestrator {
            mixer: Arc::clone(&a.mixer),
            router: Arc::clone(&a.router),
            selector: Arc::clone(&a.selector),
        })
    }

    /// Mid-session entity authoring: persist the entity, replicate it to
    /// the knowledge graph when one is configured, and note the intent to
    /// boost recognition of the new name.
    pub async fn propagate_entity(&self, entity: &EntityDef) -> anyhow::Result<()> {
        let state = self.state.lock().await;
        anyhow::ensure!(state.is_some(), "no active session");

        let store = self
            .deps
            .entities
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no entity store configured"))?;
        store.upsert_entity(entity).await?;

        if let Some(graph) = &self.deps.knowledge_graph {
            if let Err(err) = graph.add_entity(entity.clone()).await {
                tracing::warn!(entity = %entity.name, error = %err, "knowledge graph replication failed");
            }
        }

        // Streaming keyword updates are not universally supported by STT
        // providers; record the intent only.
        tracing::info!(entity = %entity.name, "requested stt recognition boost for new entity");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
