//! Bardic: a real-time multi-party voice engine for tabletop sessions.
//!
//! A dungeon master runs a session populated by NPCs; players speak in a
//! voice channel, the engine transcribes them, routes each utterance to
//! the right NPC, and plays the spoken response back through the same
//! channel while respecting turn-taking.
//!
//! ## Design
//! - Priority audio mixer with preemption, barge-in, and inter-segment
//!   gap semantics (`mixer`)
//! - Per-participant ingest: Opus demux → VAD gate → streaming STT
//!   (`platform`, `ingest`)
//! - Session manager owning the full lifecycle with LIFO teardown
//!   (`session`)
//! - Tool-budget tier selection from keyword/state heuristics (`budget`)
//! - PCM format conversion between heterogeneous providers (`audio`)
//! - Every external capability (STT, TTS, LLM, S2S, VAD, memory,
//!   transport) is trait-injected (`providers`, `memory`, `platform`)
//!
//! The engine schedules and routes; it never performs recognition or
//! synthesis itself, and it never persists audio.

pub mod audio;
pub mod budget;
pub mod config;
pub mod ingest;
pub mod memory;
pub mod mixer;
pub mod platform;
pub mod providers;
pub mod session;

pub use audio::convert::{convert_stream, FormatConverter};
pub use audio::{AudioFrame, AudioSegment, SegmentProducer};
pub use budget::{BudgetTier, SelectorConfig, TierSelector};
pub use config::{EngineConfig, EngineKind, NpcConfig};
pub use ingest::IngestPipeline;
pub use memory::{
    EntityDef, EntityStore, InMemorySessionStore, KnowledgeGraph, SessionStore, SpeakerRole,
    TranscriptEntry,
};
pub use mixer::{InterruptReason, Mixer, OutputSink};
pub use platform::{
    Connection, OpusPacket, ParticipantChange, ParticipantChangeKind, ParticipantStream,
    Platform, TransportError, TransportEvent, VoiceConnection, VoiceTransport,
};
pub use providers::{
    LlmProvider, S2sProvider, SttProvider, TtsProvider, VadEngine, VoiceProfile,
};
pub use session::{
    derive_session_id, Orchestrator, SessionDeps, SessionInfo, SessionManager,
};
pub use session::agent::{NpcAgent, NpcEngine};
pub use session::router::UtteranceRouter;
