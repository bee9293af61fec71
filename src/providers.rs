//! Provider contracts the engine consumes.
//!
//! The core schedules and routes; it never performs recognition or
//! synthesis itself. Concrete speech-to-text, text-to-speech, language
//! model, speech-to-speech and voice-activity-detection backends live
//! behind these traits and are injected through the session manager.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Voice profile ────────────────────────────────────────────────

/// Synthesis voice selection for one NPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Provider-specific voice identifier.
    pub voice_id: String,
    /// BCP-47 language tag for synthesis.
    pub language: String,
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self {
            voice_id: "narrator".to_string(),
            language: "en-US".to_string(),
        }
    }
}

// ── Speech-to-text ───────────────────────────────────────────────

/// Configuration for one streaming transcription session.
#[derive(Debug, Clone)]
pub struct SttStreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
}

/// One finalized (non-incremental) transcript.
#[derive(Debug, Clone)]
pub struct TranscriptFinal {
    pub text: String,
    /// Timestamp relative to stream start.
    pub timestamp: Duration,
}

/// A live streaming transcription session paired with its finals channel.
pub struct SttStream {
    /// Handle for sending audio and closing the session.
    pub handle: Box<dyn SttSession>,
    /// Finalized transcripts, in arrival order. Single consumer.
    pub finals: mpsc::Receiver<TranscriptFinal>,
}

/// Control half of a streaming transcription session.
#[async_trait]
pub trait SttSession: Send + Sync {
    /// Forward raw PCM bytes into the recognizer.
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Close the session. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// A streaming speech-to-text backend.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Open a streaming session scoped to `cancel`.
    async fn start_stream(
        &self,
        cancel: &CancellationToken,
        config: SttStreamConfig,
    ) -> anyhow::Result<SttStream>;
}

// ── Text-to-speech ───────────────────────────────────────────────

/// A streaming text-to-speech backend.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    /// Synthesize a lazy text sequence into a lazy PCM chunk sequence.
    ///
    /// The returned channel closes when synthesis ends, normally or not.
    /// A mid-stream backend failure is delivered as a final `Err` item so
    /// consumers can tell it apart from a clean close.
    async fn synthesize_stream(
        &self,
        cancel: &CancellationToken,
        text: mpsc::Receiver<String>,
        voice: &VoiceProfile,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<Vec<u8>>>>;

    /// The `(sample_rate, channels)` of the produced PCM.
    fn output_format(&self) -> (u32, u16);
}

// ── Large language model ─────────────────────────────────────────

/// Message role in a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt (persona plus hot context).
    pub system: String,
    /// Conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Hard output cap in tokens.
    pub max_tokens: u32,
    /// Maximum latency any tool call offered to the model may take.
    pub tool_budget_ms: u64,
}

/// Capability descriptor advertised by an LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCapabilities {
    pub model: String,
    pub supports_tools: bool,
    pub max_context_tokens: u32,
}

/// A text-generation backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Non-streaming completion.
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String>;

    /// Streaming completion; the channel yields text deltas and closes at
    /// end of generation.
    async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> anyhow::Result<mpsc::Receiver<String>>;

    /// Approximate token count for budget arithmetic.
    fn count_tokens(&self, text: &str) -> usize;

    /// Static capability descriptor.
    fn capabilities(&self) -> LlmCapabilities;
}

// ── Speech-to-speech ─────────────────────────────────────────────

/// Configuration for one end-to-end speech session.
#[derive(Debug, Clone)]
pub struct S2sSessionConfig {
    pub voice: VoiceProfile,
    pub system_prompt: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Interleaved output of an end-to-end speech model.
#[derive(Debug, Clone)]
pub enum S2sEvent {
    /// Synthesized PCM chunk.
    Audio(Vec<u8>),
    /// Transcript of the model's own speech.
    Text(String),
    /// The model finished a response turn.
    TurnComplete,
    /// The provider failed mid-turn; the in-flight response is truncated.
    Error(String),
}

/// A live speech-to-speech session paired with its event channel.
pub struct S2sStream {
    pub handle: Box<dyn S2sSession>,
    /// Interleaved audio/text events. Single consumer.
    pub events: mpsc::Receiver<S2sEvent>,
}

/// Control half of a speech-to-speech session.
#[async_trait]
pub trait S2sSession: Send + Sync {
    async fn send_text(&self, text: &str) -> anyhow::Result<()>;
    async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()>;

    /// Close the session. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

/// An end-to-end speech model backend.
#[async_trait]
pub trait S2sProvider: Send + Sync {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        config: S2sSessionConfig,
    ) -> anyhow::Result<S2sStream>;
}

// ── Voice activity detection ─────────────────────────────────────

/// Configuration for one VAD session.
#[derive(Debug, Clone)]
pub struct VadSessionConfig {
    pub sample_rate: u32,
    /// Fixed analysis frame duration.
    pub frame: Duration,
    /// Probability threshold declaring speech onset.
    pub onset: f32,
    /// Probability threshold declaring silence after speech.
    pub offset: f32,
}

/// Classification of one audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
    /// Boundary frame between speech and silence.
    Transition,
}

/// One stateful VAD session.
#[async_trait]
pub trait VadSession: Send {
    /// Classify one frame of PCM bytes.
    async fn process_frame(&mut self, pcm: &[u8]) -> anyhow::Result<VadDecision>;

    /// Release session state. Idempotent.
    async fn close(&mut self);
}

/// A voice-activity-detection engine.
pub trait VadEngine: Send + Sync {
    fn new_session(&self, config: VadSessionConfig) -> anyhow::Result<Box<dyn VadSession>>;
}
