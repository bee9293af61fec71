//! Voice transport abstraction.
//!
//! ## Design
//! - `Platform` / `Connection` — the contract the session manager consumes:
//!   per-participant input frame channels in, one output frame channel back
//! - `VoiceTransport` — the seam a concrete adapter (Discord gateway,
//!   WebRTC peer) implements: Opus packets with SSRCs in, encoded Opus out
//! - `VoiceConnection` — the generic demux/mux machinery over any transport
//!
//! The engine treats wire formats as opaque; adapters only have to deliver
//! Opus payloads and SSRC→user identity events.

pub mod connection;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioFrame;

pub use connection::VoiceConnection;

// ── Transport seam ───────────────────────────────────────────────

/// Error surfaced by a concrete voice transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport disconnected")]
    Disconnected,
    #[error("codec error: {0}")]
    Codec(String),
    #[error("transport io: {0}")]
    Io(String),
}

/// One inbound Opus packet, tagged with its synchronization source.
#[derive(Debug, Clone)]
pub struct OpusPacket {
    /// RTP synchronization source identifying the speaker's stream.
    pub ssrc: u32,
    /// Encoded Opus payload.
    pub payload: Vec<u8>,
    /// Packet timestamp relative to stream start.
    pub timestamp: Duration,
}

/// Inbound event from a voice transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An encoded audio packet.
    Packet(OpusPacket),
    /// The platform resolved an SSRC to a user identity.
    SpeakerIdentity {
        ssrc: u32,
        user_id: String,
        username: String,
    },
    /// The speaker behind an SSRC left the channel.
    SpeakerGone { ssrc: u32 },
}

/// A concrete voice transport (Discord gateway, WebRTC peer, ...).
///
/// Decoder state is per-SSRC and lives in the connection, not here; the
/// transport only moves encoded packets and identity events.
#[async_trait]
pub trait VoiceTransport: Send + Sync + 'static {
    /// Receive the next inbound event, or `None` once the transport ends.
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Transmit one encoded Opus frame.
    async fn send_audio(&self, opus: &[u8]) -> Result<(), TransportError>;

    /// Toggle the platform's "speaking" indication.
    async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError>;

    /// Release the transport. Idempotent.
    async fn close(&self);
}

// ── Connection contract ──────────────────────────────────────────

/// Capacity of each per-participant input frame channel.
pub const INPUT_STREAM_CAPACITY: usize = 64;

/// Snapshot of one participant's decoded input stream.
///
/// The frame channel is single-consumer; the receiver is shared behind a
/// lock so exactly one ingest pipeline drains it.
#[derive(Clone)]
pub struct ParticipantStream {
    /// Stable participant identifier: platform user id, or `ssrc:<n>`
    /// until the platform resolves the identity.
    pub participant_id: String,
    /// Display name.
    pub username: String,
    /// Decoded PCM frames. Bounded; the demux drops frames when full.
    pub frames: Arc<tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>>,
}

/// Participant membership change.
#[derive(Debug, Clone)]
pub struct ParticipantChange {
    pub kind: ParticipantChangeKind,
    pub participant_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantChangeKind {
    Join,
    Leave,
}

/// Single-slot callback for participant changes. Last writer wins.
pub type ParticipantChangeHandler = Arc<dyn Fn(ParticipantChange) + Send + Sync>;

/// One live voice connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Snapshot of the current per-participant input streams.
    ///
    /// Callers must re-query after a join event to discover new streams.
    fn input_streams(&self) -> Vec<ParticipantStream>;

    /// The output frame channel. The caller owns the writer end; the
    /// connection never closes it, and sends after disconnect are dropped
    /// without panic.
    fn output(&self) -> mpsc::Sender<AudioFrame>;

    /// The `(sample_rate, channels)` the connection expects on output.
    fn output_format(&self) -> (u32, u16);

    /// Register the participant-change callback. Last writer wins; the
    /// callback is invoked asynchronously.
    fn on_participant_change(&self, handler: ParticipantChangeHandler);

    /// Close every input channel, stop internal tasks, release the
    /// transport. Idempotent.
    async fn disconnect(&self) -> anyhow::Result<()>;
}

/// A voice platform able to join channels.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Join the given channel. Honors `cancel` for the duration of the
    /// connection attempt only.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        channel_id: &str,
    ) -> anyhow::Result<Arc<dyn Connection>>;
}
