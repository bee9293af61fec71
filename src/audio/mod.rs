//! Core audio data types shared across the engine.
//!
//! ## Design
//! - `AudioFrame` — one finite interval of PCM16LE samples with its declared
//!   format and capture timestamp; immutable after creation
//! - `AudioSegment` — one streamed NPC utterance: a single-consumer chunk
//!   sequence plus a terminal-error slot, handed to the mixer at enqueue
//! - Platform PCM constants for the 48 kHz stereo 20 ms voice transport

pub mod convert;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

// ── Platform PCM constants ───────────────────────────────────────

/// Sample rate of the voice transport (Hz).
pub const PLATFORM_SAMPLE_RATE: u32 = 48_000;

/// Channel count of the voice transport.
pub const PLATFORM_CHANNELS: u16 = 2;

/// Duration of one transport frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Samples per channel in one 20 ms transport frame.
pub const SAMPLES_PER_FRAME: usize = 960;

/// Bytes of interleaved PCM16LE in one 20 ms 48 kHz stereo frame.
pub const FRAME_BYTES: usize = SAMPLES_PER_FRAME * PLATFORM_CHANNELS as usize * 2;

// ── Audio frame ──────────────────────────────────────────────────

/// A finite interval of PCM samples.
///
/// Payload is little-endian signed 16-bit, interleaved when multichannel.
/// The timestamp is relative to the start of the originating stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw PCM16LE bytes, interleaved if multichannel.
    pub data: Vec<u8>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels.
    pub channels: u16,
    /// Capture timestamp relative to stream start.
    pub timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame from raw PCM bytes.
    pub fn new(data: Vec<u8>, sample_rate: u32, channels: u16, timestamp: Duration) -> Self {
        Self {
            data,
            sample_rate,
            channels,
            timestamp,
        }
    }

    /// An empty frame tagged with the given format. Signals "dropped"
    /// downstream of the format converter.
    pub fn empty(sample_rate: u32, channels: u16, timestamp: Duration) -> Self {
        Self {
            data: Vec::new(),
            sample_rate,
            channels,
            timestamp,
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of samples per channel in the payload.
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / 2 / self.channels as usize
    }
}

// ── Audio segment ────────────────────────────────────────────────

/// Capacity of a segment's chunk channel.
const SEGMENT_CHUNK_CAPACITY: usize = 32;

/// One NPC utterance, produced lazily by an engine and consumed by the
/// mixer.
///
/// The chunk sequence is single-consumer, finite, and not restartable.
/// Ownership passes to the mixer at enqueue; the mixer is responsible for
/// draining the sequence when the segment is interrupted, so the producer
/// never blocks on a vanished consumer.
#[derive(Debug)]
pub struct AudioSegment {
    /// Identifier of the speaking NPC.
    pub speaker: String,
    /// Declared sample rate of the chunk bytes.
    pub sample_rate: u32,
    /// Declared channel count of the chunk bytes.
    pub channels: u16,
    /// Default priority, overridable at enqueue time.
    pub priority: i32,
    chunks: mpsc::Receiver<Vec<u8>>,
    error: Arc<Mutex<Option<String>>>,
}

/// Producer half of an [`AudioSegment`].
///
/// The chunk sequence closes when the producer is dropped, on normal end
/// and on failure alike. A failure is additionally recorded in the
/// segment's terminal-error slot.
#[derive(Debug, Clone)]
pub struct SegmentProducer {
    tx: mpsc::Sender<Vec<u8>>,
    error: Arc<Mutex<Option<String>>>,
}

impl AudioSegment {
    /// Create a segment and its producer half.
    pub fn channel(
        speaker: impl Into<String>,
        sample_rate: u32,
        channels: u16,
        priority: i32,
    ) -> (SegmentProducer, AudioSegment) {
        let (tx, rx) = mpsc::channel(SEGMENT_CHUNK_CAPACITY);
        let error = Arc::new(Mutex::new(None));
        let producer = SegmentProducer {
            tx,
            error: Arc::clone(&error),
        };
        let segment = AudioSegment {
            speaker: speaker.into(),
            sample_rate,
            channels,
            priority,
            chunks: rx,
            error,
        };
        (producer, segment)
    }

    /// Receive the next chunk, or `None` once the producer has closed.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }

    /// Read the chunk sequence to completion, discarding the bytes.
    ///
    /// Unblocks a producer whose consumer has been preempted.
    pub async fn drain(mut self) {
        while self.chunks.recv().await.is_some() {}
    }

    /// The terminal error reported by the producer, if any.
    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }
}

impl SegmentProducer {
    /// Send one chunk of PCM bytes.
    ///
    /// Returns `false` once the consumer is gone; producers should stop
    /// generating at that point.
    pub async fn send(&self, chunk: Vec<u8>) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Record a terminal error and close the chunk sequence.
    pub fn fail(self, err: impl std::fmt::Display) {
        *self.error.lock() = Some(err.to_string());
        // Dropping self closes the channel.
    }
}

// ── Tests ────────────────────────────────────────────────────────
