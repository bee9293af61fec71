//! Priority audio mixer: serializes streamed NPC utterances onto one
//! output sink.
//!
//! ## Design
//! - Single dispatch task pulling from a max-heap of queued segments
//! - Higher priority first; FIFO tie-break at equal priority
//! - Strictly-higher-priority enqueue preempts the playing segment
//! - Player barge-in cancels playback and flushes the pending queue;
//!   a DM override preserves the queue
//! - Configurable inter-segment silence gap with symmetric jitter
//! - Interrupted segments are drained in background tasks so their
//!   producers never block on a vanished consumer
//!
//! The output sink is called from the dispatch task for every chunk; a
//! slow sink backpressures the whole mixer, which bounds memory use.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioSegment;

// ── Public types ─────────────────────────────────────────────────

/// Async sink receiving every emitted audio chunk in playback order.
pub type OutputSink = Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired asynchronously when a player barges in.
pub type BargeInHandler = Arc<dyn Fn() + Send + Sync>;

/// Why playback was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    /// A player started speaking during NPC playback. Flushes the queue.
    PlayerBargeIn,
    /// The DM cut in. The pending queue is preserved.
    DmOverride,
}

// ── Internal state ───────────────────────────────────────────────

/// A queued segment with its effective priority and insertion sequence.
struct MixerEntry {
    segment: AudioSegment,
    priority: i32,
    seq: u64,
}

impl PartialEq for MixerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for MixerEntry {}

impl PartialOrd for MixerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MixerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority wins, then earlier insertion.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PlayingState {
    priority: i32,
    cancel: CancellationToken,
}

struct MixerState {
    queue: BinaryHeap<MixerEntry>,
    playing: Option<PlayingState>,
    next_seq: u64,
    gap: Duration,
    barge_in: Option<BargeInHandler>,
    closed: bool,
}

// ── Mixer ────────────────────────────────────────────────────────

/// Priority dispatcher over streamed audio segments.
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    notify: Arc<Notify>,
    done: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    /// Create a mixer and start its dispatch task.
    ///
    /// `base_gap` is the inter-segment silence duration; zero disables the
    /// gap entirely.
    pub fn new(output: OutputSink, base_gap: Duration) -> Self {
        let state = Arc::new(Mutex::new(MixerState {
            queue: BinaryHeap::new(),
            playing: None,
            next_seq: 0,
            gap: base_gap,
            barge_in: None,
            closed: false,
        }));
        let notify = Arc::new(Notify::new());
        let done = CancellationToken::new();

        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&state),
            Arc::clone(&notify),
            done.clone(),
            output,
        ));

        Self {
            state,
            notify,
            done,
            dispatch: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a segment with the given effective priority. Non-blocking.
    ///
    /// If a segment is currently playing at a strictly lower priority, it
    /// is preempted immediately and the new segment plays after any
    /// configured gap. The rest of the queue is preserved.
    pub fn enqueue(&self, segment: AudioSegment, priority: i32) {
        {
            let mut st = self.state.lock();
            if st.closed {
                // Late enqueue on a closed mixer: unblock the producer.
                tokio::spawn(segment.drain());
                return;
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            st.queue.push(MixerEntry {
                segment,
                priority,
                seq,
            });
            if let Some(playing) = &st.playing {
                if playing.priority < priority {
                    tracing::debug!(
                        playing_priority = playing.priority,
                        new_priority = priority,
                        "preempting current segment"
                    );
                    playing.cancel.cancel();
                }
            }
        }
        self.notify.notify_one();
    }

    /// Interrupt the current playback. Non-blocking; no-op when idle.
    pub fn interrupt(&self, reason: InterruptReason) {
        let handler = {
            let mut st = self.state.lock();
            if st.playing.is_none() && st.queue.is_empty() {
                return;
            }
            if let Some(playing) = &st.playing {
                playing.cancel.cancel();
            }
            match reason {
                InterruptReason::PlayerBargeIn => {
                    for entry in st.queue.drain() {
                        tokio::spawn(entry.segment.drain());
                    }
                    st.barge_in.clone()
                }
                InterruptReason::DmOverride => None,
            }
        };
        tracing::debug!(?reason, "mixer interrupted");
        if let Some(handler) = handler {
            tokio::spawn(async move { handler() });
        }
    }

    /// Register the barge-in callback. Last writer wins.
    pub fn on_barge_in(&self, handler: BargeInHandler) {
        self.state.lock().barge_in = Some(handler);
    }

    /// Update the base inter-segment gap. Observed before the next segment
    /// starts.
    pub fn set_gap(&self, gap: Duration) {
        self.state.lock().gap = gap;
    }

    /// Stop the dispatch loop, draining every queued segment and the one
    /// currently playing. Idempotent.
    pub async fn close(&self) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
        }
        self.done.cancel();
        self.notify.notify_one();
        let handle = self.dispatch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::debug!("mixer closed");
    }
}

// ── Dispatch loop ────────────────────────────────────────────────

async fn dispatch_loop(
    state: Arc<Mutex<MixerState>>,
    notify: Arc<Notify>,
    done: CancellationToken,
    output: OutputSink,
) {
    loop {
        // Dequeue the highest-priority entry, waiting for work.
        let entry = loop {
            if done.is_cancelled() {
                drain_all(&state);
                return;
            }
            if let Some(entry) = state.lock().queue.pop() {
                break entry;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = done.cancelled() => {
                    drain_all(&state);
                    return;
                }
            }
        };

        let cancel = CancellationToken::new();
        let gap = {
            let mut st = state.lock();
            st.playing = Some(PlayingState {
                priority: entry.priority,
                cancel: cancel.clone(),
            });
            st.gap
        };
        let mut segment = entry.segment;

        // Inter-segment silence, cancellable like playback itself.
        if !gap.is_zero() {
            let wait = jittered(gap);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    state.lock().playing = None;
                    tokio::spawn(segment.drain());
                    continue;
                }
                _ = done.cancelled() => {
                    state.lock().playing = None;
                    tokio::spawn(segment.drain());
                    drain_all(&state);
                    return;
                }
            }
        }

        // Stream chunks until the producer closes or we are cancelled.
        let mut preempted = false;
        loop {
            tokio::select! {
                chunk = segment.next_chunk() => match chunk {
                    Some(chunk) => output(chunk).await,
                    None => break,
                },
                _ = cancel.cancelled() => {
                    preempted = true;
                    break;
                }
                _ = done.cancelled() => {
                    preempted = true;
                    break;
                }
            }
        }

        state.lock().playing = None;
        if preempted {
            tokio::spawn(segment.drain());
        } else if let Some(err) = segment.error() {
            // Producer failure is informational only; whatever chunks
            // arrived were played.
            tracing::warn!(speaker = %segment.speaker, error = %err, "segment ended with producer error");
        }

        if done.is_cancelled() {
            drain_all(&state);
            return;
        }
    }
}

/// Drain every queued segment in background tasks.
fn drain_all(state: &Mutex<MixerState>) {
    let mut st = state.lock();
    st.playing = None;
    for entry in st.queue.drain() {
        tokio::spawn(entry.segment.drain());
    }
}

/// Gap duration with a symmetric jitter of ±(base/6).
fn jittered(base: Duration) -> Duration {
    let sixth = base.as_micros() as i64 / 6;
    if sixth == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-sixth..=sixth);
    let micros = (base.as_micros() as i64 + offset).max(0);
    Duration::from_micros(micros as u64)
}

// ── Tests ────────────────────────────────────────────────────────
