//! Generic demux/mux machinery over a [`VoiceTransport`].
//!
//! Demux: inbound Opus packets are split by SSRC, each stream gets its own
//! decoder and a bounded PCM frame channel. Mux: outbound frames are
//! format-converted, accumulated to whole 20 ms frames, Opus-encoded and
//! handed to the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use audiopus::coder::{Decoder as OpusDecoder, Encoder as OpusEncoder};
use audiopus::{Application, Channels, SampleRate};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{
    AudioFrame, FRAME_BYTES, PLATFORM_CHANNELS, PLATFORM_SAMPLE_RATE, SAMPLES_PER_FRAME,
};
use crate::audio::convert::FormatConverter;

use super::{
    Connection, ParticipantChange, ParticipantChangeHandler, ParticipantChangeKind,
    ParticipantStream, TransportEvent, VoiceTransport, INPUT_STREAM_CAPACITY,
};

/// Worst-case encoded Opus frame, per libopus recommendation.
const MAX_OPUS_FRAME: usize = 4000;

/// Capacity of the outbound frame channel.
const OUTPUT_CAPACITY: usize = 64;

// ── Per-SSRC stream bookkeeping ──────────────────────────────────

struct SsrcStream {
    participant_id: String,
    username: String,
    tx: mpsc::Sender<AudioFrame>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>>,
}

// ── Connection ───────────────────────────────────────────────────

/// A live connection over a generic voice transport.
pub struct VoiceConnection<T: VoiceTransport> {
    transport: Arc<T>,
    streams: Arc<RwLock<HashMap<u32, SsrcStream>>>,
    change_handler: Arc<Mutex<Option<ParticipantChangeHandler>>>,
    out_tx: mpsc::Sender<AudioFrame>,
    internal: CancellationToken,
    disconnected: Mutex<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: VoiceTransport> VoiceConnection<T> {
    /// Wrap a transport and start the demux and mux loops.
    pub fn start(transport: T) -> Arc<Self> {
        let transport = Arc::new(transport);
        let streams = Arc::new(RwLock::new(HashMap::new()));
        let change_handler: Arc<Mutex<Option<ParticipantChangeHandler>>> =
            Arc::new(Mutex::new(None));
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        let internal = CancellationToken::new();

        let demux = tokio::spawn(demux_loop(
            Arc::clone(&transport),
            Arc::clone(&streams),
            Arc::clone(&change_handler),
            internal.clone(),
        ));
        let mux = tokio::spawn(mux_loop(Arc::clone(&transport), out_rx, internal.clone()));

        Arc::new(Self {
            transport,
            streams,
            change_handler,
            out_tx,
            internal,
            disconnected: Mutex::new(false),
            tasks: Mutex::new(vec![demux, mux]),
        })
    }
}

#[async_trait]
impl<T: VoiceTransport> Connection for VoiceConnection<T> {
    fn input_streams(&self) -> Vec<ParticipantStream> {
        self.streams
            .read()
            .values()
            .map(|s| ParticipantStream {
                participant_id: s.participant_id.clone(),
                username: s.username.clone(),
                frames: Arc::clone(&s.rx),
            })
            .collect()
    }

    fn output(&self) -> mpsc::Sender<AudioFrame> {
        self.out_tx.clone()
    }

    fn output_format(&self) -> (u32, u16) {
        (PLATFORM_SAMPLE_RATE, PLATFORM_CHANNELS)
    }

    fn on_participant_change(&self, handler: ParticipantChangeHandler) {
        *self.change_handler.lock() = Some(handler);
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        {
            let mut flag = self.disconnected.lock();
            if *flag {
                return Ok(());
            }
            *flag = true;
        }
        self.internal.cancel();
        self.transport.close().await;
        // Dropping the senders closes every per-participant input channel.
        self.streams.write().clear();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("voice connection disconnected");
        Ok(())
    }
}

// ── Demux loop ───────────────────────────────────────────────────

async fn demux_loop<T: VoiceTransport>(
    transport: Arc<T>,
    streams: Arc<RwLock<HashMap<u32, SsrcStream>>>,
    change_handler: Arc<Mutex<Option<ParticipantChangeHandler>>>,
    internal: CancellationToken,
) {
    // Decoder state is per-SSRC and private to this task.
    let mut decoders: HashMap<u32, OpusDecoder> = HashMap::new();
    let mut pcm = vec![0i16; SAMPLES_PER_FRAME * PLATFORM_CHANNELS as usize];

    loop {
        let event = tokio::select! {
            ev = transport.next_event() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = internal.cancelled() => break,
        };

        match event {
            TransportEvent::Packet(packet) => {
                if !streams.read().contains_key(&packet.ssrc) {
                    let (tx, rx) = mpsc::channel(INPUT_STREAM_CAPACITY);
                    let participant_id = format!("ssrc:{}", packet.ssrc);
                    streams.write().insert(
                        packet.ssrc,
                        SsrcStream {
                            participant_id: participant_id.clone(),
                            username: participant_id.clone(),
                            tx,
                            rx: Arc::new(tokio::sync::Mutex::new(rx)),
                        },
                    );
                    tracing::debug!(ssrc = packet.ssrc, "new inbound voice stream");
                    fire_change(
                        &change_handler,
                        ParticipantChange {
                            kind: ParticipantChangeKind::Join,
                            participant_id: participant_id.clone(),
                            username: participant_id,
                        },
                    );
                }

                let decoder = match decoders.entry(packet.ssrc) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(v) => {
                        match OpusDecoder::new(SampleRate::Hz48000, Channels::Stereo) {
                            Ok(d) => v.insert(d),
                            Err(err) => {
                                tracing::warn!(ssrc = packet.ssrc, error = %err, "opus decoder init failed");
                                continue;
                            }
                        }
                    }
                };

                let decoded: anyhow::Result<usize> = (|| {
                    let pkt = audiopus::packet::Packet::try_from(packet.payload.as_slice())?;
                    let signals = audiopus::MutSignals::try_from(&mut pcm[..])?;
                    Ok(decoder.decode(Some(pkt), signals, false)?)
                })();
                let samples = match decoded {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::warn!(ssrc = packet.ssrc, error = %err, "opus decode failed, dropping packet");
                        continue;
                    }
                };

                let byte_len = samples * PLATFORM_CHANNELS as usize * 2;
                let mut data = Vec::with_capacity(byte_len);
                for s in &pcm[..samples * PLATFORM_CHANNELS as usize] {
                    data.extend_from_slice(&s.to_le_bytes());
                }
                let frame = AudioFrame::new(
                    data,
                    PLATFORM_SAMPLE_RATE,
                    PLATFORM_CHANNELS,
                    packet.timestamp,
                );

                let tx = streams.read().get(&packet.ssrc).map(|s| s.tx.clone());
                if let Some(tx) = tx {
                    // Bounded channel: drop the frame rather than block the
                    // demux behind a slow consumer.
                    let _ = tx.try_send(frame);
                }
            }

            TransportEvent::SpeakerIdentity {
                ssrc,
                user_id,
                username,
            } => {
                let mut map = streams.write();
                if let Some(stream) = map.get_mut(&ssrc) {
                    stream.participant_id = user_id.clone();
                    stream.username = username.clone();
                    drop(map);
                    tracing::debug!(ssrc, user_id = %user_id, "resolved speaker identity");
                    fire_change(
                        &change_handler,
                        ParticipantChange {
                            kind: ParticipantChangeKind::Join,
                            participant_id: user_id,
                            username,
                        },
                    );
                }
            }

            TransportEvent::SpeakerGone { ssrc } => {
                let removed = streams.write().remove(&ssrc);
                decoders.remove(&ssrc);
                if let Some(stream) = removed {
                    fire_change(
                        &change_handler,
                        ParticipantChange {
                            kind: ParticipantChangeKind::Leave,
                            participant_id: stream.participant_id,
                            username: stream.username,
                        },
                    );
                }
            }
        }
    }
}

fn fire_change(
    slot: &Mutex<Option<ParticipantChangeHandler>>,
    change: ParticipantChange,
) {
    if let Some(handler) = slot.lock().clone() {
        tokio::spawn(async move { handler(change) });
    }
}

// ── Mux loop ─────────────────────────────────────────────────────

async fn mux_loop<T: VoiceTransport>(
    transport: Arc<T>,
    mut out_rx: mpsc::Receiver<AudioFrame>,
    internal: CancellationToken,
) {
    let encoder =
        match OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio) {
            Ok(e) => e,
            Err(err) => {
                tracing::error!(error = %err, "opus encoder init failed; output muted");
                return;
            }
        };
    let mut converter = FormatConverter::new(PLATFORM_SAMPLE_RATE, PLATFORM_CHANNELS);
    let mut buffer: Vec<u8> = Vec::new();
    let mut opus = vec![0u8; MAX_OPUS_FRAME];
    let mut speaking = false;

    loop {
        let frame = tokio::select! {
            f = out_rx.recv() => match f {
                Some(f) => f,
                None => break,
            },
            _ = internal.cancelled() => break,
        };

        let converted = converter.convert(frame);
        if converted.is_empty() {
            continue;
        }
        buffer.extend_from_slice(&converted.data);

        while buffer.len() >= FRAME_BYTES {
            let chunk: Vec<u8> = buffer.drain(..FRAME_BYTES).collect();
            let samples: Vec<i16> = chunk
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            match encoder.encode(&samples, &mut opus) {
                Ok(len) => {
                    if !speaking {
                        if let Err(err) = transport.set_speaking(true).await {
                            tracing::warn!(error = %err, "failed to raise speaking flag");
                        }
                        speaking = true;
                    }
                    if let Err(err) = transport.send_audio(&opus[..len]).await {
                        tracing::warn!(error = %err, "dropped outbound audio frame");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "opus encode failed, dropping frame");
                }
            }
        }
    }

    if speaking {
        let _ = transport.set_speaking(false).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{OpusPacket, TransportError};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(500);

    struct MockTransport {
        events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
        sent: Mutex<Vec<Vec<u8>>>,
        speaking: Mutex<Vec<bool>>,
        closed: Mutex<u32>,
    }

    fn mock() -> (mpsc::UnboundedSender<TransportEvent>, Arc<MockTransport>) {
        crate::test_log::init();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            events: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            speaking: Mutex::new(Vec::new()),
            closed: Mutex::new(0),
        });
        (tx, transport)
    }

    #[async_trait]
    impl VoiceTransport for Arc<MockTransport> {
        async fn next_event(&self) -> Option<TransportEvent> {
            self.events.lock().await.recv().await
        }

        async fn send_audio(&self, opus: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().push(opus.to_vec());
            Ok(())
        }

        async fn set_speaking(&self, speaking: bool) -> Result<(), TransportError> {
            self.speaking.lock().push(speaking);
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock() += 1;
        }
    }

    fn silence_packet(ssrc: u32) -> OpusPacket {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio).unwrap();
        let samples = vec![0i16; SAMPLES_PER_FRAME * 2];
        let mut out = vec![0u8; MAX_OPUS_FRAME];
        let len = encoder.encode(&samples, &mut out).unwrap();
        OpusPacket {
            ssrc,
            payload: out[..len].to_vec(),
            timestamp: Duration::ZERO,
        }
    }

    fn change_capture(
        conn: &dyn Connection,
    ) -> mpsc::UnboundedReceiver<ParticipantChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        conn.on_participant_change(Arc::new(move |change| {
            let _ = tx.send(change);
        }));
        rx
    }

    #[tokio::test]
    async fn demux_creates_stream_and_emits_join() {
        let (events, transport) = mock();
        let conn = VoiceConnection::start(transport);
        let mut changes = change_capture(conn.as_ref());

        events.send(TransportEvent::Packet(silence_packet(17))).unwrap();

        let join = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(join.kind, ParticipantChangeKind::Join);
        assert_eq!(join.participant_id, "ssrc:17");

        let streams = conn.input_streams();
        assert_eq!(streams.len(), 1);
        let frame = timeout(WAIT, async {
            streams[0].frames.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(frame.sample_rate, PLATFORM_SAMPLE_RATE);
        assert_eq!(frame.channels, PLATFORM_CHANNELS);
        assert_eq!(frame.data.len(), FRAME_BYTES);

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn identity_event_resolves_participant() {
        let (events, transport) = mock();
        let conn = VoiceConnection::start(transport);
        let mut changes = change_capture(conn.as_ref());

        events.send(TransportEvent::Packet(silence_packet(5))).unwrap();
        let first = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(first.participant_id, "ssrc:5");

        events
            .send(TransportEvent::SpeakerIdentity {
                ssrc: 5,
                user_id: "user-42".into(),
                username: "Astrid".into(),
            })
            .unwrap();
        let resolved = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(resolved.kind, ParticipantChangeKind::Join);
        assert_eq!(resolved.participant_id, "user-42");
        assert_eq!(resolved.username, "Astrid");

        let streams = conn.input_streams();
        assert_eq!(streams[0].participant_id, "user-42");

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn speaker_gone_removes_stream_and_closes_channel() {
        let (events, transport) = mock();
        let conn = VoiceConnection::start(transport);
        let mut changes = change_capture(conn.as_ref());

        events.send(TransportEvent::Packet(silence_packet(9))).unwrap();
        timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        let streams = conn.input_streams();
        assert_eq!(streams.len(), 1);

        events.send(TransportEvent::SpeakerGone { ssrc: 9 }).unwrap();
        let leave = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        assert_eq!(leave.kind, ParticipantChangeKind::Leave);
        assert!(conn.input_streams().is_empty());

        // The retained receiver drains its buffered frame, then closes.
        let mut rx = streams[0].frames.lock().await;
        while timeout(WAIT, rx.recv()).await.unwrap().is_some() {}

        drop(rx);
        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn full_input_channel_drops_frames() {
        let (events, transport) = mock();
        let conn = VoiceConnection::start(transport);
        let mut changes = change_capture(conn.as_ref());

        let packet = silence_packet(3);
        for _ in 0..INPUT_STREAM_CAPACITY + 10 {
            events.send(TransportEvent::Packet(packet.clone())).unwrap();
        }
        timeout(WAIT, changes.recv()).await.unwrap().unwrap();
        // Give the demux time to work through the backlog.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let streams = conn.input_streams();
        let mut received = 0;
        {
            let mut rx = streams[0].frames.lock().await;
            while let Ok(frame) = rx.try_recv() {
                assert_eq!(frame.data.len(), FRAME_BYTES);
                received += 1;
            }
        }
        assert!(received <= INPUT_STREAM_CAPACITY);
        assert!(received > 0);

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn mux_encodes_full_frames_and_toggles_speaking() {
        let (_events, transport) = mock();
        let probe = Arc::clone(&transport);
        let conn = VoiceConnection::start(transport);

        let out = conn.output();
        let frame = AudioFrame::new(
            vec![0u8; FRAME_BYTES],
            PLATFORM_SAMPLE_RATE,
            PLATFORM_CHANNELS,
            Duration::ZERO,
        );
        out.send(frame).await.unwrap();

        timeout(WAIT, async {
            loop {
                if !probe.sent.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(probe.speaking.lock().as_slice(), &[true]);
        conn.disconnect().await.unwrap();
        assert_eq!(probe.speaking.lock().as_slice(), &[true, false]);
    }

    #[tokio::test]
    async fn mux_waits_for_a_whole_frame() {
        let (_events, transport) = mock();
        let probe = Arc::clone(&transport);
        let conn = VoiceConnection::start(transport);

        // Half a frame: nothing should be encoded yet.
        let half = AudioFrame::new(
            vec![0u8; FRAME_BYTES / 2],
            PLATFORM_SAMPLE_RATE,
            PLATFORM_CHANNELS,
            Duration::ZERO,
        );
        conn.output().send(half.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(probe.sent.lock().is_empty());

        // The second half completes the frame.
        conn.output().send(half).await.unwrap();
        timeout(WAIT, async {
            loop {
                if !probe.sent.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        conn.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_output_sends_fail_quietly() {
        let (_events, transport) = mock();
        let probe = Arc::clone(&transport);
        let conn = VoiceConnection::start(transport);

        conn.disconnect().await.unwrap();
        conn.disconnect().await.unwrap();
        assert_eq!(*probe.closed.lock(), 1);

        let frame = AudioFrame::new(
            vec![0u8; FRAME_BYTES],
            PLATFORM_SAMPLE_RATE,
            PLATFORM_CHANNELS,
            Duration::ZERO,
        );
        // The mux task is gone; the send errors instead of panicking.
        assert!(conn.output().send(frame).await.is_err());
    }
}
