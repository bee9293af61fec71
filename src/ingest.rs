//! Per-participant ingest: voice-activity gating into streaming
//! transcription, and routing of finalized utterances to NPCs.
//!
//! One pipeline runs per participant, scoped to the session's background
//! token. Two tasks cooperate:
//! 1. the frame loop VAD-gates arriving PCM and forwards speech to the
//!    recognizer;
//! 2. the finals drain routes each finalized transcript to the addressed
//!    NPC.
//!
//! Transient VAD/STT failures are logged and skipped; only a failed
//! session-handle acquisition is fatal, and then only for this
//! participant.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audio::{FRAME_DURATION, PLATFORM_CHANNELS, PLATFORM_SAMPLE_RATE};
use crate::platform::ParticipantStream;
use crate::providers::{
    SttProvider, SttSession, SttStreamConfig, VadDecision, VadEngine, VadSessionConfig,
};
use crate::session::router::UtteranceRouter;

/// Speech-onset probability threshold.
const VAD_ONSET: f32 = 0.5;

/// Silence-offset probability threshold.
const VAD_OFFSET: f32 = 0.35;

/// Ingest pipeline for one participant.
pub struct IngestPipeline;

impl IngestPipeline {
    /// Run until the stream closes or the session token is cancelled.
    pub async fn run(
        stream: ParticipantStream,
        stt: Arc<dyn SttProvider>,
        vad: Arc<dyn VadEngine>,
        router: Arc<UtteranceRouter>,
        language: String,
        cancel: CancellationToken,
    ) {
        let participant_id = stream.participant_id.clone();

        let stt_stream = match stt
            .start_stream(
                &cancel,
                SttStreamConfig {
                    sample_rate: PLATFORM_SAMPLE_RATE,
                    channels: PLATFORM_CHANNELS,
                    language,
                },
            )
            .await
        {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(
                    participant = %participant_id,
                    error = %err,
                    "stt stream unavailable; participant will not be transcribed"
                );
                return;
            }
        };

        let mut vad_session = match vad.new_session(VadSessionConfig {
            sample_rate: PLATFORM_SAMPLE_RATE,
            frame: FRAME_DURATION,
            onset: VAD_ONSET,
            offset: VAD_OFFSET,
        }) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(participant = %participant_id, error = %err, "vad session unavailable");
                return;
            }
        };

        let handle: Arc<dyn SttSession> = Arc::from(stt_stream.handle);
        let mut finals = stt_stream.finals;

        // Finals drain: route each finalized utterance, in arrival order.
        let finals_task = tokio::spawn({
            let router = Arc::clone(&router);
            let participant_id = participant_id.clone();
            let username = stream.username.clone();
            let cancel = cancel.clone();
            async move {
                loop {
                    let finalized = tokio::select! {
                        f = finals.recv() => match f {
                            Some(f) => f,
                            None => break,
                        },
                        _ = cancel.cancelled() => break,
                    };
                    let text = finalized.text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    tracing::info!(participant = %participant_id, text = %text, "finalized utterance");
                    match router.route(&participant_id, text) {
                        Some(agent) => {
                            if let Err(err) =
                                agent.handle_utterance(&participant_id, &username, text).await
                            {
                                tracing::error!(
                                    participant = %participant_id,
                                    npc = %agent.name,
                                    error = %err,
                                    "utterance dropped"
                                );
                            }
                        }
                        None => {
                            tracing::debug!(participant = %participant_id, "utterance addressed no npc");
                        }
                    }
                }
            }
        });

        // Frame loop: gate on the VAD, forward speech to the recognizer.
        loop {
            let frame = tokio::select! {
                f = async { stream.frames.lock().await.recv().await } => match f {
                    Some(f) => f,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let decision = match vad_session.process_frame(&frame.data).await {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(participant = %participant_id, error = %err, "vad failure, skipping frame");
                    continue;
                }
            };
            if decision == VadDecision::Silence {
                continue;
            }

            if let Err(err) = handle.send_audio(&frame.data).await {
                tracing::warn!(participant = %participant_id, error = %err, "stt send failed");
            }
        }

        if let Err(err) = handle.close().await {
            tracing::warn!(participant = %participant_id, error = %err, "stt close failed");
        }
        vad_session.close().await;
        let _ = finals_task.await;
        tracing::debug!(participant = %participant_id, "ingest pipeline stopped");
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::providers::{SttStream, TranscriptFinal, VadSession, VoiceProfile};
    use crate::session::agent::{NpcAgent, NpcEngine};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(500);

    struct MockSttSession {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<u32>>,
        finals_tx: Arc<Mutex<Option<mpsc::Sender<TranscriptFinal>>>>,
    }

    #[async_trait]
    impl SttSession for MockSttSession {
        async fn send_audio(&self, pcm: &[u8]) -> anyhow::Result<()> {
            self.sent.lock().push(pcm.to_vec());
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            *self.closed.lock() += 1;
            // Closing the recognizer ends the finals stream.
            self.finals_tx.lock().take();
            Ok(())
        }
    }

    struct MockSttProvider {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        closed: Arc<Mutex<u32>>,
        finals_tx: Arc<Mutex<Option<mpsc::Sender<TranscriptFinal>>>>,
        fail: bool,
    }

    impl MockSttProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(0)),
                finals_tx: Arc::new(Mutex::new(None)),
                fail,
            })
        }

        fn finals_sender(&self) -> mpsc::Sender<TranscriptFinal> {
            self.finals_tx.lock().clone().expect("stream started")
        }
    }

    #[async_trait]
    impl SttProvider for MockSttProvider {
        async fn start_stream(
            &self,
            _cancel: &CancellationToken,
            config: SttStreamConfig,
        ) -> anyhow::Result<SttStream> {
            if self.fail {
                anyhow::bail!("no capacity");
            }
            assert_eq!(config.sample_rate, PLATFORM_SAMPLE_RATE);
            assert_eq!(config.channels, PLATFORM_CHANNELS);
            let (tx, rx) = mpsc::channel(16);
            *self.finals_tx.lock() = Some(tx);
            Ok(SttStream {
                handle: Box::new(MockSttSession {
                    sent: Arc::clone(&self.sent),
                    closed: Arc::clone(&self.closed),
                    finals_tx: Arc::clone(&self.finals_tx),
                }),
                finals: rx,
            })
        }
    }

    /// Classifies frames by their first byte: zero = silence.
    struct ByteVad;

    struct ByteVadSession;

    #[async_trait]
    impl VadSession for ByteVadSession {
        async fn process_frame(&mut self, pcm: &[u8]) -> anyhow::Result<VadDecision> {
            match pcm.first() {
                Some(0) | None => Ok(VadDecision::Silence),
                _ => Ok(VadDecision::Speech),
            }
        }

        async fn close(&mut self) {}
    }

    impl VadEngine for ByteVad {
        fn new_session(&self, config: VadSessionConfig) -> anyhow::Result<Box<dyn VadSession>> {
            assert_eq!(config.onset, VAD_ONSET);
            assert_eq!(config.offset, VAD_OFFSET);
            assert_eq!(config.frame, FRAME_DURATION);
            Ok(Box::new(ByteVadSession))
        }
    }

    struct CaptureEngine {
        utterances: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl NpcEngine for CaptureEngine {
        async fn handle_utterance(
            &self,
            participant_id: &str,
            _speaker: &str,
            text: &str,
        ) -> anyhow::Result<()> {
            self.utterances
                .lock()
                .push((participant_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn capture_router() -> (Arc<UtteranceRouter>, Arc<Mutex<Vec<(String, String)>>>) {
        crate::test_log::init();
        let utterances = Arc::new(Mutex::new(Vec::new()));
        let agent = NpcAgent::new(
            "Morwen",
            VoiceProfile::default(),
            vec![],
            None,
            Box::new(CaptureEngine {
                utterances: Arc::clone(&utterances),
            }),
        );
        (Arc::new(UtteranceRouter::new(vec![Arc::new(agent)])), utterances)
    }

    fn participant(frames: mpsc::Receiver<AudioFrame>) -> ParticipantStream {
        ParticipantStream {
            participant_id: "user-1".into(),
            username: "Astrid".into(),
            frames: Arc::new(tokio::sync::Mutex::new(frames)),
        }
    }

    fn frame(first_byte: u8) -> AudioFrame {
        let mut data = vec![0u8; 64];
        data[0] = first_byte;
        AudioFrame::new(data, PLATFORM_SAMPLE_RATE, PLATFORM_CHANNELS, Duration::ZERO)
    }

    #[tokio::test]
    async fn silence_is_gated_and_speech_forwarded() {
        let stt = MockSttProvider::new(false);
        let (router, _) = capture_router();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pipeline = tokio::spawn(IngestPipeline::run(
            participant(rx),
            Arc::clone(&stt) as Arc<dyn SttProvider>,
            Arc::new(ByteVad),
            router,
            "en-US".into(),
            cancel.clone(),
        ));

        tx.send(frame(0)).await.unwrap();
        tx.send(frame(7)).await.unwrap();
        tx.send(frame(0)).await.unwrap();
        tx.send(frame(9)).await.unwrap();
        drop(tx);

        timeout(WAIT, pipeline).await.unwrap().unwrap();

        let sent = stt.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], 7);
        assert_eq!(sent[1][0], 9);
        assert_eq!(*stt.closed.lock(), 1);
    }

    #[tokio::test]
    async fn finals_route_to_npc_in_order() {
        let stt = MockSttProvider::new(false);
        let (router, utterances) = capture_router();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pipeline = tokio::spawn(IngestPipeline::run(
            participant(rx),
            Arc::clone(&stt) as Arc<dyn SttProvider>,
            Arc::new(ByteVad),
            router,
            "en-US".into(),
            cancel.clone(),
        ));

        // Wait for the stream handle to exist, then feed finals.
        timeout(WAIT, async {
            while stt.finals_tx.lock().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let finals = stt.finals_sender();
        finals
            .send(TranscriptFinal {
                text: "Morwen, any rooms?".into(),
                timestamp: Duration::ZERO,
            })
            .await
            .unwrap();
        finals
            .send(TranscriptFinal {
                text: "   ".into(),
                timestamp: Duration::ZERO,
            })
            .await
            .unwrap();
        finals
            .send(TranscriptFinal {
                text: "and a meal".into(),
                timestamp: Duration::ZERO,
            })
            .await
            .unwrap();
        drop(finals);
        drop(tx);

        timeout(WAIT, pipeline).await.unwrap().unwrap();

        let routed = utterances.lock();
        assert_eq!(routed.len(), 2);
        assert_eq!(routed[0], ("user-1".to_string(), "Morwen, any rooms?".to_string()));
        assert_eq!(routed[1], ("user-1".to_string(), "and a meal".to_string()));
    }

    #[tokio::test]
    async fn failed_stt_acquisition_kills_only_this_pipeline() {
        let stt = MockSttProvider::new(true);
        let (router, _) = capture_router();
        let (_tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        // Returns promptly instead of hanging on frames.
        timeout(
            WAIT,
            IngestPipeline::run(
                participant(rx),
                Arc::clone(&stt) as Arc<dyn SttProvider>,
                Arc::new(ByteVad),
                router,
                "en-US".into(),
                cancel,
            ),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancellation_closes_handles() {
        let stt = MockSttProvider::new(false);
        let (router, _) = capture_router();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pipeline = tokio::spawn(IngestPipeline::run(
            participant(rx),
            Arc::clone(&stt) as Arc<dyn SttProvider>,
            Arc::new(ByteVad),
            router,
            "en-US".into(),
            cancel.clone(),
        ));

        timeout(WAIT, async {
            while stt.finals_tx.lock().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        timeout(WAIT, pipeline).await.unwrap().unwrap();
        assert_eq!(*stt.closed.lock(), 1);
        drop(tx);
    }
}
