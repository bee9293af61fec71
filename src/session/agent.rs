//! NPC agents and their response engines.
//!
//! An agent binds one persona (name, voice, knowledge scope, optional
//! budget override) to an engine. Two engine strategies exist:
//!
//! - **Cascade** — stream an LLM completion, feed the deltas to streaming
//!   TTS, enqueue the synthesized audio on the mixer
//! - **S2S** — drive an end-to-end speech model session and relay its
//!   interleaved audio/text events
//!
//! Engines write both sides of the exchange to the session store and
//! count completed turns on the selector.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::convert::FormatConverter;
use crate::audio::{AudioFrame, AudioSegment};
use crate::budget::{BudgetTier, TierSelector};
use crate::memory::{SessionStore, SpeakerRole, TranscriptEntry};
use crate::mixer::Mixer;
use crate::providers::{
    ChatMessage, ChatRole, CompletionRequest, LlmProvider, S2sEvent, S2sProvider,
    S2sSession, S2sSessionConfig, TtsProvider, VoiceProfile,
};
use crate::session::context::HotContextAssembler;

/// Output cap for one spoken NPC reply.
const REPLY_MAX_TOKENS: u32 = 256;

/// Capacity of the engine-to-TTS text channel.
const TEXT_CHANNEL_CAPACITY: usize = 8;

// ── Engine contract ──────────────────────────────────────────────

/// Per-NPC response generation strategy.
#[async_trait]
pub trait NpcEngine: Send + Sync {
    /// React to one finalized player utterance.
    async fn handle_utterance(
        &self,
        participant_id: &str,
        speaker: &str,
        text: &str,
    ) -> anyhow::Result<()>;

    /// Release engine resources. Idempotent.
    async fn close(&self) -> anyhow::Result<()>;
}

// ── Shared engine wiring ─────────────────────────────────────────

/// Dependencies every engine shares within one session.
#[derive(Clone)]
pub struct EngineShared {
    pub mixer: Arc<Mixer>,
    pub store: Arc<dyn SessionStore>,
    pub selector: Arc<TierSelector>,
    pub context: Arc<HotContextAssembler>,
    pub session_id: String,
    /// The `(sample_rate, channels)` the connection plays back. Segments
    /// are converted to this format before they reach the mixer.
    pub output_format: (u32, u16),
    /// Session background token; engine tasks end when the session ends.
    pub cancel: CancellationToken,
}

// ── Agent ────────────────────────────────────────────────────────

/// One NPC persona bound to its engine.
pub struct NpcAgent {
    pub name: String,
    pub voice: VoiceProfile,
    /// Topics this NPC can speak to; used by the router.
    pub knowledge_scope: Vec<String>,
    pub tier_override: Option<BudgetTier>,
    engine: Box<dyn NpcEngine>,
}

impl NpcAgent {
    pub fn new(
        name: impl Into<String>,
        voice: VoiceProfile,
        knowledge_scope: Vec<String>,
        tier_override: Option<BudgetTier>,
        engine: Box<dyn NpcEngine>,
    ) -> Self {
        Self {
            name: name.into(),
            voice,
            knowledge_scope,
            tier_override,
            engine,
        }
    }

    /// Forward one utterance to the engine.
    pub async fn handle_utterance(
        &self,
        participant_id: &str,
        speaker: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        self.engine.handle_utterance(participant_id, speaker, text).await
    }

    /// Close the engine. Idempotent.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.engine.close().await
    }
}

// ── Cascade engine ───────────────────────────────────────────────

/// LLM-then-TTS pipeline engine.
pub struct CascadeEngine {
    npc_name: String,
    persona: String,
    voice: VoiceProfile,
    priority: i32,
    tier_override: Option<BudgetTier>,
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    shared: EngineShared,
    closed: Mutex<bool>,
}

impl CascadeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        npc_name: impl Into<String>,
        persona: impl Into<String>,
        voice: VoiceProfile,
        priority: i32,
        tier_override: Option<BudgetTier>,
        llm: Arc<dyn LlmProvider>,
        tts: Arc<dyn TtsProvider>,
        shared: EngineShared,
    ) -> Self {
        Self {
            npc_name: npc_name.into(),
            persona: persona.into(),
            voice,
            priority,
            tier_override,
            llm,
            tts,
            shared,
            closed: Mutex::new(false),
        }
    }
}

#[async_trait]
impl NpcEngine for CascadeEngine {
    async fn handle_utterance(
        &self,
        _participant_id: &str,
        speaker: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        if *self.closed.lock() {
            anyhow::bail!("engine for {} is closed", self.npc_name);
        }

        if let Err(err) = self
            .shared
            .store
            .write_entry(
                &self.shared.session_id,
                TranscriptEntry::now(SpeakerRole::Player, speaker, text),
            )
            .await
        {
            tracing::warn!(error = %err, "failed to record player transcript entry");
        }

        let tier = self.shared.selector.select(text, self.tier_override);
        let hot_context = match self.shared.context.assemble(&self.npc_name).await {
            Ok(ctx) => ctx,
            Err(err) => {
                tracing::warn!(npc = %self.npc_name, error = %err, "hot context unavailable, answering cold");
                String::new()
            }
        };

        tracing::info!(
            npc = %self.npc_name,
            speaker = %speaker,
            tier = ?tier,
            "generating cascade response"
        );

        let request = CompletionRequest {
            system: format!("{}\n\n{hot_context}", self.persona),
            messages: vec![ChatMessage {
                role: ChatRole::User,
                content: format!("{speaker}: {text}"),
            }],
            max_tokens: REPLY_MAX_TOKENS,
            tool_budget_ms: tier.max_tool_latency().as_millis() as u64,
        };

        let mut deltas = self.llm.complete_stream(request).await?;
        let (text_tx, text_rx) = mpsc::channel::<String>(TEXT_CHANNEL_CAPACITY);
        let mut chunks = self
            .tts
            .synthesize_stream(&self.shared.cancel, text_rx, &self.voice)
            .await?;

        let (tts_rate, tts_channels) = self.tts.output_format();
        let (out_rate, out_channels) = self.shared.output_format;
        let (producer, segment) =
            AudioSegment::channel(self.npc_name.clone(), out_rate, out_channels, self.priority);
        self.shared.mixer.enqueue(segment, self.priority);

        // Text pump: LLM deltas into TTS, full reply into the store.
        let store = Arc::clone(&self.shared.store);
        let selector = Arc::clone(&self.shared.selector);
        let session_id = self.shared.session_id.clone();
        let npc_name = self.npc_name.clone();
        let cancel = self.shared.cancel.clone();
        tokio::spawn(async move {
            let mut reply = String::new();
            loop {
                tokio::select! {
                    delta = deltas.recv() => match delta {
                        Some(delta) => {
                            reply.push_str(&delta);
                            if text_tx.send(delta).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            drop(text_tx);
            if !reply.is_empty() {
                if let Err(err) = store
                    .write_entry(
                        &session_id,
                        TranscriptEntry::now(SpeakerRole::Npc, &npc_name, reply),
                    )
                    .await
                {
                    tracing::warn!(error = %err, "failed to record npc transcript entry");
                }
            }
            selector.record_turn();
        });

        // Audio pump: TTS chunks into the mixer segment, converted to the
        // connection's playback format. A backend failure mid-stream lands
        // on the segment's error slot; the mixer plays whatever arrived.
        let cancel = self.shared.cancel.clone();
        let npc = self.npc_name.clone();
        tokio::spawn(async move {
            let mut converter = FormatConverter::new(out_rate, out_channels);
            let mut producer = Some(producer);
            loop {
                tokio::select! {
                    chunk = chunks.recv() => match chunk {
                        Some(Ok(chunk)) => {
                            let frame = AudioFrame::new(
                                chunk,
                                tts_rate,
                                tts_channels,
                                std::time::Duration::ZERO,
                            );
                            let converted = converter.convert(frame);
                            if converted.is_empty() {
                                continue;
                            }
                            let delivered = match &producer {
                                Some(tx) => tx.send(converted.data).await,
                                None => false,
                            };
                            if !delivered {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            tracing::error!(npc = %npc, error = %err, "synthesis failed mid-stream");
                            if let Some(tx) = producer.take() {
                                tx.fail(err);
                            }
                            break;
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        tracing::debug!(npc = %self.npc_name, "cascade engine closed");
        Ok(())
    }
}

// ── S2S engine ───────────────────────────────────────────────────

/// End-to-end speech model engine.
pub struct S2sEngine {
    npc_name: String,
    session: Arc<dyn S2sSession>,
    tier_override: Option<BudgetTier>,
    shared: EngineShared,
    closed: Mutex<bool>,
}

impl S2sEngine {
    /// Connect the provider session and start the event relay.
    ///
    /// The provider is asked to synthesize directly in the connection's
    /// playback format.
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        npc_name: impl Into<String>,
        persona: impl Into<String>,
        voice: VoiceProfile,
        priority: i32,
        tier_override: Option<BudgetTier>,
        provider: Arc<dyn S2sProvider>,
        shared: EngineShared,
    ) -> anyhow::Result<Self> {
        let npc_name = npc_name.into();
        let (sample_rate, channels) = shared.output_format;
        let stream = provider
            .connect(
                &shared.cancel,
                S2sSessionConfig {
                    voice,
                    system_prompt: persona.into(),
                    sample_rate,
                    channels,
                },
            )
            .await?;

        let session: Arc<dyn S2sSession> = Arc::from(stream.handle);
        tokio::spawn(relay_s2s_events(
            npc_name.clone(),
            stream.events,
            sample_rate,
            channels,
            priority,
            shared.clone(),
        ));

        Ok(Self {
            npc_name,
            session,
            tier_override,
            shared,
            closed: Mutex::new(false),
        })
    }
}

/// Turn interleaved provider events into mixer segments and transcript
/// entries. One segment per model turn.
async fn relay_s2s_events(
    npc_name: String,
    mut events: mpsc::Receiver<S2sEvent>,
    sample_rate: u32,
    channels: u16,
    priority: i32,
    shared: EngineShared,
) {
    let mut producer = None;
    let mut transcript = String::new();

    loop {
        let event = tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
            _ = shared.cancel.cancelled() => break,
        };

        match event {
            S2sEvent::Audio(chunk) => {
                if producer.is_none() {
                    let (tx, segment) =
                        AudioSegment::channel(npc_name.clone(), sample_rate, channels, priority);
                    shared.mixer.enqueue(segment, priority);
                    producer = Some(tx);
                }
                let delivered = match &producer {
                    Some(tx) => tx.send(chunk).await,
                    None => false,
                };
                if !delivered {
                    producer = None;
                }
            }
            S2sEvent::Text(text) => transcript.push_str(&text),
            S2sEvent::Error(message) => {
                tracing::error!(npc = %npc_name, error = %message, "s2s session reported failure");
                if let Some(tx) = producer.take() {
                    tx.fail(&message);
                }
            }
            S2sEvent::TurnComplete => {
                producer = None;
                if !transcript.is_empty() {
                    let entry =
                        TranscriptEntry::now(SpeakerRole::Npc, &npc_name, transcript.clone());
                    if let Err(err) = shared.store.write_entry(&shared.session_id, entry).await {
                        tracing::warn!(error = %err, "failed to record s2s transcript entry");
                    }
                    transcript.clear();
                }
                shared.selector.record_turn();
            }
        }
    }
}

#[async_trait]
impl NpcEngine for S2sEngine {
    async fn handle_utterance(
        &self,
        _participant_id: &str,
        speaker: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        if *self.closed.lock() {
            anyhow::bail!("engine for {} is closed", self.npc_name);
        }

        if let Err(err) = self
            .shared
            .store
            .write_entry(
                &self.shared.session_id,
                TranscriptEntry::now(SpeakerRole::Player, speaker, text),
            )
            .await
        {
            tracing::warn!(error = %err, "failed to record player transcript entry");
        }

        // The tier still gates the provider's tool access per utterance.
        let tier = self.shared.selector.select(text, self.tier_override);
        tracing::info!(npc = %self.npc_name, tier = ?tier, "forwarding utterance to s2s session");
        self.session.send_text(&format!("{speaker}: {text}")).await
    }

    async fn close(&self) -> anyhow::Result<()> {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.session.close().await
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemorySessionStore;
    use crate::mixer::OutputSink;
    use crate::providers::{
        ChatRole, LlmCapabilities, S2sStream,
    };
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(500);

    fn sink_mixer() -> (Arc<Mixer>, mpsc::UnboundedReceiver<Vec<u8>>) {
        crate::test_log::init();
        let (tx, rx) = mpsc::unbounded_channel();
        let output: OutputSink = Box::new(move |chunk| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(chunk);
            })
        });
        (Arc::new(Mixer::new(output, Duration::ZERO)), rx)
    }

    fn shared(
        mixer: Arc<Mixer>,
        store: Arc<InMemorySessionStore>,
    ) -> EngineShared {
        let store = store as Arc<dyn SessionStore>;
        EngineShared {
            mixer,
            store: Arc::clone(&store),
            selector: Arc::new(TierSelector::default()),
            context: Arc::new(HotContextAssembler::new(Arc::clone(&store), "s1", 8)),
            session_id: "s1".into(),
            output_format: (24_000, 1),
            cancel: CancellationToken::new(),
        }
    }

    async fn wait_for_entries(store: &InMemorySessionStore, count: usize) {
        timeout(WAIT, async {
            loop {
                if store.entry_count("s1").await.unwrap() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("store reaches expected entry count");
    }

    struct EchoLlm;

    #[async_trait]
    impl LlmProvider for EchoLlm {
        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            Ok("Aye.".into())
        }

        async fn complete_stream(
            &self,
            request: CompletionRequest,
        ) -> anyhow::Result<mpsc::Receiver<String>> {
            assert_eq!(request.messages[0].role, ChatRole::User);
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send("Aye, ".to_string()).await;
                let _ = tx.send("traveler.".to_string()).await;
            });
            Ok(rx)
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }

        fn capabilities(&self) -> LlmCapabilities {
            LlmCapabilities {
                model: "echo".into(),
                supports_tools: false,
                max_context_tokens: 4096,
            }
        }
    }

    /// Emits one fixed PCM chunk per text piece, already in 24 kHz mono.
    struct OneChunkTts;

    #[async_trait]
    impl TtsProvider for OneChunkTts {
        async fn synthesize_stream(
            &self,
            _cancel: &CancellationToken,
            mut text: mpsc::Receiver<String>,
            _voice: &VoiceProfile,
        ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<Vec<u8>>>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                while text.recv().await.is_some() {
                    let _ = tx.send(Ok(vec![1, 2, 3, 4])).await;
                }
            });
            Ok(rx)
        }

        fn output_format(&self) -> (u32, u16) {
            (24_000, 1)
        }
    }

    /// Produces one chunk, then dies mid-stream.
    struct FlakyTts;

    #[async_trait]
    impl TtsProvider for FlakyTts {
        async fn synthesize_stream(
            &self,
            _cancel: &CancellationToken,
            mut text: mpsc::Receiver<String>,
            _voice: &VoiceProfile,
        ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<Vec<u8>>>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                while text.recv().await.is_some() {}
                let _ = tx.send(Ok(vec![1, 2, 3, 4])).await;
                let _ = tx
                    .send(Err(anyhow::anyhow!("synthesis backend dropped")))
                    .await;
            });
            Ok(rx)
        }

        fn output_format(&self) -> (u32, u16) {
            (24_000, 1)
        }
    }

    #[tokio::test]
    async fn cascade_engine_speaks_and_records_both_sides() {
        let (mixer, mut sink) = sink_mixer();
        let store = Arc::new(InMemorySessionStore::new());
        let engine = CascadeEngine::new(
            "Morwen",
            "You are Morwen.",
            VoiceProfile::default(),
            5,
            None,
            Arc::new(EchoLlm),
            Arc::new(OneChunkTts),
            shared(Arc::clone(&mixer), Arc::clone(&store)),
        );

        engine
            .handle_utterance("p1", "Astrid", "any rooms?")
            .await
            .unwrap();

        // Synthesized audio reaches the mixer sink.
        let chunk = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(chunk, vec![1, 2, 3, 4]);

        // Player line and the assembled reply both land in the store.
        wait_for_entries(&store, 2).await;
        let entries = store.get_recent("s1", 10).await.unwrap();
        assert_eq!(entries[0].role, SpeakerRole::Player);
        assert_eq!(entries[0].speaker, "Astrid");
        let npc_entry = entries
            .iter()
            .find(|e| e.role == SpeakerRole::Npc)
            .expect("npc reply recorded");
        assert_eq!(npc_entry.text, "Aye, traveler.");

        mixer.close().await;
    }

    #[tokio::test]
    async fn cascade_engine_survives_mid_stream_synthesis_failure() {
        let (mixer, mut sink) = sink_mixer();
        let store = Arc::new(InMemorySessionStore::new());
        let engine = CascadeEngine::new(
            "Morwen",
            "You are Morwen.",
            VoiceProfile::default(),
            5,
            None,
            Arc::new(EchoLlm),
            Arc::new(FlakyTts),
            shared(Arc::clone(&mixer), Arc::clone(&store)),
        );

        engine
            .handle_utterance("p1", "Astrid", "any rooms?")
            .await
            .unwrap();

        // The chunk produced before the failure still plays.
        let chunk = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(chunk, vec![1, 2, 3, 4]);

        // The failure is recorded on the segment, not surfaced as a crash,
        // and the reply transcript is still written.
        wait_for_entries(&store, 2).await;

        // The mixer keeps dispatching after the failed segment.
        let (tx, segment) = AudioSegment::channel("guard", 24_000, 1, 5);
        mixer.enqueue(segment, 5);
        assert!(tx.send(vec![7, 7]).await);
        drop(tx);
        let next = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(next, vec![7, 7]);

        mixer.close().await;
    }

    #[tokio::test]
    async fn cascade_engine_rejects_after_close() {
        let (mixer, _sink) = sink_mixer();
        let store = Arc::new(InMemorySessionStore::new());
        let engine = CascadeEngine::new(
            "Morwen",
            "You are Morwen.",
            VoiceProfile::default(),
            5,
            None,
            Arc::new(EchoLlm),
            Arc::new(OneChunkTts),
            shared(Arc::clone(&mixer), store),
        );

        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert!(engine
            .handle_utterance("p1", "Astrid", "hello?")
            .await
            .is_err());
        mixer.close().await;
    }

    struct MockS2sSession {
        sent: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl S2sSession for MockS2sSession {
        async fn send_text(&self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().push(text.to_string());
            Ok(())
        }

        async fn send_audio(&self, _pcm: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    struct MockS2sProvider {
        events_rx: Mutex<Option<mpsc::Receiver<S2sEvent>>>,
        sent: Arc<Mutex<Vec<String>>>,
        closes: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl S2sProvider for MockS2sProvider {
        async fn connect(
            &self,
            _cancel: &CancellationToken,
            config: S2sSessionConfig,
        ) -> anyhow::Result<S2sStream> {
            assert_eq!(config.sample_rate, 24_000);
            assert_eq!(config.channels, 1);
            Ok(S2sStream {
                handle: Box::new(MockS2sSession {
                    sent: Arc::clone(&self.sent),
                    closes: Arc::clone(&self.closes),
                }),
                events: self.events_rx.lock().take().expect("single connect"),
            })
        }
    }

    #[tokio::test]
    async fn s2s_engine_relays_turns_into_segments() {
        let (mixer, mut sink) = sink_mixer();
        let store = Arc::new(InMemorySessionStore::new());
        let (events_tx, events_rx) = mpsc::channel(16);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(0));
        let provider = Arc::new(MockS2sProvider {
            events_rx: Mutex::new(Some(events_rx)),
            sent: Arc::clone(&sent),
            closes: Arc::clone(&closes),
        });

        let engine = S2sEngine::connect(
            "Strahd",
            "You are Strahd.",
            VoiceProfile::default(),
            9,
            None,
            provider,
            shared(Arc::clone(&mixer), Arc::clone(&store)),
        )
        .await
        .unwrap();

        engine
            .handle_utterance("p1", "Astrid", "we meet at last")
            .await
            .unwrap();
        assert_eq!(sent.lock().as_slice(), &["Astrid: we meet at last"]);

        events_tx
            .send(S2sEvent::Audio(vec![9, 9, 9, 9]))
            .await
            .unwrap();
        events_tx
            .send(S2sEvent::Text("At last indeed.".into()))
            .await
            .unwrap();
        events_tx.send(S2sEvent::TurnComplete).await.unwrap();

        let chunk = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(chunk, vec![9, 9, 9, 9]);

        wait_for_entries(&store, 2).await;
        let entries = store.get_recent("s1", 10).await.unwrap();
        let npc_entry = entries
            .iter()
            .find(|e| e.role == SpeakerRole::Npc)
            .expect("npc turn recorded");
        assert_eq!(npc_entry.text, "At last indeed.");

        // A provider failure truncates the in-flight segment and the relay
        // keeps serving later turns.
        events_tx
            .send(S2sEvent::Audio(vec![1, 1, 1, 1]))
            .await
            .unwrap();
        events_tx
            .send(S2sEvent::Error("realtime socket dropped".into()))
            .await
            .unwrap();
        let truncated = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(truncated, vec![1, 1, 1, 1]);

        events_tx
            .send(S2sEvent::Audio(vec![2, 2, 2, 2]))
            .await
            .unwrap();
        events_tx.send(S2sEvent::TurnComplete).await.unwrap();
        let recovered = timeout(WAIT, sink.recv()).await.unwrap().unwrap();
        assert_eq!(recovered, vec![2, 2, 2, 2]);

        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(*closes.lock(), 1);
        mixer.close().await;
    }
}
