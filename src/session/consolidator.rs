//! Background consolidation of accumulated transcript entries.
//!
//! Runs on an interval under the session's background context: new entries
//! since the previous pass are summarized (via the LLM when one is
//! configured, as a verbatim digest otherwise) and written back to the
//! session store as a recap entry. `stop` runs one final pass before
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::memory::{SessionStore, SpeakerRole, TranscriptEntry};
use crate::providers::{ChatMessage, ChatRole, CompletionRequest, LlmProvider};

/// Default spacing between consolidation passes.
pub const DEFAULT_CONSOLIDATE_INTERVAL: Duration = Duration::from_secs(300);

/// Speaker name recap entries are filed under.
const RECAP_SPEAKER: &str = "session-recap";

const SUMMARY_MAX_TOKENS: u32 = 200;

pub struct Consolidator {
    store: Arc<dyn SessionStore>,
    llm: Option<Arc<dyn LlmProvider>>,
    session_id: String,
    interval: Duration,
    /// Entries already covered by a previous pass.
    consolidated: Mutex<usize>,
}

impl Consolidator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        llm: Option<Arc<dyn LlmProvider>>,
        session_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            llm,
            session_id: session_id.into(),
            interval,
            consolidated: Mutex::new(0),
        }
    }

    /// Interval loop; exits when the session token is cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; skip it so the loop waits
        // a full interval before the first pass.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.consolidate_once().await {
                        tracing::warn!(session_id = %self.session_id, error = %err, "consolidation pass failed");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!(session_id = %self.session_id, "consolidator stopped");
                    break;
                }
            }
        }
    }

    /// Summarize everything accumulated since the previous pass.
    pub async fn consolidate_once(&self) -> anyhow::Result<()> {
        let total = self.store.entry_count(&self.session_id).await?;
        let covered = *self.consolidated.lock();
        if total <= covered {
            return Ok(());
        }

        let fresh = self
            .store
            .get_recent(&self.session_id, total - covered)
            .await?;
        let digest = self.summarize(&fresh).await;

        self.store
            .write_entry(
                &self.session_id,
                TranscriptEntry::now(SpeakerRole::Npc, RECAP_SPEAKER, digest),
            )
            .await?;

        // The recap entry itself is never re-summarized.
        *self.consolidated.lock() = total + 1;
        tracing::info!(
            session_id = %self.session_id,
            entries = fresh.len(),
            "consolidated transcript entries"
        );
        Ok(())
    }

    async fn summarize(&self, entries: &[TranscriptEntry]) -> String {
        let raw: String = entries
            .iter()
            .map(|e| format!("{}: {}\n", e.speaker, e.text))
            .collect();

        if let Some(llm) = &self.llm {
            let request = CompletionRequest {
                system: "Summarize the following tabletop session excerpt in a few \
                         sentences. Keep names, places and promises."
                    .to_string(),
                messages: vec![ChatMessage {
                    role: ChatRole::User,
                    content: raw.clone(),
                }],
                max_tokens: SUMMARY_MAX_TOKENS,
                tool_budget_ms: 0,
            };
            match llm.complete(request).await {
                Ok(summary) => return summary,
                Err(err) => {
                    tracing::warn!(error = %err, "llm summary failed, storing verbatim digest");
                }
            }
        }
        raw.trim_end().to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────
