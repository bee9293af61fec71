//! Hot-context assembly: the recent-memory prompt block handed to an
//! NPC's generation step.

use std::sync::Arc;

use crate::memory::{SessionStore, SpeakerRole};

/// How many recent transcript entries feed the prompt by default.
pub const DEFAULT_CONTEXT_WINDOW: usize = 12;

/// Builds the recent-transcript prompt context for one session.
pub struct HotContextAssembler {
    store: Arc<dyn SessionStore>,
    session_id: String,
    window: usize,
}

impl HotContextAssembler {
    pub fn new(store: Arc<dyn SessionStore>, session_id: impl Into<String>, window: usize) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            window,
        }
    }

    /// Assemble the context block for the named NPC.
    ///
    /// Empty when the session has no transcript yet.
    pub async fn assemble(&self, npc_name: &str) -> anyhow::Result<String> {
        let recent = self.store.get_recent(&self.session_id, self.window).await?;
        if recent.is_empty() {
            return Ok(String::new());
        }

        let mut block = String::from("Recent table talk, oldest first:\n");
        for entry in &recent {
            let marker = match entry.role {
                SpeakerRole::Player => "player",
                SpeakerRole::Npc => "npc",
            };
            block.push_str(&format!("- [{marker}] {}: {}\n", entry.speaker, entry.text));
        }
        block.push_str(&format!(
            "You are {npc_name}. Answer in character, briefly, as spoken dialogue."
        ));
        Ok(block)
    }
}

// ── Tests ────────────────────────────────────────────────────────
