//! Session-memory contracts.
//!
//! The long-term store (knowledge graph, transcript persistence, vector
//! search) is an external collaborator; the engine only consumes these
//! interfaces. An in-memory session store is provided for development and
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Transcript entries ───────────────────────────────────────────

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerRole {
    Player,
    Npc,
}

/// One line of session transcript. Append-only from the engine's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: SpeakerRole,
    pub speaker: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    /// Entry stamped with the current instant.
    pub fn now(role: SpeakerRole, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role,
            speaker: speaker.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

/// A campaign entity authored by the DM (person, place, item, faction).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

// ── Store contracts ──────────────────────────────────────────────

/// Transcript persistence for one or more sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append one transcript entry.
    async fn write_entry(&self, session_id: &str, entry: TranscriptEntry) -> anyhow::Result<()>;

    /// The most recent `window` entries, oldest first.
    async fn get_recent(
        &self,
        session_id: &str,
        window: usize,
    ) -> anyhow::Result<Vec<TranscriptEntry>>;

    /// Total entries recorded for the session.
    async fn entry_count(&self, session_id: &str) -> anyhow::Result<usize>;
}

/// Campaign knowledge graph.
#[async_trait]
pub trait KnowledgeGraph: Send + Sync {
    async fn add_entity(&self, entity: EntityDef) -> anyhow::Result<()>;
}

/// Durable entity storage.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_entity(&self, entity: &EntityDef) -> anyhow::Result<()>;
}

// ── In-memory store ──────────────────────────────────────────────

/// Process-local session store for development and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: Mutex<HashMap<String, Vec<TranscriptEntry>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn write_entry(&self, session_id: &str, entry: TranscriptEntry) -> anyhow::Result<()> {
        self.entries
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn get_recent(
        &self,
        session_id: &str,
        window: usize,
    ) -> anyhow::Result<Vec<TranscriptEntry>> {
        let map = self.entries.lock();
        let entries = map.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = entries.len().saturating_sub(window);
        Ok(entries[start..].to_vec())
    }

    async fn entry_count(&self, session_id: &str) -> anyhow::Result<usize> {
        Ok(self
            .entries
            .lock()
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0))
    }
}

// ── Tests ────────────────────────────────────────────────────────
