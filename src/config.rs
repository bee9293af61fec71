//! Engine configuration.
//!
//! Loaded once from YAML at startup; every section carries serde defaults
//! so a minimal file (or none at all) yields a working engine. Hot reload
//! is a host concern, not the engine's.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::budget::{BudgetTier, SelectorConfig};
use crate::providers::VoiceProfile;
use crate::session::context::DEFAULT_CONTEXT_WINDOW;

// ── Top level ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Campaign name; feeds the deterministic session identifier.
    pub campaign: String,
    /// BCP-47 language tag for transcription.
    pub language: Language,
    pub mixer: MixerSettings,
    pub selector: SelectorSettings,
    pub consolidation: ConsolidationSettings,
    /// Recent transcript entries fed to each NPC prompt.
    pub context_window: ContextWindow,
    pub npcs: Vec<NpcConfig>,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }
}

/// Newtype so the language default is expressible in serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language(pub String);

impl Default for Language {
    fn default() -> Self {
        Self("en-US".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow(pub usize);

impl Default for ContextWindow {
    fn default() -> Self {
        Self(DEFAULT_CONTEXT_WINDOW)
    }
}

// ── Mixer ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerSettings {
    /// Base inter-segment silence in milliseconds; zero disables the gap.
    pub gap_ms: u64,
}

impl Default for MixerSettings {
    fn default() -> Self {
        Self { gap_ms: 250 }
    }
}

impl MixerSettings {
    pub fn gap(&self) -> Duration {
        Duration::from_millis(self.gap_ms)
    }
}

// ── Selector ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Extra phrases forcing a Deep response, merged with the defaults.
    pub deep_keywords: Vec<String>,
    /// Extra phrases suggesting memory lookups, merged with the defaults.
    pub standard_keywords: Vec<String>,
    /// Minimum seconds between two Deep selections.
    pub min_deep_interval_secs: u64,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            deep_keywords: Vec::new(),
            standard_keywords: Vec::new(),
            min_deep_interval_secs: 30,
        }
    }
}

impl SelectorSettings {
    /// Resolve into the selector's runtime configuration.
    pub fn to_selector_config(&self) -> SelectorConfig {
        let mut config = SelectorConfig {
            min_deep_interval: Duration::from_secs(self.min_deep_interval_secs),
            ..SelectorConfig::default()
        };
        config
            .deep_keywords
            .extend(self.deep_keywords.iter().map(|s| s.to_lowercase()));
        config
            .standard_keywords
            .extend(self.standard_keywords.iter().map(|s| s.to_lowercase()));
        config
    }
}

// ── Consolidation ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationSettings {
    /// Seconds between background consolidation passes.
    pub interval_secs: u64,
}

impl Default for ConsolidationSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl ConsolidationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ── NPCs ─────────────────────────────────────────────────────────

/// Response generation strategy for one NPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Text generation then synthesis.
    #[default]
    Cascade,
    /// End-to-end speech model.
    S2s,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NpcConfig {
    pub name: String,
    /// In-character system prompt.
    pub persona: String,
    /// Synthesis voice identifier.
    pub voice: String,
    pub engine: EngineKind,
    /// Topics this NPC answers for; used by the router.
    pub knowledge_scope: Vec<String>,
    /// Pin every response of this NPC to one tier.
    pub tier_override: Option<BudgetTier>,
    /// Mixer priority of this NPC's segments.
    pub priority: i32,
}

impl Default for NpcConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            persona: String::new(),
            voice: "narrator".to_string(),
            engine: EngineKind::Cascade,
            knowledge_scope: Vec::new(),
            tier_override: None,
            priority: 5,
        }
    }
}

impl NpcConfig {
    pub fn voice_profile(&self, language: &Language) -> VoiceProfile {
        VoiceProfile {
            voice_id: self.voice.clone(),
            language: language.0.clone(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
