//! Tool-latency budget tiers and the per-utterance tier selector.
//!
//! Every NPC response generation gets a latency envelope that decides
//! which external tools the generation step may call. Selection is pure
//! keyword/state heuristics: constant-time, no I/O, safe to call on the
//! hot path for every finalized utterance.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ── Tiers ────────────────────────────────────────────────────────

/// Latency envelope for one NPC response generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetTier {
    /// Reflex answers; no slow tools.
    Fast,
    /// Memory lookups and rule checks.
    Standard,
    /// Long-form recall, web search, image generation.
    Deep,
}

impl BudgetTier {
    /// Declared maximum tool latency for the tier.
    pub fn max_tool_latency(self) -> Duration {
        match self {
            Self::Fast => Duration::from_millis(500),
            Self::Standard => Duration::from_millis(1500),
            Self::Deep => Duration::from_millis(4000),
        }
    }
}

// ── Configuration ────────────────────────────────────────────────

/// Tuning knobs for the selector.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Phrases that demand a Deep response.
    pub deep_keywords: Vec<String>,
    /// Phrases that suggest memory or rules lookups.
    pub standard_keywords: Vec<String>,
    /// Minimum spacing between two Deep selections.
    pub min_deep_interval: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            deep_keywords: [
                "think carefully",
                "take your time",
                "explain everything",
                "tell me everything",
                "in detail",
                "deep search",
                "generate image",
                "search the web",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            standard_keywords: [
                "remember",
                "last time",
                "previously",
                "search",
                "look up",
                "rules",
                "who is",
                "tell me about",
                "what do you know",
                "history",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            min_deep_interval: Duration::from_secs(30),
        }
    }
}

// ── Selector ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SelectorState {
    /// Completed turns this session.
    turns: u64,
    /// Most recent Deep selection; `None` = never.
    last_deep: Option<Instant>,
    /// Current response wait-queue depth.
    queue_depth: usize,
}

/// Chooses a [`BudgetTier`] for each player utterance.
pub struct TierSelector {
    config: SelectorConfig,
    state: Mutex<SelectorState>,
}

impl TierSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SelectorState::default()),
        }
    }

    /// Pick the tier for one utterance. First match wins:
    ///
    /// 1. an explicit DM override;
    /// 2. a deep keyword, demoted to Standard when the previous Deep was
    ///    under the configured minimum interval ago;
    /// 3. queue pressure (depth ≥ 3) forces Fast;
    /// 4. a standard keyword;
    /// 5. the opening turn gets Standard so openers can consult memory;
    /// 6. otherwise Fast.
    pub fn select(&self, text: &str, dm_override: Option<BudgetTier>) -> BudgetTier {
        if let Some(tier) = dm_override {
            return tier;
        }

        let lowered = text.to_lowercase();
        let mut state = self.state.lock();

        if contains_any(&lowered, &self.config.deep_keywords) {
            let now = Instant::now();
            if let Some(last) = state.last_deep {
                if now.duration_since(last) < self.config.min_deep_interval {
                    return BudgetTier::Standard;
                }
            }
            state.last_deep = Some(now);
            return BudgetTier::Deep;
        }

        if state.queue_depth >= 3 {
            return BudgetTier::Fast;
        }

        if contains_any(&lowered, &self.config.standard_keywords) {
            return BudgetTier::Standard;
        }

        if state.turns == 0 {
            return BudgetTier::Standard;
        }

        BudgetTier::Fast
    }

    /// Count one completed turn.
    pub fn record_turn(&self) {
        self.state.lock().turns += 1;
    }

    /// Report the current wait-queue size.
    pub fn set_queue_depth(&self, depth: usize) {
        self.state.lock().queue_depth = depth;
    }

    /// Clear all state.
    pub fn reset(&self) {
        *self.state.lock() = SelectorState::default();
    }
}

impl Default for TierSelector {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

// ── Tests ────────────────────────────────────────────────────────
