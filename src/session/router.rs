//! Routes finalized player utterances to the NPC that should answer.
//!
//! Resolution ladder, first match wins:
//! 1. direct name mention (config order breaks ties)
//! 2. knowledge-scope keyword overlap
//! 3. the NPC this participant last addressed
//!
//! An unroutable utterance returns `None` and is dropped by the caller;
//! table chatter that names no one is not answered.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::agent::NpcAgent;

pub struct UtteranceRouter {
    agents: Vec<Arc<NpcAgent>>,
    /// Participant id → index of the agent they last addressed.
    last_addressed: Mutex<HashMap<String, usize>>,
}

impl UtteranceRouter {
    pub fn new(agents: Vec<Arc<NpcAgent>>) -> Self {
        Self {
            agents,
            last_addressed: Mutex::new(HashMap::new()),
        }
    }

    /// All registered agents, in configuration order.
    pub fn agents(&self) -> &[Arc<NpcAgent>] {
        &self.agents
    }

    /// Pick the NPC for one utterance, or `None` when nobody is addressed.
    pub fn route(&self, participant_id: &str, text: &str) -> Option<Arc<NpcAgent>> {
        let lowered = text.to_lowercase();

        let by_name = self
            .agents
            .iter()
            .position(|a| lowered.contains(&a.name.to_lowercase()));
        if let Some(idx) = by_name {
            self.remember(participant_id, idx);
            return Some(Arc::clone(&self.agents[idx]));
        }

        let by_scope = self.agents.iter().position(|a| {
            a.knowledge_scope
                .iter()
                .any(|topic| lowered.contains(&topic.to_lowercase()))
        });
        if let Some(idx) = by_scope {
            self.remember(participant_id, idx);
            return Some(Arc::clone(&self.agents[idx]));
        }

        self.last_addressed
            .lock()
            .get(participant_id)
            .and_then(|&idx| self.agents.get(idx))
            .map(Arc::clone)
    }

    fn remember(&self, participant_id: &str, idx: usize) {
        self.last_addressed
            .lock()
            .insert(participant_id.to_string(), idx);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::VoiceProfile;
    use crate::session::agent::NpcEngine;
    use async_trait::async_trait;

    struct NullEngine;

    #[async_trait]
    impl NpcEngine for NullEngine {
        async fn handle_utterance(&self, _: &str, _: &str, _: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn agent(name: &str, scope: &[&str]) -> Arc<NpcAgent> {
        Arc::new(NpcAgent::new(
            name,
            VoiceProfile::default(),
            scope.iter().map(|s| s.to_string()).collect(),
            None,
            Box::new(NullEngine),
        ))
    }

    fn router() -> UtteranceRouter {
        UtteranceRouter::new(vec![
            agent("Morwen", &["inn", "ale", "rooms"]),
            agent("Captain Hale", &["guard", "gate", "patrol"]),
        ])
    }

    #[test]
    fn name_mention_wins() {
        let router = router();
        let routed = router.route("p1", "Morwen, another round please").unwrap();
        assert_eq!(routed.name, "Morwen");
    }

    #[test]
    fn knowledge_scope_matches() {
        let router = router();
        let routed = router.route("p1", "who watches the gate at night?").unwrap();
        assert_eq!(routed.name, "Captain Hale");
    }

    #[test]
    fn name_beats_scope() {
        let router = router();
        // Mentions Morwen while talking about the gate.
        let routed = router.route("p1", "morwen, what about the gate?").unwrap();
        assert_eq!(routed.name, "Morwen");
    }

    #[test]
    fn falls_back_to_last_addressed_per_participant() {
        let router = router();
        router.route("p1", "captain hale, any trouble?").unwrap();

        let followup = router.route("p1", "and last night?").unwrap();
        assert_eq!(followup.name, "Captain Hale");

        // A different participant has no history.
        assert!(router.route("p2", "and last night?").is_none());
    }

    #[test]
    fn unaddressed_chatter_routes_nowhere() {
        let router = router();
        assert!(router.route("p1", "nice weather out here").is_none());
    }
}
