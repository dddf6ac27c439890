use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Process-wide registry of in-flight generation and edit operations.
///
/// Generation operations are keyed by the contract id; edit operations use a
/// composite `edit_<contract_id>_<millis>` key so repeated edits against the
/// same contract never collide. Tokens are transient: they are registered at
/// operation start and removed when the operation's terminal event has been
/// emitted, and nothing here survives a process restart.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation_key(contract_id: Uuid) -> String {
        contract_id.to_string()
    }

    pub fn edit_key(contract_id: Uuid) -> String {
        format!("edit_{}_{}", contract_id, Utc::now().timestamp_millis())
    }

    /// Insert-if-absent. Returns the already-registered token when the key is
    /// live so a racing re-register cannot orphan an active operation.
    pub fn register(&self, key: &str) -> CancellationToken {
        self.tokens
            .entry(key.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Signals the generation operation and every edit operation keyed to the
    /// contract. Returns how many live (not yet cancelled) operations were
    /// signalled; zero means nothing was active.
    pub fn cancel_for_contract(&self, contract_id: Uuid) -> usize {
        let generation_key = Self::generation_key(contract_id);
        let edit_prefix = format!("edit_{contract_id}_");
        let mut signalled = 0;
        for entry in self.tokens.iter() {
            if (entry.key() == &generation_key || entry.key().starts_with(&edit_prefix))
                && !entry.value().is_cancelled()
            {
                entry.value().cancel();
                signalled += 1;
            }
        }
        signalled
    }

    /// Removing an absent key is fine: the operation already finished.
    pub fn remove(&self, key: &str) {
        self.tokens.remove(key);
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.tokens.contains_key(key)
    }
}
