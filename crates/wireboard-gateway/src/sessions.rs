use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use wireboard_runtime::SecretKeeper;

struct Entry {
    keeper: Arc<SecretKeeper>,
    last_used: Instant,
}

/// One `SecretKeeper` per harness session, evicted after `ttl` of idleness.
///
/// Tokens issued to one session never resolve in another.
pub struct SessionKeepers {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl SessionKeepers {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Keeper for `session`, created on first use. Touches the session.
    pub fn keeper_for(&self, session: &str) -> Arc<SecretKeeper> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(session.to_string()).or_insert_with(|| {
            debug!(session = %session, "New proxy session");
            Entry {
                keeper: Arc::new(SecretKeeper::new()),
                last_used: now,
            }
        });
        entry.last_used = now;
        entry.keeper.clone()
    }

    /// Drop sessions idle for longer than the TTL. Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|session, entry| {
            let keep = now.duration_since(entry.last_used) <= self.ttl;
            if !keep {
                debug!(session = %session, "Evicting idle proxy session");
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
