//! Concurrency groups: a newer run for the same key supersedes older ones.
//!
//! Keys are `<group>@<ref>`. Claiming a key cancels the current holder and
//! waits until it has released (its jobs finished and environments torn
//! down) before returning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
struct Slot {
    generation: u64,
    cancel: CancellationToken,
    released: watch::Receiver<bool>,
}

/// Registry of live concurrency-group claims, shared across runs.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyGroups {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl ConcurrencyGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key`, cancelling and waiting out any current holder.
    ///
    /// The returned claim's token is a child of `parent`.
    pub async fn claim(&self, key: &str, parent: &CancellationToken) -> GroupClaim {
        let (previous, claim) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let mut generations = self.generations.lock().unwrap_or_else(|e| e.into_inner());
            let generation = generations.entry(key.to_string()).or_insert(0);
            *generation += 1;

            let cancel = parent.child_token();
            let (released_tx, released_rx) = watch::channel(false);
            let previous = slots.insert(
                key.to_string(),
                Slot {
                    generation: *generation,
                    cancel: cancel.clone(),
                    released: released_rx,
                },
            );
            let claim = GroupClaim {
                key: key.to_string(),
                generation: *generation,
                cancel,
                released: released_tx,
                slots: Arc::clone(&self.slots),
            };
            (previous, claim)
        };

        if let Some(previous) = previous {
            info!(group = %key, superseded = previous.generation, by = claim.generation, "Cancelling superseded run");
            previous.cancel.cancel();
            let mut released = previous.released;
            let _ = released.wait_for(|done| *done).await;
        }
        claim
    }

    /// Whether anything currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }
}

/// Ownership of one concurrency key. Released on drop.
#[derive(Debug)]
pub struct GroupClaim {
    key: String,
    generation: u64,
    cancel: CancellationToken,
    released: watch::Sender<bool>,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl GroupClaim {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancelled when a newer run claims the same key.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for GroupClaim {
    fn drop(&mut self) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            if slots.get(&self.key).map(|s| s.generation) == Some(self.generation) {
                slots.remove(&self.key);
            }
        }
        self.released.send_replace(true);
    }
}
