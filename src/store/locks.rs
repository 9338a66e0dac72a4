use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const PRUNE_THRESHOLD: usize = 1024;

/// Async per-key mutexes serializing read-modify-write of shared records.
///
/// Entries are held weakly; a key's mutex lives only while some task holds
/// or waits on it.
#[derive(Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

/// Held lock on one key; released on drop.
pub struct KeyGuard {
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let slot = {
            let mut slots = self.slots.lock();
            if slots.len() >= PRUNE_THRESHOLD {
                slots.retain(|_, weak| weak.strong_count() > 0);
            }
            match slots.get(key).and_then(Weak::upgrade) {
                Some(existing) => existing,
                None => {
                    let fresh = Arc::new(AsyncMutex::new(()));
                    slots.insert(key.to_string(), Arc::downgrade(&fresh));
                    fresh
                }
            }
        };
        KeyGuard {
            _guard: slot.lock_owned().await,
        }
    }

    pub fn client_key(partition: &str, client_id: &str) -> String {
        format!("client/{partition}/{client_id}")
    }

    pub fn subscription_key(key: &impl std::fmt::Display) -> String {
        format!("sub/{key}")
    }

    #[cfg(test)]
    fn live(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
