use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lightweight keyed mutex: serializes work per key while leaving different
/// keys fully parallel. Guards are handed out as owned so they can cross
/// await points.
pub struct KeyedMutex<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self { slots: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            Arc::clone(slots.entry(key).or_default())
        };
        slot.lock_owned().await
    }
}
