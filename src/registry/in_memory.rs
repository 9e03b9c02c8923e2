use crate::registry::{RegistryStore, StoreError, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

const SUBSCRIPTION_BUFFER: usize = 256;

// A single-process stand-in for the shared store. Expiry is evaluated lazily on read, which is
// observationally the same as the store evicting keys in the background.
pub struct InMemoryStore {
    state: Mutex<State>,
    reachable: AtomicBool,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::Sender<String>>>,
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            state: Mutex::new(State::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the network path to the store. Going unreachable drops every
    /// open subscription.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
        if !reachable {
            self.lock().subscribers.clear();
        }
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Connection("in-memory store is unreachable".into()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // No code path panics while holding the lock, so poisoning would be a bug in this file.
        self.state.lock().expect("InMemoryStore mutex guard poison")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        InMemoryStore::new()
    }
}

#[async_trait::async_trait]
impl RegistryStore for InMemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.lock().entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        self.lock().entries.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        self.check_reachable()?;
        let now = Instant::now();
        let mut state = self.lock();
        state.entries.retain(|_, entry| entry.expires_at > now);

        Ok(state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        self.check_reachable()?;
        let mut state = self.lock();
        if let Some(senders) = state.subscribers.get_mut(channel) {
            // Slow subscribers lose messages, same as a real pub/sub fan-out.
            senders.retain(|sender| match sender.try_send(message.to_string()) {
                Ok(_) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check_reachable()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock()
            .subscribers
            .entry(channel.to_string())
            .or_insert_with(Vec::new)
            .push(tx);
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = InMemoryStore::new();
        store.put("fleet:server:a", "1", Duration::from_secs(6)).await.unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("fleet:server:a").await.unwrap(), Some("1".to_string()));

        // Refresh extends the lifetime.
        store.put("fleet:server:a", "2", Duration::from_secs(6)).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.scan("fleet:server:").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("fleet:server:a").await.unwrap(), None);
        assert!(store.scan("fleet:server:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_filters_by_prefix() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.put("fleet:server:a", "a", ttl).await.unwrap();
        store.put("fleet:server:b", "b", ttl).await.unwrap();
        store.put("fleet:transfer:x", "x", ttl).await.unwrap();

        let mut found = store.scan("fleet:server:").await.unwrap();
        found.sort();
        assert_eq!(found, vec![
            ("fleet:server:a".to_string(), "a".to_string()),
            ("fleet:server:b".to_string(), "b".to_string()),
        ]);
    }

    #[tokio::test]
    async fn publish_fans_out_from_now() {
        let store = InMemoryStore::new();
        store.publish("fleet:events", "before").await.unwrap();

        let mut first = store.subscribe("fleet:events").await.unwrap();
        let mut second = store.subscribe("fleet:events").await.unwrap();
        store.publish("fleet:events", "after").await.unwrap();

        assert_eq!(first.recv().await, Some("after".to_string()));
        assert_eq!(second.recv().await, Some("after".to_string()));
    }

    #[tokio::test]
    async fn unreachable_store_fails_calls_and_drops_subscriptions() {
        let store = InMemoryStore::new();
        let mut subscription = store.subscribe("fleet:events").await.unwrap();

        store.set_reachable(false);
        assert!(subscription.recv().await.is_none());
        assert!(matches!(
            store.put("k", "v", Duration::from_secs(1)).await,
            Err(StoreError::Connection(_))
        ));
        assert!(store.subscribe("fleet:events").await.is_err());

        store.set_reachable(true);
        store.put("k", "v", Duration::from_secs(1)).await.unwrap();
    }
}
