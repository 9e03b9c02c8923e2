use tokio::sync::mpsc;
use tokio::time::Duration;

/// RegistryStore is the raw shared key-value/pub-sub backend that all instances of the fleet talk
/// to. Implementations do a single attempt per call; retries and timeouts live in
/// `RegistryClient`.
#[async_trait::async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// put() writes `value` under `key`. The key expires after `ttl` unless written again.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// scan() returns every live `(key, value)` whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// subscribe() opens a persistent subscription. Delivery starts from "now"; there is no replay.
    /// The returned subscription ends (yields `None`) when the underlying connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;
}

/// Subscription is a single connection's worth of pub/sub messages.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<String>) -> Self {
        Subscription { receiver }
    }

    /// `None` means the connection dropped. Callers resubscribe and reconcile.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("registry store unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("registry store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("registry store connection failure: {0}")]
    Connection(String),

    #[error("registry store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("malformed registry value under '{key}': {source}")]
    Malformed { key: String, source: serde_json::Error },
}

impl StoreError {
    /// Transient errors are retried with backoff. Nothing here is ever fatal to the process.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Malformed { .. })
    }
}
