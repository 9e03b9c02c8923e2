use crate::backoff::BackoffPolicy;
use crate::registry::{RegistryStore, StoreError, Subscription};
use crate::types::{FleetEvent, RequestId, ServerId, ServerRecord};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;

pub const SERVER_KEY_PREFIX: &str = "fleet:server:";
pub const TRANSFER_KEY_PREFIX: &str = "fleet:transfer:";
pub const EVENTS_CHANNEL: &str = "fleet:events";

pub fn server_key(server_id: &ServerId) -> String {
    format!("{}{}", SERVER_KEY_PREFIX, server_id)
}

pub fn transfer_key(request_id: &RequestId) -> String {
    format!("{}{}", TRANSFER_KEY_PREFIX, request_id)
}

/// RegistryClient gives the rest of the bridge typed access to the registry. Every call is bounded
/// by a per-attempt timeout and retried with the shared backoff policy; once attempts are exhausted
/// the caller gets `StoreError::Unavailable` and is expected to try again on its own schedule.
#[derive(Clone)]
pub struct RegistryClient {
    logger: slog::Logger,
    store: Arc<dyn RegistryStore>,
    backoff: BackoffPolicy,
    op_timeout: Duration,
    max_attempts: u32,
}

impl RegistryClient {
    pub fn new(
        logger: slog::Logger,
        store: Arc<dyn RegistryStore>,
        backoff: BackoffPolicy,
        op_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        RegistryClient {
            logger,
            store,
            backoff,
            op_timeout,
            max_attempts: std::cmp::max(max_attempts, 1),
        }
    }

    pub async fn put_record(&self, record: &ServerRecord, ttl: Duration) -> Result<(), StoreError> {
        let key = server_key(&record.server_id);
        let value = encode(&key, record)?;
        self.with_retries("put_record", || self.store.put(&key, &value, ttl))
            .await
    }

    pub async fn get_record(&self, server_id: &ServerId) -> Result<Option<ServerRecord>, StoreError> {
        let key = server_key(server_id);
        let value = self.with_retries("get_record", || self.store.get(&key)).await?;
        match value {
            Some(value) => decode(&key, &value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete_record(&self, server_id: &ServerId) -> Result<(), StoreError> {
        let key = server_key(server_id);
        self.with_retries("delete_record", || self.store.delete(&key)).await
    }

    /// Full snapshot of every unexpired server record. Undecodable entries are logged and skipped.
    pub async fn scan_records(&self) -> Result<Vec<ServerRecord>, StoreError> {
        let entries = self
            .with_retries("scan_records", || self.store.scan(SERVER_KEY_PREFIX))
            .await?;

        let mut records = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match decode::<ServerRecord>(&key, &value) {
                Ok(record) => records.push(record),
                Err(e) => slog::warn!(self.logger, "Skipping registry entry: {}", e),
            }
        }
        Ok(records)
    }

    pub async fn publish_event(&self, event: &FleetEvent) -> Result<(), StoreError> {
        let message = encode(EVENTS_CHANNEL, event)?;
        self.with_retries("publish_event", || self.store.publish(EVENTS_CHANNEL, &message))
            .await
    }

    pub async fn put_transfer_audit<T: Serialize + Sync>(
        &self,
        request_id: &RequestId,
        audit: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let key = transfer_key(request_id);
        let value = encode(&key, audit)?;
        self.with_retries("put_transfer_audit", || self.store.put(&key, &value, ttl))
            .await
    }

    /// Lazily-connected, self-restarting subscription to `fleet:events`.
    pub fn subscribe_events(&self) -> EventSubscription {
        EventSubscription {
            logger: self.logger.new(slog::o!("channel" => EVENTS_CHANNEL)),
            client: self.clone(),
            channel: EVENTS_CHANNEL,
            current: None,
            attempt: 0,
            connected_before: false,
        }
    }

    async fn with_retries<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            let error = match tokio::time::timeout(self.op_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(self.op_timeout),
            };

            attempt += 1;
            if attempt >= self.max_attempts {
                slog::debug!(self.logger, "Registry {} gave up after {} attempts: {}", operation, attempt, error);
                return Err(StoreError::Unavailable {
                    attempts: attempt,
                    last_error: error.to_string(),
                });
            }

            let delay = self.backoff.delay(attempt - 1);
            slog::debug!(
                self.logger,
                "Registry {} attempt {} failed: {}. Retrying in {:?}",
                operation,
                attempt,
                error,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Malformed {
        key: key.to_string(),
        source,
    })
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|source| StoreError::Malformed {
        key: key.to_string(),
        source,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    Message(String),
    /// The subscription was re-established after a loss. Anything published in between is gone.
    Resumed,
}

/// EventSubscription never ends and never returns an error. It connects on the first call to
/// `next()` and reconnects with backoff whenever the connection drops.
pub struct EventSubscription {
    logger: slog::Logger,
    client: RegistryClient,
    channel: &'static str,
    current: Option<Subscription>,
    attempt: u32,
    connected_before: bool,
}

impl EventSubscription {
    pub async fn next(&mut self) -> SubscriptionEvent {
        loop {
            if let Some(subscription) = self.current.as_mut() {
                match subscription.recv().await {
                    Some(message) => return SubscriptionEvent::Message(message),
                    None => {
                        slog::warn!(self.logger, "Subscription lost. Reconnecting.");
                        self.current = None;
                        continue;
                    }
                }
            }

            let subscribe = self.client.store.subscribe(self.channel);
            let error = match tokio::time::timeout(self.client.op_timeout, subscribe).await {
                Ok(Ok(subscription)) => {
                    self.current = Some(subscription);
                    self.attempt = 0;
                    if self.connected_before {
                        slog::info!(self.logger, "Subscription resumed");
                        return SubscriptionEvent::Resumed;
                    }
                    self.connected_before = true;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(_) => StoreError::Timeout(self.client.op_timeout),
            };

            let delay = self.client.backoff.delay(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            slog::warn!(self.logger, "Subscribe failed: {}. Retrying in {:?}", error, delay);
            tokio::time::sleep(delay).await;
        }
    }
}
