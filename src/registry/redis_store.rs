use crate::registry::{RegistryStore, StoreError, Subscription};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo};
use tokio::sync::mpsc;
use tokio::time::Duration;

const SCAN_BATCH: usize = 100;
const SUBSCRIPTION_BUFFER: usize = 256;

/// Endpoint and optional credentials of the shared store.
#[derive(Clone, Debug)]
pub struct RedisEndpoint {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct RedisStore {
    logger: slog::Logger,
    client: Client,
    commands: ConnectionManager,
}

impl RedisStore {
    /// Opens the command connection. The manager reconnects on its own after this succeeds, so this
    /// is only called once per process.
    pub async fn connect(logger: slog::Logger, endpoint: &RedisEndpoint) -> Result<Self, StoreError> {
        let mut info = endpoint.url.as_str().into_connection_info()?;
        if endpoint.username.is_some() {
            info.redis.username = endpoint.username.clone();
        }
        if endpoint.password.is_some() {
            info.redis.password = endpoint.password.clone();
        }

        let client = Client::open(info)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        slog::info!(logger, "Connected to registry store at {}", endpoint.url);

        Ok(RedisStore {
            logger,
            client,
            commands,
        })
    }
}

#[async_trait::async_trait]
impl RegistryStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.commands.clone();
        // PX takes at least 1ms.
        let ttl_millis = std::cmp::max(ttl.as_millis() as u64, 1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.commands.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.commands.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.commands.clone();
        let pattern = format!("{}*", prefix);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();

        let mut found = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let values: Vec<Option<String>> = redis::cmd("MGET").arg(chunk).query_async(&mut conn).await?;
            // Keys that expired between SCAN and MGET come back as nil.
            for (key, value) in chunk.iter().zip(values) {
                if let Some(value) = value {
                    found.push((key.clone(), value));
                }
            }
        }

        Ok(found)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.commands.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let logger = self.logger.new(slog::o!("channel" => channel.to_string()));
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        slog::warn!(logger, "Dropping undecodable pub/sub payload: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    // Subscriber went away.
                    return;
                }
            }
            slog::info!(logger, "Pub/sub connection closed");
        });

        Ok(Subscription::new(rx))
    }
}
