use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// ServerId is the stable, fleet-unique identity of one backend instance.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        PlayerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RequestId is the idempotency key of a transfer. The proxy retries with the same id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    /// Ids for transfers originated by this instance.
    pub fn generate(origin: &ServerId) -> Self {
        RequestId(format!("{}-{}", origin, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Starting,
    Live,
    Draining,
    Dead,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Starting => "starting",
            ServerStatus::Live => "live",
            ServerStatus::Draining => "draining",
            ServerStatus::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(ServerStatus::Starting),
            "live" => Some(ServerStatus::Live),
            "draining" => Some(ServerStatus::Draining),
            "dead" => Some(ServerStatus::Dead),
            _ => None,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of this instance, as advertised to the proxy and the fleet.
#[derive(Clone, Debug)]
pub struct ServerIdentity {
    pub server_id: ServerId,
    pub address: String,
    pub max_capacity: u32,
    pub version: String,
}

/// ServerRecord is the liveness/capacity snapshot an instance writes under
/// `fleet:server:{serverId}`. Only the owning instance writes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub server_id: ServerId,
    pub address: String,
    pub current_player_count: u32,
    pub max_capacity: u32,
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: ServerStatus,
    /// TTL the owner wrote this record with. Observers use it to infer staleness.
    #[serde(default)]
    pub ttl_ms: u64,
}

impl ServerRecord {
    /// Ratio of connected players to capacity. A server without capacity counts as full.
    pub fn load(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.current_player_count as f64 / self.max_capacity as f64
    }

    pub fn has_room(&self) -> bool {
        self.current_player_count < self.max_capacity
    }

    pub fn ttl_or(&self, fallback: Duration) -> Duration {
        if self.ttl_ms == 0 {
            fallback
        } else {
            Duration::from_millis(self.ttl_ms)
        }
    }

    /// A record is stale once its heartbeat is older than its TTL.
    pub fn is_stale(&self, now: DateTime<Utc>, fallback_ttl: Duration) -> bool {
        let ttl = self.ttl_or(fallback_ttl);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.last_heartbeat_at + ttl < now,
            Err(_) => false,
        }
    }
}

/// Change notification carried on the `fleet:events` channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetEvent {
    pub server_id: ServerId,
    pub status: ServerStatus,
    pub timestamp: DateTime<Utc>,
}
