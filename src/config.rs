use crate::registry::RedisEndpoint;
use crate::types::{ServerId, ServerIdentity};
use serde::Deserialize;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::time::Duration;

const DEFAULT_SERVER_PORT: u16 = 25565;
const DEFAULT_MAX_CAPACITY: u32 = 100;
const DEFAULT_VERSION: &str = "unknown";
const DEFAULT_PROXY_ENDPOINT: &str = "http://127.0.0.1:50051";
const DEFAULT_REGISTRY_URL: &str = "redis://127.0.0.1:6379";
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables. Anything left as `None` takes its default during validation.
#[derive(Clone, Debug, Default)]
pub struct BridgeOptions {
    pub heartbeat_interval: Option<Duration>,
    pub ttl_multiplier: Option<u32>,
    pub admission_timeout: Option<Duration>,
    pub drain_grace_period: Option<Duration>,
    pub reconciliation_interval: Option<Duration>,
    pub load_change_threshold: Option<f64>,
    pub registration_timeout: Option<Duration>,
    pub probe_ack_timeout: Option<Duration>,
    pub proxy_silence_timeout: Option<Duration>,
    pub dedup_retention: Option<Duration>,
    pub store_op_timeout: Option<Duration>,
    pub store_max_attempts: Option<u32>,
    pub backoff_initial: Option<Duration>,
    pub backoff_max: Option<Duration>,
    pub work_queue_capacity: Option<usize>,
    pub evacuate_on_shutdown: Option<bool>,
}

#[derive(Clone, Debug)]
pub(crate) struct BridgeOptionsValidated {
    pub heartbeat_interval: Duration,
    pub ttl_multiplier: u32,
    pub admission_timeout: Duration,
    pub drain_grace_period: Duration,
    pub reconciliation_interval: Duration,
    pub load_change_threshold: f64,
    pub registration_timeout: Duration,
    pub probe_ack_timeout: Duration,
    pub proxy_silence_timeout: Option<Duration>,
    pub dedup_retention: Duration,
    pub store_op_timeout: Duration,
    pub store_max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub work_queue_capacity: usize,
    pub evacuate_on_shutdown: bool,
}

impl BridgeOptionsValidated {
    /// Lifetime of the ServerRecord written on each heartbeat.
    pub fn record_ttl(&self) -> Duration {
        // Validation bounds the product, so the fallback only covers hand-built options.
        self.heartbeat_interval
            .checked_mul(self.ttl_multiplier)
            .unwrap_or(MAX_DURATION)
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval == Duration::from_millis(0) {
            return Err("Heartbeat interval must be positive");
        }
        if self.ttl_multiplier < 2 {
            return Err("TTL multiplier must be at least 2");
        }
        let record_ttl = self
            .heartbeat_interval
            .checked_mul(self.ttl_multiplier)
            .ok_or("Heartbeat TTL overflows")?;
        let longest = [
            Some(record_ttl),
            Some(self.admission_timeout),
            Some(self.drain_grace_period),
            Some(self.reconciliation_interval),
            Some(self.registration_timeout),
            Some(self.probe_ack_timeout),
            self.proxy_silence_timeout,
            Some(self.dedup_retention),
            Some(self.store_op_timeout),
            Some(self.backoff_max),
        ];
        if longest.iter().flatten().any(|d| *d > MAX_DURATION) {
            return Err("Durations, including the record TTL, must not exceed 24 hours");
        }
        if self.admission_timeout == Duration::from_millis(0) {
            return Err("Admission timeout must be positive");
        }
        if self.reconciliation_interval == Duration::from_millis(0) {
            return Err("Reconciliation interval must be positive");
        }
        if !(self.load_change_threshold > 0.0 && self.load_change_threshold <= 1.0) {
            return Err("Load change threshold must be in (0, 1]");
        }
        if self.probe_ack_timeout >= record_ttl {
            return Err("Health probe ack timeout must be less than the record TTL");
        }
        if self.store_max_attempts == 0 {
            return Err("Store max attempts must be at least 1");
        }
        if self.backoff_max < self.backoff_initial {
            return Err("Maximum backoff must not be less than the initial backoff");
        }
        if self.work_queue_capacity == 0 {
            return Err("Work queue capacity must be at least 1");
        }

        Ok(())
    }
}

impl TryFrom<BridgeOptions> for BridgeOptionsValidated {
    type Error = &'static str;

    fn try_from(options: BridgeOptions) -> Result<Self, Self::Error> {
        let heartbeat_interval = options.heartbeat_interval.unwrap_or(Duration::from_secs(2));
        let ttl_multiplier = options.ttl_multiplier.unwrap_or(3);
        let record_ttl = heartbeat_interval
            .checked_mul(ttl_multiplier)
            .ok_or("Heartbeat TTL overflows")?;
        let values = BridgeOptionsValidated {
            heartbeat_interval,
            ttl_multiplier,
            admission_timeout: options.admission_timeout.unwrap_or(Duration::from_secs(5)),
            drain_grace_period: options.drain_grace_period.unwrap_or(Duration::from_secs(10)),
            reconciliation_interval: options
                .reconciliation_interval
                .unwrap_or(record_ttl),
            load_change_threshold: options.load_change_threshold.unwrap_or(0.1),
            registration_timeout: options.registration_timeout.unwrap_or(Duration::from_secs(5)),
            probe_ack_timeout: options.probe_ack_timeout.unwrap_or(Duration::from_secs(1)),
            proxy_silence_timeout: options.proxy_silence_timeout,
            dedup_retention: options.dedup_retention.unwrap_or(Duration::from_secs(60)),
            store_op_timeout: options.store_op_timeout.unwrap_or(Duration::from_secs(1)),
            store_max_attempts: options.store_max_attempts.unwrap_or(3),
            backoff_initial: options.backoff_initial.unwrap_or(Duration::from_millis(200)),
            backoff_max: options.backoff_max.unwrap_or(Duration::from_secs(10)),
            work_queue_capacity: options.work_queue_capacity.unwrap_or(256),
            evacuate_on_shutdown: options.evacuate_on_shutdown.unwrap_or(false),
        };

        values.validate()?;
        Ok(values)
    }
}

/// Where the advertised address came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressSource {
    Explicit,
    PodIp,
    /// Nothing was configured; other hosts will not be able to reach this address.
    Loopback,
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub identity: ServerIdentity,
    pub address_source: AddressSource,
    pub proxy_endpoint: String,
    pub registry: RedisEndpoint,
    pub log_level: slog::Level,
    pub options: BridgeOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse config file {path:?}: {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("Invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// On-disk shape of the optional TOML config file. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    server_id: Option<String>,
    server_port: Option<u16>,
    advertise_address: Option<String>,
    max_capacity: Option<u32>,
    server_version: Option<String>,
    proxy_endpoint: Option<String>,
    registry_url: Option<String>,
    registry_username: Option<String>,
    registry_password: Option<String>,
    log_level: Option<String>,
    heartbeat_interval_ms: Option<u64>,
    ttl_multiplier: Option<u32>,
    admission_timeout_ms: Option<u64>,
    drain_grace_ms: Option<u64>,
    reconciliation_interval_ms: Option<u64>,
    load_change_threshold: Option<f64>,
    registration_timeout_ms: Option<u64>,
    probe_ack_timeout_ms: Option<u64>,
    proxy_silence_timeout_ms: Option<u64>,
    dedup_retention_ms: Option<u64>,
    store_op_timeout_ms: Option<u64>,
    store_max_attempts: Option<u32>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    work_queue_capacity: Option<usize>,
    evacuate_on_shutdown: Option<bool>,
}

impl BridgeConfig {
    /// Reads the optional config file, then overlays environment variables looked up through `env`.
    pub fn from_sources<F>(file: Option<&Path>, env: F) -> Result<BridgeConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut file_values = match file {
            Some(path) => read_file(path)?,
            None => ConfigFile::default(),
        };
        let lookup = |name: &str| env(name).filter(|value| !value.trim().is_empty());

        let server_id = lookup("FLEET_SERVER_ID")
            .or_else(|| file_values.server_id.take())
            .unwrap_or_else(|| format!("server-{}", uuid::Uuid::new_v4()));

        let port = match lookup("FLEET_SERVER_PORT") {
            Some(value) => parse_port(&value)?,
            None => match file_values.server_port {
                Some(0) => return Err(invalid("server_port", "0", "must be in 1-65535")),
                Some(port) => port,
                None => DEFAULT_SERVER_PORT,
            },
        };

        let (address, address_source) = match lookup("FLEET_ADVERTISE_ADDRESS").or_else(|| file_values.advertise_address.take()) {
            Some(address) => (address, AddressSource::Explicit),
            None => match lookup("POD_IP") {
                Some(ip) => (format!("{}:{}", ip, port), AddressSource::PodIp),
                None => (format!("127.0.0.1:{}", port), AddressSource::Loopback),
            },
        };

        let max_capacity = overlay(lookup("FLEET_MAX_CAPACITY"), file_values.max_capacity, "FLEET_MAX_CAPACITY")?
            .unwrap_or(DEFAULT_MAX_CAPACITY);
        let version = lookup("FLEET_SERVER_VERSION")
            .or_else(|| file_values.server_version.take())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());

        let proxy_endpoint = lookup("FLEET_PROXY_ENDPOINT")
            .or_else(|| file_values.proxy_endpoint.take())
            .unwrap_or_else(|| DEFAULT_PROXY_ENDPOINT.to_string());
        let registry = RedisEndpoint {
            url: lookup("FLEET_REGISTRY_URL")
                .or_else(|| file_values.registry_url.take())
                .unwrap_or_else(|| DEFAULT_REGISTRY_URL.to_string()),
            username: lookup("FLEET_REGISTRY_USERNAME").or_else(|| file_values.registry_username.take()),
            password: lookup("FLEET_REGISTRY_PASSWORD").or_else(|| file_values.registry_password.take()),
        };

        let log_level = match lookup("FLEET_LOG_LEVEL").or_else(|| file_values.log_level.take()) {
            Some(level) => crate::logging::parse_level(&level)
                .ok_or_else(|| invalid("FLEET_LOG_LEVEL", &level, "unknown log level"))?,
            None => slog::Level::Info,
        };

        let options = BridgeOptions {
            heartbeat_interval: millis(overlay(
                lookup("FLEET_HEARTBEAT_INTERVAL_MS"),
                file_values.heartbeat_interval_ms,
                "FLEET_HEARTBEAT_INTERVAL_MS",
            )?),
            ttl_multiplier: overlay(lookup("FLEET_TTL_MULTIPLIER"), file_values.ttl_multiplier, "FLEET_TTL_MULTIPLIER")?,
            admission_timeout: millis(overlay(
                lookup("FLEET_ADMISSION_TIMEOUT_MS"),
                file_values.admission_timeout_ms,
                "FLEET_ADMISSION_TIMEOUT_MS",
            )?),
            drain_grace_period: millis(overlay(
                lookup("FLEET_DRAIN_GRACE_MS"),
                file_values.drain_grace_ms,
                "FLEET_DRAIN_GRACE_MS",
            )?),
            reconciliation_interval: millis(file_values.reconciliation_interval_ms),
            load_change_threshold: file_values.load_change_threshold,
            registration_timeout: millis(file_values.registration_timeout_ms),
            probe_ack_timeout: millis(file_values.probe_ack_timeout_ms),
            proxy_silence_timeout: millis(file_values.proxy_silence_timeout_ms),
            dedup_retention: millis(file_values.dedup_retention_ms),
            store_op_timeout: millis(file_values.store_op_timeout_ms),
            store_max_attempts: file_values.store_max_attempts,
            backoff_initial: millis(file_values.backoff_initial_ms),
            backoff_max: millis(file_values.backoff_max_ms),
            work_queue_capacity: file_values.work_queue_capacity,
            evacuate_on_shutdown: file_values.evacuate_on_shutdown,
        };

        Ok(BridgeConfig {
            identity: ServerIdentity {
                server_id: ServerId::new(server_id),
                address,
                max_capacity,
                version,
            },
            address_source,
            proxy_endpoint,
            registry,
            log_level,
            options,
        })
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid("FLEET_SERVER_PORT", value, "must be in 1-65535")),
        Ok(port) => Ok(port),
    }
}

// Environment wins over the file.
fn overlay<T: FromStr>(env_value: Option<String>, file_value: Option<T>, name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_value {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid(name, &value, "not a valid number")),
        None => Ok(file_value),
    }
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}

fn invalid(name: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_any_source() {
        let config = BridgeConfig::from_sources(None, env_of(&[])).unwrap();

        assert!(config.identity.server_id.as_str().starts_with("server-"));
        assert_eq!(config.identity.address, "127.0.0.1:25565");
        assert_eq!(config.address_source, AddressSource::Loopback);
        assert_eq!(config.identity.max_capacity, 100);
        assert_eq!(config.log_level, slog::Level::Info);

        let options = BridgeOptionsValidated::try_from(config.options).unwrap();
        assert_eq!(options.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(options.record_ttl(), Duration::from_secs(6));
        assert_eq!(options.reconciliation_interval, Duration::from_secs(6));
        assert_eq!(options.admission_timeout, Duration::from_secs(5));
        assert_eq!(options.drain_grace_period, Duration::from_secs(10));
        assert!(options.proxy_silence_timeout.is_none());
    }

    #[test]
    fn pod_ip_builds_advertised_address() {
        let config = BridgeConfig::from_sources(
            None,
            env_of(&[("POD_IP", "10.1.2.3"), ("FLEET_SERVER_PORT", "25570"), ("FLEET_SERVER_ID", "lobby-1")]),
        )
        .unwrap();

        assert_eq!(config.identity.server_id, ServerId::new("lobby-1"));
        assert_eq!(config.identity.address, "10.1.2.3:25570");
        assert_eq!(config.address_source, AddressSource::PodIp);
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            server_id = "from-file"
            advertise_address = "game.internal:25565"
            heartbeat_interval_ms = 500
            ttl_multiplier = 4
            registry_url = "redis://registry:6379"
            proxy_silence_timeout_ms = 3000
            "#
        )
        .unwrap();

        let config = BridgeConfig::from_sources(
            Some(file.path()),
            env_of(&[("FLEET_SERVER_ID", "from-env"), ("FLEET_TTL_MULTIPLIER", "5")]),
        )
        .unwrap();

        assert_eq!(config.identity.server_id, ServerId::new("from-env"));
        assert_eq!(config.identity.address, "game.internal:25565");
        assert_eq!(config.address_source, AddressSource::Explicit);
        assert_eq!(config.registry.url, "redis://registry:6379");

        let options = BridgeOptionsValidated::try_from(config.options).unwrap();
        assert_eq!(options.record_ttl(), Duration::from_millis(2500));
        assert_eq!(options.proxy_silence_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            BridgeConfig::from_sources(None, env_of(&[("FLEET_SERVER_PORT", "0")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_sources(None, env_of(&[("FLEET_SERVER_PORT", "70000")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_sources(None, env_of(&[("FLEET_HEARTBEAT_INTERVAL_MS", "soon")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            BridgeConfig::from_sources(None, env_of(&[("FLEET_LOG_LEVEL", "loud")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_unknown_file_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "heartbeat_seconds = 2").unwrap();

        assert!(matches!(
            BridgeConfig::from_sources(Some(file.path()), env_of(&[])),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn option_validation() {
        let options = BridgeOptions {
            ttl_multiplier: Some(1),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());

        let options = BridgeOptions {
            heartbeat_interval: Some(Duration::from_millis(100)),
            probe_ack_timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());

        let options = BridgeOptions {
            load_change_threshold: Some(0.0),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());

        let options = BridgeOptions {
            admission_timeout: Some(Duration::from_secs(2 * 24 * 60 * 60)),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());

        let options = BridgeOptions {
            backoff_initial: Some(Duration::from_secs(5)),
            backoff_max: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn oversized_heartbeat_ttl_is_rejected() {
        let config = BridgeConfig::from_sources(
            None,
            env_of(&[
                ("FLEET_HEARTBEAT_INTERVAL_MS", &u64::MAX.to_string()),
                ("FLEET_TTL_MULTIPLIER", &u32::MAX.to_string()),
            ]),
        )
        .unwrap();
        assert_eq!(
            BridgeOptionsValidated::try_from(config.options).err(),
            Some("Heartbeat TTL overflows")
        );

        let options = BridgeOptions {
            heartbeat_interval: Some(Duration::from_secs(60 * 60)),
            ttl_multiplier: Some(100),
            ..Default::default()
        };
        assert!(BridgeOptionsValidated::try_from(options).is_err());
    }
}
