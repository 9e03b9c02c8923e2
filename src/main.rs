use clap::Parser;
use fleet_bridge::{
    create_root_logger_for_file, create_root_logger_for_stdout, AddressSource, AdmissionDecision, BackoffPolicy,
    BridgeConfig, GameEngine, GrpcConnector, InMemoryStore, PlayerId, RedisStore, RegistryStore,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

const PROXY_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the bridge on its own, without a game server attached. Every routed player is admitted.
#[derive(Debug, Parser)]
#[command(name = "fleet-bridge")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep the registry in process instead of connecting to Redis.
    #[arg(long)]
    memory_store: bool,
    /// Log to this file instead of the terminal.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match BridgeConfig::from_sources(cli.config.as_deref(), |name| std::env::var(name).ok()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fleet-bridge: {}", e);
            std::process::exit(2);
        }
    };

    let server_id = config.identity.server_id.to_string();
    let logger = match &cli.log_file {
        Some(path) => match create_root_logger_for_file(path, server_id, config.log_level) {
            Ok(logger) => logger,
            Err(e) => {
                eprintln!("fleet-bridge: cannot open log file {:?}: {}", path, e);
                std::process::exit(2);
            }
        },
        None => create_root_logger_for_stdout(server_id, config.log_level),
    };

    if config.address_source == AddressSource::Loopback {
        slog::warn!(
            logger,
            "No advertise address or POD_IP configured. Advertising {}, which other hosts cannot reach.",
            config.identity.address
        );
    }

    let store: Arc<dyn RegistryStore> = if cli.memory_store {
        slog::info!(logger, "Using in-process registry store");
        Arc::new(InMemoryStore::new())
    } else {
        match connect_redis(&logger, &config).await {
            Some(store) => Arc::new(store),
            None => return,
        }
    };

    let connector = Arc::new(GrpcConnector::new(
        logger.new(slog::o!("component" => "grpc")),
        config.proxy_endpoint.clone(),
        PROXY_CONNECT_TIMEOUT,
    ));
    let engine = Arc::new(StandaloneEngine::default());

    let bridge = match fleet_bridge::start_bridge(config, logger.clone(), engine, store, connector).await {
        Ok(bridge) => bridge,
        Err(e) => {
            slog::crit!(logger, "Failed to start fleet bridge: {}", e);
            return;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        slog::error!(logger, "Failed to listen for shutdown signal: {}", e);
    }
    let report = bridge.shutdown().await;
    slog::info!(
        logger,
        "Shutdown complete";
        "evacuated" => report.evacuated,
        "drained" => report.drain.completed,
        "forced" => report.drain.forced
    );
}

// Keeps trying until Redis answers or the process is interrupted. `None` means interrupted.
async fn connect_redis(logger: &slog::Logger, config: &BridgeConfig) -> Option<RedisStore> {
    let backoff = BackoffPolicy::default();
    let mut attempt = 0;
    loop {
        match RedisStore::connect(logger.new(slog::o!("component" => "redis")), &config.registry).await {
            Ok(store) => return Some(store),
            Err(e) => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                slog::warn!(logger, "Registry store unreachable: {}. Retrying in {:?}", e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tokio::signal::ctrl_c() => return None,
                }
            }
        }
    }
}

#[derive(Default)]
struct StandaloneEngine {
    players: Mutex<HashSet<PlayerId>>,
}

#[async_trait::async_trait]
impl GameEngine for StandaloneEngine {
    async fn evaluate_admission(&self, player_id: &PlayerId) -> AdmissionDecision {
        if let Ok(mut players) = self.players.lock() {
            players.insert(player_id.clone());
        }
        AdmissionDecision::Accept
    }

    async fn notify_released(&self, player_id: &PlayerId) {
        if let Ok(mut players) = self.players.lock() {
            players.remove(player_id);
        }
    }

    async fn connected_players(&self) -> Vec<PlayerId> {
        match self.players.lock() {
            Ok(players) => players.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}
