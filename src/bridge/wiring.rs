use crate::backoff::BackoffPolicy;
use crate::bridge::FleetBridge;
use crate::capacity::CapacityTracker;
use crate::config::{BridgeConfig, BridgeOptionsValidated};
use crate::control::{spawn_control_channel, ControlOptions, ProxyConnector};
use crate::events::EventBus;
use crate::fleet::spawn_fleet_refresher;
use crate::heartbeat::{spawn_heartbeat, HeartbeatOptions};
use crate::registry::{RegistryClient, RegistryStore};
use crate::transfer::{spawn_coordinator, CoordinatorOptions, GameEngine};
use crate::types::ServerStatus;
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BridgeStartError {
    #[error("Illegal options for configuring the bridge: {0}")]
    IllegalOptions(String),
    #[error("Invalid server identity: {0}")]
    InvalidIdentity(&'static str),
}

/// Wires every component together and spawns their tasks. Must be called from within a tokio
/// runtime. Nothing here talks to the network yet; connections are made lazily by the tasks, which
/// retry on their own.
pub async fn start_bridge(
    config: BridgeConfig,
    root_logger: slog::Logger,
    engine: Arc<dyn GameEngine>,
    store: Arc<dyn RegistryStore>,
    connector: Arc<dyn ProxyConnector>,
) -> Result<FleetBridge, BridgeStartError> {
    let options = BridgeOptionsValidated::try_from(config.options)
        .map_err(|e| BridgeStartError::IllegalOptions(e.to_string()))?;
    let identity = config.identity;
    if identity.server_id.as_str().is_empty() {
        return Err(BridgeStartError::InvalidIdentity("server id is empty"));
    }
    if identity.address.is_empty() {
        return Err(BridgeStartError::InvalidIdentity("advertised address is empty"));
    }

    let cancel = CancellationToken::new();
    let backoff = BackoffPolicy::new(options.backoff_initial, options.backoff_max);
    let events = EventBus::new(EVENT_BUS_CAPACITY);
    let capacity = CapacityTracker::new(identity.max_capacity);

    let registry = RegistryClient::new(
        root_logger.new(slog::o!("component" => "registry")),
        store,
        backoff,
        options.store_op_timeout,
        options.store_max_attempts,
    );

    let (work_tx, work_rx) = mpsc::channel(options.work_queue_capacity);
    let (health_tx, health_rx) = watch::channel(true);
    let control = spawn_control_channel(
        root_logger.new(slog::o!("component" => "control")),
        identity.clone(),
        capacity.clone(),
        ControlOptions {
            heartbeat_interval: options.heartbeat_interval,
            registration_timeout: options.registration_timeout,
            probe_ack_timeout: options.probe_ack_timeout,
            proxy_silence_timeout: options.proxy_silence_timeout,
            backoff,
        },
        connector,
        work_tx,
        events.clone(),
        health_rx.clone(),
        cancel.child_token(),
    );

    let (fleet, fleet_task) = spawn_fleet_refresher(
        root_logger.new(slog::o!("component" => "fleet")),
        registry.clone(),
        options.record_ttl(),
        options.reconciliation_interval,
        cancel.child_token(),
    );

    let (coordinator, coordinator_task) = spawn_coordinator(
        root_logger.new(slog::o!("component" => "transfer")),
        identity.server_id.clone(),
        capacity.clone(),
        CoordinatorOptions {
            admission_timeout: options.admission_timeout,
            dedup_retention: options.dedup_retention,
        },
        engine.clone(),
        control.clone(),
        registry.clone(),
        fleet.clone(),
        health_rx,
        work_rx,
        events.clone(),
        cancel.child_token(),
    );

    let (status_tx, status_rx) = watch::channel(ServerStatus::Starting);
    let heartbeat = spawn_heartbeat(
        root_logger.new(slog::o!("component" => "heartbeat")),
        identity.clone(),
        capacity.clone(),
        registry,
        control.state_listener(),
        status_tx,
        health_tx,
        events.clone(),
        HeartbeatOptions {
            interval: options.heartbeat_interval,
            record_ttl: options.record_ttl(),
            load_change_threshold: options.load_change_threshold,
        },
    );

    slog::info!(
        root_logger,
        "Fleet bridge started";
        "address" => &identity.address,
        "max_capacity" => identity.max_capacity,
        "record_ttl_ms" => options.record_ttl().as_millis() as u64
    );

    Ok(FleetBridge {
        logger: root_logger,
        identity,
        options,
        engine,
        capacity,
        control,
        coordinator,
        fleet,
        heartbeat,
        local_status: status_rx,
        events,
        cancel,
        tasks: vec![fleet_task, coordinator_task],
    })
}
