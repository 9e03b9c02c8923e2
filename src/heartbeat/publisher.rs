use crate::capacity::CapacityTracker;
use crate::control::{SessionState, SessionStateListener};
use crate::events::{BridgeEvent, EventBus};
use crate::heartbeat::status::derive_status;
use crate::registry::RegistryClient;
use crate::types::{FleetEvent, ServerIdentity, ServerRecord, ServerStatus};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct HeartbeatOptions {
    pub interval: Duration,
    pub record_ttl: Duration,
    pub load_change_threshold: f64,
}

/// Owns the heartbeat task. Stopping it removes this instance's record from the registry.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops heartbeating, deletes the record and announces Dead. Returns once that is done.
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

pub(crate) fn spawn_heartbeat(
    logger: slog::Logger,
    identity: ServerIdentity,
    capacity: CapacityTracker,
    registry: RegistryClient,
    session: SessionStateListener,
    local_status: watch::Sender<ServerStatus>,
    registry_health: watch::Sender<bool>,
    events: EventBus,
    options: HeartbeatOptions,
) -> HeartbeatHandle {
    let stop = CancellationToken::new();
    let publisher = HeartbeatPublisher {
        logger,
        identity,
        capacity,
        registry,
        session,
        local_status,
        registry_health,
        events,
        options,
        stop: stop.clone(),
        started_at: Instant::now(),
        last_success: None,
        ever_registered: false,
        unavailable_reported: false,
        last_announced: None,
        retired: false,
    };
    let task = tokio::spawn(publisher.run());

    HeartbeatHandle { stop, task }
}

struct HeartbeatPublisher {
    logger: slog::Logger,
    identity: ServerIdentity,
    capacity: CapacityTracker,
    registry: RegistryClient,
    session: SessionStateListener,
    local_status: watch::Sender<ServerStatus>,
    // False while heartbeat writes have been failing for longer than the record TTL.
    registry_health: watch::Sender<bool>,
    events: EventBus,
    options: HeartbeatOptions,
    stop: CancellationToken,

    started_at: Instant,
    last_success: Option<Instant>,
    ever_registered: bool,
    unavailable_reported: bool,
    // Status and load of the last fleet:events notification.
    last_announced: Option<(ServerStatus, f64)>,
    retired: bool,
}

impl HeartbeatPublisher {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.options.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session_open = true;
        let stop = self.stop.clone();

        while !self.retired {
            tokio::select! {
                _ = tick.tick() => self.beat().await,
                state = self.session.next(), if session_open => match state {
                    // Session changes are published right away rather than on the next tick.
                    Some(_) => self.beat().await,
                    None => session_open = false,
                },
                _ = stop.cancelled() => break,
            }
        }

        if !self.retired {
            self.retire().await;
        }
    }

    async fn beat(&mut self) {
        let session = self.session.current();
        if session == SessionState::Registered {
            self.ever_registered = true;
        }

        // A record that made it into the registry proves the registry is reachable.
        let record_status = derive_status(session, self.ever_registered, true);
        if record_status == ServerStatus::Dead {
            self.retire().await;
            return;
        }

        let snapshot = self.capacity.snapshot();
        let record = ServerRecord {
            server_id: self.identity.server_id.clone(),
            address: self.identity.address.clone(),
            current_player_count: snapshot.connected,
            max_capacity: self.identity.max_capacity,
            last_heartbeat_at: Utc::now(),
            status: record_status,
            ttl_ms: self.options.record_ttl.as_millis() as u64,
        };

        match self.registry.put_record(&record, self.options.record_ttl).await {
            Ok(_) => {
                self.last_success = Some(Instant::now());
                if self.unavailable_reported {
                    self.unavailable_reported = false;
                    slog::info!(self.logger, "Registry writes recovered");
                    self.registry_health.send_replace(true);
                    self.events.publish(BridgeEvent::RegistryRecovered);
                }
                self.set_local_status(record_status);
                self.announce_if_significant(record_status, record.load()).await;
            }
            Err(e) => {
                slog::warn!(self.logger, "Heartbeat write failed: {}", e);
                let since = self.last_success.unwrap_or(self.started_at);
                let healthy = since.elapsed() <= self.options.record_ttl;
                if !healthy && !self.unavailable_reported {
                    self.unavailable_reported = true;
                    slog::error!(
                        self.logger,
                        "Registry unwritable for longer than the record TTL ({:?})",
                        self.options.record_ttl
                    );
                    self.registry_health.send_replace(false);
                    self.events.publish(BridgeEvent::RegistryUnavailable);
                }
                self.set_local_status(derive_status(session, self.ever_registered, healthy));
            }
        }
    }

    async fn announce_if_significant(&mut self, status: ServerStatus, load: f64) {
        let significant = match self.last_announced {
            None => true,
            Some((last_status, last_load)) => {
                last_status != status || (load - last_load).abs() >= self.options.load_change_threshold
            }
        };
        if !significant {
            return;
        }

        let event = FleetEvent {
            server_id: self.identity.server_id.clone(),
            status,
            timestamp: Utc::now(),
        };
        match self.registry.publish_event(&event).await {
            Ok(_) => self.last_announced = Some((status, load)),
            // Observers reconcile from snapshots; the next beat tries again.
            Err(e) => slog::warn!(self.logger, "Failed to publish fleet event: {}", e),
        }
    }

    async fn retire(&mut self) {
        self.retired = true;
        if let Err(e) = self.registry.delete_record(&self.identity.server_id).await {
            slog::warn!(self.logger, "Failed to delete server record, it will expire on its own: {}", e);
        }
        let event = FleetEvent {
            server_id: self.identity.server_id.clone(),
            status: ServerStatus::Dead,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.registry.publish_event(&event).await {
            slog::warn!(self.logger, "Failed to announce shutdown: {}", e);
        }
        self.set_local_status(ServerStatus::Dead);
        slog::info!(self.logger, "Heartbeat stopped");
    }

    fn set_local_status(&self, status: ServerStatus) {
        let previous = self.local_status.send_replace(status);
        if previous != status {
            slog::info!(self.logger, "Local status {} -> {}", previous, status);
            self.events.publish(BridgeEvent::LocalStatusChanged(status));
        }
    }
}
