use crate::capacity::CapacityTracker;
use crate::config::BridgeOptionsValidated;
use crate::control::{ControlHandle, SessionState};
use crate::events::{BridgeEventListener, EventBus};
use crate::fleet::{FleetSnapshot, FleetViewHandle};
use crate::heartbeat::HeartbeatHandle;
use crate::transfer::{CoordinatorHandle, DrainReport, EvacuationError, GameEngine};
use crate::types::{PlayerId, ServerId, ServerIdentity, ServerStatus};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShutdownReport {
    pub evacuated: usize,
    pub evacuation_failures: usize,
    pub drain: DrainReport,
}

/// FleetBridge is the running bridge as seen by the hosting game server. Call `shutdown()` to leave
/// the fleet cleanly; dropping it leaves the tasks running until the runtime stops.
pub struct FleetBridge {
    pub(crate) logger: slog::Logger,
    pub(crate) identity: ServerIdentity,
    pub(crate) options: BridgeOptionsValidated,
    pub(crate) engine: Arc<dyn GameEngine>,
    pub(crate) capacity: CapacityTracker,
    pub(crate) control: ControlHandle,
    pub(crate) coordinator: CoordinatorHandle,
    pub(crate) fleet: FleetViewHandle,
    pub(crate) heartbeat: HeartbeatHandle,
    pub(crate) local_status: watch::Receiver<ServerStatus>,
    pub(crate) events: EventBus,
    pub(crate) cancel: CancellationToken,
    pub(crate) tasks: Vec<JoinHandle<()>>,
}

impl FleetBridge {
    pub fn server_id(&self) -> &ServerId {
        &self.identity.server_id
    }

    pub fn fleet_snapshot(&self) -> Arc<FleetSnapshot> {
        self.fleet.snapshot()
    }

    pub fn fleet_view(&self) -> FleetViewHandle {
        self.fleet.clone()
    }

    pub fn session_state(&self) -> SessionState {
        self.control.state()
    }

    /// Status this instance currently advertises for itself.
    pub fn local_status(&self) -> ServerStatus {
        *self.local_status.borrow()
    }

    /// Authoritative player count from the engine. Picked up by the next heartbeat.
    pub fn set_player_count(&self, count: u32) {
        self.capacity.set_connected(count);
    }

    pub async fn evacuate(&self, player_id: PlayerId) -> Result<ServerId, EvacuationError> {
        self.coordinator.evacuate(player_id).await
    }

    pub fn events(&self) -> BridgeEventListener {
        self.events.listener()
    }

    /// Leaves the fleet: drain the control session, optionally move players elsewhere, wait for
    /// in-flight transfers up to the grace period, deregister, then delete the registry record.
    pub async fn shutdown(self) -> ShutdownReport {
        slog::info!(self.logger, "Shutting down fleet bridge");
        let mut report = ShutdownReport::default();

        self.control.drain().await;

        if self.options.evacuate_on_shutdown {
            let (evacuated, failures) = self.evacuate_all().await;
            report.evacuated = evacuated;
            report.evacuation_failures = failures;
        }

        report.drain = self.coordinator.begin_drain(self.options.drain_grace_period).await;

        if tokio::time::timeout(self.options.registration_timeout, self.control.close())
            .await
            .is_err()
        {
            slog::warn!(self.logger, "Control channel did not close in time");
        }
        self.heartbeat.stop().await;

        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }

        slog::info!(self.logger, "Fleet bridge stopped: {:?}", report);
        report
    }

    async fn evacuate_all(&self) -> (usize, usize) {
        let players = match tokio::time::timeout(self.options.admission_timeout, self.engine.connected_players()).await {
            Ok(players) => players,
            Err(_) => {
                slog::warn!(self.logger, "Engine did not list connected players in time. Skipping evacuation.");
                return (0, 0);
            }
        };
        if players.is_empty() {
            return (0, 0);
        }
        slog::info!(self.logger, "Evacuating {} players", players.len());

        let attempts = players.into_iter().map(move |player_id| async move {
            let result = self.coordinator.evacuate(player_id.clone()).await;
            (player_id, result)
        });
        let results = match tokio::time::timeout(self.options.drain_grace_period, futures::future::join_all(attempts)).await {
            Ok(results) => results,
            Err(_) => {
                slog::warn!(self.logger, "Evacuation did not finish within the grace period");
                return (0, 0);
            }
        };

        let mut evacuated = 0;
        let mut failures = 0;
        for (player_id, result) in results {
            match result {
                Ok(target) => {
                    slog::debug!(self.logger, "Evacuated {} to {}", player_id, target);
                    evacuated += 1;
                }
                Err(e) => {
                    slog::warn!(self.logger, "Failed to evacuate {}: {}", player_id, e);
                    failures += 1;
                }
            }
        }
        (evacuated, failures)
    }
}
