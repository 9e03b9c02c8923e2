use crate::fleet::{FleetSnapshot, FleetView};
use crate::registry::{RegistryClient, SubscriptionEvent, EVENTS_CHANNEL};
use crate::types::{FleetEvent, ServerStatus};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Read side of the fleet view. Cheap to clone; every clone sees the latest snapshot.
#[derive(Clone)]
pub struct FleetViewHandle {
    receiver: watch::Receiver<Arc<FleetSnapshot>>,
}

impl FleetViewHandle {
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next published snapshot. Returns `None` once the refresher has stopped.
    pub async fn changed(&mut self) -> Option<Arc<FleetSnapshot>> {
        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow().clone()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
impl FleetViewHandle {
    pub(crate) fn fixed(snapshot: FleetSnapshot) -> Self {
        let (_, receiver) = watch::channel(Arc::new(snapshot));
        FleetViewHandle { receiver }
    }
}

pub(crate) fn spawn_fleet_refresher(
    logger: slog::Logger,
    registry: RegistryClient,
    fallback_ttl: Duration,
    reconciliation_interval: Duration,
    cancel: CancellationToken,
) -> (FleetViewHandle, JoinHandle<()>) {
    let (publisher, receiver) = watch::channel(Arc::new(FleetSnapshot::default()));
    let refresher = FleetRefresher {
        view: FleetView::new(logger.clone(), fallback_ttl),
        logger,
        registry,
        publisher,
        reconciliation_interval,
    };
    let task = tokio::spawn(refresher.run(cancel));
    (FleetViewHandle { receiver }, task)
}

struct FleetRefresher {
    logger: slog::Logger,
    registry: RegistryClient,
    view: FleetView,
    publisher: watch::Sender<Arc<FleetSnapshot>>,
    reconciliation_interval: Duration,
}

impl FleetRefresher {
    async fn run(mut self, cancel: CancellationToken) {
        let mut subscription = self.registry.subscribe_events();
        let mut tick = tokio::time::interval(self.reconciliation_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile().await,
                event = subscription.next() => match event {
                    SubscriptionEvent::Message(message) => self.handle_message(&message).await,
                    // Anything published while we were away is lost. Catch up from a full read.
                    SubscriptionEvent::Resumed => self.reconcile().await,
                },
                _ = cancel.cancelled() => break,
            }
        }
        slog::info!(self.logger, "Fleet refresher stopped");
    }

    async fn reconcile(&mut self) {
        let now = Utc::now();
        match self.registry.scan_records().await {
            Ok(records) => {
                self.view.apply_snapshot(records, now);
            }
            Err(e) => {
                slog::warn!(self.logger, "Fleet reconciliation failed: {}", e);
                let pruned = self.view.prune_stale(now);
                if pruned > 0 {
                    slog::info!(self.logger, "Pruned {} stale servers without a registry read", pruned);
                }
            }
        }
        self.publish();
    }

    async fn handle_message(&mut self, message: &str) {
        let event: FleetEvent = match serde_json::from_str(message) {
            Ok(event) => event,
            Err(e) => {
                slog::warn!(self.logger, "Ignoring malformed message on {}: {}", EVENTS_CHANNEL, e);
                return;
            }
        };
        slog::debug!(self.logger, "Fleet event: {} is {}", event.server_id, event.status);

        if event.status == ServerStatus::Dead {
            self.view.apply_event(&event);
            self.publish();
            return;
        }

        match self.registry.get_record(&event.server_id).await {
            Ok(Some(record)) => {
                self.view.apply_record(record);
            }
            Ok(None) => {
                self.view.remove(&event.server_id);
            }
            // The next reconciliation picks it up.
            Err(e) => slog::warn!(self.logger, "Could not fetch record for {}: {}", event.server_id, e),
        }
        self.publish();
    }

    fn publish(&self) {
        if self.publisher.borrow().version == self.view.version() {
            return;
        }
        self.publisher.send_replace(Arc::new(self.view.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::registry::InMemoryStore;
    use crate::types::{ServerId, ServerRecord};
    use std::time::Instant as StdInstant;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn registry_over(store: Arc<InMemoryStore>) -> RegistryClient {
        RegistryClient::new(
            test_logger(),
            store,
            BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(200)),
            Duration::from_millis(200),
            2,
        )
    }

    fn record(id: &str, status: ServerStatus) -> ServerRecord {
        ServerRecord {
            server_id: ServerId::new(id),
            address: format!("{}:25565", id),
            current_player_count: 1,
            max_capacity: 10,
            last_heartbeat_at: Utc::now(),
            status,
            ttl_ms: 600,
        }
    }

    async fn wait_for<F: Fn(&FleetSnapshot) -> bool>(handle: &mut FleetViewHandle, condition: F) -> Arc<FleetSnapshot> {
        let deadline = StdInstant::now() + std::time::Duration::from_secs(5);
        loop {
            let snapshot = handle.snapshot();
            if condition(&snapshot) {
                return snapshot;
            }
            assert!(StdInstant::now() < deadline, "condition not reached in time");
            let _ = tokio::time::timeout(Duration::from_millis(50), handle.changed()).await;
        }
    }

    #[tokio::test]
    async fn initial_reconcile_then_events() {
        let store = Arc::new(InMemoryStore::new());
        let registry = registry_over(store.clone());
        registry
            .put_record(&record("a", ServerStatus::Live), Duration::from_secs(60))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (mut handle, task) = spawn_fleet_refresher(
            test_logger(),
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(30),
            cancel.clone(),
        );

        wait_for(&mut handle, |s| s.get(&ServerId::new("a")).is_some()).await;

        // A change notification leads to a record fetch.
        let b = record("b", ServerStatus::Live);
        registry.put_record(&b, Duration::from_secs(60)).await.unwrap();
        // The subscription may not be up yet; keep announcing until it lands.
        let mut snapshot = handle.snapshot();
        for _ in 0..50 {
            registry
                .publish_event(&FleetEvent {
                    server_id: b.server_id.clone(),
                    status: ServerStatus::Live,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
            snapshot = handle.snapshot();
            if snapshot.get(&b.server_id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(snapshot.get(&b.server_id).is_some());

        // A Dead notification removes the server without waiting for its TTL.
        registry
            .publish_event(&FleetEvent {
                server_id: ServerId::new("a"),
                status: ServerStatus::Dead,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        wait_for(&mut handle, |s| s.get(&ServerId::new("a")).is_none()).await;

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn expired_server_disappears_within_one_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let registry = registry_over(store.clone());
        registry
            .put_record(&record("gone", ServerStatus::Live), Duration::from_millis(300))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (mut handle, task) = spawn_fleet_refresher(
            test_logger(),
            registry,
            Duration::from_millis(600),
            Duration::from_millis(200),
            cancel.clone(),
        );

        wait_for(&mut handle, |s| s.get(&ServerId::new("gone")).is_some()).await;
        // Key expiry takes 300ms; the record goes stale after 600ms; one more cycle removes it.
        wait_for(&mut handle, |s| s.servers.is_empty()).await;

        cancel.cancel();
        task.await.unwrap();
    }
}
