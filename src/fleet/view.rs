use crate::types::{FleetEvent, ServerId, ServerRecord, ServerStatus};
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

/// Immutable, versioned copy of the fleet as this instance sees it.
#[derive(Clone, Debug, Default)]
pub struct FleetSnapshot {
    pub version: u64,
    pub servers: BTreeMap<ServerId, ServerRecord>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct AggregateLoad {
    pub live_servers: usize,
    pub players: u64,
    pub capacity: u64,
}

impl AggregateLoad {
    pub fn ratio(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.players as f64 / self.capacity as f64
    }
}

impl FleetSnapshot {
    pub fn get(&self, server_id: &ServerId) -> Option<&ServerRecord> {
        self.servers.get(server_id)
    }

    pub fn live_servers(&self) -> impl Iterator<Item = &ServerRecord> {
        self.servers.values().filter(|record| record.status == ServerStatus::Live)
    }

    /// Totals over Live servers only.
    pub fn aggregate_load(&self) -> AggregateLoad {
        self.live_servers().fold(AggregateLoad::default(), |mut total, record| {
            total.live_servers += 1;
            total.players += record.current_player_count as u64;
            total.capacity += record.max_capacity as u64;
            total
        })
    }

    /// Lowest load ratio among Live servers with room, excluding `exclude`. Ties go to the lowest id.
    pub fn select_transfer_target(&self, exclude: &ServerId) -> Option<&ServerRecord> {
        let mut best: Option<&ServerRecord> = None;
        // BTreeMap iterates in id order, so a strict comparison keeps the lowest id on ties.
        for record in self.live_servers() {
            if &record.server_id == exclude || !record.has_room() {
                continue;
            }
            match best {
                Some(current) if record.load() >= current.load() => {}
                _ => best = Some(record),
            }
        }
        best
    }
}

/// FleetView is the mutable projection behind `FleetSnapshot`. It is owned by the refresher task.
pub struct FleetView {
    logger: slog::Logger,
    fallback_ttl: Duration,
    servers: BTreeMap<ServerId, ServerRecord>,
    version: u64,
}

impl FleetView {
    pub fn new(logger: slog::Logger, fallback_ttl: Duration) -> Self {
        FleetView {
            logger,
            fallback_ttl,
            servers: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            version: self.version,
            servers: self.servers.clone(),
        }
    }

    /// Merges a full registry read. Servers missing from it are dropped once their TTL has passed.
    /// Applying the same snapshot twice is a no-op.
    pub fn apply_snapshot(&mut self, records: Vec<ServerRecord>, now: DateTime<Utc>) -> bool {
        let mut latest: BTreeMap<ServerId, ServerRecord> = BTreeMap::new();
        for record in records {
            match latest.entry(record.server_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(mut slot) => {
                    slog::warn!(
                        self.logger,
                        "Conflicting records for {} in one snapshot. Keeping the latest heartbeat.",
                        record.server_id
                    );
                    if record.last_heartbeat_at > slot.get().last_heartbeat_at {
                        slot.insert(record);
                    }
                }
            }
        }

        let mut changed = false;
        let fallback_ttl = self.fallback_ttl;
        let before = self.servers.len();
        self.servers
            .retain(|id, record| latest.contains_key(id) || !record.is_stale(now, fallback_ttl));
        changed |= self.servers.len() != before;

        for record in latest.into_values() {
            changed |= self.merge(record);
        }

        if changed {
            self.version += 1;
        }
        changed
    }

    /// Merges one record fetched outside a full snapshot.
    pub fn apply_record(&mut self, record: ServerRecord) -> bool {
        let changed = self.merge(record);
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Applies a Dead notification. Returns true if the server was known.
    pub fn apply_event(&mut self, event: &FleetEvent) -> bool {
        if event.status != ServerStatus::Dead {
            return false;
        }
        self.remove(&event.server_id)
    }

    pub fn remove(&mut self, server_id: &ServerId) -> bool {
        let removed = self.servers.remove(server_id).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Drops every record whose heartbeat is older than its TTL.
    pub fn prune_stale(&mut self, now: DateTime<Utc>) -> usize {
        let fallback_ttl = self.fallback_ttl;
        let before = self.servers.len();
        self.servers.retain(|_, record| !record.is_stale(now, fallback_ttl));
        let pruned = before - self.servers.len();
        if pruned > 0 {
            self.version += 1;
        }
        pruned
    }

    // Latest heartbeat wins. Returns true if the view changed.
    fn merge(&mut self, record: ServerRecord) -> bool {
        match self.servers.entry(record.server_id.clone()) {
            Entry::Vacant(slot) => {
                slog::info!(self.logger, "Server {} joined the fleet view ({})", record.server_id, record.status);
                slot.insert(record);
                true
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if record.last_heartbeat_at < existing.last_heartbeat_at {
                    slog::warn!(
                        self.logger,
                        "Ignoring older record for {} ({} < {})",
                        record.server_id,
                        record.last_heartbeat_at,
                        existing.last_heartbeat_at
                    );
                    return false;
                }
                if *existing == record {
                    return false;
                }
                if existing.status != record.status {
                    slog::info!(
                        self.logger,
                        "Server {} is now {} (was {})",
                        record.server_id,
                        record.status,
                        existing.status
                    );
                }
                slot.insert(record);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn record(id: &str, players: u32, max: u32, status: ServerStatus, at: DateTime<Utc>) -> ServerRecord {
        ServerRecord {
            server_id: ServerId::new(id),
            address: format!("{}.internal:25565", id),
            current_player_count: players,
            max_capacity: max,
            last_heartbeat_at: at,
            status,
            ttl_ms: 6000,
        }
    }

    #[test]
    fn selects_least_loaded_live_server() {
        let now = Utc::now();
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));
        view.apply_snapshot(
            vec![
                record("a", 90, 100, ServerStatus::Live, now),
                record("b", 20, 100, ServerStatus::Live, now),
                record("c", 0, 100, ServerStatus::Draining, now),
            ],
            now,
        );

        let snapshot = view.snapshot();
        let target = snapshot.select_transfer_target(&ServerId::new("self")).unwrap();
        assert_eq!(target.server_id, ServerId::new("b"));

        assert_eq!(snapshot.aggregate_load(), AggregateLoad {
            live_servers: 2,
            players: 110,
            capacity: 200,
        });
    }

    #[test]
    fn selection_skips_self_and_full_servers_and_breaks_ties_by_id() {
        let now = Utc::now();
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));
        view.apply_snapshot(
            vec![
                record("self", 0, 100, ServerStatus::Live, now),
                record("full", 10, 10, ServerStatus::Live, now),
                record("y", 5, 10, ServerStatus::Live, now),
                record("x", 50, 100, ServerStatus::Live, now),
            ],
            now,
        );

        let snapshot = view.snapshot();
        let target = snapshot.select_transfer_target(&ServerId::new("self")).unwrap();
        assert_eq!(target.server_id, ServerId::new("x"));

        let empty = FleetSnapshot::default();
        assert!(empty.select_transfer_target(&ServerId::new("self")).is_none());
    }

    #[test]
    fn latest_heartbeat_wins() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(2);
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));

        // Two conflicting entries in one read.
        view.apply_snapshot(
            vec![
                record("a", 5, 10, ServerStatus::Live, now),
                record("a", 1, 10, ServerStatus::Draining, earlier),
            ],
            now,
        );
        assert_eq!(view.snapshot().get(&ServerId::new("a")).unwrap().current_player_count, 5);

        // An older record arriving later does not roll the view back.
        assert!(!view.apply_record(record("a", 2, 10, ServerStatus::Draining, earlier)));
        assert_eq!(view.snapshot().get(&ServerId::new("a")).unwrap().status, ServerStatus::Live);
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let now = Utc::now();
        let records = vec![
            record("a", 1, 10, ServerStatus::Live, now),
            record("b", 2, 10, ServerStatus::Live, now),
        ];
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));

        assert!(view.apply_snapshot(records.clone(), now));
        let version = view.version();
        assert!(!view.apply_snapshot(records, now));
        assert_eq!(view.version(), version);
    }

    #[test]
    fn absent_servers_are_removed_only_once_stale() {
        let now = Utc::now();
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));
        view.apply_snapshot(
            vec![
                record("a", 1, 10, ServerStatus::Live, now),
                record("b", 1, 10, ServerStatus::Live, now),
            ],
            now,
        );

        // "b" vanished from the store but its TTL has not passed yet.
        let soon = now + chrono::Duration::seconds(3);
        view.apply_snapshot(vec![record("a", 1, 10, ServerStatus::Live, soon)], soon);
        assert!(view.snapshot().get(&ServerId::new("b")).is_some());

        let later = now + chrono::Duration::seconds(7);
        view.apply_snapshot(vec![record("a", 1, 10, ServerStatus::Live, later)], later);
        assert!(view.snapshot().get(&ServerId::new("b")).is_none());
        assert!(view.snapshot().get(&ServerId::new("a")).is_some());
    }

    #[test]
    fn dead_event_and_pruning() {
        let now = Utc::now();
        let mut view = FleetView::new(test_logger(), Duration::from_secs(6));
        view.apply_snapshot(
            vec![
                record("a", 1, 10, ServerStatus::Live, now),
                record("b", 1, 10, ServerStatus::Live, now - chrono::Duration::seconds(5)),
            ],
            now,
        );

        assert!(view.apply_event(&FleetEvent {
            server_id: ServerId::new("a"),
            status: ServerStatus::Dead,
            timestamp: now,
        }));
        assert!(!view.apply_event(&FleetEvent {
            server_id: ServerId::new("b"),
            status: ServerStatus::Live,
            timestamp: now,
        }));

        assert_eq!(view.prune_stale(now + chrono::Duration::seconds(2)), 1);
        assert!(view.snapshot().servers.is_empty());
    }
}
