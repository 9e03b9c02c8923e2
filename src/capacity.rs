use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// CapacityTracker holds the player count reported by the game engine plus the slots reserved by
/// admissions that are still waiting on the engine. Cloning shares the same counters.
#[derive(Clone)]
pub struct CapacityTracker {
    inner: Arc<Inner>,
}

struct Inner {
    max_capacity: u32,
    connected: AtomicU32,
    reserved: AtomicU32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CapacitySnapshot {
    pub connected: u32,
    pub reserved: u32,
    pub max_capacity: u32,
}

impl CapacitySnapshot {
    pub fn load(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.connected as f64 / self.max_capacity as f64
    }
}

impl CapacityTracker {
    pub fn new(max_capacity: u32) -> Self {
        CapacityTracker {
            inner: Arc::new(Inner {
                max_capacity,
                connected: AtomicU32::new(0),
                reserved: AtomicU32::new(0),
            }),
        }
    }

    pub fn max_capacity(&self) -> u32 {
        self.inner.max_capacity
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            connected: self.inner.connected.load(Ordering::Acquire),
            reserved: self.inner.reserved.load(Ordering::Acquire),
            max_capacity: self.inner.max_capacity,
        }
    }

    /// Authoritative count from the engine. Reservations are left alone.
    pub fn set_connected(&self, count: u32) {
        self.inner.connected.store(count, Ordering::Release);
    }

    /// Claims a slot for a pending admission. Returns false when connected + reserved is already at
    /// capacity.
    pub fn try_reserve(&self) -> bool {
        let max = self.inner.max_capacity;
        loop {
            let reserved = self.inner.reserved.load(Ordering::Acquire);
            let connected = self.inner.connected.load(Ordering::Acquire);
            if connected.saturating_add(reserved) >= max {
                return false;
            }
            if self
                .inner
                .reserved
                .compare_exchange(reserved, reserved + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// The engine admitted the player: the reservation becomes a connected player.
    pub fn commit_reservation(&self) {
        self.release_reservation();
        self.inner.connected.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release_reservation(&self) {
        let _ = self
            .inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1));
    }

    /// A player left through an outbound transfer.
    pub fn player_released(&self) {
        let _ = self
            .inner
            .connected
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_bound_admissions() {
        let capacity = CapacityTracker::new(3);
        capacity.set_connected(1);

        assert!(capacity.try_reserve());
        assert!(capacity.try_reserve());
        assert!(!capacity.try_reserve());

        capacity.release_reservation();
        assert!(capacity.try_reserve());

        capacity.commit_reservation();
        let snapshot = capacity.snapshot();
        assert_eq!(snapshot.connected, 2);
        assert_eq!(snapshot.reserved, 1);
    }

    #[test]
    fn counters_never_underflow() {
        let capacity = CapacityTracker::new(10);
        capacity.release_reservation();
        capacity.player_released();

        assert_eq!(capacity.snapshot(), CapacitySnapshot {
            connected: 0,
            reserved: 0,
            max_capacity: 10,
        });
    }

    #[test]
    fn zero_capacity_is_full() {
        let capacity = CapacityTracker::new(0);
        assert!(!capacity.try_reserve());
        assert_eq!(capacity.snapshot().load(), 1.0);
    }
}
