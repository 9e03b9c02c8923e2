use crate::capacity::CapacityTracker;
use crate::transfer::{
    AdmissionDecision, RejectReason, RouteDirective, RouteOutcome, TransferAudit, TransferRequest, TransferState,
};
use crate::types::{PlayerId, RequestId, ServerId};
use chrono::Utc;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) enum Admission {
    /// New request. A capacity slot stays reserved until it resolves.
    Evaluate(TransferRequest),
    /// A retry of a request that is still pending. Answered when it resolves.
    Attached,
    /// Answer now without recording anything.
    Reply(RouteOutcome),
    /// Rejected up front, and recorded like any other resolution.
    Resolved(Resolution),
}

#[derive(Debug)]
pub(crate) struct Resolution {
    pub(crate) request: TransferRequest,
    pub(crate) outcome: RouteOutcome,
    /// How many times the proxy is owed this answer.
    pub(crate) replies: usize,
}

impl Resolution {
    pub(crate) fn audit(&self, recorded_by: &ServerId) -> TransferAudit {
        TransferAudit {
            request_id: self.request.request_id.clone(),
            player_id: self.request.player_id.clone(),
            source_server_id: self.request.source_server_id.clone(),
            target_server_id: self.request.target_server_id.clone(),
            issued_at: self.request.issued_at,
            resolved_at: Utc::now(),
            state: self.request.state,
            reject_reason: match &self.outcome {
                RouteOutcome::Accepted => None,
                RouteOutcome::Rejected(reason) => Some(reason.as_code()),
            },
            recorded_by: recorded_by.clone(),
        }
    }
}

struct Inflight {
    request: TransferRequest,
    replies: usize,
}

struct Settled {
    player_id: PlayerId,
    outcome: RouteOutcome,
    settled_at: Instant,
}

/// TransferLedger is the bookkeeping behind inbound transfers: what is pending, which players are
/// spoken for, and recently settled outcomes kept around to answer retries.
///
/// Not thread safe. The coordinator task owns it.
pub(crate) struct TransferLedger {
    logger: slog::Logger,
    local_server_id: ServerId,
    capacity: CapacityTracker,
    retention: Duration,
    inflight: HashMap<RequestId, Inflight>,
    pending_players: HashMap<PlayerId, RequestId>,
    settled: HashMap<RequestId, Settled>,
}

impl TransferLedger {
    pub(crate) fn new(
        logger: slog::Logger,
        local_server_id: ServerId,
        capacity: CapacityTracker,
        retention: Duration,
    ) -> Self {
        TransferLedger {
            logger,
            local_server_id,
            capacity,
            retention,
            inflight: HashMap::new(),
            pending_players: HashMap::new(),
            settled: HashMap::new(),
        }
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub(crate) fn admit(&mut self, directive: &RouteDirective, draining: bool) -> Admission {
        let request_id = &directive.request_id;

        if let Some(inflight) = self.inflight.get_mut(request_id) {
            if inflight.request.player_id == directive.player_id {
                inflight.replies += 1;
                slog::debug!(self.logger, "Request {} is already pending. Attaching retry.", request_id);
                return Admission::Attached;
            }
            slog::warn!(
                self.logger,
                "Request {} reused for player {} while pending for {}",
                request_id,
                directive.player_id,
                inflight.request.player_id
            );
            return Admission::Reply(RouteOutcome::Rejected(RejectReason::DuplicateRequest));
        }

        if let Some(settled) = self.settled.get(request_id) {
            if settled.player_id == directive.player_id {
                slog::debug!(self.logger, "Request {} already settled. Replaying outcome.", request_id);
                return Admission::Reply(settled.outcome.clone());
            }
            slog::warn!(
                self.logger,
                "Request {} reused for player {} after settling for {}",
                request_id,
                directive.player_id,
                settled.player_id
            );
            return Admission::Reply(RouteOutcome::Rejected(RejectReason::DuplicateRequest));
        }

        let rejection = if draining {
            Some(RejectReason::Draining)
        } else if directive.target_server_id != self.local_server_id {
            Some(RejectReason::WrongTarget)
        } else if self.pending_players.contains_key(&directive.player_id) {
            Some(RejectReason::DuplicateRequest)
        } else if !self.capacity.try_reserve() {
            Some(RejectReason::CapacityExceeded)
        } else {
            None
        };

        let request = TransferRequest::from_directive(directive);
        match rejection {
            Some(reason) => {
                let resolution = self.settle(request, RouteOutcome::Rejected(reason), TransferState::Rejected, 1);
                Admission::Resolved(resolution)
            }
            None => {
                self.pending_players
                    .insert(request.player_id.clone(), request.request_id.clone());
                self.inflight.insert(request.request_id.clone(), Inflight {
                    request: request.clone(),
                    replies: 1,
                });
                Admission::Evaluate(request)
            }
        }
    }

    /// Applies the engine's answer; `None` means it did not answer in time. Returns `None` if the
    /// request is no longer pending, e.g. an answer arriving after a forced timeout.
    pub(crate) fn resolve(&mut self, request_id: &RequestId, decision: Option<AdmissionDecision>) -> Option<Resolution> {
        let inflight = self.inflight.remove(request_id)?;
        self.pending_players.remove(&inflight.request.player_id);

        let (outcome, state) = match decision {
            Some(AdmissionDecision::Accept) => {
                self.capacity.commit_reservation();
                (RouteOutcome::Accepted, TransferState::Accepted)
            }
            Some(AdmissionDecision::Reject(reason)) => {
                self.capacity.release_reservation();
                (
                    RouteOutcome::Rejected(RejectReason::EngineDenied(reason)),
                    TransferState::Rejected,
                )
            }
            None => {
                self.capacity.release_reservation();
                (
                    RouteOutcome::Rejected(RejectReason::AdmissionTimeout),
                    TransferState::TimedOut,
                )
            }
        };
        Some(self.settle(inflight.request, outcome, state, inflight.replies))
    }

    /// Times out everything still pending.
    pub(crate) fn force_timeout_all(&mut self) -> Vec<Resolution> {
        let pending: Vec<RequestId> = self.inflight.keys().cloned().collect();
        pending.iter().filter_map(|id| self.resolve(id, None)).collect()
    }

    /// Forgets settled outcomes older than the retention window.
    pub(crate) fn purge(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.settled.len();
        self.settled
            .retain(|_, settled| now.saturating_duration_since(settled.settled_at) < retention);
        before - self.settled.len()
    }

    fn settle(
        &mut self,
        mut request: TransferRequest,
        outcome: RouteOutcome,
        state: TransferState,
        replies: usize,
    ) -> Resolution {
        request.state = state;
        self.settled.insert(request.request_id.clone(), Settled {
            player_id: request.player_id.clone(),
            outcome: outcome.clone(),
            settled_at: Instant::now(),
        });
        Resolution {
            request,
            outcome,
            replies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn ledger(max_capacity: u32) -> (TransferLedger, CapacityTracker) {
        let capacity = CapacityTracker::new(max_capacity);
        let ledger = TransferLedger::new(
            test_logger(),
            ServerId::new("me"),
            capacity.clone(),
            Duration::from_secs(60),
        );
        (ledger, capacity)
    }

    fn directive(request: &str, player: &str) -> RouteDirective {
        RouteDirective {
            request_id: RequestId::new(request),
            player_id: PlayerId::new(player),
            target_server_id: ServerId::new("me"),
            source_server_id: None,
        }
    }

    fn rejection(admission: Admission) -> RejectReason {
        match admission {
            Admission::Resolved(Resolution {
                outcome: RouteOutcome::Rejected(reason),
                ..
            }) => reason,
            Admission::Reply(RouteOutcome::Rejected(reason)) => reason,
            other => panic!("expected a rejection, got {:?}", other),
        }
    }

    #[test]
    fn retries_attach_to_pending_request() {
        let (mut ledger, _) = ledger(10);

        assert!(matches!(ledger.admit(&directive("r1", "p1"), false), Admission::Evaluate(_)));
        assert!(matches!(ledger.admit(&directive("r1", "p1"), false), Admission::Attached));
        assert!(matches!(ledger.admit(&directive("r1", "p1"), false), Admission::Attached));

        let resolution = ledger
            .resolve(&RequestId::new("r1"), Some(AdmissionDecision::Accept))
            .unwrap();
        assert_eq!(resolution.replies, 3);
        assert_eq!(resolution.outcome, RouteOutcome::Accepted);
        assert_eq!(resolution.request.state, TransferState::Accepted);

        // After settling, a retry replays the cached outcome.
        match ledger.admit(&directive("r1", "p1"), false) {
            Admission::Reply(outcome) => assert_eq!(outcome, RouteOutcome::Accepted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn duplicates_are_rejected() {
        let (mut ledger, _) = ledger(10);
        ledger.admit(&directive("r1", "p1"), false);

        // Same id, different player.
        assert_eq!(rejection(ledger.admit(&directive("r1", "p2"), false)), RejectReason::DuplicateRequest);
        // Same player, different id.
        assert_eq!(rejection(ledger.admit(&directive("r2", "p1"), false)), RejectReason::DuplicateRequest);
        assert_eq!(ledger.inflight_count(), 1);
    }

    #[test]
    fn validation_order() {
        let (mut ledger, capacity) = ledger(1);

        let mut elsewhere = directive("r0", "p0");
        elsewhere.target_server_id = ServerId::new("other");
        assert_eq!(rejection(ledger.admit(&elsewhere, true)), RejectReason::Draining);
        assert_eq!(rejection(ledger.admit(&directive("r1", "p1"), true)), RejectReason::Draining);

        let mut elsewhere = directive("r2", "p2");
        elsewhere.target_server_id = ServerId::new("other");
        assert_eq!(rejection(ledger.admit(&elsewhere, false)), RejectReason::WrongTarget);

        assert!(matches!(ledger.admit(&directive("r3", "p3"), false), Admission::Evaluate(_)));
        assert_eq!(rejection(ledger.admit(&directive("r4", "p4"), false)), RejectReason::CapacityExceeded);
        assert_eq!(capacity.snapshot().reserved, 1);
    }

    #[test]
    fn resolution_moves_reservations() {
        let (mut ledger, capacity) = ledger(5);
        ledger.admit(&directive("a", "pa"), false);
        ledger.admit(&directive("b", "pb"), false);
        ledger.admit(&directive("c", "pc"), false);
        assert_eq!(capacity.snapshot().reserved, 3);

        ledger.resolve(&RequestId::new("a"), Some(AdmissionDecision::Accept));
        let denied = ledger
            .resolve(&RequestId::new("b"), Some(AdmissionDecision::Reject("banned".into())))
            .unwrap();
        assert_eq!(
            denied.outcome,
            RouteOutcome::Rejected(RejectReason::EngineDenied("banned".into()))
        );
        let timed_out = ledger.resolve(&RequestId::new("c"), None).unwrap();
        assert_eq!(timed_out.request.state, TransferState::TimedOut);
        assert_eq!(timed_out.outcome, RouteOutcome::Rejected(RejectReason::AdmissionTimeout));

        let snapshot = capacity.snapshot();
        assert_eq!(snapshot.reserved, 0);
        assert_eq!(snapshot.connected, 1);

        // A late answer is ignored.
        assert!(ledger.resolve(&RequestId::new("c"), Some(AdmissionDecision::Accept)).is_none());
        assert_eq!(capacity.snapshot().connected, 1);
    }

    #[test]
    fn forced_timeouts_and_audit() {
        let (mut ledger, _) = ledger(5);
        ledger.admit(&directive("a", "pa"), false);
        ledger.admit(&directive("b", "pb"), false);

        let forced = ledger.force_timeout_all();
        assert_eq!(forced.len(), 2);
        assert!(forced.iter().all(|r| r.request.state == TransferState::TimedOut));
        assert_eq!(ledger.inflight_count(), 0);

        let audit = forced[0].audit(&ServerId::new("me"));
        assert_eq!(audit.state, TransferState::TimedOut);
        assert_eq!(audit.reject_reason.as_deref(), Some("admission_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_outcomes_expire() {
        let (mut ledger, _) = ledger(5);
        ledger.admit(&directive("a", "pa"), false);
        ledger.resolve(&RequestId::new("a"), Some(AdmissionDecision::Accept));

        assert_eq!(ledger.purge(Instant::now()), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(ledger.purge(Instant::now()), 1);

        // Forgotten, so the id is treated as new.
        assert!(matches!(ledger.admit(&directive("a", "pa"), false), Admission::Evaluate(_)));
    }
}
