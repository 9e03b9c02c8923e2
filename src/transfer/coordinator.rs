use crate::capacity::CapacityTracker;
use crate::control::{ControlError, ControlHandle, ProxyWork, SessionState, SessionStateListener};
use crate::events::{BridgeEvent, EventBus};
use crate::fleet::FleetViewHandle;
use crate::registry::RegistryClient;
use crate::transfer::ledger::{Admission, Resolution, TransferLedger};
use crate::transfer::{
    AdmissionDecision, GameEngine, RejectReason, RouteDirective, RouteOutcome, RouteResult, TransferRequest,
    TransferState,
};
use crate::types::{PlayerId, RequestId, ServerId};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE_SIZE: usize = 32;
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    /// Bounds both the engine's admission decision and the proxy's answer to an outbound directive.
    pub admission_timeout: Duration,
    /// How long settled outcomes are kept to answer retries.
    pub dedup_retention: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum EvacuationError {
    #[error("No Live server with room to take the player")]
    NoTarget,
    #[error("Player {0} is already being transferred")]
    AlreadyInProgress(PlayerId),
    #[error("Transfer coordinator is draining")]
    Draining,
    #[error("Proxy rejected the transfer: {0}")]
    Rejected(RejectReason),
    #[error("Failed to hand the directive to the proxy")]
    Control(#[from] ControlError),
    #[error("No answer from the proxy within {0:?}")]
    TimedOut(Duration),
    #[error("Transfer coordinator is not running")]
    CoordinatorStopped,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DrainReport {
    /// In-flight transfers that resolved within the grace period.
    pub completed: usize,
    /// In-flight transfers forced to TimedOut when the grace period ran out.
    pub forced: usize,
}

#[derive(Debug)]
enum Event {
    Evacuate(PlayerId, Callback<ServerId, EvacuationError>),
    BeginDrain(Duration, oneshot::Sender<DrainReport>),
}

// Reports from tasks the coordinator spawned.
#[derive(Debug)]
enum TaskReport {
    EngineAnswered {
        request_id: RequestId,
        decision: Option<AdmissionDecision>,
    },
    DirectiveNotSent {
        request_id: RequestId,
        error: ControlError,
    },
    OutboundExpired(RequestId),
}

#[derive(Debug)]
struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    /// Moves one of our players to the least loaded Live server. Resolves once the proxy answered
    /// and the engine has been told to release the player.
    pub async fn evacuate(&self, player_id: PlayerId) -> Result<ServerId, EvacuationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Event::Evacuate(player_id, Callback(tx)))
            .await
            .map_err(|_| EvacuationError::CoordinatorStopped)?;
        rx.await.unwrap_or(Err(EvacuationError::CoordinatorStopped))
    }

    /// Stops accepting directives and waits up to `grace` for in-flight transfers. Whatever is left
    /// afterwards is forced to TimedOut. Calling it again returns the same report.
    pub async fn begin_drain(&self, grace: Duration) -> DrainReport {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Event::BeginDrain(grace, tx)).await.is_err() {
            return DrainReport::default();
        }
        rx.await.unwrap_or_default()
    }
}

pub(crate) fn spawn_coordinator(
    logger: slog::Logger,
    server_id: ServerId,
    capacity: CapacityTracker,
    options: CoordinatorOptions,
    engine: Arc<dyn GameEngine>,
    control: ControlHandle,
    registry: RegistryClient,
    fleet: FleetViewHandle,
    registry_health: watch::Receiver<bool>,
    work: mpsc::Receiver<ProxyWork>,
    events: EventBus,
    cancel: CancellationToken,
) -> (CoordinatorHandle, JoinHandle<()>) {
    let (sender, requests) = mpsc::channel(REQUEST_QUEUE_SIZE);
    let (reports_tx, reports) = mpsc::unbounded_channel();

    let coordinator = TransferCoordinator {
        ledger: TransferLedger::new(
            logger.clone(),
            server_id.clone(),
            capacity.clone(),
            options.dedup_retention,
        ),
        session: control.state_listener(),
        logger,
        server_id,
        capacity,
        options,
        engine,
        control,
        registry,
        fleet,
        registry_health,
        events,
        reports_tx,
        outbound: HashMap::new(),
        draining: false,
        drain: None,
        drain_report: None,
    };
    let task = tokio::spawn(coordinator.run(requests, work, reports, cancel));

    (CoordinatorHandle { sender }, task)
}

struct Outbound {
    request: TransferRequest,
    callback: Callback<ServerId, EvacuationError>,
}

struct DrainProgress {
    deadline: Instant,
    started_with: usize,
    waiters: Vec<oneshot::Sender<DrainReport>>,
}

/// TransferCoordinator owns every transfer this instance takes part in. Engine calls, outbound
/// sends and timers run on spawned tasks and report back, so the loop itself never waits on I/O.
struct TransferCoordinator {
    logger: slog::Logger,
    server_id: ServerId,
    capacity: CapacityTracker,
    options: CoordinatorOptions,
    engine: Arc<dyn GameEngine>,
    control: ControlHandle,
    registry: RegistryClient,
    fleet: FleetViewHandle,
    events: EventBus,
    session: SessionStateListener,
    /// False while our registry record may have expired. New players are turned away meanwhile.
    registry_health: watch::Receiver<bool>,
    ledger: TransferLedger,
    reports_tx: mpsc::UnboundedSender<TaskReport>,
    outbound: HashMap<RequestId, Outbound>,
    draining: bool,
    drain: Option<DrainProgress>,
    drain_report: Option<DrainReport>,
}

impl TransferCoordinator {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Event>,
        mut work: mpsc::Receiver<ProxyWork>,
        mut reports: mpsc::UnboundedReceiver<TaskReport>,
        cancel: CancellationToken,
    ) {
        let mut purge = tokio::time::interval(std::cmp::max(self.options.dedup_retention / 2, MIN_PURGE_INTERVAL));
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;
        let mut work_open = true;

        loop {
            let drain_deadline = self.drain.as_ref().map(|progress| progress.deadline);
            tokio::select! {
                event = requests.recv(), if requests_open => match event {
                    Some(event) => self.handle_event(event),
                    None => requests_open = false,
                },
                item = work.recv(), if work_open => match item {
                    Some(item) => self.handle_work(item),
                    None => work_open = false,
                },
                Some(report) = reports.recv() => self.handle_report(report),
                _ = purge.tick() => {
                    let purged = self.ledger.purge(Instant::now());
                    if purged > 0 {
                        slog::debug!(self.logger, "Forgot {} settled transfers", purged);
                    }
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    self.force_drain();
                }
                _ = cancel.cancelled() => break,
            }
        }

        self.force_drain();
        slog::info!(self.logger, "Transfer coordinator stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Evacuate(player_id, callback) => self.evacuate(player_id, callback),
            Event::BeginDrain(grace, reply) => self.begin_drain(grace, reply),
        }
    }

    fn handle_work(&mut self, item: ProxyWork) {
        match item {
            ProxyWork::Directive(directive) => self.handle_directive(directive),
            ProxyWork::OutboundResult(result) => self.handle_outbound_result(result),
        }
    }

    fn handle_report(&mut self, report: TaskReport) {
        match report {
            TaskReport::EngineAnswered { request_id, decision } => match self.ledger.resolve(&request_id, decision) {
                Some(resolution) => self.finish(resolution),
                None => slog::debug!(self.logger, "Ignoring late engine answer for {}", request_id),
            },
            TaskReport::DirectiveNotSent { request_id, error } => {
                if let Some(outbound) = self.outbound.remove(&request_id) {
                    slog::warn!(
                        self.logger,
                        "Could not send transfer {} of {}: {}",
                        request_id,
                        outbound.request.player_id,
                        error
                    );
                    self.events.publish(BridgeEvent::TransferResolved {
                        request_id,
                        player_id: outbound.request.player_id.clone(),
                        state: TransferState::Rejected,
                    });
                    outbound.callback.send(Err(EvacuationError::Control(error)));
                    self.check_drain_complete();
                }
            }
            TaskReport::OutboundExpired(request_id) => {
                if let Some(outbound) = self.outbound.remove(&request_id) {
                    let timeout = self.options.admission_timeout;
                    self.settle_outbound(
                        outbound.request,
                        RouteOutcome::Rejected(RejectReason::AdmissionTimeout),
                        TransferState::TimedOut,
                    );
                    outbound.callback.send(Err(EvacuationError::TimedOut(timeout)));
                }
            }
        }
    }

    fn handle_directive(&mut self, directive: RouteDirective) {
        let draining = self.draining
            || self.session.current() == SessionState::Draining
            || !*self.registry_health.borrow();
        match self.ledger.admit(&directive, draining) {
            Admission::Evaluate(request) => self.evaluate(request),
            Admission::Attached => {}
            Admission::Reply(outcome) => self.control.send_route_result(RouteResult {
                request_id: directive.request_id,
                outcome,
            }),
            Admission::Resolved(resolution) => self.finish(resolution),
        }
    }

    fn evaluate(&self, request: TransferRequest) {
        slog::info!(
            self.logger,
            "Asking engine to admit {}", request.player_id;
            "request_id" => %request.request_id
        );
        let engine = self.engine.clone();
        let reports = self.reports_tx.clone();
        let timeout = self.options.admission_timeout;
        tokio::spawn(async move {
            let decision = tokio::time::timeout(timeout, engine.evaluate_admission(&request.player_id))
                .await
                .ok();
            let _ = reports.send(TaskReport::EngineAnswered {
                request_id: request.request_id,
                decision,
            });
        });
    }

    fn evacuate(&mut self, player_id: PlayerId, callback: Callback<ServerId, EvacuationError>) {
        if self.draining {
            callback.send(Err(EvacuationError::Draining));
            return;
        }
        if self.outbound.values().any(|o| o.request.player_id == player_id) {
            callback.send(Err(EvacuationError::AlreadyInProgress(player_id)));
            return;
        }

        let snapshot = self.fleet.snapshot();
        let target = match snapshot.select_transfer_target(&self.server_id) {
            Some(record) => record.server_id.clone(),
            None => {
                slog::warn!(self.logger, "No transfer target for {}", player_id);
                callback.send(Err(EvacuationError::NoTarget));
                return;
            }
        };

        let directive = RouteDirective {
            request_id: RequestId::generate(&self.server_id),
            player_id,
            target_server_id: target,
            source_server_id: Some(self.server_id.clone()),
        };
        slog::info!(
            self.logger,
            "Evacuating {} to {}", directive.player_id, directive.target_server_id;
            "request_id" => %directive.request_id
        );
        let request_id = directive.request_id.clone();
        self.outbound.insert(request_id.clone(), Outbound {
            request: TransferRequest::from_directive(&directive),
            callback,
        });

        let control = self.control.clone();
        let reports = self.reports_tx.clone();
        let timeout = self.options.admission_timeout;
        tokio::spawn(async move {
            if let Err(error) = control.send_route_directive(directive).await {
                let _ = reports.send(TaskReport::DirectiveNotSent { request_id, error });
                return;
            }
            tokio::time::sleep(timeout).await;
            let _ = reports.send(TaskReport::OutboundExpired(request_id));
        });
    }

    fn handle_outbound_result(&mut self, result: RouteResult) {
        let outbound = match self.outbound.remove(&result.request_id) {
            Some(outbound) => outbound,
            None => {
                slog::debug!(self.logger, "Result for unknown outbound transfer {}", result.request_id);
                return;
            }
        };

        let target = outbound.request.target_server_id.clone();
        let reply = match &result.outcome {
            RouteOutcome::Accepted => {
                self.capacity.player_released();
                let engine = self.engine.clone();
                let player_id = outbound.request.player_id.clone();
                tokio::spawn(async move { engine.notify_released(&player_id).await });
                Ok(target)
            }
            RouteOutcome::Rejected(reason) => Err(EvacuationError::Rejected(reason.clone())),
        };
        let state = if result.outcome.is_accepted() {
            TransferState::Accepted
        } else {
            TransferState::Rejected
        };

        self.settle_outbound(outbound.request, result.outcome, state);
        outbound.callback.send(reply);
    }

    fn settle_outbound(&mut self, mut request: TransferRequest, outcome: RouteOutcome, state: TransferState) {
        request.state = state;
        self.finish(Resolution {
            request,
            outcome,
            replies: 0,
        });
    }

    // Every settled transfer goes through here, inbound or outbound.
    fn finish(&mut self, resolution: Resolution) {
        let request = &resolution.request;
        match (&resolution.outcome, request.state) {
            (_, TransferState::TimedOut) => slog::warn!(
                self.logger,
                "Transfer of {} timed out", request.player_id;
                "request_id" => %request.request_id
            ),
            (RouteOutcome::Accepted, _) => slog::info!(
                self.logger,
                "Transfer of {} accepted", request.player_id;
                "request_id" => %request.request_id
            ),
            (RouteOutcome::Rejected(reason), _) => slog::info!(
                self.logger,
                "Transfer of {} rejected: {}", request.player_id, reason;
                "request_id" => %request.request_id
            ),
        }

        for _ in 0..resolution.replies {
            self.control.send_route_result(RouteResult {
                request_id: request.request_id.clone(),
                outcome: resolution.outcome.clone(),
            });
        }

        self.events.publish(BridgeEvent::TransferResolved {
            request_id: request.request_id.clone(),
            player_id: request.player_id.clone(),
            state: request.state,
        });
        self.write_audit(&resolution);
        self.check_drain_complete();
    }

    fn write_audit(&self, resolution: &Resolution) {
        let audit = resolution.audit(&self.server_id);
        let registry = self.registry.clone();
        let retention = self.options.dedup_retention;
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.put_transfer_audit(&audit.request_id, &audit, retention).await {
                slog::warn!(logger, "Failed to record transfer {}: {}", audit.request_id, e);
            }
        });
    }

    fn in_flight(&self) -> usize {
        self.ledger.inflight_count() + self.outbound.len()
    }

    fn begin_drain(&mut self, grace: Duration, reply: oneshot::Sender<DrainReport>) {
        if let Some(report) = self.drain_report {
            let _ = reply.send(report);
            return;
        }
        if let Some(progress) = self.drain.as_mut() {
            progress.waiters.push(reply);
            return;
        }

        self.draining = true;
        let in_flight = self.in_flight();
        slog::info!(self.logger, "Draining with {} transfers in flight", in_flight);
        self.drain = Some(DrainProgress {
            deadline: Instant::now() + grace,
            started_with: in_flight,
            waiters: vec![reply],
        });
        self.check_drain_complete();
    }

    fn check_drain_complete(&mut self) {
        if self.drain.is_none() || self.in_flight() > 0 {
            return;
        }
        if let Some(progress) = self.drain.take() {
            self.complete_drain(progress, 0);
        }
    }

    // Grace period is over.
    fn force_drain(&mut self) {
        let progress = match self.drain.take() {
            Some(progress) => progress,
            None => return,
        };

        let forced_inbound = self.ledger.force_timeout_all();
        let forced_outbound: Vec<Outbound> = self.outbound.drain().map(|(_, outbound)| outbound).collect();
        let forced = forced_inbound.len() + forced_outbound.len();
        if forced > 0 {
            slog::warn!(self.logger, "Grace period over. Forcing {} transfers to time out.", forced);
        }

        for resolution in forced_inbound {
            self.finish(resolution);
        }
        let timeout = self.options.admission_timeout;
        for outbound in forced_outbound {
            self.settle_outbound(
                outbound.request,
                RouteOutcome::Rejected(RejectReason::AdmissionTimeout),
                TransferState::TimedOut,
            );
            outbound.callback.send(Err(EvacuationError::TimedOut(timeout)));
        }

        self.complete_drain(progress, forced);
    }

    fn complete_drain(&mut self, progress: DrainProgress, forced: usize) {
        let report = DrainReport {
            completed: progress.started_with.saturating_sub(forced),
            forced,
        };
        slog::info!(self.logger, "Drain complete: {:?}", report);
        for waiter in progress.waiters {
            let _ = waiter.send(report);
        }
        self.drain_report = Some(report);
    }
}
