use crate::backoff::BackoffPolicy;
use crate::capacity::CapacityTracker;
use crate::control::protocol::{ProxyWork, Registration};
use crate::control::session::{self, ControlSession, SessionEnd, SessionState, SessionStateListener, SessionStateNotifier};
use crate::control::transport::{ControlError, ProxyConnector};
use crate::events::{BridgeEvent, EventBus};
use crate::transfer::{RouteDirective, RouteResult};
use crate::types::ServerIdentity;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ControlOptions {
    /// Cadence of capacity reports.
    pub heartbeat_interval: Duration,
    pub registration_timeout: Duration,
    /// Also bounds every other send on the link.
    pub probe_ack_timeout: Duration,
    pub proxy_silence_timeout: Option<Duration>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug)]
pub(crate) enum Command {
    SendRouteResult(RouteResult),
    SendRouteDirective(RouteDirective, oneshot::Sender<Result<(), ControlError>>),
    Drain(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// State shared by the channel supervisor and whichever session is currently live.
pub(crate) struct ChannelContext {
    pub(crate) logger: slog::Logger,
    pub(crate) identity: ServerIdentity,
    pub(crate) capacity: CapacityTracker,
    pub(crate) options: ControlOptions,
    pub(crate) work: mpsc::Sender<ProxyWork>,
    pub(crate) events: EventBus,
    /// While false the proxy is told we are Draining.
    pub(crate) registry_health: watch::Receiver<bool>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) cancel: CancellationToken,
    pub(crate) draining: bool,
    pub(crate) closing: bool,
    pub(crate) close_waiters: Vec<oneshot::Sender<()>>,
    notifier: SessionStateNotifier,
}

impl ChannelContext {
    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.notifier.current();
        if self.notifier.notify_new_state(state) {
            slog::info!(self.logger, "Control session {} -> {}", previous, state);
            self.events.publish(BridgeEvent::SessionStateChanged(state));
        }
    }

    // Commands that arrive while there is no registered session.
    fn handle_offline_command(&mut self, command: Command) {
        match command {
            Command::SendRouteResult(result) => {
                // The proxy retries with the same request id and will get the cached outcome.
                slog::debug!(self.logger, "Not connected. Dropping result for {}", result.request_id);
            }
            Command::SendRouteDirective(_, done) => {
                let _ = done.send(Err(ControlError::NotConnected));
            }
            Command::Drain(done) => {
                self.draining = true;
                let _ = done.send(());
            }
            Command::Close(done) => {
                self.close_waiters.push(done);
                self.closing = true;
            }
        }
    }
}

/// ControlHandle is how the rest of the bridge talks to the control channel task.
#[derive(Clone)]
pub struct ControlHandle {
    sender: mpsc::UnboundedSender<Command>,
    state: SessionStateListener,
}

impl ControlHandle {
    /// Fire-and-forget. Results for a session that is gone are dropped.
    pub fn send_route_result(&self, result: RouteResult) {
        let _ = self.sender.send(Command::SendRouteResult(result));
    }

    /// Hands a directive to the proxy. Succeeds once it is on the wire, not once the proxy answers.
    pub async fn send_route_directive(&self, directive: RouteDirective) -> Result<(), ControlError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Command::SendRouteDirective(directive, tx))
            .map_err(|_| ControlError::NotConnected)?;
        rx.await.unwrap_or(Err(ControlError::NotConnected))
    }

    /// Moves the session to Draining. Sticky across reconnects.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Drain(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Deregisters and stops the channel for good.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn state_listener(&self) -> SessionStateListener {
        self.state.clone()
    }
}

#[cfg(test)]
impl ControlHandle {
    /// A handle with no channel task behind it. The test plays the channel's part.
    pub(crate) fn detached(state: SessionStateListener) -> (ControlHandle, mpsc::UnboundedReceiver<Command>) {
        let (sender, commands) = mpsc::unbounded_channel();
        (ControlHandle { sender, state }, commands)
    }
}

pub(crate) fn spawn_control_channel(
    logger: slog::Logger,
    identity: ServerIdentity,
    capacity: CapacityTracker,
    options: ControlOptions,
    connector: Arc<dyn ProxyConnector>,
    work: mpsc::Sender<ProxyWork>,
    events: EventBus,
    registry_health: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> ControlHandle {
    let (sender, commands) = mpsc::unbounded_channel();
    let (notifier, listener) = session::state_channel();

    let channel = ControlChannel {
        connector,
        ctx: ChannelContext {
            logger,
            identity,
            capacity,
            options,
            work,
            events,
            registry_health,
            commands,
            cancel,
            draining: false,
            closing: false,
            close_waiters: Vec::new(),
            notifier,
        },
    };
    tokio::spawn(channel.run());

    ControlHandle {
        sender,
        state: listener,
    }
}

/// ControlChannel supervises sessions: connect, register, serve, and on failure back off and start
/// over with a new session.
struct ControlChannel {
    connector: Arc<dyn ProxyConnector>,
    ctx: ChannelContext,
}

impl ControlChannel {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut session_number: u64 = 0;

        while !self.ctx.closing {
            self.ctx.set_state(SessionState::Connecting);
            session_number += 1;
            let logger = self.ctx.logger.new(slog::o!("session" => session_number));

            let establish = ControlSession::establish(
                logger.clone(),
                self.connector.clone(),
                self.registration(),
                self.ctx.options.registration_timeout,
                self.ctx.options.probe_ack_timeout,
            );
            let established = match self.serve_commands_until(establish).await {
                Some(established) => established,
                None => break,
            };

            match established {
                Ok(session) => {
                    attempt = 0;
                    if self.ctx.draining {
                        self.ctx.set_state(SessionState::Draining);
                    } else {
                        self.ctx.set_state(SessionState::Registered);
                    }
                    match session.run(&mut self.ctx).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Failed(e) => {
                            slog::warn!(logger, "Control session failed ({:?}): {}", e.kind(), e);
                        }
                    }
                }
                Err(e) => {
                    slog::warn!(logger, "Failed to establish control session ({:?}): {}", e.kind(), e);
                }
            }

            if self.ctx.closing {
                break;
            }
            self.ctx.set_state(SessionState::Disconnected);

            let delay = self.ctx.options.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            slog::info!(self.ctx.logger, "Reconnecting to proxy in {:?}", delay);
            if self.serve_commands_until(tokio::time::sleep(delay)).await.is_none() {
                break;
            }
        }

        self.ctx.set_state(SessionState::Closed);
        for waiter in self.ctx.close_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Drives `future` while answering commands that do not need a session. `None` means the
    /// channel was closed in the meantime.
    async fn serve_commands_until<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return Some(output),
                command = self.ctx.commands.recv() => match command {
                    Some(command) => self.ctx.handle_offline_command(command),
                    None => self.ctx.closing = true,
                },
                _ = self.ctx.cancel.cancelled() => self.ctx.closing = true,
            }
            if self.ctx.closing {
                return None;
            }
        }
    }

    fn registration(&self) -> Registration {
        Registration {
            server_id: self.ctx.identity.server_id.clone(),
            address: self.ctx.identity.address.clone(),
            max_capacity: self.ctx.identity.max_capacity,
            version: self.ctx.identity.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::protocol::{FromProxy, ToProxy};
    use crate::control::test_utils::FakeConnector;
    use crate::transfer::{RejectReason, RouteOutcome};
    use crate::types::{PlayerId, RequestId, ServerId, ServerStatus};

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn identity() -> ServerIdentity {
        ServerIdentity {
            server_id: ServerId::new("s-1"),
            address: "10.0.0.1:25565".into(),
            max_capacity: 10,
            version: "1.0".into(),
        }
    }

    fn options() -> ControlOptions {
        ControlOptions {
            heartbeat_interval: Duration::from_millis(500),
            registration_timeout: Duration::from_secs(1),
            probe_ack_timeout: Duration::from_millis(200),
            proxy_silence_timeout: None,
            backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(400)),
        }
    }

    struct Harness {
        handle: ControlHandle,
        connector: Arc<FakeConnector>,
        work: mpsc::Receiver<ProxyWork>,
        capacity: CapacityTracker,
        events: EventBus,
        registry_health: watch::Sender<bool>,
    }

    fn start(link_buffer: usize, work_capacity: usize) -> Harness {
        start_with(options(), link_buffer, work_capacity)
    }

    fn start_with(options: ControlOptions, link_buffer: usize, work_capacity: usize) -> Harness {
        let connector = Arc::new(FakeConnector::new(link_buffer));
        let (work_tx, work_rx) = mpsc::channel(work_capacity);
        let capacity = CapacityTracker::new(10);
        let events = EventBus::new(64);
        let (health_tx, health_rx) = watch::channel(true);
        let handle = spawn_control_channel(
            test_logger(),
            identity(),
            capacity.clone(),
            options,
            connector.clone(),
            work_tx,
            events.clone(),
            health_rx,
            CancellationToken::new(),
        );

        Harness {
            handle,
            connector,
            work: work_rx,
            capacity,
            events,
            registry_health: health_tx,
        }
    }

    async fn wait_for_state(listener: &mut SessionStateListener, expected: SessionState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while listener.current() != expected {
                listener.next().await.expect("Channel task is gone");
            }
        })
        .await
        .expect("Timed out waiting for session state");
    }

    fn directive(request_id: &str, player: &str) -> RouteDirective {
        RouteDirective {
            request_id: RequestId::new(request_id),
            player_id: PlayerId::new(player),
            target_server_id: ServerId::new("s-1"),
            source_server_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn registers_then_reports_capacity() {
        let mut harness = start(16, 8);
        harness.capacity.set_connected(4);
        let mut proxy = harness.connector.next_link().await;

        let registration = proxy.expect_register().await;
        assert_eq!(registration.server_id, ServerId::new("s-1"));
        assert_eq!(registration.max_capacity, 10);

        proxy.accept_registration().await;
        wait_for_state(&mut harness.handle.state_listener(), SessionState::Registered).await;

        match proxy.recv().await {
            ToProxy::Heartbeat(report) => {
                assert_eq!(report.current_player_count, 4);
                assert_eq!(report.load, 0.4);
                assert_eq!(report.status, ServerStatus::Live);
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        // Another report follows on the heartbeat cadence.
        assert!(matches!(proxy.recv().await, ToProxy::Heartbeat(_)));
        drop(harness.work);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_probe_forces_reconnect_with_fresh_registration() {
        // One slot: the first capacity report fills it and the proxy never drains it.
        let harness = start(1, 8);
        let mut listener = harness.handle.state_listener();
        let mut proxy = harness.connector.next_link().await;

        proxy.expect_register().await;
        proxy.accept_registration().await;
        wait_for_state(&mut listener, SessionState::Registered).await;

        proxy.send(FromProxy::HealthProbe { nonce: 7 }).await;
        wait_for_state(&mut listener, SessionState::Disconnected).await;

        let mut second = harness.connector.next_link().await;
        let registration = second.expect_register().await;
        assert_eq!(registration.server_id, ServerId::new("s-1"));
        second.accept_registration().await;
        wait_for_state(&mut listener, SessionState::Registered).await;
    }

    #[tokio::test(start_paused = true)]
    async fn answered_probe_echoes_nonce() {
        let harness = start(16, 8);
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;

        proxy.send(FromProxy::HealthProbe { nonce: 42 }).await;
        loop {
            match proxy.recv().await {
                ToProxy::HealthProbeAck { nonce } => {
                    assert_eq!(nonce, 42);
                    break;
                }
                ToProxy::Heartbeat(_) => continue,
                other => panic!("Unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_registration_is_retried() {
        let harness = start(16, 8);
        let mut listener = harness.handle.state_listener();

        let mut first = harness.connector.next_link().await;
        first.expect_register().await;
        first
            .send(FromProxy::RegisterAck {
                accepted: false,
                reason: "maintenance".into(),
            })
            .await;

        let mut second = harness.connector.next_link().await;
        second.expect_register().await;
        second.accept_registration().await;
        wait_for_state(&mut listener, SessionState::Registered).await;
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_sequence_message_resets_session() {
        let harness = start(16, 8);
        let mut first = harness.connector.next_link().await;
        first.expect_register().await;
        first.send(FromProxy::RouteDirective(directive("r-1", "p-1"))).await;

        let mut second = harness.connector.next_link().await;
        second.expect_register().await;
    }

    #[tokio::test(start_paused = true)]
    async fn directives_go_to_work_queue_and_overflow_is_rejected() {
        let mut harness = start(16, 1);
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;

        proxy.send(FromProxy::RouteDirective(directive("r-1", "p-1"))).await;
        proxy.send(FromProxy::RouteDirective(directive("r-2", "p-2"))).await;

        loop {
            match proxy.recv().await {
                ToProxy::RouteResult(result) => {
                    assert_eq!(result.request_id, RequestId::new("r-2"));
                    assert_eq!(result.outcome, RouteOutcome::Rejected(RejectReason::Overloaded));
                    break;
                }
                ToProxy::Heartbeat(_) => continue,
                other => panic!("Unexpected message: {:?}", other),
            }
        }

        match harness.work.recv().await {
            Some(ProxyWork::Directive(queued)) => assert_eq!(queued.request_id, RequestId::new("r-1")),
            other => panic!("Unexpected work: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_drain_is_sticky_across_reconnects() {
        let harness = start(16, 8);
        let mut events = harness.events.listener();
        let mut listener = harness.handle.state_listener();
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;

        proxy.send(FromProxy::Drain { reason: "rolling update".into() }).await;
        wait_for_state(&mut listener, SessionState::Draining).await;

        loop {
            match events.next().await {
                Some(BridgeEvent::ProxyRequestedDrain { reason }) => {
                    assert_eq!(reason, "rolling update");
                    break;
                }
                Some(_) => continue,
                None => panic!("Event bus closed"),
            }
        }

        // Break the link; the new session comes back as Draining.
        drop(proxy);
        let mut second = harness.connector.next_link().await;
        second.expect_register().await;
        second.accept_registration().await;
        wait_for_state(&mut listener, SessionState::Draining).await;
        match second.recv().await {
            ToProxy::Heartbeat(report) => assert_eq!(report.status, ServerStatus::Draining),
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn close_deregisters() {
        let harness = start(16, 8);
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;
        wait_for_state(&mut harness.handle.state_listener(), SessionState::Registered).await;

        harness.handle.close().await;
        assert_eq!(harness.handle.state(), SessionState::Closed);

        loop {
            match proxy.recv().await {
                ToProxy::Deregister { server_id } => {
                    assert_eq!(server_id, ServerId::new("s-1"));
                    break;
                }
                ToProxy::Heartbeat(_) => continue,
                other => panic!("Unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_directive_without_session_fails_fast() {
        let harness = start(16, 8);
        // Never answer the connect attempt's registration.
        let _proxy = harness.connector.next_link().await;

        let result = harness.handle.send_route_directive(directive("r-1", "p-1")).await;
        assert!(matches!(result, Err(ControlError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_proxy_forces_reconnect_with_fresh_registration() {
        let harness = start_with(
            ControlOptions {
                proxy_silence_timeout: Some(Duration::from_millis(300)),
                ..options()
            },
            16,
            8,
        );
        let mut listener = harness.handle.state_listener();
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;
        wait_for_state(&mut listener, SessionState::Registered).await;

        // The proxy never says anything after the ack.
        wait_for_state(&mut listener, SessionState::Disconnected).await;

        let mut second = harness.connector.next_link().await;
        let registration = second.expect_register().await;
        assert_eq!(registration.server_id, ServerId::new("s-1"));
        drop(proxy);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_registry_is_reported_as_draining() {
        let harness = start(16, 8);
        let mut proxy = harness.connector.next_link().await;
        proxy.expect_register().await;
        proxy.accept_registration().await;
        match proxy.recv().await {
            ToProxy::Heartbeat(report) => assert_eq!(report.status, ServerStatus::Live),
            other => panic!("Unexpected message: {:?}", other),
        }

        harness.registry_health.send_replace(false);
        match proxy.recv().await {
            ToProxy::Heartbeat(report) => assert_eq!(report.status, ServerStatus::Draining),
            other => panic!("Unexpected message: {:?}", other),
        }
        // The session itself stays registered.
        assert_eq!(harness.handle.state(), SessionState::Registered);

        harness.registry_health.send_replace(true);
        match proxy.recv().await {
            ToProxy::Heartbeat(report) => assert_eq!(report.status, ServerStatus::Live),
            other => panic!("Unexpected message: {:?}", other),
        }
    }
}
