use crate::control::channel::{ChannelContext, Command};
use crate::control::codec::ProtocolViolation;
use crate::control::protocol::{CapacityReport, FromProxy, ProxyWork, Registration, ToProxy};
use crate::control::transport::{ControlError, ProxyConnector, ProxyLink};
use crate::events::BridgeEvent;
use crate::transfer::{RejectReason, RouteOutcome, RouteResult};
use crate::types::ServerStatus;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Registered,
    Draining,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) fn state_channel() -> (SessionStateNotifier, SessionStateListener) {
    let (snd, rcv) = watch::channel(SessionState::Disconnected);

    (SessionStateNotifier { snd }, SessionStateListener { rcv })
}

pub(crate) struct SessionStateNotifier {
    snd: watch::Sender<SessionState>,
}

impl SessionStateNotifier {
    /// Returns true when the state actually changed.
    pub(crate) fn notify_new_state(&self, new_state: SessionState) -> bool {
        let old_state = self.snd.send_replace(new_state);
        old_state != new_state
    }

    pub(crate) fn current(&self) -> SessionState {
        *self.snd.borrow()
    }
}

#[derive(Clone)]
pub struct SessionStateListener {
    rcv: watch::Receiver<SessionState>,
}

impl SessionStateListener {
    pub fn current(&self) -> SessionState {
        *self.rcv.borrow()
    }

    /// Waits for the next change. Intermediate states may be coalesced. `None` once the channel
    /// task is gone.
    pub async fn next(&mut self) -> Option<SessionState> {
        match self.rcv.changed().await {
            Ok(_) => Some(*self.rcv.borrow()),
            Err(_) => None,
        }
    }
}

pub(crate) enum SessionEnd {
    /// Local close. The channel will not reconnect.
    Closed,
    Failed(ControlError),
}

/// ControlSession is one registered connection to the proxy. The channel builds a fresh one for every
/// successful handshake and throws it away when the connection fails.
pub(crate) struct ControlSession {
    logger: slog::Logger,
    link: ProxyLink,
    last_received: Instant,
}

impl ControlSession {
    /// Connects and runs the registration handshake. Health probes that arrive before the ack are
    /// answered; anything else is out of sequence.
    pub(crate) async fn establish(
        logger: slog::Logger,
        connector: Arc<dyn ProxyConnector>,
        registration: Registration,
        registration_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<ControlSession, ControlError> {
        let mut link = connector.connect().await?;
        slog::debug!(logger, "Sending registration: {:?}", registration);
        send_with_timeout(&link.outbound, ToProxy::Register(registration), send_timeout).await?;

        let deadline = Instant::now() + registration_timeout;
        loop {
            let inbound = match tokio::time::timeout_at(deadline, link.inbound.recv()).await {
                Ok(inbound) => inbound,
                Err(_) => return Err(ControlError::RegistrationTimeout(registration_timeout)),
            };
            match inbound {
                Some(Ok(FromProxy::RegisterAck { accepted: true, .. })) => {
                    return Ok(ControlSession {
                        logger,
                        link,
                        last_received: Instant::now(),
                    });
                }
                Some(Ok(FromProxy::RegisterAck { accepted: false, reason })) => {
                    return Err(ControlError::RegistrationRejected(reason));
                }
                Some(Ok(FromProxy::HealthProbe { nonce })) => {
                    send_with_timeout(&link.outbound, ToProxy::HealthProbeAck { nonce }, send_timeout).await?;
                }
                Some(Ok(other)) => {
                    slog::warn!(logger, "Unexpected message before registration ack: {:?}", other);
                    return Err(ProtocolViolation::OutOfSequence(message_name(&other), "registering").into());
                }
                Some(Err(e)) => return Err(e),
                None => return Err(ControlError::LinkClosed),
            }
        }
    }

    /// Services the session until it fails or the bridge closes it.
    pub(crate) async fn run(mut self, ctx: &mut ChannelContext) -> SessionEnd {
        if let Err(e) = self.send_capacity_report(ctx).await {
            return SessionEnd::Failed(e);
        }

        let mut capacity_tick = tokio::time::interval_at(
            Instant::now() + ctx.options.heartbeat_interval,
            ctx.options.heartbeat_interval,
        );
        capacity_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let silence_timeout = ctx.options.proxy_silence_timeout;
        let cancel = ctx.cancel.clone();
        let mut registry_health = ctx.registry_health.clone();
        let mut health_open = true;

        loop {
            let silence_deadline = self.last_received + silence_timeout.unwrap_or(Duration::from_secs(0));
            let result = tokio::select! {
                inbound = self.link.inbound.recv() => match inbound {
                    Some(Ok(message)) => {
                        self.last_received = Instant::now();
                        self.handle_from_proxy(ctx, message).await
                    }
                    Some(Err(e)) => Err(e),
                    None => Err(ControlError::LinkClosed),
                },
                command = ctx.commands.recv() => match command {
                    Some(command) => self.handle_command(ctx, command).await,
                    // Every handle is gone.
                    None => {
                        ctx.closing = true;
                        Ok(())
                    }
                },
                _ = capacity_tick.tick() => self.send_capacity_report(ctx).await,
                // Tell the proxy right away when registry health flips.
                changed = registry_health.changed(), if health_open => match changed {
                    Ok(_) => self.send_capacity_report(ctx).await,
                    Err(_) => {
                        health_open = false;
                        Ok(())
                    }
                },
                _ = tokio::time::sleep_until(silence_deadline), if silence_timeout.is_some() => {
                    Err(ControlError::ProxySilent(silence_timeout.unwrap_or_default()))
                }
                _ = cancel.cancelled() => {
                    ctx.closing = true;
                    Ok(())
                }
            };

            if let Err(e) = result {
                return SessionEnd::Failed(e);
            }
            if ctx.closing {
                return self.close(ctx).await;
            }
        }
    }

    async fn handle_from_proxy(&mut self, ctx: &mut ChannelContext, message: FromProxy) -> Result<(), ControlError> {
        match message {
            FromProxy::HealthProbe { nonce } => {
                let timeout = ctx.options.probe_ack_timeout;
                match tokio::time::timeout(timeout, self.link.outbound.send(ToProxy::HealthProbeAck { nonce })).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(_)) => Err(ControlError::LinkClosed),
                    Err(_) => Err(ControlError::ProbeAckTimeout(timeout)),
                }
            }
            FromProxy::RouteDirective(directive) => {
                let request_id = directive.request_id.clone();
                match ctx.work.try_send(ProxyWork::Directive(directive)) {
                    Ok(_) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        slog::warn!(self.logger, "Transfer queue full. Rejecting {}", request_id);
                        self.send(
                            ctx,
                            ToProxy::RouteResult(RouteResult {
                                request_id,
                                outcome: RouteOutcome::Rejected(RejectReason::Overloaded),
                            }),
                        )
                        .await
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        slog::warn!(self.logger, "Transfer coordinator is gone. Rejecting {}", request_id);
                        self.send(
                            ctx,
                            ToProxy::RouteResult(RouteResult {
                                request_id,
                                outcome: RouteOutcome::Rejected(RejectReason::Draining),
                            }),
                        )
                        .await
                    }
                }
            }
            FromProxy::RouteResult(result) => {
                if let Err(e) = ctx.work.try_send(ProxyWork::OutboundResult(result)) {
                    slog::warn!(self.logger, "Dropping outbound transfer result: {}", e);
                }
                Ok(())
            }
            FromProxy::Drain { reason } => {
                slog::info!(self.logger, "Proxy requested drain: {}", reason);
                ctx.draining = true;
                ctx.events.publish(BridgeEvent::ProxyRequestedDrain { reason });
                ctx.set_state(SessionState::Draining);
                Ok(())
            }
            FromProxy::RegisterAck { .. } => {
                Err(ProtocolViolation::OutOfSequence("RegisterAck", "registered").into())
            }
        }
    }

    async fn handle_command(&mut self, ctx: &mut ChannelContext, command: Command) -> Result<(), ControlError> {
        match command {
            Command::SendRouteResult(result) => self.send(ctx, ToProxy::RouteResult(result)).await,
            Command::SendRouteDirective(directive, done) => {
                let result = self.send(ctx, ToProxy::RouteDirective(directive)).await;
                let _ = done.send(result.clone());
                result
            }
            Command::Drain(done) => {
                ctx.draining = true;
                ctx.set_state(SessionState::Draining);
                let send_result = self.send_capacity_report(ctx).await;
                let _ = done.send(());
                send_result
            }
            Command::Close(done) => {
                ctx.close_waiters.push(done);
                ctx.closing = true;
                Ok(())
            }
        }
    }

    async fn close(mut self, ctx: &mut ChannelContext) -> SessionEnd {
        let deregister = ToProxy::Deregister {
            server_id: ctx.identity.server_id.clone(),
        };
        if let Err(e) = self.send(ctx, deregister).await {
            slog::warn!(self.logger, "Failed to deregister from proxy: {}", e);
        }
        self.link.inbound.close();
        SessionEnd::Closed
    }

    async fn send_capacity_report(&mut self, ctx: &mut ChannelContext) -> Result<(), ControlError> {
        let snapshot = ctx.capacity.snapshot();
        let status = if ctx.draining || !*ctx.registry_health.borrow() {
            ServerStatus::Draining
        } else {
            ServerStatus::Live
        };
        let report = CapacityReport {
            server_id: ctx.identity.server_id.clone(),
            current_player_count: snapshot.connected,
            load: snapshot.load(),
            status,
        };
        self.send(ctx, ToProxy::Heartbeat(report)).await
    }

    async fn send(&mut self, ctx: &ChannelContext, message: ToProxy) -> Result<(), ControlError> {
        send_with_timeout(&self.link.outbound, message, ctx.options.probe_ack_timeout).await
    }
}

async fn send_with_timeout(
    outbound: &mpsc::Sender<ToProxy>,
    message: ToProxy,
    timeout: Duration,
) -> Result<(), ControlError> {
    match tokio::time::timeout(timeout, outbound.send(message)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(ControlError::LinkClosed),
        Err(_) => Err(ControlError::SendTimeout(timeout)),
    }
}

fn message_name(message: &FromProxy) -> &'static str {
    match message {
        FromProxy::RegisterAck { .. } => "RegisterAck",
        FromProxy::RouteDirective(_) => "RouteDirective",
        FromProxy::HealthProbe { .. } => "HealthProbe",
        FromProxy::RouteResult(_) => "RouteResult",
        FromProxy::Drain { .. } => "DrainRequest",
    }
}
