use crate::control::protocol::{CapacityReport, FromProxy, Registration, ToProxy};
use crate::proto;
use crate::proto::proxy_message::Msg as ProxyMsg;
use crate::proto::server_message::Msg as ServerMsg;
use crate::transfer::{RejectReason, RouteDirective, RouteOutcome, RouteResult};
use crate::types::{PlayerId, RequestId, ServerId, ServerStatus};

/// A proxy message that cannot be mapped onto the domain protocol.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Proxy message had no payload")]
    MissingPayload,
    #[error("Proxy message field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("Unknown reject code '{0}'")]
    UnknownRejectCode(String),
    #[error("Unknown server status '{0}'")]
    UnknownStatus(String),
    #[error("Unexpected {0} while {1}")]
    OutOfSequence(&'static str, &'static str),
}

pub fn encode_server_message(message: ToProxy) -> proto::ServerMessage {
    let msg = match message {
        ToProxy::Register(registration) => ServerMsg::Register(convert_registration(registration)),
        ToProxy::Heartbeat(report) => ServerMsg::Heartbeat(convert_capacity_report(report)),
        ToProxy::RouteResult(result) => ServerMsg::RouteResult(convert_route_result(result)),
        ToProxy::HealthProbeAck { nonce } => ServerMsg::HealthProbeAck(proto::HealthProbeAck { nonce }),
        ToProxy::Deregister { server_id } => ServerMsg::Deregister(proto::Deregister {
            server_id: server_id.into_inner(),
        }),
        ToProxy::RouteDirective(directive) => ServerMsg::RouteDirective(convert_route_directive(directive)),
    };

    proto::ServerMessage { msg: Some(msg) }
}

pub fn decode_proxy_message(message: proto::ProxyMessage) -> Result<FromProxy, ProtocolViolation> {
    match message.msg.ok_or(ProtocolViolation::MissingPayload)? {
        ProxyMsg::RegisterAck(ack) => Ok(FromProxy::RegisterAck {
            accepted: ack.accepted,
            reason: ack.reason,
        }),
        ProxyMsg::RouteDirective(directive) => Ok(FromProxy::RouteDirective(parse_route_directive(directive)?)),
        ProxyMsg::HealthProbe(probe) => Ok(FromProxy::HealthProbe { nonce: probe.nonce }),
        ProxyMsg::RouteResult(result) => Ok(FromProxy::RouteResult(parse_route_result(result)?)),
        ProxyMsg::Drain(drain) => Ok(FromProxy::Drain { reason: drain.reason }),
    }
}

/// Server-side decoding, used by proxy implementations and test doubles.
pub fn decode_server_message(message: proto::ServerMessage) -> Result<ToProxy, ProtocolViolation> {
    match message.msg.ok_or(ProtocolViolation::MissingPayload)? {
        ServerMsg::Register(register) => Ok(ToProxy::Register(Registration {
            server_id: ServerId::new(non_empty(register.server_id, "server_id")?),
            address: non_empty(register.address, "address")?,
            max_capacity: register.max_capacity,
            version: register.version,
        })),
        ServerMsg::Heartbeat(heartbeat) => {
            let status = match ServerStatus::parse(&heartbeat.status) {
                Some(status) => status,
                None => return Err(ProtocolViolation::UnknownStatus(heartbeat.status)),
            };
            Ok(ToProxy::Heartbeat(CapacityReport {
                server_id: ServerId::new(non_empty(heartbeat.server_id, "server_id")?),
                current_player_count: heartbeat.current_player_count,
                load: heartbeat.load,
                status,
            }))
        }
        ServerMsg::RouteResult(result) => Ok(ToProxy::RouteResult(parse_route_result(result)?)),
        ServerMsg::HealthProbeAck(ack) => Ok(ToProxy::HealthProbeAck { nonce: ack.nonce }),
        ServerMsg::Deregister(deregister) => Ok(ToProxy::Deregister {
            server_id: ServerId::new(non_empty(deregister.server_id, "server_id")?),
        }),
        ServerMsg::RouteDirective(directive) => Ok(ToProxy::RouteDirective(parse_route_directive(directive)?)),
    }
}

/// Proxy-side encoding, used by proxy implementations and test doubles.
pub fn encode_proxy_message(message: FromProxy) -> proto::ProxyMessage {
    let msg = match message {
        FromProxy::RegisterAck { accepted, reason } => ProxyMsg::RegisterAck(proto::RegisterAck { accepted, reason }),
        FromProxy::RouteDirective(directive) => ProxyMsg::RouteDirective(convert_route_directive(directive)),
        FromProxy::HealthProbe { nonce } => ProxyMsg::HealthProbe(proto::HealthProbe { nonce }),
        FromProxy::RouteResult(result) => ProxyMsg::RouteResult(convert_route_result(result)),
        FromProxy::Drain { reason } => ProxyMsg::Drain(proto::DrainRequest { reason }),
    };

    proto::ProxyMessage { msg: Some(msg) }
}

fn convert_registration(registration: Registration) -> proto::RegisterServer {
    proto::RegisterServer {
        server_id: registration.server_id.into_inner(),
        address: registration.address,
        max_capacity: registration.max_capacity,
        version: registration.version,
    }
}

fn convert_capacity_report(report: CapacityReport) -> proto::Heartbeat {
    proto::Heartbeat {
        server_id: report.server_id.into_inner(),
        current_player_count: report.current_player_count,
        load: report.load,
        status: report.status.as_str().to_string(),
    }
}

fn convert_route_result(result: RouteResult) -> proto::RouteResult {
    let (accepted, reject_reason) = match result.outcome {
        RouteOutcome::Accepted => (true, String::new()),
        RouteOutcome::Rejected(reason) => (false, reason.as_code()),
    };

    proto::RouteResult {
        request_id: result.request_id.as_str().to_string(),
        accepted,
        reject_reason,
    }
}

fn convert_route_directive(directive: RouteDirective) -> proto::RouteDirective {
    proto::RouteDirective {
        request_id: directive.request_id.as_str().to_string(),
        player_id: directive.player_id.as_str().to_string(),
        target_server_id: directive.target_server_id.into_inner(),
        source_server_id: directive
            .source_server_id
            .map(ServerId::into_inner)
            .unwrap_or_default(),
    }
}

fn parse_route_directive(directive: proto::RouteDirective) -> Result<RouteDirective, ProtocolViolation> {
    let source_server_id = if directive.source_server_id.is_empty() {
        None
    } else {
        Some(ServerId::new(directive.source_server_id))
    };

    Ok(RouteDirective {
        request_id: RequestId::new(non_empty(directive.request_id, "request_id")?),
        player_id: PlayerId::new(non_empty(directive.player_id, "player_id")?),
        target_server_id: ServerId::new(non_empty(directive.target_server_id, "target_server_id")?),
        source_server_id,
    })
}

fn parse_route_result(result: proto::RouteResult) -> Result<RouteResult, ProtocolViolation> {
    let outcome = if result.accepted {
        RouteOutcome::Accepted
    } else {
        match RejectReason::from_code(&result.reject_reason) {
            Some(reason) => RouteOutcome::Rejected(reason),
            None => return Err(ProtocolViolation::UnknownRejectCode(result.reject_reason)),
        }
    };
    let request_id = RequestId::new(non_empty(result.request_id, "request_id")?);

    Ok(RouteResult { request_id, outcome })
}

fn non_empty(value: String, field: &'static str) -> Result<String, ProtocolViolation> {
    if value.is_empty() {
        Err(ProtocolViolation::EmptyField(field))
    } else {
        Ok(value)
    }
}
