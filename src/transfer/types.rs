use crate::types::{PlayerId, RequestId, ServerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// "Route player X to server Y". Arrives from the proxy, or is sent to it when evacuating.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteDirective {
    pub request_id: RequestId,
    pub player_id: PlayerId,
    pub target_server_id: ServerId,
    pub source_server_id: Option<ServerId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteResult {
    pub request_id: RequestId,
    pub outcome: RouteOutcome,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RouteOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl RouteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RouteOutcome::Accepted)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RejectReason {
    CapacityExceeded,
    /// The engine refused the player, e.g. banned or invalid.
    EngineDenied(String),
    DuplicateRequest,
    AdmissionTimeout,
    Draining,
    WrongTarget,
    Overloaded,
}

impl RejectReason {
    /// Stable wire code. `EngineDenied` carries the engine's reason after a colon.
    pub fn as_code(&self) -> String {
        match self {
            RejectReason::CapacityExceeded => "capacity_exceeded".into(),
            RejectReason::EngineDenied(reason) if reason.is_empty() => "engine_denied".into(),
            RejectReason::EngineDenied(reason) => format!("engine_denied:{}", reason),
            RejectReason::DuplicateRequest => "duplicate_request".into(),
            RejectReason::AdmissionTimeout => "admission_timeout".into(),
            RejectReason::Draining => "draining".into(),
            RejectReason::WrongTarget => "wrong_target".into(),
            RejectReason::Overloaded => "overloaded".into(),
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let (head, detail) = match code.find(':') {
            Some(idx) => (&code[..idx], &code[idx + 1..]),
            None => (code, ""),
        };
        let reason = match head {
            "capacity_exceeded" => RejectReason::CapacityExceeded,
            "engine_denied" => RejectReason::EngineDenied(detail.to_string()),
            "duplicate_request" => RejectReason::DuplicateRequest,
            "admission_timeout" => RejectReason::AdmissionTimeout,
            "draining" => RejectReason::Draining,
            "wrong_target" => RejectReason::WrongTarget,
            "overloaded" => RejectReason::Overloaded,
            _ => return None,
        };
        Some(reason)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_code())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Accepted,
    Rejected,
    TimedOut,
}

/// One transfer as tracked by the coordinator, inbound or outbound.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub request_id: RequestId,
    pub player_id: PlayerId,
    pub source_server_id: Option<ServerId>,
    pub target_server_id: ServerId,
    pub issued_at: DateTime<Utc>,
    pub state: TransferState,
}

impl TransferRequest {
    pub fn from_directive(directive: &RouteDirective) -> Self {
        TransferRequest {
            request_id: directive.request_id.clone(),
            player_id: directive.player_id.clone(),
            source_server_id: directive.source_server_id.clone(),
            target_server_id: directive.target_server_id.clone(),
            issued_at: Utc::now(),
            state: TransferState::Pending,
        }
    }
}

/// Written to `fleet:transfer:{requestId}` once a transfer resolves.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAudit {
    pub request_id: RequestId,
    pub player_id: PlayerId,
    pub source_server_id: Option<ServerId>,
    pub target_server_id: ServerId,
    pub issued_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub state: TransferState,
    pub reject_reason: Option<String>,
    pub recorded_by: ServerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_codes() {
        assert_eq!(RejectReason::AdmissionTimeout.as_code(), "admission_timeout");
        assert_eq!(
            RejectReason::from_code("engine_denied:banned"),
            Some(RejectReason::EngineDenied("banned".into()))
        );
        assert_eq!(RejectReason::EngineDenied(String::new()).as_code(), "engine_denied");
        assert_eq!(RejectReason::from_code("overloaded"), Some(RejectReason::Overloaded));
        assert_eq!(RejectReason::from_code("nope"), None);
    }
}
