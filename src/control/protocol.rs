use crate::transfer::{RouteDirective, RouteResult};
use crate::types::{ServerId, ServerStatus};

/// Domain view of the control protocol. The wire encoding lives in `codec`.
#[derive(Clone, Debug, PartialEq)]
pub enum ToProxy {
    Register(Registration),
    Heartbeat(CapacityReport),
    RouteResult(RouteResult),
    HealthProbeAck { nonce: u64 },
    Deregister { server_id: ServerId },
    /// Outbound transfer of one of our players.
    RouteDirective(RouteDirective),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FromProxy {
    RegisterAck { accepted: bool, reason: String },
    RouteDirective(RouteDirective),
    HealthProbe { nonce: u64 },
    /// Answer to a directive we sent.
    RouteResult(RouteResult),
    Drain { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Registration {
    pub server_id: ServerId,
    pub address: String,
    pub max_capacity: u32,
    pub version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CapacityReport {
    pub server_id: ServerId,
    pub current_player_count: u32,
    pub load: f64,
    pub status: ServerStatus,
}

/// Work the control channel hands to the transfer coordinator.
#[derive(Debug)]
pub enum ProxyWork {
    Directive(RouteDirective),
    OutboundResult(RouteResult),
}
