use crate::control::codec::ProtocolViolation;
use crate::control::protocol::{FromProxy, ToProxy};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// ProxyConnector opens one bidirectional session with the proxy. Each call yields a brand new
/// link; nothing is shared between links.
#[async_trait::async_trait]
pub trait ProxyConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<ProxyLink, ControlError>;
}

/// Both halves of a live session. Dropping the link tears the session down.
pub struct ProxyLink {
    pub outbound: mpsc::Sender<ToProxy>,
    /// Ends with `None` (or an `Err`) once the transport is gone.
    pub inbound: mpsc::Receiver<Result<FromProxy, ControlError>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    TransientNetwork,
    ProtocolViolation,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("Failed to connect to proxy: {0}")]
    Connect(String),
    #[error("Proxy transport failure: {0}")]
    Transport(String),
    #[error("Proxy link closed")]
    LinkClosed,
    #[error("Timed out after {0:?} sending to proxy")]
    SendTimeout(Duration),
    #[error("Proxy did not acknowledge registration within {0:?}")]
    RegistrationTimeout(Duration),
    #[error("Proxy rejected registration: {0}")]
    RegistrationRejected(String),
    #[error("Could not answer health probe within {0:?}")]
    ProbeAckTimeout(Duration),
    #[error("Nothing received from proxy for {0:?}")]
    ProxySilent(Duration),
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("No registered session with the proxy")]
    NotConnected,
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Protocol(_) => ErrorKind::ProtocolViolation,
            _ => ErrorKind::TransientNetwork,
        }
    }
}
