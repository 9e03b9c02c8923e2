mod channel;
mod codec;
mod grpc;
mod protocol;
mod session;
#[cfg(test)]
mod test_utils;
mod transport;

#[cfg(test)]
pub(crate) use channel::Command;
pub use channel::ControlHandle;
pub use channel::ControlOptions;
pub(crate) use channel::spawn_control_channel;
pub use codec::decode_proxy_message;
pub use codec::decode_server_message;
pub use codec::encode_proxy_message;
pub use codec::encode_server_message;
pub use codec::ProtocolViolation;
pub use grpc::GrpcConnector;
pub use protocol::CapacityReport;
pub use protocol::FromProxy;
pub use protocol::ProxyWork;
pub use protocol::Registration;
pub use protocol::ToProxy;
pub use session::SessionState;
pub use session::SessionStateListener;
#[cfg(test)]
pub(crate) use session::state_channel;
#[cfg(test)]
pub(crate) use session::SessionStateNotifier;
pub use transport::ControlError;
pub use transport::ErrorKind;
pub use transport::ProxyConnector;
pub use transport::ProxyLink;
