mod backoff;
mod bridge;
mod capacity;
mod config;
mod control;
mod events;
mod fleet;
mod heartbeat;
mod logging;
mod registry;
mod transfer;
mod types;
mod proto {
    include!("../generated/fleet.rs");
}

pub use backoff::BackoffPolicy;
pub use bridge::start_bridge;
pub use bridge::BridgeStartError;
pub use bridge::FleetBridge;
pub use bridge::ShutdownReport;
pub use capacity::CapacitySnapshot;
pub use capacity::CapacityTracker;
pub use config::AddressSource;
pub use config::BridgeConfig;
pub use config::BridgeOptions;
pub use config::ConfigError;
pub use control::decode_proxy_message;
pub use control::decode_server_message;
pub use control::encode_proxy_message;
pub use control::encode_server_message;
pub use control::CapacityReport;
pub use control::ControlError;
pub use control::ErrorKind;
pub use control::FromProxy;
pub use control::GrpcConnector;
pub use control::ProtocolViolation;
pub use control::ProxyConnector;
pub use control::ProxyLink;
pub use control::Registration;
pub use control::SessionState;
pub use control::SessionStateListener;
pub use control::ToProxy;
pub use events::BridgeEvent;
pub use events::BridgeEventListener;
pub use fleet::AggregateLoad;
pub use fleet::FleetSnapshot;
pub use fleet::FleetView;
pub use fleet::FleetViewHandle;
pub use heartbeat::derive_status;
pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use logging::parse_level;
pub use proto::fleet_control_server::FleetControl;
pub use proto::fleet_control_server::FleetControlServer;
pub use proto::ProxyMessage;
pub use proto::ServerMessage;
pub use registry::server_key;
pub use registry::transfer_key;
pub use registry::EventSubscription;
pub use registry::InMemoryStore;
pub use registry::RedisEndpoint;
pub use registry::RedisStore;
pub use registry::RegistryClient;
pub use registry::RegistryStore;
pub use registry::StoreError;
pub use registry::Subscription;
pub use registry::SubscriptionEvent;
pub use registry::EVENTS_CHANNEL;
pub use registry::SERVER_KEY_PREFIX;
pub use transfer::AdmissionDecision;
pub use transfer::CoordinatorHandle;
pub use transfer::DrainReport;
pub use transfer::EvacuationError;
pub use transfer::GameEngine;
pub use transfer::RejectReason;
pub use transfer::RouteDirective;
pub use transfer::RouteOutcome;
pub use transfer::RouteResult;
pub use transfer::TransferAudit;
pub use transfer::TransferRequest;
pub use transfer::TransferState;
pub use types::FleetEvent;
pub use types::PlayerId;
pub use types::RequestId;
pub use types::ServerId;
pub use types::ServerIdentity;
pub use types::ServerRecord;
pub use types::ServerStatus;
