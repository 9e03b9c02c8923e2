mod publisher;
mod status;

pub use publisher::HeartbeatHandle;
pub use publisher::HeartbeatOptions;
pub(crate) use publisher::spawn_heartbeat;
pub use status::derive_status;
