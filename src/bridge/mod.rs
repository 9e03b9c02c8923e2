mod handle;
mod wiring;

pub use handle::FleetBridge;
pub use handle::ShutdownReport;
pub use wiring::start_bridge;
pub use wiring::BridgeStartError;
