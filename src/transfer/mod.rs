mod coordinator;
mod engine;
mod ledger;
mod types;

pub use coordinator::CoordinatorHandle;
pub use coordinator::CoordinatorOptions;
pub use coordinator::DrainReport;
pub use coordinator::EvacuationError;
pub(crate) use coordinator::spawn_coordinator;
pub use engine::AdmissionDecision;
pub use engine::GameEngine;
pub use types::RejectReason;
pub use types::RouteDirective;
pub use types::RouteOutcome;
pub use types::RouteResult;
pub use types::TransferAudit;
pub use types::TransferRequest;
pub use types::TransferState;
