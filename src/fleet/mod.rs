mod refresher;
mod view;

pub(crate) use refresher::spawn_fleet_refresher;
pub use refresher::FleetViewHandle;
pub use view::AggregateLoad;
pub use view::FleetSnapshot;
pub use view::FleetView;
