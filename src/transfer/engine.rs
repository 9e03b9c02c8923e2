use crate::types::PlayerId;

#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionDecision {
    Accept,
    /// The engine's reason, e.g. "banned".
    Reject(String),
}

/// GameEngine is the narrow surface the hosting game server exposes to the bridge.
///
/// `evaluate_admission` is always called with a timeout. An answer that arrives after the timeout
/// is ignored.
#[async_trait::async_trait]
pub trait GameEngine: Send + Sync + 'static {
    async fn evaluate_admission(&self, player_id: &PlayerId) -> AdmissionDecision;

    /// Fire-and-forget after an outbound transfer was acknowledged by the proxy.
    async fn notify_released(&self, player_id: &PlayerId);

    /// Players to move elsewhere when evacuating on shutdown.
    async fn connected_players(&self) -> Vec<PlayerId> {
        Vec::new()
    }
}
