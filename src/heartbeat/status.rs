use crate::control::SessionState;
use crate::types::ServerStatus;

/// Status this instance advertises, given the control session and the health of registry writes.
///
/// A record may only say Live while the session is Registered. Once the session is lost after
/// having been registered, the instance stays Draining until it registers again.
pub fn derive_status(session: SessionState, ever_registered: bool, registry_healthy: bool) -> ServerStatus {
    match session {
        SessionState::Registered if registry_healthy => ServerStatus::Live,
        SessionState::Registered => ServerStatus::Draining,
        SessionState::Draining => ServerStatus::Draining,
        SessionState::Closed => ServerStatus::Dead,
        SessionState::Connecting | SessionState::Disconnected if ever_registered => ServerStatus::Draining,
        SessionState::Connecting | SessionState::Disconnected => ServerStatus::Starting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_requires_registered_session_and_healthy_registry() {
        assert_eq!(derive_status(SessionState::Registered, true, true), ServerStatus::Live);
        assert_eq!(derive_status(SessionState::Registered, true, false), ServerStatus::Draining);

        for session in [
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Draining,
            SessionState::Closed,
        ]
        .iter()
        {
            for ever_registered in [false, true].iter() {
                for healthy in [false, true].iter() {
                    assert_ne!(derive_status(*session, *ever_registered, *healthy), ServerStatus::Live);
                }
            }
        }
    }

    #[test]
    fn lost_session_drains_only_after_first_registration() {
        assert_eq!(derive_status(SessionState::Connecting, false, true), ServerStatus::Starting);
        assert_eq!(derive_status(SessionState::Disconnected, true, true), ServerStatus::Draining);
        assert_eq!(derive_status(SessionState::Closed, true, true), ServerStatus::Dead);
    }
}
