use crate::errors::LiverecError;
use crate::types::SessionState;

/// Current session state; every change goes through `validate_transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmSnapshot {
    pub state: SessionState,
}

impl Default for FsmSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Init,
        }
    }
}

impl FsmSnapshot {
    /// Returns whether the state actually changed.
    pub fn transition(&mut self, next: SessionState) -> Result<bool, LiverecError> {
        if self.state == next {
            return Ok(false);
        }
        validate_transition(self.state, next)?;
        self.state = next;
        Ok(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Stopped
    }
}

pub fn validate_transition(from: SessionState, to: SessionState) -> Result<(), LiverecError> {
    use SessionState::*;

    let allowed = matches!(
        (from, to),
        (Init, Resolving)
            | (Resolving, Offline)
            | (Resolving, Live)
            | (Offline, Live)
            | (Live, Lagging)
            | (Live, Offline)
            | (Lagging, Offline)
            | (Init | Resolving | Offline | Live | Lagging, Stopped)
    );

    if allowed {
        Ok(())
    } else {
        Err(LiverecError::InvalidTransition(format!(
            "{} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_transition, FsmSnapshot};
    use crate::errors::LiverecError;
    use crate::types::SessionState;

    #[test]
    fn happy_path_through_a_broadcast() {
        let mut fsm = FsmSnapshot::default();
        assert!(fsm.transition(SessionState::Resolving).expect("resolving"));
        assert!(fsm.transition(SessionState::Offline).expect("offline"));
        assert!(fsm.transition(SessionState::Live).expect("live"));
        assert!(fsm.transition(SessionState::Lagging).expect("lagging"));
        assert!(!fsm.transition(SessionState::Lagging).expect("still lagging"));
        assert!(fsm.transition(SessionState::Offline).expect("offline"));
        assert!(fsm.transition(SessionState::Stopped).expect("stopped"));
        assert!(fsm.is_terminal());
    }

    #[test]
    fn lagging_never_goes_back_to_live() {
        let err = validate_transition(SessionState::Lagging, SessionState::Live)
            .expect_err("illegal edge");
        assert!(matches!(err, LiverecError::InvalidTransition(msg) if msg == "lagging -> live"));
    }

    #[test]
    fn stopped_is_terminal() {
        let mut fsm = FsmSnapshot {
            state: SessionState::Stopped,
        };
        assert!(fsm.transition(SessionState::Resolving).is_err());
        assert!(fsm.transition(SessionState::Offline).is_err());
    }

    #[test]
    fn init_cannot_skip_resolution() {
        assert!(validate_transition(SessionState::Init, SessionState::Live).is_err());
        assert!(validate_transition(SessionState::Init, SessionState::Offline).is_err());
    }
}
