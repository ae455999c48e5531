//! Session status state machine.

use crate::core::types::SessionStatus;

/// Whether a session may move from `from` to `to`.
///
/// Rewriting the same status is always allowed. `Aborted` and `Completed` are
/// terminal unless `force` is set.
pub fn can_transition(from: SessionStatus, to: SessionStatus, force: bool) -> bool {
    use SessionStatus::{Aborted, Active, Completed, Failed, Paused};

    if from == to {
        return true;
    }
    match (from, to) {
        (Active, Paused | Failed | Completed | Aborted) => true,
        (Paused, Active | Aborted) => true,
        (Failed, Active | Paused | Aborted) => true,
        (Aborted | Completed, _) => force,
        _ => false,
    }
}

/// Human-readable list of statuses reachable from `from` without force.
pub fn allowed_targets(from: SessionStatus) -> Vec<SessionStatus> {
    use SessionStatus::{Aborted, Active, Completed, Failed, Paused};

    [Active, Paused, Failed, Completed, Aborted]
        .into_iter()
        .filter(|to| *to != from && can_transition(from, *to, false))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::{Aborted, Active, Completed, Failed, Paused};

    #[test]
    fn active_paused_round_trip() {
        assert!(can_transition(Active, Paused, false));
        assert!(can_transition(Paused, Active, false));
    }

    #[test]
    fn failed_recovers_to_active() {
        assert!(can_transition(Active, Failed, false));
        assert!(can_transition(Failed, Active, false));
        assert!(!can_transition(Paused, Failed, false));
    }

    #[test]
    fn terminal_states_need_force() {
        assert!(!can_transition(Aborted, Active, false));
        assert!(can_transition(Aborted, Active, true));
        assert!(!can_transition(Completed, Active, false));
        assert!(allowed_targets(Aborted).is_empty());
    }

    #[test]
    fn abort_is_reachable_from_live_states() {
        for from in [Active, Paused, Failed] {
            assert!(can_transition(from, Aborted, false));
        }
    }
}
