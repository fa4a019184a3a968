//! Local action gating.
//!
//! The compute API does not reliably reject invalid transitions with a
//! useful message, so the panel decides locally whether an action is worth
//! a network call and tells the operator immediately when it is not.

use crate::types::{Credentials, VmAction, VmState};

/// Gate verdict for a requested action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Reject {
        reason: &'static str,
        /// Informational rejections are operator hints (the VM is already
        /// where the action would put it); the rest are validation errors.
        informational: bool,
    },
}

impl GateDecision {
    fn validation(reason: &'static str) -> Self {
        GateDecision::Reject {
            reason,
            informational: false,
        }
    }

    fn hint(reason: &'static str) -> Self {
        GateDecision::Reject {
            reason,
            informational: true,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allow)
    }
}

/// Decide whether an action should reach the network.
///
/// Rules are checked in order; the first match wins. `Unknown`, `Error`,
/// `Offline` and absent states never block: the local view may simply be
/// behind the VM.
pub fn check(action: VmAction, credentials: &Credentials, state: Option<VmState>) -> GateDecision {
    if credentials.vm_id.is_empty() {
        return GateDecision::validation("missing VM identifier");
    }
    if credentials.token.is_empty() {
        return GateDecision::validation("missing credential");
    }
    match (action, state) {
        (VmAction::Start, Some(VmState::Running)) => GateDecision::hint("already running"),
        (VmAction::Stop, Some(VmState::Stopped)) => GateDecision::hint("already stopped"),
        (VmAction::Restart, Some(VmState::Stopped)) => GateDecision::hint("use start instead"),
        _ => GateDecision::Allow,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("123", "tok")
    }

    #[test]
    fn test_missing_credentials_reject_regardless_of_state() {
        for action in [VmAction::Start, VmAction::Stop, VmAction::Restart] {
            for state in [None, Some(VmState::Running), Some(VmState::Stopped)] {
                let d = check(action, &Credentials::new("", "tok"), state);
                assert_eq!(
                    d,
                    GateDecision::Reject {
                        reason: "missing VM identifier",
                        informational: false
                    }
                );
                let d = check(action, &Credentials::new("123", ""), state);
                assert_eq!(
                    d,
                    GateDecision::Reject {
                        reason: "missing credential",
                        informational: false
                    }
                );
            }
        }
    }

    #[test]
    fn test_identifier_checked_before_token() {
        let d = check(VmAction::Start, &Credentials::default(), None);
        assert_eq!(
            d,
            GateDecision::Reject {
                reason: "missing VM identifier",
                informational: false
            }
        );
    }

    #[test]
    fn test_redundant_transitions_are_hints() {
        let d = check(VmAction::Start, &creds(), Some(VmState::Running));
        assert_eq!(
            d,
            GateDecision::Reject {
                reason: "already running",
                informational: true
            }
        );
        let d = check(VmAction::Stop, &creds(), Some(VmState::Stopped));
        assert_eq!(
            d,
            GateDecision::Reject {
                reason: "already stopped",
                informational: true
            }
        );
        let d = check(VmAction::Restart, &creds(), Some(VmState::Stopped));
        assert_eq!(
            d,
            GateDecision::Reject {
                reason: "use start instead",
                informational: true
            }
        );
    }

    #[test]
    fn test_valid_transitions_allowed() {
        assert!(check(VmAction::Start, &creds(), Some(VmState::Stopped)).is_allowed());
        assert!(check(VmAction::Stop, &creds(), Some(VmState::Running)).is_allowed());
        assert!(check(VmAction::Restart, &creds(), Some(VmState::Running)).is_allowed());
    }

    #[test]
    fn test_indeterminate_states_never_block() {
        for action in [VmAction::Start, VmAction::Stop, VmAction::Restart] {
            for state in [
                None,
                Some(VmState::Unknown),
                Some(VmState::Error),
                Some(VmState::Offline),
            ] {
                assert!(
                    check(action, &creds(), state).is_allowed(),
                    "{:?} from {:?}",
                    action,
                    state
                );
            }
        }
    }
}
