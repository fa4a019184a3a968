//! Core types for vmrunner

use serde::{Deserialize, Serialize};

/// Canonical VM power state as observed through the compute API.
///
/// Derived fresh from every fetch outcome; never blended with a stale
/// value. `Error` and `Offline` describe the fetch, not the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Running,
    Stopped,
    Unknown,
    Error,
    Offline,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Unknown => write!(f, "unknown"),
            VmState::Error => write!(f, "error"),
            VmState::Offline => write!(f, "offline"),
        }
    }
}

/// Badge tone shown next to the status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeTone {
    Positive,
    Negative,
    Neutral,
}

impl VmState {
    /// Presentation hint for the status badge.
    pub fn tone(&self) -> BadgeTone {
        match self {
            VmState::Running => BadgeTone::Positive,
            VmState::Stopped => BadgeTone::Negative,
            _ => BadgeTone::Neutral,
        }
    }
}

/// Power action accepted by the compute API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Restart,
}

impl VmAction {
    /// Wire form, also the path segment of the action endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmAction::Start => "start",
            VmAction::Stop => "stop",
            VmAction::Restart => "restart",
        }
    }

    /// Past tense for success notifications ("VM started successfully").
    pub fn past_tense(&self) -> &'static str {
        match self {
            VmAction::Start => "started",
            VmAction::Stop => "stopped",
            VmAction::Restart => "restarted",
        }
    }

    /// State the VM would be in once the action lands. Used in failure
    /// fallbacks, since the API often rejects no-op transitions without a
    /// message.
    pub fn desired_state(&self) -> &'static str {
        match self {
            VmAction::Start | VmAction::Restart => "running",
            VmAction::Stop => "stopped",
        }
    }

    /// Whether the dashboard should visually emphasize this action given
    /// the last observed state. A hint only; the gate decides.
    pub fn emphasized(&self, state: Option<VmState>) -> bool {
        match self {
            VmAction::Start => state != Some(VmState::Running),
            VmAction::Stop => state != Some(VmState::Stopped),
            VmAction::Restart => !matches!(state, None | Some(VmState::Stopped)),
        }
    }
}

impl std::fmt::Display for VmAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// VM identifier as sent to the compute API.
///
/// Identifiers that parse as integers go out as JSON numbers; anything
/// else is passed through unchanged. The API accepts either shape and some
/// deployments only accept the numeric one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VmId {
    Numeric(i64),
    Text(String),
}

impl VmId {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(n) => VmId::Numeric(n),
            Err(_) => VmId::Text(raw.to_string()),
        }
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmId::Numeric(n) => write!(f, "{}", n),
            VmId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Request body for compute power actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmActionRequest {
    pub vm_id: VmId,
}

/// Operator-supplied credentials for the compute API.
///
/// Both fields may be empty until the operator fills them in; nothing is
/// validated here. The browser keeps the durable copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub vm_id: String,
    pub token: String,
}

impl Credentials {
    pub fn new(vm_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            token: token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.vm_id.is_empty() && !self.token.is_empty()
    }
}

/// Last normalized status fetch outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: VmState,
    /// Raw status string as reported by the compute API, if any.
    pub raw_status: Option<String>,
    pub observed_at: i64,
}

impl StatusSnapshot {
    pub fn new(state: VmState, raw_status: Option<String>) -> Self {
        Self {
            state,
            raw_status,
            observed_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_id_coercion() {
        assert_eq!(VmId::parse("123"), VmId::Numeric(123));
        assert_eq!(VmId::parse("vm-abc"), VmId::Text("vm-abc".to_string()));
        assert_eq!(VmId::parse("0"), VmId::Numeric(0));

        let body = serde_json::to_value(VmActionRequest {
            vm_id: VmId::parse("123"),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"vm_id": 123}));

        let body = serde_json::to_value(VmActionRequest {
            vm_id: VmId::parse("vm-abc"),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"vm_id": "vm-abc"}));
    }

    #[test]
    fn test_action_wire_form() {
        assert_eq!(VmAction::Start.as_str(), "start");
        assert_eq!(VmAction::Restart.as_str(), "restart");
        assert_eq!(
            serde_json::to_value(VmAction::Stop).unwrap(),
            serde_json::json!("stop")
        );
        let parsed: VmAction = serde_json::from_str("\"restart\"").unwrap();
        assert_eq!(parsed, VmAction::Restart);
    }

    #[test]
    fn test_badge_tone() {
        assert_eq!(VmState::Running.tone(), BadgeTone::Positive);
        assert_eq!(VmState::Stopped.tone(), BadgeTone::Negative);
        assert_eq!(VmState::Unknown.tone(), BadgeTone::Neutral);
        assert_eq!(VmState::Error.tone(), BadgeTone::Neutral);
        assert_eq!(VmState::Offline.tone(), BadgeTone::Neutral);
    }

    #[test]
    fn test_action_emphasis() {
        // Start fades once the VM is already up.
        assert!(!VmAction::Start.emphasized(Some(VmState::Running)));
        assert!(VmAction::Start.emphasized(Some(VmState::Stopped)));
        assert!(VmAction::Start.emphasized(None));

        // Stop fades once the VM is already down.
        assert!(!VmAction::Stop.emphasized(Some(VmState::Stopped)));
        assert!(VmAction::Stop.emphasized(Some(VmState::Running)));

        // Restart fades with no state or a stopped VM.
        assert!(!VmAction::Restart.emphasized(None));
        assert!(!VmAction::Restart.emphasized(Some(VmState::Stopped)));
        assert!(VmAction::Restart.emphasized(Some(VmState::Running)));
        assert!(VmAction::Restart.emphasized(Some(VmState::Error)));
    }

    #[test]
    fn test_credentials_completeness() {
        assert!(!Credentials::default().is_complete());
        assert!(!Credentials::new("42", "").is_complete());
        assert!(!Credentials::new("", "tok").is_complete());
        assert!(Credentials::new("42", "tok").is_complete());
    }
}
