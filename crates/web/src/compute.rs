//! Compute API client and reconciliation state.
//!
//! Talks to the remote compute service, normalizes whatever comes back,
//! and keeps the panel's view of the one managed VM: the last status
//! snapshot plus the single in-progress action marker. After a successful
//! power action the panel re-polls the status endpoint on a fixed schedule
//! to observe the eventual transition, since the remote side commits
//! asynchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use vmrunner_common::error::{Error, Result};
use vmrunner_common::gate::{self, GateDecision};
use vmrunner_common::status::{default_rules, normalize_payload, FieldRule};
use vmrunner_common::{Credentials, StatusSnapshot, VmAction, VmActionRequest, VmId, VmState};

/// Default compute service endpoint.
pub const DEFAULT_COMPUTE_URL: &str = "https://compute.excloud.in";

/// Post-action re-poll schedule, measured from the action response. The
/// remote transition is not synchronous with the POST: refetch right away,
/// shortly after, and once more for slow transitions.
pub const DEFAULT_REPOLL_DELAYS: &[Duration] = &[
    Duration::ZERO,
    Duration::from_secs(3),
    Duration::from_secs(10),
];

/// Compute client configuration.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Base URL of the compute service.
    pub base_url: String,
    /// Status extraction priority; the first present field wins.
    pub status_fields: Vec<FieldRule>,
    /// Re-poll schedule after an accepted action.
    pub repoll_delays: Vec<Duration>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_COMPUTE_URL.to_string(),
            status_fields: default_rules(),
            repoll_delays: DEFAULT_REPOLL_DELAYS.to_vec(),
        }
    }
}

/// HTTP client for the compute service.
pub struct ComputeClient {
    http: reqwest::Client,
    base_url: String,
}

/// Outcome of a dispatched power action.
#[derive(Debug, Clone)]
pub enum DispatchResult {
    Accepted,
    /// Remote rejected the action; message taken from the body when present.
    Rejected { message: String },
    /// The compute service could not be reached.
    Unreachable,
}

impl ComputeClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("vmrunner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn status_url(&self, vm_id: &str) -> String {
        format!("{}/compute/{}", self.base_url, vm_id)
    }

    fn action_url(&self, action: VmAction) -> String {
        format!("{}/compute/{}", self.base_url, action.as_str())
    }

    /// GET the VM status and fold the outcome into a snapshot.
    ///
    /// 2xx bodies go through the extraction rules (no recognized field, or
    /// an unparseable body, is `Unknown`); non-2xx is `Error`; a transport
    /// failure is `Offline`.
    pub async fn fetch_status(&self, creds: &Credentials, rules: &[FieldRule]) -> StatusSnapshot {
        let resp = self
            .http
            .get(self.status_url(&creds.vm_id))
            .bearer_auth(&creds.token)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => match resp.json::<Value>().await {
                Ok(payload) => {
                    let (state, raw) = normalize_payload(&payload, rules);
                    StatusSnapshot::new(state, raw)
                }
                Err(e) => {
                    debug!("compute status body unparseable: {}", e);
                    StatusSnapshot::new(VmState::Unknown, None)
                }
            },
            Ok(resp) => {
                warn!("compute status for vm {} returned {}", creds.vm_id, resp.status());
                StatusSnapshot::new(VmState::Error, None)
            }
            Err(e) => {
                warn!("compute status fetch failed: {}", e);
                StatusSnapshot::new(VmState::Offline, None)
            }
        }
    }

    /// POST a power action. The identifier goes out as a JSON number when
    /// it parses as one; the API accepts either shape.
    pub async fn dispatch_action(&self, action: VmAction, creds: &Credentials) -> DispatchResult {
        let body = VmActionRequest {
            vm_id: VmId::parse(&creds.vm_id),
        };
        let resp = self
            .http
            .post(self.action_url(action))
            .bearer_auth(&creds.token)
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => DispatchResult::Accepted,
            Ok(resp) => {
                let status = resp.status();
                let message = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.get("message")
                            .and_then(|m| m.as_str())
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| {
                        format!(
                            "Failed to {} VM (it may already be {})",
                            action,
                            action.desired_state()
                        )
                    });
                warn!("compute {} returned {}: {}", action, status, message);
                DispatchResult::Rejected { message }
            }
            Err(e) => {
                warn!("compute {} dispatch failed: {}", action, e);
                DispatchResult::Unreachable
            }
        }
    }
}

/// Outcome of a requested action, for the local API layer.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// Gate rejection; no network call was made.
    Rejected {
        reason: &'static str,
        informational: bool,
    },
    /// Another action is still in flight.
    Busy { pending: VmAction },
    /// Remote accepted; re-polls are scheduled.
    Performed { message: String },
    /// Remote rejected the action.
    Failed { message: String },
    /// Transport failure talking to the compute service.
    Unreachable { message: String },
}

/// Shared panel handle: the compute client plus the view of the managed
/// VM. Clones share one state, so re-poll tasks hold a cheap handle.
#[derive(Clone)]
pub struct ControlPanel {
    inner: Arc<PanelInner>,
}

struct PanelInner {
    client: ComputeClient,
    status_fields: Vec<FieldRule>,
    repoll_delays: Vec<Duration>,
    /// Last normalized fetch outcome; the last writer wins.
    snapshot: RwLock<Option<StatusSnapshot>>,
    /// The one action allowed in flight at a time.
    pending: Mutex<Option<VmAction>>,
    /// Set while a status fetch is running; drives the refresh spinner.
    fetching: AtomicBool,
}

impl ControlPanel {
    pub fn new(cfg: ComputeConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(PanelInner {
                client: ComputeClient::new(cfg.base_url)?,
                status_fields: cfg.status_fields,
                repoll_delays: cfg.repoll_delays,
                snapshot: RwLock::new(None),
                pending: Mutex::new(None),
                fetching: AtomicBool::new(false),
            }),
        })
    }

    pub async fn snapshot(&self) -> Option<StatusSnapshot> {
        self.inner.snapshot.read().await.clone()
    }

    pub async fn pending(&self) -> Option<VmAction> {
        *self.inner.pending.lock().await
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.fetching.load(Ordering::SeqCst)
    }

    /// Fetch and store a fresh status. With incomplete credentials no call
    /// is made and the prior snapshot stands. Concurrent refreshes are
    /// tolerated; the last response to land wins.
    pub async fn refresh(&self, creds: &Credentials) -> Option<StatusSnapshot> {
        if !creds.is_complete() {
            return self.inner.snapshot.read().await.clone();
        }
        self.inner.fetching.store(true, Ordering::SeqCst);
        let snapshot = self
            .inner
            .client
            .fetch_status(creds, &self.inner.status_fields)
            .await;
        self.inner.fetching.store(false, Ordering::SeqCst);
        *self.inner.snapshot.write().await = Some(snapshot.clone());
        Some(snapshot)
    }

    /// Run an action through gate, dispatch and re-poll scheduling.
    ///
    /// The gate check happens before any network call; the pending marker
    /// is taken before the POST and cleared after resolution on every path,
    /// so action invocations are serialized.
    pub async fn perform(&self, action: VmAction, creds: &Credentials) -> ActionOutcome {
        let state = self.inner.snapshot.read().await.as_ref().map(|s| s.state);
        if let GateDecision::Reject {
            reason,
            informational,
        } = gate::check(action, creds, state)
        {
            info!("gate rejected {} for vm {:?}: {}", action, creds.vm_id, reason);
            return ActionOutcome::Rejected {
                reason,
                informational,
            };
        }

        {
            let mut pending = self.inner.pending.lock().await;
            if let Some(current) = *pending {
                return ActionOutcome::Busy { pending: current };
            }
            *pending = Some(action);
        }

        let outcome = self.dispatch(action, creds).await;
        *self.inner.pending.lock().await = None;
        outcome
    }

    async fn dispatch(&self, action: VmAction, creds: &Credentials) -> ActionOutcome {
        match self.inner.client.dispatch_action(action, creds).await {
            DispatchResult::Accepted => {
                info!("{} accepted for vm {}", action, creds.vm_id);
                self.schedule_repolls(creds.clone());
                ActionOutcome::Performed {
                    message: format!("VM {} successfully", action.past_tense()),
                }
            }
            DispatchResult::Rejected { message } => ActionOutcome::Failed { message },
            DispatchResult::Unreachable => ActionOutcome::Unreachable {
                message: "Error connecting to compute service".to_string(),
            },
        }
    }

    /// Fire-and-forget refetches to observe the eventual transition. No
    /// handles are retained; results for a torn-down panel are discarded.
    fn schedule_repolls(&self, creds: Credentials) {
        for delay in self.inner.repoll_delays.clone() {
            let panel = self.clone();
            let creds = creds.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Some(snapshot) = panel.refresh(&creds).await {
                    debug!("re-poll observed state {}", snapshot.state);
                }
            });
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockCompute;
    use super::*;
    use axum::http::StatusCode;

    fn panel(base_url: &str) -> ControlPanel {
        ControlPanel::new(ComputeConfig {
            base_url: base_url.to_string(),
            status_fields: default_rules(),
            repoll_delays: vec![
                Duration::ZERO,
                Duration::from_millis(50),
                Duration::from_millis(100),
            ],
        })
        .unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("123", "tok")
    }

    #[tokio::test]
    async fn test_refresh_normalizes_success() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.status_response.lock().await =
            (StatusCode::OK, serde_json::json!({"state": "RUNNING"}));

        let panel = panel(&url);
        let snapshot = panel.refresh(&creds()).await.unwrap();
        assert_eq!(snapshot.state, VmState::Running);
        assert_eq!(snapshot.raw_status.as_deref(), Some("RUNNING"));
        assert_eq!(
            mock.last_bearer.lock().await.as_deref(),
            Some("Bearer tok")
        );
    }

    #[tokio::test]
    async fn test_refresh_maps_http_error() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.status_response.lock().await = (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({"state": "running"}),
        );

        let panel = panel(&url);
        let snapshot = panel.refresh(&creds()).await.unwrap();
        // Non-2xx is Error no matter what the body claims.
        assert_eq!(snapshot.state, VmState::Error);
        assert_eq!(snapshot.raw_status, None);
    }

    #[tokio::test]
    async fn test_refresh_maps_transport_failure_to_offline() {
        // Nothing listens here.
        let panel = panel("http://127.0.0.1:1");
        let snapshot = panel.refresh(&creds()).await.unwrap();
        assert_eq!(snapshot.state, VmState::Offline);
    }

    #[tokio::test]
    async fn test_refresh_unrecognized_payload_is_unknown() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.status_response.lock().await =
            (StatusCode::OK, serde_json::json!({"phase": "booting"}));

        let panel = panel(&url);
        let snapshot = panel.refresh(&creds()).await.unwrap();
        assert_eq!(snapshot.state, VmState::Unknown);
        assert_eq!(snapshot.raw_status, None);
    }

    #[tokio::test]
    async fn test_refresh_without_credentials_keeps_prior_snapshot() {
        let (url, mock) = MockCompute::spawn().await;
        let panel = panel(&url);
        panel.refresh(&creds()).await;
        assert_eq!(mock.status_gets.load(Ordering::SeqCst), 1);

        let before = panel.snapshot().await.unwrap();
        let after = panel
            .refresh(&Credentials::new("", "tok"))
            .await
            .unwrap();
        assert_eq!(mock.status_gets.load(Ordering::SeqCst), 1);
        assert_eq!(after.observed_at, before.observed_at);
        assert_eq!(after.state, before.state);
    }

    #[tokio::test]
    async fn test_perform_dispatches_and_repolls() {
        let (url, mock) = MockCompute::spawn().await;
        let panel = panel(&url);

        // Last known state: stopped.
        panel.refresh(&creds()).await;
        assert_eq!(panel.snapshot().await.unwrap().state, VmState::Stopped);
        mock.status_gets.store(0, Ordering::SeqCst);

        // The VM comes up after the action lands.
        *mock.status_response.lock().await =
            (StatusCode::OK, serde_json::json!({"state": "running"}));

        let outcome = panel.perform(VmAction::Start, &creds()).await;
        match outcome {
            ActionOutcome::Performed { message } => {
                assert_eq!(message, "VM started successfully")
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let posts = mock.action_posts.lock().await.clone();
        assert_eq!(posts, vec![serde_json::json!({"vm_id": 123})]);
        assert_eq!(panel.pending().await, None);

        // Three re-polls land on the shortened schedule and the snapshot
        // converges on the new state.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(mock.status_gets.load(Ordering::SeqCst), 3);
        assert_eq!(panel.snapshot().await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_perform_sends_textual_identifier_unchanged() {
        let (url, mock) = MockCompute::spawn().await;
        let panel = panel(&url);

        let outcome = panel
            .perform(VmAction::Stop, &Credentials::new("vm-abc", "tok"))
            .await;
        assert!(matches!(outcome, ActionOutcome::Performed { .. }));
        let posts = mock.action_posts.lock().await.clone();
        assert_eq!(posts, vec![serde_json::json!({"vm_id": "vm-abc"})]);
    }

    #[tokio::test]
    async fn test_perform_gate_rejection_makes_no_network_call() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.status_response.lock().await =
            (StatusCode::OK, serde_json::json!({"state": "running"}));

        let panel = panel(&url);
        panel.refresh(&creds()).await;
        mock.status_gets.store(0, Ordering::SeqCst);

        let outcome = panel.perform(VmAction::Start, &creds()).await;
        match outcome {
            ActionOutcome::Rejected {
                reason,
                informational,
            } => {
                assert_eq!(reason, "already running");
                assert!(informational);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(mock.action_posts.lock().await.is_empty());
        assert_eq!(mock.status_gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_perform_validation_rejection_without_credentials() {
        let (url, mock) = MockCompute::spawn().await;
        let panel = panel(&url);

        let outcome = panel
            .perform(VmAction::Start, &Credentials::default())
            .await;
        match outcome {
            ActionOutcome::Rejected {
                reason,
                informational,
            } => {
                assert_eq!(reason, "missing VM identifier");
                assert!(!informational);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(mock.action_posts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_perform_remote_rejection_uses_body_message() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.action_response.lock().await = (
            StatusCode::CONFLICT,
            serde_json::json!({"message": "instance is locked"}),
        );

        let panel = panel(&url);
        let outcome = panel.perform(VmAction::Restart, &creds()).await;
        match outcome {
            ActionOutcome::Failed { message } => assert_eq!(message, "instance is locked"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(panel.pending().await, None);
    }

    #[tokio::test]
    async fn test_perform_remote_rejection_fallback_message() {
        let (url, mock) = MockCompute::spawn().await;
        *mock.action_response.lock().await =
            (StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({}));

        let panel = panel(&url);
        let outcome = panel.perform(VmAction::Start, &creds()).await;
        match outcome {
            ActionOutcome::Failed { message } => {
                assert_eq!(message, "Failed to start VM (it may already be running)")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_perform_transport_failure() {
        let panel = panel("http://127.0.0.1:1");
        let outcome = panel.perform(VmAction::Stop, &creds()).await;
        match outcome {
            ActionOutcome::Unreachable { message } => {
                assert_eq!(message, "Error connecting to compute service")
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(panel.pending().await, None);
    }

    #[tokio::test]
    async fn test_perform_is_serialized() {
        let (url, _mock) = MockCompute::spawn().await;
        let panel = panel(&url);

        // Hold the pending marker as a competing action would.
        *panel.inner.pending.lock().await = Some(VmAction::Stop);
        let outcome = panel.perform(VmAction::Start, &creds()).await;
        match outcome {
            ActionOutcome::Busy { pending } => assert_eq!(pending, VmAction::Stop),
            other => panic!("unexpected outcome {:?}", other),
        }

        // Marker released, actions flow again.
        *panel.inner.pending.lock().await = None;
        let outcome = panel.perform(VmAction::Start, &creds()).await;
        assert!(matches!(outcome, ActionOutcome::Performed { .. }));
    }
}
