//! Web server implementation

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use vmrunner_common::error::{Error, Result};
use vmrunner_common::status::{default_rules, parse_rules};
use vmrunner_common::{BadgeTone, Credentials, StatusSnapshot, VmAction, VmState};

use crate::auth::{self, SessionConfig};
use crate::compute::{ActionOutcome, ComputeConfig, ControlPanel, DEFAULT_COMPUTE_URL};

/// Web server state
#[derive(Clone)]
pub struct WebServer {
    state: Arc<WebServerState>,
}

pub(crate) struct WebServerState {
    pub(crate) panel: ControlPanel,
    pub(crate) cfg: WebServerConfig,
}

#[derive(Debug, Clone)]
pub struct WebServerConfig {
    /// Compute service endpoint and reconciliation knobs.
    pub compute: ComputeConfig,
    /// Login secrets and cookie policy.
    pub session: SessionConfig,
}

impl WebServerConfig {
    /// Build configuration from the environment.
    ///
    /// - `VMRUNNER_USERNAME` / `VMRUNNER_PASSWORD` are required.
    /// - `VMRUNNER_COMPUTE_URL` overrides the compute endpoint.
    /// - `VMRUNNER_STATUS_FIELDS` overrides the status extraction priority
    ///   (comma-separated dotted paths, e.g. `status,state,data.status`).
    /// - `VMRUNNER_SECURE_COOKIES=1` marks the session cookie Secure.
    pub fn from_env() -> Result<Self> {
        let username = std::env::var("VMRUNNER_USERNAME")
            .map_err(|_| Error::InvalidConfig("VMRUNNER_USERNAME is required".to_string()))?;
        let password = std::env::var("VMRUNNER_PASSWORD")
            .map_err(|_| Error::InvalidConfig("VMRUNNER_PASSWORD is required".to_string()))?;
        let secure_cookies =
            std::env::var("VMRUNNER_SECURE_COOKIES").ok().as_deref() == Some("1");

        let base_url = std::env::var("VMRUNNER_COMPUTE_URL")
            .unwrap_or_else(|_| DEFAULT_COMPUTE_URL.to_string());
        let status_fields = match std::env::var("VMRUNNER_STATUS_FIELDS") {
            Ok(raw) => parse_rules(&raw)?,
            Err(_) => default_rules(),
        };

        Ok(Self {
            compute: ComputeConfig {
                base_url,
                status_fields,
                ..ComputeConfig::default()
            },
            session: SessionConfig {
                username,
                password,
                secure_cookies,
            },
        })
    }
}

impl WebServer {
    pub fn new(cfg: WebServerConfig) -> Result<Self> {
        let panel = ControlPanel::new(cfg.compute.clone())?;
        Ok(Self {
            state: Arc::new(WebServerState { panel, cfg }),
        })
    }

    /// Create router
    pub fn router(&self) -> Router {
        // VM routes sit behind the session gate.
        let vm_routes = Router::new()
            .route("/api/vm/status", get(vm_status_handler))
            .route("/api/vm/state", get(vm_state_handler))
            .route("/api/vm/action", post(vm_action_handler))
            .layer(middleware::from_fn(auth::require_session))
            .with_state(self.state.clone());

        Router::new()
            .route("/", get(page_handler))
            .route("/api/health", get(health_handler))
            .route("/api/auth/login", post(auth::login_handler))
            .route("/api/auth/logout", post(auth::logout_handler))
            .merge(vm_routes)
            .fallback(not_found_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server
    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        info!("Panel starting on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router()).await?;

        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "vmrunner-web"
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not found"})),
    )
}

/// Page shell: the cookie is consulted once per render to pick the login
/// view or the dashboard.
async fn page_handler(jar: axum_extra::extract::cookie::CookieJar) -> impl IntoResponse {
    if auth::is_authenticated(&jar) {
        Html(DASHBOARD_HTML)
    } else {
        Html(LOGIN_HTML)
    }
}

/// Panel view of the managed VM, with presentation hints derived
/// server-side so the page applies rather than re-derives them.
#[derive(Debug, Clone, Serialize)]
struct PanelReport {
    state: Option<VmState>,
    raw_status: Option<String>,
    observed_at: Option<i64>,
    tone: BadgeTone,
    fetching: bool,
    pending: Option<VmAction>,
    actions: ActionHints,
}

#[derive(Debug, Clone, Serialize)]
struct ActionHints {
    start: bool,
    stop: bool,
    restart: bool,
}

impl PanelReport {
    fn build(snapshot: Option<StatusSnapshot>, fetching: bool, pending: Option<VmAction>) -> Self {
        let state = snapshot.as_ref().map(|s| s.state);
        Self {
            state,
            raw_status: snapshot.as_ref().and_then(|s| s.raw_status.clone()),
            observed_at: snapshot.as_ref().map(|s| s.observed_at),
            tone: state.map(|s| s.tone()).unwrap_or(BadgeTone::Neutral),
            fetching,
            pending,
            actions: ActionHints {
                start: VmAction::Start.emphasized(state),
                stop: VmAction::Stop.emphasized(state),
                restart: VmAction::Restart.emphasized(state),
            },
        }
    }

    async fn gather(state: &WebServerState) -> Self {
        Self::build(
            state.panel.snapshot().await,
            state.panel.is_fetching(),
            state.panel.pending().await,
        )
    }
}

/// Bearer credential forwarded by the page with every VM call. The browser
/// keeps the durable copy; the server never stores it.
fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("")
        .to_string()
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    vm_id: String,
}

async fn vm_status_handler(
    State(state): State<Arc<WebServerState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let creds = Credentials::new(query.vm_id, bearer_token(&headers));
    if creds.vm_id.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": "missing VM identifier"})),
        )
            .into_response();
    }
    if creds.token.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"error": "missing credential"})),
        )
            .into_response();
    }

    state.panel.refresh(&creds).await;
    Json(PanelReport::gather(&state).await).into_response()
}

async fn vm_state_handler(State(state): State<Arc<WebServerState>>) -> impl IntoResponse {
    Json(PanelReport::gather(&state).await)
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    action: VmAction,
    #[serde(default)]
    vm_id: String,
}

async fn vm_action_handler(
    State(state): State<Arc<WebServerState>>,
    headers: HeaderMap,
    Json(body): Json<ActionBody>,
) -> impl IntoResponse {
    let creds = Credentials::new(body.vm_id, bearer_token(&headers));
    let outcome = state.panel.perform(body.action, &creds).await;

    match outcome {
        ActionOutcome::Rejected {
            reason,
            informational: false,
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({"success": false, "message": reason})),
        )
            .into_response(),
        ActionOutcome::Rejected {
            reason,
            informational: true,
        } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": false,
                "performed": false,
                "informational": true,
                "message": reason
            })),
        )
            .into_response(),
        ActionOutcome::Busy { pending } => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "success": false,
                "message": format!("{} already in progress", pending)
            })),
        )
            .into_response(),
        ActionOutcome::Performed { message } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "performed": true,
                "message": message
            })),
        )
            .into_response(),
        ActionOutcome::Failed { message } | ActionOutcome::Unreachable { message } => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"success": false, "message": message})),
        )
            .into_response(),
    }
}

// ============================================================================
// Embedded pages
// ============================================================================

const LOGIN_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Virtual Machine Runner</title>
    <style>
        * {
            margin: 0;
            padding: 0;
            box-sizing: border-box;
        }
        html, body {
            height: 100%;
            background: #1a1a2e;
            font-family: system-ui, sans-serif;
        }
        #wrap {
            display: flex;
            align-items: center;
            justify-content: center;
            height: 100%;
        }
        #card {
            background: #16213e;
            border-radius: 8px;
            padding: 32px;
            width: 340px;
        }
        h1 {
            color: #4ecca3;
            font-size: 1.3em;
            margin-bottom: 4px;
        }
        p.sub {
            color: #8a93b2;
            font-size: 0.85em;
            margin-bottom: 20px;
        }
        label {
            display: block;
            color: #8a93b2;
            font-size: 0.8em;
            margin: 12px 0 4px;
        }
        input {
            width: 100%;
            padding: 10px;
            border: 1px solid #0f3460;
            border-radius: 4px;
            background: #1a1a2e;
            color: #fff;
            font-size: 1em;
        }
        button {
            width: 100%;
            margin-top: 20px;
            padding: 10px;
            border: none;
            border-radius: 4px;
            background: #4ecca3;
            color: #16213e;
            font-size: 1em;
            cursor: pointer;
        }
        button:hover {
            background: #3db892;
        }
        #error {
            color: #e94560;
            font-size: 0.85em;
            margin-top: 12px;
            min-height: 1.2em;
        }
    </style>
</head>
<body>
    <div id="wrap">
        <div id="card">
            <h1>Virtual Machine Runner</h1>
            <p class="sub">Sign in to manage your VM</p>
            <form id="login-form">
                <label for="username">Username</label>
                <input id="username" autocomplete="username" required>
                <label for="password">Password</label>
                <input id="password" type="password" autocomplete="current-password" required>
                <button type="submit">Log in</button>
                <div id="error"></div>
            </form>
        </div>
    </div>

    <script>
        const form = document.getElementById('login-form');
        const errorEl = document.getElementById('error');

        form.addEventListener('submit', async (e) => {
            e.preventDefault();
            errorEl.textContent = '';
            try {
                const res = await fetch('/api/auth/login', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({
                        username: document.getElementById('username').value,
                        password: document.getElementById('password').value,
                    }),
                });
                const body = await res.json().catch(() => ({}));
                if (res.ok && body.success) {
                    window.location.reload();
                } else {
                    errorEl.textContent = body.message || 'Login failed';
                }
            } catch (err) {
                errorEl.textContent = 'Could not reach the panel service';
            }
        });
    </script>
</body>
</html>
"#;

const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Virtual Machine Runner</title>
    <style>
        * {
            margin: 0;
            padding: 0;
            box-sizing: border-box;
        }
        html, body {
            min-height: 100%;
            background: #1a1a2e;
            font-family: system-ui, sans-serif;
        }
        #wrap {
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
            padding: 16px;
        }
        #card {
            background: #16213e;
            border-radius: 8px;
            padding: 28px;
            width: 100%;
            max-width: 680px;
        }
        #header {
            display: flex;
            justify-content: space-between;
            align-items: center;
            margin-bottom: 24px;
        }
        #header h1 {
            color: #4ecca3;
            font-size: 1.4em;
        }
        #header p {
            color: #8a93b2;
            font-size: 0.85em;
        }
        #logout {
            background: none;
            border: 1px solid #0f3460;
            border-radius: 4px;
            color: #8a93b2;
            padding: 6px 12px;
            cursor: pointer;
        }
        #logout:hover {
            color: #fff;
        }
        #status-row {
            display: flex;
            justify-content: space-between;
            align-items: center;
            background: #0f3460;
            border-radius: 6px;
            padding: 16px;
            margin-bottom: 20px;
        }
        #status-label {
            color: #8a93b2;
            font-size: 0.8em;
            margin-bottom: 4px;
        }
        .badge {
            display: inline-block;
            padding: 4px 10px;
            border-radius: 4px;
            font-size: 0.85em;
            font-weight: 600;
            background: #1a1a2e;
            color: #8a93b2;
        }
        .badge.tone-positive {
            background: #4ecca3;
            color: #16213e;
        }
        .badge.tone-negative {
            background: #e94560;
            color: #fff;
        }
        #refresh {
            background: none;
            border: 1px solid #4ecca3;
            border-radius: 4px;
            color: #4ecca3;
            padding: 8px 14px;
            cursor: pointer;
        }
        #refresh:disabled {
            opacity: 0.5;
            cursor: default;
        }
        .grid {
            display: grid;
            grid-template-columns: 1fr 1fr;
            gap: 16px;
        }
        label {
            display: block;
            color: #8a93b2;
            font-size: 0.8em;
            margin-bottom: 4px;
        }
        input {
            width: 100%;
            padding: 10px;
            border: 1px solid #0f3460;
            border-radius: 4px;
            background: #1a1a2e;
            color: #fff;
            font-size: 1em;
        }
        .token-box {
            position: relative;
        }
        #toggle-token {
            position: absolute;
            right: 6px;
            top: 50%;
            transform: translateY(-50%);
            background: none;
            border: none;
            color: #8a93b2;
            cursor: pointer;
            font-size: 0.8em;
        }
        p.hint {
            color: #8a93b2;
            font-size: 0.75em;
            margin: 10px 0 22px;
        }
        #actions {
            display: grid;
            grid-template-columns: repeat(3, 1fr);
            gap: 12px;
        }
        #actions button {
            padding: 22px 0;
            border: none;
            border-radius: 6px;
            font-size: 1.05em;
            color: #fff;
            cursor: pointer;
        }
        #actions button:disabled {
            opacity: 0.5;
            cursor: default;
        }
        #actions button.dimmed {
            opacity: 0.45;
        }
        #btn-start { background: #2e9e7b; }
        #btn-stop { background: #e94560; }
        #btn-restart { background: #0f3460; }
        #toasts {
            position: fixed;
            bottom: 20px;
            right: 20px;
            display: flex;
            flex-direction: column;
            gap: 8px;
        }
        .toast {
            padding: 10px 16px;
            border-radius: 4px;
            color: #fff;
            background: #0f3460;
            font-size: 0.9em;
        }
        .toast.ok { background: #2e9e7b; }
        .toast.err { background: #e94560; }
    </style>
</head>
<body>
    <div id="wrap">
        <div id="card">
            <div id="header">
                <div>
                    <h1>Virtual Machine Runner</h1>
                    <p>Manage your VM instance securely</p>
                </div>
                <button id="logout" title="Logout">Log out</button>
            </div>

            <div id="status-row">
                <div>
                    <div id="status-label">VM Status</div>
                    <span class="badge" id="badge">Enter credentials to see status</span>
                </div>
                <button id="refresh">Refresh</button>
            </div>

            <div class="grid">
                <div>
                    <label for="vm-id">VM ID</label>
                    <input id="vm-id" placeholder="vm-123456">
                </div>
                <div>
                    <label for="token">Bearer Token</label>
                    <div class="token-box">
                        <input id="token" type="password" placeholder="Enter your token">
                        <button id="toggle-token" type="button">show</button>
                    </div>
                </div>
            </div>
            <p class="hint">Your credentials are saved automatically in this browser.</p>

            <div id="actions">
                <button id="btn-start">Start</button>
                <button id="btn-stop">Stop</button>
                <button id="btn-restart">Restart</button>
            </div>
        </div>
    </div>
    <div id="toasts"></div>

    <script>
        const vmIdInput = document.getElementById('vm-id');
        const tokenInput = document.getElementById('token');
        const badge = document.getElementById('badge');
        const refreshBtn = document.getElementById('refresh');
        const buttons = {
            start: document.getElementById('btn-start'),
            stop: document.getElementById('btn-stop'),
            restart: document.getElementById('btn-restart'),
        };
        const labels = {
            start: ['Start', 'Starting...'],
            stop: ['Stop', 'Stopping...'],
            restart: ['Restart', 'Restarting...'],
        };

        let pendingAction = null;
        let fetching = false;

        // Credentials persist across reloads; every edit is written back
        // immediately. Logout does not clear them.
        vmIdInput.value = localStorage.getItem('vmId') || '';
        tokenInput.value = localStorage.getItem('bearerToken') || '';
        vmIdInput.addEventListener('input', () => {
            localStorage.setItem('vmId', vmIdInput.value);
            updateControls();
        });
        tokenInput.addEventListener('input', () => {
            localStorage.setItem('bearerToken', tokenInput.value);
            updateControls();
        });

        document.getElementById('toggle-token').addEventListener('click', (e) => {
            const hidden = tokenInput.type === 'password';
            tokenInput.type = hidden ? 'text' : 'password';
            e.target.textContent = hidden ? 'hide' : 'show';
        });

        document.getElementById('logout').addEventListener('click', async () => {
            await fetch('/api/auth/logout', { method: 'POST' });
            window.location.reload();
        });

        function toast(message, kind) {
            const el = document.createElement('div');
            el.className = 'toast ' + (kind || '');
            el.textContent = message;
            document.getElementById('toasts').appendChild(el);
            setTimeout(() => el.remove(), 5000);
        }

        function authHeaders() {
            return { 'Authorization': 'Bearer ' + tokenInput.value };
        }

        function updateControls() {
            refreshBtn.disabled = fetching || !vmIdInput.value || !tokenInput.value;
            for (const name of Object.keys(buttons)) {
                buttons[name].disabled = pendingAction !== null;
                buttons[name].textContent =
                    pendingAction === name ? labels[name][1] : labels[name][0];
            }
        }

        function applyReport(report) {
            badge.className = 'badge tone-' + report.tone;
            if (report.raw_status) {
                badge.textContent = report.raw_status.toUpperCase();
            } else if (report.state) {
                badge.textContent = report.state.toUpperCase();
            } else {
                badge.textContent = 'Enter credentials to see status';
            }
            for (const name of Object.keys(buttons)) {
                buttons[name].classList.toggle('dimmed', !report.actions[name]);
            }
        }

        async function refreshStatus() {
            if (!vmIdInput.value || !tokenInput.value) return;
            fetching = true;
            updateControls();
            try {
                const res = await fetch(
                    '/api/vm/status?vm_id=' + encodeURIComponent(vmIdInput.value),
                    { headers: authHeaders() },
                );
                if (res.status === 401) {
                    window.location.reload();
                    return;
                }
                if (res.ok) {
                    applyReport(await res.json());
                }
            } catch (err) {
                // Leave the last rendered state in place.
            } finally {
                fetching = false;
                updateControls();
            }
        }

        async function readState() {
            try {
                const res = await fetch('/api/vm/state');
                if (res.ok) applyReport(await res.json());
            } catch (err) {
                // Next read will catch up.
            }
        }

        async function performAction(action) {
            if (pendingAction) return;
            pendingAction = action;
            updateControls();
            try {
                const res = await fetch('/api/vm/action', {
                    method: 'POST',
                    headers: { ...authHeaders(), 'Content-Type': 'application/json' },
                    body: JSON.stringify({ action: action, vm_id: vmIdInput.value }),
                });
                if (res.status === 401) {
                    window.location.reload();
                    return;
                }
                const body = await res.json().catch(() => ({}));
                if (res.ok && body.performed) {
                    toast(body.message, 'ok');
                    // The server re-polls the compute service on its own
                    // schedule; trail it to pick up the new state.
                    for (const delay of [1200, 4000, 11000]) {
                        setTimeout(readState, delay);
                    }
                } else if (res.ok && body.informational) {
                    toast(body.message, '');
                } else {
                    toast(body.message || 'Failed to ' + action + ' VM', 'err');
                }
            } catch (err) {
                toast('Error connecting to compute service', 'err');
            } finally {
                pendingAction = null;
                updateControls();
            }
        }

        refreshBtn.addEventListener('click', refreshStatus);
        buttons.start.addEventListener('click', () => performAction('start'));
        buttons.stop.addEventListener('click', () => performAction('stop'));
        buttons.restart.addEventListener('click', () => performAction('restart'));

        updateControls();
        if (vmIdInput.value && tokenInput.value) {
            refreshStatus();
        }
    </script>
</body>
</html>
"#;
