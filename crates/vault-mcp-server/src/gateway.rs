//! Loopback entry-form gateway.
//!
//! Serves the credential-entry form and a small REST surface over the store
//! and audit log, and correlates each pending `add` call with one form
//! submission through a one-shot slot keyed by an opaque token. The slot is
//! always removed from the map before it is resolved, so the submit/timeout
//! race is idempotent — the loser finds no slot and is a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::store::{
    audit, AuditLog, AuditResult, CredentialStore, SecretPayload, Selectors, ServiceType,
};

pub const DEFAULT_PORT: u16 = 9900;

/// Sentinel a pending slot resolves to when its timer fires first.
pub const TIMEOUT_SENTINEL: &str = "__timeout__";

/// How long a pending token waits for the form before expiring.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(300);

// ── Gateway ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    store: CredentialStore,
    audit: AuditLog,
    pending: DashMap<String, oneshot::Sender<String>>,
    submit_timeout: Duration,
    port: u16,
}

/// How one `add` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddResolution {
    Submitted(String),
    Timeout,
}

/// A registered pending token. Await [`wait`](Self::wait) for the outcome;
/// dropping it (cancellation of the containing call) removes the slot eagerly.
pub struct PendingAdd {
    token: String,
    rx: oneshot::Receiver<String>,
    inner: Arc<GatewayInner>,
}

impl PendingAdd {
    pub async fn wait(mut self) -> AddResolution {
        match (&mut self.rx).await {
            Ok(site_id) if site_id != TIMEOUT_SENTINEL => AddResolution::Submitted(site_id),
            _ => AddResolution::Timeout,
        }
    }
}

impl Drop for PendingAdd {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.token);
    }
}

impl Gateway {
    /// Bind `127.0.0.1:<port>` and serve for the rest of the process.
    /// Port 0 picks an ephemeral port (tests).
    pub async fn start(
        store: CredentialStore,
        audit: AuditLog,
        port: u16,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("bind entry-form gateway on 127.0.0.1:{port}"))?;
        let port = listener.local_addr().context("gateway local addr")?.port();

        let gateway = Self {
            inner: Arc::new(GatewayInner {
                store,
                audit,
                pending: DashMap::new(),
                submit_timeout,
                port,
            }),
        };

        let app = router(gateway.clone());
        info!(port, "entry-form gateway listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "entry-form gateway stopped");
            }
        });

        Ok(gateway)
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// URL of the entry form for a given token.
    pub fn form_url(&self, token: &str, site: Option<&str>, service_type: Option<&str>) -> String {
        let mut url = format!("http://127.0.0.1:{}/add?token={token}", self.inner.port);
        if let Some(site) = site {
            url.push_str(&format!("&site={site}"));
        }
        if let Some(st) = service_type {
            url.push_str(&format!("&type={st}"));
        }
        url
    }

    /// Insert a one-shot slot for `token` and arm its expiry timer.
    pub fn register(&self, token: &str) -> PendingAdd {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(token.to_owned(), tx);

        let inner = self.inner.clone();
        let timer_token = token.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(inner.submit_timeout).await;
            if let Some((_, tx)) = inner.pending.remove(&timer_token) {
                let _ = tx.send(TIMEOUT_SENTINEL.to_owned());
            }
        });

        PendingAdd {
            token: token.to_owned(),
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Resolve a pending token with the stored site identifier. Returns false
    /// when the token is unknown or already resolved.
    pub(crate) fn resolve_pending(&self, token: &str, site_id: &str) -> bool {
        match self.inner.pending.remove(token) {
            Some((_, tx)) => tx.send(site_id.to_owned()).is_ok(),
            None => false,
        }
    }
}

// ── Routes ───────────────────────────────────────────────────────────────────

fn router(gateway: Gateway) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/add", get(add_form))
        .route(
            "/api/credentials",
            get(list_credentials).post(submit_credential),
        )
        .route(
            "/api/credentials/{site}",
            axum::routing::patch(patch_credential).delete(delete_credential),
        )
        .route("/api/audit", get(audit_entries))
        .with_state(gateway)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn add_form() -> Html<&'static str> {
    Html(ADD_FORM_HTML)
}

// ── Submit ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(default)]
    token: Option<String>,
    site_id: String,
    service_type: ServiceType,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    login_url: Option<String>,
    #[serde(default)]
    selectors: Option<Selectors>,
}

async fn submit_credential(
    State(gateway): State<Gateway>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let payload = match body.service_type {
        ServiceType::WebLogin => match (body.email, body.password) {
            (Some(email), Some(password)) => SecretPayload::WebLogin { email, password },
            _ => return bad_request("web_login requires email and password"),
        },
        ServiceType::ApiKey => match body.api_key {
            Some(api_key) => SecretPayload::ApiKey {
                api_key,
                headers: body.headers.unwrap_or_default(),
            },
            None => return bad_request("api_key requires api_key"),
        },
    };

    let meta = match gateway
        .inner
        .store
        .add(
            &body.site_id,
            body.service_type,
            &payload,
            body.login_url,
            body.selectors,
        )
        .await
    {
        Ok(meta) => meta,
        Err(e) => return bad_request(&format!("{e:#}")),
    };

    if let Err(e) = gateway
        .inner
        .audit
        .append(
            audit::ACTION_CREATED,
            &meta.site_id,
            AuditResult::Success,
            None,
            None,
        )
        .await
    {
        return internal_error(e);
    }

    if let Some(token) = body.token.as_deref() {
        gateway.resolve_pending(token, &meta.site_id);
    }

    (StatusCode::CREATED, Json(json!(meta))).into_response()
}

// ── Admin projections ────────────────────────────────────────────────────────

async fn list_credentials(State(gateway): State<Gateway>) -> Response {
    let metas = gateway.inner.store.list().await;
    Json(json!({ "credentials": metas })).into_response()
}

#[derive(Debug, Deserialize)]
struct PatchRequest {
    active: bool,
}

async fn patch_credential(
    State(gateway): State<Gateway>,
    Path(site): Path<String>,
    Json(body): Json<PatchRequest>,
) -> Response {
    match gateway.inner.store.toggle_active(&site, body.active).await {
        Ok(true) => {
            let detail = if body.active { "activated" } else { "deactivated" };
            if let Err(e) = gateway
                .inner
                .audit
                .append(
                    audit::ACTION_TOGGLED,
                    &site,
                    AuditResult::Success,
                    None,
                    Some(detail.to_owned()),
                )
                .await
            {
                return internal_error(e);
            }
            Json(json!({"site_id": site, "active": body.active})).into_response()
        }
        Ok(false) => not_found(&site),
        Err(e) => internal_error(e),
    }
}

async fn delete_credential(State(gateway): State<Gateway>, Path(site): Path<String>) -> Response {
    match gateway.inner.store.remove(&site).await {
        Ok(true) => {
            if let Err(e) = gateway
                .inner
                .audit
                .append(audit::ACTION_REMOVED, &site, AuditResult::Success, None, None)
                .await
            {
                return internal_error(e);
            }
            Json(json!({"deleted": true})).into_response()
        }
        Ok(false) => not_found(&site),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct AuditQueryParams {
    #[serde(default)]
    site: Option<String>,
}

async fn audit_entries(
    State(gateway): State<Gateway>,
    Query(params): Query<AuditQueryParams>,
) -> Response {
    let entries = match gateway.inner.audit.entries(params.site.as_deref()) {
        Ok(entries) => entries,
        Err(e) => return internal_error(e),
    };
    let chain = match gateway.inner.audit.verify_chain() {
        Ok(chain) => chain,
        Err(e) => return internal_error(e),
    };
    Json(json!({"entries": entries, "chain": chain})).into_response()
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn not_found(site: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no credential for '{site}'")})),
    )
        .into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "gateway internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

// ── Entry form ───────────────────────────────────────────────────────────────

/// The whole form in one document. The password travels only over loopback,
/// from this page to `POST /api/credentials`, and never through the agent
/// channel.
const ADD_FORM_HTML: &str = r##"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>vault-mcp — add credential</title>
<style>
  body { font-family: system-ui, sans-serif; max-width: 28rem; margin: 3rem auto; }
  label { display: block; margin-top: .8rem; font-size: .9rem; }
  input, select { width: 100%; padding: .45rem; margin-top: .2rem; box-sizing: border-box; }
  button { margin-top: 1.2rem; padding: .55rem 1.4rem; }
  #status { margin-top: 1rem; font-size: .9rem; }
</style>
</head>
<body>
<h2>Add credential</h2>
<form id="f">
  <label>Site ID <input name="site_id" required></label>
  <label>Type
    <select name="service_type">
      <option value="web_login">web_login</option>
      <option value="api_key">api_key</option>
    </select>
  </label>
  <div id="web">
    <label>Email <input name="email" type="email"></label>
    <label>Password <input name="password" type="password"></label>
    <label>Login URL <input name="login_url" type="url"></label>
    <label>Email selector <input name="email_selector" placeholder="#email"></label>
    <label>Password selector <input name="password_selector" placeholder="#password"></label>
    <label>Submit selector <input name="submit_selector" placeholder="button[type=submit]"></label>
  </div>
  <div id="api" style="display:none">
    <label>API key <input name="api_key" type="password"></label>
    <label>Header name <input name="header_name" placeholder="Authorization"></label>
    <label>Header prefix <input name="header_prefix" placeholder="Bearer "></label>
  </div>
  <button type="submit">Save</button>
</form>
<p id="status"></p>
<script>
const qs = new URLSearchParams(location.search);
const form = document.getElementById("f");
if (qs.get("site")) form.site_id.value = qs.get("site");
if (qs.get("type")) form.service_type.value = qs.get("type");
const sync = () => {
  const web = form.service_type.value === "web_login";
  document.getElementById("web").style.display = web ? "" : "none";
  document.getElementById("api").style.display = web ? "none" : "";
};
form.service_type.addEventListener("change", sync);
sync();
form.addEventListener("submit", async (e) => {
  e.preventDefault();
  const web = form.service_type.value === "web_login";
  const body = { token: qs.get("token"), site_id: form.site_id.value, service_type: form.service_type.value };
  if (web) {
    body.email = form.email.value;
    body.password = form.password.value;
    if (form.login_url.value) body.login_url = form.login_url.value;
    if (form.email_selector.value) body.selectors = {
      email_selector: form.email_selector.value,
      password_selector: form.password_selector.value,
      submit_selector: form.submit_selector.value,
    };
  } else {
    body.api_key = form.api_key.value;
    const name = form.header_name.value || "Authorization";
    body.headers = {};
    body.headers[name] = (form.header_prefix.value || "") + form.api_key.value;
  }
  const resp = await fetch("/api/credentials", {
    method: "POST",
    headers: { "Content-Type": "application/json" },
    body: JSON.stringify(body),
  });
  const status = document.getElementById("status");
  if (resp.ok) {
    status.textContent = "Saved. You can close this tab.";
    form.reset();
  } else {
    const err = await resp.json().catch(() => ({}));
    status.textContent = "Error: " + (err.error || resp.status);
  }
});
</script>
</body>
</html>
"##;
