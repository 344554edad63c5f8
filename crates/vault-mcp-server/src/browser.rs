//! Browser-automation seam and the Chrome DevTools Protocol implementation.
//!
//! The broker never hands secret material to the agent channel; it types the
//! credentials into a remote debuggable browser itself. [`LoginDriver`] is the
//! seam — anything that can fill a form behind it will do. The shipped
//! [`CdpDriver`] attaches to the browser at `VAULT_CDP_URL`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::sanitize::scrub;

/// Environment variable for the DevTools endpoint.
pub const CDP_URL_ENV: &str = "VAULT_CDP_URL";
const DEFAULT_CDP_URL: &str = "http://localhost:9222";

/// Cap on navigation and settle waits.
const NAV_TIMEOUT: Duration = Duration::from_secs(15);
/// Cap on the optional post-login DOM check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

// ── Interface ────────────────────────────────────────────────────────────────

/// Everything the driver needs to run one login, minus the secrets.
#[derive(Debug, Clone)]
pub struct LoginRecipe {
    pub login_url: String,
    pub email_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    /// Selector that should exist once the login landed (e.g. an avatar).
    pub post_login_check: Option<String>,
}

/// Result of one login attempt. `message` is already redacted by the driver.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub success: bool,
    pub page_title: String,
    pub current_url: String,
    pub message: String,
}

#[async_trait]
pub trait LoginDriver: Send + Sync {
    async fn perform_login(
        &self,
        recipe: &LoginRecipe,
        email: &str,
        password: &str,
    ) -> LoginOutcome;
}

// ── CDP driver ───────────────────────────────────────────────────────────────

pub struct CdpDriver {
    cdp_url: String,
    http: reqwest::Client,
}

impl CdpDriver {
    pub fn new(cdp_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NAV_TIMEOUT)
            .build()
            .expect("build CDP http client");
        Self {
            cdp_url: cdp_url.into(),
            http,
        }
    }

    pub fn from_env() -> Self {
        let url = std::env::var(CDP_URL_ENV).unwrap_or_else(|_| DEFAULT_CDP_URL.to_owned());
        Self::new(url)
    }

    async fn drive(
        &self,
        recipe: &LoginRecipe,
        email: &str,
        password: &str,
    ) -> Result<LoginOutcome> {
        // Open a fresh tab already pointed at the login page. Chrome requires
        // PUT on /json/new since v111.
        let new_tab: Value = self
            .http
            .put(format!(
                "{}/json/new?{}",
                self.cdp_url.trim_end_matches('/'),
                recipe.login_url
            ))
            .send()
            .await
            .context("reach browser debugger")?
            .json()
            .await
            .context("parse /json/new response")?;

        let ws_url = new_tab["webSocketDebuggerUrl"]
            .as_str()
            .context("tab has no webSocketDebuggerUrl")?;

        let (ws, _response) = connect_async(ws_url).await.context("attach to tab")?;
        let mut session = CdpSession { ws, next_id: 1 };

        session.wait_for_load(NAV_TIMEOUT).await?;

        let fill_result = session
            .eval(&build_fill_script(recipe, email, password))
            .await?;
        match fill_result.as_str() {
            Some("submitted") => {}
            Some(other) => anyhow::bail!("login form did not match recipe: {other}"),
            None => anyhow::bail!("fill script returned no status"),
        }

        // The click usually triggers a navigation; give it the same cap and
        // carry on either way — the post-login check decides success.
        let _ = session.wait_for_load(NAV_TIMEOUT).await;

        let success = match &recipe.post_login_check {
            Some(selector) => session.poll_for_selector(selector, CHECK_TIMEOUT).await,
            None => true,
        };

        let page_title = session
            .eval("document.title")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let current_url = session
            .eval("location.href")
            .await?
            .as_str()
            .unwrap_or_default()
            .to_owned();

        let message = if success {
            format!("login submitted at {current_url}")
        } else {
            "login submitted but the post-login check never appeared".to_owned()
        };

        Ok(LoginOutcome {
            success,
            page_title,
            current_url,
            message,
        })
    }
}

#[async_trait]
impl LoginDriver for CdpDriver {
    async fn perform_login(
        &self,
        recipe: &LoginRecipe,
        email: &str,
        password: &str,
    ) -> LoginOutcome {
        match self.drive(recipe, email, password).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let secrets = vec![password.to_owned(), email.to_owned()];
                LoginOutcome {
                    success: false,
                    page_title: String::new(),
                    current_url: String::new(),
                    message: scrub(&format!("browser automation failed: {e:#}"), &secrets),
                }
            }
        }
    }
}

// ── CDP session plumbing ─────────────────────────────────────────────────────

struct CdpSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_id: u64,
}

impl CdpSession {
    /// Send one command and wait for its response, skipping interleaved
    /// protocol events.
    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let payload = json!({"id": id, "method": method, "params": params}).to_string();
        self.ws
            .send(Message::Text(payload.into()))
            .await
            .with_context(|| format!("send {method}"))?;

        loop {
            let msg = self
                .ws
                .next()
                .await
                .context("debugger connection closed")?
                .context("debugger read")?;
            let Message::Text(text) = msg else { continue };
            let value: Value = serde_json::from_str(text.as_ref()).context("parse CDP frame")?;

            if value["id"].as_u64() == Some(id) {
                if let Some(error) = value.get("error") {
                    anyhow::bail!("{method}: {error}");
                }
                return Ok(value["result"].clone());
            }
            debug!(method = %value["method"], "skipping CDP event");
        }
    }

    /// Evaluate a JS expression in the page and return its value.
    async fn eval(&mut self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({"expression": expression, "returnByValue": true}),
            )
            .await?;
        Ok(result["result"]["value"].clone())
    }

    /// Poll `document.readyState` until the page settles. Evaluate errors
    /// during a navigation are treated as not-ready.
    async fn wait_for_load(&mut self, cap: Duration) -> Result<()> {
        let deadline = Instant::now() + cap;
        loop {
            if let Ok(state) = self.eval("document.readyState").await {
                if state.as_str() == Some("complete") {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                anyhow::bail!("navigation timed out after {}s", cap.as_secs());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Poll for a selector within `cap`; false if it never shows up.
    async fn poll_for_selector(&mut self, selector: &str, cap: Duration) -> bool {
        let expression = format!(
            "document.querySelector({}) !== null",
            js_string(selector)
        );
        let deadline = Instant::now() + cap;
        loop {
            if let Ok(found) = self.eval(&expression).await {
                if found.as_bool() == Some(true) {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Encode a Rust string as a JS string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).expect("encode JS string")
}

/// One expression that fills both fields with framework-visible input events
/// and clicks submit. Returns a short status string.
fn build_fill_script(recipe: &LoginRecipe, email: &str, password: &str) -> String {
    format!(
        r#"(() => {{
  const emailEl = document.querySelector({email_sel});
  const passEl = document.querySelector({pass_sel});
  if (!emailEl || !passEl) return "missing-field";
  const set = (el, v) => {{
    const d = Object.getOwnPropertyDescriptor(window.HTMLInputElement.prototype, "value");
    d.set.call(el, v);
    el.dispatchEvent(new Event("input", {{bubbles: true}}));
    el.dispatchEvent(new Event("change", {{bubbles: true}}));
  }};
  set(emailEl, {email});
  set(passEl, {password});
  const submitEl = document.querySelector({submit_sel});
  if (!submitEl) return "missing-submit";
  submitEl.click();
  return "submitted";
}})()"#,
        email_sel = js_string(&recipe.email_selector),
        pass_sel = js_string(&recipe.password_selector),
        submit_sel = js_string(&recipe.submit_selector),
        email = js_string(email),
        password = js_string(password),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe() -> LoginRecipe {
        LoginRecipe {
            login_url: "https://test.com/login".into(),
            email_selector: "#email".into(),
            password_selector: "input[name=\"pass\"]".into(),
            submit_selector: "button[type=submit]".into(),
            post_login_check: None,
        }
    }

    #[test]
    fn fill_script_escapes_quotes() {
        let script = build_fill_script(&recipe(), "a@b.com", "p\"w'd\\x");
        assert!(script.contains(r#""input[name=\"pass\"]""#));
        assert!(script.contains(r#""p\"w'd\\x""#));
        assert!(script.contains("submitEl.click()"));
    }

    #[tokio::test]
    async fn unreachable_browser_is_a_redacted_failure() {
        // Nothing listens on this port.
        let driver = CdpDriver::new("http://127.0.0.1:1");
        let outcome = driver
            .perform_login(&recipe(), "secret-user@company.com", "SuperSecretP@ss!2026")
            .await;

        assert!(!outcome.success);
        assert!(!outcome.message.contains("SuperSecretP@ss!2026"));
        assert!(!outcome.message.contains("secret-user@company.com"));
        assert!(!outcome.message.is_empty());
    }
}
