//! The five tool verbs.
//!
//! Every verb returns a structured outcome, writes its audit entries before
//! returning, and runs the scrub pass as the last step — no field of a
//! decrypted payload reaches a result, an error string, or the log.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::browser::LoginRecipe;
use crate::gateway::{AddResolution, PendingAdd};
use crate::protocol::ToolResult;
use crate::sanitize::{scrub, scrub_value};
use crate::store::{audit, AuditResult, SecretPayload, ServiceType};
use crate::Broker;

fn get_str(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

impl Broker {
    /// Dispatch one MCP `tools/call` to the matching verb.
    pub async fn handle_tool(&self, name: &str, arguments: &Map<String, Value>) -> ToolResult {
        let outcome = match name {
            "list" => Ok(self.list().await),
            "status" => match get_str(arguments, "site_id") {
                Some(site) => self.status(&site).await,
                None => return ToolResult::error("missing required parameter: site_id"),
            },
            "login" => match get_str(arguments, "site_id") {
                Some(site) => self.login(&site, get_str(arguments, "bot_id")).await,
                None => return ToolResult::error("missing required parameter: site_id"),
            },
            "api_request" => {
                let Some(service) = get_str(arguments, "service") else {
                    return ToolResult::error("missing required parameter: service");
                };
                let Some(url) = get_str(arguments, "url") else {
                    return ToolResult::error("missing required parameter: url");
                };
                let method = get_str(arguments, "method").unwrap_or_else(|| "GET".to_owned());
                let body = get_str(arguments, "body");
                let headers: BTreeMap<String, String> = arguments
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                            .collect()
                    })
                    .unwrap_or_default();
                self.api_request(&service, &url, &method, body, headers).await
            }
            "add" => {
                self.add(
                    get_str(arguments, "site_id").as_deref(),
                    get_str(arguments, "service_type").as_deref(),
                )
                .await
            }
            _ => return ToolResult::error(format!("unknown tool: {name}")),
        };

        match outcome {
            Ok(value) => {
                let failed = value.get("status").and_then(Value::as_str) == Some("failure")
                    || value.get("error").is_some();
                let text =
                    serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_owned());
                if failed {
                    ToolResult::error(text)
                } else {
                    ToolResult::success(text)
                }
            }
            Err(e) => {
                error!(tool = name, error = %e, "tool execution failed");
                ToolResult::error(format!("{e:#}"))
            }
        }
    }

    // ── list ─────────────────────────────────────────────────────────────────

    /// Metadata projection of every credential. Never decrypts.
    pub async fn list(&self) -> Value {
        let credentials: Vec<Value> = self
            .store
            .list()
            .await
            .into_iter()
            .map(|m| {
                json!({
                    "site_id": m.site_id,
                    "service_type": m.service_type,
                    "active": m.active,
                })
            })
            .collect();
        json!({ "credentials": credentials })
    }

    // ── status ───────────────────────────────────────────────────────────────

    /// One credential's metadata plus audit summary. Never decrypts.
    pub async fn status(&self, site_id: &str) -> Result<Value> {
        let Some(meta) = self.store.meta(site_id).await else {
            return Ok(json!({"error": format!("credential '{site_id}' not found")}));
        };

        let entries = self.audit.entries(Some(site_id))?;
        let last_used = entries
            .last()
            .map(|e| {
                json!({
                    "timestamp": e.timestamp,
                    "action": e.action,
                    "result": e.result,
                })
            })
            .unwrap_or(Value::Null);

        Ok(json!({
            "site_id": meta.site_id,
            "service_type": meta.service_type,
            "active": meta.active,
            "created_at": meta.created_at,
            "updated_at": meta.updated_at,
            "audit_count": entries.len(),
            "last_used": last_used,
        }))
    }

    // ── login ────────────────────────────────────────────────────────────────

    /// Drive a browser login with a stored `web_login` credential.
    pub async fn login(&self, site_id: &str, bot_id: Option<String>) -> Result<Value> {
        // Precondition ladder; every rung audits a failure before returning.
        let Some(meta) = self.store.meta(site_id).await else {
            return self
                .login_failure(site_id, bot_id, format!("credential '{site_id}' not found"), &[])
                .await;
        };
        if !meta.active {
            return self
                .login_failure(site_id, bot_id, format!("credential '{site_id}' is inactive"), &[])
                .await;
        }
        if meta.service_type != ServiceType::WebLogin {
            return self
                .login_failure(
                    site_id,
                    bot_id,
                    format!("credential '{site_id}' is not a web_login"),
                    &[],
                )
                .await;
        }
        let selectors = self.store.selectors(site_id).await;
        let (Some(login_url), Some(selectors)) = (meta.login_url, selectors) else {
            return self
                .login_failure(
                    site_id,
                    bot_id,
                    format!("credential '{site_id}' is missing login_url or selectors"),
                    &[],
                )
                .await;
        };

        let payload = match self.store.get(site_id).await {
            Ok(Some((_, payload))) => payload,
            Ok(None) => {
                return self
                    .login_failure(
                        site_id,
                        bot_id,
                        format!("credential '{site_id}' not found"),
                        &[],
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .login_failure(site_id, bot_id, format!("decryption failed: {e:#}"), &[])
                    .await;
            }
        };
        let SecretPayload::WebLogin { email, password } = payload else {
            return self
                .login_failure(
                    site_id,
                    bot_id,
                    format!("credential '{site_id}' is not a web_login"),
                    &[],
                )
                .await;
        };
        let secrets = vec![password.clone(), email.clone()];

        let recipe = LoginRecipe {
            login_url,
            email_selector: selectors.email_selector,
            password_selector: selectors.password_selector,
            submit_selector: selectors.submit_selector,
            post_login_check: None,
        };

        info!(site_id, "driving browser login");
        let outcome = self.driver.perform_login(&recipe, &email, &password).await;

        let result = if outcome.success {
            AuditResult::Success
        } else {
            AuditResult::Failure
        };
        self.audit
            .append(
                audit::ACTION_USED,
                site_id,
                result,
                bot_id,
                Some(scrub(&outcome.message, &secrets)),
            )
            .await?;

        let mut response = json!({
            "status": if outcome.success { "success" } else { "failure" },
            "page_title": outcome.page_title,
            "message": outcome.message,
        });
        scrub_value(&mut response, &secrets);
        Ok(response)
    }

    async fn login_failure(
        &self,
        site_id: &str,
        bot_id: Option<String>,
        reason: String,
        secrets: &[String],
    ) -> Result<Value> {
        self.audit
            .append(
                audit::ACTION_USED,
                site_id,
                AuditResult::Failure,
                bot_id,
                Some(scrub(&reason, secrets)),
            )
            .await?;
        let mut response = json!({
            "status": "failure",
            "page_title": Value::Null,
            "message": reason,
        });
        scrub_value(&mut response, secrets);
        Ok(response)
    }

    // ── api_request ──────────────────────────────────────────────────────────

    /// Issue an outbound HTTP request authenticated by a stored `api_key`
    /// credential. Stored headers are merged over caller headers.
    pub async fn api_request(
        &self,
        service: &str,
        url: &str,
        method: &str,
        body: Option<String>,
        caller_headers: BTreeMap<String, String>,
    ) -> Result<Value> {
        let Some(meta) = self.store.meta(service).await else {
            return self
                .request_failure(service, None, format!("credential '{service}' not found"), &[])
                .await;
        };
        if !meta.active {
            return self
                .request_failure(service, None, format!("credential '{service}' is inactive"), &[])
                .await;
        }
        if meta.service_type != ServiceType::ApiKey {
            return self
                .request_failure(
                    service,
                    None,
                    format!("credential '{service}' is not an api_key"),
                    &[],
                )
                .await;
        }

        let payload = match self.store.get(service).await {
            Ok(Some((_, payload))) => payload,
            Ok(None) => {
                return self
                    .request_failure(
                        service,
                        None,
                        format!("credential '{service}' not found"),
                        &[],
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .request_failure(service, None, format!("decryption failed: {e:#}"), &[])
                    .await;
            }
        };
        let secrets = payload.secret_values();
        let SecretPayload::ApiKey { headers: stored_headers, .. } = payload else {
            return self
                .request_failure(
                    service,
                    None,
                    format!("credential '{service}' is not an api_key"),
                    &secrets,
                )
                .await;
        };

        let Ok(http_method) = reqwest::Method::from_bytes(method.to_uppercase().as_bytes()) else {
            return self
                .request_failure(service, None, format!("invalid HTTP method '{method}'"), &secrets)
                .await;
        };

        // Stored headers win on conflict.
        let mut merged = caller_headers;
        for (name, value) in stored_headers {
            merged.insert(name, value);
        }

        let mut request = self.http.request(http_method.clone(), url);
        for (name, value) in &merged {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(service, %http_method, url, "issuing outbound request");
        match request.send().await {
            Ok(response) => {
                let http_status = response.status().as_u16();
                let body = match response.text().await {
                    Ok(text) => text,
                    Err(e) => {
                        return self
                            .request_failure(
                                service,
                                Some(format!("{http_method} {url}")),
                                format!("failed to read response body: {e}"),
                                &secrets,
                            )
                            .await;
                    }
                };

                self.audit
                    .append(
                        audit::ACTION_USED,
                        service,
                        AuditResult::Success,
                        None,
                        Some(format!("{http_method} {url} -> {http_status}")),
                    )
                    .await?;

                let mut result = json!({
                    "status": "success",
                    "http_status": http_status,
                    "body": body,
                });
                scrub_value(&mut result, &secrets);
                Ok(result)
            }
            Err(e) => {
                self.request_failure(
                    service,
                    Some(format!("{http_method} {url}")),
                    format!("request failed: {e}"),
                    &secrets,
                )
                .await
            }
        }
    }

    async fn request_failure(
        &self,
        service: &str,
        context: Option<String>,
        reason: String,
        secrets: &[String],
    ) -> Result<Value> {
        let details = match context {
            Some(ctx) => format!("{ctx}: {reason}"),
            None => reason.clone(),
        };
        self.audit
            .append(
                audit::ACTION_USED,
                service,
                AuditResult::Failure,
                None,
                Some(scrub(&details, secrets)),
            )
            .await?;
        let mut response = json!({"status": "failure", "message": reason});
        scrub_value(&mut response, secrets);
        Ok(response)
    }

    // ── add ──────────────────────────────────────────────────────────────────

    /// Register a fresh pending token with the gateway and return the form URL
    /// plus the handle to await.
    pub async fn begin_add(
        &self,
        site_id: Option<&str>,
        service_type: Option<&str>,
    ) -> Result<(String, PendingAdd)> {
        let gateway = self.gateway().await?;
        let token = Uuid::new_v4().to_string();
        let pending = gateway.register(&token);
        let url = gateway.form_url(&token, site_id, service_type);
        Ok((url, pending))
    }

    /// Start (or reuse) the gateway, open the entry form, and wait for the
    /// submission bearing this call's token. The secret is typed into the
    /// form and never appears in this response.
    pub async fn add(&self, site_id: Option<&str>, service_type: Option<&str>) -> Result<Value> {
        let (url, pending) = self.begin_add(site_id, service_type).await?;

        if self.opens_browser() {
            if let Err(e) = open::that(&url) {
                debug!(error = %e, "could not open a browser; visit the form URL manually");
            }
        }
        info!(%url, "waiting for credential entry form");

        match pending.wait().await {
            AddResolution::Submitted(site) => Ok(json!({
                "status": "success",
                "site_id": site,
                "message": format!("credential '{site}' stored"),
            })),
            AddResolution::Timeout => Ok(json!({
                "status": "timeout",
                "message": "entry form was not submitted within the time limit",
            })),
        }
    }
}
