//! MCP serve loop — JSON-RPC 2.0 over stdio.
//!
//! One LF-delimited request per line on stdin, one response line on stdout.
//! All logging goes to stderr; stdout carries protocol frames only.

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::protocol::{
    CallToolParams, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    ServerCapabilities, ServerInfo, ToolsCapability, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::tools::all_tools;
use crate::Broker;

pub struct McpServer {
    broker: Broker,
    initialized: bool,
}

impl McpServer {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            initialized: false,
        }
    }

    /// Read requests from stdin until EOF.
    pub async fn run(&mut self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                info!("client disconnected");
                break;
            }

            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            if let Some(response) = self.handle_message(message).await {
                let encoded = serde_json::to_string(&response)?;
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        Ok(())
    }

    async fn handle_message(&mut self, message: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "unparseable request");
                return Some(JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("parse error: {e}"),
                ));
            }
        };

        let id = request.id.clone();

        // Notifications carry no id and get no response.
        if id.is_none() {
            self.handle_notification(&request.method);
            return None;
        }

        match self.handle_request(&request.method, request.params).await {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            Err((code, message)) => Some(JsonRpcResponse::error(id, code, message)),
        }
    }

    fn handle_notification(&mut self, method: &str) {
        match method {
            "notifications/initialized" => {
                info!("client initialized");
                self.initialized = true;
            }
            "notifications/cancelled" => {
                debug!("request cancelled");
            }
            _ => {
                debug!(method, "unknown notification");
            }
        }
    }

    async fn handle_request(
        &mut self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, (i32, String)> {
        match method {
            "initialize" => self.handle_initialize(),
            "tools/list" => {
                let result = ListToolsResult { tools: all_tools() };
                serde_json::to_value(result)
                    .map_err(|e| (INTERNAL_ERROR, format!("serialization error: {e}")))
            }
            "tools/call" => self.handle_call_tool(params).await,
            "ping" => Ok(json!({})),
            _ => {
                warn!(method, "unknown method");
                Err((METHOD_NOT_FOUND, format!("method not found: {method}")))
            }
        }
    }

    fn handle_initialize(&mut self) -> Result<Value, (i32, String)> {
        info!("initializing MCP server");
        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {}),
            },
            server_info: ServerInfo {
                name: "vault-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        serde_json::to_value(result)
            .map_err(|e| (INTERNAL_ERROR, format!("serialization error: {e}")))
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, (i32, String)> {
        let params: CallToolParams = match params {
            Some(p) => serde_json::from_value(p)
                .map_err(|e| (INVALID_PARAMS, format!("invalid params: {e}")))?,
            None => return Err((INVALID_PARAMS, "missing params".to_string())),
        };

        info!(tool = %params.name, "tool call");
        let result = self.broker.handle_tool(&params.name, &params.arguments).await;

        serde_json::to_value(result)
            .map_err(|e| (INTERNAL_ERROR, format!("serialization error: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MasterKey;
    use crate::store::{AuditLog, CredentialStore};

    async fn server() -> (McpServer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path(), MasterKey::from([1u8; 32])).unwrap();
        let audit = AuditLog::open(dir.path()).unwrap();
        let broker = Broker::new(store, audit)
            .with_gateway_port(0)
            .with_open_browser(false);
        (McpServer::new(broker), dir)
    }

    #[tokio::test]
    async fn initialize_lists_capabilities() {
        let (mut srv, _dir) = server().await;
        let resp = srv
            .handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#)
            .await
            .unwrap();
        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "vault-mcp");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_exposes_five_tools() {
        let (mut srv, _dir) = server().await;
        let resp = srv
            .handle_message(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await
            .unwrap();
        let tools = resp.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 5);
    }

    #[tokio::test]
    async fn tools_call_routes_to_the_broker() {
        let (mut srv, _dir) = server().await;
        let resp = srv
            .handle_message(
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"list","arguments":{}}}"#,
            )
            .await
            .unwrap();
        let result = resp.result.unwrap();
        // is_error is skipped when false.
        assert!(result.get("is_error").is_none());
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("credentials"));
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (mut srv, _dir) = server().await;
        let resp = srv
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(resp.is_none());
        assert!(srv.initialized);
    }

    #[tokio::test]
    async fn unknown_method_and_parse_errors_are_reported() {
        let (mut srv, _dir) = server().await;

        let unknown = srv
            .handle_message(r#"{"jsonrpc":"2.0","id":4,"method":"bogus"}"#)
            .await
            .unwrap();
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let garbled = srv.handle_message("not json at all").await.unwrap();
        assert_eq!(garbled.error.unwrap().code, PARSE_ERROR);
    }
}
