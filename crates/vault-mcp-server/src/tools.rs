//! Tool definitions exposed via MCP `tools/list`.

use serde_json::{json, Value};

use crate::protocol::{InputSchema, Tool};

fn tool(name: &str, description: &str, properties: Value, required: Vec<&str>) -> Tool {
    let props = properties.as_object().cloned().unwrap_or_default();
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: InputSchema {
            schema_type: "object".to_string(),
            properties: props,
            required: required.into_iter().map(|s| s.to_string()).collect(),
        },
    }
}

/// The five broker tools.
pub fn all_tools() -> Vec<Tool> {
    vec![
        tool(
            "add",
            "Add a credential. Opens a local entry form in the operator's browser; \
             the secret is typed there and never passes through this channel. \
             Waits up to five minutes for the form to be submitted.",
            json!({
                "site_id": {"type": "string", "description": "Suggested site identifier, pre-filled in the form"},
                "service_type": {"type": "string", "enum": ["web_login", "api_key"], "description": "Suggested credential type, pre-filled in the form"}
            }),
            vec![],
        ),
        tool(
            "login",
            "Log into a site using a stored web_login credential. The broker drives \
             the browser itself; the response never contains the password or email.",
            json!({
                "site_id": {"type": "string", "description": "Site identifier of the stored credential"},
                "bot_id": {"type": "string", "description": "Optional caller identity recorded in the audit log"}
            }),
            vec!["site_id"],
        ),
        tool(
            "api_request",
            "Call an API using a stored api_key credential. Stored headers are merged \
             into the request (stored wins); the key is scrubbed from the response.",
            json!({
                "service": {"type": "string", "description": "Site identifier of the stored credential"},
                "url": {"type": "string", "description": "Request URL"},
                "method": {"type": "string", "description": "HTTP method (default GET)"},
                "body": {"type": "string", "description": "Optional request body"},
                "headers": {"type": "object", "description": "Extra request headers; stored headers win on conflict"}
            }),
            vec!["service", "url"],
        ),
        tool(
            "list",
            "List stored credentials (site identifier, type, active flag). Never decrypts.",
            json!({}),
            vec![],
        ),
        tool(
            "status",
            "Show one credential's metadata plus its audit count and last use. Never decrypts.",
            json!({
                "site_id": {"type": "string", "description": "Site identifier of the stored credential"}
            }),
            vec!["site_id"],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_tools_with_expected_names() {
        let tools = all_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["add", "login", "api_request", "list", "status"]);
    }

    #[test]
    fn required_params_are_declared() {
        let tools = all_tools();
        let login = tools.iter().find(|t| t.name == "login").unwrap();
        assert_eq!(login.input_schema.required, vec!["site_id"]);
        let api = tools.iter().find(|t| t.name == "api_request").unwrap();
        assert_eq!(api.input_schema.required, vec!["service", "url"]);
    }
}
