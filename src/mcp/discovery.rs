//! Discovery handshake run after a streaming session connects.
//!
//! `initialize` first, then `tools/list`. Results are published as
//! `handshake` events; nothing here can fail the connection itself.

use serde_json::{json, Map, Value};

use super::client::McpSession;
use super::jsonrpc::PROTOCOL_VERSION;
use crate::events::Topic;

/// Run the handshake on a connected session and publish what it finds.
pub async fn run_handshake(session: &McpSession) {
    let session_id = session.id();
    let events = session.events();

    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });
    let init = match session.call("initialize", params).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("MCP discovery: initialize failed on session {}: {}", session_id, e);
            return;
        }
    };
    events.emit(
        Topic::Handshake,
        json!({ "sessionId": session_id, "subtype": "initialization", "result": init }),
    );

    let listed = match session.call("tools/list", json!({})).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("MCP discovery: tools/list failed on session {}: {}", session_id, e);
            return;
        }
    };

    let mut payload = tools_discovered(init.get("serverInfo").cloned().unwrap_or(Value::Null), &listed);
    payload["sessionId"] = json!(session_id);
    tracing::info!(
        "MCP discovery: session {} offers {} tool(s)",
        session_id,
        payload["toolCount"]
    );
    events.emit(Topic::Handshake, payload);
}

/// Build the `tools_discovered` payload from a `tools/list` result.
pub fn tools_discovered(server_info: Value, listed: &Value) -> Value {
    let tools: Vec<Value> = listed
        .get("tools")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let names: Vec<&str> = tools
        .iter()
        .filter_map(|t| t.get("name").and_then(Value::as_str))
        .collect();

    let example_call = tools.first().map_or(Value::Null, |first| {
        let schema = first.get("inputSchema").cloned().unwrap_or(Value::Null);
        json!({
            "method": "tools/call",
            "params": {
                "name": first.get("name").cloned().unwrap_or(Value::Null),
                "arguments": example_arguments(&schema),
            }
        })
    });

    json!({
        "subtype": "tools_discovered",
        "serverInfo": server_info,
        "toolCount": tools.len(),
        "toolNames": names,
        "exampleCall": example_call,
        "tools": tools,
    })
}

/// Synthesize example arguments from a JSON schema's `properties`.
pub fn example_arguments(schema: &Value) -> Value {
    let mut args = Map::new();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in properties {
            args.insert(name.clone(), example_value(prop));
        }
    }
    Value::Object(args)
}

fn example_value(prop: &Value) -> Value {
    match prop.get("type").and_then(Value::as_str) {
        Some("string") => {
            if let Some(first) = prop.get("enum").and_then(Value::as_array).and_then(|e| e.first()) {
                return first.clone();
            }
            prop.get("description")
                .and_then(Value::as_str)
                .map_or_else(|| json!("example"), |d| json!(d))
        }
        Some("number") | Some("integer") => json!(123),
        Some("boolean") => json!(true),
        Some("object") => json!({}),
        Some("array") => json!([]),
        _ => json!("example"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_and_integer_properties() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "string", "enum": ["x", "y"]},
                "b": {"type": "integer"}
            }
        });
        assert_eq!(example_arguments(&schema), json!({"a": "x", "b": 123}));
    }

    #[test]
    fn every_schema_type_has_a_placeholder() {
        let schema = json!({
            "properties": {
                "s": {"type": "string", "description": "city name"},
                "plain": {"type": "string"},
                "n": {"type": "number"},
                "flag": {"type": "boolean"},
                "obj": {"type": "object"},
                "list": {"type": "array"},
                "odd": {"type": "null"}
            }
        });
        assert_eq!(
            example_arguments(&schema),
            json!({
                "s": "city name",
                "plain": "example",
                "n": 123,
                "flag": true,
                "obj": {},
                "list": [],
                "odd": "example"
            })
        );
    }

    #[test]
    fn schema_without_properties_gives_empty_object() {
        assert_eq!(example_arguments(&json!({"type": "object"})), json!({}));
        assert_eq!(example_arguments(&Value::Null), json!({}));
    }

    #[test]
    fn discovered_payload_uses_first_tool_only() {
        let listed = json!({"tools": [
            {"name": "weather", "description": "", "inputSchema": {"properties": {"city": {"type": "string"}}}},
            {"name": "sum", "description": "", "inputSchema": {"properties": {"a": {"type": "number"}}}}
        ]});
        let payload = tools_discovered(json!({"name": "remote"}), &listed);
        assert_eq!(payload["toolCount"], 2);
        assert_eq!(payload["toolNames"], json!(["weather", "sum"]));
        assert_eq!(
            payload["exampleCall"],
            json!({"method": "tools/call", "params": {"name": "weather", "arguments": {"city": "example"}}})
        );
    }

    #[test]
    fn no_tools_means_null_example() {
        let payload = tools_discovered(Value::Null, &json!({"tools": []}));
        assert_eq!(payload["toolCount"], 0);
        assert!(payload["exampleCall"].is_null());
    }
}
