//! Process-wide tool registry.
//!
//! Maps tool name → `ToolDefinition`. All mutation goes through `register`
//! and `unregister`; every read hands back clones, so callers never hold a
//! reference into the map.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A tool exposed through the MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub registered_at: DateTime<Utc>,
    /// Id of the collaborator that registered the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl ToolDefinition {
    /// Shape used in `tools/list` responses.
    pub fn to_mcp(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

fn default_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, ToolDefinition>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every component in this process.
    pub fn shared() -> ToolRegistry {
        static SHARED: OnceLock<ToolRegistry> = OnceLock::new();
        SHARED.get_or_init(ToolRegistry::new).clone()
    }

    /// Insert or replace a tool. Returns the stored definition.
    pub fn register(
        &self,
        name: &str,
        description: &str,
        input_schema: Option<Value>,
        owner: Option<&str>,
    ) -> ToolDefinition {
        let def = ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: input_schema
                .filter(|s| s.is_object())
                .unwrap_or_else(default_schema),
            registered_at: Utc::now(),
            owner: owner.map(String::from),
        };
        let previous = {
            let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
            tools.insert(def.name.clone(), def.clone())
        };
        if previous.is_some() {
            tracing::info!("registry: replaced tool '{}'", name);
        } else {
            tracing::info!("registry: registered tool '{}'", name);
        }
        def
    }

    pub fn unregister(&self, name: &str) -> Option<ToolDefinition> {
        let removed = {
            let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
            tools.remove(name)
        };
        if removed.is_some() {
            tracing::info!("registry: unregistered tool '{}'", name);
        }
        removed
    }

    /// Remove every tool registered by `owner`. Returns the removed definitions.
    pub fn unregister_owned_by(&self, owner: &str) -> Vec<ToolDefinition> {
        let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
        let names: Vec<String> = tools
            .values()
            .filter(|t| t.owner.as_deref() == Some(owner))
            .map(|t| t.name.clone())
            .collect();
        names.iter().filter_map(|n| tools.remove(n)).collect()
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        tools.get(name).cloned()
    }

    /// Snapshot of every tool, oldest registration first.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<ToolDefinition> = tools.values().cloned().collect();
        all.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        all
    }

    pub fn len(&self) -> usize {
        let tools = self.tools.read().unwrap_or_else(|p| p.into_inner());
        tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
