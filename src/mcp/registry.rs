//! MCP registry: server lifecycle, tool catalog, busy-state tracking
//!
//! The registry is the only component that spawns and reaps MCP processes.
//! Tools are addressed as `server.tool`. A tool is flagged in-use for the
//! duration of a call and released on every exit path; a server is busy iff
//! any of its tools is in use.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::McpConfig;
use super::client::{McpClient, McpTool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Available,
    Busy,
    Offline,
}

/// Result of a tool invocation, success or failure. This is the shape that
/// flows into prompts, SSE events, and conversation storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub server: String,
    pub tool: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub execution_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.server, self.tool)
    }

    pub fn failure(
        server: &str,
        tool: &str,
        input: Value,
        error: impl Into<String>,
        elapsed: f64,
    ) -> Self {
        Self {
            success: false,
            server: server.to_string(),
            tool: tool.to_string(),
            input,
            output: None,
            execution_time_seconds: elapsed,
            error: Some(error.into()),
        }
    }

    /// A tool counts as failed when the outer envelope says so or the inner
    /// JSON carries `success: false` / an `error` field. Downstream prompts
    /// must present failures honestly rather than fabricate data.
    pub fn is_failed(&self) -> bool {
        if !self.success {
            return true;
        }
        match self.extracted_output() {
            Value::Object(map) => {
                map.get("success").and_then(|v| v.as_bool()) == Some(false)
                    || map.contains_key("error")
            }
            _ => false,
        }
    }

    /// Unwrap the MCP content envelope: `output.content[0].text`, parsed as
    /// JSON when possible, otherwise the raw text. Used both for prompt
    /// context and for `$step_N` references in multi-step plans.
    pub fn extracted_output(&self) -> Value {
        let Some(output) = &self.output else {
            return Value::Null;
        };

        if let Some(content) = output.get("content").and_then(|c| c.as_array()) {
            if let Some(text) = content
                .first()
                .and_then(|item| item.get("text"))
                .and_then(|t| t.as_str())
            {
                return serde_json::from_str(text)
                    .unwrap_or_else(|_| Value::String(text.to_string()));
            }
        }

        output.clone()
    }
}

#[derive(Default)]
struct BusyState {
    tools_in_use: HashMap<String, bool>,
    server_status: HashMap<String, ServerStatus>,
}

/// Releases a tool's in-use flag on drop, so the flag clears even when the
/// calling future is cancelled mid-call.
struct BusyGuard {
    state: Arc<Mutex<BusyState>>,
    full_name: String,
    server: String,
}

impl BusyGuard {
    fn acquire(state: Arc<Mutex<BusyState>>, full_name: &str, server: &str) -> Self {
        {
            let mut s = state.lock().unwrap();
            s.tools_in_use.insert(full_name.to_string(), true);
            s.server_status
                .insert(server.to_string(), ServerStatus::Busy);
        }
        Self {
            state,
            full_name: full_name.to_string(),
            server: server.to_string(),
        }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.tools_in_use.insert(self.full_name.clone(), false);

        let server_prefix = format!("{}.", self.server);
        let any_busy = s
            .tools_in_use
            .iter()
            .any(|(name, in_use)| *in_use && name.starts_with(&server_prefix));
        s.server_status.insert(
            self.server.clone(),
            if any_busy {
                ServerStatus::Busy
            } else {
                ServerStatus::Available
            },
        );
    }
}

/// Registry over all configured MCP servers.
pub struct McpRegistry {
    clients: HashMap<String, Arc<McpClient>>,
    all_tools: HashMap<String, McpTool>,
    /// Startup order, for reverse-order shutdown.
    server_order: Vec<String>,
    server_ports: HashMap<String, Option<u16>>,
    base_port: u16,
    busy: Arc<Mutex<BusyState>>,
}

impl McpRegistry {
    /// Empty registry, for configurations without MCP servers (and tests).
    pub fn disabled() -> Self {
        Self {
            clients: HashMap::new(),
            all_tools: HashMap::new(),
            server_order: vec![],
            server_ports: HashMap::new(),
            base_port: 0,
            busy: Arc::new(Mutex::new(BusyState::default())),
        }
    }

    /// Start every configured server, run handshakes, and cache the tool
    /// catalog. A server that fails to start is marked offline; the rest
    /// continue.
    pub async fn initialize(config: &McpConfig) -> Self {
        let mut registry = Self::disabled();
        registry.base_port = config.base_port;

        for (index, server_config) in config.servers.iter().enumerate() {
            let name = server_config.name.clone();
            let assigned_port = Some(config.base_port + index as u16);

            match McpClient::start(server_config, assigned_port).await {
                Ok(client) => {
                    info!(server = name, port = ?client.port, "MCP server started");
                    registry.server_ports.insert(name.clone(), client.port);

                    for tool in client.tools.values() {
                        let full_name = tool.full_name();
                        registry.all_tools.insert(full_name.clone(), tool.clone());
                        registry
                            .busy
                            .lock()
                            .unwrap()
                            .tools_in_use
                            .insert(full_name, false);
                    }

                    registry
                        .busy
                        .lock()
                        .unwrap()
                        .server_status
                        .insert(name.clone(), ServerStatus::Available);
                    registry.server_order.push(name.clone());
                    registry.clients.insert(name, Arc::new(client));
                }
                Err(e) => {
                    error!(server = name, error = %e, "MCP server failed to start");
                    registry
                        .busy
                        .lock()
                        .unwrap()
                        .server_status
                        .insert(name, ServerStatus::Offline);
                }
            }
        }

        registry
    }

    /// Stop subprocesses in reverse startup order.
    pub async fn shutdown(&self) {
        for name in self.server_order.iter().rev() {
            if let Some(client) = self.clients.get(name) {
                client.stop().await;
                info!(server = name, "MCP server stopped");
            }
        }
    }

    pub fn all_tools(&self) -> &HashMap<String, McpTool> {
        &self.all_tools
    }

    pub fn get_tool(&self, full_name: &str) -> Option<&McpTool> {
        self.all_tools.get(full_name)
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.clients.contains_key(name)
    }

    /// Tool checking is worthwhile iff anything is registered; the LLM
    /// decides from there whether a tool actually fires.
    pub fn should_use_tools(&self) -> bool {
        !self.all_tools.is_empty()
    }

    /// Find the first registered tool whose full name contains `fragment`.
    pub fn find_tool_by_fragment(&self, fragment: &str) -> Option<String> {
        let fragment = fragment.to_lowercase();
        self.all_tools
            .keys()
            .find(|name| name.to_lowercase().contains(&fragment))
            .cloned()
    }

    /// Call a tool by full name, measuring wall-clock time and tracking the
    /// busy state for the duration. Always returns a well-formed outcome.
    pub async fn call_tool(&self, full_name: &str, arguments: Value) -> ToolOutcome {
        let Some(tool) = self.all_tools.get(full_name) else {
            return ToolOutcome::failure(
                "",
                full_name,
                arguments,
                format!("Unknown tool: {full_name}"),
                0.0,
            );
        };

        let Some(client) = self.clients.get(&tool.server_name) else {
            return ToolOutcome::failure(
                &tool.server_name,
                &tool.name,
                arguments,
                format!("Server not running: {}", tool.server_name),
                0.0,
            );
        };

        let _guard = BusyGuard::acquire(self.busy.clone(), full_name, &tool.server_name);
        let start = Instant::now();
        let result = client.call_tool(&tool.name, arguments.clone()).await;
        let elapsed = (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;

        match result {
            Ok(output) => ToolOutcome {
                success: true,
                server: tool.server_name.clone(),
                tool: tool.name.clone(),
                input: arguments,
                output: Some(output),
                execution_time_seconds: elapsed,
                error: None,
            },
            Err(e) => {
                warn!(tool = full_name, error = %e, "tool call failed");
                ToolOutcome::failure(
                    &tool.server_name,
                    &tool.name,
                    arguments,
                    e.to_string(),
                    elapsed,
                )
            }
        }
    }

    /// Compact one-line-per-tool listing for prompts.
    pub fn get_tool_descriptions(&self) -> String {
        if self.all_tools.is_empty() {
            return String::new();
        }

        let mut lines = vec!["Available tools:".to_string()];
        let mut names: Vec<_> = self.all_tools.keys().collect();
        names.sort();
        for full_name in names {
            let tool = &self.all_tools[full_name];
            let params = tool
                .input_schema
                .get("properties")
                .and_then(|p| p.as_object())
                .map(|props| {
                    props
                        .iter()
                        .map(|(name, info)| {
                            let ty = info.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                            format!("{name}: {ty}")
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            lines.push(format!("  - {full_name}({params}): {}", tool.description));
        }
        lines.join("\n")
    }

    /// Comprehensive per-server, per-tool catalog (types, descriptions,
    /// enums, defaults, required flags). Used as prompt context for the
    /// tool-selection LLM calls.
    pub fn get_detailed_tool_info(&self) -> String {
        if self.clients.is_empty() {
            return String::new();
        }

        let mut lines = vec!["# Available MCP Servers and Tools\n".to_string()];

        for name in &self.server_order {
            let Some(client) = self.clients.get(name) else {
                continue;
            };
            lines.push(format!("## Server: {name}"));
            lines.push(format!("   Port: {:?}", self.server_ports.get(name).copied().flatten()));
            lines.push("   Tools:".to_string());

            let mut tool_names: Vec<_> = client.tools.keys().collect();
            tool_names.sort();
            for tool_name in tool_names {
                let tool = &client.tools[tool_name];
                lines.push(format!("\n   ### {name}.{tool_name}"));
                lines.push(format!("       Description: {}", tool.description));

                let properties = tool
                    .input_schema
                    .get("properties")
                    .and_then(|p| p.as_object());
                let required: Vec<&str> = tool
                    .input_schema
                    .get("required")
                    .and_then(|r| r.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();

                match properties {
                    Some(props) if !props.is_empty() => {
                        lines.push("       Parameters:".to_string());
                        for (param, info) in props {
                            let ty = info.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                            let req = if required.contains(&param.as_str()) {
                                "(required)"
                            } else {
                                "(optional)"
                            };
                            lines.push(format!("         - {param}: {ty} {req}"));
                            if let Some(desc) = info.get("description").and_then(|d| d.as_str()) {
                                lines.push(format!("           Description: {desc}"));
                            }
                            if let Some(values) = info.get("enum") {
                                lines.push(format!("           Allowed values: {values}"));
                            }
                            if let Some(default) = info.get("default") {
                                lines.push(format!("           Default: {default}"));
                            }
                        }
                    }
                    _ => lines.push("       Parameters: None".to_string()),
                }
            }
            lines.push(String::new());
        }

        lines.join("\n")
    }

    /// Snapshot of tools currently flagged in-use (for status and tests).
    pub fn tools_in_use(&self) -> Vec<String> {
        self.busy
            .lock()
            .unwrap()
            .tools_in_use
            .iter()
            .filter(|(_, in_use)| **in_use)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Registry status document for the read-only HTTP endpoint.
    pub fn status(&self) -> Value {
        let busy = self.busy.lock().unwrap();

        let server_details: Vec<Value> = self
            .server_order
            .iter()
            .map(|name| {
                let prefix = format!("{name}.");
                let server_tools: Vec<&String> = self
                    .all_tools
                    .keys()
                    .filter(|t| t.starts_with(&prefix))
                    .collect();
                let busy_tools = server_tools
                    .iter()
                    .filter(|t| busy.tools_in_use.get(**t).copied().unwrap_or(false))
                    .count();
                json!({
                    "name": name,
                    "port": self.server_ports.get(name).copied().flatten(),
                    "status": busy.server_status.get(name).copied().unwrap_or(ServerStatus::Offline),
                    "tool_count": server_tools.len(),
                    "busy_tools": busy_tools,
                })
            })
            .collect();

        let tool_details: Vec<Value> = self
            .all_tools
            .iter()
            .map(|(full_name, tool)| {
                json!({
                    "name": full_name,
                    "description": tool.description,
                    "server": tool.server_name,
                    "port": self.server_ports.get(&tool.server_name).copied().flatten(),
                    "in_use": busy.tools_in_use.get(full_name).copied().unwrap_or(false),
                })
            })
            .collect();

        json!({
            "enabled": !self.clients.is_empty(),
            "servers": self.server_order,
            "server_details": server_details,
            "base_port": self.base_port,
            "tools": self.all_tools.keys().collect::<Vec<_>>(),
            "tools_in_use": busy
                .tools_in_use
                .iter()
                .filter(|(_, v)| **v)
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>(),
            "tool_details": tool_details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_fails_deterministically() {
        let registry = McpRegistry::disabled();
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let outcome = rt.block_on(registry.call_tool("nope.missing", json!({})));
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("Unknown tool"));
    }

    #[test]
    fn test_extracted_output_unwraps_envelope() {
        let outcome = ToolOutcome {
            success: true,
            server: "websearch".into(),
            tool: "search".into(),
            input: json!({}),
            output: Some(json!({
                "content": [{"type": "text", "text": "{\"results\": [1, 2]}"}]
            })),
            execution_time_seconds: 0.1,
            error: None,
        };
        assert_eq!(outcome.extracted_output(), json!({"results": [1, 2]}));
    }

    #[test]
    fn test_extracted_output_plain_text() {
        let outcome = ToolOutcome {
            success: true,
            server: "s".into(),
            tool: "t".into(),
            input: json!({}),
            output: Some(json!({
                "content": [{"type": "text", "text": "just text"}]
            })),
            execution_time_seconds: 0.0,
            error: None,
        };
        assert_eq!(outcome.extracted_output(), json!("just text"));
    }

    #[test]
    fn test_inner_failure_detected() {
        let outcome = ToolOutcome {
            success: true,
            server: "s".into(),
            tool: "t".into(),
            input: json!({}),
            output: Some(json!({
                "content": [{"type": "text", "text": "{\"success\": false, \"error\": \"network\"}"}]
            })),
            execution_time_seconds: 0.0,
            error: None,
        };
        assert!(outcome.is_failed());
    }

    #[test]
    fn test_outer_failure_detected() {
        let outcome =
            ToolOutcome::failure("websearch", "search", json!({}), "network", 0.5);
        assert!(outcome.is_failed());
        assert_eq!(outcome.full_name(), "websearch.search");
    }

    #[test]
    fn test_busy_guard_releases_on_drop() {
        let state = Arc::new(Mutex::new(BusyState::default()));
        {
            let _guard = BusyGuard::acquire(state.clone(), "srv.tool", "srv");
            let s = state.lock().unwrap();
            assert_eq!(s.tools_in_use.get("srv.tool"), Some(&true));
            assert_eq!(s.server_status.get("srv"), Some(&ServerStatus::Busy));
        }
        let s = state.lock().unwrap();
        assert_eq!(s.tools_in_use.get("srv.tool"), Some(&false));
        assert_eq!(s.server_status.get("srv"), Some(&ServerStatus::Available));
    }
}
