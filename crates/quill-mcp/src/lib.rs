//! MCP-backed tool host.
//!
//! Implements the tool registry and executor interfaces on top of HTTP MCP
//! servers speaking JSON-RPC (`tools/list`, `tools/call`). Server
//! definitions come from layered `.mcp.json` files; tool names offered to
//! the model are namespaced `server__tool` so calls can be routed back to
//! the right server.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use quill_core::{
    Result, ToolCallRequest, ToolDefinition, ToolExecutor, ToolRegistry, ToolResult,
};
use quill_observe::Observer;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Separator between the server id and the tool's own name in the
/// namespaced form advertised to the model.
pub const TOOL_NAMESPACE_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServer {
    pub id: String,
    pub name: String,
    pub url: String,
    pub enabled: bool,
}

impl Default for McpServer {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            url: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    pub servers: Vec<McpServer>,
}

pub fn project_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".mcp.json")
}

pub fn user_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())?;
    Some(Path::new(&home).join(".quill/mcp.json"))
}

pub fn user_local_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())?;
    Some(Path::new(&home).join(".quill/mcp.local.json"))
}

fn load_config_if_exists(path: &Path) -> Result<McpConfig> {
    if !path.exists() {
        return Ok(McpConfig::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid MCP config {}", path.display()))
}

/// Merge config layers in precedence order (earliest wins on id clashes
/// after sorting, matching how project entries shadow user entries).
pub fn merge_server_layers(layers: Vec<McpConfig>) -> Vec<McpServer> {
    let mut merged: Vec<McpServer> = Vec::new();
    for layer in layers {
        for server in layer.servers {
            // Later layers override earlier ones with the same id.
            merged.retain(|existing| existing.id != server.id);
            merged.push(server);
        }
    }
    merged.sort_by(|a, b| a.id.cmp(&b.id));
    merged
}

/// All configured servers: user, user-local, then project (highest
/// precedence).
pub fn load_servers(workspace: &Path) -> Result<Vec<McpServer>> {
    let mut layers = Vec::new();
    if let Some(path) = user_config_path() {
        layers.push(load_config_if_exists(&path)?);
    }
    if let Some(path) = user_local_config_path() {
        layers.push(load_config_if_exists(&path)?);
    }
    layers.push(load_config_if_exists(&project_config_path(workspace))?);
    Ok(merge_server_layers(layers))
}

pub fn save_project_config(workspace: &Path, config: &McpConfig) -> Result<()> {
    let path = project_config_path(workspace);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(config)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

pub fn add_server(workspace: &Path, server: McpServer) -> Result<()> {
    if server.id.trim().is_empty() {
        return Err(anyhow!("server id cannot be empty"));
    }
    let mut cfg = load_config_if_exists(&project_config_path(workspace))?;
    cfg.servers.retain(|existing| existing.id != server.id);
    cfg.servers.push(server);
    save_project_config(workspace, &cfg)
}

pub fn remove_server(workspace: &Path, id: &str) -> Result<bool> {
    let mut cfg = load_config_if_exists(&project_config_path(workspace))?;
    let before = cfg.servers.len();
    cfg.servers.retain(|existing| existing.id != id);
    let removed = cfg.servers.len() != before;
    if removed {
        save_project_config(workspace, &cfg)?;
    }
    Ok(removed)
}

/// Routes namespaced tool calls to their MCP servers over JSON-RPC.
pub struct McpToolHost {
    servers: Vec<McpServer>,
    client: reqwest::blocking::Client,
    observer: Option<Arc<Observer>>,
    /// Discovered definitions, fetched lazily and reused for the rest of
    /// the host's lifetime.
    cached_tools: Mutex<Option<Vec<ToolDefinition>>>,
}

impl McpToolHost {
    pub fn new(servers: Vec<McpServer>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            servers: servers.into_iter().filter(|s| s.enabled).collect(),
            client,
            observer: None,
            cached_tools: Mutex::new(None),
        })
    }

    pub fn from_workspace(workspace: &Path) -> Result<Self> {
        Self::new(load_servers(workspace)?)
    }

    pub fn with_observer(mut self, observer: Arc<Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }

    fn rpc(&self, url: &str, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .client
            .post(url)
            .json(&body)
            .send()
            .with_context(|| format!("{method} request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{method} request to {url} failed"))?
            .json()
            .with_context(|| format!("{method} response from {url} was not JSON"))?;
        if let Some(error) = response.get("error")
            && !error.is_null()
        {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown JSON-RPC error");
            bail!("{method} failed: {message}");
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// `tools/list` for one server, namespacing each tool name.
    fn discover_server_tools(&self, server: &McpServer) -> Result<Vec<ToolDefinition>> {
        let result = self.rpc(&server.url, "tools/list", json!({}))?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get("name")?.as_str()?;
                        let description = entry
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let parameters = entry
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object"}));
                        Some(ToolDefinition::function(
                            format!("{}{}{}", server.id, TOOL_NAMESPACE_SEPARATOR, name),
                            description,
                            parameters,
                        ))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    fn server_for_call<'a>(&'a self, namespaced: &str) -> Result<(&'a McpServer, String)> {
        let (server_id, tool_name) = namespaced
            .split_once(TOOL_NAMESPACE_SEPARATOR)
            .ok_or_else(|| anyhow!("tool name '{namespaced}' is not namespaced"))?;
        let server = self
            .servers
            .iter()
            .find(|s| s.id == server_id)
            .ok_or_else(|| anyhow!("no MCP server '{server_id}' for tool '{namespaced}'"))?;
        Ok((server, tool_name.to_owned()))
    }
}

impl ToolRegistry for McpToolHost {
    /// One unreachable server degrades only its own tools; the rest of the
    /// registry stays usable.
    fn list_available_tools(&self) -> Result<Vec<ToolDefinition>> {
        let mut cache = self
            .cached_tools
            .lock()
            .map_err(|_| anyhow!("tool cache lock poisoned"))?;
        if let Some(tools) = cache.as_ref() {
            return Ok(tools.clone());
        }
        let mut tools = Vec::new();
        for server in &self.servers {
            match self.discover_server_tools(server) {
                Ok(discovered) => tools.extend(discovered),
                Err(err) => self.warn(&format!(
                    "skipping MCP server '{}': {err}",
                    server.id
                )),
            }
        }
        *cache = Some(tools.clone());
        Ok(tools)
    }

    fn has_available_tools(&self) -> bool {
        !self.servers.is_empty()
    }
}

impl ToolExecutor for McpToolHost {
    fn execute_tool_call(&self, call: &ToolCallRequest) -> Result<ToolResult> {
        let (server, tool_name) = self.server_for_call(&call.function.name)?;
        let arguments: Value = match serde_json::from_str(&call.function.arguments) {
            Ok(value) => value,
            Err(err) => {
                return Ok(ToolResult::error(
                    call,
                    format!("tool arguments were not valid JSON: {err}"),
                ));
            }
        };
        let result = self.rpc(
            &server.url,
            "tools/call",
            json!({"name": tool_name, "arguments": arguments}),
        )?;
        Ok(map_call_result(call, &result))
    }
}

/// Map an MCP `tools/call` result onto a [`ToolResult`]: text parts joined
/// into the content, `isError` carried over, and the first embedded
/// resource kept for the UI.
fn map_call_result(call: &ToolCallRequest, result: &Value) -> ToolResult {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut texts = Vec::new();
    let mut ui_resource = None;
    if let Some(parts) = result.get("content").and_then(Value::as_array) {
        for part in parts {
            match part.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        texts.push(text.to_owned());
                    }
                }
                Some("resource") => {
                    if ui_resource.is_none() {
                        ui_resource = part.get("resource").cloned();
                    }
                }
                _ => {}
            }
        }
    }
    let content = texts.join("\n");
    let mut mapped = if is_error {
        ToolResult::error(call, content)
    } else {
        ToolResult::ok(call, content)
    };
    mapped.ui_resource = ui_resource;
    mapped
}
