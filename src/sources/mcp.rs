//! MCP client plumbing for external knowledge sources.
//!
//! [`McpConnection`] owns one rmcp client session, started either as a
//! child process speaking stdio or against a streamable-HTTP endpoint.
//! [`McpSource`] combines a connection with a tool name, an argument
//! layout and a [`ResultFormatter`] to implement [`KnowledgeSource`].

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, CallToolResult};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::{StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::adapters::{ArgumentLayout, ResultFormatter};
use super::KnowledgeSource;
use crate::config::SourceConfig;

/// Where the MCP server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum McpTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    Http {
        url: String,
    },
}

impl McpTransport {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        match config.transport.as_str() {
            "stdio" => {
                let command = config
                    .command
                    .clone()
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| anyhow!("command is required for stdio transport"))?;
                Ok(McpTransport::Stdio {
                    command,
                    args: config.args.clone(),
                    working_dir: config.working_dir.clone(),
                })
            }
            "http" => {
                let url = config
                    .url
                    .clone()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| anyhow!("url is required for http transport"))?;
                Ok(McpTransport::Http { url })
            }
            other => bail!("invalid transport '{}': must be stdio or http", other),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            McpTransport::Stdio { .. } => "stdio",
            McpTransport::Http { .. } => "http",
        }
    }
}

/// One client session with an MCP server.
pub struct McpConnection {
    transport: McpTransport,
    client: Mutex<Option<RunningService<RoleClient, ()>>>,
    connected: AtomicBool,
}

impl McpConnection {
    pub fn new(transport: McpTransport) -> Self {
        Self {
            transport,
            client: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &McpTransport {
        &self.transport
    }

    /// Starts the session. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut client = self.client.lock().await;
        if client.is_some() {
            return Ok(());
        }

        let service = match &self.transport {
            McpTransport::Stdio {
                command,
                args,
                working_dir,
            } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                if let Some(dir) = working_dir {
                    cmd.current_dir(dir);
                }
                let child = TokioChildProcess::new(cmd)
                    .with_context(|| format!("Failed to spawn MCP server '{}'", command))?;
                ().serve(child)
                    .await
                    .map_err(|e| anyhow!("MCP handshake failed: {}", e))?
            }
            McpTransport::Http { url } => {
                let transport = StreamableHttpClientTransport::from_uri(url.as_str());
                ().serve(transport)
                    .await
                    .map_err(|e| anyhow!("MCP handshake with {} failed: {}", url, e))?
            }
        };

        *client = Some(service);
        self.connected.store(true, Ordering::SeqCst);
        info!(transport = self.transport.kind(), "MCP client connected");
        Ok(())
    }

    /// Ends the session and, for stdio, stops the child process.
    pub async fn disconnect(&self) -> Result<()> {
        let service = self.client.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|e| anyhow!("MCP shutdown failed: {}", e))?;
            info!(transport = self.transport.kind(), "MCP client disconnected");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Clones the session handle so calls do not hold the lock.
    async fn peer(&self) -> Result<Peer<RoleClient>> {
        self.client
            .lock()
            .await
            .as_ref()
            .map(|service| service.peer().clone())
            .ok_or_else(|| anyhow!("not connected to MCP server"))
    }

    pub async fn list_tools(&self) -> Result<Vec<String>> {
        let tools = self
            .peer()
            .await?
            .list_all_tools()
            .await
            .map_err(|e| anyhow!("Failed to list MCP tools: {}", e))?;
        Ok(tools.into_iter().map(|t| t.name.to_string()).collect())
    }

    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<CallToolResult> {
        self.peer()
            .await?
            .call_tool(CallToolRequestParams {
                name: name.to_string().into(),
                arguments: Some(arguments),
                task: None,
                meta: None,
            })
            .await
            .map_err(|e| anyhow!("MCP tool '{}' failed: {}", name, e))
    }
}

/// Flattens a tool payload into result objects: a list, an object with a
/// `results` array, or a single object.
fn payload_entries(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("results".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    }
}

/// Extracts result objects from structured content, else from JSON text blocks.
pub(crate) fn decode_tool_result(result: &CallToolResult) -> Vec<Value> {
    if let Some(structured) = &result.structured_content {
        return payload_entries(structured.clone());
    }

    let mut entries = Vec::new();
    for content in &result.content {
        let Some(text) = content.deref().as_text() else {
            continue;
        };
        match serde_json::from_str::<Value>(&text.text) {
            Ok(value) => entries.extend(payload_entries(value)),
            Err(e) => warn!(error = %e, "Skipping non-JSON tool output"),
        }
    }
    entries
}

/// A knowledge source backed by one MCP tool.
pub struct McpSource {
    name: String,
    display_name: String,
    connection: McpConnection,
    tool: String,
    layout: ArgumentLayout,
    formatter: ResultFormatter,
}

impl McpSource {
    pub fn new(
        name: impl Into<String>,
        display_name: impl Into<String>,
        connection: McpConnection,
        formatter: ResultFormatter,
    ) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            connection,
            tool: formatter.tool_name().to_string(),
            layout: formatter.layout(),
            formatter,
        }
    }

    /// Builds the source for a `[sources.<name>]` table.
    pub fn from_config(name: &str, config: &SourceConfig) -> Result<Self> {
        let formatter = ResultFormatter::from_adapter(&config.adapter)
            .ok_or_else(|| anyhow!("unknown adapter '{}'", config.adapter))?;
        let display_name = config
            .display_name
            .clone()
            .unwrap_or_else(|| formatter.default_display_name().to_string());
        let connection = McpConnection::new(McpTransport::from_config(config)?);
        Ok(Self::new(name, display_name, connection, formatter))
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    fn format_result(&self, result: &CallToolResult) -> Vec<String> {
        if result.is_error == Some(true) {
            warn!(source = %self.name, tool = %self.tool, "Tool reported an error");
            return Vec::new();
        }
        decode_tool_result(result)
            .iter()
            .filter_map(|entry| self.formatter.format(entry))
            .collect()
    }
}

#[async_trait]
impl KnowledgeSource for McpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    async fn health_check(&self) -> bool {
        if !self.connection.is_connected() {
            return false;
        }
        match self.connection.list_tools().await {
            Ok(_) => true,
            Err(e) => {
                warn!(source = %self.name, error = %e, "Health check failed");
                false
            }
        }
    }

    async fn search_context(&self, query: &str, top_k: usize) -> Vec<String> {
        if !self.connection.is_connected() {
            warn!(source = %self.name, "Source not connected");
            return Vec::new();
        }
        let arguments = self.layout.arguments(query, top_k);
        match self.connection.call_tool(&self.tool, arguments).await {
            Ok(result) => {
                let context = self.format_result(&result);
                debug!(source = %self.name, results = context.len(), "Source search complete");
                context
            }
            Err(e) => {
                warn!(source = %self.name, error = %e, "Source search failed");
                Vec::new()
            }
        }
    }
}
