use crate::mcp::config::{
    McpConfig, ServerConfig, TransportKind, expand_env_map, expand_env_placeholders,
};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::{
    model::{CallToolRequestParam, Tool},
    service::ServiceExt,
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::process::Command;
use url::Url;

/// Pseudo server name under which in-process tools are registered.
pub const NATIVE_SERVER: &str = "native";

/// A tool implemented in-process rather than behind an MCP server.
#[async_trait]
pub trait NativeTool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> serde_json::Value;
    async fn call(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// A running MCP client session with its handler type erased.
pub type DynClientService = rmcp::service::RunningService<
    rmcp::service::RoleClient,
    Box<dyn rmcp::service::DynService<rmcp::service::RoleClient>>,
>;

/// Outcome of connecting every configured server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssemblyReport {
    pub connected: Vec<ConnectedServer>,
    pub failed: Vec<FailedServer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedServer {
    pub name: String,
    pub transport: String,
    pub tool_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedServer {
    pub name: String,
    pub reason: String,
}

/// Text handed back to the model after a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

#[derive(Clone)]
enum ToolTarget {
    Mcp { server: String, tool: String },
    Native(Arc<dyn NativeTool>),
}

#[derive(Clone)]
struct ToolEntry {
    exposed: String,
    server: String,
    tool: Tool,
    target: ToolTarget,
}

/// The merged tool set of every connected server.
///
/// Tools keep their bare name when it is unique; colliding names are exposed
/// as `server__tool` for every tool that shares them. No tool is dropped.
#[derive(Clone)]
pub struct McpRegistry {
    services: Arc<HashMap<String, Arc<DynClientService>>>,
    entries: Arc<Vec<ToolEntry>>,
    // exposed name -> position in `entries`
    index: Arc<HashMap<String, usize>>,
    report: Arc<AssemblyReport>,
}

impl std::fmt::Debug for McpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRegistry")
            .field("tool_count", &self.entries.len())
            .field("service_count", &self.services.len())
            .field("failed_servers", &self.report.failed.len())
            .finish()
    }
}

impl McpRegistry {
    /// Connect every server in `cfg` and merge their tools.
    ///
    /// Never fails: a server that cannot be reached, times out, or errors
    /// during tool discovery is left out and recorded in the [`AssemblyReport`].
    pub async fn connect_all(cfg: &McpConfig, connect_timeout: Duration) -> Self {
        let attempts = cfg.mcp_servers.iter().map(|(name, entry)| async move {
            let result = match tokio::time::timeout(connect_timeout, connect_server(name, entry))
                .await
            {
                Ok(r) => r,
                Err(_) => Err(anyhow!(
                    "timed out after {}s connecting to {}",
                    connect_timeout.as_secs_f32(),
                    entry.describe()
                )),
            };
            (name.clone(), entry.transport().to_string(), result)
        });
        let results = futures::future::join_all(attempts).await;

        let mut services = HashMap::new();
        let mut raw_entries = Vec::new();
        let mut report = AssemblyReport::default();

        for (name, transport, result) in results {
            match result {
                Ok((svc, tools)) => {
                    tracing::info!(
                        name: "mcp.server.connected",
                        server = %name,
                        transport = %transport,
                        tool_count = tools.len(),
                        "MCP server connected"
                    );
                    report.connected.push(ConnectedServer {
                        name: name.clone(),
                        transport,
                        tool_count: tools.len(),
                    });
                    for t in tools {
                        let target = ToolTarget::Mcp {
                            server: name.clone(),
                            tool: t.name.to_string(),
                        };
                        raw_entries.push((name.clone(), t, target));
                    }
                    services.insert(name, Arc::new(svc));
                }
                Err(e) => {
                    tracing::warn!(
                        name: "mcp.server.failed",
                        server = %name,
                        transport = %transport,
                        error = %format!("{e:#}"),
                        "MCP server unavailable, its tools are excluded"
                    );
                    report.failed.push(FailedServer {
                        name,
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        Self::build(services, raw_entries, report)
    }

    /// Creates an empty registry.
    pub fn new_empty() -> Self {
        Self::build(HashMap::new(), Vec::new(), AssemblyReport::default())
    }

    fn build(
        services: HashMap<String, Arc<DynClientService>>,
        raw_entries: Vec<(String, Tool, ToolTarget)>,
        report: AssemblyReport,
    ) -> Self {
        let keys: Vec<(&str, &str)> = raw_entries
            .iter()
            .map(|(server, tool, _)| (server.as_str(), &*tool.name))
            .collect();
        let names = exposed_names(&keys);

        let mut entries = Vec::with_capacity(raw_entries.len());
        let mut index = HashMap::new();

        for ((server, tool, target), exposed) in raw_entries.into_iter().zip(names) {
            if exposed != *tool.name {
                tracing::debug!(
                    server = %server,
                    tool = %tool.name,
                    exposed = %exposed,
                    "Tool exposed under a different name"
                );
            }
            index.insert(exposed.clone(), entries.len());
            entries.push(ToolEntry {
                exposed,
                server,
                tool,
                target,
            });
        }

        Self {
            services: Arc::new(services),
            entries: Arc::new(entries),
            index: Arc::new(index),
            report: Arc::new(report),
        }
    }

    /// Add an already connected MCP client under `name` and discover its tools.
    ///
    /// Collision naming is re-run over the whole tool set.
    pub async fn with_service(
        self,
        name: &str,
        transport: &str,
        service: DynClientService,
    ) -> anyhow::Result<Self> {
        let tools = service
            .list_all_tools()
            .await
            .with_context(|| format!("tools/list failed for MCP server '{name}'"))?;

        tracing::info!(
            name: "mcp.server.connected",
            server = %name,
            transport = %transport,
            tool_count = tools.len(),
            "MCP server connected"
        );

        let mut report = (*self.report).clone();
        report.connected.push(ConnectedServer {
            name: name.to_string(),
            transport: transport.to_string(),
            tool_count: tools.len(),
        });

        let mut raw_entries = self.raw_entries();
        for t in tools {
            let target = ToolTarget::Mcp {
                server: name.to_string(),
                tool: t.name.to_string(),
            };
            raw_entries.push((name.to_string(), t, target));
        }

        let mut services = (*self.services).clone();
        services.insert(name.to_string(), Arc::new(service));

        Ok(Self::build(services, raw_entries, report))
    }

    fn raw_entries(&self) -> Vec<(String, Tool, ToolTarget)> {
        self.entries
            .iter()
            .map(|e| (e.server.clone(), e.tool.clone(), e.target.clone()))
            .collect()
    }

    /// Register an in-process tool, re-running the collision policy.
    pub fn with_native_tool(self, tool: Arc<dyn NativeTool>) -> Self {
        let mcp_tool = Tool {
            name: tool.name().to_string().into(),
            description: Some(tool.description().to_string().into()),
            input_schema: Arc::new(
                tool.schema()
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ),
            title: None,
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        };

        let mut raw_entries = self.raw_entries();
        raw_entries.push((NATIVE_SERVER.to_string(), mcp_tool, ToolTarget::Native(tool)));

        Self::build(
            (*self.services).clone(),
            raw_entries,
            (*self.report).clone(),
        )
    }

    /// Sanitize tool names for function-calling APIs (`^[a-zA-Z0-9_-]+$`).
    fn sanitize_tool_name(name: &str) -> String {
        name.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Exposed tools as `(exposed_name, Tool)` in registration order.
    pub fn tools(&self) -> impl Iterator<Item = (&str, &Tool)> {
        self.entries.iter().map(|e| (e.exposed.as_str(), &e.tool))
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.exposed.clone()).collect()
    }

    /// Server that provides the exposed tool `name`.
    pub fn server_of(&self, name: &str) -> Option<&str> {
        self.index
            .get(name)
            .map(|&i| self.entries[i].server.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn report(&self) -> &AssemblyReport {
        &self.report
    }

    pub fn openai_tools_json(&self) -> Vec<serde_json::Value> {
        self.entries
            .iter()
            .map(|e| {
                // rmcp Tool uses input_schema as an Arc<JsonObject>; convert to serde_json.
                let params = serde_json::to_value(&*e.tool.input_schema)
                    .unwrap_or_else(|_| serde_json::json!({"type":"object","properties":{}}));

                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": e.exposed,
                        "description": e.tool.description.as_deref().unwrap_or(""),
                        "parameters": params
                    }
                })
            })
            .collect()
    }

    /// Execute an exposed tool by name.
    ///
    /// Transport failures and unknown names are `Err`; a tool that ran and
    /// reported failure is `Ok` with `is_error` set.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<ToolOutput> {
        let entry = self
            .index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| anyhow!("unknown tool: {name}"))?;

        match &entry.target {
            ToolTarget::Native(tool) => {
                let value = tool.call(arguments).await?;
                Ok(ToolOutput {
                    content: match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    },
                    is_error: false,
                })
            }
            ToolTarget::Mcp { server, tool } => {
                let service = self
                    .services
                    .get(server)
                    .ok_or_else(|| anyhow!("missing server handle: {server}"))?;

                let res = service
                    .call_tool(CallToolRequestParam {
                        name: tool.clone().into(),
                        arguments: arguments.as_object().cloned(),
                    })
                    .await
                    .with_context(|| format!("tools/call failed for {server}::{tool}"))?;

                Ok(tool_output_from_result(&serde_json::to_value(res)?))
            }
        }
    }
}

/// Assign exposed names.
///
/// A tool keeps its sanitized bare name when no other tool sanitizes to the
/// same string; otherwise every such tool becomes `server__tool`. A name that
/// is still taken after that gets the first free `_2`, `_3`, ... suffix.
fn exposed_names(entries: &[(&str, &str)]) -> Vec<String> {
    let mut bare_counts: HashMap<String, usize> = HashMap::new();
    for (_, tool) in entries {
        *bare_counts
            .entry(McpRegistry::sanitize_tool_name(tool))
            .or_default() += 1;
    }

    let candidates: Vec<String> = entries
        .iter()
        .map(|(server, tool)| {
            let bare = McpRegistry::sanitize_tool_name(tool);
            if bare_counts.get(&bare).is_some_and(|&n| n > 1) {
                McpRegistry::sanitize_tool_name(&format!("{server}__{tool}"))
            } else {
                bare
            }
        })
        .collect();

    let reserved: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let mut taken: HashSet<String> = HashSet::new();
    candidates
        .iter()
        .map(|candidate| {
            let mut name = candidate.clone();
            let mut n = 2;
            while taken.contains(&name) || (name != *candidate && reserved.contains(name.as_str()))
            {
                name = format!("{candidate}_{n}");
                n += 1;
            }
            taken.insert(name.clone());
            name
        })
        .collect()
}

/// Flatten a serialized `CallToolResult` into model-facing text.
fn tool_output_from_result(result: &serde_json::Value) -> ToolOutput {
    let parts: Vec<String> = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                    Some(text) => text.to_string(),
                    None => item.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    let content = if parts.is_empty() {
        result
            .get("structuredContent")
            .map(ToString::to_string)
            .unwrap_or_default()
    } else {
        parts.join("\n")
    };

    ToolOutput {
        content,
        is_error: result
            .get("isError")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false),
    }
}

async fn connect_server(
    name: &str,
    entry: &ServerConfig,
) -> anyhow::Result<(DynClientService, Vec<Tool>)> {
    let kind = TransportKind::parse(entry.transport())
        .ok_or_else(|| anyhow!("unsupported transport '{}'", entry.transport()))?;

    let svc = match (entry, kind) {
        (ServerConfig::Stdio { command, args, env, .. }, TransportKind::Stdio) => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (k, v) in expand_env_map(env) {
                cmd.env(k, v);
            }

            let transport = TokioChildProcess::new(cmd)
                .with_context(|| format!("failed to spawn '{command}'"))?;
            // store as dyn to keep a homogeneous collection
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect stdio MCP server '{name}'"))?
        }

        (ServerConfig::RemoteHttp { url, headers, .. }, TransportKind::StreamableHttp) => {
            let url = Url::parse(&expand_env_placeholders(url))
                .with_context(|| format!("invalid url for remote MCP '{name}': {url}"))?;

            let mut header_map = HeaderMap::new();
            for (k, v) in expand_env_map(headers) {
                let key = HeaderName::from_bytes(k.as_bytes())
                    .with_context(|| format!("invalid header name '{k}' for '{name}'"))?;
                // Header values never appear in errors.
                let value = HeaderValue::from_str(&v)
                    .with_context(|| format!("invalid value for header '{k}' on '{name}'"))?;
                header_map.insert(key, value);
            }
            let client = reqwest::Client::builder()
                .default_headers(header_map)
                .build()
                .context("failed to build HTTP client")?;

            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(url.to_string()),
            );
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect remote MCP server '{name}'"))?
        }

        (_, kind) => bail!(
            "transport '{}' ({kind:?}) does not fit this entry ({})",
            entry.transport(),
            entry.describe()
        ),
    };

    let tools = svc
        .list_all_tools()
        .await
        .with_context(|| format!("tools/list failed for MCP server '{name}'"))?;

    Ok((svc, tools))
}
