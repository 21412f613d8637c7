use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

/// The `mcp.json` document: server name -> connection descriptor.
///
/// Servers live in a `BTreeMap` so connection order, and therefore the
/// collision naming in the registry, does not depend on hash order.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

/// Connection descriptor for one MCP server.
///
/// Entries are accepted as written; a bad command, URL or transport kind shows
/// up as a connection failure when the agent is assembled.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default = "default_stdio_transport")]
        transport: String,
    },
    RemoteHttp {
        url: String,
        #[serde(default = "default_http_transport")]
        transport: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Transport kinds the registry knows how to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    StreamableHttp,
}

impl TransportKind {
    /// Parse the `transport` field; `None` means unsupported.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "stdio" => Some(Self::Stdio),
            "streamable_http" | "streamable-http" | "http" => Some(Self::StreamableHttp),
            _ => None,
        }
    }
}

impl ServerConfig {
    pub fn transport(&self) -> &str {
        match self {
            Self::Stdio { transport, .. } | Self::RemoteHttp { transport, .. } => transport,
        }
    }

    /// Short human description used in logs; never includes header values.
    pub fn describe(&self) -> String {
        match self {
            Self::Stdio { command, args, .. } => format!("{command} {}", args.join(" ")),
            Self::RemoteHttp { url, .. } => url.clone(),
        }
    }
}

fn default_stdio_transport() -> String {
    "stdio".to_string()
}

fn default_http_transport() -> String {
    "streamable_http".to_string()
}

pub fn load_mcp_config(path: impl AsRef<Path>) -> anyhow::Result<McpConfig> {
    let path = path.as_ref();
    let txt = fs::read_to_string(path)
        .with_context(|| format!("failed to read MCP config {}", path.display()))?;
    serde_json::from_str(&txt)
        .with_context(|| format!("failed to parse MCP config {}", path.display()))
}

/// Load `path` if it exists; a missing file means "no servers".
pub fn load_mcp_config_or_empty(path: impl AsRef<Path>) -> anyhow::Result<McpConfig> {
    let path = path.as_ref();
    if path.exists() {
        load_mcp_config(path)
    } else {
        tracing::warn!(
            path = %path.display(),
            "No MCP config found, starting without tool servers"
        );
        Ok(McpConfig::default())
    }
}

/// Expand "${VAR}" placeholders from the process environment.
/// Unknown variables are left as written.
pub fn expand_env_placeholders(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) if !name.is_empty() => out.push_str(&value),
                    _ => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn expand_env_map(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_env_placeholders(v)))
        .collect()
}
