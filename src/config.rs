use crate::agent::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::llm::{LlmProtocol, LlmSettings, Provider};
use anyhow::{Context, bail};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file picked up from the working directory when `--config` is absent.
const CWD_CONFIG_FILE: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Path to the MCP server map (`mcp.json`)
    #[arg(long, env = "MCP_CONFIG")]
    pub mcp_config: Option<String>,

    /// Gemini model name
    #[arg(long, env = "MODEL_NAME")]
    pub model: Option<String>,

    /// Emit logs as JSON lines (`--log-json` alone means `true`)
    #[arg(long, env = "LOG_JSON", num_args = 0..=1, default_missing_value = "true")]
    pub log_json: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: HttpConfig,
    pub model: ModelConfig,
    pub agent: AgentConfig,
    pub mcp: McpSettings,
    pub sessions: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub temperature: f32,
    pub base_url: String,
    /// `auto`, `chat` or `native`.
    pub protocol: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    pub max_tool_iterations: usize,
    pub turn_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct McpSettings {
    pub config_path: PathBuf,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub json: bool,
}

impl AgentConfig {
    /// Inline prompt wins over a prompt file; both fall back to the built-in
    /// research assistant prompt.
    pub fn resolve_system_prompt(&self) -> anyhow::Result<String> {
        if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            return Ok(prompt.to_string());
        }
        if let Some(path) = &self.system_prompt_file {
            return std::fs::read_to_string(path)
                .with_context(|| format!("failed to read system prompt file {}", path.display()));
        }
        Ok(DEFAULT_SYSTEM_PROMPT.to_string())
    }

    #[must_use]
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

impl McpSettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // 1. Defaults
        let mut builder = Config::builder()
            .set_default("server.port", 7860)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("model.name", "gemini-2.5-flash")?
            .set_default("model.temperature", 0.7)?
            .set_default("model.base_url", "https://generativelanguage.googleapis.com")?
            .set_default("model.protocol", "auto")?
            .set_default("agent.max_tool_iterations", 10)?
            .set_default("agent.turn_timeout_secs", 180)?
            .set_default("mcp.config_path", "mcp.json")?
            .set_default("mcp.connect_timeout_secs", 20)?
            .set_default("sessions.idle_timeout_secs", 30 * 60)?
            .set_default("logging.json", false)?;

        // 2. Config file: explicit path is required, ./config.yaml is optional
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(Path::new(path)).required(true));
        } else {
            builder = builder.add_source(File::from(Path::new(CWD_CONFIG_FILE)).required(false));
        }

        // 3. Environment variables, e.g. APP_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI flags (and their env aliases) win
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(path) = cli.mcp_config {
            builder = builder.set_override("mcp.config_path", path)?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("model.name", model)?;
        }
        if let Some(json) = cli.log_json {
            builder = builder.set_override("logging.json", json)?;
        }

        builder.build()?.try_deserialize()
    }
}

/// Build [`LlmSettings`] from the model section and the API key environment.
pub fn load_llm_settings(model: &ModelConfig) -> anyhow::Result<LlmSettings> {
    if model.name.trim().is_empty() {
        bail!("model.name cannot be empty");
    }
    if model.base_url.trim().is_empty() {
        bail!("model.base_url cannot be empty");
    }
    if !(0.0..=2.0).contains(&model.temperature) {
        bail!("model.temperature must be within 0.0..=2.0, got {}", model.temperature);
    }

    let api_key = ["GOOGLE_API_KEY", "GEMINI_API_KEY"]
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|s| !s.trim().is_empty()));
    let Some(api_key) = api_key else {
        bail!("GOOGLE_API_KEY not found. Please set it in your environment or .env file.");
    };

    let protocol = match model.protocol.to_lowercase().as_str() {
        "native" => LlmProtocol::Native,
        "chat" => LlmProtocol::Chat,
        _ => LlmProtocol::Auto,
    };

    Ok(LlmSettings {
        base_url: model.base_url.clone(),
        api_key: Some(api_key),
        model: model.name.clone(),
        temperature: model.temperature,
        protocol,
        provider: Provider::detect_from_url(&model.base_url),
    })
}
