use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::types::ParamType;

const DEFAULT_CONFIG_PATH: &str = "gateway.toml";

const DEFAULT_PROVIDER: &str = "gemini";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_KEY_ENV: &str = "GEMINI_API_KEY";
const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_OLLAMA_ENDPOINT: &str = "http://127.0.0.1:11434";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a smart-plug control assistant. \
Use the declared tools to inspect and switch devices; pass device names exactly as the user \
gave them or as the device list reports them. Report tool results plainly, and when a command \
fails, tell the user what failed instead of guessing. Answer in the user's language.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// One `[[tools]]` entry: the declarative face of a tool plus the command
/// line that backs it. Validation happens at registry build, not here.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub input: BTreeMap<String, ParamType>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    pub endpoint: Option<String>,
    pub api_key_env: String,
    pub system_prompt: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            name: DEFAULT_MODEL.to_string(),
            endpoint: None,
            api_key_env: DEFAULT_KEY_ENV.to_string(),
            system_prompt: None,
        }
    }
}

impl ModelConfig {
    pub fn endpoint(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        match self.provider.to_lowercase().as_str() {
            "ollama" | "localai" => DEFAULT_OLLAMA_ENDPOINT.to_string(),
            _ => DEFAULT_GEMINI_ENDPOINT.to_string(),
        }
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub tool_server_url: String,
    pub request_timeout_secs: u64,
    pub max_tool_steps: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".parse().unwrap(),
            tool_server_url: "http://127.0.0.1:3000".to_string(),
            request_timeout_secs: 120,
            max_tool_steps: 8,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolServerConfig {
    pub bind: SocketAddr,
    pub command_timeout_secs: u64,
    pub spc_path: String,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".parse().unwrap(),
            command_timeout_secs: 15,
            spc_path: "spc".to_string(),
        }
    }
}

impl ToolServerConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub gateway: GatewayConfig,
    pub tool_server: ToolServerConfig,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    tool_server: ToolServerConfig,
    #[serde(default)]
    tools: Vec<ToolSpec>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return read_config(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        match read_config(default_path) {
            Ok(config) => Ok(config),
            Err(ConfigError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!("Configuration file not found; using defaults");
                Ok(Self::default())
            }
            Err(other) => Err(other),
        }
    }

    pub fn default() -> Self {
        Self::from_raw(RawConfig::default())
    }

    fn from_raw(raw: RawConfig) -> Self {
        // No [[tools]] in the file means the built-in smart-plug set,
        // rooted at whatever spc binary the tool server points at.
        let tools = if raw.tools.is_empty() {
            default_toolset(&raw.tool_server.spc_path)
        } else {
            raw.tools
        };
        Self {
            model: raw.model,
            gateway: raw.gateway,
            tool_server: raw.tool_server,
            tools,
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    debug!(path = %path.display(), "Reading gateway configuration file");
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RawConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(AppConfig::from_raw(parsed))
}

/// The smart-plug command set exposed when no tools are configured. Every
/// command is a subcommand of the `spc` control binary; per-device commands
/// take the device name as their only argument.
pub fn default_toolset(spc: &str) -> Vec<ToolSpec> {
    let mut tools = vec![ToolSpec {
        name: "list-devices".to_string(),
        title: Some("List devices".to_string()),
        description: Some("List the names of every configured smart plug".to_string()),
        command: format!("{spc} devices"),
        input: BTreeMap::new(),
    }];
    let per_device: [(&str, &str, &str, &str); 9] = [
        (
            "device-state",
            "Device state",
            "Read whether one smart plug is ON or OFF",
            "state",
        ),
        ("turn-on", "Turn on", "Switch one smart plug on", "on"),
        ("turn-off", "Turn off", "Switch one smart plug off", "off"),
        (
            "active-power",
            "Active power",
            "Read the instantaneous power draw of one smart plug in watts",
            "active-power",
        ),
        (
            "energy-today",
            "Energy today",
            "Read the energy one smart plug has consumed today",
            "energy-today",
        ),
        (
            "energy-yesterday",
            "Energy yesterday",
            "Read the energy one smart plug consumed yesterday",
            "energy-yesterday",
        ),
        (
            "voltage",
            "Voltage",
            "Read the mains voltage measured by one smart plug",
            "voltage",
        ),
        (
            "current",
            "Current",
            "Read the electrical current flowing through one smart plug",
            "current",
        ),
        (
            "device-status",
            "Device status",
            "Read the full status report of one smart plug",
            "status",
        ),
    ];
    tools.extend(per_device.into_iter().map(|(name, title, description, sub)| ToolSpec {
        name: name.to_string(),
        title: Some(title.to_string()),
        description: Some(format!("{description}, addressed by its device name")),
        command: format!("{spc} {sub} <plugName>"),
        input: BTreeMap::from([("plugName".to_string(), ParamType::String)]),
    }));
    tools
}
