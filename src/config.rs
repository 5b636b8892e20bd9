//! Configuration for the supervisor, the transport client and the MCP server.
//!
//! Every struct deserializes from camelCase JSON with defaults for missing
//! fields, which is how a flow host hands node settings over. The binary
//! builds the same structs from environment variables instead.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BridgeError, BridgeResult};

// ── Supervisor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    pub command: String,
    /// Arguments; `{port}` and `{name}` are substituted at spawn time.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub port: u16,
    pub server_name: String,
    pub max_restarts: u32,
    pub restart_delay_ms: u64,
    pub health_check: bool,
    pub health_interval_ms: u64,
    pub health_path: String,
    pub stop_grace_ms: u64,
    /// Start the process as soon as the host comes up.
    pub auto_start: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            port: 8000,
            server_name: "mcp-server".to_string(),
            max_restarts: 3,
            restart_delay_ms: 5_000,
            health_check: true,
            health_interval_ms: 30_000,
            health_path: "/health".to_string(),
            stop_grace_ms: 5_000,
            auto_start: false,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(100))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.command.trim().is_empty() {
            return Err(BridgeError::Config("a command is required to start the MCP server process".into()));
        }
        Ok(())
    }

    /// Configured args with `{port}` / `{name}` placeholders filled in.
    pub fn build_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args
            .iter()
            .map(|a| a.replace("{port}", &port).replace("{name}", &self.server_name))
            .collect()
    }
}

// ── Transport client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Sse,
    #[serde(alias = "ws")]
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Sse => "sse",
            TransportKind::Websocket => "websocket",
        }
    }

    /// SSE and WebSocket keep a channel open and run discovery on connect.
    pub fn is_streaming(&self) -> bool {
        !matches!(self, TransportKind::Http)
    }
}

impl FromStr for TransportKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "sse" => Ok(TransportKind::Sse),
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            other => Err(BridgeError::Config(format!("unknown transport '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub transport: TransportKind,
    pub url: String,
    pub health_path: String,
    pub rpc_path: String,
    pub sse_path: String,
    pub request_timeout_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub handshake_delay_ms: u64,
    pub auto_connect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Http,
            url: String::new(),
            health_path: "/health".to_string(),
            rpc_path: "/mcp".to_string(),
            sse_path: "/sse".to_string(),
            request_timeout_ms: 30_000,
            auto_reconnect: true,
            reconnect_delay_ms: 5_000,
            handshake_delay_ms: 1_000,
            auto_connect: false,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.base_url().map(|_| ())
    }

    pub fn base_url(&self) -> BridgeResult<Url> {
        if self.url.trim().is_empty() {
            return Err(BridgeError::Config("an endpoint URL is required".into()));
        }
        Url::parse(self.url.trim())
            .map_err(|e| BridgeError::Config(format!("invalid endpoint URL '{}': {e}", self.url)))
    }

    /// Join a conventional path (`/health`, `/mcp`, `/sse`) onto the base URL.
    pub fn endpoint(&self, path: &str) -> BridgeResult<Url> {
        let mut url = self.base_url()?;
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}/{}", base, path.trim_start_matches('/')));
        Ok(url)
    }

    /// WebSocket URL: the base URL itself, with http(s) mapped to ws(s).
    pub fn websocket_url(&self) -> BridgeResult<Url> {
        let mut url = self.base_url()?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(BridgeError::Config(format!(
                    "unsupported scheme '{other}' for websocket transport"
                )));
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| BridgeError::Config(format!("cannot use scheme '{scheme}' for '{}'", self.url)))?;
        Ok(url)
    }
}

// ── MCP server ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub name: String,
    pub port: u16,
    pub cors: bool,
    pub execution_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-flow-server".to_string(),
            port: 3000,
            cors: true,
            execution_timeout_ms: 30_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(10))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::Config("the MCP server needs a name".into()));
        }
        Ok(())
    }
}

// ── Whole-process config (binary) ───────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    pub supervisor: Option<SupervisorConfig>,
    pub client: Option<TransportConfig>,
    pub server: Option<ServerConfig>,
}

impl BridgeConfig {
    /// Read the `MCP_*` environment variables. Sections without their key
    /// variable (`MCP_COMMAND`, `MCP_CLIENT_URL`, `MCP_SERVE`) are left out.
    pub fn from_env() -> BridgeResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> BridgeResult<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let supervisor = match var("MCP_COMMAND") {
            Some(command) => {
                let d = SupervisorConfig::default();
                Some(SupervisorConfig {
                    command,
                    args: var("MCP_ARGS")
                        .map(|a| a.split_whitespace().map(String::from).collect())
                        .unwrap_or_default(),
                    env: HashMap::new(),
                    working_dir: var("MCP_WORKING_DIR").map(PathBuf::from),
                    port: parse_or(var("MCP_PORT"), "MCP_PORT", d.port)?,
                    server_name: var("MCP_SERVER_NAME").unwrap_or(d.server_name),
                    max_restarts: parse_or(var("MCP_MAX_RESTARTS"), "MCP_MAX_RESTARTS", d.max_restarts)?,
                    restart_delay_ms: parse_or(var("MCP_RESTART_DELAY_MS"), "MCP_RESTART_DELAY_MS", d.restart_delay_ms)?,
                    health_check: parse_or(var("MCP_HEALTH_CHECK"), "MCP_HEALTH_CHECK", d.health_check)?,
                    health_interval_ms: parse_or(var("MCP_HEALTH_INTERVAL_MS"), "MCP_HEALTH_INTERVAL_MS", d.health_interval_ms)?,
                    health_path: var("MCP_HEALTH_PATH").unwrap_or(d.health_path),
                    stop_grace_ms: parse_or(var("MCP_STOP_GRACE_MS"), "MCP_STOP_GRACE_MS", d.stop_grace_ms)?,
                    auto_start: parse_or(var("MCP_AUTO_START"), "MCP_AUTO_START", d.auto_start)?,
                })
            }
            None => None,
        };

        let client = match var("MCP_CLIENT_URL") {
            Some(url) => {
                let d = TransportConfig::default();
                let cfg = TransportConfig {
                    transport: match var("MCP_CLIENT_TRANSPORT") {
                        Some(t) => t.parse()?,
                        None => d.transport,
                    },
                    url,
                    request_timeout_ms: parse_or(var("MCP_CLIENT_TIMEOUT_MS"), "MCP_CLIENT_TIMEOUT_MS", d.request_timeout_ms)?,
                    auto_reconnect: parse_or(var("MCP_CLIENT_AUTO_RECONNECT"), "MCP_CLIENT_AUTO_RECONNECT", d.auto_reconnect)?,
                    reconnect_delay_ms: parse_or(
                        var("MCP_CLIENT_RECONNECT_DELAY_MS"),
                        "MCP_CLIENT_RECONNECT_DELAY_MS",
                        d.reconnect_delay_ms,
                    )?,
                    auto_connect: parse_or(var("MCP_CLIENT_AUTO_CONNECT"), "MCP_CLIENT_AUTO_CONNECT", d.auto_connect)?,
                    ..d
                };
                cfg.validate()?;
                Some(cfg)
            }
            None => None,
        };

        let serve: bool = parse_or(var("MCP_SERVE"), "MCP_SERVE", false)?;
        let server = if serve {
            let d = ServerConfig::default();
            Some(ServerConfig {
                name: var("MCP_SERVE_NAME").unwrap_or(d.name),
                port: parse_or(var("MCP_SERVE_PORT"), "MCP_SERVE_PORT", d.port)?,
                cors: parse_or(var("MCP_SERVE_CORS"), "MCP_SERVE_CORS", d.cors)?,
                execution_timeout_ms: parse_or(
                    var("MCP_EXECUTION_TIMEOUT_MS"),
                    "MCP_EXECUTION_TIMEOUT_MS",
                    d.execution_timeout_ms,
                )?,
                heartbeat_interval_ms: parse_or(
                    var("MCP_HEARTBEAT_INTERVAL_MS"),
                    "MCP_HEARTBEAT_INTERVAL_MS",
                    d.heartbeat_interval_ms,
                )?,
            })
        } else {
            None
        };

        Ok(Self {
            supervisor,
            client,
            server,
        })
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> BridgeResult<T> {
    match raw {
        Some(v) => v
            .parse()
            .map_err(|_| BridgeError::Config(format!("{key} has an invalid value '{v}'"))),
        None => Ok(default),
    }
}
