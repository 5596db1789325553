//! `berth.toml` loading, environment overrides and validation.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, `.env`, then
//! `BERTH_*` environment variables. CLI flags applied by the caller win over
//! everything.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use berth_common::{HostingType, Workspace};
use berth_runtime::{
    EnginePathStyle, HealthPolicy, LifecycleConfig, ProxyConfig, TerminalConfig,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "berth.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BerthConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// First path segment of proxied workspace URLs.
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,
    /// Host the engine publishes container ports on.
    #[serde(default = "default_loopback")]
    pub proxy_host: String,
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_proxy_prefix() -> String {
    "ws".to_string()
}

fn default_loopback() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            proxy_prefix: default_proxy_prefix(),
            proxy_host: default_loopback(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSection {
    /// Engine socket; local defaults when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_endpoint: Option<String>,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub engine_path_style: EnginePathStyle,
    #[serde(default = "default_mount_target")]
    pub mount_target: String,
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
    /// e.g. "2g", "512m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

fn default_image() -> String {
    LifecycleConfig::default().image
}

fn default_internal_port() -> u16 {
    8080
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_mount_target() -> String {
    LifecycleConfig::default().mount_target
}

fn default_settings_path() -> String {
    LifecycleConfig::default().settings_path
}

fn default_settle_delay_ms() -> u64 {
    2000
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            engine_endpoint: None,
            image: default_image(),
            internal_port: default_internal_port(),
            storage_root: default_storage_root(),
            engine_path_style: EnginePathStyle::default(),
            mount_target: default_mount_target(),
            settings_path: default_settings_path(),
            memory: None,
            cpus: None,
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_loopback")]
    pub host: String,
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_attempts")]
    pub max_attempts: u32,
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_health_attempts() -> u32 {
    30
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            host: default_loopback(),
            path: default_health_path(),
            interval_ms: default_health_interval_ms(),
            max_attempts: default_health_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_tunnel_timeout_secs")]
    pub tunnel_timeout_secs: u64,
    /// SHA-256 hex digest of an agent token → user id.
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_tunnel_timeout_secs() -> u64 {
    10
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            tunnel_timeout_secs: default_tunnel_timeout_secs(),
            tokens: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_shells")]
    pub shells: Vec<String>,
    #[serde(default = "default_terminal_wait_attempts")]
    pub wait_attempts: u32,
    #[serde(default = "default_terminal_wait_interval_ms")]
    pub wait_interval_ms: u64,
}

fn default_shells() -> Vec<String> {
    TerminalConfig::default().shells
}

fn default_terminal_wait_attempts() -> u32 {
    30
}

fn default_terminal_wait_interval_ms() -> u64 {
    1000
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            shells: default_shells(),
            wait_attempts: default_terminal_wait_attempts(),
            wait_interval_ms: default_terminal_wait_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Daily-rolling log file, in addition to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

/// A workspace seeded into the in-memory store at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub id: String,
    #[serde(default)]
    pub hosting_type: HostingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl WorkspaceEntry {
    pub fn to_workspace(&self) -> Workspace {
        Workspace {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            hosting_type: self.hosting_type,
            repo_url: self.repo_url.clone(),
            repo_token: self.repo_token.clone(),
            local_port: self.local_port,
        }
    }
}

/// Parse a memory limit such as `512m`, `2g`, `1.5GiB` or `1048576` to bytes.
pub fn parse_memory(input: &str) -> Result<i64> {
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        bail!("empty memory limit");
    }
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("Invalid memory limit '{}'", input))?;
    let multiplier: f64 = match unit.trim() {
        "" | "b" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "t" | "tb" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => bail!("Invalid memory unit '{}' in '{}'", other, input),
    };
    let bytes = value * multiplier;
    if bytes < 1.0 || bytes > i64::MAX as f64 {
        bail!("Memory limit '{}' is out of range", input);
    }
    Ok(bytes as i64)
}

impl BerthConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse berth.toml")
    }

    /// Defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize berth.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Load the file, `.env`, and the process environment.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();
        let mut config = Self::load_or_default(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `BERTH_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup("BERTH_BIND") {
            self.server.bind = bind;
        }
        if let Some(root) = lookup("BERTH_STORAGE_ROOT") {
            self.container.storage_root = PathBuf::from(root);
        }
        if let Some(image) = lookup("BERTH_IMAGE") {
            self.container.image = image;
        }
        if let Some(port) = lookup("BERTH_INTERNAL_PORT") {
            self.container.internal_port = port
                .parse()
                .with_context(|| format!("Invalid BERTH_INTERNAL_PORT '{}'", port))?;
        }
        if let Some(memory) = lookup("BERTH_MEMORY") {
            self.container.memory = Some(memory);
        }
        if let Some(cpus) = lookup("BERTH_CPUS") {
            self.container.cpus = Some(
                cpus.parse()
                    .with_context(|| format!("Invalid BERTH_CPUS '{}'", cpus))?,
            );
        }
        if let Some(level) = lookup("BERTH_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Human-readable problems; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            warnings.push(format!(
                "Invalid server.bind '{}': expected host:port",
                self.server.bind
            ));
        }
        if self.server.proxy_prefix.trim_matches('/').is_empty() {
            warnings.push("server.proxy_prefix must not be empty".to_string());
        }
        if self.container.image.trim().is_empty() {
            warnings.push("container.image must not be empty".to_string());
        }
        if self.container.internal_port == 0 {
            warnings.push("container.internal_port must be non-zero".to_string());
        }
        if let Some(memory) = &self.container.memory
            && let Err(e) = parse_memory(memory)
        {
            warnings.push(format!("Invalid container.memory: {e}"));
        }
        if let Some(cpus) = self.container.cpus
            && !(cpus > 0.0)
        {
            warnings.push(format!("Invalid container.cpus {cpus}: must be positive"));
        }
        if self.health.max_attempts == 0 {
            warnings.push("health.max_attempts must be at least 1".to_string());
        }
        if !self.health.path.starts_with('/') {
            warnings.push(format!(
                "health.path '{}' should start with '/'",
                self.health.path
            ));
        }
        if self.agent.command_timeout_secs == 0 || self.agent.tunnel_timeout_secs == 0 {
            warnings.push("agent timeouts must be non-zero".to_string());
        }
        for digest in self.agent.tokens.keys() {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                warnings.push(format!(
                    "agent.tokens key '{}' is not a SHA-256 hex digest (see `berth token hash`)",
                    digest
                ));
            }
        }
        if self.terminal.shells.is_empty() {
            warnings.push("terminal.shells must list at least one shell".to_string());
        }
        if self.terminal.wait_attempts == 0 {
            warnings.push("terminal.wait_attempts must be at least 1".to_string());
        }
        if self
            .logging
            .level
            .parse::<tracing_subscriber::EnvFilter>()
            .is_err()
        {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }
        let mut seen = std::collections::HashSet::new();
        for ws in &self.workspaces {
            if !seen.insert(ws.id.as_str()) {
                warnings.push(format!("Duplicate workspace id '{}'", ws.id));
            }
        }

        warnings
    }

    pub fn memory_bytes(&self) -> Result<Option<i64>> {
        self.container.memory.as_deref().map(parse_memory).transpose()
    }

    pub fn nano_cpus(&self) -> Option<i64> {
        self.container
            .cpus
            .filter(|c| *c > 0.0)
            .map(|c| (c * 1_000_000_000.0) as i64)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            interval: Duration::from_millis(self.health.interval_ms),
            max_attempts: self.health.max_attempts,
        }
    }

    pub fn lifecycle_config(&self) -> Result<LifecycleConfig> {
        Ok(LifecycleConfig {
            image: self.container.image.clone(),
            internal_port: self.container.internal_port,
            storage_root: self.container.storage_root.clone(),
            engine_path_style: self.container.engine_path_style,
            mount_target: self.container.mount_target.clone(),
            settings_path: self.container.settings_path.clone(),
            memory_bytes: self.memory_bytes()?,
            nano_cpus: self.nano_cpus(),
            settle_delay: Duration::from_millis(self.container.settle_delay_ms),
            health: self.health_policy(),
        })
    }

    pub fn terminal_config(&self) -> TerminalConfig {
        TerminalConfig {
            shells: self.terminal.shells.clone(),
            wait_attempts: self.terminal.wait_attempts,
            wait_interval: Duration::from_millis(self.terminal.wait_interval_ms),
            ..TerminalConfig::default()
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            prefix: self.server.proxy_prefix.trim_matches('/').to_string(),
            upstream_host: self.server.proxy_host.clone(),
            internal_port: self.container.internal_port,
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.command_timeout_secs)
    }

    pub fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.tunnel_timeout_secs)
    }

    pub fn seed_workspaces(&self) -> Vec<Workspace> {
        self.workspaces.iter().map(WorkspaceEntry::to_workspace).collect()
    }

    /// Copy safe to print: workspace tokens are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for ws in &mut copy.workspaces {
            if ws.repo_token.is_some() {
                ws.repo_token = Some("***".to_string());
            }
        }
        copy
    }
}
