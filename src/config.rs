use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the sidecar
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listening side of the proxy
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend process
    #[serde(default)]
    pub backend: BackendConfig,

    /// Liveness probing and restart policy
    #[serde(default)]
    pub health: HealthConfig,

    /// Request forwarding
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Local answers for the RPC endpoint during warm-up
    #[serde(default)]
    pub shim: ShimConfig,

    /// Runtime assets the backend needs (browser binaries)
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8081)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Execution environment label, only used for logging
    pub environment: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            environment: None,
        }
    }
}

/// Configuration for the backend process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// sidecar. Configuration files must only be writable by trusted users.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch
    #[serde(default = "default_backend_command")]
    pub command: String,

    /// Arguments passed before the flags the supervisor appends
    #[serde(default = "default_backend_args")]
    pub args: Vec<String>,

    /// Loopback port the backend listens on (default: 8082)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Browser profile directory passed as `--user-data-dir`
    pub user_data_dir: Option<PathBuf>,

    /// Artifact directory passed as `--output-dir`
    pub output_dir: Option<PathBuf>,

    /// Stale lock marker removed before every start (default: `<user_data_dir>/SingletonLock`)
    pub lock_file: Option<PathBuf>,

    /// Substrings in stdout that mean the backend is listening
    #[serde(default = "default_ready_markers")]
    pub ready_markers: Vec<String>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Time the backend gets to signal readiness before we log and continue
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Exit the sidecar when the backend cannot be spawned at startup
    #[serde(default = "default_true")]
    pub exit_on_spawn_failure: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_backend_command(),
            args: default_backend_args(),
            port: default_backend_port(),
            working_dir: None,
            user_data_dir: None,
            output_dir: None,
            lock_file: None,
            ready_markers: default_ready_markers(),
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            exit_on_spawn_failure: true,
        }
    }
}

impl BackendConfig {
    /// Create a backend config for the given command with no extra args
    pub fn local(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            ..Self::default()
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the session directories (builder pattern)
    pub fn with_session_dirs(mut self, user_data_dir: PathBuf, output_dir: PathBuf) -> Self {
        self.user_data_dir = Some(user_data_dir);
        self.output_dir = Some(output_dir);
        self
    }

    /// Set the lock marker path (builder pattern)
    pub fn with_lock_file(mut self, path: PathBuf) -> Self {
        self.lock_file = Some(path);
        self
    }

    pub fn user_data_dir(&self) -> PathBuf {
        self.user_data_dir
            .clone()
            .unwrap_or_else(|| session_root().join("profile"))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| session_root().join("output"))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.lock_file
            .clone()
            .unwrap_or_else(|| self.user_data_dir().join("SingletonLock"))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Full argument vector: configured args followed by the port and session flags
    pub fn full_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--port".to_string());
        args.push(self.port.to_string());
        args.push("--user-data-dir".to_string());
        args.push(self.user_data_dir().to_string_lossy().into_owned());
        args.push("--output-dir".to_string());
        args.push(self.output_dir().to_string_lossy().into_owned());
        args
    }

    /// Whether a stdout line announces that the backend is accepting connections
    pub fn is_ready_line(&self, line: &str) -> bool {
        self.ready_markers.iter().any(|m| !m.is_empty() && line.contains(m.as_str()))
            || line.contains(&self.port.to_string())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Interval between periodic probes once the backend is ready
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timeout of a single probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Path probed on the backend; any response counts as alive
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Consecutive failed probes before a forced restart
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Pause between terminating the old backend and starting the new one
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_ms: u64,

    /// How old the last successful forward must be before a reactive probe runs
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Probe interval while waiting for a freshly started backend
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            probe_timeout_ms: default_probe_timeout(),
            probe_path: default_probe_path(),
            unhealthy_threshold: default_unhealthy_threshold(),
            restart_cooldown_ms: default_restart_cooldown(),
            stale_after_secs: default_stale_after(),
            startup_poll_interval_ms: default_startup_poll_interval(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_millis(self.startup_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path of the JSON-RPC endpoint (matches itself and any sub-path)
    #[serde(default = "default_rpc_path")]
    pub rpc_path: String,

    /// Backoff delays between forwarding attempts
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,

    /// Ceiling for the backend to start responding (0 disables)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest request body that will be buffered for replay
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum concurrently forwarded requests
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum idle pooled connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// TCP keep-alive on backend sockets (0 disables)
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Connect timeout for backend sockets
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Value of the Retry-After header on service-starting responses
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rpc_path: default_rpc_path(),
            retry_delays_ms: default_retry_delays(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
            max_connections: default_max_connections(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            connect_timeout_ms: default_connect_timeout(),
            retry_after_secs: default_retry_after(),
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms.iter().copied().map(Duration::from_millis).collect()
    }
}

/// Framing of locally generated JSON-RPC responses
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    /// SSE when the client's Accept header lists `text/event-stream`, JSON otherwise
    #[default]
    Auto,
    /// Always a plain `application/json` body
    Json,
    /// Always a single `text/event-stream` message event
    Sse,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShimConfig {
    /// Protocol version reported in the synthetic handshake result
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Server name reported in `serverInfo`
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Server version reported in `serverInfo`
    #[serde(default = "default_server_version")]
    pub server_version: String,

    /// Human readable notice attached to the handshake result
    #[serde(default = "default_instructions")]
    pub instructions: String,

    #[serde(default)]
    pub response_mode: ResponseMode,

    /// Largest control message accepted while initializing
    #[serde(default = "default_shim_max_body")]
    pub max_body_bytes: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            server_name: default_server_name(),
            server_version: default_server_version(),
            instructions: default_instructions(),
            response_mode: ResponseMode::default(),
            max_body_bytes: default_shim_max_body(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Directory where the browser binaries are expected
    #[serde(default = "default_assets_path")]
    pub assets_path: PathBuf,

    /// Prefix of the directory entry that proves the browser is installed
    #[serde(default = "default_asset_prefix")]
    pub asset_prefix: String,

    /// Check for assets before starting the backend (runtime is ready otherwise)
    #[serde(default = "default_true")]
    pub verify_assets: bool,

    /// Run `install_command` when assets are missing
    #[serde(default)]
    pub auto_install: bool,

    /// Installer invoked when auto-install is enabled
    #[serde(default = "default_install_command")]
    pub install_command: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            assets_path: default_assets_path(),
            asset_prefix: default_asset_prefix(),
            verify_assets: true,
            auto_install: false,
            install_command: default_install_command(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8081
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_backend_command() -> String {
    "node".to_string()
}

fn default_backend_args() -> Vec<String> {
    ["cli.js", "--headless", "--browser", "chromium", "--no-sandbox"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_backend_port() -> u16 {
    8082
}

fn default_ready_markers() -> Vec<String> {
    vec!["listening".to_string(), "started".to_string()]
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    5000
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_probe_path() -> String {
    "/".to_string()
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_restart_cooldown() -> u64 {
    1000
}

fn default_stale_after() -> u64 {
    60
}

fn default_startup_poll_interval() -> u64 {
    500
}

fn default_rpc_path() -> String {
    "/mcp".to_string()
}

fn default_retry_delays() -> Vec<u64> {
    vec![1000, 2000, 5000]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_connections() -> usize {
    64
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    1000
}

fn default_retry_after() -> u64 {
    5
}

fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}

fn default_server_name() -> String {
    "Playwright".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_instructions() -> String {
    "The browser automation backend is initializing. Tools become available once it is ready; retry shortly.".to_string()
}

fn default_shim_max_body() -> usize {
    1024 * 1024
}

fn default_assets_path() -> PathBuf {
    PathBuf::from("/ms-playwright")
}

fn default_asset_prefix() -> String {
    "chromium".to_string()
}

fn default_install_command() -> Vec<String> {
    ["npx", "-y", "playwright-core", "install", "--no-shell", "chromium"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Per-user directory holding the backend's isolated session state
fn session_root() -> PathBuf {
    dirs_next::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("warmgate")
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the optional config file, overlay the process environment and validate
    pub fn resolve(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the recognized environment variables
    ///
    /// The lookup is injected so tests never touch the real process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        if let Some(host) = lookup("HOST") {
            self.server.bind = host;
        }
        if let Some(env) = lookup("NODE_ENV") {
            self.server.environment = Some(env);
        }
        if let Some(path) = lookup("PLAYWRIGHT_BROWSERS_PATH") {
            self.runtime.assets_path = PathBuf::from(path);
        }
        if let Some(flag) = lookup("PLAYWRIGHT_AUTO_INSTALL") {
            self.runtime.auto_install = parse_bool(&flag);
        }
        if let Some(command_line) = lookup("BACKEND_COMMAND") {
            let mut words = shell_words::split(&command_line)
                .map_err(|e| anyhow::anyhow!("Invalid BACKEND_COMMAND: {}", e))?;
            if words.is_empty() {
                anyhow::bail!("BACKEND_COMMAND is empty");
            }
            self.backend.command = words.remove(0);
            self.backend.args = words;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.backend.command.trim().is_empty() {
            errors.push("backend 'command' must not be empty".to_string());
        }
        if self.backend.port == 0 {
            errors.push("backend 'port' must be greater than 0".to_string());
        }
        if self.backend.port == self.server.port {
            errors.push(format!(
                "backend port {} must differ from the proxy port",
                self.backend.port
            ));
        }
        if self.health.unhealthy_threshold == 0 {
            errors.push("health 'unhealthy_threshold' must be at least 1".to_string());
        }
        if self.health.interval_ms == 0 {
            errors.push("health 'interval_ms' must be greater than 0".to_string());
        }
        if self.health.startup_poll_interval_ms == 0 {
            errors.push("health 'startup_poll_interval_ms' must be greater than 0".to_string());
        }
        if self.proxy.retry_delays_ms.is_empty() {
            errors.push("proxy 'retry_delays_ms' must not be empty".to_string());
        } else if self.proxy.retry_delays_ms.windows(2).any(|w| w[0] >= w[1]) {
            errors.push("proxy 'retry_delays_ms' must be strictly increasing".to_string());
        }
        if self.proxy.max_connections == 0 {
            errors.push("proxy 'max_connections' must be at least 1".to_string());
        }
        if !self.proxy.rpc_path.starts_with('/') {
            errors.push("proxy 'rpc_path' must start with '/'".to_string());
        }
        if self.runtime.auto_install && self.runtime.install_command.is_empty() {
            errors.push("runtime 'install_command' is required when auto_install is on".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
