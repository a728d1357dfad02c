use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker process configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Routing prefix under which worker traffic is served (default: /workspace)
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Public origin used when rewriting absolute origin references in
    /// proxied HTML (default: http://localhost:8080)
    #[serde(default = "default_public_origin")]
    pub public_origin: String,

    /// Path of the registry mirror file (default: data/instances.json)
    #[serde(default = "default_registry_path")]
    pub registry_path: String,

    /// Per-request timeout for proxied requests in seconds (default: 60)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            route_prefix: default_route_prefix(),
            public_origin: default_public_origin(),
            registry_path: default_registry_path(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration for the per-identity worker processes
///
/// # Security Warning
///
/// The `command` field is executed directly, with `{user}`, `{home}` and
/// `{port}` substituted per instance. Configuration files must be protected
/// with appropriate file permissions; a malicious config executes arbitrary
/// code with the permissions of the gateway process.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Command template to launch a worker. Placeholders: {user}, {home}, {port}
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Template for the identity's home directory (default: /home/{user})
    #[serde(default = "default_home_template")]
    pub home_template: String,

    /// Extra environment variables for every worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// First port of the reserved range (default: 10000)
    #[serde(default = "default_port_min")]
    pub port_min: u16,

    /// Last port of the reserved range (default: 20000)
    #[serde(default = "default_port_max")]
    pub port_max: u16,

    /// Seconds to wait for a freshly spawned worker to accept connections
    /// (default: 30)
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL on stop
    /// (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Timeout in seconds for a single liveness probe (default: 2)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Interval in seconds between health sweeps (default: 30)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            home_template: default_home_template(),
            env: HashMap::new(),
            port_min: default_port_min(),
            port_max: default_port_max(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            probe_timeout_secs: default_probe_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl WorkerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Render the home directory for an identity
    pub fn home_dir(&self, username: &str) -> String {
        self.home_template.replace("{user}", username)
    }

    /// Render and split the launch command for an identity/port pair
    pub fn render_command(&self, username: &str, port: u16) -> anyhow::Result<Vec<String>> {
        let rendered = self
            .command
            .replace("{user}", username)
            .replace("{home}", &self.home_dir(username))
            .replace("{port}", &port.to_string());

        let argv = shell_words::split(&rendered)
            .map_err(|e| anyhow::anyhow!("Invalid worker command {:?}: {}", self.command, e))?;
        if argv.is_empty() {
            anyhow::bail!("Worker command is empty");
        }
        Ok(argv)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// HMAC secret for verifying session tokens.
    ///
    /// The default is only suitable for local development; production
    /// deployments must share the secret with the token issuer.
    #[serde(default = "default_auth_secret")]
    pub secret: String,

    /// Cookie carrying the session token (default: token)
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: default_auth_secret(),
            cookie_name: default_cookie_name(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker.port_min > self.worker.port_max {
            anyhow::bail!(
                "Invalid port range: {} > {}",
                self.worker.port_min,
                self.worker.port_max
            );
        }
        if !self.server.route_prefix.starts_with('/') || self.server.route_prefix.len() < 2 {
            anyhow::bail!(
                "route_prefix must start with '/' and name a path segment, got {:?}",
                self.server.route_prefix
            );
        }
        if self.server.route_prefix.ends_with('/') {
            anyhow::bail!("route_prefix must not end with '/'");
        }
        Ok(())
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_route_prefix() -> String {
    "/workspace".to_string()
}

fn default_public_origin() -> String {
    "http://localhost:8080".to_string()
}

fn default_registry_path() -> String {
    "data/instances.json".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_worker_command() -> String {
    "/usr/local/bin/run-workspace {user}".to_string()
}

fn default_home_template() -> String {
    "/home/{user}".to_string()
}

fn default_port_min() -> u16 {
    10000
}

fn default_port_max() -> u16 {
    20000
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_auth_secret() -> String {
    "usergate-secret-change-in-production".to_string()
}

fn default_cookie_name() -> String {
    "token".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.route_prefix, "/workspace");
        assert_eq!(config.worker.port_min, 10000);
        assert_eq!(config.worker.port_max, 20000);
        assert_eq!(config.worker.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.worker.probe_timeout(), Duration::from_secs(2));
        assert_eq!(config.auth.cookie_name, "token");
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.worker.shutdown_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
            [server]
            port = 9090
            bind = "127.0.0.1"
            route_prefix = "/ws"
            registry_path = "/var/lib/usergate/instances.json"
            request_timeout_secs = 30

            [worker]
            command = "/opt/bin/workspace --user {user} --port {port}"
            home_template = "/srv/homes/{user}"
            port_min = 15000
            port_max = 16000
            startup_timeout_secs = 10

            [worker.env]
            WORKSPACE_THEME = "dark"

            [auth]
            secret = "supersecret"
            cookie_name = "session"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.route_prefix, "/ws");
        assert_eq!(config.worker.port_min, 15000);
        assert_eq!(config.worker.env.get("WORKSPACE_THEME").unwrap(), "dark");
        assert_eq!(config.auth.secret, "supersecret");
    }

    #[test]
    fn test_render_command() {
        let worker = WorkerConfig {
            command: "/opt/bin/workspace --user {user} --home {home} --port {port}".to_string(),
            ..WorkerConfig::default()
        };

        let argv = worker.render_command("alice", 12345).unwrap();
        assert_eq!(
            argv,
            vec![
                "/opt/bin/workspace",
                "--user",
                "alice",
                "--home",
                "/home/alice",
                "--port",
                "12345"
            ]
        );
    }

    #[test]
    fn test_render_command_rejects_empty() {
        let worker = WorkerConfig {
            command: "   ".to_string(),
            ..WorkerConfig::default()
        };
        assert!(worker.render_command("alice", 12345).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_prefix() {
        let mut config = Config::default();
        config.server.route_prefix = "workspace".to_string();
        assert!(config.validate().is_err());

        config.server.route_prefix = "/workspace/".to_string();
        assert!(config.validate().is_err());

        config.server.route_prefix = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_port_range() {
        let mut config = Config::default();
        config.worker.port_min = 20000;
        config.worker.port_max = 10000;
        assert!(config.validate().is_err());
    }
}
