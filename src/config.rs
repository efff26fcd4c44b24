use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Management API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Persistent store location
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Restart scheduling
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// How the proxy engine process is launched
    #[serde(default)]
    pub engine: EngineProcessConfig,

    /// Account auto-provisioning for new inbounds
    #[serde(default)]
    pub provisioning: ProvisioningPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the management API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Management API port (default: 54321)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bearer token granting administrator access.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Administrator account seeded on first start
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// Initial administrator password (only used when the account is created)
    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_token: None,
            admin_username: default_admin_username(),
            admin_password: default_admin_password(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Seconds between restart checks (default: 10)
    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,

    /// Minimum seconds between two restart attempts (default: 0)
    #[serde(default)]
    pub min_restart_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_restart_interval(&self) -> Duration {
        Duration::from_secs(self.min_restart_interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scheduler_interval(),
            min_restart_interval_secs: 0,
        }
    }
}

/// Launch settings for the proxy engine process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// daemon. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineProcessConfig {
    /// Engine executable
    pub command: Option<String>,

    /// Arguments passed to the engine
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the engine
    pub working_dir: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Where the rendered engine configuration is written
    #[serde(default = "default_engine_config_path")]
    pub config_path: String,

    /// JSON template whose `inbounds` array is replaced on every render
    pub base_config: Option<String>,

    /// Upper bound for the start phase of a restart
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// An engine that exits within this window counts as a failed start
    #[serde(default = "default_startup_probe")]
    pub startup_probe_ms: u64,
}

impl EngineProcessConfig {
    /// Create an engine config for the given command with defaults
    pub fn local(command: &str) -> Self {
        Self {
            command: Some(command.to_string()),
            ..Self::default()
        }
    }

    /// Set arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the rendered config path (builder pattern)
    pub fn with_config_path(mut self, path: &str) -> Self {
        self.config_path = path.to_string();
        self
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Stopping may take the whole grace period plus the final kill
    pub fn stop_timeout(&self) -> Duration {
        self.shutdown_grace_period() + Duration::from_secs(5)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.command.as_deref() {
            None | Some("") => Err("engine: 'command' is required".to_string()),
            Some(_) if self.start_timeout_secs == 0 => {
                Err("engine: 'start_timeout_secs' must be greater than 0".to_string())
            }
            Some(_) => Ok(()),
        }
    }
}

impl Default for EngineProcessConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            config_path: default_engine_config_path(),
            base_config: None,
            start_timeout_secs: default_start_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            startup_probe_ms: default_startup_probe(),
        }
    }
}

/// Predicate deciding whether an inbound's label matches an existing account
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OwnerMatch {
    /// Any account whose username equals the label (default)
    #[default]
    Username,
    /// Username equals the label and the password is still the default credential
    UsernameAndPassword,
}

/// Account auto-provisioning applied when an inbound is added
#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningPolicy {
    /// Create viewer accounts for new labels (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Credential given to provisioned accounts
    #[serde(default = "default_viewer_password")]
    pub default_password: String,

    /// How a label is matched against existing accounts
    #[serde(default)]
    pub owner_match: OwnerMatch,
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            default_password: default_viewer_password(),
            owner_match: OwnerMatch::default(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    54321
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_password() -> String {
    "admin".to_string()
}

fn default_database_path() -> String {
    "./relaygate.db".to_string()
}

fn default_scheduler_interval() -> u64 {
    10
}

fn default_engine_config_path() -> String {
    "./engine-config.json".to_string()
}

fn default_start_timeout() -> u64 {
    5
}

fn default_shutdown_grace_period() -> u64 {
    10
}

fn default_startup_probe() -> u64 {
    300
}

fn default_viewer_password() -> String {
    "admin".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.engine.validate() {
            errors.push(e);
        }

        if self.scheduler.interval_secs == 0 {
            errors.push("scheduler: 'interval_secs' must be greater than 0".to_string());
        }

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "0.0.0.0"
port = 8080
admin_token = "secret"

[database]
path = "/var/lib/relaygate/db.sqlite"

[scheduler]
interval_secs = 5
min_restart_interval_secs = 30

[engine]
command = "/usr/local/bin/xray"
args = ["run", "-c", "/etc/xray/config.json"]
config_path = "/etc/xray/config.json"

[engine.env]
XRAY_LOCATION_ASSET = "/usr/share/xray"

[provisioning]
default_password = "changeme"
owner_match = "username-and-password"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.database.path, "/var/lib/relaygate/db.sqlite");
        assert_eq!(config.scheduler.interval(), Duration::from_secs(5));
        assert_eq!(config.scheduler.min_restart_interval(), Duration::from_secs(30));
        assert_eq!(config.engine.args.len(), 3);
        assert_eq!(
            config.engine.env.get("XRAY_LOCATION_ASSET").map(String::as_str),
            Some("/usr/share/xray")
        );
        assert_eq!(config.provisioning.owner_match, OwnerMatch::UsernameAndPassword);
        assert_eq!(config.provisioning.default_password, "changeme");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 54321);
        assert_eq!(config.admin_username, "admin");
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_default_scheduler_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.min_restart_interval(), Duration::ZERO);
    }

    #[test]
    fn test_default_engine_config() {
        let engine = EngineProcessConfig::default();
        assert_eq!(engine.config_path, "./engine-config.json");
        assert_eq!(engine.start_timeout(), Duration::from_secs(5));
        assert_eq!(engine.shutdown_grace_period(), Duration::from_secs(10));
        assert_eq!(engine.stop_timeout(), Duration::from_secs(15));
        assert_eq!(engine.startup_probe(), Duration::from_millis(300));
    }

    #[test]
    fn test_default_provisioning_policy() {
        let policy = ProvisioningPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.default_password, "admin");
        assert_eq!(policy.owner_match, OwnerMatch::Username);
    }

    #[test]
    fn test_minimal_config() {
        let config: Config = toml::from_str(
            r#"
[engine]
command = "xray"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 54321);
        assert_eq!(config.scheduler.interval_secs, 10);
        assert!(config.provisioning.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_engine_command() {
        let config: Config = toml::from_str("").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'command' is required"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let config: Config = toml::from_str(
            r#"
[server]
port = 0

[scheduler]
interval_secs = 0
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'command' is required"));
        assert!(err.contains("'interval_secs' must be greater than 0"));
        assert!(err.contains("'port' must be greater than 0"));
    }

    #[test]
    fn test_engine_builder_helpers() {
        let engine = EngineProcessConfig::local("sleep")
            .with_args(vec!["60".to_string()])
            .with_config_path("/tmp/engine.json");
        assert_eq!(engine.command.as_deref(), Some("sleep"));
        assert_eq!(engine.args, vec!["60"]);
        assert_eq!(engine.config_path, "/tmp/engine.json");
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\ncommand = \"xray\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.engine.command.as_deref(), Some("xray"));
    }
}
