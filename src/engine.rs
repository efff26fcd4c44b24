//! Proxy engine boundary
//!
//! The engine is an opaque external process. It receives its full
//! configuration as a rendered JSON file and is cycled by the supervisor.

use crate::config::EngineProcessConfig;
use crate::error::{Error, Result};
use crate::inbound::Inbound;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Environment variable carrying the rendered config path to the engine
pub const CONFIG_PATH_ENV: &str = "RELAYGATE_ENGINE_CONFIG";

/// One inbound in the engine's native representation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineInbound {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    pub port: u16,
    pub protocol: String,
    pub settings: Value,
    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<Value>,
}

impl From<&Inbound> for EngineInbound {
    fn from(inbound: &Inbound) -> Self {
        Self {
            tag: inbound.tag.clone(),
            listen: inbound.listen.clone(),
            port: inbound.port,
            protocol: inbound.protocol.protocol().to_string(),
            settings: inbound.protocol.settings_value(),
            stream_settings: inbound.stream_settings.clone(),
            sniffing: inbound.sniffing.clone(),
        }
    }
}

/// Everything the engine is started with
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    /// Stored template overriding the renderer's base config
    pub template: Option<Value>,
    pub inbounds: Vec<EngineInbound>,
}

impl EngineConfig {
    pub fn tags(&self) -> Vec<String> {
        self.inbounds.iter().map(|i| i.tag.clone()).collect()
    }
}

/// Serializes an [`EngineConfig`] into the file the engine reads
pub trait ConfigRenderer: Send + Sync {
    fn render(&self, config: &EngineConfig) -> Result<String>;
}

/// Base JSON document whose `inbounds` array is replaced on every render
#[derive(Debug, Clone)]
pub struct JsonTemplate {
    base: Value,
}

impl JsonTemplate {
    pub fn new(base: Value) -> Result<Self> {
        if !base.is_object() {
            return Err(Error::InvalidConfig(
                "engine template must be a JSON object".to_string(),
            ));
        }
        Ok(Self { base })
    }

    /// Load the base document from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("read engine template {}: {}", path.display(), e))
        })?;
        let base = serde_json::from_str(&text).map_err(|e| {
            Error::InvalidConfig(format!("parse engine template {}: {}", path.display(), e))
        })?;
        Self::new(base)
    }

    fn default_base() -> Value {
        json!({
            "log": { "loglevel": "warning" },
            "inbounds": [],
            "outbounds": [
                { "protocol": "freedom", "settings": {} },
                { "protocol": "blackhole", "tag": "blocked", "settings": {} }
            ],
            "routing": { "rules": [] }
        })
    }
}

impl Default for JsonTemplate {
    fn default() -> Self {
        Self {
            base: Self::default_base(),
        }
    }
}

impl ConfigRenderer for JsonTemplate {
    fn render(&self, config: &EngineConfig) -> Result<String> {
        let mut document = config.template.clone().unwrap_or_else(|| self.base.clone());
        let Some(root) = document.as_object_mut() else {
            return Err(Error::InvalidConfig(
                "engine template must be a JSON object".to_string(),
            ));
        };
        let inbounds = serde_json::to_value(&config.inbounds)
            .map_err(|e| Error::InvalidConfig(format!("serialize inbounds: {}", e)))?;
        root.insert("inbounds".to_string(), inbounds);

        serde_json::to_string_pretty(&document)
            .map_err(|e| Error::InvalidConfig(format!("serialize engine config: {}", e)))
    }
}

/// Lifecycle of the external proxy engine
#[async_trait]
pub trait Engine: Send + Sync {
    async fn start(&self, config: &EngineConfig) -> Result<()>;

    /// Stop the engine; a stopped engine is left alone
    async fn stop(&self) -> Result<()>;

    async fn is_running(&self) -> bool;
}

/// Engine run as a local child process
///
/// The child handle is only stored once the startup probe passes and is
/// never locked across an await, so status reads never wait on a restart.
pub struct ProcessEngine {
    settings: EngineProcessConfig,
    renderer: Box<dyn ConfigRenderer>,
    child: Mutex<Option<Child>>,
}

impl ProcessEngine {
    pub fn new(settings: EngineProcessConfig, renderer: Box<dyn ConfigRenderer>) -> Self {
        Self {
            settings,
            renderer,
            child: Mutex::new(None),
        }
    }

    /// Build from launch settings, loading `base_config` when set
    pub fn from_config(settings: EngineProcessConfig) -> Result<Self> {
        let template = match settings.base_config.as_deref() {
            Some(path) => JsonTemplate::load(path)?,
            None => JsonTemplate::default(),
        };
        Ok(Self::new(settings, Box::new(template)))
    }

    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(&self.settings.config_path)
    }

    async fn write_config(&self, config: &EngineConfig) -> Result<PathBuf> {
        let rendered = self.renderer.render(config)?;
        let path = self.config_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::EngineStartFailed(format!("create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&path, rendered).await.map_err(|e| {
            Error::EngineStartFailed(format!("write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), inbounds = config.inbounds.len(), "Engine config written");
        Ok(path)
    }

    fn spawn(&self, config_path: &Path) -> Result<Child> {
        let command = self
            .settings
            .command
            .as_deref()
            .ok_or_else(|| Error::EngineStartFailed("engine requires 'command'".to_string()))?;

        info!(command, config = %config_path.display(), "Starting engine");

        let mut cmd = Command::new(command);
        cmd.args(&self.settings.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.settings.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &self.settings.env {
            cmd.env(key, value);
        }
        cmd.env(CONFIG_PATH_ENV, config_path);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::EngineStartFailed(format!("spawn {}: {}", command, e)))?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(child)
    }

    async fn terminate(child: &mut Child, grace_period: Duration) {
        if let Some(pid) = child.id() {
            info!(pid, "Sending SIGTERM to engine");

            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }

        match tokio::time::timeout(grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                info!(?status, "Engine exited");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for engine to exit");
            }
            Err(_) => {
                warn!(
                    grace_period_secs = grace_period.as_secs(),
                    "Grace period exceeded, sending SIGKILL"
                );
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn start(&self, config: &EngineConfig) -> Result<()> {
        let previous = self.child.lock().take();
        if let Some(mut previous) = previous {
            warn!("Engine still running at start, stopping it first");
            Self::terminate(&mut previous, self.settings.shutdown_grace_period()).await;
        }

        let path = self.write_config(config).await?;
        let mut child = self.spawn(&path)?;
        let pid = child.id().unwrap_or(0);

        match tokio::time::timeout(self.settings.startup_probe(), child.wait()).await {
            Ok(Ok(status)) => Err(Error::EngineStartFailed(format!(
                "engine exited during startup with {}",
                status
            ))),
            Ok(Err(e)) => Err(Error::EngineStartFailed(format!(
                "waiting for engine: {}",
                e
            ))),
            Err(_) => {
                info!(pid, inbounds = config.inbounds.len(), "Engine started");
                *self.child.lock() = Some(child);
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(());
        };
        Self::terminate(&mut child, self.settings.shutdown_grace_period()).await;
        Ok(())
    }

    async fn is_running(&self) -> bool {
        let mut guard = self.child.lock();
        let Some(child) = guard.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(?status, "Engine exited unexpectedly");
                *guard = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to poll engine process");
                false
            }
        }
    }
}

fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(target: "engine", stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(stream, error = %e, "Error reading engine output");
                    break;
                }
            }
        }
    });
}
