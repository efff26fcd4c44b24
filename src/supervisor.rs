//! Engine supervisor
//!
//! Cycles the engine: stop, rebuild the configuration from the registry,
//! start. Every attempt runs under the coordinator's restart permit.

use crate::config::EngineProcessConfig;
use crate::coordinator::{RestartCoordinator, RestartPermit};
use crate::engine::{Engine, EngineConfig, EngineInbound};
use crate::error::{Error, Result};
use crate::registry::InboundRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bounds for the stop and start phases of a restart
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    pub stop: Duration,
    pub start: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self::from(&EngineProcessConfig::default())
    }
}

impl From<&EngineProcessConfig> for PhaseTimeouts {
    fn from(config: &EngineProcessConfig) -> Self {
        Self {
            stop: config.stop_timeout(),
            // The startup probe runs inside the start phase
            start: config.start_timeout() + config.startup_probe(),
        }
    }
}

/// Step of a restart that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPhase {
    Stop,
    Build,
    Start,
}

/// How often a shutdown stop re-checks for an in-flight restart
const PERMIT_POLL: Duration = Duration::from_millis(25);

/// What a successful restart call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReport {
    /// Engine was cycled and now serves this many inbounds
    Restarted { inbounds: usize },
    /// Engine already runs the current configuration
    Unchanged,
}

/// Record of the last restart attempt
#[derive(Debug, Clone, Serialize)]
pub struct RestartOutcome {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<RestartPhase>,
    /// Tags the engine was (or would have been) started with
    pub inbounds: Vec<String>,
}

/// Engine state exposed by the management API
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub restarting: bool,
    pub pending_restart: bool,
    pub last_restart: Option<RestartOutcome>,
}

pub struct EngineSupervisor {
    engine: Arc<dyn Engine>,
    registry: Arc<InboundRegistry>,
    coordinator: Arc<RestartCoordinator>,
    timeouts: PhaseTimeouts,
    /// Config the running engine was started with
    applied: Mutex<Option<EngineConfig>>,
    last_outcome: Mutex<Option<RestartOutcome>>,
}

impl EngineSupervisor {
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Arc<InboundRegistry>,
        coordinator: Arc<RestartCoordinator>,
        timeouts: PhaseTimeouts,
    ) -> Self {
        Self {
            engine,
            registry,
            coordinator,
            timeouts,
            applied: Mutex::new(None),
            last_outcome: Mutex::new(None),
        }
    }

    /// Engine configuration for the currently enabled inbounds
    pub fn build_config(&self) -> Result<EngineConfig> {
        let inbounds: Vec<EngineInbound> = self
            .registry
            .enabled_inbounds()?
            .iter()
            .map(EngineInbound::from)
            .collect();
        ensure_unique(&inbounds)?;

        Ok(EngineConfig {
            template: self.registry.engine_template()?,
            inbounds,
        })
    }

    /// Stop, rebuild and start the engine
    ///
    /// Without `force` the restart is skipped when the engine is running
    /// with a configuration identical to a fresh build.
    pub async fn restart(&self, force: bool) -> Result<RestartReport> {
        let _permit = self.coordinator.begin_restart()?;

        if !force {
            if let Ok(preview) = self.build_config() {
                let same = self.applied.lock().as_ref() == Some(&preview);
                if same && self.engine.is_running().await {
                    debug!("Engine configuration unchanged, skipping restart");
                    return Ok(RestartReport::Unchanged);
                }
            }
        }

        let mut attempted = Vec::new();
        let mut phase = RestartPhase::Stop;
        let result = self.cycle(&mut attempted, &mut phase).await;

        let outcome = RestartOutcome {
            at: Utc::now(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            failed_phase: result.as_ref().err().map(|_| phase),
            inbounds: attempted,
        };
        *self.last_outcome.lock() = Some(outcome);

        result.map(|inbounds| RestartReport::Restarted { inbounds })
    }

    async fn cycle(&self, attempted: &mut Vec<String>, phase: &mut RestartPhase) -> Result<usize> {
        *phase = RestartPhase::Stop;
        match tokio::time::timeout(self.timeouts.stop, self.engine.stop()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::EngineStartFailed(format!(
                    "engine did not stop within {}s",
                    self.timeouts.stop.as_secs()
                )))
            }
        }
        *self.applied.lock() = None;

        *phase = RestartPhase::Build;
        let config = match self.build_config() {
            Ok(config) => config,
            Err(e) => {
                // Report what is configured even though nothing was started
                if let Ok(enabled) = self.registry.enabled_inbounds() {
                    *attempted = enabled.into_iter().map(|i| i.tag).collect();
                }
                return Err(e);
            }
        };
        *attempted = config.tags();

        *phase = RestartPhase::Start;
        match tokio::time::timeout(self.timeouts.start, self.engine.start(&config)).await {
            Ok(result) => result?,
            Err(_) => {
                // Leave nothing half-started behind
                let _ = tokio::time::timeout(self.timeouts.stop, self.engine.stop()).await;
                return Err(Error::EngineStartFailed(format!(
                    "engine did not start within {}s",
                    self.timeouts.start.as_secs()
                )));
            }
        }

        let count = config.inbounds.len();
        info!(inbounds = count, tags = ?attempted, "Engine restarted");
        *self.applied.lock() = Some(config);
        Ok(count)
    }

    /// Stop the engine for shutdown
    ///
    /// Waits for an in-flight restart to release its permit first, so a
    /// restart can never bring the engine back up after this returns.
    pub async fn stop(&self) -> Result<()> {
        let _permit = self.wait_for_permit().await?;
        let result = match tokio::time::timeout(self.timeouts.stop, self.engine.stop()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Engine did not stop in time");
                Err(Error::EngineStartFailed("engine stop timed out".to_string()))
            }
        };
        *self.applied.lock() = None;
        result
    }

    async fn wait_for_permit(&self) -> Result<RestartPermit<'_>> {
        let mut logged = false;
        loop {
            match self.coordinator.begin_restart() {
                Err(Error::RestartInProgress) => {
                    if !logged {
                        debug!("Waiting for the running restart before stopping the engine");
                        logged = true;
                    }
                    tokio::time::sleep(PERMIT_POLL).await;
                }
                other => return other,
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.engine.is_running().await
    }

    pub fn last_outcome(&self) -> Option<RestartOutcome> {
        self.last_outcome.lock().clone()
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.engine.is_running().await,
            restarting: self.coordinator.is_restarting(),
            pending_restart: self.coordinator.is_dirty(),
            last_restart: self.last_outcome(),
        }
    }
}

/// Reject configs the engine would refuse: shared tags or ports
fn ensure_unique(inbounds: &[EngineInbound]) -> Result<()> {
    let mut tags = HashSet::new();
    let mut ports = HashSet::new();
    for inbound in inbounds {
        if inbound.tag.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "inbound on port {} has no tag",
                inbound.port
            )));
        }
        if !tags.insert(inbound.tag.as_str()) {
            return Err(Error::InvalidConfig(format!("duplicate tag '{}'", inbound.tag)));
        }
        if !ports.insert(inbound.port) {
            return Err(Error::InvalidConfig(format!("duplicate port {}", inbound.port)));
        }
    }
    Ok(())
}
