//! Audio sources and the registry that owns them
//!
//! A source is anything that can take exclusive ownership of the audio output:
//! a streaming daemon, the Bluetooth sink, a playback group. Sources are
//! registered once at startup and never removed.

pub mod services;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};

/// Default budget for one activation script run
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Scripts are interpreted rather than exec'd, so they need no exec bit
const SHELL: &str = "/bin/sh";

// =============================================================================
// ActivatableSource
// =============================================================================

/// Capability contract for an audio input
#[async_trait]
pub trait ActivatableSource: Send + Sync {
    /// Unique source id (e.g. "spotify", "bluetooth")
    fn id(&self) -> &str;

    /// Take ownership of the audio output
    async fn activate(&self) -> Result<()>;

    /// Give the audio output back
    async fn deactivate(&self) -> Result<()>;
}

// =============================================================================
// SourceRegistry
// =============================================================================

/// Insertion-ordered set of sources, keyed by id
#[derive(Default)]
pub struct SourceRegistry {
    sources: Vec<Arc<dyn ActivatableSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. Duplicate ids are rejected and logged.
    pub fn register(&mut self, source: Arc<dyn ActivatableSource>) -> HubResult<()> {
        let id = source.id().to_string();
        if self.get(&id).is_some() {
            warn!("Source {} already registered, ignoring duplicate", id);
            return Err(HubError::InternalInvariant(format!(
                "source {} registered twice",
                id
            )));
        }
        info!("Registered source: {}", id);
        self.sources.push(source);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ActivatableSource>> {
        self.sources.iter().find(|s| s.id() == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// All sources in registration order
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn ActivatableSource>> {
        self.sources.iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

// =============================================================================
// ScriptSource
// =============================================================================

/// Source switched by shell scripts in a scripts directory.
///
/// Activation runs `switch-to-<id>.sh`. Deactivation runs `stop-<id>.sh` when
/// it exists and is otherwise a no-op.
pub struct ScriptSource {
    id: String,
    scripts_dir: PathBuf,
    use_sudo: bool,
    timeout: Duration,
}

impl ScriptSource {
    pub fn new(id: impl Into<String>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            scripts_dir: scripts_dir.into(),
            use_sudo: false,
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn activate_script(&self) -> PathBuf {
        self.scripts_dir.join(format!("switch-to-{}.sh", self.id))
    }

    pub fn stop_script(&self) -> PathBuf {
        self.scripts_dir.join(format!("stop-{}.sh", self.id))
    }

    async fn run_script(&self, script: &Path) -> Result<()> {
        if !script.exists() {
            bail!("script not found: {}", script.display());
        }

        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(SHELL);
            cmd
        } else {
            Command::new(SHELL)
        };
        cmd.arg(script);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        debug!("Running {} for source {}", script.display(), self.id);
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", script.display()))?;

        // Dropping the wait future on timeout kills the child
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.with_context(|| format!("failed to wait for {}", script.display()))?,
            Err(_) => {
                return Err(anyhow!(
                    "{} killed after {:?}",
                    script.display(),
                    self.timeout
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                script.display(),
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl ActivatableSource for ScriptSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn activate(&self) -> Result<()> {
        self.run_script(&self.activate_script()).await?;
        info!("Activated source {}", self.id);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        let script = self.stop_script();
        if !script.exists() {
            debug!("No stop script for {}, nothing to do", self.id);
            return Ok(());
        }
        self.run_script(&script).await?;
        info!("Deactivated source {}", self.id);
        Ok(())
    }
}
