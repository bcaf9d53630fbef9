//! Launching and terminating environment instances.
//!
//! The worker pool owns one [`EnvironmentInstance`] per worker. Instances are
//! created by an [`EnvironmentLauncher`], probed until ready and terminated
//! on every exit path, including after an infrastructure failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command as AsyncCommand};
use tracing::{debug, info, warn};

use super::socket::{GatewayTimeouts, SocketGateway};
use super::EnvironmentGateway;
use crate::error::{ConvergeError, Result};

/// Placeholder in launch arguments replaced with the worker's port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Grace period for a terminated child to exit.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A running environment bound to one worker.
#[async_trait]
pub trait EnvironmentInstance: Send + Sync {
    /// Address of the instance.
    fn endpoint(&self) -> &str;

    /// Gateway talking to this instance.
    fn gateway(&self) -> Arc<dyn EnvironmentGateway>;

    /// Whether the instance is ready to accept requests.
    async fn probe(&self) -> bool;

    /// Stop the instance and release its resources. Idempotent.
    async fn terminate(&mut self) -> Result<()>;
}

/// Creates environment instances for workers.
#[async_trait]
pub trait EnvironmentLauncher: Send + Sync {
    /// Start an instance for `worker_id`. Readiness is awaited by the caller.
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn EnvironmentInstance>>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

// ============================================================================
// Process Launcher
// ============================================================================

/// Spawns one environment process per worker, each on its own port.
///
/// # Example
///
/// ```rust,ignore
/// use converge::gateway::ProcessLauncher;
///
/// // blender --background --python addon.py -- --port {port}
/// let launcher = ProcessLauncher::new(
///     "blender",
///     vec!["--background".into(), "--python".into(), "addon.py".into(),
///          "--".into(), "--port".into(), "{port}".into()],
/// )
/// .with_base_port(9876);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    host: String,
    base_port: u16,
    timeouts: GatewayTimeouts,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            host: "127.0.0.1".to_string(),
            base_port: 9876,
            timeouts: GatewayTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = port;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    fn port_for(&self, worker_id: usize) -> Result<u16> {
        u16::try_from(worker_id)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or_else(|| ConvergeError::worker_start(worker_id, "port out of range"))
    }
}

#[async_trait]
impl EnvironmentLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn EnvironmentInstance>> {
        let port = self.port_for(worker_id)?.to_string();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(PORT_PLACEHOLDER, &port))
            .collect();

        let child = AsyncCommand::new(&self.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConvergeError::worker_start(worker_id, format!("failed to spawn {}: {e}", self.program))
            })?;

        let endpoint = format!("{}:{}", self.host, port);
        info!(worker = worker_id, endpoint = %endpoint, pid = ?child.id(), "Launched environment");
        let gateway = Arc::new(SocketGateway::new(endpoint.clone()).with_timeouts(self.timeouts));
        Ok(Box::new(ProcessInstance {
            endpoint,
            gateway,
            child: Mutex::new(Some(child)),
        }))
    }

    fn name(&self) -> &str {
        &self.program
    }
}

struct ProcessInstance {
    endpoint: String,
    gateway: Arc<SocketGateway>,
    child: Mutex<Option<Child>>,
}

impl ProcessInstance {
    fn has_exited(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(child) => !matches!(child.try_wait(), Ok(None)),
                None => true,
            },
            Err(_) => true,
        }
    }
}

#[async_trait]
impl EnvironmentInstance for ProcessInstance {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn gateway(&self) -> Arc<dyn EnvironmentGateway> {
        self.gateway.clone()
    }

    async fn probe(&self) -> bool {
        !self.has_exited() && self.gateway.probe().await
    }

    async fn terminate(&mut self) -> Result<()> {
        let child = match self.child.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(mut child) = child else {
            return Ok(());
        };
        if let Err(e) = child.start_kill() {
            debug!(endpoint = %self.endpoint, "Kill failed (already exited?): {e}");
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(endpoint = %self.endpoint, %status, "Environment terminated");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(endpoint = %self.endpoint, "Environment did not exit within grace period");
                Ok(())
            }
        }
    }
}

// ============================================================================
// Attach Launcher
// ============================================================================

/// Binds worker `i` to the `i`-th pre-started endpoint.
#[derive(Debug, Clone)]
pub struct AttachLauncher {
    endpoints: Vec<String>,
    timeouts: GatewayTimeouts,
}

impl AttachLauncher {
    #[must_use]
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            timeouts: GatewayTimeouts::default(),
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[async_trait]
impl EnvironmentLauncher for AttachLauncher {
    async fn launch(&self, worker_id: usize) -> Result<Box<dyn EnvironmentInstance>> {
        let endpoint = self.endpoints.get(worker_id).cloned().ok_or_else(|| {
            ConvergeError::worker_start(
                worker_id,
                format!("only {} endpoint(s) configured", self.endpoints.len()),
            )
        })?;
        let gateway = Arc::new(SocketGateway::new(endpoint.clone()).with_timeouts(self.timeouts));
        Ok(Box::new(AttachedInstance { endpoint, gateway }))
    }

    fn name(&self) -> &str {
        "attach"
    }
}

struct AttachedInstance {
    endpoint: String,
    gateway: Arc<SocketGateway>,
}

#[async_trait]
impl EnvironmentInstance for AttachedInstance {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn gateway(&self) -> Arc<dyn EnvironmentGateway> {
        self.gateway.clone()
    }

    async fn probe(&self) -> bool {
        self.gateway.probe().await
    }

    async fn terminate(&mut self) -> Result<()> {
        // Externally managed; nothing to stop.
        Ok(())
    }
}
