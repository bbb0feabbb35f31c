//! Release stage
//!
//! For each deployed event:
//! 1. Skips the cycle if the version is already registered
//! 2. Reserves a port and starts the artifact with `${port}` resolved
//! 3. Optionally waits until the instance accepts connections
//! 4. Registers the instance and switches the default upstream to it
//! 5. Retires the previous default: kill first, then unregister
//!
//! The stage owns every process it starts. On cancellation it kills them all
//! and removes them from the registry.

use hotswap_core::domain::event::Event;
use hotswap_core::domain::outcome::{CycleOutcome, CycleStatus};
use hotswap_core::domain::upstream::{DEFAULT_VERSION, RegistryKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ReleaseConfig;
use crate::service::{
    Instance, ManagedProcess, ProcessTable, StepContext, StepExecutor, UpstreamRegistry,
};

pub const STAGE: &str = "release";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ReleaseStage {
    config: ReleaseConfig,
    artifact_dir: PathBuf,
    registry: Arc<UpstreamRegistry>,
    executor: Arc<dyn StepExecutor>,
    processes: ProcessTable,
}

impl ReleaseStage {
    pub fn new(
        config: ReleaseConfig,
        artifact_dir: impl Into<PathBuf>,
        registry: Arc<UpstreamRegistry>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            config,
            artifact_dir: artifact_dir.into(),
            registry,
            executor,
            processes: ProcessTable::new(),
        }
    }

    pub async fn run(
        mut self,
        cancel: CancellationToken,
        mut events: mpsc::UnboundedReceiver<Event>,
        outcomes: mpsc::UnboundedSender<CycleOutcome>,
    ) -> anyhow::Result<()> {
        info!("Release stage started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let outcome = self.release(&event).await;
            if outcomes.send(outcome).is_err() {
                warn!("Update worker is gone");
                break;
            }
        }

        self.shutdown().await;
        info!("Release stage stopped");
        Ok(())
    }

    /// Launches and promotes the artifact described by `event`
    pub async fn release(&mut self, event: &Event) -> CycleOutcome {
        let Some(version) = event.envs.get("version") else {
            return CycleOutcome::failed(&event.id, STAGE, "deployed event carries no version");
        };
        let key = RegistryKey::new(version, DEFAULT_VERSION);

        if self.registry.contains(&key) {
            info!("{} is already deployed, skipping launch", key);
            return CycleOutcome::new(&event.id, CycleStatus::AlreadyDeployed { key });
        }

        let port = match self.registry.next_port() {
            Ok(port) => port,
            Err(e) => {
                error!("Cannot release {}: {}", key, e);
                return CycleOutcome::failed(&event.id, STAGE, e);
            }
        };

        let mut ctx = StepContext::new(STAGE, &self.artifact_dir, event.envs.clone());
        ctx.version = version.to_string();
        ctx.envs.set("port", port.to_string());

        let mut process = match self.executor.start(&self.config.run, &ctx).await {
            Ok(process) => process,
            Err(e) => {
                error!("Cannot start {}: {}", key, e);
                self.registry.release_port(port);
                return CycleOutcome::failed(&event.id, STAGE, e);
            }
        };

        let address = format!("{}:{}", self.config.host, port);
        if let Some(timeout) = self.config.ready_timeout {
            if let Err(reason) = wait_ready(&address, timeout, &mut process).await {
                error!("{} did not become ready: {}", key, reason);
                self.abandon(&mut process, port).await;
                return CycleOutcome::failed(&event.id, STAGE, reason);
            }
        }

        let previous = self.registry.get_default();
        let instance = Instance::new(&self.config.host, port, process.handle());
        if let Err(e) = self
            .registry
            .register(&key.name, &key.version, instance, false)
        {
            error!("Cannot register {}: {}", key, e);
            self.abandon(&mut process, port).await;
            return CycleOutcome::failed(&event.id, STAGE, e);
        }

        // Switch: from here on the proxy routes new requests to the new instance
        if let Err(e) = self.registry.set_default(&key) {
            error!("Cannot promote {}: {}", key, e);
            self.abandon(&mut process, port).await;
            if let Err(e) = self.registry.unregister(&key.name, &key.version) {
                warn!("Failed to unregister {}: {}", key, e);
            }
            return CycleOutcome::failed(&event.id, STAGE, e);
        }

        process.mark_running();
        self.processes.insert(key.clone(), process);
        info!("Promoted {} at {}", key, address);

        if let Some(previous) = previous.filter(|previous| previous != &key) {
            self.retire(&previous).await;
        }

        CycleOutcome::new(&event.id, CycleStatus::Released { key, address })
    }

    /// Kills the previous default and removes it from the registry
    ///
    /// Kill failures are logged; the entry is unregistered regardless so the
    /// port becomes reusable.
    async fn retire(&mut self, previous: &RegistryKey) {
        let (address, handle) = match self.registry.lookup(previous) {
            Ok(found) => found,
            Err(e) => {
                warn!("Previous default {} vanished: {}", previous, e);
                return;
            }
        };
        info!("Retiring {} at {} (pid {:?})", previous, address, handle.pid);

        match self.processes.remove(previous) {
            Some(mut process) => {
                if let Err(e) = process.kill().await {
                    warn!("Failed to kill {}: {}", previous, e);
                }
            }
            None => warn!("No owned process for {}", previous),
        }

        if let Err(e) = self.registry.unregister(&previous.name, &previous.version) {
            warn!("Failed to unregister {}: {}", previous, e);
        }
    }

    async fn abandon(&self, process: &mut ManagedProcess, port: u16) {
        if let Err(e) = process.kill().await {
            warn!("Failed to kill {}: {}", process.name(), e);
        }
        self.registry.release_port(port);
    }

    /// Kills every owned process and unregisters it
    pub async fn shutdown(&mut self) {
        for key in self.processes.shutdown().await {
            if let Err(e) = self.registry.unregister(&key.name, &key.version) {
                debug!("{} was not registered at shutdown: {}", key, e);
            }
        }
    }

    pub fn owned(&self) -> usize {
        self.processes.len()
    }
}

/// Polls `address` until it accepts a TCP connection
///
/// Gives up when `timeout` elapses or the process exits first.
async fn wait_ready(
    address: &str,
    timeout: Duration,
    process: &mut ManagedProcess,
) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !process.is_alive() {
            return Err(format!("{} exited before accepting connections", process.name()));
        }
        if TcpStream::connect(address).await.is_ok() {
            debug!("{} accepts connections at {}", process.name(), address);
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("no connection on {} after {:?}", address, timeout));
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}
