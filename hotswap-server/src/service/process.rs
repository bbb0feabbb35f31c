//! Managed processes
//!
//! A `ManagedProcess` wraps a started child and tracks where it is in its
//! lifecycle. It has exactly one owner; the registry only ever sees the
//! copyable `ProcessHandle`. Killing is idempotent so retirement and
//! shutdown can race without a double kill.

use hotswap_core::domain::upstream::RegistryKey;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Lifecycle of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, not yet promoted
    Starting,
    /// Promoted and serving
    Running,
    /// Kill requested
    Stopping,
    /// Exited or killed
    Stopped,
}

/// Non-owning reference to a process, stored in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
}

/// An owned child process
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    state: ProcessState,
    child: Child,
}

impl ManagedProcess {
    /// Spawns `command`, forwarding its stdout/stderr to the log
    ///
    /// The child is killed if the handle is dropped without an explicit
    /// [`ManagedProcess::kill`].
    pub fn spawn(name: impl Into<String>, mut command: Command) -> io::Result<Self> {
        let name = name.into();

        command
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_output(name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name.clone(), stderr);
        }

        info!("Started process {} (pid {:?})", name, pid);

        Ok(Self {
            name,
            pid,
            state: ProcessState::Starting,
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle { pid: self.pid }
    }

    /// Marks a started process as promoted
    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Starting {
            self.state = ProcessState::Running;
        }
    }

    /// Returns true while the child has not exited
    pub fn is_alive(&mut self) -> bool {
        if self.state == ProcessState::Stopped {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("Process {} exited with {}", self.name, status);
                self.state = ProcessState::Stopped;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!("Failed to poll process {}: {}", self.name, e);
                true
            }
        }
    }

    /// Kills the process and waits for it to be reaped
    ///
    /// A process that already exited is reported as stopped without error.
    pub async fn kill(&mut self) -> io::Result<()> {
        if self.state == ProcessState::Stopped {
            return Ok(());
        }
        self.state = ProcessState::Stopping;

        if let Some(status) = self.child.try_wait()? {
            debug!("Process {} already exited with {}", self.name, status);
            self.state = ProcessState::Stopped;
            return Ok(());
        }

        let result = self.child.kill().await;
        self.state = ProcessState::Stopped;
        if result.is_ok() {
            info!("Stopped process {} (pid {:?})", self.name, self.pid);
        }
        result
    }
}

fn forward_output<R>(name: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[{}] {}", name, line);
        }
    });
}

/// Processes owned by the release stage, keyed by registry key
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<RegistryKey, ManagedProcess>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RegistryKey, process: ManagedProcess) {
        if self.processes.insert(key.clone(), process).is_some() {
            // the dropped handle kills its child
            warn!("Replacing owned process for {}", key);
        }
    }

    pub fn remove(&mut self, key: &RegistryKey) -> Option<ManagedProcess> {
        self.processes.remove(key)
    }

    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.processes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Kills every owned process, returning the keys that were held
    pub async fn shutdown(&mut self) -> Vec<RegistryKey> {
        let mut keys = Vec::with_capacity(self.processes.len());
        for (key, mut process) in self.processes.drain() {
            if let Err(e) = process.kill().await {
                warn!("Failed to kill {} during shutdown: {}", key, e);
            }
            keys.push(key);
        }
        keys
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sleeper() -> Command {
        let mut command = Command::new("sleep");
        command.arg("30");
        command
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let mut process = ManagedProcess::spawn("sleeper", sleeper()).unwrap();
        assert_eq!(process.state(), ProcessState::Starting);
        assert!(process.pid().is_some());
        assert!(process.is_alive());

        process.mark_running();
        assert_eq!(process.state(), ProcessState::Running);

        process.kill().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut process = ManagedProcess::spawn("sleeper", sleeper()).unwrap();
        process.kill().await.unwrap();
        process.kill().await.unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_kill_after_exit() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 0"]);
        let mut process = ManagedProcess::spawn("short", command).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(process.kill().await.is_ok());
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let command = Command::new("nonexistent_command_12345");
        assert!(ManagedProcess::spawn("missing", command).is_err());
    }

    #[tokio::test]
    async fn test_table_shutdown_kills_all() {
        let mut table = ProcessTable::new();
        let a = RegistryKey::new("a", "v1");
        let b = RegistryKey::new("b", "v1");
        table.insert(a.clone(), ManagedProcess::spawn("a", sleeper()).unwrap());
        table.insert(b.clone(), ManagedProcess::spawn("b", sleeper()).unwrap());
        assert_eq!(table.len(), 2);
        assert!(table.contains(&a));

        let mut keys = table.shutdown().await;
        keys.sort();
        assert_eq!(keys, vec![a, b]);
        assert!(table.is_empty());
    }
}
