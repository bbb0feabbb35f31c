//! Workflow pipeline
//!
//! Three stages connected by one-directional channels:
//!
//! ```text
//! UpdateWorker --signal--> trigger --triggered--> deploy --deployed--> release
//!      ^                                            |                      |
//!      +------------------- outcome ----------------+----------------------+
//! ```
//!
//! Each stage suspends only on its receive. Channels are unbounded so a send
//! never blocks and is never dropped. Cancelling the pipeline token stops
//! every stage after its current event.

pub mod deploy;
pub mod release;
pub mod trigger;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::git::Workspace;
use crate::scheduler::{BuildRequest, UpdateWorker};
use crate::server::supervise;
use crate::service::{StateSink, StepExecutor, UpstreamRegistry};

pub use deploy::DeployStage;
pub use release::ReleaseStage;
pub use trigger::{TriggerSignal, TriggerStage};

/// Shared services the pipeline is built from
#[derive(Clone)]
pub struct PipelineServices {
    pub workspace: Arc<dyn Workspace>,
    pub executor: Arc<dyn StepExecutor>,
    pub registry: Arc<UpstreamRegistry>,
    pub sink: Arc<dyn StateSink>,
}

/// Runs the update worker and the three stages until cancelled
///
/// The stages share a child of `cancel`; the first task to fail cancels the
/// rest and its error is returned.
pub async fn run_pipeline(
    config: &Config,
    services: PipelineServices,
    requests: mpsc::UnboundedReceiver<BuildRequest>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let (deploy_tx, deploy_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

    let worker = UpdateWorker::new(
        services.workspace.clone(),
        services.sink.clone(),
        trigger_tx,
        outcome_rx,
    );
    let deploy = DeployStage::new(
        &config.repository,
        config.platform,
        config.deploy.clone(),
        services.workspace.clone(),
        services.executor.clone(),
    );
    let release = ReleaseStage::new(
        config.release.clone(),
        services.workspace.artifact_dir(),
        services.registry.clone(),
        services.executor.clone(),
    );

    let cancel = cancel.child_token();
    let mut tasks = JoinSet::new();
    tasks.spawn(worker.run(cancel.clone(), requests));
    tasks.spawn(TriggerStage.run(cancel.clone(), trigger_rx, deploy_tx));
    tasks.spawn(deploy.run(cancel.clone(), deploy_rx, release_tx, outcome_tx.clone()));
    tasks.spawn(release.run(cancel.clone(), release_rx, outcome_tx));

    supervise(tasks, cancel).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{Language, PortRange};
    use crate::git::{GitError, SyncOutcome};
    use crate::scheduler::UpdateQueue;
    use crate::service::{InMemoryStateSink, StepRunner};
    use async_trait::async_trait;
    use hotswap_core::domain::outcome::{CycleOutcome, CycleStatus};
    use hotswap_core::domain::step::ExecStep;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Working copy whose latest commit is set by the test
    struct ScriptedWorkspace {
        dir: PathBuf,
        sha: Mutex<String>,
    }

    #[async_trait]
    impl Workspace for ScriptedWorkspace {
        async fn sync(&self) -> Result<SyncOutcome, GitError> {
            Ok(SyncOutcome::Updated)
        }

        async fn latest_sha(&self) -> Result<String, GitError> {
            Ok(self.sha.lock().unwrap().clone())
        }

        fn workspace_dir(&self) -> &Path {
            &self.dir
        }

        fn artifact_dir(&self) -> &Path {
            &self.dir
        }
    }

    fn test_config() -> Config {
        let mut config = Config::for_language(Language::Golang, "svc", "main");
        config.deploy.test = Some(ExecStep::new("test", "true"));
        config.deploy.build = Some(ExecStep::new("build", "sh").args([
            "-c",
            "echo 'exec sleep 30' > \"$0\"",
            "${artifact}",
        ]));
        config.release.run = ExecStep::new("run", "sh")
            .args(["${artifact}"])
            .env("PORT", "${port}");
        config.release.port_range = PortRange::new(18090, 18099);
        config.release.ready_timeout = None;
        config
    }

    async fn wait_for_cycles(sink: &InMemoryStateSink, count: usize) -> Vec<CycleOutcome> {
        for _ in 0..100 {
            let cycles = sink.cycles();
            if cycles.len() >= count {
                return cycles;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected {} cycles, got {:?}", count, sink.cycles());
    }

    #[tokio::test]
    async fn test_push_to_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config();
        let workspace = Arc::new(ScriptedWorkspace {
            dir: dir.path().to_path_buf(),
            sha: Mutex::new("1111111111111111aaaaaaaaaaaaaaaaaaaaaaaa".to_string()),
        });
        let sink = Arc::new(InMemoryStateSink::default());
        let registry = Arc::new(UpstreamRegistry::new(config.release.port_range));
        let services = PipelineServices {
            workspace: workspace.clone(),
            executor: Arc::new(StepRunner::new(sink.clone())),
            registry: registry.clone(),
            sink: sink.clone(),
        };

        let (queue, requests) = UpdateQueue::channel();
        let cancel = CancellationToken::new();
        let pipeline = {
            let cancel = cancel.clone();
            tokio::spawn(async move { run_pipeline(&config, services, requests, cancel).await })
        };

        queue.submit(BuildRequest::push("svc")).unwrap();
        let cycles = wait_for_cycles(&sink, 1).await;
        assert!(matches!(cycles[0].status, CycleStatus::Released { .. }));
        assert_eq!(
            registry.default_address().as_deref(),
            Some("localhost:18090")
        );
        assert!(dir.path().join("svc-1111111111111111").exists());

        // Same commit again: nothing relaunched
        queue.submit(BuildRequest::push("svc")).unwrap();
        let cycles = wait_for_cycles(&sink, 2).await;
        assert!(matches!(cycles[1].status, CycleStatus::AlreadyDeployed { .. }));

        // New commit replaces the default and retires the old instance
        *workspace.sha.lock().unwrap() = "2222222222222222bbbbbbbbbbbbbbbbbbbbbbbb".to_string();
        queue.submit(BuildRequest::push("svc")).unwrap();
        let cycles = wait_for_cycles(&sink, 3).await;
        assert!(matches!(cycles[2].status, CycleStatus::Released { .. }));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.upstreams.len(), 1);
        assert_eq!(snapshot.default.as_deref(), Some("svc-2222222222222222/v1"));

        cancel.cancel();
        pipeline.await.unwrap().unwrap();
        assert!(registry.snapshot().upstreams.is_empty());
    }

    #[tokio::test]
    async fn test_failed_tests_keep_previous_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.deploy.test = Some(ExecStep::new("test", "false"));
        let sink = Arc::new(InMemoryStateSink::default());
        let registry = Arc::new(UpstreamRegistry::new(config.release.port_range));
        let services = PipelineServices {
            workspace: Arc::new(ScriptedWorkspace {
                dir: dir.path().to_path_buf(),
                sha: Mutex::new("3333333333333333cccccccccccccccccccccccc".to_string()),
            }),
            executor: Arc::new(StepRunner::new(sink.clone())),
            registry: registry.clone(),
            sink: sink.clone(),
        };

        let (queue, requests) = UpdateQueue::channel();
        let cancel = CancellationToken::new();
        let pipeline = {
            let cancel = cancel.clone();
            tokio::spawn(async move { run_pipeline(&config, services, requests, cancel).await })
        };

        queue.submit(BuildRequest::push("svc")).unwrap();
        let cycles = wait_for_cycles(&sink, 1).await;
        assert!(cycles[0].is_failure());
        assert_eq!(registry.default_address(), None);

        let steps: Vec<_> = sink
            .steps()
            .into_iter()
            .map(|e| e.record.step_name)
            .collect();
        assert!(!steps.contains(&"build".to_string()));

        cancel.cancel();
        pipeline.await.unwrap().unwrap();
    }
}
