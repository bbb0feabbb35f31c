//! Deploy stage
//!
//! For each triggered event, runs the configured steps in the working copy:
//! install, test, then names the artifact after the latest commit, then
//! pre_build and build. The first failing step ends the cycle with a failed
//! outcome and nothing is forwarded to the release stage. Cancellation is
//! checked before every step; a cancelled cycle stops where it is.

use hotswap_core::domain::event::{DEPLOYED, Event};
use hotswap_core::domain::outcome::CycleOutcome;
use hotswap_core::domain::step::ExecStep;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{DeployConfig, Platform};
use crate::git::{ArtifactName, Workspace};
use crate::service::{StepContext, StepExecutor};

pub const STAGE: &str = "deploy";

pub struct DeployStage {
    repository: String,
    platform: Platform,
    steps: DeployConfig,
    workspace: Arc<dyn Workspace>,
    executor: Arc<dyn StepExecutor>,
}

impl DeployStage {
    pub fn new(
        repository: impl Into<String>,
        platform: Platform,
        steps: DeployConfig,
        workspace: Arc<dyn Workspace>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            repository: repository.into(),
            platform,
            steps,
            workspace,
            executor,
        }
    }

    pub async fn run(
        self,
        cancel: CancellationToken,
        mut events: mpsc::UnboundedReceiver<Event>,
        release: mpsc::UnboundedSender<Event>,
        outcomes: mpsc::UnboundedSender<CycleOutcome>,
    ) -> anyhow::Result<()> {
        info!("Deploy stage started");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match self.deploy(&event, &cancel).await {
                Ok(_) if cancel.is_cancelled() => break,
                Ok(deployed) => {
                    if release.send(deployed).is_err() {
                        warn!("Release stage is gone");
                        break;
                    }
                }
                Err(outcome) => {
                    if outcomes.send(outcome).is_err() {
                        warn!("Update worker is gone");
                        break;
                    }
                }
            }
        }

        info!("Deploy stage stopped");
        Ok(())
    }

    /// Runs every deploy step for `event`
    ///
    /// # Returns
    /// The `deployed` event carrying `version` and `artifact`, or the failed
    /// outcome of the cycle
    pub async fn deploy(
        &self,
        event: &Event,
        cancel: &CancellationToken,
    ) -> Result<Event, CycleOutcome> {
        info!("Deploying cycle {}", event.id);
        let mut ctx = StepContext::new(STAGE, self.workspace.workspace_dir(), event.envs.clone());

        self.run_step(&event.id, self.steps.install.as_ref(), &mut ctx, cancel)
            .await?;
        self.run_step(&event.id, self.steps.test.as_ref(), &mut ctx, cancel)
            .await?;

        check_cancelled(&event.id, "naming", cancel)?;
        let artifact = self.name_artifact(&event.id).await?;
        let path = self.workspace.artifact_dir().join(artifact.file_name());
        ctx.version = artifact.base().to_string();
        ctx.envs.set("version", artifact.base());
        ctx.envs.set("artifact", path.to_string_lossy());

        self.run_step(&event.id, self.steps.pre_build.as_ref(), &mut ctx, cancel)
            .await?;
        self.run_step(&event.id, self.steps.build.as_ref(), &mut ctx, cancel)
            .await?;

        info!("Built {} for cycle {}", path.display(), event.id);
        Ok(Event::new(&event.id, DEPLOYED, ctx.envs))
    }

    async fn name_artifact(&self, id: &str) -> Result<ArtifactName, CycleOutcome> {
        let sha = self.workspace.latest_sha().await.map_err(|e| {
            error!("Could not read latest commit: {}", e);
            CycleOutcome::failed(id, STAGE, e)
        })?;
        ArtifactName::new(&self.repository, &sha, self.platform)
            .map_err(|e| CycleOutcome::failed(id, STAGE, e))
    }

    async fn run_step(
        &self,
        id: &str,
        step: Option<&ExecStep>,
        ctx: &mut StepContext,
        cancel: &CancellationToken,
    ) -> Result<(), CycleOutcome> {
        let Some(step) = step else {
            return Ok(());
        };
        check_cancelled(id, &step.name, cancel)?;

        match self.executor.execute(step, ctx).await {
            Ok(Some(captured)) => {
                ctx.envs.set(captured.name, captured.value);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!("Cycle {}: {}", id, e);
                Err(CycleOutcome::failed(id, STAGE, e))
            }
        }
    }
}

fn check_cancelled(id: &str, next: &str, cancel: &CancellationToken) -> Result<(), CycleOutcome> {
    if cancel.is_cancelled() {
        info!("Cycle {} cancelled before {}", id, next);
        return Err(CycleOutcome::failed(id, STAGE, format!("cancelled before {}", next)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitError, SyncOutcome};
    use crate::service::{ManagedProcess, StepError};
    use async_trait::async_trait;
    use hotswap_core::domain::event::{EnvVar, Envs, TRIGGERED};
    use hotswap_core::domain::outcome::CycleStatus;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    const SHA: &str = "0123456789abcdef0123456789abcdef01234567";

    struct FixedWorkspace {
        dir: PathBuf,
        artifacts: PathBuf,
    }

    impl FixedWorkspace {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dir: PathBuf::from("/srv/workarea"),
                artifacts: PathBuf::from("/srv/execs"),
            })
        }
    }

    #[async_trait]
    impl Workspace for FixedWorkspace {
        async fn sync(&self) -> Result<SyncOutcome, GitError> {
            Ok(SyncOutcome::Updated)
        }

        async fn latest_sha(&self) -> Result<String, GitError> {
            Ok(SHA.to_string())
        }

        fn workspace_dir(&self) -> &Path {
            &self.dir
        }

        fn artifact_dir(&self) -> &Path {
            &self.artifacts
        }
    }

    /// Records executed steps and fails the ones named in `failing`
    ///
    /// With `cancel_on` set, cancels the token while running that step.
    #[derive(Default)]
    struct RecordingExecutor {
        failing: Vec<&'static str>,
        cancel_on: Option<(&'static str, CancellationToken)>,
        executed: Mutex<Vec<(String, String, Envs)>>,
    }

    impl RecordingExecutor {
        fn failing(steps: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                failing: steps,
                ..Default::default()
            })
        }

        fn cancelling(step: &'static str, cancel: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                cancel_on: Some((step, cancel)),
                ..Default::default()
            })
        }

        fn names(&self) -> Vec<String> {
            self.executed
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StepExecutor for RecordingExecutor {
        async fn execute(
            &self,
            step: &ExecStep,
            ctx: &StepContext,
        ) -> Result<Option<EnvVar>, StepError> {
            self.executed.lock().unwrap().push((
                step.name.clone(),
                ctx.version.clone(),
                ctx.envs.clone(),
            ));
            if let Some((name, cancel)) = &self.cancel_on {
                if step.name == *name {
                    cancel.cancel();
                }
            }
            if self.failing.contains(&step.name.as_str()) {
                return Err(StepError::Failed {
                    step: step.name.clone(),
                    code: Some(1),
                    output: String::new(),
                });
            }
            Ok(step.output.as_ref().map(|name| EnvVar::new(name.clone(), "captured")))
        }

        async fn start(
            &self,
            step: &ExecStep,
            _ctx: &StepContext,
        ) -> Result<ManagedProcess, StepError> {
            Err(StepError::Spawn {
                step: step.name.clone(),
                command: step.command.clone(),
                source: std::io::Error::other("not supported"),
            })
        }
    }

    fn all_steps() -> DeployConfig {
        DeployConfig {
            install: Some(ExecStep::new("install", "go").args(["mod", "download"])),
            test: Some(ExecStep::new("test", "go").args(["test", "./..."])),
            pre_build: Some(ExecStep::new("pre_build", "go").capture_as("generated")),
            build: Some(ExecStep::new("build", "go").args(["build", "-o", "${artifact}"])),
        }
    }

    fn stage(executor: Arc<RecordingExecutor>) -> DeployStage {
        DeployStage::new(
            "svc",
            Platform { exe_suffix: "" },
            all_steps(),
            FixedWorkspace::new(),
            executor,
        )
    }

    fn triggered() -> Event {
        Event::new("c1", TRIGGERED, Envs::new().with("action", "push:svc"))
    }

    #[tokio::test]
    async fn test_runs_steps_in_order() {
        let executor = RecordingExecutor::failing(vec![]);
        let deployed = stage(executor.clone()).deploy(&triggered(), &CancellationToken::new()).await.unwrap();

        assert_eq!(executor.names(), vec!["install", "test", "pre_build", "build"]);
        assert_eq!(deployed.id, "c1");
        assert_eq!(deployed.message, DEPLOYED);
        assert_eq!(deployed.envs.get("version"), Some("svc-0123456789abcdef"));
        assert_eq!(
            deployed.envs.get("artifact"),
            Some("/srv/execs/svc-0123456789abcdef")
        );
        assert_eq!(deployed.envs.get("action"), Some("push:svc"));
        assert_eq!(deployed.envs.get("generated"), Some("captured"));
    }

    #[tokio::test]
    async fn test_version_known_only_after_naming() {
        let executor = RecordingExecutor::failing(vec![]);
        stage(executor.clone()).deploy(&triggered(), &CancellationToken::new()).await.unwrap();

        let executed = executor.executed.lock().unwrap();
        assert_eq!(executed[1].1, "");
        assert!(executed[1].2.get("artifact").is_none());
        assert_eq!(executed[3].1, "svc-0123456789abcdef");
        assert_eq!(executed[3].2.get("generated"), Some("captured"));
    }

    #[tokio::test]
    async fn test_failed_test_stops_cycle() {
        let executor = RecordingExecutor::failing(vec!["test"]);
        let outcome = stage(executor.clone()).deploy(&triggered(), &CancellationToken::new()).await.unwrap_err();

        assert_eq!(executor.names(), vec!["install", "test"]);
        assert_eq!(outcome.id, "c1");
        assert!(matches!(
            outcome.status,
            CycleStatus::Failed { ref stage, .. } if stage == STAGE
        ));
    }

    #[tokio::test]
    async fn test_missing_steps_are_skipped() {
        let executor = RecordingExecutor::failing(vec![]);
        let stage = DeployStage::new(
            "svc",
            Platform { exe_suffix: ".exe" },
            DeployConfig {
                build: Some(ExecStep::new("build", "go")),
                ..Default::default()
            },
            FixedWorkspace::new(),
            executor.clone(),
        );

        let deployed = stage.deploy(&triggered(), &CancellationToken::new()).await.unwrap();
        assert_eq!(executor.names(), vec!["build"]);
        assert_eq!(
            deployed.envs.get("artifact"),
            Some("/srv/execs/svc-0123456789abcdef.exe")
        );
    }

    #[tokio::test]
    async fn test_failure_is_not_forwarded() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let stage = stage(RecordingExecutor::failing(vec!["test"]));
        let handle = tokio::spawn(stage.run(cancel.clone(), event_rx, release_tx, outcome_tx));

        event_tx.send(triggered()).unwrap();
        let outcome = outcome_rx.recv().await.unwrap();
        assert!(outcome.is_failure());

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(release_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_step() {
        let cancel = CancellationToken::new();
        let executor = RecordingExecutor::cancelling("install", cancel.clone());
        let outcome = stage(executor.clone())
            .deploy(&triggered(), &cancel)
            .await
            .unwrap_err();

        assert_eq!(executor.names(), vec!["install"]);
        assert!(matches!(
            outcome.status,
            CycleStatus::Failed { ref reason, .. } if reason == "cancelled before test"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_is_not_forwarded() {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (release_tx, mut release_rx) = mpsc::unbounded_channel();
        let (outcome_tx, _outcome_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let executor = RecordingExecutor::cancelling("install", cancel.clone());
        event_tx.send(triggered()).unwrap();
        stage(executor.clone())
            .run(cancel.clone(), event_rx, release_tx, outcome_tx)
            .await
            .unwrap();

        assert_eq!(executor.names(), vec!["install"]);
        assert!(release_rx.try_recv().is_err());
    }
}
