//! Execution step service
//!
//! Runs one externally-defined command per step:
//! - Resolving `${name}` templates in the command, args and env values
//! - Running the command to completion (`execute`) or in the background (`start`)
//! - Reporting a `StepRecord` for every attempt to the state sink
//!
//! Templates are resolved against the cycle environment first and the
//! service's own process environment second.

use async_trait::async_trait;
use chrono::Utc;
use hotswap_core::domain::event::{EnvVar, Envs};
use hotswap_core::domain::step::{ExecStep, StepRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::service::process::ManagedProcess;
use crate::service::state::StateSink;

/// Errors raised while running a step
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step '{step}': template references undefined variable '{name}'")]
    Template { step: String, name: String },

    #[error("step '{step}': failed to launch '{command}': {source}")]
    Spawn {
        step: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' failed with exit code {code:?}")]
    Failed {
        step: String,
        code: Option<i32>,
        output: String,
    },
}

/// Resolves every `${name}` reference in `template`
///
/// Returns the name of the first variable that is neither in `envs` nor in
/// the process environment. An unterminated `${` is reported the same way.
pub fn resolve_template(template: &str, envs: &Envs) -> Result<String, String> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        resolved.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| after.to_string())?;
        let name = &after[..end];

        match envs.get(name) {
            Some(value) => resolved.push_str(value),
            None => match std::env::var(name) {
                Ok(value) => resolved.push_str(&value),
                Err(_) => return Err(name.to_string()),
            },
        }
        rest = &after[end + 1..];
    }

    resolved.push_str(rest);
    Ok(resolved)
}

/// Everything a step needs besides its own definition
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Artifact base name of the cycle; empty until the commit is named
    pub version: String,

    /// Stage running the step, used when reporting
    pub workflow: &'static str,

    /// Directory the step's `work_dir` is relative to
    pub base_dir: PathBuf,

    /// Cycle environment (`version`, `artifact`, `port`, captured outputs)
    pub envs: Envs,
}

impl StepContext {
    pub fn new(workflow: &'static str, base_dir: impl Into<PathBuf>, envs: Envs) -> Self {
        Self {
            version: String::new(),
            workflow,
            base_dir: base_dir.into(),
            envs,
        }
    }
}

/// Service trait for running steps
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs `step` to completion
    ///
    /// # Returns
    /// The captured output variable when the step declares one
    async fn execute(&self, step: &ExecStep, ctx: &StepContext) -> Result<Option<EnvVar>, StepError>;

    /// Starts `step` as a long-running process; the caller owns the result
    async fn start(&self, step: &ExecStep, ctx: &StepContext) -> Result<ManagedProcess, StepError>;
}

/// A step with every template resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStep {
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub envs: Envs,
}

impl PreparedStep {
    /// Resolves `step` against the context environment
    pub fn resolve(step: &ExecStep, ctx: &StepContext) -> Result<Self, StepError> {
        let resolve = |template: &str| {
            resolve_template(template, &ctx.envs).map_err(|name| StepError::Template {
                step: step.name.clone(),
                name,
            })
        };

        let command = resolve(&step.command)?;
        let args = step
            .args
            .iter()
            .map(|arg| resolve(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let work_dir = ctx.base_dir.join(resolve(&step.work_dir)?);

        let mut envs = Envs::new();
        for var in &step.envs {
            envs.set(var.name.clone(), resolve(&var.value)?);
        }

        Ok(Self {
            command,
            args,
            work_dir,
            envs,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.command);
        command.args(&self.args).current_dir(&self.work_dir);
        for var in &self.envs {
            command.env(&var.name, &var.value);
        }
        command
    }
}

/// Standard implementation of StepExecutor backed by OS processes
pub struct StepRunner {
    sink: Arc<dyn StateSink>,
}

impl StepRunner {
    pub fn new(sink: Arc<dyn StateSink>) -> Self {
        Self { sink }
    }

    async fn run(&self, step: &ExecStep, ctx: &StepContext) -> Result<Option<EnvVar>, StepError> {
        let prepared = PreparedStep::resolve(step, ctx)?;
        debug!(
            "Executing step {}: {} {:?} in {}",
            step.name,
            prepared.command,
            prepared.args,
            prepared.work_dir.display()
        );

        let output = prepared
            .command()
            .output()
            .await
            .map_err(|source| StepError::Spawn {
                step: step.name.clone(),
                command: prepared.command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().chain(stderr.lines()) {
            info!("[{}] {}", step.name, line);
        }

        if !output.status.success() {
            return Err(StepError::Failed {
                step: step.name.clone(),
                code: output.status.code(),
                output: format!("{}{}", stdout, stderr),
            });
        }

        Ok(step.output.as_ref().map(|name| {
            let first = stdout.lines().next().unwrap_or_default().trim();
            EnvVar::new(name.clone(), first)
        }))
    }
}

#[async_trait]
impl StepExecutor for StepRunner {
    async fn execute(&self, step: &ExecStep, ctx: &StepContext) -> Result<Option<EnvVar>, StepError> {
        let start_time = Utc::now();
        let timer = Instant::now();
        self.sink.notify_step(
            &ctx.version,
            ctx.workflow,
            StepRecord::started(&step.name, start_time),
        );

        let result = self.run(step, ctx).await;

        self.sink.notify_step(
            &ctx.version,
            ctx.workflow,
            StepRecord::finished(&step.name, result.is_ok(), start_time, timer.elapsed()),
        );
        result
    }

    async fn start(&self, step: &ExecStep, ctx: &StepContext) -> Result<ManagedProcess, StepError> {
        let start_time = Utc::now();
        self.sink.notify_step(
            &ctx.version,
            ctx.workflow,
            StepRecord::started(&step.name, start_time),
        );

        let result = PreparedStep::resolve(step, ctx).and_then(|prepared| {
            let name = if ctx.version.is_empty() {
                step.name.clone()
            } else {
                ctx.version.clone()
            };
            ManagedProcess::spawn(name, prepared.command()).map_err(|source| StepError::Spawn {
                step: step.name.clone(),
                command: prepared.command.clone(),
                source,
            })
        });

        // A successful start only reports Started; the process outlives the step
        if result.is_err() {
            self.sink.notify_step(
                &ctx.version,
                ctx.workflow,
                StepRecord::finished(&step.name, false, start_time, Default::default()),
            );
        }
        result
    }
}
