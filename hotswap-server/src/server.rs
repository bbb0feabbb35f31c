//! Server startup and task group
//!
//! Builds the workarea, the registry and the queue, binds both listeners and
//! runs four tasks under one cancellation token:
//! - the signal handler
//! - the git listener (API + git smart-HTTP)
//! - the proxy listener
//! - the workflow pipeline
//!
//! The first task to fail cancels the others; its error is returned once all
//! of them have stopped.

use anyhow::Context;
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{self, AppState, GitHttpBackend};
use crate::config::Config;
use crate::git::{GitWorkarea, Workspace};
use crate::proxy;
use crate::scheduler::UpdateQueue;
use crate::service::{InMemoryStateSink, StepRunner, UpstreamRegistry};
use crate::signal;
use crate::workflow::{PipelineServices, run_pipeline};

/// Waits for every task in `tasks`, cancelling `cancel` on the first failure
///
/// Returns the first error, if any.
pub async fn supervise(
    mut tasks: JoinSet<anyhow::Result<()>>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut first_error = None;

    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .context("task panicked")
            .and_then(|result| result);
        if let Err(e) = result {
            error!("Task failed: {:#}", e);
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
    name: &'static str,
) -> anyhow::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .with_context(|| format!("{} listener failed", name))?;
    info!("{} listener stopped", name);
    Ok(())
}

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} listener on {}", name, addr))?;
    info!("{} listener on {}", name, addr);
    Ok(listener)
}

/// Runs the service until a signal arrives or a task fails
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (root, temporary) = match &config.workdir {
        Some(dir) => (dir.clone(), false),
        None => (
            std::env::temp_dir().join(format!("hotswap-{}", Uuid::new_v4())),
            true,
        ),
    };

    let result = run_in(config, &root).await;

    if temporary {
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => info!("Removed working root {}", root.display()),
            Err(e) => warn!("Could not remove working root {}: {}", root.display(), e),
        }
    }
    result
}

async fn run_in(config: Config, root: &Path) -> anyhow::Result<()> {
    let workarea = GitWorkarea::init(root, &config.repository, &config.head)
        .await
        .context("failed to initialize git workarea")?;
    info!(
        "Working root {}, push to http://{}/{}",
        workarea.root().display(),
        config.api_addr,
        config.repository
    );

    let sink = Arc::new(InMemoryStateSink::default());
    let registry = Arc::new(UpstreamRegistry::new(config.release.port_range));
    let (queue, requests) = UpdateQueue::channel();

    let api_listener = bind(&config.api_addr, "git").await?;
    let proxy_listener = bind(&config.proxy_addr, "proxy").await?;

    let app = api::create_router(AppState {
        repository: config.repository.clone(),
        registry: registry.clone(),
        sink: sink.clone(),
        queue,
        git: Arc::new(GitHttpBackend::new(workarea.root())),
    });
    let proxy = proxy::create_proxy_router(registry.clone())?;

    let workspace: Arc<dyn Workspace> = Arc::new(workarea);
    let services = PipelineServices {
        workspace,
        executor: Arc::new(StepRunner::new(sink.clone())),
        registry,
        sink,
    };

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    tasks.spawn(signal::handle_signals(cancel.clone()));
    tasks.spawn(serve(api_listener, app, cancel.clone(), "git"));
    tasks.spawn(serve(proxy_listener, proxy, cancel.clone(), "proxy"));
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { run_pipeline(&config, services, requests, cancel).await });
    }

    supervise(tasks, cancel).await
}
