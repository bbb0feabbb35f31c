//! Git workarea management
//!
//! Handles the on-disk layout of the tracked repository:
//! - Checking git availability
//! - Initialising the managed bare repository
//! - Cloning and updating the working copy used for tests and builds
//! - Naming artifacts after the latest commit
//!
//! Layout under the working root:
//! `<root>/<repository>` (bare), `<root>/workarea` (checkout), `<root>/execs` (artifacts).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Platform;

const WORKAREA: &str = "workarea";
const ARTIFACTS: &str = "execs";
const SHA_LEN: usize = 40;
const SHORT_SHA_LEN: usize = 16;

/// Git errors
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git is not available: {0}")]
    Unavailable(String),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("git {args} failed: {output}")]
    Command { args: String, output: String },

    #[error("malformed commit sha '{0}'")]
    MalformedSha(String),
}

/// Result of synchronising the working copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The working copy did not exist and was cloned; nothing else ran
    Bootstrapped,
    /// The working copy is on head and up to date
    Updated,
}

/// Operations the pipeline needs from the working copy
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Brings the working copy to the latest commit of head
    async fn sync(&self) -> Result<SyncOutcome, GitError>;

    /// Full sha of the latest commit in the working copy
    async fn latest_sha(&self) -> Result<String, GitError>;

    /// Checkout directory, base of deploy steps
    fn workspace_dir(&self) -> &Path;

    /// Artifact directory, base of release steps
    fn artifact_dir(&self) -> &Path;
}

/// Checks that `sha` is a full 40-character hexadecimal commit id
pub fn validate_sha(output: &str) -> Result<String, GitError> {
    let sha = output.trim();
    if sha.len() == SHA_LEN && sha.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(sha.to_ascii_lowercase())
    } else {
        Err(GitError::MalformedSha(sha.to_string()))
    }
}

/// Artifact named after a repository and a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    base: String,
    suffix: &'static str,
}

impl ArtifactName {
    /// Builds `<repository>-<sha16>` from a full commit sha
    pub fn new(repository: &str, sha: &str, platform: Platform) -> Result<Self, GitError> {
        let sha = validate_sha(sha)?;
        Ok(Self {
            base: format!("{}-{}", repository, &sha[..SHORT_SHA_LEN]),
            suffix: platform.exe_suffix,
        })
    }

    /// Name without the executable suffix; used as the version
    pub fn base(&self) -> &str {
        &self.base
    }

    /// File name on disk
    pub fn file_name(&self) -> String {
        format!("{}{}", self.base, self.suffix)
    }
}

/// The bare repository and its working copy
#[derive(Debug, Clone)]
pub struct GitWorkarea {
    root: PathBuf,
    bare_repo: PathBuf,
    workspace: PathBuf,
    artifacts: PathBuf,
    head: String,
}

impl GitWorkarea {
    /// Creates the working root, the bare repository and the artifact directory
    ///
    /// Fails if git is missing or the directories cannot be created; both are
    /// fatal at startup.
    pub async fn init(root: &Path, repository: &str, head: &str) -> Result<Self, GitError> {
        check_git_available().await?;

        create_dir(root)?;
        let root = root
            .canonicalize()
            .map_err(|source| GitError::Io {
                path: root.to_path_buf(),
                source,
            })?;

        let bare_repo = root.join(repository);
        create_dir(&bare_repo)?;
        run_git(&bare_repo, &["init", "--bare", "--shared"]).await?;
        if !head.is_empty() {
            let head_ref = format!("refs/heads/{}", head);
            run_git(&bare_repo, &["symbolic-ref", "HEAD", &head_ref]).await?;
        }

        let artifacts = root.join(ARTIFACTS);
        create_dir(&artifacts)?;

        info!("Initialized bare repository at {}", bare_repo.display());

        Ok(Self {
            workspace: root.join(WORKAREA),
            root,
            bare_repo,
            artifacts,
            head: head.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bare_repo(&self) -> &Path {
        &self.bare_repo
    }

    /// Branch currently checked out in the working copy
    ///
    /// Detached checkouts report the commit id.
    pub async fn current_ref(&self) -> Result<String, GitError> {
        let path = self.workspace.join(".git").join("HEAD");
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(parse_head(&content)),
            Err(source) => Err(GitError::Io { path, source }),
        }
    }
}

#[async_trait]
impl Workspace for GitWorkarea {
    async fn sync(&self) -> Result<SyncOutcome, GitError> {
        if !self.workspace.exists() {
            let bare = self.bare_repo.to_string_lossy().to_string();
            let workspace = self.workspace.to_string_lossy().to_string();
            run_git(&self.root, &["clone", &bare, &workspace]).await?;
            info!("Cloned {} into {}", bare, workspace);
            return Ok(SyncOutcome::Bootstrapped);
        }

        let current = self.current_ref().await?;
        if current != self.head {
            debug!("Workspace is on '{}', switching to '{}'", current, self.head);
            run_git(&self.workspace, &["fetch", "-p"]).await?;
            run_git(&self.workspace, &["checkout", &self.head]).await?;
        }
        run_git(&self.workspace, &["pull"]).await?;
        Ok(SyncOutcome::Updated)
    }

    async fn latest_sha(&self) -> Result<String, GitError> {
        let output = run_git(&self.workspace, &["log", "-1", "--format=%H", "."]).await?;
        validate_sha(&output)
    }

    fn workspace_dir(&self) -> &Path {
        &self.workspace
    }

    fn artifact_dir(&self) -> &Path {
        &self.artifacts
    }
}

fn parse_head(content: &str) -> String {
    let content = content.trim();
    match content.strip_prefix("ref: ") {
        Some(reference) => reference
            .strip_prefix("refs/heads/")
            .unwrap_or(reference)
            .to_string(),
        None => content.to_string(),
    }
}

fn create_dir(path: &Path) -> Result<(), GitError> {
    std::fs::create_dir_all(path).map_err(|source| GitError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Checks that git is installed and runnable
pub async fn check_git_available() -> Result<(), GitError> {
    let output = Command::new("git")
        .arg("--version")
        .output()
        .await
        .map_err(|e| GitError::Unavailable(e.to_string()))?;

    if !output.status.success() {
        return Err(GitError::Unavailable(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    debug!("{}", String::from_utf8_lossy(&output.stdout).trim());
    Ok(())
}

/// Runs git in `dir`, returning stdout; failures carry combined output
async fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|source| GitError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::Command {
            args: args.join(" "),
            output: format!("{}{}", stdout, stderr).trim().to_string(),
        });
    }
    Ok(stdout)
}
