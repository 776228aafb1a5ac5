//! Command execution inside a namespace: cloning, shell commands and
//! long-running services.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use git2::Repository;
use git2::build::CheckoutBuilder;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};

use crate::errors::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// A shell command to run in a working directory.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstraction over source checkout and process execution.
/// Real implementation: `LocalSandbox`. Test double: `ScriptedSandbox`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Clone `repo_url` into `dest`, replacing anything already there.
    async fn clone_repo(&self, repo_url: &str, dest: &Path) -> Result<(), ExecutionError>;

    /// Check out `commit` (detached) and return the resolved full hash.
    async fn checkout(&self, repo_dir: &Path, commit: &str) -> Result<String, ExecutionError>;

    /// Run a command to completion, streaming its output to `lines`.
    /// A non-zero exit is reported in `CommandOutput`, not as an error.
    async fn run_command(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<CommandOutput, ExecutionError>;

    /// Start a long-running service for `project_id`, replacing any previous
    /// one. Fails if the process exits within `grace`.
    async fn launch(
        &self,
        project_id: &str,
        spec: &CommandSpec,
        grace: Duration,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<(), ExecutionError>;

    /// Stop every launched service.
    async fn stop_all(&self);
}

/// Runs everything as host processes via `sh -c`.
#[derive(Default)]
pub struct LocalSandbox {
    /// Launched services by project id.
    services: Arc<Mutex<HashMap<String, Child>>>,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn running_services(&self) -> Vec<String> {
        let services = self.services.lock().await;
        let mut ids: Vec<String> = services.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn spawn(spec: &CommandSpec) -> Result<Child, ExecutionError> {
        Command::new("sh")
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::SpawnFailed {
                command: spec.command.clone(),
                source,
            })
    }
}

/// Forward lines from a child pipe. Keeps draining after the receiver goes
/// away so the child never blocks on a full pipe.
async fn forward_lines<R>(reader: Option<R>, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    let mut forwarding = true;
    while let Ok(Some(line)) = lines.next_line().await {
        if forwarding && tx.send(OutputLine { stream, line }).await.is_err() {
            forwarding = false;
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn clone_repo(&self, repo_url: &str, dest: &Path) -> Result<(), ExecutionError> {
        let url = repo_url.to_string();
        let dest = dest.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)
                    .with_context(|| format!("Failed to remove stale checkout {}", dest.display()))?;
            }
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Repository::clone(&url, &dest)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow!("Clone task panicked: {}", e))
        .and_then(|r| r);

        result.map_err(|e| ExecutionError::CloneFailed {
            repo_url: repo_url.to_string(),
            source: e.into(),
        })
    }

    async fn checkout(&self, repo_dir: &Path, commit: &str) -> Result<String, ExecutionError> {
        let dir = repo_dir.to_path_buf();
        let rev = commit.to_string();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            let repo = Repository::open(&dir)
                .with_context(|| format!("Failed to open repository at {}", dir.display()))?;
            let object = repo.revparse_single(&rev)?;
            let target = object.peel_to_commit()?;
            repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
            repo.set_head_detached(target.id())?;
            Ok(target.id().to_string())
        })
        .await
        .map_err(|e| anyhow!("Checkout task panicked: {}", e))
        .and_then(|r| r);

        result.map_err(|e| ExecutionError::CheckoutFailed {
            commit: commit.to_string(),
            source: e.into(),
        })
    }

    async fn run_command(
        &self,
        spec: &CommandSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<CommandOutput, ExecutionError> {
        let started = Instant::now();
        let mut child = Self::spawn(spec)?;
        let stdout = forward_lines(child.stdout.take(), OutputStream::Stdout, lines.clone());
        let stderr = forward_lines(child.stderr.take(), OutputStream::Stderr, lines);

        let run = async {
            let (status, _, _) = tokio::join!(child.wait(), stdout, stderr);
            status
        };

        // On timeout the child is killed when it drops at return.
        match tokio::time::timeout(spec.timeout, run).await {
            Ok(Ok(status)) => Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                duration: started.elapsed(),
            }),
            Ok(Err(e)) => Err(ExecutionError::Other(
                anyhow::Error::new(e).context(format!("Failed to wait for '{}'", spec.command)),
            )),
            Err(_) => Err(ExecutionError::Timeout {
                command: spec.command.clone(),
                timeout: spec.timeout,
            }),
        }
    }

    async fn launch(
        &self,
        project_id: &str,
        spec: &CommandSpec,
        grace: Duration,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<(), ExecutionError> {
        if let Some(mut previous) = self.services.lock().await.remove(project_id) {
            tracing::info!(project = %project_id, "Stopping previous deployment");
            if let Err(e) = previous.kill().await {
                tracing::warn!(project = %project_id, error = %e, "Failed to stop previous deployment");
            }
        }

        let mut child = Self::spawn(spec)?;
        tokio::spawn(forward_lines(child.stdout.take(), OutputStream::Stdout, lines.clone()));
        tokio::spawn(forward_lines(child.stderr.take(), OutputStream::Stderr, lines));

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => Err(ExecutionError::LaunchExited {
                exit_code: status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(ExecutionError::Other(
                anyhow::Error::new(e).context("Failed to watch launched service"),
            )),
            Err(_) => {
                tracing::info!(project = %project_id, pid = child.id(), "Service running");
                self.services
                    .lock()
                    .await
                    .insert(project_id.to_string(), child);
                Ok(())
            }
        }
    }

    async fn stop_all(&self) {
        let mut services = self.services.lock().await;
        for (project_id, mut child) in services.drain() {
            tracing::info!(project = %project_id, "Stopping deployment");
            if let Err(e) = child.kill().await {
                tracing::warn!(project = %project_id, error = %e, "Failed to stop deployment");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn spec(dir: &Path, command: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            workdir: dir.to_path_buf(),
            env: vec![("GREETING".to_string(), "hello".to_string())],
            timeout,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<OutputLine>) -> Vec<OutputLine> {
        let mut out = Vec::new();
        while let Some(line) = rx.recv().await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_run_command_streams_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let (tx, rx) = mpsc::channel(16);
        let output = sandbox
            .run_command(
                &spec(dir.path(), "echo $GREETING; echo oops >&2", Duration::from_secs(10)),
                tx,
            )
            .await
            .unwrap();
        assert!(output.success());

        let lines = collect(rx).await;
        assert!(lines.contains(&OutputLine {
            stream: OutputStream::Stdout,
            line: "hello".into()
        }));
        assert!(lines.contains(&OutputLine {
            stream: OutputStream::Stderr,
            line: "oops".into()
        }));
    }

    #[tokio::test]
    async fn test_run_command_reports_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let (tx, _rx) = mpsc::channel(16);
        let output = sandbox
            .run_command(&spec(dir.path(), "exit 3", Duration::from_secs(10)), tx)
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let (tx, _rx) = mpsc::channel(16);
        let err = sandbox
            .run_command(&spec(dir.path(), "sleep 5", Duration::from_millis(100)), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_launch_rejects_service_that_exits() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let (tx, _rx) = mpsc::channel(16);
        let err = sandbox
            .launch(
                "p1",
                &spec(dir.path(), "exit 2", Duration::from_secs(10)),
                Duration::from_secs(2),
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::LaunchExited { exit_code: 2 }));
        assert!(sandbox.running_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_launch_registers_and_stop_all_clears() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let (tx, _rx) = mpsc::channel(16);
        sandbox
            .launch(
                "p1",
                &spec(dir.path(), "sleep 30", Duration::from_secs(10)),
                Duration::from_millis(200),
                tx,
            )
            .await
            .unwrap();
        assert_eq!(sandbox.running_services().await, vec!["p1".to_string()]);
        sandbox.stop_all().await;
        assert!(sandbox.running_services().await.is_empty());
    }

    #[tokio::test]
    async fn test_clone_and_checkout_local_repository() {
        let origin = tempfile::tempdir().unwrap();
        let repo = Repository::init(origin.path()).unwrap();
        std::fs::write(origin.path().join("main.py"), "print('v1')\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let first = repo
            .commit(Some("HEAD"), &sig, &sig, "v1", &tree, &[])
            .unwrap();

        std::fs::write(origin.path().join("main.py"), "print('v2')\n").unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let parent = repo.find_commit(first).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "v2", &tree, &[&parent])
            .unwrap();

        let work = tempfile::tempdir().unwrap();
        let dest = work.path().join("checkout");
        let sandbox = LocalSandbox::new();
        sandbox
            .clone_repo(origin.path().to_str().unwrap(), &dest)
            .await
            .unwrap();
        let resolved = sandbox
            .checkout(&dest, &first.to_string()[..10])
            .await
            .unwrap();
        assert_eq!(resolved, first.to_string());
        let content = std::fs::read_to_string(dest.join("main.py")).unwrap();
        assert_eq!(content, "print('v1')\n");
    }

    #[tokio::test]
    async fn test_clone_failure_is_clone_failed() {
        let work = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::new();
        let err = sandbox
            .clone_repo("/definitely/not/a/repo", &work.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CloneFailed { .. }));
    }

    #[tokio::test]
    async fn test_checkout_unknown_commit_fails() {
        let origin = tempfile::tempdir().unwrap();
        Repository::init(origin.path()).unwrap();
        let sandbox = LocalSandbox::new();
        let err = sandbox.checkout(origin.path(), "deadbeef").await.unwrap_err();
        assert!(matches!(err, ExecutionError::CheckoutFailed { .. }));
    }
}
