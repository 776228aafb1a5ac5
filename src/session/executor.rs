//! Test and deploy execution: clone, checkout, install, then run the tests or
//! launch the service, streaming every step as `<kind>_update` events.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::errors::ExecutionError;
use crate::util::{deploy_url, namespace_id, short_commit, slugify};

use super::namespace::NamespaceBackend;
use super::protocol::{DeployRequest, OperationKind, ProjectType, Status, TestRequest};
use super::sandbox::{CommandSpec, OutputLine, Sandbox};
use super::state::{OperationOutcome, OperationRecord, ProjectLocks, SessionState};
use super::updates::UpdateBus;

pub const STEP_CLONE: &str = "clone_repository";
pub const STEP_CHECKOUT: &str = "checkout_commit";
pub const STEP_INSTALL: &str = "install_dependencies";
pub const STEP_RUN_TESTS: &str = "run_tests";
pub const STEP_LAUNCH: &str = "launch_service";
pub const STEP_PUBLISH: &str = "publish_endpoint";

/// Buffered output lines between a running command and the bus.
const OUTPUT_BUFFER: usize = 256;

/// Knobs the executor takes from configuration.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub command_timeout: Duration,
    pub launch_grace: Duration,
    /// First port handed out; each project gets its own from here upward.
    pub service_port: u16,
    pub domain_suffix: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            launch_grace: Duration::from_secs(2),
            service_port: 8000,
            domain_suffix: "shipyard.localhost".to_string(),
        }
    }
}

/// A test or deploy request ready to run.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    Test(&'a TestRequest),
    Deploy(&'a DeployRequest),
}

impl Operation<'_> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Test(_) => OperationKind::Test,
            Self::Deploy(_) => OperationKind::Deploy,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            Self::Test(req) => &req.project_id,
            Self::Deploy(req) => &req.project_id,
        }
    }

    pub fn repo_url(&self) -> &str {
        match self {
            Self::Test(req) => &req.repo_url,
            Self::Deploy(req) => &req.repo_url,
        }
    }

    pub fn commit_hash(&self) -> &str {
        match self {
            Self::Test(req) => &req.commit_hash,
            Self::Deploy(req) => &req.commit_hash,
        }
    }

    pub fn project_type(&self) -> ProjectType {
        match self {
            Self::Test(req) => req.project_type,
            Self::Deploy(req) => req.project_type,
        }
    }

    fn commands(&self) -> Value {
        let install = self.project_type().install_command();
        match self {
            Self::Test(req) => json!({
                "install": install,
                "test": req.test_command,
                "start": req.start_command,
            }),
            Self::Deploy(req) => json!({
                "install": install,
                "start": req.start_command,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Test {
        passed: bool,
        exit_code: i32,
        duration: Duration,
    },
    Deploy {
        url: String,
        port: u16,
    },
}

type StepFailure = (&'static str, ExecutionError);

/// `$PORT` values by project. A project keeps its port across redeploys so
/// the previous service is replaced in place; different projects never share.
#[derive(Debug)]
struct ServicePorts {
    base: u16,
    assigned: Mutex<HashMap<String, u16>>,
}

impl ServicePorts {
    fn new(base: u16) -> Self {
        Self {
            base,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    fn assign(&self, project_id: &str) -> Option<u16> {
        let mut assigned = self
            .assigned
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(port) = assigned.get(project_id) {
            return Some(*port);
        }
        let offset = u16::try_from(assigned.len()).ok()?;
        let port = self.base.checked_add(offset)?;
        assigned.insert(project_id.to_string(), port);
        Some(port)
    }
}

pub struct OperationExecutor {
    sandbox: Arc<dyn Sandbox>,
    namespaces: Arc<dyn NamespaceBackend>,
    locks: ProjectLocks,
    ports: ServicePorts,
    settings: ExecutorSettings,
}

impl OperationExecutor {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        namespaces: Arc<dyn NamespaceBackend>,
        locks: ProjectLocks,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            sandbox,
            namespaces,
            locks,
            ports: ServicePorts::new(settings.service_port),
            settings,
        }
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run `operation` to completion.
    ///
    /// The caller must already have admitted it (project marked testing or
    /// deploying). Runs of the same kind for one project are serialized across
    /// sessions; a run that has to wait says so in a `log` update. The
    /// project's record is updated before the terminal `<kind>_complete` frame
    /// goes out, so a client reacting to that frame finds the project idle.
    pub async fn run(
        &self,
        operation: Operation<'_>,
        state: &SessionState,
        bus: &mut UpdateBus,
    ) -> Result<OperationResult, ExecutionError> {
        let started = Instant::now();
        let project_id = operation.project_id().to_string();
        let commit = operation.commit_hash().to_string();
        let snapshot = state.snapshot(&project_id);
        let namespace = snapshot
            .namespace_id
            .clone()
            .unwrap_or_else(|| namespace_id(&project_id));

        self.start(operation, &namespace, bus).await;

        if operation.kind() == OperationKind::Deploy && snapshot.tested_successfully(&commit) {
            bus.transition(OperationKind::Test, OperationKind::Deploy, &commit)
                .await;
        }

        let lock = self.locks.get(&project_id, operation.kind()).await;
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                bus.log_line(
                    "info",
                    &format!(
                        "Waiting for another {} run of this project",
                        operation.kind().as_str()
                    ),
                )
                .await;
                lock.lock().await
            }
        };

        let workdir = self.namespaces.workdir(&namespace).join(format!(
            "{}-{}",
            operation.kind().as_str(),
            slugify(short_commit(&commit), 12)
        ));

        match self.execute(operation, &workdir, bus).await {
            Ok(result) => {
                let (message, url) = match &result {
                    OperationResult::Test { .. } => ("Tests passed", None),
                    OperationResult::Deploy { url, .. } => ("Deployment completed", Some(url.clone())),
                };
                tracing::info!(
                    project = %project_id,
                    kind = operation.kind().as_str(),
                    commit = short_commit(&commit),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Operation succeeded"
                );
                bus.complete(message, started.elapsed().as_millis()).await;
                state.finish_operation(
                    &project_id,
                    self.record(operation, OperationOutcome::Success, bus),
                    url.clone(),
                );

                let mut payload = json!({ "message": message, "commitHash": commit });
                match url {
                    Some(url) => payload["url"] = Value::String(url),
                    None => payload["passed"] = Value::Bool(true),
                }
                bus.finish(Status::Success, payload).await;
                Ok(result)
            }
            Err((step, err)) => {
                let message = err.to_string();
                tracing::warn!(
                    project = %project_id,
                    kind = operation.kind().as_str(),
                    step,
                    error = %message,
                    "Operation failed"
                );
                bus.error(err.code(step), &message, Some(step)).await;
                state.finish_operation(
                    &project_id,
                    self.record(operation, OperationOutcome::Error, bus),
                    None,
                );

                let mut payload = json!({ "message": message, "commitHash": commit });
                if operation.kind() == OperationKind::Test {
                    payload["passed"] = Value::Bool(false);
                }
                bus.finish(Status::Error, payload).await;
                Err(err)
            }
        }
    }

    async fn start(&self, operation: Operation<'_>, namespace: &str, bus: &mut UpdateBus) {
        bus.start(json!({
            "commitHash": operation.commit_hash(),
            "commands": operation.commands(),
            "namespace": namespace,
            "repoURL": operation.repo_url(),
        }))
        .await;
    }

    /// Close out an operation whose task was cancelled before it finished.
    /// One cancelled before it emitted anything still reports `start` first.
    pub async fn abandon(&self, operation: Operation<'_>, state: &SessionState, bus: &mut UpdateBus) {
        let err = ExecutionError::Cancelled;
        if !bus.has_started() {
            let namespace = state
                .snapshot(operation.project_id())
                .namespace_id
                .unwrap_or_else(|| namespace_id(operation.project_id()));
            self.start(operation, &namespace, bus).await;
        }
        if !bus.is_terminated() {
            bus.error(err.code(""), &err.to_string(), None).await;
        }
        state.finish_operation(
            operation.project_id(),
            self.record(operation, OperationOutcome::Error, bus),
            None,
        );
        bus.finish(
            Status::Error,
            json!({ "message": err.to_string(), "commitHash": operation.commit_hash() }),
        )
        .await;
    }

    fn record(&self, operation: Operation<'_>, outcome: OperationOutcome, bus: &UpdateBus) -> OperationRecord {
        OperationRecord {
            kind: operation.kind(),
            commit_hash: Some(operation.commit_hash().to_string()),
            outcome,
            events: bus.log().clone(),
        }
    }

    async fn execute(
        &self,
        operation: Operation<'_>,
        workdir: &Path,
        bus: &mut UpdateBus,
    ) -> Result<OperationResult, StepFailure> {
        let project_type = operation.project_type();
        let main_step = match operation {
            Operation::Test(_) => STEP_RUN_TESTS,
            Operation::Deploy(_) => STEP_LAUNCH,
        };
        let port = self.ports.assign(operation.project_id()).ok_or_else(|| {
            (
                main_step,
                ExecutionError::Other(anyhow!(
                    "No service port left above {}",
                    self.settings.service_port
                )),
            )
        })?;

        bus.step(STEP_CLONE, "Cloning repository").await;
        self.sandbox
            .clone_repo(operation.repo_url(), workdir)
            .await
            .map_err(|e| (STEP_CLONE, e))?;

        bus.step(
            STEP_CHECKOUT,
            &format!("Checking out {}", short_commit(operation.commit_hash())),
        )
        .await;
        let resolved = self
            .sandbox
            .checkout(workdir, operation.commit_hash())
            .await
            .map_err(|e| (STEP_CHECKOUT, e))?;
        bus.log_line("info", &format!("HEAD is now at {}", resolved))
            .await;

        let manifest = project_type.dependency_manifest();
        let has_manifest = tokio::fs::try_exists(workdir.join(manifest))
            .await
            .unwrap_or(false);
        if has_manifest {
            bus.step(STEP_INSTALL, "Installing dependencies").await;
            let elapsed = self
                .run_checked(STEP_INSTALL, project_type.install_command(), operation, workdir, port, bus)
                .await?;
            tracing::debug!(elapsed_ms = elapsed.as_millis() as u64, "Dependencies installed");
        } else {
            bus.step_skipped(STEP_INSTALL, &format!("No {} found", manifest))
                .await;
        }

        match operation {
            Operation::Test(req) => {
                bus.step(STEP_RUN_TESTS, "Running tests").await;
                bus.command(STEP_RUN_TESTS, &req.test_command).await;
                let spec = self.spec(&req.test_command, operation, workdir, port);
                let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
                let output = stream_output(bus, STEP_RUN_TESTS, rx, self.sandbox.run_command(&spec, tx))
                    .await
                    .map_err(|e| (STEP_RUN_TESTS, e))?;

                let passed = output.success();
                bus.result(json!({
                    "passed": passed,
                    "exitCode": output.exit_code,
                    "durationMs": output.duration.as_millis() as u64,
                }))
                .await;
                if !passed {
                    return Err((
                        STEP_RUN_TESTS,
                        ExecutionError::NonZeroExit {
                            command: req.test_command.clone(),
                            exit_code: output.exit_code,
                        },
                    ));
                }
                Ok(OperationResult::Test {
                    passed,
                    exit_code: output.exit_code,
                    duration: output.duration,
                })
            }
            Operation::Deploy(req) => {
                bus.step(STEP_LAUNCH, "Starting service").await;
                bus.command(STEP_LAUNCH, &req.start_command).await;
                let spec = self.spec(&req.start_command, operation, workdir, port);
                let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
                let launch = self.sandbox.launch(
                    &req.project_id,
                    &spec,
                    self.settings.launch_grace,
                    tx,
                );
                stream_output(bus, STEP_LAUNCH, rx, launch)
                    .await
                    .map_err(|e| (STEP_LAUNCH, e))?;

                bus.step(STEP_PUBLISH, "Publishing endpoint").await;
                let url = deploy_url(&req.project_id, &self.settings.domain_suffix);
                bus.log_line("info", &format!("Service available at {} (port {})", url, port))
                    .await;
                bus.result(json!({ "url": url, "port": port })).await;
                Ok(OperationResult::Deploy { url, port })
            }
        }
    }

    /// Run a command that must exit zero, streaming its output.
    async fn run_checked(
        &self,
        step: &'static str,
        command: &str,
        operation: Operation<'_>,
        workdir: &Path,
        port: u16,
        bus: &mut UpdateBus,
    ) -> Result<Duration, StepFailure> {
        bus.command(step, command).await;
        let spec = self.spec(command, operation, workdir, port);
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let output = stream_output(bus, step, rx, self.sandbox.run_command(&spec, tx))
            .await
            .map_err(|e| (step, e))?;
        if !output.success() {
            return Err((
                step,
                ExecutionError::NonZeroExit {
                    command: command.to_string(),
                    exit_code: output.exit_code,
                },
            ));
        }
        Ok(output.duration)
    }

    fn spec(&self, command: &str, operation: Operation<'_>, workdir: &Path, port: u16) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            workdir: PathBuf::from(workdir),
            env: vec![
                ("PORT".to_string(), port.to_string()),
                ("PROJECT_ID".to_string(), operation.project_id().to_string()),
                ("COMMIT_HASH".to_string(), operation.commit_hash().to_string()),
            ],
            timeout: self.settings.command_timeout,
        }
    }
}

/// Drive `work` while forwarding its output lines to the bus as `output`
/// updates, then flush whatever was buffered when it finished.
async fn stream_output<F, T>(
    bus: &mut UpdateBus,
    step: &str,
    mut lines: mpsc::Receiver<OutputLine>,
    work: F,
) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    let result = loop {
        tokio::select! {
            biased;
            Some(line) = lines.recv() => {
                bus.output(step, line.stream.as_str(), &line.line).await;
            }
            result = &mut work => break result,
        }
    };
    while let Ok(line) = lines.try_recv() {
        bus.output(step, line.stream.as_str(), &line.line).await;
    }
    result
}
