//! Session orchestrator: one `Session` per connection.
//!
//! Decodes each inbound frame, checks the project's preconditions, and spawns
//! the namespace manager or the operation executor on its own task. Every
//! task writes to the session's single outbound channel through an
//! `UpdateBus`, so events of one operation reach the client in order while
//! different projects run side by side.
//!
//! Immediate replies (rejections, already-ready namespaces) are returned to
//! the caller instead of queued. The socket loop writes them straight to the
//! socket, so it never waits on the channel it is responsible for draining.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::observability::operation_span;

use super::executor::{Operation, OperationExecutor};
use super::namespace::NamespaceManager;
use super::protocol::{Command, Envelope, OperationKind, Status, decode};
use super::state::{Admission, SessionState};
use super::updates::{OutboundSender, UpdateBus};

/// Dependencies shared by every session of the server.
pub struct Services {
    pub namespaces: NamespaceManager,
    pub executor: OperationExecutor,
    pub event_log_capacity: usize,
    shutdown: CancellationToken,
}

impl Services {
    pub fn new(namespaces: NamespaceManager, executor: OperationExecutor, event_log_capacity: usize) -> Self {
        Self {
            namespaces,
            executor,
            event_log_capacity,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel every session's operations and stop launched services.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.executor.sandbox().stop_all().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Per-connection state and request router.
pub struct Session {
    id: String,
    state: SessionState,
    services: Arc<Services>,
    outbound: OutboundSender,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(services: Arc<Services>, outbound: OutboundSender) -> Self {
        let cancel = services.shutdown.child_token();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::new(),
            services,
            outbound,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Cancelled when the session closes or the server shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle one inbound text frame. Never fails and never blocks: a problem
    /// becomes the returned reply frame, an admitted request runs on its own
    /// task and reports through the outbound channel.
    pub fn handle_text(&self, raw: &str) -> Option<Envelope> {
        let command = match decode(raw) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(session = %self.id, code = e.code(), error = %e, "Rejected frame");
                return Some(Envelope::from_protocol_error(&e));
            }
        };

        let project_id = command.project_id().to_string();
        let kind = command.kind();
        match self.state.admit(&project_id, kind) {
            Admission::Admitted => {
                self.dispatch(command);
                None
            }
            Admission::AlreadyReady { namespace_id } => {
                tracing::debug!(project = %project_id, "Namespace already ready");
                Some(Envelope::complete(
                    OperationKind::Namespace,
                    &project_id,
                    Status::Success,
                    json!({ "message": "Namespace setup completed", "namespace": namespace_id }),
                ))
            }
            Admission::NamespaceRequired { status } => Some(Envelope::error(
                "namespace_required",
                format!(
                    "Namespace for project '{}' is {}; send namespace_setup first",
                    project_id,
                    status.as_str()
                ),
            )),
            Admission::Busy { active } => Some(Envelope::error(
                "operation_in_progress",
                format!(
                    "Project '{}' is busy ({}); retry when it finishes",
                    project_id,
                    active.as_str()
                ),
            )),
        }
    }

    /// Reply to a frame that is not text.
    pub fn handle_binary(&self) -> Envelope {
        Envelope::error(
            "invalid_message_format",
            "Binary frames are not supported; send JSON text frames",
        )
    }

    /// Cancel in-flight operations and drop all project state.
    pub fn close(&self) {
        self.cancel.cancel();
        self.state.clear();
        tracing::info!(session = %self.id, "Session closed");
    }

    fn dispatch(&self, command: Command) {
        let services = Arc::clone(&self.services);
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let kind = command.kind();
        let project_id = command.project_id().to_string();
        let mut bus = UpdateBus::new(
            kind,
            project_id.clone(),
            self.outbound.clone(),
            services.event_log_capacity,
        );
        let span = operation_span(kind.as_str(), &project_id);

        tokio::spawn(
            async move {
                tracing::info!("Operation started");
                match command {
                    Command::NamespaceSetup(request) => {
                        let finished = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => false,
                            _ = services.namespaces.ensure(&request, &state, &mut bus) => true,
                        };
                        if !finished {
                            services.namespaces.abandon(&request, &state, &mut bus).await;
                        }
                    }
                    Command::Test(request) => {
                        run_operation(&services, Operation::Test(&request), &state, &mut bus, &cancel)
                            .await;
                    }
                    Command::Deploy(request) => {
                        run_operation(&services, Operation::Deploy(&request), &state, &mut bus, &cancel)
                            .await;
                    }
                }
                tracing::info!(events = bus.log().total_emitted(), "Operation finished");
            }
            .instrument(span),
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_operation(
    services: &Services,
    operation: Operation<'_>,
    state: &SessionState,
    bus: &mut UpdateBus,
    cancel: &CancellationToken,
) {
    let finished = tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = services.executor.run(operation, state, bus) => true,
    };
    if !finished {
        services.executor.abandon(operation, state, bus).await;
    }
}
