//! Per-operation update stream.
//!
//! An `UpdateBus` is owned by exactly one running operation. It enforces the
//! stream shape clients rely on: `start` first, then any number of progress
//! updates, then exactly one terminal `complete` or `error`. Anything emitted
//! out of that order is dropped and logged.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::protocol::{Envelope, OperationKind, Status};

/// Outbound half of a connection; every frame for the session goes through it.
pub type OutboundSender = mpsc::Sender<Envelope>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Start,
    Step,
    Command,
    Output,
    Log,
    Error,
    Result,
    Transition,
    Complete,
}

impl UpdateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Step => "step",
            Self::Command => "command",
            Self::Output => "output",
            Self::Log => "log",
            Self::Error => "error",
            Self::Result => "result",
            Self::Transition => "transition",
            Self::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// One immutable update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEvent {
    pub update_type: UpdateType,
    pub data: Value,
    pub emitted_at: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn new(update_type: UpdateType, data: Value) -> Self {
        Self {
            update_type,
            data,
            emitted_at: Utc::now(),
        }
    }
}

/// Bounded record of the update types an operation emitted, oldest dropped first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationLog {
    capacity: usize,
    entries: VecDeque<UpdateType>,
    total: usize,
}

impl OperationLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
            total: 0,
        }
    }

    pub fn push(&mut self, update_type: UpdateType) {
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(update_type);
    }

    /// Retained entries, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = UpdateType> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Everything ever pushed, including entries evicted by the bound.
    pub fn total_emitted(&self) -> usize {
        self.total
    }

    pub fn last(&self) -> Option<UpdateType> {
        self.entries.back().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Created,
    Running,
    Terminated,
}

/// Ordered update emitter for a single operation.
pub struct UpdateBus {
    kind: OperationKind,
    project_id: String,
    tx: OutboundSender,
    log: OperationLog,
    state: BusState,
}

impl UpdateBus {
    pub fn new(
        kind: OperationKind,
        project_id: impl Into<String>,
        tx: OutboundSender,
        log_capacity: usize,
    ) -> Self {
        Self {
            kind,
            project_id: project_id.into(),
            tx,
            log: OperationLog::with_capacity(log_capacity),
            state: BusState::Created,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn has_started(&self) -> bool {
        self.state != BusState::Created
    }

    pub fn is_terminated(&self) -> bool {
        self.state == BusState::Terminated
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn into_log(self) -> OperationLog {
        self.log
    }

    /// Emit one update, enforcing stream order.
    pub async fn emit(&mut self, update_type: UpdateType, data: Value) {
        match (self.state, update_type) {
            (BusState::Terminated, _) => {
                tracing::warn!(
                    kind = self.kind.as_str(),
                    update = update_type.as_str(),
                    "Dropping update emitted after termination"
                );
                return;
            }
            (BusState::Created, UpdateType::Start) => self.state = BusState::Running,
            (BusState::Created, _) => {
                tracing::warn!(
                    kind = self.kind.as_str(),
                    update = update_type.as_str(),
                    "Dropping update emitted before start"
                );
                return;
            }
            (BusState::Running, UpdateType::Start) => {
                tracing::warn!(kind = self.kind.as_str(), "Dropping duplicate start update");
                return;
            }
            (BusState::Running, t) if t.is_terminal() => self.state = BusState::Terminated,
            (BusState::Running, _) => {}
        }

        self.log.push(update_type);
        let event = UpdateEvent::new(update_type, data);
        self.send(Envelope::update(self.kind, &self.project_id, &event))
            .await;
    }

    pub async fn start(&mut self, data: Value) {
        self.emit(UpdateType::Start, data).await;
    }

    pub async fn step(&mut self, step: &str, description: &str) {
        self.emit(
            UpdateType::Step,
            json!({
                "step": step,
                "description": description,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
    }

    pub async fn step_skipped(&mut self, step: &str, description: &str) {
        self.emit(
            UpdateType::Step,
            json!({
                "step": step,
                "description": description,
                "timestamp": Utc::now().to_rfc3339(),
                "skipped": true,
            }),
        )
        .await;
    }

    pub async fn command(&mut self, step: &str, command: &str) {
        self.emit(UpdateType::Command, json!({ "step": step, "command": command }))
            .await;
    }

    pub async fn output(&mut self, step: &str, stream: &str, line: &str) {
        self.emit(
            UpdateType::Output,
            json!({ "step": step, "stream": stream, "line": line }),
        )
        .await;
    }

    pub async fn log_line(&mut self, level: &str, message: &str) {
        self.emit(UpdateType::Log, json!({ "level": level, "message": message }))
            .await;
    }

    pub async fn transition(&mut self, from: OperationKind, to: OperationKind, commit: &str) {
        self.emit(
            UpdateType::Transition,
            json!({ "from": from.as_str(), "to": to.as_str(), "commitHash": commit }),
        )
        .await;
    }

    pub async fn result(&mut self, data: Value) {
        self.emit(UpdateType::Result, data).await;
    }

    /// Terminal failure update.
    pub async fn error(&mut self, code: &str, message: &str, step: Option<&str>) {
        let mut data = json!({ "code": code, "message": message });
        if let Some(step) = step {
            data["step"] = Value::String(step.to_string());
        }
        self.emit(UpdateType::Error, data).await;
    }

    /// Terminal success update.
    pub async fn complete(&mut self, message: &str, duration_ms: u128) {
        self.emit(
            UpdateType::Complete,
            json!({ "message": message, "durationMs": duration_ms as u64 }),
        )
        .await;
    }

    /// Send the `<kind>_complete` frame that follows the terminal update.
    pub async fn finish(&mut self, status: Status, payload: Value) {
        let envelope = Envelope::complete(self.kind, &self.project_id, status, payload);
        self.send(envelope).await;
    }

    /// Send a frame outside the update stream (outer `error`).
    pub async fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).await.is_err() {
            tracing::debug!(
                kind = self.kind.as_str(),
                "Outbound channel closed; client disconnected"
            );
        }
    }
}
