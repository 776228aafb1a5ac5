//! Per-session project state and the process-wide project lock map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::protocol::OperationKind;
use super::updates::OperationLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStatus {
    #[default]
    Absent,
    Provisioning,
    Ready,
    Failed,
}

impl NamespaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// What a project is doing right now. At most one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveOperation {
    #[default]
    Idle,
    Provisioning,
    Testing,
    Deploying,
}

impl ActiveOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::Testing => "testing",
            Self::Deploying => "deploying",
        }
    }

    fn for_kind(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Namespace => Self::Provisioning,
            OperationKind::Test => Self::Testing,
            OperationKind::Deploy => Self::Deploying,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Success,
    Error,
}

/// Terminal record of the last operation of one kind.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub commit_hash: Option<String>,
    pub outcome: OperationOutcome,
    pub events: OperationLog,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectState {
    pub namespace_status: NamespaceStatus,
    pub namespace_id: Option<String>,
    pub active: ActiveOperation,
    pub deployment_url: Option<String>,
    last_records: HashMap<OperationKind, OperationRecord>,
}

impl ProjectState {
    pub fn last_record(&self, kind: OperationKind) -> Option<&OperationRecord> {
        self.last_records.get(&kind)
    }

    /// True when the last test in this session passed for `commit`.
    pub fn tested_successfully(&self, commit: &str) -> bool {
        self.last_records
            .get(&OperationKind::Test)
            .is_some_and(|r| {
                r.outcome == OperationOutcome::Success && r.commit_hash.as_deref() == Some(commit)
            })
    }
}

/// Why a request was refused before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The operation was registered as active and may run.
    Admitted,
    /// Namespace already ready; `namespace_setup` is a no-op.
    AlreadyReady { namespace_id: String },
    /// Test/deploy without a ready namespace.
    NamespaceRequired { status: NamespaceStatus },
    /// Another operation holds the project.
    Busy { active: ActiveOperation },
}

/// Project states for one session. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    inner: Arc<Mutex<HashMap<String, ProjectState>>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_project<R>(&self, project_id: &str, f: impl FnOnce(&mut ProjectState) -> R) -> R {
        // A poisoned lock only means another task panicked mid-update; the
        // map itself is still consistent enough to keep serving.
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.entry(project_id.to_string()).or_default())
    }

    /// Apply `f` only if the project is still tracked. Operations that end
    /// after the session released its state must not bring it back.
    fn with_existing(&self, project_id: &str, f: impl FnOnce(&mut ProjectState)) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.get_mut(project_id) {
            Some(project) => f(project),
            None => tracing::debug!(project = %project_id, "Project released; dropping outcome"),
        }
    }

    pub fn snapshot(&self, project_id: &str) -> ProjectState {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Check preconditions and, if they hold, mark `kind` active in one step.
    pub fn admit(&self, project_id: &str, kind: OperationKind) -> Admission {
        self.with_project(project_id, |p| {
            if kind == OperationKind::Namespace
                && p.namespace_status == NamespaceStatus::Ready
                && p.active != ActiveOperation::Provisioning
            {
                return Admission::AlreadyReady {
                    namespace_id: p.namespace_id.clone().unwrap_or_default(),
                };
            }
            if p.active != ActiveOperation::Idle {
                return Admission::Busy { active: p.active };
            }
            if kind != OperationKind::Namespace && p.namespace_status != NamespaceStatus::Ready {
                return Admission::NamespaceRequired {
                    status: p.namespace_status,
                };
            }
            p.active = ActiveOperation::for_kind(kind);
            if kind == OperationKind::Namespace {
                p.namespace_status = NamespaceStatus::Provisioning;
            }
            Admission::Admitted
        })
    }

    /// Record the end of a namespace provisioning run.
    pub fn finish_namespace(&self, project_id: &str, namespace_id: &str, ready: bool, events: OperationLog) {
        self.with_existing(project_id, |p| {
            p.active = ActiveOperation::Idle;
            p.namespace_status = if ready {
                NamespaceStatus::Ready
            } else {
                NamespaceStatus::Failed
            };
            p.namespace_id = Some(namespace_id.to_string());
            p.last_records.insert(
                OperationKind::Namespace,
                OperationRecord {
                    kind: OperationKind::Namespace,
                    commit_hash: None,
                    outcome: if ready {
                        OperationOutcome::Success
                    } else {
                        OperationOutcome::Error
                    },
                    events,
                },
            );
        });
    }

    /// Record the end of a test or deploy run.
    pub fn finish_operation(&self, project_id: &str, record: OperationRecord, deployment_url: Option<String>) {
        self.with_existing(project_id, |p| {
            p.active = ActiveOperation::Idle;
            if let Some(url) = deployment_url {
                p.deployment_url = Some(url);
            }
            p.last_records.insert(record.kind, record);
        });
    }

    /// Release every project; used when the connection closes.
    pub fn clear(&self) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clear();
    }

    pub fn project_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

type LockKey = (String, OperationKind);

/// Process-wide async locks keyed by project and operation kind, so two
/// sessions never provision the same namespace or run the same kind of
/// operation for one project at once.
#[derive(Debug, Clone, Default)]
pub struct ProjectLocks {
    locks: Arc<tokio::sync::Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `kind` runs of `project_id`; callers `.lock().await` it.
    pub async fn get(&self, project_id: &str, kind: OperationKind) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry((project_id.to_string(), kind)).or_default())
    }
}
