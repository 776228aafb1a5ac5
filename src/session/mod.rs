//! WebSocket session orchestration.
//!
//! | Module         | Role                                                       |
//! |----------------|------------------------------------------------------------|
//! | `protocol`     | Request decoding and `{type, status, payload}` envelopes   |
//! | `updates`      | Ordered per-operation update stream and bounded history    |
//! | `state`        | Per-session project state, admission, project locks        |
//! | `namespace`    | Namespace manager and the local directory backend          |
//! | `docker`       | Docker network namespace backend                           |
//! | `sandbox`      | Clone, checkout, command execution and launched services   |
//! | `executor`     | Test and deploy step sequences                             |
//! | `orchestrator` | `Session` routing and shared `Services`                    |
//! | `ws`           | Socket loop with ping/pong keepalive                       |
//! | `server`       | Router, health probe, startup and graceful shutdown        |

pub mod docker;
pub mod executor;
pub mod namespace;
pub mod orchestrator;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod state;
pub mod updates;
pub mod ws;

pub use orchestrator::{Services, Session};
pub use protocol::{Command, Envelope, OperationKind, ProjectType};
pub use server::{ServerConfig, build_router, build_services, start_server};
