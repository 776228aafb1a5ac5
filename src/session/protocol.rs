//! Wire protocol: request decoding and response envelopes.
//!
//! Inbound frames are `{type, payload}` JSON objects; outbound frames are
//! `{type, status, payload}` envelopes built fresh per send.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::errors::ProtocolError;

use super::updates::UpdateEvent;

/// Known project profiles. Only FastAPI is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Fastapi,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fastapi => "fastapi",
        }
    }

    /// File whose presence triggers the dependency install step.
    pub fn dependency_manifest(&self) -> &'static str {
        match self {
            Self::Fastapi => "requirements.txt",
        }
    }

    pub fn install_command(&self) -> &'static str {
        match self {
            Self::Fastapi => "pip install -r requirements.txt",
        }
    }

    pub fn default_test_command(&self) -> &'static str {
        match self {
            Self::Fastapi => "pytest tests/",
        }
    }

    pub fn default_start_command(&self) -> &'static str {
        match self {
            Self::Fastapi => "uvicorn main:app --host 0.0.0.0 --port $PORT",
        }
    }
}

impl std::str::FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fastapi" => Ok(Self::Fastapi),
            _ => Err(format!("Unsupported projectType '{}'", s)),
        }
    }
}

/// The three operation kinds; also the prefix of outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Namespace,
    Test,
    Deploy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Test => "test",
            Self::Deploy => "deploy",
        }
    }

    pub fn update_type(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace_update",
            Self::Test => "test_update",
            Self::Deploy => "deploy_update",
        }
    }

    pub fn complete_type(&self) -> &'static str {
        match self {
            Self::Namespace => "namespace_complete",
            Self::Test => "test_complete",
            Self::Deploy => "deploy_complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSetup {
    pub project_id: String,
    pub project_type: ProjectType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub project_id: String,
    pub repo_url: String,
    pub commit_hash: String,
    pub project_type: ProjectType,
    pub test_command: String,
    pub start_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub project_id: String,
    pub repo_url: String,
    pub commit_hash: String,
    pub project_type: ProjectType,
    pub start_command: String,
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NamespaceSetup(NamespaceSetup),
    Test(TestRequest),
    Deploy(DeployRequest),
}

impl Command {
    pub fn project_id(&self) -> &str {
        match self {
            Self::NamespaceSetup(req) => &req.project_id,
            Self::Test(req) => &req.project_id,
            Self::Deploy(req) => &req.project_id,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::NamespaceSetup(_) => OperationKind::Namespace,
            Self::Test(_) => OperationKind::Test,
            Self::Deploy(_) => OperationKind::Deploy,
        }
    }
}

/// Raw request fields, before validation. Every field is optional so that
/// missing values surface as `invalid_message_format` instead of a serde error.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFields {
    project_id: Option<String>,
    project_type: Option<String>,
    #[serde(rename = "repoURL", alias = "repoUrl")]
    repo_url: Option<String>,
    commit_hash: Option<String>,
    test_command: Option<String>,
    start_command: Option<String>,
}

/// Decode one inbound text frame into a `Command`.
pub fn decode(raw: &str) -> Result<Command, ProtocolError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ProtocolError::InvalidFormat(format!("Message is not valid JSON: {}", e)))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::InvalidFormat(
            "Message must be a JSON object".to_string(),
        ));
    };

    let message_type = match object.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => {
            return Err(ProtocolError::InvalidFormat(
                "Field 'type' must be a string".to_string(),
            ));
        }
        None => {
            return Err(ProtocolError::InvalidFormat(
                "Missing field 'type'".to_string(),
            ));
        }
    };

    if !matches!(
        message_type.as_str(),
        "namespace_setup" | "test_request" | "deploy_request"
    ) {
        return Err(ProtocolError::UnknownType(message_type));
    }

    // Fields live in `payload`; clients that send them flat are accepted too.
    let fields_value = match object.remove("payload") {
        Some(Value::Object(payload)) => Value::Object(payload),
        Some(Value::Null) | None => {
            object.remove("type");
            Value::Object(object)
        }
        Some(_) => {
            return Err(ProtocolError::InvalidFormat(
                "Field 'payload' must be an object".to_string(),
            ));
        }
    };
    let fields: RawFields = serde_json::from_value(fields_value)
        .map_err(|e| ProtocolError::InvalidFormat(format!("Invalid payload: {}", e)))?;

    let project_id = required(fields.project_id, "projectId")?;
    let project_type = required(fields.project_type, "projectType")?
        .parse::<ProjectType>()
        .map_err(ProtocolError::InvalidFormat)?;

    match message_type.as_str() {
        "namespace_setup" => Ok(Command::NamespaceSetup(NamespaceSetup {
            project_id,
            project_type,
        })),
        "test_request" => Ok(Command::Test(TestRequest {
            project_id,
            repo_url: required(fields.repo_url, "repoURL")?,
            commit_hash: required(fields.commit_hash, "commitHash")?,
            project_type,
            test_command: optional(fields.test_command)
                .unwrap_or_else(|| project_type.default_test_command().to_string()),
            start_command: optional(fields.start_command),
        })),
        _ => Ok(Command::Deploy(DeployRequest {
            project_id,
            repo_url: required(fields.repo_url, "repoURL")?,
            commit_hash: required(fields.commit_hash, "commitHash")?,
            project_type,
            start_command: optional(fields.start_command)
                .unwrap_or_else(|| project_type.default_start_command().to_string()),
        })),
    }
}

fn required(value: Option<String>, name: &str) -> Result<String, ProtocolError> {
    optional(value)
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("Missing required field '{}'", name)))
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `status` of an outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Partial,
    Success,
    Error,
}

/// Outbound `{type, status, payload}` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub status: Status,
    pub payload: Value,
}

impl Envelope {
    /// `<kind>_update` carrying one update event.
    pub fn update(kind: OperationKind, project_id: &str, event: &UpdateEvent) -> Self {
        Self {
            message_type: kind.update_type().to_string(),
            status: Status::Partial,
            payload: json!({
                "projectId": project_id,
                "update_type": event.update_type,
                "update_data": { "data": event.data },
            }),
        }
    }

    /// Terminal `<kind>_complete`. `payload` must be an object; `projectId`
    /// is merged in.
    pub fn complete(kind: OperationKind, project_id: &str, status: Status, payload: Value) -> Self {
        let mut map = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("message".to_string(), other);
                map
            }
        };
        map.insert("projectId".to_string(), Value::String(project_id.to_string()));
        Self {
            message_type: kind.complete_type().to_string(),
            status,
            payload: Value::Object(map),
        }
    }

    /// Outer `error` frame.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            message_type: "error".to_string(),
            status: Status::Error,
            payload: json!({ "code": code, "message": message.into() }),
        }
    }

    pub fn from_protocol_error(err: &ProtocolError) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

/// Serialize an envelope for a text frame.
pub fn encode(envelope: &Envelope) -> String {
    // Envelope holds only strings and JSON values, which always serialize.
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize envelope");
        r#"{"type":"error","status":"error","payload":{"code":"internal_error","message":"serialization failed"}}"#
            .to_string()
    })
}
