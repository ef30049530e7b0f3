//! Error kinds shared by every kubemod operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ResourceId;

/// Failure reported by the cluster client seam.
///
/// Carries the upstream HTTP status and raw status payload when the API server
/// provided them, so they can be surfaced verbatim in the failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
    pub status: Option<u16>,
    pub body: Option<Json>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), status: None, body: None }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: Json) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{operation} is not supported for kind {kind}")]
    UnsupportedKind { kind: String, operation: &'static str },

    #[error("{id} has no {field} to scale")]
    CountUnavailable { id: ResourceId, field: &'static str },

    #[error("no revision {revision} found to roll back {id} to")]
    PreviousRevisionNotFound { id: ResourceId, revision: i64 },

    #[error("resource scaling timed out after {:.1}s", elapsed.as_secs_f64())]
    ScaleTimeout { id: ResourceId, last: Option<Json>, elapsed: Duration },

    #[error("timed out after {:.1}s waiting for {id}", elapsed.as_secs_f64())]
    WaitTimeout { id: ResourceId, last: Option<Json>, elapsed: Duration },

    #[error("failed to patch {id}: {source}")]
    PatchFailed {
        id: ResourceId,
        #[source]
        source: ClientError,
    },

    #[error("{0} not found")]
    NotFound(ResourceId),

    #[error("invalid resource definition: {0}")]
    InvalidDefinition(String),

    #[error("cluster request failed: {0}")]
    Client(#[from] ClientError),

    #[error("helm exited with rc={rc}: {stderr}")]
    HelmFailed { command: String, rc: i32, stdout: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure payload printed when an operation fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub failed: bool,
    pub msg: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl Error {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::UnsupportedKind { .. } => "UnsupportedKind",
            Error::CountUnavailable { .. } => "CountUnavailable",
            Error::PreviousRevisionNotFound { .. } => "PreviousRevisionNotFound",
            Error::ScaleTimeout { .. } => "ScaleTimeout",
            Error::WaitTimeout { .. } => "WaitTimeout",
            Error::PatchFailed { .. } => "PatchFailed",
            Error::NotFound(_) => "NotFound",
            Error::InvalidDefinition(_) => "InvalidDefinition",
            Error::Client(_) => "ClientError",
            Error::HelmFailed { .. } => "HelmFailed",
            Error::Io(_) => "Io",
            Error::Serde(_) => "Serde",
        }
    }

    pub fn to_failure(&self) -> Failure {
        let mut f = Failure {
            failed: true,
            msg: self.to_string(),
            error: self.kind_name().to_string(),
            status: None,
            body: None,
            result: None,
            duration: None,
            stdout: None,
            stderr: None,
        };
        match self {
            Error::PatchFailed { source, .. } | Error::Client(source) => {
                f.status = source.status;
                f.body = source.body.clone();
            }
            Error::ScaleTimeout { last, elapsed, .. } | Error::WaitTimeout { last, elapsed, .. } => {
                f.result = last.clone();
                f.duration = Some(elapsed.as_secs_f64());
            }
            Error::HelmFailed { command, stdout, stderr, .. } => {
                f.msg = format!("{} (command: {})", f.msg, command);
                f.stdout = Some(stdout.clone());
                f.stderr = Some(stderr.clone());
            }
            _ => {}
        }
        f
    }
}
