//! kubemod core types: resource identity, content hashing, wait polling and
//! the report/error shapes every operation returns.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod error;
pub mod hash;
pub mod resource;
pub mod wait;

pub use error::{ClientError, Error, Failure, Result};
pub use hash::{generate_hash, marshal, ContentHash, HashKind};
pub use resource::{json_i64, json_str, ResourceDefinition, ResourceId};
pub use wait::{poll_until, ConditionMatch, WaitOutcome};

/// One field-level change: JSON-pointer path, previous and new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub path: String,
    pub old: Option<Json>,
    pub new: Option<Json>,
}

/// Outcome of a successful operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Json>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<FieldChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl Report {
    pub fn unchanged(result: Option<Json>) -> Self {
        Self { changed: false, result, ..Default::default() }
    }

    pub fn changed(result: Option<Json>) -> Self {
        Self { changed: true, result, ..Default::default() }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    pub fn with_duration(mut self, d: Duration) -> Self {
        self.duration = Some(d.as_secs_f64());
        self
    }
}

/// Default interval between wait polls (`KUBEMOD_WAIT_SLEEP_SECS`, default 5s).
pub fn wait_sleep() -> Duration {
    let secs = std::env::var("KUBEMOD_WAIT_SLEEP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(5);
    Duration::from_secs(secs)
}

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(20);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_omits_empty_fields() {
        let r = Report::unchanged(None).with_msg("no-op");
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, serde_json::json!({"changed": false, "msg": "no-op"}));
    }
}
