//! Read objects, optionally waiting for them to exist and match a condition.

use std::time::Duration;

use kubemod_core::{poll_until, ClientError, ConditionMatch, Error, Report, ResourceId, Result, DEFAULT_WAIT_TIMEOUT};
use kubemod_kubehub::ClusterClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoQuery {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// When unset the query lists every match.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

impl InfoQuery {
    pub fn named(id: &ResourceId) -> Self {
        Self {
            api_version: id.api_version.clone(),
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: Some(id.name.clone()),
            label_selector: None,
        }
    }

    fn id(&self) -> Option<ResourceId> {
        self.name.as_deref().map(|n| ResourceId::new(&self.api_version, &self.kind, self.namespace.as_deref(), n))
    }
}

#[derive(Debug, Clone)]
pub struct InfoWait {
    pub condition: Option<ConditionMatch>,
    pub sleep: Duration,
    pub timeout: Duration,
}

impl Default for InfoWait {
    fn default() -> Self {
        Self { condition: None, sleep: kubemod_core::wait_sleep(), timeout: DEFAULT_WAIT_TIMEOUT }
    }
}

/// Fetch matching objects as `{"resources": [...]}`. Never reports a change.
///
/// A named object that does not exist yields an empty list. With `wait`, a
/// named query polls until the object exists and matches the condition.
pub async fn info<C>(client: &C, query: &InfoQuery, wait: Option<&InfoWait>) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    let resources = match (query.id(), wait) {
        (Some(id), Some(w)) => vec![wait_for(client, &id, w).await?],
        (Some(id), None) => client.get(&id).await?.into_iter().collect(),
        (None, _) => {
            client
                .list(&query.api_version, &query.kind, query.namespace.as_deref(), query.label_selector.as_deref())
                .await?
        }
    };
    debug!(kind = %query.kind, count = resources.len(), "info");
    Ok(Report::unchanged(Some(json!({ "resources": resources }))))
}

async fn wait_for<C>(client: &C, id: &ResourceId, wait: &InfoWait) -> Result<Json>
where
    C: ClusterClient + ?Sized,
{
    let condition = wait.condition.as_ref();
    let outcome = poll_until(
        move || async move { client.get(id).await?.ok_or_else(|| ClientError::new(format!("{} not found", id)).with_status(404)) },
        |o: &Json| condition.map(|c| c.matches(o)).unwrap_or(true),
        wait.sleep,
        wait.timeout,
    )
    .await;
    match (outcome.success, outcome.last) {
        (true, Some(obj)) => Ok(obj),
        (_, last) => {
            warn!(target_id = %id, elapsed_s = outcome.elapsed.as_secs_f64(), "info wait timed out");
            Err(Error::WaitTimeout { id: id.clone(), last, elapsed: outcome.elapsed })
        }
    }
}
