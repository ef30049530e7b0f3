//! Roll a Deployment or DaemonSet back to its previous revision.

use kubemod_core::{json_i64, json_str, Error, Report, ResourceId, Result};
use kubemod_kubehub::{match_labels_selector, ClusterClient, PatchBody};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

pub const DEPLOYMENT_REVISION: &str = "deployment.kubernetes.io/revision";
pub const DAEMONSET_GENERATION: &str = "deprecated.daemonset.template.generation";
const POD_TEMPLATE_HASH: &str = "pod-template-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    Deployment,
    DaemonSet,
}

impl RollbackKind {
    pub fn from_kind(kind: &str) -> Result<Self> {
        match kind {
            "Deployment" => Ok(RollbackKind::Deployment),
            "DaemonSet" => Ok(RollbackKind::DaemonSet),
            other => Err(Error::UnsupportedKind { kind: other.to_string(), operation: "rollback" }),
        }
    }

    /// Kind that records past revisions of this workload.
    pub fn history_kind(self) -> (&'static str, &'static str) {
        match self {
            RollbackKind::Deployment => ("apps/v1", "ReplicaSet"),
            RollbackKind::DaemonSet => ("apps/v1", "ControllerRevision"),
        }
    }

    pub fn current_revision(self, obj: &Json) -> Option<i64> {
        match self {
            RollbackKind::Deployment => annotation_i64(obj, DEPLOYMENT_REVISION),
            RollbackKind::DaemonSet => json_i64(obj, "/metadata/generation"),
        }
    }

    pub fn revision_of(self, history: &Json) -> Option<i64> {
        match self {
            RollbackKind::Deployment => annotation_i64(history, DEPLOYMENT_REVISION),
            RollbackKind::DaemonSet => annotation_i64(history, DAEMONSET_GENERATION),
        }
    }

    /// Patch that restores `previous` onto the workload.
    pub fn restore_patch(self, previous: &Json, revision: i64) -> Result<PatchBody> {
        match self {
            RollbackKind::Deployment => {
                let mut template = previous
                    .pointer("/spec/template")
                    .cloned()
                    .ok_or_else(|| Error::InvalidDefinition(format!("ReplicaSet {} has no spec.template", json_str(previous, "/metadata/name").unwrap_or("?"))))?;
                if let Some(labels) = template.pointer_mut("/metadata/labels").and_then(|l| l.as_object_mut()) {
                    labels.remove(POD_TEMPLATE_HASH);
                }
                Ok(PatchBody::Json(json!([
                    {"op": "replace", "path": "/spec/template", "value": template},
                    {"op": "replace", "path": "/metadata/annotations", "value": {DEPLOYMENT_REVISION: revision.to_string()}},
                ])))
            }
            RollbackKind::DaemonSet => {
                let data = previous
                    .get("data")
                    .cloned()
                    .ok_or_else(|| Error::InvalidDefinition(format!("ControllerRevision {} has no data", json_str(previous, "/metadata/name").unwrap_or("?"))))?;
                Ok(PatchBody::Strategic(data))
            }
        }
    }
}

fn annotation_i64(obj: &Json, key: &str) -> Option<i64> {
    obj.pointer("/metadata/annotations").and_then(|a| a.get(key)).and_then(|v| match v {
        Json::String(s) => s.parse().ok(),
        other => other.as_i64(),
    })
}

/// Whether `history` names the workload as its controlling owner. The uid is
/// compared when both sides carry one, otherwise kind and name.
fn owned_by(history: &Json, id: &ResourceId, uid: Option<&str>) -> bool {
    let Some(refs) = history.pointer("/metadata/ownerReferences").and_then(|r| r.as_array()) else { return false };
    refs.iter().any(|r| {
        let controller = r.get("controller").and_then(|c| c.as_bool()).unwrap_or(false);
        let same = match (uid, json_str(r, "/uid")) {
            (Some(a), Some(b)) => a == b,
            _ => json_str(r, "/kind") == Some(id.kind.as_str()) && json_str(r, "/name") == Some(id.name.as_str()),
        };
        controller && same
    })
}

/// Roll one workload back to revision `current - 1`.
///
/// Always reports `changed` when the previous revision exists; in check mode
/// the patch is skipped.
pub async fn rollback<C>(client: &C, id: &ResourceId, check_mode: bool) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    let kind = RollbackKind::from_kind(&id.kind)?;
    let obj = client.get(id).await?.ok_or_else(|| Error::NotFound(id.clone()))?;
    let current = kind
        .current_revision(&obj)
        .ok_or_else(|| Error::InvalidDefinition(format!("{} carries no revision", id)))?;
    let target = current - 1;

    // Without matchLabels the list would span every workload in the namespace.
    let Some(selector) = match_labels_selector(&obj) else {
        warn!(target_id = %id, "selector has no matchLabels; cannot list revisions");
        return Err(Error::PreviousRevisionNotFound { id: id.clone(), revision: target });
    };
    let (api_version, history_kind) = kind.history_kind();
    let history = client.list(api_version, history_kind, id.namespace.as_deref(), Some(selector.as_str())).await?;
    let uid = json_str(&obj, "/metadata/uid");
    debug!(target_id = %id, current, candidates = history.len(), "looking up previous revision");

    let Some(previous) = history.iter().filter(|h| owned_by(h, id, uid)).find(|h| kind.revision_of(h) == Some(target)) else {
        warn!(target_id = %id, revision = target, "previous revision not found");
        return Err(Error::PreviousRevisionNotFound { id: id.clone(), revision: target });
    };
    let patch = kind.restore_patch(previous, target)?;

    if check_mode {
        return Ok(Report::changed(None).with_msg(format!("would roll back to revision {}", target)));
    }
    let result = client.patch(id, &patch).await.map_err(|source| Error::PatchFailed { id: id.clone(), source })?;
    counter!("rollback_ok", 1u64);
    info!(target_id = %id, from = current, to = target, "rolled back");
    Ok(Report::changed(Some(result)).with_msg(format!("rolled back to revision {}", target)))
}

/// Roll back every workload of a kind matching `label_selector`.
///
/// Stops at the first failure. The report carries one result per workload.
pub async fn rollback_matching<C>(client: &C, api_version: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>, check_mode: bool) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    RollbackKind::from_kind(kind)?;
    let items = client.list(api_version, kind, namespace, label_selector).await?;
    let mut results = Vec::with_capacity(items.len());
    let mut changed = false;
    for item in &items {
        let id = ResourceId::new(
            api_version,
            kind,
            json_str(item, "/metadata/namespace"),
            json_str(item, "/metadata/name").unwrap_or_default(),
        );
        let report = rollback(client, &id, check_mode).await?;
        changed |= report.changed;
        results.push(serde_json::to_value(&report)?);
    }
    let mut report = if changed { Report::changed(Some(Json::Array(results))) } else { Report::unchanged(Some(Json::Array(results))) };
    if items.is_empty() {
        report = report.with_msg(format!("no {} matched", kind));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubemod_kubehub::mock::{Call, MockCluster};

    fn deploy_id() -> ResourceId {
        ResourceId::new("apps/v1", "Deployment", Some("ns"), "web")
    }

    fn deployment(revision: &str) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "ns", "labels": {"app": "web"}, "annotations": {DEPLOYMENT_REVISION: revision}},
            "spec": {"selector": {"matchLabels": {"app": "web"}}, "template": {"metadata": {"labels": {"app": "web"}}, "spec": {"containers": [{"name": "app", "image": "app:3"}]}}}
        })
    }

    fn owner(kind: &str, name: &str) -> Json {
        json!([{"apiVersion": "apps/v1", "kind": kind, "name": name, "controller": true}])
    }

    fn replica_set(name: &str, revision: &str, image: &str) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "ReplicaSet",
            "metadata": {"name": name, "namespace": "ns", "labels": {"app": "web", POD_TEMPLATE_HASH: name},
                         "annotations": {DEPLOYMENT_REVISION: revision}, "ownerReferences": owner("Deployment", "web")},
            "spec": {"template": {"metadata": {"labels": {"app": "web", POD_TEMPLATE_HASH: name}}, "spec": {"containers": [{"name": "app", "image": image}]}}}
        })
    }

    #[tokio::test]
    async fn deployment_restores_previous_template() {
        let m = MockCluster::new()
            .with_object(deployment("3"))
            .with_object(replica_set("web-a", "1", "app:1"))
            .with_object(replica_set("web-b", "2", "app:2"))
            .with_object(replica_set("web-c", "3", "app:3"));
        let r = rollback(&m, &deploy_id(), false).await.unwrap();
        assert!(r.changed);
        let live = m.object(&deploy_id()).unwrap();
        assert_eq!(live["spec"]["template"]["spec"]["containers"][0]["image"], "app:2");
        assert_eq!(live["spec"]["template"]["metadata"]["labels"], json!({"app": "web"}));
        assert_eq!(live["metadata"]["annotations"], json!({DEPLOYMENT_REVISION: "2"}));
        match m.mutations().as_slice() {
            [Call::Patch(_, PatchBody::Json(ops))] => assert_eq!(ops.as_array().map(Vec::len), Some(2)),
            other => panic!("unexpected calls: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_previous_revision_issues_no_patch() {
        let m = MockCluster::new().with_object(deployment("1")).with_object(replica_set("web-a", "1", "app:1"));
        let err = rollback(&m, &deploy_id(), false).await.unwrap_err();
        assert!(matches!(err, Error::PreviousRevisionNotFound { revision: 0, .. }));
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn selector_without_match_labels_is_refused() {
        let mut web = deployment("2");
        web["spec"]["selector"] = json!({"matchExpressions": [{"key": "app", "operator": "In", "values": ["web"]}]});
        let mut db = replica_set("db-1", "1", "postgres:16");
        db["metadata"]["ownerReferences"] = owner("Deployment", "db");
        let m = MockCluster::new().with_object(web).with_object(db);
        let err = rollback(&m, &deploy_id(), false).await.unwrap_err();
        assert!(matches!(err, Error::PreviousRevisionNotFound { revision: 1, .. }));
        assert!(m.mutations().is_empty());
        assert_eq!(m.object(&deploy_id()).unwrap()["spec"]["template"]["spec"]["containers"][0]["image"], "app:3");
    }

    #[tokio::test]
    async fn revisions_of_other_workloads_are_skipped() {
        let mut other = replica_set("db-1", "1", "postgres:16");
        other["metadata"]["ownerReferences"] = owner("Deployment", "db");
        let orphan = {
            let mut rs = replica_set("loose-1", "1", "busybox");
            rs["metadata"].as_object_mut().unwrap().remove("ownerReferences");
            rs
        };
        let m = MockCluster::new().with_object(deployment("2")).with_object(other).with_object(orphan);
        let err = rollback(&m, &deploy_id(), false).await.unwrap_err();
        assert!(matches!(err, Error::PreviousRevisionNotFound { .. }));
        assert!(m.mutations().is_empty());

        m.insert(replica_set("web-a", "1", "app:1"));
        rollback(&m, &deploy_id(), false).await.unwrap();
        assert_eq!(m.object(&deploy_id()).unwrap()["spec"]["template"]["spec"]["containers"][0]["image"], "app:1");
    }

    #[tokio::test]
    async fn owner_uid_wins_over_name() {
        let mut web = deployment("2");
        web["metadata"]["uid"] = json!("uid-new");
        let mut stale = replica_set("web-old", "1", "app:0");
        stale["metadata"]["ownerReferences"][0]["uid"] = json!("uid-old");
        let m = MockCluster::new().with_object(web).with_object(stale);
        assert!(rollback(&m, &deploy_id(), false).await.is_err());
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn daemonset_applies_revision_data() {
        let id = ResourceId::new("apps/v1", "DaemonSet", Some("ns"), "agent");
        let m = MockCluster::new()
            .with_object(json!({
                "apiVersion": "apps/v1", "kind": "DaemonSet",
                "metadata": {"name": "agent", "namespace": "ns", "generation": 4},
                "spec": {"selector": {"matchLabels": {"app": "agent"}}, "template": {"spec": {"containers": [{"name": "a", "image": "agent:4"}]}}}
            }))
            .with_object(json!({
                "apiVersion": "apps/v1", "kind": "ControllerRevision",
                "metadata": {"name": "agent-3", "namespace": "ns", "labels": {"app": "agent"}, "annotations": {DAEMONSET_GENERATION: "3"},
                             "ownerReferences": owner("DaemonSet", "agent")},
                "data": {"spec": {"template": {"spec": {"containers": [{"name": "a", "image": "agent:3"}]}}}}
            }));
        rollback(&m, &id, false).await.unwrap();
        assert!(matches!(m.mutations().as_slice(), [Call::Patch(_, PatchBody::Strategic(_))]));
        assert_eq!(m.object(&id).unwrap()["spec"]["template"]["spec"]["containers"][0]["image"], "agent:3");
    }

    #[tokio::test]
    async fn check_mode_is_changed_without_patch() {
        let m = MockCluster::new().with_object(deployment("2")).with_object(replica_set("web-a", "1", "app:1"));
        let r = rollback(&m, &deploy_id(), true).await.unwrap();
        assert!(r.changed);
        assert!(m.mutations().is_empty());
    }

    #[tokio::test]
    async fn other_kinds_are_rejected() {
        let m = MockCluster::new();
        let err = rollback(&m, &ResourceId::new("apps/v1", "StatefulSet", Some("ns"), "db"), false).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind { operation: "rollback", .. }));
        assert!(m.calls().is_empty());
    }

    #[tokio::test]
    async fn matching_rolls_back_each_workload() {
        let m = MockCluster::new().with_object(deployment("2")).with_object(replica_set("web-a", "1", "app:1"));
        let r = rollback_matching(&m, "apps/v1", "Deployment", Some("ns"), Some("app=web"), false).await.unwrap();
        assert!(r.changed);
        assert_eq!(r.result.unwrap().as_array().map(Vec::len), Some(1));
        let empty = rollback_matching(&m, "apps/v1", "Deployment", Some("ns"), Some("app=none"), false).await.unwrap();
        assert!(!empty.changed);
    }
}
