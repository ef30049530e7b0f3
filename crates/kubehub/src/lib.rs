//! kubemod kubehub: the cluster client seam and its kube-rs implementation.
//!
//! Every operation talks to the cluster through [`ClusterClient`], addressed by
//! [`ResourceId`]. [`KubeClient`] resolves kinds through discovery and issues
//! requests with `kube::Api<DynamicObject>`; [`mock::MockCluster`] records calls
//! in memory for tests.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use kubemod_core::{ClientError, ResourceId};
use serde_json::Value as Json;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub mod mock;

pub const CONTENT_TYPE_JSON_PATCH: &str = "application/json-patch+json";
pub const CONTENT_TYPE_MERGE_PATCH: &str = "application/merge-patch+json";
pub const CONTENT_TYPE_STRATEGIC_PATCH: &str = "application/strategic-merge-patch+json";

/// A patch body tagged with its content type.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    /// RFC 6902 operation list.
    Json(Json),
    Strategic(Json),
    Merge(Json),
}

impl PatchBody {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchBody::Json(_) => CONTENT_TYPE_JSON_PATCH,
            PatchBody::Strategic(_) => CONTENT_TYPE_STRATEGIC_PATCH,
            PatchBody::Merge(_) => CONTENT_TYPE_MERGE_PATCH,
        }
    }

    pub fn body(&self) -> &Json {
        match self {
            PatchBody::Json(b) | PatchBody::Strategic(b) | PatchBody::Merge(b) => b,
        }
    }
}

/// Operations the core needs from a Kubernetes API client.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Read one object; `Ok(None)` when it does not exist.
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ClientError>;

    /// List objects of a kind, optionally restricted to a namespace and a label selector.
    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Json>, ClientError>;

    async fn create(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError>;

    async fn replace(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError>;

    async fn patch(&self, id: &ResourceId, patch: &PatchBody) -> Result<Json, ClientError>;

    /// Patch the `scale` sub-resource.
    async fn patch_scale(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError>;

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError>;
}

/// Render `spec.selector.matchLabels` of a workload as a `k=v,k2=v2` selector.
pub fn match_labels_selector(obj: &Json) -> Option<String> {
    let sel: LabelSelector = serde_json::from_value(obj.pointer("/spec/selector")?.clone()).ok()?;
    let labels = sel.match_labels?;
    if labels.is_empty() {
        return None;
    }
    Some(labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(","))
}

/// REST path of an object, e.g. `/apis/apps/v1/namespaces/ns/deployments/web`.
pub fn rest_path(ar: &ApiResource, namespace: Option<&str>, name: &str) -> String {
    let base = if ar.group.is_empty() {
        format!("/api/{}", ar.version)
    } else {
        format!("/apis/{}/{}", ar.group, ar.version)
    };
    match namespace {
        Some(ns) => format!("{}/namespaces/{}/{}/{}", base, ns, ar.plural, name),
        None => format!("{}/{}/{}", base, ar.plural, name),
    }
}

pub fn client_error(e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) => {
            let body = serde_json::to_value(&ae).unwrap_or(Json::Null);
            ClientError::new(ae.message.clone()).with_status(ae.code).with_body(body)
        }
        other => ClientError::new(other.to_string()),
    }
}

/// [`ClusterClient`] backed by kube-rs, with a per-process discovery cache.
pub struct KubeClient {
    client: Client,
    resources: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Mutex::new(HashMap::new()) }
    }

    /// Connect using the ambient kubeconfig / in-cluster config.
    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await.map_err(client_error)?;
        Ok(Self::new(client))
    }

    async fn find_api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), ClientError> {
        let key = format!("{}/{}", api_version, kind);
        let mut cache = self.resources.lock().await;
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let gvk = GroupVersionKind { group, version, kind: kind.to_string() };
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(client_error)?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = %key, plural = %ar.plural, namespaced, "resolved api resource");
                    cache.insert(key, (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(ClientError::new(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)).with_status(404))
    }

    async fn api_for(&self, id: &ResourceId) -> Result<(Api<DynamicObject>, ApiResource, Option<String>), ClientError> {
        let (ar, namespaced) = self.find_api_resource(&id.api_version, &id.kind).await?;
        let (api, ns) = if namespaced {
            match id.namespace.as_deref() {
                Some(ns) => (Api::namespaced_with(self.client.clone(), ns, &ar), Some(ns.to_string())),
                None => (Api::default_namespaced_with(self.client.clone(), &ar), Some(self.client.default_namespace().to_string())),
            }
        } else {
            (Api::all_with(self.client.clone(), &ar), None)
        };
        Ok((api, ar, ns))
    }
}

fn to_json(obj: DynamicObject) -> Result<Json, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::new(format!("serializing object: {}", e)))
}

fn from_json(body: &Json) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(body.clone()).map_err(|e| ClientError::new(format!("converting body to DynamicObject: {}", e)))
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ClientError> {
        let (api, _, _) = self.api_for(id).await?;
        match api.get_opt(&id.name).await.map_err(client_error)? {
            Some(obj) => Ok(Some(to_json(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Json>, ClientError> {
        let (ar, namespaced) = self.find_api_resource(api_version, kind).await?;
        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(client_error)?;
        list.items.into_iter().map(to_json).collect()
    }

    async fn create(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        let (api, _, _) = self.api_for(id).await?;
        let obj = api.create(&PostParams::default(), &from_json(body)?).await.map_err(client_error)?;
        info!(target_id = %id, "created");
        to_json(obj)
    }

    async fn replace(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        let (api, _, _) = self.api_for(id).await?;
        let obj = api.replace(&id.name, &PostParams::default(), &from_json(body)?).await.map_err(client_error)?;
        to_json(obj)
    }

    async fn patch(&self, id: &ResourceId, patch: &PatchBody) -> Result<Json, ClientError> {
        let (api, ar, ns) = self.api_for(id).await?;
        let pp = PatchParams::default();
        let obj = match patch {
            PatchBody::Strategic(b) => api.patch(&id.name, &pp, &Patch::Strategic(b)).await.map_err(client_error)?,
            PatchBody::Merge(b) => api.patch(&id.name, &pp, &Patch::Merge(b)).await.map_err(client_error)?,
            PatchBody::Json(ops) => {
                // Raw PATCH keeps the RFC 6902 body verbatim.
                let path = rest_path(&ar, ns.as_deref(), &id.name);
                let req = http::Request::patch(path)
                    .header(http::header::CONTENT_TYPE, CONTENT_TYPE_JSON_PATCH)
                    .body(serde_json::to_vec(ops).map_err(|e| ClientError::new(e.to_string()))?)
                    .map_err(|e| ClientError::new(format!("building PATCH request: {}", e)))?;
                self.client.request::<DynamicObject>(req).await.map_err(client_error)?
            }
        };
        metrics::counter!("kube_patch_total", 1u64);
        to_json(obj)
    }

    async fn patch_scale(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        let (api, _, _) = self.api_for(id).await?;
        let scale = api.patch_scale(&id.name, &PatchParams::default(), &Patch::Merge(body)).await.map_err(client_error)?;
        serde_json::to_value(scale).map_err(|e| ClientError::new(e.to_string()))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError> {
        let (api, _, _) = self.api_for(id).await?;
        api.delete(&id.name, &DeleteParams::default()).await.map_err(client_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rest_path_for_grouped_and_core_kinds() {
        let deploy = ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("apps", "v1", "Deployment"), "deployments");
        assert_eq!(rest_path(&deploy, Some("ns"), "web"), "/apis/apps/v1/namespaces/ns/deployments/web");
        let node = ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("", "v1", "Node"), "nodes");
        assert_eq!(rest_path(&node, None, "n1"), "/api/v1/nodes/n1");
    }

    #[test]
    fn patch_content_types() {
        assert_eq!(PatchBody::Json(json!([])).content_type(), "application/json-patch+json");
        assert_eq!(PatchBody::Strategic(json!({})).content_type(), "application/strategic-merge-patch+json");
        assert_eq!(PatchBody::Merge(json!({})).content_type(), "application/merge-patch+json");
    }

    #[test]
    fn selector_from_match_labels() {
        let d = json!({"spec": {"selector": {"matchLabels": {"tier": "web", "app": "shop"}}}});
        assert_eq!(match_labels_selector(&d).as_deref(), Some("app=shop,tier=web"));
        assert_eq!(match_labels_selector(&json!({"spec": {}})), None);
    }
}
