//! In-memory [`ClusterClient`] that records every call. Used by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kubemod_core::{json_str, ClientError, ResourceId};
use serde_json::Value as Json;

use crate::{ClusterClient, PatchBody};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ResourceId),
    List { api_version: String, kind: String, namespace: Option<String>, label_selector: Option<String> },
    Create(ResourceId, Json),
    Replace(ResourceId, Json),
    Patch(ResourceId, PatchBody),
    PatchScale(ResourceId, Json),
    Delete(ResourceId),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Call::Get(_) | Call::List { .. })
    }
}

/// How the fake cluster reacts to a scale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScaleBehavior {
    /// Set `spec.replicas` and report all replicas ready right away.
    #[default]
    Converge,
    /// Set `spec.replicas` only; `status` never catches up.
    Stall,
}

#[derive(Default)]
pub struct MockCluster {
    objects: Mutex<HashMap<ResourceId, Json>>,
    calls: Mutex<Vec<Call>>,
    mutation_error: Mutex<Option<ClientError>>,
    scale_behavior: Mutex<ScaleBehavior>,
    strategic_unsupported: Mutex<bool>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn id_of(obj: &Json) -> ResourceId {
    ResourceId::new(
        json_str(obj, "/apiVersion").unwrap_or_default(),
        json_str(obj, "/kind").unwrap_or_default(),
        json_str(obj, "/metadata/namespace"),
        json_str(obj, "/metadata/name").unwrap_or_default(),
    )
}

fn labels_match(obj: &Json, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|pair| match pair.split_once('=') {
        Some((k, v)) => obj.pointer("/metadata/labels").and_then(|l| l.get(k)).and_then(|x| x.as_str()) == Some(v),
        None => false,
    })
}

/// RFC 7386 merge patch.
fn merge_patch(target: &mut Json, patch: &Json) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(t), Some(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn json_patch(target: &mut Json, ops: &Json) -> Result<(), ClientError> {
    for op in ops.as_array().into_iter().flatten() {
        let kind = op.get("op").and_then(|v| v.as_str()).unwrap_or_default();
        let path = op.get("path").and_then(|v| v.as_str()).unwrap_or_default();
        let value = op.get("value").cloned().unwrap_or(Json::Null);
        match kind {
            "replace" | "add" => match target.pointer_mut(path) {
                Some(slot) => *slot = value,
                None => {
                    let (parent, leaf) = path.rsplit_once('/').unwrap_or(("", path));
                    match target.pointer_mut(parent).and_then(|p| p.as_object_mut()) {
                        Some(obj) => {
                            obj.insert(leaf.to_string(), value);
                        }
                        None => return Err(ClientError::new(format!("path {} not found", path)).with_status(422)),
                    }
                }
            },
            other => return Err(ClientError::new(format!("unsupported op {}", other)).with_status(422)),
        }
    }
    Ok(())
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, obj: Json) -> Self {
        self.insert(obj);
        self
    }

    pub fn with_scale_behavior(self, b: ScaleBehavior) -> Self {
        *lock(&self.scale_behavior) = b;
        self
    }

    /// Answer strategic-merge patches with 415, as the API server does for
    /// custom resources.
    pub fn without_strategic_merge(self) -> Self {
        *lock(&self.strategic_unsupported) = true;
        self
    }

    pub fn insert(&self, obj: Json) {
        lock(&self.objects).insert(id_of(&obj), obj);
    }

    pub fn object(&self, id: &ResourceId) -> Option<Json> {
        lock(&self.objects).get(id).cloned()
    }

    /// Make every subsequent mutating call fail with `err`.
    pub fn fail_mutations_with(&self, err: ClientError) {
        *lock(&self.mutation_error) = Some(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    fn record(&self, call: Call) -> Result<(), ClientError> {
        let mutation = call.is_mutation();
        lock(&self.calls).push(call);
        match (mutation, lock(&self.mutation_error).clone()) {
            (true, Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn existing(&self, id: &ResourceId) -> Result<Json, ClientError> {
        self.object(id).ok_or_else(|| ClientError::new(format!("{} not found", id)).with_status(404))
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<Json>, ClientError> {
        self.record(Call::Get(id.clone()))?;
        Ok(self.object(id))
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Json>, ClientError> {
        self.record(Call::List {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            label_selector: label_selector.map(str::to_string),
        })?;
        let mut items: Vec<Json> = lock(&self.objects)
            .iter()
            .filter(|(id, _)| id.api_version == api_version && id.kind == kind)
            .filter(|(id, _)| namespace.is_none() || id.namespace.as_deref() == namespace)
            .filter(|(_, obj)| label_selector.map(|s| labels_match(obj, s)).unwrap_or(true))
            .map(|(_, obj)| obj.clone())
            .collect();
        items.sort_by(|a, b| json_str(a, "/metadata/name").cmp(&json_str(b, "/metadata/name")));
        Ok(items)
    }

    async fn create(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        self.record(Call::Create(id.clone(), body.clone()))?;
        if self.object(id).is_some() {
            return Err(ClientError::new(format!("{} already exists", id)).with_status(409));
        }
        let mut obj = body.clone();
        merge_patch(&mut obj, &serde_json::json!({"metadata": {"resourceVersion": "1"}}));
        lock(&self.objects).insert(id.clone(), obj.clone());
        Ok(obj)
    }

    async fn replace(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        self.record(Call::Replace(id.clone(), body.clone()))?;
        self.existing(id)?;
        lock(&self.objects).insert(id.clone(), body.clone());
        Ok(body.clone())
    }

    async fn patch(&self, id: &ResourceId, patch: &PatchBody) -> Result<Json, ClientError> {
        self.record(Call::Patch(id.clone(), patch.clone()))?;
        if matches!(patch, PatchBody::Strategic(_)) && *lock(&self.strategic_unsupported) {
            return Err(ClientError::new("the body of the request was in an unknown format").with_status(415));
        }
        let mut obj = self.existing(id)?;
        match patch {
            PatchBody::Json(ops) => json_patch(&mut obj, ops)?,
            PatchBody::Strategic(b) | PatchBody::Merge(b) => merge_patch(&mut obj, b),
        }
        lock(&self.objects).insert(id.clone(), obj.clone());
        Ok(obj)
    }

    async fn patch_scale(&self, id: &ResourceId, body: &Json) -> Result<Json, ClientError> {
        self.record(Call::PatchScale(id.clone(), body.clone()))?;
        let mut obj = self.existing(id)?;
        let replicas = body.pointer("/spec/replicas").cloned().unwrap_or(Json::Null);
        merge_patch(&mut obj, &serde_json::json!({"spec": {"replicas": replicas}}));
        if *lock(&self.scale_behavior) == ScaleBehavior::Converge {
            merge_patch(&mut obj, &serde_json::json!({"status": {"replicas": replicas, "readyReplicas": replicas}}));
        }
        lock(&self.objects).insert(id.clone(), obj);
        Ok(serde_json::json!({"kind": "Scale", "spec": {"replicas": replicas}}))
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClientError> {
        self.record(Call::Delete(id.clone()))?;
        self.existing(id)?;
        lock(&self.objects).remove(id);
        Ok(())
    }
}
