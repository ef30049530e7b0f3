use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};

/// Identity of a cluster object: `(apiVersion, kind, namespace, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()),
            name: name.to_string(),
        }
    }

    /// Split `apiVersion` into `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A validated resource mapping. Required keys are checked once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    raw: Json,
    id: ResourceId,
}

impl ResourceDefinition {
    pub fn from_json(raw: Json) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::InvalidDefinition("definition must be a mapping".into()));
        }
        let api_version = json_str(&raw, "/apiVersion").ok_or_else(|| Error::InvalidDefinition("missing apiVersion".into()))?;
        let kind = json_str(&raw, "/kind").ok_or_else(|| Error::InvalidDefinition("missing kind".into()))?;
        let name = json_str(&raw, "/metadata/name")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidDefinition("missing metadata.name".into()))?;
        let ns = json_str(&raw, "/metadata/namespace");
        let id = ResourceId::new(api_version, kind, ns, name);
        Ok(Self { raw, id })
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn as_json(&self) -> &Json {
        &self.raw
    }

    pub fn into_json(self) -> Json {
        self.raw
    }

    /// Force `metadata.namespace`, e.g. from a `--namespace` override.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        set_metadata_str(&mut self.raw, "namespace", namespace);
        self.id.namespace = Some(namespace.to_string()).filter(|s| !s.is_empty());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        set_metadata_str(&mut self.raw, "name", name);
        self.id.name = name.to_string();
        self
    }
}

fn set_metadata_str(raw: &mut Json, key: &str, value: &str) {
    if let Some(obj) = raw.as_object_mut() {
        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert(key.to_string(), Json::String(value.to_string()));
        }
    }
}

/// String at a JSON pointer, if present.
pub fn json_str<'a>(v: &'a Json, pointer: &str) -> Option<&'a str> {
    v.pointer(pointer).and_then(|x| x.as_str())
}

/// Integer at a JSON pointer. Accepts numeric strings, as used by annotations.
pub fn json_i64(v: &Json, pointer: &str) -> Option<i64> {
    match v.pointer(pointer)? {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
