//! Content-addressed name suffixes for ConfigMaps and Secrets.
//!
//! Bit-for-bit compatible with the suffix kubectl/kustomize append to generated
//! ConfigMap/Secret names: SHA-256 over a canonical JSON encoding of the
//! identity-relevant fields, first 10 hex characters, with the characters
//! `0 1 3 a e` remapped so the suffix never reads as a word or number.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::resource::json_str;

const HASH_LEN: usize = 10;

/// A 10-character content hash, e.g. `867km9574f`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds that carry a content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    ConfigMap,
    Secret,
}

impl HashKind {
    pub fn from_kind(kind: &str) -> Result<Self> {
        match kind {
            "ConfigMap" => Ok(HashKind::ConfigMap),
            "Secret" => Ok(HashKind::Secret),
            other => Err(Error::UnsupportedKind { kind: other.to_string(), operation: "content hash" }),
        }
    }

    fn fields(self, name_key: &'static str) -> Vec<&'static str> {
        match self {
            HashKind::ConfigMap => vec!["data", "kind", name_key],
            HashKind::Secret => vec!["data", "kind", name_key, "type"],
        }
    }
}

/// Compute the content hash of a ConfigMap or Secret.
///
/// Only `data`, `kind`, the name and (for Secrets) `type` participate; labels,
/// annotations and every other field are ignored.
pub fn generate_hash(resource: &Json) -> Result<ContentHash> {
    let kind = json_str(resource, "/kind").unwrap_or_default();
    let hash_kind = HashKind::from_kind(kind)?;

    let name = json_str(resource, "/metadata/name").unwrap_or_default();
    let generate_name = json_str(resource, "/metadata/generateName").unwrap_or_default();
    let (name_key, name_val) = if name.is_empty() && !generate_name.is_empty() {
        ("generateName", generate_name)
    } else {
        ("name", name)
    };

    // Flatten the name next to data/kind/type so marshal sees one mapping.
    let mut flat = serde_json::Map::new();
    if let Some(obj) = resource.as_object() {
        for key in ["data", "kind", "type"] {
            if let Some(v) = obj.get(key) {
                flat.insert(key.to_string(), v.clone());
            }
        }
    }
    flat.insert(name_key.to_string(), Json::String(name_val.to_string()));

    let bytes = marshal(&Json::Object(flat), &hash_kind.fields(name_key));
    Ok(encode(&bytes))
}

/// Canonical compact JSON of `keys` taken from `data`, in the given order.
///
/// Missing keys encode as `""`. Nested mappings have their keys sorted, so the
/// output does not depend on the insertion order of the input.
pub fn marshal(data: &Json, keys: &[&str]) -> Vec<u8> {
    let mut out = String::from("{");
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, &mut out);
        out.push(':');
        match data.get(*key) {
            Some(v) => write_value(v, &mut out),
            None => out.push_str("\"\""),
        }
    }
    out.push('}');
    out.into_bytes()
}

fn encode(bytes: &[u8]) -> ContentHash {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let suffix = hex[..HASH_LEN]
        .chars()
        .map(|c| match c {
            '0' => 'g',
            '1' => 'h',
            '3' => 'k',
            'a' => 'm',
            'e' => 't',
            other => other,
        })
        .collect();
    ContentHash(suffix)
}

fn write_value(v: &Json, out: &mut String) {
    match v {
        Json::Null => out.push_str("null"),
        Json::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Json::Number(n) => out.push_str(&n.to_string()),
        Json::String(s) => write_string(s, out),
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(k, out);
                out.push(':');
                write_value(&map[k], out);
            }
            out.push('}');
        }
    }
}

// Same escaping as Go's encoding/json: UTF-8 stays raw; quote, backslash,
// control characters, `<`, `>`, `&`, U+2028 and U+2029 are escaped.
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || matches!(c, '<' | '>' | '&' | '\u{2028}' | '\u{2029}') => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
