//! kubemod ops: imperative workload operations.
//!
//! - [`scale`]: scale a workload and optionally wait for its replicas.
//! - [`rollback`]: restore the previous revision of a Deployment or DaemonSet.
//! - [`info`]: read objects, optionally waiting on a status condition.
//!
//! All operations go through a [`ClusterClient`](kubemod_kubehub::ClusterClient)
//! and return a [`Report`](kubemod_core::Report).

#![forbid(unsafe_code)]

pub mod info;
pub mod rollback;
pub mod scale;

pub use info::{info, InfoQuery, InfoWait};
pub use rollback::{rollback, rollback_matching, RollbackKind};
pub use scale::{resolve_target, scale, ScaleController, ScaleKind, ScaleOutcome, ScalePhase, ScaleRequest};

/// Split `group/version/Kind` (or `version/Kind` for the core group) into
/// `(apiVersion, kind)`.
pub fn parse_gvk_key(key: &str) -> Option<(String, String)> {
    let (api_version, kind) = key.rsplit_once('/')?;
    if api_version.is_empty() || kind.is_empty() || api_version.matches('/').count() > 1 {
        return None;
    }
    Some((api_version.to_string(), kind.to_string()))
}
