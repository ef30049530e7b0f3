//! Scale-and-wait state machine.
//!
//! ```text
//! Start -> Fetched -> NoOp | PreconditionFailed | Applying
//! Applying -> Done | Waiting
//! Waiting -> Converged | TimedOut
//! ```
//!
//! Mutations only happen in `Applying`; check mode stops right before them.

use std::fmt;
use std::time::Duration;

use kubemod_core::{
    json_i64, json_str, poll_until, ClientError, Error, Report, ResourceDefinition, ResourceId, Result, DEFAULT_WAIT_TIMEOUT,
};
use kubemod_kubehub::{ClusterClient, PatchBody};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

/// How a kind exposes its replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleKind {
    /// `spec.parallelism`, patched on the object itself, never waited on.
    Job,
    /// `spec.replicas` through the `scale` sub-resource.
    Replicated,
}

impl ScaleKind {
    pub fn of(kind: &str) -> Self {
        match kind {
            "Job" => ScaleKind::Job,
            _ => ScaleKind::Replicated,
        }
    }

    pub fn count_field(self) -> &'static str {
        match self {
            ScaleKind::Job => "spec.parallelism",
            ScaleKind::Replicated => "spec.replicas",
        }
    }

    fn count_pointer(self) -> &'static str {
        match self {
            ScaleKind::Job => "/spec/parallelism",
            ScaleKind::Replicated => "/spec/replicas",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalePhase {
    Start,
    Fetched,
    NoOp,
    PreconditionFailed,
    Applying,
    Done,
    Waiting,
    Converged,
    TimedOut,
}

impl ScalePhase {
    pub fn can_transition_to(self, next: ScalePhase) -> bool {
        use ScalePhase::*;
        matches!(
            (self, next),
            (Start, Fetched)
                | (Fetched, NoOp)
                | (Fetched, PreconditionFailed)
                | (Fetched, Applying)
                | (Applying, Done)
                | (Applying, Waiting)
                | (Waiting, Converged)
                | (Waiting, TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScalePhase::NoOp | ScalePhase::PreconditionFailed | ScalePhase::Done | ScalePhase::Converged | ScalePhase::TimedOut)
    }
}

impl fmt::Display for ScalePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleRequest {
    pub target: ResourceId,
    pub replicas: i64,
    /// Only scale when the live count equals this.
    pub current_replicas: Option<i64>,
    /// Only scale when the live `metadata.resourceVersion` equals this.
    pub resource_version: Option<String>,
    pub wait: bool,
    pub wait_timeout: Duration,
    pub wait_sleep: Duration,
    pub check_mode: bool,
}

impl ScaleRequest {
    pub fn new(target: ResourceId, replicas: i64) -> Self {
        Self {
            target,
            replicas,
            current_replicas: None,
            resource_version: None,
            wait: true,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            wait_sleep: kubemod_core::wait_sleep(),
            check_mode: false,
        }
    }
}

/// Resolve the scale target from exactly one of: an inline definition, a
/// definition loaded from `src`, or explicit identity parameters.
///
/// An explicit namespace overrides the one in a definition.
pub fn resolve_target(definition: Option<ResourceDefinition>, src: Option<ResourceDefinition>, explicit: Option<ResourceId>, namespace: Option<&str>) -> Result<ResourceId> {
    let mut id = match (definition, src, explicit) {
        (Some(_), Some(_), _) => return Err(Error::InvalidDefinition("resource_definition and src are mutually exclusive".into())),
        (Some(d), None, _) | (None, Some(d), _) => d.id().clone(),
        (None, None, Some(id)) => id,
        (None, None, None) => return Err(Error::InvalidDefinition("kind and name are required without a definition".into())),
    };
    if let Some(ns) = namespace.filter(|s| !s.is_empty()) {
        id.namespace = Some(ns.to_string());
    }
    Ok(id)
}

/// Body sent to the `scale` sub-resource.
pub fn scale_body(id: &ResourceId, replicas: i64) -> Json {
    json!({
        "kind": id.kind,
        "metadata": {"name": id.name, "namespace": id.namespace},
        "spec": {"replicas": replicas},
    })
}

fn replicas_converged(obj: &Json, desired: i64) -> bool {
    let replicas = json_i64(obj, "/status/replicas").unwrap_or(0);
    let ready = json_i64(obj, "/status/readyReplicas").unwrap_or(0);
    replicas == desired && ready == desired
}

#[derive(Debug, Clone)]
pub struct ScaleOutcome {
    pub phase: ScalePhase,
    pub trace: Vec<ScalePhase>,
    pub report: Report,
}

pub struct ScaleController<'a, C: ClusterClient + ?Sized> {
    client: &'a C,
    trace: Vec<ScalePhase>,
}

impl<'a, C: ClusterClient + ?Sized> ScaleController<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client, trace: Vec::new() }
    }

    fn enter(&mut self, next: ScalePhase) {
        if let Some(prev) = self.trace.last() {
            debug_assert!(prev.can_transition_to(next), "invalid scale transition {} -> {}", prev, next);
            debug!(from = %prev, to = %next, "scale transition");
        }
        self.trace.push(next);
    }

    fn finish(self, report: Report) -> ScaleOutcome {
        let phase = self.trace.last().copied().unwrap_or(ScalePhase::Start);
        ScaleOutcome { phase, trace: self.trace, report }
    }

    pub async fn run(mut self, req: &ScaleRequest) -> Result<ScaleOutcome> {
        let client = self.client;
        let id = &req.target;
        counter!("scale_attempts", 1u64);
        info!(target_id = %id, replicas = req.replicas, wait = req.wait, check_mode = req.check_mode, "scale start");
        self.enter(ScalePhase::Start);

        let obj = client.get(id).await?.ok_or_else(|| Error::NotFound(id.clone()))?;
        self.enter(ScalePhase::Fetched);

        let kind = ScaleKind::of(&id.kind);
        let observed = json_i64(&obj, kind.count_pointer()).ok_or_else(|| Error::CountUnavailable { id: id.clone(), field: kind.count_field() })?;

        if let Some(expected_rv) = &req.resource_version {
            let live_rv = json_str(&obj, "/metadata/resourceVersion");
            if live_rv != Some(expected_rv.as_str()) {
                warn!(target_id = %id, expected = %expected_rv, live = ?live_rv, "resource_version precondition failed");
                self.enter(ScalePhase::PreconditionFailed);
                let msg = format!("resource_version {} does not match live {}", expected_rv, live_rv.unwrap_or("<none>"));
                return Ok(self.finish(Report::unchanged(Some(obj)).with_msg(msg)));
            }
        }
        if let Some(expected) = req.current_replicas {
            if expected != observed {
                warn!(target_id = %id, expected, observed, "current_replicas precondition failed");
                self.enter(ScalePhase::PreconditionFailed);
                let msg = format!("current replicas {} does not match expected {}", observed, expected);
                return Ok(self.finish(Report::unchanged(Some(obj)).with_msg(msg)));
            }
        }
        if observed == req.replicas {
            counter!("scale_noop", 1u64);
            self.enter(ScalePhase::NoOp);
            return Ok(self.finish(Report::unchanged(Some(obj))));
        }

        self.enter(ScalePhase::Applying);
        if req.check_mode {
            self.enter(ScalePhase::Done);
            let msg = format!("would scale from {} to {}", observed, req.replicas);
            return Ok(self.finish(Report::changed(Some(obj)).with_msg(msg)));
        }
        let applied = match kind {
            ScaleKind::Job => {
                let mut body = obj.clone();
                body["spec"]["parallelism"] = json!(req.replicas);
                client.patch(id, &PatchBody::Merge(body)).await
            }
            ScaleKind::Replicated => client.patch_scale(id, &scale_body(id, req.replicas)).await,
        };
        applied.map_err(|source| Error::PatchFailed { id: id.clone(), source })?;
        info!(target_id = %id, from = observed, to = req.replicas, "scaled");

        if !req.wait || kind == ScaleKind::Job {
            self.enter(ScalePhase::Done);
            let latest = client.get(id).await?;
            return Ok(self.finish(Report::changed(latest)));
        }

        self.enter(ScalePhase::Waiting);
        let desired = req.replicas;
        let outcome = poll_until(
            move || async move { client.get(id).await?.ok_or_else(|| ClientError::new(format!("{} not found", id)).with_status(404)) },
            |o: &Json| replicas_converged(o, desired),
            req.wait_sleep,
            req.wait_timeout,
        )
        .await;
        if outcome.success {
            self.enter(ScalePhase::Converged);
            Ok(self.finish(Report::changed(outcome.last).with_duration(outcome.elapsed)))
        } else {
            self.enter(ScalePhase::TimedOut);
            counter!("scale_timeout", 1u64);
            warn!(target_id = %id, elapsed_s = outcome.elapsed.as_secs_f64(), "scale wait timed out");
            Err(Error::ScaleTimeout { id: id.clone(), last: outcome.last, elapsed: outcome.elapsed })
        }
    }
}

/// Run one scale request to completion and return its report.
pub async fn scale<C>(client: &C, req: &ScaleRequest) -> Result<Report>
where
    C: ClusterClient + ?Sized,
{
    Ok(ScaleController::new(client).run(req).await?.report)
}
