//! Bounded fixed-interval polling.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of a wait: whether the predicate held, the last observed state and
/// how long the wait took.
#[derive(Debug, Clone)]
pub struct WaitOutcome<T> {
    pub success: bool,
    pub last: Option<T>,
    pub elapsed: Duration,
}

/// Poll `getter` every `interval` until `predicate` holds or `timeout` is spent.
///
/// Each round sleeps first, then reads. Read errors are logged and the read is
/// retried on the next round; the last successfully observed value is kept.
/// A timeout is not an error here: callers decide whether it is fatal.
pub async fn poll_until<T, E, G, Fut, P>(mut getter: G, mut predicate: P, interval: Duration, timeout: Duration) -> WaitOutcome<T>
where
    G: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: FnMut(&T) -> bool,
{
    let start = Instant::now();
    let mut last = None;
    let mut rounds = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        rounds += 1;
        match getter().await {
            Ok(v) => {
                if predicate(&v) {
                    debug!(rounds, elapsed_ms = %start.elapsed().as_millis(), "wait converged");
                    return WaitOutcome { success: true, last: Some(v), elapsed: start.elapsed() };
                }
                last = Some(v);
            }
            Err(e) => warn!(error = %e, rounds, "wait read failed; retrying"),
        }
        if start.elapsed() >= timeout {
            debug!(rounds, "wait timed out");
            return WaitOutcome { success: false, last, elapsed: start.elapsed() };
        }
    }
}

fn default_status() -> String {
    "True".to_string()
}

/// Match on an entry of `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionMatch {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ConditionMatch {
    pub fn new(type_: &str) -> Self {
        Self { type_: type_.to_string(), status: default_status(), reason: None }
    }

    pub fn matches(&self, obj: &Json) -> bool {
        let Some(conds) = obj.pointer("/status/conditions").and_then(|c| c.as_array()) else { return false };
        conds.iter().any(|c| {
            c.get("type").and_then(|v| v.as_str()) == Some(self.type_.as_str())
                && c.get("status").and_then(|v| v.as_str()) == Some(self.status.as_str())
                && match &self.reason {
                    Some(r) => c.get("reason").and_then(|v| v.as_str()) == Some(r.as_str()),
                    None => true,
                }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn converges_on_third_read() {
        let calls = &AtomicU32::new(0);
        let out = poll_until(
            move || async move { Ok::<_, String>(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |n| *n == 3,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .await;
        assert!(out.success);
        assert_eq!(out.last, Some(3));
        assert_eq!(out.elapsed, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_last_observed() {
        let out = poll_until(|| async { Ok::<_, String>(1) }, |n| *n == 2, Duration::from_secs(5), Duration::from_secs(12)).await;
        assert!(!out.success);
        assert_eq!(out.last, Some(1));
        assert!(out.elapsed >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_are_retried() {
        let calls = &AtomicU32::new(0);
        let out = poll_until(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 { Err("transient".to_string()) } else { Ok(n) }
            },
            |_| true,
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await;
        assert!(out.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn condition_match_checks_status_and_reason() {
        let obj = json!({"status": {"conditions": [
            {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
            {"type": "Progressing", "status": "False"}
        ]}});
        assert!(ConditionMatch::new("Available").matches(&obj));
        assert!(!ConditionMatch::new("Progressing").matches(&obj));
        let mut m = ConditionMatch::new("Available");
        m.reason = Some("Other".into());
        assert!(!m.matches(&obj));
        assert!(!ConditionMatch::new("Available").matches(&json!({})));
    }
}
