//! Progress monitor: repetition and stagnation detection over a task lineage.
//!
//! The monitor is stateless. It inspects the tail of the merged progress trace
//! of a task and its ancestors (see `TaskStore::lineage_trace`) and reports
//! [`StuckDetected`] when the last `window` entries show no movement.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::{Action, OutcomeKind, TraceEntry};

const SIGNATURE_MAX_CHARS: usize = 100;
const OSCILLATION_SPAN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    /// Same action fingerprint with the same outcome kind, `window` times.
    RepeatedAction,
    /// `window` error outcomes with one error signature.
    RepeatedError,
    /// A-B-A-B alternation over the last four actions.
    Oscillation,
    /// Reflection reported no progress for `window` consecutive cycles.
    NoProgress,
}

impl StuckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StuckKind::RepeatedAction => "repeated_action",
            StuckKind::RepeatedError => "repeated_error",
            StuckKind::Oscillation => "oscillation",
            StuckKind::NoProgress => "no_progress",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckDetected {
    pub kind: StuckKind,
    pub window: usize,
    /// Human-readable description, reused in recovery tasks and questions.
    pub detail: String,
}

impl StuckDetected {
    pub fn no_progress(streak: u32) -> Self {
        Self {
            kind: StuckKind::NoProgress,
            window: streak as usize,
            detail: format!("reflection reported no progress for {streak} consecutive cycles"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMonitor {
    window: usize,
}

impl ProgressMonitor {
    /// `window` is clamped to at least 2; a single entry cannot repeat.
    pub fn new(window: u32) -> Self {
        Self {
            window: (window as usize).max(2),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn check(&self, trace: &[TraceEntry]) -> Option<StuckDetected> {
        if let Some(tail) = trace.len().checked_sub(self.window).map(|start| &trace[start..]) {
            if let Some(stuck) = self.repeated_action(tail) {
                return Some(stuck);
            }
            if let Some(stuck) = self.repeated_error(tail) {
                return Some(stuck);
            }
        }
        oscillation(trace)
    }

    fn repeated_action(&self, tail: &[TraceEntry]) -> Option<StuckDetected> {
        let first = &tail[0];
        let same = tail.iter().all(|entry| {
            entry.action_fingerprint == first.action_fingerprint
                && entry.outcome_kind == first.outcome_kind
        });
        same.then(|| StuckDetected {
            kind: StuckKind::RepeatedAction,
            window: self.window,
            detail: format!(
                "action {} repeated {} times with outcome {}",
                first.action_fingerprint,
                self.window,
                first.outcome_kind.as_str()
            ),
        })
    }

    fn repeated_error(&self, tail: &[TraceEntry]) -> Option<StuckDetected> {
        let signature = tail[0].error_signature.as_deref()?;
        let same = tail.iter().all(|entry| {
            entry.outcome_kind == OutcomeKind::Error
                && entry.error_signature.as_deref() == Some(signature)
        });
        same.then(|| StuckDetected {
            kind: StuckKind::RepeatedError,
            window: self.window,
            detail: format!("same error {} times: {signature}", self.window),
        })
    }
}

fn oscillation(trace: &[TraceEntry]) -> Option<StuckDetected> {
    let start = trace.len().checked_sub(OSCILLATION_SPAN)?;
    let fps: Vec<&str> = trace[start..]
        .iter()
        .map(|entry| entry.action_fingerprint.as_str())
        .collect();
    let alternating = fps[0] != fps[1] && fps[0] == fps[2] && fps[1] == fps[3];
    alternating.then(|| StuckDetected {
        kind: StuckKind::Oscillation,
        window: OSCILLATION_SPAN,
        detail: format!("alternating between actions {} and {}", fps[0], fps[1]),
    })
}

/// Short content hash of the canonical JSON form of an action.
///
/// Object keys are sorted first, so equal actions hash equally regardless of
/// argument order.
pub fn action_fingerprint(action: &Action) -> String {
    let canonical = serde_json::to_value(action)
        .map(|value| {
            let mut out = String::new();
            write_canonical(&value, &mut out);
            out
        })
        .unwrap_or_else(|_| format!("{action:?}"));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Normalize error text so the same failure matches across runs.
pub fn error_signature(detail: &str) -> String {
    static PATH_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"(^|[\s'"(\[=])/[^\s'"()\[\]:,]+"#).unwrap());
    static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
    static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

    let lowered = detail.trim().to_lowercase();
    let no_paths = PATH_RE.replace_all(&lowered, "${1}/PATH");
    let no_digits = DIGITS_RE.replace_all(&no_paths, "N");
    let collapsed = SPACE_RE.replace_all(&no_digits, " ");
    collapsed.chars().take(SIGNATURE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(cycle: u64, fp: &str, kind: OutcomeKind, sig: Option<&str>) -> TraceEntry {
        TraceEntry {
            cycle,
            action_fingerprint: fp.to_string(),
            outcome_kind: kind,
            error_signature: sig.map(str::to_string),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn three_identical_failures_are_stuck_on_the_third() {
        let monitor = ProgressMonitor::new(3);
        let mut trace = Vec::new();
        for cycle in 1..=3 {
            trace.push(entry(cycle, "abc", OutcomeKind::Error, Some("boom")));
            let stuck = monitor.check(&trace);
            if cycle < 3 {
                assert!(stuck.is_none(), "cycle {cycle}");
            } else {
                assert_eq!(stuck.expect("stuck").kind, StuckKind::RepeatedAction);
            }
        }
    }

    #[test]
    fn outcome_change_breaks_repetition() {
        let monitor = ProgressMonitor::new(3);
        let trace = vec![
            entry(1, "abc", OutcomeKind::Error, Some("boom")),
            entry(2, "abc", OutcomeKind::Success, None),
            entry(3, "abc", OutcomeKind::Success, None),
        ];
        assert!(monitor.check(&trace).is_none());
    }

    #[test]
    fn different_actions_with_same_error_are_stuck() {
        let monitor = ProgressMonitor::new(3);
        let trace = vec![
            entry(1, "a", OutcomeKind::Error, Some("permission denied")),
            entry(2, "b", OutcomeKind::Error, Some("permission denied")),
            entry(3, "c", OutcomeKind::Error, Some("permission denied")),
        ];
        assert_eq!(monitor.check(&trace).expect("stuck").kind, StuckKind::RepeatedError);
    }

    #[test]
    fn alternating_actions_are_oscillation() {
        let monitor = ProgressMonitor::new(3);
        let trace = vec![
            entry(1, "a", OutcomeKind::Success, None),
            entry(2, "b", OutcomeKind::Success, None),
            entry(3, "a", OutcomeKind::Success, None),
            entry(4, "b", OutcomeKind::Success, None),
        ];
        assert_eq!(monitor.check(&trace).expect("stuck").kind, StuckKind::Oscillation);
    }

    #[test]
    fn varied_successes_are_progress() {
        let monitor = ProgressMonitor::new(3);
        let trace = vec![
            entry(1, "a", OutcomeKind::Success, None),
            entry(2, "b", OutcomeKind::Success, None),
            entry(3, "c", OutcomeKind::Success, None),
            entry(4, "d", OutcomeKind::Success, None),
        ];
        assert!(monitor.check(&trace).is_none());
    }

    #[test]
    fn fingerprint_ignores_argument_order() {
        let a: Action = serde_json::from_str(
            r#"{"kind":"tool_call","tool":"shell","args":{"command":"ls","cwd":"/tmp"}}"#,
        )
        .expect("parse");
        let b: Action = serde_json::from_str(
            r#"{"kind":"tool_call","tool":"shell","args":{"cwd":"/tmp","command":"ls"}}"#,
        )
        .expect("parse");
        assert_eq!(action_fingerprint(&a), action_fingerprint(&b));
        assert_eq!(action_fingerprint(&a).len(), 16);

        let c = Action::Reason {
            note: "ls".to_string(),
        };
        assert_ne!(action_fingerprint(&a), action_fingerprint(&c));
    }

    #[test]
    fn error_signature_masks_paths_and_numbers() {
        let a = error_signature("Error at /home/me/src/lib.rs line 42: File Not Found");
        let b = error_signature("error at /tmp/other.rs line 7:   file not found");
        assert_eq!(a, "error at /PATH line N: file not found");
        assert_eq!(a, b);
        assert_eq!(error_signature(&"x".repeat(500)).chars().count(), 100);
    }
}
