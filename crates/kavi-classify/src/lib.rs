//! Failure classification for the kavi forge.
//!
//! `classify` is a pure function from a build log (plus an optional
//! verification summary) to a typed failure record: equal inputs always
//! yield equal classifications, which is what makes the retry engine's
//! behavior reviewable from fixtures alone. `evaluate_triggers` is the
//! companion pure function that decides whether the next attempt needs
//! a human in the loop.
//!
//! The sandbox appends marker lines to the captured worker output; the
//! marker constants live here so the writer and the parser cannot
//! drift apart.

use kavi_types::{EscalationTrigger, FailureKind, GateResults, TriggerSet};
use serde::{Deserialize, Serialize};

/// Marker the sandbox writes for each path the diff gate rejected.
pub const GATE_VIOLATION_MARKER: &str = "kavi: gate violation: ";
/// Marker the sandbox writes when the worker hit its wall-clock bound.
pub const TIMEOUT_MARKER: &str = "kavi: worker timed out after ";
/// Marker the sandbox writes with the worker's exit status.
pub const EXIT_MARKER: &str = "kavi: worker exited with status ";

/// How many trailing log lines to keep as the stderr tail fact.
const STDERR_TAIL_LINES: usize = 20;

/// Minimal view of a verification report, as the classifier needs it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifySummary {
    pub gates: Option<GateResults>,
    #[serde(default)]
    pub policy_violations: Vec<String>,
    #[serde(default)]
    pub invariant_violations: Vec<String>,
    #[serde(default)]
    pub failing_tests: Vec<String>,
}

/// Structured facts extracted from the failing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureFacts {
    /// Paths outside the allowlist (gate violations).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offending_paths: Vec<String>,
    /// Tail of the worker output (build errors).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    /// Policy or invariant violation descriptions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    /// Failing test identifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_tests: Vec<String>,
}

/// A classified failure: the kind plus its supporting facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub facts: FailureFacts,
}

fn marker_values<'a>(log: &'a str, marker: &str) -> Vec<&'a str> {
    log.lines()
        .filter_map(|line| line.strip_prefix(marker))
        .map(str::trim)
        .collect()
}

fn tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Classify a failed build or verification.
///
/// Precedence: gate violations and timeouts come straight from the
/// sandbox markers; among failed verification gates the security gates
/// (policy, invariants) win over lint, and lint over tests; a non-zero
/// worker exit with no better explanation is a build error; anything
/// else is unknown.
pub fn classify(build_log: &str, verify: Option<&VerifySummary>) -> FailureRecord {
    let offending = marker_values(build_log, GATE_VIOLATION_MARKER);
    if !offending.is_empty() {
        return FailureRecord {
            kind: FailureKind::GateViolation,
            facts: FailureFacts {
                offending_paths: offending.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        };
    }

    if !marker_values(build_log, TIMEOUT_MARKER).is_empty() {
        return FailureRecord {
            kind: FailureKind::Timeout,
            facts: FailureFacts::default(),
        };
    }

    if let Some(summary) = verify
        && let Some(gates) = summary.gates
        && !gates.all_ok()
    {
        if !gates.policy {
            return FailureRecord {
                kind: FailureKind::VerifyPolicy,
                facts: FailureFacts {
                    violations: summary.policy_violations.clone(),
                    ..Default::default()
                },
            };
        }
        if !gates.invariants {
            return FailureRecord {
                kind: FailureKind::VerifyInvariant,
                facts: FailureFacts {
                    violations: summary.invariant_violations.clone(),
                    ..Default::default()
                },
            };
        }
        if !gates.ruff || !gates.mypy {
            return FailureRecord {
                kind: FailureKind::VerifyLint,
                facts: FailureFacts::default(),
            };
        }
        return FailureRecord {
            kind: FailureKind::VerifyTest,
            facts: FailureFacts {
                failing_tests: summary.failing_tests.clone(),
                ..Default::default()
            },
        };
    }

    let exited_nonzero = marker_values(build_log, EXIT_MARKER)
        .last()
        .and_then(|s| s.parse::<i64>().ok())
        .is_some_and(|code| code != 0);
    if exited_nonzero {
        return FailureRecord {
            kind: FailureKind::BuildError,
            facts: FailureFacts {
                stderr_tail: Some(tail(build_log, STDERR_TAIL_LINES)),
                ..Default::default()
            },
        };
    }

    FailureRecord {
        kind: FailureKind::Unknown,
        facts: FailureFacts::default(),
    }
}

/// Everything trigger evaluation looks at. All borrowed; the function
/// owns nothing and touches nothing else.
#[derive(Debug, Clone)]
pub struct TriggerContext<'a> {
    pub kind: FailureKind,
    /// Trailing consecutive failed attempts, including this one.
    pub consecutive_failures: u32,
    /// Rendering of the originating proposal spec.
    pub spec_text: &'a str,
    /// The packet the failed attempt ran with.
    pub previous_packet: &'a str,
    /// The packet proposed for the next attempt; `None` when the
    /// advisory was unavailable or malformed.
    pub proposed_packet: Option<&'a str>,
    /// Escalating keywords for the permission-widening check.
    pub keywords: &'a [String],
    /// Line-delta ratio above which a proposed packet counts as large.
    pub large_diff_ratio: f64,
}

/// Fraction of lines that differ between two texts, relative to the
/// larger of the two. 0.0 for identical texts, 1.0 for disjoint ones.
pub fn line_delta_ratio(previous: &str, proposed: &str) -> f64 {
    let prev: Vec<&str> = previous.lines().collect();
    let prop: Vec<&str> = proposed.lines().collect();
    if prev.is_empty() && prop.is_empty() {
        return 0.0;
    }

    let mut remaining = prev.clone();
    let mut common = 0usize;
    for line in &prop {
        if let Some(pos) = remaining.iter().position(|l| l == line) {
            remaining.swap_remove(pos);
            common += 1;
        }
    }

    let changed = (prev.len() - common) + (prop.len() - common);
    changed as f64 / prev.len().max(prop.len()) as f64
}

fn contains_keyword(text: &str, keyword: &str) -> bool {
    text.to_lowercase().contains(&keyword.to_lowercase())
}

/// Evaluate the escalation triggers for a proposed next attempt. Any
/// non-empty result requires explicit human approval before another
/// build may open.
pub fn evaluate_triggers(ctx: &TriggerContext<'_>) -> TriggerSet {
    let mut triggers = TriggerSet::new();

    if ctx.consecutive_failures >= 3 {
        triggers.insert(EscalationTrigger::RepeatedFailure);
    }

    if matches!(ctx.kind, FailureKind::VerifyPolicy | FailureKind::VerifyInvariant) {
        triggers.insert(EscalationTrigger::SecurityClass);
    }

    if ctx.kind == FailureKind::Unknown || ctx.proposed_packet.is_none() {
        triggers.insert(EscalationTrigger::Ambiguous);
    }

    if let Some(proposed) = ctx.proposed_packet {
        let widened = ctx.keywords.iter().any(|kw| {
            contains_keyword(proposed, kw) && !contains_keyword(ctx.spec_text, kw)
        });
        if widened {
            triggers.insert(EscalationTrigger::PermissionWidening);
        }

        if line_delta_ratio(ctx.previous_packet, proposed) > ctx.large_diff_ratio {
            triggers.insert(EscalationTrigger::LargeDiff);
        }
    }

    triggers
}

/// The built-in escalating keyword set. Heuristic and deliberately
/// conservative; deployments override it in configuration.
pub fn default_keywords() -> Vec<String> {
    [
        "network", "http", "socket", "request", "money", "payment", "charge", "invoice",
        "message", "email", "sms", "secret", "token", "credential", "password",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
