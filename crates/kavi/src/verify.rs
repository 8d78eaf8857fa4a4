//! The verification battery.
//!
//! Five gates — ruff, mypy, pytest, policy, invariants — each producing
//! a structured result. All five run regardless of which earlier gates
//! fail; `all_ok` is the conjunction. Tool gates go through the
//! injected `ToolRunner`; the policy and invariant gates read the
//! sources directly. A gate that cannot even run (unreadable source,
//! broken rules file) fails with the reason as its fact rather than
//! aborting the battery.

use std::fs;

use anyhow::{Context, Result};
use kavi_classify::VerifySummary;
use kavi_policy::RuleSet;
use kavi_types::{BuildAttempt, GateResults, SkillProposal};
use serde::{Deserialize, Serialize};

use crate::config::ForgeConfig;
use crate::invariants::{self, InvariantContext};
use crate::process::{CommandSpec, ToolRunner};

/// One gate's structured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub ok: bool,
    pub log: String,
    /// Gate-specific facts: violations for policy/invariants, failing
    /// test ids for pytest.
    #[serde(default)]
    pub facts: Vec<String>,
}

impl GateReport {
    fn passed(log: String) -> Self {
        Self {
            ok: true,
            log,
            facts: Vec::new(),
        }
    }

    fn failed(log: String, facts: Vec<String>) -> Self {
        Self {
            ok: false,
            log,
            facts,
        }
    }
}

/// The full battery output, serialized as the verification report
/// artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub ruff: GateReport,
    pub mypy: GateReport,
    pub pytest: GateReport,
    pub policy: GateReport,
    pub invariants: GateReport,
}

impl VerificationReport {
    pub fn gates(&self) -> GateResults {
        GateResults {
            ruff: self.ruff.ok,
            mypy: self.mypy.ok,
            pytest: self.pytest.ok,
            policy: self.policy.ok,
            invariants: self.invariants.ok,
        }
    }

    pub fn all_ok(&self) -> bool {
        self.gates().all_ok()
    }

    /// The classifier's view of this report.
    pub fn summary(&self) -> VerifySummary {
        VerifySummary {
            gates: Some(self.gates()),
            policy_violations: self.policy.facts.clone(),
            invariant_violations: self.invariants.facts.clone(),
            failing_tests: self.pytest.facts.clone(),
        }
    }
}

fn tool_gate(
    config: &ForgeConfig,
    runner: &dyn ToolRunner,
    program: &str,
    args: Vec<String>,
) -> Result<(bool, String)> {
    let out = runner.run(&CommandSpec {
        program: program.to_string(),
        args,
        cwd: config.project_root().to_path_buf(),
        stdin: None,
        timeout: Some(config.tools.timeout),
    })?;
    Ok((out.ok(), out.combined()))
}

/// Failing test ids from pytest output (`FAILED path::test - reason`).
fn failing_tests(log: &str) -> Vec<String> {
    log.lines()
        .filter_map(|line| line.trim().strip_prefix("FAILED "))
        .map(|rest| rest.split_whitespace().next().unwrap_or(rest).to_string())
        .collect()
}

/// Run all five gates for a completed build.
pub fn run_battery(
    config: &ForgeConfig,
    runner: &dyn ToolRunner,
    proposal: &SkillProposal,
    build: &BuildAttempt,
) -> Result<VerificationReport> {
    let conv = config.path_convention();
    let name = proposal.spec.name.as_str();
    let skill_rel = conv.skill_path(name);
    let test_rel = conv.test_path(name);
    let allowlist = conv.allowlist(name);

    let (ruff_ok, ruff_log) = tool_gate(
        config,
        runner,
        &config.tools.ruff,
        vec!["check".to_string(), skill_rel.clone(), test_rel.clone()],
    )?;
    let ruff = if ruff_ok {
        GateReport::passed(ruff_log)
    } else {
        GateReport::failed(ruff_log, Vec::new())
    };

    let (mypy_ok, mypy_log) = tool_gate(config, runner, &config.tools.mypy, vec![".".to_string()])?;
    let mypy = if mypy_ok {
        GateReport::passed(mypy_log)
    } else {
        GateReport::failed(mypy_log, Vec::new())
    };

    let (pytest_ok, pytest_log) = tool_gate(
        config,
        runner,
        &config.tools.pytest,
        vec![test_rel.clone(), "-q".to_string()],
    )?;
    let pytest = if pytest_ok {
        GateReport::passed(pytest_log)
    } else {
        let failed = failing_tests(&pytest_log);
        GateReport::failed(pytest_log, failed)
    };

    let skill_abs = conv.skill_path_under(config.project_root(), name);
    let source = fs::read_to_string(&skill_abs);

    let policy = match &source {
        Err(e) => GateReport::failed(
            format!("cannot read {}: {e}", skill_abs.display()),
            vec![format!("skill source unreadable: {}", skill_rel)],
        ),
        Ok(source) => {
            let rules = match &config.tools.policy_rules {
                Some(path) => RuleSet::load(path),
                None => Ok(RuleSet::builtin()),
            };
            match rules {
                Err(e) => GateReport::failed(
                    format!("policy rules unavailable: {e}"),
                    vec![format!("policy rules unavailable: {e}")],
                ),
                Ok(rules) => {
                    let violations = rules.scan(source);
                    let facts: Vec<String> =
                        violations.iter().map(|v| v.describe()).collect();
                    if facts.is_empty() {
                        GateReport::passed("policy scan clean".to_string())
                    } else {
                        GateReport::failed(facts.join("\n"), facts)
                    }
                }
            }
        }
    };

    let invariants = match &source {
        Err(e) => GateReport::failed(
            format!("cannot read {}: {e}", skill_abs.display()),
            vec![format!("skill source unreadable: {}", skill_rel)],
        ),
        Ok(source) => {
            let mut runtime_sources = Vec::new();
            for path in &build.changed_files {
                if allowlist.is_optional(path) {
                    let abs = config.project_root().join(path);
                    let contents = fs::read_to_string(&abs).with_context(|| {
                        format!("failed to read runtime module {}", abs.display())
                    })?;
                    runtime_sources.push((path.clone(), contents));
                }
            }
            let violations = invariants::check(&InvariantContext {
                source,
                proposal_name: name,
                side_effect_class: proposal.spec.side_effect_class,
                changed_files: &build.changed_files,
                allowlist: &allowlist,
                runtime_sources: &runtime_sources,
            });
            if violations.is_empty() {
                GateReport::passed("invariants hold".to_string())
            } else {
                GateReport::failed(violations.join("\n"), violations)
            }
        }
    };

    Ok(VerificationReport {
        ruff,
        mypy,
        pytest,
        policy,
        invariants,
    })
}
