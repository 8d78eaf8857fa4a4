//! Core forge operations: propose, build, verify, promote, retry, run.
//!
//! `Forge` is the single context value owning the configuration, the
//! ledger handle, and the blob store — passed explicitly, never an
//! ambient singleton. Operations are synchronous; a caller may
//! parallelise over distinct proposals, and the ledger serialises
//! within one.

use anyhow::{Context, Result, bail};
use kavi_classify::{FailureRecord, classify};
use kavi_gateway::{GatewayClient, GatewayConfig};
use kavi_ledger::{BuildResult, Ledger};
use kavi_store::BlobStore;
use kavi_types::{
    ArtifactId, ArtifactKind, BuildId, BuildOutcome, ProposalId, RegistryEntry, RunRecord,
    SkillSpec, SkillStatus, VerificationRecord,
};
use serde_json::Value;

use crate::config::ForgeConfig;
use crate::events::{self, EventKind, ForgeEvent};
use crate::packet;
use crate::process::ToolRunner;
use crate::registry::{self, TrustError};
use crate::retry::{self, RetryPlan};
use crate::runtime;
use crate::sandbox::{BuildVerdict, SandboxBuilder};
use crate::verify::{self, VerificationReport};

/// Progress reporting surface for callers (CLI, tests).
pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Reporter that swallows everything.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// Outcome of one `build` invocation.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub build_id: BuildId,
    pub outcome: BuildOutcome,
    pub failure: Option<FailureRecord>,
}

/// The forge context: configuration, ledger, blob store.
pub struct Forge {
    config: ForgeConfig,
    ledger: Ledger,
    store: BlobStore,
}

impl Forge {
    /// Open (creating on first use) the forge under the configured
    /// data root.
    pub fn open(config: ForgeConfig) -> Result<Self> {
        let data_root = config.data_root();
        std::fs::create_dir_all(&data_root)
            .with_context(|| format!("failed to create data root {}", data_root.display()))?;

        let ledger = Ledger::open(&config.ledger_path())
            .with_context(|| format!("failed to open ledger {}", config.ledger_path().display()))?;
        let store = BlobStore::new(config.blob_root());
        Ok(Self {
            config,
            ledger,
            store,
        })
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn status(&self, proposal_id: ProposalId) -> Result<SkillStatus> {
        Ok(self.ledger.query_status(proposal_id)?)
    }

    /// Store bytes and record the artifact row in one step.
    pub fn put_artifact(&mut self, bytes: &[u8], kind: ArtifactKind) -> Result<ArtifactId> {
        let blob = self.store.put(bytes).context("artifact store write failed")?;
        Ok(self.ledger.insert_artifact(&blob.hash, kind, blob.size)?)
    }

    pub fn artifact_bytes(&self, id: ArtifactId) -> Result<Vec<u8>> {
        let meta = self.ledger.get_artifact(id)?;
        Ok(self.store.get(&meta.hash)?)
    }

    /// Events are the audit trail, not the source of truth; a failed
    /// append degrades to a warning rather than aborting the op.
    fn emit(&self, kind: EventKind, reporter: &mut dyn Reporter) {
        if let Err(e) = events::append(&self.config.events_path(), &ForgeEvent::now(kind)) {
            reporter.warn(&format!("event log append failed: {e:#}"));
        }
    }

    // ---- propose ------------------------------------------------------

    pub fn propose(&mut self, spec: &SkillSpec, reporter: &mut dyn Reporter) -> Result<ProposalId> {
        let spec_bytes = serde_json::to_vec_pretty(spec).context("failed to serialize spec")?;
        let spec_artifact = self.put_artifact(&spec_bytes, ArtifactKind::SkillSpec)?;
        let proposal_id = self.ledger.create_proposal(spec, spec_artifact)?;

        self.emit(
            EventKind::ProposalCreated {
                proposal_id,
                name: spec.name.clone(),
            },
            reporter,
        );
        reporter.info(&format!("proposed skill `{}` (proposal {proposal_id})", spec.name));
        Ok(proposal_id)
    }

    // ---- build --------------------------------------------------------

    /// Run one build attempt. `packet_override` carries a retry
    /// engine's enriched packet; the first attempt derives its packet
    /// from the proposal.
    pub fn build(
        &mut self,
        proposal_id: ProposalId,
        packet_override: Option<String>,
        runner: &dyn ToolRunner,
        reporter: &mut dyn Reporter,
    ) -> Result<BuildReport> {
        let proposal = self.ledger.get_proposal(proposal_id)?;
        let name = proposal.spec.name.clone();
        let conv = self.config.path_convention();
        let allowlist = conv.allowlist(&name);

        let packet_text =
            packet_override.unwrap_or_else(|| packet::render(&proposal.spec, &allowlist));
        let packet_artifact = self.put_artifact(packet_text.as_bytes(), ArtifactKind::BuildPacket)?;

        let parent = self.ledger.latest_build(proposal_id)?.map(|b| b.id);
        let build_id = self
            .ledger
            .open_build(proposal_id, parent, Some(packet_artifact))?;
        let attempt_number = self.ledger.get_build(build_id)?.attempt_number;
        self.emit(
            EventKind::BuildOpened {
                proposal_id,
                build_id,
                attempt_number,
            },
            reporter,
        );
        reporter.info(&format!("build {build_id} (attempt {attempt_number}) for `{name}`"));

        let run = SandboxBuilder::new(&self.config, runner).run_build(&name, build_id, &packet_text)?;
        let log_artifact = self.put_artifact(run.log.as_bytes(), ArtifactKind::BuildLog)?;

        let report = match &run.verdict {
            BuildVerdict::Clean => {
                self.ledger.record_build_result(
                    build_id,
                    &BuildResult::succeeded(log_artifact, run.changed_files.clone()),
                )?;
                reporter.info(&format!("build {build_id} succeeded"));
                BuildReport {
                    build_id,
                    outcome: BuildOutcome::Succeeded,
                    failure: None,
                }
            }
            verdict => {
                let failure = classify(&run.log, None);
                if let BuildVerdict::GateViolation { offending } = verdict {
                    self.emit(
                        EventKind::GateViolated {
                            build_id,
                            offending_paths: offending.clone(),
                        },
                        reporter,
                    );
                    reporter.error(&format!(
                        "build {build_id} gate violation: {}",
                        offending.join(", ")
                    ));
                } else {
                    reporter.error(&format!("build {build_id} failed: {}", failure.kind));
                }
                let facts = serde_json::to_value(&failure.facts)
                    .context("failed to serialize failure facts")?;
                self.ledger.record_build_result(
                    build_id,
                    &BuildResult::failed(
                        Some(log_artifact),
                        failure.kind,
                        facts,
                        run.changed_files.clone(),
                    ),
                )?;
                BuildReport {
                    build_id,
                    outcome: BuildOutcome::Failed,
                    failure: Some(failure),
                }
            }
        };

        self.emit(
            EventKind::BuildCompleted {
                build_id,
                outcome: report.outcome,
            },
            reporter,
        );
        Ok(report)
    }

    // ---- verify -------------------------------------------------------

    pub fn verify(
        &mut self,
        build_id: BuildId,
        runner: &dyn ToolRunner,
        reporter: &mut dyn Reporter,
    ) -> Result<VerificationRecord> {
        let build = self.ledger.get_build(build_id)?;
        let proposal = self.ledger.get_proposal(build.proposal_id)?;

        let report = verify::run_battery(&self.config, runner, &proposal, &build)?;
        let report_bytes =
            serde_json::to_vec_pretty(&report).context("failed to serialize verification report")?;
        let report_artifact = self.put_artifact(&report_bytes, ArtifactKind::VerificationReport)?;

        let record = self
            .ledger
            .record_verification(build_id, report.gates(), Some(report_artifact))?;
        self.emit(
            EventKind::VerificationRecorded {
                build_id,
                all_ok: record.all_ok,
            },
            reporter,
        );

        if record.all_ok {
            reporter.info(&format!("build {build_id} verified; all five gates passed"));
        } else {
            let gates = report.gates();
            let failed: Vec<&str> = [
                ("ruff", gates.ruff),
                ("mypy", gates.mypy),
                ("pytest", gates.pytest),
                ("policy", gates.policy),
                ("invariants", gates.invariants),
            ]
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(name, _)| *name)
            .collect();
            reporter.warn(&format!("build {build_id} failed gates: {}", failed.join(", ")));
        }
        Ok(record)
    }

    // ---- promote ------------------------------------------------------

    /// Promote a VERIFIED proposal. `approver` is a caller-provided
    /// identity string, recorded as-is.
    pub fn promote(
        &mut self,
        proposal_id: ProposalId,
        approver: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<String> {
        let proposal = self.ledger.get_proposal(proposal_id)?;
        let name = proposal.spec.name.clone();
        let conv = self.config.path_convention();
        let source_path = conv.skill_path_under(self.config.project_root(), &name);
        let source_hash = kavi_store::hash_file(&source_path)
            .with_context(|| format!("failed to hash skill source {}", source_path.display()))?;

        self.ledger.record_promotion(proposal_id, approver, &source_hash)?;
        self.rewrite_registry()?;

        self.emit(
            EventKind::Promoted {
                proposal_id,
                name: name.clone(),
                source_hash: source_hash.clone(),
            },
            reporter,
        );
        reporter.info(&format!("promoted `{name}` ({})", &source_hash[..12]));
        Ok(source_hash)
    }

    /// Append a revocation record and drop the entry from the registry.
    pub fn revoke(
        &mut self,
        proposal_id: ProposalId,
        approver: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<()> {
        let proposal = self.ledger.get_proposal(proposal_id)?;
        self.ledger.record_revocation(proposal_id, approver)?;
        self.rewrite_registry()?;
        self.emit(
            EventKind::PromotionRevoked {
                proposal_id,
                name: proposal.spec.name.clone(),
            },
            reporter,
        );
        reporter.warn(&format!("revoked `{}`", proposal.spec.name));
        Ok(())
    }

    /// Derive the registry view from the ledger and swap it into place.
    fn rewrite_registry(&mut self) -> Result<()> {
        let conv = self.config.path_convention();
        let entries: Vec<RegistryEntry> = self
            .ledger
            .trusted_skills()?
            .into_iter()
            .map(|t| RegistryEntry {
                module: conv.module_ref(&t.name),
                name: t.name,
                side_effect_class: t.side_effect_class,
                hash: Some(t.source_hash),
                required_secrets: t.required_secrets,
            })
            .collect();
        registry::write_atomic(&self.config.registry_path(), &entries)
    }

    // ---- retry --------------------------------------------------------

    /// Consecutive attempts that failed to reach VERIFIED: failed
    /// builds, and completed builds whose verification said no.
    fn consecutive_failed_attempts(&self, proposal_id: ProposalId) -> Result<u32> {
        let builds = self.ledger.list_builds(proposal_id)?;
        let mut count = 0;
        for build in builds.iter().rev() {
            let failed = match build.outcome {
                BuildOutcome::Failed => true,
                BuildOutcome::Pending => continue,
                BuildOutcome::Succeeded => match self.ledger.get_verification(build.id)? {
                    Some(v) => !v.all_ok,
                    None => false,
                },
            };
            if !failed {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Prepare the next packet for a proposal whose last attempt
    /// failed its build or its verification. Does not open a build.
    pub fn prepare_retry(
        &mut self,
        proposal_id: ProposalId,
        reporter: &mut dyn Reporter,
    ) -> Result<RetryPlan> {
        let proposal = self.ledger.get_proposal(proposal_id)?;
        let build = self
            .ledger
            .latest_build(proposal_id)?
            .context("proposal has no builds to retry")?;

        let log = match build.log_artifact_id {
            Some(id) => String::from_utf8_lossy(&self.artifact_bytes(id)?).to_string(),
            None => String::new(),
        };
        let previous_packet = match build.packet_artifact_id {
            Some(id) => String::from_utf8_lossy(&self.artifact_bytes(id)?).to_string(),
            None => String::new(),
        };
        let summary = match self.ledger.get_verification(build.id)? {
            Some(v) => match v.report_artifact_id {
                Some(id) => {
                    let report: VerificationReport =
                        serde_json::from_slice(&self.artifact_bytes(id)?)
                            .context("failed to parse verification report artifact")?;
                    Some(report.summary())
                }
                None => None,
            },
            None => None,
        };

        let failure = classify(&log, summary.as_ref());
        if failure.kind == kavi_types::FailureKind::Unknown && build.outcome == BuildOutcome::Succeeded && summary.is_none() {
            bail!("latest build {} neither failed nor failed verification", build.id);
        }

        let note_bytes = serde_json::to_vec_pretty(&failure)
            .context("failed to serialize research note")?;
        self.put_artifact(&note_bytes, ArtifactKind::ResearchNote)?;

        let conv = self.config.path_convention();
        let spec_text =
            packet::render(&proposal.spec, &conv.allowlist(&proposal.spec.name));
        let consecutive = self.consecutive_failed_attempts(proposal_id)?;

        let gateway = if self.config.gateway.enabled {
            GatewayClient::new(GatewayConfig {
                base_url: self.config.gateway.resolved_base_url(),
                model: self.config.gateway.model.clone(),
                api_key: self.config.gateway.resolved_api_key(),
                timeout: self.config.gateway.timeout,
            })
            .ok()
        } else {
            None
        };

        let plan = retry::prepare_next_packet(
            &self.config,
            gateway.as_ref(),
            &spec_text,
            &previous_packet,
            &failure,
            build.attempt_number + 1,
            consecutive,
        );

        self.emit(
            EventKind::RetryPrepared {
                proposal_id,
                triggers: plan.triggers.clone(),
                advisory_used: plan.advisory_used,
            },
            reporter,
        );
        if plan.triggers.is_empty() {
            reporter.info("retry packet prepared; no escalation triggers");
        } else {
            let names: Vec<&str> = plan.triggers.iter().map(|t| t.as_str()).collect();
            reporter.warn(&format!(
                "retry packet prepared; human approval required: {}",
                names.join(", ")
            ));
        }
        Ok(plan)
    }

    // ---- run ----------------------------------------------------------

    /// Trust-verify and execute a promoted skill.
    pub fn run(
        &mut self,
        name: &str,
        input: &Value,
        runner: &dyn ToolRunner,
        reporter: &mut dyn Reporter,
    ) -> Result<RunRecord> {
        let entry = registry::lookup(&self.config.registry_path(), name)?
            .ok_or_else(|| TrustError::NotRegistered {
                name: name.to_string(),
            })?;
        let proposal = self
            .ledger
            .find_proposal_by_name(name)?
            .with_context(|| format!("skill `{name}` is registered but unknown to the ledger"))?;

        if entry.hash.is_none() {
            reporter.warn(&format!(
                "registry entry for `{name}` has no hash; skipping trust verification"
            ));
        }

        let conv = self.config.path_convention();
        let source_path = conv.skill_path_under(self.config.project_root(), name);
        let result = runtime::run_skill(
            &self.config,
            runner,
            &entry,
            &proposal.spec.input_schema,
            &proposal.spec.output_schema,
            &source_path,
            input,
        );

        match result {
            Ok(record) => {
                self.emit(
                    EventKind::RunCompleted {
                        name: name.to_string(),
                        ok: record.ok,
                    },
                    reporter,
                );
                Ok(record)
            }
            Err(err) => {
                if let Some(TrustError::HashMismatch { expected, actual, .. }) =
                    err.downcast_ref::<TrustError>()
                {
                    self.emit(
                        EventKind::TrustRejected {
                            name: name.to_string(),
                            expected: expected.clone(),
                            actual: actual.clone(),
                        },
                        reporter,
                    );
                    reporter.error(&format!("trust verification failed for `{name}`; refusing to run"));
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandOutput, CommandSpec};
    use kavi_schema::{FieldType, IoSchema};
    use kavi_types::{EscalationTrigger, FailureKind, SideEffectClass};
    use serde_json::json;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const GOOD_SKILL: &str = r#"class WriteNote(Skill):
    name = "write_note"
    side_effect_class = "FILE_WRITE"
    input_model = {"title": "str", "body": "str"}
    output_model = {"path": "str"}

    def run(self, title: str, body: str) -> dict:
        return {"path": f"notes/{title}.md"}
"#;

    const GOOD_TEST: &str = "def test_write_note(): pass\n";

    /// Drives the whole pipeline: plays the build worker (writing
    /// scripted files into the sandbox), the python harness (scripted
    /// output), and lets the verification tools succeed by default.
    struct PipelineRunner {
        worker_files: Vec<(String, String)>,
        python_output: Option<CommandOutput>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl PipelineRunner {
        fn new(worker_files: Vec<(String, String)>) -> Self {
            Self {
                worker_files,
                python_output: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_python(mut self, output: CommandOutput) -> Self {
            self.python_output = Some(output);
            self
        }

        fn calls_to(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.program == program)
                .count()
        }
    }

    impl ToolRunner for PipelineRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            if spec.program == "kavi-worker" {
                for (rel, content) in &self.worker_files {
                    let path = spec.cwd.join(rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(path, content)?;
                }
                return Ok(CommandOutput::success("worker done\n"));
            }
            if spec.program == "python3"
                && let Some(out) = &self.python_output
            {
                return Ok(out.clone());
            }
            Ok(CommandOutput::success(""))
        }
    }

    fn forge_in(project: &std::path::Path, scratch: &std::path::Path) -> Forge {
        fs::create_dir_all(project.join("skills")).expect("mkdir");
        fs::create_dir_all(project.join("tests")).expect("mkdir");
        let mut config = ForgeConfig::default();
        config.roots.project = project.to_path_buf();
        config.roots.scratch = scratch.to_path_buf();
        Forge::open(config).expect("forge opens")
    }

    fn note_spec() -> SkillSpec {
        SkillSpec {
            name: "write_note".to_string(),
            description: "write a note to disk".to_string(),
            side_effect_class: SideEffectClass::FileWrite,
            input_schema: IoSchema::from_pairs([("title", FieldType::Str), ("body", FieldType::Str)]),
            output_schema: IoSchema::from_pairs([("path", FieldType::Str)]),
            required_secrets: vec![],
        }
    }

    fn good_worker_files() -> Vec<(String, String)> {
        vec![
            ("skills/write_note.py".to_string(), GOOD_SKILL.to_string()),
            ("tests/test_skill_write_note.py".to_string(), GOOD_TEST.to_string()),
        ]
    }

    #[test]
    fn happy_path_propose_build_verify_promote_run() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;

        let runner = PipelineRunner::new(good_worker_files())
            .with_python(CommandOutput::success("{\"path\": \"notes/Hi.md\"}\n"));

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Proposed);

        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");
        assert_eq!(report.outcome, BuildOutcome::Succeeded);
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Built);
        assert!(project.path().join("skills/write_note.py").exists());

        let record = forge.verify(report.build_id, &runner, &mut reporter).expect("verify");
        assert!(record.all_ok);
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Verified);

        let hash = forge.promote(pid, "operator", &mut reporter).expect("promote");
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Trusted);
        assert!(!hash.is_empty());

        let entries = registry::load(&forge.config().registry_path()).expect("registry");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "write_note");
        assert_eq!(entries[0].module, "skills.write_note");
        assert_eq!(entries[0].hash.as_deref(), Some(hash.as_str()));

        let run = forge
            .run("write_note", &json!({"title": "Hi", "body": "x"}), &runner, &mut reporter)
            .expect("run");
        assert!(run.ok);
        assert_eq!(run.output, Some(json!({"path": "notes/Hi.md"})));
        assert_eq!(run.source_hash, hash);
        assert_eq!(run.side_effect_class, SideEffectClass::FileWrite);
    }

    #[test]
    fn gate_violation_leaves_status_proposed_and_classifies() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;

        let mut files = good_worker_files();
        files.push(("rogue.txt".to_string(), "oops\n".to_string()));
        let runner = PipelineRunner::new(files);

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");

        assert_eq!(report.outcome, BuildOutcome::Failed);
        let failure = report.failure.expect("failure record");
        assert_eq!(failure.kind, FailureKind::GateViolation);
        assert_eq!(failure.facts.offending_paths, vec!["rogue.txt"]);
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Proposed);
        assert!(!project.path().join("rogue.txt").exists());

        let build = forge.ledger().get_build(report.build_id).expect("build row");
        assert_eq!(build.failure_kind, Some(FailureKind::GateViolation));
    }

    #[test]
    fn retry_after_gate_violation_is_deterministic_with_ambiguous_trigger() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;

        let mut files = good_worker_files();
        files.push(("rogue.txt".to_string(), "oops\n".to_string()));
        let runner = PipelineRunner::new(files);

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        forge.build(pid, None, &runner, &mut reporter).expect("build");

        // Gateway disabled by default: deterministic fallback.
        let plan = forge.prepare_retry(pid, &mut reporter).expect("retry");
        assert!(!plan.advisory_used);
        assert!(plan.triggers.contains(&EscalationTrigger::Ambiguous));
        assert!(plan.packet.contains("failure_kind: GATE_VIOLATION"));
        assert!(plan.packet.contains("  - rogue.txt"));

        // No new build was opened by the retry engine.
        assert_eq!(forge.ledger().list_builds(pid).expect("builds").len(), 1);

        // The caller decides: a second build with the enriched packet.
        let clean = PipelineRunner::new(good_worker_files());
        let second = forge
            .build(pid, Some(plan.packet), &clean, &mut reporter)
            .expect("second build");
        assert_eq!(second.outcome, BuildOutcome::Succeeded);
        let build = forge.ledger().get_build(second.build_id).expect("row");
        assert_eq!(build.attempt_number, 2);
    }

    #[test]
    fn verify_failure_classifies_from_the_report() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;

        // The worker emits a skill with a forbidden import; gates 1-3
        // pass (stubbed tools), the policy gate catches it.
        let bad_skill = format!("import subprocess\n{GOOD_SKILL}");
        let files = vec![
            ("skills/write_note.py".to_string(), bad_skill),
            ("tests/test_skill_write_note.py".to_string(), GOOD_TEST.to_string()),
        ];
        let runner = PipelineRunner::new(files);

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");
        assert_eq!(report.outcome, BuildOutcome::Succeeded);

        let record = forge.verify(report.build_id, &runner, &mut reporter).expect("verify");
        assert!(!record.all_ok);
        assert!(!record.gates.policy);
        assert_eq!(forge.status(pid).unwrap(), SkillStatus::Built);

        let plan = forge.prepare_retry(pid, &mut reporter).expect("retry");
        assert!(plan.packet.contains("failure_kind: VERIFY_POLICY"));
        assert!(plan.triggers.contains(&EscalationTrigger::SecurityClass));
    }

    #[test]
    fn tampered_skill_is_refused_at_run_time() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;

        let runner = PipelineRunner::new(good_worker_files())
            .with_python(CommandOutput::success("{\"path\": \"p\"}\n"));

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");
        forge.verify(report.build_id, &runner, &mut reporter).expect("verify");
        forge.promote(pid, "operator", &mut reporter).expect("promote");

        // One byte changes after promotion.
        let skill_path = project.path().join("skills/write_note.py");
        let mut source = fs::read(&skill_path).expect("read");
        *source.last_mut().unwrap() = b'#';
        fs::write(&skill_path, source).expect("tamper");

        let err = forge
            .run("write_note", &json!({"title": "Hi", "body": "x"}), &runner, &mut reporter)
            .expect_err("must refuse");
        assert!(matches!(
            err.downcast_ref::<TrustError>(),
            Some(TrustError::HashMismatch { .. })
        ));
        // The harness never ran.
        assert_eq!(runner.calls_to("python3"), 0);
    }

    #[test]
    fn unregistered_skill_does_not_run() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;
        let runner = PipelineRunner::new(vec![]);

        let err = forge
            .run("ghost", &json!({}), &runner, &mut reporter)
            .expect_err("must refuse");
        assert!(matches!(
            err.downcast_ref::<TrustError>(),
            Some(TrustError::NotRegistered { .. })
        ));
    }

    #[test]
    fn revocation_removes_the_registry_entry() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;
        let runner = PipelineRunner::new(good_worker_files());

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");
        forge.verify(report.build_id, &runner, &mut reporter).expect("verify");
        forge.promote(pid, "operator", &mut reporter).expect("promote");

        forge.revoke(pid, "operator", &mut reporter).expect("revoke");
        assert!(registry::load(&forge.config().registry_path()).expect("registry").is_empty());
        let err = forge
            .run("write_note", &json!({"title": "a", "body": "b"}), &runner, &mut reporter)
            .expect_err("must refuse");
        assert!(matches!(
            err.downcast_ref::<TrustError>(),
            Some(TrustError::NotRegistered { .. })
        ));
    }

    #[test]
    fn lifecycle_events_are_appended() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());
        let mut reporter = NullReporter;
        let runner = PipelineRunner::new(good_worker_files());

        let pid = forge.propose(&note_spec(), &mut reporter).expect("propose");
        let report = forge.build(pid, None, &runner, &mut reporter).expect("build");
        forge.verify(report.build_id, &runner, &mut reporter).expect("verify");
        forge.promote(pid, "operator", &mut reporter).expect("promote");

        let events = events::read_all(&forge.config().events_path()).expect("events");
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match &e.kind {
                EventKind::ProposalCreated { .. } => "proposal_created",
                EventKind::BuildOpened { .. } => "build_opened",
                EventKind::BuildCompleted { .. } => "build_completed",
                EventKind::VerificationRecorded { .. } => "verification_recorded",
                EventKind::Promoted { .. } => "promoted",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "proposal_created",
                "build_opened",
                "build_completed",
                "verification_recorded",
                "promoted"
            ]
        );
    }

    #[test]
    fn artifact_bytes_roundtrip_through_store_and_ledger() {
        let project = tempdir().expect("project");
        let scratch = tempdir().expect("scratch");
        let mut forge = forge_in(project.path(), scratch.path());

        let id = forge
            .put_artifact(b"note body", ArtifactKind::Note)
            .expect("put");
        assert_eq!(forge.artifact_bytes(id).expect("get"), b"note body");

        // Same bytes, same kind: same artifact id.
        let again = forge
            .put_artifact(b"note body", ArtifactKind::Note)
            .expect("put again");
        assert_eq!(id, again);
    }
}
