//! Core domain types for the kavi forge.
//!
//! Everything the ledger persists and the engine passes between
//! subsystems lives here: skill proposals and their status machine,
//! build attempts, verification and promotion records, artifact
//! metadata, and the failure/escalation vocabulary shared by the
//! classifier and the retry engine.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use kavi_schema::IoSchema;
use serde::{Deserialize, Serialize};

/// Ledger row id for a skill proposal.
pub type ProposalId = i64;
/// Ledger row id for a build attempt.
pub type BuildId = i64;
/// Ledger row id for an artifact.
pub type ArtifactId = i64;
/// Ledger row id for a promotion record.
pub type PromotionId = i64;

/// Lifecycle status of a skill proposal.
///
/// Transitions are monotonic with one exception: a `Built` proposal
/// drops back to `Proposed` when a new build attempt opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkillStatus {
    Proposed,
    Built,
    Verified,
    Trusted,
}

impl SkillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillStatus::Proposed => "PROPOSED",
            SkillStatus::Built => "BUILT",
            SkillStatus::Verified => "VERIFIED",
            SkillStatus::Trusted => "TRUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROPOSED" => Some(SkillStatus::Proposed),
            "BUILT" => Some(SkillStatus::Built),
            "VERIFIED" => Some(SkillStatus::Verified),
            "TRUSTED" => Some(SkillStatus::Trusted),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn may_advance_to(&self, next: SkillStatus) -> bool {
        use SkillStatus::*;
        matches!(
            (self, next),
            (Proposed, Built) | (Built, Proposed) | (Built, Verified) | (Verified, Trusted)
        )
    }
}

impl fmt::Display for SkillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared side-effect class of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffectClass {
    ReadOnly,
    FileWrite,
    Network,
    SecretRead,
}

impl SideEffectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectClass::ReadOnly => "READ_ONLY",
            SideEffectClass::FileWrite => "FILE_WRITE",
            SideEffectClass::Network => "NETWORK",
            SideEffectClass::SecretRead => "SECRET_READ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READ_ONLY" => Some(SideEffectClass::ReadOnly),
            "FILE_WRITE" => Some(SideEffectClass::FileWrite),
            "NETWORK" => Some(SideEffectClass::Network),
            "SECRET_READ" => Some(SideEffectClass::SecretRead),
            _ => None,
        }
    }
}

impl fmt::Display for SideEffectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed kind of a content-addressed artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    SkillSpec,
    BuildPacket,
    BuildLog,
    VerificationReport,
    ResearchNote,
    PatchSummary,
    Note,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::SkillSpec => "SKILL_SPEC",
            ArtifactKind::BuildPacket => "BUILD_PACKET",
            ArtifactKind::BuildLog => "BUILD_LOG",
            ArtifactKind::VerificationReport => "VERIFICATION_REPORT",
            ArtifactKind::ResearchNote => "RESEARCH_NOTE",
            ArtifactKind::PatchSummary => "PATCH_SUMMARY",
            ArtifactKind::Note => "NOTE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SKILL_SPEC" => Some(ArtifactKind::SkillSpec),
            "BUILD_PACKET" => Some(ArtifactKind::BuildPacket),
            "BUILD_LOG" => Some(ArtifactKind::BuildLog),
            "VERIFICATION_REPORT" => Some(ArtifactKind::VerificationReport),
            "RESEARCH_NOTE" => Some(ArtifactKind::ResearchNote),
            "PATCH_SUMMARY" => Some(ArtifactKind::PatchSummary),
            "NOTE" => Some(ArtifactKind::Note),
            _ => None,
        }
    }
}

/// Outcome of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildOutcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

impl BuildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildOutcome::Pending => "PENDING",
            BuildOutcome::Succeeded => "SUCCEEDED",
            BuildOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(BuildOutcome::Pending),
            "SUCCEEDED" => Some(BuildOutcome::Succeeded),
            "FAILED" => Some(BuildOutcome::Failed),
            _ => None,
        }
    }
}

/// Deterministic classification of a failed build or verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    GateViolation,
    Timeout,
    BuildError,
    VerifyLint,
    VerifyTest,
    VerifyPolicy,
    VerifyInvariant,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::GateViolation => "GATE_VIOLATION",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::BuildError => "BUILD_ERROR",
            FailureKind::VerifyLint => "VERIFY_LINT",
            FailureKind::VerifyTest => "VERIFY_TEST",
            FailureKind::VerifyPolicy => "VERIFY_POLICY",
            FailureKind::VerifyInvariant => "VERIFY_INVARIANT",
            FailureKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GATE_VIOLATION" => Some(FailureKind::GateViolation),
            "TIMEOUT" => Some(FailureKind::Timeout),
            "BUILD_ERROR" => Some(FailureKind::BuildError),
            "VERIFY_LINT" => Some(FailureKind::VerifyLint),
            "VERIFY_TEST" => Some(FailureKind::VerifyTest),
            "VERIFY_POLICY" => Some(FailureKind::VerifyPolicy),
            "VERIFY_INVARIANT" => Some(FailureKind::VerifyInvariant),
            "UNKNOWN" => Some(FailureKind::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition that requires explicit human approval before another
/// build attempt may open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTrigger {
    RepeatedFailure,
    PermissionWidening,
    SecurityClass,
    LargeDiff,
    Ambiguous,
}

impl EscalationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationTrigger::RepeatedFailure => "REPEATED_FAILURE",
            EscalationTrigger::PermissionWidening => "PERMISSION_WIDENING",
            EscalationTrigger::SecurityClass => "SECURITY_CLASS",
            EscalationTrigger::LargeDiff => "LARGE_DIFF",
            EscalationTrigger::Ambiguous => "AMBIGUOUS",
        }
    }
}

/// Ordered, deduplicated set of escalation triggers.
pub type TriggerSet = BTreeSet<EscalationTrigger>;

/// Input specification for a new skill proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillSpec {
    /// Filesystem-safe lowercase identifier.
    pub name: String,
    pub description: String,
    pub side_effect_class: SideEffectClass,
    pub input_schema: IoSchema,
    pub output_schema: IoSchema,
    /// Environment-variable names the skill declares it needs.
    #[serde(default)]
    pub required_secrets: Vec<String>,
}

impl SkillSpec {
    /// A proposal name is an opaque identifier that ends up embedded in
    /// file paths and module references; restrict it accordingly.
    pub fn name_is_valid(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= 64
            && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

/// A skill proposal as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillProposal {
    pub id: ProposalId,
    pub spec: SkillSpec,
    pub status: SkillStatus,
    pub spec_artifact_id: ArtifactId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A build attempt as stored in the ledger.
///
/// Attempts form a linear parent chain per proposal, numbered
/// contiguously from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAttempt {
    pub id: BuildId,
    pub proposal_id: ProposalId,
    pub parent_build_id: Option<BuildId>,
    pub attempt_number: u32,
    pub packet_artifact_id: Option<ArtifactId>,
    pub log_artifact_id: Option<ArtifactId>,
    pub outcome: BuildOutcome,
    pub failure_kind: Option<FailureKind>,
    /// Structured failure facts as recorded by the classifier.
    pub failure_facts: Option<serde_json::Value>,
    /// Files the diff gate observed as changed or created, recorded so
    /// scope containment can be rechecked after the workspace is gone.
    #[serde(default)]
    pub changed_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-gate booleans for one verification of one build. Immutable once
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResults {
    pub ruff: bool,
    pub mypy: bool,
    pub pytest: bool,
    pub policy: bool,
    pub invariants: bool,
}

impl GateResults {
    pub fn all_ok(&self) -> bool {
        self.ruff && self.mypy && self.pytest && self.policy && self.invariants
    }
}

/// A verification record as stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: i64,
    pub build_id: BuildId,
    pub gates: GateResults,
    pub all_ok: bool,
    pub report_artifact_id: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
}

/// A promotion record. Append-only; a demotion is a new record with
/// `revoked` set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub id: PromotionId,
    pub proposal_id: ProposalId,
    pub approver: String,
    pub source_hash: String,
    pub prior_promotion_id: Option<PromotionId>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Metadata row for a content-addressed artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    /// Lowercase hex SHA-256 of the blob bytes.
    pub hash: String,
    pub kind: ArtifactKind,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// One entry in the TRUSTED registry view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    /// Module reference for the runtime loader, e.g. `skills.write_note`.
    pub module: String,
    pub side_effect_class: SideEffectClass,
    /// SHA-256 of the skill source at promotion. Absent only in legacy
    /// registries written before hashes were recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default)]
    pub required_secrets: Vec<String>,
}

/// Structured record of one runtime execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub name: String,
    pub source_hash: String,
    pub side_effect_class: SideEffectClass,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub ok: bool,
    /// Set when the run failed; load-time and input-validation failures
    /// carry a distinct phase from execution failures.
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Where in the run pipeline a failure occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "message")]
pub enum RunError {
    /// Registry lookup or trust verification failed; no skill code ran.
    Load(String),
    /// Input did not match the declared input schema; no skill code ran.
    InvalidInput(String),
    /// The skill executed and failed, or its output failed validation.
    Execution(String),
}
