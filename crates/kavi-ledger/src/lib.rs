//! Canonical durable state for the kavi forge.
//!
//! The ledger exclusively owns proposal, build, verification, and
//! promotion state. Status transitions are guarded at the application
//! level (SQLite cannot widen CHECK constraints in place, so the
//! declared constraints are a backstop, not the arbiter), and every
//! multi-row mutation runs inside one transaction.
//!
//! Attempts per proposal form a linear chain numbered contiguously from
//! 1; at most one build is in flight per proposal; a verification
//! record is written exactly once per build.

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use kavi_schema::IoSchema;
use kavi_types::{
    ArtifactId, ArtifactKind, ArtifactMeta, BuildAttempt, BuildId, BuildOutcome, FailureKind,
    GateResults, PromotionId, PromotionRecord, ProposalId, SideEffectClass, SkillProposal,
    SkillSpec, SkillStatus, VerificationRecord,
};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

pub use migrations::CURRENT_SCHEMA_VERSION;

/// Ledger failure taxonomy. Everything the state machine can reject is
/// typed; raw storage failures surface as `Store`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid transition: {reason}")]
    InvalidTransition { reason: String },
    #[error("unknown {entity} {id}")]
    UnknownEntity { entity: &'static str, id: i64 },
    #[error("concurrent modification: {reason}")]
    ConcurrentModification { reason: String },
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error("corrupt ledger row: {what}")]
    Corrupt { what: String },
    #[error("ledger store failure")]
    Store(#[from] rusqlite::Error),
}

type Result<T> = std::result::Result<T, LedgerError>;

/// Terminal outcome of a build, with the metadata recorded alongside.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub outcome: BuildOutcome,
    pub log_artifact_id: Option<ArtifactId>,
    pub failure_kind: Option<FailureKind>,
    pub failure_facts: Option<serde_json::Value>,
    /// Files the diff gate saw as changed or created.
    pub changed_files: Vec<String>,
}

impl BuildResult {
    pub fn succeeded(log_artifact_id: ArtifactId, changed_files: Vec<String>) -> Self {
        Self {
            outcome: BuildOutcome::Succeeded,
            log_artifact_id: Some(log_artifact_id),
            failure_kind: None,
            failure_facts: None,
            changed_files,
        }
    }

    pub fn failed(
        log_artifact_id: Option<ArtifactId>,
        kind: FailureKind,
        facts: serde_json::Value,
        changed_files: Vec<String>,
    ) -> Self {
        Self {
            outcome: BuildOutcome::Failed,
            log_artifact_id,
            failure_kind: Some(kind),
            failure_facts: Some(facts),
            changed_files,
        }
    }
}

/// One TRUSTED proposal joined with its current (non-revoked) promotion,
/// as needed to derive the registry view.
#[derive(Debug, Clone)]
pub struct TrustedSkill {
    pub proposal_id: ProposalId,
    pub name: String,
    pub side_effect_class: SideEffectClass,
    pub required_secrets: Vec<String>,
    pub source_hash: String,
}

/// Handle to the ledger database. Not `Sync`; callers that parallelise
/// over proposals open one handle per thread.
pub struct Ledger {
    conn: Connection,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str, what: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt {
            what: format!("{what}: bad timestamp `{s}`: {e}"),
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, what: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| LedgerError::Corrupt {
        what: format!("{what}: bad JSON: {e}"),
    })
}

fn encode_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| LedgerError::InvalidInput {
        reason: format!("{what} does not serialize: {e}"),
    })
}

impl Ledger {
    /// Open (and migrate) the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory ledger, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "wal").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut ledger = Self { conn };
        migrations::apply(&mut ledger.conn)?;
        Ok(ledger)
    }

    pub fn schema_version(&self) -> Result<u32> {
        migrations::applied_version(&self.conn).map_err(Into::into)
    }

    // ---- artifacts ----------------------------------------------------

    /// Record an artifact row. Idempotent on `(hash, kind)`: identical
    /// bytes under the same kind yield the same id, while the same
    /// bytes under two kinds are two rows over one blob.
    pub fn insert_artifact(&mut self, hash: &str, kind: ArtifactKind, size: u64) -> Result<ArtifactId> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO artifacts (hash, kind, size, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![hash, kind.as_str(), size as i64, now()],
        )?;
        let id: i64 = tx.query_row(
            "SELECT id FROM artifacts WHERE hash = ?1 AND kind = ?2",
            params![hash, kind.as_str()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn get_artifact(&self, id: ArtifactId) -> Result<ArtifactMeta> {
        let row = self
            .conn
            .query_row(
                "SELECT id, hash, kind, size, created_at FROM artifacts WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .ok_or(LedgerError::UnknownEntity {
                entity: "artifact",
                id,
            })?;

        let (id, hash, kind, size, created_at) = row;
        Ok(ArtifactMeta {
            id,
            hash,
            kind: ArtifactKind::parse(&kind).ok_or_else(|| LedgerError::Corrupt {
                what: format!("artifact {id}: kind `{kind}`"),
            })?,
            size: size as u64,
            created_at: parse_ts(&created_at, "artifact")?,
        })
    }

    // ---- proposals ----------------------------------------------------

    pub fn create_proposal(&mut self, spec: &SkillSpec, spec_artifact_id: ArtifactId) -> Result<ProposalId> {
        if !SkillSpec::name_is_valid(&spec.name) {
            return Err(LedgerError::InvalidInput {
                reason: format!("proposal name `{}` is not a filesystem-safe identifier", spec.name),
            });
        }

        let tx = self.conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM skill_proposals WHERE name = ?1",
                params![spec.name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Err(LedgerError::InvalidInput {
                reason: format!("proposal name `{}` already exists (id {id})", spec.name),
            });
        }

        let input_schema = encode_json(&spec.input_schema, "input_schema")?;
        let output_schema = encode_json(&spec.output_schema, "output_schema")?;
        let required_secrets = encode_json(&spec.required_secrets, "required_secrets")?;
        let ts = now();
        tx.execute(
            "INSERT INTO skill_proposals
               (name, description, side_effect_class, input_schema, output_schema,
                required_secrets, status, spec_artifact_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                spec.name,
                spec.description,
                spec.side_effect_class.as_str(),
                input_schema,
                output_schema,
                required_secrets,
                SkillStatus::Proposed.as_str(),
                spec_artifact_id,
                ts,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn get_proposal(&self, id: ProposalId) -> Result<SkillProposal> {
        self.proposal_where("id = ?1", params![id])?
            .ok_or(LedgerError::UnknownEntity {
                entity: "proposal",
                id,
            })
    }

    pub fn find_proposal_by_name(&self, name: &str) -> Result<Option<SkillProposal>> {
        self.proposal_where("name = ?1", params![name])
    }

    fn proposal_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<SkillProposal>> {
        let sql = format!(
            "SELECT id, name, description, side_effect_class, input_schema, output_schema,
                    required_secrets, status, spec_artifact_id, created_at, updated_at
             FROM skill_proposals WHERE {clause}"
        );
        let row = self
            .conn
            .query_row(&sql, args, |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })
            .optional()?;

        row.map(|r| self.row_to_proposal(r)).transpose()
    }

    #[allow(clippy::type_complexity)]
    fn row_to_proposal(
        &self,
        r: (i64, String, String, String, String, String, String, String, i64, String, String),
    ) -> Result<SkillProposal> {
        let (id, name, description, sec, input_schema, output_schema, secrets, status, spec_artifact_id, created, updated) = r;
        Ok(SkillProposal {
            id,
            spec: SkillSpec {
                name,
                description,
                side_effect_class: SideEffectClass::parse(&sec).ok_or_else(|| {
                    LedgerError::Corrupt {
                        what: format!("proposal {id}: side_effect_class `{sec}`"),
                    }
                })?,
                input_schema: parse_json::<IoSchema>(&input_schema, "proposal input_schema")?,
                output_schema: parse_json::<IoSchema>(&output_schema, "proposal output_schema")?,
                required_secrets: parse_json(&secrets, "proposal required_secrets")?,
            },
            status: SkillStatus::parse(&status).ok_or_else(|| LedgerError::Corrupt {
                what: format!("proposal {id}: status `{status}`"),
            })?,
            spec_artifact_id,
            created_at: parse_ts(&created, "proposal")?,
            updated_at: parse_ts(&updated, "proposal")?,
        })
    }

    pub fn list_proposals(&self) -> Result<Vec<SkillProposal>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM skill_proposals ORDER BY name",
        )?;
        let ids: Vec<i64> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids.into_iter().map(|id| self.get_proposal(id)).collect()
    }

    pub fn query_status(&self, id: ProposalId) -> Result<SkillStatus> {
        Ok(self.get_proposal(id)?.status)
    }

    /// Application-level transition guard. The CHECK constraint only
    /// pins the value set; the path through the machine is enforced
    /// here.
    fn set_status(tx: &rusqlite::Transaction<'_>, id: ProposalId, from: SkillStatus, to: SkillStatus) -> Result<()> {
        if !from.may_advance_to(to) {
            return Err(LedgerError::InvalidTransition {
                reason: format!("proposal {id}: {from} -> {to}"),
            });
        }
        let n = tx.execute(
            "UPDATE skill_proposals SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_str(), now(), id, from.as_str()],
        )?;
        if n != 1 {
            return Err(LedgerError::ConcurrentModification {
                reason: format!("proposal {id} changed status under us"),
            });
        }
        Ok(())
    }

    // ---- builds -------------------------------------------------------

    /// Open a new build attempt. `parent_build_id` must reference the
    /// proposal's latest build (or be `None` for the first attempt); a
    /// stale parent means another writer got there first.
    pub fn open_build(
        &mut self,
        proposal_id: ProposalId,
        parent_build_id: Option<BuildId>,
        packet_artifact_id: Option<ArtifactId>,
    ) -> Result<BuildId> {
        let proposal = self.get_proposal(proposal_id)?;
        if !matches!(proposal.status, SkillStatus::Proposed | SkillStatus::Built) {
            return Err(LedgerError::InvalidTransition {
                reason: format!(
                    "proposal {proposal_id} is {}; builds open only from PROPOSED or BUILT",
                    proposal.status
                ),
            });
        }

        let tx = self.conn.transaction()?;
        let latest: Option<(i64, i64, String)> = tx
            .query_row(
                "SELECT id, attempt_number, outcome FROM builds
                 WHERE proposal_id = ?1 ORDER BY attempt_number DESC LIMIT 1",
                params![proposal_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let attempt_number = match &latest {
            None => {
                if let Some(parent) = parent_build_id {
                    return Err(LedgerError::ConcurrentModification {
                        reason: format!("parent build {parent} given but proposal {proposal_id} has no builds"),
                    });
                }
                1
            }
            Some((latest_id, latest_attempt, outcome)) => {
                if outcome == BuildOutcome::Pending.as_str() {
                    return Err(LedgerError::InvalidTransition {
                        reason: format!("proposal {proposal_id} already has build {latest_id} in flight"),
                    });
                }
                if parent_build_id != Some(*latest_id) {
                    return Err(LedgerError::ConcurrentModification {
                        reason: format!(
                            "parent build {:?} is stale; latest is {latest_id}",
                            parent_build_id
                        ),
                    });
                }
                latest_attempt + 1
            }
        };

        // A BUILT proposal re-entering the pipeline drops back to
        // PROPOSED; the only non-monotonic edge in the machine.
        if proposal.status == SkillStatus::Built {
            Self::set_status(&tx, proposal_id, SkillStatus::Built, SkillStatus::Proposed)?;
        }

        tx.execute(
            "INSERT INTO builds
               (proposal_id, parent_build_id, attempt_number, packet_artifact_id,
                outcome, changed_files, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6)",
            params![
                proposal_id,
                parent_build_id,
                attempt_number,
                packet_artifact_id,
                BuildOutcome::Pending.as_str(),
                now(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn record_build_result(&mut self, build_id: BuildId, result: &BuildResult) -> Result<()> {
        if result.outcome == BuildOutcome::Pending {
            return Err(LedgerError::InvalidInput {
                reason: "a build result must be SUCCEEDED or FAILED".to_string(),
            });
        }

        let build = self.get_build(build_id)?;
        if build.outcome != BuildOutcome::Pending {
            return Err(LedgerError::InvalidTransition {
                reason: format!("build {build_id} already recorded as {}", build.outcome.as_str()),
            });
        }

        let failure_facts = result
            .failure_facts
            .as_ref()
            .map(|f| encode_json(f, "failure_facts"))
            .transpose()?;
        let changed_files = encode_json(&result.changed_files, "changed_files")?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE builds SET outcome = ?1, log_artifact_id = ?2, failure_kind = ?3,
                               failure_facts = ?4, changed_files = ?5, finished_at = ?6
             WHERE id = ?7",
            params![
                result.outcome.as_str(),
                result.log_artifact_id,
                result.failure_kind.map(|k| k.as_str()),
                failure_facts,
                changed_files,
                now(),
                build_id,
            ],
        )?;

        if result.outcome == BuildOutcome::Succeeded {
            Self::set_status(&tx, build.proposal_id, SkillStatus::Proposed, SkillStatus::Built)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_build(&self, id: BuildId) -> Result<BuildAttempt> {
        let row = self
            .conn
            .query_row(
                "SELECT id, proposal_id, parent_build_id, attempt_number, packet_artifact_id,
                        log_artifact_id, outcome, failure_kind, failure_facts, changed_files,
                        created_at, finished_at
                 FROM builds WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<String>>(11)?,
                    ))
                },
            )
            .optional()?
            .ok_or(LedgerError::UnknownEntity { entity: "build", id })?;

        let (id, proposal_id, parent, attempt, packet, log, outcome, fkind, facts, changed, created, finished) = row;
        Ok(BuildAttempt {
            id,
            proposal_id,
            parent_build_id: parent,
            attempt_number: attempt as u32,
            packet_artifact_id: packet,
            log_artifact_id: log,
            outcome: BuildOutcome::parse(&outcome).ok_or_else(|| LedgerError::Corrupt {
                what: format!("build {id}: outcome `{outcome}`"),
            })?,
            failure_kind: fkind
                .map(|k| {
                    FailureKind::parse(&k).ok_or_else(|| LedgerError::Corrupt {
                        what: format!("build {id}: failure_kind `{k}`"),
                    })
                })
                .transpose()?,
            failure_facts: facts.map(|f| parse_json(&f, "build failure_facts")).transpose()?,
            changed_files: parse_json(&changed, "build changed_files")?,
            created_at: parse_ts(&created, "build")?,
            finished_at: finished.map(|t| parse_ts(&t, "build")).transpose()?,
        })
    }

    pub fn latest_build(&self, proposal_id: ProposalId) -> Result<Option<BuildAttempt>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM builds WHERE proposal_id = ?1 ORDER BY attempt_number DESC LIMIT 1",
                params![proposal_id],
                |row| row.get(0),
            )
            .optional()?;
        id.map(|id| self.get_build(id)).transpose()
    }

    pub fn list_builds(&self, proposal_id: ProposalId) -> Result<Vec<BuildAttempt>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM builds WHERE proposal_id = ?1 ORDER BY attempt_number",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![proposal_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids.into_iter().map(|id| self.get_build(id)).collect()
    }

    /// Number of trailing consecutive FAILED attempts. Input to the
    /// `REPEATED_FAILURE` escalation trigger.
    pub fn consecutive_failures(&self, proposal_id: ProposalId) -> Result<u32> {
        let builds = self.list_builds(proposal_id)?;
        let mut n = 0;
        for b in builds.iter().rev() {
            match b.outcome {
                BuildOutcome::Failed => n += 1,
                BuildOutcome::Pending => continue,
                BuildOutcome::Succeeded => break,
            }
        }
        Ok(n)
    }

    // ---- verifications ------------------------------------------------

    /// Record the verification of a build. Exactly once per build; the
    /// UNIQUE constraint is the backstop, the guard is the contract.
    pub fn record_verification(
        &mut self,
        build_id: BuildId,
        gates: GateResults,
        report_artifact_id: Option<ArtifactId>,
    ) -> Result<VerificationRecord> {
        let build = self.get_build(build_id)?;
        if build.outcome != BuildOutcome::Succeeded {
            return Err(LedgerError::InvalidTransition {
                reason: format!(
                    "build {build_id} is {}; only a completed build can be verified",
                    build.outcome.as_str()
                ),
            });
        }
        if self.get_verification(build_id)?.is_some() {
            return Err(LedgerError::InvalidTransition {
                reason: format!("build {build_id} already has a verification record"),
            });
        }

        let all_ok = gates.all_ok();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO verifications
               (build_id, ruff_ok, mypy_ok, pytest_ok, policy_ok, invariants_ok,
                all_ok, report_artifact_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                build_id,
                gates.ruff,
                gates.mypy,
                gates.pytest,
                gates.policy,
                gates.invariants,
                all_ok,
                report_artifact_id,
                now(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        if all_ok {
            Self::set_status(&tx, build.proposal_id, SkillStatus::Built, SkillStatus::Verified)?;
        }
        tx.commit()?;

        Ok(VerificationRecord {
            id,
            build_id,
            gates,
            all_ok,
            report_artifact_id,
            created_at: Utc::now(),
        })
    }

    pub fn get_verification(&self, build_id: BuildId) -> Result<Option<VerificationRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, build_id, ruff_ok, mypy_ok, pytest_ok, policy_ok, invariants_ok,
                        all_ok, report_artifact_id, created_at
                 FROM verifications WHERE build_id = ?1",
                params![build_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, bool>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;

        row.map(|r| {
            let (id, build_id, ruff, mypy, pytest, policy, invariants, all_ok, report, created) = r;
            Ok(VerificationRecord {
                id,
                build_id,
                gates: GateResults {
                    ruff,
                    mypy,
                    pytest,
                    policy,
                    invariants,
                },
                all_ok,
                report_artifact_id: report,
                created_at: parse_ts(&created, "verification")?,
            })
        })
        .transpose()
    }

    // ---- promotions ---------------------------------------------------

    /// Promote a VERIFIED proposal to TRUSTED, recording the approver
    /// identity (caller-supplied string; no local authentication) and
    /// the skill source hash at promotion time.
    pub fn record_promotion(
        &mut self,
        proposal_id: ProposalId,
        approver: &str,
        source_hash: &str,
    ) -> Result<PromotionId> {
        let proposal = self.get_proposal(proposal_id)?;
        if proposal.status != SkillStatus::Verified {
            return Err(LedgerError::InvalidTransition {
                reason: format!(
                    "proposal {proposal_id} is {}; promotion requires VERIFIED",
                    proposal.status
                ),
            });
        }

        let tx = self.conn.transaction()?;
        let prior: Option<i64> = tx
            .query_row(
                "SELECT id FROM promotions WHERE proposal_id = ?1 ORDER BY id DESC LIMIT 1",
                params![proposal_id],
                |row| row.get(0),
            )
            .optional()?;
        tx.execute(
            "INSERT INTO promotions
               (proposal_id, approver, source_hash, prior_promotion_id, revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![proposal_id, approver, source_hash, prior, now()],
        )?;
        let id = tx.last_insert_rowid();
        Self::set_status(&tx, proposal_id, SkillStatus::Verified, SkillStatus::Trusted)?;
        tx.commit()?;
        Ok(id)
    }

    /// Demote by appending a revocation record; promotions are never
    /// edited in place.
    pub fn record_revocation(&mut self, proposal_id: ProposalId, approver: &str) -> Result<PromotionId> {
        let latest = self
            .latest_promotion(proposal_id)?
            .ok_or(LedgerError::UnknownEntity {
                entity: "promotion for proposal",
                id: proposal_id,
            })?;
        if latest.revoked {
            return Err(LedgerError::InvalidTransition {
                reason: format!("proposal {proposal_id} promotion already revoked"),
            });
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO promotions
               (proposal_id, approver, source_hash, prior_promotion_id, revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![proposal_id, approver, latest.source_hash, latest.id, now()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn latest_promotion(&self, proposal_id: ProposalId) -> Result<Option<PromotionRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, proposal_id, approver, source_hash, prior_promotion_id, revoked, created_at
                 FROM promotions WHERE proposal_id = ?1 ORDER BY id DESC LIMIT 1",
                params![proposal_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|r| {
            let (id, proposal_id, approver, source_hash, prior, revoked, created) = r;
            Ok(PromotionRecord {
                id,
                proposal_id,
                approver,
                source_hash,
                prior_promotion_id: prior,
                revoked,
                created_at: parse_ts(&created, "promotion")?,
            })
        })
        .transpose()
    }

    /// TRUSTED proposals whose current promotion stands, joined for the
    /// registry view. Ordered by name for stable registry output.
    pub fn trusted_skills(&self) -> Result<Vec<TrustedSkill>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id FROM skill_proposals p WHERE p.status = ?1 ORDER BY p.name",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![SkillStatus::Trusted.as_str()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut out = Vec::new();
        for id in ids {
            let proposal = self.get_proposal(id)?;
            let Some(promotion) = self.latest_promotion(id)? else {
                continue;
            };
            if promotion.revoked {
                continue;
            }
            out.push(TrustedSkill {
                proposal_id: id,
                name: proposal.spec.name,
                side_effect_class: proposal.spec.side_effect_class,
                required_secrets: proposal.spec.required_secrets,
                source_hash: promotion.source_hash,
            });
        }
        Ok(out)
    }
}
