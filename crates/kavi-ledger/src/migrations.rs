//! Schema migrations.
//!
//! The schema version starts at 1 and advances in single steps; a
//! marker row in `schema_version` records each applied version, which
//! makes every step idempotent across re-opens. SQLite cannot widen a
//! CHECK constraint in place, so a widening migration recreates the
//! affected table (create new, copy rows, drop old, rename) with
//! foreign-key enforcement suspended for the swap.

use chrono::Utc;
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// v1: the full table set, with the enum value sets as originally
/// shipped (no SECRET_READ side-effect class, no PATCH_SUMMARY/NOTE
/// artifact kinds).
const V1_DDL: &str = "
CREATE TABLE IF NOT EXISTS artifacts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN
    ('SKILL_SPEC','BUILD_PACKET','BUILD_LOG','VERIFICATION_REPORT','RESEARCH_NOTE')),
  size INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (hash, kind)
);

CREATE TABLE IF NOT EXISTS skill_proposals (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL,
  side_effect_class TEXT NOT NULL CHECK (side_effect_class IN
    ('READ_ONLY','FILE_WRITE','NETWORK')),
  input_schema TEXT NOT NULL,
  output_schema TEXT NOT NULL,
  required_secrets TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('PROPOSED','BUILT','VERIFIED','TRUSTED')),
  spec_artifact_id INTEGER NOT NULL REFERENCES artifacts(id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS builds (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  proposal_id INTEGER NOT NULL REFERENCES skill_proposals(id),
  parent_build_id INTEGER REFERENCES builds(id),
  attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
  packet_artifact_id INTEGER REFERENCES artifacts(id),
  log_artifact_id INTEGER REFERENCES artifacts(id),
  outcome TEXT NOT NULL CHECK (outcome IN ('PENDING','SUCCEEDED','FAILED')),
  failure_kind TEXT,
  failure_facts TEXT,
  changed_files TEXT NOT NULL DEFAULT '[]',
  created_at TEXT NOT NULL,
  finished_at TEXT,
  UNIQUE (proposal_id, attempt_number)
);

CREATE TABLE IF NOT EXISTS verifications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  build_id INTEGER NOT NULL UNIQUE REFERENCES builds(id),
  ruff_ok INTEGER NOT NULL,
  mypy_ok INTEGER NOT NULL,
  pytest_ok INTEGER NOT NULL,
  policy_ok INTEGER NOT NULL,
  invariants_ok INTEGER NOT NULL,
  all_ok INTEGER NOT NULL,
  report_artifact_id INTEGER REFERENCES artifacts(id),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS promotions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  proposal_id INTEGER NOT NULL REFERENCES skill_proposals(id),
  approver TEXT NOT NULL,
  source_hash TEXT NOT NULL,
  prior_promotion_id INTEGER REFERENCES promotions(id),
  revoked INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);
";

/// v2: widen `side_effect_class` with SECRET_READ and artifact `kind`
/// with PATCH_SUMMARY and NOTE. Both are recreate-copy-swap.
const V2_SWAP: &str = "
CREATE TABLE artifacts_new (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  hash TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN
    ('SKILL_SPEC','BUILD_PACKET','BUILD_LOG','VERIFICATION_REPORT','RESEARCH_NOTE',
     'PATCH_SUMMARY','NOTE')),
  size INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (hash, kind)
);
INSERT INTO artifacts_new (id, hash, kind, size, created_at)
  SELECT id, hash, kind, size, created_at FROM artifacts;
DROP TABLE artifacts;
ALTER TABLE artifacts_new RENAME TO artifacts;

CREATE TABLE skill_proposals_new (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  description TEXT NOT NULL,
  side_effect_class TEXT NOT NULL CHECK (side_effect_class IN
    ('READ_ONLY','FILE_WRITE','NETWORK','SECRET_READ')),
  input_schema TEXT NOT NULL,
  output_schema TEXT NOT NULL,
  required_secrets TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('PROPOSED','BUILT','VERIFIED','TRUSTED')),
  spec_artifact_id INTEGER NOT NULL REFERENCES artifacts(id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
INSERT INTO skill_proposals_new
  SELECT id, name, description, side_effect_class, input_schema, output_schema,
         required_secrets, status, spec_artifact_id, created_at, updated_at
  FROM skill_proposals;
DROP TABLE skill_proposals;
ALTER TABLE skill_proposals_new RENAME TO skill_proposals;
";

pub(crate) fn applied_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
           version INTEGER PRIMARY KEY,
           applied_at TEXT NOT NULL
         );",
    )?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .map(|v| v as u32)
}

fn mark(tx: &rusqlite::Transaction<'_>, version: u32) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![version, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub(crate) fn apply(conn: &mut Connection) -> rusqlite::Result<()> {
    loop {
        let version = applied_version(conn)?;
        if version >= CURRENT_SCHEMA_VERSION {
            return Ok(());
        }
        match version + 1 {
            1 => {
                let tx = conn.transaction()?;
                tx.execute_batch(V1_DDL)?;
                mark(&tx, 1)?;
                tx.commit()?;
            }
            2 => {
                // The swap drops tables that other tables reference;
                // enforcement has to pause for the duration. PRAGMAs do
                // not take effect inside a transaction, so bracket it.
                conn.pragma_update(None, "foreign_keys", "OFF")?;
                let swap = (|| -> rusqlite::Result<()> {
                    let tx = conn.transaction()?;
                    tx.execute_batch(V2_SWAP)?;
                    mark(&tx, 2)?;
                    tx.commit()
                })();
                conn.pragma_update(None, "foreign_keys", "ON")?;
                swap?;
            }
            // applied_version < CURRENT_SCHEMA_VERSION and versions
            // advance one step at a time, so no other step exists.
            _ => unreachable!("no migration step beyond v{CURRENT_SCHEMA_VERSION}"),
        }
    }
}
