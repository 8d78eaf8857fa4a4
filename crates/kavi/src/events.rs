//! Append-only JSONL lifecycle event log.
//!
//! Every forge operation leaves a typed event behind; the log is the
//! replayable audit trail next to the ledger's authoritative state.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kavi_types::{BuildId, BuildOutcome, ProposalId, TriggerSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    ProposalCreated {
        proposal_id: ProposalId,
        name: String,
    },
    BuildOpened {
        proposal_id: ProposalId,
        build_id: BuildId,
        attempt_number: u32,
    },
    GateViolated {
        build_id: BuildId,
        offending_paths: Vec<String>,
    },
    BuildCompleted {
        build_id: BuildId,
        outcome: BuildOutcome,
    },
    VerificationRecorded {
        build_id: BuildId,
        all_ok: bool,
    },
    RetryPrepared {
        proposal_id: ProposalId,
        triggers: TriggerSet,
        advisory_used: bool,
    },
    Promoted {
        proposal_id: ProposalId,
        name: String,
        source_hash: String,
    },
    PromotionRevoked {
        proposal_id: ProposalId,
        name: String,
    },
    TrustRejected {
        name: String,
        expected: String,
        actual: String,
    },
    RunCompleted {
        name: String,
        ok: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgeEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ForgeEvent {
    pub fn now(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// Append one event to the log file, creating it (and its parent
/// directory) as needed.
pub fn append(path: &Path, event: &ForgeEvent) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create events dir {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);

    let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
    writeln!(writer, "{}", line).context("failed to write event line")?;
    writer.flush().context("failed to flush events file")?;
    Ok(())
}

/// Read the whole event log. A missing file is an empty log.
pub fn read_all(path: &Path) -> Result<Vec<ForgeEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file =
        File::open(path).with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line =
            line.with_context(|| format!("failed to read line from events file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: ForgeEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
        events.push(event);
    }
    Ok(events)
}
