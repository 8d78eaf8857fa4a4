//! The TRUSTED registry and load-time trust verification.
//!
//! The registry is the human-readable derived view of TRUSTED skills:
//! a TOML file under the data root, rewritten atomically on every
//! promotion. The ledger stays the arbiter on disagreement, but the
//! runtime loader consults this file. Trust verification re-hashes the
//! skill source and compares it to the hash recorded at promotion; a
//! mismatch refuses execution before any skill code is touched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use kavi_store::hash_file;
use kavi_types::{RegistryEntry, SideEffectClass};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime hash mismatch (or unreadable source). Fatal: the skill will
/// not run.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("skill `{name}` is not in the registry")]
    NotRegistered { name: String },
    #[error("skill `{name}` failed trust verification: expected {expected}, found {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("skill `{name}` source unreadable at {path}")]
    SourceUnreadable { name: String, path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    module: String,
    side_effect_class: SideEffectClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    #[serde(default)]
    required_secrets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    skills: BTreeMap<String, FileEntry>,
}

/// Write the full registry atomically (temporary sibling, then
/// rename). Readers only ever observe a complete file.
pub fn write_atomic(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let file = RegistryFile {
        skills: entries
            .iter()
            .map(|e| {
                (
                    e.name.clone(),
                    FileEntry {
                        module: e.module.clone(),
                        side_effect_class: e.side_effect_class,
                        hash: e.hash.clone(),
                        required_secrets: e.required_secrets.clone(),
                    },
                )
            })
            .collect(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create registry dir {}", parent.display()))?;
    }

    let text = toml::to_string_pretty(&file).context("failed to serialize registry")?;
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp registry {}", tmp.display()))?;
        f.write_all(text.as_bytes())
            .with_context(|| format!("failed to write tmp registry {}", tmp.display()))?;
        f.sync_all().ok();
    }
    fs::rename(&tmp, path).with_context(|| {
        format!("failed to rename tmp registry {} to {}", tmp.display(), path.display())
    })?;
    Ok(())
}

/// Load all registry entries, name-ordered. A missing file is an empty
/// registry.
pub fn load(path: &Path) -> Result<Vec<RegistryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read registry {}", path.display()))?;
    let file: RegistryFile = toml::from_str(&text)
        .with_context(|| format!("failed to parse registry {}", path.display()))?;

    Ok(file
        .skills
        .into_iter()
        .map(|(name, e)| RegistryEntry {
            name,
            module: e.module,
            side_effect_class: e.side_effect_class,
            hash: e.hash,
            required_secrets: e.required_secrets,
        })
        .collect())
}

pub fn lookup(path: &Path, name: &str) -> Result<Option<RegistryEntry>> {
    Ok(load(path)?.into_iter().find(|e| e.name == name))
}

/// Outcome of trust verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustVerification {
    /// SHA-256 of the source as it is on disk right now.
    pub hash: String,
    /// False only for legacy entries that carry no recorded hash; the
    /// caller is expected to warn.
    pub verified: bool,
}

/// Re-hash the skill source and compare against the promoted hash.
pub fn verify_trust(entry: &RegistryEntry, source_path: &Path) -> Result<TrustVerification, TrustError> {
    let actual = hash_file(source_path).map_err(|_| TrustError::SourceUnreadable {
        name: entry.name.clone(),
        path: source_path.display().to_string(),
    })?;

    match &entry.hash {
        None => Ok(TrustVerification {
            hash: actual,
            verified: false,
        }),
        Some(expected) if *expected == actual => Ok(TrustVerification {
            hash: actual,
            verified: true,
        }),
        Some(expected) => Err(TrustError::HashMismatch {
            name: entry.name.clone(),
            expected: expected.clone(),
            actual,
        }),
    }
}
