//! Configuration file support for the forge (`.kavi.toml`).
//!
//! Every section has working defaults; a missing file is the default
//! configuration. Durations accept either a humantime string
//! (`"10m"`) or a millisecond integer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kavi_paths::PathConvention;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const CONFIG_FILE: &str = ".kavi.toml";

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Filesystem roots. Relative paths resolve against the project root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    /// Canonical working tree the forge governs.
    pub project: PathBuf,
    /// Data root: ledger database, blob store, registry, event log.
    pub data: PathBuf,
    /// Scratch root for sandbox workspaces.
    pub scratch: PathBuf,
    /// Skill sources, relative to the project root.
    pub skills: String,
    /// Skill tests, relative to the project root.
    pub tests: String,
    /// Python package prefix for module references.
    pub skill_package: String,
    /// Runtime support modules (the optional allowlist rows).
    pub runtime: String,
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            project: PathBuf::from("."),
            data: PathBuf::from(".kavi"),
            scratch: std::env::temp_dir(),
            skills: "skills".to_string(),
            tests: "tests".to_string(),
            skill_package: "skills".to_string(),
            runtime: "kavi_runtime".to_string(),
        }
    }
}

/// The external build worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    /// Fixed argument list enabling exactly the allowed capabilities.
    /// No general-purpose shell tool is ever enabled here.
    pub args: Vec<String>,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "kavi-worker".to_string(),
            args: vec!["--tools".to_string(), "read,write,edit".to_string()],
            timeout: Duration::from_secs(600),
        }
    }
}

/// Verification tool programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ruff: String,
    pub mypy: String,
    pub pytest: String,
    pub python: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    /// Optional override for the policy rules file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_rules: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ruff: "ruff".to_string(),
            mypy: "mypy".to_string(),
            pytest: "pytest".to_string(),
            python: "python3".to_string(),
            timeout: Duration::from_secs(120),
            policy_rules: None,
        }
    }
}

/// LLM gateway connection for the retry advisory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    /// Advisory prompts are truncated to this many characters.
    pub max_prompt_chars: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            model: "advisor".to_string(),
            timeout: Duration::from_secs(30),
            max_prompt_chars: 16_000,
        }
    }
}

impl GatewaySection {
    /// Resolve the effective URL and key; environment wins over file.
    pub fn resolved_base_url(&self) -> String {
        std::env::var("KAVI_GATEWAY_URL").unwrap_or_else(|_| self.base_url.clone())
    }

    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var("KAVI_GATEWAY_KEY").ok()
    }
}

/// Escalation-trigger knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Keywords whose first appearance in a proposed packet counts as
    /// permission widening. The built-in list is deliberately
    /// conservative; deployments are expected to tune it.
    pub keywords: Vec<String>,
    /// Line-delta ratio above which a proposed packet is a large diff.
    pub large_diff_ratio: f64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            keywords: kavi_classify::default_keywords(),
            large_diff_ratio: 0.5,
        }
    }
}

/// Sandbox workspace retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Keep failed workspaces for debugging.
    pub retain_failed: bool,
    /// Prune oldest retained workspaces beyond this count.
    pub max_retained: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            retain_failed: true,
            max_retained: 5,
        }
    }
}

/// The whole forge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub roots: RootsConfig,
    pub worker: WorkerConfig,
    pub tools: ToolsConfig,
    pub gateway: GatewaySection,
    pub escalation: EscalationConfig,
    pub sandbox: SandboxConfig,
}

impl ForgeConfig {
    /// Load `.kavi.toml` from the project root, falling back to
    /// defaults when absent. The project root itself is recorded in
    /// the returned configuration.
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let path = project_root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        } else {
            Self::default()
        };
        config.roots.project = project_root.to_path_buf();
        Ok(config)
    }

    pub fn project_root(&self) -> &Path {
        &self.roots.project
    }

    fn under_project(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.roots.project.join(p)
        }
    }

    pub fn data_root(&self) -> PathBuf {
        self.under_project(&self.roots.data)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_root().join("ledger.db")
    }

    pub fn blob_root(&self) -> PathBuf {
        self.data_root().join("blobs")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root().join("registry.toml")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_root().join("events.jsonl")
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.under_project(&self.roots.scratch)
    }

    pub fn path_convention(&self) -> PathConvention {
        PathConvention {
            skill_root: self.roots.skills.clone(),
            test_root: self.roots.tests.clone(),
            skill_package: self.roots.skill_package.clone(),
            runtime_root: self.roots.runtime.clone(),
        }
    }
}
