//! Path convention for kavi skills.
//!
//! Every subsystem that needs to know where a skill lives — packet
//! framing, the diff gate, the verification battery, promotion — asks
//! this crate. Paths are repo-relative with forward slashes, matching
//! what `git diff --name-only` prints, so set comparisons against git
//! output need no normalization.

use std::path::PathBuf;

/// Repo-relative locations derived from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConvention {
    /// Directory holding skill sources, e.g. `skills`.
    pub skill_root: String,
    /// Directory holding skill tests, e.g. `tests`.
    pub test_root: String,
    /// Python package prefix for module references, e.g. `skills`.
    pub skill_package: String,
    /// Directory holding the runtime support modules the optional
    /// allowlist rows point at, e.g. `kavi_runtime`.
    pub runtime_root: String,
}

impl Default for PathConvention {
    fn default() -> Self {
        Self {
            skill_root: "skills".to_string(),
            test_root: "tests".to_string(),
            skill_package: "skills".to_string(),
            runtime_root: "kavi_runtime".to_string(),
        }
    }
}

/// The fixed set of paths a build may create or modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allowlist {
    /// Must both exist in the build result.
    pub required: Vec<String>,
    /// May be touched; subject to the runtime import boundary.
    pub optional: Vec<String>,
}

impl Allowlist {
    /// Whether `path` (repo-relative, forward slashes) is allowlisted.
    pub fn permits(&self, path: &str) -> bool {
        self.required.iter().any(|p| p == path) || self.optional.iter().any(|p| p == path)
    }

    pub fn is_optional(&self, path: &str) -> bool {
        self.optional.iter().any(|p| p == path)
    }

    /// Required paths absent from `present`.
    pub fn missing_required<'a>(&'a self, present: &[String]) -> Vec<&'a str> {
        self.required
            .iter()
            .filter(|p| !present.iter().any(|q| q == *p))
            .map(|p| p.as_str())
            .collect()
    }

    /// Paths in `present` that fall outside the allowlist.
    pub fn violations(&self, present: &[String]) -> Vec<String> {
        let mut out: Vec<String> = present
            .iter()
            .filter(|p| !self.permits(p))
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

impl PathConvention {
    /// Repo-relative path of the skill source file.
    pub fn skill_path(&self, name: &str) -> String {
        format!("{}/{}.py", self.skill_root, name)
    }

    /// Repo-relative path of the skill test file.
    pub fn test_path(&self, name: &str) -> String {
        format!("{}/test_skill_{}.py", self.test_root, name)
    }

    /// Module reference used by the runtime loader.
    pub fn module_ref(&self, name: &str) -> String {
        format!("{}.{}", self.skill_package, name)
    }

    /// The runtime support module builds may optionally touch.
    pub fn runtime_client_path(&self) -> String {
        format!("{}/llm_client.py", self.runtime_root)
    }

    pub fn runtime_config_path(&self) -> String {
        format!("{}/config.py", self.runtime_root)
    }

    pub fn runtime_client_test_path(&self) -> String {
        format!("{}/test_llm_client.py", self.test_root)
    }

    /// The diff allowlist for one skill: two required rows, three
    /// enumerated optional rows.
    pub fn allowlist(&self, name: &str) -> Allowlist {
        Allowlist {
            required: vec![self.skill_path(name), self.test_path(name)],
            optional: vec![
                self.runtime_client_path(),
                self.runtime_config_path(),
                self.runtime_client_test_path(),
            ],
        }
    }

    /// Absolute path of the skill source under a project root.
    pub fn skill_path_under(&self, project_root: &std::path::Path, name: &str) -> PathBuf {
        project_root.join(self.skill_root.as_str()).join(format!("{name}.py"))
    }

    pub fn test_path_under(&self, project_root: &std::path::Path, name: &str) -> PathBuf {
        project_root
            .join(self.test_root.as_str())
            .join(format!("test_skill_{name}.py"))
    }
}
