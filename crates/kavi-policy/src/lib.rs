//! Policy scanning for skill sources.
//!
//! Rules are declarative: a TOML file of `[[rule]]` entries, each a
//! regex or a structural environment-leak check, grouped into three
//! fixed categories (forbidden modules, dynamic code evaluation, secret
//! leaks). All categories are unconditional denials; the gate is ok iff
//! the violation list is empty.
//!
//! The secret-leak check is best-effort by design: it matches printing
//! or logging of process-environment lookups on a single line,
//! including f-string interpolation, and does not follow variables
//! across assignments.

use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy rules {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse policy rules: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rule `{id}` has an invalid pattern: {source}")]
    BadPattern {
        id: String,
        #[source]
        source: regex::Error,
    },
    #[error("rule `{id}` of kind `regex` is missing a pattern")]
    MissingPattern { id: String },
}

/// The three fixed policy categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    ForbiddenModule,
    DynamicEval,
    SecretLeak,
}

/// Matching mechanism of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Line regex; comment lines are not scanned.
    Regex,
    /// Structural print/log-of-environment check.
    EnvLeak,
}

/// One declarative rule as written in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub category: RuleCategory,
    pub kind: RuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RulesFile {
    #[serde(default, rename = "rule")]
    rules: Vec<Rule>,
}

/// One finding: which rule fired, where, and the offending line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub rule: String,
    pub category: RuleCategory,
    /// 1-based line number.
    pub line: usize,
    pub excerpt: String,
    pub message: String,
}

impl Violation {
    /// Stable one-line rendering used in reports and failure facts.
    pub fn describe(&self) -> String {
        format!("{} (line {}): {}", self.message, self.line, self.excerpt)
    }
}

enum Matcher {
    Regex(Regex),
    EnvLeak,
}

struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

/// A compiled, ready-to-scan rule set.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

const BUILTIN_RULES: &str = r#"
# Forbidden modules: process spawning, system shells, dynamic import.
[[rule]]
id = "no-subprocess"
category = "forbidden_module"
kind = "regex"
pattern = '^\s*(?:import|from)\s+subprocess\b'
message = "import of process-spawning module `subprocess`"

[[rule]]
id = "no-pty"
category = "forbidden_module"
kind = "regex"
pattern = '^\s*(?:import|from)\s+pty\b'
message = "import of terminal-control module `pty`"

[[rule]]
id = "no-commands"
category = "forbidden_module"
kind = "regex"
pattern = '^\s*(?:import|from)\s+(?:commands|popen2)\b'
message = "import of legacy shell module"

[[rule]]
id = "no-importlib"
category = "forbidden_module"
kind = "regex"
pattern = '^\s*(?:import|from)\s+importlib\b'
message = "import of dynamic-import module `importlib`"

[[rule]]
id = "no-os-shell"
category = "forbidden_module"
kind = "regex"
pattern = '\bos\.(?:system|popen|exec\w*|spawn\w*)\s*\('
message = "os-level shell or process call"

# Dynamic code evaluation.
[[rule]]
id = "no-eval"
category = "dynamic_eval"
kind = "regex"
pattern = '(?:^|[^\w.])eval\s*\('
message = "dynamic evaluation via `eval`"

[[rule]]
id = "no-exec"
category = "dynamic_eval"
kind = "regex"
pattern = '(?:^|[^\w.])exec\s*\('
message = "dynamic evaluation via `exec`"

[[rule]]
id = "no-compile"
category = "dynamic_eval"
kind = "regex"
pattern = '(?:^|[^\w.])compile\s*\('
message = "dynamic compilation via `compile`"

[[rule]]
id = "no-dunder-import"
category = "dynamic_eval"
kind = "regex"
pattern = '__import__\s*\('
message = "dynamic import via `__import__`"

# Secret leaks (best-effort, single-line shapes only).
[[rule]]
id = "no-env-leak"
category = "secret_leak"
kind = "env_leak"
message = "environment value printed or logged"
"#;

// Shapes for the env-leak check: a print/log call on the same line as
// a process-environment lookup. f-strings land here too, since the
// lookup text appears inside the call's argument span.
fn sink_re() -> Regex {
    Regex::new(r"\bprint\s*\(|\blogging\.\w+\s*\(|\blogger\.\w+\s*\(|\blog\.\w+\s*\(")
        .expect("static regex compiles")
}

fn env_lookup_re() -> Regex {
    Regex::new(r"os\.environ\b|os\.getenv\s*\(|\benviron\s*\[")
        .expect("static regex compiles")
}

impl RuleSet {
    /// The built-in rule set, used when no rules file is configured.
    pub fn builtin() -> Self {
        Self::from_toml(BUILTIN_RULES).expect("builtin rules always compile")
    }

    /// Parse and compile a rules file's contents.
    pub fn from_toml(text: &str) -> Result<Self, PolicyError> {
        let file: RulesFile = toml::from_str(text)?;
        let mut rules = Vec::with_capacity(file.rules.len());
        for rule in file.rules {
            let matcher = match rule.kind {
                RuleKind::Regex => {
                    let pattern = rule.pattern.as_deref().ok_or_else(|| {
                        PolicyError::MissingPattern { id: rule.id.clone() }
                    })?;
                    Matcher::Regex(Regex::new(pattern).map_err(|source| PolicyError::BadPattern {
                        id: rule.id.clone(),
                        source,
                    })?)
                }
                RuleKind::EnvLeak => Matcher::EnvLeak,
            };
            rules.push(CompiledRule { rule, matcher });
        }
        Ok(Self { rules })
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let text = fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Scan a skill source. Returns every violation, in line order.
    pub fn scan(&self, source: &str) -> Vec<Violation> {
        let sink = sink_re();
        let env = env_lookup_re();
        let mut out = Vec::new();

        for (idx, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.starts_with('#') {
                continue;
            }
            for compiled in &self.rules {
                let hit = match &compiled.matcher {
                    Matcher::Regex(re) => re.is_match(raw),
                    Matcher::EnvLeak => sink.is_match(raw) && env.is_match(raw),
                };
                if hit {
                    out.push(Violation {
                        rule: compiled.rule.id.clone(),
                        category: compiled.rule.category,
                        line: idx + 1,
                        excerpt: excerpt(line),
                        message: compiled.rule.message.clone(),
                    });
                }
            }
        }
        out
    }
}

fn excerpt(line: &str) -> String {
    const MAX: usize = 120;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let cut = line
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…", &line[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Violation> {
        RuleSet::builtin().scan(source)
    }

    #[test]
    fn clean_skill_has_no_violations() {
        let source = r#"
import json
from pathlib import Path


class WriteNote:
    name = "write_note"

    def run(self, title: str, body: str) -> dict:
        path = Path("notes") / f"{title}.md"
        path.write_text(body)
        return {"path": str(path)}
"#;
        assert!(scan(source).is_empty());
    }

    #[test]
    fn subprocess_import_is_flagged() {
        for line in [
            "import subprocess",
            "from subprocess import run",
            "  import subprocess  # helper",
        ] {
            let hits = scan(line);
            assert_eq!(hits.len(), 1, "{line}");
            assert_eq!(hits[0].rule, "no-subprocess");
            assert_eq!(hits[0].category, RuleCategory::ForbiddenModule);
        }
    }

    #[test]
    fn commented_out_import_is_not_flagged() {
        assert!(scan("# import subprocess").is_empty());
    }

    #[test]
    fn os_shell_calls_are_flagged() {
        for line in [
            "os.system('ls')",
            "out = os.popen('whoami').read()",
            "os.execvp('sh', ['sh'])",
            "os.spawnl(os.P_WAIT, '/bin/ls')",
        ] {
            assert_eq!(scan(line).len(), 1, "{line}");
        }
    }

    #[test]
    fn dynamic_eval_shapes_are_flagged() {
        for (line, rule) in [
            ("eval(user_input)", "no-eval"),
            ("exec(code)", "no-exec"),
            ("compile(src, '<s>', 'exec')", "no-compile"),
            ("mod = __import__('os')", "no-dunder-import"),
        ] {
            let hits = scan(line);
            assert!(hits.iter().any(|v| v.rule == rule), "{line}: {hits:?}");
        }
    }

    #[test]
    fn method_named_eval_is_not_flagged() {
        // `model.eval(` is an attribute call, not builtin eval.
        assert!(scan("model.eval()").is_empty());
        assert!(scan("self.compile_templates()").is_empty());
    }

    #[test]
    fn importlib_is_a_forbidden_module() {
        let hits = scan("from importlib import import_module");
        assert_eq!(hits[0].rule, "no-importlib");
    }

    #[test]
    fn env_leak_print_shapes_are_flagged() {
        for line in [
            "print(os.environ['API_KEY'])",
            "print(os.getenv('TOKEN'))",
            "print(f\"key={os.environ['API_KEY']}\")",
            "logging.info('token: %s', os.getenv('TOKEN'))",
            "logger.debug(f\"cred {os.environ.get('SECRET')}\")",
        ] {
            let hits = scan(line);
            assert!(
                hits.iter().any(|v| v.category == RuleCategory::SecretLeak),
                "{line}: {hits:?}"
            );
        }
    }

    #[test]
    fn env_read_without_sink_is_allowed() {
        // Reading the environment is the SECRET_READ class's business;
        // only printing/logging it is a policy violation.
        assert!(scan("token = os.environ['API_KEY']").is_empty());
        assert!(scan("print('starting up')").is_empty());
    }

    #[test]
    fn env_leak_cannot_follow_assignments() {
        // Documented limitation: the value escapes through a variable.
        let source = "token = os.environ['API_KEY']\nprint(token)\n";
        assert!(scan(source).is_empty());
    }

    #[test]
    fn violations_carry_line_numbers_and_excerpts() {
        let source = "import json\nimport subprocess\n";
        let hits = scan(source);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 2);
        assert_eq!(hits[0].excerpt, "import subprocess");
        assert!(hits[0].describe().contains("line 2"));
    }

    #[test]
    fn long_excerpts_are_truncated() {
        let long = format!("os.system('{}')", "x".repeat(300));
        let hits = scan(&long);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].excerpt.chars().count() <= 121);
        assert!(hits[0].excerpt.ends_with('…'));
    }

    #[test]
    fn custom_rules_file_roundtrips() {
        let toml_text = r#"
[[rule]]
id = "no-requests"
category = "forbidden_module"
kind = "regex"
pattern = '^\s*(?:import|from)\s+requests\b'
message = "network client import"
"#;
        let rules = RuleSet::from_toml(toml_text).expect("parse");
        assert_eq!(rules.len(), 1);
        let hits = rules.scan("import requests\n");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rule, "no-requests");
    }

    #[test]
    fn regex_rule_without_pattern_is_rejected() {
        let toml_text = r#"
[[rule]]
id = "broken"
category = "dynamic_eval"
kind = "regex"
message = "missing pattern"
"#;
        assert!(matches!(
            RuleSet::from_toml(toml_text),
            Err(PolicyError::MissingPattern { .. })
        ));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let toml_text = r#"
[[rule]]
id = "broken"
category = "dynamic_eval"
kind = "regex"
pattern = '('
message = "bad regex"
"#;
        assert!(matches!(
            RuleSet::from_toml(toml_text),
            Err(PolicyError::BadPattern { .. })
        ));
    }

    #[test]
    fn load_from_disk() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = td.path().join("rules.toml");
        std::fs::write(
            &path,
            "[[rule]]\nid = \"x\"\ncategory = \"dynamic_eval\"\nkind = \"regex\"\npattern = 'marker'\nmessage = \"m\"\n",
        )
        .expect("write");

        let rules = RuleSet::load(&path).expect("load");
        assert_eq!(rules.scan("a marker here").len(), 1);

        assert!(matches!(
            RuleSet::load(&td.path().join("missing.toml")),
            Err(PolicyError::Io { .. })
        ));
    }
}
