//! Contract conformance checks for built skills.
//!
//! Four families: structural (exactly one public skill class with the
//! declared metadata), scope containment (the build's recorded delta
//! stays inside the allowlist), extended safety (no dynamic import),
//! and the runtime import boundary (runtime support modules must not
//! pull in governance code).
//!
//! The structural scan is line-based over the Python source: top-level
//! `class` statements, their base lists, and class-level assignments at
//! the first body indent. That is deliberately the same altitude as
//! the policy scanner — shapes, not semantics.

use kavi_paths::Allowlist;
use kavi_types::SideEffectClass;

/// The base every skill class must extend.
pub const SKILL_BASE_CLASS: &str = "Skill";

/// Class-level attributes every skill class must declare.
const REQUIRED_ATTRS: &[&str] = &["name", "side_effect_class", "input_model", "output_model"];

/// Top-level module names that are governance code. A runtime support
/// module importing any of these fails the boundary check.
const GOVERNANCE_MODULES: &[&str] = &["forge", "ledger", "policy"];

/// Everything the checker inspects for one build.
#[derive(Debug)]
pub struct InvariantContext<'a> {
    pub source: &'a str,
    pub proposal_name: &'a str,
    pub side_effect_class: SideEffectClass,
    /// The delta recorded by the diff gate at build time.
    pub changed_files: &'a [String],
    pub allowlist: &'a Allowlist,
    /// `(path, contents)` of the optional runtime files this build
    /// touched.
    pub runtime_sources: &'a [(String, String)],
}

#[derive(Debug)]
struct PyClass<'a> {
    name: &'a str,
    bases: Vec<&'a str>,
    body: Vec<&'a str>,
}

fn top_level_classes(source: &str) -> Vec<PyClass<'_>> {
    let lines: Vec<&str> = source.lines().collect();
    let mut classes = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix("class ") {
            let header = rest.trim_end().trim_end_matches(':');
            let (name, bases) = match header.split_once('(') {
                Some((name, bases)) => (
                    name.trim(),
                    bases
                        .trim_end_matches(')')
                        .split(',')
                        .map(str::trim)
                        .filter(|b| !b.is_empty())
                        .collect(),
                ),
                None => (header.trim(), Vec::new()),
            };

            let mut body = Vec::new();
            let mut j = i + 1;
            while j < lines.len() {
                let body_line = lines[j];
                if !body_line.trim().is_empty() && !body_line.starts_with([' ', '\t']) {
                    break;
                }
                body.push(body_line);
                j += 1;
            }
            classes.push(PyClass { name, bases, body });
            i = j;
        } else {
            i += 1;
        }
    }
    classes
}

/// The right-hand side of a class-level assignment to `attr`, if any.
/// Only the first body indent counts; method bodies sit deeper.
fn class_attr<'a>(class: &PyClass<'a>, attr: &str) -> Option<&'a str> {
    let body_indent = class
        .body
        .iter()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())?;

    for line in &class.body {
        if line.trim().is_empty() {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        if indent != body_indent {
            continue;
        }
        let stmt = line.trim();
        let Some(rest) = stmt.strip_prefix(attr) else {
            continue;
        };
        // `attr = value` or `attr: Annotation = value`.
        let rest = rest.trim_start();
        let rest = if let Some(after_colon) = rest.strip_prefix(':') {
            match after_colon.split_once('=') {
                Some((_, value)) => return Some(value.trim()),
                None => continue,
            }
        } else {
            rest
        };
        if let Some(value) = rest.strip_prefix('=') {
            return Some(value.trim());
        }
    }
    None
}

/// Extract a python string literal's contents, if the value is one.
fn string_literal(value: &str) -> Option<&str> {
    let v = value.trim().trim_end_matches(|c| c == '#').trim();
    for quote in ['"', '\''] {
        if let Some(inner) = v.strip_prefix(quote)
            && let Some(end) = inner.find(quote)
        {
            return Some(&inner[..end]);
        }
    }
    None
}

fn is_governance_import(module: &str) -> bool {
    let mut parts = module.split('.');
    let first = parts.next().unwrap_or("");
    if GOVERNANCE_MODULES.contains(&first) {
        return true;
    }
    // Packaged form: `kavi.forge`, `kavi.ledger`, `kavi.policy`.
    first == "kavi"
        && parts
            .next()
            .is_some_and(|second| GOVERNANCE_MODULES.contains(&second))
}

fn imported_module(line: &str) -> Option<&str> {
    let stmt = line.trim();
    let module = stmt
        .strip_prefix("import ")
        .or_else(|| stmt.strip_prefix("from "))?;
    module.split_whitespace().next()
}

/// Run every invariant family. Returns human-readable violations; the
/// gate is ok iff the list is empty.
pub fn check(ctx: &InvariantContext<'_>) -> Vec<String> {
    let mut violations = Vec::new();

    // Structural conformance.
    let classes = top_level_classes(ctx.source);
    let public: Vec<&PyClass<'_>> = classes.iter().filter(|c| !c.name.starts_with('_')).collect();
    match public.as_slice() {
        [] => violations.push("no public skill class defined".to_string()),
        [class] => {
            if !class.bases.contains(&SKILL_BASE_CLASS) {
                violations.push(format!(
                    "class `{}` does not extend `{SKILL_BASE_CLASS}`",
                    class.name
                ));
            }
            for attr in REQUIRED_ATTRS {
                if class_attr(class, attr).is_none() {
                    violations.push(format!(
                        "class `{}` is missing class-level `{attr}`",
                        class.name
                    ));
                }
            }
            if let Some(value) = class_attr(class, "name") {
                match string_literal(value) {
                    Some(declared) if declared == ctx.proposal_name => {}
                    Some(declared) => violations.push(format!(
                        "declared name `{declared}` does not match proposal `{}`",
                        ctx.proposal_name
                    )),
                    None => violations
                        .push("class-level `name` must be a string literal".to_string()),
                }
            }
            if let Some(value) = class_attr(class, "side_effect_class") {
                let expected = ctx.side_effect_class.as_str();
                match string_literal(value) {
                    Some(declared) if declared == expected => {}
                    Some(declared) => violations.push(format!(
                        "declared side_effect_class `{declared}` does not match proposal `{expected}`"
                    )),
                    None => violations.push(
                        "class-level `side_effect_class` must be a string literal".to_string(),
                    ),
                }
            }
        }
        many => violations.push(format!(
            "expected exactly one public class, found {}: {}",
            many.len(),
            many.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
        )),
    }

    // Scope containment, recomputed from the recorded delta.
    for path in ctx.allowlist.violations(ctx.changed_files) {
        violations.push(format!("changed file outside allowlist: {path}"));
    }

    // Extended safety: no dynamic import in the skill source.
    for (idx, line) in ctx.source.lines().enumerate() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        if line.contains("__import__") || line.contains("importlib.import_module") {
            violations.push(format!("dynamic import on line {}", idx + 1));
        }
    }

    // Runtime import boundary.
    for (path, contents) in ctx.runtime_sources {
        if !ctx.allowlist.is_optional(path) {
            continue;
        }
        for (idx, line) in contents.lines().enumerate() {
            if let Some(module) = imported_module(line)
                && is_governance_import(module)
            {
                violations.push(format!(
                    "runtime module {path} imports governance code `{module}` (line {})",
                    idx + 1
                ));
            }
        }
    }

    violations
}
