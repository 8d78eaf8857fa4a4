//! Trust-verified runtime execution.
//!
//! The loader runs a skill only after its source re-hashes to the
//! value recorded at promotion. Execution happens in a python harness
//! subprocess driven through the injected `ToolRunner`: the harness
//! imports the module reference, instantiates the single public skill
//! class, feeds it the JSON input from stdin, and prints the JSON
//! result. Load failures (exit 3) and execution failures (exit 4) are
//! distinguished so the returned record can tell them apart.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use kavi_schema::IoSchema;
use kavi_types::{RegistryEntry, RunError, RunRecord};
use serde_json::Value;

use crate::config::ForgeConfig;
use crate::process::{CommandSpec, ToolRunner};
use crate::registry;

/// Python source handed to `python -c`. argv[1] is the module
/// reference; input arrives on stdin, output leaves on stdout.
const HARNESS: &str = r#"
import importlib
import json
import sys


def main() -> int:
    module_ref = sys.argv[1]
    payload = json.load(sys.stdin)
    try:
        module = importlib.import_module(module_ref)
        classes = [
            value
            for key, value in vars(module).items()
            if isinstance(value, type)
            and not key.startswith("_")
            and getattr(value, "name", None)
        ]
        if len(classes) != 1:
            raise ImportError(f"expected one skill class, found {len(classes)}")
        skill = classes[0]()
    except Exception as exc:
        print(f"kavi-load-error: {exc}", file=sys.stderr)
        return 3
    try:
        result = skill.run(**payload)
    except Exception as exc:
        print(f"kavi-exec-error: {exc}", file=sys.stderr)
        return 4
    print(json.dumps(result))
    return 0


sys.exit(main())
"#;

const LOAD_EXIT: i32 = 3;
const EXEC_EXIT: i32 = 4;

fn stderr_reason(stderr: &str, prefix: &str) -> String {
    stderr
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix(prefix))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| stderr.trim().to_string())
}

/// Execute a trust-verified skill.
///
/// The caller supplies the registry entry and the declared schemas
/// (the ledger owns those). Trust failures return `Err` with a
/// downcastable [`registry::TrustError`] — the skill is refused before
/// any of its code is imported. Validation and execution failures come
/// back inside the record.
pub fn run_skill(
    config: &ForgeConfig,
    runner: &dyn ToolRunner,
    entry: &RegistryEntry,
    input_schema: &IoSchema,
    output_schema: &IoSchema,
    source_path: &Path,
    input: &Value,
) -> Result<RunRecord> {
    let started_at = Utc::now();

    let trust = registry::verify_trust(entry, source_path)?;

    let record = |output: Option<Value>, error: Option<RunError>| RunRecord {
        name: entry.name.clone(),
        source_hash: trust.hash.clone(),
        side_effect_class: entry.side_effect_class,
        input: input.clone(),
        output,
        ok: error.is_none(),
        error,
        started_at,
        finished_at: Utc::now(),
    };

    if let Err(e) = input_schema.validate(input) {
        return Ok(record(None, Some(RunError::InvalidInput(e.to_string()))));
    }

    let out = runner
        .run(&CommandSpec {
            program: config.tools.python.clone(),
            args: vec!["-c".to_string(), HARNESS.to_string(), entry.module.clone()],
            cwd: config.project_root().to_path_buf(),
            stdin: Some(serde_json::to_string(input).context("failed to serialize input")?),
            timeout: Some(config.tools.timeout),
        })
        .context("failed to invoke skill harness")?;

    if out.timed_out {
        return Ok(record(
            None,
            Some(RunError::Execution("skill execution timed out".to_string())),
        ));
    }
    match out.exit_code {
        0 => {}
        LOAD_EXIT => {
            return Ok(record(
                None,
                Some(RunError::Load(stderr_reason(&out.stderr, "kavi-load-error:"))),
            ));
        }
        EXEC_EXIT => {
            return Ok(record(
                None,
                Some(RunError::Execution(stderr_reason(&out.stderr, "kavi-exec-error:"))),
            ));
        }
        code => {
            return Ok(record(
                None,
                Some(RunError::Execution(format!(
                    "harness exited with status {code}: {}",
                    out.stderr.trim()
                ))),
            ));
        }
    }

    let last_line = out
        .stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("");
    let output: Value = match serde_json::from_str(last_line) {
        Ok(v) => v,
        Err(e) => {
            return Ok(record(
                None,
                Some(RunError::Execution(format!("skill printed malformed JSON: {e}"))),
            ));
        }
    };

    if let Err(e) = output_schema.validate(&output) {
        return Ok(record(
            Some(output),
            Some(RunError::Execution(format!("output failed validation: {e}"))),
        ));
    }

    Ok(record(Some(output), None))
}
