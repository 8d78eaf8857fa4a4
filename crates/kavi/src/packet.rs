//! Build packet framing.
//!
//! The packet is the text handed to the build worker on standard
//! input: proposal fields, the allowed-files table, and the acceptance
//! constraints. First-attempt packets are a deterministic function of
//! the proposal; retry packets append a structured previous-attempt
//! section (and nothing else — the retry engine owns any semantic
//! change).

use kavi_classify::FailureRecord;
use kavi_paths::Allowlist;
use kavi_types::SkillSpec;

pub const PACKET_HEADER: &str = "=== kavi build packet v1 ===";
const RETRY_HEADER: &str = "=== previous attempt ===";

/// Render the deterministic first-attempt packet.
pub fn render(spec: &SkillSpec, allowlist: &Allowlist) -> String {
    let mut out = String::new();
    out.push_str(PACKET_HEADER);
    out.push('\n');
    out.push_str(&format!("name: {}\n", spec.name));
    out.push_str(&format!("side_effect_class: {}\n", spec.side_effect_class));
    out.push_str(&format!("description: {}\n", spec.description));
    out.push_str(&format!("input_schema: {}\n", spec.input_schema.to_packet_line()));
    out.push_str(&format!("output_schema: {}\n", spec.output_schema.to_packet_line()));
    if spec.required_secrets.is_empty() {
        out.push_str("required_secrets: none\n");
    } else {
        out.push_str(&format!("required_secrets: {}\n", spec.required_secrets.join(", ")));
    }

    out.push_str("allowed_files:\n");
    for path in &allowlist.required {
        out.push_str(&format!("  - {path} (required)\n"));
    }
    for path in &allowlist.optional {
        out.push_str(&format!("  - {path} (optional)\n"));
    }

    out.push_str("acceptance:\n");
    out.push_str("  - ruff reports no findings on the skill and its test\n");
    out.push_str("  - mypy passes on the project\n");
    out.push_str(&format!(
        "  - pytest passes for {}\n",
        allowlist.required.get(1).map(String::as_str).unwrap_or("the skill test")
    ));
    out.push_str("  - no process spawning, shell access, or dynamic evaluation\n");
    out.push_str(&format!(
        "  - exactly one public skill class declaring name, side_effect_class ({}), input_model, output_model\n",
        spec.side_effect_class
    ));
    out.push_str("  - only the allowed files above are created or modified\n");
    out
}

/// Append the structured previous-attempt section for a retry. The
/// enrichment is purely additive; the spec half of the packet is
/// untouched.
pub fn append_retry_section(packet: &str, failure: &FailureRecord, attempt_number: u32) -> String {
    let mut out = packet.trim_end().to_string();
    out.push('\n');
    out.push_str(RETRY_HEADER);
    out.push('\n');
    out.push_str(&format!("attempt: {attempt_number}\n"));
    out.push_str(&format!("failure_kind: {}\n", failure.kind));

    if !failure.facts.offending_paths.is_empty() {
        out.push_str("offending_paths:\n");
        for path in &failure.facts.offending_paths {
            out.push_str(&format!("  - {path}\n"));
        }
    }
    if !failure.facts.violations.is_empty() {
        out.push_str("violations:\n");
        for v in &failure.facts.violations {
            out.push_str(&format!("  - {v}\n"));
        }
    }
    if !failure.facts.failing_tests.is_empty() {
        out.push_str("failing_tests:\n");
        for t in &failure.facts.failing_tests {
            out.push_str(&format!("  - {t}\n"));
        }
    }
    if let Some(tail) = &failure.facts.stderr_tail {
        out.push_str("stderr_tail: |\n");
        for line in tail.lines() {
            out.push_str(&format!("  {line}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kavi_classify::{FailureFacts, classify};
    use kavi_paths::PathConvention;
    use kavi_schema::{FieldType, IoSchema};
    use kavi_types::{FailureKind, SideEffectClass};

    fn spec() -> SkillSpec {
        SkillSpec {
            name: "write_note".to_string(),
            description: "write a note to disk".to_string(),
            side_effect_class: SideEffectClass::FileWrite,
            input_schema: IoSchema::from_pairs([("title", FieldType::Str), ("body", FieldType::Str)]),
            output_schema: IoSchema::from_pairs([("path", FieldType::Str)]),
            required_secrets: vec![],
        }
    }

    fn packet() -> String {
        let conv = PathConvention::default();
        render(&spec(), &conv.allowlist("write_note"))
    }

    #[test]
    fn first_attempt_packet_is_deterministic() {
        assert_eq!(packet(), packet());
    }

    #[test]
    fn packet_carries_proposal_fields_and_allowlist() {
        let p = packet();
        assert!(p.starts_with(PACKET_HEADER));
        assert!(p.contains("name: write_note"));
        assert!(p.contains("side_effect_class: FILE_WRITE"));
        assert!(p.contains(r#"input_schema: {"body":"str","title":"str"}"#));
        assert!(p.contains("  - skills/write_note.py (required)"));
        assert!(p.contains("  - tests/test_skill_write_note.py (required)"));
        assert!(p.contains("  - kavi_runtime/llm_client.py (optional)"));
        assert!(p.contains("pytest passes for tests/test_skill_write_note.py"));
    }

    #[test]
    fn secrets_render_when_declared() {
        let mut s = spec();
        s.required_secrets = vec!["API_TOKEN".to_string(), "API_URL".to_string()];
        let conv = PathConvention::default();
        let p = render(&s, &conv.allowlist("write_note"));
        assert!(p.contains("required_secrets: API_TOKEN, API_URL"));
    }

    #[test]
    fn retry_section_appends_kind_and_facts() {
        let failure = FailureRecord {
            kind: FailureKind::GateViolation,
            facts: FailureFacts {
                offending_paths: vec!["rogue.txt".to_string()],
                ..Default::default()
            },
        };
        let enriched = append_retry_section(&packet(), &failure, 2);

        // The spec half is untouched.
        assert!(enriched.starts_with(&packet().trim_end().to_string()));
        assert!(enriched.contains("=== previous attempt ==="));
        assert!(enriched.contains("attempt: 2"));
        assert!(enriched.contains("failure_kind: GATE_VIOLATION"));
        assert!(enriched.contains("  - rogue.txt"));
    }

    #[test]
    fn retry_section_renders_stderr_tail_indented() {
        let failure = FailureRecord {
            kind: FailureKind::BuildError,
            facts: FailureFacts {
                stderr_tail: Some("Traceback\n  boom".to_string()),
                ..Default::default()
            },
        };
        let enriched = append_retry_section(&packet(), &failure, 3);
        assert!(enriched.contains("stderr_tail: |\n  Traceback\n    boom"));
    }

    #[test]
    fn enrichment_roundtrips_through_the_classifier() {
        // A packet enriched from a classified log classifies the same
        // way again: the enrichment itself is inert.
        let log = "kavi: gate violation: rogue.txt\n";
        let failure = classify(log, None);
        let enriched = append_retry_section(&packet(), &failure, 2);
        let again = append_retry_section(&packet(), &failure, 2);
        assert_eq!(enriched, again);
    }
}
