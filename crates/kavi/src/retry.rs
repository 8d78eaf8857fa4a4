//! The retry engine.
//!
//! Two layers over a failed attempt: a deterministic enrichment that
//! appends the previous-attempt facts to the packet, and an optional
//! bounded LLM advisory that may propose a revised packet. The
//! proposal is evaluated for escalation triggers; an unreachable or
//! malformed gateway degrades to deterministic-only and records the
//! `AMBIGUOUS` trigger. The engine never opens a build — it returns
//! the packet and the trigger set, and the caller decides.

use kavi_classify::{FailureRecord, TriggerContext, evaluate_triggers};
use kavi_gateway::GatewayClient;
use kavi_types::TriggerSet;

use crate::config::ForgeConfig;
use crate::packet;

const ADVISORY_SYSTEM_PROMPT: &str = "You revise build packets for a governed skill forge. \
Reply with a complete revised packet only, in the same format as the input. \
Do not change the declared name, side-effect class, or schemas.";

/// What the caller gets back: the next packet, the triggers that must
/// be approved before it may run, and whether the advisory contributed.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub packet: String,
    pub triggers: TriggerSet,
    pub advisory_used: bool,
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Produce the next packet for a proposal whose last attempt failed.
///
/// `spec_text` is the deterministic first-attempt rendering of the
/// proposal — the baseline for the permission-widening check.
pub fn prepare_next_packet(
    config: &ForgeConfig,
    gateway: Option<&GatewayClient>,
    spec_text: &str,
    previous_packet: &str,
    failure: &FailureRecord,
    attempt_number: u32,
    consecutive_failures: u32,
) -> RetryPlan {
    let deterministic = packet::append_retry_section(previous_packet, failure, attempt_number);

    let advisory = gateway.and_then(|gw| {
        let prompt = truncate_chars(&deterministic, config.gateway.max_prompt_chars);
        match gw.chat(ADVISORY_SYSTEM_PROMPT, prompt) {
            Ok(text) if !text.trim().is_empty() => Some(text),
            _ => None,
        }
    });

    let triggers = evaluate_triggers(&TriggerContext {
        kind: failure.kind,
        consecutive_failures,
        spec_text,
        previous_packet: &deterministic,
        proposed_packet: advisory.as_deref(),
        keywords: &config.escalation.keywords,
        large_diff_ratio: config.escalation.large_diff_ratio,
    });

    match advisory {
        Some(text) => RetryPlan {
            packet: text,
            triggers,
            advisory_used: true,
        },
        None => RetryPlan {
            packet: deterministic,
            triggers,
            advisory_used: false,
        },
    }
}
