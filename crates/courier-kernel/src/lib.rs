use std::collections::HashSet;

use courier_contracts::LoopDecision;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Sliding window the trace index is consulted (and pruned) over.
pub const TRACE_WINDOW_MS: i64 = 60_000;

const CONFIDENCE_BURST: f64 = 0.95;
const CONFIDENCE_REPEAT: f64 = 0.8;
const CONFIDENCE_ACCEPT: f64 = 0.6;
const REPEAT_TAIL: usize = 4;
const REPEAT_SIMILARITY: f64 = 0.95;

#[derive(Debug, Clone)]
pub struct LoopPolicy {
    pub max_per_minute: usize,
    pub default_delay_ms: u64,
    pub burst_delay_ms: u64,
}

/// One prior event on a trace, as the loop guard sees it.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub created_at: i64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Stop,
    Warn,
    Normal,
}

/// Classifies a candidate event against its trace history. First match wins:
/// rate cap, then lexical repetition, otherwise accept.
pub fn classify(candidate_text: &str, recent: &[TraceEntry], policy: &LoopPolicy) -> (u64, LoopDecision) {
    if recent.len() >= policy.max_per_minute {
        return (
            policy.burst_delay_ms,
            LoopDecision {
                is_error_loop: true,
                reason: format!(
                    "max {} loop events per minute exceeded; delaying",
                    policy.max_per_minute
                ),
                confidence: CONFIDENCE_BURST,
            },
        );
    }

    let tail_start = recent.len().saturating_sub(REPEAT_TAIL);
    let tail = &recent[tail_start..];
    if tail.len() >= 3 {
        let near_identical = tail
            .iter()
            .filter(|entry| jaccard(&entry.text, candidate_text) >= REPEAT_SIMILARITY)
            .count();
        if near_identical >= 2 {
            return (
                policy.default_delay_ms,
                LoopDecision {
                    is_error_loop: true,
                    reason: "near-identical repeated outputs detected; delayed for safety"
                        .to_string(),
                    confidence: CONFIDENCE_REPEAT,
                },
            );
        }
    }

    (
        0,
        LoopDecision {
            is_error_loop: false,
            reason: "accepted".to_string(),
            confidence: CONFIDENCE_ACCEPT,
        },
    )
}

pub fn policy_action(decision: &LoopDecision) -> PolicyAction {
    if decision.is_error_loop && decision.confidence >= 0.95 {
        PolicyAction::Stop
    } else if decision.is_error_loop && decision.confidence > 0.7 && decision.confidence < 0.95 {
        PolicyAction::Warn
    } else {
        PolicyAction::Normal
    }
}

pub fn action_name(action: PolicyAction) -> &'static str {
    match action {
        PolicyAction::Stop => "stop",
        PolicyAction::Warn => "warn",
        PolicyAction::Normal => "normal",
    }
}

/// Token-set Jaccard similarity: lowercase, whitespace runs collapsed,
/// split on spaces. Empty union is 0.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokenize(a);
    let set_b: HashSet<String> = tokenize(b);
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / union as f64
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|token| token.to_string())
        .collect()
}

/// Warning suffix appended to outbound text on a warn-class detection.
/// Wire contract: two newlines, the bracketed tag, confidence to two decimals.
pub fn warn_suffixed(text: &str, confidence: f64) -> String {
    format!(
        "{text}\n\n[LOOP_GUARD_NOTE] Possible error loop detected (confidence={confidence:.2}). Please evaluate and stop if erroneous."
    )
}

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String, String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("failed to initialize callback signer: {e}"))?;
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}
