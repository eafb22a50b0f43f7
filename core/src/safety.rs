//! Risk detection and the fixed triage reply.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::metadata::{CadenceReason, GateReason, PipelinePath, TurnMetadata};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyVerdict {
    pub flag: bool,
    /// The indicator that matched, lowercased.
    pub indicator: Option<String>,
}

impl SafetyVerdict {
    pub fn clear() -> Self {
        Self {
            flag: false,
            indicator: None,
        }
    }
}

static RISK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:suicid(?:e|al)|kill (?:myself|himself|herself|me)|end (?:my|his|her) life|want to die|self[- ]harm|hurt(?:ing)? (?:myself|me|the kids|my kids)|abus(?:e|ed|ive|ing)|violen(?:ce|t)|assault(?:ed)?|threat(?:en|ens|ened|ening)?|(?:hits|hit|beats|beat|chokes|choked) me|kill)\b",
    )
    .expect("valid risk regex")
});

/// Negated mentions ("no abuse", "never violent") are intake answers, not
/// risk signals.
static NEGATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    let term = r"(?:abus(?:e|ive)|violen(?:ce|t)|threats?|safety (?:concerns?|issues?))";
    let filler = r"(?:(?:any|been|ever|physically)\s+)*";
    Regex::new(&format!(
        r"(?i)\b(?:no|not|never|without)\s+{filler}{term}(?:\s*(?:,|or|and|nor)\s*{filler}{term})*\b"
    ))
    .expect("valid negated risk regex")
});

pub fn pre_moderate(text: &str) -> SafetyVerdict {
    let without_negations = NEGATED_RE.replace_all(text, " ");
    match RISK_RE.find(&without_negations) {
        Some(found) => SafetyVerdict {
            flag: true,
            indicator: Some(found.as_str().to_lowercase()),
        },
        None => SafetyVerdict::clear(),
    }
}

/// Acknowledge, stabilize, one next step, one gentle question.
pub const TRIAGE_LINES: [&str; 4] = [
    "Thank you for telling me this. I'm really sorry you're carrying it, and your safety matters more than anything else we could talk about.",
    "Let's pause everything else for now; you don't have to sort this out alone or all at once.",
    "If you are in immediate danger, please contact local emergency services or a crisis line right now, and if you can, move to a safe place or near someone you trust.",
    "Would you be willing to share what city or region you're in so a person can help point you to local support?",
];

pub fn triage_reply() -> String {
    TRIAGE_LINES.join("\n")
}

/// Decision record for a triaged turn: no books, no invitation.
pub fn triage_metadata(declined_jesus_until_turn: Option<u32>) -> TurnMetadata {
    TurnMetadata {
        safety_flag_this_turn: true,
        gate_reason: Some(GateReason::SafetyTriage),
        cadence_reason: Some(CadenceReason::Safety),
        path: PipelinePath::Triage,
        allow_books: false,
        allow_jesus: false,
        asked_question: true,
        declined_jesus_until_turn,
        ..TurnMetadata::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_self_harm_and_abuse() {
        for text in [
            "I've been thinking about suicide",
            "He hits me when he drinks",
            "She is abusive toward me",
            "I want to end my life",
            "there was violence last night",
        ] {
            let verdict = pre_moderate(text);
            assert!(verdict.flag, "expected flag for {text:?}");
            assert!(verdict.indicator.is_some());
        }
    }

    #[test]
    fn ignores_ordinary_and_negated_mentions() {
        for text in [
            "We argue about chores",
            "We're safe, no abuse or violence at home",
            "Our children are struggling at school",
            "He has never been violent",
            "No safety concerns, we just drift apart",
        ] {
            assert!(!pre_moderate(text).flag, "unexpected flag for {text:?}");
        }
    }

    #[test]
    fn word_boundaries_prevent_partial_matches() {
        assert!(!pre_moderate("I feel like the skill gap is huge").flag);
        assert!(pre_moderate("I could kill him").flag);
    }

    #[test]
    fn triage_reply_has_fixed_four_part_shape() {
        let reply = triage_reply();
        let lines: Vec<&str> = reply.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[3].trim_end().ends_with('?'));
        assert!(!reply.to_lowercase().contains("jesus"));
    }

    #[test]
    fn triage_metadata_blocks_everything() {
        let meta = triage_metadata(Some(9));
        assert!(meta.safety_flag_this_turn);
        assert!(!meta.allow_books && !meta.allow_jesus);
        assert_eq!(meta.gate_reason, Some(GateReason::SafetyTriage));
        assert_eq!(meta.cadence_reason, Some(CadenceReason::Safety));
        assert_eq!(meta.path, PipelinePath::Triage);
        assert_eq!(meta.declined_jesus_until_turn, Some(9));
    }
}
