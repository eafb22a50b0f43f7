//! Intake checklist: the four facts that must be known before advice.
//!
//! Facts only ever flip from false to true. Signals come from lightweight
//! heuristics over the user message and are merged with OR semantics.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::classify::{classify_keywords, Topic};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IntakeState {
    #[serde(default)]
    pub issue_named: bool,
    #[serde(default)]
    pub safety_cleared: bool,
    #[serde(default)]
    pub goal_captured: bool,
    #[serde(default)]
    pub prayer_consent_known: bool,
    /// True iff all four facts are true. Never reset once set.
    #[serde(default)]
    pub completed: bool,
}

/// Facts reported by upstream extraction for a single turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct IntakeUpdate {
    pub issue_named: bool,
    pub safety_cleared: bool,
    pub goal_captured: bool,
    pub prayer_consent_known: bool,
}

impl IntakeUpdate {
    pub const fn all() -> Self {
        Self {
            issue_named: true,
            safety_cleared: true,
            goal_captured: true,
            prayer_consent_known: true,
        }
    }
}

impl IntakeState {
    /// OR-merge an update into the stored state.
    pub fn merge(self, update: IntakeUpdate) -> Self {
        let mut next = Self {
            issue_named: self.issue_named || update.issue_named,
            safety_cleared: self.safety_cleared || update.safety_cleared,
            goal_captured: self.goal_captured || update.goal_captured,
            prayer_consent_known: self.prayer_consent_known || update.prayer_consent_known,
            completed: self.completed,
        };
        next.completed = next.completed || next.all_known();
        next
    }

    pub fn all_known(&self) -> bool {
        self.issue_named && self.safety_cleared && self.goal_captured && self.prayer_consent_known
    }

    /// Rebuild from a stored record, re-deriving `completed` so a row that
    /// lost the flag (or never had it) cannot under-report completion.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let stored: Self = serde_json::from_value(value.clone()).unwrap_or_default();
        stored.merge(IntakeUpdate::default())
    }
}

/// Everything the intake heuristics read from one user message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeSignals {
    pub update: IntakeUpdate,
    /// `Some(true)` for explicit consent, `Some(false)` for explicit refusal.
    pub prayer_consent: Option<bool>,
}

static SAFETY_CLEARED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:we(?:'re| are) safe|i(?:'m| am) safe|no (?:abuse|violence|safety (?:concerns?|issues?))|(?:nobody|no one) is in danger|not in danger|feel safe)\b",
    )
    .expect("valid safety cleared regex")
});

static GOAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i want|we want|i'd like|we'd like|my goal|our goal|hoping to|i hope|we hope|help (?:me|us))\b",
    )
    .expect("valid goal regex")
});

static ISSUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:marriage|married|my (?:husband|wife|spouse)|our relationship|struggl\w*|problem\w*|distant|divorce|separat\w*)\b",
    )
    .expect("valid issue regex")
});

static CONSENT_YES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bplease\s+pray\b|\bpray\s+for\s+(?:me|us)\b|\byes\b.*\bforward\b.*\bprayer\b|\byou\s+can\s+forward\b.*\bprayer\b|\bprayer\s+(?:is|would be)\s+(?:welcome|great|fine)\b",
    )
    .expect("valid consent yes regex")
});

static CONSENT_NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bno\s+prayers?\b|\bdon'?t\s+pray\b|\bdo\s+not\s+pray\b|\bnot\s+religious\b|\bleave\s+(?:faith|god|jesus|religion)\s+out\b|\bwithout\s+(?:faith|religion|prayer)\b",
    )
    .expect("valid consent no regex")
});

static WRAP_UP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bthat'?s\s+(?:enough|all|it)\b|\bready\s+for\s+(?:advice|next steps|your advice)\b|\bjust\s+tell\s+(?:me|us)\s+what\s+to\s+do\b|\bskip\s+the\s+questions\b",
    )
    .expect("valid wrap-up regex")
});

/// Explicit prayer consent in the message, if any. Refusal wins when both
/// phrasings appear.
pub fn detect_prayer_consent(text: &str) -> Option<bool> {
    if CONSENT_NO_RE.is_match(text) {
        Some(false)
    } else if CONSENT_YES_RE.is_match(text) {
        Some(true)
    } else {
        None
    }
}

pub fn is_wrap_up_affirmation(text: &str) -> bool {
    WRAP_UP_RE.is_match(text)
}

pub fn extract_signals(text: &str) -> IntakeSignals {
    let prayer_consent = detect_prayer_consent(text);
    if is_wrap_up_affirmation(text) {
        return IntakeSignals {
            update: IntakeUpdate::all(),
            prayer_consent,
        };
    }
    let issue_named = classify_keywords(text).topic != Topic::Other || ISSUE_RE.is_match(text);
    IntakeSignals {
        update: IntakeUpdate {
            issue_named,
            safety_cleared: SAFETY_CLEARED_RE.is_match(text),
            goal_captured: GOAL_RE.is_match(text),
            prayer_consent_known: prayer_consent.is_some(),
        },
        prayer_consent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completes_only_when_all_four_known() {
        let state = IntakeState::default()
            .merge(IntakeUpdate {
                issue_named: true,
                safety_cleared: true,
                goal_captured: true,
                prayer_consent_known: false,
            });
        assert!(!state.completed);
        let state = state.merge(IntakeUpdate {
            prayer_consent_known: true,
            ..IntakeUpdate::default()
        });
        assert!(state.completed);
    }

    #[test]
    fn facts_and_completion_are_monotonic() {
        let mut state = IntakeState::default().merge(IntakeUpdate::all());
        for _ in 0..5 {
            state = state.merge(IntakeUpdate::default());
            assert!(state.completed);
            assert!(state.issue_named && state.safety_cleared);
            assert!(state.goal_captured && state.prayer_consent_known);
        }
    }

    #[test]
    fn from_value_tolerates_partial_rows() {
        let state = IntakeState::from_value(&json!({"issue_named": true}));
        assert!(state.issue_named);
        assert!(!state.completed);

        let rederived = IntakeState::from_value(&json!({
            "issue_named": true,
            "safety_cleared": true,
            "goal_captured": true,
            "prayer_consent_known": true,
        }));
        assert!(rederived.completed);

        assert_eq!(IntakeState::from_value(&json!("nope")), IntakeState::default());
    }

    #[test]
    fn extracts_issue_goal_and_safety() {
        let signals = extract_signals(
            "We argue constantly. We're safe, no abuse. We want to stop yelling at each other.",
        );
        assert!(signals.update.issue_named);
        assert!(signals.update.safety_cleared);
        assert!(signals.update.goal_captured);
        assert!(!signals.update.prayer_consent_known);
        assert_eq!(signals.prayer_consent, None);
    }

    #[test]
    fn consent_detection_reads_both_directions() {
        assert_eq!(detect_prayer_consent("Yes, please pray for us"), Some(true));
        assert_eq!(detect_prayer_consent("Please leave faith out of this"), Some(false));
        assert_eq!(detect_prayer_consent("I'm not religious, but please pray"), Some(false));
        assert_eq!(detect_prayer_consent("We fight about chores"), None);
    }

    #[test]
    fn wrap_up_marks_everything_known() {
        let signals = extract_signals("That's enough, I'm ready for advice.");
        assert_eq!(signals.update, IntakeUpdate::all());
        let state = IntakeState::default().merge(signals.update);
        assert!(state.completed);
    }

    #[test]
    fn greeting_carries_no_signals() {
        let signals = extract_signals("hi");
        assert_eq!(signals.update, IntakeUpdate::default());
    }
}
