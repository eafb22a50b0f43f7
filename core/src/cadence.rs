//! Invite gate: decides whether the faith invitation may be offered this turn.
//!
//! The gate itself is a pure function of [`InviteGateInput`]. Cadence memory
//! ([`CadenceState`]) is owned by the conversation and updated by the caller
//! with [`CadenceState::register_decline`] before the gate runs and
//! [`CadenceState::record_turn`] after it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::CadenceConfig;
use crate::metadata::{CadenceReason, Phase};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CadenceState {
    /// Assistant turn index of the most recent invitation.
    #[serde(default)]
    pub last_jesus_invite_turn: Option<u32>,
    /// Invitations are suppressed while the turn index is below this boundary.
    #[serde(default)]
    pub declined_jesus_until_turn: Option<u32>,
    #[serde(default)]
    pub jesus_decline_count: u32,
    /// Whether the previous assistant turn carried an invitation.
    #[serde(default)]
    pub last_turn_had_jesus: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InviteGateInput {
    pub phase: Phase,
    pub advice_intent: bool,
    pub intake_completed: bool,
    pub safety_flag: bool,
    /// 0-based index of the assistant turn being produced.
    pub turn_index: u32,
    pub last_jesus_invite_turn: Option<u32>,
    pub declined_jesus_until_turn: Option<u32>,
    pub last_turn_had_jesus: bool,
    /// `None` when consent has never been stated.
    pub prayer_consent: Option<bool>,
    pub plan_allows_invite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InviteDecision {
    pub allow: bool,
    pub reason: CadenceReason,
}

impl InviteDecision {
    const fn block(reason: CadenceReason) -> Self {
        Self {
            allow: false,
            reason,
        }
    }
}

/// First matching rule wins.
pub fn gate_invite(input: &InviteGateInput, config: &CadenceConfig) -> InviteDecision {
    if input.safety_flag {
        return InviteDecision::block(CadenceReason::Safety);
    }
    if input.phase == Phase::Intake {
        return InviteDecision::block(CadenceReason::PhaseIntake);
    }
    if input.phase != Phase::Advice && !input.advice_intent {
        return InviteDecision::block(CadenceReason::NotAdvice);
    }
    if !input.intake_completed {
        return InviteDecision::block(CadenceReason::Intake);
    }
    if input.prayer_consent == Some(false) {
        return InviteDecision::block(CadenceReason::PlanBlocked);
    }
    if input.turn_index == 0 {
        return InviteDecision::block(CadenceReason::FirstTurn);
    }
    if input.last_turn_had_jesus {
        return InviteDecision::block(CadenceReason::LastTurnHadJesus);
    }
    let inside_window = match input.last_jesus_invite_turn {
        None => input.turn_index < config.first_invite_window,
        Some(last) => input.turn_index.saturating_sub(last) < config.invite_window,
    };
    if inside_window {
        return InviteDecision::block(CadenceReason::CadenceWindow);
    }
    if input
        .declined_jesus_until_turn
        .is_some_and(|until| input.turn_index < until)
    {
        return InviteDecision::block(CadenceReason::CooldownDeclined);
    }
    if !input.plan_allows_invite {
        return InviteDecision::block(CadenceReason::PlanBlocked);
    }
    InviteDecision {
        allow: true,
        reason: CadenceReason::Ok,
    }
}

impl CadenceState {
    /// Count a decline of the previous invitation. Returns the new cooldown
    /// boundary when this decline reached the threshold.
    pub fn register_decline(&mut self, turn_index: u32, config: &CadenceConfig) -> Option<u32> {
        self.jesus_decline_count = self.jesus_decline_count.saturating_add(1);
        if self.jesus_decline_count < config.decline_threshold.max(1) {
            return None;
        }
        let boundary = turn_index.saturating_add(config.decline_cooldown_turns);
        let until = self
            .declined_jesus_until_turn
            .map_or(boundary, |existing| existing.max(boundary));
        self.declined_jesus_until_turn = Some(until);
        self.jesus_decline_count = 0;
        Some(until)
    }

    /// Apply the outcome of this turn's gate.
    pub fn record_turn(&mut self, turn_index: u32, invited: bool) {
        if invited {
            self.last_jesus_invite_turn = Some(turn_index);
        }
        self.last_turn_had_jesus = invited;
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

static DECLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        \bno,?\s+thanks?\b
        | \bno\s+thank\s+you\b
        | \bnot\s+interested\b
        | \bnot\s+(?:right\s+)?now\b
        | \brather\s+not\b
        | \bplease\s+stop\b
        | \bstop\s+(?:bringing\s+(?:it|that|him|god|jesus|faith|religion)\s+up|bringing\s+up|mentioning)\b
        | \bleave\s+(?:jesus|god|faith|religion)\s+out\b
        | \b(?:don'?t|do\s+not)\s+want\s+to\s+(?:talk|hear)\s+about\s+(?:jesus|god|faith|religion)\b
        | \bi'?m\s+not\s+religious\b
        | \bi\s+am\s+not\s+religious\b
        | \bnot\s+a\s+christian\b
        ",
    )
    .expect("valid decline regex")
});

/// Whether the message reads as declining an invitation. Only meaningful
/// when the previous assistant turn actually carried one.
pub fn is_decline(text: &str) -> bool {
    let bare = text
        .trim()
        .trim_end_matches(['.', '!', ','])
        .to_ascii_lowercase();
    matches!(bare.as_str(), "no" | "nope" | "nah") || DECLINE_RE.is_match(text)
}
