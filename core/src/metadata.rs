//! Canonical per-turn decision metadata.
//!
//! Both pipelines (orchestrated and legacy) and the safety triage branch
//! produce a [`TurnMetadata`]. Stored rows and client payloads may be partial
//! or loosely typed, so [`normalize_meta`] coerces any JSON value back into the
//! canonical record without ever failing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::classify::Topic;

/// Back-compat key that always mirrors `allow_jesus`.
pub const HAD_JESUS_INVITE_ALIAS: &str = "had_jesus_invite";

pub const CANONICAL_KEYS: [&str; 19] = [
    "phase",
    "advice_intent",
    "safety_flag_this_turn",
    "gate_reason",
    "book_selection_reason",
    "book_attributions",
    "scrubbed_books",
    "asked_question",
    "rooted_in_jesus_emphasis",
    "jesus_invite_variant",
    "topic",
    "topic_confidence",
    "path",
    "allow_books",
    "allow_jesus",
    "cadence_reason",
    "planner_retries",
    "fallback_reason",
    "declined_jesus_until_turn",
];

pub const MAX_INVITE_VARIANT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intake,
    Chat,
    Advice,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Intake => "intake",
            Phase::Chat => "chat",
            Phase::Advice => "advice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "intake" => Some(Phase::Intake),
            "chat" => Some(Phase::Chat),
            "advice" => Some(Phase::Advice),
            _ => None,
        }
    }
}

/// Why book citations were allowed or withheld this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GateReason {
    Ok,
    SafetyTriage,
    IntakeIncomplete,
    LowConfidence,
    /// Intake is done and confidence is high, but the turn is ordinary chat.
    NotAdvice,
    /// The gate passed but the turn was served by the fixed safe reply.
    Gated,
}

impl GateReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            GateReason::Ok => "ok",
            GateReason::SafetyTriage => "safety_triage",
            GateReason::IntakeIncomplete => "intake_incomplete",
            GateReason::LowConfidence => "low_confidence",
            GateReason::NotAdvice => "not_advice",
            GateReason::Gated => "gated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(GateReason::Ok),
            "safety_triage" => Some(GateReason::SafetyTriage),
            "intake_incomplete" => Some(GateReason::IntakeIncomplete),
            "low_confidence" => Some(GateReason::LowConfidence),
            "not_advice" => Some(GateReason::NotAdvice),
            "gated" => Some(GateReason::Gated),
            _ => None,
        }
    }
}

/// Why the invitation was allowed or withheld this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CadenceReason {
    Safety,
    PhaseIntake,
    NotAdvice,
    Intake,
    PlanBlocked,
    FirstTurn,
    LastTurnHadJesus,
    CadenceWindow,
    CooldownDeclined,
    Ok,
}

impl CadenceReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            CadenceReason::Safety => "safety",
            CadenceReason::PhaseIntake => "phase_intake",
            CadenceReason::NotAdvice => "not_advice",
            CadenceReason::Intake => "intake",
            CadenceReason::PlanBlocked => "plan_blocked",
            CadenceReason::FirstTurn => "first_turn",
            CadenceReason::LastTurnHadJesus => "last_turn_had_jesus",
            CadenceReason::CadenceWindow => "cadence_window",
            CadenceReason::CooldownDeclined => "cooldown_declined",
            CadenceReason::Ok => "ok",
        }
    }

    /// Accepts the canonical vocabulary plus the older aliases found in
    /// stored rows (`no_consent`, `frequency`, `cooldown`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "safety" => Some(CadenceReason::Safety),
            "phase_intake" => Some(CadenceReason::PhaseIntake),
            "not_advice" => Some(CadenceReason::NotAdvice),
            "intake" => Some(CadenceReason::Intake),
            "plan_blocked" | "no_consent" => Some(CadenceReason::PlanBlocked),
            "first_turn" => Some(CadenceReason::FirstTurn),
            "last_turn_had_jesus" => Some(CadenceReason::LastTurnHadJesus),
            "cadence_window" | "frequency" => Some(CadenceReason::CadenceWindow),
            "cooldown_declined" | "cooldown" => Some(CadenceReason::CooldownDeclined),
            "ok" => Some(CadenceReason::Ok),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BookSelectionReason {
    Contextual,
    Gated,
    None,
}

impl BookSelectionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            BookSelectionReason::Contextual => "contextual",
            BookSelectionReason::Gated => "gated",
            BookSelectionReason::None => "none",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contextual" => Some(BookSelectionReason::Contextual),
            "gated" | "gated or none" => Some(BookSelectionReason::Gated),
            "none" => Some(BookSelectionReason::None),
            _ => None,
        }
    }
}

/// Which branch served the turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePath {
    Orchestrated,
    #[default]
    Legacy,
    Triage,
}

impl PipelinePath {
    pub const fn as_str(self) -> &'static str {
        match self {
            PipelinePath::Orchestrated => "orchestrated",
            PipelinePath::Legacy => "legacy",
            PipelinePath::Triage => "triage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "orchestrated" => Some(PipelinePath::Orchestrated),
            "legacy" => Some(PipelinePath::Legacy),
            "triage" => Some(PipelinePath::Triage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BookAttribution {
    pub key: String,
    pub pretty: String,
    pub author: String,
}

/// The decision record written on every assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TurnMetadata {
    pub phase: Phase,
    pub advice_intent: bool,
    pub safety_flag_this_turn: bool,
    pub gate_reason: Option<GateReason>,
    pub book_selection_reason: Option<BookSelectionReason>,
    pub book_attributions: Vec<BookAttribution>,
    pub scrubbed_books: Vec<String>,
    pub asked_question: bool,
    pub rooted_in_jesus_emphasis: bool,
    pub jesus_invite_variant: u8,
    pub topic: Option<Topic>,
    pub topic_confidence: f64,
    pub path: PipelinePath,
    pub allow_books: bool,
    pub allow_jesus: bool,
    pub cadence_reason: Option<CadenceReason>,
    pub planner_retries: u32,
    pub fallback_reason: Option<String>,
    pub declined_jesus_until_turn: Option<u32>,
}

impl Default for TurnMetadata {
    fn default() -> Self {
        Self {
            phase: Phase::Intake,
            advice_intent: false,
            safety_flag_this_turn: false,
            gate_reason: None,
            book_selection_reason: None,
            book_attributions: Vec::new(),
            scrubbed_books: Vec::new(),
            asked_question: true,
            rooted_in_jesus_emphasis: false,
            jesus_invite_variant: 0,
            topic: None,
            topic_confidence: 0.0,
            path: PipelinePath::Legacy,
            allow_books: false,
            allow_jesus: false,
            cadence_reason: None,
            planner_retries: 0,
            fallback_reason: None,
            declined_jesus_until_turn: None,
        }
    }
}

#[derive(Serialize)]
struct CanonicalWithAlias<'a> {
    #[serde(flatten)]
    meta: &'a TurnMetadata,
    had_jesus_invite: bool,
}

impl TurnMetadata {
    /// Serialize with the canonical keys plus the `had_jesus_invite` alias.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(CanonicalWithAlias {
            meta: self,
            had_jesus_invite: self.allow_jesus,
        })
        .unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

/// Coerce an arbitrary (possibly partial, possibly loosely typed) metadata
/// value into the canonical record. Never fails; unknown keys are dropped.
pub fn normalize_meta(raw: &Value) -> TurnMetadata {
    let empty = Map::new();
    let map = raw.as_object().unwrap_or(&empty);
    let defaults = TurnMetadata::default();
    let field = |key: &str| map.get(key).filter(|value| !value.is_null());

    TurnMetadata {
        phase: field("phase")
            .and_then(Value::as_str)
            .and_then(Phase::parse)
            .unwrap_or(defaults.phase),
        advice_intent: coerce_bool(field("advice_intent"), defaults.advice_intent),
        safety_flag_this_turn: coerce_bool(
            field("safety_flag_this_turn"),
            defaults.safety_flag_this_turn,
        ),
        gate_reason: field("gate_reason")
            .and_then(Value::as_str)
            .and_then(GateReason::parse),
        book_selection_reason: field("book_selection_reason")
            .and_then(Value::as_str)
            .and_then(BookSelectionReason::parse),
        book_attributions: field("book_attributions")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(coerce_attribution).collect())
            .unwrap_or_default(),
        scrubbed_books: field("scrubbed_books")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        asked_question: coerce_bool(field("asked_question"), defaults.asked_question),
        rooted_in_jesus_emphasis: coerce_bool(
            field("rooted_in_jesus_emphasis"),
            defaults.rooted_in_jesus_emphasis,
        ),
        jesus_invite_variant: coerce_u64(field("jesus_invite_variant"))
            .map(|variant| variant.min(u64::from(MAX_INVITE_VARIANT)) as u8)
            .unwrap_or(defaults.jesus_invite_variant),
        topic: field("topic")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .map(Topic::parse_or_other),
        topic_confidence: coerce_confidence(field("topic_confidence")),
        path: field("path")
            .and_then(Value::as_str)
            .and_then(PipelinePath::parse)
            .unwrap_or(defaults.path),
        allow_books: coerce_bool(field("allow_books"), defaults.allow_books),
        allow_jesus: coerce_bool(
            field("allow_jesus").or_else(|| field(HAD_JESUS_INVITE_ALIAS)),
            defaults.allow_jesus,
        ),
        cadence_reason: field("cadence_reason")
            .and_then(Value::as_str)
            .and_then(CadenceReason::parse),
        planner_retries: coerce_u64(field("planner_retries"))
            .map(|retries| u32::try_from(retries).unwrap_or(u32::MAX))
            .unwrap_or(defaults.planner_retries),
        fallback_reason: field("fallback_reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        declined_jesus_until_turn: coerce_u64(field("declined_jesus_until_turn"))
            .and_then(|turn| u32::try_from(turn).ok()),
    }
}

/// `normalize_meta` followed by serialization, for callers that only deal in JSON.
pub fn normalize_value(raw: &Value) -> Value {
    normalize_meta(raw).to_value()
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" | "" => false,
            _ => default,
        },
        _ => default,
    }
}

fn coerce_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n.trunc() as u64)
        }),
        Value::String(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
                trimmed.parse().ok()
            } else {
                None
            }
        }
        _ => None,
    }
}

fn coerce_confidence(value: Option<&Value>) -> f64 {
    let raw = match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) }
}

fn coerce_attribution(value: &Value) -> Option<BookAttribution> {
    let object = value.as_object()?;
    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("?")
            .to_string()
    };
    Some(BookAttribution {
        key: text("key"),
        pretty: text("pretty"),
        author: text("author"),
    })
}
