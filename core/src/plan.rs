//! The structured response plan requested from the planner, and its
//! semantic validator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::classify::Topic;
use crate::error::PlanError;
use crate::llm::extract_json;
use crate::metadata::{Phase, MAX_INVITE_VARIANT};

pub const MIN_STEPS: usize = 3;
pub const MAX_STEPS: usize = 5;
pub const MIN_STEP_MINUTES: i64 = 5;
pub const MAX_STEP_MINUTES: i64 = 180;
pub const MIN_TRUTH_ANCHOR_CHARS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SafetyAssessment {
    pub flag: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PlanStep {
    pub title: String,
    /// The spoken script for this step.
    pub how_to_say_it: String,
    pub time_estimate_min: i64,
    /// "If <condition>, then <action>".
    #[serde(default)]
    pub trigger_if_then: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PlanBody {
    pub mirror: String,
    pub diagnose: String,
    /// Grounding reference the advice rests on.
    pub truth_anchor: String,
    pub steps_7day: Vec<PlanStep>,
    #[serde(default)]
    pub obstacles: Vec<String>,
    pub check_in_question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ResponsePlan {
    pub phase: Phase,
    pub safety: SafetyAssessment,
    pub topic: Topic,
    #[serde(default)]
    pub topic_confidence: f64,
    #[serde(default)]
    pub jesus_invite_allowed: bool,
    #[serde(default)]
    pub jesus_invite_variant: u8,
    /// Registry keys the planner thinks are relevant. Advisory only; the
    /// server decides what is cited.
    #[serde(default)]
    pub book_candidate_keys: Vec<String>,
    pub plan: PlanBody,
}

/// Turn a raw planner reply into a plan. Structural failures only; semantic
/// checks live in [`validate_plan`].
pub fn parse_plan(raw: &str) -> Result<ResponsePlan, PlanError> {
    let value: Value = serde_json::from_str(extract_json(raw))
        .map_err(|err| PlanError::InvalidJson(err.to_string()))?;
    serde_json::from_value(value).map_err(|err| PlanError::Schema(err.to_string()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanViolation {
    #[error("steps_7day must have 3-5 items, got {0}")]
    StepCount(usize),
    #[error("step {step} is missing a title")]
    MissingTitle { step: usize },
    #[error("step {step} is missing how_to_say_it")]
    MissingScript { step: usize },
    #[error("step {step} time_estimate_min must be 5-180, got {minutes}")]
    StepTime { step: usize, minutes: i64 },
    #[error("at least one step needs a trigger_if_then")]
    NoTrigger,
    #[error("truth_anchor is missing, too short, or a placeholder")]
    TrivialTruthAnchor,
    #[error("topic_confidence out of range: {0}")]
    ConfidenceOutOfRange(f64),
    #[error("jesus_invite_variant must be 0-6, got {0}")]
    VariantOutOfRange(u8),
    #[error("jesus_invite_allowed but jesus_invite_variant is 0")]
    AllowedWithoutVariant,
    #[error("jesus_invite_variant is set but jesus_invite_allowed is false")]
    VariantWithoutPermission,
    #[error("at least one obstacle is required")]
    NoObstacles,
    #[error("check_in_question is missing")]
    MissingCheckIn,
}

const PLACEHOLDER_ANCHORS: &[&str] = &[
    "tbd", "todo", "n/a", "na", "none", "placeholder", "...", "lorem ipsum", "truth anchor",
];

fn is_trivial_anchor(anchor: &str) -> bool {
    let trimmed = anchor.trim();
    let lowered = trimmed.to_lowercase();
    trimmed.chars().count() < MIN_TRUTH_ANCHOR_CHARS
        || PLACEHOLDER_ANCHORS.contains(&lowered.as_str())
        || lowered.starts_with("lorem ipsum")
}

/// Every rule that the plan breaks. Empty means the plan is usable.
pub fn validate_plan(plan: &ResponsePlan) -> Vec<PlanViolation> {
    let mut violations = Vec::new();

    if !(0.0..=1.0).contains(&plan.topic_confidence) {
        violations.push(PlanViolation::ConfidenceOutOfRange(plan.topic_confidence));
    }

    if plan.jesus_invite_variant > MAX_INVITE_VARIANT {
        violations.push(PlanViolation::VariantOutOfRange(plan.jesus_invite_variant));
    } else if plan.jesus_invite_allowed && plan.jesus_invite_variant == 0 {
        violations.push(PlanViolation::AllowedWithoutVariant);
    } else if !plan.jesus_invite_allowed && plan.jesus_invite_variant > 0 {
        violations.push(PlanViolation::VariantWithoutPermission);
    }

    let steps = &plan.plan.steps_7day;
    if !(MIN_STEPS..=MAX_STEPS).contains(&steps.len()) {
        violations.push(PlanViolation::StepCount(steps.len()));
    }
    for (index, step) in steps.iter().enumerate() {
        let step_no = index + 1;
        if step.title.trim().is_empty() {
            violations.push(PlanViolation::MissingTitle { step: step_no });
        }
        if step.how_to_say_it.trim().is_empty() {
            violations.push(PlanViolation::MissingScript { step: step_no });
        }
        if !(MIN_STEP_MINUTES..=MAX_STEP_MINUTES).contains(&step.time_estimate_min) {
            violations.push(PlanViolation::StepTime {
                step: step_no,
                minutes: step.time_estimate_min,
            });
        }
    }
    let has_trigger = steps.iter().any(|step| {
        step.trigger_if_then
            .as_deref()
            .is_some_and(|trigger| !trigger.trim().is_empty())
    });
    if !has_trigger {
        violations.push(PlanViolation::NoTrigger);
    }

    if plan.plan.obstacles.iter().all(|obstacle| obstacle.trim().is_empty()) {
        violations.push(PlanViolation::NoObstacles);
    }
    if plan.plan.check_in_question.trim().is_empty() {
        violations.push(PlanViolation::MissingCheckIn);
    }
    if is_trivial_anchor(&plan.plan.truth_anchor) {
        violations.push(PlanViolation::TrivialTruthAnchor);
    }

    violations
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub(crate) fn step(n: usize) -> PlanStep {
        PlanStep {
            title: format!("Step {n}"),
            how_to_say_it: "I want to understand what today felt like for you.".to_string(),
            time_estimate_min: 10,
            trigger_if_then: Some("If voices rise, then take a ten minute pause".to_string()),
        }
    }

    pub(crate) fn valid_plan() -> ResponsePlan {
        ResponsePlan {
            phase: Phase::Advice,
            safety: SafetyAssessment::default(),
            topic: Topic::Conflict,
            topic_confidence: 0.8,
            jesus_invite_allowed: true,
            jesus_invite_variant: 1,
            book_candidate_keys: Vec::new(),
            plan: PlanBody {
                mirror: "It sounds like the arguing has worn you both down.".to_string(),
                diagnose: "Small frustrations are stacking up without repair.".to_string(),
                truth_anchor: "Be quick to listen and slow to speak (James 1:19).".to_string(),
                steps_7day: (1..=3).map(step).collect(),
                obstacles: vec!["Fatigue after work".to_string()],
                check_in_question: "Which of these feels most doable tonight?".to_string(),
            },
        }
    }
}
