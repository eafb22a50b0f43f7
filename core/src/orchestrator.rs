//! Per-turn pipeline.
//!
//! `safety_check -> (triage | classify) -> intake_update -> draft -> invite_gate
//! -> resource_gate -> scrub -> normalize`. The draft comes from one of two
//! strategies: the structured planner or the legacy heuristics. Any structural
//! planner failure falls through to the legacy strategy, and both converge on
//! the same gating tail and the same metadata record.

use crate::cadence::{gate_invite, is_decline, InviteGateInput};
use crate::classify::{classify_keywords, classify_with_model, Topic, TopicClassification};
use crate::compose::{
    append_paragraph, invite_line, render_plan, rotating_variant, sources_line,
    GATED_RESOURCES_NOTE, SAFE_REPLY,
};
use crate::config::EngineConfig;
use crate::conversation::ConversationState;
use crate::error::{LlmError, PlanError};
use crate::intake::{extract_signals, IntakeUpdate};
use crate::legacy::{build_messages, derive_phase, detect_advice_intent};
use crate::llm::{bound_history, ChatMessage, ChatModel, ChatRequest, Role};
use crate::metadata::{
    BookSelectionReason, CadenceReason, GateReason, Phase, PipelinePath, TurnMetadata,
    MAX_INVITE_VARIANT,
};
use crate::plan::{parse_plan, validate_plan, PlanViolation, ResponsePlan};
use crate::resources::{gate_books, BookGateInput, ResourceRegistry, Scrubber};
use crate::safety::{pre_moderate, triage_metadata, triage_reply};

pub const PLAN_VALIDATION_FAILED: &str = "plan_validation_failed";
pub const LLM_UNAVAILABLE: &str = "llm_unavailable";
const INSIGHT_LIMIT: usize = 6;

const PLANNER_POLICY: &str = r#"You are a Christian marriage mentor and pastoral counselor.
Return ONLY one JSON object, with no markdown and no commentary, shaped like:
{"phase": "intake|chat|advice", "safety": {"flag": bool, "reason": string|null},
 "topic": "conflict|betrayal|porn|intimacy|finances|parenting|boundaries|other",
 "topic_confidence": 0.0-1.0, "jesus_invite_allowed": bool, "jesus_invite_variant": 0-6,
 "book_candidate_keys": [string],
 "plan": {"mirror": string, "diagnose": string, "truth_anchor": string,
          "steps_7day": [{"title": string, "how_to_say_it": string, "time_estimate_min": 5-180, "trigger_if_then": string|null}],
          "obstacles": [string], "check_in_question": string}}
Rules:
- Tone: warm, candid, hopeful, never shaming.
- steps_7day has 3 to 5 steps; each has a spoken script and at least one step has an if/then trigger.
- truth_anchor is a real grounding truth (for example a Scripture with reference), never a placeholder.
- jesus_invite_variant is 0 exactly when jesus_invite_allowed is false. The server makes the final call.
- Never write book titles, authors, publishers, URLs or links in any field. Paraphrase principles instead.
- Set safety.flag when there is any risk of harm, abuse or self-harm."#;

/// Everything the engine needs for one turn.
#[derive(Debug, Clone)]
pub struct TurnInput<'a> {
    /// 0-based index of the assistant turn being produced.
    pub turn_index: u32,
    pub user_message: &'a str,
    /// Prior messages, oldest first. Bounded before being sent anywhere.
    pub history: &'a [ChatMessage],
    pub state: ConversationState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    pub metadata: TurnMetadata,
    /// Conversation state to persist alongside the reply.
    pub state: ConversationState,
}

/// Number of assistant messages already in the conversation.
pub fn turn_index_of(history: &[ChatMessage]) -> u32 {
    let count = history
        .iter()
        .filter(|message| message.role == Role::Assistant)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// How the draft reply for a turn is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Orchestrated,
    Legacy,
}

impl Strategy {
    pub fn from_config(config: &EngineConfig) -> Self {
        if config.orchestration_enabled {
            Strategy::Orchestrated
        } else {
            Strategy::Legacy
        }
    }
}

#[derive(Debug)]
enum DraftBody {
    Plan(Box<ResponsePlan>),
    Text(String),
    /// Fixed safe reply; no citations and no invitation.
    Safe,
    /// The planner flagged risk; serve the triage reply.
    Triage,
}

/// Strategy output consumed by the shared gating tail.
#[derive(Debug)]
struct Draft {
    path: PipelinePath,
    phase: Phase,
    advice_intent: bool,
    safety_flag: bool,
    topic: Option<Topic>,
    topic_confidence: f64,
    plan_allows_invite: bool,
    invite_variant: u8,
    body: DraftBody,
    planner_retries: u32,
    fallback_reason: Option<String>,
}

struct TurnContext<'a> {
    turn_index: u32,
    user_message: &'a str,
    history: &'a [ChatMessage],
    state: &'a ConversationState,
    classification: Option<TopicClassification>,
}

enum PlanOutcome {
    Valid {
        plan: ResponsePlan,
        retries: u32,
    },
    Invalid {
        plan: ResponsePlan,
        retries: u32,
        violations: Vec<PlanViolation>,
    },
}

struct PlannerFailure {
    error: PlanError,
    retries: u32,
}

pub struct Engine<M> {
    model: M,
    config: EngineConfig,
    registry: ResourceRegistry,
    scrubber: Scrubber,
}

impl<M: ChatModel> Engine<M> {
    pub fn new(model: M, config: EngineConfig, registry: ResourceRegistry) -> Self {
        let scrubber = Scrubber::new(&registry);
        Self {
            model,
            config,
            registry,
            scrubber,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Run one turn. Never fails: model and planner problems are absorbed
    /// into fallbacks and recorded in the metadata.
    pub async fn run_turn(&self, input: TurnInput<'_>) -> TurnOutcome {
        let TurnInput {
            turn_index,
            user_message,
            history,
            mut state,
        } = input;

        if state.cadence.last_turn_had_jesus && is_decline(user_message) {
            state.intake = state.intake.merge(IntakeUpdate {
                prayer_consent_known: true,
                ..IntakeUpdate::default()
            });
            let count_before = state.cadence.jesus_decline_count;
            let cooldown = state.cadence.register_decline(turn_index, &self.config.cadence);
            tracing::info!(
                turn_index,
                decline_count = count_before + 1,
                cooldown_until = ?cooldown,
                "invite_declined"
            );
        }

        let verdict = pre_moderate(user_message);
        if verdict.flag {
            tracing::warn!(
                turn_index,
                indicator = verdict.indicator.as_deref().unwrap_or_default(),
                "safety_triage"
            );
            return finish_triage(turn_index, state, PipelinePath::Triage, 0);
        }

        let classification = self.classify(user_message).await;

        let signals = extract_signals(user_message);
        state.intake = state.intake.merge(signals.update);
        if let Some(consent) = signals.prayer_consent {
            state.prayer_consent = Some(consent);
        }

        let bounded = bound_history(history, self.config.history_turn_limit);
        let context = TurnContext {
            turn_index,
            user_message,
            history: &bounded,
            state: &state,
            classification,
        };
        let draft = match Strategy::from_config(&self.config) {
            Strategy::Legacy => self.legacy_draft(&context, 0, None).await,
            Strategy::Orchestrated => match self.orchestrated_draft(&context).await {
                Ok(draft) => draft,
                Err(failure) => {
                    tracing::warn!(
                        turn_index,
                        retries = failure.retries,
                        error_class = failure.error.class(),
                        error = %failure.error,
                        "planner_fallback"
                    );
                    self.legacy_draft(
                        &context,
                        failure.retries,
                        Some(failure.error.class().to_string()),
                    )
                    .await
                }
            },
        };

        self.finish(turn_index, draft, state)
    }

    async fn classify(&self, text: &str) -> Option<TopicClassification> {
        let attempt = tokio::time::timeout(
            self.config.planner_timeout(),
            classify_with_model(&self.model, &self.config, text),
        )
        .await;
        match attempt {
            Ok(Ok(classification)) => Some(classification),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "topic classifier failed");
                None
            }
            Err(_) => {
                tracing::warn!("topic classifier timed out");
                None
            }
        }
    }

    async fn orchestrated_draft(&self, ctx: &TurnContext<'_>) -> Result<Draft, PlannerFailure> {
        let insight_topic = ctx.classification.map(|c| c.topic);
        let insights = self.registry.insight_clauses(insight_topic, INSIGHT_LIMIT);
        let base = planner_messages(ctx, &insights);

        match self.acquire_plan(&base).await? {
            PlanOutcome::Valid { plan, retries } => {
                let (topic, topic_confidence) = merge_topic(&plan, ctx.classification);
                let body = if plan.safety.flag {
                    DraftBody::Triage
                } else {
                    DraftBody::Plan(Box::new(plan.clone()))
                };
                Ok(Draft {
                    path: PipelinePath::Orchestrated,
                    phase: plan.phase,
                    advice_intent: plan.phase == Phase::Advice
                        || detect_advice_intent(ctx.user_message),
                    safety_flag: plan.safety.flag,
                    topic,
                    topic_confidence,
                    plan_allows_invite: plan.jesus_invite_allowed,
                    invite_variant: plan.jesus_invite_variant,
                    body,
                    planner_retries: retries,
                    fallback_reason: None,
                })
            }
            PlanOutcome::Invalid {
                plan,
                retries,
                violations,
            } => {
                let summary: Vec<String> = violations.iter().map(ToString::to_string).collect();
                tracing::warn!(
                    turn_index = ctx.turn_index,
                    retries,
                    violations = %summary.join("; "),
                    "planner_fallback"
                );
                let (topic, topic_confidence) = merge_topic(&plan, ctx.classification);
                Ok(Draft {
                    path: PipelinePath::Orchestrated,
                    phase: plan.phase,
                    advice_intent: plan.phase == Phase::Advice
                        || detect_advice_intent(ctx.user_message),
                    safety_flag: plan.safety.flag,
                    topic,
                    topic_confidence,
                    plan_allows_invite: false,
                    invite_variant: 0,
                    body: DraftBody::Safe,
                    planner_retries: retries,
                    fallback_reason: Some(PLAN_VALIDATION_FAILED.to_string()),
                })
            }
        }
    }

    /// Bounded planner loop. Structural errors are retried up to
    /// `max_planner_retries` with a correction hint; a semantically invalid
    /// plan gets exactly one repair request. `retries` counts re-requests.
    async fn acquire_plan(&self, base: &[ChatMessage]) -> Result<PlanOutcome, PlannerFailure> {
        let max_retries = self.config.max_planner_retries;
        let mut retries: u32 = 0;
        let mut repaired = false;
        let mut hint: Option<String> = None;

        loop {
            let mut messages = base.to_vec();
            if let Some(hint) = &hint {
                messages.push(ChatMessage::system(hint.clone()));
            }
            tracing::info!(attempt = retries, repair = repaired, "planner_attempt");

            match self.request_plan(messages).await {
                Err(error) => {
                    if retries >= max_retries {
                        return Err(PlannerFailure { error, retries });
                    }
                    tracing::debug!(error_class = error.class(), "planner structural error; retrying");
                    hint = Some(correction_hint(&error));
                    retries += 1;
                }
                Ok(plan) => {
                    let violations = validate_plan(&plan);
                    if violations.is_empty() {
                        return Ok(PlanOutcome::Valid { plan, retries });
                    }
                    if repaired {
                        return Ok(PlanOutcome::Invalid {
                            plan,
                            retries,
                            violations,
                        });
                    }
                    repaired = true;
                    hint = Some(repair_hint(&violations));
                    retries += 1;
                }
            }
        }
    }

    async fn request_plan(&self, messages: Vec<ChatMessage>) -> Result<ResponsePlan, PlanError> {
        let request = ChatRequest {
            model: self.config.model_name.clone(),
            messages,
            temperature: self.config.temperature,
            json_mode: true,
        };
        let raw = tokio::time::timeout(self.config.planner_timeout(), self.model.chat(&request))
            .await
            .map_err(|_| LlmError::Timeout(self.config.planner_timeout_secs))??;
        if raw.trim().is_empty() {
            return Err(LlmError::EmptyReply.into());
        }
        parse_plan(&raw)
    }

    async fn legacy_draft(
        &self,
        ctx: &TurnContext<'_>,
        planner_retries: u32,
        fallback_reason: Option<String>,
    ) -> Draft {
        let classification = ctx
            .classification
            .unwrap_or_else(|| classify_keywords(ctx.user_message));
        let advice_intent = detect_advice_intent(ctx.user_message);
        let phase = derive_phase(&ctx.state.intake, advice_intent);

        let request = ChatRequest {
            model: self.config.model_name.clone(),
            messages: build_messages(ctx.history, ctx.user_message, phase, ctx.turn_index == 0),
            temperature: self.config.temperature,
            json_mode: false,
        };
        let completion =
            tokio::time::timeout(self.config.planner_timeout(), self.model.chat(&request)).await;
        let (body, completion_failure) = match completion {
            Ok(Ok(text)) if !text.trim().is_empty() => (DraftBody::Text(text), None),
            Ok(Ok(_)) => (DraftBody::Safe, Some(LlmError::EmptyReply.to_string())),
            Ok(Err(err)) => (DraftBody::Safe, Some(err.to_string())),
            Err(_) => (
                DraftBody::Safe,
                Some(LlmError::Timeout(self.config.planner_timeout_secs).to_string()),
            ),
        };
        if let Some(error) = &completion_failure {
            tracing::warn!(turn_index = ctx.turn_index, error = %error, "legacy completion failed");
        }

        Draft {
            path: PipelinePath::Legacy,
            phase,
            advice_intent,
            safety_flag: false,
            topic: Some(classification.topic),
            topic_confidence: classification.confidence,
            plan_allows_invite: true,
            invite_variant: rotating_variant(ctx.turn_index),
            body,
            planner_retries,
            fallback_reason: fallback_reason
                .or_else(|| completion_failure.map(|_| LLM_UNAVAILABLE.to_string())),
        }
    }

    /// Shared tail: gates, composition, scrubbing and the metadata record.
    fn finish(&self, turn_index: u32, draft: Draft, mut state: ConversationState) -> TurnOutcome {
        let mut reply = match &draft.body {
            DraftBody::Triage => {
                tracing::warn!(turn_index, indicator = "planner", "safety_triage");
                return finish_triage(turn_index, state, draft.path, draft.planner_retries);
            }
            DraftBody::Plan(plan) => render_plan(plan),
            DraftBody::Text(text) => text.trim().to_string(),
            DraftBody::Safe => SAFE_REPLY.to_string(),
        };
        let safe_reply = matches!(draft.body, DraftBody::Safe);
        let intake_completed = state.intake.completed;

        tracing::info!(
            turn_index,
            phase = draft.phase.as_str(),
            advice_intent = draft.advice_intent,
            intake_complete = intake_completed,
            topic = draft.topic.map(Topic::as_str),
            topic_confidence = draft.topic_confidence,
            "phase_gate"
        );

        let invite = gate_invite(
            &InviteGateInput {
                phase: draft.phase,
                advice_intent: draft.advice_intent,
                intake_completed,
                safety_flag: draft.safety_flag,
                turn_index,
                last_jesus_invite_turn: state.cadence.last_jesus_invite_turn,
                declined_jesus_until_turn: state.cadence.declined_jesus_until_turn,
                last_turn_had_jesus: state.cadence.last_turn_had_jesus,
                prayer_consent: state.prayer_consent,
                plan_allows_invite: draft.plan_allows_invite,
            },
            &self.config.cadence,
        );
        let books = gate_books(
            &BookGateInput {
                phase: draft.phase,
                intake_completed,
                safety_flag: draft.safety_flag,
                topic_confidence: draft.topic_confidence,
            },
            self.config.topic_confidence_threshold,
        );
        let allow_jesus = invite.allow && !safe_reply;
        let allow_books = books.allow && !safe_reply;
        // A reason of `ok` must never sit next to a withheld gate.
        let cadence_reason = if invite.allow && !allow_jesus {
            CadenceReason::PlanBlocked
        } else {
            invite.reason
        };
        let gate_reason = if books.allow && !allow_books {
            GateReason::Gated
        } else {
            books.reason
        };

        let attributions = if allow_books {
            self.registry.attributions_for(draft.topic)
        } else {
            Vec::new()
        };
        let invite_variant = if allow_jesus {
            draft.invite_variant.clamp(1, MAX_INVITE_VARIANT)
        } else {
            0
        };
        if allow_jesus {
            append_paragraph(&mut reply, invite_line(invite_variant));
        }
        if allow_books && let Some(line) = sources_line(&attributions, &self.registry) {
            append_paragraph(&mut reply, &line);
        }

        let scrubbed = self.scrubber.scrub_if_gated(&reply, allow_books);
        let mut reply = scrubbed.text;
        if !allow_books && !scrubbed.removed.is_empty() {
            append_paragraph(&mut reply, GATED_RESOURCES_NOTE);
        }

        tracing::info!(
            turn_index,
            path = draft.path.as_str(),
            allow = allow_books,
            reason = gate_reason.as_str(),
            scrubbed = scrubbed.removed.len(),
            "books_gate"
        );
        tracing::info!(
            turn_index,
            last_invite = ?state.cadence.last_jesus_invite_turn,
            cooldown_until = ?state.cadence.declined_jesus_until_turn,
            consent = ?state.prayer_consent,
            allow = allow_jesus,
            cadence_reason = cadence_reason.as_str(),
            "invite_gate"
        );

        state.cadence.record_turn(turn_index, allow_jesus);

        let book_selection_reason = if !allow_books {
            BookSelectionReason::Gated
        } else if attributions.is_empty() {
            BookSelectionReason::None
        } else {
            BookSelectionReason::Contextual
        };

        let metadata = TurnMetadata {
            phase: draft.phase,
            advice_intent: draft.advice_intent,
            safety_flag_this_turn: draft.safety_flag,
            gate_reason: Some(gate_reason),
            book_selection_reason: Some(book_selection_reason),
            book_attributions: attributions,
            scrubbed_books: scrubbed.removed,
            asked_question: reply.contains('?'),
            rooted_in_jesus_emphasis: allow_jesus,
            jesus_invite_variant: invite_variant,
            topic: draft.topic,
            topic_confidence: draft.topic_confidence.clamp(0.0, 1.0),
            path: draft.path,
            allow_books,
            allow_jesus,
            cadence_reason: Some(cadence_reason),
            planner_retries: draft.planner_retries,
            fallback_reason: draft.fallback_reason,
            declined_jesus_until_turn: state.cadence.declined_jesus_until_turn,
        };

        TurnOutcome {
            reply,
            metadata,
            state,
        }
    }
}

fn finish_triage(
    turn_index: u32,
    mut state: ConversationState,
    path: PipelinePath,
    planner_retries: u32,
) -> TurnOutcome {
    state.cadence.record_turn(turn_index, false);
    let mut metadata = triage_metadata(state.cadence.declined_jesus_until_turn);
    metadata.path = path;
    metadata.planner_retries = planner_retries;
    TurnOutcome {
        reply: triage_reply(),
        metadata,
        state,
    }
}

/// Plan topic unless it is `other`, in which case the classifier's topic
/// wins. Confidence is the higher of the two.
fn merge_topic(
    plan: &ResponsePlan,
    classification: Option<TopicClassification>,
) -> (Option<Topic>, f64) {
    let plan_confidence = if plan.topic_confidence.is_nan() {
        0.0
    } else {
        plan.topic_confidence.clamp(0.0, 1.0)
    };
    let topic = match (plan.topic, classification) {
        (Topic::Other, Some(classified)) => classified.topic,
        (topic, _) => topic,
    };
    let confidence = classification
        .map_or(plan_confidence, |classified| plan_confidence.max(classified.confidence));
    (Some(topic), confidence)
}

fn planner_messages(ctx: &TurnContext<'_>, insights: &[String]) -> Vec<ChatMessage> {
    let intake = &ctx.state.intake;
    let mut messages = vec![
        ChatMessage::system(PLANNER_POLICY),
        ChatMessage::system(format!(
            "Turn context: assistant turn {}. Intake: issue_named={}, safety_cleared={}, goal_captured={}, prayer_consent_known={}, completed={}. \
             While intake is not completed use phase \"intake\" and let check_in_question ask for what is still missing.",
            ctx.turn_index,
            intake.issue_named,
            intake.safety_cleared,
            intake.goal_captured,
            intake.prayer_consent_known,
            intake.completed,
        )),
    ];
    if !insights.is_empty() {
        let bullets: Vec<String> = insights.iter().map(|clause| format!("- {clause}")).collect();
        messages.push(ChatMessage::system(format!(
            "Coaching insights (paraphrase freely, never attribute):\n{}",
            bullets.join("\n")
        )));
    }
    messages.extend(ctx.history.iter().cloned());
    messages.push(ChatMessage::user(ctx.user_message));
    messages
}

fn correction_hint(error: &PlanError) -> String {
    match error {
        PlanError::Llm(_) => "The previous attempt failed. Return ONLY a single valid JSON object matching the schema, with quoted keys and no trailing commas.".to_string(),
        PlanError::InvalidJson(detail) => format!("Fix and return valid JSON only. Error: {detail}"),
        PlanError::Schema(detail) => format!(
            "Your JSON did not match the schema. Correct the fields and return only the JSON object. Error: {detail}"
        ),
    }
}

fn repair_hint(violations: &[PlanViolation]) -> String {
    let rules: Vec<String> = violations.iter().map(ToString::to_string).collect();
    format!(
        "Revise the JSON to satisfy these constraints and return only the fixed JSON object: {}",
        rules.join("; ")
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::cadence::CadenceState;
    use crate::intake::IntakeState;
    use crate::llm::testing::ScriptedModel;
    use crate::metadata::{normalize_meta, CANONICAL_KEYS};
    use crate::plan::fixtures::{step, valid_plan};
    use crate::resources::RESOURCE_PLACEHOLDER;

    const CLASSIFIED_CONFLICT: &str = r#"{"topic": "conflict", "confidence": 0.7}"#;

    fn engine(model: ScriptedModel) -> Engine<ScriptedModel> {
        Engine::new(model, EngineConfig::default(), ResourceRegistry::builtin())
    }

    fn legacy_engine(model: ScriptedModel) -> Engine<ScriptedModel> {
        let config = EngineConfig {
            orchestration_enabled: false,
            ..EngineConfig::default()
        };
        Engine::new(model, config, ResourceRegistry::builtin())
    }

    fn completed_state() -> ConversationState {
        ConversationState {
            intake: IntakeState::default().merge(IntakeUpdate::all()),
            ..ConversationState::default()
        }
    }

    fn plan_json(plan: &ResponsePlan) -> String {
        serde_json::to_string(plan).unwrap()
    }

    async fn run(
        engine: &Engine<ScriptedModel>,
        turn_index: u32,
        message: &str,
        state: ConversationState,
    ) -> TurnOutcome {
        engine
            .run_turn(TurnInput {
                turn_index,
                user_message: message,
                history: &[],
                state,
            })
            .await
    }

    #[test]
    fn turn_index_counts_assistant_messages() {
        let history = vec![
            ChatMessage::system("policy"),
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
            ChatMessage::assistant("d"),
        ];
        assert_eq!(turn_index_of(&history), 2);
        assert_eq!(turn_index_of(&[]), 0);
    }

    #[tokio::test]
    async fn first_turn_blocks_invite_but_allows_books() {
        let model = ScriptedModel::new()
            .reply(CLASSIFIED_CONFLICT)
            .reply(plan_json(&valid_plan()));
        let outcome = run(&engine(model), 0, "How do we stop fighting?", completed_state()).await;
        let meta = &outcome.metadata;

        assert!(!meta.allow_jesus);
        assert_eq!(meta.cadence_reason, Some(CadenceReason::FirstTurn));
        assert!(meta.allow_books);
        assert_eq!(meta.gate_reason, Some(GateReason::Ok));
        assert_eq!(meta.book_selection_reason, Some(BookSelectionReason::Contextual));
        assert!(!meta.book_attributions.is_empty() && meta.book_attributions.len() <= 3);
        assert!(outcome.reply.contains("Sources: "));
        assert_eq!(meta.path, PipelinePath::Orchestrated);
        assert_eq!(meta.planner_retries, 0);
        assert_eq!(meta.topic, Some(Topic::Conflict));
        assert_eq!(meta.topic_confidence, 0.8);
        assert!(!outcome.state.cadence.last_turn_had_jesus);
    }

    #[tokio::test]
    async fn invite_is_appended_and_recorded_when_allowed() {
        let model = ScriptedModel::new()
            .reply(CLASSIFIED_CONFLICT)
            .reply(plan_json(&valid_plan()));
        let mut state = completed_state();
        state.cadence.last_jesus_invite_turn = Some(1);
        let outcome = run(&engine(model), 5, "What should we do this week?", state).await;

        assert!(outcome.metadata.allow_jesus);
        assert_eq!(outcome.metadata.cadence_reason, Some(CadenceReason::Ok));
        assert_eq!(outcome.metadata.jesus_invite_variant, 1);
        assert!(outcome.metadata.rooted_in_jesus_emphasis);
        assert!(outcome.reply.contains(invite_line(1)));
        assert_eq!(outcome.state.cadence.last_jesus_invite_turn, Some(5));
        assert!(outcome.state.cadence.last_turn_had_jesus);
    }

    #[tokio::test]
    async fn repeated_declines_start_a_cooldown() {
        let engine = legacy_engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply("I hear you. Is there something else on your mind?")
                .reply(CLASSIFIED_CONFLICT)
                .reply("Okay. What would help most right now?"),
        );
        let mut state = completed_state();
        state.cadence = CadenceState {
            last_jesus_invite_turn: Some(5),
            declined_jesus_until_turn: None,
            jesus_decline_count: 1,
            last_turn_had_jesus: true,
        };

        let declined = run(&engine, 6, "No thanks.", state).await;
        assert_eq!(declined.state.cadence.declined_jesus_until_turn, Some(12));
        assert_eq!(declined.state.cadence.jesus_decline_count, 0);
        assert_eq!(declined.metadata.declined_jesus_until_turn, Some(12));
        assert!(!declined.metadata.allow_jesus);

        let later = run(&engine, 8, "What should we do next?", declined.state).await;
        assert!(!later.metadata.allow_jesus);
        assert_eq!(later.metadata.cadence_reason, Some(CadenceReason::CooldownDeclined));
        assert_eq!(later.metadata.declined_jesus_until_turn, Some(12));
    }

    #[tokio::test]
    async fn decline_without_prior_invite_is_ignored() {
        let engine = legacy_engine(ScriptedModel::new().reply(CLASSIFIED_CONFLICT).reply("Okay?"));
        let outcome = run(&engine, 3, "No thanks.", completed_state()).await;
        assert_eq!(outcome.state.cadence.jesus_decline_count, 0);
        assert_eq!(outcome.state.cadence.declined_jesus_until_turn, None);
    }

    #[tokio::test]
    async fn safety_terms_short_circuit_to_triage() {
        let model = ScriptedModel::new();
        let engine = engine(model);
        let mut state = completed_state();
        state.cadence.last_jesus_invite_turn = Some(1);
        let outcome = run(&engine, 7, "I keep thinking about suicide", state).await;
        let meta = &outcome.metadata;

        assert_eq!(outcome.reply, triage_reply());
        assert!(meta.safety_flag_this_turn);
        assert_eq!(meta.gate_reason, Some(GateReason::SafetyTriage));
        assert!(!meta.allow_books && !meta.allow_jesus);
        assert!(meta.book_attributions.is_empty());
        assert_eq!(meta.path, PipelinePath::Triage);
        assert!(engine.model.requests().is_empty());
    }

    #[tokio::test]
    async fn planner_safety_flag_routes_to_triage() {
        let mut plan = valid_plan();
        plan.safety.flag = true;
        let engine = engine(ScriptedModel::new().reply(CLASSIFIED_CONFLICT).reply(plan_json(&plan)));
        let outcome = run(&engine, 5, "Things got scary last night", completed_state()).await;
        assert_eq!(outcome.reply, triage_reply());
        assert_eq!(outcome.metadata.gate_reason, Some(GateReason::SafetyTriage));
        assert!(!outcome.metadata.allow_books && !outcome.metadata.allow_jesus);
    }

    #[tokio::test]
    async fn low_confidence_gates_and_scrubs() {
        let mut plan = valid_plan();
        plan.topic_confidence = 0.59;
        plan.plan.diagnose = "Many couples find \"The Meaning of Marriage\" helpful here.".to_string();
        let engine = engine(
            ScriptedModel::new()
                .reply(r#"{"topic": "conflict", "confidence": 0.5}"#)
                .reply(plan_json(&plan)),
        );
        let outcome = run(&engine, 5, "What should we do?", completed_state()).await;
        let meta = &outcome.metadata;

        assert!(!meta.allow_books);
        assert_eq!(meta.gate_reason, Some(GateReason::LowConfidence));
        assert_eq!(meta.topic_confidence, 0.59);
        assert_eq!(meta.book_selection_reason, Some(BookSelectionReason::Gated));
        assert!(meta.book_attributions.is_empty());
        assert_eq!(meta.scrubbed_books, vec!["The Meaning of Marriage".to_string()]);
        assert!(outcome.reply.contains(RESOURCE_PLACEHOLDER));
        assert!(outcome.reply.ends_with(GATED_RESOURCES_NOTE));
        assert!(!outcome.reply.contains("Sources:"));
    }

    #[tokio::test]
    async fn invalid_plan_after_repair_yields_safe_reply() {
        let mut plan = valid_plan();
        plan.plan.steps_7day = (1..=2).map(step).collect();
        let engine = engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply(plan_json(&plan))
                .reply(plan_json(&plan)),
        );
        let mut state = completed_state();
        state.cadence.last_jesus_invite_turn = Some(1);
        let outcome = run(&engine, 5, "What should we do?", state).await;
        let meta = &outcome.metadata;

        assert_eq!(outcome.reply, SAFE_REPLY);
        assert_eq!(meta.fallback_reason.as_deref(), Some(PLAN_VALIDATION_FAILED));
        assert_eq!(meta.planner_retries, 1);
        assert_eq!(meta.path, PipelinePath::Orchestrated);
        assert!(meta.book_attributions.is_empty());
        assert!(!meta.allow_jesus && !meta.allow_books);
        assert_eq!(meta.gate_reason, Some(GateReason::Gated));
        assert_eq!(meta.cadence_reason, Some(CadenceReason::PlanBlocked));
        assert_eq!(meta.jesus_invite_variant, 0);
        assert!(!outcome.state.cadence.last_turn_had_jesus);

        let requests = engine.model.requests();
        assert_eq!(requests.len(), 3);
        let repair = requests[2].messages.last().unwrap();
        assert_eq!(repair.role, Role::System);
        assert!(repair.content.contains("steps_7day must have 3-5 items, got 2"));
    }

    #[tokio::test]
    async fn repaired_plan_is_used() {
        let mut broken = valid_plan();
        broken.plan.truth_anchor = "TBD".to_string();
        let engine = engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply(plan_json(&broken))
                .reply(plan_json(&valid_plan())),
        );
        let outcome = run(&engine, 2, "How do we stop fighting?", completed_state()).await;
        assert_eq!(outcome.metadata.planner_retries, 1);
        assert_eq!(outcome.metadata.fallback_reason, None);
        assert!(outcome.reply.contains("**Truth anchor:** Be quick to listen"));
    }

    #[tokio::test]
    async fn structural_failures_fall_back_to_legacy() {
        let engine = engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply("not json")
                .reply("{\"still\": \"wrong\"")
                .reply("nope")
                .reply("That sounds heavy. What happened the last time you argued?"),
        );
        let outcome = run(&engine, 3, "We argue every night", completed_state()).await;
        let meta = &outcome.metadata;

        assert_eq!(meta.path, PipelinePath::Legacy);
        assert_eq!(meta.fallback_reason.as_deref(), Some("planner_invalid_json"));
        assert_eq!(meta.planner_retries, 2);
        assert_eq!(outcome.reply, "That sounds heavy. What happened the last time you argued?");
        assert_eq!(meta.topic, Some(Topic::Conflict));

        let requests = engine.model.requests();
        assert_eq!(requests.len(), 5);
        assert!(requests[1].json_mode && requests[3].json_mode);
        assert!(!requests[4].json_mode);
        assert!(requests[2]
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.starts_with("Fix and return valid JSON")));
    }

    #[tokio::test]
    async fn unavailable_model_yields_safe_legacy_reply() {
        let engine = engine(ScriptedModel::new());
        let outcome = run(&engine, 4, "We argue every night", completed_state()).await;
        let meta = &outcome.metadata;
        assert_eq!(outcome.reply, SAFE_REPLY);
        assert_eq!(meta.path, PipelinePath::Legacy);
        assert_eq!(meta.fallback_reason.as_deref(), Some("planner_unavailable"));
        assert!(!meta.allow_books && !meta.allow_jesus);
        assert_eq!(meta.topic, Some(Topic::Conflict));
    }

    fn assert_reasons_match_flags(meta: &TurnMetadata) {
        if !meta.allow_books {
            assert_ne!(meta.gate_reason, Some(GateReason::Ok), "books withheld with reason ok");
        }
        if !meta.allow_jesus {
            assert_ne!(meta.cadence_reason, Some(CadenceReason::Ok), "invite withheld with reason ok");
        }
    }

    #[tokio::test]
    async fn safe_fallback_never_records_ok_beside_withheld_gates() {
        let mut state = completed_state();
        state.cadence.last_jesus_invite_turn = Some(1);
        let engine = engine(ScriptedModel::new());
        let outcome = run(&engine, 5, "What should we do about money and debt?", state).await;
        let meta = &outcome.metadata;

        assert_eq!(outcome.reply, SAFE_REPLY);
        assert_eq!(meta.fallback_reason.as_deref(), Some("planner_unavailable"));
        assert_eq!(meta.gate_reason, Some(GateReason::Gated));
        assert_eq!(meta.cadence_reason, Some(CadenceReason::PlanBlocked));
        assert_eq!(meta.book_selection_reason, Some(BookSelectionReason::Gated));
        assert_reasons_match_flags(meta);
        assert_eq!(normalize_meta(&meta.to_value()), *meta);
    }

    struct HangingModel;

    impl ChatModel for HangingModel {
        async fn chat(&self, _request: &ChatRequest) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn planner_timeout_is_classified() {
        let config = EngineConfig {
            planner_timeout_secs: 1,
            max_planner_retries: 0,
            ..EngineConfig::default()
        };
        let engine = Engine::new(HangingModel, config, ResourceRegistry::builtin());
        let outcome = engine
            .run_turn(TurnInput {
                turn_index: 1,
                user_message: "We argue every night",
                history: &[],
                state: completed_state(),
            })
            .await;
        assert_eq!(outcome.metadata.fallback_reason.as_deref(), Some("planner_timeout"));
        assert_eq!(outcome.reply, SAFE_REPLY);
    }

    #[tokio::test]
    async fn classifier_failure_keeps_plan_topic() {
        let mut plan = valid_plan();
        plan.topic = Topic::Other;
        plan.topic_confidence = 0.4;
        let engine = engine(
            ScriptedModel::new()
                .fail(LlmError::Status { status: 503 })
                .reply(plan_json(&plan)),
        );
        let outcome = run(&engine, 5, "What should we do?", completed_state()).await;
        assert_eq!(outcome.metadata.topic, Some(Topic::Other));
        assert_eq!(outcome.metadata.topic_confidence, 0.4);
        assert_eq!(outcome.metadata.gate_reason, Some(GateReason::LowConfidence));
    }

    #[tokio::test]
    async fn classifier_topic_replaces_other() {
        let mut plan = valid_plan();
        plan.topic = Topic::Other;
        plan.topic_confidence = 0.3;
        let engine = engine(
            ScriptedModel::new()
                .reply(r#"{"topic": "finances", "confidence": 0.9}"#)
                .reply(plan_json(&plan)),
        );
        let outcome = run(&engine, 5, "Money fights again", completed_state()).await;
        assert_eq!(outcome.metadata.topic, Some(Topic::Finances));
        assert_eq!(outcome.metadata.topic_confidence, 0.9);
        assert_eq!(outcome.metadata.book_attributions[0].key, "total_money_makeover");
    }

    #[tokio::test]
    async fn planner_sees_insights_and_intake_context() {
        let engine = engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply(plan_json(&valid_plan())),
        );
        run(&engine, 2, "How do we stop fighting?", completed_state()).await;
        let requests = engine.model.requests();
        let planner = &requests[1];
        assert!(planner.messages.iter().any(|m| m.content.starts_with("Coaching insights")));
        assert!(planner.messages.iter().any(|m| m.content.contains("completed=true")));
        assert_eq!(planner.messages.last().map(|m| m.content.as_str()), Some("How do we stop fighting?"));
    }

    #[tokio::test]
    async fn disabled_orchestration_never_calls_the_planner() {
        let engine = legacy_engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply("What feels hardest right now?"),
        );
        let outcome = run(&engine, 1, "We argue about chores", ConversationState::default()).await;
        assert_eq!(outcome.metadata.path, PipelinePath::Legacy);
        assert_eq!(outcome.metadata.fallback_reason, None);
        assert_eq!(outcome.metadata.phase, Phase::Intake);
        assert_eq!(outcome.metadata.gate_reason, Some(GateReason::IntakeIncomplete));
        assert_eq!(outcome.metadata.cadence_reason, Some(CadenceReason::PhaseIntake));
        let requests = engine.model.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[1].json_mode);
    }

    #[tokio::test]
    async fn legacy_wrap_up_completes_intake() {
        let engine = legacy_engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply("Tell me more?")
                .reply(r#"{"topic": "other", "confidence": 0.2}"#)
                .reply("Here is one step to try today. How does that sound?"),
        );
        let first = run(&engine, 1, "What should I do next?", ConversationState::default()).await;
        assert!(!first.state.intake.completed);
        assert_eq!(first.metadata.gate_reason, Some(GateReason::IntakeIncomplete));

        let second = run(&engine, 2, "That's enough, I'm ready for advice.", first.state).await;
        assert!(second.state.intake.completed);
        assert_ne!(second.metadata.gate_reason, Some(GateReason::IntakeIncomplete));
        assert_eq!(second.metadata.phase, Phase::Advice);
    }

    #[tokio::test]
    async fn intake_completion_is_monotonic_across_turns() {
        let engine = legacy_engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply("Okay?")
                .reply(CLASSIFIED_CONFLICT)
                .reply("Okay?"),
        );
        let first = run(&engine, 3, "hello again", completed_state()).await;
        assert!(first.state.intake.completed);
        let second = run(&engine, 4, "Actually I don't know anymore", first.state).await;
        assert!(second.state.intake.completed);
    }

    #[tokio::test]
    async fn both_paths_produce_the_same_metadata_shape() {
        let orchestrated = engine(
            ScriptedModel::new()
                .reply(CLASSIFIED_CONFLICT)
                .reply(plan_json(&valid_plan())),
        );
        let legacy = legacy_engine(ScriptedModel::new().reply(CLASSIFIED_CONFLICT).reply("Okay?"));
        let a = run(&orchestrated, 2, "How do we stop fighting?", completed_state()).await;
        let b = run(&legacy, 2, "How do we stop fighting?", completed_state()).await;

        let keys = |outcome: &TurnOutcome| {
            let mut keys: Vec<String> = outcome
                .metadata
                .to_value()
                .as_object()
                .unwrap()
                .keys()
                .cloned()
                .collect();
            keys.sort();
            keys
        };
        assert_eq!(keys(&a), keys(&b));
        assert_eq!(keys(&a).len(), CANONICAL_KEYS.len() + 1);
        assert_eq!(crate::metadata::normalize_meta(&a.metadata.to_value()), a.metadata);
        assert_eq!(crate::metadata::normalize_meta(&b.metadata.to_value()), b.metadata);
    }

    #[tokio::test]
    async fn allow_books_implies_every_condition() {
        for (phase, confidence) in [
            (Phase::Advice, 0.9),
            (Phase::Chat, 0.9),
            (Phase::Intake, 0.9),
            (Phase::Advice, 0.2),
        ] {
            let mut plan = valid_plan();
            plan.phase = phase;
            plan.topic_confidence = confidence;
            let engine = engine(
                ScriptedModel::new()
                    .reply(r#"{"topic": "conflict", "confidence": 0.1}"#)
                    .reply(plan_json(&plan)),
            );
            let outcome = run(&engine, 5, "We keep fighting", completed_state()).await;
            let meta = &outcome.metadata;
            if meta.allow_books {
                assert_eq!(meta.phase, Phase::Advice);
                assert!(outcome.state.intake.completed);
                assert!(!meta.safety_flag_this_turn);
                assert!(meta.topic_confidence >= 0.6);
                assert_eq!(meta.gate_reason, Some(GateReason::Ok));
            } else {
                assert_ne!(meta.gate_reason, Some(GateReason::Ok));
            }
        }
    }
}
