//! Topic classification: a JSON-mode model call with a keyword fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::config::EngineConfig;
use crate::error::ClassifyError;
use crate::llm::{extract_json, ChatMessage, ChatModel, ChatRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Conflict,
    Betrayal,
    Porn,
    Intimacy,
    Finances,
    Parenting,
    Boundaries,
    Other,
}

impl Topic {
    pub const ALL: [Topic; 8] = [
        Topic::Conflict,
        Topic::Betrayal,
        Topic::Porn,
        Topic::Intimacy,
        Topic::Finances,
        Topic::Parenting,
        Topic::Boundaries,
        Topic::Other,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Topic::Conflict => "conflict",
            Topic::Betrayal => "betrayal",
            Topic::Porn => "porn",
            Topic::Intimacy => "intimacy",
            Topic::Finances => "finances",
            Topic::Parenting => "parenting",
            Topic::Boundaries => "boundaries",
            Topic::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|topic| topic.as_str() == lowered)
    }

    /// Unknown labels collapse to `Other`.
    pub fn parse_or_other(value: &str) -> Self {
        Self::parse(value).unwrap_or(Topic::Other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TopicClassification {
    pub topic: Topic,
    pub confidence: f64,
}

const CLASSIFIER_SYSTEM: &str = "You are a topic classifier for Christian marriage conversations.\n\
Return ONLY one JSON object with:\n\
- topic: one of [conflict, betrayal, porn, intimacy, finances, parenting, boundaries, other]\n\
- confidence: float from 0.0 to 1.0 representing how confident you are about the topic label.\n\
No markdown, no extra text.";

const KEYWORDS: &[(Topic, &[&str])] = &[
    (Topic::Porn, &["porn", "pornography", "lust", "explicit sites", "accountability software"]),
    (Topic::Betrayal, &["affair", "cheated", "cheating", "adultery", "betrayal", "betrayed", "unfaithful"]),
    (Topic::Intimacy, &["intimacy", "intimate", "sex life", "sexless", "affection", "romance"]),
    (Topic::Finances, &["money", "finances", "financial", "debt", "budget", "spending", "bills"]),
    (Topic::Parenting, &["kids", "children", "parenting", "our son", "our daughter", "toddler", "teenager"]),
    (Topic::Boundaries, &["in-laws", "in laws", "mother-in-law", "boundaries", "boundary", "interfering"]),
    (Topic::Conflict, &["argue", "arguing", "argument", "fight", "fighting", "conflict", "yelling", "communication"]),
];

/// Deterministic keyword classifier. The topic with the most keyword hits
/// wins; ties go to the earlier entry in the table.
pub fn classify_keywords(text: &str) -> TopicClassification {
    let lowered = text.to_lowercase();
    let mut best: Option<(Topic, usize)> = None;
    for (topic, words) in KEYWORDS {
        let hits = words.iter().filter(|word| lowered.contains(*word)).count();
        if hits > 0 && best.is_none_or(|(_, top)| hits > top) {
            best = Some((*topic, hits));
        }
    }
    match best {
        Some((topic, hits)) => TopicClassification {
            topic,
            confidence: if hits > 1 { 0.8 } else { 0.65 },
        },
        None => TopicClassification {
            topic: Topic::Other,
            confidence: 0.2,
        },
    }
}

/// Parse a classifier reply. Unknown topics become `Other`; confidence is
/// clamped to [0, 1] and defaults to 0 when missing or malformed.
pub fn parse_classifier_reply(raw: &str) -> Result<TopicClassification, ClassifyError> {
    let value: Value = serde_json::from_str(extract_json(raw))
        .map_err(|err| ClassifyError::InvalidJson(err.to_string()))?;
    let topic = value
        .get("topic")
        .and_then(Value::as_str)
        .map(Topic::parse_or_other)
        .unwrap_or(Topic::Other);
    let confidence = match value.get("confidence") {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
    Ok(TopicClassification { topic, confidence })
}

pub async fn classify_with_model<M: ChatModel>(
    model: &M,
    config: &EngineConfig,
    text: &str,
) -> Result<TopicClassification, ClassifyError> {
    let request = ChatRequest {
        model: config.model_name.clone(),
        messages: vec![ChatMessage::system(CLASSIFIER_SYSTEM), ChatMessage::user(text)],
        temperature: config.temperature,
        json_mode: true,
    };
    let raw = model.chat(&request).await?;
    parse_classifier_reply(&raw)
}
