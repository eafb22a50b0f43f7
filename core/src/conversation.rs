use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::cadence::CadenceState;
use crate::intake::IntakeState;
use crate::llm::Role;
use crate::metadata::TurnMetadata;

/// Conversation-level gating memory, stored as the conversation's metadata
/// record and rewritten in the same transaction as each new message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConversationState {
    #[serde(default)]
    pub intake: IntakeState,
    #[serde(default)]
    pub cadence: CadenceState,
    /// Last explicit prayer/faith consent statement. `None` = never stated.
    #[serde(default)]
    pub prayer_consent: Option<bool>,
}

impl ConversationState {
    /// Tolerant decode of a stored record. Missing or malformed sections fall
    /// back to their defaults independently.
    pub fn from_value(value: &Value) -> Self {
        let section = |key: &str| value.get(key).cloned().unwrap_or(Value::Null);
        Self {
            intake: IntakeState::from_value(&section("intake")),
            cadence: CadenceState::from_value(&section("cadence")),
            prayer_consent: value.get("prayer_consent").and_then(Value::as_bool),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversation {
    /// Conversation ID (UUIDv7)
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub state: ConversationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Decision record for assistant turns; absent on user messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TurnMetadata>,
    pub created_at: DateTime<Utc>,
}

/// Request to run one chat turn
#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatTurnRequest {
    /// Existing conversation; omitted to start a new one
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    pub message: String,
    /// Title for a newly created conversation
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatTurnResponse {
    pub conversation_id: Uuid,
    pub message: Message,
    pub intake: IntakeState,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreatePrayerRequest {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    /// Short summary in the requester's own words
    pub summary: String,
    /// How a praying partner may reach out (email, phone, "none")
    #[serde(default)]
    pub contact: Option<String>,
    /// Explicit consent to forward the request to a human praying partner
    #[serde(default)]
    pub consent_forward: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PrayerRequest {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub consent_forward: bool,
    /// "stored" or "forwarded"
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Cursor-based pagination
#[derive(Debug, Serialize, ToSchema)]
pub struct PaginatedResponse<T: Serialize> {
    pub data: Vec<T>,
    /// Cursor for the next page. None if this is the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether there are more results after this page
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trips_through_stored_json() {
        let mut state = ConversationState::default();
        state.cadence.record_turn(4, true);
        state.prayer_consent = Some(true);
        assert_eq!(ConversationState::from_value(&state.to_value()), state);
    }

    #[test]
    fn malformed_sections_default_independently() {
        let state = ConversationState::from_value(&json!({
            "intake": {"issue_named": true},
            "cadence": "broken",
            "prayer_consent": "maybe",
        }));
        assert!(state.intake.issue_named);
        assert_eq!(state.cadence, CadenceState::default());
        assert_eq!(state.prayer_consent, None);
    }

    #[test]
    fn empty_record_is_default_state() {
        assert_eq!(ConversationState::from_value(&json!({})), ConversationState::default());
        assert_eq!(ConversationState::from_value(&Value::Null), ConversationState::default());
    }
}
