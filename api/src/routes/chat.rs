use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use shepherd_core::conversation::{ChatTurnRequest, ChatTurnResponse, ConversationState, Message};
use shepherd_core::error::ApiError;
use shepherd_core::llm::{ChatMessage, Role};
use shepherd_core::orchestrator::TurnInput;

use crate::error::AppError;
use crate::extract::{AppJson, extract_user_id};
use crate::state::AppState;

const MAX_MESSAGE_CHARS: usize = 8_000;
const MAX_TITLE_CHARS: usize = 120;
const DERIVED_TITLE_CHARS: usize = 60;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/chat", post(chat_turn))
}

fn validate_message(raw: &str) -> Result<&str, AppError> {
    let message = raw.trim();
    if message.is_empty() {
        return Err(AppError::Validation {
            message: "message must not be empty".to_string(),
            field: Some("message".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    let chars = message.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation {
            message: format!("message is too long ({chars} characters, max {MAX_MESSAGE_CHARS})"),
            field: Some("message".to_string()),
            received: None,
            docs_hint: Some("Split long messages into several turns.".to_string()),
        });
    }
    Ok(message)
}

/// Explicit title if given, otherwise the start of the first message.
fn conversation_title(requested: Option<&str>, first_message: &str) -> String {
    match requested.map(str::trim).filter(|title| !title.is_empty()) {
        Some(title) => title.chars().take(MAX_TITLE_CHARS).collect(),
        None => {
            let mut title: String = first_message.chars().take(DERIVED_TITLE_CHARS).collect();
            if first_message.chars().count() > DERIVED_TITLE_CHARS {
                title.push_str("...");
            }
            title
        }
    }
}

/// What a turn was computed from. The commit only goes through while the
/// stored conversation still matches it.
#[derive(Debug, Clone, PartialEq)]
struct TurnSnapshot {
    metadata: Value,
    assistant_turns: i64,
}

impl TurnSnapshot {
    fn is_current(&self, metadata: &Value, assistant_turns: i64) -> bool {
        self.assistant_turns == assistant_turns && self.metadata == *metadata
    }
}

async fn count_assistant_turns(
    conn: &mut sqlx::PgConnection,
    conversation_id: Uuid,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM messages WHERE conversation_id = $1 AND role = 'assistant'",
    )
    .bind(conversation_id)
    .fetch_one(conn)
    .await
}

/// Run one chat turn
///
/// Creates the conversation when `conversation_id` is omitted. The user
/// message, the assistant reply with its decision record, and the updated
/// conversation state are committed together or not at all.
///
/// No database connection is held while the engine runs. Turns for one
/// conversation are serialized in-process; the commit re-locks the row and
/// answers 409 if another writer got there first.
#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatTurnRequest,
    params(("x-user-id" = Uuid, Header, description = "Caller identity")),
    responses(
        (status = 200, description = "Assistant reply for this turn", body = ChatTurnResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Conversation not found", body = ApiError),
        (status = 409, description = "Conversation changed during the turn; nothing saved", body = ApiError),
        (status = 429, description = "Rate limited", body = ApiError),
        (status = 500, description = "Turn could not be persisted", body = ApiError)
    ),
    tag = "chat"
)]
pub async fn chat_turn(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<ChatTurnRequest>,
) -> Result<Json<ChatTurnResponse>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let message = validate_message(&req.message)?;
    let received_at = Utc::now();

    let conversation_id = req.conversation_id.unwrap_or_else(Uuid::now_v7);
    let lock = state.turn_locks.for_conversation(conversation_id);
    let _turn_guard = lock.lock().await;

    // Load
    let mut conn = state.db.acquire().await?;
    let snapshot = match req.conversation_id {
        Some(id) => {
            let metadata = sqlx::query_scalar::<_, Value>(
                "SELECT metadata FROM conversations WHERE id = $1 AND user_id = $2",
            )
            .bind(id)
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("Conversation {id}"),
            })?;
            let assistant_turns = count_assistant_turns(&mut conn, id).await?;
            Some(TurnSnapshot {
                metadata,
                assistant_turns,
            })
        }
        None => None,
    };
    let (conversation_state, turn_index) = match &snapshot {
        Some(snapshot) => (
            ConversationState::from_value(&snapshot.metadata),
            u32::try_from(snapshot.assistant_turns).unwrap_or(u32::MAX),
        ),
        None => (ConversationState::default(), 0),
    };

    let history: Vec<ChatMessage> = if snapshot.is_some() {
        let history_limit = i64::try_from(state.engine.config().history_turn_limit.saturating_mul(2))
            .unwrap_or(i64::MAX);
        let mut rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT role, content
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(conversation_id)
        .bind(history_limit)
        .fetch_all(&mut *conn)
        .await?;
        rows.reverse();
        rows.into_iter()
            .filter_map(|(role, content)| {
                Role::from_db_value(&role).map(|role| ChatMessage { role, content })
            })
            .collect()
    } else {
        Vec::new()
    };
    drop(conn);

    // Engine
    let outcome = state
        .engine
        .run_turn(TurnInput {
            turn_index,
            user_message: message,
            history: &history,
            state: conversation_state,
        })
        .await;

    // Commit
    let mut tx = state.db.begin().await?;
    match &snapshot {
        Some(snapshot) => {
            let current = sqlx::query_scalar::<_, Value>(
                "SELECT metadata FROM conversations WHERE id = $1 AND user_id = $2 FOR UPDATE",
            )
            .bind(conversation_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource: format!("Conversation {conversation_id}"),
            })?;
            let assistant_turns = count_assistant_turns(&mut tx, conversation_id).await?;
            if !snapshot.is_current(&current, assistant_turns) {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    turn_index,
                    "conversation changed during turn; discarding"
                );
                return Err(AppError::Conflict {
                    resource: format!("Conversation {conversation_id}"),
                });
            }
        }
        None => {
            sqlx::query(
                r#"
                INSERT INTO conversations (id, user_id, title, metadata, created_at, updated_at)
                VALUES ($1, $2, $3, '{}'::jsonb, $4, $4)
                "#,
            )
            .bind(conversation_id)
            .bind(user_id)
            .bind(conversation_title(req.title.as_deref(), message))
            .bind(received_at)
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, role, content, metadata, created_at)
        VALUES ($1, $2, 'user', $3, NULL, $4)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(conversation_id)
    .bind(message)
    .bind(received_at)
    .execute(&mut *tx)
    .await?;

    let reply = Message {
        id: Uuid::now_v7(),
        conversation_id,
        role: Role::Assistant,
        content: outcome.reply,
        metadata: Some(outcome.metadata),
        created_at: Utc::now(),
    };
    let metadata_value = reply
        .metadata
        .as_ref()
        .map(|metadata| metadata.to_value())
        .unwrap_or(Value::Null);

    sqlx::query(
        r#"
        INSERT INTO messages (id, conversation_id, role, content, metadata, created_at)
        VALUES ($1, $2, 'assistant', $3, $4, $5)
        "#,
    )
    .bind(reply.id)
    .bind(conversation_id)
    .bind(&reply.content)
    .bind(&metadata_value)
    .bind(reply.created_at)
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE conversations SET metadata = $2, updated_at = $3 WHERE id = $1")
        .bind(conversation_id)
        .bind(outcome.state.to_value())
        .bind(reply.created_at)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    if let Some(metadata) = &reply.metadata {
        tracing::info!(
            conversation_id = %conversation_id,
            turn_index,
            path = metadata.path.as_str(),
            allow_books = metadata.allow_books,
            allow_jesus = metadata.allow_jesus,
            "chat turn committed"
        );
    }

    Ok(Json(ChatTurnResponse {
        conversation_id,
        message: reply,
        intake: outcome.state.intake,
    }))
}
