use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use utoipa::IntoParams;
use uuid::Uuid;

use shepherd_core::conversation::{Conversation, ConversationState, Message, PaginatedResponse};
use shepherd_core::error::ApiError;
use shepherd_core::llm::Role;
use shepherd_core::metadata::normalize_meta;

use crate::error::AppError;
use crate::extract::extract_user_id;
use crate::state::AppState;

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/conversations", get(list_conversations))
        .route("/v1/conversations/{id}", get(get_conversation))
        .route("/v1/conversations/{id}/messages", get(list_messages))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    /// Maximum number of items to return (default 50, max 200)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Cursor for pagination (opaque string from previous response's next_cursor)
    #[serde(default)]
    pub cursor: Option<String>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

/// List the caller's conversations, most recently active first
#[utoipa::path(
    get,
    path = "/v1/conversations",
    params(PageParams, ("x-user-id" = Uuid, Header, description = "Caller identity")),
    responses(
        (status = 200, description = "Paginated conversations", body = PaginatedResponse<Conversation>),
        (status = 400, description = "Invalid parameters", body = ApiError)
    ),
    tag = "conversations"
)]
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<Conversation>>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let limit = params.limit();
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;

    let rows = sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT id, user_id, title, metadata, created_at, updated_at
        FROM conversations
        WHERE user_id = $1
          AND ($2::timestamptz IS NULL OR (updated_at, id) < ($2, $3))
        ORDER BY updated_at DESC, id DESC
        LIMIT $4
        "#,
    )
    .bind(user_id)
    .bind(cursor.as_ref().map(|c| c.timestamp))
    .bind(cursor.as_ref().map(|c| c.id))
    .bind(limit + 1)
    .fetch_all(&state.db)
    .await?;

    let has_more = rows.len() as i64 > limit;
    let data: Vec<Conversation> = rows
        .into_iter()
        .take(limit as usize)
        .map(ConversationRow::into_conversation)
        .collect();
    let next_cursor = if has_more {
        data.last().map(|c| encode_cursor(&c.updated_at, &c.id))
    } else {
        None
    };

    Ok(Json(PaginatedResponse {
        data,
        next_cursor,
        has_more,
    }))
}

/// Get one conversation with its intake and cadence state
#[utoipa::path(
    get,
    path = "/v1/conversations/{id}",
    params(
        ("id" = Uuid, Path, description = "Conversation ID"),
        ("x-user-id" = Uuid, Header, description = "Caller identity")
    ),
    responses(
        (status = 200, description = "Conversation", body = Conversation),
        (status = 404, description = "Conversation not found", body = ApiError)
    ),
    tag = "conversations"
)]
pub async fn get_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, AppError> {
    let user_id = extract_user_id(&headers)?;
    let row = fetch_owned(&state, id, user_id).await?;
    Ok(Json(row.into_conversation()))
}

/// List a conversation's messages, oldest first
///
/// Assistant message metadata is re-normalized on read, so rows written by
/// older versions come back in the canonical shape.
#[utoipa::path(
    get,
    path = "/v1/conversations/{id}/messages",
    params(
        ("id" = Uuid, Path, description = "Conversation ID"),
        PageParams,
        ("x-user-id" = Uuid, Header, description = "Caller identity")
    ),
    responses(
        (status = 200, description = "Paginated messages", body = PaginatedResponse<Message>),
        (status = 400, description = "Invalid parameters", body = ApiError),
        (status = 404, description = "Conversation not found", body = ApiError)
    ),
    tag = "conversations"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> Result<Json<PaginatedResponse<Message>>, AppError> {
    let user_id = extract_user_id(&headers)?;
    fetch_owned(&state, id, user_id).await?;
    let limit = params.limit();
    let cursor = params.cursor.as_deref().map(decode_cursor).transpose()?;

    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT id, conversation_id, role, content, metadata, created_at
        FROM messages
        WHERE conversation_id = $1
          AND ($2::timestamptz IS NULL OR (created_at, id) > ($2, $3))
        ORDER BY created_at ASC, id ASC
        LIMIT $4
        "#,
    )
    .bind(id)
    .bind(cursor.as_ref().map(|c| c.timestamp))
    .bind(cursor.as_ref().map(|c| c.id))
    .bind(limit + 1)
    .fetch_all(&state.db)
    .await?;

    let has_more = rows.len() as i64 > limit;
    let data: Vec<Message> = rows
        .into_iter()
        .take(limit as usize)
        .filter_map(MessageRow::into_message)
        .collect();
    let next_cursor = if has_more {
        data.last().map(|m| encode_cursor(&m.created_at, &m.id))
    } else {
        None
    };

    Ok(Json(PaginatedResponse {
        data,
        next_cursor,
        has_more,
    }))
}

async fn fetch_owned(state: &AppState, id: Uuid, user_id: Uuid) -> Result<ConversationRow, AppError> {
    sqlx::query_as::<_, ConversationRow>(
        r#"
        SELECT id, user_id, title, metadata, created_at, updated_at
        FROM conversations
        WHERE id = $1 AND user_id = $2
        "#,
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| AppError::NotFound {
        resource: format!("Conversation {id}"),
    })
}

/// Cursor is base64("timestamp\0id"), opaque to the client
fn encode_cursor(timestamp: &DateTime<Utc>, id: &Uuid) -> String {
    let raw = format!("{}\0{}", timestamp.to_rfc3339(), id);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

#[derive(Debug, PartialEq)]
struct CursorData {
    timestamp: DateTime<Utc>,
    id: Uuid,
}

fn invalid_cursor(cursor: &str) -> AppError {
    AppError::Validation {
        message: "Invalid cursor".to_string(),
        field: Some("cursor".to_string()),
        received: Some(Value::String(cursor.to_string())),
        docs_hint: Some("Use the next_cursor value from a previous response".to_string()),
    }
}

fn decode_cursor(cursor: &str) -> Result<CursorData, AppError> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid_cursor(cursor))?;
    let text = String::from_utf8(bytes).map_err(|_| invalid_cursor(cursor))?;
    let (timestamp, id) = text.split_once('\0').ok_or_else(|| invalid_cursor(cursor))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid_cursor(cursor))?;
    let id = Uuid::parse_str(id).map_err(|_| invalid_cursor(cursor))?;
    Ok(CursorData { timestamp, id })
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: Uuid,
    user_id: Uuid,
    title: String,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ConversationRow {
    fn into_conversation(self) -> Conversation {
        Conversation {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            state: ConversationState::from_value(&self.metadata),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    conversation_id: Uuid,
    role: String,
    content: String,
    metadata: Option<Value>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn into_message(self) -> Option<Message> {
        let role = Role::from_db_value(&self.role)?;
        let metadata = match role {
            Role::Assistant => Some(normalize_meta(self.metadata.as_ref().unwrap_or(&Value::Null))),
            _ => None,
        };
        Some(Message {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            content: self.content,
            metadata,
            created_at: self.created_at,
        })
    }
}
