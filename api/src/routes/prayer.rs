use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use shepherd_core::conversation::{CreatePrayerRequest, PrayerRequest};
use shepherd_core::error::ApiError;

use crate::error::AppError;
use crate::extract::{AppJson, extract_user_id};
use crate::state::{AppState, PrayerForwarding};

const MAX_SUMMARY_CHARS: usize = 2_000;
const MAX_CONTACT_CHARS: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/prayer/requests", post(create_prayer_request))
}

fn validate(req: &CreatePrayerRequest) -> Result<(), AppError> {
    let summary_chars = req.summary.trim().chars().count();
    if summary_chars == 0 || summary_chars > MAX_SUMMARY_CHARS {
        return Err(AppError::Validation {
            message: format!("summary must be 1-{MAX_SUMMARY_CHARS} characters"),
            field: Some("summary".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    if req
        .contact
        .as_deref()
        .is_some_and(|contact| contact.chars().count() > MAX_CONTACT_CHARS)
    {
        return Err(AppError::Validation {
            message: format!("contact must be at most {MAX_CONTACT_CHARS} characters"),
            field: Some("contact".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    Ok(())
}

/// Submit a prayer request for a human praying partner
///
/// The request is always stored. It is forwarded to the configured webhook
/// only with explicit `consent_forward` and when automatic forwarding is
/// enabled; forwarding failures are logged and never surfaced.
#[utoipa::path(
    post,
    path = "/v1/prayer/requests",
    request_body = CreatePrayerRequest,
    params(("x-user-id" = Uuid, Header, description = "Caller identity")),
    responses(
        (status = 201, description = "Prayer request stored", body = PrayerRequest),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Conversation not found", body = ApiError)
    ),
    tag = "prayer"
)]
pub async fn create_prayer_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(req): AppJson<CreatePrayerRequest>,
) -> Result<(StatusCode, Json<PrayerRequest>), AppError> {
    let user_id = extract_user_id(&headers)?;
    validate(&req)?;

    if let Some(conversation_id) = req.conversation_id {
        let owned: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM conversations WHERE id = $1 AND user_id = $2")
                .bind(conversation_id)
                .bind(user_id)
                .fetch_optional(&state.db)
                .await?;
        if owned.is_none() {
            return Err(AppError::NotFound {
                resource: format!("Conversation {conversation_id}"),
            });
        }
    }

    let mut request = PrayerRequest {
        id: Uuid::now_v7(),
        user_id,
        conversation_id: req.conversation_id,
        summary: req.summary.trim().to_string(),
        contact: req
            .contact
            .map(|contact| contact.trim().to_string())
            .filter(|contact| !contact.is_empty()),
        consent_forward: req.consent_forward,
        status: "stored".to_string(),
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO prayer_requests (id, user_id, conversation_id, summary, contact, consent_forward, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(request.id)
    .bind(request.user_id)
    .bind(request.conversation_id)
    .bind(&request.summary)
    .bind(&request.contact)
    .bind(request.consent_forward)
    .bind(&request.status)
    .bind(request.created_at)
    .execute(&state.db)
    .await?;

    if request.consent_forward && forward(&state.prayer, &request).await {
        sqlx::query("UPDATE prayer_requests SET status = 'forwarded' WHERE id = $1")
            .bind(request.id)
            .execute(&state.db)
            .await?;
        request.status = "forwarded".to_string();
    }

    Ok((StatusCode::CREATED, Json(request)))
}

/// Best-effort webhook delivery. Returns whether the webhook accepted it.
async fn forward(forwarding: &PrayerForwarding, request: &PrayerRequest) -> bool {
    let Some(target) = forwarding.target() else {
        return false;
    };
    let payload = json!({
        "id": request.id,
        "summary": request.summary,
        "contact": request.contact,
        "created_at": request.created_at,
    });
    match forwarding.client.post(target.clone()).json(&payload).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(prayer_request_id = %request.id, "prayer request forwarded");
            true
        }
        Ok(response) => {
            tracing::warn!(
                prayer_request_id = %request.id,
                status = response.status().as_u16(),
                "prayer webhook rejected request"
            );
            false
        }
        Err(err) => {
            tracing::warn!(
                prayer_request_id = %request.id,
                timeout = err.is_timeout(),
                "prayer webhook unreachable"
            );
            false
        }
    }
}
