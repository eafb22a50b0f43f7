use clap::Subcommand;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::util::{ApiCall, api_request, exit_error};

#[derive(Subcommand)]
pub enum PrayerCommands {
    /// Submit a prayer referral request
    Submit {
        /// Short summary in the requester's own words
        #[arg(long)]
        summary: String,
        /// How a praying partner may reach out
        #[arg(long)]
        contact: Option<String>,
        /// Conversation the request came from
        #[arg(long)]
        conversation_id: Option<Uuid>,
        /// Consent to forward the request to a human praying partner
        #[arg(long)]
        consent_forward: bool,
    },
}

pub async fn run(api_url: &str, user_id: &str, raw: bool, command: PrayerCommands) -> i32 {
    match command {
        PrayerCommands::Submit {
            summary,
            contact,
            conversation_id,
            consent_forward,
        } => {
            if summary.trim().is_empty() {
                exit_error(
                    "--summary must not be empty",
                    Some("Describe the request in a sentence or two"),
                );
            }
            let body = request_body(&summary, contact.as_deref(), conversation_id, consent_forward);
            api_request(
                api_url,
                ApiCall::post("/v1/prayer/requests", user_id, body),
                raw,
            )
            .await
        }
    }
}

fn request_body(
    summary: &str,
    contact: Option<&str>,
    conversation_id: Option<Uuid>,
    consent_forward: bool,
) -> Value {
    let mut body = json!({
        "summary": summary,
        "consent_forward": consent_forward,
    });
    if let Some(contact) = contact {
        body["contact"] = json!(contact);
    }
    if let Some(id) = conversation_id {
        body["conversation_id"] = json!(id);
    }
    body
}
