use clap::Subcommand;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::util::{ApiCall, api_request, exit_error};

#[derive(Subcommand)]
pub enum ChatCommands {
    /// Send one message and print the assistant's reply with its metadata
    Send {
        /// Message text
        #[arg(long, short = 'm')]
        message: String,
        /// Continue an existing conversation (omit to start a new one)
        #[arg(long)]
        conversation_id: Option<Uuid>,
        /// Title for a new conversation
        #[arg(long)]
        title: Option<String>,
    },
}

pub async fn run(api_url: &str, user_id: &str, raw: bool, command: ChatCommands) -> i32 {
    match command {
        ChatCommands::Send {
            message,
            conversation_id,
            title,
        } => {
            if message.trim().is_empty() {
                exit_error("--message must not be empty", None);
            }
            let body = turn_body(&message, conversation_id, title.as_deref());
            api_request(api_url, ApiCall::post("/v1/chat", user_id, body), raw).await
        }
    }
}

fn turn_body(message: &str, conversation_id: Option<Uuid>, title: Option<&str>) -> Value {
    let mut body = json!({ "message": message });
    if let Some(id) = conversation_id {
        body["conversation_id"] = json!(id);
    }
    if let Some(title) = title {
        body["title"] = json!(title);
    }
    body
}
