use clap::Subcommand;
use uuid::Uuid;

use crate::util::{ApiCall, api_request};

#[derive(Subcommand)]
pub enum ConversationCommands {
    /// List conversations, most recently active first
    List {
        /// Maximum number of conversations to return (1-200)
        #[arg(long)]
        limit: Option<u32>,
        /// Pagination cursor from previous response
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show one conversation with its intake and cadence state
    Get {
        #[arg(long)]
        id: Uuid,
    },
    /// List a conversation's messages, oldest first
    Messages {
        #[arg(long)]
        id: Uuid,
        /// Maximum number of messages to return (1-200)
        #[arg(long)]
        limit: Option<u32>,
        /// Pagination cursor from previous response
        #[arg(long)]
        cursor: Option<String>,
    },
}

pub async fn run(api_url: &str, user_id: &str, raw: bool, command: ConversationCommands) -> i32 {
    match command {
        ConversationCommands::List { limit, cursor } => {
            let call = ApiCall::get("/v1/conversations", Some(user_id))
                .query("limit", limit)
                .query("cursor", cursor);
            api_request(api_url, call, raw).await
        }
        ConversationCommands::Get { id } => {
            let path = format!("/v1/conversations/{id}");
            api_request(api_url, ApiCall::get(&path, Some(user_id)), raw).await
        }
        ConversationCommands::Messages { id, limit, cursor } => {
            let path = format!("/v1/conversations/{id}/messages");
            let call = ApiCall::get(&path, Some(user_id))
                .query("limit", limit)
                .query("cursor", cursor);
            api_request(api_url, call, raw).await
        }
    }
}
