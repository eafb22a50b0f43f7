use clap::{Parser, Subcommand};

mod commands;
mod util;

use commands::chat::ChatCommands;
use commands::conversations::ConversationCommands;
use commands::gate::GateCommands;
use commands::prayer::PrayerCommands;

#[derive(Parser)]
#[command(name = "shepherd", version, about = "Shepherd CLI: pastoral chat, conversations, prayer requests and gate checks")]
struct Cli {
    /// API base URL
    #[arg(long, env = "SHEPHERD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Caller identity sent as x-user-id
    #[arg(long, env = "SHEPHERD_USER_ID")]
    user_id: Option<String>,

    /// Print compact JSON instead of pretty JSON
    #[arg(long, global = true)]
    raw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check API health
    Health,
    /// Send chat turns
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },
    /// Read conversations and their messages
    Conversations {
        #[command(subcommand)]
        command: ConversationCommands,
    },
    /// Prayer referral requests
    Prayer {
        #[command(subcommand)]
        command: PrayerCommands,
    },
    /// Evaluate the invite and book gates locally (no API call)
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api_url = cli.api_url.trim_end_matches('/').to_string();

    let code = match cli.command {
        Commands::Health => commands::health::run(&api_url, cli.raw).await,
        Commands::Chat { command } => {
            let user_id = util::require_user_id(cli.user_id.as_deref());
            commands::chat::run(&api_url, &user_id, cli.raw, command).await
        }
        Commands::Conversations { command } => {
            let user_id = util::require_user_id(cli.user_id.as_deref());
            commands::conversations::run(&api_url, &user_id, cli.raw, command).await
        }
        Commands::Prayer { command } => {
            let user_id = util::require_user_id(cli.user_id.as_deref());
            commands::prayer::run(&api_url, &user_id, cli.raw, command).await
        }
        Commands::Gate { command } => commands::gate::run(cli.raw, command),
    };

    std::process::exit(code);
}
