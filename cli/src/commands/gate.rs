use clap::Subcommand;
use serde_json::{Value, json};

use shepherd_core::cadence::{InviteGateInput, gate_invite};
use shepherd_core::config::EngineConfig;
use shepherd_core::metadata::Phase;
use shepherd_core::resources::{BookGateInput, gate_books};

use crate::util::{EXIT_OK, render};

fn parse_phase(raw: &str) -> Result<Phase, String> {
    Phase::parse(raw).ok_or_else(|| format!("unknown phase '{raw}' (expected intake, chat or advice)"))
}

#[derive(Subcommand)]
pub enum GateCommands {
    /// Decide whether a faith invitation may be offered on this turn
    Invite {
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
        /// 0-based index of the assistant turn being produced
        #[arg(long)]
        turn_index: u32,
        #[arg(long)]
        advice_intent: bool,
        #[arg(long)]
        intake_completed: bool,
        #[arg(long)]
        safety_flag: bool,
        /// Turn of the most recent invitation
        #[arg(long)]
        last_invite_turn: Option<u32>,
        /// Invitations stay suppressed until this turn after repeated declines
        #[arg(long)]
        declined_until_turn: Option<u32>,
        #[arg(long)]
        last_turn_had_invite: bool,
        /// Stated prayer consent (omit when never stated)
        #[arg(long)]
        prayer_consent: Option<bool>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        plan_allows_invite: bool,
    },
    /// Decide whether book recommendations may be shown on this turn
    Books {
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
        #[arg(long)]
        intake_completed: bool,
        #[arg(long)]
        safety_flag: bool,
        /// Classifier confidence for the turn's topic (0.0-1.0)
        #[arg(long)]
        topic_confidence: f64,
    },
}

/// Gates run against the same environment configuration the API uses.
pub fn run(raw: bool, command: GateCommands) -> i32 {
    let config = EngineConfig::from_env();
    println!("{}", render(&evaluate(&config, command), raw));
    EXIT_OK
}

fn evaluate(config: &EngineConfig, command: GateCommands) -> Value {
    match command {
        GateCommands::Invite {
            phase,
            turn_index,
            advice_intent,
            intake_completed,
            safety_flag,
            last_invite_turn,
            declined_until_turn,
            last_turn_had_invite,
            prayer_consent,
            plan_allows_invite,
        } => {
            let input = InviteGateInput {
                phase,
                advice_intent,
                intake_completed,
                safety_flag,
                turn_index,
                last_jesus_invite_turn: last_invite_turn,
                declined_jesus_until_turn: declined_until_turn,
                last_turn_had_jesus: last_turn_had_invite,
                prayer_consent,
                plan_allows_invite,
            };
            let decision = gate_invite(&input, &config.cadence);
            json!({
                "gate": "invite",
                "allow": decision.allow,
                "reason": decision.reason.as_str(),
            })
        }
        GateCommands::Books {
            phase,
            intake_completed,
            safety_flag,
            topic_confidence,
        } => {
            let input = BookGateInput {
                phase,
                intake_completed,
                safety_flag,
                topic_confidence,
            };
            let decision = gate_books(&input, config.topic_confidence_threshold);
            json!({
                "gate": "books",
                "allow": decision.allow,
                "reason": decision.reason.as_str(),
                "threshold": config.topic_confidence_threshold,
            })
        }
    }
}
