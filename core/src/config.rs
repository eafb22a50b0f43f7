use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL_NAME: &str = "gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const DEFAULT_MAX_PLANNER_RETRIES: u32 = 2;
pub const DEFAULT_TOPIC_CONFIDENCE_THRESHOLD: f64 = 0.6;
pub const DEFAULT_FIRST_INVITE_WINDOW: u32 = 4;
pub const DEFAULT_INVITE_WINDOW: u32 = 3;
pub const DEFAULT_DECLINE_COOLDOWN_TURNS: u32 = 6;
pub const DEFAULT_DECLINE_THRESHOLD: u32 = 2;
pub const DEFAULT_PLANNER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HISTORY_TURN_LIMIT: usize = 8;

/// Cadence rules for the invite gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Assistant turns required before the very first invite.
    pub first_invite_window: u32,
    /// Assistant turns required between two invites.
    pub invite_window: u32,
    /// Length of the suppression window set after repeated declines.
    pub decline_cooldown_turns: u32,
    /// Declines needed to start a cooldown.
    pub decline_threshold: u32,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            first_invite_window: DEFAULT_FIRST_INVITE_WINDOW,
            invite_window: DEFAULT_INVITE_WINDOW,
            decline_cooldown_turns: DEFAULT_DECLINE_COOLDOWN_TURNS,
            decline_threshold: DEFAULT_DECLINE_THRESHOLD,
        }
    }
}

/// Everything the turn pipeline reads from configuration. Passed explicitly
/// into every engine call; nothing in the engine reads the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_name: String,
    pub temperature: f32,
    pub max_planner_retries: u32,
    /// Selects the structured-plan pipeline; `false` serves every turn from the legacy heuristics.
    pub orchestration_enabled: bool,
    pub topic_confidence_threshold: f64,
    pub cadence: CadenceConfig,
    pub planner_timeout_secs: u64,
    /// Number of user/assistant turns of history sent to the model.
    pub history_turn_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_planner_retries: DEFAULT_MAX_PLANNER_RETRIES,
            orchestration_enabled: true,
            topic_confidence_threshold: DEFAULT_TOPIC_CONFIDENCE_THRESHOLD,
            cadence: CadenceConfig::default(),
            planner_timeout_secs: DEFAULT_PLANNER_TIMEOUT_SECS,
            history_turn_limit: DEFAULT_HISTORY_TURN_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Build from `SHEPHERD_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Used by `from_env` and by tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let model_name = lookup("SHEPHERD_MODEL_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.model_name);

        Self {
            model_name,
            temperature: parse_or(&lookup, "SHEPHERD_TEMPERATURE", defaults.temperature),
            max_planner_retries: parse_or(
                &lookup,
                "SHEPHERD_MAX_PLANNER_RETRIES",
                defaults.max_planner_retries,
            ),
            orchestration_enabled: lookup("SHEPHERD_ORCHESTRATION_ENABLED")
                .map(|value| parse_flag(&value))
                .unwrap_or(defaults.orchestration_enabled),
            topic_confidence_threshold: parse_or(
                &lookup,
                "SHEPHERD_TOPIC_CONFIDENCE_THRESHOLD",
                defaults.topic_confidence_threshold,
            )
            .clamp(0.0, 1.0),
            cadence: CadenceConfig {
                first_invite_window: parse_or(
                    &lookup,
                    "SHEPHERD_FIRST_INVITE_WINDOW",
                    defaults.cadence.first_invite_window,
                ),
                invite_window: parse_or(
                    &lookup,
                    "SHEPHERD_INVITE_WINDOW",
                    defaults.cadence.invite_window,
                ),
                decline_cooldown_turns: parse_or(
                    &lookup,
                    "SHEPHERD_DECLINE_COOLDOWN_TURNS",
                    defaults.cadence.decline_cooldown_turns,
                ),
                decline_threshold: parse_or(
                    &lookup,
                    "SHEPHERD_DECLINE_THRESHOLD",
                    defaults.cadence.decline_threshold,
                )
                .max(1),
            },
            planner_timeout_secs: parse_or(
                &lookup,
                "SHEPHERD_PLANNER_TIMEOUT_SECS",
                defaults.planner_timeout_secs,
            )
            .max(1),
            history_turn_limit: parse_or(
                &lookup,
                "SHEPHERD_HISTORY_TURN_LIMIT",
                defaults.history_turn_limit,
            ),
        }
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_secs(self.planner_timeout_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable config value; using default");
            default
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
