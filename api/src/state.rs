use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shepherd_core::orchestrator::Engine;
use sqlx::PgPool;
use url::Url;
use uuid::Uuid;

use crate::llm::OpenAiChatModel;

/// One async mutex per conversation id. Turns against the same conversation
/// run strictly one after another inside this process; the row lock taken in
/// the turn transaction covers other processes.
#[derive(Clone, Default)]
pub struct TurnLocks {
    inner: Arc<Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TurnLocks {
    pub fn for_conversation(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        // Drop locks nobody is holding or waiting on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(conversation_id).or_default().clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrayerForward {
    Disabled,
    Auto,
}

#[derive(Clone)]
pub struct PrayerForwarding {
    pub mode: PrayerForward,
    pub webhook_url: Option<Url>,
    pub client: reqwest::Client,
}

impl PrayerForwarding {
    pub fn from_env() -> Self {
        let webhook_url = std::env::var("SHEPHERD_PRAYER_WEBHOOK_URL")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| match Url::parse(raw.trim()) {
                Ok(url) => Some(url),
                Err(err) => {
                    tracing::warn!(error = %err, "invalid SHEPHERD_PRAYER_WEBHOOK_URL; forwarding disabled");
                    None
                }
            });
        let mode = match std::env::var("SHEPHERD_PRAYER_AUTO_FORWARD")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" => PrayerForward::Auto,
            _ => PrayerForward::Disabled,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            mode,
            webhook_url,
            client,
        }
    }

    /// Webhook target when automatic forwarding is on and configured.
    pub fn target(&self) -> Option<&Url> {
        match self.mode {
            PrayerForward::Auto => self.webhook_url.as_ref(),
            PrayerForward::Disabled => None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub engine: Arc<Engine<OpenAiChatModel>>,
    pub turn_locks: TurnLocks,
    pub prayer: PrayerForwarding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_conversation_shares_a_lock() {
        let locks = TurnLocks::default();
        let id = Uuid::now_v7();
        let first = locks.for_conversation(id);
        let second = locks.for_conversation(id);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &locks.for_conversation(Uuid::now_v7())));
    }

    #[test]
    fn idle_locks_are_pruned() {
        let locks = TurnLocks::default();
        drop(locks.for_conversation(Uuid::now_v7()));
        let _held = locks.for_conversation(Uuid::now_v7());
        assert_eq!(locks.inner.lock().unwrap().len(), 1);
    }

    #[test]
    fn forwarding_needs_auto_mode_and_url() {
        let forwarding = PrayerForwarding {
            mode: PrayerForward::Disabled,
            webhook_url: Url::parse("https://example.org/hook").ok(),
            client: reqwest::Client::new(),
        };
        assert!(forwarding.target().is_none());
        let auto = PrayerForwarding {
            mode: PrayerForward::Auto,
            ..forwarding
        };
        assert!(auto.target().is_some());
    }
}
