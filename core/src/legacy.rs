//! Heuristic pipeline: gates are derived from the raw user text and the reply
//! is a free-text completion instead of a structured plan.

use std::sync::LazyLock;

use regex::Regex;

use crate::intake::IntakeState;
use crate::llm::ChatMessage;
use crate::metadata::Phase;

pub const PASTORAL_SYSTEM_PROMPT: &str = "You are Shepherd, a pastoral companion for Christian marriages. \
Speak like a warm, wise pastor who knows the Bible, listens deeply, and loves people as Jesus does. \
Be gentle, humble, emotionally intelligent and scripturally grounded. \
You must not pretend to be human, offer diagnoses, medical or emergency advice, or replace real pastors and community. \
You do not pray yourself; you may offer to forward a prayer request to a human praying partner with explicit consent.";

const DOMAIN_FOCUS: &str = "DOMAIN FOCUS: This conversation is about Christian marriage. Frame every response within marriage. \
If a request is unrelated, gently refocus to its marriage implications.";

const CONVERSATIONAL_MODE: &str = "CONVERSATIONAL MODE: Keep replies concise (3-7 sentences). \
Use brief reflective listening, then end with one open, non-leading question. \
Include at most one Scripture. Do not name books, authors, or links.";

const GREETING_MODE: &str = "GREETING MODE: The user only greeted you. Respond briefly and warmly in 1-2 short sentences \
and ask one open, marriage-oriented question such as 'What would you like help with in your marriage right now?'.";

const INTAKE_MODE: &str = "INTAKE: Before advising, make sure you understand the issue, whether everyone is safe, \
what they hope will change, and whether they would welcome prayer or faith language. \
Ask about whichever of these is still unknown, one or two short questions at a time.";

const ADVICE_MODE: &str = "ADVICE: Intake is complete. Offer one concrete 'do this today' step and up to three next steps, \
then ask permission before going deeper.";

static ADVICE_INTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bwhat\s+(?:should|can|do)\s+(?:i|we)\s+do\b|\bhow\s+(?:do|can|should)\s+(?:i|we)\b|\badvice\b|\bany\s+(?:tips|suggestions|ideas)\b|\bwhat\s+do\s+you\s+(?:suggest|recommend)\b|\bnext\s+steps?\b|\bhelp\s+(?:me|us)\s+(?:fix|figure|know|with)\b|\btell\s+(?:me|us)\s+what\s+to\s+do\b",
    )
    .expect("valid advice intent regex")
});

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "good morning", "good afternoon", "good evening", "shalom",
    "greetings",
];

pub fn detect_advice_intent(text: &str) -> bool {
    ADVICE_INTENT_RE.is_match(text)
}

/// A bare greeting as the opening message of a conversation.
pub fn is_greeting(text: &str) -> bool {
    let lowered = text
        .trim()
        .trim_end_matches(['!', '.', ',', '?'])
        .to_lowercase();
    GREETINGS.iter().any(|greeting| {
        lowered == *greeting
            || (lowered.len() <= 24 && lowered.starts_with(&format!("{greeting} ")))
    })
}

/// Phase derived from intake progress and the user's wording.
pub fn derive_phase(intake: &IntakeState, advice_intent: bool) -> Phase {
    if !intake.completed {
        Phase::Intake
    } else if advice_intent {
        Phase::Advice
    } else {
        Phase::Chat
    }
}

/// Prompt for the free-text completion: persona and guidance, then the
/// bounded history, then the current message.
pub fn build_messages(
    history: &[ChatMessage],
    user_message: &str,
    phase: Phase,
    first_turn: bool,
) -> Vec<ChatMessage> {
    let mut messages = vec![
        ChatMessage::system(PASTORAL_SYSTEM_PROMPT),
        ChatMessage::system(DOMAIN_FOCUS),
        ChatMessage::system(CONVERSATIONAL_MODE),
    ];
    let guidance = if first_turn && is_greeting(user_message) {
        GREETING_MODE
    } else if phase == Phase::Advice {
        ADVICE_MODE
    } else {
        INTAKE_MODE
    };
    messages.push(ChatMessage::system(guidance));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(user_message));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::IntakeUpdate;
    use crate::llm::Role;

    #[test]
    fn advice_intent_phrasing() {
        assert!(detect_advice_intent("What should I do next?"));
        assert!(detect_advice_intent("Any tips for talking about money?"));
        assert!(detect_advice_intent("Just tell me what to do"));
        assert!(!detect_advice_intent("We had a rough week."));
    }

    #[test]
    fn greetings_are_short_openers() {
        assert!(is_greeting("Hi!"));
        assert!(is_greeting("good morning"));
        assert!(is_greeting("hey there"));
        assert!(!is_greeting("hey, my husband and I have been fighting for months about money"));
        assert!(!is_greeting("history repeats"));
    }

    #[test]
    fn phase_follows_intake_then_intent() {
        let open = IntakeState::default();
        assert_eq!(derive_phase(&open, true), Phase::Intake);
        let done = open.merge(IntakeUpdate::all());
        assert_eq!(derive_phase(&done, true), Phase::Advice);
        assert_eq!(derive_phase(&done, false), Phase::Chat);
    }

    #[test]
    fn prompt_uses_greeting_mode_only_on_first_turn() {
        let first = build_messages(&[], "hello", Phase::Intake, true);
        assert!(first.iter().any(|m| m.content.starts_with("GREETING MODE")));
        assert_eq!(first.last().map(|m| m.role), Some(Role::User));

        let later = build_messages(&[ChatMessage::user("hi"), ChatMessage::assistant("hey")], "hello", Phase::Intake, false);
        assert!(later.iter().any(|m| m.content.starts_with("INTAKE")));
        assert_eq!(later.len(), 7);
    }
}
