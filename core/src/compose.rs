//! Rendering a reply from a plan, plus the fixed lines every path shares.

use crate::metadata::{BookAttribution, MAX_INVITE_VARIANT};
use crate::plan::ResponsePlan;
use crate::resources::{ResourceRegistry, MAX_ATTRIBUTIONS};

/// Used when no trustworthy reply can be produced. Names no resources and
/// carries no invitation.
pub const SAFE_REPLY: &str = "Thank you for sharing this with me. I want to respond carefully, so let's slow down for a moment. What feels most important for us to focus on right now?";

/// Appended when books are gated and the scrubber removed something.
pub const GATED_RESOURCES_NOTE: &str =
    "Once we've finished intake and I'm confident on the topic, I can suggest resources.";

const INVITE_LINES: [&str; MAX_INVITE_VARIANT as usize] = [
    "Where do you sense Jesus inviting you to take one small, grace-filled step this week?",
    "Would it help to bring this to Jesus together in a short prayer before you talk?",
    "As you try this, you might ask Jesus for the patience and gentleness you can't produce on your own.",
    "Jesus meets us in exactly these places; is there one part of this you'd like to hand over to Him today?",
    "If you're open to it, consider reading a short passage about how Jesus loved people under pressure, and notice what stands out.",
    "Where might Jesus be asking you to lead with grace rather than being right this week?",
];

/// The invitation line for a variant. Variant 0 (unset) uses the first line.
pub fn invite_line(variant: u8) -> &'static str {
    let index = usize::from(variant.clamp(1, MAX_INVITE_VARIANT)) - 1;
    INVITE_LINES[index]
}

/// Deterministic variant for paths that have no planner choice.
pub fn rotating_variant(turn_index: u32) -> u8 {
    (turn_index % u32::from(MAX_INVITE_VARIANT)) as u8 + 1
}

/// "Sources:" line for at most three attributions, or `None` when empty.
pub fn sources_line(attributions: &[BookAttribution], registry: &ResourceRegistry) -> Option<String> {
    if attributions.is_empty() {
        return None;
    }
    let cites: Vec<String> = attributions
        .iter()
        .take(MAX_ATTRIBUTIONS)
        .map(|book| match registry.section_for(&book.key) {
            Some(section) => format!("({}, {}; {})", book.pretty, book.author, section),
            None => format!("({}, {})", book.pretty, book.author),
        })
        .collect();
    Some(format!("Sources: {}", cites.join(", ")))
}

pub fn render_plan(plan: &ResponsePlan) -> String {
    let body = &plan.plan;
    let mut lines = vec![
        body.mirror.trim().to_string(),
        format!("**What's going on:** {}", body.diagnose.trim()),
        format!("**Truth anchor:** {}", body.truth_anchor.trim()),
        String::new(),
        "**Next 7 days**".to_string(),
    ];
    for (index, step) in body.steps_7day.iter().enumerate() {
        let trigger = step
            .trigger_if_then
            .as_deref()
            .map(str::trim)
            .filter(|trigger| !trigger.is_empty())
            .map(|trigger| format!(" (trigger: {trigger})"))
            .unwrap_or_default();
        lines.push(format!(
            "{}. {} ({} min). Say it like this: \"{}\"{}",
            index + 1,
            step.title.trim(),
            step.time_estimate_min,
            step.how_to_say_it.trim(),
            trigger
        ));
    }
    let obstacles: Vec<&str> = body
        .obstacles
        .iter()
        .map(|obstacle| obstacle.trim())
        .filter(|obstacle| !obstacle.is_empty())
        .collect();
    if !obstacles.is_empty() {
        lines.push(String::new());
        lines.push("**Likely obstacles:**".to_string());
        lines.extend(obstacles.into_iter().map(|obstacle| format!("- {obstacle}")));
    }
    lines.push(String::new());
    lines.push(format!("**Quick check-in:** {}", body.check_in_question.trim()));
    lines.join("\n")
}

/// Append a paragraph, separated by a blank line.
pub fn append_paragraph(text: &mut String, paragraph: &str) {
    let trimmed_len = text.trim_end().len();
    text.truncate(trimmed_len);
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(paragraph);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::fixtures::valid_plan;

    #[test]
    fn every_variant_has_a_line() {
        for variant in 1..=MAX_INVITE_VARIANT {
            assert!(invite_line(variant).contains("Jesus"));
        }
        assert_eq!(invite_line(0), invite_line(1));
        assert_eq!(invite_line(42), invite_line(MAX_INVITE_VARIANT));
    }

    #[test]
    fn rotating_variant_stays_in_range() {
        for turn in 0..20 {
            let variant = rotating_variant(turn);
            assert!((1..=MAX_INVITE_VARIANT).contains(&variant));
        }
    }

    #[test]
    fn plan_rendering_includes_scaffold() {
        let text = render_plan(&valid_plan());
        assert!(text.starts_with("It sounds like"));
        assert!(text.contains("**Truth anchor:** Be quick to listen"));
        assert!(text.contains("1. Step 1 (10 min)"));
        assert!(text.contains("3. Step 3"));
        assert!(text.contains("(trigger: If voices rise"));
        assert!(text.contains("- Fatigue after work"));
        assert!(text.trim_end().ends_with('?'));
        assert!(!text.contains("Jesus inviting"));
    }

    #[test]
    fn sources_line_caps_at_three() {
        let registry = ResourceRegistry::builtin();
        let books: Vec<BookAttribution> = registry.books.iter().take(5).map(|b| b.attribution()).collect();
        let line = sources_line(&books, &registry).unwrap();
        assert!(line.starts_with("Sources: "));
        assert_eq!(line.matches("; ").count(), 3);
        assert!(sources_line(&[], &registry).is_none());
    }

    #[test]
    fn safe_reply_is_resource_and_invite_free() {
        let registry = ResourceRegistry::builtin();
        let outcome = crate::resources::Scrubber::new(&registry).scrub(SAFE_REPLY);
        assert!(outcome.removed.is_empty());
        assert!(!SAFE_REPLY.contains("Jesus"));
    }

    #[test]
    fn append_paragraph_separates_blocks() {
        let mut text = "Hello.\n".to_string();
        append_paragraph(&mut text, "Next.");
        assert_eq!(text, "Hello.\n\nNext.");
    }
}
