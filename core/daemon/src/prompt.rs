//! Wake prompt synthesis.

use relay_protocol::Message;

/// Bodies longer than this are cut so a burst of pastes cannot blow up argv.
const MAX_BODY_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakePrompt {
    pub text: String,
    /// Highest message id folded into `text`.
    pub last_message_id: i64,
}

/// Builds the prompt for a wake from the trigger plus drained pending
/// messages. Messages are deduplicated and ordered by id.
pub fn build_wake_prompt(
    worker_id: &str,
    lane: &str,
    trigger: &Message,
    pending: &[Message],
) -> WakePrompt {
    let mut ordered: Vec<&Message> = pending.iter().chain(std::iter::once(trigger)).collect();
    ordered.sort_by_key(|message| message.id);
    ordered.dedup_by_key(|message| message.id);
    let last_message_id = ordered
        .last()
        .map(|message| message.id)
        .unwrap_or(trigger.id);

    let mut text = format!(
        "You are {}. You were mentioned in the #{} lane.\n\n",
        worker_id, lane
    );
    for message in &ordered {
        text.push_str(&format!(
            "[#{}] {}: {}\n",
            message.id,
            message.sender,
            truncate(&message.body, MAX_BODY_CHARS)
        ));
    }
    text.push_str("\nRead the lane for context, do the work, and reply in the lane when done.\n");

    WakePrompt {
        text,
        last_message_id,
    }
}

fn truncate(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: i64, sender: &str, body: &str) -> Message {
        Message {
            id,
            lane: "room".to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            thread_id: None,
            reply_to: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn orders_and_dedupes_messages() {
        let prompt = build_wake_prompt(
            "builder",
            "room",
            &message(4, "alice", "@builder fix the build"),
            &[
                message(9, "bob", "@builder also this"),
                message(9, "bob", "@builder also this"),
            ],
        );

        assert_eq!(prompt.last_message_id, 9);
        let first = prompt.text.find("[#4] alice").expect("first line");
        let second = prompt.text.find("[#9] bob").expect("second line");
        assert!(first < second);
        assert_eq!(prompt.text.matches("[#9]").count(), 1);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundaries() {
        let body = "é".repeat(MAX_BODY_CHARS + 10);
        let prompt = build_wake_prompt("builder", "room", &message(1, "alice", &body), &[]);
        assert!(prompt.text.contains('…'));
        assert_eq!(prompt.text.matches('é').count(), MAX_BODY_CHARS);
    }

    #[test]
    fn trigger_alone_is_folded() {
        let prompt = build_wake_prompt("builder", "room", &message(7, "alice", "@builder hi"), &[]);
        assert_eq!(prompt.last_message_id, 7);
        assert!(prompt.text.starts_with("You are builder."));
    }
}
