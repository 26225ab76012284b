use uuid::Uuid;

use crate::protocol::{ChatMessage, Participant, SYSTEM_SENDER};
use crate::utils::current_unix_millis;

const SYSTEM_NAME: &str = "System";

/// Chat messages in arrival order. Nothing is ever reordered or removed.
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Record a locally produced notice ("X joined the party.")
    pub fn system(&mut self, text: impl Into<String>) -> &ChatMessage {
        self.messages.push(ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: SYSTEM_SENDER.to_string(),
            sender_name: SYSTEM_NAME.to_string(),
            text: text.into(),
            timestamp: current_unix_millis(),
            is_system: true,
        });
        &self.messages[self.messages.len() - 1]
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }
}

/// Build an outgoing chat message; `None` for blank input
pub fn compose(author: &Participant, text: &str) -> Option<ChatMessage> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(ChatMessage {
        id: Uuid::new_v4().to_string(),
        sender_id: author.id.clone(),
        sender_name: author.display_name.clone(),
        text: text.to_string(),
        timestamp: current_unix_millis(),
        is_system: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_arrival_order() {
        let author = Participant {
            id: "p1".into(),
            display_name: "Ana".into(),
            is_host: false,
            color_tag: "#94a3b8".into(),
        };
        let mut log = ChatLog::default();
        log.system("Ana joined the party.");
        log.push(compose(&author, " hello ").unwrap());
        assert!(compose(&author, "   ").is_none());

        let texts: Vec<_> = log.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["Ana joined the party.", "hello"]);
        assert!(log.messages()[0].is_system);
        assert_eq!(log.messages()[1].sender_name, "Ana");
    }
}
