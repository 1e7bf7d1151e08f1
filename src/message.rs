use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a workflow's replayable message log.
///
/// Messages carry a role, text content, a UTC timestamp, and (for stage
/// output) the id of the agent that produced them. The log is append-only:
/// entries are never modified once recorded, which is what makes it safe to
/// replay when a workflow resumes from a checkpoint.
///
/// # Examples
///
/// ```
/// use wayfarer::message::Message;
///
/// let user_msg = Message::user("What is quantum computing?");
/// let reply = Message::assistant("Query is clear").tagged("clarify");
///
/// assert!(user_msg.has_role(Message::USER));
/// assert_eq!(reply.agent_id.as_deref(), Some("clarify"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the sender (see the constants on [`Message`]).
    pub role: String,
    /// The text content of the message.
    pub content: String,
    /// When the message was appended to the log.
    pub timestamp: DateTime<Utc>,
    /// Id of the agent that produced this message, when it came from a stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// Agent (assistant) response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";
    /// Tool output message role.
    pub const TOOL: &'static str = "tool";

    /// Creates a new message with the specified role and content, stamped now.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            agent_id: None,
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Creates a tool message.
    #[must_use]
    pub fn tool(content: &str) -> Self {
        Self::new(Self::TOOL, content)
    }

    /// Tags this message with the agent that produced it.
    #[must_use]
    pub fn tagged(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    /// Returns true if this message has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_sets_fields() {
        let msg = Message::new("user", "hello");
        assert_eq!(msg.role, "user");
        assert_eq!(msg.content, "hello");
        assert!(msg.agent_id.is_none());
    }

    #[test]
    fn convenience_constructors() {
        assert_eq!(Message::user("a").role, Message::USER);
        assert_eq!(Message::assistant("b").role, Message::ASSISTANT);
        assert_eq!(Message::system("c").role, Message::SYSTEM);
        assert_eq!(Message::tool("d").role, Message::TOOL);
    }

    #[test]
    fn tagging_records_the_agent() {
        let msg = Message::assistant("done").tagged("researcher");
        assert_eq!(msg.agent_id.as_deref(), Some("researcher"));
        assert!(msg.has_role(Message::ASSISTANT));
    }

    #[test]
    fn serialization_round_trip() {
        let original = Message::assistant("Brief: scope...").tagged("brief");
        let json = serde_json::to_string(&original).expect("serialize");
        let parsed: Message = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(original, parsed);
    }

    #[test]
    fn untagged_messages_omit_the_agent_field() {
        let json = serde_json::to_string(&Message::user("hi")).expect("serialize");
        assert!(!json.contains("agent_id"));
    }
}
