use serde::Serialize;
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

/// One transcript turn, serialized as a chat-completions message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            name: None,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            name: None,
            content: content.into(),
        }
    }

    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Function,
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// Append-only conversation log for one call.
///
/// The whole log is resent as context with every completion request; there is
/// no trimming and no external memory.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transcript seeded with the fixed instructions and the scripted greeting
    pub fn with_instructions(instructions: &[&str], greeting: &str) -> Self {
        let mut transcript = Self::new();
        for instruction in instructions {
            transcript.push(Message::system(*instruction));
        }
        transcript.push(Message::assistant(greeting));
        transcript
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append a turn, tagging it with `name` unless it comes from the caller
    pub fn push_turn(&mut self, role: Role, name: Option<&str>, text: impl Into<String>) {
        let name = match role {
            Role::User => None,
            _ => name.map(str::to_string),
        };
        self.push(Message {
            role,
            name,
            content: text.into(),
        });
    }

    /// Live call metadata, visible to the model as a system turn
    pub fn add_call_metadata(&mut self, call_sid: &str) {
        self.push(Message::system(format!("callSid: {}", call_sid)));
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
