use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        source: serde_json::Value,
    },
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::Text { text: text.into() }])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentBlock::Text { text: text.into() }])
    }

    /// A user-role message carrying a single tool result.
    pub fn tool_result(tool_use_id: impl Into<String>, content: serde_json::Value, is_error: bool) -> Self {
        Self::new(
            Role::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content,
                is_error,
            }],
        )
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Ids of `tool_use` blocks in this message.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids referenced by `tool_result` blocks in this message.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(crate::error::Error::Validation(format!("invalid role: {s}"))),
        }
    }
}

/// Index of the last safe-fork-point in `messages`, or -1 if there is none.
///
/// A position is safe when every `tool_use` issued so far has a matching
/// `tool_result`, and the message there is either a user message or an
/// assistant message that issued no tool calls.
pub fn safe_fork_point(messages: &[Message]) -> i64 {
    let mut open: std::collections::HashSet<&str> = std::collections::HashSet::new();
    let mut last = -1;
    for (idx, message) in messages.iter().enumerate() {
        for id in message.tool_result_ids() {
            open.remove(id);
        }
        let mut issued = false;
        for id in message.tool_use_ids() {
            open.insert(id);
            issued = true;
        }
        let safe_role = match message.role {
            Role::User => true,
            Role::Assistant => !issued,
            Role::System => false,
        };
        if safe_role && open.is_empty() {
            last = idx as i64;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_tagging() {
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::Text { text: "checking".into() },
                ContentBlock::ToolUse {
                    id: "call-1".into(),
                    name: "bash".into(),
                    input: json!({"cmd": "ls"}),
                },
            ],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["content"][1]["type"], "tool_use");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tool_use_ids().collect::<Vec<_>>(), vec!["call-1"]);
    }

    #[test]
    fn test_safe_fork_point_skips_open_tool_calls() {
        let mut messages = vec![Message::user("hi"), Message::assistant("hello")];
        assert_eq!(safe_fork_point(&messages), 1);

        messages.push(Message::new(
            Role::Assistant,
            vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "read".into(),
                input: json!({}),
            }],
        ));
        assert_eq!(safe_fork_point(&messages), 1);

        messages.push(Message::tool_result("t1", json!("ok"), false));
        assert_eq!(safe_fork_point(&messages), 3);
    }

    #[test]
    fn test_safe_fork_point_empty() {
        assert_eq!(safe_fork_point(&[]), -1);
        assert_eq!(safe_fork_point(&[Message::system("rules")]), -1);
    }
}
