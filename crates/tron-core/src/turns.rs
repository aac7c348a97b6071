use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TurnId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    /// Results of tool calls issued by the preceding assistant turn.
    Tool,
    /// Condensed replacement for a run of older turns.
    Summary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::Summary => "summary",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub call_id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

/// One entry of a conversation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolOutcome>,
    pub timestamp: DateTime<Utc>,
}

// --- Convenience constructors ---

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::new(Role::Summary, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolInvocation>) -> Self {
        let mut turn = Self::assistant(content);
        turn.tool_calls = calls;
        turn
    }

    pub fn tool_results(results: Vec<ToolOutcome>) -> Self {
        let mut turn = Self::new(Role::Tool, "");
        turn.tool_results = results;
        turn
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn is_summary(&self) -> bool {
        self.role == Role::Summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_turn_roundtrip() {
        let turn = Turn::user("hello");
        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains(r#""role":"user""#));
        assert!(!json.contains("tool_calls"), "empty vecs are skipped: {json}");
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn tool_payloads_serialize() {
        let turn = Turn::assistant_with_calls(
            "",
            vec![ToolInvocation {
                id: "call_1".into(),
                name: "bash".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        assert!(turn.has_tool_calls());
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["tool_calls"][0]["name"], "bash");
    }

    #[test]
    fn tool_result_defaults_is_error() {
        let outcome: ToolOutcome =
            serde_json::from_str(r#"{"call_id":"c","output":"ok"}"#).unwrap();
        assert!(!outcome.is_error);
    }

    #[test]
    fn role_display() {
        assert_eq!(Role::Summary.to_string(), "summary");
        assert_eq!(Role::Tool.to_string(), "tool");
    }
}
