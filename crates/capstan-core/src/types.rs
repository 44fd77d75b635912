//! Core types shared across the Capstan workspace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

macro_rules! arc_str_id {
    ($name:ident) => {
        /// Cheaply cloneable string identifier
        #[derive(Clone, Debug, Hash, Eq, PartialEq)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            /// Fresh random identifier.
            pub fn random() -> Self {
                Self::new(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::new(s))
            }
        }
    };
}

arc_str_id!(SessionId);
arc_str_id!(MessageId);
arc_str_id!(RunId);

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call issued by the model. The id is provider-assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One tool result block inside a tool-role message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_call_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Message content: plain text, a tool-call list, or a tool-result list.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
    },
    /// Assistant turn that requested tools, with any text preceding the calls.
    ToolCalls {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    ToolResults {
        results: Vec<ToolResultBlock>,
    },
}

impl MessageContent {
    /// Flattened text view, used for token estimation and display.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text { text } => text.clone(),
            MessageContent::ToolCalls { text, calls } => {
                let mut out = text.clone().unwrap_or_default();
                for call in calls {
                    out.push_str(&format!("\n[tool:{}] {}", call.name, call.input));
                }
                out
            }
            MessageContent::ToolResults { results } => results
                .iter()
                .map(|r| r.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Optional per-message metadata.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Set on the synthetic message produced by context compression.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    /// Set when the model stopped at max_tokens.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl MessageMeta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A node in the session's branching message tree.
///
/// Parent and children are ids, not references: the tree lives in a flat
/// id→node map so it persists naturally and has no ownership cycles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<MessageId>,
    #[serde(default)]
    pub children: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "MessageMeta::is_empty")]
    pub meta: MessageMeta,
}

impl TreeMessage {
    pub fn new(role: Role, content: MessageContent) -> Self {
        Self {
            id: MessageId::random(),
            role,
            content,
            timestamp: Utc::now(),
            parent: None,
            children: Vec::new(),
            meta: MessageMeta::default(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, MessageContent::Text { text: text.into() })
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageContent::Text { text: text.into() })
    }

    pub fn assistant_tool_calls(text: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self::new(Role::Assistant, MessageContent::ToolCalls { text, calls })
    }

    pub fn tool_results(results: Vec<ToolResultBlock>) -> Self {
        Self::new(Role::Tool, MessageContent::ToolResults { results })
    }

    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = meta;
        self
    }
}

/// Five-valued risk lattice used by the command classifier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn requires_approval(self) -> bool {
        self >= RiskLevel::Medium
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Why a model turn stopped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Cancelled,
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::EndTurn => "end_turn",
            StopReason::ToolUse => "tool_use",
            StopReason::MaxTokens => "max_tokens",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Token usage reported by the provider. Providers may report the two
/// counters in separate stream events, so each defaults to zero.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error codes carried inside a failed tool result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    NotFound,
    MissingParameter,
    InvalidParameter,
    PermissionDenied,
    Timeout,
    SecurityViolation,
    Execution,
    ApprovalDenied,
    ApprovalTimeout,
    Cancelled,
}

impl std::fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolErrorCode::NotFound => "not_found",
            ToolErrorCode::MissingParameter => "missing_parameter",
            ToolErrorCode::InvalidParameter => "invalid_parameter",
            ToolErrorCode::PermissionDenied => "permission_denied",
            ToolErrorCode::Timeout => "timeout",
            ToolErrorCode::SecurityViolation => "security_violation",
            ToolErrorCode::Execution => "execution",
            ToolErrorCode::ApprovalDenied => "approval_denied",
            ToolErrorCode::ApprovalTimeout => "approval_timeout",
            ToolErrorCode::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Failure payload inside a tool result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolFailure {
    pub code: ToolErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Execution metadata attached to every tool result.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultMeta {
    pub duration_ms: u64,
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
}

/// The outcome of one tool invocation, success or failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ToolResultMeta>,
}

impl ToolInvocationResult {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            meta: None,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self::ok(serde_json::Value::String(s.into()))
    }

    pub fn fail(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(ToolFailure {
                code,
                message: message.into(),
                details: None,
            }),
            meta: None,
        }
    }

    pub fn with_meta(mut self, tool_name: &str, duration_ms: u64) -> Self {
        self.meta = Some(ToolResultMeta {
            duration_ms,
            tool_name: tool_name.to_string(),
            timestamp: Utc::now(),
        });
        self
    }

    /// Content string fed back to the model.
    pub fn to_content_string(&self) -> String {
        if let Some(ref err) = self.error {
            return format!("Error [{}]: {}", err.code, err.message);
        }
        match &self.output {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => String::new(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.success
    }
}
