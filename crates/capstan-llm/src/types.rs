//! Request and streaming-response types shared by all provider dialects

use capstan_core::Usage;
use serde::{Deserialize, Serialize};

/// A completion request in provider-neutral form.
#[derive(Clone, Debug, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<LlmTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            tools: None,
            max_tokens: Some(8192),
            temperature: None,
            system: None,
        }
    }
}

/// Message in provider wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: LlmContent,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: LlmContent::Text(content.into()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: LlmContent::Text(content.into()),
        }
    }
}

/// Message content - plain string or array of blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LlmContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl From<String> for LlmContent {
    fn from(s: String) -> Self {
        LlmContent::Text(s)
    }
}

impl From<&str> for LlmContent {
    fn from(s: &str) -> Self {
        LlmContent::Text(s.to_string())
    }
}

/// Content block types
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Tool definition in provider wire form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmTool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Streaming fragment, already translated from the provider dialect.
#[derive(Clone, Debug)]
pub enum StreamDelta {
    /// Provider opened a new assistant message.
    MessageStart,
    Text(String),
    Thinking(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments: String },
    ToolCallEnd { id: String },
    Done {
        stop_reason: Option<String>,
        usage: Option<Usage>,
        /// Final full text when the provider re-sends it; consumers
        /// reconcile against accumulated deltas.
        full: Option<String>,
    },
    Error(String),
}

/// Accumulated tool call from streaming
#[derive(Clone, Debug, Default)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl AccumulatedToolCall {
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::json!({}));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// Normalize a message sequence for the provider:
/// - drop leading non-user messages,
/// - merge consecutive same-role text messages,
/// - close any assistant `tool_use` block that has no matching
///   `tool_result` by synthesizing an interrupted marker.
///
/// Tool-result blocks ride in user-role messages, so a user message whose
/// blocks are all tool results legitimately follows an assistant tool-use
/// message and is left alone.
pub fn normalize_messages(messages: &[LlmMessage]) -> Vec<LlmMessage> {
    let mut out: Vec<LlmMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        if out.is_empty() && message.role != "user" {
            continue;
        }

        // Merge consecutive same-role plain-text messages.
        if let (Some(last), LlmContent::Text(new_text)) = (out.last_mut(), &message.content) {
            if last.role == message.role {
                if let LlmContent::Text(ref mut existing) = last.content {
                    existing.push_str("\n\n");
                    existing.push_str(new_text);
                    continue;
                }
            }
        }

        out.push(message.clone());
    }

    // Heal orphaned tool_use blocks: every tool_use id must be answered by a
    // tool_result in the following user message.
    let mut idx = 0;
    while idx < out.len() {
        let tool_ids: Vec<String> = match (&out[idx].role[..], &out[idx].content) {
            ("assistant", LlmContent::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        if tool_ids.is_empty() {
            idx += 1;
            continue;
        }

        let answered: Vec<String> = out
            .get(idx + 1)
            .map(|next| match &next.content {
                LlmContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        let synthesized: Vec<ContentBlock> = tool_ids
            .iter()
            .filter(|id| !answered.contains(id))
            .map(|id| ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: "[tool execution interrupted]".to_string(),
                is_error: Some(true),
            })
            .collect();

        if !synthesized.is_empty() {
            if !answered.is_empty() {
                // Partial answers: fold the missing results into the
                // existing tool-result message.
                if let Some(LlmMessage {
                    content: LlmContent::Blocks(blocks),
                    ..
                }) = out.get_mut(idx + 1)
                {
                    blocks.extend(synthesized);
                }
            } else {
                out.insert(
                    idx + 1,
                    LlmMessage {
                        role: "user".into(),
                        content: LlmContent::Blocks(synthesized),
                    },
                );
            }
        }
        idx += 1;
    }

    out
}
