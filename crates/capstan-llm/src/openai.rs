//! OpenAI chat-completions adapter with SSE streaming
//!
//! Also serves Gemini through its OpenAI-compatible endpoint via
//! `with_base_url`.

use crate::provider::{LlmProvider, LlmResult, LlmStream};
use crate::types::{normalize_messages, ContentBlock, LlmContent, LlmRequest, StreamDelta};
use capstan_core::{ProviderError, Usage};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    name: &'static str,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_API_URL.to_string(),
            name: "openai",
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Same dialect, reported under the gemini name.
    pub fn gemini(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            name: "gemini",
        }
    }
}

/// Flatten block-form messages into the chat-completions shape: assistant
/// tool calls become `tool_calls`, tool results become `tool` role messages.
fn to_openai_messages(request: &LlmRequest) -> Vec<OpenAiMessage> {
    let mut out = Vec::new();
    if let Some(ref system) = request.system {
        out.push(OpenAiMessage {
            role: "system".into(),
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in normalize_messages(&request.messages) {
        match message.content {
            LlmContent::Text(text) => out.push(OpenAiMessage {
                role: message.role,
                content: Some(text),
                tool_calls: None,
                tool_call_id: None,
            }),
            LlmContent::Blocks(blocks) => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                let mut results = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text: t } => text.push_str(&t),
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(OpenAiToolCall {
                                id,
                                kind: "function".into(),
                                function: OpenAiFunctionCall {
                                    name,
                                    arguments: input.to_string(),
                                },
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => results.push((tool_use_id, content)),
                    }
                }
                if !text.is_empty() || !tool_calls.is_empty() {
                    out.push(OpenAiMessage {
                        role: message.role.clone(),
                        content: if text.is_empty() { None } else { Some(text) },
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    });
                }
                for (id, content) in results {
                    out.push(OpenAiMessage {
                        role: "tool".into(),
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: Some(id),
                    });
                }
            }
        }
    }
    out
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn models(&self) -> &[&str] {
        &["gpt-", "o1", "o3", "gemini-"]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: to_openai_messages(&request),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| OpenAiTool {
                        kind: "function".into(),
                        function: OpenAiFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect()
            }),
        };

        debug!("openai request: model={}", body.model);

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("openai error {}: {}", status, error_text);
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth(error_text),
                429 => ProviderError::RateLimited {
                    retry_after_ms: 60_000,
                },
                _ => ProviderError::Transport(format!("{}: {}", status, error_text)),
            });
        }

        let stream = parse_sse_stream(response.bytes_stream(), cancel);
        Ok(Box::pin(stream))
    }
}

fn parse_sse_stream(
    bytes_stream: impl futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    cancel: Option<CancellationToken>,
) -> impl futures::Stream<Item = LlmResult<StreamDelta>> + Send {
    async_stream::stream! {
        let mut buffer = String::new();
        // index -> (id, emitted ToolCallEnd yet)
        let mut tool_ids: Vec<String> = Vec::new();
        let mut open_tool: Option<String> = None;
        let mut started = false;
        let mut finish_reason: Option<String> = None;
        let mut usage: Option<Usage> = None;
        let cancel = cancel.unwrap_or_default();

        tokio::pin!(bytes_stream);

        loop {
            let chunk_result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("openai stream cancelled, dropping connection");
                    return;
                }
                c = bytes_stream.next() => match c {
                    Some(c) => c,
                    None => break,
                },
            };

            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(ProviderError::Transport(e.to_string()));
                    continue;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let data = match line.strip_prefix("data: ") {
                    Some(d) => d.to_string(),
                    None => continue,
                };

                if data == "[DONE]" {
                    if let Some(id) = open_tool.take() {
                        yield Ok(StreamDelta::ToolCallEnd { id });
                    }
                    yield Ok(StreamDelta::Done {
                        stop_reason: Some(map_finish_reason(finish_reason.as_deref())),
                        usage: usage.take(),
                        full: None,
                    });
                    return;
                }

                let parsed: ChatChunk = match serde_json::from_str(&data) {
                    Ok(p) => p,
                    Err(e) => {
                        yield Err(ProviderError::InvalidResponse(e.to_string()));
                        continue;
                    }
                };

                if let Some(u) = parsed.usage {
                    usage = Some(Usage {
                        input_tokens: u.prompt_tokens,
                        output_tokens: u.completion_tokens,
                    });
                }

                let Some(choice) = parsed.choices.into_iter().next() else {
                    continue;
                };

                if !started {
                    started = true;
                    yield Ok(StreamDelta::MessageStart);
                }

                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(reason);
                }

                if let Some(content) = choice.delta.content {
                    if !content.is_empty() {
                        yield Ok(StreamDelta::Text(content));
                    }
                }

                for tc in choice.delta.tool_calls.unwrap_or_default() {
                    let index = tc.index as usize;
                    if let Some(id) = tc.id {
                        // New call at this index: close the previous one.
                        if let Some(prev) = open_tool.take() {
                            yield Ok(StreamDelta::ToolCallEnd { id: prev });
                        }
                        while tool_ids.len() <= index {
                            tool_ids.push(String::new());
                        }
                        tool_ids[index] = id.clone();
                        open_tool = Some(id.clone());
                        let name = tc
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default();
                        yield Ok(StreamDelta::ToolCallStart { id, name });
                    }
                    if let Some(function) = tc.function {
                        if let Some(arguments) = function.arguments {
                            if !arguments.is_empty() {
                                if let Some(id) = tool_ids.get(index).filter(|s| !s.is_empty()) {
                                    yield Ok(StreamDelta::ToolCallDelta {
                                        id: id.clone(),
                                        arguments,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }

        // Stream ended without [DONE] - still emit what we know.
        if let Some(id) = open_tool.take() {
            yield Ok(StreamDelta::ToolCallEnd { id });
        }
        yield Ok(StreamDelta::Done {
            stop_reason: Some(map_finish_reason(finish_reason.as_deref())),
            usage: usage.take(),
            full: None,
        });
    }
}

fn map_finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("tool_calls") => "tool_use".into(),
        Some("length") => "max_tokens".into(),
        _ => "end_turn".into(),
    }
}

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunction,
}

#[derive(Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Deserialize)]
struct ChunkToolCall {
    index: u32,
    id: Option<String>,
    function: Option<ChunkFunction>,
}

#[derive(Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
