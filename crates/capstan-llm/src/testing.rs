//! Deterministic mock provider for tests
//!
//! Returns canned streams that exercise specific tool calls and stop
//! reasons without touching the network. Used by downstream crate tests.

use crate::provider::{LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta};
use async_stream::stream;
use capstan_core::ProviderError;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Mock behavior configuration
#[derive(Clone, Debug)]
pub enum MockBehavior {
    /// Stream a text-only response in small chunks.
    Text(String),
    /// Stream exact text deltas followed by a reconciling full content.
    Deltas { deltas: Vec<String>, full: String },
    /// One tool_use call with the given name and args.
    ToolCall { name: String, args: Value },
    /// Several tool_use calls in one turn.
    MultiToolCall(Vec<(String, Value)>),
    /// Text followed by a tool call.
    TextThenTool {
        text: String,
        tool_name: String,
        tool_args: Value,
    },
    /// Stop at max_tokens mid-sentence.
    Truncated(String),
    /// Text that never finishes until cancelled.
    Hang,
    /// A provider error before any delta.
    Error(String),
}

/// A sequence of behaviors - each call to complete_stream pops the next.
/// When the sequence is exhausted the default behavior answers.
pub struct MockProvider {
    behaviors: Mutex<Vec<MockBehavior>>,
    default_behavior: MockBehavior,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    pub fn constant(behavior: MockBehavior) -> Self {
        Self {
            behaviors: Mutex::new(Vec::new()),
            default_behavior: behavior,
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn sequence(behaviors: Vec<MockBehavior>) -> Self {
        Self {
            behaviors: Mutex::new(behaviors),
            default_behavior: MockBehavior::Text("(mock: sequence exhausted)".into()),
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub async fn call_count(&self) -> usize {
        *self.call_count.lock().await
    }

    /// Requests seen so far, for asserting on context assembly.
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().await.clone()
    }

    async fn next_behavior(&self, request: &LlmRequest) -> MockBehavior {
        let mut count = self.call_count.lock().await;
        *count += 1;
        self.requests.lock().await.push(request.clone());

        let mut behaviors = self.behaviors.lock().await;
        if behaviors.is_empty() {
            self.default_behavior.clone()
        } else {
            behaviors.remove(0)
        }
    }
}

fn mock_tool_id(n: usize) -> String {
    format!("toolu_mock_{:04}", n)
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn models(&self) -> &[&str] {
        &["mock-model"]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        let behavior = self.next_behavior(&request).await;
        let cancel = cancel.unwrap_or_default();

        if let MockBehavior::Error(ref message) = behavior {
            return Err(ProviderError::Transport(message.clone()));
        }

        let s = stream! {
            yield Ok(StreamDelta::MessageStart);
            match behavior {
                MockBehavior::Text(text) => {
                    for chunk in text.as_bytes().chunks(20) {
                        yield Ok(StreamDelta::Text(String::from_utf8_lossy(chunk).to_string()));
                    }
                    yield Ok(StreamDelta::Done { stop_reason: Some("end_turn".into()), usage: None, full: None });
                }

                MockBehavior::Deltas { deltas, full } => {
                    for d in deltas {
                        yield Ok(StreamDelta::Text(d));
                    }
                    // Providers may close with the full reconciled content.
                    yield Ok(StreamDelta::Done {
                        stop_reason: Some("end_turn".into()),
                        usage: None,
                        full: Some(full),
                    });
                }

                MockBehavior::ToolCall { name, args } => {
                    let id = mock_tool_id(0);
                    yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name });
                    yield Ok(StreamDelta::ToolCallDelta {
                        id: id.clone(),
                        arguments: serde_json::to_string(&args).unwrap_or_default(),
                    });
                    yield Ok(StreamDelta::ToolCallEnd { id });
                    yield Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None, full: None });
                }

                MockBehavior::MultiToolCall(tools) => {
                    for (n, (name, args)) in tools.into_iter().enumerate() {
                        let id = mock_tool_id(n);
                        yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name });
                        yield Ok(StreamDelta::ToolCallDelta {
                            id: id.clone(),
                            arguments: serde_json::to_string(&args).unwrap_or_default(),
                        });
                        yield Ok(StreamDelta::ToolCallEnd { id });
                    }
                    yield Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None, full: None });
                }

                MockBehavior::TextThenTool { text, tool_name, tool_args } => {
                    yield Ok(StreamDelta::Text(text));
                    let id = mock_tool_id(0);
                    yield Ok(StreamDelta::ToolCallStart { id: id.clone(), name: tool_name });
                    yield Ok(StreamDelta::ToolCallDelta {
                        id: id.clone(),
                        arguments: serde_json::to_string(&tool_args).unwrap_or_default(),
                    });
                    yield Ok(StreamDelta::ToolCallEnd { id });
                    yield Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None, full: None });
                }

                MockBehavior::Truncated(text) => {
                    yield Ok(StreamDelta::Text(text));
                    yield Ok(StreamDelta::Done { stop_reason: Some("max_tokens".into()), usage: None, full: None });
                }

                MockBehavior::Hang => {
                    cancel.cancelled().await;
                }

                MockBehavior::Error(_) => unreachable!("handled above"),
            }
        };

        Ok(Box::pin(s))
    }
}
