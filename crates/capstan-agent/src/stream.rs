//! Streaming handler - assembles provider fragments into bus events
//!
//! One handler per run. Message events for the same message are strictly
//! ordered (start < updates < end); short delta bursts are coalesced by a
//! flush window unless the pending text crosses the hard threshold.

use crate::delta::DeltaBuffer;
use capstan_core::{
    AgentEvent, CompactionReason, EventBus, MessageId, ProviderError, RunId, SessionId,
    StopReason, ToolCall, Usage,
};
use capstan_llm::{AccumulatedToolCall, LlmStream, StreamDelta};
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const FLUSH_THRESHOLD_CHARS: usize = 50;
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Everything one model response produced.
#[derive(Debug)]
pub struct StreamOutcome {
    pub message_id: Option<MessageId>,
    pub content: String,
    pub thinking: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
    pub cancelled: bool,
}

pub struct StreamingHandler {
    bus: EventBus,
    run_id: RunId,
    buffer: DeltaBuffer,
    pending: String,
    last_flush: Option<Instant>,
    current_message: Option<MessageId>,
    assistant_texts: Vec<String>,
    flush_threshold: usize,
    flush_interval: Duration,
}

impl StreamingHandler {
    pub fn new(bus: EventBus, run_id: RunId) -> Self {
        Self {
            bus,
            run_id,
            buffer: DeltaBuffer::new(),
            pending: String::new(),
            last_flush: None,
            current_message: None,
            assistant_texts: Vec::new(),
            flush_threshold: FLUSH_THRESHOLD_CHARS,
            flush_interval: FLUSH_INTERVAL,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Assistant texts completed so far in this run.
    pub fn assistant_texts(&self) -> &[String] {
        &self.assistant_texts
    }

    pub fn agent_start(&mut self, session_id: &SessionId) {
        self.buffer.clear();
        self.pending.clear();
        self.last_flush = None;
        self.current_message = None;
        self.assistant_texts.clear();
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::AgentStart {
                session_id: session_id.clone(),
            },
        );
    }

    pub fn agent_end(&mut self, session_id: &SessionId, stop_reason: StopReason) {
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::AgentEnd {
                session_id: session_id.clone(),
                stop_reason,
            },
        );
    }

    pub fn compaction_start(&self, reason: CompactionReason, used: usize, max: usize) {
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::AutoCompactionStart {
                reason,
                used_tokens: used,
                max_tokens: max,
            },
        );
    }

    pub fn compaction_end(&self, reason: CompactionReason, used: usize, max: usize) {
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::AutoCompactionEnd {
                reason,
                used_tokens: used,
                max_tokens: max,
            },
        );
    }

    fn message_start(&mut self) -> MessageId {
        let id = MessageId::random();
        self.buffer.clear();
        self.pending.clear();
        self.last_flush = None;
        self.current_message = Some(id.clone());
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::MessageStart {
                message_id: id.clone(),
            },
        );
        id
    }

    fn ensure_message(&mut self) -> MessageId {
        match self.current_message.clone() {
            Some(id) => id,
            None => self.message_start(),
        }
    }

    fn on_delta(&mut self, text: &str) {
        self.ensure_message();
        self.buffer.append(text);
        self.pending.push_str(text);
        let window_expired = self
            .last_flush
            .map(|t| t.elapsed() >= self.flush_interval)
            .unwrap_or(true);
        if self.pending.len() >= self.flush_threshold || window_expired {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let Some(message_id) = self.current_message.clone() else {
            return;
        };
        let delta = std::mem::take(&mut self.pending);
        self.bus.emit_with_run(
            self.run_id.clone(),
            AgentEvent::MessageUpdate {
                message_id,
                delta,
                accumulated: self.buffer.content().to_string(),
            },
        );
        self.last_flush = Some(Instant::now());
    }

    fn message_end(
        &mut self,
        full: Option<&str>,
        stop_reason: StopReason,
        usage: Option<Usage>,
    ) -> (String, String) {
        self.flush();
        if let Some(full) = full {
            self.buffer.append_dedup(full);
        }
        let extracted = self.buffer.extract_thinking();
        let content = extracted.content;
        let thinking = extracted.thinking;

        if let Some(message_id) = self.current_message.take() {
            if !content.is_empty() {
                self.assistant_texts.push(content.clone());
            }
            self.bus.emit_with_run(
                self.run_id.clone(),
                AgentEvent::MessageEnd {
                    message_id,
                    content: content.clone(),
                    stop_reason,
                    usage,
                },
            );
        }
        (content, thinking)
    }

    /// Drive one provider stream to completion (or cancellation),
    /// producing the assembled outcome.
    pub async fn consume(
        &mut self,
        stream: LlmStream,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, ProviderError> {
        let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
        let mut current_tool: Option<AccumulatedToolCall> = None;
        let mut native_thinking = String::new();
        let mut stop_reason_raw: Option<String> = None;
        let mut usage: Option<Usage> = None;
        let mut full: Option<String> = None;
        let mut cancelled = false;

        tokio::pin!(stream);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("stream consumption cancelled");
                    cancelled = true;
                    break;
                }
                delta = stream.next() => {
                    let Some(delta) = delta else { break };
                    match delta? {
                        StreamDelta::MessageStart => {
                            self.message_start();
                        }
                        StreamDelta::Text(text) => {
                            self.on_delta(&text);
                        }
                        StreamDelta::Thinking(thinking) => {
                            native_thinking.push_str(&thinking);
                        }
                        StreamDelta::ToolCallStart { id, name } => {
                            self.ensure_message();
                            current_tool = Some(AccumulatedToolCall {
                                id,
                                name,
                                arguments: String::new(),
                            });
                        }
                        StreamDelta::ToolCallDelta { id: _, arguments } => {
                            if let Some(ref mut tool) = current_tool {
                                tool.arguments.push_str(&arguments);
                            }
                        }
                        StreamDelta::ToolCallEnd { id: _ } => {
                            if let Some(tool) = current_tool.take() {
                                tool_calls.push(tool);
                            }
                        }
                        StreamDelta::Done { stop_reason, usage: u, full: f } => {
                            stop_reason_raw = stop_reason;
                            usage = u;
                            full = f;
                        }
                        StreamDelta::Error(message) => {
                            return Err(ProviderError::InvalidResponse(message));
                        }
                    }
                }
            }
        }

        // A half-open tool call at stream end still counts.
        if let Some(tool) = current_tool.take() {
            tool_calls.push(tool);
        }

        let stop_reason = if cancelled {
            StopReason::Cancelled
        } else {
            parse_stop_reason(stop_reason_raw.as_deref(), !tool_calls.is_empty())
        };

        let message_id = self.current_message.clone();
        let (content, inline_thinking) = self.message_end(full.as_deref(), stop_reason, usage);

        let mut thinking = native_thinking;
        if !inline_thinking.is_empty() {
            if !thinking.is_empty() {
                thinking.push('\n');
            }
            thinking.push_str(&inline_thinking);
        }

        let calls = tool_calls
            .into_iter()
            .map(|tc| {
                let input = tc.parse_arguments().unwrap_or_else(|e| {
                    debug!("tool call {} has unparseable arguments: {}", tc.id, e);
                    serde_json::json!({})
                });
                ToolCall {
                    id: tc.id,
                    name: tc.name,
                    input,
                }
            })
            .collect();

        Ok(StreamOutcome {
            message_id,
            content,
            thinking,
            tool_calls: calls,
            stop_reason,
            usage,
            cancelled,
        })
    }
}

fn parse_stop_reason(raw: Option<&str>, has_tool_calls: bool) -> StopReason {
    match raw {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("end_turn") | Some("stop") => {
            if has_tool_calls {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }
        }
        Some("cancelled") => StopReason::Cancelled,
        _ if has_tool_calls => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}
