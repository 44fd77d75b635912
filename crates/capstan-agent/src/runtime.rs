//! Agent runtime - the turn-driving state machine
//!
//! One turn: user message -> context assembly (with compression when the
//! estimate crosses the window) -> streamed model response -> tool batch
//! dispatch -> loop until the model ends the turn. Per-session
//! serialization comes from the session's turn guard; cancellation aborts
//! the stream and drains in-flight tools cooperatively.

use crate::context::ContextManager;
use crate::session::{to_llm_messages, Session, SessionRegistry};
use crate::stream::{StreamOutcome, StreamingHandler};
use capstan_core::{
    AgentEvent, CapstanConfig, CompactionReason, Error, EventBus, MessageMeta, Role, RunId,
    SessionId, StopReason, ToolResultBlock, ToolStrategy, TreeMessage,
};
use capstan_llm::{complete_stream_with_retry, LlmProvider, LlmRequest};
use capstan_tools::{ToolContext, ToolScheduler};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How many recent messages survive compression untouched.
const COMPRESSION_KEEP_RECENT: usize = 4;

/// Loop states, for observability; the loop itself drives transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    AwaitingModel,
    Streaming,
    AwaitingTools,
    Compacting,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub default_model: String,
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub context_window_warning: usize,
    pub context_window_max: usize,
    pub compression_enabled: bool,
    pub tool_strategy: ToolStrategy,
    pub tool_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: String::new(),
            max_turns: 25,
            system_prompt: None,
            max_tokens: 8192,
            temperature: None,
            context_window_warning: 100_000,
            context_window_max: 128_000,
            compression_enabled: true,
            tool_strategy: ToolStrategy::Auto,
            tool_timeout: Duration::from_secs(120),
        }
    }
}

impl AgentConfig {
    pub fn from_config(config: &CapstanConfig) -> Self {
        Self {
            default_model: config.model.model.clone(),
            max_turns: config.agent.max_turns,
            system_prompt: None,
            max_tokens: config.model.max_tokens,
            temperature: config.model.temperature,
            context_window_warning: config.agent.context_window_warning,
            context_window_max: config.agent.context_window_max,
            compression_enabled: config.agent.compression_enabled,
            tool_strategy: config.agent.tool_strategy,
            tool_timeout: Duration::from_secs(120),
        }
    }
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    scheduler: ToolScheduler,
    sessions: Arc<SessionRegistry>,
    bus: EventBus,
    config: AgentConfig,
}

impl AgentRuntime {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        scheduler: ToolScheduler,
        sessions: Arc<SessionRegistry>,
        bus: EventBus,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            scheduler,
            sessions,
            bus,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &ToolScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one full turn without external cancellation.
    pub async fn run_turn(
        &self,
        session_id: &SessionId,
        user_message: &str,
    ) -> Result<StopReason, Error> {
        self.run_turn_cancellable(session_id, user_message, CancellationToken::new())
            .await
    }

    /// Run one full turn. Cancelling the token aborts the model stream,
    /// propagates to in-flight tools, and ends the run with stop reason
    /// `cancelled`.
    pub async fn run_turn_cancellable(
        &self,
        session_id: &SessionId,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Result<StopReason, Error> {
        let session = self
            .sessions
            .get_or_load(session_id, self.config.system_prompt.as_deref())
            .await?;

        // Per-session serialization: a second message while a turn is in
        // flight is rejected, not interleaved.
        let _guard = session.begin_turn()?;

        let run_id = RunId::random();
        if session.message_count().await == 0 {
            self.bus.emit_with_run(
                run_id.clone(),
                AgentEvent::SessionStart {
                    session_id: session_id.clone(),
                },
            );
        }
        let mut handler = StreamingHandler::new(self.bus.clone(), run_id.clone());
        handler.agent_start(session_id);

        let user_id = session.add_message(TreeMessage::user(user_message)).await;
        self.bus.emit_with_run(
            run_id.clone(),
            AgentEvent::UserMessage {
                session_id: session_id.clone(),
                message_id: user_id,
            },
        );

        let result = self
            .drive_loop(&session, &mut handler, cancel.clone())
            .await;

        let stop_reason = match &result {
            Ok(reason) => *reason,
            Err(_) => StopReason::Error,
        };
        handler.agent_end(session_id, stop_reason);
        self.bus.emit_with_run(
            run_id,
            AgentEvent::AgentIdle {
                session_id: session_id.clone(),
            },
        );
        if let Err(e) = session.save().await {
            warn!("session {}: save failed at turn end: {}", session_id, e);
        }
        info!(
            "turn complete: session={}, stop={}, messages={}",
            session_id,
            stop_reason,
            session.message_count().await
        );
        result
    }

    async fn drive_loop(
        &self,
        session: &Arc<Session>,
        handler: &mut StreamingHandler,
        cancel: CancellationToken,
    ) -> Result<StopReason, Error> {
        let mut turns = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            turns += 1;
            if turns > self.config.max_turns {
                let message = format!("turn limit of {} exceeded", self.config.max_turns);
                self.bus.emit_with_run(
                    handler.run_id().clone(),
                    AgentEvent::Error {
                        message,
                        recoverable: false,
                    },
                );
                return Err(Error::MaxTurnsExceeded(self.config.max_turns));
            }

            // AwaitingModel: assemble context, compressing first if the
            // estimate crossed the window.
            if self.config.compression_enabled {
                self.maybe_compress(session, handler).await;
            }
            let context = session.build_context().await;
            let request = self.build_request(session, &context).await;

            debug!(
                "model request: {} messages, turn {}",
                request.messages.len(),
                turns
            );
            let stream = complete_stream_with_retry(
                self.provider.as_ref(),
                request,
                Some(cancel.clone()),
            )
            .await
            .map_err(|e| {
                self.bus.emit_with_run(
                    handler.run_id().clone(),
                    AgentEvent::Error {
                        message: e.to_string(),
                        recoverable: e.is_recoverable(),
                    },
                );
                Error::Provider(e)
            })?;

            // Streaming.
            let outcome = match handler.consume(stream, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.bus.emit_with_run(
                        handler.run_id().clone(),
                        AgentEvent::Error {
                            message: e.to_string(),
                            recoverable: e.is_recoverable(),
                        },
                    );
                    return Err(Error::Provider(e));
                }
            };

            if outcome.cancelled {
                self.commit_partial(session, handler, &outcome).await;
                return Ok(StopReason::Cancelled);
            }

            match outcome.stop_reason {
                StopReason::ToolUse => {
                    let assistant_id = session
                        .add_message(
                            TreeMessage::assistant_tool_calls(
                                if outcome.content.is_empty() {
                                    None
                                } else {
                                    Some(outcome.content.clone())
                                },
                                outcome.tool_calls.clone(),
                            )
                            .with_meta(self.message_meta(&outcome, false)),
                        )
                        .await;
                    self.bus.emit_with_run(
                        handler.run_id().clone(),
                        AgentEvent::AssistantMessage {
                            session_id: session.id.clone(),
                            message_id: assistant_id,
                        },
                    );

                    // AwaitingTools: dispatch the batch, results come back
                    // in call order.
                    let ctx = ToolContext::new(session.id.clone(), handler.run_id().clone())
                        .with_cancel(cancel.child_token())
                        .with_timeout(self.config.tool_timeout);
                    let results = self
                        .scheduler
                        .execute_batch(outcome.tool_calls.clone(), &ctx)
                        .await;

                    let blocks: Vec<ToolResultBlock> = outcome
                        .tool_calls
                        .iter()
                        .zip(results.iter())
                        .map(|(call, result)| ToolResultBlock {
                            tool_call_id: call.id.clone(),
                            content: result.to_content_string(),
                            is_error: result.is_error(),
                        })
                        .collect();
                    session.add_message(TreeMessage::tool_results(blocks)).await;

                    if cancel.is_cancelled() {
                        return Ok(StopReason::Cancelled);
                    }
                    // Back to AwaitingModel with the results on the tree.
                }
                StopReason::MaxTokens => {
                    // Treated as end of turn, flagged truncated.
                    let assistant_id = session
                        .add_message(
                            TreeMessage::assistant(&outcome.content)
                                .with_meta(self.message_meta(&outcome, true)),
                        )
                        .await;
                    self.bus.emit_with_run(
                        handler.run_id().clone(),
                        AgentEvent::AssistantMessage {
                            session_id: session.id.clone(),
                            message_id: assistant_id,
                        },
                    );
                    return Ok(StopReason::MaxTokens);
                }
                _ => {
                    let assistant_id = session
                        .add_message(
                            TreeMessage::assistant(&outcome.content)
                                .with_meta(self.message_meta(&outcome, false)),
                        )
                        .await;
                    self.bus.emit_with_run(
                        handler.run_id().clone(),
                        AgentEvent::AssistantMessage {
                            session_id: session.id.clone(),
                            message_id: assistant_id,
                        },
                    );
                    return Ok(StopReason::EndTurn);
                }
            }
        }
    }

    fn message_meta(&self, outcome: &StreamOutcome, truncated: bool) -> MessageMeta {
        MessageMeta {
            model: Some(self.config.default_model.clone()),
            input_tokens: outcome.usage.map(|u| u.input_tokens),
            output_tokens: outcome.usage.map(|u| u.output_tokens),
            duration_ms: None,
            summary: false,
            truncated,
        }
    }

    async fn commit_partial(
        &self,
        session: &Arc<Session>,
        handler: &StreamingHandler,
        outcome: &StreamOutcome,
    ) {
        if !outcome.content.is_empty() {
            let id = session
                .add_message(TreeMessage::assistant(&outcome.content))
                .await;
            self.bus.emit_with_run(
                handler.run_id().clone(),
                AgentEvent::AssistantMessage {
                    session_id: session.id.clone(),
                    message_id: id,
                },
            );
        }
    }

    async fn build_request(&self, session: &Arc<Session>, context: &[TreeMessage]) -> LlmRequest {
        let model = session
            .model()
            .await
            .unwrap_or_else(|| self.config.default_model.clone());
        let tools = match self.config.tool_strategy {
            ToolStrategy::Off => None,
            ToolStrategy::Always | ToolStrategy::Auto => {
                let defs = self.scheduler.registry().to_anthropic_format();
                if defs.is_empty() {
                    None
                } else {
                    Some(defs)
                }
            }
        };
        LlmRequest {
            model,
            messages: to_llm_messages(context),
            tools,
            max_tokens: Some(self.config.max_tokens),
            temperature: self.config.temperature,
            system: session.system_prompt().await,
        }
    }

    /// Compress when the token estimate reaches the window max: summarize
    /// the oldest messages into one synthetic assistant message and
    /// replace the history with summary + recent tail. Failure is
    /// non-fatal; the turn proceeds uncompressed.
    async fn maybe_compress(&self, session: &Arc<Session>, handler: &StreamingHandler) {
        let context = session.build_context().await;
        let body: Vec<TreeMessage> = context
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        let mut manager = ContextManager::new(self.config.context_window_max);
        if let Some(prompt) = session.system_prompt().await {
            manager.set_system(&prompt);
        }
        let used = manager.calculate_total(&body);
        if used < self.config.context_window_max {
            return;
        }
        if body.len() <= COMPRESSION_KEEP_RECENT + 1 {
            return;
        }

        // Compacting.
        handler.compaction_start(
            CompactionReason::ContextOverflow,
            used,
            self.config.context_window_max,
        );
        self.bus.emit_with_run(
            handler.run_id().clone(),
            AgentEvent::SessionCompress {
                session_id: session.id.clone(),
            },
        );

        let split = body.len() - COMPRESSION_KEEP_RECENT;
        let (prefix, tail) = body.split_at(split);

        match self.summarize(prefix).await {
            Ok(summary) => {
                let mut summary_message = TreeMessage::assistant(&summary);
                summary_message.meta.summary = true;
                summary_message.meta.model = Some(self.config.default_model.clone());

                let mut replacement = vec![summary_message];
                replacement.extend(tail.iter().cloned());
                session.replace_history(replacement).await;

                let after = manager.calculate_total(&session.build_context().await);
                info!(
                    "session {}: compressed {} -> {} tokens",
                    session.id, used, after
                );
                handler.compaction_end(
                    CompactionReason::ContextOverflow,
                    after,
                    self.config.context_window_max,
                );
            }
            Err(e) => {
                // Compression failure must not kill the turn.
                warn!("session {}: compression skipped: {}", session.id, e);
                handler.compaction_end(
                    CompactionReason::ContextOverflow,
                    used,
                    self.config.context_window_max,
                );
            }
        }
    }

    /// Auxiliary summarization call; plain text, no tools.
    async fn summarize(&self, messages: &[TreeMessage]) -> Result<String, Error> {
        let transcript: String = messages
            .iter()
            .map(|m| {
                format!(
                    "{}: {}\n",
                    match m.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                        Role::System => "system",
                    },
                    m.content.as_text()
                )
            })
            .collect();

        let request = LlmRequest {
            model: self.config.default_model.clone(),
            messages: vec![capstan_llm::LlmMessage::user(format!(
                "Summarize this conversation so it can replace the original \
                 messages as context. Keep decisions, facts, open items, and \
                 tone. Be dense.\n\n{}",
                transcript
            ))],
            tools: None,
            max_tokens: Some(1024),
            temperature: None,
            system: None,
        };

        let stream = self
            .provider
            .complete_stream(request, None)
            .await
            .map_err(Error::Provider)?;
        let mut text = String::new();
        tokio::pin!(stream);
        while let Some(delta) = stream.next().await {
            match delta.map_err(Error::Provider)? {
                capstan_llm::StreamDelta::Text(t) => text.push_str(&t),
                capstan_llm::StreamDelta::Done { full: Some(full), .. } => {
                    if full.starts_with(&text) {
                        text = full;
                    }
                }
                _ => {}
            }
        }
        if text.trim().is_empty() {
            return Err(Error::Compression("empty summary".into()));
        }
        Ok(format!("[Conversation summary]\n{}", text.trim()))
    }
}

/// The per-session serialization contract also applies to messages
/// arriving while a turn is running: callers see `Error::SessionBusy` and
/// may queue or reject per their own policy.
pub fn is_busy(err: &Error) -> bool {
    matches!(err, Error::SessionBusy(_))
}
