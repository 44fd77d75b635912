//! Human-in-the-loop approval gate for risky tool calls
//!
//! Requests go out on an injected channel (the platform adapter's side);
//! decisions come back through `resolve`. No response within the timeout
//! means denied. A denied call must never reach the tool.

use crate::classify::Classification;
use capstan_core::{
    AgentEvent, ApprovalError, EventBus, SessionId, ToolInvocationResult, TrustMode,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// An approval request emitted to the configured channel.
#[derive(Clone, Debug)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub risk: capstan_core::RiskLevel,
    pub warnings: Vec<String>,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
}

/// The human's decision.
#[derive(Clone, Debug)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub remember_choice: bool,
}

impl ApprovalResponse {
    pub fn approve() -> Self {
        Self {
            approved: true,
            timestamp: Utc::now(),
            reason: None,
            remember_choice: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            timestamp: Utc::now(),
            reason: Some(reason.into()),
            remember_choice: false,
        }
    }

    pub fn remembered(mut self) -> Self {
        self.remember_choice = true;
        self
    }
}

/// Completed request + response pair kept in the approval log.
#[derive(Clone, Debug)]
pub struct ApprovalRecord {
    pub request: ApprovalRequest,
    pub response: ApprovalResponse,
    pub execution_result: Option<ToolInvocationResult>,
}

const APPROVAL_LOG_CAP: usize = 256;

pub struct ApprovalManager {
    pending: DashMap<String, oneshot::Sender<ApprovalResponse>>,
    remembered: DashMap<String, bool>,
    outbound: Mutex<Option<mpsc::Sender<ApprovalRequest>>>,
    log: Mutex<Vec<ApprovalRecord>>,
    trust_mode: TrustMode,
    timeout: Duration,
    bus: EventBus,
}

impl ApprovalManager {
    pub fn new(trust_mode: TrustMode, timeout: Duration, bus: EventBus) -> Self {
        Self {
            pending: DashMap::new(),
            remembered: DashMap::new(),
            outbound: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            trust_mode,
            timeout,
            bus,
        }
    }

    /// Wire the channel that carries requests to the human (chat platform,
    /// UI). Without one, every gated call is denied.
    pub fn set_channel(&self, tx: mpsc::Sender<ApprovalRequest>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
    }

    pub fn trust_mode(&self) -> TrustMode {
        self.trust_mode
    }

    /// Whether this classification needs a human under the current trust
    /// mode.
    pub fn needs_approval(&self, classification: &Classification) -> bool {
        use capstan_core::RiskLevel;
        match self.trust_mode {
            TrustMode::Yolo => false,
            TrustMode::Permissive => classification.risk_level > RiskLevel::Medium,
            TrustMode::Moderate => classification.requires_approval,
            TrustMode::Strict => classification.risk_level > RiskLevel::Safe,
        }
    }

    /// Gate one classified tool call. Returns Ok(()) when execution may
    /// proceed.
    pub async fn request_approval(
        &self,
        tool_name: &str,
        tool_input: &Value,
        classification: &Classification,
        session_id: &SessionId,
    ) -> Result<(), ApprovalError> {
        if !self.needs_approval(classification) {
            return Ok(());
        }

        let key = remember_key(tool_name, tool_input);
        if let Some(choice) = self.remembered.get(&key) {
            debug!("approval for {} resolved from remembered choice", tool_name);
            return if *choice {
                Ok(())
            } else {
                Err(ApprovalError::Denied {
                    reason: "remembered_denial".into(),
                })
            };
        }

        let request = ApprovalRequest {
            id: uuid::Uuid::new_v4().to_string(),
            tool_name: tool_name.to_string(),
            tool_input: tool_input.clone(),
            risk: classification.risk_level,
            warnings: classification.warnings.clone(),
            session_id: session_id.clone(),
            timestamp: Utc::now(),
        };

        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(outbound) = outbound else {
            warn!(
                "tool '{}' requires approval but no approval channel is configured",
                tool_name
            );
            return Err(ApprovalError::Denied {
                reason: "no_approval_channel".into(),
            });
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request.id.clone(), tx);
        self.bus.emit(AgentEvent::ApprovalRequested {
            request_id: request.id.clone(),
            tool_name: tool_name.to_string(),
            risk: classification.risk_level,
        });

        if outbound.send(request.clone()).await.is_err() {
            self.pending.remove(&request.id);
            return Err(ApprovalError::Denied {
                reason: "approval_channel_closed".into(),
            });
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Responder dropped without answering.
                self.pending.remove(&request.id);
                self.finish(request, ApprovalResponse::deny("approval_channel_closed"));
                return Err(ApprovalError::Denied {
                    reason: "approval_channel_closed".into(),
                });
            }
            Err(_) => {
                self.pending.remove(&request.id);
                self.finish(request, ApprovalResponse::deny("approval_timeout"));
                return Err(ApprovalError::Timeout);
            }
        };

        let approved = response.approved;
        if response.remember_choice {
            self.remembered.insert(key, approved);
        }
        let reason = response.reason.clone();
        self.finish(request, response);

        if approved {
            Ok(())
        } else {
            Err(ApprovalError::Denied {
                reason: reason.unwrap_or_else(|| "denied by user".into()),
            })
        }
    }

    /// Deliver the human's decision for a pending request. The single
    /// writer for a given request id.
    pub fn resolve(&self, request_id: &str, response: ApprovalResponse) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                self.bus.emit(AgentEvent::ApprovalResolved {
                    request_id: request_id.to_string(),
                    approved: response.approved,
                    reason: response.reason.clone(),
                });
                tx.send(response).is_ok()
            }
            None => {
                debug!("approval response for unknown request {}", request_id);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn records(&self) -> Vec<ApprovalRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn finish(&self, request: ApprovalRequest, response: ApprovalResponse) {
        info!(
            tool = %request.tool_name,
            approved = response.approved,
            "approval resolved"
        );
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.len() >= APPROVAL_LOG_CAP {
            log.remove(0);
        }
        log.push(ApprovalRecord {
            request,
            response,
            execution_result: None,
        });
    }
}

/// Canonical key for remembered decisions: tool name + sorted-key JSON of
/// the args (serde_json maps are ordered, so to_string is canonical).
fn remember_key(tool_name: &str, input: &Value) -> String {
    format!("{}:{}", tool_name, input)
}
