//! The Tool trait and descriptor metadata
//!
//! Each tool is a self-contained unit registered with a ToolRegistry.
//! Tools that mutate shared external state (device input, shared files,
//! media sessions) must declare `parallelizable() == false`.

use capstan_core::{RiskLevel, RunId, SessionId, ToolInvocationResult};
use capstan_llm::LlmTool;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Coarse tool category; drives the baseline risk for classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    ReadOnly,
    FileWrite,
    FileDelete,
    SystemCommand,
    Network,
    DeviceInput,
    Media,
    Memory,
    Other,
}

impl ToolCategory {
    pub fn baseline_risk(self) -> RiskLevel {
        match self {
            ToolCategory::ReadOnly => RiskLevel::Safe,
            ToolCategory::Memory => RiskLevel::Safe,
            ToolCategory::Media => RiskLevel::Low,
            ToolCategory::Network => RiskLevel::Low,
            ToolCategory::DeviceInput => RiskLevel::Medium,
            ToolCategory::FileWrite => RiskLevel::Medium,
            ToolCategory::FileDelete => RiskLevel::High,
            ToolCategory::SystemCommand => RiskLevel::High,
            ToolCategory::Other => RiskLevel::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolCategory::ReadOnly => "read_only",
            ToolCategory::FileWrite => "file_write",
            ToolCategory::FileDelete => "file_delete",
            ToolCategory::SystemCommand => "system_command",
            ToolCategory::Network => "network",
            ToolCategory::DeviceInput => "device_input",
            ToolCategory::Media => "media",
            ToolCategory::Memory => "memory",
            ToolCategory::Other => "other",
        }
    }
}

/// Value kinds accepted for a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn as_json_type(self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }

    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }
}

/// Declared parameter of a tool.
#[derive(Clone, Debug)]
pub struct ToolParam {
    pub name: &'static str,
    pub kind: ParamKind,
    pub description: &'static str,
    pub required: bool,
    pub default: Option<Value>,
    /// Path-typed string parameters get security normalization.
    pub is_path: bool,
}

impl ToolParam {
    pub fn new(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            description,
            required: false,
            default: None,
            is_path: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn path(mut self) -> Self {
        self.is_path = true;
        self
    }
}

/// Everything a tool execution may need from its surroundings.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(session_id: SessionId, run_id: RunId) -> Self {
        Self {
            session_id,
            run_id,
            cancel: CancellationToken::new(),
            timeout: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The Tool trait - implement this to add a new capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "read_file", "run_command").
    fn name(&self) -> &str;

    /// Human-readable description sent to the LLM.
    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory {
        ToolCategory::Other
    }

    /// Declared parameters; the input schema is derived from these.
    fn parameters(&self) -> Vec<ToolParam> {
        Vec::new()
    }

    /// Permission tags consumed by embedding policy layers.
    fn permissions(&self) -> &[&str] {
        &[]
    }

    /// Whether this call may overlap with other tools in the same batch.
    fn parallelizable(&self) -> bool {
        true
    }

    /// Optional named lane for cross-turn serial ordering.
    fn lane_hint(&self) -> Option<&str> {
        None
    }

    fn baseline_risk(&self) -> RiskLevel {
        self.category().baseline_risk()
    }

    /// JSON Schema for input parameters, derived from `parameters()`.
    fn input_schema(&self) -> Value {
        let params = self.parameters();
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &params {
            let mut prop = serde_json::Map::new();
            prop.insert("type".into(), json!(p.kind.as_json_type()));
            if !p.description.is_empty() {
                prop.insert("description".into(), json!(p.description));
            }
            if let Some(ref default) = p.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(p.name.to_string(), Value::Object(prop));
            if p.required {
                required.push(p.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Execute the tool with validated arguments.
    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolInvocationResult;

    /// Execute with cancellation. Default: race `execute` against the
    /// context's token. Tools that own child processes should override to
    /// kill them on cancellation.
    async fn execute_cancellable(&self, input: Value, ctx: &ToolContext) -> ToolInvocationResult {
        tokio::select! {
            result = self.execute(input, ctx) => result,
            _ = ctx.cancel.cancelled() => ToolInvocationResult::fail(
                capstan_core::ToolErrorCode::Cancelled,
                "cancelled",
            ),
        }
    }

    /// Convert to the provider tool definition.
    fn to_llm_tool(&self) -> LlmTool {
        LlmTool {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}
