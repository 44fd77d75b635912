//! Core configuration — serde structs for the capstan config document
//!
//! Pure types, parsing, and validation. Loading (files, env, remote) is the
//! embedding application's concern. Unrecognized options are ignored;
//! missing required options fail `validate()` before the agent loop starts.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapstanConfig {
    pub model: ModelConfig,
    pub agent: AgentSection,
    pub safety: SafetySection,
    pub storage: StorageSection,
    pub proactive: ProactiveSection,
}

impl CapstanConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.provider.is_empty() {
            return Err(ConfigError::MissingOption("model.provider"));
        }
        if self.model.model.is_empty() {
            return Err(ConfigError::MissingOption("model.model"));
        }
        if self.model.api_key.is_empty() {
            return Err(ConfigError::MissingOption("model.apiKey"));
        }
        match self.model.provider.as_str() {
            "anthropic" | "openai" => {}
            "gemini" => {
                // Served through the OpenAI-compatible endpoint; needs a base URL.
                if self.model.base_url.is_none() {
                    return Err(ConfigError::InvalidValue {
                        option: "model.baseURL",
                        reason: "gemini dialect requires an OpenAI-compatible base URL".into(),
                    });
                }
            }
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        }
        if self.agent.max_turns == 0 {
            return Err(ConfigError::InvalidValue {
                option: "agent.maxTurns",
                reason: "must be at least 1".into(),
            });
        }
        if self.agent.context_window_max == 0 {
            return Err(ConfigError::InvalidValue {
                option: "agent.contextWindowMax",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    #[serde(rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            api_key: String::new(),
            base_url: None,
            max_tokens: 8192,
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStrategy {
    Always,
    #[default]
    Auto,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSection {
    /// Token estimate at which a warning event is emitted.
    pub context_window_warning: usize,
    /// Token estimate at which compression triggers.
    pub context_window_max: usize,
    pub compression_enabled: bool,
    pub auto_save: bool,
    pub tool_strategy: ToolStrategy,
    pub max_turns: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            context_window_warning: 100_000,
            context_window_max: 128_000,
            compression_enabled: true,
            auto_save: true,
            tool_strategy: ToolStrategy::Auto,
            max_turns: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustMode {
    Strict,
    #[default]
    Moderate,
    Permissive,
    Yolo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SafetySection {
    pub trust_mode: TrustMode,
    pub approval_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_chat_id: Option<String>,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            trust_mode: TrustMode::Moderate,
            approval_timeout_secs: 120,
            approval_platform: None,
            approval_chat_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSection {
    pub session_dir: String,
    pub memory_dir: String,
    pub max_session_size: usize,
    pub compression_enabled: bool,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            session_dir: "sessions".into(),
            memory_dir: "memory".into(),
            max_session_size: 10 * 1024 * 1024,
            compression_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProactiveSection {
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Local hour (0-23) at which the quiet window opens.
    pub quiet_hours_start: u8,
    /// Local hour (0-23) at which the quiet window closes.
    pub quiet_hours_end: u8,
    pub repeat_threshold: u32,
    pub idle_session_timeout_secs: u64,
}

impl Default for ProactiveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_secs: 300,
            quiet_hours_start: 23,
            quiet_hours_end: 7,
            repeat_threshold: 3,
            idle_session_timeout_secs: 1800,
        }
    }
}
