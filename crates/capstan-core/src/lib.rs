//! Capstan Core - shared types, errors, configuration, and the event bus

pub mod bus;
pub mod config;
pub mod error;
pub mod types;

pub use bus::{AgentEvent, CompactionReason, EventBus, EventEnvelope, EventKind, Subscription};
pub use config::{
    AgentSection, CapstanConfig, ModelConfig, ProactiveSection, SafetySection, StorageSection,
    ToolStrategy, TrustMode,
};
pub use error::{
    ApprovalError, ConfigError, Error, LaneError, ProviderError, Result, ToolError,
};
pub use types::*;
