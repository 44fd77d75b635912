//! Tool registry - the process-wide tool catalog
//!
//! Mutated at startup (builtins) and by plugin load/unload; read-mostly in
//! steady state. The registry is never serialized.

use crate::tool::Tool;
use capstan_llm::LlmTool;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Where a tool came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolSource {
    Builtin,
    Plugin { name: String },
}

impl ToolSource {
    pub fn as_str(&self) -> &str {
        match self {
            ToolSource::Builtin => "builtin",
            ToolSource::Plugin { .. } => "plugin",
        }
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub enabled: bool,
    pub source: ToolSource,
    pub registered_at: DateTime<Utc>,
}

/// Registry statistics by source and category.
#[derive(Clone, Debug, Default)]
pub struct RegistryStats {
    pub total: usize,
    pub enabled: usize,
    pub by_source: HashMap<String, usize>,
    pub by_category: HashMap<String, usize>,
}

pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Register a tool. Re-registering a name replaces the entry with a
    /// warning.
    pub fn register(&self, tool: impl Tool + 'static, source: ToolSource) {
        self.register_arc(Arc::new(tool), source);
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>, source: ToolSource) {
        let name = tool.name().to_string();
        let entry = RegisteredTool {
            tool,
            enabled: true,
            source,
            registered_at: Utc::now(),
        };
        if self.tools.insert(name.clone(), entry).is_some() {
            warn!("tool '{}' re-registered, previous entry replaced", name);
        }
    }

    /// Remove a tool by name (plugin unload).
    pub fn unregister(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get an enabled tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .filter(|entry| entry.enabled)
            .map(|entry| entry.tool.clone())
    }

    /// Get the registration entry regardless of enabled state.
    pub fn entry(&self, name: &str) -> Option<RegisteredTool> {
        self.tools.get(name).map(|e| e.clone())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.tools.get_mut(name) {
            Some(mut entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<String> {
        self.tools.iter().map(|e| e.key().clone()).collect()
    }

    /// Provider tool definitions for all enabled tools (Anthropic shape:
    /// `{ name, description, input_schema }`).
    pub fn to_anthropic_format(&self) -> Vec<LlmTool> {
        self.tools
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.tool.to_llm_tool())
            .collect()
    }

    /// OpenAI function-calling shape for all enabled tools.
    pub fn to_openai_format(&self) -> Vec<Value> {
        self.tools
            .iter()
            .filter(|e| e.enabled)
            .map(|e| {
                json!({
                    "type": "function",
                    "function": {
                        "name": e.tool.name(),
                        "description": e.tool.description(),
                        "parameters": e.tool.input_schema(),
                    }
                })
            })
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total: self.tools.len(),
            ..Default::default()
        };
        for entry in self.tools.iter() {
            if entry.enabled {
                stats.enabled += 1;
            }
            *stats
                .by_source
                .entry(entry.source.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_category
                .entry(entry.tool.category().as_str().to_string())
                .or_default() += 1;
        }
        stats
    }
}
