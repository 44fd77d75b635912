//! Context window accounting with token estimation

use capstan_core::TreeMessage;

const CHARS_PER_TOKEN: f32 = 4.0;
const MESSAGE_OVERHEAD: usize = 10;

pub struct ContextManager {
    max_tokens: usize,
    system_tokens: usize,
}

impl ContextManager {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            system_tokens: 0,
        }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() as f32 / CHARS_PER_TOKEN).ceil() as usize
    }

    pub fn message_tokens(message: &TreeMessage) -> usize {
        Self::estimate_tokens(&message.content.as_text()) + MESSAGE_OVERHEAD
    }

    pub fn set_system(&mut self, system: &str) {
        self.system_tokens = Self::estimate_tokens(system);
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn calculate_total(&self, messages: &[TreeMessage]) -> usize {
        let message_tokens: usize = messages.iter().map(Self::message_tokens).sum();
        self.system_tokens + message_tokens
    }

    pub fn over_limit(&self, messages: &[TreeMessage]) -> bool {
        self.calculate_total(messages) >= self.max_tokens
    }
}
