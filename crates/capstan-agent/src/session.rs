//! Branching session trees with persistence
//!
//! Messages live in a flat id->node map; parent/children are ids. The
//! current leaf marks the active branch. Switching branches is O(1);
//! regeneration switches to the parent and adds a fresh child, keeping the
//! old branch in the tree.

use crate::storage::{SessionSnapshot, SessionStore};
use capstan_core::{
    Error, MessageContent, MessageId, Role, SessionId, ToolResultBlock, TreeMessage,
};
use capstan_llm::{ContentBlock, LlmContent, LlmMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

struct SessionState {
    system_prompt: Option<String>,
    model: Option<String>,
    nodes: HashMap<MessageId, TreeMessage>,
    current_leaf: Option<MessageId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct Session {
    pub id: SessionId,
    state: RwLock<SessionState>,
    store: Option<Arc<dyn SessionStore>>,
    auto_save: bool,
    turn_lock: Arc<Mutex<()>>,
}

/// Held for the duration of one agent turn; enforces per-session
/// serialization.
#[derive(Debug)]
pub struct TurnGuard {
    _guard: OwnedMutexGuard<()>,
}

impl Session {
    pub fn new(id: SessionId, system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: RwLock::new(SessionState {
                system_prompt: system_prompt.map(String::from),
                model: None,
                nodes: HashMap::new(),
                current_leaf: None,
                created_at: now,
                updated_at: now,
            }),
            store: None,
            auto_save: false,
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SessionStore>, auto_save: bool) -> Self {
        self.store = Some(store);
        self.auto_save = auto_save;
        self
    }

    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut nodes = HashMap::new();
        for message in snapshot.messages {
            nodes.insert(message.id.clone(), message);
        }
        Self {
            id: snapshot.session_id,
            state: RwLock::new(SessionState {
                system_prompt: snapshot.system_prompt,
                model: snapshot.model,
                nodes,
                current_leaf: snapshot.current_leaf,
                created_at: snapshot.created_at,
                updated_at: snapshot.updated_at,
            }),
            store: None,
            auto_save: false,
            turn_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Claim the session for one turn. Fails immediately when a turn is
    /// already in flight.
    pub fn begin_turn(&self) -> Result<TurnGuard, Error> {
        match self.turn_lock.clone().try_lock_owned() {
            Ok(guard) => Ok(TurnGuard { _guard: guard }),
            Err(_) => Err(Error::SessionBusy(self.id.as_str().to_string())),
        }
    }

    pub async fn system_prompt(&self) -> Option<String> {
        self.state.read().await.system_prompt.clone()
    }

    pub async fn set_system_prompt(&self, prompt: &str) {
        self.state.write().await.system_prompt = Some(prompt.to_string());
    }

    pub async fn model(&self) -> Option<String> {
        self.state.read().await.model.clone()
    }

    pub async fn set_model(&self, model: &str) {
        self.state.write().await.model = Some(model.to_string());
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    pub async fn current_leaf(&self) -> Option<MessageId> {
        self.state.read().await.current_leaf.clone()
    }

    pub async fn message(&self, id: &MessageId) -> Option<TreeMessage> {
        self.state.read().await.nodes.get(id).cloned()
    }

    /// Append as a child of the current leaf and advance the leaf.
    pub async fn add_message(&self, mut message: TreeMessage) -> MessageId {
        let id = message.id.clone();
        {
            let mut state = self.state.write().await;
            message.parent = state.current_leaf.clone();
            message.children.clear();
            if let Some(ref parent_id) = message.parent {
                if let Some(parent) = state.nodes.get_mut(parent_id) {
                    parent.children.push(id.clone());
                }
            }
            state.nodes.insert(id.clone(), message);
            state.current_leaf = Some(id.clone());
            state.updated_at = Utc::now();
        }
        self.maybe_save().await;
        id
    }

    /// Point the leaf at any existing node. O(1).
    pub async fn switch_branch(&self, id: &MessageId) -> Result<(), Error> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(id) {
            return Err(Error::MessageNotFound(id.as_str().to_string()));
        }
        state.current_leaf = Some(id.clone());
        state.updated_at = Utc::now();
        debug!("session {}: branch switched to {}", self.id, id);
        Ok(())
    }

    /// Active-branch messages, root to leaf, with the virtual system
    /// message prepended when a system prompt is set.
    pub async fn build_context(&self) -> Vec<TreeMessage> {
        let state = self.state.read().await;
        let mut chain = Vec::new();
        let mut cursor = state.current_leaf.clone();
        while let Some(id) = cursor {
            match state.nodes.get(&id) {
                Some(node) => {
                    cursor = node.parent.clone();
                    chain.push(node.clone());
                }
                None => break,
            }
        }
        chain.reverse();

        if let Some(ref prompt) = state.system_prompt {
            let mut system = TreeMessage::new(
                Role::System,
                MessageContent::Text {
                    text: prompt.clone(),
                },
            );
            system.id = MessageId::new("system");
            chain.insert(0, system);
        }
        chain
    }

    /// Atomically replace the tree with a linear chain (compression).
    /// A system-role message in the list updates the stored prompt
    /// instead of entering the tree.
    pub async fn replace_history(&self, messages: Vec<TreeMessage>) {
        {
            let mut state = self.state.write().await;
            state.nodes.clear();
            state.current_leaf = None;

            let mut previous: Option<MessageId> = None;
            for mut message in messages {
                if message.role == Role::System {
                    if let MessageContent::Text { text } = &message.content {
                        state.system_prompt = Some(text.clone());
                    }
                    continue;
                }
                message.parent = previous.clone();
                message.children.clear();
                let id = message.id.clone();
                if let Some(ref parent_id) = previous {
                    if let Some(parent) = state.nodes.get_mut(parent_id) {
                        parent.children.push(id.clone());
                    }
                }
                state.nodes.insert(id.clone(), message);
                previous = Some(id);
            }
            state.current_leaf = previous;
            state.updated_at = Utc::now();
        }
        self.maybe_save().await;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.read().await;
        let mut messages: Vec<TreeMessage> = state.nodes.values().cloned().collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.as_str().cmp(b.id.as_str())));
        SessionSnapshot {
            session_id: self.id.clone(),
            system_prompt: state.system_prompt.clone(),
            model: state.model.clone(),
            messages,
            current_leaf: state.current_leaf.clone(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }

    pub async fn save(&self) -> Result<(), Error> {
        let Some(ref store) = self.store else {
            return Ok(());
        };
        let snapshot = self.snapshot().await;
        store.save(&snapshot).await
    }

    async fn maybe_save(&self) {
        if self.auto_save {
            if let Err(e) = self.save().await {
                tracing::warn!("session {}: auto-save failed: {}", self.id, e);
            }
        }
    }
}

/// Convert active-branch tree messages into provider wire messages.
/// System messages are skipped (they ride the request's system field);
/// tool results go out as user-role result blocks.
pub fn to_llm_messages(messages: &[TreeMessage]) -> Vec<LlmMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match (&message.role, &message.content) {
            (Role::System, _) => {}
            (role, MessageContent::Text { text }) => out.push(LlmMessage {
                role: role_str(*role).to_string(),
                content: LlmContent::Text(text.clone()),
            }),
            (_, MessageContent::ToolCalls { text, calls }) => {
                let mut blocks = Vec::new();
                if let Some(t) = text {
                    if !t.is_empty() {
                        blocks.push(ContentBlock::Text { text: t.clone() });
                    }
                }
                for call in calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                }
                out.push(LlmMessage {
                    role: "assistant".to_string(),
                    content: LlmContent::Blocks(blocks),
                });
            }
            (_, MessageContent::ToolResults { results }) => {
                let blocks = results
                    .iter()
                    .map(|r: &ToolResultBlock| ContentBlock::ToolResult {
                        tool_use_id: r.tool_call_id.clone(),
                        content: r.content.clone(),
                        is_error: if r.is_error { Some(true) } else { None },
                    })
                    .collect();
                out.push(LlmMessage {
                    role: "user".to_string(),
                    content: LlmContent::Blocks(blocks),
                });
            }
        }
    }
    out
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "user",
    }
}

/// Lazily creates and caches sessions; loads from the store when a
/// document exists.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    store: Option<Arc<dyn SessionStore>>,
    auto_save: bool,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            store: None,
            auto_save: false,
        }
    }

    pub fn with_store(store: Arc<dyn SessionStore>, auto_save: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            store: Some(store),
            auto_save,
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn get_or_create(&self, id: &SessionId, system_prompt: Option<&str>) -> Arc<Session> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                let mut session = Session::new(id.clone(), system_prompt);
                if let Some(ref store) = self.store {
                    session = session.with_store(store.clone(), self.auto_save);
                }
                Arc::new(session)
            })
            .clone()
    }

    /// Get from cache, load from storage, or create fresh.
    pub async fn get_or_load(
        &self,
        id: &SessionId,
        system_prompt: Option<&str>,
    ) -> Result<Arc<Session>, Error> {
        if let Some(session) = self.get(id) {
            return Ok(session);
        }
        if let Some(ref store) = self.store {
            if let Some(snapshot) = store.load(id).await? {
                info!(
                    "session {} loaded from storage ({} messages)",
                    id,
                    snapshot.messages.len()
                );
                let session = Arc::new(
                    Session::from_snapshot(snapshot).with_store(store.clone(), self.auto_save),
                );
                return Ok(self
                    .sessions
                    .entry(id.clone())
                    .or_insert(session)
                    .clone());
            }
        }
        Ok(self.get_or_create(id, system_prompt))
    }

    pub fn list(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Remove from cache and delete the stored document.
    pub async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        self.sessions.remove(id);
        if let Some(ref store) = self.store {
            store.delete(id).await?;
        }
        Ok(())
    }
}
