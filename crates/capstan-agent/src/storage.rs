//! Pluggable session persistence
//!
//! One JSON document per session id. The core never assumes filesystem
//! semantics beyond load/save/exists/delete, so remote KV backends drop in
//! behind the same trait.

use capstan_core::{Error, MessageId, SessionId, TreeMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The persisted shape of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<TreeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_leaf: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, Error>;
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), Error>;
    async fn exists(&self, id: &SessionId) -> Result<bool, Error>;
    async fn delete(&self, id: &SessionId) -> Result<(), Error>;
}

/// JSON files under a directory, one per session. Writes go through a
/// temp file and rename so readers never observe a torn document.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: &SessionId) -> PathBuf {
        // Session ids come from callers; keep them filename-safe.
        let safe: String = id
            .as_str()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, Error> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&snapshot.session_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.path_for(id)).await?)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemorySessionStore {
    docs: DashMap<String, SessionSnapshot>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<SessionSnapshot>, Error> {
        Ok(self.docs.get(id.as_str()).map(|d| d.clone()))
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), Error> {
        self.docs
            .insert(snapshot.session_id.as_str().to_string(), snapshot.clone());
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> Result<bool, Error> {
        Ok(self.docs.contains_key(id.as_str()))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), Error> {
        self.docs.remove(id.as_str());
        Ok(())
    }
}
