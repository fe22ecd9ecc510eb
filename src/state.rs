//! Conversation state: the per-response snapshot a follow-up turn needs.
//!
//! The store is deliberately small — get, put with TTL, delete — and treats
//! its values opaquely. Backends: process-local memory, Redis, or disabled
//! (every operation fails, surfaced to clients as 501).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{Settings, StateBackendKind};
use crate::models::chat::ChatMessage;
use crate::models::responses::ResponseObject;
use crate::util::now_ts;

const REDIS_KEY_PREFIX: &str = "response2chat:turn:";

/// Everything persisted after a successful turn, keyed by response id.
///
/// `messages` is the reduced post-turn history (input reduction plus the new
/// assistant message); the injected instructions system message is excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTurn {
    pub response: ResponseObject,
    pub messages: Vec<ChatMessage>,
    /// Virtualized function name -> external tool type, for the next turn.
    pub tool_function_map: HashMap<String, String>,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state backend is disabled")]
    Disabled,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

enum StoreBackend {
    Memory(RwLock<HashMap<String, (u64, StoredTurn)>>),
    Redis(redis::Client),
    Disabled,
}

pub struct ConversationStore {
    backend: StoreBackend,
}

impl ConversationStore {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory(RwLock::new(HashMap::new())),
        }
    }

    pub fn redis(url: &str) -> Result<Self, StateError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            backend: StoreBackend::Redis(client),
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: StoreBackend::Disabled,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>, StateError> {
        let store = match settings.state_backend {
            StateBackendKind::Memory => Self::memory(),
            StateBackendKind::Redis => Self::redis(&settings.redis_url)?,
            StateBackendKind::Disabled => Self::disabled(),
        };
        Ok(Arc::new(store))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, StoreBackend::Disabled)
    }

    pub async fn get(&self, response_id: &str) -> Result<Option<StoredTurn>, StateError> {
        match &self.backend {
            StoreBackend::Memory(entries) => {
                let expired = {
                    let entries = entries.read().await;
                    match entries.get(response_id) {
                        None => return Ok(None),
                        Some((expires_at, record)) => {
                            if *expires_at == 0 || now_ts() <= *expires_at {
                                return Ok(Some(record.clone()));
                            }
                            true
                        }
                    }
                };
                if expired {
                    entries.write().await.remove(response_id);
                }
                Ok(None)
            }
            StoreBackend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let raw: Option<String> = redis::cmd("GET")
                    .arg(redis_key(response_id))
                    .query_async(&mut conn)
                    .await?;
                match raw {
                    None => Ok(None),
                    Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                }
            }
            StoreBackend::Disabled => Err(StateError::Disabled),
        }
    }

    pub async fn put(
        &self,
        response_id: &str,
        record: &StoredTurn,
        ttl_seconds: u64,
    ) -> Result<(), StateError> {
        match &self.backend {
            StoreBackend::Memory(entries) => {
                let expires_at = if ttl_seconds > 0 {
                    now_ts() + ttl_seconds
                } else {
                    0
                };
                entries
                    .write()
                    .await
                    .insert(response_id.to_string(), (expires_at, record.clone()));
                Ok(())
            }
            StoreBackend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let value = serde_json::to_string(record)?;
                let key = redis_key(response_id);
                if ttl_seconds > 0 {
                    let _: () = redis::cmd("SET")
                        .arg(&key)
                        .arg(value)
                        .arg("EX")
                        .arg(ttl_seconds)
                        .query_async(&mut conn)
                        .await?;
                } else {
                    let _: () = redis::cmd("SET")
                        .arg(&key)
                        .arg(value)
                        .query_async(&mut conn)
                        .await?;
                }
                Ok(())
            }
            StoreBackend::Disabled => Err(StateError::Disabled),
        }
    }

    /// Remove an entry; reports whether one existed. Deleting a missing id
    /// is not an error.
    pub async fn delete(&self, response_id: &str) -> Result<bool, StateError> {
        match &self.backend {
            StoreBackend::Memory(entries) => {
                Ok(entries.write().await.remove(response_id).is_some())
            }
            StoreBackend::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let removed: u64 = redis::cmd("DEL")
                    .arg(redis_key(response_id))
                    .query_async(&mut conn)
                    .await?;
                Ok(removed > 0)
            }
            StoreBackend::Disabled => Err(StateError::Disabled),
        }
    }
}

fn redis_key(response_id: &str) -> String {
    format!("{REDIS_KEY_PREFIX}{response_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::responses::ResponseObject;

    fn turn(text: &str) -> StoredTurn {
        StoredTurn {
            response: ResponseObject::new("resp_t".into(), 1, "m".into(), "completed"),
            messages: vec![ChatMessage::user(text)],
            tool_function_map: HashMap::new(),
            model: "m".into(),
        }
    }

    #[tokio::test]
    async fn memory_roundtrip_and_idempotent_delete() {
        let store = ConversationStore::memory();
        store.put("resp_1", &turn("hello"), 0).await.unwrap();

        let loaded = store.get("resp_1").await.unwrap().unwrap();
        assert_eq!(loaded.messages[0].content_text(), Some("hello"));

        assert!(store.delete("resp_1").await.unwrap());
        assert!(!store.delete("resp_1").await.unwrap());
        assert!(store.get("resp_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_entries_expire() {
        let store = ConversationStore::memory();
        store.put("resp_1", &turn("soon gone"), 1).await.unwrap();
        assert!(store.get("resp_1").await.unwrap().is_some());

        tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
        assert!(store.get("resp_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disabled_backend_fails_every_operation() {
        let store = ConversationStore::disabled();
        assert!(matches!(
            store.get("x").await,
            Err(StateError::Disabled)
        ));
        assert!(matches!(
            store.put("x", &turn("y"), 0).await,
            Err(StateError::Disabled)
        ));
        assert!(matches!(store.delete("x").await, Err(StateError::Disabled)));
    }
}
