use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::auth::User;
use crate::collections::{now_millis, CREATED_FIELD};
use crate::engine::{is_valid_id, Filter, ID_FIELD};
use crate::{Document, DocumentStore, Result, SESSIONS_COLLECTION, USERS_COLLECTION};

pub const USER_ID_FIELD: &str = "userId";
pub const TOKEN_HASH_FIELD: &str = "tokenHash";
pub const LAST_ACCESS_FIELD: &str = "lastAccess";

const TOKEN_BYTES: usize = 32;
const SALT_BYTES: usize = 16;

/// Client details recorded with a new session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMeta {
    pub user_agent: Option<String>,
    pub address: Option<String>,
}

/// Login sessions over the reserved `sessions` collection.
///
/// Only a salted hash of each token is stored, so a leaked collection cannot be
/// replayed as cookies.
pub struct Sessions {
    store: Arc<dyn DocumentStore>,
    lifetime: Option<Duration>,
}

impl Sessions {
    pub fn new(store: Arc<dyn DocumentStore>, lifetime: Option<Duration>) -> Self {
        Self { store, lifetime }
    }

    /// Starts a session for `user_id` and returns `(session_id, raw_token)`.
    ///
    /// The raw token is returned once and never persisted.
    pub async fn create_session(&self, user_id: &str, client: &ClientMeta) -> Result<(String, String)> {
        let token = generate_token();
        let now = now_millis();

        let mut doc = Document::new();
        doc.insert(USER_ID_FIELD.to_string(), Value::String(user_id.to_string()));
        doc.insert(TOKEN_HASH_FIELD.to_string(), Value::String(hash_token(&token)));
        doc.insert("userAgent".to_string(), client.user_agent.clone().map(Value::String).unwrap_or(Value::Null));
        doc.insert("ipAddress".to_string(), client.address.clone().map(Value::String).unwrap_or(Value::Null));
        doc.insert(CREATED_FIELD.to_string(), Value::from(now));
        doc.insert(LAST_ACCESS_FIELD.to_string(), Value::from(now));

        let saved = self.store.insert(SESSIONS_COLLECTION, doc).await?;
        let session_id = saved
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| crate::Error::Store("session stored without id".to_string()))?;
        Ok((session_id, token))
    }

    /// Resolves a session to its user. Any mismatch resolves to `None`.
    pub async fn resolve_session(&self, session_id: &str, raw_token: &str) -> Result<Option<User>> {
        if !is_valid_id(session_id) || raw_token.is_empty() {
            return Ok(None);
        }
        let by_id = Filter::Id(session_id.to_string());
        let Some(session) = self.store.find_one(SESSIONS_COLLECTION, &by_id).await? else {
            return Ok(None);
        };

        let stored = session.get(TOKEN_HASH_FIELD).and_then(Value::as_str).unwrap_or_default();
        if !verify_token(raw_token, stored) {
            log::warn!("Rejected session {}: token mismatch", session_id);
            return Ok(None);
        }

        let now = now_millis();
        if let Some(lifetime) = self.lifetime {
            let created = session.get(CREATED_FIELD).and_then(Value::as_i64).unwrap_or(0);
            if now.saturating_sub(created) > lifetime.as_millis() as i64 {
                log::warn!("Rejected session {}: expired", session_id);
                self.store.delete(SESSIONS_COLLECTION, &by_id, true).await?;
                return Ok(None);
            }
        }

        let Some(user_id) = session.get(USER_ID_FIELD).and_then(Value::as_str) else {
            return Ok(None);
        };
        let user = self
            .store
            .find_one(USERS_COLLECTION, &Filter::Id(user_id.to_string()))
            .await?
            .and_then(User::from_document);

        if user.is_some() {
            let mut touch = Document::new();
            touch.insert(LAST_ACCESS_FIELD.to_string(), Value::from(now));
            self.store.update_one(SESSIONS_COLLECTION, &by_id, touch).await?;
        }
        Ok(user)
    }

    /// Deletes the session. Returns whether a record was removed.
    pub async fn destroy_session(&self, session_id: &str) -> Result<bool> {
        if !is_valid_id(session_id) {
            return Ok(false);
        }
        let removed = self
            .store
            .delete(SESSIONS_COLLECTION, &Filter::Id(session_id.to_string()), true)
            .await?;
        Ok(removed > 0)
    }

    /// Deletes every session of a user. Returns how many were removed.
    pub async fn revoke_user_sessions(&self, user_id: &str) -> Result<u64> {
        let filter = Filter::Eq(USER_ID_FIELD.to_string(), Value::String(user_id.to_string()));
        let removed = self.store.delete(SESSIONS_COLLECTION, &filter, false).await?;
        log::info!("Revoked {} sessions of user {}", removed, user_id);
        Ok(removed)
    }

    /// Lists a user's sessions without their token hashes.
    pub async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<Document>> {
        let filter = Filter::Eq(USER_ID_FIELD.to_string(), Value::String(user_id.to_string()));
        let mut sessions = self.store.find(SESSIONS_COLLECTION, &filter, None).await?;
        for session in &mut sessions {
            session.remove(TOKEN_HASH_FIELD);
        }
        Ok(sessions)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn digest(salt: &[u8], token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Salted SHA-256 of a token, stored as `hex(salt)$hex(digest)`.
fn hash_token(token: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut salt);
    format!("{}${}", hex::encode(salt), hex::encode(digest(&salt, token)))
}

fn verify_token(token: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    digest(&salt, token).as_slice().ct_eq(expected.as_slice()).into()
}
