use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use serde_json::Value;

use crate::auth::{User, PASSWORD_HASH_FIELD};
use crate::collections::{now_millis, BODY_ID_FIELD, CREATED_FIELD, OWNER_FIELD, UPDATED_FIELD};
use crate::config::PasswordCost;
use crate::engine::{Filter, ID_FIELD};
use crate::{Conditional, Document, DocumentStore, Error, Result, USERS_COLLECTION};

pub const EMAIL_FIELD: &str = "email";
pub const PASSWORD_FIELD: &str = "password";

/// Account storage and password checks over the reserved `users` collection.
pub struct Credentials {
    store: Arc<dyn DocumentStore>,
    cost: PasswordCost,
}

impl Credentials {
    pub fn new(store: Arc<dyn DocumentStore>, cost: PasswordCost) -> Self {
        Self { store, cost }
    }

    /// Registers a new account.
    ///
    /// Fails with [`Error::InvalidInput`] when the email or password is empty or
    /// the email has no `@`, and with [`Error::Conflict`] when the email is taken.
    pub async fn sign_up(&self, email: &str, password: &str, profile: Document) -> Result<User> {
        if email.is_empty() || password.is_empty() {
            return Err(Error::InvalidInput("set email and password".to_string()));
        }
        validate_email(email)?;
        if self.email_taken(email, None).await? {
            return Err(Error::Conflict("email in use".to_string()));
        }

        let mut doc = sanitize_profile(profile);
        doc.insert(EMAIL_FIELD.to_string(), Value::String(email.to_string()));
        doc.insert(PASSWORD_HASH_FIELD.to_string(), Value::String(hash_password(password, self.cost).await?));
        doc.insert(CREATED_FIELD.to_string(), Value::from(now_millis()));

        // The early check above only avoids hashing for a known duplicate.
        match self.store.insert_unless(USERS_COLLECTION, &email_filter(email), doc).await? {
            Conditional::Applied(saved) => {
                log::info!("Registered user {}", email);
                to_user(saved)
            }
            Conditional::Conflict => Err(Error::Conflict("email in use".to_string())),
        }
    }

    /// Updates the caller's own account.
    ///
    /// A changed email is re-validated for format and uniqueness, a changed
    /// password is re-hashed, and every other field is merged as profile data.
    pub async fn edit_profile(&self, user_id: &str, mut fields: Document) -> Result<User> {
        let email = fields.remove(EMAIL_FIELD);
        let password = fields.remove(PASSWORD_FIELD);
        let mut patch = sanitize_profile(fields);

        let mut conflict = None;
        match email {
            None | Some(Value::Null) => {}
            Some(Value::String(email)) if email.is_empty() => {}
            Some(Value::String(email)) => {
                validate_email(&email)?;
                if self.email_taken(&email, Some(user_id)).await? {
                    return Err(Error::Conflict("email in use".to_string()));
                }
                conflict = Some(other_user_with_email(&email, user_id));
                patch.insert(EMAIL_FIELD.to_string(), Value::String(email));
            }
            Some(_) => return Err(Error::InvalidInput("invalid email".to_string())),
        }

        match password {
            None | Some(Value::Null) => {}
            Some(Value::String(password)) if password.is_empty() => {}
            Some(Value::String(password)) => {
                patch.insert(PASSWORD_HASH_FIELD.to_string(), Value::String(hash_password(&password, self.cost).await?));
            }
            Some(_) => return Err(Error::InvalidInput("invalid password".to_string())),
        }

        patch.insert(UPDATED_FIELD.to_string(), Value::from(now_millis()));
        let by_id = Filter::Id(user_id.to_string());
        let updated = match conflict {
            Some(conflict) => match self.store.update_one_unless(USERS_COLLECTION, &by_id, &conflict, patch).await? {
                Conditional::Applied(updated) => updated,
                Conditional::Conflict => return Err(Error::Conflict("email in use".to_string())),
            },
            None => self.store.update_one(USERS_COLLECTION, &by_id, patch).await?,
        };
        match updated {
            Some(saved) => to_user(saved),
            None => Err(Error::Forbidden),
        }
    }

    /// Returns the account when `password` matches the one stored for `email`.
    pub async fn verify_password(&self, email: &str, password: &str) -> Result<Option<User>> {
        if email.is_empty() || password.is_empty() {
            return Ok(None);
        }
        let Some(doc) = self.store.find_one(USERS_COLLECTION, &email_filter(email)).await? else {
            return Ok(None);
        };
        let Some(stored) = doc.get(PASSWORD_HASH_FIELD).and_then(Value::as_str).map(str::to_string) else {
            return Ok(None);
        };
        if check_password(password, &stored).await? {
            Ok(User::from_document(doc))
        } else {
            Ok(None)
        }
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let doc = self.store.find_one(USERS_COLLECTION, &Filter::Id(user_id.to_string())).await?;
        Ok(doc.and_then(User::from_document))
    }

    async fn email_taken(&self, email: &str, except: Option<&str>) -> Result<bool> {
        let filter = match except {
            Some(id) => other_user_with_email(email, id),
            None => email_filter(email),
        };
        Ok(self.store.find_one(USERS_COLLECTION, &filter).await?.is_some())
    }
}

fn email_filter(email: &str) -> Filter {
    Filter::Eq(EMAIL_FIELD.to_string(), Value::String(email.to_string()))
}

fn other_user_with_email(email: &str, user_id: &str) -> Filter {
    email_filter(email).and(Filter::Not(Box::new(Filter::Id(user_id.to_string()))))
}

fn validate_email(email: &str) -> Result<()> {
    if email.contains('@') {
        Ok(())
    } else {
        Err(Error::InvalidInput("invalid email".to_string()))
    }
}

fn sanitize_profile(mut profile: Document) -> Document {
    for field in [
        ID_FIELD,
        BODY_ID_FIELD,
        OWNER_FIELD,
        CREATED_FIELD,
        UPDATED_FIELD,
        EMAIL_FIELD,
        PASSWORD_FIELD,
        PASSWORD_HASH_FIELD,
    ] {
        profile.remove(field);
    }
    profile
}

fn to_user(doc: Document) -> Result<User> {
    User::from_document(doc).ok_or_else(|| Error::Store("stored user record is malformed".to_string()))
}

fn hasher(cost: PasswordCost) -> Result<Argon2<'static>> {
    let params = Params::new(cost.memory_kib, cost.iterations, 1, None).map_err(|e| Error::Hashing(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

// Runs on the blocking pool.
async fn hash_password(password: &str, cost: PasswordCost) -> Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        hasher(cost)?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Hashing(e.to_string()))
    })
    .await
    .map_err(|e| Error::Hashing(e.to_string()))?
}

async fn check_password(password: &str, stored: &str) -> Result<bool> {
    let password = password.to_string();
    let stored = stored.to_string();
    tokio::task::spawn_blocking(move || match PasswordHash::new(&stored) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    })
    .await
    .map_err(|e| Error::Hashing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemStore;
    use crate::DocumentReader;
    use serde_json::json;
    use std::collections::HashMap;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn credentials() -> (Arc<MemStore>, Credentials) {
        let store = Arc::new(MemStore::new(HashMap::new(), None));
        let creds = Credentials::new(store.clone(), PasswordCost::insecure_fast());
        (store, creds)
    }

    #[tokio::test]
    async fn test_sign_up_validation() {
        let (_, creds) = credentials();
        assert!(matches!(creds.sign_up("", "pwd", Document::new()).await, Err(Error::InvalidInput(_))));
        assert!(matches!(creds.sign_up("dev@example.com", "", Document::new()).await, Err(Error::InvalidInput(_))));
        assert!(matches!(creds.sign_up("dev", "dev", Document::new()).await, Err(Error::InvalidInput(_))));

        let user = creds
            .sign_up("dev@example.com", "password123", doc(json!({"fullName": "Johnny Dev", "passwordHash": "x"})))
            .await
            .unwrap();
        assert_eq!(user.email, "dev@example.com");
        assert_eq!(user.profile["fullName"], json!("Johnny Dev"));
        assert!(user.profile.get("passwordHash").is_none());

        let dup = creds.sign_up("dev@example.com", "other", Document::new()).await;
        assert!(matches!(dup, Err(Error::Conflict(_))));
        // exact match only
        assert!(creds.sign_up("Dev@example.com", "other", Document::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_password_is_hashed() {
        let (store, creds) = credentials();
        let user = creds.sign_up("dev@example.com", "password123", Document::new()).await.unwrap();

        let raw = store.find_one(USERS_COLLECTION, &Filter::Id(user.id.clone())).await.unwrap().unwrap();
        let hash = raw[PASSWORD_HASH_FIELD].as_str().unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("password123"));

        assert_eq!(creds.verify_password("dev@example.com", "password123").await.unwrap(), Some(user));
        assert!(creds.verify_password("dev@example.com", "invalid").await.unwrap().is_none());
        assert!(creds.verify_password("nobody@example.com", "password123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_profile() {
        let (_, creds) = credentials();
        let user = creds.sign_up("dev@example.com", "password123", doc(json!({"fullName": "Johnny Dev"}))).await.unwrap();
        creds.sign_up("taken@example.com", "password123", Document::new()).await.unwrap();

        let edited = creds
            .edit_profile(&user.id, doc(json!({"fullName": "Jack Dev", "password": "pwd789", "id": "other"})))
            .await
            .unwrap();
        assert_eq!(edited.id, user.id);
        assert_eq!(edited.email, "dev@example.com");
        assert_eq!(edited.profile["fullName"], json!("Jack Dev"));

        assert!(creds.verify_password("dev@example.com", "password123").await.unwrap().is_none());
        assert!(creds.verify_password("dev@example.com", "pwd789").await.unwrap().is_some());

        let conflict = creds.edit_profile(&user.id, doc(json!({"email": "taken@example.com"}))).await;
        assert!(matches!(conflict, Err(Error::Conflict(_))));
        let invalid = creds.edit_profile(&user.id, doc(json!({"email": "nope"}))).await;
        assert!(matches!(invalid, Err(Error::InvalidInput(_))));

        // re-submitting the current email is not a conflict with itself
        let same = creds.edit_profile(&user.id, doc(json!({"email": "dev@example.com"}))).await.unwrap();
        assert_eq!(same.email, "dev@example.com");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_sign_up_keeps_email_unique() {
        let (store, creds) = credentials();
        let creds = Arc::new(creds);
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let creds = creds.clone();
                tokio::spawn(async move { creds.sign_up("dup@example.com", "password123", Document::new()).await })
            })
            .collect();

        let mut registered = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => registered += 1,
                Err(e) => assert!(matches!(e, Error::Conflict(_))),
            }
        }
        assert_eq!(registered, 1);
        assert_eq!(store.find(USERS_COLLECTION, &Filter::All, None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_email_changes_keep_email_unique() {
        let (store, creds) = credentials();
        let creds = Arc::new(creds);
        let mut tasks = Vec::new();
        for n in 0..6 {
            let user = creds.sign_up(&format!("user{}@example.com", n), "password123", Document::new()).await.unwrap();
            let creds = creds.clone();
            tasks.push(tokio::spawn(async move {
                creds.edit_profile(&user.id, doc(json!({"email": "wanted@example.com"}))).await
            }));
        }
        let moved = count_successes(tasks).await;
        assert_eq!(moved, 1);

        let wanted = email_filter("wanted@example.com");
        assert_eq!(store.find(USERS_COLLECTION, &wanted, None).await.unwrap().len(), 1);
    }

    async fn count_successes(tasks: Vec<tokio::task::JoinHandle<Result<User>>>) -> usize {
        let mut ok = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert!(matches!(e, Error::Conflict(_))),
            }
        }
        ok
    }
}
