//! Accounts and login sessions.
//!
//! - [`credentials`]: signup, self-edit and password verification.
//! - [`session`]: hashed session tokens and their resolution to a [`User`].
//! - [`cookie`]: the `sessionId|rawToken` cookie carried by the client.

pub mod cookie;
pub mod credentials;
pub mod session;

pub use credentials::Credentials;
pub use session::{ClientMeta, Sessions};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Document;

/// Field holding the Argon2 PHC string of a user's password.
pub const PASSWORD_HASH_FIELD: &str = "passwordHash";

/// A user account as exposed outside the credential layer. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(flatten)]
    pub profile: Document,
}

impl User {
    pub(crate) fn from_document(mut doc: Document) -> Option<User> {
        doc.remove(PASSWORD_HASH_FIELD);
        serde_json::from_value(Value::Object(doc)).ok()
    }
}
