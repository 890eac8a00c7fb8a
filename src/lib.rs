//! docapi is a multi-tenant JSON document API.
//!
//! Every document carries its own read and write ACL, and callers are identified
//! through cookie sessions. A global [`policy::SecurityMode`] decides which ACLs new
//! documents receive and whether anonymous callers may write.
//!
//! ## Core Components
//! - [`engine`]: The storage backend (in-memory documents with optional JSON persistence).
//! - [`policy`]: Pure access-control functions.
//! - [`collections`]: ACL-scoped CRUD primitives over a [`DocumentStore`].
//! - [`auth`]: Credentials, sessions and the session cookie.
//! - [`server`]: The request dispatcher and its HTTP adapter.

pub mod auth;
pub mod collections;
pub mod config;
pub mod engine;
pub mod policy;
pub mod server;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::{Filter, SortSpec};

/// A schemaless document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Errors returned by docapi.
#[derive(Error, Debug)]
pub enum Error {
    /// The request carried malformed or missing data.
    #[error("{0}")]
    InvalidInput(String),
    /// A uniqueness constraint was violated.
    #[error("{0}")]
    Conflict(String),
    /// The operation is not permitted on this kind of collection.
    #[error("{0}")]
    InvalidOperation(String),
    /// The caller must be authenticated for this operation.
    #[error("forbidden")]
    Forbidden,
    /// The document store failed or is unreachable.
    #[error("store error: {0}")]
    Store(String),
    /// Password or token hashing failed.
    #[error("hashing error: {0}")]
    Hashing(String),
    /// An I/O error occurred during persistence or network communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::Conflict(_) | Error::InvalidOperation(_) => 400,
            Error::Forbidden => 403,
            Error::Store(_) | Error::Hashing(_) | Error::Io(_) | Error::Serialization(_) => 500,
        }
    }
}

/// A specialized Result type for docapi operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Collection holding user accounts. Not reachable through the generic API.
pub const USERS_COLLECTION: &str = "users";

/// Collection holding login sessions. Not reachable through the generic API.
pub const SESSIONS_COLLECTION: &str = "sessions";

/// Prefix applied to every collection served through the generic API.
pub const DATA_PREFIX: &str = "data_";

/// Collections whose name starts with this prefix hold at most one document.
pub const SINGLETON_PREFIX: &str = "one-";

/// Defines the read operations of a document store.
#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// Returns the first document in natural order that matches `filter`.
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>>;
    /// Returns every document matching `filter`, ordered by `sort` when given.
    async fn find(&self, collection: &str, filter: &Filter, sort: Option<&SortSpec>) -> Result<Vec<Document>>;
    /// Lists the names of all non-empty collections.
    async fn collections(&self) -> Result<Vec<String>>;
}

/// Outcome of a write guarded by a conflict filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional<T> {
    Applied(T),
    /// Another document matched the conflict filter; nothing was written.
    Conflict,
}

/// Defines the write operations of a document store.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    /// Stores a new document and returns it with its store-assigned `id`.
    async fn insert(&self, collection: &str, document: Document) -> Result<Document>;
    /// Stores `document` unless some document already matches `conflict`.
    ///
    /// The check and the insert happen atomically with respect to other writes.
    async fn insert_unless(&self, collection: &str, conflict: &Filter, document: Document) -> Result<Conditional<Document>>;
    /// Merges `fields` into the first document matching `filter` and returns the result.
    async fn update_one(&self, collection: &str, filter: &Filter, fields: Document) -> Result<Option<Document>>;
    /// Like [`DocumentWriter::update_one`], but refuses while any document matches `conflict`.
    async fn update_one_unless(
        &self,
        collection: &str,
        filter: &Filter,
        conflict: &Filter,
        fields: Document,
    ) -> Result<Conditional<Option<Document>>>;
    /// Removes matching documents, at most one when `only_first` is set. Returns the count removed.
    async fn delete(&self, collection: &str, filter: &Filter, only_first: bool) -> Result<u64>;
}

/// The primary interface for a backing document store.
#[async_trait]
pub trait DocumentStore: DocumentReader + DocumentWriter {
    /// Waits until every accepted write has reached durable storage.
    ///
    /// Fails if any write since the previous flush could not be persisted.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
