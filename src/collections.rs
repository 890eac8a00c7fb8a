//! ACL-scoped CRUD over the generic document collections.
//!
//! Every primitive takes the caller's access [`Filter`] and only ever touches
//! documents inside it. A document outside the filter is reported exactly like a
//! missing one, so callers never learn that it exists.

use std::sync::Arc;

use serde_json::Value;

use crate::engine::{is_valid_id, Filter, SortSpec, ID_FIELD};
use crate::policy::{SecurityMode, ACL_READ_FIELD, ACL_WRITE_FIELD};
use crate::{Conditional, Document, DocumentStore, Error, Result, DATA_PREFIX, SINGLETON_PREFIX};

pub const OWNER_FIELD: &str = "ownerId";
pub const CREATED_FIELD: &str = "createdAt";
pub const UPDATED_FIELD: &str = "updatedAt";

/// Alternative id field accepted in request bodies.
pub const BODY_ID_FIELD: &str = "_id";

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn is_singleton(collection: &str) -> bool {
    collection.starts_with(SINGLETON_PREFIX)
}

fn storage_name(collection: &str) -> String {
    format!("{}{}", DATA_PREFIX, collection)
}

fn strip_system_fields(doc: &mut Document) {
    for field in [ID_FIELD, BODY_ID_FIELD, OWNER_FIELD, CREATED_FIELD, UPDATED_FIELD] {
        doc.remove(field);
    }
}

// An empty ACL in a patch would leave the document unreachable.
fn strip_unset_acl(doc: &mut Document) {
    for field in [ACL_READ_FIELD, ACL_WRITE_FIELD] {
        let unset = match doc.get(field) {
            Some(Value::Null) => true,
            Some(Value::Array(items)) => items.is_empty(),
            _ => false,
        };
        if unset {
            doc.remove(field);
        }
    }
}

/// Document Store Adapter for the generic collections.
pub struct Collections {
    store: Arc<dyn DocumentStore>,
    security: SecurityMode,
}

impl Collections {
    pub fn new(store: Arc<dyn DocumentStore>, security: SecurityMode) -> Self {
        Self { store, security }
    }

    /// Singletons ignore `id`; regular collections need a well-formed one.
    pub async fn find_one(&self, collection: &str, filter: Filter, id: Option<&str>) -> Result<Option<Document>> {
        let filter = if is_singleton(collection) {
            filter
        } else {
            match id {
                Some(id) if is_valid_id(id) => filter.and(Filter::Id(id.to_string())),
                _ => return Ok(None),
            }
        };
        self.store.find_one(&storage_name(collection), &filter).await
    }

    /// Lists documents inside `filter` whose fields equal every `query` pair.
    ///
    /// `sort` is `field`, `field:1` or `field:-1` and defaults to newest first.
    pub async fn find_many(
        &self,
        collection: &str,
        filter: Filter,
        query: &[(String, String)],
        sort: Option<&str>,
    ) -> Result<Vec<Document>> {
        let filter = query.iter().fold(filter, |acc, (field, value)| {
            acc.and(Filter::Eq(field.clone(), Value::String(value.clone())))
        });
        let sort = sort.map(SortSpec::parse).unwrap_or_default();
        self.store.find(&storage_name(collection), &filter, Some(&sort)).await
    }

    pub async fn insert_one(&self, collection: &str, owner: Option<&str>, document: Document) -> Result<Document> {
        let document = self.prepare_insert(owner, document);
        self.store.insert(&storage_name(collection), document).await
    }

    fn prepare_insert(&self, owner: Option<&str>, mut document: Document) -> Document {
        strip_system_fields(&mut document);
        if let Some(owner) = owner {
            document.insert(OWNER_FIELD.to_string(), Value::String(owner.to_string()));
        }
        document.insert(CREATED_FIELD.to_string(), Value::from(now_millis()));
        self.security.apply_default_acl(owner, &mut document);
        document
    }

    /// Inserts each document in order. Items stored before a failure stay stored.
    pub async fn insert_many(&self, collection: &str, owner: Option<&str>, documents: Vec<Document>) -> Result<Vec<Document>> {
        let mut saved = Vec::with_capacity(documents.len());
        for document in documents {
            saved.push(self.insert_one(collection, owner, document).await?);
        }
        Ok(saved)
    }

    /// Returns `None` when nothing with this id lies inside `filter`.
    pub async fn update_by_id(&self, collection: &str, filter: Filter, id: &str, mut patch: Document) -> Result<Option<Document>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        strip_system_fields(&mut patch);
        strip_unset_acl(&mut patch);
        patch.insert(UPDATED_FIELD.to_string(), Value::from(now_millis()));
        let filter = filter.and(Filter::Id(id.to_string()));
        self.store.update_one(&storage_name(collection), &filter, patch).await
    }

    /// Merges into the singleton visible through `filter`, or creates it.
    ///
    /// An existing singleton keeps its `createdAt`. Creation only happens while
    /// nothing matches `filter`, so concurrent first writes still leave one document.
    pub async fn upsert_singleton(&self, collection: &str, filter: Filter, owner: Option<&str>, document: Document) -> Result<Document> {
        let name = storage_name(collection);
        if let Some(updated) = self.merge_singleton(&name, &filter, &document).await? {
            return Ok(updated);
        }
        let fresh = self.prepare_insert(owner, document.clone());
        match self.store.insert_unless(&name, &filter, fresh).await? {
            Conditional::Applied(saved) => Ok(saved),
            Conditional::Conflict => self
                .merge_singleton(&name, &filter, &document)
                .await?
                .ok_or_else(|| Error::Store(format!("singleton {} changed during upsert", collection))),
        }
    }

    async fn merge_singleton(&self, name: &str, filter: &Filter, document: &Document) -> Result<Option<Document>> {
        let Some(existing) = self.store.find_one(name, filter).await? else {
            return Ok(None);
        };
        let Some(id) = existing.get(ID_FIELD).and_then(Value::as_str) else {
            return Ok(None);
        };
        let mut patch = document.clone();
        strip_system_fields(&mut patch);
        strip_unset_acl(&mut patch);
        patch.insert(UPDATED_FIELD.to_string(), Value::from(now_millis()));
        let by_id = filter.clone().and(Filter::Id(id.to_string()));
        self.store.update_one(name, &by_id, patch).await
    }

    pub async fn delete_one(&self, collection: &str, filter: Filter, id: &str) -> Result<u64> {
        if !is_valid_id(id) {
            return Ok(0);
        }
        let filter = filter.and(Filter::Id(id.to_string()));
        self.store.delete(&storage_name(collection), &filter, true).await
    }

    pub async fn delete_many(&self, collection: &str, filter: Filter, ids: &[String]) -> Result<u64> {
        let ids: Vec<String> = ids.iter().filter(|id| is_valid_id(id)).cloned().collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let filter = filter.and(Filter::IdIn(ids));
        self.store.delete(&storage_name(collection), &filter, false).await
    }
}
