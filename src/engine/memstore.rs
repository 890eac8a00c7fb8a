use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use log::error;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::engine::{Filter, Persistence, SortSpec, ID_FIELD};
use crate::{Conditional, Document, DocumentReader, DocumentStore, DocumentWriter, Error, Result};

type StoreData = HashMap<String, Vec<Document>>;

/// A collection's contents captured under the write lock.
///
/// Versions grow with every mutation, so a later snapshot always holds the
/// newer state.
struct Snapshot {
    version: u64,
    documents: Vec<Document>,
}

/// In-memory document store. Each collection keeps its documents in insertion
/// order, which is the natural order listings fall back to.
///
/// With [`Persistence`] attached, every mutation is written back before the
/// call returns. Saves of one collection run one at a time and a snapshot older
/// than the one already on disk is dropped.
pub struct MemStore {
    data: RwLock<StoreData>,
    persistence: Option<Arc<Persistence>>,
    version: AtomicU64,
    /// Last version saved per collection. The lock is held for the whole save.
    saved: Mutex<HashMap<String, Arc<AsyncMutex<u64>>>>,
    pending_tasks: Arc<AtomicUsize>,
    failure: Arc<Mutex<Option<String>>>,
}

fn lock_poisoned() -> Error {
    Error::Store("store lock poisoned".to_string())
}

impl MemStore {
    pub fn new(initial_data: StoreData, persistence: Option<Arc<Persistence>>) -> Self {
        Self {
            data: RwLock::new(initial_data),
            persistence,
            version: AtomicU64::new(0),
            saved: Mutex::new(HashMap::new()),
            pending_tasks: Arc::new(AtomicUsize::new(0)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Waits for every background persistence task to finish.
    pub async fn wait(&self) {
        while self.pending_tasks.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn read_data(&self) -> Result<RwLockReadGuard<'_, StoreData>> {
        self.data.read().map_err(|_| lock_poisoned())
    }

    fn write_data(&self) -> Result<RwLockWriteGuard<'_, StoreData>> {
        self.data.write().map_err(|_| lock_poisoned())
    }

    // Callers hold the write lock.
    fn snapshot(&self, documents: &[Document]) -> Option<Snapshot> {
        self.persistence.as_ref()?;
        Some(Snapshot {
            version: self.version.fetch_add(1, Ordering::SeqCst) + 1,
            documents: documents.to_vec(),
        })
    }

    fn saved_slot(&self, collection: &str) -> Result<Arc<AsyncMutex<u64>>> {
        let mut slots = self.saved.lock().map_err(|_| lock_poisoned())?;
        Ok(slots.entry(collection.to_string()).or_default().clone())
    }

    async fn persist(&self, collection: &str, snapshot: Option<Snapshot>) -> Result<()> {
        let (Some(persistence), Some(snapshot)) = (self.persistence.clone(), snapshot) else {
            return Ok(());
        };
        let slot = self.saved_slot(collection)?;
        let collection = collection.to_string();
        let pending = self.pending_tasks.clone();
        let failure = self.failure.clone();

        pending.fetch_add(1, Ordering::SeqCst);
        // Spawned so the save completes even if the caller is dropped.
        let task = tokio::spawn(async move {
            let saved = slot.lock_owned().await;
            let result = save_if_newer(persistence, collection.clone(), snapshot, saved).await;
            if let Err(e) = &result {
                error!("Failed to persist collection {}: {}", collection, e);
                if let Ok(mut failure) = failure.lock() {
                    *failure = Some(format!("{}: {}", collection, e));
                }
            }
            pending.fetch_sub(1, Ordering::SeqCst);
            result
        });
        task.await.map_err(|e| Error::Store(format!("persistence task failed: {}", e)))?
    }

    fn push(&self, collection: &str, conflict: Option<&Filter>, mut document: Document) -> Result<Conditional<(Document, Option<Snapshot>)>> {
        let mut data = self.write_data()?;
        if let (Some(conflict), Some(docs)) = (conflict, data.get(collection)) {
            if docs.iter().any(|doc| conflict.matches(doc)) {
                return Ok(Conditional::Conflict);
            }
        }
        document.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().simple().to_string()));
        let docs = data.entry(collection.to_string()).or_default();
        docs.push(document.clone());
        Ok(Conditional::Applied((document, self.snapshot(docs))))
    }

    fn merge(
        &self,
        collection: &str,
        filter: &Filter,
        conflict: Option<&Filter>,
        fields: Document,
    ) -> Result<Conditional<(Option<Document>, Option<Snapshot>)>> {
        let mut data = self.write_data()?;
        let Some(docs) = data.get_mut(collection) else {
            return Ok(Conditional::Applied((None, None)));
        };
        if let Some(conflict) = conflict {
            if docs.iter().any(|doc| conflict.matches(doc)) {
                return Ok(Conditional::Conflict);
            }
        }
        let Some(doc) = docs.iter_mut().find(|doc| filter.matches(doc)) else {
            return Ok(Conditional::Applied((None, None)));
        };
        for (key, value) in fields {
            if key != ID_FIELD {
                doc.insert(key, value);
            }
        }
        let updated = doc.clone();
        Ok(Conditional::Applied((Some(updated), self.snapshot(docs))))
    }
}

async fn save_if_newer(
    persistence: Arc<Persistence>,
    collection: String,
    snapshot: Snapshot,
    mut saved: OwnedMutexGuard<u64>,
) -> Result<()> {
    if snapshot.version <= *saved {
        return Ok(());
    }
    tokio::task::spawn_blocking(move || -> Result<()> {
        persistence.save_collection(&collection, &snapshot.documents)?;
        *saved = snapshot.version;
        Ok(())
    })
    .await
    .map_err(|e| Error::Store(format!("persistence task failed: {}", e)))?
}

#[async_trait]
impl DocumentReader for MemStore {
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let data = self.read_data()?;
        Ok(data
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| filter.matches(doc)))
            .cloned())
    }

    async fn find(&self, collection: &str, filter: &Filter, sort: Option<&SortSpec>) -> Result<Vec<Document>> {
        let mut found: Vec<Document> = {
            let data = self.read_data()?;
            data.get(collection)
                .map(|docs| docs.iter().filter(|doc| filter.matches(doc)).cloned().collect())
                .unwrap_or_default()
        };
        if let Some(sort) = sort {
            // sort_by is stable, ties keep natural order
            found.sort_by(|a, b| sort.compare(a, b));
        }
        Ok(found)
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let data = self.read_data()?;
        let mut names: Vec<String> = data
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl DocumentWriter for MemStore {
    async fn insert(&self, collection: &str, document: Document) -> Result<Document> {
        match self.push(collection, None, document)? {
            Conditional::Applied((saved, snapshot)) => {
                self.persist(collection, snapshot).await?;
                Ok(saved)
            }
            Conditional::Conflict => Err(Error::Store("unconditional insert reported a conflict".to_string())),
        }
    }

    async fn insert_unless(&self, collection: &str, conflict: &Filter, document: Document) -> Result<Conditional<Document>> {
        match self.push(collection, Some(conflict), document)? {
            Conditional::Applied((saved, snapshot)) => {
                self.persist(collection, snapshot).await?;
                Ok(Conditional::Applied(saved))
            }
            Conditional::Conflict => Ok(Conditional::Conflict),
        }
    }

    async fn update_one(&self, collection: &str, filter: &Filter, fields: Document) -> Result<Option<Document>> {
        match self.merge(collection, filter, None, fields)? {
            Conditional::Applied((updated, snapshot)) => {
                self.persist(collection, snapshot).await?;
                Ok(updated)
            }
            Conditional::Conflict => Err(Error::Store("unconditional update reported a conflict".to_string())),
        }
    }

    async fn update_one_unless(
        &self,
        collection: &str,
        filter: &Filter,
        conflict: &Filter,
        fields: Document,
    ) -> Result<Conditional<Option<Document>>> {
        match self.merge(collection, filter, Some(conflict), fields)? {
            Conditional::Applied((updated, snapshot)) => {
                self.persist(collection, snapshot).await?;
                Ok(Conditional::Applied(updated))
            }
            Conditional::Conflict => Ok(Conditional::Conflict),
        }
    }

    async fn delete(&self, collection: &str, filter: &Filter, only_first: bool) -> Result<u64> {
        let (removed, snapshot) = {
            let mut data = self.write_data()?;
            match data.get_mut(collection) {
                Some(docs) => {
                    let before = docs.len();
                    if only_first {
                        if let Some(pos) = docs.iter().position(|doc| filter.matches(doc)) {
                            docs.remove(pos);
                        }
                    } else {
                        docs.retain(|doc| !filter.matches(doc));
                    }
                    let removed = (before - docs.len()) as u64;
                    let snapshot = if removed > 0 { self.snapshot(docs) } else { None };
                    (removed, snapshot)
                }
                None => (0, None),
            }
        };
        self.persist(collection, snapshot).await?;
        Ok(removed)
    }
}

#[async_trait]
impl DocumentStore for MemStore {
    async fn flush(&self) -> Result<()> {
        self.wait().await;
        let failure = self.failure.lock().map_err(|_| lock_poisoned())?.take();
        match failure {
            Some(reason) => Err(Error::Store(format!("persistence failed for {}", reason))),
            None => Ok(()),
        }
    }
}
