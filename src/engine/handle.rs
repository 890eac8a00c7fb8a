use std::sync::Arc;
use tokio::sync::OnceCell;
use crate::{DocumentStore, Result};
use crate::engine::{MemStore, Persistence};

/// Store URL selecting a purely in-memory engine.
pub const MEMORY_URL: &str = "memory:";

/// Lazily opened connection to the document store.
///
/// The handle is built by the process entry point and shared by every request.
/// The store is opened on first use, exactly once, even when many requests
/// arrive concurrently; later calls reuse the same instance.
pub struct StoreHandle {
    url: String,
    store: OnceCell<Arc<dyn DocumentStore>>,
}

impl StoreHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            store: OnceCell::new(),
        }
    }

    /// Wraps an already opened store.
    pub fn from_store(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            url: String::new(),
            store: OnceCell::new_with(Some(store)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the store, opening it on the first call.
    pub async fn get(&self) -> Result<Arc<dyn DocumentStore>> {
        let store = self.store.get_or_try_init(|| open(&self.url)).await?;
        Ok(store.clone())
    }

    /// Flushes pending writes if the store was ever opened.
    pub async fn flush(&self) -> Result<()> {
        match self.store.get() {
            Some(store) => store.flush().await,
            None => Ok(()),
        }
    }
}

/// Opens the engine named by `url`.
///
/// `memory:` gives a volatile store. Anything else is a data directory, with an
/// optional `file://` prefix, whose collections are loaded up front and written
/// back after every change.
pub async fn open(url: &str) -> Result<Arc<dyn DocumentStore>> {
    if url == MEMORY_URL {
        log::info!("Opening in-memory document store");
        return Ok(Arc::new(MemStore::new(Default::default(), None)));
    }

    let data_dir = url.strip_prefix("file://").unwrap_or(url);
    let persistence = Arc::new(Persistence::new(data_dir)?);
    let initial_data = persistence.load_all()?;
    log::info!("Opened document store at {} ({} collections)", data_dir, initial_data.len());
    Ok(Arc::new(MemStore::new(initial_data, Some(persistence))))
}
