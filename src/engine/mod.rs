pub mod filter;
pub mod handle;
pub mod memstore;
pub mod persistence;

pub use filter::{is_valid_id, Filter, SortSpec, ID_FIELD};
pub use handle::StoreHandle;
pub use memstore::MemStore;
pub use persistence::Persistence;
