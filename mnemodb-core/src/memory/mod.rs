pub mod cache_key;
pub(crate) mod category;
pub mod record;
pub mod store;

pub use cache_key::CacheKey;
pub use category::CategoryActivity;
pub use record::{ArchivedRecord, MemoryRecord, NewMemory, QueryHit, SlotMetadata};
pub use store::{MemoryStore, MemoryStoreBuilder, PassKind};
