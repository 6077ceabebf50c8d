//! In-memory backends for ledgerview.
//!
//! `InMemoryStorage` implements every store trait, `InMemoryCache` stands in
//! for the cache server and `InMemoryExportStore` for export storage.

mod cache;
mod export;
mod storage;

pub use cache::InMemoryCache;
pub use export::InMemoryExportStore;
pub use storage::InMemoryStorage;
