//! SQLite storage backend for ledgerview.

mod storage;

pub use storage::SqliteStorage;
