//! Core types and traits for ledgerview backends.
//!
//! This crate provides the store traits (`ReferenceStore`, `MovementStore`,
//! `BalanceStore`, `PeriodStore`), the cache and export collaborator traits,
//! the report types, and the money and cursor codecs shared by every
//! backend and by the pipeline itself.

pub mod cache;
pub mod cursor;
pub mod export;
pub mod models;
pub mod money;
pub mod pagination;
pub mod storage;

// Re-export key types at crate root for convenience
pub use cache::{CacheError, CacheStore};
pub use cursor::{CursorError, CursorKey};
pub use export::ExportStore;
pub use models::{
    Account, AccountBalanceDaily, AccountStatus, Category, CoaType, EntrySide, JournalMovement,
    NormalBalance, PeriodKey, PeriodStatus, ReportingPeriod, SubCategory, TrialBalancePeriod,
};
pub use models::report::{
    AccountLeaf, BalanceScope, BalanceSheet, BalanceSheetLine, BalanceSheetSection, CategoryNode,
    CoaTypeNode, SubCategoryNode, Totals, TrialBalanceTree, UnmappedBucket,
};
pub use money::{MoneyError, NumberLocale};
pub use pagination::{Direction, KeysetWindow, Page, PageRequest, PaginationError};
pub use storage::{
    BalanceFilter, BalanceStore, CloseOutcome, LedgerStore, MovementStore, PeriodFilter, PeriodStore,
    ReferenceStore, StorageError,
};
