use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, OffsetDateTime};

use crate::{
    cursor::{CursorError, CursorKey},
    models::{
        Account, AccountBalanceDaily, Category, JournalMovement, PeriodKey, PeriodStatus, ReportingPeriod,
        SubCategory, TrialBalancePeriod,
    },
    pagination::KeysetWindow,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
    #[error("export not found: {0}")]
    ExportNotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("invalid export path: {0}")]
    InvalidPath(String),
    #[error("close claim on {0} is no longer held")]
    ClaimLost(String),
}

/// Filter for the daily balance list, ordered by account number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceFilter {
    pub entity_code: String,
    pub balance_date: Date,
    pub category_code: Option<String>,
    pub sub_category_code: Option<String>,
    /// Case-insensitive substring of the account number.
    pub search: Option<String>,
}

impl BalanceFilter {
    pub fn new(entity_code: &str, balance_date: Date) -> Self {
        Self {
            entity_code: entity_code.to_string(),
            balance_date,
            category_code: None,
            sub_category_code: None,
            search: None,
        }
    }

    pub fn matches(&self, account: &Account) -> bool {
        account.entity_code.as_ref() == self.entity_code
            && self.category_code.as_deref().map_or(true, |c| account.category_code.as_ref() == c)
            && self
                .sub_category_code
                .as_deref()
                .map_or(true, |s| account.sub_category_code.as_ref() == s)
            && self.search.as_deref().map_or(true, |q| {
                account
                    .account_number
                    .to_ascii_lowercase()
                    .contains(&q.to_ascii_lowercase())
            })
    }
}

/// Filter for the period list, ordered by creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodFilter {
    pub entity_code: Option<String>,
    pub status: Option<PeriodStatus>,
}

impl PeriodFilter {
    pub fn matches(&self, period: &TrialBalancePeriod) -> bool {
        self.entity_code
            .as_deref()
            .map_or(true, |e| period.key.entity_code.as_ref() == e)
            && self.status.map_or(true, |s| period.status == s)
    }
}

/// Keyset position in the period list: creation time, then the natural key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PeriodCursor {
    pub created_at: OffsetDateTime,
    pub entity_code: String,
    pub period: ReportingPeriod,
    pub is_adjustment: bool,
}

impl PeriodCursor {
    pub fn of(period: &TrialBalancePeriod) -> Self {
        Self {
            created_at: period.created_at,
            entity_code: period.key.entity_code.to_string(),
            period: period.key.period,
            is_adjustment: period.key.is_adjustment,
        }
    }
}

impl CursorKey for PeriodCursor {
    fn to_cursor_text(&self) -> Result<String, CursorError> {
        Ok(format!(
            "{}|{}|{}|{}",
            self.created_at.to_cursor_text()?,
            self.period,
            u8::from(self.is_adjustment),
            self.entity_code
        ))
    }

    fn from_cursor_text(text: &str) -> Result<Self, CursorError> {
        let bad = || CursorError::InvalidCursor(format!("bad period key: {}", text));
        let mut parts = text.splitn(4, '|');
        let created_at = OffsetDateTime::from_cursor_text(parts.next().ok_or_else(bad)?)?;
        let period = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let is_adjustment = match parts.next().ok_or_else(bad)? {
            "0" => false,
            "1" => true,
            _ => return Err(bad()),
        };
        let entity_code = parts.next().filter(|e| !e.is_empty()).ok_or_else(bad)?.to_string();
        Ok(Self {
            created_at,
            entity_code,
            period,
            is_adjustment,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// This caller moved the period to CLOSING and may write the export.
    Claimed(TrialBalancePeriod),
    /// Another closer holds a live claim.
    Busy(TrialBalancePeriod),
    AlreadyClosed(TrialBalancePeriod),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// This call performed the CLOSING -> CLOSED transition.
    Closed(TrialBalancePeriod),
    /// Another writer closed the period first.
    AlreadyClosed(TrialBalancePeriod),
}

impl CloseOutcome {
    pub fn into_record(self) -> TrialBalancePeriod {
        match self {
            CloseOutcome::Closed(p) | CloseOutcome::AlreadyClosed(p) => p,
        }
    }
}

/// Read-only reference data: accounts and the classification hierarchy.
pub trait ReferenceStore: Send + Sync {
    fn list_entities(&self) -> Result<Vec<Arc<str>>, StorageError>;
    fn list_accounts(&self, entity_code: &str) -> Result<Vec<Account>, StorageError>;
    fn get_account(&self, account_number: &str) -> Result<Account, StorageError>;
    fn list_categories(&self) -> Result<Vec<Category>, StorageError>;
    fn list_sub_categories(&self) -> Result<Vec<SubCategory>, StorageError>;
}

/// Posted journal movements, produced by the ledger and never mutated here.
pub trait MovementStore: Send + Sync {
    fn movements_on(&self, account_number: &str, date: Date) -> Result<Vec<JournalMovement>, StorageError>;
}

pub trait BalanceStore: Send + Sync {
    /// Most recent row strictly before `date`.
    fn latest_before(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError>;
    fn get_balance(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError>;
    /// Upserts one date's rows atomically. Existing rows keep their `created_at`.
    fn upsert_day(&self, entity_code: &str, date: Date, rows: &[AccountBalanceDaily]) -> Result<(), StorageError>;
    /// All rows of the entity with `from <= balance_date <= to`, ordered by account then date.
    fn balances_between(&self, entity_code: &str, from: Date, to: Date) -> Result<Vec<AccountBalanceDaily>, StorageError>;
    /// At most `window.fetch_size()` rows in window order.
    fn list_balances(
        &self,
        filter: &BalanceFilter,
        window: &KeysetWindow<String>,
    ) -> Result<Vec<AccountBalanceDaily>, StorageError>;
}

pub trait PeriodStore: Send + Sync {
    fn get_period(&self, key: &PeriodKey) -> Result<Option<TrialBalancePeriod>, StorageError>;
    /// Inserts an OPEN record when none exists and returns the stored record.
    fn ensure_open(&self, key: &PeriodKey, now: OffsetDateTime) -> Result<TrialBalancePeriod, StorageError>;
    /// Conditional OPEN -> CLOSING transition under `claim`. An absent record
    /// counts as OPEN. A CLOSING record last touched before `stale_before` is
    /// taken over.
    fn claim_close(
        &self,
        key: &PeriodKey,
        claim: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<ClaimOutcome, StorageError>;
    /// CLOSING -> CLOSED, only while `claim` is still the holder.
    /// Fails with [`StorageError::ClaimLost`] otherwise, unless the period is already closed.
    fn mark_closed(
        &self,
        key: &PeriodKey,
        claim: &str,
        file_path: &str,
        closed_by: &str,
        now: OffsetDateTime,
    ) -> Result<CloseOutcome, StorageError>;
    /// CLOSING -> OPEN when `claim` is still the holder; a no-op otherwise.
    fn release_claim(&self, key: &PeriodKey, claim: &str, now: OffsetDateTime) -> Result<(), StorageError>;
    /// At most `window.fetch_size()` rows in window order, keyed by [`PeriodCursor`].
    fn list_periods(
        &self,
        filter: &PeriodFilter,
        window: &KeysetWindow<PeriodCursor>,
    ) -> Result<Vec<TrialBalancePeriod>, StorageError>;
}

/// Every store the pipeline reads from or writes to, served by one backend.
pub trait LedgerStore: ReferenceStore + MovementStore + BalanceStore + PeriodStore {}

impl<T: ReferenceStore + MovementStore + BalanceStore + PeriodStore> LedgerStore for T {}
