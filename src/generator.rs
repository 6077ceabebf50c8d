use std::{collections::HashSet, sync::Arc};

use ledgerview_core::{
    models::{Account, AccountBalanceDaily, EntrySide, PeriodKey, ReportingPeriod},
    storage::LedgerStore,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::{cache::CacheAside, clock::Clock, error::PipelineError};

pub const BALANCES_GENERATED: &str = "ledgerview_balances_generated_total";

/// Which accounts of an entity a generation run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountScope {
    /// Every active account of the entity.
    All,
    Accounts(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub entity_code: String,
    pub date: Date,
    pub accounts: usize,
    pub debit_total: Decimal,
    pub credit_total: Decimal,
}

/// Folds one day of journal movements into per-account daily balances.
pub struct DailyBalanceGenerator {
    store: Arc<dyn LedgerStore>,
    cache: Arc<CacheAside>,
    clock: Arc<dyn Clock>,
}

impl DailyBalanceGenerator {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<CacheAside>, clock: Arc<dyn Clock>) -> Self {
        Self { store, cache, clock }
    }

    /// Computes and upserts the balances of `date` for the accounts in scope.
    ///
    /// All rows of the date are written together or not at all. Running it
    /// again for the same date recomputes and overwrites. When a closing
    /// changes, later dates that already hold rows are recomputed as well so
    /// their openings follow it.
    pub fn generate(
        &self,
        entity_code: &str,
        scope: &AccountScope,
        date: Date,
    ) -> Result<GenerationSummary, PipelineError> {
        let today = self.clock.today();
        if date >= today {
            return Err(PipelineError::Validation(format!(
                "cannot generate balances for {} on or after today ({})",
                date, today
            )));
        }
        self.ensure_writable(entity_code, date)?;

        let accounts = self.accounts_in_scope(entity_code, scope)?;
        let (summary, changed) = self.write_day(entity_code, &accounts, date)?;
        if changed {
            self.carry_forward(entity_code, &accounts, date, today)?;
        }
        self.cache.invalidate_prefix(&format!("tb:{}:", entity_code));
        Ok(summary)
    }

    /// Folds and upserts one date. The flag is set when any closing differs
    /// from the stored row, or the row is new.
    fn write_day(
        &self,
        entity_code: &str,
        accounts: &[Account],
        date: Date,
    ) -> Result<(GenerationSummary, bool), PipelineError> {
        let now = self.clock.now();
        let mut rows = Vec::with_capacity(accounts.len());
        let mut changed = false;
        for account in accounts {
            let row = self.fold_account(account, date, now)?;
            changed |= self
                .store
                .get_balance(&account.account_number, date)?
                .map_or(true, |stored| stored.closing_balance != row.closing_balance);
            rows.push(row);
        }

        if !rows.is_empty() {
            self.store.upsert_day(entity_code, date, &rows)?;
        }
        metrics::counter!(BALANCES_GENERATED, rows.len() as u64);

        let summary = GenerationSummary {
            entity_code: entity_code.to_string(),
            date,
            accounts: rows.len(),
            debit_total: rows.iter().map(|r| r.debit_movement).sum(),
            credit_total: rows.iter().map(|r| r.credit_movement).sum(),
        };
        tracing::info!(entity = entity_code, %date, accounts = summary.accounts, "Daily balances generated");
        Ok((summary, changed))
    }

    /// Recomputes the dates after `date` up to the last one already generated,
    /// stopping as soon as a day's closings come out unchanged.
    fn carry_forward(
        &self,
        entity_code: &str,
        accounts: &[Account],
        date: Date,
        today: Date,
    ) -> Result<(), PipelineError> {
        let (from, yesterday) = match (date.next_day(), today.previous_day()) {
            (Some(from), Some(yesterday)) if from <= yesterday => (from, yesterday),
            _ => return Ok(()),
        };
        let in_scope: HashSet<&str> = accounts.iter().map(|a| a.account_number.as_ref()).collect();
        let last = self
            .store
            .balances_between(entity_code, from, yesterday)?
            .into_iter()
            .filter(|row| in_scope.contains(row.account_number.as_ref()))
            .map(|row| row.balance_date)
            .max();

        let mut day = from;
        while last.map_or(false, |last| day <= last) {
            if let Err(e) = self.ensure_writable(entity_code, day) {
                tracing::warn!(entity = entity_code, %day, error = %e, "Carry-forward stopped at a frozen period");
                break;
            }
            let (_, changed) = self.write_day(entity_code, accounts, day)?;
            if !changed {
                break;
            }
            day = match day.next_day() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    /// Dates inside a closed or closing month only accept writes while an
    /// adjustment period is open.
    fn ensure_writable(&self, entity_code: &str, date: Date) -> Result<(), PipelineError> {
        let period = ReportingPeriod::containing(date);
        let regular = self.store.get_period(&PeriodKey::regular(period, entity_code))?;
        if !regular.map_or(false, |p| p.is_frozen()) {
            return Ok(());
        }
        match self.store.get_period(&PeriodKey::adjustment(period, entity_code))? {
            Some(adjustment) if !adjustment.is_frozen() => Ok(()),
            _ => Err(PipelineError::Conflict(format!(
                "period {} of entity {} is closed",
                period, entity_code
            ))),
        }
    }

    fn accounts_in_scope(&self, entity_code: &str, scope: &AccountScope) -> Result<Vec<Account>, PipelineError> {
        match scope {
            AccountScope::All => Ok(self
                .store
                .list_accounts(entity_code)?
                .into_iter()
                .filter(Account::is_active)
                .collect()),
            AccountScope::Accounts(numbers) => numbers
                .iter()
                .map(|number| {
                    let account = self.store.get_account(number)?;
                    if account.entity_code.as_ref() != entity_code {
                        return Err(PipelineError::Validation(format!(
                            "account {} belongs to entity {}, not {}",
                            number, account.entity_code, entity_code
                        )));
                    }
                    Ok(account)
                })
                .collect(),
        }
    }

    fn fold_account(
        &self,
        account: &Account,
        date: Date,
        now: OffsetDateTime,
    ) -> Result<AccountBalanceDaily, PipelineError> {
        let opening = self
            .store
            .latest_before(&account.account_number, date)?
            .map_or(Decimal::ZERO, |prior| prior.closing_balance);

        let mut debit = Decimal::ZERO;
        let mut credit = Decimal::ZERO;
        for movement in self.store.movements_on(&account.account_number, date)? {
            if movement.account_number != account.account_number || movement.movement_date != date {
                return Err(PipelineError::InvariantViolation(format!(
                    "movement {} of {} on {} returned for {} on {}",
                    movement.id, movement.account_number, movement.movement_date, account.account_number, date
                )));
            }
            if movement.amount.is_sign_negative() && !movement.amount.is_zero() {
                return Err(PipelineError::InvariantViolation(format!(
                    "movement {} has negative amount {}",
                    movement.id, movement.amount
                )));
            }
            match movement.side {
                EntrySide::Debit => debit += movement.amount,
                EntrySide::Credit => credit += movement.amount,
            }
        }

        let row = AccountBalanceDaily {
            account_number: account.account_number.clone(),
            entity_code: account.entity_code.clone(),
            balance_date: date,
            opening_balance: opening,
            debit_movement: debit,
            credit_movement: credit,
            closing_balance: account.normal_balance.fold(opening, debit, credit),
            normal_balance: account.normal_balance,
            created_at: now,
            updated_at: now,
        };
        if !row.reconciles() {
            return Err(PipelineError::InvariantViolation(format!(
                "balance of {} on {} does not reconcile",
                account.account_number, date
            )));
        }
        tracing::debug!(
            account = %account.account_number,
            %date,
            %opening,
            %debit,
            %credit,
            closing = %row.closing_balance,
            "Account folded"
        );
        Ok(row)
    }
}
