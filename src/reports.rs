//! Read-side queries: paginated lists and trial balance views.

use std::{collections::BTreeSet, sync::Arc};

use ledgerview_core::{
    models::{
        report::{BalanceScope, BalanceSheet, TrialBalanceTree},
        AccountBalanceDaily, PeriodKey, ReportingPeriod, TrialBalancePeriod,
    },
    pagination::{Page, PageRequest},
    storage::{BalanceFilter, LedgerStore, PeriodCursor, PeriodFilter},
};
use crate::{
    aggregator::{AggregateRequest, TrialBalanceAggregator},
    error::PipelineError,
    period_close::PeriodCloser,
};

pub struct ReportService {
    store: Arc<dyn LedgerStore>,
    aggregator: Arc<TrialBalanceAggregator>,
    closer: Arc<PeriodCloser>,
    guest_exclusions: BTreeSet<String>,
}

impl ReportService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        aggregator: Arc<TrialBalanceAggregator>,
        closer: Arc<PeriodCloser>,
        guest_exclusions: BTreeSet<String>,
    ) -> Self {
        Self {
            store,
            aggregator,
            closer,
            guest_exclusions,
        }
    }

    /// Daily balances of one date, ordered by account number.
    pub fn list_daily_balances(
        &self,
        filter: &BalanceFilter,
        request: &PageRequest,
    ) -> Result<Page<AccountBalanceDaily>, PipelineError> {
        let window = request.window::<String>()?;
        let rows = self.store.list_balances(filter, &window)?;
        Ok(Page::from_rows(rows, &window, |row| row.account_number.to_string())?)
    }

    /// Reporting periods, ordered by creation time then by period key.
    pub fn list_periods(
        &self,
        filter: &PeriodFilter,
        request: &PageRequest,
    ) -> Result<Page<TrialBalancePeriod>, PipelineError> {
        let window = request.window::<PeriodCursor>()?;
        let rows = self.store.list_periods(filter, &window)?;
        Ok(Page::from_rows(rows, &window, PeriodCursor::of)?)
    }

    /// A scope covering exactly one calendar month is read through the period,
    /// so a closed month is served from its frozen export.
    pub fn trial_balance(
        &self,
        entity_code: &str,
        scope: BalanceScope,
        guest: bool,
    ) -> Result<TrialBalanceTree, PipelineError> {
        if let Some(period) = whole_month(&scope) {
            let tree = self.closer.read_trial_balance(&PeriodKey::regular(period, entity_code))?;
            return Ok(if guest {
                tree.without_sub_categories(&self.guest_exclusions)
            } else {
                tree
            });
        }

        let mut request = AggregateRequest::with_scope(entity_code, scope);
        if guest {
            request = request.excluding(self.guest_exclusions.iter().cloned());
        }
        self.aggregator.aggregate_cached(&request)
    }

    pub fn balance_sheet(
        &self,
        entity_code: &str,
        scope: BalanceScope,
        guest: bool,
    ) -> Result<BalanceSheet, PipelineError> {
        Ok(self.trial_balance(entity_code, scope, guest)?.balance_sheet())
    }
}

fn whole_month(scope: &BalanceScope) -> Option<ReportingPeriod> {
    match scope {
        BalanceScope::Range { from, to } => {
            let period = ReportingPeriod::containing(*from);
            (*from == period.first_day() && *to == period.last_day()).then_some(period)
        }
        BalanceScope::Day { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_whole_month_detection() {
        let january = BalanceScope::Range {
            from: date!(2024-01-01),
            to: date!(2024-01-31),
        };
        assert_eq!(whole_month(&january).map(|p| p.to_string()).as_deref(), Some("2024-01"));

        let partial = BalanceScope::Range {
            from: date!(2024-01-01),
            to: date!(2024-01-30),
        };
        assert!(whole_month(&partial).is_none());
        assert!(whole_month(&BalanceScope::Day { date: date!(2024-01-31) }).is_none());
    }
}
