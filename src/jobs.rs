//! Named batch operations, as triggered by a scheduler or an operator.

use std::sync::Arc;

use ledgerview_core::{
    models::{PeriodKey, ReportingPeriod, TrialBalancePeriod},
    storage::LedgerStore,
};
use time::Date;

use crate::{
    batch::{BatchDriver, BatchSummary},
    clock::Clock,
    error::PipelineError,
    period_close::PeriodCloser,
};

pub struct Jobs {
    store: Arc<dyn LedgerStore>,
    batch: Arc<BatchDriver>,
    closer: Arc<PeriodCloser>,
    clock: Arc<dyn Clock>,
}

impl Jobs {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        batch: Arc<BatchDriver>,
        closer: Arc<PeriodCloser>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            batch,
            closer,
            clock,
        }
    }

    /// Today and later are not final yet; they roll back to yesterday.
    fn settled(&self, date: Date) -> Date {
        if date >= self.clock.today() {
            self.clock.yesterday()
        } else {
            date
        }
    }

    /// Generates one date for every entity.
    pub async fn generate_daily_balance(&self, date: Date) -> Result<Vec<BatchSummary>, PipelineError> {
        let date = self.settled(date);
        self.run_for_entities(date, date).await
    }

    /// Generates `start..=end` for every entity. `end` defaults to the end of
    /// `start`'s month and never goes past yesterday.
    pub async fn generate_range(&self, start: Date, end: Option<Date>) -> Result<Vec<BatchSummary>, PipelineError> {
        let end = end.unwrap_or_else(|| ReportingPeriod::containing(start).last_day());
        let end = end.min(self.clock.yesterday());
        self.run_for_entities(start, end).await
    }

    async fn run_for_entities(&self, start: Date, end: Date) -> Result<Vec<BatchSummary>, PipelineError> {
        let mut summaries = Vec::new();
        for entity in self.store.list_entities()? {
            summaries.push(self.batch.run(&entity, start, end).await?);
        }
        Ok(summaries)
    }

    pub fn close_trial_balance(
        &self,
        period: ReportingPeriod,
        entity_code: &str,
        closed_by: &str,
    ) -> Result<TrialBalancePeriod, PipelineError> {
        self.closer.close(&PeriodKey::regular(period, entity_code), closed_by)
    }

    pub fn open_adjustment(&self, period: ReportingPeriod, entity_code: &str) -> Result<TrialBalancePeriod, PipelineError> {
        self.closer.open_adjustment(period, entity_code)
    }

    pub fn close_adjustment(
        &self,
        period: ReportingPeriod,
        entity_code: &str,
        closed_by: &str,
    ) -> Result<TrialBalancePeriod, PipelineError> {
        self.closer.close(&PeriodKey::adjustment(period, entity_code), closed_by)
    }
}
