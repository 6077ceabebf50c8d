use std::{sync::Arc, time::Duration};

use ledgerview_core::cache::CacheStore;
use serde::{Deserialize, Serialize};
use time::Date;
use uuid::Uuid;

use crate::{
    error::PipelineError,
    generator::{AccountScope, DailyBalanceGenerator},
};

/// Every date from `start` to `end`, both inclusive, in ascending order.
pub fn dates_between(start: Date, end: Date) -> Result<Vec<Date>, PipelineError> {
    if start > end {
        return Err(PipelineError::InvalidRange { start, end });
    }
    let mut dates = Vec::with_capacity((end - start).whole_days() as usize + 1);
    let mut current = Some(start);
    while let Some(date) = current.filter(|d| *d <= end) {
        dates.push(date);
        current = date.next_day();
    }
    Ok(dates)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub entity_code: String,
    pub start: Date,
    pub end: Date,
    pub days: usize,
    pub balances: usize,
}

/// Runs the generator over a date range, one date at a time.
pub struct BatchDriver {
    generator: Arc<DailyBalanceGenerator>,
    cache: Arc<dyn CacheStore>,
    step_delay: Duration,
    lock_ttl: Duration,
}

impl BatchDriver {
    pub fn new(
        generator: Arc<DailyBalanceGenerator>,
        cache: Arc<dyn CacheStore>,
        step_delay: Duration,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            generator,
            cache,
            step_delay,
            lock_ttl,
        }
    }

    fn lock_key(entity_code: &str) -> String {
        format!("batch:lock:{}", entity_code)
    }

    fn counter_key(entity_code: &str) -> String {
        format!("batch:days:{}", entity_code)
    }

    /// Generates every date of `start..=end` for the entity, stopping at the
    /// first failing date. Re-running from that date resumes the range.
    pub async fn run(&self, entity_code: &str, start: Date, end: Date) -> Result<BatchSummary, PipelineError> {
        let dates = dates_between(start, end)?;

        let lock_key = Self::lock_key(entity_code);
        let owner = Uuid::new_v4().to_string();
        let locked = match self.cache.set_if_absent(&lock_key, &owner, self.lock_ttl) {
            Ok(true) => true,
            Ok(false) => {
                return Err(PipelineError::Conflict(format!(
                    "a batch run for entity {} is already in progress",
                    entity_code
                )))
            }
            Err(e) => {
                tracing::warn!(entity = entity_code, error = %e, "Batch lock unavailable, running unguarded");
                false
            }
        };

        tracing::info!(entity = entity_code, %start, %end, days = dates.len(), "Batch run started");
        let result = self.run_dates(entity_code, &dates).await;

        if locked {
            match self.cache.delete_if_eq(&lock_key, &owner) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(entity = entity_code, "Batch lock expired during the run and is held by another owner")
                }
                Err(e) => tracing::warn!(entity = entity_code, error = %e, "Batch lock could not be released"),
            }
        }

        let balances = result?;
        tracing::info!(entity = entity_code, %start, %end, balances, "Batch run finished");
        Ok(BatchSummary {
            entity_code: entity_code.to_string(),
            start,
            end,
            days: dates.len(),
            balances,
        })
    }

    async fn run_dates(&self, entity_code: &str, dates: &[Date]) -> Result<usize, PipelineError> {
        let mut balances = 0;
        for (i, &date) in dates.iter().enumerate() {
            if i > 0 && !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }

            let generator = self.generator.clone();
            let entity = entity_code.to_string();
            let outcome = tokio::task::spawn_blocking(move || generator.generate(&entity, &AccountScope::All, date))
                .await
                .map_err(|e| PipelineError::Transient(format!("generation task failed: {}", e)))
                .and_then(|r| r);

            match outcome {
                Ok(summary) => {
                    balances += summary.accounts;
                    if let Err(e) = self.cache.increment(&Self::counter_key(entity_code), 1) {
                        tracing::debug!(entity = entity_code, error = %e, "Day counter not updated");
                    }
                }
                Err(e) => {
                    tracing::error!(entity = entity_code, %date, error = %e, "Batch run aborted");
                    return Err(PipelineError::Batch {
                        date,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(balances)
    }
}
