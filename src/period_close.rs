use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use ledgerview_core::{
    export::ExportStore,
    models::{report::TrialBalanceTree, PeriodKey, ReportingPeriod, TrialBalancePeriod},
    storage::{ClaimOutcome, CloseOutcome, LedgerStore},
};
use uuid::Uuid;

use crate::{
    aggregator::{AggregateRequest, TrialBalanceAggregator},
    clock::Clock,
    error::PipelineError,
};

pub const PERIODS_CLOSED: &str = "ledgerview_periods_closed_total";

const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_CLOSE_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(600);

/// Drives reporting periods from OPEN through CLOSING to CLOSED and serves
/// their trial balances.
///
/// Only the closer holding the CLOSING claim in the store writes the export,
/// so closers in other processes sharing the store never overwrite it. A
/// closed period is frozen: its trial balance is read back from the export
/// written at close time and never recomputed from live balances.
pub struct PeriodCloser {
    store: Arc<dyn LedgerStore>,
    exports: Arc<dyn ExportStore>,
    aggregator: Arc<TrialBalanceAggregator>,
    clock: Arc<dyn Clock>,
    /// How long a close waits on a claim held elsewhere.
    close_wait: Duration,
    /// Age after which a CLOSING claim is treated as abandoned.
    claim_ttl: Duration,
    locks: Mutex<HashMap<PeriodKey, Arc<Mutex<()>>>>,
}

impl PeriodCloser {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        exports: Arc<dyn ExportStore>,
        aggregator: Arc<TrialBalanceAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            exports,
            aggregator,
            clock,
            close_wait: DEFAULT_CLOSE_WAIT,
            claim_ttl: DEFAULT_CLAIM_TTL,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_claim_timing(mut self, close_wait: Duration, claim_ttl: Duration) -> Self {
        self.close_wait = close_wait;
        self.claim_ttl = claim_ttl;
        self
    }

    fn lock_for(&self, key: &PeriodKey) -> Arc<Mutex<()>> {
        self.locks.lock().unwrap().entry(key.clone()).or_default().clone()
    }

    /// Drops the key's lock once no other caller holds or waits on it.
    fn release_lock(&self, key: &PeriodKey, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap();
        // one reference in the map, one in `lock`; dropped under the map lock
        let idle = Arc::strong_count(&lock) <= 2;
        drop(lock);
        if idle {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    fn full_month(key: &PeriodKey) -> AggregateRequest {
        AggregateRequest::range(&key.entity_code, key.period.first_day(), key.period.last_day())
    }

    /// Closes the period. Closing an already closed period returns its record unchanged.
    pub fn close(&self, key: &PeriodKey, closed_by: &str) -> Result<TrialBalancePeriod, PipelineError> {
        let closed_by = closed_by.trim();
        if closed_by.is_empty() {
            return Err(PipelineError::Validation("closed_by must not be empty".to_string()));
        }

        let lock = self.lock_for(key);
        let result = {
            let _guard = lock.lock().unwrap();
            self.close_locked(key, closed_by)
        };
        self.release_lock(key, lock);
        result
    }

    fn close_locked(&self, key: &PeriodKey, closed_by: &str) -> Result<TrialBalancePeriod, PipelineError> {
        let existing = self.store.get_period(key)?;
        if let Some(period) = existing.as_ref().filter(|p| p.is_closed()) {
            tracing::info!(period = %key, "Period already closed");
            return Ok(period.clone());
        }
        if key.is_adjustment && existing.is_none() {
            return Err(PipelineError::Conflict(format!("adjustment period {} was never opened", key)));
        }

        let today = self.clock.today();
        if key.period.last_day() >= today {
            return Err(PipelineError::Validation(format!(
                "period {} has not ended yet (today is {})",
                key.period, today
            )));
        }

        let claim = Uuid::new_v4().to_string();
        if let Some(closed) = self.acquire_claim(key, &claim)? {
            return Ok(closed);
        }

        let path = match self.export(key) {
            Ok(path) => path,
            Err(e) => {
                if let Err(release) = self.store.release_claim(key, &claim, self.clock.now()) {
                    tracing::warn!(period = %key, error = %release, "Failed to release close claim");
                }
                return Err(e);
            }
        };

        match self.store.mark_closed(key, &claim, &path, closed_by, self.clock.now())? {
            CloseOutcome::Closed(period) => {
                metrics::increment_counter!(PERIODS_CLOSED);
                tracing::info!(period = %key, %path, closed_by, "Period closed");
                Ok(period)
            }
            CloseOutcome::AlreadyClosed(period) => {
                tracing::warn!(period = %key, winner = ?period.closed_by, "Period was closed concurrently");
                Ok(period)
            }
        }
    }

    /// Takes the CLOSING claim, waiting up to `close_wait` while another closer
    /// holds it. Returns the record instead when the period ends up closed.
    fn acquire_claim(&self, key: &PeriodKey, claim: &str) -> Result<Option<TrialBalancePeriod>, PipelineError> {
        let deadline = Instant::now() + self.close_wait;
        loop {
            let now = self.clock.now();
            match self.store.claim_close(key, claim, now, now - self.claim_ttl)? {
                ClaimOutcome::Claimed(_) => {
                    tracing::debug!(period = %key, claim, "Close claimed");
                    return Ok(None);
                }
                ClaimOutcome::AlreadyClosed(period) => {
                    tracing::info!(period = %key, winner = ?period.closed_by, "Period was closed by another closer");
                    return Ok(Some(period));
                }
                ClaimOutcome::Busy(period) => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::Transient(format!(
                            "period {} is being closed elsewhere (claim {})",
                            key,
                            period.close_claim.as_deref().unwrap_or("?")
                        )));
                    }
                    std::thread::sleep(CLAIM_POLL_INTERVAL);
                }
            }
        }
    }

    fn export(&self, key: &PeriodKey) -> Result<String, PipelineError> {
        let tree = self.aggregator.aggregate(&Self::full_month(key))?;
        Ok(self.exports.write_trial_balance(key, &tree)?)
    }

    /// Frozen export for a closed period, live (cached) aggregation otherwise.
    ///
    /// A regular period is opened implicitly on first read. An adjustment
    /// period must have been opened through [`PeriodCloser::open_adjustment`].
    pub fn read_trial_balance(&self, key: &PeriodKey) -> Result<TrialBalanceTree, PipelineError> {
        match self.store.get_period(key)? {
            Some(period) if period.is_closed() => {
                let path = period.file_path.ok_or_else(|| {
                    PipelineError::InvariantViolation(format!("closed period {} has no export path", key))
                })?;
                Ok(self.exports.read_trial_balance(&path)?)
            }
            Some(_) => self.aggregator.aggregate_cached(&Self::full_month(key)),
            None if key.is_adjustment => Err(PipelineError::Conflict(format!(
                "adjustment period {} was never opened",
                key
            ))),
            None => {
                self.store.ensure_open(key, self.clock.now())?;
                self.aggregator.aggregate_cached(&Self::full_month(key))
            }
        }
    }

    /// Opens the adjustment period of a month whose regular period is closed.
    pub fn open_adjustment(
        &self,
        period: ReportingPeriod,
        entity_code: &str,
    ) -> Result<TrialBalancePeriod, PipelineError> {
        let regular = PeriodKey::regular(period, entity_code);
        if !self.store.get_period(&regular)?.map_or(false, |p| p.is_closed()) {
            return Err(PipelineError::Conflict(format!(
                "period {} must be closed before it can be adjusted",
                regular
            )));
        }
        let record = self
            .store
            .ensure_open(&PeriodKey::adjustment(period, entity_code), self.clock.now())?;
        tracing::info!(period = %record.key, status = record.status.code(), "Adjustment period opened");
        Ok(record)
    }
}
