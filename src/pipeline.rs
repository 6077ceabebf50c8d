use std::sync::Arc;

use ledgerview_core::{cache::CacheStore, export::ExportStore, storage::LedgerStore};

use crate::{
    aggregator::TrialBalanceAggregator,
    batch::BatchDriver,
    cache::CacheAside,
    clock::Clock,
    config::PipelineSettings,
    generator::DailyBalanceGenerator,
    jobs::Jobs,
    period_close::PeriodCloser,
    reports::ReportService,
};

/// The assembled pipeline over one set of collaborators.
pub struct Pipeline {
    pub generator: Arc<DailyBalanceGenerator>,
    pub aggregator: Arc<TrialBalanceAggregator>,
    pub closer: Arc<PeriodCloser>,
    pub jobs: Jobs,
    pub reports: ReportService,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn CacheStore>,
        exports: Arc<dyn ExportStore>,
        clock: Arc<dyn Clock>,
        settings: PipelineSettings,
    ) -> Self {
        let cache_aside = Arc::new(CacheAside::new(cache.clone()));
        let generator = Arc::new(DailyBalanceGenerator::new(store.clone(), cache_aside.clone(), clock.clone()));
        let aggregator = Arc::new(TrialBalanceAggregator::new(
            store.clone(),
            cache_aside,
            clock.clone(),
            settings.cache_ttl,
        ));
        let closer = Arc::new(
            PeriodCloser::new(store.clone(), exports, aggregator.clone(), clock.clone())
                .with_claim_timing(settings.close_wait, settings.close_claim_ttl),
        );
        let batch = Arc::new(BatchDriver::new(
            generator.clone(),
            cache,
            settings.step_delay,
            settings.lock_ttl,
        ));
        let jobs = Jobs::new(store.clone(), batch, closer.clone(), clock);
        let reports = ReportService::new(
            store,
            aggregator.clone(),
            closer.clone(),
            settings.guest_excluded_sub_categories,
        );

        Self {
            generator,
            aggregator,
            closer,
            jobs,
            reports,
        }
    }
}
