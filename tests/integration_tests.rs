use std::{collections::BTreeSet, sync::Arc};

use ledgerview::{
    clock::FixedClock,
    config::PipelineSettings,
    export::FsExportStore,
    generator::AccountScope,
    ErrorKind, Pipeline, PipelineError,
};
use ledgerview_core::{
    models::{
        report::BalanceScope, Account, Category, CoaType, EntrySide, PeriodKey, PeriodStatus, ReportingPeriod,
        SubCategory,
    },
    pagination::PageRequest,
    storage::{BalanceFilter, BalanceStore, LedgerStore, PeriodFilter, ReferenceStore},
    ExportStore,
};
use ledgerview_memory::{InMemoryCache, InMemoryExportStore, InMemoryStorage};
use ledgerview_sqlite::SqliteStorage;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use time::{
    macros::{date, datetime},
    Date,
};

const CASH: &str = "11101000000001";
const SAVINGS: &str = "21101000000001";
const DORMANT: &str = "21101000000002";
const CAPITAL: &str = "31101000000001";
const SALARIES: &str = "51101000000001";
const BONUSES: &str = "51102000000001";
const SUSPENSE: &str = "99901000000001";

/// Seeding access for the stand-in ledger of each backend.
trait Seed: Send + Sync {
    fn category(&self, category: &Category);
    fn sub_category(&self, sub_category: &SubCategory);
    fn account(&self, account: &Account);
    fn post(&self, account_number: &str, date: Date, side: EntrySide, amount: Decimal);
}

impl Seed for InMemoryStorage {
    fn category(&self, category: &Category) {
        self.add_category(category.clone());
    }

    fn sub_category(&self, sub_category: &SubCategory) {
        self.add_sub_category(sub_category.clone());
    }

    fn account(&self, account: &Account) {
        self.add_account(account.clone());
    }

    fn post(&self, account_number: &str, date: Date, side: EntrySide, amount: Decimal) {
        self.record_movement(account_number, date, side, amount).unwrap();
    }
}

impl Seed for SqliteStorage {
    fn category(&self, category: &Category) {
        self.add_category(category).unwrap();
    }

    fn sub_category(&self, sub_category: &SubCategory) {
        self.add_sub_category(sub_category).unwrap();
    }

    fn account(&self, account: &Account) {
        self.add_account(account).unwrap();
    }

    fn post(&self, account_number: &str, date: Date, side: EntrySide, amount: Decimal) {
        self.record_movement(account_number, date, side, amount).unwrap();
    }
}

struct Harness {
    seed: Arc<dyn Seed>,
    store: Arc<dyn LedgerStore>,
    pipeline: Pipeline,
    exports: Arc<InMemoryExportStore>,
    cache: Arc<InMemoryCache>,
}

fn harness<S: Seed + LedgerStore + 'static>(store: Arc<S>) -> Harness {
    let exports = Arc::new(InMemoryExportStore::new());
    let cache = Arc::new(InMemoryCache::new());
    let clock = Arc::new(FixedClock::new(datetime!(2024-02-05 9:00 +07:00)));
    let settings = PipelineSettings {
        guest_excluded_sub_categories: BTreeSet::from(["51102".to_string()]),
        ..Default::default()
    };
    let pipeline = Pipeline::new(store.clone(), cache.clone(), exports.clone(), clock, settings);
    let h = Harness {
        seed: store.clone(),
        store,
        pipeline,
        exports,
        cache,
    };
    seed_chart(h.seed.as_ref());
    h
}

fn memory() -> Harness {
    harness(Arc::new(InMemoryStorage::new()))
}

fn sqlite() -> Harness {
    harness(Arc::new(SqliteStorage::new(":memory:").unwrap()))
}

fn category(code: &str, name: &str, coa_type: CoaType) -> Category {
    Category {
        code: Arc::from(code),
        name: Arc::from(name),
        coa_type,
    }
}

fn sub_category(code: &str, name: &str, category_code: &str) -> SubCategory {
    SubCategory {
        code: Arc::from(code),
        name: Arc::from(name),
        category_code: Arc::from(category_code),
    }
}

fn seed_chart(seed: &dyn Seed) {
    let cash = category("111", "Cash", CoaType::Asset);
    let deposits = category("211", "Deposits", CoaType::Liability);
    let capital = category("311", "Capital", CoaType::Equity);
    let opex = category("511", "Operating Expenses", CoaType::Expense);
    for c in [&cash, &deposits, &capital, &opex] {
        seed.category(c);
    }
    seed.sub_category(&sub_category("11101", "Vault", "111"));
    seed.sub_category(&sub_category("21101", "Savings", "211"));
    seed.sub_category(&sub_category("31101", "Paid-in Capital", "311"));
    seed.sub_category(&sub_category("51101", "Salaries", "511"));
    seed.sub_category(&sub_category("51102", "Bonuses", "511"));

    let opened = datetime!(2023-12-01 0:00 UTC);
    seed.account(&Account::new(CASH, "001", &cash, "11101", "IDR", opened));
    seed.account(&Account::new(SAVINGS, "001", &deposits, "21101", "IDR", opened));
    seed.account(&Account::new(DORMANT, "001", &deposits, "21101", "IDR", opened));
    seed.account(&Account::new(CAPITAL, "001", &capital, "31101", "IDR", opened));
    seed.account(&Account::new(SALARIES, "001", &opex, "51101", "IDR", opened));
    seed.account(&Account::new(BONUSES, "001", &opex, "51102", "IDR", opened));
    // sub-category 99901 has no mapping
    seed.account(&Account::new(SUSPENSE, "001", &deposits, "99901", "IDR", opened));

    seed.post(CASH, date!(2024-01-02), EntrySide::Debit, dec!(1000000));
    seed.post(CAPITAL, date!(2024-01-02), EntrySide::Credit, dec!(1000000));
    seed.post(CASH, date!(2024-01-03), EntrySide::Debit, dec!(500000));
    seed.post(SAVINGS, date!(2024-01-03), EntrySide::Credit, dec!(500000));
    seed.post(SALARIES, date!(2024-01-04), EntrySide::Debit, dec!(200000));
    seed.post(BONUSES, date!(2024-01-04), EntrySide::Debit, dec!(50000));
    seed.post(CASH, date!(2024-01-04), EntrySide::Credit, dec!(250000));
    seed.post(CASH, date!(2024-01-04), EntrySide::Debit, dec!(10000));
    seed.post(SUSPENSE, date!(2024-01-04), EntrySide::Credit, dec!(10000));
}

fn january() -> ReportingPeriod {
    ReportingPeriod::new(2024, time::Month::January)
}

fn whole_january() -> BalanceScope {
    BalanceScope::Range {
        from: date!(2024-01-01),
        to: date!(2024-01-31),
    }
}

async fn generate_january(h: &Harness) {
    let summaries = h
        .pipeline
        .jobs
        .generate_range(date!(2024-01-01), None)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].end, date!(2024-01-31));
    assert_eq!(summaries[0].days, 31);
    assert_eq!(summaries[0].balances, 31 * 7);
}

async fn generated_range_reconciles(h: Harness) {
    generate_january(&h).await;

    let rows = h
        .store
        .balances_between("001", date!(2024-01-01), date!(2024-01-31))
        .unwrap();
    assert_eq!(rows.len(), 31 * 7);
    assert!(rows.iter().all(|r| r.reconciles()));

    // each day opens where the previous one closed
    let cash: Vec<_> = rows.iter().filter(|r| r.account_number.as_ref() == CASH).collect();
    for pair in cash.windows(2) {
        assert_eq!(pair[1].opening_balance, pair[0].closing_balance);
    }
    assert_eq!(cash.last().unwrap().closing_balance, dec!(1260000));
    assert_eq!(h.cache.len(), 1, "only the batch day counter remains");
}

async fn trial_balance_tree_totals(h: Harness) {
    generate_january(&h).await;

    let tree = h.pipeline.reports.trial_balance("001", whole_january(), false).unwrap();
    tree.verify().unwrap();
    assert_eq!(tree.leaves().count(), 7);
    assert_eq!(tree.coa_total(CoaType::Asset).closing, dec!(1260000));
    assert_eq!(tree.coa_total(CoaType::Asset).debit, dec!(1510000));
    assert_eq!(tree.coa_total(CoaType::Liability).closing, dec!(500000));
    assert_eq!(tree.coa_total(CoaType::Expense).closing, dec!(250000));
    assert_eq!(tree.unmapped.accounts.len(), 1);
    assert_eq!(tree.unmapped.totals.closing, dec!(10000));
    assert_eq!(tree.grand_total.debit, tree.grand_total.credit);

    let sheet = h.pipeline.reports.balance_sheet("001", whole_january(), false).unwrap();
    assert_eq!(sheet.total_assets, dec!(1510000));
    assert_eq!(sheet.total_liabilities, dec!(1500000));
    assert_eq!(sheet.current_earnings, dec!(-250000));
    assert_eq!(sheet.unmapped_total, dec!(10000));
    let leaf_closings: Decimal = tree.leaves().map(|l| l.totals.closing).sum();
    assert_eq!(leaf_closings, dec!(3020000));
    assert_eq!(sheet.total_assets + sheet.total_liabilities + sheet.unmapped_total, leaf_closings);

    let day = h
        .pipeline
        .reports
        .trial_balance("001", BalanceScope::Day { date: date!(2024-01-03) }, false)
        .unwrap();
    assert_eq!(day.coa_total(CoaType::Asset).closing, dec!(1500000));
    assert_eq!(day.coa_total(CoaType::Asset).opening, dec!(1000000));
}

async fn guest_view_hides_excluded_sub_categories(h: Harness) {
    generate_january(&h).await;

    let month = h.pipeline.reports.trial_balance("001", whole_january(), true).unwrap();
    assert_eq!(month.coa_total(CoaType::Expense).closing, dec!(200000));
    assert!(month.leaves().all(|l| l.account_number.as_ref() != BONUSES));
    assert_eq!(month.excluded_sub_categories, vec!["51102".to_string()]);

    let partial = BalanceScope::Range {
        from: date!(2024-01-01),
        to: date!(2024-01-15),
    };
    let tree = h.pipeline.reports.trial_balance("001", partial, true).unwrap();
    assert_eq!(tree.coa_total(CoaType::Expense).closing, dec!(200000));
    assert_eq!(tree.leaves().count(), 6);
}

async fn daily_balances_paginate(h: Harness) {
    generate_january(&h).await;

    let filter = BalanceFilter::new("001", date!(2024-01-31));
    let reports = &h.pipeline.reports;
    let page1 = reports.list_daily_balances(&filter, &PageRequest::first(3)).unwrap();
    let numbers = |items: &[ledgerview_core::AccountBalanceDaily]| {
        items.iter().map(|r| r.account_number.to_string()).collect::<Vec<_>>()
    };
    assert_eq!(numbers(&page1.items), vec![CASH, SAVINGS, DORMANT]);
    assert!(page1.prev_cursor.is_none());

    let page2 = reports
        .list_daily_balances(&filter, &PageRequest::after(3, page1.next_cursor.as_deref().unwrap()))
        .unwrap();
    assert_eq!(numbers(&page2.items), vec![CAPITAL, SALARIES, BONUSES]);

    let page3 = reports
        .list_daily_balances(&filter, &PageRequest::after(3, page2.next_cursor.as_deref().unwrap()))
        .unwrap();
    assert_eq!(numbers(&page3.items), vec![SUSPENSE]);
    assert!(page3.next_cursor.is_none());

    let back = reports
        .list_daily_balances(&filter, &PageRequest::before(3, page3.prev_cursor.as_deref().unwrap()))
        .unwrap();
    assert_eq!(back.items, page2.items);

    let mut savings_only = filter.clone();
    savings_only.sub_category_code = Some("21101".to_string());
    savings_only.search = Some("0002".to_string());
    let found = reports.list_daily_balances(&savings_only, &PageRequest::first(0)).unwrap();
    assert_eq!(numbers(&found.items), vec![DORMANT]);

    let bad = reports.list_daily_balances(&filter, &PageRequest::after(3, "%%%"));
    assert_eq!(bad.unwrap_err().kind(), ErrorKind::Validation);
    let negative = reports.list_daily_balances(&filter, &PageRequest::first(-1));
    assert_eq!(negative.unwrap_err().kind(), ErrorKind::Validation);
}

async fn close_freezes_the_month(h: Harness) {
    generate_january(&h).await;
    let jobs = &h.pipeline.jobs;

    let closed = jobs.close_trial_balance(january(), "001", "alice").unwrap();
    assert_eq!(closed.status, PeriodStatus::Closed);
    assert_eq!(closed.closed_by.as_deref(), Some("alice"));
    let again = jobs.close_trial_balance(january(), "001", "bob").unwrap();
    assert_eq!(again, closed);
    assert_eq!(h.exports.write_count(), 1);

    let frozen = h.pipeline.reports.trial_balance("001", whole_january(), false).unwrap();
    assert_eq!(
        frozen,
        h.exports
            .read_trial_balance(closed.file_path.as_deref().unwrap())
            .unwrap()
    );

    // late posting into the closed month is refused
    h.seed.post(CASH, date!(2024-01-10), EntrySide::Debit, dec!(7));
    h.seed.post(CAPITAL, date!(2024-01-10), EntrySide::Credit, dec!(7));
    let err = jobs.generate_daily_balance(date!(2024-01-10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(err.failed_date(), Some(date!(2024-01-10)));
    assert_eq!(
        h.pipeline.reports.trial_balance("001", whole_january(), false).unwrap(),
        frozen
    );

    // the adjustment period accepts it and freezes separately
    jobs.open_adjustment(january(), "001").unwrap();
    h.pipeline
        .generator
        .generate("001", &AccountScope::All, date!(2024-01-10))
        .unwrap();
    let adjustment = jobs.close_adjustment(january(), "001", "carol").unwrap();
    assert_eq!(adjustment.file_path.as_deref(), Some("trial-balance/001/2024-01-adjustment.json"));
    assert_eq!(h.exports.write_count(), 2);
    let adjusted = h
        .pipeline
        .closer
        .read_trial_balance(&PeriodKey::adjustment(january(), "001"))
        .unwrap();
    assert_eq!(
        adjusted.coa_total(CoaType::Asset).debit,
        frozen.coa_total(CoaType::Asset).debit + dec!(7)
    );
    assert_eq!(
        adjusted.coa_total(CoaType::Asset).closing,
        frozen.coa_total(CoaType::Asset).closing + dec!(7)
    );
    for leaf in adjusted.leaves() {
        let account = h.store.get_account(&leaf.account_number).unwrap();
        let t = leaf.totals;
        assert_eq!(
            account.normal_balance.fold(t.opening, t.debit, t.credit),
            t.closing,
            "adjusted leaf {} does not chain",
            leaf.account_number
        );
    }

    let periods = h
        .pipeline
        .reports
        .list_periods(
            &PeriodFilter {
                entity_code: Some("001".to_string()),
                status: Some(PeriodStatus::Closed),
            },
            &PageRequest::first(10),
        )
        .unwrap();
    assert_eq!(periods.items.len(), 2);
    assert!(!periods.items[0].key.is_adjustment);
    assert!(periods.items[1].key.is_adjustment);
}

async fn close_rejects_unfinished_months(h: Harness) {
    let jobs = &h.pipeline.jobs;
    let february = ReportingPeriod::new(2024, time::Month::February);
    let err = jobs.close_trial_balance(february, "001", "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = jobs.close_adjustment(january(), "001", "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.exports.write_count(), 0);
}

async fn daily_job_rechains_after_backfill(h: Harness) {
    let jobs = &h.pipeline.jobs;

    // today rolls back to yesterday
    let summaries = jobs.generate_daily_balance(date!(2024-02-05)).await.unwrap();
    assert_eq!(summaries[0].start, date!(2024-02-04));

    // the daily job only ever wrote 2024-02-04, whose opening has no prior row
    let row = h.store.get_balance(CASH, date!(2024-02-04)).unwrap().unwrap();
    assert_eq!(row.opening_balance, Decimal::ZERO);

    // regenerating January in order fixes the chain
    generate_january(&h).await;
    jobs.generate_daily_balance(date!(2024-02-04)).await.unwrap();
    let row = h.store.get_balance(CASH, date!(2024-02-04)).unwrap().unwrap();
    assert_eq!(row.opening_balance, dec!(1260000));

    let err = jobs
        .generate_range(date!(2024-01-10), Some(date!(2024-01-05)))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRange { .. }));
}

macro_rules! on_every_backend {
    ($($scenario:ident),* $(,)?) => {
        mod memory_backend {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(super::memory()).await;
                }
            )*
        }

        mod sqlite_backend {
            $(
                #[tokio::test]
                async fn $scenario() {
                    super::$scenario(super::sqlite()).await;
                }
            )*
        }
    };
}

on_every_backend!(
    generated_range_reconciles,
    trial_balance_tree_totals,
    guest_view_hides_excluded_sub_categories,
    daily_balances_paginate,
    close_freezes_the_month,
    close_rejects_unfinished_months,
    daily_job_rechains_after_backfill,
);

#[tokio::test]
async fn test_sqlite_file_and_fs_exports_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ledger.db");
    let export_dir = dir.path().join("exports");
    let clock = Arc::new(FixedClock::new(datetime!(2024-02-05 9:00 +07:00)));

    let closed = {
        let store = Arc::new(SqliteStorage::new(db_path.to_str().unwrap()).unwrap());
        seed_chart(store.as_ref());
        let pipeline = Pipeline::new(
            store,
            Arc::new(InMemoryCache::new()),
            Arc::new(FsExportStore::new(export_dir.clone())),
            clock.clone(),
            PipelineSettings::default(),
        );
        pipeline.jobs.generate_range(date!(2024-01-01), None).await.unwrap();
        pipeline.jobs.close_trial_balance(january(), "001", "alice").unwrap()
    };
    let file_path = closed.file_path.clone().unwrap();
    assert!(export_dir.join(&file_path).exists());

    let store = Arc::new(SqliteStorage::new(db_path.to_str().unwrap()).unwrap());
    let pipeline = Pipeline::new(
        store,
        Arc::new(InMemoryCache::new()),
        Arc::new(FsExportStore::new(export_dir)),
        clock,
        PipelineSettings::default(),
    );
    let tree = pipeline.reports.trial_balance("001", whole_january(), false).unwrap();
    assert_eq!(tree.coa_total(CoaType::Asset).closing, dec!(1260000));
    assert_eq!(
        pipeline.jobs.close_trial_balance(january(), "001", "bob").unwrap(),
        closed
    );
}
