use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, RwLock},
};

use ledgerview_core::{
    models::{
        Account, AccountBalanceDaily, Category, EntrySide, JournalMovement, PeriodKey, PeriodStatus,
        SubCategory, TrialBalancePeriod,
    },
    pagination::KeysetWindow,
    storage::{
        BalanceFilter, BalanceStore, ClaimOutcome, CloseOutcome, MovementStore, PeriodCursor, PeriodFilter,
        PeriodStore, ReferenceStore, StorageError,
    },
};
use rust_decimal::Decimal;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

#[derive(Clone)]
struct EntityData {
    ledgers: BTreeMap<Arc<str>, AccountLedger>,
}

impl EntityData {
    fn new() -> Self {
        Self {
            ledgers: BTreeMap::new(),
        }
    }
}

#[derive(Clone)]
struct AccountLedger {
    account: Account,
    days: BTreeMap<Date, Vec<JournalMovement>>,
    balances: BTreeMap<Date, AccountBalanceDaily>,
}

impl AccountLedger {
    fn new(account: Account) -> Self {
        Self {
            account,
            days: BTreeMap::new(),
            balances: BTreeMap::new(),
        }
    }
}

pub struct InMemoryStorage {
    entities: RwLock<BTreeMap<Arc<str>, EntityData>>,
    account_index: RwLock<HashMap<Arc<str>, Arc<str>>>,
    categories: RwLock<BTreeMap<Arc<str>, Category>>,
    sub_categories: RwLock<BTreeMap<Arc<str>, SubCategory>>,
    periods: RwLock<BTreeMap<PeriodKey, TrialBalancePeriod>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            account_index: RwLock::new(HashMap::new()),
            categories: RwLock::new(BTreeMap::new()),
            sub_categories: RwLock::new(BTreeMap::new()),
            periods: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_category(&self, category: Category) {
        self.categories.write().unwrap().insert(category.code.clone(), category);
    }

    pub fn add_sub_category(&self, sub_category: SubCategory) {
        self.sub_categories
            .write()
            .unwrap()
            .insert(sub_category.code.clone(), sub_category);
    }

    /// Registers an account, creating its entity on first use.
    pub fn add_account(&self, account: Account) {
        let mut entities = self.entities.write().unwrap();
        let entity = entities
            .entry(account.entity_code.clone())
            .or_insert_with(EntityData::new);
        self.account_index
            .write()
            .unwrap()
            .insert(account.account_number.clone(), account.entity_code.clone());
        match entity.ledgers.get_mut(&account.account_number) {
            Some(ledger) => ledger.account = account,
            None => {
                entity
                    .ledgers
                    .insert(account.account_number.clone(), AccountLedger::new(account));
            }
        }
    }

    /// Records a posted movement. Stands in for the upstream ledger.
    pub fn record_movement(
        &self,
        account_number: &str,
        movement_date: Date,
        side: EntrySide,
        amount: Decimal,
    ) -> Result<u128, StorageError> {
        let entity_code = self.entity_of(account_number)?;
        let mut entities = self.entities.write().unwrap();
        let ledger = entities
            .get_mut(&entity_code)
            .and_then(|e| e.ledgers.get_mut(account_number))
            .ok_or_else(|| StorageError::AccountNotFound(account_number.to_string()))?;

        let id = Uuid::new_v4().as_u128();
        ledger.days.entry(movement_date).or_default().push(JournalMovement {
            id,
            entity_code: entity_code.clone(),
            account_number: ledger.account.account_number.clone(),
            movement_date,
            side,
            amount,
            posted_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    fn entity_of(&self, account_number: &str) -> Result<Arc<str>, StorageError> {
        self.account_index
            .read()
            .unwrap()
            .get(account_number)
            .cloned()
            .ok_or_else(|| StorageError::AccountNotFound(account_number.to_string()))
    }

    fn with_ledger<T>(&self, account_number: &str, f: impl FnOnce(&AccountLedger) -> T) -> Result<T, StorageError> {
        let entity_code = self.entity_of(account_number)?;
        let entities = self.entities.read().unwrap();
        let ledger = entities
            .get(&entity_code)
            .and_then(|e| e.ledgers.get(account_number))
            .ok_or_else(|| StorageError::AccountNotFound(account_number.to_string()))?;
        Ok(f(ledger))
    }
}

impl ReferenceStore for InMemoryStorage {
    fn list_entities(&self) -> Result<Vec<Arc<str>>, StorageError> {
        Ok(self.entities.read().unwrap().keys().cloned().collect())
    }

    fn list_accounts(&self, entity_code: &str) -> Result<Vec<Account>, StorageError> {
        let entities = self.entities.read().unwrap();
        Ok(match entities.get(entity_code) {
            Some(entity) => entity.ledgers.values().map(|l| l.account.clone()).collect(),
            None => Vec::new(),
        })
    }

    fn get_account(&self, account_number: &str) -> Result<Account, StorageError> {
        self.with_ledger(account_number, |l| l.account.clone())
    }

    fn list_categories(&self) -> Result<Vec<Category>, StorageError> {
        Ok(self.categories.read().unwrap().values().cloned().collect())
    }

    fn list_sub_categories(&self) -> Result<Vec<SubCategory>, StorageError> {
        Ok(self.sub_categories.read().unwrap().values().cloned().collect())
    }
}

impl MovementStore for InMemoryStorage {
    fn movements_on(&self, account_number: &str, date: Date) -> Result<Vec<JournalMovement>, StorageError> {
        self.with_ledger(account_number, |l| l.days.get(&date).cloned().unwrap_or_default())
    }
}

impl BalanceStore for InMemoryStorage {
    fn latest_before(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError> {
        self.with_ledger(account_number, |l| {
            l.balances
                .range((Bound::Unbounded, Bound::Excluded(date)))
                .next_back()
                .map(|(_, row)| row.clone())
        })
    }

    fn get_balance(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError> {
        self.with_ledger(account_number, |l| l.balances.get(&date).cloned())
    }

    fn upsert_day(&self, entity_code: &str, date: Date, rows: &[AccountBalanceDaily]) -> Result<(), StorageError> {
        let mut entities = self.entities.write().unwrap();
        let entity = entities
            .get_mut(entity_code)
            .ok_or_else(|| StorageError::Other(format!("unknown entity: {}", entity_code)))?;

        // Validate every row before touching any ledger so the day lands whole or not at all.
        for row in rows {
            if row.balance_date != date || !entity.ledgers.contains_key(&row.account_number) {
                return Err(StorageError::AccountNotFound(row.account_number.to_string()));
            }
        }

        for row in rows {
            if let Some(ledger) = entity.ledgers.get_mut(&row.account_number) {
                let mut row = row.clone();
                if let Some(existing) = ledger.balances.get(&date) {
                    row.created_at = existing.created_at;
                }
                ledger.balances.insert(date, row);
            }
        }
        tracing::debug!(entity = entity_code, %date, rows = rows.len(), "Daily balances upserted");
        Ok(())
    }

    fn balances_between(&self, entity_code: &str, from: Date, to: Date) -> Result<Vec<AccountBalanceDaily>, StorageError> {
        let entities = self.entities.read().unwrap();
        let mut result = Vec::new();
        if let Some(entity) = entities.get(entity_code) {
            for ledger in entity.ledgers.values() {
                result.extend(
                    ledger
                        .balances
                        .range((Bound::Included(from), Bound::Included(to)))
                        .map(|(_, row)| row.clone()),
                );
            }
        }
        Ok(result)
    }

    fn list_balances(
        &self,
        filter: &BalanceFilter,
        window: &KeysetWindow<String>,
    ) -> Result<Vec<AccountBalanceDaily>, StorageError> {
        let entities = self.entities.read().unwrap();
        let entity = match entities.get(filter.entity_code.as_str()) {
            Some(entity) => entity,
            None => return Ok(Vec::new()),
        };

        let matching = entity.ledgers.values().filter(|l| {
            filter.matches(&l.account) && window.admits(&l.account.account_number.to_string())
        });
        let rows = matching.filter_map(|l| l.balances.get(&filter.balance_date).cloned());

        Ok(if window.is_descending() {
            rows.rev().take(window.fetch_size()).collect()
        } else {
            rows.take(window.fetch_size()).collect()
        })
    }
}

impl PeriodStore for InMemoryStorage {
    fn get_period(&self, key: &PeriodKey) -> Result<Option<TrialBalancePeriod>, StorageError> {
        Ok(self.periods.read().unwrap().get(key).cloned())
    }

    fn ensure_open(&self, key: &PeriodKey, now: OffsetDateTime) -> Result<TrialBalancePeriod, StorageError> {
        let mut periods = self.periods.write().unwrap();
        let record = periods
            .entry(key.clone())
            .or_insert_with(|| TrialBalancePeriod::open(key.clone(), now));
        Ok(record.clone())
    }

    fn claim_close(
        &self,
        key: &PeriodKey,
        claim: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut periods = self.periods.write().unwrap();
        let record = periods
            .entry(key.clone())
            .or_insert_with(|| TrialBalancePeriod::open(key.clone(), now));

        match record.status {
            PeriodStatus::Closed => return Ok(ClaimOutcome::AlreadyClosed(record.clone())),
            PeriodStatus::Closing if record.updated_at >= stale_before => {
                return Ok(ClaimOutcome::Busy(record.clone()))
            }
            PeriodStatus::Closing | PeriodStatus::Open => {}
        }

        record.status = PeriodStatus::Closing;
        record.close_claim = Some(claim.to_string());
        record.updated_at = now;
        Ok(ClaimOutcome::Claimed(record.clone()))
    }

    fn mark_closed(
        &self,
        key: &PeriodKey,
        claim: &str,
        file_path: &str,
        closed_by: &str,
        now: OffsetDateTime,
    ) -> Result<CloseOutcome, StorageError> {
        let mut periods = self.periods.write().unwrap();
        let record = match periods.get_mut(key) {
            Some(record) if record.status == PeriodStatus::Closed => {
                return Ok(CloseOutcome::AlreadyClosed(record.clone()))
            }
            Some(record) if record.status == PeriodStatus::Closing && record.close_claim.as_deref() == Some(claim) => {
                record
            }
            _ => return Err(StorageError::ClaimLost(key.to_string())),
        };

        record.status = PeriodStatus::Closed;
        record.close_claim = None;
        record.file_path = Some(file_path.to_string());
        record.closed_by = Some(closed_by.to_string());
        record.closed_at = Some(now);
        record.updated_at = now;
        Ok(CloseOutcome::Closed(record.clone()))
    }

    fn release_claim(&self, key: &PeriodKey, claim: &str, now: OffsetDateTime) -> Result<(), StorageError> {
        let mut periods = self.periods.write().unwrap();
        if let Some(record) = periods
            .get_mut(key)
            .filter(|r| r.status == PeriodStatus::Closing && r.close_claim.as_deref() == Some(claim))
        {
            record.status = PeriodStatus::Open;
            record.close_claim = None;
            record.updated_at = now;
        }
        Ok(())
    }

    fn list_periods(
        &self,
        filter: &PeriodFilter,
        window: &KeysetWindow<PeriodCursor>,
    ) -> Result<Vec<TrialBalancePeriod>, StorageError> {
        let periods = self.periods.read().unwrap();
        let mut rows: Vec<(PeriodCursor, TrialBalancePeriod)> = periods
            .values()
            .filter(|p| filter.matches(p))
            .map(|p| (PeriodCursor::of(p), p.clone()))
            .filter(|(cursor, _)| window.admits(cursor))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        if window.is_descending() {
            rows.reverse();
        }
        Ok(rows.into_iter().take(window.fetch_size()).map(|(_, p)| p).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerview_core::models::{CoaType, ReportingPeriod};
    use rust_decimal_macros::dec;
    use time::macros::{date, datetime};

    fn seeded() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        let category = Category {
            code: Arc::from("111"),
            name: Arc::from("Cash"),
            coa_type: CoaType::Asset,
        };
        storage.add_category(category.clone());
        for number in ["11101000000001", "11101000000002"] {
            storage.add_account(Account::new(number, "001", &category, "11101", "IDR", datetime!(2024-01-01 0:00 UTC)));
        }
        storage
    }

    fn row(account: &str, date: Date, closing: Decimal, at: OffsetDateTime) -> AccountBalanceDaily {
        AccountBalanceDaily {
            account_number: Arc::from(account),
            entity_code: Arc::from("001"),
            balance_date: date,
            opening_balance: Decimal::ZERO,
            debit_movement: closing,
            credit_movement: Decimal::ZERO,
            closing_balance: closing,
            normal_balance: ledgerview_core::models::NormalBalance::Debit,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_record_movement_requires_account() {
        let storage = seeded();
        assert!(storage
            .record_movement("11101000000001", date!(2024-01-15), EntrySide::Debit, dec!(10))
            .is_ok());
        assert!(matches!(
            storage.record_movement("nope", date!(2024-01-15), EntrySide::Debit, dec!(10)),
            Err(StorageError::AccountNotFound(_))
        ));
        assert_eq!(storage.movements_on("11101000000001", date!(2024-01-15)).unwrap().len(), 1);
        assert!(storage.movements_on("11101000000001", date!(2024-01-16)).unwrap().is_empty());
    }

    #[test]
    fn test_upsert_day_is_all_or_nothing_and_keeps_created_at() {
        let storage = seeded();
        let day = date!(2024-01-15);
        let first = datetime!(2024-01-16 1:00 UTC);
        storage
            .upsert_day("001", day, &[row("11101000000001", day, dec!(5), first)])
            .unwrap();

        let bad = [
            row("11101000000001", day, dec!(7), datetime!(2024-01-17 1:00 UTC)),
            row("99999", day, dec!(1), first),
        ];
        assert!(storage.upsert_day("001", day, &bad).is_err());
        assert_eq!(storage.get_balance("11101000000001", day).unwrap().unwrap().closing_balance, dec!(5));

        let later = datetime!(2024-01-17 1:00 UTC);
        storage
            .upsert_day("001", day, &[row("11101000000001", day, dec!(7), later)])
            .unwrap();
        let stored = storage.get_balance("11101000000001", day).unwrap().unwrap();
        assert_eq!(stored.closing_balance, dec!(7));
        assert_eq!(stored.created_at, first);
        assert_eq!(stored.updated_at, later);
    }

    #[test]
    fn test_latest_before_is_strict() {
        let storage = seeded();
        let at = datetime!(2024-01-20 0:00 UTC);
        for (d, c) in [(date!(2024-01-10), dec!(1)), (date!(2024-01-12), dec!(2))] {
            storage.upsert_day("001", d, &[row("11101000000001", d, c, at)]).unwrap();
        }
        let prior = storage.latest_before("11101000000001", date!(2024-01-12)).unwrap().unwrap();
        assert_eq!(prior.balance_date, date!(2024-01-10));
        assert!(storage.latest_before("11101000000001", date!(2024-01-10)).unwrap().is_none());
    }

    #[test]
    fn test_only_the_claim_holder_closes() {
        let storage = seeded();
        let key = PeriodKey::regular("2024-01".parse::<ReportingPeriod>().unwrap(), "001");
        let now = datetime!(2024-02-01 0:00 UTC);
        let stale_before = now - time::Duration::minutes(5);
        let open = storage.ensure_open(&key, now).unwrap();
        assert_eq!(open.status, PeriodStatus::Open);

        let claimed = storage.claim_close(&key, "a", now, stale_before).unwrap();
        assert!(matches!(claimed, ClaimOutcome::Claimed(ref p) if p.status == PeriodStatus::Closing));
        assert!(matches!(
            storage.claim_close(&key, "b", now, stale_before).unwrap(),
            ClaimOutcome::Busy(_)
        ));
        assert!(matches!(
            storage.mark_closed(&key, "b", "b.json", "bob", now),
            Err(StorageError::ClaimLost(_))
        ));

        let first = storage.mark_closed(&key, "a", "a.json", "alice", now).unwrap();
        assert!(matches!(first, CloseOutcome::Closed(ref p) if p.close_claim.is_none()));
        match storage.mark_closed(&key, "b", "b.json", "bob", now).unwrap() {
            CloseOutcome::AlreadyClosed(p) => {
                assert_eq!(p.file_path.as_deref(), Some("a.json"));
                assert_eq!(p.closed_by.as_deref(), Some("alice"));
            }
            other => panic!("expected AlreadyClosed, got {:?}", other),
        }
        assert!(matches!(
            storage.claim_close(&key, "c", now, stale_before).unwrap(),
            ClaimOutcome::AlreadyClosed(_)
        ));
    }

    #[test]
    fn test_released_or_stale_claim_can_be_retaken() {
        let storage = seeded();
        let key = PeriodKey::regular("2024-01".parse::<ReportingPeriod>().unwrap(), "001");
        let t0 = datetime!(2024-02-01 0:00 UTC);

        storage.claim_close(&key, "a", t0, t0).unwrap();
        storage.release_claim(&key, "someone-else", t0).unwrap();
        assert_eq!(storage.get_period(&key).unwrap().unwrap().status, PeriodStatus::Closing);
        storage.release_claim(&key, "a", t0).unwrap();
        assert_eq!(storage.get_period(&key).unwrap().unwrap().status, PeriodStatus::Open);

        storage.claim_close(&key, "b", t0, t0).unwrap();
        let later = t0 + time::Duration::minutes(10);
        let retaken = storage.claim_close(&key, "c", later, later - time::Duration::minutes(5)).unwrap();
        assert!(matches!(retaken, ClaimOutcome::Claimed(ref p) if p.close_claim.as_deref() == Some("c")));
        assert!(matches!(
            storage.mark_closed(&key, "b", "b.json", "bob", later),
            Err(StorageError::ClaimLost(_))
        ));
    }

    #[test]
    fn test_period_list_breaks_timestamp_ties_by_key() {
        let storage = seeded();
        let at = datetime!(2024-02-01 0:00 UTC);
        for month in ["2024-01", "2024-02", "2024-03"] {
            storage
                .ensure_open(&PeriodKey::regular(month.parse().unwrap(), "001"), at)
                .unwrap();
        }

        let first = storage
            .list_periods(&PeriodFilter::default(), &KeysetWindow::first_page(1))
            .unwrap();
        assert_eq!(first.len(), 2);
        let window = KeysetWindow {
            after: Some(PeriodCursor::of(&first[0])),
            before: None,
            direction: ledgerview_core::pagination::Direction::Forward,
            limit: 2,
        };
        let rest = storage.list_periods(&PeriodFilter::default(), &window).unwrap();
        let months: Vec<String> = rest.iter().map(|p| p.key.period.to_string()).collect();
        assert_eq!(months, vec!["2024-02", "2024-03"]);
    }
}
