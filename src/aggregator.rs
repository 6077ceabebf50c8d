use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use ledgerview_core::{
    models::{
        report::{
            AccountLeaf, BalanceScope, CategoryNode, CoaTypeNode, SubCategoryNode, Totals, TrialBalanceTree,
            UnmappedBucket,
        },
        Account, AccountBalanceDaily, Category, CoaType, NormalBalance, SubCategory,
    },
    storage::LedgerStore,
};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{cache::CacheAside, clock::Clock, error::PipelineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub entity_code: String,
    pub scope: BalanceScope,
    /// Sub-category codes removed before any total is computed.
    pub excluded_sub_categories: BTreeSet<String>,
}

impl AggregateRequest {
    pub fn day(entity_code: &str, date: Date) -> Self {
        Self {
            entity_code: entity_code.to_string(),
            scope: BalanceScope::Day { date },
            excluded_sub_categories: BTreeSet::new(),
        }
    }

    pub fn range(entity_code: &str, from: Date, to: Date) -> Self {
        Self {
            entity_code: entity_code.to_string(),
            scope: BalanceScope::Range { from, to },
            excluded_sub_categories: BTreeSet::new(),
        }
    }

    pub fn with_scope(entity_code: &str, scope: BalanceScope) -> Self {
        Self {
            entity_code: entity_code.to_string(),
            scope,
            excluded_sub_categories: BTreeSet::new(),
        }
    }

    pub fn excluding<I, S>(mut self, sub_categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_sub_categories.extend(sub_categories.into_iter().map(Into::into));
        self
    }

    /// `tb:{entity}:{scope}:{exclusions}`. Every key of an entity shares the `tb:{entity}:` prefix.
    pub fn cache_key(&self) -> String {
        let exclusions = if self.excluded_sub_categories.is_empty() {
            "none".to_string()
        } else {
            self.excluded_sub_categories
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
        };
        format!("tb:{}:{}:{}", self.entity_code, self.scope, exclusions)
    }
}

/// Per-account totals over a scope: earliest opening, latest closing, summed movements.
///
/// Each account's totals must fold from opening to closing under its normal
/// balance; a broken daily chain inside the scope fails the whole fold.
fn fold_rows(rows: Vec<AccountBalanceDaily>) -> Result<BTreeMap<Arc<str>, Totals>, PipelineError> {
    let mut spans: BTreeMap<Arc<str>, (Date, Date, NormalBalance, Totals)> = BTreeMap::new();
    for row in rows {
        let entry = spans.entry(row.account_number.clone()).or_insert((
            row.balance_date,
            row.balance_date,
            row.normal_balance,
            Totals {
                opening: row.opening_balance,
                closing: row.closing_balance,
                ..Totals::default()
            },
        ));
        let (first, last, normal, totals) = entry;
        if row.balance_date < *first {
            *first = row.balance_date;
            totals.opening = row.opening_balance;
        }
        if row.balance_date > *last {
            *last = row.balance_date;
            *normal = row.normal_balance;
            totals.closing = row.closing_balance;
        }
        totals.debit += row.debit_movement;
        totals.credit += row.credit_movement;
    }

    spans
        .into_iter()
        .map(|(account, (first, last, normal, totals))| {
            if normal.fold(totals.opening, totals.debit, totals.credit) != totals.closing {
                return Err(PipelineError::InvariantViolation(format!(
                    "balances of {} from {} to {} do not chain: opening {} debit {} credit {} closing {}",
                    account, first, last, totals.opening, totals.debit, totals.credit, totals.closing
                )));
            }
            Ok((account, totals))
        })
        .collect()
}

/// Rolls daily balances up the COA type, category and sub-category hierarchy.
pub struct TrialBalanceAggregator {
    store: Arc<dyn LedgerStore>,
    cache: Arc<CacheAside>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl TrialBalanceAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, cache: Arc<CacheAside>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            store,
            cache,
            clock,
            ttl,
        }
    }

    pub fn aggregate(&self, request: &AggregateRequest) -> Result<TrialBalanceTree, PipelineError> {
        let (from, to) = (request.scope.first_date(), request.scope.last_date());
        if from > to {
            return Err(PipelineError::InvalidRange { start: from, end: to });
        }

        let accounts: HashMap<Arc<str>, Account> = self
            .store
            .list_accounts(&request.entity_code)?
            .into_iter()
            .map(|a| (a.account_number.clone(), a))
            .collect();
        let categories: HashMap<Arc<str>, Category> = self
            .store
            .list_categories()?
            .into_iter()
            .map(|c| (c.code.clone(), c))
            .collect();
        let sub_categories: HashMap<Arc<str>, SubCategory> = self
            .store
            .list_sub_categories()?
            .into_iter()
            .map(|s| (s.code.clone(), s))
            .collect();

        let rows = self.store.balances_between(&request.entity_code, from, to)?;

        let mut mapped: BTreeMap<CoaType, BTreeMap<Arc<str>, BTreeMap<Arc<str>, Vec<AccountLeaf>>>> =
            BTreeMap::new();
        let mut unmapped = UnmappedBucket::default();

        for (account_number, totals) in fold_rows(rows)? {
            let sub_category_code: Arc<str> = accounts
                .get(&account_number)
                .map(|a| a.sub_category_code.clone())
                .unwrap_or_else(|| Arc::from(""));
            if request.excluded_sub_categories.contains(sub_category_code.as_ref()) {
                continue;
            }

            let leaf = AccountLeaf {
                account_number,
                sub_category_code: sub_category_code.clone(),
                totals,
            };
            let category = sub_categories
                .get(&sub_category_code)
                .and_then(|s| categories.get(&s.category_code));
            match category {
                Some(category) => mapped
                    .entry(category.coa_type)
                    .or_default()
                    .entry(category.code.clone())
                    .or_default()
                    .entry(sub_category_code)
                    .or_default()
                    .push(leaf),
                None => unmapped.accounts.push(leaf),
            }
        }

        let coa_types = mapped
            .into_iter()
            .map(|(coa_type, by_category)| CoaTypeNode {
                coa_type,
                totals: Totals::default(),
                categories: by_category
                    .into_iter()
                    .map(|(code, by_sub)| CategoryNode {
                        name: categories.get(&code).map(|c| c.name.clone()).unwrap_or_else(|| code.clone()),
                        code,
                        totals: Totals::default(),
                        sub_categories: by_sub
                            .into_iter()
                            .map(|(code, accounts)| SubCategoryNode {
                                name: sub_categories
                                    .get(&code)
                                    .map(|s| s.name.clone())
                                    .unwrap_or_else(|| code.clone()),
                                code,
                                totals: Totals::default(),
                                accounts,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let mut tree = TrialBalanceTree {
            entity_code: Arc::from(request.entity_code.as_str()),
            scope: request.scope,
            excluded_sub_categories: request.excluded_sub_categories.iter().cloned().collect(),
            coa_types,
            unmapped,
            grand_total: Totals::default(),
            generated_at: self.clock.now(),
        };
        tree.recompute_totals();
        tree.verify().map_err(PipelineError::InvariantViolation)?;

        tracing::debug!(
            entity = %request.entity_code,
            scope = %request.scope,
            accounts = tree.leaves().count(),
            unmapped = tree.unmapped.accounts.len(),
            "Trial balance aggregated"
        );
        Ok(tree)
    }

    pub fn aggregate_cached(&self, request: &AggregateRequest) -> Result<TrialBalanceTree, PipelineError> {
        self.cache
            .get_or_set(&request.cache_key(), self.ttl, || self.aggregate(request))
    }
}
