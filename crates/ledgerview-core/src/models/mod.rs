use std::{collections::BTreeMap, fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

pub mod report;

/// Top-level chart-of-accounts classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoaType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl CoaType {
    pub const ALL: [CoaType; 5] = [
        CoaType::Asset,
        CoaType::Liability,
        CoaType::Equity,
        CoaType::Income,
        CoaType::Expense,
    ];

    /// Assets and expenses increase on debit, everything else on credit.
    pub fn normal_balance(&self) -> NormalBalance {
        match self {
            CoaType::Asset | CoaType::Expense => NormalBalance::Debit,
            CoaType::Liability | CoaType::Equity | CoaType::Income => NormalBalance::Credit,
        }
    }

    pub fn is_balance_sheet(&self) -> bool {
        matches!(self, CoaType::Asset | CoaType::Liability | CoaType::Equity)
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoaType::Asset => "ASSET",
            CoaType::Liability => "LIABILITY",
            CoaType::Equity => "EQUITY",
            CoaType::Income => "INCOME",
            CoaType::Expense => "EXPENSE",
        }
    }
}

impl FromStr for CoaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ASSET" => Ok(CoaType::Asset),
            "LIABILITY" => Ok(CoaType::Liability),
            "EQUITY" => Ok(CoaType::Equity),
            "INCOME" => Ok(CoaType::Income),
            "EXPENSE" => Ok(CoaType::Expense),
            other => Err(format!("unknown COA type: {}", other)),
        }
    }
}

impl Display for CoaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalBalance {
    Debit,
    Credit,
}

impl NormalBalance {
    /// Applies one day of movements to an opening balance.
    pub fn fold(&self, opening: Decimal, debit: Decimal, credit: Decimal) -> Decimal {
        match self {
            NormalBalance::Debit => opening + debit - credit,
            NormalBalance::Credit => opening + credit - debit,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            NormalBalance::Debit => "DEBIT",
            NormalBalance::Credit => "CREDIT",
        }
    }
}

impl FromStr for NormalBalance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(NormalBalance::Debit),
            "CREDIT" => Ok(NormalBalance::Credit),
            other => Err(format!("unknown normal balance: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntrySide {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub code: Arc<str>,
    pub name: Arc<str>,
    pub coa_type: CoaType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubCategory {
    pub code: Arc<str>,
    pub name: Arc<str>,
    pub category_code: Arc<str>,
}

/// Reference data owned by the account-management subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub account_number: Arc<str>,
    pub entity_code: Arc<str>,
    pub category_code: Arc<str>,
    pub sub_category_code: Arc<str>,
    pub currency: Arc<str>,
    pub status: AccountStatus,
    /// Resolved once when the account is created; never re-derived.
    pub normal_balance: NormalBalance,
    pub legacy_id: Option<String>,
    pub alt_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: OffsetDateTime,
}

impl Account {
    /// Builds an active account whose normal balance follows its category's COA type.
    pub fn new(
        account_number: &str,
        entity_code: &str,
        category: &Category,
        sub_category_code: &str,
        currency: &str,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            account_number: Arc::from(account_number),
            entity_code: Arc::from(entity_code),
            category_code: category.code.clone(),
            sub_category_code: Arc::from(sub_category_code),
            currency: Arc::from(currency),
            status: AccountStatus::Active,
            normal_balance: category.coa_type.normal_balance(),
            legacy_id: None,
            alt_id: None,
            metadata: BTreeMap::new(),
            created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// An immutable posted movement against one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalMovement {
    pub id: u128,
    pub entity_code: Arc<str>,
    pub account_number: Arc<str>,
    pub movement_date: Date,
    pub side: EntrySide,
    pub amount: Decimal,
    pub posted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalanceDaily {
    pub account_number: Arc<str>,
    pub entity_code: Arc<str>,
    pub balance_date: Date,
    pub opening_balance: Decimal,
    pub debit_movement: Decimal,
    pub credit_movement: Decimal,
    pub closing_balance: Decimal,
    pub normal_balance: NormalBalance,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl AccountBalanceDaily {
    pub fn reconciles(&self) -> bool {
        self.normal_balance
            .fold(self.opening_balance, self.debit_movement, self.credit_movement)
            == self.closing_balance
    }
}

/// A calendar month, written as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportingPeriod {
    year: i32,
    month: Month,
}

impl ReportingPeriod {
    pub fn new(year: i32, month: Month) -> Self {
        Self { year, month }
    }

    pub fn containing(date: Date) -> Self {
        Self::new(date.year(), date.month())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> Month {
        self.month
    }

    pub fn first_day(&self) -> Date {
        // Day 1 exists in every month.
        Date::from_calendar_date(self.year, self.month, 1).unwrap_or(Date::MIN)
    }

    pub fn last_day(&self) -> Date {
        let days = time::util::days_in_year_month(self.year, self.month);
        Date::from_calendar_date(self.year, self.month, days).unwrap_or(Date::MAX)
    }

    pub fn contains(&self, date: Date) -> bool {
        date.year() == self.year && date.month() == self.month
    }
}

impl FromStr for ReportingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid period '{}', expected YYYY-MM", s);
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        let month = Month::try_from(month).map_err(|_| invalid())?;
        Ok(Self::new(year, month))
    }
}

impl Display for ReportingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month as u8)
    }
}

impl TryFrom<String> for ReportingPeriod {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReportingPeriod> for String {
    fn from(value: ReportingPeriod) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodStatus {
    Open,
    /// A closer holds the claim and is writing the export.
    Closing,
    Closed,
}

impl PeriodStatus {
    pub fn code(&self) -> &'static str {
        match self {
            PeriodStatus::Open => "OPEN",
            PeriodStatus::Closing => "CLOSING",
            PeriodStatus::Closed => "CLOSED",
        }
    }
}

impl FromStr for PeriodStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(PeriodStatus::Open),
            "CLOSING" => Ok(PeriodStatus::Closing),
            "CLOSED" => Ok(PeriodStatus::Closed),
            other => Err(format!("unknown period status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeriodKey {
    pub period: ReportingPeriod,
    pub entity_code: Arc<str>,
    pub is_adjustment: bool,
}

impl PeriodKey {
    pub fn regular(period: ReportingPeriod, entity_code: &str) -> Self {
        Self {
            period,
            entity_code: Arc::from(entity_code),
            is_adjustment: false,
        }
    }

    pub fn adjustment(period: ReportingPeriod, entity_code: &str) -> Self {
        Self {
            period,
            entity_code: Arc::from(entity_code),
            is_adjustment: true,
        }
    }
}

impl Display for PeriodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_code, self.period)?;
        if self.is_adjustment {
            f.write_str("/adjustment")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialBalancePeriod {
    pub key: PeriodKey,
    pub status: PeriodStatus,
    pub file_path: Option<String>,
    pub closed_by: Option<String>,
    pub closed_at: Option<OffsetDateTime>,
    /// Token of the closer holding the CLOSING claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_claim: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TrialBalancePeriod {
    pub fn open(key: PeriodKey, now: OffsetDateTime) -> Self {
        Self {
            key,
            status: PeriodStatus::Open,
            file_path: None,
            closed_by: None,
            closed_at: None,
            close_claim: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == PeriodStatus::Closed
    }

    /// No longer accepts regenerated balances: closed, or a close is under way.
    pub fn is_frozen(&self) -> bool {
        self.status != PeriodStatus::Open
    }
}
