use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{Arc, Mutex},
};

use ledgerview_core::{
    cursor::CursorKey,
    models::{
        Account, AccountBalanceDaily, AccountStatus, Category, CoaType, EntrySide, JournalMovement, NormalBalance,
        PeriodKey, PeriodStatus, ReportingPeriod, SubCategory, TrialBalancePeriod,
    },
    pagination::KeysetWindow,
    storage::{
        BalanceFilter, BalanceStore, ClaimOutcome, CloseOutcome, MovementStore, PeriodCursor, PeriodFilter,
        PeriodStore, ReferenceStore, StorageError,
    },
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use time::{Date, Month, OffsetDateTime, UtcOffset};
use uuid::Uuid;

const ACCOUNT_COLUMNS: &str = "account_number, entity_code, category_code, sub_category_code, currency, status, \
     normal_balance, legacy_id, alt_id, metadata, created_at";

const BALANCE_COLUMNS: &str = "b.account_number, b.entity_code, b.balance_date, b.opening_balance, \
     b.debit_movement, b.credit_movement, b.closing_balance, b.normal_balance, b.created_at, b.updated_at";

const PERIOD_COLUMNS: &str =
    "entity_code, period, is_adjustment, status, file_path, closed_by, closed_at, close_claim, created_at, updated_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(sql_err)?;

        let storage = Self { conn: Mutex::new(conn) };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS categories (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                coa_type TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sub_categories (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                category_code TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                account_number TEXT PRIMARY KEY,
                entity_code TEXT NOT NULL,
                category_code TEXT NOT NULL,
                sub_category_code TEXT NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                normal_balance TEXT NOT NULL,
                legacy_id TEXT,
                alt_id TEXT,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS movements (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity_code TEXT NOT NULL,
                account_number TEXT NOT NULL,
                movement_date TEXT NOT NULL,
                side TEXT NOT NULL,
                amount TEXT NOT NULL,
                posted_at TEXT NOT NULL,
                FOREIGN KEY (account_number) REFERENCES accounts(account_number)
            );

            CREATE TABLE IF NOT EXISTS account_balance_daily (
                account_number TEXT NOT NULL,
                balance_date TEXT NOT NULL,
                entity_code TEXT NOT NULL,
                opening_balance TEXT NOT NULL,
                debit_movement TEXT NOT NULL,
                credit_movement TEXT NOT NULL,
                closing_balance TEXT NOT NULL,
                normal_balance TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_number, balance_date),
                FOREIGN KEY (account_number) REFERENCES accounts(account_number)
            );

            CREATE TABLE IF NOT EXISTS trial_balance_periods (
                entity_code TEXT NOT NULL,
                period TEXT NOT NULL,
                is_adjustment INTEGER NOT NULL,
                status TEXT NOT NULL,
                file_path TEXT,
                closed_by TEXT,
                closed_at TEXT,
                close_claim TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_code, period, is_adjustment)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_entity
                ON accounts(entity_code, account_number);

            CREATE INDEX IF NOT EXISTS idx_movements_account_date
                ON movements(account_number, movement_date);

            CREATE INDEX IF NOT EXISTS idx_balances_entity_date
                ON account_balance_daily(entity_code, balance_date);

            CREATE INDEX IF NOT EXISTS idx_periods_created
                ON trial_balance_periods(created_at);
            ",
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_category(&self, category: &Category) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO categories (code, name, coa_type) VALUES (?1, ?2, ?3)",
            params![category.code.as_ref(), category.name.as_ref(), category.coa_type.code()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_sub_category(&self, sub_category: &SubCategory) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO sub_categories (code, name, category_code) VALUES (?1, ?2, ?3)",
            params![
                sub_category.code.as_ref(),
                sub_category.name.as_ref(),
                sub_category.category_code.as_ref()
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn add_account(&self, account: &Account) -> Result<(), StorageError> {
        let metadata = serde_json::to_string(&account.metadata).map_err(|e| StorageError::Other(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (account_number, entity_code, category_code, sub_category_code, currency, status,
                                   normal_balance, legacy_id, alt_id, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(account_number) DO UPDATE SET
                entity_code = excluded.entity_code,
                category_code = excluded.category_code,
                sub_category_code = excluded.sub_category_code,
                currency = excluded.currency,
                status = excluded.status,
                normal_balance = excluded.normal_balance,
                legacy_id = excluded.legacy_id,
                alt_id = excluded.alt_id,
                metadata = excluded.metadata",
            params![
                account.account_number.as_ref(),
                account.entity_code.as_ref(),
                account.category_code.as_ref(),
                account.sub_category_code.as_ref(),
                account.currency.as_ref(),
                status_to_str(account.status),
                account.normal_balance.code(),
                account.legacy_id,
                account.alt_id,
                metadata,
                ts_to_str(account.created_at)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Records a posted movement. Stands in for the upstream ledger.
    pub fn record_movement(
        &self,
        account_number: &str,
        movement_date: Date,
        side: EntrySide,
        amount: Decimal,
    ) -> Result<u128, StorageError> {
        let conn = self.conn.lock().unwrap();
        let entity_code = Self::entity_of(&conn, account_number)?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO movements (id, entity_code, account_number, movement_date, side, amount, posted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                entity_code,
                account_number,
                date_to_str(movement_date),
                side_to_str(side),
                amount.to_string(),
                ts_to_str(OffsetDateTime::now_utc())?,
            ],
        )
        .map_err(sql_err)?;
        Ok(id.as_u128())
    }

    fn entity_of(conn: &Connection, account_number: &str) -> Result<String, StorageError> {
        conn.query_row(
            "SELECT entity_code FROM accounts WHERE account_number = ?1",
            params![account_number],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StorageError::AccountNotFound(account_number.to_string()))
    }

    fn read_period(conn: &Connection, key: &PeriodKey) -> Result<Option<TrialBalancePeriod>, StorageError> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM trial_balance_periods
                     WHERE entity_code = ?1 AND period = ?2 AND is_adjustment = ?3",
                    PERIOD_COLUMNS
                ),
                params![key.entity_code.as_ref(), key.period.to_string(), key.is_adjustment],
                read_period_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawPeriod::into_model).transpose()
    }

    fn insert_open(conn: &Connection, key: &PeriodKey, now: OffsetDateTime) -> Result<(), StorageError> {
        let now = ts_to_str(now)?;
        conn.execute(
            "INSERT OR IGNORE INTO trial_balance_periods
                (entity_code, period, is_adjustment, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'OPEN', ?4, ?4)",
            params![key.entity_code.as_ref(), key.period.to_string(), key.is_adjustment, now],
        )
        .map_err(sql_err)?;
        Ok(())
    }
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(ref failure, _) if failure.code == rusqlite::ErrorCode::ConstraintViolation => {
            StorageError::Constraint(e.to_string())
        }
        other => StorageError::Other(other.to_string()),
    }
}

fn date_to_str(d: Date) -> String {
    format!("{:04}-{:02}-{:02}", d.year(), d.month() as u8, d.day())
}

fn str_to_date(s: &str) -> Result<Date, StorageError> {
    let corrupt = || StorageError::Corrupt(format!("invalid date '{}'", s));
    let mut parts = s.splitn(3, '-');
    let mut next = || parts.next().ok_or_else(corrupt);
    let year = next()?.parse::<i32>().map_err(|_| corrupt())?;
    let month = next()?.parse::<u8>().map_err(|_| corrupt())?;
    let day = next()?.parse::<u8>().map_err(|_| corrupt())?;
    let month = Month::try_from(month).map_err(|_| corrupt())?;
    Date::from_calendar_date(year, month, day).map_err(|_| corrupt())
}

/// Timestamps are stored in UTC so that text order is time order.
fn ts_to_str(ts: OffsetDateTime) -> Result<String, StorageError> {
    ts.to_offset(UtcOffset::UTC)
        .to_cursor_text()
        .map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn str_to_ts(s: &str) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_cursor_text(s).map_err(|e| StorageError::Corrupt(e.to_string()))
}

fn str_to_decimal(s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|e| StorageError::Corrupt(format!("invalid decimal '{}': {}", s, e)))
}

fn parse_code<T: FromStr<Err = String>>(s: &str) -> Result<T, StorageError> {
    s.parse().map_err(StorageError::Corrupt)
}

fn status_to_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "ACTIVE",
        AccountStatus::Inactive => "INACTIVE",
    }
}

fn str_to_status(s: &str) -> Result<AccountStatus, StorageError> {
    match s {
        "ACTIVE" => Ok(AccountStatus::Active),
        "INACTIVE" => Ok(AccountStatus::Inactive),
        other => Err(StorageError::Corrupt(format!("unknown account status: {}", other))),
    }
}

fn side_to_str(side: EntrySide) -> &'static str {
    match side {
        EntrySide::Debit => "DEBIT",
        EntrySide::Credit => "CREDIT",
    }
}

fn str_to_side(s: &str) -> Result<EntrySide, StorageError> {
    match s {
        "DEBIT" => Ok(EntrySide::Debit),
        "CREDIT" => Ok(EntrySide::Credit),
        other => Err(StorageError::Corrupt(format!("unknown entry side: {}", other))),
    }
}

struct RawAccount {
    account_number: String,
    entity_code: String,
    category_code: String,
    sub_category_code: String,
    currency: String,
    status: String,
    normal_balance: String,
    legacy_id: Option<String>,
    alt_id: Option<String>,
    metadata: String,
    created_at: String,
}

fn read_account_row(row: &Row<'_>) -> rusqlite::Result<RawAccount> {
    Ok(RawAccount {
        account_number: row.get(0)?,
        entity_code: row.get(1)?,
        category_code: row.get(2)?,
        sub_category_code: row.get(3)?,
        currency: row.get(4)?,
        status: row.get(5)?,
        normal_balance: row.get(6)?,
        legacy_id: row.get(7)?,
        alt_id: row.get(8)?,
        metadata: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl RawAccount {
    fn into_model(self) -> Result<Account, StorageError> {
        let metadata: BTreeMap<String, String> =
            serde_json::from_str(&self.metadata).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(Account {
            account_number: Arc::from(self.account_number),
            entity_code: Arc::from(self.entity_code),
            category_code: Arc::from(self.category_code),
            sub_category_code: Arc::from(self.sub_category_code),
            currency: Arc::from(self.currency),
            status: str_to_status(&self.status)?,
            normal_balance: parse_code::<NormalBalance>(&self.normal_balance)?,
            legacy_id: self.legacy_id,
            alt_id: self.alt_id,
            metadata,
            created_at: str_to_ts(&self.created_at)?,
        })
    }
}

struct RawBalance {
    account_number: String,
    entity_code: String,
    balance_date: String,
    opening_balance: String,
    debit_movement: String,
    credit_movement: String,
    closing_balance: String,
    normal_balance: String,
    created_at: String,
    updated_at: String,
}

fn read_balance_row(row: &Row<'_>) -> rusqlite::Result<RawBalance> {
    Ok(RawBalance {
        account_number: row.get(0)?,
        entity_code: row.get(1)?,
        balance_date: row.get(2)?,
        opening_balance: row.get(3)?,
        debit_movement: row.get(4)?,
        credit_movement: row.get(5)?,
        closing_balance: row.get(6)?,
        normal_balance: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl RawBalance {
    fn into_model(self) -> Result<AccountBalanceDaily, StorageError> {
        Ok(AccountBalanceDaily {
            account_number: Arc::from(self.account_number),
            entity_code: Arc::from(self.entity_code),
            balance_date: str_to_date(&self.balance_date)?,
            opening_balance: str_to_decimal(&self.opening_balance)?,
            debit_movement: str_to_decimal(&self.debit_movement)?,
            credit_movement: str_to_decimal(&self.credit_movement)?,
            closing_balance: str_to_decimal(&self.closing_balance)?,
            normal_balance: parse_code(&self.normal_balance)?,
            created_at: str_to_ts(&self.created_at)?,
            updated_at: str_to_ts(&self.updated_at)?,
        })
    }
}

struct RawPeriod {
    entity_code: String,
    period: String,
    is_adjustment: bool,
    status: String,
    file_path: Option<String>,
    closed_by: Option<String>,
    closed_at: Option<String>,
    close_claim: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_period_row(row: &Row<'_>) -> rusqlite::Result<RawPeriod> {
    Ok(RawPeriod {
        entity_code: row.get(0)?,
        period: row.get(1)?,
        is_adjustment: row.get(2)?,
        status: row.get(3)?,
        file_path: row.get(4)?,
        closed_by: row.get(5)?,
        closed_at: row.get(6)?,
        close_claim: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

impl RawPeriod {
    fn into_model(self) -> Result<TrialBalancePeriod, StorageError> {
        let period: ReportingPeriod = parse_code(&self.period)?;
        Ok(TrialBalancePeriod {
            key: PeriodKey {
                period,
                entity_code: Arc::from(self.entity_code),
                is_adjustment: self.is_adjustment,
            },
            status: parse_code(&self.status)?,
            file_path: self.file_path,
            closed_by: self.closed_by,
            closed_at: self.closed_at.as_deref().map(str_to_ts).transpose()?,
            close_claim: self.close_claim,
            created_at: str_to_ts(&self.created_at)?,
            updated_at: str_to_ts(&self.updated_at)?,
        })
    }
}

fn collect<R, T>(
    rows: impl Iterator<Item = rusqlite::Result<R>>,
    convert: impl Fn(R) -> Result<T, StorageError>,
) -> Result<Vec<T>, StorageError> {
    rows.map(|r| r.map_err(sql_err).and_then(&convert)).collect()
}

impl ReferenceStore for SqliteStorage {
    fn list_entities(&self) -> Result<Vec<Arc<str>>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT DISTINCT entity_code FROM accounts ORDER BY entity_code")
            .map_err(sql_err)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_err(sql_err)?;
        collect(rows, |s| Ok(Arc::from(s)))
    }

    fn list_accounts(&self, entity_code: &str) -> Result<Vec<Account>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM accounts WHERE entity_code = ?1 ORDER BY account_number",
                ACCOUNT_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![entity_code], read_account_row).map_err(sql_err)?;
        collect(rows, RawAccount::into_model)
    }

    fn get_account(&self, account_number: &str) -> Result<Account, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM accounts WHERE account_number = ?1", ACCOUNT_COLUMNS),
            params![account_number],
            read_account_row,
        )
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| StorageError::AccountNotFound(account_number.to_string()))?
        .into_model()
    }

    fn list_categories(&self) -> Result<Vec<Category>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT code, name, coa_type FROM categories ORDER BY code")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(sql_err)?;
        collect(rows, |(code, name, coa_type)| {
            Ok(Category {
                code: Arc::from(code),
                name: Arc::from(name),
                coa_type: parse_code::<CoaType>(&coa_type)?,
            })
        })
    }

    fn list_sub_categories(&self) -> Result<Vec<SubCategory>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT code, name, category_code FROM sub_categories ORDER BY code")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(sql_err)?;
        collect(rows, |(code, name, category_code)| {
            Ok(SubCategory {
                code: Arc::from(code),
                name: Arc::from(name),
                category_code: Arc::from(category_code),
            })
        })
    }
}

impl MovementStore for SqliteStorage {
    fn movements_on(&self, account_number: &str, date: Date) -> Result<Vec<JournalMovement>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::entity_of(&conn, account_number)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, entity_code, account_number, movement_date, side, amount, posted_at
                 FROM movements
                 WHERE account_number = ?1 AND movement_date = ?2
                 ORDER BY seq",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![account_number, date_to_str(date)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(sql_err)?;

        collect(rows, |(id, entity, account, movement_date, side, amount, posted_at)| {
            let id = Uuid::parse_str(&id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            Ok(JournalMovement {
                id: id.as_u128(),
                entity_code: Arc::from(entity),
                account_number: Arc::from(account),
                movement_date: str_to_date(&movement_date)?,
                side: str_to_side(&side)?,
                amount: str_to_decimal(&amount)?,
                posted_at: str_to_ts(&posted_at)?,
            })
        })
    }
}

impl BalanceStore for SqliteStorage {
    fn latest_before(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::entity_of(&conn, account_number)?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM account_balance_daily b
                     WHERE b.account_number = ?1 AND b.balance_date < ?2
                     ORDER BY b.balance_date DESC LIMIT 1",
                    BALANCE_COLUMNS
                ),
                params![account_number, date_to_str(date)],
                read_balance_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawBalance::into_model).transpose()
    }

    fn get_balance(&self, account_number: &str, date: Date) -> Result<Option<AccountBalanceDaily>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::entity_of(&conn, account_number)?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM account_balance_daily b
                     WHERE b.account_number = ?1 AND b.balance_date = ?2",
                    BALANCE_COLUMNS
                ),
                params![account_number, date_to_str(date)],
                read_balance_row,
            )
            .optional()
            .map_err(sql_err)?;
        raw.map(RawBalance::into_model).transpose()
    }

    fn upsert_day(&self, entity_code: &str, date: Date, rows: &[AccountBalanceDaily]) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().unwrap();
        // Dropping the transaction on an early return rolls the whole day back.
        let tx = conn.transaction().map_err(sql_err)?;

        for row in rows {
            let owner = Self::entity_of(&tx, &row.account_number)?;
            if row.balance_date != date || owner != entity_code {
                return Err(StorageError::AccountNotFound(row.account_number.to_string()));
            }
            tx.execute(
                "INSERT INTO account_balance_daily
                    (account_number, balance_date, entity_code, opening_balance, debit_movement,
                     credit_movement, closing_balance, normal_balance, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(account_number, balance_date) DO UPDATE SET
                    entity_code = excluded.entity_code,
                    opening_balance = excluded.opening_balance,
                    debit_movement = excluded.debit_movement,
                    credit_movement = excluded.credit_movement,
                    closing_balance = excluded.closing_balance,
                    normal_balance = excluded.normal_balance,
                    updated_at = excluded.updated_at",
                params![
                    row.account_number.as_ref(),
                    date_to_str(date),
                    entity_code,
                    row.opening_balance.to_string(),
                    row.debit_movement.to_string(),
                    row.credit_movement.to_string(),
                    row.closing_balance.to_string(),
                    row.normal_balance.code(),
                    ts_to_str(row.created_at)?,
                    ts_to_str(row.updated_at)?,
                ],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        tracing::debug!(entity = entity_code, %date, rows = rows.len(), "Daily balances upserted");
        Ok(())
    }

    fn balances_between(&self, entity_code: &str, from: Date, to: Date) -> Result<Vec<AccountBalanceDaily>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM account_balance_daily b
                 WHERE b.entity_code = ?1 AND b.balance_date >= ?2 AND b.balance_date <= ?3
                 ORDER BY b.account_number, b.balance_date",
                BALANCE_COLUMNS
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![entity_code, date_to_str(from), date_to_str(to)], read_balance_row)
            .map_err(sql_err)?;
        collect(rows, RawBalance::into_model)
    }

    fn list_balances(
        &self,
        filter: &BalanceFilter,
        window: &KeysetWindow<String>,
    ) -> Result<Vec<AccountBalanceDaily>, StorageError> {
        let order = if window.is_descending() { "DESC" } else { "ASC" };
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM account_balance_daily b
                 JOIN accounts a ON a.account_number = b.account_number
                 WHERE a.entity_code = ?1
                   AND b.balance_date = ?2
                   AND (?3 IS NULL OR a.category_code = ?3)
                   AND (?4 IS NULL OR a.sub_category_code = ?4)
                   AND (?5 IS NULL OR instr(lower(a.account_number), lower(?5)) > 0)
                   AND (?6 IS NULL OR a.account_number > ?6)
                   AND (?7 IS NULL OR a.account_number < ?7)
                 ORDER BY a.account_number {}
                 LIMIT ?8",
                BALANCE_COLUMNS, order
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![
                    filter.entity_code,
                    date_to_str(filter.balance_date),
                    filter.category_code,
                    filter.sub_category_code,
                    filter.search,
                    window.after,
                    window.before,
                    window.fetch_size() as i64,
                ],
                read_balance_row,
            )
            .map_err(sql_err)?;
        collect(rows, RawBalance::into_model)
    }
}

impl PeriodStore for SqliteStorage {
    fn get_period(&self, key: &PeriodKey) -> Result<Option<TrialBalancePeriod>, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::read_period(&conn, key)
    }

    fn ensure_open(&self, key: &PeriodKey, now: OffsetDateTime) -> Result<TrialBalancePeriod, StorageError> {
        let conn = self.conn.lock().unwrap();
        Self::insert_open(&conn, key, now)?;
        Self::read_period(&conn, key)?
            .ok_or_else(|| StorageError::Other(format!("period {} vanished after insert", key)))
    }

    fn claim_close(
        &self,
        key: &PeriodKey,
        claim: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<ClaimOutcome, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(sql_err)?;

        Self::insert_open(&tx, key, now)?;
        let changed = tx
            .execute(
                "UPDATE trial_balance_periods
                 SET status = 'CLOSING', close_claim = ?4, updated_at = ?5
                 WHERE entity_code = ?1 AND period = ?2 AND is_adjustment = ?3
                   AND (status = 'OPEN' OR (status = 'CLOSING' AND updated_at < ?6))",
                params![
                    key.entity_code.as_ref(),
                    key.period.to_string(),
                    key.is_adjustment,
                    claim,
                    ts_to_str(now)?,
                    ts_to_str(stale_before)?,
                ],
            )
            .map_err(sql_err)?;
        let record = Self::read_period(&tx, key)?
            .ok_or_else(|| StorageError::Other(format!("period {} vanished during claim", key)))?;
        tx.commit().map_err(sql_err)?;

        Ok(if changed == 1 {
            ClaimOutcome::Claimed(record)
        } else if record.is_closed() {
            ClaimOutcome::AlreadyClosed(record)
        } else {
            ClaimOutcome::Busy(record)
        })
    }

    fn mark_closed(
        &self,
        key: &PeriodKey,
        claim: &str,
        file_path: &str,
        closed_by: &str,
        now: OffsetDateTime,
    ) -> Result<CloseOutcome, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(sql_err)?;

        let changed = tx
            .execute(
                "UPDATE trial_balance_periods
                 SET status = 'CLOSED', close_claim = NULL, file_path = ?5, closed_by = ?6,
                     closed_at = ?7, updated_at = ?7
                 WHERE entity_code = ?1 AND period = ?2 AND is_adjustment = ?3
                   AND status = 'CLOSING' AND close_claim = ?4",
                params![
                    key.entity_code.as_ref(),
                    key.period.to_string(),
                    key.is_adjustment,
                    claim,
                    file_path,
                    closed_by,
                    ts_to_str(now)?,
                ],
            )
            .map_err(sql_err)?;
        let record = Self::read_period(&tx, key)?;
        tx.commit().map_err(sql_err)?;

        match record {
            Some(record) if changed == 1 => Ok(CloseOutcome::Closed(record)),
            Some(record) if record.is_closed() => Ok(CloseOutcome::AlreadyClosed(record)),
            _ => Err(StorageError::ClaimLost(key.to_string())),
        }
    }

    fn release_claim(&self, key: &PeriodKey, claim: &str, now: OffsetDateTime) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trial_balance_periods
             SET status = 'OPEN', close_claim = NULL, updated_at = ?5
             WHERE entity_code = ?1 AND period = ?2 AND is_adjustment = ?3
               AND status = 'CLOSING' AND close_claim = ?4",
            params![
                key.entity_code.as_ref(),
                key.period.to_string(),
                key.is_adjustment,
                claim,
                ts_to_str(now)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    fn list_periods(
        &self,
        filter: &PeriodFilter,
        window: &KeysetWindow<PeriodCursor>,
    ) -> Result<Vec<TrialBalancePeriod>, StorageError> {
        let order = if window.is_descending() { "DESC" } else { "ASC" };
        let after = window.after.as_ref().map(CursorParams::of).transpose()?.unwrap_or_default();
        let before = window.before.as_ref().map(CursorParams::of).transpose()?.unwrap_or_default();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {cols} FROM trial_balance_periods
                 WHERE (?1 IS NULL OR entity_code = ?1)
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR (created_at, entity_code, period, is_adjustment) > (?3, ?4, ?5, ?6))
                   AND (?7 IS NULL OR (created_at, entity_code, period, is_adjustment) < (?7, ?8, ?9, ?10))
                 ORDER BY created_at {o}, entity_code {o}, period {o}, is_adjustment {o}
                 LIMIT ?11",
                cols = PERIOD_COLUMNS,
                o = order
            ))
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![
                    filter.entity_code,
                    filter.status.map(|s| s.code()),
                    after.created_at,
                    after.entity_code,
                    after.period,
                    after.is_adjustment,
                    before.created_at,
                    before.entity_code,
                    before.period,
                    before.is_adjustment,
                    window.fetch_size() as i64,
                ],
                read_period_row,
            )
            .map_err(sql_err)?;
        collect(rows, RawPeriod::into_model)
    }
}

/// A [`PeriodCursor`] bound as SQL parameters; all NULL when there is no bound.
#[derive(Default)]
struct CursorParams {
    created_at: Option<String>,
    entity_code: Option<String>,
    period: Option<String>,
    is_adjustment: Option<bool>,
}

impl CursorParams {
    fn of(cursor: &PeriodCursor) -> Result<Self, StorageError> {
        Ok(Self {
            created_at: Some(ts_to_str(cursor.created_at)?),
            entity_code: Some(cursor.entity_code.clone()),
            period: Some(cursor.period.to_string()),
            is_adjustment: Some(cursor.is_adjustment),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerview_core::pagination::PageRequest;
    use rust_decimal_macros::dec;
    use time::macros::{date, datetime};

    fn seeded() -> SqliteStorage {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let category = Category {
            code: Arc::from("211"),
            name: Arc::from("Customer deposits"),
            coa_type: CoaType::Liability,
        };
        storage.add_category(&category).unwrap();
        storage
            .add_sub_category(&SubCategory {
                code: Arc::from("21101"),
                name: Arc::from("Savings"),
                category_code: Arc::from("211"),
            })
            .unwrap();
        for number in ["21101000000001", "21101000000002", "21101000000003"] {
            let mut account = Account::new(number, "001", &category, "21101", "IDR", datetime!(2024-01-01 0:00 UTC));
            account.metadata.insert("branch".to_string(), "JKT".to_string());
            storage.add_account(&account).unwrap();
        }
        storage
    }

    fn row(account: &str, date: Date, closing: Decimal, at: OffsetDateTime) -> AccountBalanceDaily {
        AccountBalanceDaily {
            account_number: Arc::from(account),
            entity_code: Arc::from("001"),
            balance_date: date,
            opening_balance: Decimal::ZERO,
            debit_movement: Decimal::ZERO,
            credit_movement: closing,
            closing_balance: closing,
            normal_balance: NormalBalance::Credit,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_reference_data_round_trip() {
        let storage = seeded();
        assert_eq!(storage.list_entities().unwrap(), vec![Arc::from("001")]);
        let account = storage.get_account("21101000000002").unwrap();
        assert_eq!(account.normal_balance, NormalBalance::Credit);
        assert_eq!(account.metadata.get("branch").map(String::as_str), Some("JKT"));
        assert_eq!(account.created_at, datetime!(2024-01-01 0:00 UTC));
        assert_eq!(storage.list_categories().unwrap()[0].coa_type, CoaType::Liability);
        assert!(matches!(storage.get_account("missing"), Err(StorageError::AccountNotFound(_))));
    }

    #[test]
    fn test_movements_keep_decimal_precision() {
        let storage = seeded();
        storage
            .record_movement("21101000000001", date!(2024-01-15), EntrySide::Credit, dec!(1234.5678))
            .unwrap();
        storage
            .record_movement("21101000000001", date!(2024-01-15), EntrySide::Debit, dec!(0.01))
            .unwrap();
        let movements = storage.movements_on("21101000000001", date!(2024-01-15)).unwrap();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[0].amount, dec!(1234.5678));
        assert_eq!(movements[0].side, EntrySide::Credit);
        assert_eq!(movements[1].side, EntrySide::Debit);
    }

    #[test]
    fn test_upsert_day_rolls_back_and_keeps_created_at() {
        let storage = seeded();
        let day = date!(2024-01-15);
        let first = datetime!(2024-01-16 1:00 +07:00);
        storage
            .upsert_day("001", day, &[row("21101000000001", day, dec!(5), first)])
            .unwrap();

        let bad = [
            row("21101000000001", day, dec!(9), first),
            row("99999999999999", day, dec!(1), first),
        ];
        assert!(storage.upsert_day("001", day, &bad).is_err());
        assert_eq!(storage.get_balance("21101000000001", day).unwrap().unwrap().closing_balance, dec!(5));

        let later = datetime!(2024-01-17 1:00 UTC);
        storage
            .upsert_day("001", day, &[row("21101000000001", day, dec!(7), later)])
            .unwrap();
        let stored = storage.get_balance("21101000000001", day).unwrap().unwrap();
        assert_eq!(stored.closing_balance, dec!(7));
        assert_eq!(stored.created_at, first);
        assert_eq!(stored.updated_at, later);

        let prior = storage.latest_before("21101000000001", date!(2024-01-16)).unwrap().unwrap();
        assert_eq!(prior.balance_date, day);
        assert!(storage.latest_before("21101000000001", day).unwrap().is_none());
    }

    #[test]
    fn test_list_balances_pages_by_account_number() {
        let storage = seeded();
        let day = date!(2024-01-15);
        let at = datetime!(2024-01-16 0:00 UTC);
        let rows: Vec<_> = ["21101000000001", "21101000000002", "21101000000003"]
            .iter()
            .map(|a| row(a, day, dec!(1), at))
            .collect();
        storage.upsert_day("001", day, &rows).unwrap();

        let filter = BalanceFilter::new("001", day);
        let window = PageRequest::first(2).window::<String>().unwrap();
        let first = storage.list_balances(&filter, &window).unwrap();
        assert_eq!(first.len(), 3, "one probe row beyond the limit");

        let window = KeysetWindow {
            after: None,
            before: Some("21101000000003".to_string()),
            direction: ledgerview_core::pagination::Direction::Backward,
            limit: 1,
        };
        let back = storage.list_balances(&filter, &window).unwrap();
        assert_eq!(back[0].account_number.as_ref(), "21101000000002");
        assert_eq!(back[1].account_number.as_ref(), "21101000000001");

        let mut search = BalanceFilter::new("001", day);
        search.search = Some("0003".to_string());
        let window = PageRequest::first(10).window::<String>().unwrap();
        assert_eq!(storage.list_balances(&search, &window).unwrap().len(), 1);
    }

    #[test]
    fn test_close_claim_has_single_winner() {
        let storage = seeded();
        let key = PeriodKey::regular("2024-01".parse().unwrap(), "001");
        let now = datetime!(2024-02-01 9:00 UTC);
        let stale_before = now - time::Duration::minutes(5);

        assert!(matches!(
            storage.claim_close(&key, "a", now, stale_before).unwrap(),
            ClaimOutcome::Claimed(ref p) if p.status == PeriodStatus::Closing
        ));
        assert!(matches!(
            storage.claim_close(&key, "b", now, stale_before).unwrap(),
            ClaimOutcome::Busy(ref p) if p.close_claim.as_deref() == Some("a")
        ));
        assert!(matches!(
            storage.mark_closed(&key, "b", "b.json", "bob", now),
            Err(StorageError::ClaimLost(_))
        ));

        let first = storage.mark_closed(&key, "a", "a.json", "alice", now).unwrap();
        assert!(matches!(first, CloseOutcome::Closed(_)));
        match storage.mark_closed(&key, "b", "b.json", "bob", now).unwrap() {
            CloseOutcome::AlreadyClosed(p) => {
                assert_eq!(p.status, PeriodStatus::Closed);
                assert_eq!(p.file_path.as_deref(), Some("a.json"));
                assert_eq!(p.closed_by.as_deref(), Some("alice"));
                assert_eq!(p.closed_at, Some(now));
                assert!(p.close_claim.is_none());
            }
            other => panic!("expected AlreadyClosed, got {:?}", other),
        }
    }

    #[test]
    fn test_released_and_stale_claims() {
        let storage = seeded();
        let key = PeriodKey::regular("2024-01".parse().unwrap(), "001");
        let t0 = datetime!(2024-02-01 9:00 UTC);

        storage.claim_close(&key, "a", t0, t0).unwrap();
        storage.release_claim(&key, "a", t0).unwrap();
        assert_eq!(storage.get_period(&key).unwrap().unwrap().status, PeriodStatus::Open);

        storage.claim_close(&key, "b", t0, t0).unwrap();
        let later = t0 + time::Duration::minutes(10);
        assert!(matches!(
            storage.claim_close(&key, "c", later, later - time::Duration::minutes(5)).unwrap(),
            ClaimOutcome::Claimed(ref p) if p.close_claim.as_deref() == Some("c")
        ));
        assert!(matches!(
            storage.mark_closed(&key, "b", "b.json", "bob", later),
            Err(StorageError::ClaimLost(_))
        ));
    }

    #[test]
    fn test_constraint_violation_is_not_retryable_other() {
        let storage = seeded();
        let conn = storage.conn.lock().unwrap();
        let insert = "INSERT INTO categories (code, name, coa_type) VALUES ('211', 'Again', 'LIABILITY')";
        let err = conn.execute(insert, []).map_err(sql_err).unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)), "got {:?}", err);
    }

    #[test]
    fn test_list_periods_orders_by_creation() {
        let storage = seeded();
        let times = [
            datetime!(2024-02-01 0:00 UTC),
            datetime!(2024-03-01 0:00 UTC),
            datetime!(2024-04-01 0:00 UTC),
        ];
        for (month, at) in ["2024-01", "2024-02", "2024-03"].iter().zip(times) {
            storage
                .ensure_open(&PeriodKey::regular(month.parse().unwrap(), "001"), at)
                .unwrap();
        }
        let first = storage.get_period(&PeriodKey::regular("2024-01".parse().unwrap(), "001")).unwrap().unwrap();

        let window = KeysetWindow {
            after: Some(PeriodCursor::of(&first)),
            before: None,
            direction: ledgerview_core::pagination::Direction::Forward,
            limit: 10,
        };
        let rows = storage.list_periods(&PeriodFilter::default(), &window).unwrap();
        let months: Vec<String> = rows.iter().map(|p| p.key.period.to_string()).collect();
        assert_eq!(months, vec!["2024-02", "2024-03"]);

        let closed = PeriodFilter {
            entity_code: Some("001".to_string()),
            status: Some(PeriodStatus::Closed),
        };
        let window = PageRequest::first(0).window::<PeriodCursor>().unwrap();
        assert!(storage.list_periods(&closed, &window).unwrap().is_empty());
    }

    #[test]
    fn test_list_periods_pages_through_tied_timestamps() {
        let storage = seeded();
        let at = datetime!(2024-02-01 0:00 UTC);
        let period: ReportingPeriod = "2024-01".parse().unwrap();
        for key in [
            PeriodKey::regular(period, "002"),
            PeriodKey::regular(period, "001"),
            PeriodKey::adjustment(period, "001"),
        ] {
            storage.ensure_open(&key, at).unwrap();
        }

        let mut seen = Vec::new();
        let mut request = PageRequest::first(1);
        loop {
            let window = request.window::<PeriodCursor>().unwrap();
            let rows = storage.list_periods(&PeriodFilter::default(), &window).unwrap();
            let page = ledgerview_core::pagination::Page::from_rows(rows, &window, PeriodCursor::of).unwrap();
            seen.extend(page.items.iter().map(|p| p.key.to_string()));
            match page.next_cursor {
                Some(cursor) => request = PageRequest::after(1, &cursor),
                None => break,
            }
        }
        assert_eq!(seen, vec!["001/2024-01", "001/2024-01/adjustment", "002/2024-01"]);
    }
}
