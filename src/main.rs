use std::sync::Arc;

use clap::Parser;
use ledgerview::{
    clock::{parse_date, parse_offset, Clock, SystemClock},
    config::{CliArgs, Command, Config, StorageBackendKind},
    export::FsExportStore,
    Pipeline, PipelineError,
};
use ledgerview_core::{
    models::{report::BalanceScope, PeriodStatus, ReportingPeriod},
    money::{to_display_string, NumberLocale},
    pagination::{Page, PageRequest},
    storage::{BalanceFilter, LedgerStore, PeriodFilter},
    AccountBalanceDaily, TrialBalancePeriod,
};
use ledgerview_memory::{InMemoryCache, InMemoryStorage};
use ledgerview_sqlite::SqliteStorage;
use metrics_exporter_prometheus::PrometheusBuilder;
use prettytable::{row, Table};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_tracing(&config);
    init_metrics(&config);

    if let Err(e) = run(cli, config).await {
        tracing::error!(error = %e, kind = ?e.kind(), "Command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn init_metrics(config: &Config) {
    match config.metrics_addr() {
        Some(Ok(addr)) => match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => tracing::info!(%addr, "Metrics endpoint listening"),
            Err(e) => tracing::warn!(error = %e, "Metrics exporter not installed"),
        },
        Some(Err(e)) => tracing::warn!(error = %e, "Invalid metrics listen address"),
        None => {}
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn LedgerStore>, PipelineError> {
    Ok(match config.storage.backend {
        StorageBackendKind::Memory => Arc::new(InMemoryStorage::new()),
        StorageBackendKind::Sqlite => Arc::new(SqliteStorage::new(&config.storage.path)?),
    })
}

async fn run(cli: CliArgs, config: Config) -> Result<(), PipelineError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(parse_offset(&config.clock.utc_offset)?));
    let pipeline = Pipeline::new(
        open_store(&config)?,
        Arc::new(InMemoryCache::new()),
        Arc::new(FsExportStore::new(config.export.dir.clone())),
        clock.clone(),
        config.pipeline_settings(),
    );
    tracing::debug!(backend = ?config.storage.backend, export_dir = %config.export.dir, "Pipeline ready");

    match cli.command {
        Command::Generate { date } => {
            let date = match date {
                Some(text) => parse_date(&text)?,
                None => clock.yesterday(),
            };
            let summaries = pipeline.jobs.generate_daily_balance(date).await?;
            print_json(&summaries)?;
        }
        Command::GenerateRange { start, end } => {
            let start = parse_date(&start)?;
            let end = end.as_deref().map(parse_date).transpose()?;
            let summaries = pipeline.jobs.generate_range(start, end).await?;
            print_json(&summaries)?;
        }
        Command::Close {
            period,
            entity,
            closed_by,
            adjustment,
        } => {
            let period = parse_period(&period)?;
            let record = if adjustment {
                pipeline.jobs.close_adjustment(period, &entity, &closed_by)?
            } else {
                pipeline.jobs.close_trial_balance(period, &entity, &closed_by)?
            };
            print_json(&record)?;
        }
        Command::OpenAdjustment { period, entity } => {
            let record = pipeline.jobs.open_adjustment(parse_period(&period)?, &entity)?;
            print_json(&record)?;
        }
        Command::TrialBalance {
            entity,
            date,
            from,
            to,
            period,
            guest,
            balance_sheet,
        } => {
            let scope = match (date, from, to, period) {
                (Some(date), _, _, _) => BalanceScope::Day { date: parse_date(&date)? },
                (_, Some(from), Some(to), _) => BalanceScope::Range {
                    from: parse_date(&from)?,
                    to: parse_date(&to)?,
                },
                (_, _, _, Some(period)) => {
                    let period = parse_period(&period)?;
                    BalanceScope::Range {
                        from: period.first_day(),
                        to: period.last_day(),
                    }
                }
                _ => BalanceScope::Day { date: clock.yesterday() },
            };

            if balance_sheet {
                let sheet = pipeline.reports.balance_sheet(&entity, scope, guest)?;
                if cli.json {
                    print_json(&sheet)?;
                } else {
                    println!("{}", sheet);
                }
            } else {
                let tree = pipeline.reports.trial_balance(&entity, scope, guest)?;
                if cli.json {
                    print_json(&tree)?;
                } else {
                    println!("{}", tree);
                }
            }
        }
        Command::Balances {
            entity,
            date,
            category,
            sub_category,
            search,
            limit,
            next,
            prev,
        } => {
            let mut filter = BalanceFilter::new(&entity, parse_date(&date)?);
            filter.category_code = category;
            filter.sub_category_code = sub_category;
            filter.search = search;
            let request = PageRequest {
                limit,
                next_cursor: next,
                prev_cursor: prev,
            };
            let page = pipeline.reports.list_daily_balances(&filter, &request)?;
            if cli.json {
                print_json(&page)?;
            } else {
                print_balances(&page);
            }
        }
        Command::Periods {
            entity,
            status,
            limit,
            next,
            prev,
        } => {
            let status = status
                .as_deref()
                .map(str::parse::<PeriodStatus>)
                .transpose()
                .map_err(PipelineError::Validation)?;
            let filter = PeriodFilter {
                entity_code: entity,
                status,
            };
            let request = PageRequest {
                limit,
                next_cursor: next,
                prev_cursor: prev,
            };
            let page = pipeline.reports.list_periods(&filter, &request)?;
            if cli.json {
                print_json(&page)?;
            } else {
                print_periods(&page);
            }
        }
    }
    Ok(())
}

fn parse_period(text: &str) -> Result<ReportingPeriod, PipelineError> {
    text.parse().map_err(PipelineError::Validation)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PipelineError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| PipelineError::InvariantViolation(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn print_cursors<T>(page: &Page<T>) {
    if let Some(ref cursor) = page.prev_cursor {
        println!("prev: {}", cursor);
    }
    if let Some(ref cursor) = page.next_cursor {
        println!("next: {}", cursor);
    }
}

fn print_balances(page: &Page<AccountBalanceDaily>) {
    let fmt = |d: Decimal| to_display_string(d, NumberLocale::Indonesian);
    let mut table = Table::new();
    table.add_row(row!["Account", "Date", "Opening", "Debit", "Credit", "Closing"]);
    for balance in &page.items {
        table.add_row(row![
            balance.account_number,
            balance.balance_date,
            fmt(balance.opening_balance),
            fmt(balance.debit_movement),
            fmt(balance.credit_movement),
            fmt(balance.closing_balance)
        ]);
    }
    table.printstd();
    print_cursors(page);
}

fn print_periods(page: &Page<TrialBalancePeriod>) {
    let mut table = Table::new();
    table.add_row(row!["Entity", "Period", "Adjustment", "Status", "Closed by", "File"]);
    for period in &page.items {
        table.add_row(row![
            period.key.entity_code,
            period.key.period,
            period.key.is_adjustment,
            period.status.code(),
            period.closed_by.as_deref().unwrap_or(""),
            period.file_path.as_deref().unwrap_or("")
        ]);
    }
    table.printstd();
    print_cursors(page);
}
