use crate::{
    models::{report::TrialBalanceTree, PeriodKey},
    storage::StorageError,
};

/// Durable storage for frozen period-close artifacts.
pub trait ExportStore: Send + Sync {
    /// Persists the tree and returns the path it was stored under.
    fn write_trial_balance(&self, key: &PeriodKey, tree: &TrialBalanceTree) -> Result<String, StorageError>;
    fn read_trial_balance(&self, path: &str) -> Result<TrialBalanceTree, StorageError>;
}

/// Export path for a period: `trial-balance/{entity}/{YYYY-MM}[-adjustment].json`.
pub fn export_path(key: &PeriodKey) -> String {
    let suffix = if key.is_adjustment { "-adjustment" } else { "" };
    format!("trial-balance/{}/{}{}.json", key.entity_code, key.period, suffix)
}
