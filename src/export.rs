use std::{
    fs,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use ledgerview_core::{
    export::{export_path, ExportStore},
    models::{report::TrialBalanceTree, PeriodKey},
    storage::StorageError,
};

/// Writes period-close exports as pretty-printed JSON files under a base directory.
pub struct FsExportStore {
    base_dir: PathBuf,
}

impl FsExportStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.base_dir.join(relative))
    }
}

impl ExportStore for FsExportStore {
    fn write_trial_balance(&self, key: &PeriodKey, tree: &TrialBalanceTree) -> Result<String, StorageError> {
        let path = export_path(key);
        let target = self.resolve(&path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let body = serde_json::to_vec_pretty(tree).map_err(|e| StorageError::Other(e.to_string()))?;
        // Readers never see a half-written export.
        let staging = target.with_extension("json.tmp");
        fs::write(&staging, body)?;
        fs::rename(&staging, &target)?;

        tracing::debug!(%path, bytes = target.metadata().map(|m| m.len()).unwrap_or(0), "Trial balance exported");
        Ok(path)
    }

    fn read_trial_balance(&self, path: &str) -> Result<TrialBalanceTree, StorageError> {
        let bytes = match fs::read(self.resolve(path)?) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StorageError::ExportNotFound(path.to_string())),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt(format!("{}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ledgerview_core::models::{
        report::{BalanceScope, Totals, UnmappedBucket},
        ReportingPeriod,
    };
    use time::macros::{date, datetime};

    use super::*;

    fn empty_tree() -> TrialBalanceTree {
        TrialBalanceTree {
            entity_code: Arc::from("001"),
            scope: BalanceScope::Range {
                from: date!(2024-01-01),
                to: date!(2024-01-31),
            },
            excluded_sub_categories: Vec::new(),
            coa_types: Vec::new(),
            unmapped: UnmappedBucket::default(),
            grand_total: Totals::default(),
            generated_at: datetime!(2024-02-01 0:00 +07:00),
        }
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsExportStore::new(dir.path());
        let period: ReportingPeriod = "2024-01".parse().unwrap();

        let path = store
            .write_trial_balance(&PeriodKey::adjustment(period, "001"), &empty_tree())
            .unwrap();
        assert_eq!(path, "trial-balance/001/2024-01-adjustment.json");
        assert!(dir.path().join(&path).exists());
        assert_eq!(store.read_trial_balance(&path).unwrap(), empty_tree());
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsExportStore::new(dir.path());
        assert!(matches!(
            store.read_trial_balance("trial-balance/001/2099-01.json"),
            Err(StorageError::ExportNotFound(_))
        ));
    }

    #[test]
    fn test_escaping_paths_are_rejected_on_read_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsExportStore::new(dir.path().join("exports"));
        assert!(matches!(
            store.read_trial_balance("../etc/passwd"),
            Err(StorageError::InvalidPath(_))
        ));

        let period: ReportingPeriod = "2024-01".parse().unwrap();
        let result = store.write_trial_balance(&PeriodKey::regular(period, "../../escaped"), &empty_tree());
        assert!(matches!(result, Err(StorageError::InvalidPath(_))));
        assert!(!dir.path().join("escaped").exists());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsExportStore::new(dir.path());
        fs::write(dir.path().join("broken.json"), b"{").unwrap();
        assert!(matches!(store.read_trial_balance("broken.json"), Err(StorageError::Corrupt(_))));
    }
}
