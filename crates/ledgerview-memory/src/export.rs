use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock,
    },
};

use ledgerview_core::{
    export::{export_path, ExportStore},
    models::{report::TrialBalanceTree, PeriodKey},
    storage::StorageError,
};

/// Export storage held in memory; counts writes so callers can assert on them.
#[derive(Default)]
pub struct InMemoryExportStore {
    files: RwLock<HashMap<String, TrialBalanceTree>>,
    writes: AtomicUsize,
}

impl InMemoryExportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ExportStore for InMemoryExportStore {
    fn write_trial_balance(&self, key: &PeriodKey, tree: &TrialBalanceTree) -> Result<String, StorageError> {
        let path = export_path(key);
        self.files.write().unwrap().insert(path.clone(), tree.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%path, "Trial balance exported");
        Ok(path)
    }

    fn read_trial_balance(&self, path: &str) -> Result<TrialBalanceTree, StorageError> {
        self.files
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::ExportNotFound(path.to_string()))
    }
}
