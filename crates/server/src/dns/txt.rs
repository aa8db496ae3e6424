//! Live TXT values for the DNS-01 challenge name.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

/// Challenge TXT values owned by the DNS listener.
///
/// Readers load a snapshot without locking; writers replace the whole set in
/// one atomic swap, so a query sees either the old set or the new one.
#[derive(Debug, Default)]
pub struct TxtRecordCell {
    values: ArcSwap<Vec<String>>,
}

impl TxtRecordCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current values
    pub fn load(&self) -> Arc<Vec<String>> {
        self.values.load_full()
    }

    fn store(&self, values: Vec<String>) {
        debug!(count = values.len(), "Updating challenge TXT values");
        self.values.store(Arc::new(values));
    }
}

/// Narrow setter handed to the ACME Coordinator.
///
/// Holds the cell, never the listener.
#[derive(Debug, Clone)]
pub struct TxtRecordHandle {
    cell: Arc<TxtRecordCell>,
}

impl TxtRecordHandle {
    pub fn new(cell: Arc<TxtRecordCell>) -> Self {
        Self { cell }
    }

    /// Replace the served values; effective for the next query.
    pub fn set(&self, values: Vec<String>) {
        self.cell.store(values);
    }

    pub fn clear(&self) {
        self.cell.store(Vec::new());
    }

    pub fn current(&self) -> Arc<Vec<String>> {
        self.cell.load()
    }
}
