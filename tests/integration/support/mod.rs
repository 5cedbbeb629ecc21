#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use pagestore::{PageAccess, Result, StoreOptions, Synchronous, Transaction};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pagestore=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Unsynced single-stripe layout with background sweeping off.
pub fn options(dir: &Path) -> StoreOptions {
    StoreOptions::in_dir(dir)
        .with_page_size(256)
        .with_synchronous(Synchronous::Off)
        .with_worker_threads(2)
        .with_sweep_interval_ms(0)
}

/// Commits `txn` and waits for both the log write and the apply.
pub fn commit_and_finalize(store: &dyn PageAccess, txn: &Transaction) -> Result<()> {
    store.commit_transaction(txn)?.wait()?;
    store.finalize_transaction(txn).wait()
}
