//! Wires all components, owns the cancellation primitive, installs the interrupt
//! handler.
//!
//! Startup order: cancellation primitive -> content index -> empty-file register -> IPC
//! server -> watcher (must be listening before the scanner begins so mid-scan mutations
//! aren't lost) -> scanner.
//!
//! Shutdown order: set cancellation flag -> signal the watcher's stop event -> join
//! scanner (already finished by the time shutdown runs) -> join watcher -> shut down the
//! IPC server (disconnects the client, closes the endpoint, joins the accept task) ->
//! release shared structures (dropped with the supervisor).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::content_index::{ContentIndex, EmptyFileSet};
use crate::{ipc, scanner, watcher};

pub fn run(config: Config) -> i32 {
    let content_index = Arc::new(ContentIndex::new());
    let empty_files = Arc::new(EmptyFileSet::new());
    let (outbound, outbound_rx, connected) = ipc::channel();
    let aggregator = Arc::new(Aggregator::new(outbound));

    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancel_tx = cancel_tx.clone();
        let cancelled = cancelled.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            cancelled.store(true, Ordering::Release);
            let _ = cancel_tx.send(true);
        }) {
            log::warn!("[ERROR] failed to install interrupt handler: {e}");
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[ERROR] failed to start async runtime: {e}");
            return 1;
        }
    };

    let endpoint_name =
        std::env::var("DUPEWATCH_IPC_NAME").unwrap_or_else(|_| ipc::DEFAULT_ENDPOINT_NAME.to_string());
    let ipc_aggregator = aggregator.clone();
    let ipc_cancel_rx = cancel_rx.clone();
    let ipc_task = runtime.spawn(async move {
        if let Err(e) = ipc::run_server(&endpoint_name, ipc_aggregator, outbound_rx, connected, ipc_cancel_rx).await
        {
            log::warn!("[ERROR] ipc server: {e}");
        }
    });

    let watcher_handle = match watcher::spawn_watcher(
        config.root.clone(),
        content_index.clone(),
        empty_files.clone(),
        aggregator.clone(),
    ) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("[ERROR] watch init failed, continuing without watching: {e}");
            None
        }
    };

    let scan_handle = scanner::new_handle();
    match scanner::scan_volume(&config.root, &content_index, &empty_files, &aggregator, scan_handle) {
        Ok(summary) => log::info!(
            "[SCAN] complete: {} files scanned, {} duplicate groups ({} ms)",
            summary.total_files,
            summary.duplicate_groups,
            summary.duration_ms
        ),
        Err(e) => log::error!("[ERROR] scan failed: {e}"),
    }

    let watcher_handle = if config.watch {
        watcher_handle
    } else {
        if let Some(handle) = watcher_handle {
            handle.stop();
        }
        None
    };

    if config.watch {
        while !cancelled.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
        }
    }

    let _ = cancel_tx.send(true);
    if let Some(handle) = watcher_handle {
        handle.stop();
    }
    runtime.block_on(async {
        let _ = ipc_task.await;
    });

    0
}
