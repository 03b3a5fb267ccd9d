//! Isolated sync workers.
//!
//! Each vendor sync runs on a dedicated OS thread with its own
//! current-thread runtime, so a crash, memory spike or stall in one vendor
//! cannot take the service process or sibling syncs down. The supervisor
//! reads one report per worker from a channel; a dropped channel means the
//! worker panicked.

use std::sync::mpsc;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use super::synchronizer::{SyncSummary, Synchronizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Failed,
    Panicked,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub vendor: String,
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Spawn one vendor sync on its own thread and runtime. Returns immediately;
/// the report arrives on the channel when the worker finishes (or never, if
/// it panicked — `await_report` maps that to `Panicked`).
pub fn spawn_worker(sync: Arc<Synchronizer>, slug: String) -> mpsc::Receiver<WorkerReport> {
    let (tx, rx) = mpsc::sync_channel(1);
    let thread_slug = slug.clone();

    let spawned = std::thread::Builder::new()
        .name(format!("sync-{}", thread_slug))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(WorkerReport {
                        vendor: thread_slug.clone(),
                        status: WorkerStatus::Failed,
                        summary: None,
                        error: Some(format!("worker runtime: {}", e)),
                    });
                    return;
                }
            };

            let report = match runtime.block_on(sync.sync_vendor(&thread_slug)) {
                Ok(summary) => WorkerReport {
                    vendor: thread_slug.clone(),
                    status: WorkerStatus::Success,
                    summary: Some(summary),
                    error: None,
                },
                Err(e) => WorkerReport {
                    vendor: thread_slug.clone(),
                    status: WorkerStatus::Failed,
                    summary: None,
                    error: Some(e.to_string()),
                },
            };
            let _ = tx.send(report);
        });

    if let Err(e) = spawned {
        error!(vendor = %slug, "failed spawning sync worker: {}", e);
    }
    rx
}

/// Block for one worker's report. Call from `spawn_blocking`; a closed
/// channel (worker panic or failed spawn) becomes a `Panicked` report, and
/// the supervisor simply schedules the vendor again next cycle.
pub fn await_report(vendor: &str, rx: &mpsc::Receiver<WorkerReport>) -> WorkerReport {
    match rx.recv() {
        Ok(report) => {
            info!(
                vendor = %report.vendor,
                status = ?report.status,
                "sync worker finished"
            );
            report
        }
        Err(_) => {
            error!(vendor, "sync worker died without reporting");
            WorkerReport {
                vendor: vendor.to_string(),
                status: WorkerStatus::Panicked,
                summary: None,
                error: Some("worker terminated abnormally".to_string()),
            }
        }
    }
}
