use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{Config, WORKER_START_OFFSET};
use crate::db::Records;
use crate::fetch::Fetch;
use crate::providers::MirrorTemplate;
use crate::types::PackageRef;
use crate::worker::Worker;

// Set from the signal handler; polled by every worker at its suspension
// points (pacing sleeps, fetches, decompression chunks, task bounds).
static CANCEL: AtomicBool = AtomicBool::new(false);

pub fn cancelled() -> bool {
    CANCEL.load(Ordering::Relaxed)
}

/// Ask all workers to stop at their next suspension point. Partial
/// results stay in the shared map.
pub fn request_cancel() {
    CANCEL.store(true, Ordering::Relaxed);
}

/// Fans a task list out over per-mirror workers and joins them.
pub struct Runner<'a, F: Fetch> {
    config: &'a Config,
    fetcher: &'a F,
    mirrors: &'a [MirrorTemplate],
    results: &'a Mutex<Records>,
    failures: &'a Mutex<Vec<PackageRef>>,
}

impl<'a, F: Fetch> Runner<'a, F> {
    pub fn new(
        config: &'a Config,
        fetcher: &'a F,
        mirrors: &'a [MirrorTemplate],
        results: &'a Mutex<Records>,
        failures: &'a Mutex<Vec<PackageRef>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            mirrors,
            results,
            failures,
        }
    }

    /// Run one phase over `packages` with the given per-task timeout and
    /// at most `max_workers` workers.
    ///
    /// Worker `i` owns a contiguous chunk of the task list and fetches
    /// from `mirrors[i]`, falling over to the mirrors left unassigned.
    /// Returns once every worker has drained its chunk or bailed out on
    /// cancellation.
    pub fn run(&self, packages: &[PackageRef], timeout: Duration, max_workers: usize) {
        if packages.is_empty() || self.mirrors.is_empty() || cancelled() {
            return;
        }

        let worker_count = max_workers
            .min(self.mirrors.len())
            .min(packages.len())
            .max(1);

        let backups = backup_mirrors(self.mirrors, worker_count, self.config.max_extra_urls);

        if worker_count == 1 {
            // No point paying for a thread; run on the caller.
            self.worker(&self.mirrors[0], backups).run(packages, timeout);
            return;
        }

        if self.config.verbose {
            println!("Starting {worker_count} workers...");
        }

        let bounds = chunk_bounds(packages.len(), worker_count);
        std::thread::scope(|scope| {
            for (index, &(start, end)) in bounds.iter().enumerate() {
                if cancelled() {
                    break;
                }
                let primary = &self.mirrors[index];
                if self.config.verbose {
                    println!("Worker {index} primary mirror: {primary}");
                }
                let worker = self.worker(primary, backups);
                let chunk = &packages[start..end];
                scope.spawn(move || worker.run(chunk, timeout));

                // Offset the starts so the workers' network and
                // decompression phases interleave.
                if index + 1 < bounds.len() {
                    std::thread::sleep(WORKER_START_OFFSET);
                }
            }
        });
    }

    fn worker(&self, primary: &'a MirrorTemplate, backups: &'a [MirrorTemplate]) -> Worker<'a, F> {
        Worker::new(
            self.config,
            self.fetcher,
            primary,
            backups,
            self.results,
            self.failures,
        )
    }
}

// Mirrors not claimed as a primary, capped at `max_extra`, shared by all
// workers as their failover set.
fn backup_mirrors(mirrors: &[MirrorTemplate], worker_count: usize, max_extra: usize) -> &[MirrorTemplate] {
    let start = worker_count.min(mirrors.len());
    let end = (start + max_extra).min(mirrors.len());
    &mirrors[start..end]
}

// Contiguous task ranges, one per worker; the last worker absorbs the
// remainder.
fn chunk_bounds(total: usize, workers: usize) -> Vec<(usize, usize)> {
    let per_worker = total / workers;
    (0..workers)
        .map(|i| {
            let start = i * per_worker;
            let end = if i == workers - 1 {
                total
            } else {
                start + per_worker
            };
            (start, end)
        })
        .collect()
}
