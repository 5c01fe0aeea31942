use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db::{PackageRecord, Records};
use crate::fetch::Fetch;
use crate::providers::MirrorTemplate;
use crate::runner::cancelled;
use crate::task::{self, TaskError};
use crate::types::PackageRef;

// How one package ended up, after all mirrors were tried.
enum Outcome {
    Done(Vec<String>),
    Failed(anyhow::Error),
    TimedOutEverywhere,
    Cancelled,
}

/// Drains its chunk of the task list against one primary mirror,
/// failing over to the shared backup mirrors on timeouts.
///
/// Each package name in the chunk is owned by this worker for the
/// duration of the phase, so inserts into the shared map never race on
/// a key.
pub struct Worker<'a, F: Fetch> {
    config: &'a Config,
    fetcher: &'a F,
    primary: &'a MirrorTemplate,
    backups: &'a [MirrorTemplate],
    results: &'a Mutex<Records>,
    failures: &'a Mutex<Vec<PackageRef>>,
}

impl<'a, F: Fetch> Worker<'a, F> {
    pub fn new(
        config: &'a Config,
        fetcher: &'a F,
        primary: &'a MirrorTemplate,
        backups: &'a [MirrorTemplate],
        results: &'a Mutex<Records>,
        failures: &'a Mutex<Vec<PackageRef>>,
    ) -> Self {
        Self {
            config,
            fetcher,
            primary,
            backups,
            results,
            failures,
        }
    }

    /// Process every package in `chunk` in order. `timeout` is the
    /// per-attempt budget for the first try against each mirror; the
    /// escalated full fetch always gets the long timeout.
    pub fn run(&self, chunk: &[PackageRef], timeout: Duration) {
        let mut last_start: Option<Instant> = None;

        for package in chunk {
            self.pace(&mut last_start);
            if cancelled() {
                return;
            }

            if self.config.verbose {
                println!("Processing {} - {}:", package.repo, package.name);
            }

            match self.try_mirrors(package, timeout) {
                Outcome::Done(files) => {
                    if self.config.verbose {
                        println!("Got {} files for {}.", files.len(), package.name);
                    }
                    self.record(package, PackageRecord::success(files, &package.version));
                }
                Outcome::Failed(err) => {
                    let message =
                        format!("Error processing {} - {} : {err:#}", package.repo, package.name);
                    eprintln!("{message}");
                    self.record(package, PackageRecord::failure(&package.version, message));
                    self.failures.lock().unwrap().push(package.clone());
                }
                Outcome::TimedOutEverywhere => {
                    let message = format!(
                        "Error TIMEOUT processing {} - {} : no mirror finished within the timeout",
                        package.repo, package.name
                    );
                    eprintln!("{message}");
                    self.record(package, PackageRecord::failure(&package.version, message));
                    self.failures.lock().unwrap().push(package.clone());
                }
                // Drop the in-flight task on the floor; whatever was
                // recorded before the interrupt is kept.
                Outcome::Cancelled => return,
            }
        }
    }

    // Primary first; on timeout walk the backup mirrors. Non-timeout
    // failures are terminal for the package.
    fn try_mirrors(&self, package: &PackageRef, timeout: Duration) -> Outcome {
        match self.attempt(package, self.primary, timeout) {
            Ok(files) => return Outcome::Done(files),
            Err(TaskError::Failed(err)) => return Outcome::Failed(err),
            Err(TaskError::Cancelled) => return Outcome::Cancelled,
            Err(TaskError::Timeout) => {}
            Err(TaskError::RetryShort) => unreachable!("attempt escalates retries"),
        }

        for backup in self.backups {
            if cancelled() {
                return Outcome::Cancelled;
            }
            if self.config.super_verbose {
                println!(
                    "Timed out fetching {} - {}, trying backup mirror {backup}",
                    package.repo, package.name
                );
            }
            match self.attempt(package, backup, timeout) {
                Ok(files) => return Outcome::Done(files),
                Err(TaskError::Failed(err)) => return Outcome::Failed(err),
                Err(TaskError::Cancelled) => return Outcome::Cancelled,
                Err(TaskError::Timeout) => continue,
                Err(TaskError::RetryShort) => unreachable!("attempt escalates retries"),
            }
        }

        Outcome::TimedOutEverywhere
    }

    // The two-stage attempt against a single mirror: short fetch with
    // `timeout`, escalating to the full fetch with the long timeout when
    // the prefix cannot answer.
    fn attempt(
        &self,
        package: &PackageRef,
        mirror: &MirrorTemplate,
        timeout: Duration,
    ) -> Result<Vec<String>, TaskError> {
        let url = mirror.package_url(&package.repo, &package.archive_name(&self.config.arch));
        if self.config.verbose {
            println!("Fetching url: {url}");
        }

        let deadline = Instant::now() + timeout;
        match task::run_short(self.fetcher, &url, self.config, deadline) {
            Err(TaskError::RetryShort) => {
                if self.config.verbose {
                    println!(
                        "Using full fetch for {} - {}",
                        package.repo, package.name
                    );
                }
                let deadline = Instant::now() + self.config.long_timeout;
                task::run_full(self.fetcher, &url, deadline)
            }
            other => other,
        }
    }

    fn record(&self, package: &PackageRef, record: PackageRecord) {
        self.results
            .lock()
            .unwrap()
            .insert(package.name.clone(), record);
    }

    // Hold back until at least the pacing interval has passed since the
    // previous task started, polling for cancellation along the way. An
    // interval already used up means no sleep at all.
    fn pace(&self, last_start: &mut Option<Instant>) {
        if let Some(previous) = *last_start {
            let mut remaining = self.config.pacing.saturating_sub(previous.elapsed());
            while remaining > Duration::ZERO && !cancelled() {
                let slice = remaining.min(Duration::from_millis(100));
                std::thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
        *last_start = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchError;
    use crate::testutil::{package_archive, FakeFetcher, TimeoutFetcher, SAMPLE_MTREE};

    fn mirror(host: &str) -> MirrorTemplate {
        MirrorTemplate::parse(&format!("https://{host}/archlinux/$repo/os/$arch"), "x86_64")
            .unwrap()
    }

    fn test_config() -> Config {
        Config {
            pacing: Duration::ZERO,
            ..Config::default()
        }
    }

    fn run_worker<F: Fetch>(
        fetcher: &F,
        primary: &MirrorTemplate,
        backups: &[MirrorTemplate],
        chunk: &[PackageRef],
    ) -> (Records, Vec<PackageRef>) {
        let config = test_config();
        let results = Mutex::new(Records::new());
        let failures = Mutex::new(Vec::new());
        Worker::new(&config, fetcher, primary, backups, &results, &failures)
            .run(chunk, Duration::from_secs(5));
        (results.into_inner().unwrap(), failures.into_inner().unwrap())
    }

    #[test]
    fn successful_package_is_recorded() {
        let primary = mirror("one.example");
        let package = PackageRef::new("core", "pkg-a", "1.0");

        let mut fetcher = FakeFetcher::new();
        let url = primary.package_url("core", &package.archive_name("x86_64"));
        fetcher.insert(&url, package_archive(SAMPLE_MTREE, 0));

        let (results, failures) = run_worker(&fetcher, &primary, &[], &[package]);

        let record = &results["pkg-a"];
        assert_eq!(
            record.files,
            vec!["/usr/bin/a".to_string(), "/usr/share/a/readme".to_string()]
        );
        assert_eq!(record.version, "1.0");
        assert!(record.error.is_none());
        assert!(failures.is_empty());
    }

    #[test]
    fn fetch_failure_is_recorded_and_reported() {
        let primary = mirror("dead.example");
        let package = PackageRef::new("core", "pkg-a", "1.0");

        // FakeFetcher serves nothing: empty bodies, like a broken mirror.
        let (results, failures) = run_worker(&FakeFetcher::new(), &primary, &[], &[package.clone()]);

        let record = &results["pkg-a"];
        assert!(record.files.is_empty());
        assert_eq!(record.version, "1.0");
        let error = record.error.as_deref().unwrap();
        assert!(error.starts_with("Error processing core - pkg-a"));
        assert!(error.contains("fetch_empty"));
        assert_eq!(failures, vec![package]);
    }

    #[test]
    fn timeout_on_every_mirror_is_recorded_as_timeout() {
        let primary = mirror("slow.example");
        let backups = vec![
            mirror("slow2.example"),
            mirror("slow3.example"),
            mirror("slow4.example"),
        ];
        let package = PackageRef::new("core", "pkg-x", "2.0");

        let (results, failures) =
            run_worker(&TimeoutFetcher, &primary, &backups, &[package.clone()]);

        let record = &results["pkg-x"];
        assert!(record.files.is_empty());
        assert_eq!(record.version, "2.0");
        assert!(record
            .error
            .as_deref()
            .unwrap()
            .starts_with("Error TIMEOUT processing core - pkg-x"));
        assert_eq!(failures, vec![package]);
    }

    #[test]
    fn backup_mirror_rescues_a_timed_out_primary() {
        // Times out on the primary host, serves from the backup.
        struct FlakyPrimary {
            backup: FakeFetcher,
        }
        impl Fetch for FlakyPrimary {
            fn fetch_prefix(
                &self,
                url: &str,
                limit: usize,
                deadline: Instant,
            ) -> Result<Vec<u8>, FetchError> {
                if url.contains("slow.example") {
                    return Err(FetchError::TimedOut);
                }
                self.backup.fetch_prefix(url, limit, deadline)
            }
            fn fetch_all(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError> {
                if url.contains("slow.example") {
                    return Err(FetchError::TimedOut);
                }
                self.backup.fetch_all(url, deadline)
            }
        }

        let primary = mirror("slow.example");
        let backup = mirror("good.example");
        let package = PackageRef::new("core", "pkg-a", "1.0");

        let mut backing = FakeFetcher::new();
        let url = backup.package_url("core", &package.archive_name("x86_64"));
        backing.insert(&url, package_archive(SAMPLE_MTREE, 0));
        let fetcher = FlakyPrimary { backup: backing };

        let (results, failures) =
            run_worker(&fetcher, &primary, std::slice::from_ref(&backup), &[package]);

        assert!(results["pkg-a"].error.is_none());
        assert!(failures.is_empty());
    }

    #[test]
    fn pacing_spaces_consecutive_tasks() {
        let primary = mirror("one.example");
        let packages = vec![
            PackageRef::new("core", "pkg-a", "1.0"),
            PackageRef::new("core", "pkg-b", "1.0"),
        ];

        let mut fetcher = FakeFetcher::new();
        let archive = package_archive(SAMPLE_MTREE, 0);
        for package in &packages {
            let url = primary.package_url("core", &package.archive_name("x86_64"));
            fetcher.insert(&url, archive.clone());
        }

        let config = Config {
            pacing: Duration::from_millis(200),
            ..Config::default()
        };
        let results = Mutex::new(Records::new());
        let failures = Mutex::new(Vec::new());

        let started = Instant::now();
        Worker::new(&config, &fetcher, &primary, &[], &results, &failures)
            .run(&packages, Duration::from_secs(5));

        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(results.into_inner().unwrap().len(), 2);
    }
}
