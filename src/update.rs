use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{format_err, Error};
use rand::seq::SliceRandom;

use crate::config::Config;
use crate::db::{self, Records};
use crate::fetch::Fetch;
use crate::helpers::tty::read_bool_from_tty;
use crate::providers::{MirrorProvider, PackageProvider};
use crate::runner::{cancelled, Runner};
use crate::types::PackageRef;

/// Failures that end the run, each mapping to a process exit code in
/// the binary.
#[derive(Debug)]
pub enum Fatal {
    /// Bad precondition: no mirrors, provider failure, user abort at the
    /// parallelism prompt.
    Precondition(Error),
    /// User declined the write-access prompt.
    Declined,
    /// `--convert` was requested but the database could not be read.
    ConvertUnreadable,
    /// `--convert` migrated the database but could not write it back.
    ConvertWriteFailed(Error),
    /// Interrupted by the user; partial work is discarded.
    Interrupted,
    /// Anything else, e.g. the final database write failing entirely.
    Other(Error),
}

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fatal::Precondition(err) => write!(f, "{err:#}"),
            Fatal::Declined => write!(f, "aborted at user request"),
            Fatal::ConvertUnreadable => write!(f, "database cannot be read for conversion"),
            Fatal::ConvertWriteFailed(err) => write!(f, "failed to write converted database - {err:#}"),
            Fatal::Interrupted => write!(f, "interrupted"),
            Fatal::Other(err) => write!(f, "{err:#}"),
        }
    }
}

/// Migrate the database in place and stop; nothing is fetched.
pub fn convert(config: &Config) -> Result<(), Fatal> {
    match db::load(&config.db_path) {
        Ok(Some(loaded)) => {
            if loaded.was_latest() {
                eprintln!("No need to update, already at latest version.");
                return Ok(());
            }
            match db::write(&loaded.records, &config.db_path) {
                Ok(path) if path == config.db_path => {
                    println!("Successfully updated database.");
                    Ok(())
                }
                // The fallback location is no use for an in-place convert.
                Ok(fallback) => Err(Fatal::ConvertWriteFailed(format_err!(
                    "database landed in {fallback:?} instead of {:?}",
                    config.db_path
                ))),
                Err(err) => Err(Fatal::ConvertWriteFailed(err)),
            }
        }
        Ok(None) => {
            eprintln!(
                "Asked to convert old database, but could not read successfully from {:?}",
                config.db_path
            );
            Err(Fatal::ConvertUnreadable)
        }
        Err(err) => {
            eprintln!("{err:#}");
            Err(Fatal::ConvertUnreadable)
        }
    }
}

/// The full update pipeline: diff against the previous database, fetch
/// what changed, retry failures in up to two more phases, write the
/// result.
pub fn run<F: Fetch>(
    config: &Config,
    fetcher: &F,
    mirror_provider: &dyn MirrorProvider,
    package_provider: &dyn PackageProvider,
) -> Result<(), Fatal> {
    // Without mirrors there is nothing to do; find out before touching
    // anything else.
    let mirrors = mirror_provider
        .mirrors(config.threads + config.max_extra_urls)
        .map_err(Fatal::Precondition)?;
    println!("Using mirrors:");
    for mirror in &mirrors {
        println!("\t{mirror}");
    }
    println!();

    package_provider.refresh();

    let all_packages = package_provider.packages().map_err(Fatal::Precondition)?;
    println!("Read {} total packages.", all_packages.len());

    // Carry over everything the previous database already answers.
    let results = Mutex::new(Records::new());
    let pending = match db::load(&config.db_path) {
        Ok(Some(loaded)) => {
            println!(
                "Read {} records from old database. Trimming non-updates...",
                loaded.records.len()
            );
            let (carried, pending) = db::diff(loaded.records, &all_packages, config);
            *results.lock().unwrap() = carried;
            println!("\nTrimmed number of updates required to {}\n", pending.len());
            pending
        }
        Ok(None) => {
            eprintln!(
                "WARNING: Cannot read old Provides DB at {:?}. Will query every package (instead of just updates)",
                config.db_path
            );
            all_packages.clone()
        }
        Err(err) => {
            eprintln!("Error reading old database (will perform a full update): {err:#}");
            all_packages.clone()
        }
    };

    if !db_writable(&config.db_path) {
        println!(
            "Cannot write to {:?}. Will create temp file.",
            config.db_path
        );
        match read_bool_from_tty("Continue? (y/n)", None) {
            Ok(true) => {}
            _ => return Err(Fatal::Declined),
        }
    }

    let worker_count = if mirrors.len() < config.threads {
        println!(
            "WARNING: Number of available mirrors [{}] is less than the configured number of workers [{}].\n\
             Recommended to uncomment more mirrors. See --help for changing the number of workers.",
            mirrors.len(),
            config.threads
        );
        let shrink = read_bool_from_tty(
            &format!("Limit workers to {} and continue? (y/n)", mirrors.len()),
            None,
        );
        if !matches!(shrink, Ok(true)) {
            return Err(Fatal::Precondition(format_err!(
                "aborting based on user input"
            )));
        }
        mirrors.len()
    } else {
        config.threads
    };

    // Phase 1: everything, short timeout.
    let phase1_failures = Mutex::new(Vec::new());
    Runner::new(config, fetcher, &mirrors, &results, &phase1_failures).run(
        &pending,
        config.short_timeout,
        worker_count,
    );
    check_interrupt()?;
    drop(pending);

    let mut failed = phase1_failures.into_inner().unwrap();
    if !failed.is_empty() {
        // Phase 2: rest, refresh metadata, shuffle across mirrors, long
        // timeout.
        eprintln!(
            "Need to retry {} packages. Resting for a minute....",
            failed.len()
        );
        rest(config.retry_rest);
        check_interrupt()?;

        if worker_count > 1 {
            failed.shuffle(&mut rand::thread_rng());
        }
        package_provider.refresh();

        let phase2_failures = Mutex::new(Vec::new());
        Runner::new(config, fetcher, &mirrors, &results, &phase2_failures).run(
            &failed,
            config.long_timeout,
            worker_count,
        );
        check_interrupt()?;

        let still_failed = phase2_failures.into_inner().unwrap();
        if !still_failed.is_empty() {
            report_retry_failures(&still_failed, &results);

            // Phase 3: only packages whose version moved since we
            // started, one worker, every mirror available to it.
            if package_provider.refresh() {
                let survivors =
                    retry_updated_packages(config, fetcher, package_provider, &mirrors, &results, &still_failed)?;

                if !survivors.is_empty() {
                    eprintln!(
                        "EVEN after refreshing package database, the following packages are total failures:\n\t{}",
                        survivors
                            .iter()
                            .map(|p| p.name.as_str())
                            .collect::<Vec<_>>()
                            .join("\n\t")
                    );
                }
            }
        }
    }

    let records = results.into_inner().unwrap();
    db::write(&records, &config.db_path).map_err(Fatal::Other)?;
    println!("\nSuccess.\nDatabase size: {}", records.len());

    Ok(())
}

fn retry_updated_packages<F: Fetch>(
    config: &Config,
    fetcher: &F,
    package_provider: &dyn PackageProvider,
    mirrors: &[crate::providers::MirrorTemplate],
    results: &Mutex<Records>,
    still_failed: &[PackageRef],
) -> Result<Vec<PackageRef>, Fatal> {
    let failed_versions: HashMap<&str, &str> = still_failed
        .iter()
        .map(|p| (p.name.as_str(), p.version.as_str()))
        .collect();

    let updated: Vec<PackageRef> = match package_provider.packages() {
        Ok(listing) => listing
            .into_iter()
            .filter(|p| {
                failed_versions
                    .get(p.name.as_str())
                    .is_some_and(|&version| version != p.version)
            })
            .collect(),
        Err(err) => {
            eprintln!("WARNING: could not re-read package list - {err:#}");
            Vec::new()
        }
    };

    let phase3_failures = Mutex::new(Vec::new());
    Runner::new(config, fetcher, mirrors, results, &phase3_failures).run(
        &updated,
        config.long_timeout,
        1,
    );
    check_interrupt()?;

    // Whatever phase 3 could not retry is still a failure.
    let retried: HashSet<&str> = updated.iter().map(|p| p.name.as_str()).collect();
    let mut survivors = phase3_failures.into_inner().unwrap();
    survivors.extend(
        still_failed
            .iter()
            .filter(|p| !retried.contains(p.name.as_str()))
            .cloned(),
    );
    Ok(survivors)
}

fn report_retry_failures(still_failed: &[PackageRef], results: &Mutex<Records>) {
    let results = results.lock().unwrap();
    let lines: Vec<String> = still_failed
        .iter()
        .map(|p| {
            let error = results
                .get(&p.name)
                .and_then(|record| record.error.as_deref())
                .unwrap_or("unknown error");
            format!("\t[{}] {}-{}  \t{}", p.repo, p.name, p.version, error)
        })
        .collect();
    eprintln!(
        "After completing, still {} failed packages.\nFailed after retry:\n{}\n",
        still_failed.len(),
        lines.join("\n")
    );
}

// Writable when the file itself accepts writes, or does not exist yet in
// a directory that does.
fn db_writable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};

    if path.exists() {
        return access(path, AccessFlags::W_OK).is_ok();
    }
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => access(".", AccessFlags::W_OK).is_ok(),
        Some(parent) => access(parent, AccessFlags::W_OK).is_ok(),
        None => false,
    }
}

fn check_interrupt() -> Result<(), Fatal> {
    if cancelled() {
        eprintln!("\nCAUGHT INTERRUPT, CLOSING DOWN WORKERS...\n");
        Err(Fatal::Interrupted)
    } else {
        Ok(())
    }
}

fn rest(duration: Duration) {
    let mut remaining = duration;
    while remaining > Duration::ZERO && !cancelled() {
        let slice = remaining.min(Duration::from_millis(100));
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}
