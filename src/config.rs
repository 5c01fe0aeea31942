use std::path::PathBuf;
use std::time::Duration;

/// Default location of the what-provides database.
pub const DEFAULT_DB_PATH: &str = "/var/lib/pacman/.providesDB";

/// Package architecture to fetch. Architecture-independent packages are
/// published with an `any` suffix instead; the fetcher falls back to it.
pub const DEFAULT_ARCH: &str = "x86_64";

/// Prefix size for the short fetch. The `.MTREE` member sits near the
/// start of the archive and is almost always contained in the first 200 KiB.
pub const DEFAULT_SHORT_FETCH_SIZE: usize = 200 * 1024;

pub const SHORT_TIMEOUT: Duration = Duration::from_secs(15);
pub const LONG_TIMEOUT: Duration = Duration::from_secs(8 * 60);

/// Default number of workers, one mirror each.
pub const MAX_THREADS: usize = 6;

/// Backup mirrors handed to each worker beyond its primary.
pub const MAX_EXTRA_URLS: usize = 3;

/// Minimum delay between task starts within one worker. Bounds the
/// request rate seen by any single mirror.
pub const PACING_INTERVAL: Duration = Duration::from_millis(1500);

/// Stagger between worker starts, so their network and decompression
/// phases don't line up.
pub const WORKER_START_OFFSET: Duration = Duration::from_millis(350);

/// Pause before the first retry phase, giving flaky mirrors a moment.
pub const RETRY_REST: Duration = Duration::from_secs(60);

/// Runtime configuration, immutable after CLI parsing. Passed by
/// reference through the runner and workers.
#[derive(Clone, Debug)]
pub struct Config {
    pub arch: String,
    pub db_path: PathBuf,
    pub short_fetch_size: usize,
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub threads: usize,
    pub max_extra_urls: usize,
    pub pacing: Duration,
    pub retry_rest: Duration,
    pub force_old_update: bool,
    pub verbose: bool,
    pub super_verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arch: DEFAULT_ARCH.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            short_fetch_size: DEFAULT_SHORT_FETCH_SIZE,
            short_timeout: SHORT_TIMEOUT,
            long_timeout: LONG_TIMEOUT,
            threads: MAX_THREADS,
            max_extra_urls: MAX_EXTRA_URLS,
            pacing: PACING_INTERVAL,
            retry_rest: RETRY_REST,
            force_old_update: false,
            verbose: false,
            super_verbose: false,
        }
    }
}
