use std::path::PathBuf;

use anyhow::Error;
use clap::Parser;

use pacman_providesdb::config::Config;
use pacman_providesdb::fetch::HttpFetcher;
use pacman_providesdb::providers::{PacmanMirrorlist, PacmanPackageList};
use pacman_providesdb::runner::request_cancel;
use pacman_providesdb::update::{self, Fatal};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ndatabase format: 0.2\nsupported database formats: 0.1, 0.2",
);

/// Downloads and extracts the file list from the repo packages into the
/// what-provides database.
#[derive(Parser)]
#[command(version, long_version = LONG_VERSION, about, long_about = None)]
struct Cli {
    /// Use one worker.
    #[arg(long)]
    single_thread: bool,

    /// Use N workers (capped at the number of mirrors).
    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Only convert the old database to the current format.
    #[arg(long)]
    convert: bool,

    /// Refresh packages with changed versions even if the listed version
    /// is older than the stored one.
    #[arg(long)]
    force_old_update: bool,

    /// Path of the what-provides database.
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Package architecture to index.
    #[arg(long, value_name = "ARCH")]
    arch: Option<String>,

    /// Verbose output; twice for per-mirror diagnostics.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { 1 } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = install_signal_handlers() {
        eprintln!("WARNING: could not install signal handlers - {err:#}");
    }

    let outcome = if cli.convert {
        update::convert(&config)
    } else {
        let fetcher = HttpFetcher::new(&config.arch);
        let mirrors = PacmanMirrorlist::new(&config.arch);
        let packages = PacmanPackageList;
        update::run(&config, &fetcher, &mirrors, &packages)
    };

    match outcome {
        Ok(()) => {}
        Err(fatal) => {
            eprintln!("{fatal}");
            std::process::exit(exit_code(&fatal));
        }
    }
}

fn build_config(cli: &Cli) -> Result<Config, Error> {
    let mut config = Config::default();

    match (cli.single_thread, cli.threads) {
        (true, Some(threads)) if threads > 1 => {
            anyhow::bail!("both --single-thread and a thread count > 1 given. Pick one.")
        }
        (true, _) => config.threads = 1,
        (false, Some(0)) => anyhow::bail!("number of threads must be at least 1"),
        (false, Some(threads)) => config.threads = threads,
        (false, None) => {}
    }

    if let Some(db_path) = &cli.db_path {
        config.db_path = db_path.clone();
    }
    if let Some(arch) = &cli.arch {
        config.arch = arch.clone();
    }
    config.force_old_update = cli.force_old_update;
    config.verbose = cli.verbose >= 1;
    config.super_verbose = cli.verbose >= 2;

    Ok(config)
}

// SIGINT/SIGTERM flip the cancellation flag; workers unwind at their
// next suspension point.
fn install_signal_handlers() -> Result<(), Error> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn handle(_signal: nix::libc::c_int) {
        request_cancel();
    }

    let action = SigAction::new(
        SigHandler::Handler(handle),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn exit_code(fatal: &Fatal) -> i32 {
    match fatal {
        Fatal::Precondition(_) => 1,
        Fatal::Declined => 2,
        Fatal::ConvertUnreadable => 3,
        Fatal::ConvertWriteFailed(_) => 4,
        Fatal::Interrupted => 32,
        Fatal::Other(_) => 1,
    }
}
