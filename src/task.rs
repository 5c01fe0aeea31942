use std::time::Instant;

use anyhow::{format_err, Error};

use crate::archive::{extract_member, probe_member, MTREE_MEMBER};
use crate::compress::{decompress_gz, decompress_xz, DecodeError};
use crate::config::Config;
use crate::fetch::{Fetch, FetchError};
use crate::mtree::parse_mtree;

/// How a single package attempt ended, when not with a file list.
#[derive(Debug)]
pub enum TaskError {
    /// The short fetch went through but the prefix could not answer;
    /// retry with a full fetch.
    RetryShort,
    /// The per-task deadline expired; try another mirror.
    Timeout,
    /// The run is being torn down; drop the task without recording.
    Cancelled,
    /// Terminal for this attempt; recorded as the package's error.
    Failed(Error),
}

impl From<FetchError> for TaskError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::TimedOut => TaskError::Timeout,
            FetchError::Cancelled => TaskError::Cancelled,
        }
    }
}

/// Probe path: fetch a prefix of the archive, decode what decodes, and
/// pull the file list straight out of the partial tar stream.
///
/// `Err(RetryShort)` means the prefix was not enough (member not found,
/// header cut off, unusual tar variant) and the caller should escalate
/// to [`run_full`].
pub fn run_short<F: Fetch>(
    fetcher: &F,
    url: &str,
    config: &Config,
    deadline: Instant,
) -> Result<Vec<String>, TaskError> {
    let archive = fetcher.fetch_prefix(url, config.short_fetch_size, deadline)?;
    if archive.is_empty() {
        return Err(TaskError::Failed(format_err!(
            "fetch_empty - unable to fetch {url}"
        )));
    }

    let tar_prefix = decompress_xz(&archive, deadline).map_err(decode_outer)?;
    drop(archive);

    let payload = probe_member(&tar_prefix, MTREE_MEMBER).ok_or(TaskError::RetryShort)?;
    drop(tar_prefix);

    decode_file_list(&payload, deadline)
}

/// Fallback path: fetch the whole archive and extract the file list via
/// a real tar reader, which understands the header variants the probe
/// does not.
pub fn run_full<F: Fetch>(
    fetcher: &F,
    url: &str,
    deadline: Instant,
) -> Result<Vec<String>, TaskError> {
    let archive = fetcher.fetch_all(url, deadline)?;
    if archive.is_empty() {
        return Err(TaskError::Failed(format_err!(
            "fetch_empty - unable to fetch {url}"
        )));
    }

    let tar_stream = decompress_xz(&archive, deadline).map_err(decode_outer)?;
    drop(archive);
    if tar_stream.is_empty() {
        return Err(TaskError::Failed(format_err!(
            "outer_decode - archive did not decompress"
        )));
    }

    let payload = extract_member(&tar_stream, MTREE_MEMBER)
        .map_err(|err| TaskError::Failed(format_err!("mtree_missing - {err}")))?;
    drop(tar_stream);

    decode_file_list(&payload, deadline)
}

fn decode_file_list(payload: &[u8], deadline: Instant) -> Result<Vec<String>, TaskError> {
    let mtree = decompress_gz(payload, deadline).map_err(decode_inner)?;
    Ok(parse_mtree(&String::from_utf8_lossy(&mtree)))
}

fn decode_outer(err: DecodeError) -> TaskError {
    match err {
        DecodeError::TimedOut => TaskError::Timeout,
        DecodeError::Cancelled => TaskError::Cancelled,
        DecodeError::Corrupt(err) => TaskError::Failed(format_err!("outer_decode - {err}")),
    }
}

fn decode_inner(err: DecodeError) -> TaskError {
    match err {
        DecodeError::TimedOut => TaskError::Timeout,
        DecodeError::Cancelled => TaskError::Cancelled,
        DecodeError::Corrupt(err) => TaskError::Failed(format_err!("inner_decode - {err}")),
    }
}
