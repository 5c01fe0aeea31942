use std::io::Read;
use std::time::Instant;

use ureq::Agent;

use crate::runner::cancelled;

const USER_AGENT: &str = concat!("pacman-providesdb/", env!("CARGO_PKG_VERSION"));

const NOT_FOUND_MARKER: &[u8] = b"404 Not Found";

/// Non-content outcomes of a fetch. Ordinary transport failures are not
/// errors at this level: they surface as an empty body, which the task
/// layer records as `fetch_empty`.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchError {
    TimedOut,
    Cancelled,
}

/// Byte-range and whole-body downloads against one mirror.
///
/// The trait is the seam the task state machine is driven through; tests
/// substitute an in-memory implementation.
pub trait Fetch: Sync {
    /// Fetch up to the first `limit` bytes of `url`.
    fn fetch_prefix(&self, url: &str, limit: usize, deadline: Instant)
        -> Result<Vec<u8>, FetchError>;

    /// Fetch the entire body of `url`.
    fn fetch_all(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError>;
}

/// `ureq`-backed fetcher shared by all workers.
pub struct HttpFetcher {
    agent: Agent,
    arch: String,
}

impl HttpFetcher {
    pub fn new(arch: &str) -> Self {
        let agent = ureq::AgentBuilder::new().user_agent(USER_AGENT).build();
        Self {
            agent,
            arch: arch.to_string(),
        }
    }

    fn fetch(
        &self,
        url: &str,
        limit: Option<usize>,
        deadline: Instant,
        arch_fallback: bool,
    ) -> Result<Vec<u8>, FetchError> {
        if cancelled() {
            return Err(FetchError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(FetchError::TimedOut);
        }

        let request = self.agent.get(url).timeout(deadline - now);
        let body = match request.call() {
            Ok(response) => read_body(response.into_reader(), limit, deadline)?,
            // Error statuses still carry a body; mirrors answer missing
            // architecture-specific files with a 404 page.
            Err(ureq::Error::Status(_, response)) => {
                read_body(response.into_reader(), limit, deadline)?
            }
            Err(ureq::Error::Transport(_)) => {
                if Instant::now() >= deadline {
                    return Err(FetchError::TimedOut);
                }
                return Ok(Vec::new());
            }
        };

        if arch_fallback && contains(&body, NOT_FOUND_MARKER) {
            if let Some(fallback) = any_arch_url(url, &self.arch) {
                return self.fetch(&fallback, limit, deadline, false);
            }
        }

        Ok(body)
    }
}

impl Fetch for HttpFetcher {
    fn fetch_prefix(
        &self,
        url: &str,
        limit: usize,
        deadline: Instant,
    ) -> Result<Vec<u8>, FetchError> {
        self.fetch(url, Some(limit), deadline, true)
    }

    fn fetch_all(&self, url: &str, deadline: Instant) -> Result<Vec<u8>, FetchError> {
        self.fetch(url, None, deadline, true)
    }
}

fn read_body(
    reader: impl Read,
    limit: Option<usize>,
    deadline: Instant,
) -> Result<Vec<u8>, FetchError> {
    let mut data = Vec::new();
    let read = match limit {
        Some(limit) => reader.take(limit as u64).read_to_end(&mut data),
        None => {
            let mut reader = reader;
            reader.read_to_end(&mut data)
        }
    };
    if read.is_err() {
        if Instant::now() >= deadline {
            return Err(FetchError::TimedOut);
        }
        // Truncated transfer: hand back nothing, the task records it.
        return Ok(Vec::new());
    }
    Ok(data)
}

/// Rewrite the architecture suffix in the URL's file name to `any`, for
/// packages published architecture-independent. Returns `None` when the
/// file name carries no architecture suffix (no second try in that case).
fn any_arch_url(url: &str, arch: &str) -> Option<String> {
    let (base, filename) = url.rsplit_once('/')?;
    let suffix = format!("-{arch}");
    if !filename.contains(&suffix) {
        return None;
    }
    Some(format!("{}/{}", base, filename.replace(&suffix, "-any")))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
