//! In-memory archive fixtures and fetcher doubles shared by the unit
//! tests.

use std::collections::HashMap;
use std::io::Write;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, Header};
use xz2::write::XzEncoder;

use crate::fetch::{Fetch, FetchError};

pub(crate) fn gz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub(crate) fn xz_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Plain tar stream with the given entries, in order.
pub(crate) fn tar_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A well-formed `.pkg.tar.xz` with the gzipped mtree as its `.MTREE`
/// member. With `padding > 0` an incompressible filler entry is placed
/// first, pushing the mtree that many bytes into the archive.
pub(crate) fn package_archive(mtree_text: &str, padding: usize) -> Vec<u8> {
    let mtree_gz = gz_compress(mtree_text.as_bytes());

    let tar = if padding > 0 {
        let filler = incompressible(padding);
        tar_archive(&[(".PKGINFO", filler.as_slice()), (".MTREE", &mtree_gz)])
    } else {
        tar_archive(&[(".MTREE", mtree_gz.as_slice())])
    };

    xz_compress(&tar)
}

// xorshift filler so xz cannot shrink the padding away.
fn incompressible(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

pub(crate) const SAMPLE_MTREE: &str = "\
#mtree
/set type=file uid=0 gid=0 mode=644
./usr/bin/a time=1493410000.0 mode=755 size=10224
./usr/share/a/readme time=1493410000.0 size=133
";

/// Serves canned bodies by URL; unknown URLs come back empty, like a
/// dead mirror.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    bodies: HashMap<String, Vec<u8>>,
}

impl FakeFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, url: &str, body: Vec<u8>) {
        self.bodies.insert(url.to_string(), body);
    }
}

impl Fetch for FakeFetcher {
    fn fetch_prefix(
        &self,
        url: &str,
        limit: usize,
        _deadline: Instant,
    ) -> Result<Vec<u8>, FetchError> {
        Ok(self
            .bodies
            .get(url)
            .map(|body| body[..body.len().min(limit)].to_vec())
            .unwrap_or_default())
    }

    fn fetch_all(&self, url: &str, _deadline: Instant) -> Result<Vec<u8>, FetchError> {
        Ok(self.bodies.get(url).cloned().unwrap_or_default())
    }
}

/// Every fetch runs into its deadline, like an unresponsive mirror.
pub(crate) struct TimeoutFetcher;

impl Fetch for TimeoutFetcher {
    fn fetch_prefix(
        &self,
        _url: &str,
        _limit: usize,
        _deadline: Instant,
    ) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::TimedOut)
    }

    fn fetch_all(&self, _url: &str, _deadline: Instant) -> Result<Vec<u8>, FetchError> {
        Err(FetchError::TimedOut)
    }
}
