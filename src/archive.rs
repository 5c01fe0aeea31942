use std::io::Read;
use std::path::Path;

use anyhow::{bail, Error};
use tar::Archive;

/// The file list member embedded in every package archive.
pub const MTREE_MEMBER: &str = ".MTREE";

// ustar header layout: the size field is ASCII octal at a fixed slot,
// payload follows the 512-byte header block.
const HEADER_LEN: usize = 512;
const SIZE_FIELD_START: usize = 124;
const SIZE_FIELD_END: usize = 136;

/// Probe a partial tar stream for `member` and return its raw payload.
///
/// The search runs back to front: some archive variants carry an
/// auxiliary listing that also contains the member name, and the last
/// occurrence is the real header. `None` means the buffer cannot answer
/// (name absent, header incomplete, size unparseable, or payload cut
/// off) and the caller should fall back to a full fetch.
pub fn probe_member(buf: &[u8], member: &str) -> Option<Vec<u8>> {
    let header_start = rfind(buf, member.as_bytes())?;
    let header = &buf[header_start..];

    if header.len() < SIZE_FIELD_END {
        return None;
    }

    let size = parse_octal_size(&header[SIZE_FIELD_START..SIZE_FIELD_END])?;

    let payload_end = HEADER_LEN.checked_add(size)?;
    if payload_end > header.len() {
        return None;
    }

    Some(header[HEADER_LEN..payload_end].to_vec())
}

/// Extract `member` from a complete tar stream.
///
/// Handles every header variant the `tar` crate understands; this is the
/// slow path behind the probe above.
pub fn extract_member(tar_stream: &[u8], member: &str) -> Result<Vec<u8>, Error> {
    let wanted = Path::new(member);
    let mut archive = Archive::new(tar_stream);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let matches = path == wanted
            || path
                .strip_prefix(".")
                .map(|stripped| stripped == wanted)
                .unwrap_or(false);
        if matches {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            return Ok(data);
        }
    }

    bail!("no {member} member in archive");
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn parse_octal_size(field: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c == ' ');
    if trimmed.is_empty() {
        return None;
    }
    usize::from_str_radix(trimmed, 8).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gz_compress, tar_archive, SAMPLE_MTREE};

    fn mtree_tar() -> (Vec<u8>, Vec<u8>) {
        let payload = gz_compress(SAMPLE_MTREE.as_bytes());
        let tar = tar_archive(&[(".MTREE", payload.as_slice())]);
        (tar, payload)
    }

    #[test]
    fn probe_returns_member_payload() {
        let (tar, payload) = mtree_tar();
        assert_eq!(probe_member(&tar, MTREE_MEMBER).unwrap(), payload);
    }

    #[test]
    fn probe_matches_full_extraction() {
        let (tar, _) = mtree_tar();
        let probed = probe_member(&tar, MTREE_MEMBER).unwrap();
        let extracted = extract_member(&tar, MTREE_MEMBER).unwrap();
        assert_eq!(probed, extracted);
    }

    #[test]
    fn probe_takes_last_occurrence() {
        // Fake auxiliary listing mentioning the member name before the
        // real header.
        let (tar, payload) = mtree_tar();
        let mut buf = b"pax listing: .MTREE .PKGINFO\0\0\0\0".to_vec();
        buf.extend_from_slice(&tar);
        assert_eq!(probe_member(&buf, MTREE_MEMBER).unwrap(), payload);
    }

    #[test]
    fn probe_without_member_asks_for_retry() {
        let tar = tar_archive(&[(".PKGINFO", b"pkgname = a".as_slice())]);
        assert!(probe_member(&tar, MTREE_MEMBER).is_none());
    }

    #[test]
    fn probe_with_truncated_header_asks_for_retry() {
        let (tar, _) = mtree_tar();
        // Cut inside the size field.
        assert!(probe_member(&tar[..SIZE_FIELD_START + 4], MTREE_MEMBER).is_none());
    }

    #[test]
    fn probe_with_truncated_payload_asks_for_retry() {
        let (tar, payload) = mtree_tar();
        let cut = HEADER_LEN + payload.len() / 2;
        assert!(probe_member(&tar[..cut], MTREE_MEMBER).is_none());
    }

    #[test]
    fn probe_with_mangled_size_field_asks_for_retry() {
        let (mut tar, _) = mtree_tar();
        tar[SIZE_FIELD_START..SIZE_FIELD_END].copy_from_slice(b"zzzzzzzzzzzz");
        assert!(probe_member(&tar, MTREE_MEMBER).is_none());
    }

    #[test]
    fn extract_missing_member_fails() {
        let tar = tar_archive(&[(".PKGINFO", b"pkgname = a".as_slice())]);
        assert!(extract_member(&tar, MTREE_MEMBER).is_err());
    }

    #[test]
    fn extract_handles_leading_dot_slash_paths() {
        let payload = gz_compress(SAMPLE_MTREE.as_bytes());
        let tar = tar_archive(&[("./.MTREE", payload.as_slice())]);
        assert_eq!(extract_member(&tar, MTREE_MEMBER).unwrap(), payload);
    }
}
