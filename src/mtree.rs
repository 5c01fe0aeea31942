use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // File entries look like `./usr/bin/ls time=1493410... mode=755 ...`.
    // The capture drops the leading dot, leaving an absolute path.
    static ref MTREE_ENTRY: Regex = Regex::new(r"^\.(?P<path>.+) time").unwrap();
}

/// Extract the installed paths from decoded `.MTREE` contents.
///
/// Total over any input: lines not describing a file entry (the `#mtree`
/// signature, `/set` defaults, blank lines) are skipped silently.
pub fn parse_mtree(contents: &str) -> Vec<String> {
    let mut paths = Vec::new();

    for line in contents.split('\n') {
        if !line.starts_with('.') {
            continue;
        }
        if let Some(captures) = MTREE_ENTRY.captures(line) {
            paths.push(captures["path"].to_string());
        }
    }

    paths
}
