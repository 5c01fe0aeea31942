use std::cmp::Ordering;
use std::fmt::Display;

/// Identifies one package in the active repositories.
///
/// Produced by the package list provider at startup; never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageRef {
    pub repo: String,
    pub name: String,
    pub version: String,
}

impl PackageRef {
    pub fn new(repo: &str, name: &str, version: &str) -> Self {
        Self {
            repo: repo.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    /// Archive file name for this package on a mirror, e.g.
    /// `binutils-2.28.0-2-x86_64.pkg.tar.xz`.
    pub fn archive_name(&self, arch: &str) -> String {
        format!("{}-{}-{}.pkg.tar.xz", self.name, self.version, arch)
    }
}

impl Display for PackageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}-{}", self.repo, self.name, self.version)
    }
}

/// Compare two pacman version strings (`[epoch:]version[-pkgrel]`).
///
/// Follows libalpm's vercmp rules: the epoch dominates, then the version
/// and pkgrel parts are compared segment-wise with numeric segments
/// ordered above alphabetic ones. An empty string sorts below everything.
pub fn vercmp(a: &str, b: &str) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }
    match (a.is_empty(), b.is_empty()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let (epoch_a, rest_a) = split_epoch(a);
    let (epoch_b, rest_b) = split_epoch(b);
    if epoch_a != epoch_b {
        return epoch_a.cmp(&epoch_b);
    }

    let (ver_a, rel_a) = split_pkgrel(rest_a);
    let (ver_b, rel_b) = split_pkgrel(rest_b);

    let ver_order = rpm_vercmp(ver_a, ver_b);
    if ver_order != Ordering::Equal {
        return ver_order;
    }

    match (rel_a, rel_b) {
        (Some(rel_a), Some(rel_b)) => rpm_vercmp(rel_a, rel_b),
        _ => Ordering::Equal,
    }
}

fn split_epoch(version: &str) -> (u64, &str) {
    match version.split_once(':') {
        Some((epoch, rest)) => (epoch.parse().unwrap_or(0), rest),
        None => (0, version),
    }
}

fn split_pkgrel(version: &str) -> (&str, Option<&str>) {
    match version.rsplit_once('-') {
        Some((ver, rel)) => (ver, Some(rel)),
        None => (version, None),
    }
}

// Segment-wise comparison shared by the version and pkgrel parts. Walks
// maximal runs of digits or letters, treating any other bytes as
// separators.
fn rpm_vercmp(a: &str, b: &str) -> Ordering {
    let mut one = a.as_bytes();
    let mut two = b.as_bytes();

    loop {
        one = skip_separators(one);
        two = skip_separators(two);

        if one.is_empty() || two.is_empty() {
            break;
        }

        let one_numeric = one[0].is_ascii_digit();
        let two_numeric = two[0].is_ascii_digit();

        // A numeric segment is always newer than an alphabetic one.
        if one_numeric != two_numeric {
            return if one_numeric {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }

        let (seg_one, rest_one) = take_segment(one, one_numeric);
        let (seg_two, rest_two) = take_segment(two, two_numeric);
        one = rest_one;
        two = rest_two;

        let order = if one_numeric {
            compare_numeric(seg_one, seg_two)
        } else {
            seg_one.cmp(seg_two)
        };
        if order != Ordering::Equal {
            return order;
        }
    }

    match (one.is_empty(), two.is_empty()) {
        (true, true) => Ordering::Equal,
        // A trailing alphabetic segment sorts below its absence ("1.0a" < "1.0"),
        // any other trailing content sorts above ("1.0.1" > "1.0").
        (true, false) => {
            if two[0].is_ascii_alphabetic() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if one[0].is_ascii_alphabetic() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => unreachable!(),
    }
}

fn skip_separators(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|b| b.is_ascii_alphanumeric())
        .unwrap_or(s.len());
    &s[start..]
}

fn take_segment(s: &[u8], numeric: bool) -> (&[u8], &[u8]) {
    let end = s
        .iter()
        .position(|b| {
            if numeric {
                !b.is_ascii_digit()
            } else {
                !b.is_ascii_alphabetic()
            }
        })
        .unwrap_or(s.len());
    s.split_at(end)
}

fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let a = trim_leading_zeros(a);
    let b = trim_leading_zeros(b);
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    a.cmp(b)
}

fn trim_leading_zeros(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&b| b != b'0').unwrap_or(s.len());
    &s[start..]
}
