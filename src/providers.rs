use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::types::PackageRef;

lazy_static! {
    static ref SERVER_LINE: Regex =
        Regex::new(r"^[ \t]*[sS]erver[ \t]*=[ \t]*(?P<url>[^ \t#]+)[ \t]*([#].*)?$").unwrap();
}

/// A mirror URL with the architecture substituted at load time and the
/// repository slot still open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorTemplate {
    template: String,
}

impl MirrorTemplate {
    /// Build from a mirrorlist server URL containing `$repo` and `$arch`
    /// markers.
    pub fn parse(url: &str, arch: &str) -> Result<Self, Error> {
        if !url.contains("$repo") || !url.contains("$arch") {
            bail!("mirror url '{url}' is missing the $repo/$arch markers");
        }
        let mut template = url.replace("$arch", arch);
        while template.ends_with('/') {
            template.pop();
        }
        Ok(Self { template })
    }

    /// Fetch URL for `filename` out of `repo` on this mirror.
    pub fn package_url(&self, repo: &str, filename: &str) -> String {
        format!("{}/{}", self.template.replace("$repo", repo), filename)
    }
}

impl std::fmt::Display for MirrorTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.template)
    }
}

/// Source of the mirror list.
pub trait MirrorProvider {
    /// Ordered mirror templates, best first, at most `max` of them.
    fn mirrors(&self, max: usize) -> Result<Vec<MirrorTemplate>, Error>;
}

/// Source of the package listing, and the hook to refresh the host
/// package manager's own metadata.
pub trait PackageProvider {
    /// Every package in the active repositories, listing order.
    fn packages(&self) -> Result<Vec<PackageRef>, Error>;

    /// Refresh the package manager's databases. Best effort: failure is
    /// reported to stderr and swallowed.
    fn refresh(&self) -> bool;
}

/// Mirror templates from `/etc/pacman.d/mirrorlist`.
pub struct PacmanMirrorlist {
    path: PathBuf,
    arch: String,
}

impl PacmanMirrorlist {
    pub fn new(arch: &str) -> Self {
        Self::at(Path::new("/etc/pacman.d/mirrorlist"), arch)
    }

    pub fn at(path: &Path, arch: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            arch: arch.to_string(),
        }
    }
}

impl MirrorProvider for PacmanMirrorlist {
    fn mirrors(&self, max: usize) -> Result<Vec<MirrorTemplate>, Error> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|err| format_err!("failed to read {:?} - {err}", self.path))?;

        let mirrors = parse_mirrorlist(&contents, &self.arch, max);
        if mirrors.is_empty() {
            bail!("no uncommented Server entries in {:?}", self.path);
        }
        Ok(mirrors)
    }
}

fn parse_mirrorlist(contents: &str, arch: &str, max: usize) -> Vec<MirrorTemplate> {
    let mut mirrors = Vec::new();
    for line in contents.lines() {
        if mirrors.len() >= max {
            break;
        }
        if let Some(captures) = SERVER_LINE.captures(line.trim_end()) {
            match MirrorTemplate::parse(&captures["url"], arch) {
                Ok(mirror) => mirrors.push(mirror),
                Err(err) => eprintln!("WARNING: Skipping mirror - {err}"),
            }
        }
    }
    mirrors
}

/// Package listing via `pacman -Sl`, refresh via `pacman -Sy`.
pub struct PacmanPackageList;

impl PackageProvider for PacmanPackageList {
    fn packages(&self) -> Result<Vec<PackageRef>, Error> {
        let output = Command::new("pacman")
            .arg("-Sl")
            .output()
            .map_err(|err| format_err!("failed to run pacman -Sl - {err}"))?;

        if !output.status.success() {
            bail!("pacman -Sl failed with {}", output.status);
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(parse_package_list(&listing))
    }

    fn refresh(&self) -> bool {
        if !nix::unistd::Uid::effective().is_root() {
            eprintln!("WARNING: Cannot refresh pacman database without root.");
            return false;
        }

        match Command::new("pacman").arg("-Sy").status() {
            Ok(status) if status.success() => true,
            Ok(status) => {
                eprintln!("WARNING: pacman -Sy returned non-zero: {status}");
                false
            }
            Err(err) => {
                eprintln!("WARNING: failed to run pacman -Sy - {err}");
                false
            }
        }
    }
}

// Lines look like `core binutils 2.28.0-2 [installed]`; anything without
// at least repo, name and version is skipped.
fn parse_package_list(listing: &str) -> Vec<PackageRef> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(' ');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(repo), Some(name), Some(version))
                    if !repo.is_empty() && !name.is_empty() && !version.is_empty() =>
                {
                    Some(PackageRef::new(repo, name, version))
                }
                _ => None,
            }
        })
        .collect()
}
