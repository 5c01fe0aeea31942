use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::types::{vercmp, PackageRef};

/// Database format written by this version.
pub const LATEST_FORMAT: &str = "0.2";

/// Formats this version can read and migrate.
pub const SUPPORTED_FORMATS: &[&str] = &["0.1", "0.2"];

// Reserved top-level key carrying the format version.
const FORMAT_KEY: &str = "__vers";

/// One indexed package: the paths it installs, or the error that kept us
/// from getting them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub files: Vec<String>,
    pub version: String,
    pub error: Option<String>,
}

impl PackageRecord {
    pub fn success(files: Vec<String>, version: &str) -> Self {
        Self {
            files,
            version: version.to_string(),
            error: None,
        }
    }

    pub fn failure(version: &str, error: String) -> Self {
        Self {
            files: Vec::new(),
            version: version.to_string(),
            error: Some(error),
        }
    }
}

/// The in-memory database, keyed by package name. The reserved format
/// key only exists in the serialized form.
pub type Records = HashMap<String, PackageRecord>;

/// A database read from disk, already migrated to the latest format.
pub struct LoadedDb {
    pub records: Records,
    /// Format version the file carried on disk.
    pub format: String,
}

impl LoadedDb {
    pub fn was_latest(&self) -> bool {
        self.format == LATEST_FORMAT
    }
}

/// Read and migrate the database at `path`.
///
/// Absent, unreadable or structurally unparseable files yield
/// `Ok(None)`: the run then indexes every package from scratch. A
/// readable database in an unsupported format is an error, since
/// silently discarding it would throw away a full generation of fetches.
pub fn load(path: &Path) -> Result<Option<LoadedDb>, Error> {
    let compressed = match std::fs::read(path) {
        Ok(data) => data,
        Err(_) => return Ok(None),
    };

    let mut json = Vec::new();
    if GzDecoder::new(&compressed[..])
        .read_to_end(&mut json)
        .is_err()
    {
        return Ok(None);
    }
    drop(compressed);

    let mut map = match serde_json::from_slice::<Value>(&json) {
        Ok(Value::Object(map)) => map,
        _ => return Ok(None),
    };
    drop(json);

    let format = match map.remove(FORMAT_KEY) {
        Some(Value::String(format)) => format,
        Some(_) => return Ok(None),
        // The 0.1 generation predates the format marker.
        None => "0.1".to_string(),
    };

    if !SUPPORTED_FORMATS.contains(&format.as_str()) {
        bail!("Failed to convert database: version '{format}' is not supported for update");
    }

    let mut records = Records::with_capacity(map.len());
    if format == "0.1" {
        for (name, value) in map {
            records.insert(name, migrate_legacy_value(value)?);
        }
    } else {
        for (name, value) in map {
            match serde_json::from_value(value) {
                Ok(record) => records.insert(name, record),
                Err(_) => return Ok(None),
            };
        }
    }

    Ok(Some(LoadedDb { records, format }))
}

// 0.1 entries are either a bare error string or a bare file list; the
// version was not recorded back then.
fn migrate_legacy_value(value: Value) -> Result<PackageRecord, Error> {
    match value {
        Value::String(error) => Ok(PackageRecord {
            files: Vec::new(),
            version: String::new(),
            error: Some(error),
        }),
        Value::Array(entries) => {
            let files = entries
                .into_iter()
                .map(|entry| match entry {
                    Value::String(path) => Ok(path),
                    other => Err(format_err!(
                        "Failed to convert database: unexpected file entry {other}"
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PackageRecord {
                files,
                version: String::new(),
                error: None,
            })
        }
        other => bail!("Failed to convert database: unexpected entry {other}"),
    }
}

/// Split the current package listing into records that can be carried
/// over unchanged and packages that need fetching.
///
/// A package is fetched when it is new, its stored version is empty (a
/// migrated 0.1 record), or its listed version is newer than the stored
/// one. A listed version sorting at or below the stored one is skipped
/// with a warning unless `force_old_update` is set.
pub fn diff(mut old: Records, current: &[PackageRef], config: &Config) -> (Records, Vec<PackageRef>) {
    let mut carried = Records::with_capacity(old.len());
    let mut pending = Vec::new();

    for package in current {
        let record = match old.remove(&package.name) {
            Some(record) => record,
            None => {
                pending.push(package.clone());
                continue;
            }
        };

        if record.version == package.version {
            carried.insert(package.name.clone(), record);
        } else if record.version.is_empty() {
            pending.push(package.clone());
        } else if vercmp(&package.version, &record.version) == std::cmp::Ordering::Greater {
            pending.push(package.clone());
        } else if config.force_old_update {
            if config.verbose {
                eprintln!(
                    "WARNING: Package {} - {} has an older version! \"{}\" < \"{}\"! \
                     Did the primary mirror change to an older one? Doing anyway, because of --force-old-update",
                    package.repo, package.name, package.version, record.version
                );
            }
            pending.push(package.clone());
        } else {
            eprintln!(
                "WARNING: Package {} - {} has an older version! \"{}\" < \"{}\"! \
                 Did the primary mirror change to an older one? Skipping... (use --force-old-update to do anyway)",
                package.repo, package.name, package.version, record.version
            );
        }
    }

    (carried, pending)
}

/// Serialize, compress and write the database.
///
/// The write is atomic at `path` (temp file in the same directory, then
/// rename). When `path` is not writable the database is dumped to a
/// fresh file in the temp dir instead; the returned path says where the
/// data actually went.
pub fn write(records: &Records, path: &Path) -> Result<PathBuf, Error> {
    let mut map = serde_json::Map::with_capacity(records.len() + 1);
    for (name, record) in records {
        map.insert(name.clone(), serde_json::to_value(record)?);
    }
    map.insert(
        FORMAT_KEY.to_string(),
        Value::String(LATEST_FORMAT.to_string()),
    );

    let json = serde_json::to_vec(&Value::Object(map))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    drop(json);
    let compressed = encoder.finish()?;

    match write_atomic(path, &compressed) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(err) => {
            let mut fallback = tempfile::Builder::new()
                .prefix(".providesDB.")
                .tempfile()
                .map_err(|tmp_err| {
                    format_err!("failed to write {path:?} ({err}) and no tempfile either - {tmp_err}")
                })?;
            fallback.write_all(&compressed)?;
            let (_, fallback_path) = fallback
                .keep()
                .map_err(|keep_err| format_err!("failed to persist tempfile - {keep_err}"))?;
            eprintln!("Failed to open {path:?} for writing ({err}). Dumped to {fallback_path:?}");
            Ok(fallback_path)
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("{path:?} has no parent directory"))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path)
        .map_err(|err| format_err!("failed to rename into place - {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            verbose: true,
            ..Config::default()
        }
    }

    fn success_record(files: &[&str], version: &str) -> PackageRecord {
        PackageRecord::success(files.iter().map(|f| f.to_string()).collect(), version)
    }

    fn write_raw_db(path: &Path, json: &str) {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).unwrap();
        std::fs::write(path, encoder.finish().unwrap()).unwrap();
    }

    #[test]
    fn absent_database_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn unparseable_database_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        std::fs::write(&path, b"not gzip at all").unwrap();
        assert!(load(&path).unwrap().is_none());

        write_raw_db(&path, "[1, 2, 3]");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn legacy_database_is_migrated() {
        // 0.1: no __vers, string values are errors, arrays are file lists.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        write_raw_db(&path, r#"{"pkg-a": ["bin/a"], "pkg-b": "some error"}"#);

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.format, "0.1");
        assert!(!loaded.was_latest());
        assert_eq!(
            loaded.records["pkg-a"],
            PackageRecord {
                files: vec!["bin/a".to_string()],
                version: String::new(),
                error: None,
            }
        );
        assert_eq!(
            loaded.records["pkg-b"],
            PackageRecord {
                files: Vec::new(),
                version: String::new(),
                error: Some("some error".to_string()),
            }
        );
    }

    #[test]
    fn unsupported_format_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        write_raw_db(&path, r#"{"__vers": "9.9"}"#);
        assert!(load(&path).is_err());
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        let mut records = Records::new();
        records.insert(
            "pkg-a".to_string(),
            success_record(&["/usr/bin/a", "/usr/share/a/readme"], "1.0"),
        );
        records.insert(
            "pkg-b".to_string(),
            PackageRecord::failure("2.0", "Error TIMEOUT processing core - pkg-b : timed out".to_string()),
        );

        let written_to = write(&records, &path).unwrap();
        assert_eq!(written_to, path);

        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded.format, LATEST_FORMAT);
        assert_eq!(loaded.records, records);
    }

    #[test]
    fn migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        write_raw_db(&path, r#"{"pkg-a": ["bin/a"], "pkg-b": "some error"}"#);

        let migrated = load(&path).unwrap().unwrap().records;
        write(&migrated, &path).unwrap();
        let reloaded = load(&path).unwrap().unwrap();

        assert!(reloaded.was_latest());
        assert_eq!(reloaded.records, migrated);
    }

    #[test]
    fn diff_carries_equal_versions_unchanged() {
        // prior has pkg-a@1.0; listing has pkg-a@1.0 and pkg-b@0.5
        let mut old = Records::new();
        let record = success_record(&["/usr/bin/a"], "1.0");
        old.insert("pkg-a".to_string(), record.clone());

        let current = vec![
            PackageRef::new("core", "pkg-a", "1.0"),
            PackageRef::new("core", "pkg-b", "0.5"),
        ];

        let (carried, pending) = diff(old, &current, &config());
        assert_eq!(carried.len(), 1);
        assert_eq!(carried["pkg-a"], record);
        assert_eq!(pending, vec![PackageRef::new("core", "pkg-b", "0.5")]);
    }

    #[test]
    fn diff_requeues_newer_versions() {
        let mut old = Records::new();
        old.insert("pkg-a".to_string(), success_record(&["/usr/bin/a"], "1.0"));

        let current = vec![PackageRef::new("core", "pkg-a", "1.1")];
        let (carried, pending) = diff(old, &current, &config());
        assert!(carried.is_empty());
        assert_eq!(pending, current);
    }

    #[test]
    fn diff_skips_downgrades_unless_forced() {
        let current = vec![PackageRef::new("core", "pkg-a", "1.0")];

        let mut old = Records::new();
        old.insert("pkg-a".to_string(), success_record(&["/usr/bin/a"], "2.0"));
        let (carried, pending) = diff(old, &current, &config());
        assert!(carried.is_empty());
        assert!(pending.is_empty());

        let mut old = Records::new();
        old.insert("pkg-a".to_string(), success_record(&["/usr/bin/a"], "2.0"));
        let forced = Config {
            force_old_update: true,
            ..config()
        };
        let (_, pending) = diff(old, &current, &forced);
        assert_eq!(pending, current);
    }

    #[test]
    fn diff_requeues_migrated_records_without_version() {
        let mut old = Records::new();
        old.insert("pkg-a".to_string(), success_record(&["/usr/bin/a"], ""));

        let current = vec![PackageRef::new("core", "pkg-a", "1.0")];
        let (carried, pending) = diff(old, &current, &config());
        assert!(carried.is_empty());
        assert_eq!(pending, current);
    }

    #[test]
    fn write_falls_back_to_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let unwritable = dir.path().join("no-such-dir").join("db");

        let mut records = Records::new();
        records.insert("pkg-a".to_string(), success_record(&["/usr/bin/a"], "1.0"));

        let written_to = write(&records, &unwritable).unwrap();
        assert_ne!(written_to, unwritable);
        assert!(written_to.exists());

        let loaded = load(&written_to).unwrap().unwrap();
        assert_eq!(loaded.records, records);
        std::fs::remove_file(written_to).unwrap();
    }
}
