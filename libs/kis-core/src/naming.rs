//! File and object naming for retired and archived files.
//!
//! ```text
//! kong.log                                   active file
//! kong.log.1700000000                        retired
//! kong.log.1700000000.1                      retired, second rotation in that second
//! kong.log.1700000000.1.<sha256>             checksum-named
//! kong.log.1700000000.1.<sha256>.gz          archive
//! <folder>/2023-11-14/kong.log.1700000000.1.<sha256>.gz   object key
//! ```

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use chrono::DateTime;

use crate::error::RotateError;

/// Plain and compressed candidate names for the `n`-th retirement of
/// `active` within the second `rotated_at`.
pub fn retired_candidate(active: &Path, rotated_at: i64, n: u32) -> (PathBuf, PathBuf) {
    let mut plain = OsString::from(active.as_os_str());
    plain.push(format!(".{rotated_at}"));
    if n > 0 {
        plain.push(format!(".{n}"));
    }
    let mut gz = plain.clone();
    gz.push(".gz");
    (PathBuf::from(plain), PathBuf::from(gz))
}

/// First candidate that is neither on disk (plain, compressed, or with a
/// checksum-named sibling) nor listed in `reserved`.
///
/// `reserved` holds names whose archival is still running. A probe that
/// fails with anything but "not found" aborts the search.
pub fn free_retired_name(
    active: &Path,
    rotated_at: i64,
    max_probes: u32,
    reserved: &HashSet<PathBuf>,
) -> Result<PathBuf, RotateError> {
    let siblings = sibling_names(active)?;
    for n in 0..max_probes {
        let (plain, gz) = retired_candidate(active, rotated_at, n);
        if reserved.contains(&plain) || exists(&plain)? || exists(&gz)? || has_checksum_sibling(&siblings, &plain) {
            continue;
        }
        return Ok(plain);
    }
    let (base, _) = retired_candidate(active, rotated_at, 0);
    Err(RotateError::NamesExhausted { base, probes: max_probes })
}

fn exists(path: &Path) -> Result<bool, RotateError> {
    path.try_exists()
        .map_err(|source| RotateError::Probe { path: path.to_path_buf(), source })
}

/// Names in the active file's directory that start with the active file name.
fn sibling_names(active: &Path) -> Result<Vec<String>, RotateError> {
    let dir = match active.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let prefix = active
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let probe_err = |source| RotateError::Probe { path: dir.to_path_buf(), source };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(probe_err)? {
        let name = entry.map_err(probe_err)?.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) {
            names.push(name);
        }
    }
    Ok(names)
}

/// `{candidate}.{sha256}` or `{candidate}.{sha256}.gz` is among `siblings`.
fn has_checksum_sibling(siblings: &[String], candidate: &Path) -> bool {
    let Some(name) = candidate.file_name().map(|n| n.to_string_lossy()) else {
        return false;
    };
    siblings.iter().any(|sibling| {
        sibling
            .strip_prefix(name.as_ref())
            .and_then(|rest| rest.strip_prefix('.'))
            .map(|rest| rest.strip_suffix(".gz").unwrap_or(rest))
            .is_some_and(is_sha256_hex)
    })
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// `path` with `.{suffix}` appended to its file name.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Object key for an archive: `{folder}/{YYYY-MM-DD}/{file_name}`, dated by
/// the rotation timestamp (UTC).
pub fn archive_key(folder: &str, rotated_at: i64, file_name: &str) -> String {
    let date = DateTime::from_timestamp(rotated_at, 0)
        .unwrap_or(DateTime::UNIX_EPOCH)
        .format("%Y-%m-%d");
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        format!("{date}/{file_name}")
    } else {
        format!("{folder}/{date}/{file_name}")
    }
}

/// The SHA-256 embedded in an archive key or file name: the second-to-last
/// dot-separated component. `None` if it is not 64 hex digits.
pub fn checksum_from_key(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let mut parts = name.rsplit('.');
    parts.next()?;
    let checksum = parts.next()?;
    is_sha256_hex(checksum).then_some(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_names() {
        let active = Path::new("/data/kong.log");

        let (plain, gz) = retired_candidate(active, 1_700_000_000, 0);
        assert_eq!(plain, PathBuf::from("/data/kong.log.1700000000"));
        assert_eq!(gz, PathBuf::from("/data/kong.log.1700000000.gz"));

        let (plain, gz) = retired_candidate(active, 1_700_000_000, 3);
        assert_eq!(plain, PathBuf::from("/data/kong.log.1700000000.3"));
        assert_eq!(gz, PathBuf::from("/data/kong.log.1700000000.3.gz"));
    }

    #[test]
    fn free_name_skips_existing_plain_and_compressed_files() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("kong.log");
        let ts = 1_700_000_000;

        let mut taken = Vec::new();
        for n in 0..4 {
            let (plain, gz) = retired_candidate(&active, ts, n);
            // Alternate between leftover plain files and finished archives.
            let path = if n % 2 == 0 { plain.clone() } else { gz };
            std::fs::write(&path, b"x").unwrap();
            taken.push(plain);
        }

        let name = free_retired_name(&active, ts, 100, &HashSet::new()).unwrap();
        assert_eq!(name, retired_candidate(&active, ts, 4).0);
        assert!(!taken.contains(&name));
        assert!(!with_suffix(&name, "gz").exists());
    }

    #[test]
    fn free_name_gives_up_after_bound() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("kong.log");
        for n in 0..3 {
            std::fs::write(retired_candidate(&active, 7, n).0, b"x").unwrap();
        }

        let err = free_retired_name(&active, 7, 3, &HashSet::new()).unwrap_err();
        assert!(matches!(err, RotateError::NamesExhausted { probes: 3, .. }));
    }

    #[test]
    fn checksum_named_and_archived_siblings_take_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("kong.log");
        let ts = 1_700_000_000;
        let sum = "0f".repeat(32);

        // n = 0 is mid-archival, n = 1 is a finished archive.
        let (first, _) = retired_candidate(&active, ts, 0);
        std::fs::write(with_suffix(&first, &sum), b"x").unwrap();
        let (second, _) = retired_candidate(&active, ts, 1);
        std::fs::write(with_suffix(&with_suffix(&second, &sum), "gz"), b"x").unwrap();
        // Not a checksum: does not block n = 2.
        let (third, _) = retired_candidate(&active, ts, 2);
        std::fs::write(with_suffix(&third, "bak"), b"x").unwrap();

        let name = free_retired_name(&active, ts, 100, &HashSet::new()).unwrap();
        assert_eq!(name, third);
    }

    #[test]
    fn reserved_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("kong.log");
        let reserved: HashSet<_> = (0..2).map(|n| retired_candidate(&active, 5, n).0).collect();

        let name = free_retired_name(&active, 5, 100, &reserved).unwrap();
        assert_eq!(name, retired_candidate(&active, 5, 2).0);
    }

    #[test]
    fn archive_key_uses_rotation_date() {
        // 2023-11-14T22:13:20Z
        let key = archive_key("kong/", 1_700_000_000, "kong.log.1700000000.ab.gz");
        assert_eq!(key, "kong/2023-11-14/kong.log.1700000000.ab.gz");

        let key = archive_key("", 0, "f.gz");
        assert_eq!(key, "1970-01-01/f.gz");
    }

    #[test]
    fn checksum_is_read_from_key() {
        let sum = "a".repeat(64);
        let key = format!("kong/2023-11-14/kong.log.1700000000.2.{sum}.gz");
        assert_eq!(checksum_from_key(&key), Some(sum.as_str()));

        assert_eq!(checksum_from_key("kong/2023-11-14/kong.log.1700000000.gz"), None);
        assert_eq!(checksum_from_key("nodots"), None);
    }
}
