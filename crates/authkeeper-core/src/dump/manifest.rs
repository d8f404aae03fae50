//! Snapshot manifest.
//!
//! Every snapshot directory ends with a `manifest.json` that records what the
//! data files contain and their SHA-256. The manifest is written last and
//! atomically, so a directory without one is an incomplete dump.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::auth::principal::validate_database_name;
use crate::error::{DumpError, DumpResult};

/// Current snapshot layout version.
pub const FORMAT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const USERS_FILE: &str = "users.json";
pub const ROLES_FILE: &str = "roles.json";
pub const INDEXES_FILE: &str = "indexes.json";

/// Data files every snapshot carries.
pub const DATA_FILES: [&str; 3] = [USERS_FILE, ROLES_FILE, INDEXES_FILE];

/// Description of one database snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    /// Database the snapshot was taken from.
    pub db: String,
    pub created_at_micros: u64,
    pub users: usize,
    pub roles: usize,
    pub indexes: usize,
    /// SHA-256 (lowercase hex) of each data file, by file name.
    pub file_sha256: BTreeMap<String, String>,
}

impl SnapshotManifest {
    /// Check the manifest is one this version can read.
    ///
    /// # Errors
    ///
    /// Returns [`DumpError::InvalidManifest`] describing the first problem.
    pub fn validate(&self) -> DumpResult<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(DumpError::InvalidManifest(format!(
                "unsupported format version {}",
                self.format_version
            )));
        }
        validate_database_name(&self.db)
            .map_err(|err| DumpError::InvalidManifest(err.to_string()))?;
        for file in DATA_FILES {
            match self.file_sha256.get(file) {
                Some(hash) if is_valid_sha256_hex(hash) => {}
                Some(_) => {
                    return Err(DumpError::InvalidManifest(format!(
                        "invalid sha256 entry for {file}"
                    )))
                }
                None => {
                    return Err(DumpError::InvalidManifest(format!(
                        "missing checksum for {file}"
                    )))
                }
            }
        }
        if let Some(extra) = self
            .file_sha256
            .keys()
            .find(|name| !DATA_FILES.contains(&name.as_str()))
        {
            return Err(DumpError::InvalidManifest(format!(
                "unexpected file in manifest: {extra}"
            )));
        }
        Ok(())
    }
}

/// Microseconds since the Unix epoch.
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn is_valid_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DumpError + '_ {
    move |source| DumpError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write `bytes` to `dir/name` through a temp file and rename.
///
/// # Errors
///
/// Returns [`DumpError::Io`] if any filesystem step fails.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> DumpResult<()> {
    fs::create_dir_all(dir).map_err(io_error(dir))?;
    let target = dir.join(name);

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_error(dir))?;
    tmp.write_all(bytes).map_err(io_error(&target))?;
    tmp.flush().map_err(io_error(&target))?;
    tmp.as_file().sync_all().map_err(io_error(&target))?;
    tmp.persist(&target)
        .map_err(|e| io_error(&target)(e.error))?;
    Ok(())
}

/// Write the manifest. Call only after every data file is in place.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub fn write_manifest(dir: &Path, manifest: &SnapshotManifest) -> DumpResult<()> {
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|source| DumpError::Encode {
        file: MANIFEST_FILE.to_string(),
        source,
    })?;
    write_atomic(dir, MANIFEST_FILE, &bytes)
}

/// Read and validate the manifest of a snapshot directory.
///
/// # Errors
///
/// Returns an error if the manifest is missing, unreadable or invalid.
pub fn load_manifest(dir: &Path) -> DumpResult<SnapshotManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).map_err(io_error(&path))?;
    let manifest: SnapshotManifest =
        serde_json::from_slice(&bytes).map_err(|source| DumpError::Decode {
            file: MANIFEST_FILE.to_string(),
            source,
        })?;
    manifest.validate()?;
    Ok(manifest)
}

/// Read every data file and check it against the manifest.
///
/// Returns the file contents by name so callers decode exactly the bytes
/// that were verified.
///
/// # Errors
///
/// Returns [`DumpError::ChecksumMismatch`] for the first file that differs.
pub fn read_verified_files(
    dir: &Path,
    manifest: &SnapshotManifest,
) -> DumpResult<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for (name, expected) in &manifest.file_sha256 {
        let path = dir.join(name);
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        if &sha256_hex(&bytes) != expected {
            return Err(DumpError::ChecksumMismatch { file: name.clone() });
        }
        files.insert(name.clone(), bytes);
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_for(files: &[(&str, &[u8])]) -> SnapshotManifest {
        SnapshotManifest {
            format_version: FORMAT_VERSION,
            db: "test".into(),
            created_at_micros: now_micros(),
            users: 0,
            roles: 0,
            indexes: 0,
            file_sha256: files
                .iter()
                .map(|(name, bytes)| ((*name).to_string(), sha256_hex(bytes)))
                .collect(),
        }
    }

    fn write_all(dir: &Path) -> SnapshotManifest {
        let files: [(&str, &[u8]); 3] =
            [(USERS_FILE, b"[]"), (ROLES_FILE, b"[]"), (INDEXES_FILE, b"[]")];
        for (name, bytes) in files {
            write_atomic(dir, name, bytes).unwrap();
        }
        let manifest = manifest_for(&files);
        write_manifest(dir, &manifest).unwrap();
        manifest
    }

    #[test]
    fn test_manifest_round_trip_and_verify() {
        let dir = TempDir::new().unwrap();
        let written = write_all(dir.path());

        let loaded = load_manifest(dir.path()).unwrap();
        assert_eq!(loaded, written);

        let files = read_verified_files(dir.path(), &loaded).unwrap();
        assert_eq!(files[USERS_FILE], b"[]");
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let manifest = write_all(dir.path());
        fs::write(dir.path().join(ROLES_FILE), b"[{}]").unwrap();

        match read_verified_files(dir.path(), &manifest) {
            Err(DumpError::ChecksumMismatch { file }) => assert_eq!(file, ROLES_FILE),
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load_manifest(dir.path()),
            Err(DumpError::Io { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_manifests() {
        let mut manifest = manifest_for(&[(USERS_FILE, b"[]"), (ROLES_FILE, b"[]")]);
        assert!(manifest.validate().is_err());

        manifest
            .file_sha256
            .insert(INDEXES_FILE.into(), "not-a-hash".into());
        assert!(manifest.validate().is_err());

        manifest
            .file_sha256
            .insert(INDEXES_FILE.into(), sha256_hex(b"[]"));
        assert!(manifest.validate().is_ok());

        manifest.format_version = 99;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_write_atomic_replaces() {
        let dir = TempDir::new().unwrap();
        write_atomic(dir.path(), "f.json", b"one").unwrap();
        write_atomic(dir.path(), "f.json", b"two").unwrap();
        assert_eq!(fs::read(dir.path().join("f.json")).unwrap(), b"two");
    }
}
