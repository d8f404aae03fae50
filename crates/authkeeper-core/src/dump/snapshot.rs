//! Dump and restore of one database's auth metadata.
//!
//! Layout of a snapshot directory:
//!
//! ```text
//! <destination>/<db>/
//!     users.json      user documents, credentials included, no cleartext
//!     roles.json      user-defined roles of the database
//!     indexes.json    index definitions
//!     manifest.json   counts and SHA-256 of the three files above
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::principal::validate_database_name;
use crate::authz::manager::AuthorizationManager;
use crate::authz::roles::RoleDocument;
use crate::error::{DumpError, DumpResult};
use crate::store::indexes::{IndexCatalog, IndexDefinition};
use crate::store::users::UserDocument;

use super::manifest::{
    load_manifest, now_micros, read_verified_files, sha256_hex, write_atomic, write_manifest,
    SnapshotManifest, FORMAT_VERSION, INDEXES_FILE, MANIFEST_FILE, ROLES_FILE, USERS_FILE,
};

/// Live state a snapshot is taken from and restored into.
#[derive(Debug, Clone, Copy)]
pub struct DumpContext<'a> {
    pub manager: &'a AuthorizationManager,
    pub indexes: &'a dyn IndexCatalog,
}

/// Outcome of a dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    pub db: String,
    /// Directory the snapshot was written to.
    pub dir: PathBuf,
    pub users: usize,
    pub roles: usize,
    pub indexes: usize,
}

/// Restore behavior.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Remove every user, role and index of the database before loading.
    pub drop: bool,
    /// Checked between entries.
    pub cancel: Option<CancellationToken>,
}

/// Outcome of a completed restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub db: String,
    /// Database the snapshot was taken from.
    pub source_db: String,
    pub users: usize,
    pub roles: usize,
    pub indexes: usize,
    pub dropped_users: usize,
    pub dropped_roles: usize,
    pub dropped_indexes: usize,
}

impl RestoreReport {
    /// Entries written into live state.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.users + self.roles + self.indexes
    }
}

fn encode<T: Serialize>(file: &str, value: &T) -> DumpResult<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|source| DumpError::Encode {
        file: file.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(file: &str, bytes: &[u8]) -> DumpResult<T> {
    serde_json::from_slice(bytes).map_err(|source| DumpError::Decode {
        file: file.to_string(),
        source,
    })
}

/// Write a snapshot of `db` under `destination/<db>/`.
///
/// Data files are written first and the manifest last, each through a temp
/// file and rename. An existing snapshot at the same place is replaced.
///
/// # Errors
///
/// Returns an error if `db` is not a valid database name, the update lock
/// is busy or a file cannot be written.
pub fn dump(ctx: DumpContext<'_>, db: &str, destination: &Path) -> DumpResult<DumpReport> {
    validate_database_name(db)?;
    let dir = destination.join(db);

    let (users, roles, indexes) = {
        let _guard = ctx
            .manager
            .lock_for_update("dump")
            .map_err(|_| DumpError::LockBusy("dump".into()))?;
        (
            ctx.manager.users().get_users(db),
            ctx.manager.roles().roles_in(db),
            ctx.indexes.list_indexes(db),
        )
    };

    let files = [
        (USERS_FILE, encode(USERS_FILE, &users)?),
        (ROLES_FILE, encode(ROLES_FILE, &roles)?),
        (INDEXES_FILE, encode(INDEXES_FILE, &indexes)?),
    ];

    // A stale manifest must not vouch for half-written data files.
    let stale = dir.join(MANIFEST_FILE);
    if stale.exists() {
        fs::remove_file(&stale).map_err(|source| DumpError::Io {
            path: stale.display().to_string(),
            source,
        })?;
    }

    let mut file_sha256 = BTreeMap::new();
    for (name, bytes) in &files {
        write_atomic(&dir, name, bytes)?;
        file_sha256.insert((*name).to_string(), sha256_hex(bytes));
    }

    let manifest = SnapshotManifest {
        format_version: FORMAT_VERSION,
        db: db.to_string(),
        created_at_micros: now_micros(),
        users: users.len(),
        roles: roles.len(),
        indexes: indexes.len(),
        file_sha256,
    };
    write_manifest(&dir, &manifest)?;

    info!(
        db = %db,
        dir = %dir.display(),
        users = manifest.users,
        roles = manifest.roles,
        indexes = manifest.indexes,
        "Dumped auth metadata"
    );

    Ok(DumpReport {
        db: db.to_string(),
        dir,
        users: manifest.users,
        roles: manifest.roles,
        indexes: manifest.indexes,
    })
}

/// Find the snapshot directory for `db` under `source`.
///
/// `source` may be the snapshot directory itself or the dump root holding
/// one directory per database.
#[must_use]
pub fn snapshot_dir(source: &Path, db: &str) -> PathBuf {
    if source.join(MANIFEST_FILE).is_file() {
        source.to_path_buf()
    } else {
        source.join(db)
    }
}

struct Snapshot {
    manifest: SnapshotManifest,
    users: Vec<UserDocument>,
    roles: Vec<RoleDocument>,
    indexes: Vec<IndexDefinition>,
}

fn file_bytes<'a>(files: &'a BTreeMap<String, Vec<u8>>, name: &str) -> DumpResult<&'a [u8]> {
    files
        .get(name)
        .map(Vec::as_slice)
        .ok_or_else(|| DumpError::InvalidManifest(format!("missing checksum for {name}")))
}

fn load_snapshot(dir: &Path) -> DumpResult<Snapshot> {
    let manifest = load_manifest(dir)?;
    let files = read_verified_files(dir, &manifest)?;
    let users: Vec<UserDocument> = decode(USERS_FILE, file_bytes(&files, USERS_FILE)?)?;
    let roles: Vec<RoleDocument> = decode(ROLES_FILE, file_bytes(&files, ROLES_FILE)?)?;
    let indexes: Vec<IndexDefinition> =
        decode(INDEXES_FILE, file_bytes(&files, INDEXES_FILE)?)?;

    for (file, found, expected) in [
        (USERS_FILE, users.len(), manifest.users),
        (ROLES_FILE, roles.len(), manifest.roles),
        (INDEXES_FILE, indexes.len(), manifest.indexes),
    ] {
        if found != expected {
            return Err(DumpError::InvalidManifest(format!(
                "{file} holds {found} entries, manifest says {expected}"
            )));
        }
    }

    Ok(Snapshot {
        manifest,
        users,
        roles,
        indexes,
    })
}

/// Load a snapshot into `db`.
///
/// The whole snapshot is read and verified before live state is touched.
/// Entries are then applied one at a time (roles, users, indexes), each
/// re-homed into `db`. Same-key entries are overwritten; with
/// [`RestoreOptions::drop`] everything else in `db` is removed first.
///
/// Already-applied entries stay applied if the restore stops early.
///
/// # Errors
///
/// - [`DumpError::InvalidDatabase`] for a target name that cannot be stored
/// - verification errors ([`DumpError::ChecksumMismatch`],
///   [`DumpError::InvalidManifest`], decode and I/O errors) before any change
/// - [`DumpError::Interrupted`] if cancelled between entries
/// - [`DumpError::Partial`] if an entry is rejected
pub fn restore(
    ctx: DumpContext<'_>,
    db: &str,
    source: &Path,
    options: &RestoreOptions,
) -> DumpResult<RestoreReport> {
    validate_database_name(db)?;
    let dir = snapshot_dir(source, db);
    let snapshot = load_snapshot(&dir)?;
    debug!(
        db = %db,
        dir = %dir.display(),
        source_db = %snapshot.manifest.db,
        "Verified snapshot"
    );

    let _guard = ctx
        .manager
        .lock_for_update("restore")
        .map_err(|_| DumpError::LockBusy("restore".into()))?;

    let users = ctx.manager.users();
    let roles = ctx.manager.roles();

    let mut report = RestoreReport {
        db: db.to_string(),
        source_db: snapshot.manifest.db.clone(),
        ..RestoreReport::default()
    };

    if options.drop {
        report.dropped_users = users.drop_all_users(db);
        report.dropped_roles = roles.drop_all_roles(db);
        report.dropped_indexes = ctx.indexes.drop_indexes(db);
        info!(
            db = %db,
            users = report.dropped_users,
            roles = report.dropped_roles,
            indexes = report.dropped_indexes,
            "Dropped existing auth metadata before restore"
        );
    }

    let cancelled = || {
        options
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    };
    let interrupted = |report: &RestoreReport| {
        warn!(db = %db, applied = report.applied(), "Restore interrupted");
        DumpError::Interrupted {
            applied: report.applied(),
        }
    };

    for role in snapshot.roles {
        if cancelled() {
            return Err(interrupted(&report));
        }
        roles.upsert_role(role.rehome(db));
        report.roles += 1;
    }

    for user in snapshot.users {
        if cancelled() {
            return Err(interrupted(&report));
        }
        users.upsert_user(user.rehome(db));
        report.users += 1;
    }

    for index in snapshot.indexes {
        if cancelled() {
            return Err(interrupted(&report));
        }
        let name = index.name.clone();
        if let Err(e) = ctx.indexes.create_index(db, index.rehome(db)) {
            warn!(db = %db, index = %name, error = %e, "Restore stopped on index");
            return Err(DumpError::Partial {
                applied: report.applied(),
                reason: e.to_string(),
            });
        }
        report.indexes += 1;
    }

    info!(
        db = %db,
        source_db = %report.source_db,
        users = report.users,
        roles = report.roles,
        indexes = report.indexes,
        drop = options.drop,
        "Restored auth metadata"
    );
    Ok(report)
}
