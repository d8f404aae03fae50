//! Metadata dump and restore.
//!
//! A dump is a directory per database holding users, user-defined roles and
//! index definitions as JSON, plus a checksummed manifest written last. See
//! [`snapshot`] for the layout and the restore modes.

pub mod manifest;
pub mod snapshot;

pub use manifest::{SnapshotManifest, FORMAT_VERSION, MANIFEST_FILE};
pub use snapshot::{
    dump, restore, snapshot_dir, DumpContext, DumpReport, RestoreOptions, RestoreReport,
};
