//! Linear database migration list.
//!
//! Each entry pairs a version number with the migration that brings an
//! older database up to it. On open, every migration with a number above
//! the stored version runs inside one update transaction; any failure
//! aborts the transaction and leaves the stored version untouched.

use crate::{kv, Error};

/// A migration mutates the key/bucket structure of an outdated database
/// to match its version number.
pub(crate) type Migration = fn(&mut kv::Tx<'_>) -> Result<(), Error>;

pub(crate) struct Version {
	pub number: u32,
	pub migration: Option<Migration>,
}

/// All database versions, oldest first. The base version requires no
/// migration.
pub(crate) const DB_VERSIONS: &[Version] = &[Version { number: 1, migration: None }];

/// The version a fully migrated database reports.
pub(crate) fn latest_version(versions: &[Version]) -> u32 {
	versions.last().map(|v| v.number).unwrap_or(0)
}
