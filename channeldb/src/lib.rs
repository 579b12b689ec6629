//!
//! Durable channel state store for a Lightning-style payment node.
//!
//! The crate provides the persistent core a node builds on: the channel
//! store itself (open channels, their append-only state-transition log,
//! revocation state, closed-channel summaries), the nursery store that
//! tracks on-chain outputs of closed channels through their timelock
//! maturation, and the nested-bucket transactional key-value layer both
//! sit on. External collaborators feed it commitment updates and block
//! heights; nothing in here constructs commitments or watches the chain.
//!

pub mod channel;
pub mod elkrem;
pub mod encode;
pub mod kv;
pub mod nursery;

mod migrations;

use std::path::Path;

use bitcoin::OutPoint;
use log::{debug, info};

pub use crate::channel::{
	Channel, ChannelDelta, ChannelSnapshot, Htlc, NodeId, OpenChannel,
};
pub use crate::encode::{DecodeError, RecordEncoding};
pub use crate::nursery::{BabyOutput, KidOutput, NurseryOutput, NurseryStore, PruneOutcome};

/// Name of the store inside the caller-supplied directory.
const DB_NAME: &str = "channel.db";

// Top-level buckets, created on first open. The invoice and node-info
// buckets belong to external collaborators; they are created and wiped
// here but never otherwise touched.
pub(crate) const OPEN_CHANNEL_BUCKET: &[u8] = b"open-channels";
pub(crate) const CLOSED_CHANNEL_BUCKET: &[u8] = b"closed-channels";
pub(crate) const INVOICE_BUCKET: &[u8] = b"invoices";
pub(crate) const NODE_INFO_BUCKET: &[u8] = b"node-info";
pub(crate) const META_BUCKET: &[u8] = b"meta";

/// Key of the database version inside the meta bucket.
const DB_VERSION_KEY: &[u8] = b"db-version";

/// Errors surfaced by the channel and nursery stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The store has never been initialized.
	#[error("channel database has not been created")]
	NoChanDb,

	/// The node or channel index required by the operation is missing.
	#[error("no active channels recorded for this node")]
	NoActiveChannels,

	/// The channel has no recorded state deltas.
	#[error("channel has no recorded state deltas")]
	NoPastDeltas,

	/// No log entry exists for the requested update number.
	#[error("no channel log entry for update {0}")]
	LogEntryNotFound(u32),

	/// The nursery has no bucket for the requested channel.
	#[error("channel has no outputs under incubation")]
	ContractNotFound,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Kv(#[from] kv::Error),

	#[error(transparent)]
	Decode(#[from] encode::DecodeError),
}

/// Handle to the node's channel database.
///
/// Cheap to clone; every clone shares the underlying store. The nursery
/// store and any number of live [Channel] handles operate through clones
/// of this handle.
#[derive(Clone)]
pub struct ChannelDb {
	store: kv::Store,
}

impl ChannelDb {
	/// Open the channel database under the given directory, creating the
	/// directory, the top-level buckets, and running any pending
	/// migrations.
	pub fn open(db_path: impl AsRef<Path>) -> Result<ChannelDb, Error> {
		let dir = db_path.as_ref();
		std::fs::create_dir_all(dir)?;
		// The store holds keys and signatures; nobody else on the machine
		// has business reading it.
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
		}

		info!("opening channel database at {}", dir.display());
		let store = kv::Store::open(dir.join(DB_NAME))?;
		let db = ChannelDb { store };
		db.init_buckets()?;
		db.sync_versions(migrations::DB_VERSIONS)?;
		Ok(db)
	}

	pub(crate) fn store(&self) -> &kv::Store {
		&self.store
	}

	fn init_buckets(&self) -> Result<(), Error> {
		self.store.update(|tx| {
			for name in [
				OPEN_CHANNEL_BUCKET,
				CLOSED_CHANNEL_BUCKET,
				INVOICE_BUCKET,
				NODE_INFO_BUCKET,
				META_BUCKET,
			] {
				tx.create_bucket_if_not_exists(name)?;
			}
			Ok::<_, Error>(())
		})
	}

	/// The database's current schema version.
	pub fn version(&self) -> Result<u32, Error> {
		self.store.view(|tx| {
			let meta = match tx.bucket(META_BUCKET)? {
				Some(meta) => meta,
				None => return Ok(0),
			};
			match meta.get(tx, DB_VERSION_KEY)? {
				Some(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
					Ok(arr) => Ok(u32::from_be_bytes(arr)),
					Err(_) => Ok(0),
				},
				None => Ok(0),
			}
		})
	}

	/// Apply every migration newer than the stored version, then bump
	/// the version, all in one transaction. A failing migration aborts
	/// the transaction and leaves the version unchanged.
	fn sync_versions(&self, versions: &[migrations::Version]) -> Result<(), Error> {
		let current = self.version()?;
		let latest = migrations::latest_version(versions);
		if current >= latest {
			return Ok(());
		}

		self.store.update(|tx| {
			for version in versions.iter().filter(|v| v.number > current) {
				if let Some(migration) = version.migration {
					debug!("running database migration to version {}", version.number);
					migration(tx)?;
				}
			}
			let meta = tx.create_bucket_if_not_exists(META_BUCKET)?;
			meta.put(tx, DB_VERSION_KEY, &latest.to_be_bytes());
			Ok::<_, Error>(())
		})?;

		info!("channel database migrated from version {} to {}", current, latest);
		Ok(())
	}

	/// Delete all saved state in every data bucket, in one transaction.
	/// Buckets that are already absent are ignored.
	pub fn wipe(&self) -> Result<(), Error> {
		self.store.update(|tx| {
			for name in [
				OPEN_CHANNEL_BUCKET,
				CLOSED_CHANNEL_BUCKET,
				INVOICE_BUCKET,
				NODE_INFO_BUCKET,
			] {
				match tx.delete_bucket(name) {
					Ok(()) | Err(kv::Error::BucketNotFound) => {}
					Err(e) => return Err(e.into()),
				}
			}
			Ok::<_, Error>(())
		})
	}

	/// All currently open channels with the given node. A node with no
	/// recorded channels yields an empty list.
	pub fn fetch_open_channels(&self, node_id: &NodeId) -> Result<Vec<Channel>, Error> {
		let states = self.store.view(|tx| {
			let open = match tx.bucket(OPEN_CHANNEL_BUCKET)? {
				Some(open) => open,
				None => return Ok(Vec::new()),
			};
			let node = match open.bucket(tx, node_id)? {
				Some(node) => node,
				None => return Ok(Vec::new()),
			};
			fetch_node_channels(tx, &open, &node)
		})?;

		Ok(states.into_iter().map(|state| Channel::new(self.clone(), state)).collect())
	}

	/// All open channels across every known node.
	pub fn fetch_all_channels(&self) -> Result<Vec<Channel>, Error> {
		let states = self.store.view(|tx| {
			let open = match tx.bucket(OPEN_CHANNEL_BUCKET)? {
				Some(open) => open,
				None => return Ok::<Vec<OpenChannel>, Error>(Vec::new()),
			};

			let mut all = Vec::new();
			for node_name in open.child_buckets(tx)? {
				let node = match open.bucket(tx, &node_name)? {
					Some(node) => node,
					None => continue,
				};
				all.extend(fetch_node_channels(tx, &open, &node)?);
			}
			Ok(all)
		})?;

		Ok(states.into_iter().map(|state| Channel::new(self.clone(), state)).collect())
	}
}

/// Load every channel registered in a node bucket's channel index.
fn fetch_node_channels(
	tx: &kv::Tx<'_>,
	open: &kv::Bucket,
	node: &kv::Bucket,
) -> Result<Vec<OpenChannel>, Error> {
	let index = match node.bucket(tx, channel::CHAN_ID_BUCKET)? {
		Some(index) => index,
		None => return Ok(Vec::new()),
	};

	let mut channels = Vec::new();
	for (key, _) in index.entries(tx, &[])? {
		let chan_id = OutPoint::deserialize(&key)?;
		channels.push(channel::fetch_open_channel(tx, open, node, &chan_id)?);
	}
	Ok(channels)
}

#[cfg(test)]
mod test {
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};

	use crate::channel::test::dummy_channel;

	use super::*;

	#[test]
	fn open_creates_buckets_and_version() {
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();
		assert_eq!(db.version().unwrap(), 1);

		db.store
			.view(|tx| {
				for name in [
					OPEN_CHANNEL_BUCKET,
					CLOSED_CHANNEL_BUCKET,
					INVOICE_BUCKET,
					NODE_INFO_BUCKET,
					META_BUCKET,
				] {
					assert!(tx.bucket(name)?.is_some());
				}
				Ok::<_, Error>(())
			})
			.unwrap();
	}

	#[test]
	fn failed_migration_leaves_version_unchanged() {
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		fn failing(_tx: &mut kv::Tx<'_>) -> Result<(), Error> {
			Err(Error::NoChanDb)
		}
		let versions = [
			migrations::Version { number: 1, migration: None },
			migrations::Version { number: 2, migration: Some(failing) },
		];
		assert!(db.sync_versions(&versions).is_err());
		assert_eq!(db.version().unwrap(), 1);
	}

	#[test]
	fn wipe_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();
		db.wipe().unwrap();
		// All four data buckets are gone now; wiping again ignores that.
		db.wipe().unwrap();
	}

	#[test]
	fn fetch_with_no_channels_returns_empty() {
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();
		let node_id: NodeId = [7u8; 32];
		assert!(db.fetch_open_channels(&node_id).unwrap().is_empty());
		assert!(db.fetch_all_channels().unwrap().is_empty());
	}

	#[test]
	fn fetch_all_spans_multiple_nodes() {
		let mut rng = StdRng::seed_from_u64(20);
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		for _ in 0..3 {
			let node_id: NodeId = rng.gen();
			let channel = Channel::new(db.clone(), dummy_channel(&mut rng, node_id));
			channel.full_sync().unwrap();
		}

		assert_eq!(db.fetch_all_channels().unwrap().len(), 3);
	}
}
