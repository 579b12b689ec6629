//!
//! Two-stage maturation tracker for on-chain outputs of closed channels.
//!
//! Outputs enter the nursery when a channel hits the chain and leave it
//! once their timelocks have run out and they have been swept. An HTLC
//! output first waits out its absolute CLTV expiry (the "crib"), then a
//! relative CSV delay (the "kindergarten"); a commitment output waits in
//! "preschool" for its confirmation before its CSV delay starts ticking.
//!
//! The store keeps two parallel indexes under a chain-segmented root
//! bucket. The channel index holds the serialized outputs themselves,
//! keyed by a 4-byte state tag plus the output's outpoint. The height
//! index holds empty marker buckets mirroring those keys: the presence of
//! `height/<chan>/<tag><outpoint>` means that output has an action due at
//! that height. Every state transition moves both indexes in one
//! transaction, and empty buckets are garbage-collected as outputs move
//! on.
//!
//! ```text
//!   utxn<chain-hash>/
//!   ├── last-finalized-height: <u32 BE>
//!   ├── channel-index/
//!   │   └── <chan-point>/
//!   │       └── <state-tag><outpoint>: <serialized output>
//!   └── height-index/
//!       └── <height BE>/
//!           └── <chan-point>/
//!               └── <state-tag><outpoint>/     (empty marker bucket)
//! ```

use std::collections::HashSet;
use std::io;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Transaction};
use log::{debug, info};

use crate::channel::MAX_SCRIPT_SIZE;
use crate::encode::{DecodeError, ReadExt, RecordEncoding, WriteExt};
use crate::{kv, ChannelDb, Error};

/// Prefix of the chain-segmented root bucket: `utxn` followed by the
/// chain hash, so multiple nurseries can share one physical store.
const UTXN_CHAIN_PREFIX: &[u8; 4] = b"utxn";

/// Key of the last height whose nursery actions are finalized beyond
/// reorg risk.
const LAST_FINALIZED_HEIGHT_KEY: &[u8] = b"last-finalized-height";

/// Bucket holding a sub-bucket of serialized outputs per channel.
const CHANNEL_INDEX_BUCKET: &[u8] = b"channel-index";

/// Bucket holding, per height, marker buckets for outputs with actions
/// due at that height.
const HEIGHT_INDEX_BUCKET: &[u8] = b"height-index";

/// State tag of HTLC outputs waiting out their absolute CLTV expiry.
const CRIB_PREFIX: &[u8; 4] = b"crib";

/// State tag of commitment outputs awaiting confirmation of the
/// commitment transaction.
const PSCL_PREFIX: &[u8; 4] = b"pscl";

/// State tag of CSV-delayed outputs whose maturity height is known.
const KNDR_PREFIX: &[u8; 4] = b"kndr";

/// A CSV-delayed output in its final incubation stage: the confirmation
/// height is known and the output can be swept once
/// `conf_height + blocks_to_maturity` is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KidOutput {
	/// The output under incubation.
	pub outpoint: OutPoint,

	/// Funding outpoint of the channel this output came from.
	pub origin_chan_point: OutPoint,

	pub amount: Amount,

	/// Height at which the transaction creating this output confirmed.
	pub conf_height: u32,

	/// Relative delay, in blocks, before the output may be swept.
	pub blocks_to_maturity: u32,

	/// Key authorized to sweep the output once mature.
	pub delay_key: PublicKey,

	/// Witness script gating the sweep path.
	pub witness_script: ScriptBuf,
}

impl KidOutput {
	/// First height at which this output can be swept.
	pub fn maturity_height(&self) -> u32 {
		self.conf_height + self.blocks_to_maturity
	}
}

impl RecordEncoding for KidOutput {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		self.outpoint.encode(w)?;
		self.origin_chan_point.encode(w)?;
		self.amount.encode(w)?;
		w.emit_u32(self.conf_height)?;
		w.emit_u32(self.blocks_to_maturity)?;
		self.delay_key.encode(w)?;
		w.emit_var_bytes(self.witness_script.as_bytes())
	}

	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(KidOutput {
			outpoint: OutPoint::decode(r)?,
			origin_chan_point: OutPoint::decode(r)?,
			amount: Amount::decode(r)?,
			conf_height: r.read_u32()?,
			blocks_to_maturity: r.read_u32()?,
			delay_key: PublicKey::decode(r)?,
			witness_script: ScriptBuf::from_bytes(
				r.read_var_bytes(MAX_SCRIPT_SIZE, "kid witness script")?,
			),
		})
	}
}

/// An HTLC output in its first incubation stage, waiting for its
/// absolute CLTV expiry. Carries the presigned timeout transaction that
/// must be broadcast at expiry, and the [KidOutput] that the timeout
/// transaction's output becomes afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BabyOutput {
	pub kid: KidOutput,

	/// Absolute height at which the HTLC refund path opens up.
	pub expiry: u32,

	/// Presigned first-stage HTLC timeout transaction.
	pub timeout_tx: Transaction,
}

impl BabyOutput {
	/// The outpoint under incubation during the crib stage.
	pub fn outpoint(&self) -> OutPoint {
		self.kid.outpoint
	}

	pub fn origin_chan_point(&self) -> OutPoint {
		self.kid.origin_chan_point
	}
}

impl RecordEncoding for BabyOutput {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		self.kid.encode(w)?;
		w.emit_u32(self.expiry)?;
		w.emit_slice(&bitcoin::consensus::encode::serialize(&self.timeout_tx))
	}

	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		let kid = KidOutput::decode(r)?;
		let expiry = r.read_u32()?;
		let mut buf = Vec::new();
		r.read_to_end(&mut buf)?;
		let (timeout_tx, _) =
			bitcoin::consensus::encode::deserialize_partial::<Transaction>(&buf)?;
		Ok(BabyOutput { kid, expiry, timeout_tx })
	}
}

/// An output in one of the nursery's incubation states. The 4-byte
/// on-disk tags are an encoding detail; enumeration surfaces this
/// explicit union instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NurseryOutput {
	/// HTLC output waiting for its CLTV expiry.
	Crib(BabyOutput),
	/// Commitment output waiting for confirmation.
	Preschool(KidOutput),
	/// CSV-delayed output waiting for its maturity height.
	Kindergarten(KidOutput),
}

/// Outcome of an attempt to garbage-collect a bucket.
///
/// Both non-removal cases are ordinary results rather than errors;
/// transition code matches all three and only real storage failures
/// propagate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PruneOutcome {
	/// The bucket was empty and has been removed.
	Removed,
	/// The bucket still has live children and was left in place.
	NotEmpty,
	/// The bucket did not exist (possibly pruned earlier).
	NoBucket,
}

/// Persistent store tracking nursery outputs across restarts.
///
/// All state lives under a root bucket named by the chain hash, so
/// distinct chains sharing one database cannot observe each other.
pub struct NurseryStore {
	chain_key: Vec<u8>,
	db: ChannelDb,
}

impl NurseryStore {
	/// Create a nursery store view over the given database, segmented to
	/// the given chain.
	pub fn new(chain_hash: BlockHash, db: ChannelDb) -> NurseryStore {
		let mut chain_key = Vec::with_capacity(36);
		chain_key.extend_from_slice(UTXN_CHAIN_PREFIX);
		chain_key.extend_from_slice(&chain_hash.to_byte_array());
		NurseryStore { chain_key, db }
	}

	/// Persist a new first-stage HTLC output. It will be revisited once
	/// its CLTV expiry height is reached.
	pub fn enter_crib(&self, baby: &BabyOutput) -> Result<(), Error> {
		self.db.store().update(|tx| {
			let chan_point = baby.origin_chan_point();
			let chan_bucket = self.create_channel_bucket(tx, &chan_point)?;

			let key = prefix_output_key(CRIB_PREFIX, &baby.outpoint());
			chan_bucket.put(tx, &key, &baby.serialize());

			// Mirror the entry in the height index at the expiry height;
			// the marker bucket's existence is the signal.
			let hc = self.create_height_chan_bucket(tx, baby.expiry, &chan_point)?;
			hc.create_bucket_if_not_exists(tx, &key)?;

			debug!("crib output {} enters nursery, expiry {}", baby.outpoint(), baby.expiry);
			Ok(())
		})
	}

	/// Persist a new commitment output awaiting confirmation. No height
	/// index entry exists yet: the maturity height is unknown until the
	/// commitment transaction confirms.
	pub fn enter_preschool(&self, kid: &KidOutput) -> Result<(), Error> {
		self.db.store().update(|tx| {
			let chan_bucket = self.create_channel_bucket(tx, &kid.origin_chan_point)?;
			let key = prefix_output_key(PSCL_PREFIX, &kid.outpoint);
			chan_bucket.put(tx, &key, &kid.serialize());

			debug!("preschool output {} enters nursery", kid.outpoint);
			Ok(())
		})
	}

	/// Atomically move a crib output whose timeout transaction confirmed
	/// into the kindergarten, re-indexing it from its CLTV expiry to its
	/// CSV maturity height.
	pub fn crib_to_kinder(&self, baby: &BabyOutput) -> Result<(), Error> {
		self.db.store().update(|tx| {
			let chan_point = baby.origin_chan_point();
			let chan_bucket = self.create_channel_bucket(tx, &chan_point)?;

			let mut key = prefix_output_key(CRIB_PREFIX, &baby.outpoint());
			chan_bucket.delete(tx, &key);

			// Drop the height-index marker at the old expiry height, if the
			// bucket chain is still there.
			if let Some(hc) = self.height_chan_bucket(tx, baby.expiry, &chan_point)? {
				hc.delete_bucket(tx, &key)?;
			}

			// Same outpoint, new state tag.
			key[..4].copy_from_slice(KNDR_PREFIX);
			chan_bucket.put(tx, &key, &baby.kid.serialize());

			let maturity = baby.kid.maturity_height();
			let hc = self.create_height_chan_bucket(tx, maturity, &chan_point)?;
			hc.create_bucket_if_not_exists(tx, &key)?;

			// Opportunistically clean up the old height bucket; a survivor
			// at the same height is not an error.
			match self.prune_height(tx, baby.expiry)? {
				PruneOutcome::Removed => {
					debug!("height bucket {} pruned", baby.expiry);
				}
				PruneOutcome::NotEmpty | PruneOutcome::NoBucket => {}
			}
			Ok(())
		})
	}

	/// Atomically move a confirmed preschool output into the
	/// kindergarten, entering it into the height index at its now-known
	/// maturity height.
	pub fn preschool_to_kinder(&self, kid: &KidOutput) -> Result<(), Error> {
		self.db.store().update(|tx| {
			let chan_bucket = self.create_channel_bucket(tx, &kid.origin_chan_point)?;

			let mut key = prefix_output_key(PSCL_PREFIX, &kid.outpoint);
			chan_bucket.delete(tx, &key);

			key[..4].copy_from_slice(KNDR_PREFIX);
			// Reserialize to capture the confirmation height learned since
			// the output entered preschool.
			chan_bucket.put(tx, &key, &kid.serialize());

			let hc = self.create_height_chan_bucket(
				tx,
				kid.maturity_height(),
				&kid.origin_chan_point,
			)?;
			hc.create_bucket_if_not_exists(tx, &key)?;
			Ok(())
		})
	}

	/// Remove fully swept kindergarten outputs from both indexes,
	/// pruning every bucket they leave empty. Returns the channel points
	/// whose last incubating output just graduated; those channels are
	/// ready to be marked fully closed.
	pub fn award_diplomas(&self, kids: &[KidOutput]) -> Result<Vec<OutPoint>, Error> {
		let mut closed_channels: HashSet<OutPoint> = HashSet::new();
		self.db.store().update(|tx| {
			for kid in kids {
				let chan_point = kid.origin_chan_point;
				let key = prefix_output_key(KNDR_PREFIX, &kid.outpoint);

				// Pull the graduating output's marker out of the height
				// index and collect the empty buckets it leaves behind.
				let maturity = kid.maturity_height();
				if let Some(hc) = self.height_chan_bucket(tx, maturity, &chan_point)? {
					match hc.delete_bucket(tx, &key) {
						Ok(()) | Err(kv::Error::BucketNotFound) => {}
						Err(e) => return Err::<(), Error>(e.into()),
					}
				}
				match self.prune_height(tx, maturity)? {
					PruneOutcome::Removed => info!("height bucket {} pruned", maturity),
					PruneOutcome::NotEmpty | PruneOutcome::NoBucket => {}
				}

				// Remove the output from its channel bucket, then try to
				// retire the channel bucket altogether.
				match self.delete_and_prune_channel(tx, &chan_point, &key)? {
					PruneOutcome::NotEmpty => {
						// Still incubating siblings; this channel stays.
						continue;
					}
					PruneOutcome::Removed | PruneOutcome::NoBucket => {
						closed_channels.insert(chan_point);
					}
				}
			}
			Ok::<(), Error>(())
		})?;

		let closed: Vec<OutPoint> = closed_channels.into_iter().collect();
		if !closed.is_empty() {
			info!("channels ready to be marked fully closed: {:?}", closed);
		}
		Ok(closed)
	}

	/// Record `height` as finalized and purge its height bucket: all
	/// nursery actions at or below it are committed beyond reorg risk,
	/// and a restart will resume scanning at `height + 1`. Callers pass
	/// the best height minus their reorg safety margin.
	pub fn finalize_class(&self, height: u32) -> Result<(), Error> {
		info!("finalizing nursery class at height {}", height);
		self.db.store().update(|tx| {
			let chain = tx.create_bucket_if_not_exists(&self.chain_key)?;
			chain.put(tx, LAST_FINALIZED_HEIGHT_KEY, &height.to_be_bytes());

			if let Some(height_index) = chain.bucket(tx, HEIGHT_INDEX_BUCKET)? {
				match height_index.delete_bucket(tx, &height.to_be_bytes()) {
					Ok(()) | Err(kv::Error::BucketNotFound) => {}
					Err(e) => return Err(e.into()),
				}
			}
			Ok(())
		})
	}

	/// The last height for which nursery state has been finalized, or 0
	/// if no class has graduated yet.
	pub fn last_finalized_height(&self) -> Result<u32, Error> {
		self.db.store().view(|tx| {
			let chain = match tx.bucket(&self.chain_key)? {
				Some(chain) => chain,
				None => return Ok(0),
			};
			match chain.get(tx, LAST_FINALIZED_HEIGHT_KEY)? {
				Some(bytes) => match <[u8; 4]>::try_from(bytes.as_slice()) {
					Ok(arr) => Ok(u32::from_be_bytes(arr)),
					Err(_) => Ok(0),
				},
				None => Ok(0),
			}
		})
	}

	/// List the crib outputs whose CLTV expires at `height`.
	pub fn fetch_cribs(&self, height: u32) -> Result<Vec<BabyOutput>, Error> {
		self.fetch_height_prefix(CRIB_PREFIX, height, |bytes| BabyOutput::deserialize(bytes))
	}

	/// List the kindergarten outputs whose CSV delay expires at `height`.
	pub fn fetch_kindergartens(&self, height: u32) -> Result<Vec<KidOutput>, Error> {
		self.fetch_height_prefix(KNDR_PREFIX, height, |bytes| KidOutput::deserialize(bytes))
	}

	/// List every output currently waiting in preschool, across all
	/// channels.
	pub fn fetch_preschools(&self) -> Result<Vec<KidOutput>, Error> {
		self.db.store().view(|tx| {
			let chan_index = match self.channel_index(tx)? {
				Some(b) => b,
				None => return Ok(Vec::new()),
			};

			let mut kids = Vec::new();
			for chan_name in chan_index.child_buckets(tx)? {
				let chan_bucket = match chan_index.bucket(tx, &chan_name)? {
					Some(b) => b,
					None => continue,
				};
				for (_, bytes) in chan_bucket.entries(tx, PSCL_PREFIX)? {
					kids.push(KidOutput::deserialize(&bytes)?);
				}
			}
			Ok(kids)
		})
	}

	/// Iterate every output incubating for the given channel, in state
	/// tag order. Fails with [Error::ContractNotFound] when the channel
	/// has no bucket in the nursery.
	pub fn for_chan_outputs(
		&self,
		chan_point: &OutPoint,
		mut callback: impl FnMut(NurseryOutput) -> Result<(), Error>,
	) -> Result<(), Error> {
		self.db.store().view(|tx| {
			let chan_bucket = self
				.channel_bucket(tx, chan_point)?
				.ok_or(Error::ContractNotFound)?;

			for (key, bytes) in chan_bucket.entries(tx, &[])? {
				let output = match key.get(..4) {
					Some(tag) if tag == CRIB_PREFIX => {
						NurseryOutput::Crib(BabyOutput::deserialize(&bytes)?)
					}
					Some(tag) if tag == PSCL_PREFIX => {
						NurseryOutput::Preschool(KidOutput::deserialize(&bytes)?)
					}
					Some(tag) if tag == KNDR_PREFIX => {
						NurseryOutput::Kindergarten(KidOutput::deserialize(&bytes)?)
					}
					_ => {
						return Err(DecodeError::invalid("unknown nursery state tag").into())
					}
				};
				callback(output)?;
			}
			Ok(())
		})
	}

	/// Enumerate outputs with the given state tag at `height`: walk the
	/// height bucket's channel sub-buckets, then dereference each marker
	/// into the channel index to load the serialized output.
	fn fetch_height_prefix<T>(
		&self,
		prefix: &[u8; 4],
		height: u32,
		decode: impl Fn(&[u8]) -> Result<T, DecodeError>,
	) -> Result<Vec<T>, Error> {
		self.db.store().view(|tx| {
			let height_bucket = match self.height_bucket(tx, height)? {
				Some(b) => b,
				None => return Ok(Vec::new()),
			};
			let chan_index = match self.channel_index(tx)? {
				Some(b) => b,
				None => return Ok(Vec::new()),
			};

			let mut outputs = Vec::new();
			for chan_name in height_bucket.child_buckets(tx)? {
				let hc = match height_bucket.bucket(tx, &chan_name)? {
					Some(b) => b,
					None => continue,
				};
				let chan_bucket = match chan_index.bucket(tx, &chan_name)? {
					Some(b) => b,
					None => continue,
				};

				for marker in hc.child_buckets(tx)? {
					if !marker.starts_with(prefix) {
						continue;
					}
					// The marker names the key of the serialized output in
					// the channel bucket.
					if let Some(bytes) = chan_bucket.get(tx, &marker)? {
						outputs.push(decode(&bytes)?);
					}
				}
			}
			Ok(outputs)
		})
	}

	/// Remove one output from its channel bucket, then retire the bucket
	/// if that was its last output.
	fn delete_and_prune_channel(
		&self,
		tx: &mut kv::Tx<'_>,
		chan_point: &OutPoint,
		key: &[u8],
	) -> Result<PruneOutcome, Error> {
		let chan_index = match self.channel_index(tx)? {
			Some(b) => b,
			None => return Ok(PruneOutcome::NoBucket),
		};
		let chan_name = chan_point.serialize();
		let chan_bucket = match chan_index.bucket(tx, &chan_name)? {
			Some(b) => b,
			None => return Ok(PruneOutcome::NoBucket),
		};

		chan_bucket.delete(tx, key);
		remove_bucket_if_empty(tx, &chan_index, &chan_name)
	}

	/// Try to remove the height bucket at `height` along with any of its
	/// now-empty height-channel buckets.
	fn prune_height(&self, tx: &mut kv::Tx<'_>, height: u32) -> Result<PruneOutcome, Error> {
		let chain = match tx.bucket(&self.chain_key)? {
			Some(b) => b,
			None => return Ok(PruneOutcome::NoBucket),
		};
		let height_index = match chain.bucket(tx, HEIGHT_INDEX_BUCKET)? {
			Some(b) => b,
			None => return Ok(PruneOutcome::NoBucket),
		};
		let height_key = height.to_be_bytes();
		let height_bucket = match height_index.bucket(tx, &height_key)? {
			Some(b) => b,
			None => return Ok(PruneOutcome::NoBucket),
		};

		// Sweep out empty height-channel buckets; any survivor keeps the
		// height bucket alive.
		let mut active = 0usize;
		for chan_name in height_bucket.child_buckets(tx)? {
			match remove_bucket_if_empty(tx, &height_bucket, &chan_name)? {
				PruneOutcome::Removed | PruneOutcome::NoBucket => {}
				PruneOutcome::NotEmpty => active += 1,
			}
		}
		if active > 0 {
			return Ok(PruneOutcome::NotEmpty);
		}

		remove_bucket_if_empty(tx, &height_index, &height_key)
	}

	fn chain_bucket(&self, tx: &kv::Tx<'_>) -> Result<Option<kv::Bucket>, Error> {
		Ok(tx.bucket(&self.chain_key)?)
	}

	fn channel_index(&self, tx: &kv::Tx<'_>) -> Result<Option<kv::Bucket>, Error> {
		match self.chain_bucket(tx)? {
			Some(chain) => Ok(chain.bucket(tx, CHANNEL_INDEX_BUCKET)?),
			None => Ok(None),
		}
	}

	fn channel_bucket(
		&self,
		tx: &kv::Tx<'_>,
		chan_point: &OutPoint,
	) -> Result<Option<kv::Bucket>, Error> {
		match self.channel_index(tx)? {
			Some(index) => Ok(index.bucket(tx, &chan_point.serialize())?),
			None => Ok(None),
		}
	}

	fn create_channel_bucket(
		&self,
		tx: &mut kv::Tx<'_>,
		chan_point: &OutPoint,
	) -> Result<kv::Bucket, Error> {
		let chain = tx.create_bucket_if_not_exists(&self.chain_key)?;
		let index = chain.create_bucket_if_not_exists(tx, CHANNEL_INDEX_BUCKET)?;
		Ok(index.create_bucket_if_not_exists(tx, &chan_point.serialize())?)
	}

	fn height_bucket(&self, tx: &kv::Tx<'_>, height: u32) -> Result<Option<kv::Bucket>, Error> {
		let index = match self.chain_bucket(tx)? {
			Some(chain) => chain.bucket(tx, HEIGHT_INDEX_BUCKET)?,
			None => None,
		};
		match index {
			Some(index) => Ok(index.bucket(tx, &height.to_be_bytes())?),
			None => Ok(None),
		}
	}

	fn height_chan_bucket(
		&self,
		tx: &kv::Tx<'_>,
		height: u32,
		chan_point: &OutPoint,
	) -> Result<Option<kv::Bucket>, Error> {
		match self.height_bucket(tx, height)? {
			Some(height_bucket) => Ok(height_bucket.bucket(tx, &chan_point.serialize())?),
			None => Ok(None),
		}
	}

	fn create_height_chan_bucket(
		&self,
		tx: &mut kv::Tx<'_>,
		height: u32,
		chan_point: &OutPoint,
	) -> Result<kv::Bucket, Error> {
		let chain = tx.create_bucket_if_not_exists(&self.chain_key)?;
		let index = chain.create_bucket_if_not_exists(tx, HEIGHT_INDEX_BUCKET)?;
		let height_bucket = index.create_bucket_if_not_exists(tx, &height.to_be_bytes())?;
		Ok(height_bucket.create_bucket_if_not_exists(tx, &chan_point.serialize())?)
	}
}

/// Serialized key of an output in a given nursery state:
/// `<state-tag><outpoint>`.
fn prefix_output_key(state_prefix: &[u8; 4], outpoint: &OutPoint) -> Vec<u8> {
	let mut key = Vec::with_capacity(4 + 37);
	key.extend_from_slice(state_prefix);
	key.extend_from_slice(&outpoint.serialize());
	key
}

/// Delete the named bucket from its parent iff it has no children,
/// reporting which of the three outcomes occurred.
fn remove_bucket_if_empty(
	tx: &mut kv::Tx<'_>,
	parent: &kv::Bucket,
	name: &[u8],
) -> Result<PruneOutcome, Error> {
	let bucket = match parent.bucket(tx, name)? {
		Some(b) => b,
		None => return Ok(PruneOutcome::NoBucket),
	};
	if !bucket.is_empty(tx)? {
		return Ok(PruneOutcome::NotEmpty);
	}
	parent.delete_bucket(tx, name)?;
	Ok(PruneOutcome::Removed)
}

#[cfg(test)]
mod test {
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	use crate::channel::test::{dummy_outpoint, dummy_pubkey, dummy_tx};

	use super::*;

	fn test_nursery() -> (tempfile::TempDir, NurseryStore) {
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();
		(dir, NurseryStore::new(BlockHash::all_zeros(), db))
	}

	fn dummy_kid(rng: &mut StdRng, conf_height: u32, blocks_to_maturity: u32) -> KidOutput {
		KidOutput {
			outpoint: dummy_outpoint(rng),
			origin_chan_point: dummy_outpoint(rng),
			amount: Amount::from_sat(10_000),
			conf_height,
			blocks_to_maturity,
			delay_key: dummy_pubkey(rng),
			witness_script: ScriptBuf::from_bytes(vec![0x51]),
		}
	}

	fn dummy_baby(rng: &mut StdRng, expiry: u32, conf_height: u32, maturity: u32) -> BabyOutput {
		BabyOutput {
			kid: dummy_kid(rng, conf_height, maturity),
			expiry,
			timeout_tx: dummy_tx(rng),
		}
	}

	#[test]
	fn output_encodings_roundtrip() {
		let mut rng = StdRng::seed_from_u64(10);
		let kid = dummy_kid(&mut rng, 120, 10);
		assert_eq!(KidOutput::deserialize(&kid.serialize()).unwrap(), kid);

		let baby = dummy_baby(&mut rng, 100, 120, 10);
		assert_eq!(BabyOutput::deserialize(&baby.serialize()).unwrap(), baby);
	}

	#[test]
	fn crib_to_kinder_moves_both_indexes() {
		let mut rng = StdRng::seed_from_u64(11);
		let (_dir, nursery) = test_nursery();

		let baby = dummy_baby(&mut rng, 100, 120, 10);
		nursery.enter_crib(&baby).unwrap();
		assert_eq!(nursery.fetch_cribs(100).unwrap(), vec![baby.clone()]);
		assert!(nursery.fetch_kindergartens(130).unwrap().is_empty());

		nursery.crib_to_kinder(&baby).unwrap();
		assert!(nursery.fetch_cribs(100).unwrap().is_empty());
		assert_eq!(nursery.fetch_kindergartens(130).unwrap(), vec![baby.kid.clone()]);

		// Exactly one state-tagged record remains for the output.
		let mut seen = Vec::new();
		nursery
			.for_chan_outputs(&baby.origin_chan_point(), |out| {
				seen.push(out);
				Ok(())
			})
			.unwrap();
		assert_eq!(seen, vec![NurseryOutput::Kindergarten(baby.kid.clone())]);
	}

	#[test]
	fn preschool_flow_and_graduation_closes_channel() {
		let mut rng = StdRng::seed_from_u64(12);
		let (_dir, nursery) = test_nursery();

		let kid = dummy_kid(&mut rng, 500, 6);
		nursery.enter_preschool(&kid).unwrap();
		assert_eq!(nursery.fetch_preschools().unwrap(), vec![kid.clone()]);

		nursery.preschool_to_kinder(&kid).unwrap();
		assert!(nursery.fetch_preschools().unwrap().is_empty());
		assert_eq!(nursery.fetch_kindergartens(506).unwrap(), vec![kid.clone()]);

		let closed = nursery.award_diplomas(std::slice::from_ref(&kid)).unwrap();
		assert_eq!(closed, vec![kid.origin_chan_point]);

		// The channel bucket is gone from the channel index.
		assert!(matches!(
			nursery.for_chan_outputs(&kid.origin_chan_point, |_| Ok(())),
			Err(Error::ContractNotFound)
		));
		assert!(nursery.fetch_kindergartens(506).unwrap().is_empty());
	}

	#[test]
	fn graduation_keeps_channels_with_remaining_outputs() {
		let mut rng = StdRng::seed_from_u64(13);
		let (_dir, nursery) = test_nursery();

		let chan_point = dummy_outpoint(&mut rng);
		let mut first = dummy_kid(&mut rng, 200, 3);
		first.origin_chan_point = chan_point;
		let mut second = dummy_kid(&mut rng, 210, 3);
		second.origin_chan_point = chan_point;

		nursery.enter_preschool(&first).unwrap();
		nursery.enter_preschool(&second).unwrap();
		nursery.preschool_to_kinder(&first).unwrap();
		nursery.preschool_to_kinder(&second).unwrap();

		// Only the first output graduates; its channel still incubates the
		// second, so no channel point is returned.
		let closed = nursery.award_diplomas(std::slice::from_ref(&first)).unwrap();
		assert!(closed.is_empty());

		let closed = nursery.award_diplomas(std::slice::from_ref(&second)).unwrap();
		assert_eq!(closed, vec![chan_point]);
	}

	#[test]
	fn finalize_class_tracks_and_purges() {
		let mut rng = StdRng::seed_from_u64(14);
		let (_dir, nursery) = test_nursery();
		assert_eq!(nursery.last_finalized_height().unwrap(), 0);

		let baby = dummy_baby(&mut rng, 100, 120, 10);
		nursery.enter_crib(&baby).unwrap();

		nursery.finalize_class(100).unwrap();
		assert_eq!(nursery.last_finalized_height().unwrap(), 100);

		// The height bucket at the finalized height has been purged; the
		// serialized output itself stays in the channel index.
		assert!(nursery.fetch_cribs(100).unwrap().is_empty());
		let mut count = 0;
		nursery
			.for_chan_outputs(&baby.origin_chan_point(), |_| {
				count += 1;
				Ok(())
			})
			.unwrap();
		assert_eq!(count, 1);
	}

	#[test]
	fn chains_are_isolated() {
		let mut rng = StdRng::seed_from_u64(15);
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		let mut other_hash = [0u8; 32];
		other_hash[0] = 1;
		let nursery_a = NurseryStore::new(BlockHash::all_zeros(), db.clone());
		let nursery_b = NurseryStore::new(BlockHash::from_byte_array(other_hash), db);

		let kid = dummy_kid(&mut rng, 50, 2);
		nursery_a.enter_preschool(&kid).unwrap();

		assert_eq!(nursery_a.fetch_preschools().unwrap().len(), 1);
		assert!(nursery_b.fetch_preschools().unwrap().is_empty());
	}
}
