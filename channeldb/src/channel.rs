//!
//! Open-channel state records and the operations that keep them on disk.
//!
//! A channel's frequently updated scalars (capacity, balances, counters)
//! live at the top level of the open-channels bucket under 3-byte
//! prefixed keys, so aggregate metrics reduce to cheap sequential prefix
//! scans and a balance update never rewrites the whole channel record.
//! The rest of the channel state is keyed inside the remote node's
//! bucket, alongside an append-only log of state deltas that supports
//! time-travel to any prior commitment for fraud recovery.
//!

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::elkrem::{ElkremReceiver, ElkremSender};
use crate::encode::{read_var_pubkey, DecodeError, ReadExt, RecordEncoding, WriteExt};
use crate::{kv, ChannelDb, Error, CLOSED_CHANNEL_BUCKET, OPEN_CHANNEL_BUCKET};

/// Opaque identifier of a remote node.
pub type NodeId = [u8; 32];

/// Upper bound on a stored commitment signature.
pub(crate) const MAX_COMMIT_SIG_SIZE: usize = 80;

/// Upper bound on any stored script, matching the consensus limit on
/// script element size.
pub(crate) const MAX_SCRIPT_SIZE: usize = 520;

// The following prefixes key the frequently updated scalar fields at the
// base level of the open-channels bucket: key = prefix || chan_id.
const CHAN_CAPACITY_PREFIX: &[u8; 3] = b"ccp";
const SELF_BALANCE_PREFIX: &[u8; 3] = b"sbp";
const THEIR_BALANCE_PREFIX: &[u8; 3] = b"tbp";
const MIN_FEE_PER_KB_PREFIX: &[u8; 3] = b"mfp";
const UPDATE_PREFIX: &[u8; 3] = b"uup";
const SAT_SENT_PREFIX: &[u8; 3] = b"ssp";
const SAT_RECEIVED_PREFIX: &[u8; 3] = b"srp";
const NET_FEES_PREFIX: &[u8; 3] = b"ntp";

// Field keys inside a node's channel bucket: key = prefix || chan_id.
const CHAN_ID_KEY: &[u8; 3] = b"cik";
const COMMIT_KEYS_KEY: &[u8; 3] = b"ckk";
const COMMIT_TXNS_KEY: &[u8; 3] = b"ctk";
const FUNDING_KEY: &[u8; 3] = b"fsk";
const REVOCATION_STATE_KEY: &[u8; 3] = b"esk";
const DELIVERY_SCRIPTS_KEY: &[u8; 3] = b"dsk";

/// Bucket inside a node's channel bucket holding one empty-valued entry
/// per active channel with that node; acts as the channel index.
pub(crate) const CHAN_ID_BUCKET: &[u8] = b"chan-id-index";

/// Bucket inside a node's channel bucket holding the append-only state
/// delta log, keyed by funding txid || update number.
pub(crate) const CHANNEL_LOG_BUCKET: &[u8] = b"channel-log";

/// An active payment channel with a remote node.
///
/// This is the plain state record; [Channel] wraps it with a database
/// capability and interior locking for live use.
#[derive(Clone, Debug)]
pub struct OpenChannel {
	/// Identifier of the counterparty node.
	pub remote_node_id: NodeId,

	/// The channel is identified by the outpoint of its funding output.
	pub chan_id: OutPoint,

	/// Total channel capacity and the current split of settled funds.
	pub capacity: Amount,
	pub our_balance: Amount,
	pub their_balance: Amount,

	pub min_fee_per_kb: Amount,

	/// Keys used by each side within commitment transactions.
	pub our_commit_key: PublicKey,
	pub their_commit_key: PublicKey,

	/// Our current commitment transaction along with the counterparty's
	/// signature over it. Exactly one live pair exists at any time.
	pub our_commit_tx: Transaction,
	pub our_commit_sig: Vec<u8>,

	pub local_csv_delay: u32,
	pub remote_csv_delay: u32,

	pub funding_outpoint: OutPoint,
	pub our_multisig_key: PublicKey,
	pub their_multisig_key: PublicKey,
	pub funding_redeem_script: ScriptBuf,

	/// The counterparty's current revocation key and hash. The key is
	/// derived, so it cannot be checked against the hash chain until the
	/// matching preimage is revealed.
	pub their_current_revocation: PublicKey,
	pub their_current_revocation_hash: [u8; 32],
	pub local_elkrem: ElkremSender,
	pub remote_elkrem: ElkremReceiver,

	/// Final-settlement output scripts for a cooperative close.
	pub our_delivery_script: ScriptBuf,
	pub their_delivery_script: ScriptBuf,

	pub num_updates: u64,
	pub total_sats_sent: u64,
	pub total_sats_received: u64,
	pub total_net_fees: u64,

	/// Unix timestamp of channel creation.
	pub creation_time: u64,
}

/// An on-disk hash time-locked contract, as carried inside a
/// [ChannelDelta]. Serialized into a fixed 49-byte layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Htlc {
	/// Whether we are the receiver of this HTLC.
	pub incoming: bool,

	/// The amount of satoshis this HTLC escrows.
	pub amount: Amount,

	/// The payment hash.
	pub rhash: [u8; 32],

	/// Absolute height after which the sender may reclaim the funds.
	pub refund_timeout: u32,

	/// Relative delay the broadcasting party must wait before sweeping.
	pub revocation_timeout: u32,
}

impl RecordEncoding for Htlc {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		w.emit_bool(self.incoming)?;
		self.amount.encode(w)?;
		w.emit_slice(&self.rhash)?;
		w.emit_u32(self.refund_timeout)?;
		w.emit_u32(self.revocation_timeout)
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Htlc {
			incoming: r.read_bool()?,
			amount: Amount::decode(r)?,
			rhash: r.read_byte_array()?,
			refund_timeout: r.read_u32()?,
			revocation_timeout: r.read_u32()?,
		})
	}
}

/// A snapshot of the commitment state at one point in the commitment
/// chain, recorded in the channel log with every state transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelDelta {
	pub local_balance: Amount,
	pub remote_balance: Amount,
	pub update_num: u32,

	/// HTLCs unsettled at this commitment point.
	pub htlcs: Vec<Htlc>,
}

impl RecordEncoding for ChannelDelta {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.local_balance.encode(w)?;
		self.remote_balance.encode(w)?;
		w.emit_u32(self.update_num)?;
		w.emit_compact_size(self.htlcs.len() as u64)?;
		for htlc in &self.htlcs {
			htlc.encode(w)?;
		}
		Ok(())
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		let local_balance = Amount::decode(r)?;
		let remote_balance = Amount::decode(r)?;
		let update_num = r.read_u32()?;
		let num_htlcs = r.read_compact_size()?;
		let mut htlcs = Vec::with_capacity(num_htlcs as usize);
		for _ in 0..num_htlcs {
			htlcs.push(Htlc::decode(r)?);
		}
		Ok(ChannelDelta { local_balance, remote_balance, update_num, htlcs })
	}
}

/// A frozen, detached copy of a channel's live scalars for read-only
/// consumers. Taking one never touches the database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelSnapshot {
	pub remote_node_id: NodeId,
	pub channel_point: OutPoint,

	pub capacity: Amount,
	pub local_balance: Amount,
	pub remote_balance: Amount,

	pub num_updates: u64,

	pub total_sats_sent: u64,
	pub total_sats_received: u64,
}

/// A live handle to an open channel: the in-memory mirror of its state
/// behind a reader-writer lock, plus the database capability used by its
/// persistence operations.
///
/// The mirror is only written after a transaction commits, so a failed
/// update leaves both disk and memory as they were.
pub struct Channel {
	db: ChannelDb,
	state: RwLock<OpenChannel>,
}

impl Channel {
	/// Wrap a channel state record into a live handle.
	pub fn new(db: ChannelDb, state: OpenChannel) -> Channel {
		Channel { db, state: RwLock::new(state) }
	}

	/// Read access to the in-memory mirror.
	pub fn state(&self) -> RwLockReadGuard<'_, OpenChannel> {
		self.state.read()
	}

	/// The channel's identifying funding outpoint.
	pub fn chan_id(&self) -> OutPoint {
		self.state.read().chan_id
	}

	/// Serialize and write the *full* channel state: the prefixed scalar
	/// fields at the top of the open-channels bucket, and everything else
	/// inside the remote node's bucket. Idempotent on the channel index
	/// entry.
	pub fn full_sync(&self) -> Result<(), Error> {
		let state = self.state.read();
		self.db.store().update(|tx| {
			let open = tx.create_bucket_if_not_exists(OPEN_CHANNEL_BUCKET)?;
			let node = open.create_bucket_if_not_exists(tx, &state.remote_node_id)?;

			// Register this channel in the node's channel index if it is
			// not already present.
			let index = node.create_bucket_if_not_exists(tx, CHAN_ID_BUCKET)?;
			let id = state.chan_id.serialize();
			if index.get(tx, &id)?.is_none() {
				index.put(tx, &id, &[]);
			}

			put_open_channel(tx, &open, &node, &state)
		})
	}

	/// Write only the current revocation state: the counterparty's
	/// revocation key and hash, our elkrem sender, and their elkrem
	/// receiver.
	pub fn sync_revocation(&self) -> Result<(), Error> {
		let state = self.state.read();
		self.db.store().update(|tx| {
			let open = tx.create_bucket_if_not_exists(OPEN_CHANNEL_BUCKET)?;
			let node = open.create_bucket_if_not_exists(tx, &state.remote_node_id)?;
			put_chan_revocation_state(tx, &node, &state);
			Ok(())
		})
	}

	/// Record a state transition in the append-only channel log and roll
	/// the live scalars forward to the delta's values, all in one
	/// transaction.
	///
	/// The log is append-only with exactly one entry per update number;
	/// a repeated update number overwrites, so monotonicity is the
	/// caller's contract.
	pub fn record_delta(
		&self,
		new_commit_tx: Transaction,
		new_sig: Vec<u8>,
		delta: &ChannelDelta,
	) -> Result<(), Error> {
		let updated = {
			let state = self.state.read();
			let mut updated = state.clone();
			updated.our_commit_tx = new_commit_tx;
			updated.our_commit_sig = new_sig;
			updated.our_balance = delta.local_balance;
			updated.their_balance = delta.remote_balance;
			updated.num_updates = delta.update_num as u64;
			updated
		};

		self.db.store().update(|tx| {
			let open = tx.create_bucket_if_not_exists(OPEN_CHANNEL_BUCKET)?;
			let node = open.create_bucket_if_not_exists(tx, &updated.remote_node_id)?;

			// The latest dynamic state first: balances, update counter and
			// the new commitment transaction + signature.
			put_chan_capacity(tx, &open, &updated);
			put_chan_num_updates(tx, &open, &updated);
			put_chan_commit_txns(tx, &node, &updated);

			// Then append the log entry recording this transition.
			let log = node.create_bucket_if_not_exists(tx, CHANNEL_LOG_BUCKET)?;
			append_channel_log_entry(tx, &log, &updated.chan_id, delta);
			Ok::<(), Error>(())
		})?;

		// Commit succeeded; only now does the mirror move.
		*self.state.write() = updated;
		Ok(())
	}

	/// Recover the channel delta recorded for the given update number,
	/// for claiming funds after an on-chain broadcast of a revoked
	/// commitment.
	pub fn find_previous_state(&self, update_num: u32) -> Result<ChannelDelta, Error> {
		let state = self.state.read();
		self.db.store().view(|tx| {
			let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.ok_or(Error::NoChanDb)?;
			let node = open
				.bucket(tx, &state.remote_node_id)?
				.ok_or(Error::NoActiveChannels)?;
			let log = node.bucket(tx, CHANNEL_LOG_BUCKET)?.ok_or(Error::NoPastDeltas)?;
			fetch_channel_log_entry(tx, &log, &state.chan_id, update_num)
		})
	}

	/// Close the channel: delete its index entry, every prefixed scalar
	/// and every node-bucket field in one transaction, and record a
	/// closed-channel summary keyed by the funding outpoint.
	pub fn close(&self) -> Result<(), Error> {
		let state = self.state.read();
		self.db.store().update(|tx| {
			let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.ok_or(Error::NoChanDb)?;
			let node = open
				.bucket(tx, &state.remote_node_id)?
				.ok_or(Error::NoActiveChannels)?;
			let index = node.bucket(tx, CHAN_ID_BUCKET)?.ok_or(Error::NoActiveChannels)?;

			let id = state.chan_id.serialize();
			index.delete(tx, &id);

			delete_open_channel(tx, &open, &node, &id);

			let closed = tx.create_bucket_if_not_exists(CLOSED_CHANNEL_BUCKET)?;
			closed.put(tx, &id, &[]);
			Ok(())
		})
	}

	/// A read-only snapshot of the current channel state.
	pub fn snapshot(&self) -> ChannelSnapshot {
		let state = self.state.read();
		ChannelSnapshot {
			remote_node_id: state.remote_node_id,
			channel_point: state.chan_id,
			capacity: state.capacity,
			local_balance: state.our_balance,
			remote_balance: state.their_balance,
			num_updates: state.num_updates,
			total_sats_sent: state.total_sats_sent,
			total_sats_received: state.total_sats_received,
		}
	}
}

fn prefixed_key(prefix: &[u8; 3], chan_id: &[u8]) -> Vec<u8> {
	let mut key = Vec::with_capacity(3 + chan_id.len());
	key.extend_from_slice(prefix);
	key.extend_from_slice(chan_id);
	key
}

/// Key of a channel log entry: funding txid || update number.
fn log_entry_key(chan_id: &OutPoint, update_num: u32) -> [u8; 36] {
	let mut key = [0u8; 36];
	key[..32].copy_from_slice(&chan_id.txid.to_byte_array());
	key[32..].copy_from_slice(&update_num.to_be_bytes());
	key
}

fn get_required(
	tx: &kv::Tx<'_>,
	bucket: &kv::Bucket,
	key: &[u8],
	what: &str,
) -> Result<Vec<u8>, Error> {
	bucket
		.get(tx, key)?
		.ok_or_else(|| DecodeError::invalid(format_args!("missing {} record", what)).into())
}

fn fetch_u64_field(
	tx: &kv::Tx<'_>,
	bucket: &kv::Bucket,
	key: &[u8],
	what: &str,
) -> Result<u64, Error> {
	let bytes = get_required(tx, bucket, key, what)?;
	let bytes: [u8; 8] = bytes
		.try_into()
		.map_err(|_| DecodeError::invalid(format_args!("{} record has wrong width", what)))?;
	Ok(u64::from_be_bytes(bytes))
}

/// Write the full channel state: prefixed scalars into the open-channels
/// bucket, field records into the node's bucket.
pub(crate) fn put_open_channel(
	tx: &mut kv::Tx<'_>,
	open: &kv::Bucket,
	node: &kv::Bucket,
	channel: &OpenChannel,
) -> Result<(), Error> {
	put_chan_capacity(tx, open, channel);
	put_chan_min_fee_per_kb(tx, open, channel);
	put_chan_num_updates(tx, open, channel);
	put_chan_total_flow(tx, open, channel);
	put_chan_net_fees(tx, open, channel);

	put_chan_id(tx, node, channel);
	put_chan_commit_keys(tx, node, channel);
	put_chan_commit_txns(tx, node, channel);
	put_chan_funding_info(tx, node, channel);
	put_chan_revocation_state(tx, node, channel);
	put_chan_delivery_scripts(tx, node, channel);
	Ok(())
}

/// Read the complete channel state back out of both buckets.
pub(crate) fn fetch_open_channel(
	tx: &kv::Tx<'_>,
	open: &kv::Bucket,
	node: &kv::Bucket,
	chan_id: &OutPoint,
) -> Result<OpenChannel, Error> {
	let id = chan_id.serialize();

	let remote_node_id = {
		let bytes = get_required(tx, node, &prefixed_key(CHAN_ID_KEY, &id), "channel id")?;
		let bytes: [u8; 32] = bytes
			.try_into()
			.map_err(|_| DecodeError::invalid("channel id record has wrong width"))?;
		bytes
	};

	let keys = CommitKeysRecord::deserialize(&get_required(
		tx,
		node,
		&prefixed_key(COMMIT_KEYS_KEY, &id),
		"commit keys",
	)?)?;
	let txns = CommitTxnsRecord::deserialize(&get_required(
		tx,
		node,
		&prefixed_key(COMMIT_TXNS_KEY, &id),
		"commit transactions",
	)?)?;
	let funding = FundingInfoRecord::deserialize(&get_required(
		tx,
		node,
		&prefixed_key(FUNDING_KEY, &id),
		"funding info",
	)?)?;
	let revocation = RevocationStateRecord::deserialize(&get_required(
		tx,
		node,
		&prefixed_key(REVOCATION_STATE_KEY, &id),
		"revocation state",
	)?)?;
	let delivery = DeliveryScriptsRecord::deserialize(&get_required(
		tx,
		node,
		&prefixed_key(DELIVERY_SCRIPTS_KEY, &id),
		"delivery scripts",
	)?)?;

	let capacity = fetch_u64_field(tx, open, &prefixed_key(CHAN_CAPACITY_PREFIX, &id), "capacity")?;
	let our_balance =
		fetch_u64_field(tx, open, &prefixed_key(SELF_BALANCE_PREFIX, &id), "self balance")?;
	let their_balance =
		fetch_u64_field(tx, open, &prefixed_key(THEIR_BALANCE_PREFIX, &id), "their balance")?;
	let min_fee_per_kb =
		fetch_u64_field(tx, open, &prefixed_key(MIN_FEE_PER_KB_PREFIX, &id), "min fee")?;
	let num_updates = fetch_u64_field(tx, open, &prefixed_key(UPDATE_PREFIX, &id), "updates")?;
	let total_sats_sent =
		fetch_u64_field(tx, open, &prefixed_key(SAT_SENT_PREFIX, &id), "sats sent")?;
	let total_sats_received =
		fetch_u64_field(tx, open, &prefixed_key(SAT_RECEIVED_PREFIX, &id), "sats received")?;
	let total_net_fees =
		fetch_u64_field(tx, open, &prefixed_key(NET_FEES_PREFIX, &id), "net fees")?;

	Ok(OpenChannel {
		remote_node_id,
		chan_id: *chan_id,
		capacity: Amount::from_sat(capacity),
		our_balance: Amount::from_sat(our_balance),
		their_balance: Amount::from_sat(their_balance),
		min_fee_per_kb: Amount::from_sat(min_fee_per_kb),
		our_commit_key: keys.our_commit_key,
		their_commit_key: keys.their_commit_key,
		our_commit_tx: txns.commit_tx,
		our_commit_sig: txns.commit_sig,
		local_csv_delay: txns.local_csv_delay,
		remote_csv_delay: txns.remote_csv_delay,
		funding_outpoint: funding.funding_outpoint,
		our_multisig_key: funding.our_multisig_key,
		their_multisig_key: funding.their_multisig_key,
		funding_redeem_script: funding.funding_redeem_script,
		their_current_revocation: revocation.their_current_revocation,
		their_current_revocation_hash: revocation.their_current_revocation_hash,
		local_elkrem: revocation.local_elkrem,
		remote_elkrem: revocation.remote_elkrem,
		our_delivery_script: delivery.ours,
		their_delivery_script: delivery.theirs,
		num_updates,
		total_sats_sent,
		total_sats_received,
		total_net_fees,
		creation_time: funding.creation_time,
	})
}

/// Delete every prefixed scalar and every node-bucket field record for
/// the channel identified by the serialized `chan_id`.
pub(crate) fn delete_open_channel(
	tx: &mut kv::Tx<'_>,
	open: &kv::Bucket,
	node: &kv::Bucket,
	chan_id: &[u8],
) {
	for prefix in [
		CHAN_CAPACITY_PREFIX,
		SELF_BALANCE_PREFIX,
		THEIR_BALANCE_PREFIX,
		MIN_FEE_PER_KB_PREFIX,
		UPDATE_PREFIX,
		SAT_SENT_PREFIX,
		SAT_RECEIVED_PREFIX,
		NET_FEES_PREFIX,
	] {
		open.delete(tx, &prefixed_key(prefix, chan_id));
	}

	for prefix in [
		CHAN_ID_KEY,
		COMMIT_KEYS_KEY,
		COMMIT_TXNS_KEY,
		FUNDING_KEY,
		REVOCATION_STATE_KEY,
		DELIVERY_SCRIPTS_KEY,
	] {
		node.delete(tx, &prefixed_key(prefix, chan_id));
	}
}

fn put_u64_field(tx: &mut kv::Tx<'_>, bucket: &kv::Bucket, key: &[u8], value: u64) {
	bucket.put(tx, key, &value.to_be_bytes());
}

fn put_chan_capacity(tx: &mut kv::Tx<'_>, open: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	put_u64_field(tx, open, &prefixed_key(CHAN_CAPACITY_PREFIX, &id), channel.capacity.to_sat());
	put_u64_field(tx, open, &prefixed_key(SELF_BALANCE_PREFIX, &id), channel.our_balance.to_sat());
	put_u64_field(
		tx,
		open,
		&prefixed_key(THEIR_BALANCE_PREFIX, &id),
		channel.their_balance.to_sat(),
	);
}

fn put_chan_min_fee_per_kb(tx: &mut kv::Tx<'_>, open: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	put_u64_field(
		tx,
		open,
		&prefixed_key(MIN_FEE_PER_KB_PREFIX, &id),
		channel.min_fee_per_kb.to_sat(),
	);
}

fn put_chan_num_updates(tx: &mut kv::Tx<'_>, open: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	put_u64_field(tx, open, &prefixed_key(UPDATE_PREFIX, &id), channel.num_updates);
}

fn put_chan_total_flow(tx: &mut kv::Tx<'_>, open: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	put_u64_field(tx, open, &prefixed_key(SAT_SENT_PREFIX, &id), channel.total_sats_sent);
	put_u64_field(tx, open, &prefixed_key(SAT_RECEIVED_PREFIX, &id), channel.total_sats_received);
}

fn put_chan_net_fees(tx: &mut kv::Tx<'_>, open: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	put_u64_field(tx, open, &prefixed_key(NET_FEES_PREFIX, &id), channel.total_net_fees);
}

fn put_chan_id(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	node.put(tx, &prefixed_key(CHAN_ID_KEY, &id), &channel.remote_node_id);
}

fn put_chan_commit_keys(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	let record = CommitKeysRecord {
		their_commit_key: channel.their_commit_key,
		our_commit_key: channel.our_commit_key,
	};
	node.put(tx, &prefixed_key(COMMIT_KEYS_KEY, &id), &record.serialize());
}

fn put_chan_commit_txns(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	let record = CommitTxnsRecord {
		commit_tx: channel.our_commit_tx.clone(),
		commit_sig: channel.our_commit_sig.clone(),
		local_csv_delay: channel.local_csv_delay,
		remote_csv_delay: channel.remote_csv_delay,
	};
	node.put(tx, &prefixed_key(COMMIT_TXNS_KEY, &id), &record.serialize());
}

fn put_chan_funding_info(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	let record = FundingInfoRecord {
		funding_outpoint: channel.funding_outpoint,
		our_multisig_key: channel.our_multisig_key,
		their_multisig_key: channel.their_multisig_key,
		funding_redeem_script: channel.funding_redeem_script.clone(),
		creation_time: channel.creation_time,
	};
	node.put(tx, &prefixed_key(FUNDING_KEY, &id), &record.serialize());
}

fn put_chan_revocation_state(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	let record = RevocationStateRecord {
		their_current_revocation: channel.their_current_revocation,
		their_current_revocation_hash: channel.their_current_revocation_hash,
		local_elkrem: channel.local_elkrem.clone(),
		remote_elkrem: channel.remote_elkrem.clone(),
	};
	node.put(tx, &prefixed_key(REVOCATION_STATE_KEY, &id), &record.serialize());
}

fn put_chan_delivery_scripts(tx: &mut kv::Tx<'_>, node: &kv::Bucket, channel: &OpenChannel) {
	let id = channel.chan_id.serialize();
	let record = DeliveryScriptsRecord {
		ours: channel.our_delivery_script.clone(),
		theirs: channel.their_delivery_script.clone(),
	};
	node.put(tx, &prefixed_key(DELIVERY_SCRIPTS_KEY, &id), &record.serialize());
}

fn append_channel_log_entry(
	tx: &mut kv::Tx<'_>,
	log: &kv::Bucket,
	chan_id: &OutPoint,
	delta: &ChannelDelta,
) {
	log.put(tx, &log_entry_key(chan_id, delta.update_num), &delta.serialize());
}

fn fetch_channel_log_entry(
	tx: &kv::Tx<'_>,
	log: &kv::Bucket,
	chan_id: &OutPoint,
	update_num: u32,
) -> Result<ChannelDelta, Error> {
	let bytes = log
		.get(tx, &log_entry_key(chan_id, update_num))?
		.ok_or(Error::LogEntryNotFound(update_num))?;
	Ok(ChannelDelta::deserialize(&bytes)?)
}

/// Both commitment keys: theirs first, then ours. Two fixed-width
/// compressed keys back to back.
struct CommitKeysRecord {
	their_commit_key: PublicKey,
	our_commit_key: PublicKey,
}

impl RecordEncoding for CommitKeysRecord {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.their_commit_key.encode(w)?;
		self.our_commit_key.encode(w)
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(CommitKeysRecord {
			their_commit_key: PublicKey::decode(r)?,
			our_commit_key: PublicKey::decode(r)?,
		})
	}
}

/// The live commitment transaction, the counterparty's signature over
/// it, and both CSV delays.
#[derive(Debug)]
struct CommitTxnsRecord {
	commit_tx: Transaction,
	commit_sig: Vec<u8>,
	local_csv_delay: u32,
	remote_csv_delay: u32,
}

impl RecordEncoding for CommitTxnsRecord {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		w.emit_slice(&bitcoin::consensus::encode::serialize(&self.commit_tx))?;
		w.emit_var_bytes(&self.commit_sig)?;
		w.emit_u32(self.local_csv_delay)?;
		w.emit_u32(self.remote_csv_delay)
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		// The commitment transaction is self-delimiting consensus bytes;
		// decode it in place and continue with whatever follows.
		let mut buf = Vec::new();
		r.read_to_end(&mut buf)?;
		let (commit_tx, used) =
			bitcoin::consensus::encode::deserialize_partial::<Transaction>(&buf)?;

		let mut rest = &buf[used..];
		let commit_sig = rest.read_var_bytes(MAX_COMMIT_SIG_SIZE, "commitment signature")?;
		let local_csv_delay = rest.read_u32()?;
		let remote_csv_delay = rest.read_u32()?;
		Ok(CommitTxnsRecord { commit_tx, commit_sig, local_csv_delay, remote_csv_delay })
	}
}

/// The funding outpoint, both multisig keys, the redeem script, and the
/// channel's creation time.
struct FundingInfoRecord {
	funding_outpoint: OutPoint,
	our_multisig_key: PublicKey,
	their_multisig_key: PublicKey,
	funding_redeem_script: ScriptBuf,
	creation_time: u64,
}

impl RecordEncoding for FundingInfoRecord {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		self.funding_outpoint.encode(w)?;
		w.emit_var_bytes(&self.our_multisig_key.serialize())?;
		w.emit_var_bytes(&self.their_multisig_key.serialize())?;
		w.emit_var_bytes(self.funding_redeem_script.as_bytes())?;
		w.emit_u64(self.creation_time)
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(FundingInfoRecord {
			funding_outpoint: OutPoint::decode(r)?,
			our_multisig_key: read_var_pubkey(r, "our multisig key")?,
			their_multisig_key: read_var_pubkey(r, "their multisig key")?,
			funding_redeem_script: ScriptBuf::from_bytes(r.read_var_bytes(
				MAX_SCRIPT_SIZE,
				"funding redeem script",
			)?),
			creation_time: r.read_u64()?,
		})
	}
}

/// The counterparty's current revocation key and hash plus both elkrem
/// halves, kept on disk until re-derivation replaces them.
struct RevocationStateRecord {
	their_current_revocation: PublicKey,
	their_current_revocation_hash: [u8; 32],
	local_elkrem: ElkremSender,
	remote_elkrem: ElkremReceiver,
}

/// Upper bound on a serialized elkrem receiver: the node count byte plus
/// a full frontier of 41-byte nodes, rounded up.
const MAX_ELKREM_STATE_SIZE: usize = 2048;

impl RecordEncoding for RevocationStateRecord {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		w.emit_var_bytes(&self.their_current_revocation.serialize())?;
		w.emit_slice(&self.their_current_revocation_hash)?;
		w.emit_var_bytes(self.local_elkrem.root().as_byte_array())?;
		w.emit_var_bytes(&self.remote_elkrem.to_bytes())
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		let their_current_revocation = read_var_pubkey(r, "revocation key")?;
		let their_current_revocation_hash = r.read_byte_array()?;

		let root = r.read_var_bytes(32, "elkrem root")?;
		let root: [u8; 32] = root
			.try_into()
			.map_err(|_| DecodeError::invalid("elkrem root must be 32 bytes"))?;
		let local_elkrem = ElkremSender::new(sha256::Hash::from_byte_array(root));

		let receiver = r.read_var_bytes(MAX_ELKREM_STATE_SIZE, "elkrem receiver")?;
		let remote_elkrem = ElkremReceiver::from_bytes(&receiver)
			.map_err(|e| DecodeError::invalid_err(e, "elkrem receiver state"))?;

		Ok(RevocationStateRecord {
			their_current_revocation,
			their_current_revocation_hash,
			local_elkrem,
			remote_elkrem,
		})
	}
}

/// Final delivery scripts for a cooperative close, ours first.
struct DeliveryScriptsRecord {
	ours: ScriptBuf,
	theirs: ScriptBuf,
}

impl RecordEncoding for DeliveryScriptsRecord {
	fn encode<W: std::io::Write + ?Sized>(&self, w: &mut W) -> Result<(), std::io::Error> {
		w.emit_var_bytes(self.ours.as_bytes())?;
		w.emit_var_bytes(self.theirs.as_bytes())
	}

	fn decode<R: std::io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(DeliveryScriptsRecord {
			ours: ScriptBuf::from_bytes(r.read_var_bytes(MAX_SCRIPT_SIZE, "our delivery script")?),
			theirs: ScriptBuf::from_bytes(
				r.read_var_bytes(MAX_SCRIPT_SIZE, "their delivery script")?,
			),
		})
	}
}

#[cfg(test)]
pub(crate) mod test {
	use bitcoin::absolute::LockTime;
	use bitcoin::secp256k1::Secp256k1;
	use bitcoin::transaction::Version;
	use bitcoin::{Sequence, TxIn, TxOut, Txid, Witness};
	use rand::rngs::StdRng;
	use rand::{Rng, SeedableRng};

	use super::*;

	pub(crate) fn dummy_outpoint(rng: &mut StdRng) -> OutPoint {
		let mut txid = [0u8; 32];
		rng.fill(&mut txid);
		OutPoint::new(Txid::from_byte_array(txid), rng.gen_range(0..4))
	}

	pub(crate) fn dummy_pubkey(rng: &mut StdRng) -> PublicKey {
		let secp = Secp256k1::new();
		secp.generate_keypair(rng).1
	}

	pub(crate) fn dummy_tx(rng: &mut StdRng) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: vec![TxIn {
				previous_output: dummy_outpoint(rng),
				script_sig: ScriptBuf::new(),
				sequence: Sequence::MAX,
				witness: Witness::new(),
			}],
			output: vec![TxOut {
				value: Amount::from_sat(rng.gen_range(1_000..1_000_000)),
				script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
			}],
		}
	}

	pub(crate) fn dummy_channel(rng: &mut StdRng, node_id: NodeId) -> OpenChannel {
		let root = sha256::Hash::hash(&rng.gen::<[u8; 32]>());
		OpenChannel {
			remote_node_id: node_id,
			chan_id: dummy_outpoint(rng),
			capacity: Amount::from_sat(1_000),
			our_balance: Amount::from_sat(500),
			their_balance: Amount::from_sat(500),
			min_fee_per_kb: Amount::from_sat(1_024),
			our_commit_key: dummy_pubkey(rng),
			their_commit_key: dummy_pubkey(rng),
			our_commit_tx: dummy_tx(rng),
			our_commit_sig: vec![0x30, 0x45, 0x02, 0x21],
			local_csv_delay: 5,
			remote_csv_delay: 4,
			funding_outpoint: dummy_outpoint(rng),
			our_multisig_key: dummy_pubkey(rng),
			their_multisig_key: dummy_pubkey(rng),
			funding_redeem_script: ScriptBuf::from_bytes(vec![0x52, 0xAE]),
			their_current_revocation: dummy_pubkey(rng),
			their_current_revocation_hash: rng.gen(),
			local_elkrem: ElkremSender::new(root),
			remote_elkrem: ElkremReceiver::new(),
			our_delivery_script: ScriptBuf::from_bytes(vec![0x00, 0x14]),
			their_delivery_script: ScriptBuf::from_bytes(vec![0x00, 0x20]),
			num_updates: 0,
			total_sats_sent: 0,
			total_sats_received: 0,
			total_net_fees: 0,
			creation_time: 1_700_000_000,
		}
	}

	fn dummy_htlc(rng: &mut StdRng, incoming: bool) -> Htlc {
		Htlc {
			incoming,
			amount: Amount::from_sat(rng.gen_range(1..10_000)),
			rhash: rng.gen(),
			refund_timeout: rng.gen_range(100..1_000),
			revocation_timeout: rng.gen_range(1..100),
		}
	}

	fn assert_channels_equal(a: &OpenChannel, b: &OpenChannel) {
		assert_eq!(a.remote_node_id, b.remote_node_id);
		assert_eq!(a.chan_id, b.chan_id);
		assert_eq!(a.capacity, b.capacity);
		assert_eq!(a.our_balance, b.our_balance);
		assert_eq!(a.their_balance, b.their_balance);
		assert_eq!(a.min_fee_per_kb, b.min_fee_per_kb);
		assert_eq!(a.our_commit_key, b.our_commit_key);
		assert_eq!(a.their_commit_key, b.their_commit_key);
		assert_eq!(a.our_commit_tx, b.our_commit_tx);
		assert_eq!(a.our_commit_sig, b.our_commit_sig);
		assert_eq!(a.local_csv_delay, b.local_csv_delay);
		assert_eq!(a.remote_csv_delay, b.remote_csv_delay);
		assert_eq!(a.funding_outpoint, b.funding_outpoint);
		assert_eq!(a.funding_redeem_script, b.funding_redeem_script);
		assert_eq!(a.their_current_revocation_hash, b.their_current_revocation_hash);
		assert_eq!(a.local_elkrem, b.local_elkrem);
		assert_eq!(a.remote_elkrem, b.remote_elkrem);
		assert_eq!(a.our_delivery_script, b.our_delivery_script);
		assert_eq!(a.their_delivery_script, b.their_delivery_script);
		assert_eq!(a.num_updates, b.num_updates);
		assert_eq!(a.total_sats_sent, b.total_sats_sent);
		assert_eq!(a.total_sats_received, b.total_sats_received);
		assert_eq!(a.total_net_fees, b.total_net_fees);
		assert_eq!(a.creation_time, b.creation_time);
	}

	#[test]
	fn htlc_encoding_is_49_byte_bijection() {
		let mut rng = StdRng::seed_from_u64(1);
		for incoming in [false, true] {
			let htlc = dummy_htlc(&mut rng, incoming);
			let bytes = htlc.serialize();
			assert_eq!(bytes.len(), 49);
			assert_eq!(Htlc::deserialize(&bytes).unwrap(), htlc);
		}
	}

	#[test]
	fn delta_roundtrip() {
		let mut rng = StdRng::seed_from_u64(2);
		let delta = ChannelDelta {
			local_balance: Amount::from_sat(400),
			remote_balance: Amount::from_sat(600),
			update_num: 3,
			htlcs: vec![dummy_htlc(&mut rng, true), dummy_htlc(&mut rng, false)],
		};
		assert_eq!(ChannelDelta::deserialize(&delta.serialize()).unwrap(), delta);
	}

	#[test]
	fn commit_txns_record_enforces_sig_bound() {
		let mut rng = StdRng::seed_from_u64(3);
		let record = CommitTxnsRecord {
			commit_tx: dummy_tx(&mut rng),
			commit_sig: vec![0u8; MAX_COMMIT_SIG_SIZE + 1],
			local_csv_delay: 1,
			remote_csv_delay: 2,
		};
		let err = CommitTxnsRecord::deserialize(&record.serialize()).unwrap_err();
		assert!(matches!(err, DecodeError::Oversized { field: "commitment signature", .. }));
	}

	#[test]
	fn full_sync_roundtrips_through_reopen() {
		let mut rng = StdRng::seed_from_u64(4);
		let dir = tempfile::tempdir().unwrap();

		let node_id: NodeId = rng.gen();
		let state = dummy_channel(&mut rng, node_id);
		let chan_id = state.chan_id;

		{
			let db = ChannelDb::open(dir.path()).unwrap();
			let channel = Channel::new(db, state.clone());
			channel.full_sync().unwrap();
		}

		let db = ChannelDb::open(dir.path()).unwrap();
		let channels = db.fetch_open_channels(&node_id).unwrap();
		assert_eq!(channels.len(), 1);
		assert_eq!(channels[0].chan_id(), chan_id);
		assert_channels_equal(&channels[0].state(), &state);
	}

	#[test]
	fn record_delta_updates_snapshot_and_log() {
		let mut rng = StdRng::seed_from_u64(5);
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		let node_id: NodeId = rng.gen();
		let channel = Channel::new(db, dummy_channel(&mut rng, node_id));
		channel.full_sync().unwrap();

		let mut recorded = Vec::new();
		for update_num in 1u32..=3 {
			let delta = ChannelDelta {
				local_balance: Amount::from_sat(500 - 100 * update_num as u64),
				remote_balance: Amount::from_sat(500 + 100 * update_num as u64),
				update_num,
				htlcs: vec![dummy_htlc(&mut rng, update_num % 2 == 0)],
			};
			channel
				.record_delta(dummy_tx(&mut rng), vec![update_num as u8; 64], &delta)
				.unwrap();
			recorded.push(delta);
		}

		let snapshot = channel.snapshot();
		assert_eq!(snapshot.local_balance, recorded[2].local_balance);
		assert_eq!(snapshot.remote_balance, recorded[2].remote_balance);
		assert_eq!(snapshot.num_updates, 3);

		// Point lookup into the log returns the exact recorded delta.
		assert_eq!(channel.find_previous_state(2).unwrap(), recorded[1]);
		assert!(matches!(
			channel.find_previous_state(9),
			Err(Error::LogEntryNotFound(9))
		));
	}

	#[test]
	fn close_channel_removes_all_state() {
		let mut rng = StdRng::seed_from_u64(6);
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		let node_id: NodeId = rng.gen();
		let state = dummy_channel(&mut rng, node_id);
		let id = state.chan_id.serialize();
		let channel = Channel::new(db.clone(), state);
		channel.full_sync().unwrap();

		channel.close().unwrap();

		assert!(db.fetch_all_channels().unwrap().is_empty());

		// Every prefixed scalar and node-bucket field key is gone, and the
		// closed-channel summary exists under the funding outpoint.
		db.store()
			.view(|tx| {
				let open = tx.bucket(OPEN_CHANNEL_BUCKET)?.unwrap();
				for prefix in [b"ccp", b"sbp", b"tbp", b"mfp", b"uup", b"ssp", b"srp", b"ntp"] {
					assert!(open.get(tx, &prefixed_key(prefix, &id))?.is_none());
				}
				let node = open.bucket(tx, &node_id)?.unwrap();
				for prefix in [b"cik", b"ckk", b"ctk", b"fsk", b"esk", b"dsk"] {
					assert!(node.get(tx, &prefixed_key(prefix, &id))?.is_none());
				}

				let closed = tx.bucket(CLOSED_CHANNEL_BUCKET)?.unwrap();
				assert!(closed.get(tx, &id)?.is_some());
				Ok::<_, Error>(())
			})
			.unwrap();

		// With the open-channels bucket wiped away entirely, close reports
		// the uninitialized store.
		db.wipe().unwrap();
		assert!(matches!(channel.close(), Err(Error::NoChanDb)));
	}

	#[test]
	fn find_previous_state_without_log_is_distinguished() {
		let mut rng = StdRng::seed_from_u64(7);
		let dir = tempfile::tempdir().unwrap();
		let db = ChannelDb::open(dir.path()).unwrap();

		let node_id: NodeId = rng.gen();
		let channel = Channel::new(db, dummy_channel(&mut rng, node_id));
		channel.full_sync().unwrap();

		// No delta has ever been recorded, so the log bucket is absent.
		assert!(matches!(channel.find_previous_state(1), Err(Error::NoPastDeltas)));
	}

	#[test]
	fn sync_revocation_persists_elkrem_progress() {
		let mut rng = StdRng::seed_from_u64(8);
		let dir = tempfile::tempdir().unwrap();

		let node_id: NodeId = rng.gen();
		let sender = ElkremSender::new(sha256::Hash::hash(b"remote root"));
		let chan_id;
		{
			let db = ChannelDb::open(dir.path()).unwrap();
			let mut state = dummy_channel(&mut rng, node_id);
			chan_id = state.chan_id;
			for i in 0..5 {
				state.remote_elkrem.add_next(sender.at_index(i).unwrap()).unwrap();
			}
			let channel = Channel::new(db, state);
			channel.full_sync().unwrap();
			channel.sync_revocation().unwrap();
		}

		let db = ChannelDb::open(dir.path()).unwrap();
		let channels = db.fetch_open_channels(&node_id).unwrap();
		assert_eq!(channels[0].chan_id(), chan_id);
		assert_eq!(channels[0].state().remote_elkrem.max_index(), Some(4));
	}
}
