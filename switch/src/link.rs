//!
//! Links, packets and payment circuits: the in-memory plumbing the
//! switch routes HTLCs through.
//!

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint};
use tokio::sync::{mpsc, oneshot};

use filament_channeldb::NodeId;

use crate::SwitchError;

/// Capacity of every bounded packet channel in the switch.
pub const HTLC_QUEUE_SIZE: usize = 50;

/// Handle to the peer that manages a link's channel. The switch hands
/// cooperative-close requests to the peer through this handle; everything
/// else about the peer lives outside the switch.
#[derive(Clone, Debug)]
pub struct PeerHandle {
	/// Opaque identifier the switch keys its interfaces by.
	pub node_id: NodeId,

	/// The peer's identity key; its HASH160 resolves onion next hops to
	/// this peer's links.
	pub identity_key: PublicKey,

	/// Channel the peer consumes cooperative-close requests from.
	pub close_requests: mpsc::Sender<CloseRequest>,
}

/// A request for the managing peer to begin closing one of its channels.
#[derive(Debug)]
pub struct CloseRequest {
	pub chan_point: OutPoint,

	/// Unilateral closure when set; cooperative otherwise.
	pub force: bool,
}

/// An active channel registered with the switch, modeled as a networked
/// device with an available payment bandwidth.
#[derive(Debug)]
pub struct Link {
	capacity: Amount,

	/// Satoshis this link can currently forward. Outstanding outgoing
	/// HTLCs subtract from it, settled incoming HTLCs add back to it.
	available_bandwidth: AtomicI64,

	/// Inbound packet channel of the task managing the channel.
	pub(crate) link_chan: mpsc::Sender<HtlcPacket>,

	pub(crate) peer: PeerHandle,

	pub(crate) chan_point: OutPoint,
}

impl Link {
	pub(crate) fn new(
		capacity: Amount,
		initial_bandwidth: Amount,
		link_chan: mpsc::Sender<HtlcPacket>,
		peer: PeerHandle,
		chan_point: OutPoint,
	) -> Arc<Link> {
		Arc::new(Link {
			capacity,
			available_bandwidth: AtomicI64::new(initial_bandwidth.to_sat() as i64),
			link_chan,
			peer,
			chan_point,
		})
	}

	pub fn capacity(&self) -> Amount {
		self.capacity
	}

	pub fn chan_point(&self) -> OutPoint {
		self.chan_point
	}

	/// The link's current available bandwidth in satoshis.
	pub fn available_bandwidth(&self) -> i64 {
		self.available_bandwidth.load(Ordering::SeqCst)
	}

	/// Atomically reserve `amount` satoshis of bandwidth. The check and
	/// the decrement are a single compare-and-swap step, so a reservation
	/// never drives the bandwidth negative and concurrent reservations
	/// cannot both pass on the same satoshis.
	pub(crate) fn try_reserve(&self, amount: i64) -> bool {
		self.available_bandwidth
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
				if current >= amount {
					Some(current - amount)
				} else {
					None
				}
			})
			.is_ok()
	}

	/// Return `amount` satoshis of bandwidth to the link, after a settle
	/// flows back through it.
	pub(crate) fn release(&self, amount: i64) -> i64 {
		self.available_bandwidth.fetch_add(amount, Ordering::SeqCst) + amount
	}

	/// Adjust bandwidth by a signed delta (link re-anchoring, local
	/// invoice settlement).
	pub(crate) fn adjust(&self, delta: i64) -> i64 {
		self.available_bandwidth.fetch_add(delta, Ordering::SeqCst) + delta
	}
}

/// The switch-internal projection of an HTLC wire message: just the
/// fields the switch routes on.
#[derive(Clone, Debug)]
pub enum HtlcMsg {
	/// A peer locked in a new HTLC.
	Add {
		amount: Amount,
		/// Payment hash; doubles as the circuit key.
		redemption_hash: [u8; 32],
	},

	/// A downstream peer revealed the preimage.
	Settle {
		/// Preimage whose SHA-256 is the circuit key.
		redemption_proof: [u8; 32],
	},
}

/// A packet moving an HTLC message through the switch.
pub struct HtlcPacket {
	/// Destination interface for outgoing payments.
	pub dest: NodeId,

	/// Channel the packet arrived on, for plex packets.
	pub src_link: OutPoint,

	/// Next hop emitted by onion processing: HASH160 of the next peer's
	/// identity key.
	pub next_hop: [u8; 20],

	pub msg: HtlcMsg,

	pub amount: Amount,

	/// Reply channel for request/response flows; forwarded packets carry
	/// none.
	pub reply: Option<oneshot::Sender<Result<(), SwitchError>>>,
}

impl HtlcPacket {
	/// A locally initiated outgoing payment.
	pub(crate) fn outgoing(
		dest: NodeId,
		amount: Amount,
		redemption_hash: [u8; 32],
		reply: oneshot::Sender<Result<(), SwitchError>>,
	) -> HtlcPacket {
		HtlcPacket {
			dest,
			src_link: OutPoint::null(),
			next_hop: [0; 20],
			msg: HtlcMsg::Add { amount, redemption_hash },
			amount,
			reply: Some(reply),
		}
	}

	/// An HTLC add a peer just locked in, to be forwarded downstream.
	pub fn plex_add(
		src_link: OutPoint,
		next_hop: [u8; 20],
		amount: Amount,
		redemption_hash: [u8; 32],
	) -> HtlcPacket {
		HtlcPacket {
			dest: [0; 32],
			src_link,
			next_hop,
			msg: HtlcMsg::Add { amount, redemption_hash },
			amount,
			reply: None,
		}
	}

	/// A settle revealed by a downstream peer, to be propagated back
	/// upstream.
	pub fn plex_settle(amount: Amount, redemption_proof: [u8; 32]) -> HtlcPacket {
		HtlcPacket {
			dest: [0; 32],
			src_link: OutPoint::null(),
			next_hop: [0; 20],
			msg: HtlcMsg::Settle { redemption_proof },
			amount,
			reply: None,
		}
	}

	/// Strip routing metadata for delivery to the next link.
	pub(crate) fn forwarded(&self) -> HtlcPacket {
		HtlcPacket {
			dest: [0; 32],
			src_link: OutPoint::null(),
			next_hop: [0; 20],
			msg: self.msg.clone(),
			amount: self.amount,
			reply: None,
		}
	}
}

/// An installed onion circuit between two links. The `clear` end
/// forwards the add downstream; the `settle` end receives the eventual
/// settle and propagates it back upstream. A circuit is re-referenced
/// when the same payment hash is added again, and consumed once its
/// reference count drains.
pub(crate) struct PaymentCircuit {
	pub clear: Arc<Link>,
	pub settle: Arc<Link>,
	pub ref_count: AtomicU32,
}

impl PaymentCircuit {
	pub fn new(clear: Arc<Link>, settle: Arc<Link>) -> PaymentCircuit {
		PaymentCircuit {
			clear,
			settle,
			ref_count: AtomicU32::new(1),
		}
	}
}
