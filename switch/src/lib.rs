//!
//! In-memory HTLC switch: the central messaging bus multiplexing HTLCs
//! across a node's active channels.
//!
//! Peers with active channels appear as named interfaces whose channels
//! are registered as links. Two cooperative tasks share the work: the
//! network admin serializes every mutation of the link indexes, and the
//! HTLC forwarder moves packets — locally initiated payments, and the
//! add/settle plex traffic that installs and completes multi-hop onion
//! circuits. Link bandwidth is tracked lock-free with atomic
//! reservations, so a payment is only ever enqueued after its amount has
//! been carved out of the chosen link.
//!

mod link;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::{hash160, sha256, Hash};
use bitcoin::hex::DisplayHex;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Amount, OutPoint};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use filament_channeldb::{ChannelSnapshot, NodeId};

pub use crate::link::{
	CloseRequest, HtlcMsg, HtlcPacket, Link, PeerHandle, HTLC_QUEUE_SIZE,
};
use crate::link::PaymentCircuit;

/// How often the forwarder samples and logs its throughput counters.
const LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Errors returned on switch request/reply channels.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SwitchError {
	/// No candidate link had enough bandwidth for the payment.
	#[error("insufficient capacity to forward payment")]
	InsufficientCapacity,

	/// The destination has no links registered with the switch.
	#[error("destination link unknown to the switch")]
	UnknownLink,

	/// The switch is shutting down and no longer accepts requests.
	#[error("switch is shutting down")]
	SwitchExiting,
}

/// Circuits are keyed by the HTLC's payment hash.
type CircuitKey = [u8; 32];

/// Requests serialized through the network admin task.
enum ControlMsg {
	Register {
		peer: PeerHandle,
		snapshot: ChannelSnapshot,
		link_chan: mpsc::Sender<HtlcPacket>,
		done: oneshot::Sender<()>,
	},
	Unregister {
		node_id: NodeId,
		/// Remove one link, or every link of the peer when `None`.
		chan_point: Option<OutPoint>,
		done: oneshot::Sender<()>,
	},
	Close {
		chan_point: OutPoint,
		force: bool,
		reply: oneshot::Sender<Result<(), SwitchError>>,
	},
	UpdateLink {
		chan_point: OutPoint,
		bandwidth_delta: i64,
	},
}

struct Receivers {
	control: mpsc::Receiver<ControlMsg>,
	outgoing: mpsc::Receiver<HtlcPacket>,
	plex: mpsc::Receiver<HtlcPacket>,
}

struct SwitchInner {
	started: AtomicBool,
	stopped: AtomicBool,
	shutdown: CancellationToken,

	/// Channel outpoint to its link.
	chan_index: RwLock<HashMap<OutPoint, Arc<Link>>>,

	/// Peer id to the set of links (one per channel) open with it.
	interfaces: RwLock<HashMap<NodeId, Vec<Arc<Link>>>>,

	/// HASH160 of a peer's identity key to that peer's links; resolves
	/// the next hop emitted by onion processing.
	onion_index: RwLock<HashMap<[u8; 20], Vec<Arc<Link>>>>,

	link_control: mpsc::Sender<ControlMsg>,
	outgoing: mpsc::Sender<HtlcPacket>,
	plex: mpsc::Sender<HtlcPacket>,

	receivers: Mutex<Option<Receivers>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The HTLC switch. Cheap to clone; all clones drive the same switch.
#[derive(Clone)]
pub struct Switch {
	inner: Arc<SwitchInner>,
}

impl Switch {
	pub fn new() -> Switch {
		let (control_tx, control_rx) = mpsc::channel(HTLC_QUEUE_SIZE);
		let (outgoing_tx, outgoing_rx) = mpsc::channel(HTLC_QUEUE_SIZE);
		let (plex_tx, plex_rx) = mpsc::channel(HTLC_QUEUE_SIZE);

		Switch {
			inner: Arc::new(SwitchInner {
				started: AtomicBool::new(false),
				stopped: AtomicBool::new(false),
				shutdown: CancellationToken::new(),
				chan_index: RwLock::new(HashMap::new()),
				interfaces: RwLock::new(HashMap::new()),
				onion_index: RwLock::new(HashMap::new()),
				link_control: control_tx,
				outgoing: outgoing_tx,
				plex: plex_tx,
				receivers: Mutex::new(Some(Receivers {
					control: control_rx,
					outgoing: outgoing_rx,
					plex: plex_rx,
				})),
				tasks: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Spawn the network admin and HTLC forwarder tasks. Idempotent;
	/// must be called from within a tokio runtime.
	pub fn start(&self) {
		if self
			.inner
			.started
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}

		let receivers = self
			.inner
			.receivers
			.lock()
			.take()
			.expect("receivers available on first start");

		let mut tasks = self.inner.tasks.lock();
		tasks.push(tokio::spawn(network_admin(self.inner.clone(), receivers.control)));
		tasks.push(tokio::spawn(htlc_forwarder(
			self.inner.clone(),
			receivers.outgoing,
			receivers.plex,
		)));
	}

	/// Signal both worker tasks to exit and wait for them. Idempotent.
	pub async fn stop(&self) {
		if self
			.inner
			.stopped
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return;
		}

		self.inner.shutdown.cancel();
		let tasks = std::mem::take(&mut *self.inner.tasks.lock());
		for task in tasks {
			let _ = task.await;
		}
	}

	/// Register a new active link backed by the given channel snapshot.
	/// Returns the plex sender the link uses to hand add/settle traffic
	/// to the switch.
	pub async fn register_link(
		&self,
		peer: PeerHandle,
		snapshot: &ChannelSnapshot,
		link_chan: mpsc::Sender<HtlcPacket>,
	) -> Result<mpsc::Sender<HtlcPacket>, SwitchError> {
		let (done_tx, done_rx) = oneshot::channel();
		self.inner
			.link_control
			.send(ControlMsg::Register {
				peer,
				snapshot: snapshot.clone(),
				link_chan,
				done: done_tx,
			})
			.await
			.map_err(|_| SwitchError::SwitchExiting)?;
		done_rx.await.map_err(|_| SwitchError::SwitchExiting)?;
		Ok(self.inner.plex.clone())
	}

	/// Unregister one link of a peer, or every link when `chan_point` is
	/// `None`. The peer's interface entry is garbage-collected once its
	/// last link is gone.
	pub async fn unregister_link(
		&self,
		node_id: NodeId,
		chan_point: Option<OutPoint>,
	) -> Result<(), SwitchError> {
		let (done_tx, done_rx) = oneshot::channel();
		self.inner
			.link_control
			.send(ControlMsg::Unregister { node_id, chan_point, done: done_tx })
			.await
			.map_err(|_| SwitchError::SwitchExiting)?;
		done_rx.await.map_err(|_| SwitchError::SwitchExiting)
	}

	/// Ask the peer managing the channel to begin closing it.
	pub async fn close_link(
		&self,
		chan_point: OutPoint,
		force: bool,
	) -> Result<(), SwitchError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.inner
			.link_control
			.send(ControlMsg::Close { chan_point, force, reply: reply_tx })
			.await
			.map_err(|_| SwitchError::SwitchExiting)?;
		reply_rx.await.map_err(|_| SwitchError::SwitchExiting)?
	}

	/// Adjust a link's available bandwidth by a signed satoshi delta,
	/// e.g. after re-anchoring or settling an invoice locally.
	pub async fn update_link(
		&self,
		chan_point: OutPoint,
		bandwidth_delta: i64,
	) -> Result<(), SwitchError> {
		self.inner
			.link_control
			.send(ControlMsg::UpdateLink { chan_point, bandwidth_delta })
			.await
			.map_err(|_| SwitchError::SwitchExiting)
	}

	/// Send a locally initiated HTLC towards the given peer, reserving
	/// bandwidth on the first of its links that can carry the amount.
	pub async fn send_htlc(
		&self,
		dest: NodeId,
		amount: Amount,
		redemption_hash: [u8; 32],
	) -> Result<(), SwitchError> {
		let (reply_tx, reply_rx) = oneshot::channel();
		let packet = HtlcPacket::outgoing(dest, amount, redemption_hash, reply_tx);
		self.inner
			.outgoing
			.send(packet)
			.await
			.map_err(|_| SwitchError::SwitchExiting)?;
		reply_rx.await.map_err(|_| SwitchError::SwitchExiting)?
	}

	/// Hand an add/settle packet from a link into the forwarder.
	pub async fn forward_plex(&self, packet: HtlcPacket) -> Result<(), SwitchError> {
		self.inner.plex.send(packet).await.map_err(|_| SwitchError::SwitchExiting)
	}

	/// Current available bandwidth of the link for the given channel.
	pub fn link_bandwidth(&self, chan_point: &OutPoint) -> Option<i64> {
		self.inner
			.chan_index
			.read()
			.get(chan_point)
			.map(|link| link.available_bandwidth())
	}
}

impl Default for Switch {
	fn default() -> Switch {
		Switch::new()
	}
}

/// HASH160 of a peer's serialized identity key: the onion index key.
fn onion_id(identity_key: &PublicKey) -> [u8; 20] {
	hash160::Hash::hash(&identity_key.serialize()).to_byte_array()
}

/// The network admin serializes register / unregister / close / update
/// requests so the three link indexes always move together.
async fn network_admin(inner: Arc<SwitchInner>, mut control: mpsc::Receiver<ControlMsg>) {
	loop {
		tokio::select! {
			Some(msg) = control.recv() => match msg {
				ControlMsg::Register { peer, snapshot, link_chan, done } => {
					handle_register(&inner, peer, snapshot, link_chan);
					let _ = done.send(());
				}
				ControlMsg::Unregister { node_id, chan_point, done } => {
					handle_unregister(&inner, node_id, chan_point);
					let _ = done.send(());
				}
				ControlMsg::Close { chan_point, force, reply } => {
					handle_close(&inner, chan_point, force, reply).await;
				}
				ControlMsg::UpdateLink { chan_point, bandwidth_delta } => {
					handle_link_update(&inner, chan_point, bandwidth_delta);
				}
			},
			_ = inner.shutdown.cancelled() => break,
		}
	}
	debug!("network admin exiting");
}

fn handle_register(
	inner: &SwitchInner,
	peer: PeerHandle,
	snapshot: ChannelSnapshot,
	link_chan: mpsc::Sender<HtlcPacket>,
) {
	let chan_point = snapshot.channel_point;
	let node_id = peer.node_id;
	let onion_key = onion_id(&peer.identity_key);

	let new_link = Link::new(
		snapshot.capacity,
		snapshot.local_balance,
		link_chan,
		peer,
		chan_point,
	);

	inner.chan_index.write().insert(chan_point, new_link.clone());

	let links = {
		let mut interfaces = inner.interfaces.write();
		let links = interfaces.entry(node_id).or_default();
		links.push(new_link.clone());
		links.clone()
	};

	// The onion index mirrors the interface entry under the peer's key
	// hash, so next-hop resolution sees the same link set. Each index
	// lock is taken on its own; they are never held together.
	inner.onion_index.write().insert(onion_key, links);

	info!(
		"registering new link, interface={}, onion_link={}, chan_point={}, capacity={}",
		node_id.as_hex(),
		onion_key.as_hex(),
		chan_point,
		new_link.capacity(),
	);
}

fn handle_unregister(inner: &SwitchInner, node_id: NodeId, chan_point: Option<OutPoint>) {
	info!(
		"unregistering active link, interface={}, chan_point={:?}",
		node_id.as_hex(),
		chan_point,
	);

	let mut links = match inner.interfaces.write().remove(&node_id) {
		Some(links) => links,
		None => return,
	};
	let onion_key = links.first().map(|link| onion_id(&link.peer.identity_key));

	match chan_point {
		// No channel point: purge all of the peer's links.
		None => {
			info!("purging all active links for interface {}", node_id.as_hex());
			let mut chan_index = inner.chan_index.write();
			for link in &links {
				chan_index.remove(&link.chan_point());
			}
			drop(chan_index);
			links.clear();
		}
		Some(chan_point) => {
			inner.chan_index.write().remove(&chan_point);
			links.retain(|link| link.chan_point() != chan_point);
		}
	}

	if links.is_empty() {
		info!("interface {} has no active links, destroying", node_id.as_hex());
		if let Some(onion_key) = onion_key {
			inner.onion_index.write().remove(&onion_key);
		}
	} else {
		if let Some(onion_key) = onion_key {
			inner.onion_index.write().insert(onion_key, links.clone());
		}
		inner.interfaces.write().insert(node_id, links);
	}
}

async fn handle_close(
	inner: &SwitchInner,
	chan_point: OutPoint,
	force: bool,
	reply: oneshot::Sender<Result<(), SwitchError>>,
) {
	let link = inner.chan_index.read().get(&chan_point).cloned();
	let link = match link {
		Some(link) => link,
		None => {
			let _ = reply.send(Err(SwitchError::UnknownLink));
			return;
		}
	};

	info!(
		"requesting interface {} to close link {}",
		link.peer.node_id.as_hex(),
		chan_point,
	);
	let request = CloseRequest { chan_point, force };
	if link.peer.close_requests.send(request).await.is_err() {
		warn!("peer {} is gone, close request dropped", link.peer.node_id.as_hex());
		let _ = reply.send(Err(SwitchError::SwitchExiting));
		return;
	}
	let _ = reply.send(Ok(()));
}

fn handle_link_update(inner: &SwitchInner, chan_point: OutPoint, bandwidth_delta: i64) {
	let link = inner.chan_index.read().get(&chan_point).cloned();
	match link {
		Some(link) => {
			let n = link.adjust(bandwidth_delta);
			trace!("adjusting bandwidth of link {} by {} to {}", chan_point, bandwidth_delta, n);
		}
		None => warn!("bandwidth update for unknown link {}", chan_point),
	}
}

/// The HTLC forwarder multiplexes outgoing payments and add/settle plex
/// traffic, owning the circuit map outright: one packet at a time, in
/// arrival order.
async fn htlc_forwarder(
	inner: Arc<SwitchInner>,
	mut outgoing: mpsc::Receiver<HtlcPacket>,
	mut plex: mpsc::Receiver<HtlcPacket>,
) {
	let mut circuits: HashMap<CircuitKey, PaymentCircuit> = HashMap::new();

	let mut num_updates: u64 = 0;
	let mut sat_sent = Amount::ZERO;
	let mut sat_recv = Amount::ZERO;
	let mut log_ticker = tokio::time::interval(LOG_INTERVAL);
	log_ticker.reset();

	loop {
		tokio::select! {
			Some(packet) = outgoing.recv() => {
				handle_outgoing(&inner, packet);
			}
			Some(packet) = plex.recv() => {
				num_updates += 1;
				let amount = packet.amount;
				match packet.msg {
					HtlcMsg::Add { .. } => {
						if handle_plex_add(&inner, &mut circuits, packet).await {
							sat_recv += amount;
						}
					}
					HtlcMsg::Settle { .. } => {
						handle_plex_settle(&mut circuits, packet).await;
						sat_sent += amount;
					}
				}
			}
			_ = log_ticker.tick() => {
				if num_updates == 0 {
					continue;
				}
				info!(
					"sent {} sat, received {} sat in the last 10 seconds ({:.1} tx/sec)",
					sat_sent.to_sat(),
					sat_recv.to_sat(),
					num_updates as f64 / LOG_INTERVAL.as_secs_f64(),
				);
				sat_sent = Amount::ZERO;
				sat_recv = Amount::ZERO;
				num_updates = 0;
			}
			_ = inner.shutdown.cancelled() => break,
		}
	}
	debug!("htlc forwarder exiting");
}

/// Route a locally initiated payment out over the first link to the
/// destination with enough bandwidth. The reservation is a single atomic
/// step, so the bandwidth check cannot race the decrement.
fn handle_outgoing(inner: &SwitchInner, mut packet: HtlcPacket) {
	let links = inner.interfaces.read().get(&packet.dest).cloned();
	let links = match links {
		Some(links) if !links.is_empty() => links,
		_ => {
			error!("unable to locate link {}", packet.dest.as_hex());
			if let Some(reply) = packet.reply.take() {
				let _ = reply.send(Err(SwitchError::UnknownLink));
			}
			return;
		}
	};

	let amount = packet.amount.to_sat() as i64;
	for link in &links {
		if link.try_reserve(amount) {
			trace!("sending {} to {}", packet.amount, packet.dest.as_hex());
			trace!(
				"decrementing link {} bandwidth to {}",
				link.chan_point(),
				link.available_bandwidth(),
			);

			// Deliver from a detached task so a slow link cannot wedge the
			// forwarder against the channel's own packet processing.
			let link_chan = link.link_chan.clone();
			tokio::spawn(async move {
				let _ = link_chan.send(packet).await;
			});
			return;
		}
	}

	error!("unable to send payment, insufficient capacity");
	if let Some(reply) = packet.reply.take() {
		let _ = reply.send(Err(SwitchError::InsufficientCapacity));
	}
}

/// A peer locked in a new HTLC: install (or re-reference) the payment
/// circuit and forward the add downstream on the clear link. Returns
/// whether the add was actually forwarded.
async fn handle_plex_add(
	inner: &SwitchInner,
	circuits: &mut HashMap<CircuitKey, PaymentCircuit>,
	packet: HtlcPacket,
) -> bool {
	let redemption_hash = match packet.msg {
		HtlcMsg::Add { redemption_hash, .. } => redemption_hash,
		HtlcMsg::Settle { .. } => unreachable!("add handler received settle"),
	};

	let clear = inner
		.onion_index
		.read()
		.get(&packet.next_hop)
		.and_then(|links| links.first().cloned());
	let clear = match clear {
		Some(clear) => clear,
		None => {
			error!("unable to find dest end of circuit: {}", packet.next_hop.as_hex());
			return false;
		}
	};

	let settle = inner.chan_index.read().get(&packet.src_link).cloned();
	let settle = match settle {
		Some(settle) => settle,
		None => {
			warn!("no registered link for plex source {}", packet.src_link);
			return false;
		}
	};

	// Reserve before installing anything: an HTLC the clear link cannot
	// carry must not leave a dangling circuit behind.
	let amount = packet.amount.to_sat() as i64;
	if !clear.try_reserve(amount) {
		error!(
			"insufficient bandwidth on link {} to extend circuit",
			clear.chan_point(),
		);
		return false;
	}

	match circuits.entry(redemption_hash) {
		Entry::Occupied(entry) => {
			// Same payment hash in flight again; the circuit is shared.
			entry.get().ref_count.fetch_add(1, Ordering::SeqCst);
		}
		Entry::Vacant(entry) => {
			debug!(
				"creating onion circuit for {}: {}<->{}",
				redemption_hash.as_hex(),
				clear.chan_point(),
				settle.chan_point(),
			);
			entry.insert(PaymentCircuit::new(clear.clone(), settle));
		}
	}

	trace!(
		"decrementing link {} bandwidth to {}",
		clear.chan_point(),
		clear.available_bandwidth(),
	);
	if clear.link_chan.send(packet.forwarded()).await.is_err() {
		warn!("clear link {} dropped its packet channel", clear.chan_point());
	}
	true
}

/// A settle arrived: complete the matching circuit by forwarding the
/// settle back upstream, crediting the settle link's bandwidth. With no
/// matching circuit the payment originated locally and there is nothing
/// to forward.
async fn handle_plex_settle(
	circuits: &mut HashMap<CircuitKey, PaymentCircuit>,
	packet: HtlcPacket,
) {
	let proof = match packet.msg {
		HtlcMsg::Settle { redemption_proof } => redemption_proof,
		HtlcMsg::Add { .. } => unreachable!("settle handler received add"),
	};
	let circuit_key = sha256::Hash::hash(&proof).to_byte_array();

	let consumed = match circuits.get(&circuit_key) {
		None => {
			debug!("no existing circuit for {}", circuit_key.as_hex());
			return;
		}
		Some(circuit) => {
			if circuit.settle.link_chan.send(packet.forwarded()).await.is_err() {
				warn!(
					"settle link {} dropped its packet channel",
					circuit.settle.chan_point(),
				);
			}

			let n = circuit.settle.release(packet.amount.to_sat() as i64);
			trace!(
				"incrementing link {} bandwidth to {}",
				circuit.settle.chan_point(),
				n,
			);

			let consumed = circuit.ref_count.fetch_sub(1, Ordering::SeqCst) == 1;
			if consumed {
				debug!(
					"closing completed onion circuit for {}: {}<->{}",
					circuit_key.as_hex(),
					circuit.clear.chan_point(),
					circuit.settle.chan_point(),
				);
			}
			consumed
		}
	};

	if consumed {
		circuits.remove(&circuit_key);
	}
}
