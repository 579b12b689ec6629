//!
//! Forward-secret revocation hash chain.
//!
//! Revocation secrets form a binary SHA-256 tree whose nodes are revealed
//! in post-order: both children of a node are handed out before the node
//! itself, and knowing a node lets either party re-derive its entire
//! subtree. The sender therefore persists nothing but the 32-byte root,
//! while the receiver retains at most one node per tree level (the
//! frontier of what it has been shown) and can reproduce any previously
//! received index on demand.
//!
//! The channel store keeps both halves on disk inside the per-channel
//! revocation record; this module owns their compact serialized forms so
//! the record layout stays independent of how secrets are derived.

use bitcoin::hashes::{sha256, Hash, HashEngine};

use crate::encode::ReadExt;

/// Height of the derivation tree. The tree holds `2^48 - 1` nodes, which
/// bounds usable indices to [MAX_INDEX].
const TREE_HEIGHT: u8 = 47;

/// The largest index either side can derive.
pub const MAX_INDEX: u64 = (1u64 << (TREE_HEIGHT as u64 + 1)) - 2;

/// Errors surfaced by the hash-chain sender and receiver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElkremError {
	/// The requested index lies beyond the tree's capacity.
	#[error("elkrem index {0} exceeds tree capacity")]
	OutOfRange(u64),

	/// A received hash is not the parent of the two frontier nodes it
	/// was required to collapse.
	#[error("received hash is not the parent of the retained frontier")]
	Mismatch,

	/// The requested index has not been received (or is not derivable
	/// from the retained frontier).
	#[error("elkrem node at index {0} cannot be derived")]
	Unknown(u64),

	/// A serialized receiver state failed to parse.
	#[error("malformed elkrem receiver state")]
	Corrupt,
}

/// Derive a child of a tree node. `side` is 0 for the left child and 1
/// for the right child.
fn child(node: sha256::Hash, side: u8) -> sha256::Hash {
	let mut engine = sha256::Hash::engine();
	engine.input(node.as_byte_array());
	engine.input(&[side]);
	sha256::Hash::from_engine(engine)
}

/// Walk from a subtree root down to the node at post-order `index`.
///
/// `base` is the first post-order index covered by the subtree; the
/// caller guarantees `index` falls inside it.
fn descend(mut node: sha256::Hash, mut height: u8, mut base: u64, index: u64) -> sha256::Hash {
	loop {
		let span = (1u64 << (height as u64 + 1)) - 1;
		if index == base + span - 1 {
			return node;
		}
		// Each child subtree covers half the remaining span; the left one
		// starts at `base`, the right one directly after it.
		let half = (1u64 << height as u64) - 1;
		if index < base + half {
			node = child(node, 0);
		} else {
			node = child(node, 1);
			base += half;
		}
		height -= 1;
	}
}

/// The giving half of the hash chain. Holds only the tree root and
/// derives any node on demand.
#[derive(Clone, PartialEq, Eq)]
pub struct ElkremSender {
	root: sha256::Hash,
}

impl ElkremSender {
	pub fn new(root: sha256::Hash) -> ElkremSender {
		ElkremSender { root }
	}

	/// The persisted form of the sender: its root hash.
	pub fn root(&self) -> sha256::Hash {
		self.root
	}

	/// Derive the node at the given post-order index.
	pub fn at_index(&self, index: u64) -> Result<sha256::Hash, ElkremError> {
		if index > MAX_INDEX {
			return Err(ElkremError::OutOfRange(index));
		}
		Ok(descend(self.root, TREE_HEIGHT, 0, index))
	}
}

impl std::fmt::Debug for ElkremSender {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// The root derives every revocation secret; never print it.
		f.debug_struct("ElkremSender").finish_non_exhaustive()
	}
}

/// One retained node of the receiver's frontier.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Node {
	index: u64,
	height: u8,
	hash: sha256::Hash,
}

/// The receiving half of the hash chain.
///
/// Nodes arrive in post-order index order via [ElkremReceiver::add_next].
/// Whenever the two most recent retained nodes share a height, the next
/// arrival must be their parent; the children collapse into it, keeping
/// the retained set to at most one node per level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElkremReceiver {
	nodes: Vec<Node>,
}

impl ElkremReceiver {
	pub fn new() -> ElkremReceiver {
		ElkremReceiver::default()
	}

	/// The highest index received so far, if any.
	pub fn max_index(&self) -> Option<u64> {
		self.nodes.last().map(|n| n.index)
	}

	/// Ingest the next node of the sequence.
	pub fn add_next(&mut self, hash: sha256::Hash) -> Result<(), ElkremError> {
		let index = match self.nodes.last() {
			Some(n) => n.index + 1,
			None => 0,
		};
		if index > MAX_INDEX {
			return Err(ElkremError::OutOfRange(index));
		}

		let n = self.nodes.len();
		if n >= 2 && self.nodes[n - 1].height == self.nodes[n - 2].height {
			// The incoming node must be the parent of the top two frontier
			// nodes; verify before collapsing them.
			let left = &self.nodes[n - 2];
			let right = &self.nodes[n - 1];
			if child(hash, 0) != left.hash || child(hash, 1) != right.hash {
				return Err(ElkremError::Mismatch);
			}
			let height = left.height + 1;
			self.nodes.truncate(n - 2);
			self.nodes.push(Node { index, height, hash });
		} else {
			self.nodes.push(Node { index, height: 0, hash });
		}
		Ok(())
	}

	/// Re-derive a previously received node.
	pub fn at_index(&self, index: u64) -> Result<sha256::Hash, ElkremError> {
		for node in &self.nodes {
			let span = (1u64 << (node.height as u64 + 1)) - 1;
			let base = node.index + 1 - span;
			if index >= base && index <= node.index {
				return Ok(descend(node.hash, node.height, base, index));
			}
		}
		Err(ElkremError::Unknown(index))
	}

	/// Serialize the retained frontier.
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut buf = Vec::with_capacity(1 + self.nodes.len() * 41);
		buf.push(self.nodes.len() as u8);
		for node in &self.nodes {
			buf.extend_from_slice(&node.index.to_be_bytes());
			buf.push(node.height);
			buf.extend_from_slice(node.hash.as_byte_array());
		}
		buf
	}

	/// Reconstruct a receiver from its serialized frontier.
	pub fn from_bytes(bytes: &[u8]) -> Result<ElkremReceiver, ElkremError> {
		let mut r = bytes;
		let count = r.read_u8().map_err(|_| ElkremError::Corrupt)? as usize;
		if count > TREE_HEIGHT as usize + 1 {
			return Err(ElkremError::Corrupt);
		}

		let mut nodes = Vec::with_capacity(count);
		let mut last_index = None;
		for _ in 0..count {
			let index = r.read_u64().map_err(|_| ElkremError::Corrupt)?;
			let height = r.read_u8().map_err(|_| ElkremError::Corrupt)?;
			let hash: [u8; 32] = r.read_byte_array().map_err(|_| ElkremError::Corrupt)?;
			if height > TREE_HEIGHT || index > MAX_INDEX {
				return Err(ElkremError::Corrupt);
			}
			// Frontier nodes are retained in strictly ascending index order.
			if last_index.map_or(false, |last| index <= last) {
				return Err(ElkremError::Corrupt);
			}
			last_index = Some(index);
			nodes.push(Node {
				index,
				height,
				hash: sha256::Hash::from_byte_array(hash),
			});
		}
		if !r.is_empty() {
			return Err(ElkremError::Corrupt);
		}
		Ok(ElkremReceiver { nodes })
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn test_sender() -> ElkremSender {
		ElkremSender::new(sha256::Hash::hash(b"elkrem test root"))
	}

	#[test]
	fn sender_and_receiver_agree() {
		let sender = test_sender();
		let mut receiver = ElkremReceiver::new();

		let run = 200u64;
		for i in 0..run {
			receiver.add_next(sender.at_index(i).unwrap()).unwrap();
		}

		assert_eq!(receiver.max_index(), Some(run - 1));
		for i in 0..run {
			assert_eq!(receiver.at_index(i).unwrap(), sender.at_index(i).unwrap());
		}
		assert!(receiver.at_index(run).is_err());
	}

	#[test]
	fn receiver_stays_compact() {
		let sender = test_sender();
		let mut receiver = ElkremReceiver::new();
		for i in 0..1000u64 {
			receiver.add_next(sender.at_index(i).unwrap()).unwrap();
			assert!(receiver.nodes.len() <= TREE_HEIGHT as usize + 1);
		}
	}

	#[test]
	fn receiver_rejects_bogus_parent() {
		let sender = test_sender();
		let mut receiver = ElkremReceiver::new();
		// Indices 0 and 1 are siblings; index 2 must be their parent.
		receiver.add_next(sender.at_index(0).unwrap()).unwrap();
		receiver.add_next(sender.at_index(1).unwrap()).unwrap();

		let bogus = sha256::Hash::hash(b"not the parent");
		assert_eq!(receiver.add_next(bogus), Err(ElkremError::Mismatch));

		// The real parent is still accepted afterwards.
		receiver.add_next(sender.at_index(2).unwrap()).unwrap();
		assert_eq!(receiver.max_index(), Some(2));
	}

	#[test]
	fn receiver_serialization_roundtrip() {
		let sender = test_sender();
		let mut receiver = ElkremReceiver::new();
		for i in 0..77u64 {
			receiver.add_next(sender.at_index(i).unwrap()).unwrap();
		}

		let restored = ElkremReceiver::from_bytes(&receiver.to_bytes()).unwrap();
		assert_eq!(restored, receiver);
		for i in 0..77u64 {
			assert_eq!(restored.at_index(i).unwrap(), sender.at_index(i).unwrap());
		}
	}

	#[test]
	fn from_bytes_rejects_garbage() {
		assert!(ElkremReceiver::from_bytes(&[]).is_err());
		assert!(ElkremReceiver::from_bytes(&[200]).is_err());
		// Trailing bytes after the declared node count.
		let mut receiver = ElkremReceiver::new();
		receiver.add_next(sha256::Hash::hash(b"x")).unwrap();
		let mut bytes = receiver.to_bytes();
		bytes.push(0);
		assert!(ElkremReceiver::from_bytes(&bytes).is_err());
	}

	#[test]
	fn out_of_range_index_is_rejected() {
		let sender = test_sender();
		assert_eq!(
			sender.at_index(MAX_INDEX + 1),
			Err(ElkremError::OutOfRange(MAX_INDEX + 1))
		);
		assert!(sender.at_index(MAX_INDEX).is_ok());
	}
}
