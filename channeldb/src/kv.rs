//!
//! Nested-bucket transactional key-value layer.
//!
//! The store models an arbitrarily nested bucket hierarchy on top of a
//! single sled tree. Every bucket is addressed by a path of byte-string
//! segments; data keys live next to child buckets inside their bucket.
//! All of it is flattened into one ordered keyspace with an
//! order-preserving composite encoding, so sibling buckets enumerate in
//! bytewise segment order and data keys enumerate in raw bytewise order.
//! Big-endian integer keys therefore iterate numerically under a cursor.
//!
//! Update transactions run one at a time behind a writer lock and commit
//! as a single atomic batch; view transactions take the reader side and
//! observe only fully committed state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

/// Storage-key tag for a bucket's own existence marker.
const TAG_MARKER: u8 = 0x00;

/// Storage-key tag introducing a child bucket segment.
const TAG_BUCKET: u8 = 0x01;

/// Storage-key tag introducing a data entry.
const TAG_DATA: u8 = 0x02;

/// Errors surfaced by the key-value layer.
///
/// Absent buckets are not errors: lookups return `None` and callers match
/// on that. [Error::BucketNotFound] is only produced by explicit bucket
/// deletion, where bolt-style semantics demand a distinguished outcome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// The underlying storage engine failed.
	#[error("storage engine error: {0}")]
	Backend(#[from] sled::Error),

	/// A bucket deletion targeted a bucket that does not exist.
	#[error("bucket not found")]
	BucketNotFound,

	/// A stored composite key failed to parse. This indicates on-disk
	/// corruption or a foreign writer.
	#[error("malformed storage key")]
	Corrupt,
}

/// Append one escaped, terminated path segment to `buf`.
///
/// `0x00` content bytes are escaped as `0x00 0xFF` and the segment is
/// terminated by `0x00 0x00`, which keeps the flattened keyspace in the
/// same order as the segment-wise comparison of paths.
fn escape_segment_into(buf: &mut Vec<u8>, segment: &[u8]) {
	for &b in segment {
		if b == 0x00 {
			buf.extend_from_slice(&[0x00, 0xFF]);
		} else {
			buf.push(b);
		}
	}
	buf.extend_from_slice(&[0x00, 0x00]);
}

/// Parse one escaped segment from the front of `bytes`, returning the
/// segment content and the number of bytes consumed.
fn parse_segment(bytes: &[u8]) -> Result<(Vec<u8>, usize), Error> {
	let mut out = Vec::new();
	let mut i = 0;
	loop {
		match bytes.get(i) {
			Some(0x00) => match bytes.get(i + 1) {
				Some(0xFF) => {
					out.push(0x00);
					i += 2;
				}
				Some(0x00) => return Ok((out, i + 2)),
				_ => return Err(Error::Corrupt),
			},
			Some(&b) => {
				out.push(b);
				i += 1;
			}
			None => return Err(Error::Corrupt),
		}
	}
}

/// A handle to a bucket at a fixed path.
///
/// The handle itself holds no reference to the transaction it was
/// resolved from; every operation takes the transaction explicitly, the
/// same way the store's typed record helpers do.
#[derive(Clone, Debug)]
pub struct Bucket {
	/// Encoded path prefix of this bucket within the flattened keyspace.
	prefix: Vec<u8>,
}

impl Bucket {
	fn root() -> Bucket {
		Bucket { prefix: Vec::new() }
	}

	/// The encoded subtree prefix of a would-be child bucket.
	fn child_prefix(&self, name: &[u8]) -> Vec<u8> {
		let mut p = Vec::with_capacity(self.prefix.len() + name.len() + 3);
		p.extend_from_slice(&self.prefix);
		p.push(TAG_BUCKET);
		escape_segment_into(&mut p, name);
		p
	}

	fn marker_key(&self) -> Vec<u8> {
		let mut k = self.prefix.clone();
		k.push(TAG_MARKER);
		k
	}

	fn data_key(&self, key: &[u8]) -> Vec<u8> {
		let mut k = Vec::with_capacity(self.prefix.len() + key.len() + 1);
		k.extend_from_slice(&self.prefix);
		k.push(TAG_DATA);
		k.extend_from_slice(key);
		k
	}

	/// Fetch the value stored under `key` in this bucket.
	pub fn get(&self, tx: &Tx<'_>, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
		tx.read(&self.data_key(key))
	}

	/// Store `value` under `key` in this bucket.
	pub fn put(&self, tx: &mut Tx<'_>, key: &[u8], value: &[u8]) {
		tx.write(self.data_key(key), Some(value.to_vec()));
	}

	/// Remove the entry under `key`, if any.
	pub fn delete(&self, tx: &mut Tx<'_>, key: &[u8]) {
		tx.write(self.data_key(key), None);
	}

	/// Resolve an existing child bucket. Returns `None` when the bucket
	/// does not exist; a missing bucket is never an error.
	pub fn bucket(&self, tx: &Tx<'_>, name: &[u8]) -> Result<Option<Bucket>, Error> {
		let child = Bucket { prefix: self.child_prefix(name) };
		if tx.read(&child.marker_key())?.is_some() {
			Ok(Some(child))
		} else {
			Ok(None)
		}
	}

	/// Resolve a child bucket, creating its existence marker if needed.
	pub fn create_bucket_if_not_exists(
		&self,
		tx: &mut Tx<'_>,
		name: &[u8],
	) -> Result<Bucket, Error> {
		let child = Bucket { prefix: self.child_prefix(name) };
		let marker = child.marker_key();
		if tx.read(&marker)?.is_none() {
			tx.write(marker, Some(Vec::new()));
		}
		Ok(child)
	}

	/// Delete the named child bucket and its entire subtree.
	///
	/// Fails with [Error::BucketNotFound] when the bucket does not exist,
	/// so callers that treat that case as benign can match on it.
	pub fn delete_bucket(&self, tx: &mut Tx<'_>, name: &[u8]) -> Result<(), Error> {
		let child = Bucket { prefix: self.child_prefix(name) };
		if tx.read(&child.marker_key())?.is_none() {
			return Err(Error::BucketNotFound);
		}
		for (k, _) in tx.scan(&child.prefix)? {
			tx.write(k, None);
		}
		Ok(())
	}

	/// Enumerate the names of this bucket's direct child buckets, in
	/// bytewise order.
	pub fn child_buckets(&self, tx: &Tx<'_>) -> Result<Vec<Vec<u8>>, Error> {
		let mut scan_prefix = self.prefix.clone();
		scan_prefix.push(TAG_BUCKET);

		let mut names = Vec::new();
		for (k, _) in tx.scan(&scan_prefix)? {
			let rest = &k[scan_prefix.len()..];
			let (name, used) = parse_segment(rest)?;
			// Only the child's own marker identifies it; everything else
			// under the segment belongs to the child's subtree.
			if rest[used..] == [TAG_MARKER] {
				names.push(name);
			}
		}
		Ok(names)
	}

	/// Enumerate the data entries of this bucket whose keys start with
	/// `prefix`, in bytewise key order. Pass an empty prefix for all
	/// entries. Child buckets are not included.
	pub fn entries(
		&self,
		tx: &Tx<'_>,
		prefix: &[u8],
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
		let mut scan_prefix = self.prefix.clone();
		scan_prefix.push(TAG_DATA);
		scan_prefix.extend_from_slice(prefix);

		let data_start = self.prefix.len() + 1;
		let mut out = Vec::new();
		for (k, v) in tx.scan(&scan_prefix)? {
			out.push((k[data_start..].to_vec(), v));
		}
		Ok(out)
	}

	/// Whether this bucket holds neither data entries nor child buckets.
	pub fn is_empty(&self, tx: &Tx<'_>) -> Result<bool, Error> {
		let marker = self.marker_key();
		for (k, _) in tx.scan(&self.prefix)? {
			if k != marker {
				return Ok(false);
			}
		}
		Ok(true)
	}
}

/// An in-flight transaction.
///
/// Update transactions buffer their writes in an overlay that is applied
/// as one atomic batch on commit; every read and scan inside the
/// transaction observes the overlay, so deletions are visible to
/// subsequent emptiness checks within the same transaction. View
/// transactions carry no overlay.
pub struct Tx<'a> {
	tree: &'a sled::Tree,
	pending: Option<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a> Tx<'a> {
	/// Resolve an existing top-level bucket.
	pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket>, Error> {
		Bucket::root().bucket(self, name)
	}

	/// Resolve a top-level bucket, creating it if needed.
	pub fn create_bucket_if_not_exists(&mut self, name: &[u8]) -> Result<Bucket, Error> {
		Bucket::root().create_bucket_if_not_exists(self, name)
	}

	/// Delete a top-level bucket and its entire subtree.
	pub fn delete_bucket(&mut self, name: &[u8]) -> Result<(), Error> {
		Bucket::root().delete_bucket(self, name)
	}

	fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
		if let Some(ref pending) = self.pending {
			if let Some(v) = pending.get(key) {
				return Ok(v.clone());
			}
		}
		Ok(self.tree.get(key)?.map(|iv| iv.to_vec()))
	}

	fn write(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
		self.pending
			.as_mut()
			.expect("write inside a view transaction")
			.insert(key, value);
	}

	/// All live `(key, value)` pairs whose storage key starts with
	/// `prefix`, merged across the committed tree and the overlay.
	fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
		let mut merged = BTreeMap::new();
		for item in self.tree.scan_prefix(prefix) {
			let (k, v) = item?;
			merged.insert(k.to_vec(), v.to_vec());
		}
		if let Some(ref pending) = self.pending {
			let range = pending.range(prefix.to_vec()..);
			for (k, v) in range.take_while(|(k, _)| k.starts_with(prefix)) {
				match v {
					Some(v) => {
						merged.insert(k.clone(), v.clone());
					}
					None => {
						merged.remove(k);
					}
				}
			}
		}
		Ok(merged.into_iter().collect())
	}
}

struct StoreInner {
	// Held for the lifetime of the store; all access goes through `tree`.
	_db: sled::Db,
	tree: sled::Tree,
	// Serializes update transactions against each other and against view
	// transactions. sled batches are atomic, so readers never observe a
	// half-applied update.
	lock: RwLock<()>,
}

/// Handle to an open store. Cheap to clone; all clones share the same
/// underlying database.
#[derive(Clone)]
pub struct Store {
	inner: Arc<StoreInner>,
}

impl Store {
	/// Open (or create) the store at the given path.
	pub fn open(path: impl AsRef<Path>) -> Result<Store, Error> {
		let db = sled::open(path)?;
		let tree = db.open_tree(b"filament")?;
		Ok(Store {
			inner: Arc::new(StoreInner { _db: db, tree, lock: RwLock::new(()) }),
		})
	}

	/// Run an update transaction.
	///
	/// The closure's writes are committed as one atomic, flushed batch
	/// when it returns `Ok`; any error discards them all and propagates
	/// unchanged.
	pub fn update<T, E, F>(&self, f: F) -> Result<T, E>
	where
		E: From<Error>,
		F: FnOnce(&mut Tx<'_>) -> Result<T, E>,
	{
		let _guard = self.inner.lock.write();
		let mut tx = Tx {
			tree: &self.inner.tree,
			pending: Some(BTreeMap::new()),
		};
		let out = f(&mut tx)?;

		let pending = tx.pending.take().expect("update overlay present");
		let mut batch = sled::Batch::default();
		for (k, v) in pending {
			match v {
				Some(v) => batch.insert(k, v),
				None => batch.remove(k),
			}
		}
		self.inner.tree.apply_batch(batch).map_err(Error::from)?;
		self.inner.tree.flush().map_err(Error::from)?;
		Ok(out)
	}

	/// Run a read-only view transaction against committed state.
	pub fn view<T, E, F>(&self, f: F) -> Result<T, E>
	where
		E: From<Error>,
		F: FnOnce(&Tx<'_>) -> Result<T, E>,
	{
		let _guard = self.inner.lock.read();
		let tx = Tx { tree: &self.inner.tree, pending: None };
		f(&tx)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn open_temp() -> (tempfile::TempDir, Store) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(dir.path().join("kv")).unwrap();
		(dir, store)
	}

	#[test]
	fn put_get_roundtrip_and_reopen() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("kv");

		let store = Store::open(&path).unwrap();
		store
			.update(|tx| {
				let top = tx.create_bucket_if_not_exists(b"top")?;
				let nested = top.create_bucket_if_not_exists(tx, b"nested")?;
				nested.put(tx, b"key", b"value");
				Ok::<_, Error>(())
			})
			.unwrap();
		drop(store);

		let store = Store::open(&path).unwrap();
		let val = store
			.view(|tx| {
				let top = tx.bucket(b"top")?.expect("top bucket persisted");
				let nested = top.bucket(tx, b"nested")?.expect("nested persisted");
				nested.get(tx, b"key")
			})
			.unwrap();
		assert_eq!(val.as_deref(), Some(&b"value"[..]));
	}

	#[test]
	fn missing_bucket_is_none_not_error() {
		let (_dir, store) = open_temp();
		let found = store.view(|tx| tx.bucket(b"nope")).unwrap();
		assert!(found.is_none());
	}

	#[test]
	fn big_endian_keys_iterate_numerically() {
		let (_dir, store) = open_temp();
		let heights = [256u32, 1, 65536, 255, 2, 300];
		store
			.update(|tx| {
				let idx = tx.create_bucket_if_not_exists(b"height-index")?;
				for h in heights {
					idx.create_bucket_if_not_exists(tx, &h.to_be_bytes())?;
				}
				Ok::<_, Error>(())
			})
			.unwrap();

		let names = store
			.view(|tx| {
				let idx = tx.bucket(b"height-index")?.unwrap();
				idx.child_buckets(tx)
			})
			.unwrap();
		let got: Vec<u32> = names
			.iter()
			.map(|n| u32::from_be_bytes(n.as_slice().try_into().unwrap()))
			.collect();
		assert_eq!(got, vec![1, 2, 255, 256, 300, 65536]);
	}

	#[test]
	fn failed_update_discards_all_writes() {
		let (_dir, store) = open_temp();
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				b.put(tx, b"persisted", b"1");
				Ok::<_, Error>(())
			})
			.unwrap();

		let res: Result<(), Error> = store.update(|tx| {
			let b = tx.bucket(b"b")?.unwrap();
			b.put(tx, b"discarded", b"1");
			Err(Error::Corrupt)
		});
		assert!(res.is_err());

		store
			.view(|tx| {
				let b = tx.bucket(b"b")?.unwrap();
				assert!(b.get(tx, b"persisted")?.is_some());
				assert!(b.get(tx, b"discarded")?.is_none());
				Ok::<_, Error>(())
			})
			.unwrap();
	}

	#[test]
	fn overlay_reads_see_uncommitted_writes() {
		let (_dir, store) = open_temp();
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				b.put(tx, b"k", b"v");
				assert_eq!(b.get(tx, b"k")?.as_deref(), Some(&b"v"[..]));

				b.delete(tx, b"k");
				assert!(b.get(tx, b"k")?.is_none());
				assert!(b.is_empty(tx)?);
				Ok::<_, Error>(())
			})
			.unwrap();
	}

	#[test]
	fn delete_bucket_removes_subtree() {
		let (_dir, store) = open_temp();
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				let c = b.create_bucket_if_not_exists(tx, b"c")?;
				c.put(tx, b"k", b"v");
				Ok::<_, Error>(())
			})
			.unwrap();

		store
			.update(|tx| {
				tx.delete_bucket(b"b")?;
				Ok::<_, Error>(())
			})
			.unwrap();

		store
			.view(|tx| {
				assert!(tx.bucket(b"b")?.is_none());
				Ok::<_, Error>(())
			})
			.unwrap();

		// Deleting it again hits the distinguished sentinel.
		let res: Result<(), Error> = store.update(|tx| tx.delete_bucket(b"b"));
		assert!(matches!(res, Err(Error::BucketNotFound)));
	}

	#[test]
	fn children_and_entries_are_disjoint() {
		let (_dir, store) = open_temp();
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				b.put(tx, b"data", b"1");
				let child = b.create_bucket_if_not_exists(tx, b"child")?;
				child.put(tx, b"inner", b"2");
				Ok::<_, Error>(())
			})
			.unwrap();

		store
			.view(|tx| {
				let b = tx.bucket(b"b")?.unwrap();
				assert_eq!(b.child_buckets(tx)?, vec![b"child".to_vec()]);
				let entries = b.entries(tx, &[])?;
				assert_eq!(entries, vec![(b"data".to_vec(), b"1".to_vec())]);
				assert!(!b.is_empty(tx)?);
				Ok::<_, Error>(())
			})
			.unwrap();
	}

	#[test]
	fn prefix_scan_is_bounded() {
		let (_dir, store) = open_temp();
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				b.put(tx, b"ccp-a", b"1");
				b.put(tx, b"ccp-b", b"2");
				b.put(tx, b"sbp-a", b"3");
				Ok::<_, Error>(())
			})
			.unwrap();

		let keys: Vec<Vec<u8>> = store
			.view(|tx| {
				let b = tx.bucket(b"b")?.unwrap();
				Ok::<_, Error>(b.entries(tx, b"ccp")?.into_iter().map(|(k, _)| k).collect())
			})
			.unwrap();
		assert_eq!(keys, vec![b"ccp-a".to_vec(), b"ccp-b".to_vec()]);
	}

	#[test]
	fn segment_escaping_preserves_zero_bytes() {
		let (_dir, store) = open_temp();
		let name = [0x00u8, 0xFF, 0x00, 0x01];
		store
			.update(|tx| {
				let b = tx.create_bucket_if_not_exists(b"b")?;
				b.create_bucket_if_not_exists(tx, &name)?;
				Ok::<_, Error>(())
			})
			.unwrap();

		let names = store
			.view(|tx| {
				let b = tx.bucket(b"b")?.unwrap();
				b.child_buckets(tx)
			})
			.unwrap();
		assert_eq!(names, vec![name.to_vec()]);
	}
}
