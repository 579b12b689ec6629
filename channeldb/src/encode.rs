//!
//! Canonical on-disk record encodings.
//!
//! Every multi-byte integer written by this module is **big-endian**; the
//! store's cursor-ordering contract depends on it and no other byte order
//! may appear anywhere in the database. The single exception is the
//! compact-size varint, which keeps Bitcoin's wire layout (and therefore
//! little-endian payload bytes) so length prefixes stay interoperable
//! with consensus-encoded material.
//!

use std::{fmt, io};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, PublicKey};
use bitcoin::{Amount, OutPoint, Txid};

/// Error occurring while decoding a stored record.
///
/// Codec errors are always fatal to the operation that hit them: a record
/// that fails to parse means the store is corrupt or was written by an
/// incompatible version.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	#[error("invalid record encoding: {message}")]
	Invalid {
		message: String,
		#[source]
		source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
	},

	#[error("field {field} exceeds maximum length ({len} > {max})")]
	Oversized {
		field: &'static str,
		len: usize,
		max: usize,
	},
}

impl DecodeError {
	/// Create a new [DecodeError::Invalid] with the given message.
	pub fn invalid(message: impl fmt::Display) -> DecodeError {
		DecodeError::Invalid {
			message: message.to_string(),
			source: None,
		}
	}

	/// Create a new [DecodeError::Invalid] with the given message and
	/// source error.
	pub fn invalid_err<E>(source: E, message: impl fmt::Display) -> DecodeError
	where
		E: std::error::Error + Send + Sync + 'static,
	{
		DecodeError::Invalid {
			message: message.to_string(),
			source: Some(Box::new(source)),
		}
	}
}

impl From<bitcoin::consensus::encode::Error> for DecodeError {
	fn from(e: bitcoin::consensus::encode::Error) -> DecodeError {
		DecodeError::invalid_err(e, "bitcoin consensus decoding error")
	}
}

/// Trait for encoding objects into their canonical stored form.
pub trait RecordEncoding: Sized {
	/// Encode the object into the writer.
	fn encode<W: io::Write + ?Sized>(&self, writer: &mut W) -> Result<(), io::Error>;

	/// Decode the object from the reader.
	fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<Self, DecodeError>;

	/// Serialize the object into a byte vector.
	fn serialize(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		self.encode(&mut buf).expect("buffers don't produce I/O errors");
		buf
	}

	/// Deserialize the object from the given byte slice.
	fn deserialize(mut byte_slice: &[u8]) -> Result<Self, DecodeError> {
		Self::decode(&mut byte_slice)
	}
}

/// Utility trait to write primitive values in the store's record format.
pub trait WriteExt: io::Write {
	/// Write an 8-bit unsigned integer.
	fn emit_u8(&mut self, v: u8) -> Result<(), io::Error> {
		self.write_all(&[v])
	}

	/// Write a 16-bit unsigned integer in big-endian.
	fn emit_u16(&mut self, v: u16) -> Result<(), io::Error> {
		self.write_all(&v.to_be_bytes())
	}

	/// Write a 32-bit unsigned integer in big-endian.
	fn emit_u32(&mut self, v: u32) -> Result<(), io::Error> {
		self.write_all(&v.to_be_bytes())
	}

	/// Write a 64-bit unsigned integer in big-endian.
	fn emit_u64(&mut self, v: u64) -> Result<(), io::Error> {
		self.write_all(&v.to_be_bytes())
	}

	/// Write a boolean as a single byte.
	fn emit_bool(&mut self, v: bool) -> Result<(), io::Error> {
		self.emit_u8(v as u8)
	}

	/// Write the entire slice to the writer.
	fn emit_slice(&mut self, slice: &[u8]) -> Result<(), io::Error> {
		self.write_all(slice)
	}

	/// Write a value in compact-size (Bitcoin "VarInt") encoding.
	fn emit_compact_size(&mut self, value: impl Into<u64>) -> Result<(), io::Error> {
		let value = value.into();
		match value {
			0..=0xFC => self.emit_u8(value as u8),
			0xFD..=0xFFFF => {
				self.emit_u8(0xFD)?;
				self.write_all(&(value as u16).to_le_bytes())
			}
			0x10000..=0xFFFFFFFF => {
				self.emit_u8(0xFE)?;
				self.write_all(&(value as u32).to_le_bytes())
			}
			_ => {
				self.emit_u8(0xFF)?;
				self.write_all(&value.to_le_bytes())
			}
		}
	}

	/// Write a compact-size length prefix followed by the slice itself.
	fn emit_var_bytes(&mut self, slice: &[u8]) -> Result<(), io::Error> {
		self.emit_compact_size(slice.len() as u64)?;
		self.emit_slice(slice)
	}
}

impl<W: io::Write + ?Sized> WriteExt for W {}

/// Utility trait to read primitive values in the store's record format.
pub trait ReadExt: io::Read {
	/// Read an 8-bit unsigned integer.
	fn read_u8(&mut self) -> Result<u8, io::Error> {
		let mut buf = [0; 1];
		self.read_exact(&mut buf[..])?;
		Ok(buf[0])
	}

	/// Read a 16-bit unsigned integer in big-endian.
	fn read_u16(&mut self) -> Result<u16, io::Error> {
		let mut buf = [0; 2];
		self.read_exact(&mut buf[..])?;
		Ok(u16::from_be_bytes(buf))
	}

	/// Read a 32-bit unsigned integer in big-endian.
	fn read_u32(&mut self) -> Result<u32, io::Error> {
		let mut buf = [0; 4];
		self.read_exact(&mut buf[..])?;
		Ok(u32::from_be_bytes(buf))
	}

	/// Read a 64-bit unsigned integer in big-endian.
	fn read_u64(&mut self) -> Result<u64, io::Error> {
		let mut buf = [0; 8];
		self.read_exact(&mut buf[..])?;
		Ok(u64::from_be_bytes(buf))
	}

	/// Read a strictly encoded boolean byte.
	fn read_bool(&mut self) -> Result<bool, DecodeError> {
		match self.read_u8()? {
			0 => Ok(false),
			1 => Ok(true),
			b => Err(DecodeError::invalid(format_args!("invalid boolean byte {}", b))),
		}
	}

	/// Read from the reader to fill the entire slice.
	fn read_slice(&mut self, slice: &mut [u8]) -> Result<(), io::Error> {
		self.read_exact(slice)
	}

	/// Read a fixed-size byte array.
	fn read_byte_array<const N: usize>(&mut self) -> Result<[u8; N], io::Error> {
		let mut ret = [0u8; N];
		self.read_exact(&mut ret)?;
		Ok(ret)
	}

	/// Read a value in compact-size (Bitcoin "VarInt") encoding, rejecting
	/// non-minimal forms.
	fn read_compact_size(&mut self) -> Result<u64, DecodeError> {
		match self.read_u8()? {
			0xFF => {
				let mut buf = [0; 8];
				self.read_exact(&mut buf)?;
				let x = u64::from_le_bytes(buf);
				if x < 0x1_0000_0000 {
					Err(DecodeError::invalid("non-minimal varint"))
				} else {
					Ok(x)
				}
			}
			0xFE => {
				let mut buf = [0; 4];
				self.read_exact(&mut buf)?;
				let x = u32::from_le_bytes(buf);
				if x < 0x1_0000 {
					Err(DecodeError::invalid("non-minimal varint"))
				} else {
					Ok(x as u64)
				}
			}
			0xFD => {
				let mut buf = [0; 2];
				self.read_exact(&mut buf)?;
				let x = u16::from_le_bytes(buf);
				if x < 0xFD {
					Err(DecodeError::invalid("non-minimal varint"))
				} else {
					Ok(x as u64)
				}
			}
			n => Ok(n as u64),
		}
	}

	/// Read a length-prefixed byte string, enforcing the given maximum.
	fn read_var_bytes(
		&mut self,
		max: usize,
		field: &'static str,
	) -> Result<Vec<u8>, DecodeError> {
		let len = self.read_compact_size()? as usize;
		if len > max {
			return Err(DecodeError::Oversized { field, len, max });
		}
		let mut buf = vec![0u8; len];
		self.read_exact(&mut buf)?;
		Ok(buf)
	}
}

impl<R: io::Read + ?Sized> ReadExt for R {}

impl RecordEncoding for OutPoint {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.emit_var_bytes(&self.txid.to_byte_array())?;
		w.emit_u32(self.vout)
	}

	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		let txid = r.read_var_bytes(32, "outpoint txid")?;
		let txid: [u8; 32] = txid
			.try_into()
			.map_err(|_| DecodeError::invalid("outpoint txid must be 32 bytes"))?;
		let vout = r.read_u32()?;
		Ok(OutPoint::new(Txid::from_byte_array(txid), vout))
	}
}

impl RecordEncoding for PublicKey {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.emit_slice(&self.serialize())
	}

	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		let buf: [u8; secp256k1::constants::PUBLIC_KEY_SIZE] = r.read_byte_array()?;
		PublicKey::from_slice(&buf)
			.map_err(|e| DecodeError::invalid_err(e, "invalid public key"))
	}
}

impl RecordEncoding for Amount {
	fn encode<W: io::Write + ?Sized>(&self, w: &mut W) -> Result<(), io::Error> {
		w.emit_u64(self.to_sat())
	}

	fn decode<R: io::Read + ?Sized>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(Amount::from_sat(r.read_u64()?))
	}
}

/// Read a compressed public key out of a length-prefixed field.
pub(crate) fn read_var_pubkey<R: io::Read + ?Sized>(
	r: &mut R,
	field: &'static str,
) -> Result<PublicKey, DecodeError> {
	let bytes = r.read_var_bytes(secp256k1::constants::PUBLIC_KEY_SIZE + 1, field)?;
	PublicKey::from_slice(&bytes).map_err(|e| DecodeError::invalid_err(e, field))
}

#[cfg(test)]
mod test {
	use super::*;

	fn dummy_outpoint(byte: u8, vout: u32) -> OutPoint {
		OutPoint::new(Txid::from_byte_array([byte; 32]), vout)
	}

	#[test]
	fn outpoint_roundtrip() {
		let op = dummy_outpoint(0xAB, 7);
		let bytes = op.serialize();
		// var-bytes txid (1 + 32) plus the big-endian index.
		assert_eq!(bytes.len(), 37);
		assert_eq!(bytes[0], 32);
		assert_eq!(&bytes[33..], &7u32.to_be_bytes());
		assert_eq!(OutPoint::deserialize(&bytes).unwrap(), op);
	}

	#[test]
	fn integers_are_big_endian() {
		let mut buf = Vec::new();
		buf.emit_u32(0x01020304).unwrap();
		assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04]);

		buf.clear();
		buf.emit_u64(0x0102030405060708).unwrap();
		assert_eq!(buf, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
	}

	#[test]
	fn compact_size_minimality() {
		for v in [0u64, 0xFC, 0xFD, 0xFFFF, 0x10000, 0xFFFF_FFFF, 0x1_0000_0000] {
			let mut buf = Vec::new();
			buf.emit_compact_size(v).unwrap();
			let got = (&buf[..]).read_compact_size().unwrap();
			assert_eq!(got, v);
		}

		// A u16-form varint below 0xFD is non-minimal.
		let bad = [0xFDu8, 0x01, 0x00];
		assert!((&bad[..]).read_compact_size().is_err());
	}

	#[test]
	fn var_bytes_enforce_maximum() {
		let mut buf = Vec::new();
		buf.emit_var_bytes(&[0u8; 100]).unwrap();
		let err = (&buf[..]).read_var_bytes(80, "sig").unwrap_err();
		assert!(matches!(err, DecodeError::Oversized { field: "sig", len: 100, max: 80 }));
	}

	#[test]
	fn strict_bool() {
		assert!(!(&[0u8][..]).read_bool().unwrap());
		assert!((&[1u8][..]).read_bool().unwrap());
		assert!((&[2u8][..]).read_bool().is_err());
	}
}
