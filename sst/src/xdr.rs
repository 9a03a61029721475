//! XDR-style serialization for control messages.
//!
//! All integers are big-endian; opaque fields are length-prefixed and padded
//! to four-byte alignment. Only the subset the negotiation and service
//! protocols need is implemented.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;

use crate::error::Res;

fn pad(n: usize) -> usize {
	(4 - n % 4) % 4
}

/// XDR encoder accumulating into a growable buffer.
#[derive(Default)]
pub struct Enc {
	buf: BytesMut,
}

impl Enc {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn u32(&mut self, v: u32) -> &mut Self {
		self.buf.put_u32(v);
		self
	}

	pub fn u64(&mut self, v: u64) -> &mut Self {
		self.buf.put_u64(v);
		self
	}

	pub fn opaque(&mut self, v: &[u8]) -> &mut Self {
		self.buf.put_u32(v.len() as u32);
		self.buf.put_slice(v);
		self.buf.put_bytes(0, pad(v.len()));
		self
	}

	pub fn string(&mut self, v: &str) -> &mut Self {
		self.opaque(v.as_bytes())
	}

	/// Append raw pre-encoded bytes without a length prefix.
	pub fn raw(&mut self, v: &[u8]) -> &mut Self {
		self.buf.put_slice(v);
		self
	}

	pub fn len(&self) -> usize {
		self.buf.len()
	}

	pub fn as_slice(&self) -> &[u8] {
		&self.buf
	}

	pub fn finish(self) -> Bytes {
		self.buf.freeze()
	}
}

/// XDR decoder over a shared byte slice.
pub struct Dec {
	buf: Bytes,
}

impl Dec {
	pub fn new(buf: Bytes) -> Self {
		Self { buf }
	}

	pub fn remaining(&self) -> usize {
		self.buf.len()
	}

	pub fn u32(&mut self) -> Res<u32> {
		if self.buf.len() < 4 {
			debug!("XDR underrun reading u32");
			return Err(());
		}
		Ok(self.buf.get_u32())
	}

	pub fn u64(&mut self) -> Res<u64> {
		if self.buf.len() < 8 {
			debug!("XDR underrun reading u64");
			return Err(());
		}
		Ok(self.buf.get_u64())
	}

	/// Read a length-prefixed opaque field, rejecting lengths above `max`.
	pub fn opaque(&mut self, max: usize) -> Res<Bytes> {
		let n = self.u32()? as usize;

		if n > max {
			debug!("XDR opaque field of {n} bytes exceeds limit of {max}");
			return Err(());
		}

		if self.buf.len() < n + pad(n) {
			debug!("XDR underrun reading {n}-byte opaque field");
			return Err(());
		}

		let v = self.buf.split_to(n);
		self.buf.advance(pad(n));
		Ok(v)
	}

	pub fn string(&mut self, max: usize) -> Res<String> {
		let v = self.opaque(max)?;
		String::from_utf8(v.to_vec()).map_err(|_| debug!("XDR string field is not valid UTF-8"))
	}

	/// Read an opaque field into a fixed-size array; the wire length must
	/// match exactly.
	pub fn opaque_fixed<const N: usize>(&mut self) -> Res<[u8; N]> {
		let v = self.opaque(N)?;

		if v.len() != N {
			debug!("XDR opaque field is {} bytes, expected {N}", v.len());
			return Err(());
		}

		let mut out = [0u8; N];
		out.copy_from_slice(&v);
		Ok(out)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip_scalars() {
		let mut e = Enc::new();
		e.u32(0x00535354).u64(0xdead_beef_0102_0304).opaque(b"hello").string("sst");
		let wire = e.finish();

		// Opaques are padded to four bytes.
		assert_eq!(wire.len(), 4 + 8 + (4 + 8) + (4 + 4));

		let mut d = Dec::new(wire);
		assert_eq!(d.u32().unwrap(), 0x00535354);
		assert_eq!(d.u64().unwrap(), 0xdead_beef_0102_0304);
		assert_eq!(&d.opaque(64).unwrap()[..], b"hello");
		assert_eq!(d.string(64).unwrap(), "sst");
		assert_eq!(d.remaining(), 0);
	}

	#[test]
	fn opaque_limits() {
		let mut e = Enc::new();
		e.opaque(&[0u8; 300]);
		let mut d = Dec::new(e.finish());
		assert!(d.opaque(256).is_err());
	}

	#[test]
	fn underrun() {
		let mut d = Dec::new(Bytes::from_static(&[0, 0]));
		assert!(d.u32().is_err());
	}
}
