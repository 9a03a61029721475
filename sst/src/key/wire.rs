//! Key negotiation message formats.
//!
//! Negotiation traffic rides on control datagrams: a 32-bit magic followed
//! by a counted array of length-delimited chunks, each tagged with a 32-bit
//! type. Unknown chunk types are skipped, which is how the out-of-scope
//! lightweight checksum negotiation coexists on the wire.

use bytes::Bytes;
use log::debug;

use crate::error::Res;
use crate::sock::MAGIC_SST;
use crate::xdr::{Dec, Enc};

pub const CHUNK_PACKET: u32 = 0x0001;
pub const CHUNK_CHECKSUM_INIT: u32 = 0x0011;
pub const CHUNK_CHECKSUM_RESPONSE: u32 = 0x0012;
pub const CHUNK_DH_I1: u32 = 0x0021;
pub const CHUNK_DH_R1: u32 = 0x0022;
pub const CHUNK_DH_I2: u32 = 0x0023;
pub const CHUNK_DH_R2: u32 = 0x0024;

/// Wire cap on a DH public key (sized for the legacy MODP groups).
pub const DH_MAX: usize = 384;

/// Wire cap on the responder's challenge cookie.
pub const COOKIE_MAX: usize = 256;

/// Wire cap on an encrypted identity block.
pub const IDENT_MAX: usize = 2048;

/// Truncated HMAC carried by I2/R2.
pub const MAC_LEN: usize = 16;

/// Diffie-Hellman groups. The MODP identifiers are recognized for wire
/// compatibility; only Curve25519 is negotiated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyGroup {
	Modp1024 = 1,
	Modp2048 = 2,
	Modp3072 = 3,
	X25519 = 4,
}

impl KeyGroup {
	pub fn from_wire(v: u32) -> Option<Self> {
		Some(match v {
			1 => Self::Modp1024,
			2 => Self::Modp2048,
			3 => Self::Modp3072,
			4 => Self::X25519,
			_ => return None,
		})
	}

	pub fn supported(self) -> bool {
		self == Self::X25519
	}
}

/// First initiator message: hashed nonce and DH parameters, optionally
/// naming the responder EID being sought.
#[derive(Clone, Debug, PartialEq)]
pub struct I1 {
	pub group: u32,
	pub keymin: u32,
	pub nhi: [u8; 32],
	pub dh_i: Bytes,
	pub target: Bytes,
}

/// Stateless responder challenge. The optional identity fields support the
/// variant where the responder identifies itself early; this implementation
/// leaves them empty and identifies itself in R2.
#[derive(Clone, Debug, PartialEq)]
pub struct R1 {
	pub group: u32,
	pub keymin: u32,
	pub nhi: [u8; 32],
	pub nr: [u8; 32],
	pub dh_r: Bytes,
	pub cookie: Bytes,
	pub eid_r: Bytes,
	pub pk_r: Bytes,
	pub sig_r: Bytes,
}

/// Second initiator message: echoes the challenge and carries the encrypted
/// initiator identity. `raw` is the chunk body as received, for MAC
/// verification; `mac` covers every body byte before the mac field itself.
#[derive(Clone, Debug, PartialEq)]
pub struct I2 {
	pub group: u32,
	pub keymin: u32,
	pub ni: [u8; 32],
	pub nr: [u8; 32],
	pub dh_i: Bytes,
	pub dh_r: Bytes,
	pub cookie: Bytes,
	pub ident: Bytes,
	pub mac: [u8; MAC_LEN],
	pub raw: Bytes,
}

/// Final responder message carrying the encrypted responder identity.
#[derive(Clone, Debug, PartialEq)]
pub struct R2 {
	pub nhi: [u8; 32],
	pub ident: Bytes,
	pub mac: [u8; MAC_LEN],
	pub raw: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Chunk {
	I1(I1),
	R1(R1),
	I2(I2),
	R2(R2),
}

/// Bytes of a chunk body covered by its trailing MAC field: everything up
/// to the MAC opaque (4-byte length prefix plus the 16-byte value).
pub fn mac_covered(raw: &Bytes) -> &[u8] {
	&raw[..raw.len().saturating_sub(4 + MAC_LEN)]
}

fn enc_chunk(out: &mut Enc, body: Enc) {
	out.opaque(body.as_slice());
}

pub fn encode_i1(m: &I1) -> Enc {
	let mut e = Enc::new();
	e.u32(CHUNK_DH_I1)
		.u32(m.group)
		.u32(m.keymin)
		.opaque(&m.nhi)
		.opaque(&m.dh_i)
		.opaque(&m.target);
	e
}

pub fn encode_r1(m: &R1) -> Enc {
	let mut e = Enc::new();
	e.u32(CHUNK_DH_R1)
		.u32(m.group)
		.u32(m.keymin)
		.opaque(&m.nhi)
		.opaque(&m.nr)
		.opaque(&m.dh_r)
		.opaque(&m.cookie)
		.opaque(&m.eid_r)
		.opaque(&m.pk_r)
		.opaque(&m.sig_r);
	e
}

/// Encode I2 without its MAC; the caller computes the MAC over the result
/// and appends it with `finish_mac`.
pub fn encode_i2_unmacced(m: &I2) -> Enc {
	let mut e = Enc::new();
	e.u32(CHUNK_DH_I2)
		.u32(m.group)
		.u32(m.keymin)
		.opaque(&m.ni)
		.opaque(&m.nr)
		.opaque(&m.dh_i)
		.opaque(&m.dh_r)
		.opaque(&m.cookie)
		.opaque(&m.ident);
	e
}

pub fn encode_r2_unmacced(m: &R2) -> Enc {
	let mut e = Enc::new();
	e.u32(CHUNK_DH_R2).opaque(&m.nhi).opaque(&m.ident);
	e
}

pub fn finish_mac(mut body: Enc, mac: [u8; MAC_LEN]) -> Enc {
	body.opaque(&mac);
	body
}

/// Wrap encoded chunk bodies into a complete control message.
pub fn encode_message(chunks: Vec<Enc>) -> Bytes {
	let mut e = Enc::new();
	e.u32(MAGIC_SST).u32(chunks.len() as u32);
	for c in chunks {
		enc_chunk(&mut e, c);
	}
	e.finish()
}

fn dec_i1(d: &mut Dec) -> Res<I1> {
	Ok(I1 {
		group: d.u32()?,
		keymin: d.u32()?,
		nhi: d.opaque_fixed()?,
		dh_i: d.opaque(DH_MAX)?,
		target: d.opaque(crate::ident::EID_MAX)?,
	})
}

fn dec_r1(d: &mut Dec) -> Res<R1> {
	Ok(R1 {
		group: d.u32()?,
		keymin: d.u32()?,
		nhi: d.opaque_fixed()?,
		nr: d.opaque_fixed()?,
		dh_r: d.opaque(DH_MAX)?,
		cookie: d.opaque(COOKIE_MAX)?,
		eid_r: d.opaque(crate::ident::EID_MAX)?,
		pk_r: d.opaque(IDENT_MAX)?,
		sig_r: d.opaque(IDENT_MAX)?,
	})
}

fn dec_i2(d: &mut Dec, raw: Bytes) -> Res<I2> {
	Ok(I2 {
		group: d.u32()?,
		keymin: d.u32()?,
		ni: d.opaque_fixed()?,
		nr: d.opaque_fixed()?,
		dh_i: d.opaque(DH_MAX)?,
		dh_r: d.opaque(DH_MAX)?,
		cookie: d.opaque(COOKIE_MAX)?,
		ident: d.opaque(IDENT_MAX)?,
		mac: d.opaque_fixed()?,
		raw,
	})
}

fn dec_r2(d: &mut Dec, raw: Bytes) -> Res<R2> {
	Ok(R2 {
		nhi: d.opaque_fixed()?,
		ident: d.opaque(IDENT_MAX)?,
		mac: d.opaque_fixed()?,
		raw,
	})
}

/// Parse a control message into its recognized negotiation chunks. The
/// caller has already consumed and checked the magic.
pub fn decode_message(msg: Bytes) -> Res<Vec<Chunk>> {
	let mut d = Dec::new(msg);

	let magic = d.u32()?;
	if magic != MAGIC_SST {
		debug!("Key message with wrong magic {magic:#010x}");
		return Err(());
	}

	let count = d.u32()?;
	if count > 8 {
		debug!("Key message with implausible chunk count {count}");
		return Err(());
	}

	let mut chunks = Vec::new();

	for _ in 0..count {
		let body = d.opaque(4096)?;
		let raw = body.clone();
		let mut cd = Dec::new(body);

		let ty = cd.u32()?;
		let chunk = match ty {
			CHUNK_DH_I1 => Chunk::I1(dec_i1(&mut cd)?),
			CHUNK_DH_R1 => Chunk::R1(dec_r1(&mut cd)?),
			CHUNK_DH_I2 => Chunk::I2(dec_i2(&mut cd, raw)?),
			CHUNK_DH_R2 => Chunk::R2(dec_r2(&mut cd, raw)?),
			CHUNK_PACKET | CHUNK_CHECKSUM_INIT | CHUNK_CHECKSUM_RESPONSE => {
				// Recognized but not negotiated here.
				continue;
			}
			other => {
				debug!("Skipping unknown key chunk type {other:#06x}");
				continue;
			}
		};

		chunks.push(chunk);
	}

	Ok(chunks)
}

/// Identity block carried encrypted inside I2 and R2.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentBlock {
	/// Sender's local channel number for the new channel.
	pub chan: u8,
	pub eid: Bytes,
	pub public_key: Bytes,
	pub signature: Bytes,
	/// Upper-layer payload, carried verbatim.
	pub ulp: Bytes,
}

impl IdentBlock {
	pub fn encode(&self) -> Bytes {
		let mut e = Enc::new();
		e.u32(u32::from(self.chan))
			.opaque(&self.eid)
			.opaque(&self.public_key)
			.opaque(&self.signature)
			.opaque(&self.ulp);
		e.finish()
	}

	pub fn decode(raw: Bytes) -> Res<Self> {
		let mut d = Dec::new(raw);

		let chan = d.u32()?;
		if chan == 0 || chan > u32::from(u8::MAX) {
			debug!("Identity block names invalid channel number {chan}");
			return Err(());
		}

		Ok(Self {
			chan: chan as u8,
			eid: d.opaque(crate::ident::EID_MAX)?,
			public_key: d.opaque(IDENT_MAX)?,
			signature: d.opaque(IDENT_MAX)?,
			ulp: d.opaque(IDENT_MAX)?,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_i1() -> I1 {
		I1 {
			group: KeyGroup::X25519 as u32,
			keymin: 16,
			nhi: [0xAB; 32],
			dh_i: Bytes::from_static(&[1; 32]),
			target: Bytes::new(),
		}
	}

	#[test]
	fn i1_roundtrip_is_byte_identical() {
		let m = sample_i1();

		let a = encode_message(vec![encode_i1(&m)]);
		let b = encode_message(vec![encode_i1(&m)]);
		assert_eq!(a, b);

		match decode_message(a).unwrap().as_slice() {
			[Chunk::I1(got)] => assert_eq!(*got, m),
			other => panic!("unexpected chunks: {other:?}"),
		}
	}

	#[test]
	fn i2_mac_region_excludes_mac() {
		let m = I2 {
			group: KeyGroup::X25519 as u32,
			keymin: 32,
			ni: [1; 32],
			nr: [2; 32],
			dh_i: Bytes::from_static(&[3; 32]),
			dh_r: Bytes::from_static(&[4; 32]),
			cookie: Bytes::from_static(&[5; 16]),
			ident: Bytes::from_static(b"identity-block"),
			mac: [9; MAC_LEN],
			raw: Bytes::new(),
		};

		let body = finish_mac(encode_i2_unmacced(&m), m.mac);
		let msg = encode_message(vec![body]);

		match decode_message(msg).unwrap().as_slice() {
			[Chunk::I2(got)] => {
				assert_eq!(got.mac, m.mac);
				assert_eq!(got.ni, m.ni);
				// The covered region ends exactly where the MAC field begins.
				let covered = mac_covered(&got.raw);
				assert_eq!(covered.len(), got.raw.len() - 20);
				assert_eq!(&covered[..4], &CHUNK_DH_I2.to_be_bytes());
			}
			other => panic!("unexpected chunks: {other:?}"),
		}
	}

	#[test]
	fn unknown_chunks_are_skipped() {
		let mut unknown = Enc::new();
		unknown.u32(0x7777).u32(5);

		let msg = encode_message(vec![unknown, encode_i1(&sample_i1())]);
		let chunks = decode_message(msg).unwrap();
		assert_eq!(chunks.len(), 1);
	}

	#[test]
	fn ident_block_roundtrip() {
		let b = IdentBlock {
			chan: 7,
			eid: Bytes::from_static(&[0x78, 1, 2, 3]),
			public_key: Bytes::from_static(&[9; 32]),
			signature: Bytes::from_static(&[8; 64]),
			ulp: Bytes::new(),
		};

		assert_eq!(IdentBlock::decode(b.encode()).unwrap(), b);
	}

	#[test]
	fn unsupported_groups_are_recognized() {
		assert_eq!(KeyGroup::from_wire(2), Some(KeyGroup::Modp2048));
		assert!(!KeyGroup::Modp2048.supported());
		assert!(KeyGroup::X25519.supported());
		assert_eq!(KeyGroup::from_wire(9), None);
	}
}
