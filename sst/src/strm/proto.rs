//! Stream-layer protocol constants and wire helpers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::debug;

use crate::chan::CHANID_LEN;
use crate::error::Res;
use crate::xdr::{Dec, Enc};

/// Maximum transmission unit for a whole channel packet.
pub const MTU: usize = 1200;

/// Channel framing overhead around a stream packet.
pub const CHAN_OVERHEAD: usize = crate::chan::armor::HDR_LEN + crate::chan::armor::MAC_LEN;

/// Common stream header: sid, type/subtype, window byte.
pub const HDR_MIN: usize = 4;

/// Extended headers for Init/Reply (rsid + 16-bit TSN) and Data (32-bit TSN).
pub const HDR_EXT: usize = 8;

/// Largest Data payload fitting one packet.
pub const MAX_SEG: usize = MTU - CHAN_OVERHEAD - HDR_EXT;

/// Largest Datagram fragment payload fitting one packet.
pub const MAX_DGRAM_SEG: usize = MTU - CHAN_OVERHEAD - HDR_MIN;

/// Datagrams up to this size travel stateless; larger ones fall back to an
/// ephemeral substream.
pub const MAX_STATELESS_DGRAM: usize = MTU * 4;

/// Default per-stream receive buffer.
pub const DEFAULT_RECEIVE_BUFFER: usize = 65536;

/// Default substream admission window.
pub const DEFAULT_SUBSTREAM_WINDOW: u64 = 8;

/// Stream IDs are 16-bit and scoped to one channel direction.
pub type Sid = u16;

/// Stream ID 0 is the channel's root stream on both sides.
pub const SID_ROOT: Sid = 0;

/// Redundant attachment slots per stream per direction.
pub const MAX_ATTACH: usize = 2;

/// In-use SIDs to skip during allocation before detaching a victim.
pub const MAX_SID_SKIP: u16 = 16;

/// Cap on a service negotiation message.
pub const MAX_SERVICE_MSG: usize = 1024;

/// Service message codes.
pub const CONNECT_REQUEST: u32 = 0x101;
pub const CONNECT_REPLY: u32 = 0x201;

/// ConnectReply status values.
pub const REPLY_OK: u32 = 0;
pub const REPLY_NO_SERVICE: u32 = 1;

/// Major packet types (high nibble of the type byte).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketType {
	Init = 0x1,
	Reply = 0x2,
	Data = 0x3,
	Datagram = 0x4,
	Ack = 0x5,
	Reset = 0x6,
	Attach = 0x7,
	Detach = 0x8,
}

impl PacketType {
	pub fn from_wire(v: u8) -> Option<Self> {
		Some(match v {
			0x1 => Self::Init,
			0x2 => Self::Reply,
			0x3 => Self::Data,
			0x4 => Self::Datagram,
			0x5 => Self::Ack,
			0x6 => Self::Reset,
			0x7 => Self::Attach,
			0x8 => Self::Detach,
			_ => return None,
		})
	}
}

// Subtype flags for Init/Reply/Data packets.
pub const DATA_PUSH: u8 = 0x4;
pub const DATA_MESSAGE: u8 = 0x2;
pub const DATA_CLOSE: u8 = 0x1;
pub const DATA_ALL: u8 = 0x7;

// Subtype flags for Datagram packets.
pub const DGRAM_BEGIN: u8 = 0x2;
pub const DGRAM_END: u8 = 0x1;

// Subtype flags for Attach packets.
pub const ATTACH_INIT: u8 = 0x8;
pub const ATTACH_SLOT_MASK: u8 = 0x1;

// Subtype flag for Reset packets: the named SID lives in the sender's
// receive namespace rather than its transmit namespace.
pub const RESET_DIR: u8 = 0x1;

// Window byte layout: flags plus a 5-bit log2 exponent.
pub const WIN_SUBSTREAM: u8 = 0x80;
pub const WIN_INHERIT: u8 = 0x40;
pub const WIN_EXP_MASK: u8 = 0x1F;

/// Encode a window as a 5-bit exponent: the largest power of two at most
/// `n`. Zero (and one) encode as exponent 0, which decodes back to zero —
/// a closed window.
pub fn win_encode(n: u64) -> u8 {
	if n < 2 {
		return 0;
	}
	(63 - n.leading_zeros() as u8).min(WIN_EXP_MASK)
}

pub fn win_decode(exp: u8) -> u64 {
	match exp & WIN_EXP_MASK {
		0 => 0,
		e => 1 << e,
	}
}

/// Decoded common stream header.
#[derive(Clone, Copy, Debug)]
pub struct Hdr {
	pub sid: Sid,
	pub ty: PacketType,
	pub sub: u8,
	pub win: u8,
}

pub fn put_hdr(buf: &mut BytesMut, sid: Sid, ty: PacketType, sub: u8, win: u8) {
	buf.put_u16(sid);
	buf.put_u8((ty as u8) << 4 | (sub & 0xF));
	buf.put_u8(win);
}

pub fn get_hdr(buf: &mut Bytes) -> Res<Hdr> {
	if buf.len() < HDR_MIN {
		debug!("Stream packet shorter than its header");
		return Err(());
	}

	let sid = buf.get_u16();
	let ty = buf.get_u8();
	let win = buf.get_u8();

	let Some(pt) = PacketType::from_wire(ty >> 4) else {
		debug!("Unknown stream packet type {:#x}", ty >> 4);
		return Err(());
	};

	Ok(Hdr { sid, ty: pt, sub: ty & 0xF, win })
}

/// Unique stream identifier: the per-channel stream counter plus the
/// channel-direction id of the channel the stream was first attached on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Usid {
	pub ctr: u64,
	pub chan: [u8; CHANID_LEN],
}

impl Usid {
	pub fn encode(&self, e: &mut Enc) {
		e.u64(self.ctr).opaque(&self.chan);
	}

	pub fn decode(d: &mut Dec) -> Res<Self> {
		Ok(Self { ctr: d.u64()?, chan: d.opaque_fixed()? })
	}
}

/// First message on a connecting top-level stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectRequest {
	pub service: String,
	pub protocol: String,
}

impl ConnectRequest {
	pub fn encode(&self) -> Bytes {
		let mut e = Enc::new();
		e.u32(CONNECT_REQUEST).string(&self.service).string(&self.protocol);
		e.finish()
	}

	pub fn decode(raw: Bytes) -> Res<Self> {
		if raw.len() > MAX_SERVICE_MSG {
			debug!("Oversized service request ({} bytes)", raw.len());
			return Err(());
		}

		let mut d = Dec::new(raw);

		if d.u32()? != CONNECT_REQUEST {
			debug!("First message on connecting stream is not a connect request");
			return Err(());
		}

		Ok(Self {
			service: d.string(MAX_SERVICE_MSG)?,
			protocol: d.string(MAX_SERVICE_MSG)?,
		})
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectReply {
	pub status: u32,
}

impl ConnectReply {
	pub fn encode(&self) -> Bytes {
		let mut e = Enc::new();
		e.u32(CONNECT_REPLY).u32(self.status);
		e.finish()
	}

	pub fn decode(raw: Bytes) -> Res<Self> {
		let mut d = Dec::new(raw);

		if d.u32()? != CONNECT_REPLY {
			debug!("Expected a connect reply");
			return Err(());
		}

		Ok(Self { status: d.u32()? })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn window_encoding() {
		assert_eq!(win_encode(0), 0);
		assert_eq!(win_encode(1), 0);
		assert_eq!(win_decode(win_encode(0)), 0);
		assert_eq!(win_encode(65536), 16);
		assert_eq!(win_decode(16), 65536);
		// Rounds down to a power of two.
		assert_eq!(win_decode(win_encode(100_000)), 65536);
		// Saturates at the 5-bit ceiling.
		assert_eq!(win_encode(u64::MAX), 31);
	}

	#[test]
	fn header_roundtrip() {
		let mut buf = BytesMut::new();
		put_hdr(&mut buf, 42, PacketType::Data, DATA_MESSAGE | DATA_PUSH, 0x90);

		let mut wire = buf.freeze();
		let h = get_hdr(&mut wire).unwrap();
		assert_eq!(h.sid, 42);
		assert_eq!(h.ty, PacketType::Data);
		assert_eq!(h.sub, DATA_MESSAGE | DATA_PUSH);
		assert_eq!(h.win, 0x90);
	}

	#[test]
	fn bad_type_rejected() {
		let mut buf = BytesMut::new();
		buf.put_u16(1);
		buf.put_u8(0xF0);
		buf.put_u8(0);
		assert!(get_hdr(&mut buf.freeze()).is_err());
	}

	#[test]
	fn service_messages_roundtrip() {
		let req = ConnectRequest { service: "shell".into(), protocol: "v1".into() };
		assert_eq!(ConnectRequest::decode(req.encode()).unwrap(), req);

		let rep = ConnectReply { status: REPLY_OK };
		assert_eq!(ConnectReply::decode(rep.encode()).unwrap(), rep);
	}

	#[test]
	fn usid_roundtrip() {
		let u = Usid { ctr: 99, chan: [7; CHANID_LEN] };
		let mut e = Enc::new();
		u.encode(&mut e);
		let mut d = Dec::new(e.finish());
		assert_eq!(Usid::decode(&mut d).unwrap(), u);
	}
}
