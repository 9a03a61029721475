//! Best-effort datagrams.
//!
//! Small datagrams travel as Datagram packets with Begin/End fragmentation
//! flags, sent back-to-back so fragments occupy consecutive channel
//! sequences. A completed datagram surfaces as an ephemeral, read-only
//! pseudo-stream so the application consumes streamed and datagram delivery
//! through the same interface. A fragment lost on the wire loses the whole
//! datagram; nothing is retransmitted.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use log::debug;

use crate::strm::proto::{DGRAM_BEGIN, DGRAM_END};

/// Received-datagram pseudo-stream: a message that was "written and closed"
/// by the sender in one shot.
pub struct DgramStream {
	payload: Bytes,
	pos: usize,
}

impl DgramStream {
	pub fn new(payload: Bytes) -> Self {
		Self { payload, pos: 0 }
	}

	pub fn size(&self) -> usize {
		self.payload.len()
	}

	pub fn remaining(&self) -> usize {
		self.payload.len() - self.pos
	}

	pub fn at_end(&self) -> bool {
		self.pos >= self.payload.len()
	}

	pub fn read_bytes(&mut self, max: usize) -> Bytes {
		let n = self.remaining().min(max);
		let out = self.payload.slice(self.pos..self.pos + n);
		self.pos += n;
		out
	}

	/// The whole remaining payload as one message.
	pub fn read_message(&mut self) -> Option<Bytes> {
		if self.at_end() {
			return None;
		}
		let out = self.payload.slice(self.pos..);
		self.pos = self.payload.len();
		Some(out)
	}
}

/// Per-stream reassembly of fragmented datagrams, keyed by the channel
/// sequence numbers the fragments arrived on.
#[derive(Default)]
pub struct Reassembly {
	frags: BTreeMap<u64, (u8, Bytes)>,
}

/// Bound on buffered fragments per stream; beyond it the oldest are shed.
const MAX_FRAGS: usize = 64;

impl Reassembly {
	/// Add one fragment; returns a completed datagram when the consecutive
	/// Begin..End chain closes.
	pub fn add(&mut self, pktseq: u64, flags: u8, data: Bytes) -> Option<Bytes> {
		self.frags.insert(pktseq, (flags, data));

		while self.frags.len() > MAX_FRAGS {
			let (&oldest, _) = self.frags.first_key_value().expect("nonempty");
			self.frags.remove(&oldest);
			debug!("Dropped stale datagram fragment at sequence {oldest}");
		}

		// Fragments are transmitted on consecutive channel sequences, so a
		// complete datagram is an unbroken run from a Begin to an End.
		let (&end, &(eflags, _)) = self.frags.last_key_value()?;
		if eflags & DGRAM_END == 0 {
			return None;
		}

		let mut begin = end;
		loop {
			let (flags, _) = self.frags.get(&begin)?;
			if flags & DGRAM_BEGIN != 0 {
				break;
			}
			begin = begin.checked_sub(1)?;
		}

		let mut out = BytesMut::new();
		for seq in begin..=end {
			let (_, data) = self.frags.remove(&seq).expect("fragment chain is complete");
			out.extend_from_slice(&data);
		}

		// Anything older belonged to a datagram that can no longer
		// complete.
		self.frags.retain(|&seq, _| seq > end);

		Some(out.freeze())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_packet_datagram() {
		let mut r = Reassembly::default();
		let got = r.add(10, DGRAM_BEGIN | DGRAM_END, Bytes::from_static(b"dgram"));
		assert_eq!(got.as_deref(), Some(&b"dgram"[..]));
	}

	#[test]
	fn fragments_reassemble_in_any_arrival_order() {
		let mut r = Reassembly::default();

		assert!(r.add(11, 0, Bytes::from_static(b"bb")).is_none());
		assert!(r.add(12, DGRAM_END, Bytes::from_static(b"cc")).is_none());
		let got = r.add(10, DGRAM_BEGIN, Bytes::from_static(b"aa"));
		assert_eq!(got.as_deref(), Some(&b"aabbcc"[..]));
	}

	#[test]
	fn missing_fragment_loses_the_datagram() {
		let mut r = Reassembly::default();

		assert!(r.add(10, DGRAM_BEGIN, Bytes::from_static(b"aa")).is_none());
		// Fragment 11 lost; a later complete datagram flushes the orphan.
		assert!(r.add(12, DGRAM_END, Bytes::from_static(b"cc")).is_none());

		let got = r.add(20, DGRAM_BEGIN | DGRAM_END, Bytes::from_static(b"fresh"));
		assert_eq!(got.as_deref(), Some(&b"fresh"[..]));
		assert!(r.frags.is_empty() || r.frags.len() <= 2);
	}

	#[test]
	fn pseudo_stream_reads() {
		let mut d = DgramStream::new(Bytes::from_static(b"hello"));

		assert_eq!(&d.read_bytes(2)[..], b"he");
		assert!(!d.at_end());
		assert_eq!(d.read_message().as_deref(), Some(&b"llo"[..]));
		assert!(d.at_end());
		assert!(d.read_message().is_none());
	}
}
