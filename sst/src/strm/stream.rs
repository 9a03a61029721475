//! Per-stream state: reliable byte/message transmit and receive machinery,
//! flow control, and the attachment slots binding the stream to channels.
//!
//! Streams are held in the host's stream table and referenced everywhere by
//! table index; the state here is pure bookkeeping, with packet building
//! and delivery driven by the multiplexer.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use log::debug;

use crate::chan::seq::reconstruct;
use crate::ident::Eid;
use crate::strm::proto::{self, Sid, Usid, DATA_CLOSE, DATA_MESSAGE, MAX_ATTACH, MAX_SEG};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamState {
	/// Created, not yet announced to the peer.
	Fresh,
	/// Initiated; waiting for the service reply.
	WaitService,
	/// Accepted; waiting for the service request.
	Accepting,
	Connected,
	/// Terminal.
	Disconnected,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownMode {
	Read,
	Write,
	Close,
	Reset,
}

/// Which packet announces a transmit binding to the peer.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum AttachKind {
	/// First announcement of a brand-new stream.
	#[default]
	Init,
	/// Reverse binding answering a peer's Init.
	Reply,
	/// Rebinding of a known stream, identified by USID.
	Attach,
}

/// A transmit attachment slot: this stream's binding to one channel in our
/// own SID namespace.
#[derive(Clone, Copy, Default, Debug)]
pub struct TxAttach {
	pub chan: Option<usize>,
	pub sid: Sid,
	/// Channel sequence our binding packet was assigned; `u64::MAX` while
	/// the binding is still unacknowledged.
	pub sidseq: u64,
	pub active: bool,
	pub deprecated: bool,
	/// An Init/Reply/Attach packet needs (re)sending for this slot.
	pub want_send: bool,
	pub kind: AttachKind,
	/// For Reply bindings: the peer's SID being answered.
	pub peer_sid: Sid,
}

impl TxAttach {
	pub fn in_use(&self) -> bool {
		self.chan.is_some()
	}

	pub fn clear(&mut self) {
		*self = Self::default();
	}
}

/// A receive attachment: the peer's binding for this stream in its SID
/// namespace, with the packet sequence that installed it.
#[derive(Clone, Copy, Default, Debug)]
pub struct RxAttach {
	pub chan: Option<usize>,
	pub sid: Sid,
	pub sidseq: u64,
}

impl RxAttach {
	pub fn in_use(&self) -> bool {
		self.chan.is_some()
	}

	pub fn clear(&mut self) {
		*self = Self::default();
	}
}

/// One queued or in-flight transmit segment.
#[derive(Clone, Debug)]
pub struct TxSeg {
	pub tsn: u64,
	pub data: Bytes,
	pub flags: u8,
	pub retransmit: bool,
}

#[derive(Clone, Debug)]
pub struct RxSeg {
	pub data: Bytes,
	pub flags: u8,
}

/// What an in-order data delivery produced, for event generation.
#[derive(Default, Debug)]
pub struct RxOutcome {
	/// Whether the packet counts as processed (and may be acked). Refused
	/// packets are retransmitted by the peer.
	pub accepted: bool,
	pub new_bytes: u64,
	pub new_msgs: usize,
	pub closed: bool,
}

pub struct Stream {
	pub peer: Eid,
	pub usid: Option<Usid>,
	pub pusid: Option<Usid>,
	pub parent: Option<usize>,
	pub state: StreamState,
	pub top_level: bool,
	pub is_root: bool,

	pub tatt: [TxAttach; MAX_ATTACH],
	pub ratt: [RxAttach; MAX_ATTACH],

	// Byte transmit state.
	pub tasn: u64,
	pub init_tsn: u16,
	pub twin: u64,
	pub tflt: u64,
	pub tqueue: VecDeque<TxSeg>,
	pub tqueued: u64,
	pub twait: BTreeMap<u64, TxSeg>,
	pub endwrite: bool,
	pub close_queued: bool,
	/// Channel whose round-robin transmit queue we are on, if any.
	pub on_txq: Option<usize>,
	pub wblocked: bool,

	// Substream transmit state.
	pub tswin: u64,
	pub tsflt: u64,
	pub wait_children: VecDeque<usize>,

	// Byte receive state.
	pub rsn: u64,
	/// The peer's initial TSN has been learned (from its Init or Reply).
	pub rsn_init: bool,
	pub rahead: BTreeMap<u64, RxSeg>,
	pub rsegs: VecDeque<Bytes>,
	pub ravail: u64,
	pub rmsgs: VecDeque<u64>,
	partial_msg: u64,
	pub rbuf: u64,
	pub rbufused: u64,
	pub advertised: u8,
	pub win_dirty: bool,
	pub got_close: bool,
	pub endread: bool,
	pub reset_reason: Option<&'static str>,

	// Substream receive state.
	pub rsubs: VecDeque<usize>,
	pub rdgrams: VecDeque<usize>,
	pub crbuf: u64,
	pub rswin: u64,
}

impl Stream {
	pub fn new(peer: Eid, parent: Option<usize>, rbuf: u64, crbuf: u64) -> Self {
		Self {
			peer,
			usid: None,
			pusid: None,
			parent,
			state: StreamState::Fresh,
			top_level: false,
			is_root: false,
			tatt: Default::default(),
			ratt: Default::default(),
			tasn: 0,
			init_tsn: 0,
			// Assume the default window until the peer advertises one.
			twin: proto::DEFAULT_RECEIVE_BUFFER as u64,
			tflt: 0,
			tqueue: VecDeque::new(),
			tqueued: 0,
			twait: BTreeMap::new(),
			endwrite: false,
			close_queued: false,
			on_txq: None,
			wblocked: false,
			tswin: proto::DEFAULT_SUBSTREAM_WINDOW,
			tsflt: 0,
			wait_children: VecDeque::new(),
			rsn: 0,
			rsn_init: false,
			rahead: BTreeMap::new(),
			rsegs: VecDeque::new(),
			ravail: 0,
			rmsgs: VecDeque::new(),
			partial_msg: 0,
			rbuf,
			rbufused: 0,
			advertised: proto::win_encode(rbuf),
			win_dirty: false,
			got_close: false,
			endread: false,
			reset_reason: None,
			rsubs: VecDeque::new(),
			rdgrams: VecDeque::new(),
			crbuf,
			rswin: proto::DEFAULT_SUBSTREAM_WINDOW,
		}
	}

	/// Set the randomized initial transmit sequence; the byte counter
	/// starts there.
	pub fn set_init_tsn(&mut self, tsn: u16) {
		self.init_tsn = tsn;
		self.tasn = u64::from(tsn);
	}

	// ----- attachments -----

	/// The transmit slot bound to `chan`, if any.
	pub fn tx_slot_on(&self, chan: usize) -> Option<usize> {
		self.tatt.iter().position(|a| a.chan == Some(chan))
	}

	/// A slot usable for transmission: an attached, non-deprecated slot
	/// whose binding has at least been sent.
	pub fn tx_slot_usable(&self) -> Option<(usize, usize)> {
		self.tatt
			.iter()
			.enumerate()
			.filter(|(_, a)| a.in_use() && !a.deprecated && !a.want_send)
			.max_by_key(|(_, a)| a.active)
			.map(|(i, a)| (i, a.chan.expect("slot in use")))
	}

	/// Pick a free slot for a new attachment, deprecating the stalest one
	/// when both are taken.
	pub fn alloc_tx_slot(&mut self) -> usize {
		if let Some(i) = self.tatt.iter().position(|a| !a.in_use()) {
			return i;
		}

		let i = self.tatt.iter().position(|a| a.deprecated).unwrap_or(0);
		self.tatt[i].clear();
		i
	}

	pub fn alloc_rx_slot(&mut self) -> usize {
		if let Some(i) = self.ratt.iter().position(|a| !a.in_use()) {
			return i;
		}

		self.ratt[0].clear();
		0
	}

	pub fn attached_anywhere(&self) -> bool {
		self.tatt.iter().any(|a| a.in_use())
	}

	// ----- transmit -----

	/// Bytes a writer may hand us right now without exceeding the peer's
	/// advertised window.
	pub fn write_capacity(&self) -> u64 {
		self.twin.saturating_sub(self.tflt + self.tqueued)
	}

	/// Segment and queue up to `cap` bytes, setting `endflags` on the last
	/// segment. Returns the byte count accepted.
	pub fn enqueue(&mut self, data: &[u8], endflags: u8) -> usize {
		let want = data.len();
		let cap = self.write_capacity().min(want as u64) as usize;

		if cap < want {
			self.wblocked = true;
		}

		let data = &data[..cap];
		if data.is_empty() && endflags == 0 {
			return 0;
		}

		let mut off = 0;
		loop {
			let n = (data.len() - off).min(MAX_SEG);
			let last = off + n == data.len();

			self.tqueue.push_back(TxSeg {
				tsn: self.tasn,
				data: Bytes::copy_from_slice(&data[off..off + n]),
				flags: if last { endflags } else { 0 },
				retransmit: false,
			});

			self.tasn += n as u64;
			self.tqueued += n as u64;
			off += n;

			if last {
				break;
			}
		}

		if self.write_capacity() == 0 {
			self.wblocked = true;
		}

		cap
	}

	/// Queue the end-of-stream marker.
	pub fn enqueue_close(&mut self) {
		if self.close_queued {
			return;
		}
		self.close_queued = true;

		match self.tqueue.back_mut() {
			Some(seg) if !seg.retransmit => seg.flags |= DATA_CLOSE,
			_ => self.tqueue.push_back(TxSeg {
				tsn: self.tasn,
				data: Bytes::new(),
				flags: DATA_CLOSE,
				retransmit: false,
			}),
		}
	}

	/// Take the next transmittable segment, honoring the peer's window.
	/// Retransmits bypass the window check (their bytes are already counted
	/// in flight) and are dropped if the original was acked meanwhile.
	pub fn pop_segment(&mut self) -> Option<TxSeg> {
		loop {
			let seg = self.tqueue.front()?;

			if seg.retransmit {
				let seg = self.tqueue.pop_front().expect("front exists");
				if self.twait.contains_key(&seg.tsn) {
					return Some(seg);
				}
				continue;
			}

			let len = seg.data.len() as u64;
			if self.tflt + len > self.twin {
				self.wblocked = true;
				return None;
			}

			let seg = self.tqueue.pop_front().expect("front exists");
			self.tqueued -= len;
			self.tflt += len;
			self.twait.insert(seg.tsn, seg.clone());
			return Some(seg);
		}
	}

	/// A queued segment is ready and allowed out.
	pub fn has_sendable(&self) -> bool {
		match self.tqueue.front() {
			Some(seg) if seg.retransmit => true,
			Some(seg) => self.tflt + seg.data.len() as u64 <= self.twin,
			None => false,
		}
	}

	/// The channel acknowledged a data segment. Returns true when this
	/// unblocked a writer.
	pub fn tx_acked(&mut self, tsn: u64, len: u32) -> bool {
		if self.twait.remove(&tsn).is_none() {
			// A duplicate ack for a retransmitted copy.
			return false;
		}

		self.tflt = self.tflt.saturating_sub(u64::from(len));

		if self.wblocked && self.write_capacity() > 0 {
			self.wblocked = false;
			return true;
		}
		false
	}

	/// The channel declared a data segment lost: requeue it at the front
	/// for prompt retransmission, possibly on a different channel.
	pub fn tx_missed(&mut self, tsn: u64) {
		if let Some(seg) = self.twait.get(&tsn) {
			let mut seg = seg.clone();
			seg.retransmit = true;
			self.tqueue.push_front(seg);
		}
	}

	/// Everything written has been delivered and acknowledged.
	pub fn flushed(&self) -> bool {
		self.tqueue.is_empty() && self.twait.is_empty()
	}

	// ----- receive -----

	/// Accept a data segment with reconstructed byte sequence `tsn`.
	pub fn rx_data(&mut self, tsn32: u32, data: Bytes, flags: u8) -> RxOutcome {
		let mut out = RxOutcome { accepted: true, ..Default::default() };

		if self.endread || self.state == StreamState::Disconnected {
			// Reader is gone; consume and discard.
			return out;
		}

		let mut tsn = reconstruct(self.rsn, u64::from(tsn32), 32);
		let mut data = data;

		// Trim any overlap with already-delivered bytes.
		if tsn < self.rsn {
			let dup = self.rsn - tsn;
			if dup >= data.len() as u64 {
				// Full duplicate; flags were handled the first time around.
				return out;
			}
			data = data.slice(dup as usize..);
			tsn = self.rsn;
		}

		if self.rbufused + data.len() as u64 > self.rbuf {
			debug!("Receive buffer full, refusing segment at {tsn}");
			out.accepted = false;
			return out;
		}

		if tsn > self.rsn {
			// Out of order: park it until the hole fills.
			if !self.rahead.contains_key(&tsn) {
				self.rbufused += data.len() as u64;
				self.rahead.insert(tsn, RxSeg { data, flags });
			}
			return out;
		}

		self.deliver(data, flags, &mut out);

		// Drain anything that became contiguous.
		while let Some((&atsn, _)) = self.rahead.first_key_value() {
			if atsn > self.rsn {
				break;
			}

			let seg = self.rahead.remove(&atsn).expect("first key exists");
			self.rbufused = self.rbufused.saturating_sub(seg.data.len() as u64);

			let dup = self.rsn - atsn;
			if dup >= seg.data.len() as u64 {
				continue;
			}

			self.deliver(seg.data.slice(dup as usize..), seg.flags, &mut out);
		}

		out
	}

	fn deliver(&mut self, data: Bytes, flags: u8, out: &mut RxOutcome) {
		let n = data.len() as u64;

		self.rsn += n;
		self.ravail += n;
		self.rbufused += n;
		out.new_bytes += n;

		if !data.is_empty() {
			self.rsegs.push_back(data);
		}

		if flags & DATA_MESSAGE != 0 {
			self.rmsgs.push_back(self.partial_msg + n);
			self.partial_msg = 0;
			out.new_msgs += 1;
		} else {
			self.partial_msg += n;
		}

		if flags & DATA_CLOSE != 0 {
			// End of stream: close the final (possibly unmarked) record.
			if flags & DATA_MESSAGE == 0 && self.partial_msg > 0 {
				self.rmsgs.push_back(self.partial_msg);
				self.partial_msg = 0;
				out.new_msgs += 1;
			}
			self.got_close = true;
			out.closed = true;
		}
	}

	pub fn at_end(&self) -> bool {
		(self.got_close && self.ravail == 0) || self.endread
	}

	pub fn bytes_available(&self) -> u64 {
		self.ravail
	}

	pub fn pending_messages(&self) -> usize {
		self.rmsgs.len()
	}

	/// Byte-oriented read across message boundaries.
	pub fn read_bytes(&mut self, max: usize) -> Bytes {
		let mut out = Vec::new();

		while out.len() < max {
			let Some(front) = self.rsegs.front_mut() else { break };

			let take = (max - out.len()).min(front.len());
			out.extend_from_slice(&front.split_to(take));

			if front.is_empty() {
				self.rsegs.pop_front();
			}

			self.consume_records(take as u64);
		}

		self.ravail -= out.len() as u64;
		self.rbufused = self.rbufused.saturating_sub(out.len() as u64);
		self.after_drain();

		Bytes::from(out)
	}

	/// Pop the next complete message record.
	pub fn read_message(&mut self) -> Option<Bytes> {
		let size = *self.rmsgs.front()? as usize;

		let mut out = Vec::with_capacity(size);
		while out.len() < size {
			let front = self.rsegs.front_mut().expect("record bytes are buffered");

			let take = (size - out.len()).min(front.len());
			out.extend_from_slice(&front.split_to(take));

			if front.is_empty() {
				self.rsegs.pop_front();
			}
		}

		self.rmsgs.pop_front();
		self.ravail -= size as u64;
		self.rbufused = self.rbufused.saturating_sub(size as u64);
		self.after_drain();

		Some(Bytes::from(out))
	}

	/// Adjust message-record accounting after a byte-oriented read.
	fn consume_records(&mut self, mut n: u64) {
		while n > 0 {
			match self.rmsgs.front_mut() {
				Some(front) => {
					let take = n.min(*front);
					*front -= take;
					n -= take;
					if *front == 0 {
						self.rmsgs.pop_front();
					}
				}
				None => {
					self.partial_msg = self.partial_msg.saturating_sub(n);
					break;
				}
			}
		}
	}

	fn after_drain(&mut self) {
		// Advertise a bigger window once the application has drained a
		// meaningful share of the buffer.
		let exp = self.window_exp();
		if exp > self.advertised && proto::win_decode(exp) - proto::win_decode(self.advertised) >= self.rbuf / 4 {
			self.win_dirty = true;
		}
	}

	fn window_exp(&self) -> u8 {
		if self.endread {
			return 0;
		}
		proto::win_encode(self.rbuf.saturating_sub(self.rbufused))
	}

	/// The window byte to piggyback on the next outgoing packet.
	pub fn window_byte(&mut self) -> u8 {
		let exp = self.window_exp();
		self.advertised = exp;
		self.win_dirty = false;
		exp
	}

	/// The substream-admission window byte.
	pub fn swindow_byte(&self) -> u8 {
		proto::WIN_SUBSTREAM | proto::win_encode(self.rswin.saturating_sub(self.rsubs.len() as u64))
	}

	/// Apply a window byte received from the peer. Returns true when a
	/// blocked writer or substream opener may proceed again.
	pub fn apply_window(&mut self, win: u8) -> bool {
		if win & proto::WIN_INHERIT != 0 {
			return false;
		}

		let val = proto::win_decode(win);

		if win & proto::WIN_SUBSTREAM != 0 {
			self.tswin = val;
			self.tswin > self.tsflt && !self.wait_children.is_empty()
		} else {
			self.twin = val;
			self.wblocked && self.write_capacity() > 0
		}
	}

	// ----- shutdown -----

	pub fn shutdown_read(&mut self) {
		self.endread = true;
		self.rsegs.clear();
		self.rahead.clear();
		self.rmsgs.clear();
		self.ravail = 0;
		self.rbufused = 0;
		self.partial_msg = 0;
	}

	pub fn shutdown_write(&mut self) {
		if !self.endwrite {
			self.endwrite = true;
			self.enqueue_close();
		}
	}

	/// Abortive local disconnect; buffered data is dropped.
	pub fn disconnect(&mut self, reason: &'static str) {
		self.state = StreamState::Disconnected;
		self.reset_reason = Some(reason);
		self.tqueue.clear();
		self.twait.clear();
		self.tqueued = 0;
		self.tflt = 0;
		self.endwrite = true;
		self.endread = true;
		for a in &mut self.tatt {
			a.clear();
		}
		for a in &mut self.ratt {
			a.clear();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn stream() -> Stream {
		Stream::new(Eid::default(), None, 65536, 65536)
	}

	#[test]
	fn enqueue_segments_large_writes() {
		let mut s = stream();

		let data = vec![0x55u8; MAX_SEG * 2 + 10];
		assert_eq!(s.enqueue(&data, DATA_MESSAGE), data.len());
		assert_eq!(s.tqueue.len(), 3);
		assert_eq!(s.tqueue[0].data.len(), MAX_SEG);
		assert_eq!(s.tqueue[2].flags, DATA_MESSAGE);
		assert_eq!(s.tqueue[0].flags, 0);

		// Sequential byte numbering.
		assert_eq!(s.tqueue[1].tsn, s.tqueue[0].tsn + MAX_SEG as u64);
	}

	#[test]
	fn window_caps_accepted_bytes() {
		let mut s = stream();
		s.twin = 10;

		assert_eq!(s.enqueue(&[1u8; 64], 0), 10);
		assert!(s.wblocked);
		assert_eq!(s.enqueue(&[1u8; 4], 0), 0);

		// Window opens: exactly that many more bytes are accepted.
		s.apply_window(proto::win_encode(32));
		assert_eq!(s.twin, 32);
		assert_eq!(s.enqueue(&[1u8; 64], 0), 22);
	}

	#[test]
	fn zero_window_blocks_writes() {
		let mut s = stream();
		s.twin = 0;
		assert_eq!(s.enqueue(&[1u8; 4], 0), 0);
		assert!(s.pop_segment().is_none() || s.tqueue.is_empty());
	}

	#[test]
	fn pop_respects_flight_window() {
		let mut s = stream();
		s.twin = 2000;

		s.enqueue(&[1u8; 2000], 0);
		let a = s.pop_segment().unwrap();
		assert_eq!(a.data.len(), MAX_SEG);

		// The peer shrinks the window while the first segment is in flight:
		// the rest has to wait.
		s.apply_window(proto::win_encode(1024));
		assert!(s.pop_segment().is_none());
		assert!(s.wblocked);

		// Acking the first segment frees enough flight budget.
		assert!(s.tx_acked(a.tsn, a.data.len() as u32));
		assert!(s.pop_segment().is_some());
	}

	#[test]
	fn missed_segment_requeues_at_front() {
		let mut s = stream();

		s.enqueue(b"abcdef", 0);
		let seg = s.pop_segment().unwrap();
		s.tx_missed(seg.tsn);

		let again = s.pop_segment().unwrap();
		assert!(again.retransmit);
		assert_eq!(again.data, seg.data);

		// If the original is acked before the retransmit goes out, the
		// queued copy evaporates.
		s.tx_missed(seg.tsn);
		s.tx_acked(seg.tsn, seg.data.len() as u32);
		assert!(s.pop_segment().is_none());
	}

	#[test]
	fn rx_in_order_and_reordered() {
		let mut s = stream();
		s.rsn = 100;

		let out = s.rx_data(100, Bytes::from_static(b"hello "), 0);
		assert!(out.accepted);
		assert_eq!(out.new_bytes, 6);

		// A gap: parked until the hole fills.
		let out = s.rx_data(112, Bytes::from_static(b"!"), DATA_MESSAGE);
		assert_eq!(out.new_bytes, 0);

		let out = s.rx_data(106, Bytes::from_static(b"world "), 0);
		assert_eq!(out.new_bytes, 7);
		assert_eq!(out.new_msgs, 1);

		assert_eq!(&s.read_message().unwrap()[..], b"hello world !");
	}

	#[test]
	fn duplicates_and_overlaps_are_trimmed() {
		let mut s = stream();

		s.rx_data(0, Bytes::from_static(b"abcd"), 0);
		// Exact duplicate.
		let out = s.rx_data(0, Bytes::from_static(b"abcd"), 0);
		assert!(out.accepted);
		assert_eq!(out.new_bytes, 0);

		// Overlapping extension.
		let out = s.rx_data(2, Bytes::from_static(b"cdef"), 0);
		assert_eq!(out.new_bytes, 2);
		assert_eq!(&s.read_bytes(16)[..], b"abcdef");
	}

	#[test]
	fn message_markers_survive_byte_reads() {
		let mut s = stream();

		s.rx_data(0, Bytes::from_static(b"one"), DATA_MESSAGE);
		s.rx_data(3, Bytes::from_static(b"two"), DATA_MESSAGE);
		assert_eq!(s.pending_messages(), 2);

		// Byte-read eats into the first record.
		assert_eq!(&s.read_bytes(2)[..], b"on");
		assert_eq!(s.pending_messages(), 2);
		assert_eq!(&s.read_message().unwrap()[..], b"e");
		assert_eq!(&s.read_message().unwrap()[..], b"two");
	}

	#[test]
	fn close_marks_end_after_delivery() {
		let mut s = stream();

		s.rx_data(0, Bytes::from_static(b"abc"), DATA_CLOSE);
		assert!(!s.at_end());
		assert_eq!(&s.read_message().unwrap()[..], b"abc");
		assert!(s.at_end());
	}

	#[test]
	fn refuses_when_buffer_full() {
		let mut s = Stream::new(Eid::default(), None, 8, 8);

		let out = s.rx_data(0, Bytes::from_static(b"12345678"), 0);
		assert!(out.accepted);

		let out = s.rx_data(8, Bytes::from_static(b"9"), 0);
		assert!(!out.accepted);
	}
}
