//! Stream multiplexing over channels: SID tables, the round-robin transmit
//! pump, the attachment protocol, and receive-side packet dispatch.
//!
//! All functions here operate on the host so they can reach the channel,
//! stream, and peer tables together; cross-references stay index-based.

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Instant;

use hashbrown::HashMap;

use crate::chan::{LinkStatus, StreamTxRec, TxKind, TxRec};
use crate::host::{Event, Host};
use crate::ident::Eid;
use crate::strm::dgram::{DgramStream, Reassembly};
use crate::strm::proto::{
	self, get_hdr, put_hdr, ConnectReply, ConnectRequest, Hdr, PacketType, Sid, Usid, ATTACH_SLOT_MASK, DGRAM_BEGIN,
	DGRAM_END, MAX_DGRAM_SEG, MAX_SID_SKIP, RESET_DIR, REPLY_NO_SERVICE, REPLY_OK, SID_ROOT, WIN_SUBSTREAM,
};
use crate::strm::stream::{AttachKind, RxAttach, Stream, StreamState, TxAttach};
use crate::xdr::{Dec, Enc};

/// Receive-side SID binding: the stream and the packet sequence that
/// installed it, for disambiguating SID reuse.
#[derive(Clone, Copy, Debug)]
pub struct RxBind {
	pub stream: usize,
	pub sidseq: u64,
}

/// Per-channel stream multiplexing state.
pub struct Mux {
	/// The channel's root stream (SID 0 in both directions).
	pub root: usize,
	/// Our SID namespace.
	pub txsids: HashMap<Sid, usize>,
	/// The peer's SID namespace.
	pub rxsids: HashMap<Sid, RxBind>,
	sid_next: Sid,
	/// Stream counters for USID assignment, per direction.
	pub txctr: u64,
	pub rxctr: u64,
	/// Round-robin queue of streams with transmittable work.
	pub tstreams: VecDeque<usize>,
	/// SID of the last received stream packet; bare acks carry its window.
	pub acksid: Sid,
	/// Datagram fragment reassembly per carrier SID.
	pub partial: HashMap<Sid, Reassembly>,
}

impl Mux {
	pub fn new(root: usize) -> Self {
		let mut txsids = HashMap::new();
		txsids.insert(SID_ROOT, root);

		let mut rxsids = HashMap::new();
		rxsids.insert(SID_ROOT, RxBind { stream: root, sidseq: 0 });

		Self {
			root,
			txsids,
			rxsids,
			sid_next: 1,
			txctr: 1,
			rxctr: 0,
			tstreams: VecDeque::new(),
			acksid: SID_ROOT,
			partial: HashMap::new(),
		}
	}

	fn bump_sid(&mut self) -> Sid {
		let sid = self.sid_next;
		self.sid_next = if self.sid_next == Sid::MAX { 1 } else { self.sid_next + 1 };
		sid
	}

	/// Allocate a SID, skipping in-use values up to the limit, then
	/// reclaiming one from its current holder.
	fn alloc_sid(&mut self) -> (Sid, Option<usize>) {
		for _ in 0..MAX_SID_SKIP {
			let sid = self.bump_sid();
			if sid != SID_ROOT && !self.txsids.contains_key(&sid) {
				return (sid, None);
			}
		}

		let sid = self.bump_sid();
		(sid, self.txsids.get(&sid).copied())
	}
}

impl Host {
	// ----- scheduling and attachment -----

	/// Put a stream on a channel's round-robin transmit queue.
	pub(crate) fn schedule_stream(&mut self, cid: usize, idx: usize) {
		let Some(s) = self.stream_mut(idx) else { return };

		if s.on_txq == Some(cid) {
			return;
		}
		// A stale entry on some other channel's queue is skipped when
		// popped; membership is authoritative here.
		s.on_txq = Some(cid);

		if let Some(chan) = self.chans.get_mut(cid) {
			chan.mux.tstreams.push_back(idx);
		}
	}

	/// Begin a transmit attachment of `idx` on channel `cid`.
	pub(crate) fn tattach(&mut self, now: Instant, cid: usize, idx: usize) {
		let Some(s) = self.stream_mut(idx) else { return };

		if s.state == StreamState::Disconnected || s.is_root {
			return;
		}

		if s.tx_slot_on(cid).is_some() {
			if self.stream_has_tx(cid, idx) {
				self.schedule_stream(cid, idx);
				self.pump(now);
			}
			return;
		}

		let kind = if s.usid.is_some() { AttachKind::Attach } else { AttachKind::Init };
		let slot = s.alloc_tx_slot();
		s.tatt[slot] = TxAttach {
			chan: Some(cid),
			sid: 0,
			sidseq: u64::MAX,
			active: false,
			deprecated: false,
			want_send: true,
			kind,
			peer_sid: 0,
		};

		self.schedule_stream(cid, idx);
	}

	/// Attach every live stream of a peer to a (new) primary channel.
	pub(crate) fn attach_streams(&mut self, now: Instant, eid: &Eid, cid: usize) {
		let Some(peer) = self.peers.get(eid) else { return };
		let streams: Vec<usize> = peer.streams.iter().copied().collect();

		for idx in streams {
			let Some(s) = self.stream(idx) else { continue };

			if s.is_root || s.state == StreamState::Disconnected {
				continue;
			}

			// Substreams follow their parent: they attach once the parent
			// has a binding on the new channel.
			if s.parent.is_some() && s.usid.is_none() {
				continue;
			}

			self.tattach(now, cid, idx);
		}
	}

	/// Admit waiting substreams of `pidx` for announcement, up to the
	/// peer's substream window.
	pub(crate) fn drain_children(&mut self, now: Instant, pidx: usize) {
		loop {
			let Some(parent) = self.stream(pidx) else { return };

			if parent.tsflt >= parent.tswin {
				return;
			}
			let Some((_, cid)) = parent.tx_slot_usable() else { return };

			let Some(cidx) = self.stream_mut(pidx).and_then(|p| p.wait_children.pop_front()) else { return };

			let pusid = self.stream(pidx).and_then(|p| p.usid);
			if let Some(p) = self.stream_mut(pidx) {
				p.tsflt += 1;
			}
			if let Some(c) = self.stream_mut(cidx) {
				c.pusid = pusid;
			}

			self.tattach(now, cid, cidx);
		}
	}

	/// Whether a stream has work it could put on channel `cid` right now.
	pub(crate) fn stream_has_tx(&self, cid: usize, idx: usize) -> bool {
		let Some(s) = self.stream(idx) else { return false };

		if s.tatt.iter().any(|a| a.chan == Some(cid) && a.want_send) {
			return true;
		}

		s.tx_slot_on(cid).is_some() && (s.has_sendable() || s.win_dirty)
	}

	// ----- transmit pump -----

	pub(crate) fn pump(&mut self, now: Instant) {
		let cids: Vec<usize> = self.chans.iter().map(|(i, _)| i).collect();
		for cid in cids {
			self.pump_chan(now, cid);
		}
	}

	fn pump_chan(&mut self, now: Instant, cid: usize) {
		loop {
			let Some(chan) = self.chans.get_mut(cid) else { return };

			if !chan.is_usable() || chan.may_transmit() == 0 {
				return;
			}

			let Some(idx) = chan.mux.tstreams.pop_front() else { return };

			let member = self.stream(idx).is_some_and(|s| s.on_txq == Some(cid));
			if !member {
				continue;
			}

			if let Some(s) = self.stream_mut(idx) {
				s.on_txq = None;
			}

			if let Some((payload, rec)) = self.build_packet(cid, idx) {
				let chan = &mut self.chans[cid];
				chan.transmit(now, &payload, rec, &mut self.sock, &mut self.timers);

				if self.stream_has_tx(cid, idx) {
					self.schedule_stream(cid, idx);
				}
			}
			// When nothing was buildable the stream stays off the queue;
			// whatever unblocks it (window update, attachment ack, parent
			// binding) reschedules it.
		}
	}

	/// Build the next packet for a stream on a channel: binding packets
	/// first, then data, then a bare window update.
	fn build_packet(&mut self, cid: usize, idx: usize) -> Option<(Vec<u8>, TxRec)> {
		let s = self.stream(idx)?;

		if let Some(slot) = s.tatt.iter().position(|a| a.chan == Some(cid) && a.want_send) {
			return self.build_binding(cid, idx, slot);
		}

		let (slot, _) = s.tx_slot_on(cid).map(|sl| (sl, ()))?;
		let sid = s.tatt[slot].sid;

		let s = self.stream_mut(idx)?;

		if s.has_sendable() {
			let win = s.window_byte();
			let seg = s.pop_segment()?;

			let mut b = BytesMut::with_capacity(proto::HDR_EXT + seg.data.len());
			put_hdr(&mut b, sid, PacketType::Data, seg.flags, win);
			b.extend_from_slice(&(seg.tsn as u32).to_be_bytes());
			b.extend_from_slice(&seg.data);

			let rec = TxRec::Stream(StreamTxRec {
				stream: idx,
				kind: TxKind::Data,
				tsn: seg.tsn,
				len: seg.data.len() as u32,
				slot: slot as u8,
			});

			return Some((b.to_vec(), rec));
		}

		if s.win_dirty {
			let win = s.window_byte();
			let mut b = BytesMut::with_capacity(proto::HDR_MIN);
			put_hdr(&mut b, sid, PacketType::Ack, 0, win);
			return Some((b.to_vec(), TxRec::Ack));
		}

		None
	}

	fn build_binding(&mut self, cid: usize, idx: usize, slot: usize) -> Option<(Vec<u8>, TxRec)> {
		let s = self.stream(idx)?;
		let kind = s.tatt[slot].kind;

		// An Init needs the parent bound on the same channel.
		let parent_sid = match (kind, s.parent) {
			(AttachKind::Init, Some(p)) => {
				let psid = self
					.stream(p)
					.and_then(|ps| ps.tx_slot_on(cid).map(|sl| ps.tatt[sl].sid));

				match psid {
					Some(sid) => sid,
					None => {
						// Parent moved away; return the admission slot and
						// wait for it to bind again.
						if let Some(st) = self.stream_mut(idx) {
							st.tatt[slot].clear();
						}
						if let Some(ps) = self.stream_mut(p) {
							ps.tsflt = ps.tsflt.saturating_sub(1);
							ps.wait_children.push_back(idx);
						}
						return None;
					}
				}
			}
			_ => SID_ROOT,
		};

		// Allocate our SID for the binding, evicting a victim past the
		// skip limit (the peer disambiguates reuse by install sequence).
		if self.stream(idx)?.tatt[slot].sid == 0 {
			let (sid, victim) = self.chans.get_mut(cid)?.mux.alloc_sid();

			if let Some(v) = victim {
				if let Some(vs) = self.stream_mut(v) {
					if let Some(vslot) = vs.tx_slot_on(cid) {
						if vs.tatt[vslot].sid == sid {
							vs.tatt[vslot].clear();
						}
					}
				}
				debug!("Reclaimed SID {sid} from stream {v}");
			}

			self.chans.get_mut(cid)?.mux.txsids.insert(sid, idx);
			self.stream_mut(idx)?.tatt[slot].sid = sid;
		}

		// First-ever attachment mints the stream's USID from this
		// channel's transmit direction.
		if kind == AttachKind::Init && self.stream(idx)?.usid.is_none() {
			let chan = self.chans.get(cid)?;
			let ctr = chan.mux.txctr;
			let tx_chanid = chan.tx_chanid;
			self.chans.get_mut(cid)?.mux.txctr += 1;

			let usid = Usid { ctr, chan: tx_chanid };
			let peer_eid = self.stream(idx)?.peer.clone();

			self.stream_mut(idx)?.usid = Some(usid);
			if let Some(p) = self.peers.get_mut(&peer_eid) {
				p.usids.insert(usid, idx);
			}
		}

		let s = self.stream_mut(idx)?;
		s.tatt[slot].want_send = false;

		let sid = s.tatt[slot].sid;
		let win = s.window_byte();
		let init_tsn = s.init_tsn;
		let peer_sid = s.tatt[slot].peer_sid;
		let usid = s.usid;

		let (payload, txkind) = match kind {
			AttachKind::Init => {
				let mut b = BytesMut::with_capacity(proto::HDR_EXT);
				put_hdr(&mut b, parent_sid, PacketType::Init, 0, win);
				b.extend_from_slice(&sid.to_be_bytes());
				b.extend_from_slice(&init_tsn.to_be_bytes());
				(b, TxKind::Init)
			}
			AttachKind::Reply => {
				let mut b = BytesMut::with_capacity(proto::HDR_EXT);
				put_hdr(&mut b, sid, PacketType::Reply, 0, win);
				b.extend_from_slice(&peer_sid.to_be_bytes());
				b.extend_from_slice(&init_tsn.to_be_bytes());
				(b, TxKind::Reply)
			}
			AttachKind::Attach => {
				let mut b = BytesMut::with_capacity(proto::HDR_MIN + 16);
				put_hdr(&mut b, sid, PacketType::Attach, (slot as u8) & ATTACH_SLOT_MASK, win);

				let mut e = Enc::new();
				usid.expect("reattachment requires a USID").encode(&mut e);
				b.extend_from_slice(&e.finish());
				(b, TxKind::Attach)
			}
		};

		let rec = TxRec::Stream(StreamTxRec {
			stream: idx,
			kind: txkind,
			tsn: 0,
			len: 0,
			slot: slot as u8,
		});

		Some((payload.to_vec(), rec))
	}

	// ----- out-of-band sends -----

	/// A bare acknowledgment packet carrying a window update for the
	/// stream we most recently received on.
	pub(crate) fn send_bare_ack(&mut self, now: Instant, cid: usize) {
		let Some(chan) = self.chans.get(cid) else { return };

		let target = chan.mux.rxsids.get(&chan.mux.acksid).map(|b| b.stream);

		let (sid, win) = match target {
			Some(idx) => {
				let sid = self.stream(idx).and_then(|s| s.tx_slot_on(cid).map(|sl| s.tatt[sl].sid));
				match sid {
					Some(sid) => (sid, self.stream_mut(idx).map(|s| s.window_byte()).unwrap_or(0)),
					None => (SID_ROOT, 0),
				}
			}
			None => (SID_ROOT, 0),
		};

		let mut b = BytesMut::with_capacity(proto::HDR_MIN);
		put_hdr(&mut b, sid, PacketType::Ack, 0, win);

		let chan = &mut self.chans[cid];
		chan.transmit(now, &b, TxRec::Ack, &mut self.sock, &mut self.timers);
	}

	/// Advertise a grown receive window without waiting for outgoing data.
	pub(crate) fn send_window_update(&mut self, now: Instant, idx: usize) {
		let Some(s) = self.stream(idx) else { return };
		let Some((slot, cid)) = s.tx_slot_usable() else { return };
		let sid = s.tatt[slot].sid;

		let win = match self.stream_mut(idx) {
			Some(s) => s.window_byte(),
			None => return,
		};

		let mut b = BytesMut::with_capacity(proto::HDR_MIN);
		put_hdr(&mut b, sid, PacketType::Ack, 0, win);

		if let Some(chan) = self.chans.get_mut(cid) {
			chan.transmit(now, &b, TxRec::Ack, &mut self.sock, &mut self.timers);
		}
	}

	/// Number of Datagram packets a stateless send of `len` bytes takes.
	pub(crate) fn dgram_fragments(len: usize) -> u32 {
		(len.max(1)).div_ceil(MAX_DGRAM_SEG) as u32
	}

	/// Send a stateless datagram as one back-to-back fragment burst. The
	/// caller has checked that congestion control admits the whole burst,
	/// so the fragments occupy consecutive channel sequences and the
	/// receiver can reassemble by sequence run.
	pub(crate) fn send_dgram_stateless(&mut self, now: Instant, cid: usize, idx: usize, data: &[u8]) {
		let Some(s) = self.stream(idx) else { return };
		let Some(slot) = s.tx_slot_on(cid) else { return };
		let sid = s.tatt[slot].sid;

		let win = self.stream_mut(idx).map(|s| s.window_byte()).unwrap_or(0);

		let total = data.len();
		let mut off = 0;

		loop {
			let n = (total - off).min(MAX_DGRAM_SEG);
			let first = off == 0;
			let last = off + n == total;

			let mut flags = 0;
			if first {
				flags |= DGRAM_BEGIN;
			}
			if last {
				flags |= DGRAM_END;
			}

			let mut b = BytesMut::with_capacity(proto::HDR_MIN + n);
			put_hdr(&mut b, sid, PacketType::Datagram, flags, win);
			b.extend_from_slice(&data[off..off + n]);

			let rec = TxRec::Stream(StreamTxRec {
				stream: idx,
				kind: TxKind::Datagram,
				tsn: 0,
				len: n as u32,
				slot: slot as u8,
			});

			if let Some(chan) = self.chans.get_mut(cid) {
				chan.transmit(now, &b, rec, &mut self.sock, &mut self.timers);
			}

			if last {
				break;
			}
			off += n;
		}
	}

	/// Abortive stream termination, local side: tell the peer, drop state.
	pub(crate) fn reset_stream(&mut self, now: Instant, idx: usize, reason: &'static str) {
		let Some(s) = self.stream(idx) else { return };

		if s.state == StreamState::Disconnected {
			return;
		}

		let r = self.stream_ref(idx);
		let tx: Vec<(usize, Sid)> = s.tatt.iter().filter_map(|a| a.chan.map(|c| (c, a.sid))).collect();
		let rx: Vec<(usize, Sid)> = s.ratt.iter().filter_map(|a| a.chan.map(|c| (c, a.sid))).collect();

		if let Some(s) = self.stream_mut(idx) {
			s.disconnect(reason);
		}

		for (c, sid) in tx {
			if let Some(chan) = self.chans.get_mut(c) {
				chan.mux.txsids.remove(&sid);

				if chan.is_usable() && sid != 0 {
					let mut b = BytesMut::with_capacity(proto::HDR_MIN);
					put_hdr(&mut b, sid, PacketType::Reset, 0, 0);
					chan.transmit(now, &b, TxRec::Ack, &mut self.sock, &mut self.timers);
				}
			}
		}

		for (c, sid) in rx {
			if let Some(chan) = self.chans.get_mut(c) {
				chan.mux.rxsids.remove(&sid);
			}
		}

		self.push_event(Event::Reset { stream: r, reason });
	}

	// ----- ack routing -----

	/// Route channel acknowledgments and loss verdicts back to streams.
	pub(crate) fn apply_recs(&mut self, now: Instant, cid: usize, acked: &[(u64, StreamTxRec)], missed: &[StreamTxRec]) {
		let mut activated: Vec<usize> = Vec::new();

		for &(seq, rec) in acked {
			let idx = rec.stream;
			let Some(s) = self.stream_mut(idx) else { continue };

			match rec.kind {
				TxKind::Data => {
					let unblocked = s.tx_acked(rec.tsn, rec.len);
					let sendable = s.has_sendable();

					if unblocked {
						let r = self.stream_ref(idx);
						self.push_event(Event::ReadyWrite { stream: r });
					}
					if unblocked || sendable {
						self.kick_stream(now, idx);
					}
				}
				TxKind::Init | TxKind::Reply | TxKind::Attach => {
					let slot = rec.slot as usize;
					let a = &mut s.tatt[slot];

					if a.chan == Some(cid) {
						a.sidseq = a.sidseq.min(seq);
						if !a.active {
							a.active = true;
							activated.push(idx);
						}
					}
				}
				TxKind::Datagram | TxKind::Detach => {}
			}
		}

		for idx in activated {
			self.attachment_activated(now, cid, idx);
		}

		for rec in missed {
			self.stream_tx_missed(now, rec);
		}
	}

	/// A binding on `cid` was acknowledged: deprecate and release bindings
	/// this one replaces, and let held-back work flow.
	fn attachment_activated(&mut self, now: Instant, cid: usize, idx: usize) {
		let mut old: Vec<(usize, Sid, usize)> = Vec::new();

		if let Some(s) = self.stream_mut(idx) {
			for (i, a) in s.tatt.iter_mut().enumerate() {
				match a.chan {
					Some(c) if c != cid && a.in_use() => {
						a.deprecated = true;
						old.push((c, a.sid, i));
					}
					_ => {}
				}
			}
		}

		// The replacement is live: the deprecated slots can go.
		for (c, sid, slot) in old {
			if let Some(chan) = self.chans.get_mut(c) {
				chan.mux.txsids.remove(&sid);

				if chan.is_usable() && sid != 0 {
					let mut b = BytesMut::with_capacity(proto::HDR_MIN);
					put_hdr(&mut b, sid, PacketType::Detach, 0, 0);
					chan.transmit(now, &b, TxRec::Ack, &mut self.sock, &mut self.timers);
				}
			}

			if let Some(s) = self.stream_mut(idx) {
				s.tatt[slot].clear();
			}
		}

		self.drain_children(now, idx);

		if self.stream_has_tx(cid, idx) {
			self.schedule_stream(cid, idx);
			self.pump(now);
		}
	}

	pub(crate) fn stream_tx_missed(&mut self, now: Instant, rec: &StreamTxRec) {
		let idx = rec.stream;
		let Some(s) = self.stream_mut(idx) else { return };

		match rec.kind {
			TxKind::Data => {
				s.tx_missed(rec.tsn);
				self.kick_stream(now, idx);
			}
			TxKind::Init | TxKind::Reply | TxKind::Attach => {
				let slot = rec.slot as usize;
				let a = &mut s.tatt[slot];

				if a.in_use() && !a.active {
					a.want_send = true;
					let chan = a.chan.expect("slot in use");
					self.schedule_stream(chan, idx);
					self.pump(now);
				}
			}
			// Datagrams are fire-and-forget; a lost fragment loses the
			// datagram.
			TxKind::Datagram | TxKind::Detach => {}
		}
	}

	// ----- channel death -----

	/// Strip every stream binding from a dying channel and requeue in-
	/// flight data for retransmission on whatever channel comes next.
	pub(crate) fn detach_channel(&mut self, now: Instant, cid: usize) {
		let eid = match self.chans.get(cid) {
			Some(chan) => chan.peer.clone(),
			None => return,
		};

		// Sweep all of the peer's streams: bindings still waiting to be
		// sent have no table entry yet but reference the channel too.
		let all: Vec<usize> = self.peers.get(&eid).map(|p| p.streams.iter().copied().collect()).unwrap_or_default();

		let mut readmit: Vec<(usize, usize)> = Vec::new();

		for idx in all {
			let Some(s) = self.stream_mut(idx) else { continue };

			let mut had_tx = false;
			for a in &mut s.tatt {
				if a.chan == Some(cid) {
					a.clear();
					had_tx = true;
				}
			}
			for a in &mut s.ratt {
				if a.chan == Some(cid) {
					a.clear();
				}
			}

			if s.on_txq == Some(cid) {
				s.on_txq = None;
			}

			// With no remaining binding, everything in flight is in doubt;
			// queue it all for retransmission in order.
			if had_tx && !s.attached_anywhere() {
				let segs: Vec<_> = s.twait.values().cloned().collect();
				for seg in segs.into_iter().rev() {
					let mut seg = seg;
					seg.retransmit = true;
					s.tqueue.push_front(seg);
				}
			}

			// A substream whose announcement never went out goes back to
			// its parent's admission queue.
			if had_tx && s.usid.is_none() {
				if let Some(p) = s.parent {
					readmit.push((p, idx));
				}
			}
		}

		for (p, c) in readmit {
			if let Some(ps) = self.stream_mut(p) {
				ps.tsflt = ps.tsflt.saturating_sub(1);
				ps.wait_children.push_back(c);
			}
		}

		// If the peer still has a usable primary, move the strays over.
		if let Some(primary) = self.peer_primary(&eid) {
			if primary != cid {
				self.attach_streams(now, &eid, primary);
				self.pump(now);
			}
		}
	}

	// ----- receive path -----

	/// Process one stream packet. `None` refuses the packet: it will not
	/// be acknowledged and the peer retransmits its contents. `Some(true)`
	/// asks that an acknowledgment reach the peer; pure control packets
	/// (Ack, Reset, Detach) are recorded but never generate acks of their
	/// own, which would otherwise ping-pong forever.
	pub(crate) fn receive_stream(&mut self, now: Instant, cid: usize, pktseq: u64, payload: bytes::Bytes) -> Option<bool> {
		let mut buf = payload;

		let Ok(hdr) = get_hdr(&mut buf) else {
			self.channel_violation(now, cid, "malformed stream header");
			return None;
		};

		match hdr.ty {
			PacketType::Init => self.rx_init(now, cid, pktseq, hdr, buf).then_some(true),
			PacketType::Reply => self.rx_reply(now, cid, pktseq, hdr, buf).then_some(true),
			PacketType::Data => self.rx_data(now, cid, hdr, buf).then_some(true),
			PacketType::Datagram => self.rx_datagram(now, cid, pktseq, hdr, buf).then_some(true),
			PacketType::Ack => {
				self.rx_apply_window(now, cid, hdr);
				Some(false)
			}
			PacketType::Reset => self.rx_reset(now, cid, hdr).then_some(false),
			PacketType::Attach => self.rx_attach(now, cid, pktseq, hdr, buf).then_some(true),
			PacketType::Detach => {
				self.rx_detach(cid, hdr);
				Some(false)
			}
		}
	}

	/// The peer violated the protocol: close the offending channel; its
	/// streams survive on other channels where possible.
	fn channel_violation(&mut self, now: Instant, cid: usize, what: &str) {
		warn!("Protocol violation on channel {cid} ({what}); resetting the channel");
		self.peer_link_status(now, cid, LinkStatus::Down);
		self.teardown_channel(now, cid);
	}

	/// Apply the window byte of a received packet to the stream it names.
	fn rx_apply_window(&mut self, now: Instant, cid: usize, hdr: Hdr) {
		let Some(idx) = self.chans.get(cid).and_then(|c| c.mux.rxsids.get(&hdr.sid)).map(|b| b.stream) else {
			return;
		};
		self.apply_win(now, idx, hdr.win);
	}

	fn apply_win(&mut self, now: Instant, idx: usize, win: u8) {
		let Some(s) = self.stream_mut(idx) else { return };

		if !s.apply_window(win) {
			return;
		}

		if win & WIN_SUBSTREAM != 0 {
			self.drain_children(now, idx);
		} else {
			let r = self.stream_ref(idx);
			self.push_event(Event::ReadyWrite { stream: r });
			self.kick_stream(now, idx);
		}
	}

	fn rx_init(&mut self, now: Instant, cid: usize, pktseq: u64, hdr: Hdr, mut buf: bytes::Bytes) -> bool {
		if buf.len() < 4 {
			self.channel_violation(now, cid, "truncated Init");
			return false;
		}

		let rsid = buf.get_u16();
		let init_tsn = buf.get_u16();

		let Some(chan) = self.chans.get_mut(cid) else { return false };
		chan.mux.acksid = rsid;

		let Some(parent_bind) = chan.mux.rxsids.get(&hdr.sid).copied() else {
			// The parent's own Init may still be in flight; refuse so the
			// sender retries after it lands.
			debug!("Init references unknown parent SID {}", hdr.sid);
			return false;
		};

		if let Some(bind) = chan.mux.rxsids.get(&rsid).copied() {
			if pktseq <= bind.sidseq {
				return true;
			}

			let same = self.stream(bind.stream).is_some_and(|s| s.rsn_init && s.ratt.iter().any(|a| a.chan == Some(cid) && a.sid == rsid));

			if same {
				// Retransmitted Init for an already-bound stream.
				return true;
			}

			// SID reuse: the old binding was evicted on the sender side.
			if let Some(old) = self.stream_mut(bind.stream) {
				for a in &mut old.ratt {
					if a.chan == Some(cid) && a.sid == rsid {
						a.clear();
					}
				}
			}
		}

		let peer_eid = self.chans[cid].peer.clone();
		let rx_chanid = self.chans[cid].rx_chanid;

		let parent_is_root = parent_bind.stream == self.chans[cid].mux.root;

		let mut s = Stream::new(peer_eid.clone(), Some(parent_bind.stream), self.cfg.child_receive_buffer, self.cfg.child_receive_buffer);
		s.rsn = u64::from(init_tsn);
		s.rsn_init = true;
		s.pusid = self.stream(parent_bind.stream).and_then(|p| p.usid);
		let tsn: u16 = self.rng_u16();
		s.set_init_tsn(tsn);

		if parent_is_root {
			s.top_level = true;
			s.parent = None;
			s.state = StreamState::Accepting;
		} else {
			s.state = StreamState::Connected;
		}

		let slot = s.alloc_rx_slot();
		s.ratt[slot] = RxAttach { chan: Some(cid), sid: rsid, sidseq: pktseq };

		// Implicit USID assignment in arrival order, from the peer's
		// transmit direction of this channel.
		let idx = {
			let chan = &mut self.chans[cid];
			chan.mux.rxctr += 1;
			let usid = Usid { ctr: chan.mux.rxctr, chan: rx_chanid };
			s.usid = Some(usid);
			let idx = self.insert_stream(s);

			let chan = &mut self.chans[cid];
			chan.mux.rxsids.insert(rsid, RxBind { stream: idx, sidseq: pktseq });

			let peer = self.peer_entry(peer_eid);
			peer.streams.insert(idx);
			peer.usids.insert(usid, idx);
			idx
		};

		// Answer with our reverse binding.
		if let Some(s) = self.stream_mut(idx) {
			let slot = s.alloc_tx_slot();
			s.tatt[slot] = TxAttach {
				chan: Some(cid),
				sid: 0,
				sidseq: u64::MAX,
				active: false,
				deprecated: false,
				want_send: true,
				kind: AttachKind::Reply,
				peer_sid: rsid,
			};
		}

		self.apply_win(now, idx, hdr.win);
		self.schedule_stream(cid, idx);

		if !parent_is_root {
			if let Some(p) = self.stream_mut(parent_bind.stream) {
				p.rsubs.push_back(idx);
			}
			let pref = self.stream_ref(parent_bind.stream);
			self.push_event(Event::NewSubstream { stream: pref });
		}

		info!("Peer opened stream {rsid} on channel {cid}");
		true
	}

	fn rx_reply(&mut self, now: Instant, cid: usize, pktseq: u64, hdr: Hdr, mut buf: bytes::Bytes) -> bool {
		if buf.len() < 4 {
			self.channel_violation(now, cid, "truncated Reply");
			return false;
		}

		let rsid = buf.get_u16();
		let init_tsn = buf.get_u16();

		let Some(&idx) = self.chans.get(cid).and_then(|c| c.mux.txsids.get(&rsid)) else {
			debug!("Reply for unknown SID {rsid}");
			return true;
		};

		{
			let chan = &mut self.chans[cid];
			chan.mux.acksid = hdr.sid;

			let stale = chan.mux.rxsids.get(&hdr.sid).is_some_and(|b| b.sidseq >= pktseq);
			if !stale {
				chan.mux.rxsids.insert(hdr.sid, RxBind { stream: idx, sidseq: pktseq });
			}
		}

		let parent = {
			let Some(s) = self.stream_mut(idx) else { return true };

			let slot = s.alloc_rx_slot();
			s.ratt[slot] = RxAttach { chan: Some(cid), sid: hdr.sid, sidseq: pktseq };

			if !s.rsn_init {
				s.rsn = u64::from(init_tsn);
				s.rsn_init = true;
			}

			// The Reply proves our Init arrived even before its channel
			// ack does.
			if let Some(sl) = s.tx_slot_on(cid) {
				s.tatt[sl].active = true;
				s.tatt[sl].want_send = false;
			}

			s.parent
		};

		self.apply_win(now, idx, hdr.win);

		// One outstanding substream announcement resolved.
		if let Some(p) = parent {
			if let Some(ps) = self.stream_mut(p) {
				ps.tsflt = ps.tsflt.saturating_sub(1);
			}
			self.drain_children(now, p);
		}

		if self.stream_has_tx(cid, idx) {
			self.schedule_stream(cid, idx);
		}

		true
	}

	fn rx_data(&mut self, now: Instant, cid: usize, hdr: Hdr, mut buf: bytes::Bytes) -> bool {
		if buf.len() < 4 {
			self.channel_violation(now, cid, "truncated Data");
			return false;
		}

		let tsn32 = buf.get_u32();

		let Some(bind) = self.chans.get(cid).and_then(|c| c.mux.rxsids.get(&hdr.sid)).copied() else {
			// The Init that would bind this SID may have been lost; refuse
			// so the sender retransmits after rebinding.
			debug!("Data for unknown SID {}", hdr.sid);
			return false;
		};
		let idx = bind.stream;

		if let Some(chan) = self.chans.get_mut(cid) {
			chan.mux.acksid = hdr.sid;
		}

		self.apply_win(now, idx, hdr.win);

		let Some(s) = self.stream_mut(idx) else { return true };

		let out = s.rx_data(tsn32, buf, hdr.sub);
		if !out.accepted {
			return false;
		}

		self.rx_notify(now, idx, out.new_bytes, out.new_msgs, out.closed);
		true
	}

	/// Event generation and service negotiation after delivered data.
	fn rx_notify(&mut self, now: Instant, idx: usize, new_bytes: u64, new_msgs: usize, closed: bool) {
		let Some(s) = self.stream(idx) else { return };
		let state = s.state;
		let parent = s.parent;
		let r = self.stream_ref(idx);

		if new_msgs > 0 {
			match state {
				StreamState::Accepting => {
					self.service_request(now, idx);
					return;
				}
				StreamState::WaitService => {
					self.service_reply(now, idx);
					return;
				}
				_ => self.push_event(Event::ReadyReadMessage { stream: r }),
			}

			// An ephemeral-substream datagram became readable.
			if let Some(p) = parent {
				let queued = self.stream(p).is_some_and(|ps| ps.rsubs.contains(&idx));
				if queued {
					let pref = self.stream_ref(p);
					self.push_event(Event::ReadyReadDatagram { stream: pref });
				}
			}
		}

		if new_bytes > 0 || closed {
			self.push_event(Event::ReadyRead { stream: r });
		}
	}

	/// First message on an accepting stream: the connect request.
	fn service_request(&mut self, now: Instant, idx: usize) {
		let Some(s) = self.stream_mut(idx) else { return };
		let Some(msg) = s.read_message() else { return };

		let Ok(req) = ConnectRequest::decode(msg) else {
			self.reset_stream(now, idx, "malformed connect request");
			return;
		};

		let key = (req.service.clone(), req.protocol.clone());

		if self.listeners.contains_key(&key) {
			let reply = ConnectReply { status: REPLY_OK }.encode();

			if let Some(s) = self.stream_mut(idx) {
				s.state = StreamState::Connected;
				s.enqueue(&reply, proto::DATA_MESSAGE | proto::DATA_PUSH);
			}

			self.listeners.get_mut(&key).expect("listener exists").queue.push_back(idx);
			self.push_event(Event::IncomingConnection { service: req.service, protocol: req.protocol });
			self.kick_stream(now, idx);
		} else {
			info!("Connect request for unknown service {}/{}", req.service, req.protocol);
			let reply = ConnectReply { status: REPLY_NO_SERVICE }.encode();

			if let Some(s) = self.stream_mut(idx) {
				s.enqueue(&reply, proto::DATA_MESSAGE | proto::DATA_PUSH);
				s.shutdown_write();
			}
			self.kick_stream(now, idx);
		}
	}

	/// First message on a connecting stream: the service reply.
	fn service_reply(&mut self, now: Instant, idx: usize) {
		let Some(s) = self.stream_mut(idx) else { return };
		let Some(msg) = s.read_message() else { return };

		let ok = ConnectReply::decode(msg).map(|r| r.status == REPLY_OK);

		match ok {
			Ok(true) => {
				let s = self.stream_mut(idx).expect("stream exists");
				s.state = StreamState::Connected;

				let more = s.pending_messages() > 0;
				let r = self.stream_ref(idx);
				self.push_event(Event::Connected { stream: r });
				if more {
					self.push_event(Event::ReadyReadMessage { stream: r });
				}
			}
			_ => {
				self.reset_stream(now, idx, "connection refused");
			}
		}
	}

	fn rx_datagram(&mut self, now: Instant, cid: usize, pktseq: u64, hdr: Hdr, buf: bytes::Bytes) -> bool {
		let Some(bind) = self.chans.get(cid).and_then(|c| c.mux.rxsids.get(&hdr.sid)).copied() else {
			debug!("Datagram for unknown SID {}", hdr.sid);
			return false;
		};
		let idx = bind.stream;

		self.apply_win(now, idx, hdr.win);

		let done = {
			let chan = &mut self.chans[cid];
			chan.mux.acksid = hdr.sid;
			chan.mux.partial.entry(hdr.sid).or_default().add(pktseq, hdr.sub, buf)
		};

		if let Some(payload) = done {
			let didx = self.insert_dgram(DgramStream::new(payload));

			if let Some(s) = self.stream_mut(idx) {
				s.rdgrams.push_back(didx);
			}

			let r = self.stream_ref(idx);
			self.push_event(Event::ReadyReadDatagram { stream: r });
		}

		true
	}

	fn rx_reset(&mut self, now: Instant, cid: usize, hdr: Hdr) -> bool {
		let Some(chan) = self.chans.get(cid) else { return true };

		let target = if hdr.sub & RESET_DIR != 0 {
			chan.mux.txsids.get(&hdr.sid).copied()
		} else {
			chan.mux.rxsids.get(&hdr.sid).map(|b| b.stream)
		};

		let Some(idx) = target else { return true };

		let Some(s) = self.stream(idx) else { return true };
		if s.is_root {
			self.channel_violation(now, cid, "reset of the root stream");
			return false;
		}

		let r = self.stream_ref(idx);
		let tx: Vec<(usize, Sid)> = s.tatt.iter().filter_map(|a| a.chan.map(|c| (c, a.sid))).collect();
		let rx: Vec<(usize, Sid)> = s.ratt.iter().filter_map(|a| a.chan.map(|c| (c, a.sid))).collect();

		if let Some(s) = self.stream_mut(idx) {
			s.disconnect("reset by peer");
		}

		for (c, sid) in tx {
			if let Some(ch) = self.chans.get_mut(c) {
				ch.mux.txsids.remove(&sid);
			}
		}
		for (c, sid) in rx {
			if let Some(ch) = self.chans.get_mut(c) {
				ch.mux.rxsids.remove(&sid);
			}
		}

		self.push_event(Event::Reset { stream: r, reason: "reset by peer" });
		true
	}

	fn rx_attach(&mut self, now: Instant, cid: usize, pktseq: u64, hdr: Hdr, buf: bytes::Bytes) -> bool {
		let mut d = Dec::new(buf);
		let Ok(usid) = Usid::decode(&mut d) else {
			self.channel_violation(now, cid, "malformed Attach");
			return false;
		};

		let peer_eid = match self.chans.get(cid) {
			Some(c) => c.peer.clone(),
			None => return false,
		};

		let target = self.peers.get(&peer_eid).and_then(|p| p.usids.get(&usid)).copied();

		let Some(idx) = target else {
			// We do not know this stream; tell the peer so it can give up
			// on the binding.
			debug!("Attach for unknown stream {usid:?}");

			if let Some(chan) = self.chans.get_mut(cid) {
				let mut b = BytesMut::with_capacity(proto::HDR_MIN);
				put_hdr(&mut b, hdr.sid, PacketType::Reset, RESET_DIR, 0);
				chan.transmit(now, &b, TxRec::Ack, &mut self.sock, &mut self.timers);
			}
			return true;
		};

		{
			let chan = &mut self.chans[cid];
			chan.mux.acksid = hdr.sid;

			let stale = chan.mux.rxsids.get(&hdr.sid).is_some_and(|b| b.sidseq >= pktseq);
			if !stale {
				chan.mux.rxsids.insert(hdr.sid, RxBind { stream: idx, sidseq: pktseq });
			}
		}

		if let Some(s) = self.stream_mut(idx) {
			let slot = s.alloc_rx_slot();
			s.ratt[slot] = RxAttach { chan: Some(cid), sid: hdr.sid, sidseq: pktseq };
		}

		self.apply_win(now, idx, hdr.win);

		// The peer migrated the stream here; follow with our own binding
		// so window updates and replies use the same channel.
		let mirrored = self.stream(idx).is_some_and(|s| s.tx_slot_on(cid).is_none());
		if mirrored {
			self.tattach(now, cid, idx);
			self.pump(now);
		}

		true
	}

	fn rx_detach(&mut self, cid: usize, hdr: Hdr) -> bool {
		let Some(chan) = self.chans.get_mut(cid) else { return true };

		let Some(bind) = chan.mux.rxsids.remove(&hdr.sid) else { return true };

		if let Some(s) = self.stream_mut(bind.stream) {
			for a in &mut s.ratt {
				if a.chan == Some(cid) && a.sid == hdr.sid {
					a.clear();
				}
			}
		}

		true
	}
}
