//! The channel layer: an authenticated, encrypted, sequenced,
//! congestion-controlled datagram pipe between two endpoints.
//!
//! Wire layout (after UDP):
//!
//! ```text
//! byte 0        peer's local channel number (nonzero)
//! bytes 1..4    low 24 bits of the transmit sequence (cleartext)
//! bytes 4..8    encrypted { resv:4 | ack_count:4 | ack_seq:24 }
//! bytes 8..     encrypted payload (stream headers and data)
//! last 16       MAC over everything above plus the 64-bit pseudo-header
//! ```

pub mod armor;
pub mod cc;
pub mod seq;

use core::time::Duration;
use std::collections::BTreeMap;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, warn};

use crate::chan::armor::{Armor, HDR_LEN, MAC_LEN};
use crate::chan::cc::CongestionControl;
use crate::chan::seq::{reconstruct, ReplayWindow, MASK_BITS};
use crate::host::{HostConfig, TimerTarget};
use crate::ident::Eid;
use crate::sock::{Endpoint, SocketLayer};
use crate::strm::mux::Mux;
use crate::timer::{TimerKey, Timers, RETRY_MAX, RETRY_MIN};

/// Length of each per-direction channel id.
pub const CHANID_LEN: usize = 8;

/// Delayed-acknowledgment holdoff.
const ACK_DELAY: Duration = Duration::from_millis(10);

/// Receives to accumulate before forcing an immediate acknowledgment even
/// with delayed acks enabled.
const ACK_FORCE: u8 = 4;

/// Link status as observed by a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkStatus {
	Up,
	Stalled,
	Down,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChanState {
	Fresh,
	Active,
	Stalled,
	Closed,
}

/// What kind of stream packet a transmit record stands for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TxKind {
	Init,
	Reply,
	Data,
	Datagram,
	Attach,
	Detach,
}

/// Transmit record for a stream-layer packet held in the ackwait table.
#[derive(Clone, Copy, Debug)]
pub struct StreamTxRec {
	pub stream: usize,
	pub kind: TxKind,
	/// First byte sequence number, for Data records.
	pub tsn: u64,
	/// Payload bytes, for Data records.
	pub len: u32,
	/// Attachment slot the packet belongs to.
	pub slot: u8,
}

#[derive(Clone, Copy, Debug)]
pub enum TxRec {
	/// A bare acknowledgment or other fire-and-forget packet.
	Ack,
	Stream(StreamTxRec),
}

/// Everything a successfully received packet produced.
#[derive(Default)]
pub struct RxPacket {
	pub seq: u64,
	pub payload: Bytes,
	pub acked: Vec<(u64, StreamTxRec)>,
	pub missed: Vec<StreamTxRec>,
	pub expired: Vec<StreamTxRec>,
	pub status: Option<LinkStatus>,
}

/// Result of a retransmit-timer fire.
#[derive(Default)]
pub struct RtxOut {
	pub missed: Vec<StreamTxRec>,
	pub status: Option<LinkStatus>,
	pub closed: bool,
}

pub struct ChanKeys {
	pub tx_enc: Vec<u8>,
	pub tx_mac: [u8; 32],
	pub rx_enc: Vec<u8>,
	pub rx_mac: [u8; 32],
}

pub struct ChanParams {
	pub peer: Eid,
	pub remote_ep: Endpoint,
	pub local_chan: u8,
	pub remote_chan: u8,
	pub tx_chanid: [u8; CHANID_LEN],
	pub rx_chanid: [u8; CHANID_LEN],
	pub initiator: bool,
	pub keys: ChanKeys,
}

pub struct Channel {
	pub id: usize,
	pub peer: Eid,
	pub remote_ep: Endpoint,
	pub local_chan: u8,
	pub remote_chan: u8,
	pub tx_chanid: [u8; CHANID_LEN],
	pub rx_chanid: [u8; CHANID_LEN],
	pub initiator: bool,
	pub state: ChanState,

	armor: Armor,

	// Transmit state.
	txseq: u64,
	txackseq: u64,
	txfltcnt: u32,
	txfltsize: u64,
	ackwait: BTreeMap<u64, TxRec>,
	expwait: BTreeMap<u64, TxRec>,
	recovseq: u64,
	miss_thresh: u64,

	// Round-trip measurement: one marked packet per round.
	markseq: u64,
	marktime: Instant,
	marksent: u32,
	markacks: u32,
	srtt: Duration,
	rttvar: Duration,

	pub cc: Box<dyn CongestionControl>,

	rtx_timer: TimerKey,
	ack_timer: TimerKey,
	fail_max: Duration,

	// Receive state.
	replay: ReplayWindow,
	rxackseq: u64,
	rxackct: u8,
	rxunacked: u8,
	delayed_ack: bool,
	auth_failures: u64,

	/// Stream multiplexing state riding on this channel.
	pub mux: Mux,
}

impl Channel {
	pub fn new(id: usize, p: ChanParams, cfg: &HostConfig, mux: Mux, now: Instant) -> Self {
		Self {
			id,
			peer: p.peer,
			remote_ep: p.remote_ep,
			local_chan: p.local_chan,
			remote_chan: p.remote_chan,
			tx_chanid: p.tx_chanid,
			rx_chanid: p.rx_chanid,
			initiator: p.initiator,
			state: ChanState::Fresh,
			armor: Armor::new(p.keys.tx_enc, p.keys.tx_mac, p.keys.rx_enc, p.keys.rx_mac),
			txseq: 1,
			txackseq: 0,
			txfltcnt: 0,
			txfltsize: 0,
			ackwait: BTreeMap::new(),
			expwait: BTreeMap::new(),
			recovseq: 1,
			miss_thresh: 1,
			markseq: 0,
			marktime: now,
			marksent: 0,
			markacks: 0,
			srtt: cfg.retry_min / 2,
			rttvar: Duration::ZERO,
			cc: cc::make(cfg.cc_mode, cfg.cc_fixed_window),
			rtx_timer: TimerKey::default(),
			ack_timer: TimerKey::default(),
			fail_max: cfg.fail_max,
			replay: ReplayWindow::new(),
			rxackseq: 0,
			rxackct: 0,
			rxunacked: 0,
			delayed_ack: cfg.delayed_ack,
			auth_failures: 0,
			mux,
		}
	}

	pub fn in_flight(&self) -> u32 {
		self.txfltcnt
	}

	pub fn bytes_in_flight(&self) -> u64 {
		self.txfltsize
	}

	pub fn is_usable(&self) -> bool {
		!matches!(self.state, ChanState::Closed)
	}

	/// Packets congestion control allows out right now.
	pub fn may_transmit(&mut self) -> u32 {
		if self.state == ChanState::Closed {
			return 0;
		}
		self.cc.may_transmit(self.txfltcnt)
	}

	fn rto(&self) -> Duration {
		(self.srtt * 2).clamp(RETRY_MIN, RETRY_MAX)
	}

	/// Assign a sequence number to a packet, armor it, and send it.
	pub fn transmit(
		&mut self,
		now: Instant,
		payload: &[u8],
		rec: TxRec,
		sock: &mut SocketLayer,
		timers: &mut Timers<TimerTarget>,
	) -> u64 {
		let seq = self.txseq;
		self.txseq += 1;

		if self.markseq == 0 {
			self.markseq = seq;
			self.marktime = now;
			self.marksent = 0;
			self.markacks = 0;
		}
		self.marksent += 1;

		let mut pkt = Vec::with_capacity(HDR_LEN + payload.len() + MAC_LEN);
		pkt.push(self.remote_chan);
		pkt.extend_from_slice(&[(seq >> 16) as u8, (seq >> 8) as u8, seq as u8]);

		let word2 = (u32::from(self.rxackct) << 24) | (self.rxackseq as u32 & 0xFF_FFFF);
		pkt.extend_from_slice(&word2.to_be_bytes());
		pkt.extend_from_slice(payload);

		self.armor.seal(seq, &mut pkt);
		sock.send(self.remote_ep, &pkt);

		// Every packet carries the piggybacked ack; nothing is pending now.
		self.rxunacked = 0;
		timers.stop(self.ack_timer);
		self.ack_timer = TimerKey::default();

		let is_data = matches!(rec, TxRec::Stream(_));
		self.ackwait.insert(seq, rec);

		if is_data {
			self.txfltcnt += 1;
			self.txfltsize += payload.len() as u64;

			if !timers.is_active(self.rtx_timer) {
				timers.stop(self.rtx_timer);
				self.rtx_timer = timers.retry(now, self.rto(), RETRY_MAX, Some(self.fail_max), TimerTarget::ChanRtx(self.id));
			}
		}

		seq
	}

	/// Process an authenticated incoming datagram. Returns None when the
	/// packet is dropped (replay, out of window, bad MAC).
	pub fn receive(&mut self, now: Instant, msg: &[u8], timers: &mut Timers<TimerTarget>) -> Option<RxPacket> {
		if self.state == ChanState::Closed {
			return None;
		}

		if msg.len() < HDR_LEN + MAC_LEN {
			debug!("Runt channel packet ({} bytes)", msg.len());
			return None;
		}

		let low = u64::from(u32::from_be_bytes([0, msg[1], msg[2], msg[3]]));
		let pktseq = reconstruct(self.replay.seq, low, 24);

		// Replay and window checks happen before any MAC work.
		self.replay.check(pktseq).ok()?;

		let mut pkt = msg.to_vec();

		if self.armor.open(pktseq, &mut pkt).is_err() {
			self.auth_failures += 1;
			if self.auth_failures.is_power_of_two() {
				warn!("Packet authentication failure on channel {} ({} total)", self.local_chan, self.auth_failures);
			}
			return None;
		}

		self.replay.mark(pktseq);

		let word2 = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
		let ackct = u64::from((word2 >> 24) & 0xF);
		let acklow = u64::from(word2 & 0xFF_FFFF);

		let mut out = self.process_ack(now, acklow, ackct, timers);
		out.seq = pktseq;
		out.payload = Bytes::copy_from_slice(&pkt[HDR_LEN..]);

		if self.state == ChanState::Fresh {
			self.state = ChanState::Active;
			out.status = Some(LinkStatus::Up);
		}

		Some(out)
	}

	/// Record a packet for acknowledgment after the upper layer processed
	/// it. A refused packet is never acknowledged, so the peer retransmits
	/// its contents. `sendack` asks that an acknowledgment reach the peer
	/// soon; the return value requests an immediate bare ack.
	pub fn acknowledge(&mut self, now: Instant, pktseq: u64, sendack: bool, timers: &mut Timers<TimerTarget>) -> bool {
		if pktseq == self.rxackseq + 1 {
			self.rxackseq = pktseq;
			self.rxackct = (self.rxackct + 1).min(15);
		} else if pktseq > self.rxackseq {
			self.rxackseq = pktseq;
			self.rxackct = 0;
		}

		if !sendack {
			return false;
		}

		self.rxunacked += 1;

		if self.delayed_ack && self.rxunacked < ACK_FORCE {
			if !timers.is_active(self.ack_timer) {
				self.ack_timer = timers.once(now, ACK_DELAY, TimerTarget::ChanAck(self.id));
			}
			false
		} else {
			true
		}
	}

	/// Whether received packets still await acknowledgment.
	pub fn acks_owed(&self) -> bool {
		self.rxunacked > 0
	}

	fn process_ack(&mut self, now: Instant, acklow: u64, ackct: u64, timers: &mut Timers<TimerTarget>) -> RxPacket {
		let mut out = RxPacket::default();

		if self.txseq == 1 {
			return out;
		}

		let near = self.txseq - 1;
		let ackseq = reconstruct(near, acklow, 24);

		if ackseq > near {
			debug!("Peer acknowledged sequence {ackseq} beyond our latest {near}");
			return out;
		}

		if ackseq <= self.txackseq {
			return out;
		}

		// The acked range may reach below txackseq: that is how a late
		// acknowledgment rescues a packet already presumed lost.
		let lo = ackseq.saturating_sub(ackct).max(1);
		let mut rtt_sample = None;
		let mut newly_data = 0u32;

		for s in lo..=ackseq {
			let rec = match self.ackwait.remove(&s) {
				Some(rec) => {
					if let TxRec::Stream(r) = rec {
						self.txfltcnt = self.txfltcnt.saturating_sub(1);
						self.txfltsize = self.txfltsize.saturating_sub(u64::from(r.len));
						newly_data += 1;
					}
					rec
				}
				// A late acknowledgment for a packet already presumed lost.
				None => match self.expwait.remove(&s) {
					Some(rec) => rec,
					None => continue,
				},
			};

			if s == self.markseq {
				rtt_sample = Some(now.saturating_duration_since(self.marktime));
			}

			if let TxRec::Stream(r) = rec {
				out.acked.push((s, r));
			}

			self.markacks += 1;
		}

		self.txackseq = ackseq;

		// Anything left below the acknowledged range has been skipped over;
		// past the miss threshold it is presumed lost.
		let mut missed_data = 0u32;
		while let Some((&s, _)) = self.ackwait.first_key_value() {
			if s + self.miss_thresh > ackseq {
				break;
			}

			let rec = self.ackwait.remove(&s).expect("first key exists");

			if let TxRec::Stream(r) = rec {
				self.txfltcnt = self.txfltcnt.saturating_sub(1);
				self.txfltsize = self.txfltsize.saturating_sub(u64::from(r.len));
				missed_data += 1;
				out.missed.push(r);
				self.expwait.insert(s, rec);
			}
		}

		if missed_data > 0 && ackseq >= self.recovseq {
			// One window reduction per round trip of losses.
			self.cc.on_missed(missed_data, self.txfltcnt);
			self.recovseq = self.txseq;
		}

		if newly_data > 0 {
			self.cc.on_acked(newly_data, self.txfltcnt);
		}

		// Packets presumed lost long ago fall off the expiry window.
		while let Some((&s, &rec)) = self.expwait.first_key_value() {
			if s + MASK_BITS > self.txackseq {
				break;
			}
			self.expwait.remove(&s);
			if let TxRec::Stream(r) = rec {
				out.expired.push(r);
			}
		}

		if let Some(sample) = rtt_sample {
			self.srtt = (self.srtt * 7 + sample) / 8;
			let dev = if self.srtt > sample { self.srtt - sample } else { sample - self.srtt };
			self.rttvar = (self.rttvar * 3 + dev) / 4;
			self.cc.on_round_trip(sample, self.marksent, self.markacks);
			self.markseq = 0;
		}

		if matches!(self.state, ChanState::Stalled | ChanState::Fresh) {
			self.state = ChanState::Active;
			out.status = Some(LinkStatus::Up);
		}

		// Forward progress: restart the retransmit clock from scratch.
		timers.stop(self.rtx_timer);
		self.rtx_timer = TimerKey::default();

		if self.ackwait.values().any(|r| matches!(r, TxRec::Stream(_))) {
			self.rtx_timer = timers.retry(now, self.rto(), RETRY_MAX, Some(self.fail_max), TimerTarget::ChanRtx(self.id));
		}

		out
	}

	/// The retransmission timer fired. On a soft fire the oldest unacked
	/// packet is declared lost; on hard failure the channel closes.
	pub fn on_rtx_timeout(&mut self, now: Instant, failed: bool, timers: &mut Timers<TimerTarget>) -> RtxOut {
		let mut out = RtxOut::default();

		if self.state == ChanState::Closed {
			return out;
		}

		if failed {
			warn!("Channel {} to {} hard-failed, going down", self.local_chan, self.remote_ep);

			// Everything still unacknowledged is lost with the channel;
			// hand it back so streams can retransmit elsewhere.
			for (_, rec) in core::mem::take(&mut self.ackwait).into_iter().chain(core::mem::take(&mut self.expwait)) {
				if let TxRec::Stream(r) = rec {
					out.missed.push(r);
				}
			}

			self.close(timers);
			out.status = Some(LinkStatus::Down);
			out.closed = true;
			return out;
		}

		// Bare acks are never retransmitted; lose them silently and find the
		// oldest unacked packet that actually carried data.
		while let Some((&s, &rec)) = self.ackwait.first_key_value() {
			self.ackwait.remove(&s);

			if let TxRec::Stream(r) = rec {
				self.txfltcnt = self.txfltcnt.saturating_sub(1);
				self.txfltsize = self.txfltsize.saturating_sub(u64::from(r.len));
				out.missed.push(r);
				self.expwait.insert(s, rec);
				self.cc.on_missed(1, self.txfltcnt);
				break;
			}
		}

		// A timeout invalidates the outstanding RTT mark.
		self.markseq = 0;

		self.state = ChanState::Stalled;
		out.status = Some(LinkStatus::Stalled);

		timers.restart(self.rtx_timer, now);
		out
	}

	/// The delayed-ack timer fired; returns whether an acknowledgment is
	/// still owed.
	pub fn on_ack_timeout(&mut self) -> bool {
		self.ack_timer = TimerKey::default();
		self.rxunacked > 0
	}

	pub fn close(&mut self, timers: &mut Timers<TimerTarget>) {
		timers.stop(self.rtx_timer);
		timers.stop(self.ack_timer);
		self.rtx_timer = TimerKey::default();
		self.ack_timer = TimerKey::default();
		self.state = ChanState::Closed;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sock::Link;
	use crate::strm::mux::Mux;

	struct NullLink;

	impl Link for NullLink {
		fn send(&mut self, _: Endpoint, _: &[u8]) -> bool {
			true
		}

		fn local_endpoints(&self) -> Vec<Endpoint> {
			Vec::new()
		}
	}

	fn chan(now: Instant) -> (Channel, SocketLayer, Timers<TimerTarget>) {
		let cfg = HostConfig::default();

		let params = ChanParams {
			peer: Eid::default(),
			remote_ep: "10.0.0.9:1".parse().unwrap(),
			local_chan: 1,
			remote_chan: 1,
			tx_chanid: [1; 8],
			rx_chanid: [2; 8],
			initiator: true,
			keys: ChanKeys {
				tx_enc: vec![1; 16],
				tx_mac: [2; 32],
				rx_enc: vec![3; 16],
				rx_mac: [4; 32],
			},
		};

		let c = Channel::new(0, params, &cfg, Mux::new(0), now);
		(c, SocketLayer::new(Box::new(NullLink)), Timers::new())
	}

	fn data_rec(tsn: u64, len: u32) -> TxRec {
		TxRec::Stream(StreamTxRec { stream: 1, kind: TxKind::Data, tsn, len, slot: 0 })
	}

	#[test]
	fn sequences_strictly_increase() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		let a = c.transmit(now, b"x", data_rec(0, 1), &mut sock, &mut timers);
		let b = c.transmit(now, b"y", data_rec(1, 1), &mut sock, &mut timers);
		assert!(b > a);
		assert_eq!(c.in_flight(), 2);
	}

	#[test]
	fn ack_processing_acks_and_detects_misses() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		for i in 0..5u64 {
			c.transmit(now, b"abc", data_rec(i * 3, 3), &mut sock, &mut timers);
		}
		assert_eq!(c.in_flight(), 5);

		// Peer reports ack_seq=5, ack_count=2: 4 and 5 acked and 3 covered,
		// sequences 1..=2 fall below the miss threshold.
		let out = c.process_ack(now, 5, 2, &mut timers);

		let acked: Vec<u64> = out.acked.iter().map(|(s, _)| *s).collect();
		assert_eq!(acked, vec![3, 4, 5]);
		assert_eq!(out.missed.len(), 2);
		assert_eq!(c.in_flight(), 0);
		assert_eq!(c.txackseq, 5);
	}

	#[test]
	fn late_ack_recovers_missed_packet() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		for i in 0..4u64 {
			c.transmit(now, b"ab", data_rec(i * 2, 2), &mut sock, &mut timers);
		}

		// Sequence 1 skipped: missed.
		let out = c.process_ack(now, 3, 1, &mut timers);
		assert_eq!(out.missed.len(), 1);

		// It then arrives late and is reported acked from the expiry window.
		let out = c.process_ack(now, 4, 3, &mut timers);
		let acked: Vec<u64> = out.acked.iter().map(|(s, _)| *s).collect();
		assert!(acked.contains(&1));
	}

	#[test]
	fn stall_and_recover() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		c.transmit(now, b"hello", data_rec(0, 5), &mut sock, &mut timers);

		let out = c.on_rtx_timeout(now, false, &mut timers);
		assert_eq!(out.status, Some(LinkStatus::Stalled));
		assert_eq!(out.missed.len(), 1);
		assert_eq!(c.state, ChanState::Stalled);

		// Retransmit and get an ack: back to active.
		c.transmit(now, b"hello", data_rec(0, 5), &mut sock, &mut timers);
		let out = c.process_ack(now, 2, 0, &mut timers);
		assert_eq!(out.status, Some(LinkStatus::Up));
		assert_eq!(c.state, ChanState::Active);
	}

	#[test]
	fn hard_failure_closes() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		c.transmit(now, b"hello", data_rec(0, 5), &mut sock, &mut timers);

		let out = c.on_rtx_timeout(now, true, &mut timers);
		assert!(out.closed);
		assert_eq!(out.status, Some(LinkStatus::Down));
		assert_eq!(c.state, ChanState::Closed);
		assert_eq!(c.may_transmit(), 0);
	}

	#[test]
	fn in_flight_never_exceeds_cwnd() {
		let now = Instant::now();
		let (mut c, mut sock, mut timers) = chan(now);

		let mut sent = 0u64;
		loop {
			let allow = c.may_transmit();
			if allow == 0 {
				break;
			}
			for _ in 0..allow {
				c.transmit(now, b"z", data_rec(sent, 1), &mut sock, &mut timers);
				sent += 1;
			}
			assert!(c.in_flight() <= c.cc.window());
			if sent > 10_000 {
				break;
			}
		}

		assert!(c.in_flight() <= c.cc.window());
	}
}
