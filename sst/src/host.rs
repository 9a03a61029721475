//! The host context: all per-host protocol state, owned by one value and
//! driven from a single event-loop thread.
//!
//! Nothing here blocks. Entry points take an explicit `Instant` so the
//! embedding chooses the clock: the UDP node feeds wall-clock time, the
//! test harness virtual time. Completion is signaled through the event
//! queue drained by `take_events`.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use core::time::Duration;
use hashbrown::HashMap;
use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use slab::Slab;

use crate::chan::cc::CcMode;
use crate::chan::Channel;
use crate::error::Error;
use crate::ident::{Eid, Ident};
use crate::key::{Initiator, Responder, HKR_ROTATE};
use crate::peer::Peer;
use crate::sock::{Dispatch, Endpoint, Link, Receiver, SocketLayer};
use crate::strm::dgram::DgramStream;
use crate::strm::mux::Mux;
use crate::strm::proto::{self, ConnectRequest};
use crate::strm::stream::{ShutdownMode, Stream, StreamState};
use crate::timer::{Timers, FAIL_MAX, RETRY_MAX, RETRY_MIN};

/// Default UDP port.
pub const DEFAULT_PORT: u16 = 8661;

/// Recognized configuration knobs.
pub struct HostConfig {
	/// Default UDP bind port (the node falls back to an ephemeral port).
	pub port: u16,
	/// Persisted identity: EID plus the 32-byte signing seed. Generated
	/// when absent.
	pub identity: Option<(Eid, [u8; 32])>,
	pub cc_mode: CcMode,
	/// Pinned window for `CcMode::Fixed`.
	pub cc_fixed_window: u32,
	pub delayed_ack: bool,
	pub retry_min: Duration,
	pub retry_max: Duration,
	pub fail_max: Duration,
	pub receive_buffer: u64,
	pub child_receive_buffer: u64,
	/// Seed for deterministic operation under test; None uses OS entropy.
	pub rng_seed: Option<u64>,
}

impl Default for HostConfig {
	fn default() -> Self {
		Self {
			port: DEFAULT_PORT,
			identity: None,
			cc_mode: CcMode::Reno,
			cc_fixed_window: 64,
			delayed_ack: true,
			retry_min: RETRY_MIN,
			retry_max: RETRY_MAX,
			fail_max: FAIL_MAX,
			receive_buffer: proto::DEFAULT_RECEIVE_BUFFER as u64,
			child_receive_buffer: proto::DEFAULT_RECEIVE_BUFFER as u64,
			rng_seed: None,
		}
	}
}

/// Handle to a stream in the host's stream table. Stale handles (the
/// stream died and its slot was reused) are detected by generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StreamRef {
	pub(crate) idx: u32,
	pub(crate) gen: u32,
}

/// Events surfaced to the application, delivered from the event loop.
#[derive(Clone, Debug)]
pub enum Event {
	LinkUp { peer: Eid },
	LinkStalled { peer: Eid },
	LinkDown { peer: Eid },
	/// An outgoing connect attempt failed; `fatal` marks identity
	/// mismatches that must not be retried.
	ConnectFailed { peer: Eid, fatal: bool },
	/// A top-level stream finished service negotiation.
	Connected { stream: StreamRef },
	/// A peer connected to a registered service; retrieve it with
	/// `accept`.
	IncomingConnection { service: String, protocol: String },
	NewSubstream { stream: StreamRef },
	ReadyRead { stream: StreamRef },
	ReadyReadMessage { stream: StreamRef },
	ReadyReadDatagram { stream: StreamRef },
	ReadyWrite { stream: StreamRef },
	Reset { stream: StreamRef, reason: &'static str },
}

/// Timer dispatch targets.
#[derive(Clone, Debug)]
pub enum TimerTarget {
	ChanRtx(usize),
	ChanAck(usize),
	KeyRetry(usize),
	PeerRecon(Eid),
	HkrRotate,
}

pub(crate) enum StreamKind {
	Stream(Box<Stream>),
	Dgram(DgramStream),
}

pub(crate) struct StreamEnt {
	pub gen: u32,
	pub kind: StreamKind,
}

impl StreamEnt {
	pub fn stream(&self) -> Option<&Stream> {
		match &self.kind {
			StreamKind::Stream(s) => Some(s),
			StreamKind::Dgram(_) => None,
		}
	}

	pub fn stream_mut(&mut self) -> Option<&mut Stream> {
		match &mut self.kind {
			StreamKind::Stream(s) => Some(s),
			StreamKind::Dgram(_) => None,
		}
	}
}

pub(crate) struct Listener {
	pub queue: VecDeque<usize>,
}

/// Channel figures exposed for monitoring.
#[derive(Clone, Copy, Debug)]
pub struct LinkInfo {
	pub cwnd: u32,
	pub in_flight: u32,
	pub remote: Endpoint,
}

/// Table sizes exposed for monitoring.
#[derive(Clone, Copy, Debug)]
pub struct HostStats {
	pub channels: usize,
	pub streams: usize,
	pub peers: usize,
	pub pending_exchanges: usize,
	pub cached_exchanges: usize,
}

pub struct Host {
	pub(crate) cfg: HostConfig,
	pub(crate) ident: Ident,
	pub(crate) sock: SocketLayer,
	pub(crate) timers: Timers<TimerTarget>,
	pub(crate) chans: Slab<Channel>,
	pub(crate) streams: Slab<StreamEnt>,
	pub(crate) peers: HashMap<Eid, Peer>,
	pub(crate) listeners: HashMap<(String, String), Listener>,
	pub(crate) responder: Responder,
	pub(crate) initiators: Slab<Initiator>,
	pub(crate) events: VecDeque<Event>,
	pub(crate) rng: SmallRng,
	gen: u32,
}

impl Host {
	pub fn new(cfg: HostConfig, link: Box<dyn Link>, now: Instant) -> Self {
		let mut rng = match cfg.rng_seed {
			Some(seed) => SmallRng::seed_from_u64(seed),
			None => SmallRng::from_entropy(),
		};

		let ident = match cfg.identity {
			Some((ref eid, seed)) => match Ident::from_secret(eid.clone(), seed) {
				Ok(id) => id,
				Err(e) => {
					warn!("Configured identity is invalid ({e}), generating a new one");
					Ident::generate(&mut rng)
				}
			},
			None => Ident::generate(&mut rng),
		};

		let responder = Responder::new(&mut rng, now);

		let mut timers = Timers::new();
		timers.once(now, HKR_ROTATE, TimerTarget::HkrRotate);

		Self {
			cfg,
			ident,
			sock: SocketLayer::new(link),
			timers,
			chans: Slab::new(),
			streams: Slab::new(),
			peers: HashMap::new(),
			listeners: HashMap::new(),
			responder,
			initiators: Slab::new(),
			events: VecDeque::new(),
			rng,
			gen: 0,
		}
	}

	pub fn eid(&self) -> &Eid {
		self.ident.eid()
	}

	pub fn local_endpoints(&self) -> Vec<Endpoint> {
		self.sock.local_endpoints()
	}

	// ----- driver entry points -----

	/// Deliver one received datagram.
	pub fn receive(&mut self, now: Instant, src: Endpoint, msg: Bytes) {
		self.advance(now);

		match self.sock.dispatch(src, &msg) {
			Dispatch::Flow(cid) => self.receive_flow(now, cid, &msg),
			Dispatch::Control(Receiver::KeyExchange) => self.handle_key_message(now, src, msg),
			Dispatch::Discard => {}
		}
	}

	fn receive_flow(&mut self, now: Instant, cid: usize, msg: &[u8]) {
		let Some(chan) = self.chans.get_mut(cid) else { return };

		let Some(rx) = chan.receive(now, msg, &mut self.timers) else { return };

		self.apply_recs(now, cid, &rx.acked, &rx.missed);

		// The stream layer may refuse the packet (None), in which case it
		// is never acknowledged and the peer retransmits its contents.
		let verdict = if rx.payload.is_empty() {
			Some(false)
		} else {
			self.receive_stream(now, cid, rx.seq, rx.payload.clone())
		};

		let mut ack_now = false;
		if let Some(wants_ack) = verdict {
			if let Some(chan) = self.chans.get_mut(cid) {
				ack_now = chan.acknowledge(now, rx.seq, wants_ack, &mut self.timers);
			}
		}

		if let Some(status) = rx.status {
			self.peer_link_status(now, cid, status);
		}

		self.pump(now);

		// If the transmit pump did not piggyback the acknowledgment on
		// anything, send a bare ack.
		if ack_now && self.chans.get(cid).is_some_and(|c| c.acks_owed()) {
			self.send_bare_ack(now, cid);
		}
	}

	/// Fire all timers due at `now`.
	pub fn advance(&mut self, now: Instant) {
		loop {
			let fired = self.timers.expire(now);
			if fired.is_empty() {
				break;
			}

			for (_key, target, failed) in fired {
				self.dispatch_timer(now, target, failed);
			}
		}
	}

	/// The next instant at which `advance` has work to do.
	pub fn next_timeout(&self) -> Option<Instant> {
		self.timers.next_deadline()
	}

	pub fn take_events(&mut self) -> Vec<Event> {
		self.events.drain(..).collect()
	}

	pub(crate) fn push_event(&mut self, ev: Event) {
		self.events.push_back(ev);
	}

	fn dispatch_timer(&mut self, now: Instant, target: TimerTarget, failed: bool) {
		match target {
			TimerTarget::ChanRtx(cid) => {
				let Some(chan) = self.chans.get_mut(cid) else { return };
				let out = chan.on_rtx_timeout(now, failed, &mut self.timers);

				if let Some(status) = out.status {
					self.peer_link_status(now, cid, status);
				}

				// Tear a dead channel down before requeueing its losses so
				// the retransmits land on whatever attachment remains.
				if out.closed {
					self.teardown_channel(now, cid);
				}

				for rec in &out.missed {
					self.stream_tx_missed(now, rec);
				}

				if !out.closed {
					self.pump(now);
				}
			}
			TimerTarget::ChanAck(cid) => {
				let owed = self.chans.get_mut(cid).is_some_and(|c| c.on_ack_timeout());
				if owed {
					self.send_bare_ack(now, cid);
				}
			}
			TimerTarget::KeyRetry(idx) => self.on_key_retry(now, idx, failed),
			TimerTarget::PeerRecon(eid) => self.on_peer_recon(now, eid),
			TimerTarget::HkrRotate => {
				self.responder.rotate(&mut self.rng, now);
				self.timers.once(now, HKR_ROTATE, TimerTarget::HkrRotate);
			}
		}
	}

	// ----- stream table plumbing -----

	pub(crate) fn insert_stream(&mut self, s: Stream) -> usize {
		self.gen += 1;
		let gen = self.gen;
		self.streams.insert(StreamEnt { gen, kind: StreamKind::Stream(Box::new(s)) })
	}

	pub(crate) fn insert_dgram(&mut self, d: DgramStream) -> usize {
		self.gen += 1;
		let gen = self.gen;
		self.streams.insert(StreamEnt { gen, kind: StreamKind::Dgram(d) })
	}

	pub(crate) fn stream_ref(&self, idx: usize) -> StreamRef {
		StreamRef { idx: idx as u32, gen: self.streams[idx].gen }
	}

	fn resolve(&self, r: StreamRef) -> Result<usize, Error> {
		let idx = r.idx as usize;
		match self.streams.get(idx) {
			Some(ent) if ent.gen == r.gen => Ok(idx),
			_ => Err(Error::StaleHandle),
		}
	}

	pub(crate) fn stream(&self, idx: usize) -> Option<&Stream> {
		self.streams.get(idx).and_then(|e| e.stream())
	}

	pub(crate) fn stream_mut(&mut self, idx: usize) -> Option<&mut Stream> {
		self.streams.get_mut(idx).and_then(|e| e.stream_mut())
	}

	// ----- channel installation and teardown -----

	#[allow(clippy::too_many_arguments)]
	pub(crate) fn install_channel(
		&mut self,
		now: Instant,
		peer_key: Eid,
		ep: Endpoint,
		local_chan: u8,
		remote_chan: u8,
		sched: &crate::key::KeySchedule,
		initiator: bool,
	) -> Option<usize> {
		let (tx_chanid, rx_chanid) = sched.chan_ids(initiator);

		// Every channel owns a root stream: stream id 0 in both directions,
		// parent of top-level streams, never visible to the application.
		let mut root = Stream::new(peer_key.clone(), None, self.cfg.receive_buffer, self.cfg.child_receive_buffer);
		root.is_root = true;
		root.state = StreamState::Connected;
		root.usid = Some(proto::Usid { ctr: 0, chan: tx_chanid });
		let root_idx = self.insert_stream(root);

		let cid = self.chans.vacant_key();

		let params = crate::chan::ChanParams {
			peer: peer_key.clone(),
			remote_ep: ep,
			local_chan,
			remote_chan,
			tx_chanid,
			rx_chanid,
			initiator,
			keys: sched.chan_keys(initiator),
		};

		let chan = Channel::new(cid, params, &self.cfg, Mux::new(root_idx), now);
		self.chans.insert(chan);

		self.sock.unbind_flow(ep, local_chan);
		if !self.sock.bind_flow(ep, local_chan, cid) {
			warn!("Could not bind local channel {local_chan} for {ep}");
			self.chans.remove(cid);
			self.streams.remove(root_idx);
			return None;
		}

		debug!("Installed channel {local_chan}<->{remote_chan} with {peer_key} at {ep}");

		self.peer_channel_started(now, cid);
		Some(cid)
	}

	/// Remove a closed channel: detach its streams (their unacked data is
	/// requeued for whatever channel they attach to next) and unbind it.
	pub(crate) fn teardown_channel(&mut self, now: Instant, cid: usize) {
		let Some(chan) = self.chans.get_mut(cid) else { return };
		chan.close(&mut self.timers);

		let ep = chan.remote_ep;
		let local_chan = chan.local_chan;
		let root = chan.mux.root;

		self.detach_channel(now, cid);

		self.sock.unbind_flow(ep, local_chan);
		self.chans.remove(cid);
		self.streams.remove(root);
	}

	// ----- application API -----

	/// Register a service listener.
	pub fn listen(&mut self, service: &str, protocol: &str) {
		self.listeners
			.entry((service.to_owned(), protocol.to_owned()))
			.or_insert_with(|| Listener { queue: VecDeque::new() });
	}

	/// Take the next accepted top-level stream for a service.
	pub fn accept(&mut self, service: &str, protocol: &str) -> Option<StreamRef> {
		let l = self.listeners.get_mut(&(service.to_owned(), protocol.to_owned()))?;
		let idx = l.queue.pop_front()?;
		Some(self.stream_ref(idx))
	}

	/// Begin connecting a new top-level stream to `service`/`protocol` on
	/// the host identified by `eid`, optionally hinting a network location.
	pub fn connect_to(
		&mut self,
		now: Instant,
		eid: Eid,
		service: &str,
		protocol: &str,
		hint: Option<Endpoint>,
	) -> Result<StreamRef, Error> {
		if eid.is_null() {
			return Err(Error::Invalid("null peer EID"));
		}
		if service.len() + protocol.len() > proto::MAX_SERVICE_MSG - 16 {
			return Err(Error::Invalid("service name too long"));
		}

		let mut s = Stream::new(eid.clone(), None, self.cfg.receive_buffer, self.cfg.child_receive_buffer);
		s.top_level = true;
		s.state = StreamState::WaitService;
		let tsn: u16 = self.rng.gen();
		s.set_init_tsn(tsn);

		// The connect request is the first message on the stream.
		let req = ConnectRequest { service: service.to_owned(), protocol: protocol.to_owned() }.encode();
		s.enqueue(&req, proto::DATA_MESSAGE | proto::DATA_PUSH);

		let idx = self.insert_stream(s);

		let peer = self.peer_entry(eid.clone());
		peer.streams.insert(idx);
		if let Some(h) = hint {
			peer.addrs.insert(h);
		}

		self.connect_peer(now, eid.clone());

		// If a usable primary channel already exists, attach immediately.
		if let Some(cid) = self.peers.get(&eid).and_then(|p| p.primary) {
			if self.chans.get(cid).is_some_and(|c| c.is_usable()) {
				self.tattach(now, cid, idx);
				self.pump(now);
			}
		}

		Ok(self.stream_ref(idx))
	}

	pub fn is_connected(&self, r: StreamRef) -> bool {
		self.resolve(r)
			.ok()
			.and_then(|i| self.stream(i))
			.is_some_and(|s| s.state == StreamState::Connected)
	}

	pub fn bytes_available(&self, r: StreamRef) -> Result<u64, Error> {
		let idx = self.resolve(r)?;
		match &self.streams[idx].kind {
			StreamKind::Stream(s) => Ok(s.bytes_available()),
			StreamKind::Dgram(d) => Ok(d.remaining() as u64),
		}
	}

	pub fn pending_messages(&self, r: StreamRef) -> Result<usize, Error> {
		let idx = self.resolve(r)?;
		match &self.streams[idx].kind {
			StreamKind::Stream(s) => Ok(s.pending_messages()),
			StreamKind::Dgram(d) => Ok(usize::from(!d.at_end())),
		}
	}

	pub fn at_end(&self, r: StreamRef) -> Result<bool, Error> {
		let idx = self.resolve(r)?;
		match &self.streams[idx].kind {
			StreamKind::Stream(s) => Ok(s.at_end()),
			StreamKind::Dgram(d) => Ok(d.at_end()),
		}
	}

	/// Queue bytes for ordered delivery. Returns how many were accepted;
	/// zero means the peer's window is closed (a `ReadyWrite` event will
	/// follow when it opens).
	pub fn write_bytes(&mut self, now: Instant, r: StreamRef, data: &[u8]) -> Result<usize, Error> {
		let idx = self.resolve(r)?;
		let s = self.stream_mut(idx).ok_or(Error::Disconnected)?;

		if s.state == StreamState::Disconnected {
			return Err(Error::Reset(s.reset_reason.unwrap_or("disconnected")));
		}
		if s.endwrite {
			return Err(Error::WriteClosed);
		}

		let n = s.enqueue(data, 0);
		self.kick_stream(now, idx);
		Ok(n)
	}

	/// Write one atomic message record.
	pub fn write_message(&mut self, now: Instant, r: StreamRef, data: &[u8]) -> Result<(), Error> {
		let idx = self.resolve(r)?;
		let s = self.stream_mut(idx).ok_or(Error::Disconnected)?;

		if s.state == StreamState::Disconnected {
			return Err(Error::Reset(s.reset_reason.unwrap_or("disconnected")));
		}
		if s.endwrite {
			return Err(Error::WriteClosed);
		}
		if s.write_capacity() < data.len() as u64 {
			s.wblocked = true;
			return Err(Error::Exhausted("transmit window"));
		}

		s.enqueue(data, proto::DATA_MESSAGE | proto::DATA_PUSH);
		self.kick_stream(now, idx);
		Ok(())
	}

	pub fn read_bytes(&mut self, now: Instant, r: StreamRef, max: usize) -> Result<Bytes, Error> {
		let idx = self.resolve(r)?;

		let out = match &mut self.streams[idx].kind {
			StreamKind::Stream(s) => s.read_bytes(max),
			StreamKind::Dgram(d) => d.read_bytes(max),
		};

		self.after_read(now, idx);
		Ok(out)
	}

	pub fn read_message(&mut self, now: Instant, r: StreamRef) -> Result<Option<Bytes>, Error> {
		let idx = self.resolve(r)?;

		let out = match &mut self.streams[idx].kind {
			StreamKind::Stream(s) => s.read_message(),
			StreamKind::Dgram(d) => d.read_message(),
		};

		self.after_read(now, idx);
		Ok(out)
	}

	/// Window changes after a read are advertised promptly.
	fn after_read(&mut self, now: Instant, idx: usize) {
		let dirty = self.stream(idx).is_some_and(|s| s.win_dirty);
		if dirty {
			self.send_window_update(now, idx);
			self.pump(now);
		}
	}

	/// Open a hierarchical substream. The substream is created immediately;
	/// its announcement to the peer may be deferred by the parent's
	/// substream window.
	pub fn open_substream(&mut self, now: Instant, r: StreamRef) -> Result<StreamRef, Error> {
		let pidx = self.resolve(r)?;
		let parent = self.stream(pidx).ok_or(Error::Disconnected)?;

		if parent.state != StreamState::Connected {
			return Err(Error::Disconnected);
		}
		let peer = parent.peer.clone();

		let mut child = Stream::new(peer.clone(), Some(pidx), self.cfg.child_receive_buffer, self.cfg.child_receive_buffer);
		child.state = StreamState::Connected;
		let tsn: u16 = self.rng.gen();
		child.set_init_tsn(tsn);

		let cidx = self.insert_stream(child);
		self.peer_entry(peer).streams.insert(cidx);

		// Admission rides the parent's substream window: the child exists
		// immediately, but its announcement waits its turn.
		let parent = self.stream_mut(pidx).expect("parent exists");
		parent.wait_children.push_back(cidx);
		self.drain_children(now, pidx);
		self.pump(now);

		Ok(self.stream_ref(cidx))
	}

	/// Take the next substream the peer opened under `r`.
	pub fn accept_substream(&mut self, r: StreamRef) -> Result<Option<StreamRef>, Error> {
		let pidx = self.resolve(r)?;
		let parent = self.stream_mut(pidx).ok_or(Error::Disconnected)?;

		let Some(idx) = parent.rsubs.pop_front() else { return Ok(None) };
		Ok(Some(self.stream_ref(idx)))
	}

	/// Read the next datagram addressed to this stream, whether it arrived
	/// stateless or as an ephemeral substream.
	pub fn read_datagram(&mut self, r: StreamRef) -> Result<Option<Bytes>, Error> {
		let pidx = self.resolve(r)?;
		let parent = self.stream_mut(pidx).ok_or(Error::Disconnected)?;

		if let Some(didx) = parent.rdgrams.pop_front() {
			let payload = match &mut self.streams[didx].kind {
				StreamKind::Dgram(d) => d.read_message(),
				StreamKind::Stream(_) => None,
			};
			self.streams.remove(didx);
			return Ok(payload);
		}

		// Reliable datagrams appear as ephemeral substreams carrying one
		// complete, closed message.
		let parent = self.stream_mut(pidx).expect("parent exists");
		let Some(&sidx) = parent.rsubs.front() else { return Ok(None) };

		let sub = self.stream(sidx).ok_or(Error::Disconnected)?;
		if sub.pending_messages() == 0 {
			return Ok(None);
		}

		let payload = self.stream_mut(sidx).expect("substream exists").read_message();

		let done = self.stream(sidx).is_some_and(|s| s.at_end());
		let parent = self.stream_mut(pidx).expect("parent exists");
		if done {
			parent.rsubs.pop_front();
			self.remove_stream(sidx);
		}

		Ok(payload)
	}

	/// Send a datagram. Unreliable datagrams small enough travel stateless
	/// with no retransmission; larger or reliable ones ride an ephemeral
	/// substream.
	pub fn write_datagram(&mut self, now: Instant, r: StreamRef, data: &[u8], reliable: bool) -> Result<(), Error> {
		let idx = self.resolve(r)?;
		let s = self.stream(idx).ok_or(Error::Disconnected)?;

		if s.state == StreamState::Disconnected {
			return Err(Error::Reset(s.reset_reason.unwrap_or("disconnected")));
		}

		if !reliable && data.len() <= proto::MAX_STATELESS_DGRAM {
			if let Some((_, cid)) = s.tx_slot_usable() {
				// Only go stateless when the whole fragment burst fits the
				// congestion budget right now; split bursts cannot
				// reassemble.
				let frags = Self::dgram_fragments(data.len());
				let fits = self.chans.get_mut(cid).is_some_and(|c| c.may_transmit() >= frags);

				if fits {
					self.send_dgram_stateless(now, cid, idx, data);
					return Ok(());
				}
			}
		}

		let sub = self.open_substream(now, r)?;
		self.write_message(now, sub, data)?;
		self.shutdown(now, sub, ShutdownMode::Write)?;
		Ok(())
	}

	pub fn shutdown(&mut self, now: Instant, r: StreamRef, mode: ShutdownMode) -> Result<(), Error> {
		let idx = self.resolve(r)?;
		let s = self.stream_mut(idx).ok_or(Error::Disconnected)?;

		match mode {
			ShutdownMode::Read => s.shutdown_read(),
			ShutdownMode::Write => {
				s.shutdown_write();
				self.kick_stream(now, idx);
			}
			ShutdownMode::Close => {
				s.shutdown_read();
				s.shutdown_write();
				self.kick_stream(now, idx);
			}
			ShutdownMode::Reset => {
				self.reset_stream(now, idx, "reset by application");
			}
		}

		Ok(())
	}

	/// Supply an endpoint hint for a peer, e.g. from an out-of-band lookup.
	pub fn add_location_hint(&mut self, now: Instant, eid: Eid, ep: Endpoint) {
		let peer = self.peer_entry(eid.clone());
		peer.addrs.insert(ep);

		// A hint arriving during connection attempts triggers a fresh
		// initiator to the new endpoint immediately.
		let wants = self.peers[&eid].connecting;
		if wants {
			self.start_initiator(now, eid, ep);
		}
	}

	// ----- internal helpers shared with the stream/peer modules -----

	/// A stream gained transmittable work; make sure it is scheduled and
	/// the pump runs.
	pub(crate) fn kick_stream(&mut self, now: Instant, idx: usize) {
		let Some(s) = self.stream(idx) else { return };

		if let Some((_, cid)) = s.tx_slot_usable() {
			self.schedule_stream(cid, idx);
			self.pump(now);
		} else if s.attached_anywhere() {
			// Binding still in flight; the pump will pick the stream up
			// once the attachment completes.
		} else if s.parent.is_none() {
			// An unattached top-level stream binds straight to the primary.
			// Substreams instead wait for their parent's admission window.
			let peer = s.peer.clone();
			if let Some(cid) = self.peer_primary(&peer) {
				self.tattach(now, cid, idx);
				self.pump(now);
			}
		}
	}

	pub(crate) fn rng_u16(&mut self) -> u16 {
		self.rng.gen()
	}

	pub(crate) fn rng_fill(&mut self, buf: &mut [u8]) {
		self.rng.fill_bytes(buf);
	}

	// ----- monitoring -----

	/// Channel-level figures for a peer's current primary.
	pub fn link_info(&self, eid: &Eid) -> Option<LinkInfo> {
		let cid = self.peer_primary(eid)?;
		let c = self.chans.get(cid)?;

		Some(LinkInfo {
			cwnd: c.cc.window(),
			in_flight: c.in_flight(),
			remote: c.remote_ep,
		})
	}

	/// Coarse table sizes, for monitoring and resource assertions.
	pub fn stats(&self) -> HostStats {
		HostStats {
			channels: self.chans.len(),
			streams: self.streams.len(),
			peers: self.peers.len(),
			pending_exchanges: self.initiators.len(),
			cached_exchanges: self.responder.recent_len(),
		}
	}

	/// Remove a dead stream from every table that references it.
	pub(crate) fn remove_stream(&mut self, idx: usize) {
		let Some(ent) = self.streams.get(idx) else { return };

		if let Some(s) = ent.stream() {
			let peer = s.peer.clone();
			let usid = s.usid;

			if let Some(p) = self.peers.get_mut(&peer) {
				p.streams.remove(&idx);
				if let Some(u) = usid {
					p.usids.remove(&u);
				}
			}
		}

		self.streams.remove(idx);
	}
}
