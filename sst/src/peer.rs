//! Peer management: for every remote EID the host cares about, track the
//! candidate network locations, in-progress key exchanges, and the current
//! primary channel, and drive replacement when the primary degrades.

use core::time::Duration;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};

use crate::chan::LinkStatus;
use crate::host::{Event, Host, TimerTarget};
use crate::ident::{Eid, Scheme};
use crate::sock::Endpoint;
use crate::strm::proto::Usid;
use crate::timer::TimerKey;

/// Consecutive stall warnings from the primary before we hunt for a
/// replacement channel in parallel.
const STALL_MAX: u32 = 3;

/// Retry period for persistent reconnection attempts.
const RECON_RETRY: Duration = Duration::from_secs(60);

pub(crate) struct Peer {
	pub id: Eid,
	/// The cryptographic identity actually verified on the wire, when the
	/// peer was named by a non-cryptographic EID.
	pub verified: Option<Eid>,
	/// Candidate network locations, from hints, lookups, and traffic.
	pub addrs: HashSet<Endpoint>,
	/// In-progress key exchanges, by target endpoint.
	pub initiators: HashMap<Endpoint, usize>,
	pub primary: Option<usize>,
	pub stallcount: u32,
	pub recon_timer: TimerKey,
	/// The application asked for connectivity to this peer.
	pub connecting: bool,
	/// Every stream referencing this peer.
	pub streams: HashSet<usize>,
	/// Streams by unique id, for reattachment across channels.
	pub usids: HashMap<Usid, usize>,
}

impl Peer {
	fn new(id: Eid) -> Self {
		Self {
			id,
			verified: None,
			addrs: HashSet::new(),
			initiators: HashMap::new(),
			primary: None,
			stallcount: 0,
			recon_timer: TimerKey::default(),
			connecting: false,
			streams: HashSet::new(),
			usids: HashMap::new(),
		}
	}
}

impl Host {
	pub(crate) fn peer_entry(&mut self, eid: Eid) -> &mut Peer {
		self.peers.entry(eid.clone()).or_insert_with(|| Peer::new(eid))
	}

	/// A usable primary channel for a peer, if one exists.
	pub(crate) fn peer_primary(&self, eid: &Eid) -> Option<usize> {
		let cid = self.peers.get(eid)?.primary?;
		self.chans.get(cid).filter(|c| c.is_usable()).map(|c| c.id)
	}

	/// Drive connection establishment: start a key exchange toward every
	/// candidate endpoint that does not already have one in flight.
	pub(crate) fn connect_peer(&mut self, now: Instant, eid: Eid) {
		if self.peer_primary(&eid).is_some() {
			return;
		}

		let peer = self.peer_entry(eid.clone());
		peer.connecting = true;

		// A legacy address EID is its own location hint.
		if eid.scheme() == Some(Scheme::Ip) {
			if let Some(ep) = eid.ip_endpoint() {
				peer.addrs.insert(ep);
			}
		}

		let targets: Vec<Endpoint> = peer.addrs.iter().copied().collect();

		if targets.is_empty() {
			debug!("No known endpoints for {eid}; waiting for hints");
			self.arm_recon(now, eid);
			return;
		}

		for ep in targets {
			self.start_initiator(now, eid.clone(), ep);
		}
	}

	fn arm_recon(&mut self, now: Instant, eid: Eid) {
		let key = self.timers.once(now, RECON_RETRY, TimerTarget::PeerRecon(eid.clone()));
		self.peer_entry(eid).recon_timer = key;
	}

	/// Persistent-retry timer: as long as streams keep the peer alive and
	/// no primary exists, keep trying.
	pub(crate) fn on_peer_recon(&mut self, now: Instant, eid: Eid) {
		let Some(peer) = self.peers.get(&eid) else { return };

		if peer.streams.is_empty() || !peer.connecting {
			return;
		}

		if self.peer_primary(&eid).is_none() {
			self.connect_peer(now, eid.clone());
			self.arm_recon(now, eid);
		}
	}

	/// A new channel (either direction) finished key exchange.
	pub(crate) fn peer_channel_started(&mut self, now: Instant, cid: usize) {
		let chan = &self.chans[cid];
		let eid = chan.peer.clone();
		let ep = chan.remote_ep;

		let old = {
			let peer = self.peer_entry(eid.clone());
			peer.addrs.insert(ep);
			peer.primary
		};

		let replace = match old {
			None => true,
			Some(o) if o == cid => false,
			// Replace a dead primary, or a stalled one we were hunting a
			// successor for.
			Some(o) => !self.chans.get(o).is_some_and(|c| c.is_usable()) || self.peers[&eid].stallcount >= STALL_MAX,
		};

		if !replace {
			// A redundant channel; leave the current primary alone.
			return;
		}

		let timer = {
			let peer = self.peer_entry(eid.clone());
			peer.primary = Some(cid);
			peer.stallcount = 0;
			core::mem::take(&mut peer.recon_timer)
		};
		self.timers.stop(timer);

		info!("Primary channel for {eid} is now {ep}");
		self.push_event(Event::LinkUp { peer: eid.clone() });

		// Migrate: every stream on this peer opens an attachment on the
		// new primary; old attachments live on until the new ones are
		// acknowledged, then get deprecated.
		self.attach_streams(now, &eid, cid);
		self.pump(now);
	}

	/// Link status observed by a channel, surfaced only for the primary.
	pub(crate) fn peer_link_status(&mut self, now: Instant, cid: usize, status: LinkStatus) {
		let Some(chan) = self.chans.get(cid) else { return };
		let eid = chan.peer.clone();

		let Some(peer) = self.peers.get_mut(&eid) else { return };
		let is_primary = peer.primary == Some(cid);

		match status {
			LinkStatus::Up => {
				if is_primary {
					peer.stallcount = 0;
					self.push_event(Event::LinkUp { peer: eid });
				}
			}
			LinkStatus::Stalled => {
				if !is_primary {
					return;
				}

				peer.stallcount += 1;
				let hunt = peer.stallcount == STALL_MAX;
				self.push_event(Event::LinkStalled { peer: eid.clone() });

				if hunt {
					// Start replacement attempts in parallel without
					// touching the stalled channel.
					warn!("Primary channel for {eid} stalled {STALL_MAX} times, probing for a replacement");
					let targets: Vec<Endpoint> = self.peers[&eid].addrs.iter().copied().collect();
					for ep in targets {
						self.start_initiator(now, eid.clone(), ep);
					}
				}
			}
			LinkStatus::Down => {
				if is_primary {
					peer.primary = None;
					self.push_event(Event::LinkDown { peer: eid.clone() });

					if !self.peers[&eid].streams.is_empty() {
						self.connect_peer(now, eid.clone());
						self.arm_recon(now, eid);
					}
				}
			}
		}
	}

	/// A key exchange attempt ended without a channel.
	pub(crate) fn initiator_failed(&mut self, now: Instant, eid: Eid, ep: Endpoint, fatal: bool) {
		if fatal {
			// Identity mismatch: never reuse this path for the peer, and
			// tell the application loudly.
			warn!("Identity mismatch connecting to {eid} at {ep}");
			self.push_event(Event::ConnectFailed { peer: eid.clone(), fatal: true });

			if let Some(peer) = self.peers.get_mut(&eid) {
				peer.connecting = false;
				peer.addrs.remove(&ep);

				let streams: Vec<usize> = peer.streams.iter().copied().collect();
				for idx in streams {
					self.reset_stream(now, idx, "peer identity mismatch");
				}
			}
			return;
		}

		let Some(peer) = self.peers.get_mut(&eid) else { return };

		if !peer.initiators.is_empty() || peer.primary.is_some() {
			// Other attempts are still running; single failures stay quiet.
			return;
		}

		debug!("All connection attempts to {eid} failed for now");
		self.push_event(Event::ConnectFailed { peer: eid.clone(), fatal: false });

		if !self.peers[&eid].streams.is_empty() {
			self.arm_recon(now, eid);
		}
	}
}
