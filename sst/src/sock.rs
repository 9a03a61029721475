//! Socket layer: datagram transmission and receive-side dispatch.
//!
//! The first byte of every incoming datagram names a local channel number.
//! Non-zero values bound in the flow table deliver to the owning channel;
//! anything else is read as a 32-bit control magic (top byte zero) and
//! dispatched to the registered control receiver. Unknown traffic is
//! dropped with a log entry.

use core::net::SocketAddr;

use hashbrown::HashMap;
use log::{debug, warn};

/// Transport endpoints are plain UDP addresses.
pub type Endpoint = SocketAddr;

/// Control magic for the key exchange / structured stream protocol ("SST").
pub const MAGIC_SST: u32 = 0x0053_5354;

/// Control magic reserved for the registration/rendezvous protocol ("RTR").
pub const MAGIC_RTR: u32 = 0x0052_5452;

/// Registered control receivers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Receiver {
	KeyExchange,
}

/// The network attachment the host sends and receives raw datagrams on.
/// The production implementation wraps a UDP socket; tests substitute an
/// in-process simulator.
pub trait Link {
	/// Send one datagram. Failures are best-effort: implementations log and
	/// return false, and the caller relies on retransmission.
	fn send(&mut self, ep: Endpoint, pkt: &[u8]) -> bool;

	/// All local endpoints this link is reachable at.
	fn local_endpoints(&self) -> Vec<Endpoint>;
}

/// Where an incoming datagram should be delivered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Dispatch {
	/// A bound channel, by channel table index.
	Flow(usize),
	/// A registered control receiver.
	Control(Receiver),
	/// Unrecognized; drop.
	Discard,
}

pub struct SocketLayer {
	link: Box<dyn Link>,
	flows: HashMap<(Endpoint, u8), usize>,
	receivers: HashMap<u32, Receiver>,
}

impl SocketLayer {
	pub fn new(link: Box<dyn Link>) -> Self {
		let mut receivers = HashMap::new();
		receivers.insert(MAGIC_SST, Receiver::KeyExchange);

		Self { link, flows: HashMap::new(), receivers }
	}

	pub fn send(&mut self, ep: Endpoint, pkt: &[u8]) -> bool {
		let ok = self.link.send(ep, pkt);
		if !ok {
			debug!("Send of {} bytes to {ep} failed", pkt.len());
		}
		ok
	}

	pub fn local_endpoints(&self) -> Vec<Endpoint> {
		self.link.local_endpoints()
	}

	pub fn set_link(&mut self, link: Box<dyn Link>) {
		self.link = link;
	}

	/// Classify an incoming datagram per the first-byte rule.
	pub fn dispatch(&self, src: Endpoint, msg: &[u8]) -> Dispatch {
		if let Some(&b0) = msg.first() {
			if b0 != 0 {
				if let Some(&chan) = self.flows.get(&(src, b0)) {
					return Dispatch::Flow(chan);
				}
				// A non-zero first byte with no bound flow cannot be control
				// traffic either (control magics have a zero top byte).
				debug!("Datagram from {src} for unbound channel {b0}");
				return Dispatch::Discard;
			}
		}

		if msg.len() < 4 {
			debug!("Runt datagram ({} bytes) from {src}", msg.len());
			return Dispatch::Discard;
		}

		let magic = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);

		match self.receivers.get(&magic) {
			Some(&r) => Dispatch::Control(r),
			None => {
				warn!("Datagram from {src} with unknown control magic {magic:#010x}");
				Dispatch::Discard
			}
		}
	}

	/// Allocate a free local channel number for the given remote endpoint.
	pub fn alloc_channel(&self, ep: Endpoint) -> Option<u8> {
		(1..=u8::MAX).find(|&c| !self.flows.contains_key(&(ep, c)))
	}

	/// Bind a channel number to a channel table index. Fails if taken.
	pub fn bind_flow(&mut self, ep: Endpoint, chan: u8, id: usize) -> bool {
		if chan == 0 || self.flows.contains_key(&(ep, chan)) {
			return false;
		}
		self.flows.insert((ep, chan), id);
		true
	}

	pub fn unbind_flow(&mut self, ep: Endpoint, chan: u8) {
		self.flows.remove(&(ep, chan));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct NullLink;

	impl Link for NullLink {
		fn send(&mut self, _: Endpoint, _: &[u8]) -> bool {
			true
		}

		fn local_endpoints(&self) -> Vec<Endpoint> {
			vec!["127.0.0.1:1".parse().unwrap()]
		}
	}

	fn ep(s: &str) -> Endpoint {
		s.parse().unwrap()
	}

	#[test]
	fn dispatch_rules() {
		let mut sock = SocketLayer::new(Box::new(NullLink));

		let peer = ep("10.0.0.2:8661");
		assert!(sock.bind_flow(peer, 3, 17));
		assert!(!sock.bind_flow(peer, 3, 18));
		assert!(!sock.bind_flow(peer, 0, 18));

		// Bound channel byte goes to the flow.
		assert_eq!(sock.dispatch(peer, &[3, 0, 0, 0, 5]), Dispatch::Flow(17));
		// Same channel byte from another endpoint does not.
		assert_eq!(sock.dispatch(ep("10.0.0.3:8661"), &[3, 0, 0, 0, 5]), Dispatch::Discard);

		// Control magic with zero top byte.
		let mut msg = MAGIC_SST.to_be_bytes().to_vec();
		msg.push(0);
		assert_eq!(sock.dispatch(peer, &msg), Dispatch::Control(Receiver::KeyExchange));

		// Unknown magic and runts are discarded.
		assert_eq!(sock.dispatch(peer, &0x00123456u32.to_be_bytes()), Dispatch::Discard);
		assert_eq!(sock.dispatch(peer, &[0, 1]), Dispatch::Discard);

		sock.unbind_flow(peer, 3);
		assert_eq!(sock.dispatch(peer, &[3, 0, 0, 0, 5]), Dispatch::Discard);
	}

	#[test]
	fn channel_allocation_skips_bound() {
		let mut sock = SocketLayer::new(Box::new(NullLink));
		let peer = ep("10.0.0.2:1");

		assert_eq!(sock.alloc_channel(peer), Some(1));
		assert!(sock.bind_flow(peer, 1, 0));
		assert_eq!(sock.alloc_channel(peer), Some(2));
	}
}
