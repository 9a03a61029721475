//! Real-network binding: a stakker actor owning one `Host` over one UDP
//! socket, translating between wall-clock timers, socket readiness, and
//! the host's explicit-time entry points.

use core::net::SocketAddr;

use bytes::Bytes;
use log::error;
use runtime::Udp;
use stakker::{fwd, ret, timer_max, Fwd, MaxTimerKey, Ret, CX};

use crate::error::Error;
use crate::host::{Event, Host, HostConfig, StreamRef};
use crate::ident::Eid;
use crate::sock::{Endpoint, Link};
use crate::strm::stream::ShutdownMode;

struct UdpLink {
	udp: Udp,
}

impl Link for UdpLink {
	fn send(&mut self, ep: Endpoint, pkt: &[u8]) -> bool {
		self.udp.send_to(ep, pkt)
	}

	fn local_endpoints(&self) -> Vec<Endpoint> {
		vec![self.udp.local_addr()]
	}
}

pub struct Node {
	host: Host,
	events: Fwd<Event>,
	timer: MaxTimerKey,
}

impl Node {
	pub fn init(cx: CX![], cfg: HostConfig, events: Fwd<Event>) -> Option<Self> {
		let read = stakker::fwd_to!([cx], read() as (SocketAddr, Bytes));

		let Some(udp) = Udp::bind(cfg.port, read) else {
			error!("Failed to bring up the UDP socket");
			return None;
		};

		let host = Host::new(cfg, Box::new(UdpLink { udp }), cx.now());
		log::info!("Host identity is {}", host.eid());

		let mut this = Self { host, events, timer: MaxTimerKey::default() };
		this.flush(cx);
		Some(this)
	}

	pub fn eid(&self) -> Eid {
		self.host.eid().clone()
	}

	fn read(&mut self, cx: CX![], src: SocketAddr, msg: Bytes) {
		self.host.receive(cx.now(), src, msg);
		self.flush(cx);
	}

	fn tick(&mut self, cx: CX![]) {
		self.host.advance(cx.now());
		self.flush(cx);
	}

	/// Deliver pending events and schedule the next timer fire.
	fn flush(&mut self, cx: CX![]) {
		for ev in self.host.take_events() {
			fwd!([self.events], ev);
		}

		if let Some(at) = self.host.next_timeout() {
			timer_max!(&mut self.timer, at, [cx], tick());
		}
	}

	pub fn listen(&mut self, _cx: CX![], service: String, protocol: String) {
		self.host.listen(&service, &protocol);
	}

	pub fn accept(&mut self, cx: CX![], service: String, protocol: String, ret: Ret<Option<StreamRef>>) {
		let r = self.host.accept(&service, &protocol);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn connect_to(
		&mut self,
		cx: CX![],
		eid: Eid,
		service: String,
		protocol: String,
		hint: Option<Endpoint>,
		ret: Ret<Result<StreamRef, Error>>,
	) {
		let r = self.host.connect_to(cx.now(), eid, &service, &protocol, hint);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn add_location_hint(&mut self, cx: CX![], eid: Eid, ep: Endpoint) {
		self.host.add_location_hint(cx.now(), eid, ep);
		self.flush(cx);
	}

	pub fn write_bytes(&mut self, cx: CX![], stream: StreamRef, data: Bytes, ret: Ret<Result<usize, Error>>) {
		let r = self.host.write_bytes(cx.now(), stream, &data);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn write_message(&mut self, cx: CX![], stream: StreamRef, data: Bytes, ret: Ret<Result<(), Error>>) {
		let r = self.host.write_message(cx.now(), stream, &data);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn read_bytes(&mut self, cx: CX![], stream: StreamRef, max: usize, ret: Ret<Result<Bytes, Error>>) {
		let r = self.host.read_bytes(cx.now(), stream, max);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn read_message(&mut self, cx: CX![], stream: StreamRef, ret: Ret<Result<Option<Bytes>, Error>>) {
		let r = self.host.read_message(cx.now(), stream);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn write_datagram(&mut self, cx: CX![], stream: StreamRef, data: Bytes, reliable: bool, ret: Ret<Result<(), Error>>) {
		let r = self.host.write_datagram(cx.now(), stream, &data, reliable);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn read_datagram(&mut self, cx: CX![], stream: StreamRef, ret: Ret<Result<Option<Bytes>, Error>>) {
		let r = self.host.read_datagram(stream);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn open_substream(&mut self, cx: CX![], stream: StreamRef, ret: Ret<Result<StreamRef, Error>>) {
		let r = self.host.open_substream(cx.now(), stream);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn accept_substream(&mut self, cx: CX![], stream: StreamRef, ret: Ret<Result<Option<StreamRef>, Error>>) {
		let r = self.host.accept_substream(stream);
		ret!([ret], r);
		self.flush(cx);
	}

	pub fn shutdown(&mut self, cx: CX![], stream: StreamRef, mode: ShutdownMode, ret: Ret<Result<(), Error>>) {
		let r = self.host.shutdown(cx.now(), stream, mode);
		ret!([ret], r);
		self.flush(cx);
	}
}
