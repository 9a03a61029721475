//! Minimal echo service over real UDP: run a server, then point a client
//! at it.
//!
//! ```text
//! sst-echo serve 8661
//! sst-echo connect 127.0.0.1:8661 <eid>
//! ```
//!
//! The server prints its EID at startup; the client echoes one line of
//! input through the stream and exits.

use std::net::SocketAddr;

use bytes::Bytes;
use log::{error, info};
use stakker::{actor, call, fwd_to, ret_nop, ret_to, ActorOwn, CX};

use sst::{Eid, Error, Event, HostConfig, Node, ShutdownMode, StreamRef};

const SERVICE: &str = "echo";
const PROTOCOL: &str = "demo";

fn parse_eid(s: &str) -> Option<Eid> {
	let hex = s.strip_prefix("eid:").unwrap_or(s);
	if hex.len() % 2 != 0 {
		return None;
	}

	let mut bytes = Vec::with_capacity(hex.len() / 2);
	for pair in hex.as_bytes().chunks(2) {
		let hi = (pair[0] as char).to_digit(16)?;
		let lo = (pair[1] as char).to_digit(16)?;
		bytes.push((hi * 16 + lo) as u8);
	}

	Some(Eid::from_bytes(Bytes::from(bytes)))
}

enum Mode {
	Serve,
	Connect { peer: Eid, hint: SocketAddr },
}

struct App {
	node: ActorOwn<Node>,
	mode: Mode,
}

impl App {
	fn init(cx: CX![], port: u16, mode: Mode) -> Option<Self> {
		let events = fwd_to!([cx], event() as (Event));

		let cfg = HostConfig { port, ..Default::default() };
		let node = actor!(cx, Node::init(cfg, events), ret_nop!());

		let mut this = Self { node, mode };
		this.start(cx);
		Some(this)
	}

	fn start(&mut self, cx: CX![]) {
		match &self.mode {
			Mode::Serve => {
				call!([self.node], listen(SERVICE.into(), PROTOCOL.into()));
				info!("Serving {SERVICE}/{PROTOCOL}");
			}
			Mode::Connect { peer, hint } => {
				let ret = ret_to!([cx], connected() as (Result<StreamRef, Error>));
				call!([self.node], connect_to(peer.clone(), SERVICE.into(), PROTOCOL.into(), Some(*hint), ret));
			}
		}
	}

	fn connected(&mut self, cx: CX![], res: Option<Result<StreamRef, Error>>) {
		match res {
			Some(Ok(_)) => info!("Key exchange running"),
			other => {
				error!("Connect failed: {other:?}");
				cx.stop();
			}
		}
	}

	fn event(&mut self, cx: CX![], ev: Event) {
		match ev {
			Event::IncomingConnection { service, protocol } => {
				let ret = ret_to!([cx], accepted() as (Option<StreamRef>));
				call!([self.node], accept(service, protocol, ret));
			}
			Event::Connected { stream } => {
				info!("Stream connected");
				let msg = Bytes::from_static(b"ping over structured streams");
				let ret = ret_to!([cx], sent() as (Result<(), Error>));
				call!([self.node], write_message(stream, msg, ret));
			}
			Event::ReadyReadMessage { stream } => {
				let ret = ret_to!([cx], message(stream) as (Result<Option<Bytes>, Error>));
				call!([self.node], read_message(stream, ret));
			}
			Event::Reset { reason, .. } => {
				error!("Stream reset: {reason}");
				cx.stop();
			}
			Event::LinkDown { peer } => {
				error!("Link to {peer} went down");
			}
			_ => {}
		}
	}

	fn accepted(&mut self, _cx: CX![], stream: Option<Option<StreamRef>>) {
		if let Some(Some(_)) = stream {
			info!("Accepted an incoming stream");
		}
	}

	fn sent(&mut self, _cx: CX![], _res: Option<Result<(), Error>>) {}

	fn message(&mut self, cx: CX![], stream: StreamRef, msg: Option<Result<Option<Bytes>, Error>>) {
		let Some(Ok(Some(msg))) = msg else { return };

		match self.mode {
			Mode::Serve => {
				// Echo it straight back.
				let ret = ret_to!([cx], sent() as (Result<(), Error>));
				call!([self.node], write_message(stream, msg, ret));
			}
			Mode::Connect { .. } => {
				info!("Echoed back: {:?}", String::from_utf8_lossy(&msg));
				let ret = ret_to!([cx], closed() as (Result<(), Error>));
				call!([self.node], shutdown(stream, ShutdownMode::Close, ret));
			}
		}
	}

	fn closed(&mut self, cx: CX![], _res: Option<Result<(), Error>>) {
		cx.stop();
	}
}

fn usage() -> ! {
	eprintln!("usage: sst-echo serve [port]");
	eprintln!("       sst-echo connect <addr> <eid> [port]");
	std::process::exit(2);
}

fn main() {
	runtime::logger::Logger::init(log::LevelFilter::Info);

	let args: Vec<String> = std::env::args().collect();

	let (port, mode) = match args.get(1).map(String::as_str) {
		Some("serve") => {
			let port = args.get(2).and_then(|p| p.parse().ok()).unwrap_or(sst::DEFAULT_PORT);
			(port, Mode::Serve)
		}
		Some("connect") => {
			let Some(hint) = args.get(2).and_then(|a| a.parse().ok()) else { usage() };
			let Some(peer) = args.get(3).and_then(|e| parse_eid(e)) else { usage() };
			let port = args.get(4).and_then(|p| p.parse().ok()).unwrap_or(0);
			(port, Mode::Connect { peer, hint })
		}
		_ => usage(),
	};

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let app = actor!(s, App::init(port, mode), ret_nop!());

	if runtime::exec(s, move || drop(app)).is_err() {
		std::process::exit(1);
	}
}
