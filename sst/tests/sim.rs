//! End-to-end protocol scenarios over a deterministic in-process network
//! simulator with seeded loss, delay, and reordering.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use sst::{Event, Host, HostConfig, Link, ShutdownMode, StreamRef};

/// Virtual time step.
const TICK: Duration = Duration::from_millis(5);

struct Packet {
	from: SocketAddr,
	to: SocketAddr,
	data: Bytes,
}

struct NetInner {
	rng: SmallRng,
	loss: f64,
	delay: Duration,
	jitter: Duration,
	queue: BTreeMap<(Instant, u64), Packet>,
	seq: u64,
	/// Every attempted send, in order, for handshake inspection.
	trace: Vec<(SocketAddr, SocketAddr, Bytes)>,
}

struct SimLink {
	net: Rc<RefCell<NetInner>>,
	local: Rc<Cell<SocketAddr>>,
	now: Rc<Cell<Instant>>,
}

impl Link for SimLink {
	fn send(&mut self, ep: SocketAddr, pkt: &[u8]) -> bool {
		let mut net = self.net.borrow_mut();
		let data = Bytes::copy_from_slice(pkt);
		let from = self.local.get();

		net.trace.push((from, ep, data.clone()));

		if net.rng.gen::<f64>() < net.loss {
			return true;
		}

		let jitter = if net.jitter.is_zero() {
			Duration::ZERO
		} else {
			let max_jitter_micros = net.jitter.as_micros() as u64;
			Duration::from_micros(net.rng.gen_range(0..max_jitter_micros))
		};

		let at = self.now.get() + net.delay + jitter;
		let seq = net.seq;
		net.seq += 1;
		net.queue.insert((at, seq), Packet { from, to: ep, data });
		true
	}

	fn local_endpoints(&self) -> Vec<SocketAddr> {
		vec![self.local.get()]
	}
}

struct Sim {
	net: Rc<RefCell<NetInner>>,
	hosts: Vec<Host>,
	locals: Vec<Rc<Cell<SocketAddr>>>,
	clock: Rc<Cell<Instant>>,
	now: Instant,
}

impl Sim {
	fn new(seed: u64, loss: f64, delay: Duration, jitter: Duration) -> Self {
		let now = Instant::now();

		Self {
			net: Rc::new(RefCell::new(NetInner {
				rng: SmallRng::seed_from_u64(seed),
				loss,
				delay,
				jitter,
				queue: BTreeMap::new(),
				seq: 0,
				trace: Vec::new(),
			})),
			hosts: Vec::new(),
			locals: Vec::new(),
			clock: Rc::new(Cell::new(now)),
			now,
		}
	}

	fn add_host(&mut self, addr: &str, seed: u64) -> usize {
		let local = Rc::new(Cell::new(addr.parse().unwrap()));

		let link = SimLink {
			net: self.net.clone(),
			local: local.clone(),
			now: self.clock.clone(),
		};

		let cfg = HostConfig { rng_seed: Some(seed), ..Default::default() };

		self.locals.push(local);
		self.hosts.push(Host::new(cfg, Box::new(link), self.now));
		self.hosts.len() - 1
	}

	/// Simulate an address renumbering for one host: it now sends from and
	/// receives at the new address, and traffic to the old one blackholes.
	fn rebind(&mut self, host: usize, addr: &str) {
		self.locals[host].set(addr.parse().unwrap());
	}

	fn addr(&self, host: usize) -> SocketAddr {
		self.locals[host].get()
	}

	fn tick(&mut self) {
		self.now += TICK;
		self.clock.set(self.now);

		let due: Vec<Packet> = {
			let mut net = self.net.borrow_mut();
			let mut due = Vec::new();

			while let Some((&(at, seq), _)) = net.queue.first_key_value() {
				if at > self.now {
					break;
				}
				due.push(net.queue.remove(&(at, seq)).unwrap());
			}

			due
		};

		for p in due {
			if let Some(hi) = self.locals.iter().position(|l| l.get() == p.to) {
				self.hosts[hi].receive(self.now, p.from, p.data);
			}
		}

		for h in &mut self.hosts {
			h.advance(self.now);
		}
	}

	/// Tick until the condition holds or virtual `max` elapses.
	fn run_until(&mut self, max: Duration, mut cond: impl FnMut(&mut Sim) -> bool) -> bool {
		let deadline = self.now + max;

		while self.now < deadline {
			self.tick();
			if cond(self) {
				return true;
			}
		}
		false
	}
}

/// Stand up a connected pair: host 0 connects to `service` on host 1.
fn connect_pair(sim: &mut Sim, service: &str) -> StreamRef {
	let b_addr = sim.addr(1);
	let eid_b = sim.hosts[1].eid().clone();

	sim.hosts[1].listen(service, "test");

	let now = sim.now;
	let sa = sim.hosts[0]
		.connect_to(now, eid_b, service, "test", Some(b_addr))
		.expect("connect_to");

	assert!(
		sim.run_until(Duration::from_secs(10), |s| s.hosts[0].is_connected(sa)),
		"connection did not establish"
	);

	sa
}

/// Wait for and take the next accepted stream on `host`.
fn accept_one(sim: &mut Sim, host: usize, service: &str) -> StreamRef {
	let got = Cell::new(None);

	let ok = sim.run_until(Duration::from_secs(10), |s| {
		if got.get().is_none() {
			got.set(s.hosts[host].accept(service, "test"));
		}
		got.get().is_some()
	});

	assert!(ok, "no incoming connection for {service}");
	got.get().unwrap()
}

/// Pump `data` from host 0's stream `sa` to host 1's stream `sb`, honoring
/// windows, until all of it arrives. Returns the received bytes.
fn transfer(sim: &mut Sim, sa: StreamRef, sb: StreamRef, data: &[u8], max: Duration) -> Vec<u8> {
	let total = data.len();
	let written = Cell::new(0usize);
	let received = RefCell::new(Vec::with_capacity(total));

	let done = sim.run_until(max, |s| {
		let now = s.now;

		if written.get() < total {
			let end = (written.get() + 65536).min(total);
			let n = s.hosts[0].write_bytes(now, sa, &data[written.get()..end]).unwrap_or(0);
			written.set(written.get() + n);
		}

		let mut out = received.borrow_mut();
		loop {
			let chunk = s.hosts[1].read_bytes(now, sb, 65536).unwrap_or_default();
			if chunk.is_empty() {
				break;
			}
			out.extend_from_slice(&chunk);
		}

		out.len() >= total
	});

	let out = received.into_inner();
	assert!(done, "transfer stalled: {} of {} bytes after {:?}", out.len(), total, max);
	out
}

// ----- scenario 1: basic echo -----

#[test]
fn basic_echo() {
	let mut sim = Sim::new(0x01, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let sa = connect_pair(&mut sim, "echo");
	let sb = accept_one(&mut sim, 1, "echo");

	let now = sim.now;
	sim.hosts[0].write_message(now, sa, b"hello\0").unwrap();

	assert!(sim.run_until(Duration::from_secs(5), |s| {
		s.hosts[1].pending_messages(sb).unwrap_or(0) > 0
	}));

	let now = sim.now;
	let msg = sim.hosts[1].read_message(now, sb).unwrap().expect("one message");

	assert_eq!(&msg[..], b"hello\0");
	assert_eq!(msg.len(), 6);
	assert_eq!(sim.hosts[1].bytes_available(sb).unwrap(), 0);
	assert_eq!(sim.hosts[1].pending_messages(sb).unwrap(), 0);
}

// ----- scenario 2: substream independence -----

#[test]
fn two_streams_do_not_interfere() {
	let mut sim = Sim::new(0x02, 0.0, Duration::from_millis(5), Duration::from_millis(2));
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let b_addr = sim.addr(1);
	let eid_b = sim.hosts[1].eid().clone();
	sim.hosts[1].listen("bulk", "test");

	let now = sim.now;
	let s1 = sim.hosts[0].connect_to(now, eid_b.clone(), "bulk", "test", Some(b_addr)).unwrap();
	let s2 = sim.hosts[0].connect_to(now, eid_b.clone(), "bulk", "test", Some(b_addr)).unwrap();

	assert!(sim.run_until(Duration::from_secs(10), |s| {
		s.hosts[0].is_connected(s1) && s.hosts[0].is_connected(s2)
	}));

	// Both streams share one peer channel.
	assert!(sim.hosts[0].link_info(&eid_b).is_some());

	let r1 = accept_one(&mut sim, 1, "bulk");
	let r2 = accept_one(&mut sim, 1, "bulk");

	const N: usize = 1 << 20;
	let fives = vec![0x55u8; N];
	let aas = vec![0xAAu8; N];

	let wrote = Cell::new((0usize, 0usize));
	let got1 = RefCell::new(Vec::with_capacity(N));
	let got2 = RefCell::new(Vec::with_capacity(N));

	let done = sim.run_until(Duration::from_secs(120), |s| {
		let now = s.now;
		let (mut w1, mut w2) = wrote.get();

		if w1 < N {
			w1 += s.hosts[0].write_bytes(now, s1, &fives[w1..(w1 + 32768).min(N)]).unwrap_or(0);
		}
		if w2 < N {
			w2 += s.hosts[0].write_bytes(now, s2, &aas[w2..(w2 + 32768).min(N)]).unwrap_or(0);
		}
		wrote.set((w1, w2));

		for (sb, out) in [(r1, &got1), (r2, &got2)] {
			let mut out = out.borrow_mut();
			loop {
				let chunk = s.hosts[1].read_bytes(now, sb, 65536).unwrap_or_default();
				if chunk.is_empty() {
					break;
				}
				out.extend_from_slice(&chunk);
			}
		}

		got1.borrow().len() >= N && got2.borrow().len() >= N
	});

	let got1 = got1.into_inner();
	let got2 = got2.into_inner();

	assert!(done, "transfers stalled at {} / {}", got1.len(), got2.len());
	assert_eq!(got1.len(), N);
	assert_eq!(got2.len(), N);
	assert!(got1.iter().all(|&b| b == 0x55), "stream 1 bytes corrupted");
	assert!(got2.iter().all(|&b| b == 0xAA), "stream 2 bytes corrupted");
}

// ----- scenario 3: loss recovery -----

#[test]
fn bulk_transfer_survives_loss() {
	let mut sim = Sim::new(0x03, 0.02, Duration::from_millis(5), Duration::from_millis(3));
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let eid_b = sim.hosts[1].eid().clone();
	let sa = connect_pair(&mut sim, "bulk");
	let sb = accept_one(&mut sim, 1, "bulk");

	const N: usize = 10 << 20;
	let data: Vec<u8> = (0..N).map(|i| (i * 31 % 251) as u8).collect();

	let got = transfer(&mut sim, sa, sb, &data, Duration::from_secs(600));

	assert_eq!(got.len(), N);
	assert_eq!(got, data, "received bytes differ from sent bytes");

	let info = sim.hosts[0].link_info(&eid_b).expect("primary channel");
	assert!(info.cwnd > 2, "congestion window collapsed to {}", info.cwnd);
}

// ----- scenario 4: migration across an address change -----

#[test]
fn transfer_survives_renumbering() {
	let mut sim = Sim::new(0x04, 0.0, Duration::from_millis(5), Duration::from_millis(1));
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let sa = connect_pair(&mut sim, "bulk");
	let sb = accept_one(&mut sim, 1, "bulk");

	const N: usize = 2 << 20;
	let data: Vec<u8> = (0..N).map(|i| (i * 17 % 253) as u8).collect();

	let written = Cell::new(0usize);
	let received = RefCell::new(Vec::with_capacity(N));
	let moved = Cell::new(false);

	let done = sim.run_until(Duration::from_secs(120), |s| {
		let now = s.now;

		if written.get() < N {
			let end = (written.get() + 65536).min(N);
			let n = s.hosts[0].write_bytes(now, sa, &data[written.get()..end]).unwrap_or(0);
			written.set(written.get() + n);
		}

		let mut out = received.borrow_mut();
		loop {
			let chunk = s.hosts[1].read_bytes(now, sb, 65536).unwrap_or_default();
			if chunk.is_empty() {
				break;
			}
			out.extend_from_slice(&chunk);
		}

		// Halfway through, the initiator's address changes out from under
		// the channel.
		if !moved.get() && out.len() > N / 2 {
			moved.set(true);
			s.rebind(0, "10.0.9.9:8661");
		}

		out.len() >= N
	});

	let got = received.into_inner();
	assert!(moved.get(), "renumbering never triggered");
	assert!(done, "transfer did not recover after renumbering ({} of {N} bytes)", got.len());
	assert_eq!(got, data, "bytes corrupted across migration");

	// The receiver saw a second channel appear for the migration.
	assert!(sim.hosts[1].stats().channels >= 2);
}

// ----- scenario 5: I1 floods cost the responder nothing -----

#[test]
fn forged_i1_flood_allocates_nothing() {
	use sst::key::wire::{encode_i1, encode_message, KeyGroup, I1};

	let mut sim = Sim::new(0x05, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let before = sim.hosts[1].stats();
	let mut rng = SmallRng::seed_from_u64(0x5005);
	let now = sim.now;

	for i in 0..10_000u32 {
		let mut nhi = [0u8; 32];
		rng.fill(&mut nhi);
		let mut dh = [0u8; 32];
		rng.fill(&mut dh);

		let i1 = I1 {
			group: KeyGroup::X25519 as u32,
			keymin: 16,
			nhi,
			dh_i: Bytes::copy_from_slice(&dh),
			target: Bytes::new(),
		};

		// Spoofed source addresses all over the place.
		let src: SocketAddr = format!("172.16.{}.{}:{}", i % 256, (i / 256) % 256, 1024 + (i % 40000)).parse().unwrap();

		sim.hosts[1].receive(now, src, encode_message(vec![encode_i1(&i1)]));
	}

	// The responder answered statelessly: no channels, streams, peers, or
	// exchange state were allocated for any of the 10,000 forgeries.
	let after = sim.hosts[1].stats();
	assert_eq!(after.channels, before.channels);
	assert_eq!(after.streams, before.streams);
	assert_eq!(after.peers, before.peers);
	assert_eq!(after.pending_exchanges, 0);
	assert_eq!(after.cached_exchanges, 0);

	// And a legitimate exchange still completes afterwards.
	let sa = connect_pair(&mut sim, "echo");
	let sb = accept_one(&mut sim, 1, "echo");
	let now = sim.now;
	sim.hosts[0].write_message(now, sa, b"still alive").unwrap();

	assert!(sim.run_until(Duration::from_secs(5), |s| {
		s.hosts[1].pending_messages(sb).unwrap_or(0) > 0
	}));
}

// ----- scenario 6: graceful close -----

#[test]
fn graceful_close() {
	let mut sim = Sim::new(0x06, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let sa = connect_pair(&mut sim, "echo");
	let sb = accept_one(&mut sim, 1, "echo");

	let now = sim.now;
	assert_eq!(sim.hosts[0].write_bytes(now, sa, b"abc").unwrap(), 3);
	sim.hosts[0].shutdown(now, sa, ShutdownMode::Write).unwrap();

	assert!(sim.run_until(Duration::from_secs(5), |s| {
		s.hosts[1].bytes_available(sb).unwrap_or(0) >= 3
	}));

	let now = sim.now;
	let got = sim.hosts[1].read_bytes(now, sb, 16).unwrap();
	assert_eq!(&got[..], b"abc");
	assert!(sim.hosts[1].at_end(sb).unwrap());

	// The writer is closed for good.
	let err = sim.hosts[0].write_bytes(now, sa, b"more");
	assert!(err.is_err());
}

// ----- handshake determinism -----

#[test]
fn repeated_i1_gets_identical_r1() {
	let mut sim = Sim::new(0x07, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let b_addr = sim.addr(1);
	let a_addr = sim.addr(0);
	let eid_b = sim.hosts[1].eid().clone();

	sim.hosts[1].listen("echo", "test");

	// Let host 0 produce a real I1, then capture it off the wire.
	let now = sim.now;
	sim.hosts[0].connect_to(now, eid_b, "echo", "test", Some(b_addr)).unwrap();

	let i1 = sim.net.borrow().trace.first().expect("I1 was sent").2.clone();

	// Feed the same I1 twice and compare the responder's answers.
	let mark = sim.net.borrow().trace.len();
	sim.hosts[1].receive(now, a_addr, i1.clone());
	sim.hosts[1].receive(now, a_addr, i1);

	let trace = sim.net.borrow();
	let replies: Vec<&Bytes> = trace.trace[mark..].iter().map(|(_, _, d)| d).collect();
	assert_eq!(replies.len(), 2);
	assert_eq!(replies[0], replies[1], "R1 is not deterministic for a repeated I1");
}

// ----- datagrams -----

#[test]
fn datagrams_deliver_both_ways_of_carriage() {
	let mut sim = Sim::new(0x08, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let sa = connect_pair(&mut sim, "dgram");
	let sb = accept_one(&mut sim, 1, "dgram");

	// Small unreliable datagram: a single stateless fragment.
	let now = sim.now;
	let small: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
	sim.hosts[0].write_datagram(now, sa, &small, false).unwrap();

	let got = Cell::new(false);
	assert!(sim.run_until(Duration::from_secs(5), |s| {
		if let Ok(Some(d)) = s.hosts[1].read_datagram(sb) {
			assert_eq!(&d[..], &small[..]);
			got.set(true);
		}
		got.get()
	}));

	// Reliable datagram: rides an ephemeral substream.
	let now = sim.now;
	sim.hosts[0].write_datagram(now, sa, b"certified", true).unwrap();

	let got = Cell::new(false);
	assert!(sim.run_until(Duration::from_secs(5), |s| {
		if let Ok(Some(d)) = s.hosts[1].read_datagram(sb) {
			assert_eq!(&d[..], b"certified");
			got.set(true);
		}
		got.get()
	}));
}

// ----- substreams -----

#[test]
fn substreams_open_and_carry_data() {
	let mut sim = Sim::new(0x09, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let sa = connect_pair(&mut sim, "tree");
	let sb = accept_one(&mut sim, 1, "tree");

	let now = sim.now;
	let child = sim.hosts[0].open_substream(now, sa).unwrap();
	sim.hosts[0].write_message(now, child, b"branch data").unwrap();

	let got = Cell::new(None);
	assert!(sim.run_until(Duration::from_secs(5), |s| {
		if got.get().is_none() {
			got.set(s.hosts[1].accept_substream(sb).unwrap());
		}
		match got.get() {
			Some(c) => s.hosts[1].pending_messages(c).unwrap_or(0) > 0,
			None => false,
		}
	}));

	let rchild = got.get().unwrap();
	let now = sim.now;
	let msg = sim.hosts[1].read_message(now, rchild).unwrap().unwrap();
	assert_eq!(&msg[..], b"branch data");

	// Admission stays bounded but every opener eventually gets through.
	let kids: Vec<StreamRef> = (0..20).map(|_| sim.hosts[0].open_substream(sim.now, sa).unwrap()).collect();
	for (i, k) in kids.iter().enumerate() {
		let now = sim.now;
		sim.hosts[0].write_message(now, *k, format!("kid {i}").as_bytes()).unwrap();
	}

	let seen = Cell::new(0usize);
	assert!(sim.run_until(Duration::from_secs(30), |s| {
		while let Ok(Some(_)) = s.hosts[1].accept_substream(sb) {
			seen.set(seen.get() + 1);
		}
		seen.get() >= 20
	}));
}

// ----- connect to an unknown service -----

#[test]
fn unknown_service_is_refused() {
	let mut sim = Sim::new(0x0A, 0.0, Duration::from_millis(5), Duration::ZERO);
	sim.add_host("10.0.0.1:8661", 11);
	sim.add_host("10.0.0.2:8661", 22);

	let b_addr = sim.addr(1);
	let eid_b = sim.hosts[1].eid().clone();

	// Host 1 listens, but not for this service.
	sim.hosts[1].listen("other", "test");

	let now = sim.now;
	let sa = sim.hosts[0].connect_to(now, eid_b, "missing", "test", Some(b_addr)).unwrap();

	let reset = Cell::new(false);
	assert!(sim.run_until(Duration::from_secs(10), |s| {
		for ev in s.hosts[0].take_events() {
			if let Event::Reset { stream, .. } = ev {
				if stream == sa {
					reset.set(true);
				}
			}
		}
		reset.get()
	}));

	assert!(!sim.hosts[0].is_connected(sa));
	let now = sim.now;
	assert!(sim.hosts[0].write_bytes(now, sa, b"x").is_err());
}
