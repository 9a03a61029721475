extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::SocketAddr;
use core::time::Duration;
use std::io::ErrorKind;
use std::net::UdpSocket;

use bytes::{Bytes, BytesMut};
use log::{error, warn};
use stakker::Fwd;

mod rt;
pub mod logger;
pub mod time;

pub use rt::*;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

use sys::*;

/// Largest datagram the driver will receive in one read.
const RECV_SIZE: usize = 2048;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State { entries: Vec::new() })
	};
}

struct State {
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of(&mut self, fd: RawFd) -> usize {
		self.entries.iter().position(|e| as_raw(&e.socket) == fd).expect("Socket is registered")
	}

	/// Returns whether any sockets remain registered.
	fn is_io(&self) -> bool {
		!self.entries.is_empty()
	}

	/// Poll the registered sockets once, draining whatever became ready.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<(), ()> {
		let mut fds: Vec<Poll> = self
			.entries
			.iter()
			.map(|e| Poll {
				fd: as_raw(&e.socket),
				events: if e.queue.is_empty() { POLLIN } else { POLLIN | POLLOUT },
				revents: 0,
			})
			.collect();

		let ret = unsafe { poll(fds.as_mut_ptr(), fds.len().try_into().expect("Fewer than u32::MAX fds"), as_timeout(timeout)) };

		let pending: u32 = ret
			.try_into()
			.map_err(|_| error!("poll() failed: {}", std::io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(());
		}

		for (idx, fd) in fds.iter().enumerate() {
			if fd.revents == 0 {
				continue;
			}

			if fd.revents & (POLLERR | POLLHUP | POLLNVAL) != 0 {
				// Error conditions on UDP sockets are transient (usually a
				// reflected ICMP error); drain with a read and move on.
				warn!("Poll reported an error condition on a socket");
			}

			let entry = &mut self.entries[idx];

			if fd.revents & POLLIN != 0 {
				entry.flush_read();
			}

			if fd.revents & POLLOUT != 0 {
				entry.flush_write();
			}
		}

		Ok(())
	}
}

struct Entry {
	socket: UdpSocket,
	fwd: Fwd<(SocketAddr, Bytes)>,
	queue: VecDeque<(SocketAddr, Box<[u8]>)>,
}

impl Entry {
	fn flush_read(&mut self) {
		loop {
			let mut buf = BytesMut::zeroed(RECV_SIZE);

			match self.socket.recv_from(&mut buf) {
				Ok((n, src)) => {
					buf.truncate(n);
					self.fwd.fwd((src, buf.freeze()));
				}
				Err(e) if e.kind() == ErrorKind::WouldBlock => return,
				Err(e) => {
					// Transient receive errors are logged and skipped; the
					// protocol's retransmit machinery recovers the data.
					warn!("UDP receive error: {e}");
					return;
				}
			}
		}
	}

	fn flush_write(&mut self) {
		while let Some((ep, pkt)) = self.queue.front() {
			match self.socket.send_to(pkt, *ep) {
				Ok(_) => {
					self.queue.pop_front();
				}
				Err(e) if e.kind() == ErrorKind::WouldBlock => return,
				Err(e) => {
					warn!("UDP send to {ep} failed: {e}");
					self.queue.pop_front();
				}
			}
		}
	}
}

/// An unconnected UDP socket registered with the poll loop.
///
/// Received datagrams are forwarded together with their source address;
/// sends that would block are queued and flushed when the socket becomes
/// writable again.
pub struct Udp {
	fd: RawFd,
	local: SocketAddr,
}

impl Udp {
	/// Bind a nonblocking UDP socket on `port`, falling back to an
	/// ephemeral port if the requested one is taken.
	pub fn bind(port: u16, fwd: Fwd<(SocketAddr, Bytes)>) -> Option<Self> {
		let socket = UdpSocket::bind(("0.0.0.0", port))
			.or_else(|e| {
				warn!("Could not bind UDP port {port} ({e}), using an ephemeral port");
				UdpSocket::bind(("0.0.0.0", 0))
			})
			.map_err(|e| error!("Failed to bind UDP socket: {e}"))
			.ok()?;

		socket.set_nonblocking(true).map_err(|e| error!("Failed to configure socket: {e}")).ok()?;

		let local = socket.local_addr().map_err(|e| error!("Failed to read local address: {e}")).ok()?;
		let fd = as_raw(&socket);

		State::with(|s| s.entries.push(Entry { socket, fwd, queue: VecDeque::new() }));

		Some(Self { fd, local })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local
	}

	/// Send a datagram, queueing it if the socket is not currently writable.
	/// Returns false only on a hard, non-retryable send error.
	pub fn send_to(&self, ep: SocketAddr, pkt: &[u8]) -> bool {
		State::with(|s| {
			let idx = s.idx_of(self.fd);
			let entry = &mut s.entries[idx];

			if !entry.queue.is_empty() {
				entry.queue.push_back((ep, pkt.into()));
				return true;
			}

			match entry.socket.send_to(pkt, ep) {
				Ok(_) => true,
				Err(e) if e.kind() == ErrorKind::WouldBlock => {
					entry.queue.push_back((ep, pkt.into()));
					true
				}
				Err(e) => {
					warn!("UDP send to {ep} failed: {e}");
					false
				}
			}
		})
	}
}

impl Drop for Udp {
	fn drop(&mut self) {
		State::with(|s| {
			let idx = s.idx_of(self.fd);
			s.entries.swap_remove(idx);
		})
	}
}
