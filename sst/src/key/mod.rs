//! DoS-resistant key exchange.
//!
//! A four-message JFK-style handshake authenticates two EIDs and derives
//! fresh symmetric channel keys. The responder keeps no per-initiator state
//! until a valid I2: its challenge (nonce and cookie) is recomputed from a
//! per-host secret that rotates periodically, together with a semi-static
//! per-rotation DH key. Repeating an I1 within a rotation epoch therefore
//! yields a bit-identical R1, and forged I1 floods cost the responder
//! nothing but bandwidth.

pub mod wire;

use core::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::chan::armor::ctr_apply;
use crate::chan::{ChanKeys, CHANID_LEN};
use crate::error::Res;
use crate::host::{Host, TimerTarget};
use crate::ident::{Eid, Ident, Scheme};
use crate::sock::Endpoint;
use crate::timer::TimerKey;

use self::wire::{Chunk, IdentBlock, KeyGroup, I1, I2, R1, R2};

/// Rotation period of the responder's per-host secret.
pub const HKR_ROTATE: Duration = Duration::from_secs(60);

/// How long a completed exchange stays cached for idempotent I2 replies.
const RECENT_TTL: Duration = Duration::from_secs(30);

/// Bound on the idempotence cache.
const RECENT_MAX: usize = 256;

type HmacSha256 = Hmac<Sha256>;

fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
	let mut h = Sha256::new();
	for p in parts {
		h.update(p);
	}
	h.finalize().into()
}

fn hmac_parts(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
	let mut m = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
	for p in parts {
		m.update(p);
	}
	m.finalize().into_bytes().into()
}

fn hmac16(key: &[u8; 32], data: &[u8]) -> [u8; wire::MAC_LEN] {
	hmac_parts(key, &[data])[..wire::MAC_LEN].try_into().expect("truncation fits")
}

fn ep_bytes(ep: Endpoint) -> Vec<u8> {
	let mut v = match ep.ip() {
		core::net::IpAddr::V4(a) => a.octets().to_vec(),
		core::net::IpAddr::V6(a) => a.octets().to_vec(),
	};
	v.extend_from_slice(&ep.port().to_be_bytes());
	v
}

/// Round a requested minimum symmetric key length up to an AES key size.
fn normalize_keylen(min: u32) -> Option<usize> {
	match min {
		0..=16 => Some(16),
		17..=24 => Some(24),
		25..=32 => Some(32),
		_ => None,
	}
}

/// Digest both sides sign: the DH parameters and nonces, separated by role.
fn params_digest(role: &[u8], group: u32, keylen: usize, nhi: &[u8; 32], nr: &[u8; 32], dh_i: &[u8], dh_r: &[u8]) -> [u8; 32] {
	sha256_parts(&[
		role,
		&group.to_be_bytes(),
		&(keylen as u32).to_be_bytes(),
		nhi,
		nr,
		dh_i,
		dh_r,
	])
}

/// Everything derivable from the shared secret and nonces.
#[derive(Clone)]
pub struct KeySchedule {
	pub master: [u8; 32],
	pub keylen: usize,
}

impl KeySchedule {
	pub fn new(z: &[u8], ni: &[u8; 32], nr: &[u8; 32], keylen: usize) -> Self {
		Self { master: sha256_parts(&[b"master", z, ni, nr]), keylen }
	}

	fn kdf(&self, label: &[u8], len: usize) -> Vec<u8> {
		sha256_parts(&[label, &self.master])[..len].to_vec()
	}

	fn kdf32(&self, label: &[u8]) -> [u8; 32] {
		sha256_parts(&[label, &self.master])
	}

	/// Symmetric channel keys for our direction and the peer's.
	pub fn chan_keys(&self, initiator: bool) -> ChanKeys {
		let enc_i = self.kdf(b"chan enc i", self.keylen);
		let mac_i = self.kdf32(b"chan mac i");
		let enc_r = self.kdf(b"chan enc r", self.keylen);
		let mac_r = self.kdf32(b"chan mac r");

		if initiator {
			ChanKeys { tx_enc: enc_i, tx_mac: mac_i, rx_enc: enc_r, rx_mac: mac_r }
		} else {
			ChanKeys { tx_enc: enc_r, tx_mac: mac_r, rx_enc: enc_i, rx_mac: mac_i }
		}
	}

	/// Per-direction channel ids, (transmit, receive) for the given role.
	pub fn chan_ids(&self, initiator: bool) -> ([u8; CHANID_LEN], [u8; CHANID_LEN]) {
		let id_i: [u8; CHANID_LEN] = self.kdf32(b"chanid i")[..CHANID_LEN].try_into().expect("fits");
		let id_r: [u8; CHANID_LEN] = self.kdf32(b"chanid r")[..CHANID_LEN].try_into().expect("fits");

		if initiator {
			(id_i, id_r)
		} else {
			(id_r, id_i)
		}
	}

	fn seal_ident(&self, label_enc: &[u8], block: &IdentBlock) -> Bytes {
		let mut data = block.encode().to_vec();
		ctr_apply(&self.kdf(label_enc, self.keylen), 0, &mut data);
		Bytes::from(data)
	}

	fn open_ident(&self, label_enc: &[u8], sealed: &Bytes) -> Res<IdentBlock> {
		let mut data = sealed.to_vec();
		ctr_apply(&self.kdf(label_enc, self.keylen), 0, &mut data);
		IdentBlock::decode(Bytes::from(data))
	}
}

/// One rotation epoch of the responder's secret state: the cookie MAC key
/// and the semi-static responder DH key.
struct Epoch {
	mac: [u8; 32],
	dh: StaticSecret,
	dh_pub: PublicKey,
}

impl Epoch {
	fn new(rng: &mut impl RngCore) -> Self {
		let mut mac = [0u8; 32];
		rng.fill_bytes(&mut mac);

		let mut seed = [0u8; 32];
		rng.fill_bytes(&mut seed);
		let dh = StaticSecret::from(seed);
		let dh_pub = PublicKey::from(&dh);

		Self { mac, dh, dh_pub }
	}

	/// The responder nonce for a given initiator, derived so a repeated I1
	/// gets a repeated (bit-identical) R1 within the epoch.
	fn nonce_r(&self, nhi: &[u8; 32], ep: Endpoint) -> [u8; 32] {
		hmac_parts(&self.mac, &[b"nr", nhi, &ep_bytes(ep)])
	}

	fn cookie(&self, dh_i: &[u8], nr: &[u8; 32], ep: Endpoint) -> [u8; wire::MAC_LEN] {
		hmac_parts(&self.mac, &[b"cookie", dh_i, nr, &ep_bytes(ep)])[..wire::MAC_LEN]
			.try_into()
			.expect("truncation fits")
	}
}

struct Recent {
	r2: Bytes,
	when: Instant,
}

/// Stateless-until-I2 responder state.
pub struct Responder {
	cur: Epoch,
	prev: Option<Epoch>,
	recent: HashMap<[u8; 32], Recent>,
}

impl Responder {
	pub fn new(rng: &mut impl RngCore, _now: Instant) -> Self {
		Self { cur: Epoch::new(rng), prev: None, recent: HashMap::new() }
	}

	pub fn rotate(&mut self, rng: &mut impl RngCore, now: Instant) {
		self.prev = Some(core::mem::replace(&mut self.cur, Epoch::new(rng)));
		self.recent.retain(|_, r| now.saturating_duration_since(r.when) < RECENT_TTL);
	}

	pub(crate) fn recent_len(&self) -> usize {
		self.recent.len()
	}

	fn remember(&mut self, nhi: [u8; 32], r2: Bytes, now: Instant) {
		if self.recent.len() >= RECENT_MAX {
			// Shed an arbitrary stale entry; correctness only needs best
			// effort here, the initiator retransmits I2 regardless.
			if let Some(k) = self.recent.keys().next().copied() {
				self.recent.remove(&k);
			}
		}
		self.recent.insert(nhi, Recent { r2, when: now });
	}
}

enum InitState {
	SentI1,
	SentI2 { sched: KeySchedule, nr: [u8; 32], dh_r: Bytes },
}

/// One in-progress outgoing key exchange, keyed by (peer, endpoint).
pub struct Initiator {
	pub target: Eid,
	pub ep: Endpoint,
	ni: [u8; 32],
	nhi: [u8; 32],
	dh: StaticSecret,
	state: InitState,
	pub timer: TimerKey,
	chan_local: u8,
	last_msg: Bytes,
}

fn is_cryptographic(eid: &Eid) -> bool {
	matches!(eid.scheme(), Some(Scheme::Ed25519 | Scheme::Dsa160 | Scheme::Rsa160))
}

impl Host {
	/// Begin (or skip, if already running) a key exchange with `target` at
	/// `ep`.
	pub(crate) fn start_initiator(&mut self, now: Instant, target: Eid, ep: Endpoint) {
		{
			let peer = self.peer_entry(target.clone());
			if peer.initiators.contains_key(&ep) {
				return;
			}
		}

		let mut ni = [0u8; 32];
		self.rng_fill(&mut ni);
		let nhi = sha256_parts(&[&ni]);

		let mut seed = [0u8; 32];
		self.rng_fill(&mut seed);
		let dh = StaticSecret::from(seed);
		let dh_pub = PublicKey::from(&dh);

		// Name the responder only when the target EID is one it can match.
		let target_bytes = if is_cryptographic(&target) {
			Bytes::copy_from_slice(target.as_bytes())
		} else {
			Bytes::new()
		};

		let i1 = I1 {
			group: KeyGroup::X25519 as u32,
			keymin: 16,
			nhi,
			dh_i: Bytes::copy_from_slice(dh_pub.as_bytes()),
			target: target_bytes,
		};

		let msg = wire::encode_message(vec![wire::encode_i1(&i1)]);
		self.sock.send(ep, &msg);

		debug!("Initiating key exchange with {target} at {ep}");

		let idx = self.initiators.insert(Initiator {
			target: target.clone(),
			ep,
			ni,
			nhi,
			dh,
			state: InitState::SentI1,
			timer: TimerKey::default(),
			chan_local: 0,
			last_msg: msg,
		});

		self.initiators[idx].timer =
			self.timers
				.retry(now, self.cfg.retry_min, self.cfg.retry_max, Some(self.cfg.fail_max), TimerTarget::KeyRetry(idx));

		let peer = self.peer_entry(target);
		peer.initiators.insert(ep, idx);
	}

	/// Retransmission timer for one initiator fired.
	pub(crate) fn on_key_retry(&mut self, now: Instant, idx: usize, failed: bool) {
		let Some(init) = self.initiators.get(idx) else { return };

		if !failed {
			// Same nonce, same bytes: the responder's cookie still
			// validates.
			let msg = init.last_msg.clone();
			let ep = init.ep;
			let timer = init.timer;
			self.sock.send(ep, &msg);
			self.timers.restart(timer, now);
			return;
		}

		warn!("Key exchange with {} at {} timed out", init.target, init.ep);
		self.abort_initiator(now, idx, false);
	}

	/// Tear down one initiator; `fatal` marks identity mismatches.
	fn abort_initiator(&mut self, now: Instant, idx: usize, fatal: bool) {
		let init = self.initiators.remove(idx);
		self.timers.stop(init.timer);

		if init.chan_local != 0 {
			self.sock.unbind_flow(init.ep, init.chan_local);
		}

		if let Some(peer) = self.peers.get_mut(&init.target) {
			peer.initiators.remove(&init.ep);
		}

		self.initiator_failed(now, init.target, init.ep, fatal);
	}

	/// Entry point for control datagrams carrying the key exchange magic.
	pub(crate) fn handle_key_message(&mut self, now: Instant, src: Endpoint, msg: Bytes) {
		let Ok(chunks) = wire::decode_message(msg) else { return };

		for chunk in chunks {
			let _ = match chunk {
				Chunk::I1(m) => self.handle_i1(src, m),
				Chunk::R1(m) => self.handle_r1(now, src, m),
				Chunk::I2(m) => self.handle_i2(now, src, m),
				Chunk::R2(m) => self.handle_r2(now, src, m),
			};
		}
	}

	/// Responder: answer an I1 with a stateless challenge.
	fn handle_i1(&mut self, src: Endpoint, i1: I1) -> Res {
		let group = KeyGroup::from_wire(i1.group).ok_or_else(|| debug!("I1 with unknown group {}", i1.group))?;
		if !group.supported() {
			debug!("I1 for unsupported group {group:?}");
			return Err(());
		}

		if i1.dh_i.len() != 32 {
			debug!("I1 with bad DH key length {}", i1.dh_i.len());
			return Err(());
		}

		let keylen = normalize_keylen(i1.keymin).ok_or_else(|| debug!("I1 demands key length {}", i1.keymin))?;

		// Silently ignore exchanges meant for somebody else.
		let target = Eid::from_bytes(i1.target.clone());
		if is_cryptographic(&target) && &target != self.eid() {
			debug!("I1 seeking {target}, not us");
			return Err(());
		}

		let nr = self.responder.cur.nonce_r(&i1.nhi, src);
		let cookie = self.responder.cur.cookie(&i1.dh_i, &nr, src);

		let r1 = R1 {
			group: i1.group,
			keymin: keylen as u32,
			nhi: i1.nhi,
			nr,
			dh_r: Bytes::copy_from_slice(self.responder.cur.dh_pub.as_bytes()),
			cookie: Bytes::copy_from_slice(&cookie),
			eid_r: Bytes::new(),
			pk_r: Bytes::new(),
			sig_r: Bytes::new(),
		};

		let msg = wire::encode_message(vec![wire::encode_r1(&r1)]);
		self.sock.send(src, &msg);
		Ok(())
	}

	/// Initiator: consume the challenge and send I2.
	fn handle_r1(&mut self, now: Instant, src: Endpoint, r1: R1) -> Res {
		let Some(idx) = self
			.initiators
			.iter()
			.find(|(_, i)| i.nhi == r1.nhi && i.ep == src)
			.map(|(i, _)| i)
		else {
			debug!("R1 with no matching exchange");
			return Err(());
		};

		if !matches!(self.initiators[idx].state, InitState::SentI1) {
			// Duplicate R1; the retransmit timer covers I2 delivery.
			return Ok(());
		}

		let group = KeyGroup::from_wire(r1.group).filter(|g| g.supported()).ok_or_else(|| debug!("R1 group unusable"))?;
		let keylen = normalize_keylen(r1.keymin).ok_or_else(|| debug!("R1 key length unusable"))?;

		let dh_r: [u8; 32] = r1.dh_r[..].try_into().map_err(|_| debug!("R1 DH key has bad length"))?;

		let init = &mut self.initiators[idx];

		let shared = init.dh.diffie_hellman(&PublicKey::from(dh_r));
		if !shared.was_contributory() {
			warn!("Degenerate DH contribution from {src}");
			return Err(());
		}

		let sched = KeySchedule::new(shared.as_bytes(), &init.ni, &r1.nr, keylen);

		// Reserve our channel number now; the responder learns it from the
		// identity block and may start sending on it right after R2.
		let chan_local = self.sock.alloc_channel(src).ok_or_else(|| warn!("No free channel numbers for {src}"))?;
		self.sock.bind_flow(src, chan_local, usize::MAX);

		let init = &mut self.initiators[idx];
		init.chan_local = chan_local;

		let dh_i = PublicKey::from(&init.dh);

		let digest = params_digest(b"sig i", group as u32, keylen, &init.nhi, &r1.nr, dh_i.as_bytes(), &r1.dh_r);
		let signature = self.ident.sign(&digest).map_err(|_| warn!("Host identity cannot sign"))?;

		let block = IdentBlock {
			chan: chan_local,
			eid: Bytes::copy_from_slice(self.ident.eid().as_bytes()),
			public_key: Bytes::copy_from_slice(&self.ident.public_key_bytes().expect("local identity has a key")),
			signature: Bytes::copy_from_slice(&signature),
			ulp: Bytes::new(),
		};

		let init = &mut self.initiators[idx];

		let mut i2 = I2 {
			group: group as u32,
			keymin: keylen as u32,
			ni: init.ni,
			nr: r1.nr,
			dh_i: Bytes::copy_from_slice(dh_i.as_bytes()),
			dh_r: r1.dh_r.clone(),
			cookie: r1.cookie.clone(),
			ident: sched.seal_ident(b"i2 enc", &block),
			mac: [0; wire::MAC_LEN],
			raw: Bytes::new(),
		};

		let body = wire::encode_i2_unmacced(&i2);
		i2.mac = hmac16(&sched.kdf32(b"i2 mac"), body.as_slice());

		let msg = wire::encode_message(vec![wire::finish_mac(body, i2.mac)]);
		self.sock.send(src, &msg);

		let init = &mut self.initiators[idx];
		init.last_msg = msg;
		init.state = InitState::SentI2 { sched, nr: r1.nr, dh_r: r1.dh_r.clone() };

		// Fresh retransmit interval for the new phase; the hard deadline
		// spans the whole exchange.
		let timer = init.timer;
		self.timers.rearm(timer, now, self.cfg.retry_min);
		Ok(())
	}

	/// Responder: verify the cookie and identity, install the channel, and
	/// answer with R2. Duplicate I2s re-send the cached R2.
	fn handle_i2(&mut self, now: Instant, src: Endpoint, i2: I2) -> Res {
		let group = KeyGroup::from_wire(i2.group).filter(|g| g.supported()).ok_or_else(|| debug!("I2 group unusable"))?;
		let keylen = normalize_keylen(i2.keymin).ok_or_else(|| debug!("I2 key length unusable"))?;

		let dh_i: [u8; 32] = i2.dh_i[..].try_into().map_err(|_| debug!("I2 DH key has bad length"))?;

		let nhi = sha256_parts(&[&i2.ni]);

		if let Some(rec) = self.responder.recent.get(&nhi) {
			let msg = rec.r2.clone();
			self.sock.send(src, &msg);
			return Ok(());
		}

		// Pick the epoch whose challenge this echoes; no DH arithmetic and
		// no allocation happen before this check passes.
		let epochs = [Some(&self.responder.cur), self.responder.prev.as_ref()];
		let epoch = epochs
			.into_iter()
			.flatten()
			.find(|e| {
				e.dh_pub.as_bytes()[..] == i2.dh_r[..] && e.cookie(&i2.dh_i, &i2.nr, src)[..] == i2.cookie[..]
			})
			.ok_or_else(|| debug!("I2 cookie from {src} does not validate"))?;

		let shared = epoch.dh.diffie_hellman(&PublicKey::from(dh_i));
		if !shared.was_contributory() {
			warn!("Degenerate DH contribution from {src}");
			return Err(());
		}

		let sched = KeySchedule::new(shared.as_bytes(), &i2.ni, &i2.nr, keylen);

		if hmac16(&sched.kdf32(b"i2 mac"), wire::mac_covered(&i2.raw)) != i2.mac {
			warn!("I2 from {src} failed authentication");
			return Err(());
		}

		let block = sched.open_ident(b"i2 enc", &i2.ident)?;

		let peer_eid = Eid::from_bytes(block.eid.clone());
		let peer_ident = Ident::from_public(peer_eid.clone(), &block.public_key)?;

		let digest = params_digest(b"sig i", group as u32, keylen, &nhi, &i2.nr, &i2.dh_i, &i2.dh_r);
		peer_ident.verify(&digest, &block.signature)?;

		let local_chan = self.sock.alloc_channel(src).ok_or_else(|| warn!("No free channel numbers for {src}"))?;

		self.install_channel(now, peer_eid.clone(), src, local_chan, block.chan, &sched, false)
			.ok_or(())?;

		// Build and remember our R2.
		let digest_r = params_digest(b"sig r", group as u32, keylen, &nhi, &i2.nr, &i2.dh_i, &i2.dh_r);
		let signature = self.ident.sign(&digest_r).map_err(|_| warn!("Host identity cannot sign"))?;

		let rblock = IdentBlock {
			chan: local_chan,
			eid: Bytes::copy_from_slice(self.ident.eid().as_bytes()),
			public_key: Bytes::copy_from_slice(&self.ident.public_key_bytes().expect("local identity has a key")),
			signature: Bytes::copy_from_slice(&signature),
			ulp: Bytes::new(),
		};

		let mut r2 = R2 {
			nhi,
			ident: sched.seal_ident(b"r2 enc", &rblock),
			mac: [0; wire::MAC_LEN],
			raw: Bytes::new(),
		};

		let body = wire::encode_r2_unmacced(&r2);
		r2.mac = hmac16(&sched.kdf32(b"r2 mac"), body.as_slice());

		let msg = wire::encode_message(vec![wire::finish_mac(body, r2.mac)]);
		self.sock.send(src, &msg);
		self.responder.remember(nhi, msg, now);
		Ok(())
	}

	/// Initiator: verify the responder's identity and install the channel.
	fn handle_r2(&mut self, now: Instant, src: Endpoint, r2: R2) -> Res {
		let Some(idx) = self
			.initiators
			.iter()
			.find(|(_, i)| i.nhi == r2.nhi && i.ep == src)
			.map(|(i, _)| i)
		else {
			debug!("R2 with no matching exchange");
			return Err(());
		};

		let InitState::SentI2 { sched, nr, dh_r } = &self.initiators[idx].state else {
			debug!("R2 before R1 was consumed");
			return Err(());
		};
		let (sched, nr, dh_r) = (sched.clone(), *nr, dh_r.clone());

		if hmac16(&sched.kdf32(b"r2 mac"), wire::mac_covered(&r2.raw)) != r2.mac {
			warn!("R2 from {src} failed authentication");
			return Err(());
		}

		let block = sched.open_ident(b"r2 enc", &r2.ident)?;
		let eid_r = Eid::from_bytes(block.eid.clone());

		let target = self.initiators[idx].target.clone();

		// A cryptographic demand must be met exactly; never use a channel
		// to an impostor.
		if is_cryptographic(&target) && target != eid_r {
			warn!("Responder at {src} is {eid_r}, demanded {target}");
			self.abort_initiator(now, idx, true);
			return Err(());
		}

		let peer_ident = Ident::from_public(eid_r.clone(), &block.public_key)?;

		let nhi = self.initiators[idx].nhi;
		let dh_i = Bytes::copy_from_slice(PublicKey::from(&self.initiators[idx].dh).as_bytes());

		let digest_r = params_digest(b"sig r", KeyGroup::X25519 as u32, sched.keylen, &nhi, &nr, &dh_i, &dh_r);
		peer_ident.verify(&digest_r, &block.signature)?;

		// Success: the initiator state dissolves into a live channel.
		let init = self.initiators.remove(idx);
		self.timers.stop(init.timer);

		if let Some(peer) = self.peers.get_mut(&init.target) {
			peer.initiators.remove(&init.ep);
			peer.verified = Some(eid_r);
		}

		self.install_channel(now, init.target, src, init.chan_local, block.chan, &sched, true);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use rand::rngs::SmallRng;
	use rand::SeedableRng;

	use super::*;

	#[test]
	fn schedules_are_symmetric() {
		let s = KeySchedule::new(&[7u8; 32], &[1; 32], &[2; 32], 16);

		let i = s.chan_keys(true);
		let r = s.chan_keys(false);

		assert_eq!(i.tx_enc, r.rx_enc);
		assert_eq!(i.tx_mac, r.rx_mac);
		assert_eq!(i.rx_enc, r.tx_enc);
		assert_ne!(i.tx_enc, i.rx_enc);

		let (itx, irx) = s.chan_ids(true);
		let (rtx, rrx) = s.chan_ids(false);
		assert_eq!(itx, rrx);
		assert_eq!(irx, rtx);
		assert_ne!(itx, irx);
	}

	#[test]
	fn key_length_negotiation() {
		assert_eq!(normalize_keylen(0), Some(16));
		assert_eq!(normalize_keylen(16), Some(16));
		assert_eq!(normalize_keylen(17), Some(24));
		assert_eq!(normalize_keylen(32), Some(32));
		assert_eq!(normalize_keylen(33), None);
	}

	#[test]
	fn epoch_challenge_is_deterministic() {
		let mut rng = SmallRng::seed_from_u64(5);
		let e = Epoch::new(&mut rng);

		let ep: Endpoint = "10.0.0.1:8661".parse().unwrap();
		let nhi = [9u8; 32];

		let nr1 = e.nonce_r(&nhi, ep);
		let nr2 = e.nonce_r(&nhi, ep);
		assert_eq!(nr1, nr2);

		let c1 = e.cookie(&[1; 32], &nr1, ep);
		let c2 = e.cookie(&[1; 32], &nr1, ep);
		assert_eq!(c1, c2);

		// A spoofed source address gets a different challenge.
		let other: Endpoint = "10.0.0.2:8661".parse().unwrap();
		assert_ne!(e.nonce_r(&nhi, other), nr1);
		assert_ne!(e.cookie(&[1; 32], &nr1, other), c1);
	}

	#[test]
	fn ident_blocks_seal_and_open() {
		let s = KeySchedule::new(&[3u8; 32], &[4; 32], &[5; 32], 32);

		let block = IdentBlock {
			chan: 9,
			eid: Bytes::from_static(&[0x78, 9, 9]),
			public_key: Bytes::from_static(&[1; 32]),
			signature: Bytes::from_static(&[2; 64]),
			ulp: Bytes::new(),
		};

		let sealed = s.seal_ident(b"i2 enc", &block);
		assert_ne!(&sealed[..], &block.encode()[..]);
		assert_eq!(s.open_ident(b"i2 enc", &sealed).unwrap(), block);

		// The wrong key stream yields garbage that fails to parse or
		// differs; either way it does not silently round-trip.
		let wrong = s.open_ident(b"r2 enc", &sealed);
		assert!(wrong.is_err() || wrong.unwrap() != block);
	}
}
