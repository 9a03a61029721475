//! Packet armor: AES-CTR encryption and truncated HMAC-SHA-256
//! authentication, keyed per direction.
//!
//! The first four packet bytes (channel number and low sequence bits) stay
//! in the clear so the receiver can reconstruct the sequence and run replay
//! checks before any crypto. The MAC covers those cleartext bytes and the
//! ciphertext, prefixed by a pseudo-header holding the full 64-bit sequence,
//! so header tampering is caught even though the wire carries only 24 bits.

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use log::warn;
use sha2::Sha256;

use crate::error::Res;

/// Channel header: channel number, 24-bit sequence, 32-bit ack word.
pub const HDR_LEN: usize = 8;

/// Offset at which encryption begins; the ack word is encrypted.
pub const ENC_OFS: usize = 4;

/// Truncated MAC length.
pub const MAC_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

pub(crate) fn ctr_apply(key: &[u8], seq: u64, data: &mut [u8]) {
	// The counter block starts at the packet sequence; sequences never
	// repeat within a channel, so neither do keystreams.
	let mut iv = [0u8; 16];
	iv[..8].copy_from_slice(&seq.to_be_bytes());

	match key.len() {
		16 => Ctr128BE::<Aes128>::new_from_slices(key, &iv)
			.expect("key and IV lengths are fixed")
			.apply_keystream(data),
		24 => Ctr128BE::<Aes192>::new_from_slices(key, &iv)
			.expect("key and IV lengths are fixed")
			.apply_keystream(data),
		32 => Ctr128BE::<Aes256>::new_from_slices(key, &iv)
			.expect("key and IV lengths are fixed")
			.apply_keystream(data),
		n => unreachable!("negotiated key length {n} is not an AES key size"),
	}
}

fn mac_of(key: &[u8; 32], seq: u64, bytes: &[u8]) -> [u8; 16] {
	let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
	mac.update(&seq.to_be_bytes());
	mac.update(bytes);

	let full = mac.finalize().into_bytes();
	full[..MAC_LEN].try_into().expect("digest is longer than the truncated MAC")
}

/// Symmetric key material for one channel, both directions.
pub struct Armor {
	tx_enc: Vec<u8>,
	tx_mac: [u8; 32],
	rx_enc: Vec<u8>,
	rx_mac: [u8; 32],
}

impl Armor {
	pub fn new(tx_enc: Vec<u8>, tx_mac: [u8; 32], rx_enc: Vec<u8>, rx_mac: [u8; 32]) -> Self {
		debug_assert!(matches!(tx_enc.len(), 16 | 24 | 32));
		debug_assert_eq!(tx_enc.len(), rx_enc.len());

		Self { tx_enc, tx_mac, rx_enc, rx_mac }
	}

	/// Encrypt a packet in place and append its MAC. `pkt` holds the full
	/// header plus payload.
	pub fn seal(&self, seq: u64, pkt: &mut Vec<u8>) {
		debug_assert!(pkt.len() >= HDR_LEN);

		ctr_apply(&self.tx_enc, seq, &mut pkt[ENC_OFS..]);

		let mac = mac_of(&self.tx_mac, seq, pkt);
		pkt.extend_from_slice(&mac);
	}

	/// Verify and strip the trailing MAC, then decrypt in place.
	pub fn open(&self, seq: u64, pkt: &mut Vec<u8>) -> Res {
		if pkt.len() < HDR_LEN + MAC_LEN {
			warn!("Armored packet too short ({} bytes)", pkt.len());
			return Err(());
		}

		let body = pkt.len() - MAC_LEN;

		let mut mac = HmacSha256::new_from_slice(&self.rx_mac).expect("HMAC accepts any key length");
		mac.update(&seq.to_be_bytes());
		mac.update(&pkt[..body]);

		// No log here: the channel rate-limits authentication failures.
		mac.verify_truncated_left(&pkt[body..]).map_err(|_| ())?;

		pkt.truncate(body);
		ctr_apply(&self.rx_enc, seq, &mut pkt[ENC_OFS..]);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pair() -> (Armor, Armor) {
		let ek = vec![0x11; 16];
		let mk = [0x22; 32];
		let ek2 = vec![0x33; 16];
		let mk2 = [0x44; 32];

		let a = Armor::new(ek.clone(), mk, ek2.clone(), mk2);
		let b = Armor::new(ek2, mk2, ek, mk);
		(a, b)
	}

	fn packet() -> Vec<u8> {
		let mut pkt = vec![7, 0, 0, 1, 0, 0, 0, 0];
		pkt.extend_from_slice(b"some stream payload");
		pkt
	}

	#[test]
	fn seal_open_roundtrip() {
		let (a, b) = pair();

		let mut pkt = packet();
		let clear = pkt.clone();

		a.seal(1, &mut pkt);
		assert_eq!(pkt.len(), clear.len() + MAC_LEN);
		// The first four bytes stay in the clear.
		assert_eq!(pkt[..4], clear[..4]);
		assert_ne!(pkt[4..clear.len()], clear[4..]);

		assert!(b.open(1, &mut pkt).is_ok());
		assert_eq!(pkt, clear);
	}

	#[test]
	fn wrong_sequence_fails_auth() {
		let (a, b) = pair();

		let mut pkt = packet();
		a.seal(5, &mut pkt);
		assert!(b.open(6, &mut pkt).is_err());
	}

	#[test]
	fn tampered_header_fails_auth() {
		let (a, b) = pair();

		let mut pkt = packet();
		a.seal(5, &mut pkt);
		pkt[0] ^= 1;
		assert!(b.open(5, &mut pkt).is_err());
	}

	#[test]
	fn distinct_sequences_use_distinct_keystreams() {
		let (a, _) = pair();

		let mut p1 = packet();
		let mut p2 = packet();
		a.seal(1, &mut p1);
		a.seal(2, &mut p2);
		assert_ne!(p1[ENC_OFS..], p2[ENC_OFS..]);
	}
}
