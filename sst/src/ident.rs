//! Endpoint identifiers.
//!
//! An EID is a scheme-tagged byte string: the scheme number occupies the top
//! six bits of the first byte (low two bits are a scheme-specific subscheme),
//! followed by a scheme-specific body. Cryptographic EIDs carry a truncated
//! hash of the host's public key; the non-cryptographic IP and MAC subschemes
//! embed legacy addresses directly. Two EIDs are equal iff their bytes are.

use core::fmt;
use core::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use log::warn;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Res};

/// Wire cap on EID length.
pub const EID_MAX: usize = 256;

/// Length of the hashed body of a cryptographic EID.
const HASH_LEN: usize = 20;

/// Identity schemes. The value is stored in the top six bits of the first
/// EID byte. `Dsa160` and `Rsa160` are legacy tags: such EIDs parse and
/// compare, but this implementation cannot generate or verify them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Scheme {
	Null = 0,
	Mac = 1,
	Ip = 2,
	Dsa160 = 10,
	Rsa160 = 20,
	Ed25519 = 30,
}

impl Scheme {
	fn from_tag(tag: u8) -> Option<Self> {
		Some(match tag {
			0 => Self::Null,
			1 => Self::Mac,
			2 => Self::Ip,
			10 => Self::Dsa160,
			20 => Self::Rsa160,
			30 => Self::Ed25519,
			_ => return None,
		})
	}
}

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Eid(Bytes);

impl Eid {
	pub fn from_bytes(bytes: Bytes) -> Self {
		Self(bytes)
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn is_null(&self) -> bool {
		self.0.is_empty()
	}

	pub fn scheme(&self) -> Option<Scheme> {
		Scheme::from_tag(self.0.first()? >> 2)
	}

	fn subscheme(&self) -> u8 {
		self.0.first().map_or(0, |b| b & 0x3)
	}

	/// The EID of an Ed25519 public key: scheme tag plus the SHA-256 of the
	/// key truncated to 160 bits.
	pub fn of_public_key(key: &VerifyingKey) -> Self {
		let hash = Sha256::digest(key.as_bytes());

		let mut id = BytesMut::with_capacity(1 + HASH_LEN);
		id.put_u8((Scheme::Ed25519 as u8) << 2);
		id.put_slice(&hash[..HASH_LEN]);
		Self(id.freeze())
	}

	/// A non-cryptographic EID embedding an IP address and optional port.
	pub fn from_ip(addr: IpAddr, port: u16) -> Self {
		let mut id = BytesMut::new();

		match addr {
			IpAddr::V4(a) => {
				id.put_u8((Scheme::Ip as u8) << 2);
				id.put_slice(&a.octets());
			}
			IpAddr::V6(a) => {
				id.put_u8((Scheme::Ip as u8) << 2 | 1);
				id.put_slice(&a.octets());
			}
		}

		if port != 0 {
			id.put_u16(port);
		}

		Self(id.freeze())
	}

	pub fn from_endpoint(ep: SocketAddr) -> Self {
		Self::from_ip(ep.ip(), ep.port())
	}

	/// A non-cryptographic EID embedding an EUI-48 address.
	pub fn from_mac(addr: [u8; 6]) -> Self {
		let mut id = BytesMut::with_capacity(7);
		id.put_u8((Scheme::Mac as u8) << 2);
		id.put_slice(&addr);
		Self(id.freeze())
	}

	pub fn mac_address(&self) -> Option<[u8; 6]> {
		if self.scheme() != Some(Scheme::Mac) || self.0.len() != 7 {
			return None;
		}
		self.0[1..].try_into().ok()
	}

	/// Decode the embedded endpoint of an IP-scheme EID.
	pub fn ip_endpoint(&self) -> Option<SocketAddr> {
		if self.scheme() != Some(Scheme::Ip) {
			return None;
		}

		let (addr, rest): (IpAddr, &[u8]) = match self.subscheme() {
			0 if self.0.len() >= 5 => (<[u8; 4]>::try_from(&self.0[1..5]).ok()?.into(), &self.0[5..]),
			1 if self.0.len() >= 17 => (<[u8; 16]>::try_from(&self.0[1..17]).ok()?.into(), &self.0[17..]),
			_ => return None,
		};

		let port = match rest {
			[hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
			_ => 0,
		};

		Some(SocketAddr::new(addr, port))
	}
}

impl fmt::Debug for Eid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{self}")
	}
}

impl fmt::Display for Eid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_null() {
			return write!(f, "eid:null");
		}

		write!(f, "eid:")?;
		for b in self.0.iter() {
			write!(f, "{b:02x}")?;
		}
		Ok(())
	}
}

/// A host identity: an EID plus, when this is a local identity, the signing
/// key it was derived from.
pub struct Ident {
	eid: Eid,
	public: Option<VerifyingKey>,
	secret: Option<SigningKey>,
}

impl Ident {
	/// Generate a fresh Ed25519 identity from the supplied entropy source.
	pub fn generate(rng: &mut impl RngCore) -> Self {
		let mut seed = [0u8; 32];
		rng.fill_bytes(&mut seed);

		let secret = SigningKey::from_bytes(&seed);
		let public = secret.verifying_key();

		Self {
			eid: Eid::of_public_key(&public),
			public: Some(public),
			secret: Some(secret),
		}
	}

	/// Rebuild a persisted identity from its EID and 32-byte secret seed.
	pub fn from_secret(eid: Eid, seed: [u8; 32]) -> Result<Self, Error> {
		let secret = SigningKey::from_bytes(&seed);
		let public = secret.verifying_key();

		// The supplied key must actually match the claimed ID.
		if Eid::of_public_key(&public) != eid {
			return Err(Error::Invalid("identity key does not match EID"));
		}

		Ok(Self { eid, public: Some(public), secret: Some(secret) })
	}

	/// Build a verification-only identity from a peer's claimed EID and
	/// public key, cross-checking the key against the ID hash.
	pub fn from_public(eid: Eid, key: &[u8]) -> Res<Self> {
		match eid.scheme() {
			Some(Scheme::Ed25519) => {}
			other => {
				warn!("Peer presented an EID with non-verifiable scheme {other:?}");
				return Err(());
			}
		}

		let key: [u8; 32] = key.try_into().map_err(|_| warn!("Peer public key has the wrong length"))?;
		let public = VerifyingKey::from_bytes(&key).map_err(|_| warn!("Peer public key is not a valid Ed25519 point"))?;

		if Eid::of_public_key(&public) != eid {
			warn!("Peer public key does not hash to its claimed EID");
			return Err(());
		}

		Ok(Self { eid, public: Some(public), secret: None })
	}

	pub fn eid(&self) -> &Eid {
		&self.eid
	}

	pub fn can_sign(&self) -> bool {
		self.secret.is_some()
	}

	pub fn public_key_bytes(&self) -> Option<[u8; 32]> {
		self.public.as_ref().map(|k| k.to_bytes())
	}

	pub fn secret_seed(&self) -> Option<[u8; 32]> {
		self.secret.as_ref().map(|k| k.to_bytes())
	}

	/// Sign a digest with the identity key.
	pub fn sign(&self, digest: &[u8; 32]) -> Result<[u8; 64], Error> {
		let key = self.secret.as_ref().ok_or(Error::UnsupportedScheme)?;
		Ok(key.sign(digest).to_bytes())
	}

	/// Verify a peer signature over a digest.
	pub fn verify(&self, digest: &[u8; 32], sig: &[u8]) -> Res {
		let key = self.public.as_ref().ok_or_else(|| warn!("No public key available for verification"))?;

		let sig: [u8; 64] = sig.try_into().map_err(|_| warn!("Signature has the wrong length"))?;

		key.verify_strict(digest, &Signature::from_bytes(&sig))
			.map_err(|_| warn!("Signature verification failed"))
	}
}

#[cfg(test)]
mod tests {
	use rand::rngs::SmallRng;
	use rand::SeedableRng;

	use super::*;

	#[test]
	fn generated_identity_roundtrips() {
		let mut rng = SmallRng::seed_from_u64(7);
		let id = Ident::generate(&mut rng);

		assert_eq!(id.eid().scheme(), Some(Scheme::Ed25519));
		assert_eq!(id.eid().as_bytes().len(), 1 + 20);

		let again = Ident::from_secret(id.eid().clone(), id.secret_seed().unwrap()).unwrap();
		assert_eq!(again.eid(), id.eid());

		let peer = Ident::from_public(id.eid().clone(), &id.public_key_bytes().unwrap()).unwrap();
		let sig = id.sign(&[7u8; 32]).unwrap();
		assert!(peer.verify(&[7u8; 32], &sig).is_ok());
		assert!(peer.verify(&[8u8; 32], &sig).is_err());
	}

	#[test]
	fn key_must_match_eid() {
		let mut rng = SmallRng::seed_from_u64(8);
		let a = Ident::generate(&mut rng);
		let b = Ident::generate(&mut rng);

		assert_ne!(a.eid(), b.eid());
		assert!(Ident::from_public(a.eid().clone(), &b.public_key_bytes().unwrap()).is_err());
	}

	#[test]
	fn ip_subscheme() {
		let ep: SocketAddr = "10.1.2.3:8661".parse().unwrap();
		let eid = Eid::from_endpoint(ep);

		assert_eq!(eid.scheme(), Some(Scheme::Ip));
		assert_eq!(eid.ip_endpoint(), Some(ep));

		let ep6: SocketAddr = "[2001:db8::1]:700".parse().unwrap();
		let eid6 = Eid::from_endpoint(ep6);
		assert_eq!(eid6.ip_endpoint(), Some(ep6));

		// Equality is byte equality.
		assert_ne!(eid, eid6);
		assert_eq!(eid, Eid::from_endpoint(ep));
	}

	#[test]
	fn mac_subscheme() {
		let eid = Eid::from_mac([1, 2, 3, 4, 5, 6]);
		assert_eq!(eid.scheme(), Some(Scheme::Mac));
		assert_eq!(eid.mac_address(), Some([1, 2, 3, 4, 5, 6]));
		assert_eq!(eid.ip_endpoint(), None);
	}
}
