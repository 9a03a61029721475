//! Structured Stream Transport.
//!
//! A UDP-based transport providing multiplexed, reliable, flow-controlled
//! byte/message streams and best-effort datagrams between endpoints
//! identified by cryptographic EIDs. Channels between hosts are established
//! by a DoS-resistant Diffie-Hellman key exchange, carry encrypted and
//! authenticated packets under pluggable congestion control, and can be
//! replaced underneath live streams when an endpoint moves.
//!
//! The protocol core is a plain single-threaded state machine: a [`Host`]
//! owns every table and is driven through explicit-time entry points
//! (`receive`, `advance`), which keeps it runnable under a deterministic
//! network simulator. [`node::Node`] binds a host to a real UDP socket on
//! the stakker event loop.

pub mod chan;
pub mod error;
pub mod host;
pub mod ident;
pub mod key;
pub mod node;
pub mod peer;
pub mod sock;
pub mod strm;
pub mod timer;
pub mod xdr;

pub use chan::cc::CcMode;
pub use chan::LinkStatus;
pub use error::Error;
pub use host::{Event, Host, HostConfig, StreamRef, DEFAULT_PORT};
pub use ident::{Eid, Ident, Scheme};
pub use node::Node;
pub use sock::{Endpoint, Link};
pub use strm::stream::ShutdownMode;
