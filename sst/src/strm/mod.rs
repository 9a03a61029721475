//! The structured stream layer: reliable, ordered byte/message streams and
//! best-effort datagrams multiplexed over channels, with hierarchical
//! substreams and migration across channels.

pub mod dgram;
pub mod mux;
pub mod proto;
pub mod stream;
