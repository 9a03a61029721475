use thiserror::Error;

/// Shorthand for internal packet-processing paths, where an `Err(())` means
/// the packet has been dropped and the cause already logged.
pub(crate) type Res<T = (), E = ()> = core::result::Result<T, E>;

/// Errors surfaced through the application-facing API.
#[derive(Debug, Error)]
pub enum Error {
	/// The stream handle refers to a stream that no longer exists.
	#[error("stale stream handle")]
	StaleHandle,

	/// The operation requires a connected stream.
	#[error("stream is not connected")]
	Disconnected,

	/// The stream was reset by the peer or by local shutdown.
	#[error("stream was reset: {0}")]
	Reset(&'static str),

	/// Writing after the write side has been shut down.
	#[error("write side is closed")]
	WriteClosed,

	/// The peer could not be reached at any known endpoint.
	#[error("peer unreachable")]
	Unreachable,

	/// The endpoint we connected to is not the peer that was demanded.
	#[error("connected endpoint identity does not match the requested peer")]
	IdentityMismatch,

	/// A resource limit was reached; the operation may be retried later.
	#[error("resource limit reached: {0}")]
	Exhausted(&'static str),

	/// The identity scheme cannot be used for this operation.
	#[error("unsupported identity scheme")]
	UnsupportedScheme,

	/// A malformed argument.
	#[error("invalid argument: {0}")]
	Invalid(&'static str),
}
