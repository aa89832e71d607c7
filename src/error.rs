use crate::broker::BrokerError;

/// Error codes carried by `ERR` payloads.
///
/// The 4xxx range covers violations attributable to the peer, the 5xxx
/// range covers server-side failures.
pub mod code {
    /// The envelope could not be decoded.
    pub const MALFORMED: u16 = 4000;
    /// The envelope kind is not one a client may send.
    pub const UNKNOWN_KIND: u16 = 4001;
    /// The envelope kind is not in the handshake allow-list.
    pub const DISALLOWED_KIND: u16 = 4002;
    /// A subscription for that channel and pattern flag already exists.
    pub const REDUNDANT_SUB: u16 = 4003;
    /// No subscription exists for that channel and pattern flag.
    pub const UNKNOWN_SUB: u16 = 4004;
    /// The encoded message exceeds the connection's write limit.
    pub const TOO_LARGE: u16 = 4013;
    /// The broker refused or failed the operation.
    pub const BROKER: u16 = 5000;
}

/// Connection-level failure, classified by what caused it.
///
/// `Protocol` failures on decoding are recoverable (the peer gets an `ERR`
/// and the connection stays open); every other variant transitions the
/// connection to `Closing`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed envelope, unknown kind, or a kind outside the handshake
    /// allow-list.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A message exceeded the read or write size limit.
    #[error("message of {size} bytes exceeds the {limit}-byte limit")]
    Limit {
        /// The configured limit, in bytes.
        limit: usize,
        /// The offending message size, in bytes.
        size: usize,
    },

    /// A read, write, or write-enqueue deadline elapsed.
    #[error("{0} deadline exceeded")]
    Deadline(&'static str),

    /// The broker is unreachable or returned an error.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The WebSocket handshake failed or negotiated no supported
    /// subprotocol.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The underlying transport failed mid-connection.
    #[error("transport: {0}")]
    Transport(String),

    /// The connection is closed.
    #[error("connection closed")]
    Closed,
}
