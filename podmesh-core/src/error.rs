use thiserror::Error;

use crate::framing::MAX_BUFSIZE;

/// Every failure kind the core surfaces, in one enum per the convention
/// `innernet-server`'s `ServerError` follows: one error type per crate, rather than
/// ad hoc `Box<dyn Error>` at each call site.
#[derive(Error, Debug)]
pub enum Error {
    /// A single record exceeded the framer's fixed buffer with no separator observed.
    #[error("record exceeds the {MAX_BUFSIZE} byte frame buffer with no newline")]
    RecordTooLarge,

    /// An inbound frame didn't decode into the type registered for its method.
    #[error("bad RPC payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// `send`/dispatch referenced a method nobody registered on this channel.
    #[error("method '{0}' is not registered on this channel")]
    UnknownMethod(String),

    /// `send` was called with a payload that doesn't match the method's registered type.
    #[error("payload type does not match the type registered for this method")]
    WrongType,

    /// `update_peer` was asked to configure a peer with no network in common.
    #[error("peer shares no network with this node")]
    NoCommonNetwork,

    /// Two otherwise-distinct nodes presented identical WireGuard public keys, so the
    /// rank rule can't pick a dialer for the pair.
    #[error("peer presented the same public key as this node")]
    DuplicateIdentity,

    #[error("invalid WireGuard key: {0}")]
    InvalidKey(#[from] wireguard_control::InvalidKey),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
