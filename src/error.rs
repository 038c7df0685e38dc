//! Collection of error handling types and aliases.

use thiserror::Error;

/// The error types that can occur when manipulating this crate.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// I/O Error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The listener failed to accept a connection.
    #[error("The listener failed to accept the connection")]
    AcceptFail,

    /// The listen socket could not be created or bound.
    #[error("The listener socket could not be initialized")]
    ListenerFail,

    /// The connection failed or was refused.
    #[error("The connection failed or was refused by the peer")]
    ConnectionFailure,

    /// The transport link went down mid-session.
    #[error("The communications channel has failed")]
    ChannelDown,

    /// A signature or record tag failed to verify.
    #[error("The symmetric cipher or signature authentication has failed")]
    AuthenticationFailure,

    /// The record cipher failed to transform a payload.
    #[error("The record cipher transform has failed")]
    DecryptionFailure,

    /// A record arrived out of sequence.
    #[error("The packet sequence number is out of order")]
    PacketUnsequenced,

    /// A record's timestamp fell outside the freshness window.
    #[error("The packet has expired")]
    PacketExpired,

    /// A handshake message's timestamp was too far from local time.
    #[error("The packet timestamp exceeds the maximum clock skew")]
    PacketTimeInvalid,

    /// The peer proposed an unknown protocol configuration.
    #[error("The peer's protocol configuration string is unknown")]
    UnknownProtocol,

    /// The peer named a key identity this host does not hold.
    #[error("The key identity is not recognized")]
    KeyNotRecognized,

    /// The long-lived signature key has passed its expiration.
    #[error("The signature key has expired")]
    KeyExpired,

    /// The connection pool is at capacity.
    #[error("The maximum number of hosts has been exceeded")]
    HostsExceeded,

    /// Malformed or truncated input to the record codec.
    #[error("The serialized input is malformed or truncated")]
    InvalidInput,

    /// The message received was unexpected in the current context.
    #[error("Peer sent a message that made no sense in the current context")]
    UnexpectedMessage,
}

impl Error {
    /// The stable one-byte wire code for this error, carried as the
    /// payload of `error_condition` records.
    pub fn code(&self) -> u8 {
        match self {
            Self::Io(_) | Self::ConnectionFailure => 0x03,
            Self::AcceptFail => 0x01,
            Self::ListenerFail => 0x02,
            Self::ChannelDown => 0x04,
            Self::AuthenticationFailure => 0x05,
            Self::DecryptionFailure => 0x06,
            Self::PacketUnsequenced => 0x07,
            Self::PacketExpired => 0x08,
            Self::PacketTimeInvalid => 0x09,
            Self::UnknownProtocol => 0x0a,
            Self::KeyNotRecognized => 0x0b,
            Self::KeyExpired => 0x0c,
            Self::HostsExceeded => 0x0d,
            Self::InvalidInput => 0x0e,
            Self::UnexpectedMessage => 0x0f,
        }
    }

    /// Decode a wire code back into an error, `None` for unassigned codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::AcceptFail),
            0x02 => Some(Self::ListenerFail),
            0x03 => Some(Self::ConnectionFailure),
            0x04 => Some(Self::ChannelDown),
            0x05 => Some(Self::AuthenticationFailure),
            0x06 => Some(Self::DecryptionFailure),
            0x07 => Some(Self::PacketUnsequenced),
            0x08 => Some(Self::PacketExpired),
            0x09 => Some(Self::PacketTimeInvalid),
            0x0a => Some(Self::UnknownProtocol),
            0x0b => Some(Self::KeyNotRecognized),
            0x0c => Some(Self::KeyExpired),
            0x0d => Some(Self::HostsExceeded),
            0x0e => Some(Self::InvalidInput),
            0x0f => Some(Self::UnexpectedMessage),
            _ => None,
        }
    }
}

/// A handy [`std::result::Result`] type alias bounding the [`enum@Error`] struct as `E`.
pub type Result<T, E = Error> = std::result::Result<T, E>;
