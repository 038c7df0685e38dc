//! Primitives to encode and decode the wire records exchanged
//! on an established channel and during the key exchange.

use strum::{AsRefStr, Display, FromRepr};

use crate::{Error, Result};

/// Size of the serialized record header.
pub const HEADER_SIZE: usize = 21;

/// The message type carried in a record's first header byte.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRepr, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum Flag {
    /// No message state.
    #[default]
    None = 0x00,

    /// Channel announcement.
    Announce = 0x01,

    /// First handshake message, client to server.
    ConnectRequest = 0x02,

    /// Signed ephemeral key and session token, server to client.
    ConnectResponse = 0x03,

    /// KEM ciphertext, client to server.
    ExchangeRequest = 0x04,

    /// Keying confirmation, server to client.
    ExchangeResponse = 0x05,

    /// Session establish request.
    EstablishRequest = 0x06,

    /// Session establish response.
    EstablishResponse = 0x07,

    /// An encrypted application record.
    EncryptedMessage = 0x08,

    /// Orderly teardown of the channel.
    ConnectionTerminate = 0x09,

    /// Channel keep-alive.
    KeepAlive = 0x0a,

    /// An error code sent to the peer before closing.
    ErrorCondition = 0x0b,
}

/// One unit of traffic: a 21-byte header followed by `payload` bytes.
///
/// The header is serialized little-endian as
/// `{flag:1, sequence:8, utc:8, msg_length:4}` and doubles, verbatim, as
/// the associated data of the record cipher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// The message type of this record.
    pub flag: Flag,

    /// Per-direction sequence number, strictly monotonic.
    pub sequence: u64,

    /// Sender-issued timestamp, in seconds since the epoch.
    pub utc: u64,

    /// The record payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Assemble a record from its parts, stamping the current time.
    pub fn new(flag: Flag, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            flag,
            sequence,
            utc: utc_now(),
            payload,
        }
    }

    /// The serialized header of this record.
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        header_bytes(self.flag, self.sequence, self.utc, self.payload.len() as u32)
    }

    /// Serialize the record, header first, payload following.
    pub fn to_stream(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());

        buf.extend_from_slice(&self.header());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Deserialize a record from `buf`.
    ///
    /// Fails with [`Error::InvalidInput`] when `buf` is shorter than a
    /// header, names an unassigned flag, or does not carry the full
    /// payload its header promises.
    pub fn from_stream(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        let flag = Flag::from_repr(buf[0]).ok_or(Error::InvalidInput)?;
        let sequence = u64::from_le_bytes(buf[1..9].try_into().map_err(|_| Error::InvalidInput)?);
        let utc = u64::from_le_bytes(buf[9..17].try_into().map_err(|_| Error::InvalidInput)?);
        let msg_length =
            u32::from_le_bytes(buf[17..21].try_into().map_err(|_| Error::InvalidInput)?) as usize;

        if buf.len() < HEADER_SIZE + msg_length {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            flag,
            sequence,
            utc,
            payload: buf[HEADER_SIZE..HEADER_SIZE + msg_length].to_vec(),
        })
    }
}

/// Serialize a record header from its fields.
pub fn header_bytes(flag: Flag, sequence: u64, utc: u64, msg_length: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];

    header[0] = flag as u8;
    header[1..9].copy_from_slice(&sequence.to_le_bytes());
    header[9..17].copy_from_slice(&utc.to_le_bytes());
    header[17..21].copy_from_slice(&msg_length.to_le_bytes());

    header
}

/// Seconds since the epoch, as stamped into record headers.
pub(crate) fn utc_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_round_trips() {
        let packet = Packet::new(Flag::EncryptedMessage, 42, b"sealed bytes".to_vec());

        let decoded = Packet::from_stream(&packet.to_stream()).expect("decode failed");

        assert_eq!(decoded, packet);
    }

    #[test]
    fn it_rejects_a_truncated_header() {
        assert!(matches!(
            Packet::from_stream(&[0u8; HEADER_SIZE - 1]),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn it_rejects_a_truncated_payload() {
        let mut stream = Packet::new(Flag::KeepAlive, 1, vec![0u8; 16]).to_stream();
        stream.truncate(stream.len() - 1);

        assert!(matches!(
            Packet::from_stream(&stream),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn it_rejects_an_unassigned_flag() {
        let mut stream = Packet::new(Flag::KeepAlive, 1, vec![]).to_stream();
        stream[0] = 0xff;

        assert!(matches!(
            Packet::from_stream(&stream),
            Err(Error::InvalidInput)
        ));
    }

    #[test]
    fn the_header_matches_the_wire_prefix() {
        let packet = Packet::new(Flag::ConnectRequest, 7, vec![1, 2, 3]);

        assert_eq!(packet.to_stream()[..HEADER_SIZE], packet.header());
    }
}
