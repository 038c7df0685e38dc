//! Per-peer connection state: the socket, the directional cipher
//! states, the sequence counters and the record encrypt/decrypt paths.

use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    time::Duration,
};

use zeroize::{Zeroize, Zeroizing};

use crate::{
    crypto::cipher::RecordCipher,
    kex::SessionKeys,
    packet::{header_bytes, utc_now, Flag, Packet, HEADER_SIZE},
    Error, Result, CONNECTION_MTU, KEEPALIVE_WINDOW, SESSION_LIFETIME, TAG_SIZE,
};

/// Progression of a connection through the key exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum KexStage {
    /// No handshake in progress.
    #[default]
    None,

    /// The connect request has been validated.
    Connect,

    /// The encapsulation has been exchanged.
    Exchange,

    /// Session keys are loaded, awaiting confirmation.
    Establish,

    /// The channel is established.
    Session,
}

/// The state of one encrypted channel endpoint.
///
/// Owns the socket and both directional cipher states; the sending and
/// receiving directions never share key material. Closing the
/// connection wipes every secret the state holds.
pub struct ConnectionState {
    target: TcpStream,
    address: SocketAddr,
    instance: u32,

    rxcpr: Option<RecordCipher>,
    txcpr: Option<RecordCipher>,

    /// Reserved re-keying seed; loaded by the key schedule, unused in
    /// the simplex profile.
    ratchet: Zeroizing<[u8; 32]>,

    rxseq: u64,
    txseq: u64,

    stage: KexStage,
    expiration: u64,
    connected: bool,
}

impl ConnectionState {
    pub(crate) fn new(target: TcpStream, instance: u32) -> Result<Self> {
        let address = target.peer_addr()?;

        Ok(Self {
            target,
            address,
            instance,
            rxcpr: None,
            txcpr: None,
            ratchet: Zeroizing::new([0u8; 32]),
            rxseq: 0,
            txseq: 0,
            stage: KexStage::None,
            expiration: 0,
            connected: true,
        })
    }

    /// The pool identity of this connection, stable for its lifetime.
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// The peer's socket address.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Whether the channel is still connected.
    ///
    /// Probes the transport for liveness, so a peer that went away
    /// without an orderly teardown (a pending socket error or an
    /// end-of-stream nothing has read yet) is reported disconnected
    /// before any blocking read fails.
    pub fn is_connected(&self) -> bool {
        self.connected && probe_connected(&self.target)
    }

    /// Whether the key exchange has completed on this connection.
    pub fn is_established(&self) -> bool {
        self.stage == KexStage::Session
    }

    pub(crate) fn set_stage(&mut self, stage: KexStage) {
        self.stage = stage;
    }

    /// Whether the session has outlived its expiration horizon.
    pub(crate) fn is_expired(&self) -> bool {
        self.stage == KexStage::Session && utc_now() > self.expiration
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.target.set_read_timeout(timeout)?;

        Ok(())
    }

    /// A second handle onto the socket, for reading outside the state's
    /// lock.
    pub(crate) fn reader(&self) -> Result<TcpStream> {
        Ok(self.target.try_clone()?)
    }

    /// Load the derived session keys into fresh directional cipher
    /// states and stash the reserved ratchet seed.
    pub(crate) fn install_keys(&mut self, keys: &SessionKeys) {
        self.rxcpr = Some(RecordCipher::new(&keys.rx_key, &keys.rx_nonce));
        self.txcpr = Some(RecordCipher::new(&keys.tx_key, &keys.tx_nonce));
        self.ratchet.copy_from_slice(&keys.ratchet);
        self.stage = KexStage::Establish;
    }

    /// Mark the handshake complete and start the session lifetime.
    pub(crate) fn establish(&mut self) {
        self.stage = KexStage::Session;
        self.expiration = utc_now() + SESSION_LIFETIME;
    }

    /// Serialize and send one record on the socket.
    pub(crate) fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        write_packet(&mut self.target, packet)?;

        tracing::trace!(
            "-~> #{}: {} ({} bytes)",
            packet.sequence,
            packet.flag,
            packet.payload.len(),
        );

        Ok(())
    }

    /// Receive one full record from the socket.
    pub(crate) fn receive_packet(&mut self) -> Result<Packet> {
        let packet = read_packet(&mut self.target)?;

        tracing::trace!(
            "<~- #{}: {} ({} bytes)",
            packet.sequence,
            packet.flag,
            packet.payload.len(),
        );

        Ok(packet)
    }

    /// Encrypt `message` into a record, advancing the transmit sequence.
    ///
    /// The serialized header, with `msg_length` covering the trailing
    /// tag, is the cipher's associated data.
    pub(crate) fn encrypt_packet(&mut self, flag: Flag, message: &[u8]) -> Result<Packet> {
        let Some(ref mut txcpr) = self.txcpr else {
            return Err(Error::ConnectionFailure);
        };

        if HEADER_SIZE + message.len() + TAG_SIZE > CONNECTION_MTU {
            return Err(Error::InvalidInput);
        }

        self.txseq += 1;

        let utc = utc_now();
        let header = header_bytes(flag, self.txseq, utc, (message.len() + TAG_SIZE) as u32);
        let payload = txcpr.seal(&header, message)?;

        Ok(Packet {
            flag,
            sequence: self.txseq,
            utc,
            payload,
        })
    }

    /// Verify and decrypt one received record.
    ///
    /// The sequence must be exactly one past the last accepted record
    /// and the timestamp within the keep-alive window; either failure,
    /// like a tag mismatch, is fatal to the connection.
    pub(crate) fn decrypt_packet(&mut self, packet: &Packet) -> Result<Vec<u8>> {
        let Some(ref mut rxcpr) = self.rxcpr else {
            return Err(Error::ConnectionFailure);
        };

        if packet.sequence != self.rxseq + 1 {
            return Err(Error::PacketUnsequenced);
        }
        self.rxseq += 1;

        if utc_now().abs_diff(packet.utc) > KEEPALIVE_WINDOW {
            return Err(Error::PacketExpired);
        }

        rxcpr.open(&packet.header(), &packet.payload)
    }

    /// Encrypt `message` into an application record and send it.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        let packet = self.encrypt_packet(Flag::EncryptedMessage, message)?;

        self.send_packet(&packet)
    }

    /// Block for the next application message.
    ///
    /// An orderly teardown from the peer surfaces as
    /// [`Error::ChannelDown`]; a peer-reported error surfaces as the
    /// decoded error; both close the connection first.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        loop {
            let packet = self.receive_packet()?;

            match packet.flag {
                Flag::EncryptedMessage => match self.decrypt_packet(&packet) {
                    Ok(message) => break Ok(message),
                    Err(error) => {
                        self.close(Some(&error), true);

                        break Err(error);
                    }
                },
                Flag::KeepAlive => continue,
                Flag::ConnectionTerminate => {
                    self.close(None, false);

                    break Err(Error::ChannelDown);
                }
                Flag::ErrorCondition => {
                    let error = self.peer_error(&packet);
                    self.close(None, false);

                    break Err(error);
                }
                _ => {
                    self.close(Some(&Error::ConnectionFailure), true);

                    break Err(Error::UnexpectedMessage);
                }
            }
        }
    }

    /// Send the one-byte error code to the peer, encrypted once the
    /// channel is established, in the clear during the handshake.
    pub(crate) fn send_error(&mut self, error: &Error) -> Result<()> {
        let packet = match self.stage {
            KexStage::Session => self.encrypt_packet(Flag::ErrorCondition, &[error.code()])?,
            _ => Packet::new(Flag::ErrorCondition, 0, vec![error.code()]),
        };

        self.send_packet(&packet)
    }

    /// Decode the error code a peer reported before closing.
    fn peer_error(&mut self, packet: &Packet) -> Error {
        let code = match self.stage {
            KexStage::Session => self
                .decrypt_packet(packet)
                .ok()
                .and_then(|message| message.first().copied()),
            _ => packet.payload.first().copied(),
        };

        code.and_then(Error::from_code)
            .unwrap_or(Error::ConnectionFailure)
    }

    /// Tear the connection down.
    ///
    /// With `notify`, best-effort sends the error code (when one is
    /// given) and a terminate record to the peer first. The socket is
    /// shut down exactly once and every secret the state holds is
    /// wiped.
    pub fn close(&mut self, error: Option<&Error>, notify: bool) {
        if !self.connected {
            return;
        }

        if notify {
            if let Some(error) = error {
                let _ = self.send_error(error);
            }

            let terminate = match self.stage {
                KexStage::Session => self.encrypt_packet(Flag::ConnectionTerminate, &[]),
                _ => Ok(Packet::new(Flag::ConnectionTerminate, 0, vec![])),
            };

            if let Ok(packet) = terminate {
                let _ = self.send_packet(&packet);
            }
        }

        let _ = self.target.shutdown(Shutdown::Both);
        self.connected = false;

        self.clear();
    }

    fn clear(&mut self) {
        self.rxcpr = None;
        self.txcpr = None;
        self.ratchet.zeroize();
        self.rxseq = 0;
        self.txseq = 0;
        self.stage = KexStage::None;
        self.expiration = 0;
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("address", &self.address)
            .field("instance", &self.instance)
            .field("stage", &self.stage)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

/// Read one full record off `stream`, reassembling until the header's
/// promised payload is buffered.
pub(crate) fn read_packet(stream: &mut TcpStream) -> Result<Packet> {
    let mut record = vec![0u8; HEADER_SIZE];
    read_full(stream, &mut record, false)?;

    let msg_length =
        u32::from_le_bytes(record[17..21].try_into().map_err(|_| Error::InvalidInput)?) as usize;

    if HEADER_SIZE + msg_length > CONNECTION_MTU {
        return Err(Error::InvalidInput);
    }

    record.resize(HEADER_SIZE + msg_length, 0);
    read_full(stream, &mut record[HEADER_SIZE..], true)?;

    Packet::from_stream(&record)
}

/// Fill `buf` from `stream`.
///
/// Once a record has `started`, transient would-block returns keep the
/// reassembly going instead of surfacing: a liveness probe on another
/// handle of the socket may momentarily leave it non-blocking. Before
/// the first byte they propagate, so idle read timeouts still reach the
/// caller.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], mut started: bool) -> Result<()> {
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(std::io::Error::from(ErrorKind::UnexpectedEof).into()),
            Ok(count) => {
                filled += count;
                started = true;
            }
            Err(error)
                if started && matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}

/// Probe `stream` for liveness without consuming data: a pending socket
/// error or an end-of-stream on a one-byte peek means the peer is gone.
fn probe_connected(stream: &TcpStream) -> bool {
    if !matches!(stream.take_error(), Ok(None)) {
        return false;
    }

    // The peek must not block; the flag is restored right after, and
    // concurrent readers absorb the window (see `read_full`).
    if stream.set_nonblocking(true).is_err() {
        return false;
    }

    let alive = match stream.peek(&mut [0u8; 1]) {
        Ok(0) => false,
        Ok(_) => true,
        Err(error) if error.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    };

    let _ = stream.set_nonblocking(false);

    alive
}

/// Serialize and write one record to `stream`.
pub(crate) fn write_packet(stream: &mut TcpStream, packet: &Packet) -> Result<()> {
    stream.write_all(&packet.to_stream())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::kex::{session_keys, Role};

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let address = listener.local_addr().expect("no local address");

        let near = TcpStream::connect(address).expect("connect failed");
        let (far, _) = listener.accept().expect("accept failed");

        (near, far)
    }

    fn established_pair(secret: &[u8]) -> (ConnectionState, ConnectionState) {
        let (near, far) = stream_pair();

        let mut client = ConnectionState::new(near, 1).expect("client state failed");
        let mut server = ConnectionState::new(far, 2).expect("server state failed");

        let pkhash = [0x11u8; 32];
        let token = [0x22u8; 32];

        client.install_keys(&session_keys(Role::Client, &pkhash, &token, secret));
        client.establish();
        server.install_keys(&session_keys(Role::Server, &pkhash, &token, secret));
        server.establish();

        (client, server)
    }

    #[test]
    fn records_round_trip_over_the_socket() {
        let (mut client, mut server) = established_pair(b"shared secret");

        client.send(b"hello").expect("send failed");
        assert_eq!(server.receive().expect("receive failed"), b"hello");

        server.send(b"general kenobi").expect("send failed");
        assert_eq!(client.receive().expect("receive failed"), b"general kenobi");

        assert_eq!(client.txseq, 1);
        assert_eq!(client.rxseq, 1);
        assert_eq!(server.txseq, 1);
        assert_eq!(server.rxseq, 1);
    }

    #[test]
    fn a_replayed_record_is_unsequenced() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let first = client.encrypt_packet(Flag::EncryptedMessage, b"one").expect("encrypt failed");
        let second = client.encrypt_packet(Flag::EncryptedMessage, b"two").expect("encrypt failed");

        assert_eq!(server.decrypt_packet(&first).expect("decrypt failed"), b"one");
        assert_eq!(server.decrypt_packet(&second).expect("decrypt failed"), b"two");

        assert!(matches!(
            server.decrypt_packet(&first),
            Err(Error::PacketUnsequenced)
        ));
    }

    #[test]
    fn a_skipped_record_is_unsequenced() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let _first = client.encrypt_packet(Flag::EncryptedMessage, b"one").expect("encrypt failed");
        let second = client.encrypt_packet(Flag::EncryptedMessage, b"two").expect("encrypt failed");

        assert!(matches!(
            server.decrypt_packet(&second),
            Err(Error::PacketUnsequenced)
        ));
    }

    #[test]
    fn a_stale_record_is_expired() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let mut packet = client.encrypt_packet(Flag::EncryptedMessage, b"old news").expect("encrypt failed");
        packet.utc -= KEEPALIVE_WINDOW + 1;

        assert!(matches!(
            server.decrypt_packet(&packet),
            Err(Error::PacketExpired)
        ));
    }

    #[test]
    fn a_tampered_payload_fails_authentication() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let mut packet = client.encrypt_packet(Flag::EncryptedMessage, b"payload").expect("encrypt failed");
        packet.payload[0] ^= 0x01;

        assert!(matches!(
            server.decrypt_packet(&packet),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn a_tampered_header_fails_authentication() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let mut packet = client.encrypt_packet(Flag::EncryptedMessage, b"payload").expect("encrypt failed");
        packet.flag = Flag::KeepAlive;

        assert!(matches!(
            server.decrypt_packet(&packet),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn records_do_not_cross_between_sessions() {
        let (mut client_a, _server_a) = established_pair(b"session a");
        let (_client_b, mut server_b) = established_pair(b"session b");

        let packet = client_a.encrypt_packet(Flag::EncryptedMessage, b"misdirected").expect("encrypt failed");

        assert!(matches!(
            server_b.decrypt_packet(&packet),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn a_tampered_record_tears_the_receiver_down() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let mut packet = client.encrypt_packet(Flag::EncryptedMessage, b"payload").expect("encrypt failed");
        packet.payload[3] ^= 0x10;
        client.send_packet(&packet).expect("send failed");

        assert!(matches!(
            server.receive(),
            Err(Error::AuthenticationFailure)
        ));
        assert!(!server.is_connected());
        assert!(!server.is_established());

        // The sending side is told what happened before the teardown.
        assert!(matches!(
            client.receive(),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn a_replayed_record_tears_the_receiver_down() {
        let (mut client, mut server) = established_pair(b"shared secret");

        let packet = client.encrypt_packet(Flag::EncryptedMessage, b"once").expect("encrypt failed");
        client.send_packet(&packet).expect("send failed");
        client.send_packet(&packet).expect("send failed");

        assert_eq!(server.receive().expect("receive failed"), b"once");
        assert!(matches!(
            server.receive(),
            Err(Error::PacketUnsequenced)
        ));
        assert!(!server.is_connected());
    }

    #[test]
    fn a_silently_dead_peer_is_observed_disconnected() {
        let (client, server) = established_pair(b"shared secret");

        assert!(server.is_connected());

        // The peer goes away without a terminate record; the probe
        // notices without any read having failed.
        drop(client);

        let mut observed_down = false;
        for _ in 0..50 {
            if !server.is_connected() {
                observed_down = true;
                break;
            }

            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(observed_down);
    }

    #[test]
    fn a_peer_error_surfaces_from_receive() {
        let (mut client, mut server) = established_pair(b"shared secret");

        server.close(Some(&Error::AuthenticationFailure), true);

        assert!(matches!(
            client.receive(),
            Err(Error::AuthenticationFailure)
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn a_clean_teardown_surfaces_as_channel_down() {
        let (mut client, mut server) = established_pair(b"shared secret");

        server.close(None, true);

        assert!(matches!(client.receive(), Err(Error::ChannelDown)));
    }

    #[test]
    fn closing_wipes_the_channel_state() {
        let (mut client, _server) = established_pair(b"shared secret");

        client.close(None, false);

        assert!(!client.is_connected());
        assert!(!client.is_established());
        assert!(client.rxcpr.is_none());
        assert!(client.txcpr.is_none());
        assert_eq!(*client.ratchet, [0u8; 32]);
        assert!(client.send(b"too late").is_err());

        // A second close is a quiet no-op.
        client.close(None, true);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let (mut client, _server) = established_pair(b"shared secret");

        assert!(matches!(
            client.encrypt_packet(Flag::EncryptedMessage, &vec![0u8; CONNECTION_MTU]),
            Err(Error::InvalidInput)
        ));
    }
}
