//! Key-exchange mechanics: the long-lived server identity, the
//! SHAKE-256 key schedule, and the simplex handshake for either side.
//!
//! The handshake is three messages and server-authenticated; the client
//! stays anonymous. The server signs a transcript hash binding the
//! configuration string, its key identity, the session token and the
//! ephemeral encapsulation key, so none of them can be swapped without
//! the client noticing.

pub(crate) mod client;
pub(crate) mod server;

use std::time::Duration;

use base64ct::{Base64, Encoding};
use pqcrypto_traits::sign::PublicKey as _;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    crypto::{
        cipher::{KEY_SIZE, NONCE_SIZE},
        sign, xof,
    },
    packet::utc_now,
    Error, Result, CONFIG_STRING, KEX_SKEW_MAX, KEYID_SIZE, PKCODE_SIZE,
};

/// The long-lived server identity: a signing keypair, its identity
/// string and an expiration horizon.
pub struct ServerKey {
    /// The key identity string, named by connecting clients.
    pub keyid: [u8; KEYID_SIZE],

    /// UTC seconds past which this key must be refused.
    pub expiration: u64,

    /// The verification half, distributed to clients out of band.
    pub verkey: sign::PublicKey,

    sigkey: sign::SecretKey,
}

impl ServerKey {
    /// Generate a fresh identity valid for `lifetime`.
    pub fn generate(lifetime: Duration) -> Self {
        let (verkey, sigkey) = sign::keypair();

        let mut keyid = [0u8; KEYID_SIZE];
        rand::thread_rng().fill_bytes(&mut keyid);

        Self {
            keyid,
            expiration: utc_now() + lifetime.as_secs(),
            verkey,
            sigkey,
        }
    }

    /// The public material a client needs to reach this server.
    pub fn client_key(&self) -> ClientKey {
        ClientKey {
            keyid: self.keyid,
            expiration: self.expiration,
            verkey: self.verkey,
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        utc_now() >= self.expiration
    }

    pub(crate) fn sigkey(&self) -> &sign::SecretKey {
        &self.sigkey
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("keyid", &self.keyid)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// The out-of-band public material identifying a server: the key
/// identity, the verification key and the expiration horizon.
#[derive(Clone)]
pub struct ClientKey {
    /// The key identity string to name in the connect request.
    pub keyid: [u8; KEYID_SIZE],

    /// UTC seconds past which the server identity must be refused.
    pub expiration: u64,

    /// The server's verification key.
    pub verkey: sign::PublicKey,
}

const PUBKEY_HEADER: &str = "------BEGIN QSMP PUBLIC KEY BLOCK------";
const PUBKEY_FOOTER: &str = "------END QSMP PUBLIC KEY BLOCK------";

impl ClientKey {
    /// Encode the public material into an armored text block for
    /// out-of-band distribution.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(KEYID_SIZE + 8 + sign::public_key_bytes());
        bytes.extend_from_slice(&self.keyid);
        bytes.extend_from_slice(&self.expiration.to_le_bytes());
        bytes.extend_from_slice(self.verkey.as_bytes());

        let encoded = Base64::encode_string(&bytes);

        let mut block = String::from(PUBKEY_HEADER);
        for line in encoded.as_bytes().chunks(64) {
            block.push('\n');
            block.push_str(std::str::from_utf8(line).unwrap_or_default());
        }
        block.push('\n');
        block.push_str(PUBKEY_FOOTER);
        block.push('\n');

        block
    }

    /// Decode an armored key block produced by [`Self::encode`].
    ///
    /// Fails with [`Error::InvalidInput`] on missing armor, bad
    /// encoding, or a truncated key.
    pub fn decode(block: &str) -> Result<Self> {
        let mut lines = block.lines().map(str::trim);

        if lines.next() != Some(PUBKEY_HEADER) {
            return Err(Error::InvalidInput);
        }
        let encoded: String = lines
            .by_ref()
            .take_while(|line| *line != PUBKEY_FOOTER)
            .collect();

        let bytes = Base64::decode_vec(&encoded).map_err(|_| Error::InvalidInput)?;
        if bytes.len() != KEYID_SIZE + 8 + sign::public_key_bytes() {
            return Err(Error::InvalidInput);
        }

        let (keyid, rest) = bytes.split_at(KEYID_SIZE);
        let (expiration, verkey) = rest.split_at(8);

        Ok(Self {
            keyid: keyid.try_into().map_err(|_| Error::InvalidInput)?,
            expiration: u64::from_le_bytes(expiration.try_into().map_err(|_| Error::InvalidInput)?),
            verkey: sign::public_key_from_bytes(verkey)?,
        })
    }

    pub(crate) fn is_expired(&self) -> bool {
        utc_now() >= self.expiration
    }
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey")
            .field("keyid", &self.keyid)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// Which end of the handshake is deriving keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// The session key material produced by the key schedule: one
/// (key, nonce) pair per direction plus the reserved ratchet seed.
/// Wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct SessionKeys {
    pub tx_key: [u8; KEY_SIZE],
    pub tx_nonce: [u8; NONCE_SIZE],
    pub rx_key: [u8; KEY_SIZE],
    pub rx_nonce: [u8; NONCE_SIZE],
    pub ratchet: [u8; 32],
}

/// The fixed keying-confirmation payload carried by the final handshake
/// record.
pub(crate) const AUTHENTICATOR: [u8; 16] = [0u8; 16];

const LABEL_SERVER_TO_CLIENT: &[u8] = b"qsmp server to client";
const LABEL_CLIENT_TO_SERVER: &[u8] = b"qsmp client to server";
const LABEL_RATCHET: &[u8] = b"qsmp ratchet";

/// Derive the directional session keys from the public-key hash, the
/// session token and the encapsulated shared secret.
///
/// The server transmits under the server→client keys and the client
/// under the client→server keys, so each side's tx state mirrors the
/// peer's rx state.
pub(crate) fn session_keys(role: Role, pkhash: &[u8], token: &[u8], secret: &[u8]) -> SessionKeys {
    fn expand(
        pkhash: &[u8],
        token: &[u8],
        secret: &[u8],
        label: &[u8],
    ) -> ([u8; KEY_SIZE], [u8; NONCE_SIZE]) {
        let mut okm: [u8; KEY_SIZE + NONCE_SIZE] = xof::shake256(&[pkhash, token, secret, label]);

        let mut key = [0u8; KEY_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        nonce.copy_from_slice(&okm[KEY_SIZE..]);
        okm.zeroize();

        (key, nonce)
    }

    let (stc_key, stc_nonce) = expand(pkhash, token, secret, LABEL_SERVER_TO_CLIENT);
    let (cts_key, cts_nonce) = expand(pkhash, token, secret, LABEL_CLIENT_TO_SERVER);
    let ratchet = xof::shake256(&[pkhash, token, secret, LABEL_RATCHET]);

    match role {
        Role::Server => SessionKeys {
            tx_key: stc_key,
            tx_nonce: stc_nonce,
            rx_key: cts_key,
            rx_nonce: cts_nonce,
            ratchet,
        },
        Role::Client => SessionKeys {
            tx_key: cts_key,
            tx_nonce: cts_nonce,
            rx_key: stc_key,
            rx_nonce: stc_nonce,
            ratchet,
        },
    }
}

/// The transcript hash the server signs: configuration, key identity,
/// session token and ephemeral encapsulation key, in that order.
pub(crate) fn transcript_hash(keyid: &[u8], token: &[u8], epk: &[u8]) -> [u8; PKCODE_SIZE] {
    xof::shake256(&[CONFIG_STRING, keyid, token, epk])
}

/// Reject handshake messages whose timestamp strays more than
/// [`KEX_SKEW_MAX`] seconds from local time.
pub(crate) fn check_skew(utc: u64) -> Result<()> {
    if utc_now().abs_diff(utc) > KEX_SKEW_MAX {
        return Err(Error::PacketTimeInvalid);
    }

    Ok(())
}
