//! Server side of the simplex key exchange.

use pqcrypto_traits::{kem::PublicKey as _, sign::DetachedSignature as _};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::{
    connection::{ConnectionState, KexStage},
    crypto::{self, kem, sign},
    packet::{Flag, Packet},
    Error, Result, CONFIG_STRING, KEYID_SIZE, STOKEN_SIZE,
};

use super::{check_skew, session_keys, transcript_hash, Role, ServerKey, AUTHENTICATOR};

/// Run the server side of the handshake on a fresh connection.
///
/// On failure the error code is best-effort reported to the peer before
/// it is returned; closing the connection is the caller's.
pub(crate) fn key_exchange(cns: &mut ConnectionState, key: &ServerKey) -> Result<()> {
    exchange(cns, key).map_err(|error| {
        let _ = cns.send_error(&error);

        error
    })
}

fn exchange(cns: &mut ConnectionState, key: &ServerKey) -> Result<()> {
    if key.is_expired() {
        return Err(Error::KeyExpired);
    }

    // M1: the connect request names our configuration and key identity.
    let request = cns.receive_packet()?;
    if request.flag != Flag::ConnectRequest {
        return Err(Error::UnexpectedMessage);
    }
    check_skew(request.utc)?;

    if request.payload.len() != CONFIG_STRING.len() + KEYID_SIZE {
        return Err(Error::InvalidInput);
    }
    let (config, keyid) = request.payload.split_at(CONFIG_STRING.len());
    if config != CONFIG_STRING {
        return Err(Error::UnknownProtocol);
    }
    if keyid != key.keyid {
        return Err(Error::KeyNotRecognized);
    }
    cns.set_stage(KexStage::Connect);

    // M2: a fresh session token and ephemeral encapsulation key, signed
    // over the transcript hash so neither can be swapped in flight.
    let (epk, esk) = kem::keypair();
    let mut token = Zeroizing::new([0u8; STOKEN_SIZE]);
    rand::thread_rng().fill_bytes(&mut *token);

    let hash = transcript_hash(&key.keyid, &*token, epk.as_bytes());
    let signature = sign::sign(&hash, key.sigkey());

    let mut payload =
        Vec::with_capacity(STOKEN_SIZE + sign::signature_bytes() + kem::public_key_bytes());
    payload.extend_from_slice(&*token);
    payload.extend_from_slice(signature.as_bytes());
    payload.extend_from_slice(epk.as_bytes());

    cns.send_packet(&Packet::new(Flag::ConnectResponse, 0, payload))?;

    // M3: the client's encapsulation against our ephemeral key.
    let exchange = cns.receive_packet()?;
    if exchange.flag != Flag::ExchangeRequest {
        return Err(Error::UnexpectedMessage);
    }
    check_skew(exchange.utc)?;
    cns.set_stage(KexStage::Exchange);

    let ciphertext = kem::ciphertext_from_bytes(&exchange.payload)?;
    let secret = kem::decapsulate(&ciphertext, &esk);

    let pkhash = crypto::public_key_hash(&key.verkey, &key.keyid);
    cns.install_keys(&session_keys(Role::Server, &pkhash, &*token, &secret));

    // M4: the first encrypted record confirms keying to the client.
    let confirm = cns.encrypt_packet(Flag::ExchangeResponse, &AUTHENTICATOR)?;
    cns.send_packet(&confirm)?;

    cns.establish();
    tracing::debug!("Session established with peer `{}`", cns.address());

    Ok(())
}
