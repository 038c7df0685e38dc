//! Client side of the simplex key exchange.

use pqcrypto_traits::kem::Ciphertext as _;

use crate::{
    connection::{ConnectionState, KexStage},
    crypto::{self, kem, sign},
    packet::{Flag, Packet},
    Error, Result, CONFIG_STRING, KEYID_SIZE, STOKEN_SIZE,
};

use super::{check_skew, session_keys, transcript_hash, ClientKey, Role, AUTHENTICATOR};

/// Run the client side of the handshake on a fresh connection.
///
/// On failure the error code is best-effort reported to the peer before
/// it is returned; closing the connection is the caller's.
pub(crate) fn key_exchange(cns: &mut ConnectionState, key: &ClientKey) -> Result<()> {
    exchange(cns, key).map_err(|error| {
        let _ = cns.send_error(&error);

        error
    })
}

fn exchange(cns: &mut ConnectionState, key: &ClientKey) -> Result<()> {
    if key.is_expired() {
        return Err(Error::KeyExpired);
    }

    // M1: name the configuration and the server key we expect.
    let mut payload = Vec::with_capacity(CONFIG_STRING.len() + KEYID_SIZE);
    payload.extend_from_slice(CONFIG_STRING);
    payload.extend_from_slice(&key.keyid);

    cns.send_packet(&Packet::new(Flag::ConnectRequest, 0, payload))?;
    cns.set_stage(KexStage::Connect);

    // M2: the server's session token and signed ephemeral key.
    let response = cns.receive_packet()?;
    if response.flag == Flag::ErrorCondition {
        return Err(peer_error(&response));
    }
    if response.flag != Flag::ConnectResponse {
        return Err(Error::UnexpectedMessage);
    }
    check_skew(response.utc)?;

    if response.payload.len() != STOKEN_SIZE + sign::signature_bytes() + kem::public_key_bytes() {
        return Err(Error::InvalidInput);
    }
    let (token, rest) = response.payload.split_at(STOKEN_SIZE);
    let (signature, epk) = rest.split_at(sign::signature_bytes());

    // The signature covers the whole transcript; a swapped token,
    // ephemeral key or configuration fails here.
    let hash = transcript_hash(&key.keyid, token, epk);
    let signature = sign::signature_from_bytes(signature)?;
    if !sign::verify(&signature, &hash, &key.verkey) {
        return Err(Error::AuthenticationFailure);
    }

    // M3: encapsulate against the authenticated ephemeral key.
    let epk = kem::public_key_from_bytes(epk)?;
    let (secret, ciphertext) = kem::encapsulate(&epk);

    cns.send_packet(&Packet::new(
        Flag::ExchangeRequest,
        0,
        ciphertext.as_bytes().to_vec(),
    ))?;
    cns.set_stage(KexStage::Exchange);

    let pkhash = crypto::public_key_hash(&key.verkey, &key.keyid);
    cns.install_keys(&session_keys(Role::Client, &pkhash, token, &secret));

    // M4: the server's first encrypted record proves it derived the
    // same keys.
    let confirm = cns.receive_packet()?;
    if confirm.flag == Flag::ErrorCondition {
        return Err(peer_error(&confirm));
    }
    if confirm.flag != Flag::ExchangeResponse {
        return Err(Error::UnexpectedMessage);
    }
    check_skew(confirm.utc)?;

    let authenticator = cns.decrypt_packet(&confirm)?;
    if authenticator != AUTHENTICATOR {
        return Err(Error::AuthenticationFailure);
    }

    cns.establish();
    tracing::debug!("Session established with server `{}`", cns.address());

    Ok(())
}

/// Decode an in-the-clear handshake error report.
fn peer_error(packet: &Packet) -> Error {
    packet
        .payload
        .first()
        .copied()
        .and_then(Error::from_code)
        .unwrap_or(Error::ConnectionFailure)
}
