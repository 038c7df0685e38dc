//! Seams around the cryptographic collaborators: the key-encapsulation
//! mechanism, the signature scheme, the extendable-output function and
//! the record cipher. The rest of the crate only sees these interfaces.

pub mod cipher;
pub mod kem;
pub mod sign;
pub mod xof;

use pqcrypto_traits::sign::PublicKey as _;

use crate::{CONFIG_STRING, KEYID_SIZE, PKCODE_SIZE};

/// The public-key configuration hash bound into the handshake transcript:
/// a SHAKE-256 digest over the configuration string, the verification key
/// and the key identity.
pub(crate) fn public_key_hash(verkey: &sign::PublicKey, keyid: &[u8; KEYID_SIZE]) -> [u8; PKCODE_SIZE] {
    xof::shake256(&[CONFIG_STRING, verkey.as_bytes(), keyid])
}
