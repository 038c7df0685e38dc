//! The key-encapsulation mechanism, bound to Kyber level 1.

use pqcrypto_kyber::kyber512;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use zeroize::Zeroizing;

use crate::{Error, Result};

pub use kyber512::{Ciphertext, PublicKey, SecretKey};

/// Generate an ephemeral encapsulation keypair.
pub fn keypair() -> (PublicKey, SecretKey) {
    kyber512::keypair()
}

/// Encapsulate to `key`, yielding the shared secret and the ciphertext
/// to transmit.
pub fn encapsulate(key: &PublicKey) -> (Zeroizing<Vec<u8>>, Ciphertext) {
    let (secret, ciphertext) = kyber512::encapsulate(key);

    (Zeroizing::new(secret.as_bytes().to_vec()), ciphertext)
}

/// Decapsulate `ciphertext` with `key`, recovering the shared secret.
pub fn decapsulate(ciphertext: &Ciphertext, key: &SecretKey) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(kyber512::decapsulate(ciphertext, key).as_bytes().to_vec())
}

/// Parse an encapsulation key off the wire.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes).map_err(|_| Error::InvalidInput)
}

/// Parse a ciphertext off the wire.
pub fn ciphertext_from_bytes(bytes: &[u8]) -> Result<Ciphertext> {
    Ciphertext::from_bytes(bytes).map_err(|_| Error::InvalidInput)
}

/// Serialized size of an encapsulation key.
pub fn public_key_bytes() -> usize {
    kyber512::public_key_bytes()
}

/// Serialized size of a ciphertext.
pub fn ciphertext_bytes() -> usize {
    kyber512::ciphertext_bytes()
}

#[cfg(test)]
mod tests {
    use pqcrypto_traits::kem::PublicKey as _;

    use super::*;

    #[test]
    fn both_sides_agree_on_the_secret() {
        let (pk, sk) = keypair();

        let (sent, ciphertext) = encapsulate(&pk);
        let received = decapsulate(&ciphertext, &sk);

        assert_eq!(*sent, *received);
    }

    #[test]
    fn truncated_wire_keys_are_rejected() {
        let (pk, _) = keypair();

        assert!(public_key_from_bytes(&pk.as_bytes()[1..]).is_err());
        assert!(ciphertext_from_bytes(&[0u8; 3]).is_err());
    }
}
