//! The signature scheme, bound to Dilithium level 2.

use pqcrypto_dilithium::dilithium2;
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};

use crate::{Error, Result};

pub use dilithium2::{DetachedSignature, PublicKey, SecretKey};

/// Generate a long-lived signing keypair.
pub fn keypair() -> (PublicKey, SecretKey) {
    dilithium2::keypair()
}

/// Sign `message` with `key`, producing a detached signature.
pub fn sign(message: &[u8], key: &SecretKey) -> DetachedSignature {
    dilithium2::detached_sign(message, key)
}

/// Verify a detached `signature` over `message` against `key`.
pub fn verify(signature: &DetachedSignature, message: &[u8], key: &PublicKey) -> bool {
    dilithium2::verify_detached_signature(signature, message, key).is_ok()
}

/// Parse a detached signature off the wire.
pub fn signature_from_bytes(bytes: &[u8]) -> Result<DetachedSignature> {
    DetachedSignature::from_bytes(bytes).map_err(|_| Error::InvalidInput)
}

/// Parse a verification key out of an encoded key block.
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_bytes(bytes).map_err(|_| Error::InvalidInput)
}

/// Serialized size of a detached signature.
pub fn signature_bytes() -> usize {
    dilithium2::signature_bytes()
}

/// Serialized size of a verification key.
pub fn public_key_bytes() -> usize {
    dilithium2::public_key_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_signs_and_verifies() {
        let (vk, sk) = keypair();
        let signature = sign(b"a transcript hash", &sk);

        assert!(verify(&signature, b"a transcript hash", &vk));
    }

    #[test]
    fn a_mutated_message_fails_verification() {
        let (vk, sk) = keypair();
        let signature = sign(b"a transcript hash", &sk);

        assert!(!verify(&signature, b"a transcript hasH", &vk));
    }

    #[test]
    fn a_foreign_key_fails_verification() {
        let (_, sk) = keypair();
        let (other_vk, _) = keypair();
        let signature = sign(b"a transcript hash", &sk);

        assert!(!verify(&signature, b"a transcript hash", &other_vk));
    }
}
