//! The directional record cipher: an authenticated stream state keyed
//! once at key-exchange completion and advanced per record.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use zeroize::Zeroize;

use crate::{Error, Result, TAG_SIZE};

/// Size of a record cipher key.
pub const KEY_SIZE: usize = 32;

/// Size of a record cipher base nonce.
pub const NONCE_SIZE: usize = 32;

/// One direction's cipher state.
///
/// Loaded with a 32-byte key and 32-byte base nonce derived by the key
/// schedule; every [`seal`](Self::seal) or [`open`](Self::open) call
/// consumes one position of the keystream, so both ends must transform
/// records in the same order. Dropping the state wipes the nonce
/// material.
pub struct RecordCipher {
    cipher: Aes256Gcm,
    nonce: [u8; NONCE_SIZE],
    counter: u64,
}

impl RecordCipher {
    /// Key a fresh state for one direction.
    pub fn new(key: &[u8; KEY_SIZE], nonce: &[u8; NONCE_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            nonce: *nonce,
            counter: 0,
        }
    }

    /// The per-record nonce: the base nonce truncated to the cipher's
    /// width, xored with the record counter.
    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&self.nonce[..12]);

        for (byte, ctr) in nonce[4..].iter_mut().zip(self.counter.to_le_bytes()) {
            *byte ^= ctr;
        }

        self.counter += 1;

        nonce
    }

    /// Encrypt `plaintext` with `aad` as associated data, producing
    /// ciphertext with the tag appended.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce();

        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| Error::DecryptionFailure)
    }

    /// Verify and decrypt `ciphertext` (tag included) with `aad` as
    /// associated data.
    ///
    /// Fails with [`Error::AuthenticationFailure`] when the tag does not
    /// verify; the state is not rewound, so a failed record is fatal to
    /// the direction.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::AuthenticationFailure);
        }

        let nonce = self.next_nonce();

        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::AuthenticationFailure)
    }
}

impl std::fmt::Debug for RecordCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCipher")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl Drop for RecordCipher {
    fn drop(&mut self) {
        self.nonce.zeroize();
        self.counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RecordCipher, RecordCipher) {
        let key = [0x2au8; KEY_SIZE];
        let nonce = [0x51u8; NONCE_SIZE];

        (RecordCipher::new(&key, &nonce), RecordCipher::new(&key, &nonce))
    }

    #[test]
    fn it_round_trips() {
        let (mut tx, mut rx) = pair();

        let sealed = tx.seal(b"header", b"attack at dawn").expect("seal failed");
        assert_eq!(sealed.len(), b"attack at dawn".len() + TAG_SIZE);

        let opened = rx.open(b"header", &sealed).expect("open failed");
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn every_ciphertext_bit_is_load_bearing() {
        let (mut tx, _) = pair();
        let sealed = tx.seal(b"header", b"attack at dawn").expect("seal failed");

        for bit in 0..sealed.len() * 8 {
            let (_, mut rx) = pair();
            let mut tampered = sealed.clone();
            tampered[bit / 8] ^= 1 << (bit % 8);

            assert!(matches!(
                rx.open(b"header", &tampered),
                Err(Error::AuthenticationFailure)
            ));
        }
    }

    #[test]
    fn the_associated_data_is_bound() {
        let (mut tx, mut rx) = pair();
        let sealed = tx.seal(b"header", b"attack at dawn").expect("seal failed");

        assert!(matches!(
            rx.open(b"headex", &sealed),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn a_foreign_key_cannot_open() {
        let (mut tx, _) = pair();
        let sealed = tx.seal(b"header", b"attack at dawn").expect("seal failed");

        let mut rx = RecordCipher::new(&[0x2bu8; KEY_SIZE], &[0x51u8; NONCE_SIZE]);
        assert!(rx.open(b"header", &sealed).is_err());
    }

    #[test]
    fn out_of_order_opens_fail() {
        let (mut tx, mut rx) = pair();

        let first = tx.seal(b"h", b"one").expect("seal failed");
        let second = tx.seal(b"h", b"two").expect("seal failed");

        // Opening the second record first consumes the wrong keystream position.
        assert!(rx.open(b"h", &second).is_err());
        assert!(rx.open(b"h", &first).is_err());
    }

    #[test]
    fn a_runt_ciphertext_is_rejected() {
        let (_, mut rx) = pair();

        assert!(matches!(
            rx.open(b"h", &[0u8; TAG_SIZE - 1]),
            Err(Error::AuthenticationFailure)
        ));
    }
}
