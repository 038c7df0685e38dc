//! The extendable-output function, bound to SHAKE-256.

use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

/// An incremental absorb/squeeze state.
#[derive(Default)]
pub struct Xof(Shake256);

impl Xof {
    /// A fresh, empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb `input` into the state.
    pub fn absorb(&mut self, input: &[u8]) {
        self.0.update(input);
    }

    /// Finalize the state and fill `output` with squeezed bytes.
    pub fn squeeze(self, output: &mut [u8]) {
        self.0.finalize_xof().read(output);
    }
}

/// One-shot SHAKE-256 over the concatenation of `parts`, squeezed to `N` bytes.
pub fn shake256<const N: usize>(parts: &[&[u8]]) -> [u8; N] {
    let mut xof = Xof::new();
    for part in parts {
        xof.absorb(part);
    }

    let mut output = [0u8; N];
    xof.squeeze(&mut output);

    output
}
