#![doc = concat!(
    "[![crates.io](https://img.shields.io/crates/v/", env!("CARGO_PKG_NAME"), ")](https://crates.io/crates/", env!("CARGO_PKG_NAME"), ")",
    " ",
    "[![docs.rs](https://img.shields.io/docsrs/", env!("CARGO_PKG_NAME"), ")](https://docs.rs/", env!("CARGO_PKG_NAME"), ")",
    " ",
    "![license](https://img.shields.io/crates/l/", env!("CARGO_PKG_NAME"), ")"
)]
#![doc = ""]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! The listener authenticates to connecting peers with a long-lived
//! signature key; an ephemeral key-encapsulation establishes per-session
//! traffic secrets keying two independent record ciphers, one per
//! direction. The channel then carries length-framed encrypted records
//! until either side tears it down.
//!
//! ### Primitives
//!
//! * Key-encapsulation: Kyber, level 1 (see [`crypto::kem`]).
//! * Signatures: Dilithium, level 2 (see [`crypto::sign`]).
//! * Key schedule & transcript hashing: SHAKE-256 (see [`crypto::xof`]).
//! * Record cipher: AES-256-GCM stream state (see [`crypto::cipher`]).

#![warn(
    missing_docs,
    clippy::unwrap_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo,
    clippy::undocumented_unsafe_blocks
)]
#![forbid(unsafe_code)]

mod error;
pub use error::{Error, Result};

pub mod packet;

pub mod crypto;
pub mod kex;

pub mod client;
pub mod connection;
pub(crate) mod connections;
pub mod server;

/// The exact configuration string compared byte-for-byte during the
/// handshake; a mismatch aborts the key exchange.
pub const CONFIG_STRING: &[u8] = b"qsmp_kyber_s1p1632_dilithium_s1p2544_rcs_shake256";

/// Size of the long-lived key identity string.
pub const KEYID_SIZE: usize = 16;

/// Size of the random session token mixed into the key schedule.
pub const STOKEN_SIZE: usize = 32;

/// Size of the public-key configuration hash bound into the transcript.
pub const PKCODE_SIZE: usize = 32;

/// Size of the record cipher's authentication tag.
pub const TAG_SIZE: usize = 16;

/// Maximum permitted record size, header included.
pub const CONNECTION_MTU: usize = 65535;

/// Initial size of the server's connection pool.
pub const CONNECTIONS_INIT: usize = 256;

/// Upper bound on concurrently connected peers.
pub const CONNECTIONS_MAX: usize = 8192;

/// Default listen port.
pub const SERVER_PORT: u16 = 2201;

/// Accept-loop sleep granularity while paused or idle.
pub const PAUSE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Freshness window on in-session record timestamps, in seconds.
pub const KEEPALIVE_WINDOW: u64 = 120;

/// Maximum tolerated clock skew on handshake messages, in seconds.
pub const KEX_SKEW_MAX: u64 = 30;

/// Default session lifetime, in seconds; connections are torn down once
/// their expiration horizon passes.
pub const SESSION_LIFETIME: u64 = 86400;
