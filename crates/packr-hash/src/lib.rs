//! Object identity for the packr packfile indexer.
//!
//! Provides the `ObjectId` type carrying a SHA-1 or SHA-256 digest, the
//! streaming [`Hasher`](hasher::Hasher) used to compute identities and file
//! trailers, a hex codec, and the fan-out table used by pack indexes.

mod algorithm;
pub mod fanout;
pub mod hasher;
pub mod hex;
mod oid;

pub use algorithm::HashAlgorithm;
pub use oid::ObjectId;

/// Errors produced by hash and identity operations.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("invalid hex digit at position {position}")]
    InvalidHex { position: usize },

    #[error("invalid digest length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("hex string of length {0} matches no supported algorithm")]
    UnknownHexLength(usize),

    #[error("SHA-1 collision detected")]
    Sha1Collision,
}
