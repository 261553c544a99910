use std::fmt;
use std::str::FromStr;

use crate::{hex, HashAlgorithm, HashError};

/// An object identifier: the hash of an object's type-prefixed content,
/// or the trailer checksum of a pack or index file.
///
/// Ordering is byte-wise (memcmp) over the digest, which is the order pack
/// indexes are sorted in.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl ObjectId {
    /// Build an id from raw digest bytes of the given algorithm.
    pub fn from_bytes(bytes: &[u8], algo: HashAlgorithm) -> Result<Self, HashError> {
        if bytes.len() != algo.digest_len() {
            return Err(HashError::InvalidLength {
                expected: algo.digest_len(),
                actual: bytes.len(),
            });
        }
        Ok(match algo {
            HashAlgorithm::Sha1 => {
                let mut d = [0u8; 20];
                d.copy_from_slice(bytes);
                Self::Sha1(d)
            }
            HashAlgorithm::Sha256 => {
                let mut d = [0u8; 32];
                d.copy_from_slice(bytes);
                Self::Sha256(d)
            }
        })
    }

    /// Parse a hex id, inferring the algorithm from the length
    /// (40 chars is SHA-1, 64 is SHA-256).
    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let algo = match s.len() {
            40 => HashAlgorithm::Sha1,
            64 => HashAlgorithm::Sha256,
            n => return Err(HashError::UnknownHexLength(n)),
        };
        let mut buf = [0u8; 32];
        let digest = &mut buf[..algo.digest_len()];
        hex::decode(s, digest)?;
        Self::from_bytes(digest, algo)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(d) => d,
            Self::Sha256(d) => d,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// First digest byte; indexes the fan-out table.
    pub fn first_byte(&self) -> u8 {
        self.as_bytes()[0]
    }

    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", &self.to_hex()[..8])
    }
}

impl FromStr for ObjectId {
    type Err = HashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
