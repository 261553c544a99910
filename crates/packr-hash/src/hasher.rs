use digest::Digest;

use crate::{HashAlgorithm, HashError, ObjectId};

enum Inner {
    Sha1(Box<sha1_checked::Sha1>),
    Sha256(sha2::Sha256),
}

/// Streaming hash context.
///
/// Wraps collision-detected SHA-1 and SHA-256 behind one interface. Feed
/// data incrementally with [`update`](Hasher::update), then finalize into
/// an [`ObjectId`]. A context is single-use; the indexer creates a fresh
/// one per object and per file trailer.
pub struct Hasher {
    inner: Inner,
}

impl Hasher {
    pub fn new(algo: HashAlgorithm) -> Self {
        let inner = match algo {
            HashAlgorithm::Sha1 => Inner::Sha1(Box::new(sha1_checked::Sha1::new())),
            HashAlgorithm::Sha256 => Inner::Sha256(sha2::Sha256::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha1(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
        }
    }

    /// Finalize into an id. Fails if SHA-1 collision detection fires.
    pub fn finalize(self) -> Result<ObjectId, HashError> {
        match self.inner {
            Inner::Sha1(h) => {
                let result = h.try_finalize();
                if result.has_collision() {
                    return Err(HashError::Sha1Collision);
                }
                let mut digest = [0u8; 20];
                digest.copy_from_slice(result.hash().as_slice());
                Ok(ObjectId::Sha1(digest))
            }
            Inner::Sha256(h) => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(h.finalize().as_slice());
                Ok(ObjectId::Sha256(digest))
            }
        }
    }

    /// Hash a buffer in one call.
    pub fn digest(algo: HashAlgorithm, data: &[u8]) -> Result<ObjectId, HashError> {
        let mut h = Self::new(algo);
        h.update(data);
        h.finalize()
    }

    /// Hash an object the way its identity is defined:
    /// `"<type> <len>\0"` followed by the content.
    pub fn hash_object(
        algo: HashAlgorithm,
        obj_type: &str,
        data: &[u8],
    ) -> Result<ObjectId, HashError> {
        let mut h = Self::new(algo);
        h.update(object_header(obj_type, data.len()).as_bytes());
        h.update(data);
        h.finalize()
    }
}

/// The `"<type> <len>\0"` prefix an object is hashed under.
pub fn object_header(obj_type: &str, len: usize) -> String {
    format!("{obj_type} {len}\0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sha1() {
        let id = Hasher::digest(HashAlgorithm::Sha1, b"").unwrap();
        assert_eq!(id.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn empty_sha256() {
        let id = Hasher::digest(HashAlgorithm::Sha256, b"").unwrap();
        assert_eq!(
            id.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = Hasher::new(HashAlgorithm::Sha1);
        h.update(b"hello ");
        h.update(b"world");
        let split = h.finalize().unwrap();
        let whole = Hasher::digest(HashAlgorithm::Sha1, b"hello world").unwrap();
        assert_eq!(split, whole);
    }

    #[test]
    fn blob_identity() {
        // `echo 'hello' | git hash-object --stdin`
        let id = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"hello\n").unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    }

    #[test]
    fn header_format() {
        assert_eq!(object_header("blob", 6), "blob 6\0");
        assert_eq!(object_header("commit", 0), "commit 0\0");
    }
}
