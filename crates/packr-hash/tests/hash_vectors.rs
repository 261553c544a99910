use packr_hash::hasher::Hasher;
use packr_hash::{hex, HashAlgorithm, ObjectId};
use proptest::prelude::*;

#[test]
fn sha1_vectors() {
    for (input, expected) in [
        (&b""[..], "da39a3ee5e6b4b0d3255bfef95601890afd80709"),
        (&b"abc"[..], "a9993e364706816aba3e25717850c26c9cd0d89d"),
        (
            &b"abcdbcdecdefdefgefghfghighijhijkijkljklmklmnlmnomnopnopq"[..],
            "84983e441c3bd26ebaae4aa1f95129e5e54670f1",
        ),
    ] {
        let id = Hasher::digest(HashAlgorithm::Sha1, input).unwrap();
        assert_eq!(id.to_hex(), expected);
    }
}

#[test]
fn sha256_vectors() {
    let id = Hasher::digest(HashAlgorithm::Sha256, b"abc").unwrap();
    assert_eq!(
        id.to_hex(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn object_identities_match_git() {
    // `git hash-object` answers for well-known contents.
    let hello = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"hello\n").unwrap();
    assert_eq!(hello.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");

    let empty = Hasher::hash_object(HashAlgorithm::Sha1, "blob", b"").unwrap();
    assert_eq!(empty.to_hex(), "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391");

    let empty_tree = Hasher::hash_object(HashAlgorithm::Sha1, "tree", b"").unwrap();
    assert_eq!(empty_tree.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
}

proptest! {
    #[test]
    fn hex_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
        let encoded = hex::encode(&bytes);
        prop_assert_eq!(encoded.len(), bytes.len() * 2);
        let mut decoded = vec![0u8; bytes.len()];
        hex::decode(&encoded, &mut decoded).unwrap();
        prop_assert_eq!(decoded, bytes);
    }

    #[test]
    fn sha1_oid_hex_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 20..=20)) {
        let id = ObjectId::from_bytes(&bytes, HashAlgorithm::Sha1).unwrap();
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        prop_assert_eq!(id, parsed);
    }

    #[test]
    fn sha256_oid_hex_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 32..=32)) {
        let id = ObjectId::from_bytes(&bytes, HashAlgorithm::Sha256).unwrap();
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        prop_assert_eq!(id, parsed);
    }
}
