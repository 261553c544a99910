//! End-to-end indexer tests: stream a pack in, commit, read the emitted
//! files back.

mod common;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;

use common::{index_pack, object_id, rewrite_delta, TestPack};
use packr_hash::hasher::Hasher;
use packr_hash::{HashAlgorithm, ObjectId};
use packr_pack::idx::PackIndexFile;
use packr_pack::{Indexer, IndexerOptions, ObjectStore, ObjectType, PackError};

fn committed_paths(dir: &Path, name: &str) -> (std::path::PathBuf, std::path::PathBuf) {
    (
        dir.join(format!("pack-{name}.pack")),
        dir.join(format!("pack-{name}.idx")),
    )
}

#[test]
fn empty_pack() {
    let dir = tempfile::tempdir().unwrap();
    let pack = TestPack::new().build();

    let name = index_pack(dir.path(), &pack, pack.len()).unwrap();

    // The pack is named after its trailer: the hash of the bare header.
    let expected = Hasher::digest(HashAlgorithm::Sha1, &pack[..pack.len() - 20]).unwrap();
    assert_eq!(name, expected.to_hex());

    let (pack_path, idx_path) = committed_paths(dir.path(), &name);
    assert_eq!(std::fs::read(&pack_path).unwrap(), pack);

    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();
    assert_eq!(idx.num_objects(), 0);
    assert_eq!(idx.pack_checksum(), expected);
}

#[test]
fn single_blob() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"hello\n";
    let mut builder = TestPack::new();
    let position = builder.blob(content);
    let pack = builder.build();

    let name = index_pack(dir.path(), &pack, pack.len()).unwrap();
    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();

    assert_eq!(idx.num_objects(), 1);
    let id = object_id(ObjectType::Blob, content);
    assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");
    assert_eq!(idx.lookup(&id), Some(position));
    assert_eq!(position, 12);

    // CRC32 covers the entry's raw bytes: header plus deflate stream.
    let entry_bytes = &pack[12..pack.len() - 20];
    let mut crc = crc32fast::Hasher::new();
    crc.update(entry_bytes);
    assert_eq!(idx.crc32_at(0), crc.finalize());
}

#[test]
fn ofs_delta_entry_carries_reconstructed_identity() {
    let dir = tempfile::tempdir().unwrap();
    let first = b"first object in the pack";
    let second = b"the delta base lives here";
    let reconstructed = b"the delta base lives HERE!";

    let mut builder = TestPack::new();
    builder.blob(first);
    let base_position = builder.blob(second);
    let delta_position =
        builder.ofs_delta(base_position, &rewrite_delta(second, 21, b"HERE!"));
    let pack = builder.build();

    let name = index_pack(dir.path(), &pack, 7).unwrap();
    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();
    assert_eq!(idx.num_objects(), 3);

    // The delta indexes under the identity of what it reconstructs, at
    // the position of the delta header itself.
    let delta_id = object_id(ObjectType::Blob, reconstructed);
    assert_eq!(idx.lookup(&delta_id), Some(delta_position));
    assert_eq!(idx.lookup(&object_id(ObjectType::Blob, second)), Some(base_position));
}

#[test]
fn round_trip_agrees_with_independent_scan() {
    let dir = tempfile::tempdir().unwrap();
    let contents: Vec<Vec<u8>> = (0u8..7)
        .map(|i| format!("object number {i} with its own body").into_bytes())
        .collect();

    let mut builder = TestPack::new();
    let mut expected: HashMap<ObjectId, u64> = HashMap::new();
    for content in &contents {
        let position = builder.blob(content);
        expected.insert(object_id(ObjectType::Blob, content), position);
    }
    let pack = builder.build();

    let name = index_pack(dir.path(), &pack, 11).unwrap();
    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();

    assert_eq!(idx.num_objects() as usize, expected.len());
    let mut previous: Option<ObjectId> = None;
    for (id, offset, _crc) in idx.iter() {
        // Identities come back sorted and map to the offsets the builder
        // placed the objects at.
        if let Some(prev) = previous {
            assert!(prev < id);
        }
        previous = Some(id);
        assert_eq!(expected.get(&id), Some(&offset));
    }
}

#[test]
fn commit_counters_freeze_totals() {
    let dir = tempfile::tempdir().unwrap();
    let base = b"progress counter base object";
    let mut builder = TestPack::new();
    let base_position = builder.blob(base);
    builder.ofs_delta(base_position, &rewrite_delta(base, 8, b"tail"));
    let pack = builder.build();

    let mut indexer = Indexer::new(dir.path(), IndexerOptions::default()).unwrap();
    indexer.append(&pack).unwrap();
    let streamed = indexer.progress();
    assert_eq!(streamed.total_objects, 2);
    assert_eq!(streamed.received_objects, 2);
    assert_eq!(streamed.indexed_objects, 1); // the delta is still unknown
    assert_eq!(streamed.received_bytes, pack.len() as u64);

    indexer.commit().unwrap();
    let done = indexer.progress();
    assert_eq!(done.total_deltas, 1);
    assert_eq!(done.indexed_deltas, 1);
    assert_eq!(done.indexed_objects, 2);
}

#[test]
fn malformed_type_fails_and_temp_pack_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    // Type 5 is unused; hand-roll the entry.
    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&1u32.to_be_bytes());
    pack.push(0x50); // type 5, size 0
    pack.extend_from_slice(&common::deflate(b""));
    let trailer = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
    pack.extend_from_slice(trailer.as_bytes());

    {
        let mut indexer = Indexer::new(dir.path(), IndexerOptions::default()).unwrap();
        let err = indexer.append(&pack).unwrap_err();
        assert!(matches!(err, PackError::CorruptEntry { .. }));
        // The bytes were still captured before the parse rejected them.
        assert_eq!(indexer.packfile_size(), pack.len() as u64);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn observer_cancellation_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    let mut builder = TestPack::new();
    builder.blob(b"object one");
    builder.blob(b"object two");
    let pack = builder.build();

    let mut indexer = Indexer::new(dir.path(), IndexerOptions::default()).unwrap();
    indexer.set_progress_observer(Box::new(|p| {
        if p.received_objects >= 2 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }));

    // Split so the first append carries only the first object.
    let split = 12 + (pack.len() - 12 - 20) / 2;
    indexer.append(&pack[..split]).unwrap();
    let err = indexer.append(&pack[split..]).unwrap_err();
    assert!(matches!(err, PackError::Cancelled));

    let err = indexer.append(b"more").unwrap_err();
    assert!(matches!(err, PackError::InvalidState { op: "append", .. }));
}

/// In-memory object store used for REF_DELTA and verify tests.
#[derive(Default)]
struct MemoryStore {
    objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
}

impl MemoryStore {
    fn add(&mut self, object_type: ObjectType, data: &[u8]) -> ObjectId {
        let id = object_id(object_type, data);
        self.objects.insert(id, (object_type, data.to_vec()));
        id
    }
}

impl ObjectStore for MemoryStore {
    fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
        Ok(self.objects.get(id).cloned())
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    fn write(&mut self, object_type: ObjectType, data: &[u8]) -> Result<ObjectId, PackError> {
        let id = object_id(object_type, data);
        self.objects.insert(id, (object_type, data.to_vec()));
        Ok(id)
    }
}

#[test]
fn ref_delta_against_store_base() {
    let dir = tempfile::tempdir().unwrap();
    let base = b"a thin pack references this externally";
    let mut store = MemoryStore::default();
    let base_id = store.add(ObjectType::Blob, base);

    let mut builder = TestPack::new();
    let delta_position = builder.ref_delta(base_id, &rewrite_delta(base, 11, b"result"));
    let pack = builder.build();

    let mut indexer = Indexer::new(dir.path(), IndexerOptions::default()).unwrap();
    indexer.set_object_store(Box::new(store));
    indexer.append(&pack).unwrap();
    let name = indexer.commit().unwrap();

    let mut reconstructed = base[..11].to_vec();
    reconstructed.extend_from_slice(b"result");
    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();
    assert_eq!(
        idx.lookup(&object_id(ObjectType::Blob, &reconstructed)),
        Some(delta_position)
    );
}

#[test]
fn ref_delta_with_no_base_anywhere_fails_commit() {
    let dir = tempfile::tempdir().unwrap();
    let missing = ObjectId::from_hex("feedfacefeedfacefeedfacefeedfacefeedface").unwrap();
    let mut builder = TestPack::new();
    builder.ref_delta(missing, &rewrite_delta(b"whatever", 0, b"x"));
    let pack = builder.build();

    let mut indexer = Indexer::new(dir.path(), IndexerOptions::default()).unwrap();
    indexer.append(&pack).unwrap();
    let err = indexer.commit().unwrap_err();
    assert!(matches!(err, PackError::MissingBase(id) if id == missing));

    // A failed commit is terminal.
    let err = indexer.commit().unwrap_err();
    assert!(matches!(err, PackError::InvalidState { op: "commit", state: "failed" }));
}

/// Store handle that survives being boxed into the indexer.
#[derive(Default, Clone)]
struct SharedStore(std::rc::Rc<std::cell::RefCell<MemoryStore>>);

impl ObjectStore for SharedStore {
    fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
        Ok(self.0.borrow().objects.get(id).cloned())
    }

    fn contains(&self, id: &ObjectId) -> bool {
        self.0.borrow().objects.contains_key(id)
    }

    fn write(&mut self, object_type: ObjectType, data: &[u8]) -> Result<ObjectId, PackError> {
        Ok(self.0.borrow_mut().add(object_type, data))
    }
}

#[test]
fn verify_inserts_all_objects_into_store() {
    let dir = tempfile::tempdir().unwrap();
    let base = b"verification pass base object";
    let mut builder = TestPack::new();
    let base_position = builder.blob(base);
    builder.ofs_delta(base_position, &rewrite_delta(base, 13, b"changed tail"));
    let pack = builder.build();

    let store = SharedStore::default();
    let options = IndexerOptions { verify: true, ..IndexerOptions::default() };
    let mut indexer = Indexer::new(dir.path(), options).unwrap();
    indexer.set_object_store(Box::new(store.clone()));
    indexer.append(&pack).unwrap();
    let name = indexer.commit().unwrap();

    // Every id in the emitted index made it into the store.
    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha1).unwrap();
    assert_eq!(idx.num_objects(), 2);
    for (id, _, _) in idx.iter() {
        assert!(store.contains(&id));
    }
}

#[test]
fn sha256_pack_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let content = b"sha256 addressed object";

    let mut pack = Vec::new();
    pack.extend_from_slice(b"PACK");
    pack.extend_from_slice(&2u32.to_be_bytes());
    pack.extend_from_slice(&1u32.to_be_bytes());
    pack.extend_from_slice(&packr_pack::encode_entry_header(3, content.len() as u64));
    pack.extend_from_slice(&common::deflate(content));
    let trailer = Hasher::digest(HashAlgorithm::Sha256, &pack).unwrap();
    pack.extend_from_slice(trailer.as_bytes());

    let options = IndexerOptions { algorithm: HashAlgorithm::Sha256, ..Default::default() };
    let mut indexer = Indexer::new(dir.path(), options).unwrap();
    indexer.append(&pack).unwrap();
    let name = indexer.commit().unwrap();
    assert_eq!(name.len(), 64);

    let (_, idx_path) = committed_paths(dir.path(), &name);
    let idx = PackIndexFile::open(&idx_path, HashAlgorithm::Sha256).unwrap();
    let id = Hasher::hash_object(HashAlgorithm::Sha256, "blob", content).unwrap();
    assert_eq!(idx.lookup(&id), Some(12));
}

#[test]
fn emitted_files_are_read_only() {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut builder = TestPack::new();
        builder.blob(b"permission check");
        let pack = builder.build();

        let name = index_pack(dir.path(), &pack, pack.len()).unwrap();
        let (pack_path, idx_path) = committed_paths(dir.path(), &name);
        for path in [pack_path, idx_path] {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o444, "{}", path.display());
        }
    }
}
