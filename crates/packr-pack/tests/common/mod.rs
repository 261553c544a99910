//! Shared helpers: assemble pack byte streams for the indexer to chew on.

use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use packr_hash::hasher::Hasher;
use packr_hash::{HashAlgorithm, ObjectId};
use packr_pack::delta::encode as delta_encode;
use packr_pack::{
    encode_entry_header, encode_ofs_offset, Indexer, IndexerOptions, ObjectType, PackError,
    PACK_SIGNATURE, PACK_VERSION, TYPE_OFS_DELTA, TYPE_REF_DELTA,
};

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut enc = ZlibEncoder::new(&mut out, Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap();
    out
}

pub fn object_id(object_type: ObjectType, content: &[u8]) -> ObjectId {
    Hasher::hash_object(HashAlgorithm::Sha1, object_type.as_str(), content).unwrap()
}

/// A delta payload rewriting `base` into `base[..prefix] + tail`.
pub fn rewrite_delta(base: &[u8], prefix: usize, tail: &[u8]) -> Vec<u8> {
    let mut ins = Vec::new();
    if prefix > 0 {
        ins.extend_from_slice(&delta_encode::copy(0, prefix as u32));
    }
    if !tail.is_empty() {
        ins.extend_from_slice(&delta_encode::insert(tail));
    }
    delta_encode::delta(base.len() as u64, (prefix + tail.len()) as u64, &ins)
}

/// Assembles a well-formed pack stream entry by entry.
pub struct TestPack {
    entries: Vec<Vec<u8>>,
    len: u64,
}

impl TestPack {
    pub fn new() -> Self {
        Self { entries: Vec::new(), len: 12 }
    }

    fn push(&mut self, entry: Vec<u8>) -> u64 {
        let position = self.len;
        self.len += entry.len() as u64;
        self.entries.push(entry);
        position
    }

    /// Append a non-delta object; returns its position.
    pub fn object(&mut self, object_type: ObjectType, content: &[u8]) -> u64 {
        let mut entry = encode_entry_header(object_type.type_number(), content.len() as u64);
        entry.extend_from_slice(&deflate(content));
        self.push(entry)
    }

    pub fn blob(&mut self, content: &[u8]) -> u64 {
        self.object(ObjectType::Blob, content)
    }

    /// Append an OFS_DELTA against the entry at `base_position`.
    pub fn ofs_delta(&mut self, base_position: u64, payload: &[u8]) -> u64 {
        let position = self.len;
        let mut entry = encode_entry_header(TYPE_OFS_DELTA, payload.len() as u64);
        entry.extend_from_slice(&encode_ofs_offset(position - base_position));
        entry.extend_from_slice(&deflate(payload));
        self.push(entry)
    }

    /// Append a REF_DELTA against `base_id`.
    pub fn ref_delta(&mut self, base_id: ObjectId, payload: &[u8]) -> u64 {
        let mut entry = encode_entry_header(TYPE_REF_DELTA, payload.len() as u64);
        entry.extend_from_slice(base_id.as_bytes());
        entry.extend_from_slice(&deflate(payload));
        self.push(entry)
    }

    /// Header, entries, trailer.
    pub fn build(self) -> Vec<u8> {
        let mut pack = Vec::new();
        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for entry in &self.entries {
            pack.extend_from_slice(entry);
        }
        let trailer = Hasher::digest(HashAlgorithm::Sha1, &pack).unwrap();
        pack.extend_from_slice(trailer.as_bytes());
        pack
    }
}

/// Stream `pack` into a fresh indexer in `chunk`-sized pieces and commit.
pub fn index_pack(dir: &Path, pack: &[u8], chunk: usize) -> Result<String, PackError> {
    let mut indexer = Indexer::new(dir, IndexerOptions::default())?;
    for piece in pack.chunks(chunk.max(1)) {
        indexer.append(piece)?;
    }
    indexer.commit()
}
