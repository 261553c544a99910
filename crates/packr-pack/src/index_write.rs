//! Emission of the canonical v2 pack index.
//!
//! One forward pass over the id-sorted object table, hashing every byte as
//! it is written: magic and version, the 256-word fanout, raw identities,
//! CRC32s, 31-bit offsets with large ones redirected into the trailing
//! 64-bit table, the pack trailer copied verbatim, and finally the hash of
//! everything prior as the index trailer.

use std::io::Write;

use packr_hash::fanout::FanoutTable;
use packr_hash::hasher::Hasher;
use packr_hash::{HashAlgorithm, ObjectId};

use crate::entry::Entry;
use crate::{PackError, IDX_LARGE_OFFSET_THRESHOLD, IDX_SIGNATURE, IDX_VERSION};

/// Couples an output sink with the running trailer hash.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Hasher,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W, algo: HashAlgorithm) -> Self {
        Self { inner, hasher: Hasher::new(algo) }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), PackError> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        Ok(())
    }

    /// Write the trailer (the hash of everything so far) and flush.
    fn finish(mut self) -> Result<ObjectId, PackError> {
        let trailer = self.hasher.finalize()?;
        self.inner.write_all(trailer.as_bytes())?;
        self.inner.flush()?;
        Ok(trailer)
    }
}

/// Write a v2 index for `entries`, which must be resolved and sorted by
/// id. Returns the index trailer hash.
pub(crate) fn write_index<W: Write>(
    out: W,
    entries: &[Entry],
    pack_trailer: &ObjectId,
    algo: HashAlgorithm,
) -> Result<ObjectId, PackError> {
    let mut out = HashingWriter::new(out, algo);

    out.write(&IDX_SIGNATURE)?;
    out.write(&IDX_VERSION.to_be_bytes())?;

    let ids: Vec<ObjectId> = entries
        .iter()
        .map(|e| *e.id().expect("entries resolved before index emission"))
        .collect();

    out.write(&FanoutTable::build(&ids).to_bytes())?;

    for id in &ids {
        out.write(id.as_bytes())?;
    }

    for entry in entries {
        out.write(&entry.crc32.to_be_bytes())?;
    }

    // 31-bit offsets; anything at or past 2^31 is an index into the
    // 64-bit table that follows.
    let mut large_offsets: Vec<u64> = Vec::new();
    for entry in entries {
        if entry.position >= IDX_LARGE_OFFSET_THRESHOLD {
            let long_index = u32::try_from(large_offsets.len())
                .map_err(|_| PackError::Overflow("long offset table index"))?;
            out.write(&(0x8000_0000u32 | long_index).to_be_bytes())?;
            large_offsets.push(entry.position);
        } else {
            out.write(&(entry.position as u32).to_be_bytes())?;
        }
    }

    for offset in &large_offsets {
        out.write(&offset.to_be_bytes())?;
    }

    out.write(pack_trailer.as_bytes())?;

    out.finish()
}
