//! Reading v2 pack indexes.
//!
//! The index maps object ids to pack offsets in O(log n): the fanout table
//! narrows the search to one first-byte bucket, then a binary search over
//! the sorted identities finds the entry. Layout:
//!
//! ```text
//! Header:  \xff tOc | version (= 2)
//! Fanout:  256 × 4-byte big-endian cumulative counts
//! Ids:     N × digest-length sorted identities
//! CRC32:   N × 4-byte values
//! Offsets: N × 4-byte values (MSB set → index into 64-bit table)
//! 64-bit:  M × 8-byte offsets
//! Trailer: pack checksum | index checksum
//! ```

use std::path::{Path, PathBuf};

use memmap2::Mmap;
use packr_hash::{HashAlgorithm, ObjectId};

use crate::{PackError, IDX_SIGNATURE, IDX_VERSION};

/// A memory-mapped v2 pack index.
#[derive(Debug)]
pub struct PackIndexFile {
    data: Mmap,
    num_objects: u32,
    algo: HashAlgorithm,
    ids_at: usize,
    crcs_at: usize,
    offsets_at: usize,
    long_offsets_at: usize,
    path: PathBuf,
}

impl PackIndexFile {
    /// Open and validate an index file.
    pub fn open(path: impl AsRef<Path>, algo: HashAlgorithm) -> Result<Self, PackError> {
        let path = path.as_ref().to_path_buf();
        let file = std::fs::File::open(&path)?;
        let data = unsafe { Mmap::map(&file)? };
        let digest_len = algo.digest_len();

        // Smallest possible index: header, fanout, both trailers.
        if data.len() < 8 + 1024 + 2 * digest_len {
            return Err(PackError::InvalidHeader("index file too small".into()));
        }
        if data[0..4] != IDX_SIGNATURE {
            return Err(PackError::InvalidHeader("bad index signature".into()));
        }
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != IDX_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }

        let fanout_at = 8;
        let num_objects = read_be32(&data, fanout_at + 255 * 4);
        let n = num_objects as usize;

        let ids_at = fanout_at + 1024;
        let crcs_at = ids_at + n * digest_len;
        let offsets_at = crcs_at + n * 4;
        let long_offsets_at = offsets_at + n * 4;
        if data.len() < long_offsets_at + 2 * digest_len {
            return Err(PackError::InvalidHeader(format!(
                "index file truncated: {} bytes for {} objects",
                data.len(),
                num_objects
            )));
        }

        Ok(Self {
            data,
            num_objects,
            algo,
            ids_at,
            crcs_at,
            offsets_at,
            long_offsets_at,
            path,
        })
    }

    /// Find the pack offset of an id.
    pub fn lookup(&self, id: &ObjectId) -> Option<u64> {
        let bucket = id.first_byte();
        let hi = self.fanout(bucket) as usize;
        let lo = match bucket {
            0 => 0,
            b => self.fanout(b - 1) as usize,
        };

        let target = id.as_bytes();
        let mut low = lo;
        let mut high = hi;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.id_bytes(mid).cmp(target) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Some(self.offset_at(mid as u32)),
            }
        }
        None
    }

    /// Id at a sorted index position.
    pub fn id_at(&self, index: u32) -> ObjectId {
        ObjectId::from_bytes(self.id_bytes(index as usize), self.algo)
            .expect("index ids validated at open")
    }

    /// Pack offset at a sorted index position, following the 64-bit
    /// indirection when the 31-bit slot has its MSB set.
    pub fn offset_at(&self, index: u32) -> u64 {
        let raw = read_be32(&self.data, self.offsets_at + index as usize * 4);
        if raw & 0x8000_0000 == 0 {
            return u64::from(raw);
        }
        let long_index = (raw & 0x7fff_ffff) as usize;
        let at = self.long_offsets_at + long_index * 8;
        u64::from_be_bytes(self.data[at..at + 8].try_into().expect("8-byte slice"))
    }

    /// CRC32 at a sorted index position.
    pub fn crc32_at(&self, index: u32) -> u32 {
        read_be32(&self.data, self.crcs_at + index as usize * 4)
    }

    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The pack checksum stored in the trailer.
    pub fn pack_checksum(&self) -> ObjectId {
        let digest_len = self.algo.digest_len();
        let at = self.data.len() - 2 * digest_len;
        ObjectId::from_bytes(&self.data[at..at + digest_len], self.algo)
            .expect("trailer validated at open")
    }

    /// The index file's own trailing checksum.
    pub fn index_checksum(&self) -> ObjectId {
        let digest_len = self.algo.digest_len();
        let at = self.data.len() - digest_len;
        ObjectId::from_bytes(&self.data[at..], self.algo).expect("trailer validated at open")
    }

    /// Iterate `(id, offset, crc32)` in sorted id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, u64, u32)> + '_ {
        (0..self.num_objects).map(|i| (self.id_at(i), self.offset_at(i), self.crc32_at(i)))
    }

    fn fanout(&self, bucket: u8) -> u32 {
        read_be32(&self.data, 8 + bucket as usize * 4)
    }

    fn id_bytes(&self, index: usize) -> &[u8] {
        let digest_len = self.algo.digest_len();
        let at = self.ids_at + index * digest_len;
        &self.data[at..at + digest_len]
    }
}

fn read_be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
