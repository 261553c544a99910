//! Streaming packfile indexer.
//!
//! Feed the bytes of a pack-format-v2 stream into an [`Indexer`] chunk by
//! chunk; it writes a verified copy of the pack to disk, resolves the delta
//! graph once the stream ends, and emits the companion v2 `.idx` file that
//! maps each object id to its offset, CRC32, and length inside the pack.
//!
//! ```no_run
//! use packr_pack::{Indexer, IndexerOptions};
//!
//! # fn run(bytes: &[u8]) -> Result<(), packr_pack::PackError> {
//! let mut indexer = Indexer::new("objects/pack", IndexerOptions::default())?;
//! indexer.append(bytes)?;
//! let name = indexer.commit()?;
//! println!("pack-{name}.pack / pack-{name}.idx");
//! # Ok(())
//! # }
//! ```

pub mod delta;
mod entry;
pub mod idx;
mod index_write;
mod indexer;
pub mod odb;
pub mod parser;
mod progress;
mod resolve;

pub use entry::{encode_entry_header, encode_ofs_offset, DeltaBase, Entry, EntryKind};
pub use indexer::{Indexer, IndexerOptions};
pub use odb::ObjectStore;
pub use progress::{Progress, ProgressObserver};

use packr_hash::ObjectId;

/// Errors that can occur while indexing a pack.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("invalid pack header: {0}")]
    InvalidHeader(String),

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("pack checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: ObjectId, actual: ObjectId },

    #[error("invalid delta at offset {offset}: {reason}")]
    InvalidDelta { offset: u64, reason: String },

    #[error("delta base not found at offset {0}")]
    MissingBaseOffset(u64),

    #[error("delta base not found: {0}")]
    MissingBase(ObjectId),

    #[error("too many objects in pack: {0}")]
    TooManyObjects(u64),

    #[error("size overflow while computing {0}")]
    Overflow(&'static str),

    #[error("cannot {op}: indexer is {state}")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("operation cancelled by progress observer")]
    Cancelled,

    #[error("object store: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Hash(#[from] packr_hash::HashError),
}

/// Type of a non-delta packed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl ObjectType {
    /// Type number as encoded in pack entry headers.
    pub const fn type_number(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Decode a pack header type number. Delta numbers (6, 7) and unused
    /// values return `None`.
    pub const fn from_type_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            _ => None,
        }
    }

    /// Name as used in object headers and loose storage.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Tree => "tree",
            Self::Blob => "blob",
            Self::Tag => "tag",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pack stream format constants.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_SIZE: usize = 12;

/// Pack entry type numbers for the two delta representations.
pub const TYPE_OFS_DELTA: u8 = 6;
pub const TYPE_REF_DELTA: u8 = 7;

/// Pack index v2 constants.
pub const IDX_SIGNATURE: [u8; 4] = [0xff, 0x74, 0x4f, 0x63]; // "\377tOc"
pub const IDX_VERSION: u32 = 2;

/// Offsets at or above this go to the index's 64-bit table.
pub const IDX_LARGE_OFFSET_THRESHOLD: u64 = 0x8000_0000;
