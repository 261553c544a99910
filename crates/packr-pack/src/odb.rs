//! The external object store the indexer may consult.

use packr_hash::ObjectId;

use crate::{ObjectType, PackError};

/// A pluggable object store.
///
/// The indexer uses it two ways: to locate REF_DELTA bases that are not
/// part of the pack being indexed, and — when
/// [`IndexerOptions::verify`](crate::IndexerOptions) is set — to insert
/// every materialised object after resolution.
///
/// `read` is the only operation in the system allowed to fail softly:
/// `Ok(None)` means "not found" and lets the caller decide whether that is
/// fatal.
pub trait ObjectStore {
    /// Fetch an object's type and content by id.
    fn read(&self, id: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError>;

    /// Whether the store holds the given id.
    fn contains(&self, id: &ObjectId) -> bool;

    /// Store an object, returning the id the store computed for it.
    fn write(&mut self, object_type: ObjectType, data: &[u8]) -> Result<ObjectId, PackError>;
}
