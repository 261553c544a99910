//! The indexer: streaming front door, commit orchestration, lifecycle.

use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use packr_hash::{HashAlgorithm, ObjectId};
use tempfile::NamedTempFile;

use crate::entry::{DeltaBase, Entry, EntryKind, EntryTables};
use crate::index_write::write_index;
use crate::odb::ObjectStore;
use crate::parser::{PackParser, ParseSink};
use crate::progress::{self, Progress, ProgressObserver};
use crate::resolve::Resolver;
use crate::{ObjectType, PackError};

/// Upper bound on a single write syscall; larger chunks are split.
const MAX_WRITE_SIZE: usize = 1 << 30;

/// Construction-time options.
#[derive(Debug, Clone, Copy)]
pub struct IndexerOptions {
    /// Hash algorithm for object identities and file trailers.
    pub algorithm: HashAlgorithm,
    /// Unix permission bits applied to the emitted pack and index.
    pub mode: u32,
    /// After resolution, write every object into the attached store and
    /// cross-check the ids. Inert without a store.
    pub verify: bool,
    /// Flush file contents to stable storage before publishing.
    pub fsync: bool,
    /// Capacity of the resolver's resolved-base cache; 0 disables it.
    pub base_cache_size: usize,
    /// Reject packs announcing more than this many objects.
    pub max_objects: u32,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::default(),
            mode: 0o444,
            verify: false,
            fsync: false,
            base_cache_size: 64,
            max_objects: u32::MAX,
        }
    }
}

/// Lifecycle of an indexer. Errors are terminal: every failure parks the
/// indexer in `Failed` and later calls are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Accepting `append` calls (covers the pre-header state too).
    Receiving,
    /// Trailer seen and validated; `commit` may run.
    Complete,
    Committed,
    Failed,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Self::Receiving => "receiving",
            Self::Complete => "complete",
            Self::Committed => "committed",
            Self::Failed => "failed",
        }
    }
}

/// An in-flight entry between its start and complete events.
struct PendingEntry {
    position: u64,
    header_size: usize,
    size: u64,
    kind: PendingKind,
}

enum PendingKind {
    Object(ObjectType),
    Delta(DeltaBase),
}

/// The parser's sink: builds the entry tables and keeps the counters.
#[derive(Default)]
struct Collector {
    tables: EntryTables,
    pending: Option<PendingEntry>,
    trailer: Option<ObjectId>,
    progress: Progress,
    observer: Option<ProgressObserver>,
    max_objects: u32,
}

impl ParseSink for Collector {
    fn packfile_header(&mut self, _version: u32, entry_count: u32) -> Result<(), PackError> {
        if entry_count > self.max_objects {
            return Err(PackError::TooManyObjects(u64::from(entry_count)));
        }
        self.tables = EntryTables::with_capacity(entry_count);
        self.progress.total_objects = entry_count;
        Ok(())
    }

    fn object_start(
        &mut self,
        position: u64,
        header_size: usize,
        object_type: ObjectType,
        size: u64,
    ) -> Result<(), PackError> {
        self.pending = Some(PendingEntry {
            position,
            header_size,
            size,
            kind: PendingKind::Object(object_type),
        });
        Ok(())
    }

    fn object_complete(
        &mut self,
        _compressed_size: u64,
        crc32: u32,
        id: ObjectId,
    ) -> Result<(), PackError> {
        let pending = self.pending.take().expect("object_start precedes object_complete");
        let PendingKind::Object(object_type) = pending.kind else {
            unreachable!("pending entry started as an object");
        };
        self.tables.insert(Entry {
            position: pending.position,
            header_size: pending.header_size,
            size: pending.size,
            crc32,
            kind: EntryKind::Base { object_type, id },
        })?;

        self.progress.received_objects += 1;
        self.progress.indexed_objects += 1;
        progress::emit(&mut self.observer, &self.progress)
    }

    fn delta_start(
        &mut self,
        position: u64,
        header_size: usize,
        base: DeltaBase,
        size: u64,
    ) -> Result<(), PackError> {
        self.pending = Some(PendingEntry {
            position,
            header_size,
            size,
            kind: PendingKind::Delta(base),
        });
        Ok(())
    }

    fn delta_complete(&mut self, _compressed_size: u64, crc32: u32) -> Result<(), PackError> {
        let pending = self.pending.take().expect("delta_start precedes delta_complete");
        let PendingKind::Delta(base) = pending.kind else {
            unreachable!("pending entry started as a delta");
        };
        self.tables.insert(Entry {
            position: pending.position,
            header_size: pending.header_size,
            size: pending.size,
            crc32,
            kind: EntryKind::Delta { base, final_type: None, id: None },
        })?;

        self.progress.received_objects += 1;
        progress::emit(&mut self.observer, &self.progress)
    }

    fn packfile_complete(&mut self, trailer: ObjectId) -> Result<(), PackError> {
        self.trailer = Some(trailer);
        Ok(())
    }
}

/// Streaming packfile indexer.
///
/// Owns a temporary pack file in the destination directory, the entry
/// tables, and the parse state. [`append`](Indexer::append) bytes until
/// the stream ends, then [`commit`](Indexer::commit) to resolve deltas and
/// publish `pack-<hex>.pack` and `pack-<hex>.idx`. Dropping an
/// un-committed indexer removes the temporary pack.
pub struct Indexer {
    options: IndexerOptions,
    parent_dir: PathBuf,
    packfile: Option<NamedTempFile>,
    packfile_size: u64,
    parser: PackParser,
    collector: Collector,
    store: Option<Box<dyn ObjectStore>>,
    state: Lifecycle,
    name: Option<String>,
}

impl Indexer {
    /// Create an indexer that will publish into `parent_dir`, which must
    /// exist.
    pub fn new(parent_dir: impl AsRef<Path>, options: IndexerOptions) -> Result<Self, PackError> {
        let parent_dir = parent_dir.as_ref().to_path_buf();
        let packfile = tempfile::Builder::new()
            .prefix("tmp_pack_")
            .tempfile_in(&parent_dir)?;

        let collector = Collector { max_objects: options.max_objects, ..Collector::default() };
        Ok(Self {
            options,
            parent_dir,
            packfile: Some(packfile),
            packfile_size: 0,
            parser: PackParser::new(options.algorithm),
            collector,
            store: None,
            state: Lifecycle::Receiving,
            name: None,
        })
    }

    /// Attach the external object store used for REF_DELTA bases and the
    /// verify insertion pass.
    pub fn set_object_store(&mut self, store: Box<dyn ObjectStore>) {
        self.store = Some(store);
    }

    /// Attach a progress observer. Returning `ControlFlow::Break` from it
    /// aborts the indexer.
    pub fn set_progress_observer(&mut self, observer: ProgressObserver) {
        self.collector.observer = Some(observer);
    }

    /// Current counters.
    pub fn progress(&self) -> Progress {
        self.collector.progress
    }

    /// Bytes captured into the temporary pack so far.
    pub fn packfile_size(&self) -> u64 {
        self.packfile_size
    }

    /// The pack's hex name, available once commit has succeeded.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Feed a chunk of the pack stream. Chunks may be split at any byte
    /// boundary; zero-length calls are no-ops.
    pub fn append(&mut self, data: &[u8]) -> Result<(), PackError> {
        if self.state != Lifecycle::Receiving {
            return Err(PackError::InvalidState { op: "append", state: self.state.name() });
        }
        if data.is_empty() {
            return Ok(());
        }

        match self.append_inner(data) {
            Ok(()) => {
                if self.parser.is_complete() {
                    self.state = Lifecycle::Complete;
                }
                Ok(())
            }
            Err(e) => {
                self.state = Lifecycle::Failed;
                Err(e)
            }
        }
    }

    fn append_inner(&mut self, data: &[u8]) -> Result<(), PackError> {
        // Two passes over the chunk: capture the bytes on disk first, then
        // parse, so a parse failure still leaves everything the caller
        // delivered in the temporary pack.
        self.write_packfile(data)?;
        self.parser.parse(data, &mut self.collector)
    }

    fn write_packfile(&mut self, data: &[u8]) -> Result<(), PackError> {
        let file = self
            .packfile
            .as_mut()
            .expect("temporary pack lives until commit")
            .as_file_mut();
        for chunk in data.chunks(MAX_WRITE_SIZE) {
            file.write_all(chunk)?;
            self.packfile_size += chunk.len() as u64;
            self.collector.progress.received_bytes += chunk.len() as u64;
        }
        Ok(())
    }

    /// Resolve all deltas, emit the index, and publish both files.
    /// Returns the pack's hex name.
    pub fn commit(&mut self) -> Result<String, PackError> {
        if self.state != Lifecycle::Complete {
            return Err(PackError::InvalidState { op: "commit", state: self.state.name() });
        }
        match self.commit_inner() {
            Ok(name) => {
                self.state = Lifecycle::Committed;
                self.name = Some(name.clone());
                Ok(name)
            }
            Err(e) => {
                self.state = Lifecycle::Failed;
                Err(e)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<String, PackError> {
        // Freeze the delta count now that the stream is complete.
        let progress = &mut self.collector.progress;
        progress.total_deltas = progress.total_objects - progress.indexed_objects;
        progress::emit(&mut self.collector.observer, &self.collector.progress)?;

        let temp_pack = self.packfile.as_mut().expect("temporary pack lives until commit");
        temp_pack.as_file_mut().flush()?;
        let map = unsafe { Mmap::map(temp_pack.as_file())? };

        let trailer = self.collector.trailer.expect("complete pack has a trailer");

        let mut resolver =
            Resolver::new(&map, self.options.algorithm, self.options.base_cache_size);
        resolver.resolve_all(
            &mut self.collector.tables,
            self.store.as_deref(),
            &mut self.collector.progress,
            &mut self.collector.observer,
        )?;

        if self.options.verify {
            if let Some(store) = self.store.as_deref_mut() {
                resolver.insert_into_store(&self.collector.tables, store)?;
            }
        }
        drop(resolver);

        // Sort for emission. The position index and delta table hold
        // handles into the pre-sort order and are dead from here on.
        self.collector.tables.entries.sort_by(|a, b| a.id().cmp(&b.id()));

        let name = trailer.to_hex();
        let idx_temp = tempfile::Builder::new()
            .prefix("tmp_idx_")
            .tempfile_in(&self.parent_dir)?;
        write_index(
            std::io::BufWriter::new(idx_temp.as_file()),
            &self.collector.tables.entries,
            &trailer,
            self.options.algorithm,
        )?;

        let temp_pack = self.packfile.take().expect("temporary pack lives until commit");
        if self.options.fsync {
            temp_pack.as_file().sync_all()?;
            idx_temp.as_file().sync_all()?;
        }
        self.apply_mode(&temp_pack)?;
        self.apply_mode(&idx_temp)?;

        let pack_path = self.parent_dir.join(format!("pack-{name}.pack"));
        let idx_path = self.parent_dir.join(format!("pack-{name}.idx"));
        temp_pack.persist(&pack_path).map_err(|e| PackError::Io(e.error))?;
        idx_temp.persist(&idx_path).map_err(|e| PackError::Io(e.error))?;

        Ok(name)
    }

    #[cfg(unix)]
    fn apply_mode(&self, file: &NamedTempFile) -> Result<(), PackError> {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(self.options.mode))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_mode(&self, _file: &NamedTempFile) -> Result<(), PackError> {
        Ok(())
    }
}
