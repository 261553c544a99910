//! Post-stream delta resolution.
//!
//! Runs once, after the pack trailer has been validated and the pack file
//! mapped read-only. Every delta entry gets its `final_type` and `id`
//! computed by materialising its base (recursing through chains),
//! applying the instruction stream, and hashing the type-prefixed result.
//!
//! OFS deltas are walked with a cursor over a base-position-sorted list,
//! exploiting the invariant that bases precede their dependents in the
//! stream. REF deltas resolve afterwards: against already-resolved entries
//! by id first, then through the external object store.

use std::collections::HashMap;
use std::io::Read;
use std::num::NonZeroUsize;
use std::rc::Rc;

use flate2::bufread::ZlibDecoder;
use lru::LruCache;
use packr_hash::hasher::{object_header, Hasher};
use packr_hash::{HashAlgorithm, ObjectId};

use crate::entry::{DeltaBase, Entry, EntryKind, EntryTables};
use crate::odb::ObjectStore;
use crate::progress::{self, Progress, ProgressObserver};
use crate::{delta, ObjectType, PackError};

/// Fully materialised object content.
pub(crate) struct ObjectData {
    pub object_type: ObjectType,
    pub bytes: Vec<u8>,
}

/// Resolver over a read-only view of the completed pack.
pub(crate) struct Resolver<'a> {
    /// The whole pack file, trailer included.
    pack: &'a [u8],
    /// End of entry data: pack length minus the trailer.
    content_len: usize,
    algo: HashAlgorithm,
    /// Resolved content keyed by entry position. Purely an optimisation
    /// for long chains; `None` when disabled.
    cache: Option<LruCache<u64, Rc<ObjectData>>>,
}

impl<'a> Resolver<'a> {
    pub fn new(pack: &'a [u8], algo: HashAlgorithm, cache_size: usize) -> Self {
        Self {
            pack,
            content_len: pack.len().saturating_sub(algo.digest_len()),
            algo,
            cache: NonZeroUsize::new(cache_size).map(LruCache::new),
        }
    }

    /// Resolve every delta in the tables, in the order described above.
    pub fn resolve_all(
        &mut self,
        tables: &mut EntryTables,
        store: Option<&dyn ObjectStore>,
        progress: &mut Progress,
        observer: &mut Option<ProgressObserver>,
    ) -> Result<(), PackError> {
        let EntryTables { entries, positions, deltas } = tables;

        // Identity -> handle for everything already resolved. Plain
        // objects seed it; each resolved delta joins as it completes.
        let mut by_id: HashMap<ObjectId, usize> = entries
            .iter()
            .enumerate()
            .filter_map(|(handle, e)| e.id().map(|id| (*id, handle)))
            .collect();

        let mut ofs: Vec<(u64, usize)> = Vec::new();
        let mut refs: Vec<(ObjectId, usize)> = Vec::new();
        for &handle in deltas.iter() {
            match &entries[handle].kind {
                EntryKind::Delta { base: DeltaBase::Offset(pos), .. } => ofs.push((*pos, handle)),
                EntryKind::Delta { base: DeltaBase::Ref(id), .. } => refs.push((*id, handle)),
                EntryKind::Base { .. } => unreachable!("delta table holds deltas"),
            }
        }
        ofs.sort_by_key(|&(pos, _)| pos);
        refs.sort_by(|a, b| a.0.cmp(&b.0));

        // Bases precede dependents, so one pass over the entries in
        // stream order meets every OFS base in cursor order.
        let mut cursor = 0;
        for object_handle in 0..entries.len() {
            let object_position = entries[object_handle].position;
            while cursor < ofs.len() {
                let (base_position, delta_handle) = ofs[cursor];
                if base_position < object_position {
                    return Err(PackError::MissingBaseOffset(base_position));
                }
                if base_position > object_position {
                    break;
                }
                self.resolve_one(
                    entries, positions, &mut by_id, store, delta_handle, progress, observer,
                )?;
                cursor += 1;
            }
        }
        if cursor < ofs.len() {
            return Err(PackError::MissingBaseOffset(ofs[cursor].0));
        }

        for (_, delta_handle) in refs {
            self.resolve_one(
                entries, positions, &mut by_id, store, delta_handle, progress, observer,
            )?;
        }

        Ok(())
    }

    /// Insert every object into the store, cross-checking the id the
    /// store computes against the one in the tables. The verify
    /// pass-through behind `IndexerOptions::verify`.
    pub fn insert_into_store(
        &mut self,
        tables: &EntryTables,
        store: &mut dyn ObjectStore,
    ) -> Result<(), PackError> {
        let by_id: HashMap<ObjectId, usize> = tables
            .entries
            .iter()
            .enumerate()
            .filter_map(|(handle, e)| e.id().map(|id| (*id, handle)))
            .collect();

        for handle in 0..tables.entries.len() {
            let data = {
                let read_store: &dyn ObjectStore = &*store;
                self.resolved_data(
                    &tables.entries,
                    &tables.positions,
                    &by_id,
                    Some(read_store),
                    handle,
                )?
            };
            let indexed = *tables.entries[handle].id().expect("entries resolved before insertion");
            let stored = store.write(data.object_type, &data.bytes)?;
            if stored != indexed {
                return Err(PackError::Store(format!(
                    "store computed {stored} for object indexed as {indexed}"
                )));
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_one(
        &mut self,
        entries: &mut [Entry],
        positions: &HashMap<u64, usize>,
        by_id: &mut HashMap<ObjectId, usize>,
        store: Option<&dyn ObjectStore>,
        handle: usize,
        progress: &mut Progress,
        observer: &mut Option<ProgressObserver>,
    ) -> Result<(), PackError> {
        let data = self.resolved_data(entries, positions, by_id, store, handle)?;

        let mut hasher = Hasher::new(self.algo);
        hasher.update(object_header(data.object_type.as_str(), data.bytes.len()).as_bytes());
        hasher.update(&data.bytes);
        let id = hasher.finalize()?;

        match &mut entries[handle].kind {
            EntryKind::Delta { final_type, id: slot, .. } => {
                *final_type = Some(data.object_type);
                *slot = Some(id);
            }
            EntryKind::Base { .. } => unreachable!("resolve_one is only called on deltas"),
        }
        by_id.insert(id, handle);

        progress.indexed_deltas += 1;
        progress.indexed_objects += 1;
        progress::emit(observer, progress)
    }

    /// Materialise an entry's content, recursing through delta chains.
    fn resolved_data(
        &mut self,
        entries: &[Entry],
        positions: &HashMap<u64, usize>,
        by_id: &HashMap<ObjectId, usize>,
        store: Option<&dyn ObjectStore>,
        handle: usize,
    ) -> Result<Rc<ObjectData>, PackError> {
        let position = entries[handle].position;
        if let Some(cache) = self.cache.as_mut() {
            if let Some(hit) = cache.get(&position) {
                return Ok(Rc::clone(hit));
            }
        }

        let entry = &entries[handle];
        let data = match &entry.kind {
            EntryKind::Base { object_type, .. } => Rc::new(ObjectData {
                object_type: *object_type,
                bytes: self.raw_data(entry)?,
            }),
            EntryKind::Delta { base, .. } => {
                let base_data = match base {
                    DeltaBase::Offset(pos) => {
                        let base_handle = positions
                            .get(pos)
                            .copied()
                            .ok_or(PackError::MissingBaseOffset(*pos))?;
                        self.resolved_data(entries, positions, by_id, store, base_handle)?
                    }
                    DeltaBase::Ref(id) => match by_id.get(id) {
                        Some(&base_handle) => {
                            self.resolved_data(entries, positions, by_id, store, base_handle)?
                        }
                        None => {
                            let external = match store {
                                Some(s) => s.read(id)?,
                                None => None,
                            };
                            match external {
                                Some((object_type, bytes)) => {
                                    Rc::new(ObjectData { object_type, bytes })
                                }
                                None => return Err(PackError::MissingBase(*id)),
                            }
                        }
                    },
                };
                let delta_buf = self.raw_data(entry)?;
                let bytes = delta::apply(&base_data.bytes, &delta_buf, entry.position)?;
                Rc::new(ObjectData { object_type: base_data.object_type, bytes })
            }
        };

        if let Some(cache) = self.cache.as_mut() {
            cache.put(position, Rc::clone(&data));
        }
        Ok(data)
    }

    /// Inflate an entry's own payload from the mapped pack.
    fn raw_data(&self, entry: &Entry) -> Result<Vec<u8>, PackError> {
        let start = usize::try_from(entry.data_position())
            .map_err(|_| PackError::Overflow("entry data position"))?;
        if start >= self.content_len {
            return Err(PackError::CorruptEntry {
                offset: entry.position,
                reason: "entry data starts past the end of the pack".into(),
            });
        }

        let mut decoder = ZlibDecoder::new(&self.pack[start..self.content_len]);
        let mut buf = Vec::with_capacity(entry.size as usize);
        decoder.read_to_end(&mut buf).map_err(|e| PackError::CorruptEntry {
            offset: entry.position,
            reason: format!("inflate: {e}"),
        })?;
        if buf.len() as u64 != entry.size {
            return Err(PackError::CorruptEntry {
                offset: entry.position,
                reason: "object data did not match expected size".into(),
            });
        }
        Ok(buf)
    }
}
