//! Resumable streaming parser for the pack wire format.
//!
//! The parser consumes byte chunks of any size — a chunk boundary may fall
//! inside any field — and emits one [`ParseSink`] callback per structural
//! event, in stream order: the pack header once, then an entry start and
//! completion per object, then the trailer. Header fields are decoded a
//! byte at a time so no fragment buffering is needed; payload boundaries
//! are found by running the zlib stream to its end.
//!
//! A running hash covers every byte before the trailer; the trailer must
//! match it. Any malformed input is terminal: the parser moves to a failed
//! state and rejects further bytes.

use flate2::{Decompress, FlushDecompress, Status};
use packr_hash::hasher::{object_header, Hasher};
use packr_hash::{HashAlgorithm, ObjectId};

use crate::entry::DeltaBase;
use crate::{ObjectType, PackError, PACK_SIGNATURE, PACK_VERSION, TYPE_OFS_DELTA, TYPE_REF_DELTA};

/// Receiver for parser events.
///
/// One `packfile_header` call, then per entry either
/// `object_start`/`object_complete` or `delta_start`/`delta_complete`,
/// then one `packfile_complete`. Any error return is terminal for the
/// parse.
pub trait ParseSink {
    fn packfile_header(&mut self, version: u32, entry_count: u32) -> Result<(), PackError>;

    fn object_start(
        &mut self,
        position: u64,
        header_size: usize,
        object_type: ObjectType,
        size: u64,
    ) -> Result<(), PackError>;

    /// The deflate stream for the current object has ended. `id` is the
    /// object's identity, hashed from its type-prefixed inflated content
    /// while it streamed through.
    fn object_complete(
        &mut self,
        compressed_size: u64,
        crc32: u32,
        id: ObjectId,
    ) -> Result<(), PackError>;

    fn delta_start(
        &mut self,
        position: u64,
        header_size: usize,
        base: DeltaBase,
        size: u64,
    ) -> Result<(), PackError>;

    /// Like `object_complete`, but a delta's identity is unknown until
    /// resolution, so none is carried.
    fn delta_complete(&mut self, compressed_size: u64, crc32: u32) -> Result<(), PackError>;

    fn packfile_complete(&mut self, trailer: ObjectId) -> Result<(), PackError>;
}

/// Scratch for the entry currently being decoded.
struct CurrentEntry {
    position: u64,
    type_num: u8,
    size: u64,
    header_size: usize,
    crc: crc32fast::Hasher,
    compressed_size: u64,
    inflated_size: u64,
    /// Streams the `"<type> <size>\0"`-prefixed content; non-delta only.
    id_hasher: Option<Hasher>,
    is_delta: bool,
}

impl CurrentEntry {
    fn new(position: u64) -> Self {
        Self {
            position,
            type_num: 0,
            size: 0,
            header_size: 0,
            crc: crc32fast::Hasher::new(),
            compressed_size: 0,
            inflated_size: 0,
            id_hasher: None,
            is_delta: false,
        }
    }
}

enum State {
    /// Accumulating the 12-byte pack header.
    Header { filled: usize, buf: [u8; 12] },
    /// Expecting the first byte of an entry header.
    EntryStart,
    /// Inside the type+size varint.
    EntrySize { shift: u32 },
    /// Inside an OFS_DELTA biased offset varint.
    OfsOffset { value: u64, first: bool },
    /// Accumulating a REF_DELTA base identity.
    RefId { filled: usize, buf: [u8; 32] },
    /// Inside an entry's deflate stream.
    Payload,
    /// Accumulating the pack trailer hash.
    Trailer { filled: usize, buf: [u8; 32] },
    Complete,
    Failed,
}

const INFLATE_SCRATCH: usize = 16 * 1024;

/// The streaming pack parser. Create once per pack; feed with
/// [`parse`](PackParser::parse).
pub struct PackParser {
    algo: HashAlgorithm,
    state: State,
    /// Bytes consumed so far; the next entry header starts here.
    position: u64,
    /// Running hash of every pre-trailer byte.
    pack_hash: Option<Hasher>,
    entry_count: u32,
    entries_seen: u32,
    current: Option<CurrentEntry>,
    inflate: Decompress,
    scratch: Box<[u8; INFLATE_SCRATCH]>,
}

impl PackParser {
    pub fn new(algo: HashAlgorithm) -> Self {
        Self {
            algo,
            state: State::Header { filled: 0, buf: [0; 12] },
            position: 0,
            pack_hash: Some(Hasher::new(algo)),
            entry_count: 0,
            entries_seen: 0,
            current: None,
            inflate: Decompress::new(true),
            scratch: Box::new([0; INFLATE_SCRATCH]),
        }
    }

    /// Whether the trailer has been seen and validated.
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }

    /// Total objects announced by the pack header.
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Consume a chunk, emitting events into `sink` as boundaries are
    /// crossed. Resumable: any suffix of the stream may arrive in a later
    /// call. On error the parser is failed and rejects further input.
    pub fn parse(&mut self, data: &[u8], sink: &mut dyn ParseSink) -> Result<(), PackError> {
        if matches!(self.state, State::Failed) {
            return Err(PackError::InvalidState { op: "parse", state: "failed" });
        }
        match self.parse_inner(data, sink) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    fn parse_inner(&mut self, mut data: &[u8], sink: &mut dyn ParseSink) -> Result<(), PackError> {
        while !data.is_empty() {
            match &mut self.state {
                State::Header { filled, buf } => {
                    let want = buf.len() - *filled;
                    let take = want.min(data.len());
                    buf[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    if *filled == buf.len() {
                        let buf = *buf;
                        self.consume(&data[..take], false);
                        data = &data[take..];
                        self.finish_header(&buf, sink)?;
                    } else {
                        self.consume(&data[..take], false);
                        data = &data[take..];
                    }
                }

                State::EntryStart => {
                    let byte = data[0];
                    let mut entry = CurrentEntry::new(self.position);
                    entry.type_num = (byte >> 4) & 0x07;
                    entry.size = u64::from(byte & 0x0f);
                    entry.header_size = 1;
                    self.current = Some(entry);
                    self.consume(&data[..1], true);
                    data = &data[1..];
                    if byte & 0x80 != 0 {
                        self.state = State::EntrySize { shift: 4 };
                    } else {
                        self.finish_entry_size(sink)?;
                    }
                }

                State::EntrySize { shift } => {
                    let byte = data[0];
                    if *shift > 57 {
                        return Err(PackError::Overflow("object size varint"));
                    }
                    let shift_now = *shift;
                    *shift += 7;
                    let entry = self.current.as_mut().expect("entry in progress");
                    entry.size |= u64::from(byte & 0x7f) << shift_now;
                    entry.header_size += 1;
                    self.consume(&data[..1], true);
                    data = &data[1..];
                    if byte & 0x80 == 0 {
                        self.finish_entry_size(sink)?;
                    }
                }

                State::OfsOffset { value, first } => {
                    let byte = data[0];
                    if *first {
                        *value = u64::from(byte & 0x7f);
                        *first = false;
                    } else {
                        if *value > (u64::MAX >> 7) - 1 {
                            return Err(PackError::Overflow("delta base offset varint"));
                        }
                        *value = ((*value + 1) << 7) | u64::from(byte & 0x7f);
                    }
                    let value = *value;
                    let entry = self.current.as_mut().expect("entry in progress");
                    entry.header_size += 1;
                    self.consume(&data[..1], true);
                    data = &data[1..];
                    if byte & 0x80 == 0 {
                        let entry = self.current.as_mut().expect("entry in progress");
                        if value == 0 || value > entry.position {
                            return Err(PackError::CorruptEntry {
                                offset: entry.position,
                                reason: "delta base offset outside the pack".into(),
                            });
                        }
                        let base_position = entry.position - value;
                        self.start_payload(sink, Some(DeltaBase::Offset(base_position)))?;
                    }
                }

                State::RefId { filled, buf } => {
                    let digest_len = self.algo.digest_len();
                    let want = digest_len - *filled;
                    let take = want.min(data.len());
                    buf[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    let done = *filled == digest_len;
                    let id = if done {
                        Some(ObjectId::from_bytes(&buf[..digest_len], self.algo)?)
                    } else {
                        None
                    };
                    let entry = self.current.as_mut().expect("entry in progress");
                    entry.header_size += take;
                    self.consume(&data[..take], true);
                    data = &data[take..];
                    if let Some(id) = id {
                        self.start_payload(sink, Some(DeltaBase::Ref(id)))?;
                    }
                }

                State::Payload => {
                    let before_in = self.inflate.total_in();
                    let before_out = self.inflate.total_out();
                    let status = self
                        .inflate
                        .decompress(data, &mut self.scratch[..], FlushDecompress::None)
                        .map_err(|e| {
                            let entry = self.current.as_ref().expect("entry in progress");
                            PackError::CorruptEntry {
                                offset: entry.position,
                                reason: format!("inflate: {e}"),
                            }
                        })?;
                    let consumed = (self.inflate.total_in() - before_in) as usize;
                    let produced = (self.inflate.total_out() - before_out) as usize;

                    {
                        let entry = self.current.as_mut().expect("entry in progress");
                        entry.compressed_size += consumed as u64;
                        entry.inflated_size += produced as u64;
                        if entry.inflated_size > entry.size {
                            return Err(PackError::CorruptEntry {
                                offset: entry.position,
                                reason: "object data did not match expected size".into(),
                            });
                        }
                        if let Some(hasher) = entry.id_hasher.as_mut() {
                            hasher.update(&self.scratch[..produced]);
                        }
                    }
                    self.consume(&data[..consumed], true);
                    data = &data[consumed..];

                    match status {
                        Status::StreamEnd => self.finish_payload(sink)?,
                        Status::Ok | Status::BufError => {
                            if consumed == 0 && produced == 0 && !data.is_empty() {
                                let entry = self.current.as_ref().expect("entry in progress");
                                return Err(PackError::CorruptEntry {
                                    offset: entry.position,
                                    reason: "deflate stream made no progress".into(),
                                });
                            }
                        }
                    }
                }

                State::Trailer { filled, buf } => {
                    let digest_len = self.algo.digest_len();
                    let want = digest_len - *filled;
                    let take = want.min(data.len());
                    buf[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    let done = *filled == digest_len;
                    let trailer = buf[..digest_len].to_vec();
                    // Trailer bytes are excluded from the running hash.
                    self.position += take as u64;
                    data = &data[take..];
                    if done {
                        self.finish_trailer(&trailer, sink)?;
                    }
                }

                State::Complete => {
                    return Err(PackError::CorruptEntry {
                        offset: self.position,
                        reason: "trailing data after packfile trailer".into(),
                    });
                }

                State::Failed => unreachable!("failed parser rejects input"),
            }
        }
        Ok(())
    }

    /// Account for consumed pre-trailer bytes: advance the position, feed
    /// the running pack hash and, when inside an entry, its CRC32.
    fn consume(&mut self, bytes: &[u8], in_entry: bool) {
        self.position += bytes.len() as u64;
        if let Some(hasher) = self.pack_hash.as_mut() {
            hasher.update(bytes);
        }
        if in_entry {
            if let Some(entry) = self.current.as_mut() {
                entry.crc.update(bytes);
            }
        }
    }

    fn finish_header(&mut self, buf: &[u8; 12], sink: &mut dyn ParseSink) -> Result<(), PackError> {
        if &buf[0..4] != PACK_SIGNATURE {
            return Err(PackError::InvalidHeader("bad PACK signature".into()));
        }
        let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        let entry_count = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        self.entry_count = entry_count;
        sink.packfile_header(version, entry_count)?;
        self.state = if entry_count == 0 {
            State::Trailer { filled: 0, buf: [0; 32] }
        } else {
            State::EntryStart
        };
        Ok(())
    }

    /// The type+size varint is done; route on the type number.
    fn finish_entry_size(&mut self, sink: &mut dyn ParseSink) -> Result<(), PackError> {
        let entry = self.current.as_ref().expect("entry in progress");
        match entry.type_num {
            n if ObjectType::from_type_number(n).is_some() => self.start_payload(sink, None),
            TYPE_OFS_DELTA => {
                self.state = State::OfsOffset { value: 0, first: true };
                Ok(())
            }
            TYPE_REF_DELTA => {
                self.state = State::RefId { filled: 0, buf: [0; 32] };
                Ok(())
            }
            n => Err(PackError::CorruptEntry {
                offset: entry.position,
                reason: format!("unknown object type {n}"),
            }),
        }
    }

    /// Header fully decoded: emit the start event and enter the payload.
    fn start_payload(
        &mut self,
        sink: &mut dyn ParseSink,
        base: Option<DeltaBase>,
    ) -> Result<(), PackError> {
        let algo = self.algo;
        let entry = self.current.as_mut().expect("entry in progress");
        match base {
            Some(base) => {
                entry.is_delta = true;
                sink.delta_start(entry.position, entry.header_size, base, entry.size)?;
            }
            None => {
                let object_type = ObjectType::from_type_number(entry.type_num)
                    .expect("routed as non-delta");
                let mut hasher = Hasher::new(algo);
                hasher.update(
                    object_header(object_type.as_str(), entry.size as usize).as_bytes(),
                );
                entry.id_hasher = Some(hasher);
                sink.object_start(entry.position, entry.header_size, object_type, entry.size)?;
            }
        }
        self.inflate.reset(true);
        self.state = State::Payload;
        Ok(())
    }

    /// Deflate stream ended: emit the completion event, then either the
    /// next entry or the trailer.
    fn finish_payload(&mut self, sink: &mut dyn ParseSink) -> Result<(), PackError> {
        let entry = self.current.take().expect("entry in progress");
        if entry.inflated_size != entry.size {
            return Err(PackError::CorruptEntry {
                offset: entry.position,
                reason: "object data did not match expected size".into(),
            });
        }
        let crc32 = entry.crc.finalize();
        if entry.is_delta {
            sink.delta_complete(entry.compressed_size, crc32)?;
        } else {
            let id = entry.id_hasher.expect("hasher for non-delta").finalize()?;
            sink.object_complete(entry.compressed_size, crc32, id)?;
        }
        self.entries_seen += 1;
        self.state = if self.entries_seen == self.entry_count {
            State::Trailer { filled: 0, buf: [0; 32] }
        } else {
            State::EntryStart
        };
        Ok(())
    }

    fn finish_trailer(&mut self, trailer: &[u8], sink: &mut dyn ParseSink) -> Result<(), PackError> {
        let expected = ObjectId::from_bytes(trailer, self.algo)?;
        let actual = self
            .pack_hash
            .take()
            .expect("pack hash pending until trailer")
            .finalize()?;
        if actual != expected {
            return Err(PackError::ChecksumMismatch { expected, actual });
        }
        sink.packfile_complete(actual)?;
        self.state = State::Complete;
        Ok(())
    }
}
