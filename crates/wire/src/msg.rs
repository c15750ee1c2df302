//! The message taxonomy: one tag byte per message kind, and a typed
//! [`Message`] enum with a total encoder/decoder.

use crate::codec::{
    get_bool, get_str, get_u32, get_u64, get_varint, put_bool, put_str, put_u32, put_u64,
    put_varint,
};
use crate::log::{decode_log_batch, encode_log_batch, LogRecord};
use crate::{CompactionRequest, DcStats, FileMetaData, RTableHandle, SSTableRTablePair, WireError};

/// Wire tag of every fabric message. Discriminants are the ASCII tag byte
/// carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    RtableReadBlocks = b'a',
    ReadBlocks = b'b',
    FlushSstable = b'd',
    FlushSstableBuf = b'f',
    FlushSstableSucc = b'g',
    AllocateSstableBuffer = b'h',
    AllocateSstableBufferSucc = b'i',
    ReleaseSstableBuffer = b'j',
    AllocateLogBuffer = b'k',
    AllocateLogBufferSucc = b'l',
    DeleteLogFile = b'm',
    DeleteLogFileSucc = b'n',
    DeleteTables = b'o',
    ReadInMemoryLogFile = b'p',
    RtableWriteSstable = b'q',
    RtableWriteSstableResponse = b'r',
    RtablePersistResponse = b't',
    DcReadStats = b'u',
    DcReadStatsResponse = b's',
    ReplicateLogRecords = b'v',
    QueryLogFiles = b'w',
    QueryLogFilesResponse = b'x',
    FilenameRtableId = b'y',
    FilenameRtableIdResponse = b'z',
    Compaction = b'C',
    CompactionResponse = b'R',
}

impl MsgType {
    /// Maps a wire tag byte back to its message type.
    pub fn from_tag(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            b'a' => Self::RtableReadBlocks,
            b'b' => Self::ReadBlocks,
            b'd' => Self::FlushSstable,
            b'f' => Self::FlushSstableBuf,
            b'g' => Self::FlushSstableSucc,
            b'h' => Self::AllocateSstableBuffer,
            b'i' => Self::AllocateSstableBufferSucc,
            b'j' => Self::ReleaseSstableBuffer,
            b'k' => Self::AllocateLogBuffer,
            b'l' => Self::AllocateLogBufferSucc,
            b'm' => Self::DeleteLogFile,
            b'n' => Self::DeleteLogFileSucc,
            b'o' => Self::DeleteTables,
            b'p' => Self::ReadInMemoryLogFile,
            b'q' => Self::RtableWriteSstable,
            b'r' => Self::RtableWriteSstableResponse,
            b't' => Self::RtablePersistResponse,
            b'u' => Self::DcReadStats,
            b's' => Self::DcReadStatsResponse,
            b'v' => Self::ReplicateLogRecords,
            b'w' => Self::QueryLogFiles,
            b'x' => Self::QueryLogFilesResponse,
            b'y' => Self::FilenameRtableId,
            b'z' => Self::FilenameRtableIdResponse,
            b'C' => Self::Compaction,
            b'R' => Self::CompactionResponse,
            other => return Err(WireError::UnknownTag(other)),
        })
    }

    /// The tag byte this type puts on the wire.
    #[must_use]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A fully decoded fabric message.
///
/// Requests flow LTC → StoC, responses StoC → LTC; the doc comment on each
/// variant names the direction where it is not obvious from the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Messaged read of a byte range behind a handle (fallback when the
    /// transport has no one-sided READ).
    RtableReadBlocks {
        handle: RTableHandle,
        offset: u64,
        size: u64,
    },
    /// Legacy raw-region read.
    ReadBlocks {
        rtable_id: u32,
        offset: u64,
        size: u64,
    },
    /// Persist every region belonging to a file.
    FlushSstable { file_number: u64 },
    /// Commit (and optionally persist) one allocated buffer.
    FlushSstableBuf { rtable_id: u32, persist: bool },
    /// Ack for [`Message::FlushSstable`], carrying the durable handles.
    FlushSstableSucc { handles: Vec<RTableHandle> },
    /// Reserve an append region for an SSTable chunk.
    AllocateSstableBuffer {
        dbname: String,
        file_number: u64,
        size: u64,
        is_meta: bool,
    },
    /// Allocation response; a null handle means the StoC is out of space.
    AllocateSstableBufferSucc { handle: RTableHandle },
    /// Return an allocated, never-flushed buffer (writer failure path).
    ReleaseSstableBuffer { rtable_id: u32 },
    AllocateLogBuffer { log_file: String, size: u64 },
    /// Carries the offset of the reserved slot inside the log arena.
    AllocateLogBufferSucc { offset: u64, size: u64 },
    DeleteLogFile { log_file: String },
    DeleteLogFileSucc { log_file: String },
    /// Fire-and-forget region reclaim; no response is defined.
    DeleteTables { tables: Vec<SSTableRTablePair> },
    /// Messaged read of a log arena segment.
    ReadInMemoryLogFile { offset: u64, size: u64 },
    /// Combined allocate variant: the response names the region to write.
    RtableWriteSstable {
        dbname: String,
        file_number: u64,
        size: u64,
        is_meta: bool,
    },
    RtableWriteSstableResponse { handle: RTableHandle },
    /// The bytes behind `handle` are durable on the StoC.
    RtablePersistResponse { handle: RTableHandle },
    DcReadStats,
    DcReadStatsResponse { stats: DcStats },
    /// A framed record batch; also the exact byte image written one-sided
    /// into a log buffer, so recovery can scan buffers with this decoder.
    ReplicateLogRecords {
        log_file: String,
        records: Vec<LogRecord>,
    },
    QueryLogFiles { db_id: u32 },
    QueryLogFilesResponse { offsets: Vec<(String, u64)> },
    /// Push the filename → rtable map so the StoC can collect orphans.
    FilenameRtableId { mapping: Vec<(String, u32)> },
    FilenameRtableIdResponse,
    Compaction { request: CompactionRequest },
    CompactionResponse { outputs: Vec<FileMetaData> },
}

impl Message {
    /// The wire tag for this message.
    #[must_use]
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::RtableReadBlocks { .. } => MsgType::RtableReadBlocks,
            Message::ReadBlocks { .. } => MsgType::ReadBlocks,
            Message::FlushSstable { .. } => MsgType::FlushSstable,
            Message::FlushSstableBuf { .. } => MsgType::FlushSstableBuf,
            Message::FlushSstableSucc { .. } => MsgType::FlushSstableSucc,
            Message::AllocateSstableBuffer { .. } => MsgType::AllocateSstableBuffer,
            Message::AllocateSstableBufferSucc { .. } => MsgType::AllocateSstableBufferSucc,
            Message::ReleaseSstableBuffer { .. } => MsgType::ReleaseSstableBuffer,
            Message::AllocateLogBuffer { .. } => MsgType::AllocateLogBuffer,
            Message::AllocateLogBufferSucc { .. } => MsgType::AllocateLogBufferSucc,
            Message::DeleteLogFile { .. } => MsgType::DeleteLogFile,
            Message::DeleteLogFileSucc { .. } => MsgType::DeleteLogFileSucc,
            Message::DeleteTables { .. } => MsgType::DeleteTables,
            Message::ReadInMemoryLogFile { .. } => MsgType::ReadInMemoryLogFile,
            Message::RtableWriteSstable { .. } => MsgType::RtableWriteSstable,
            Message::RtableWriteSstableResponse { .. } => MsgType::RtableWriteSstableResponse,
            Message::RtablePersistResponse { .. } => MsgType::RtablePersistResponse,
            Message::DcReadStats => MsgType::DcReadStats,
            Message::DcReadStatsResponse { .. } => MsgType::DcReadStatsResponse,
            Message::ReplicateLogRecords { .. } => MsgType::ReplicateLogRecords,
            Message::QueryLogFiles { .. } => MsgType::QueryLogFiles,
            Message::QueryLogFilesResponse { .. } => MsgType::QueryLogFilesResponse,
            Message::FilenameRtableId { .. } => MsgType::FilenameRtableId,
            Message::FilenameRtableIdResponse => MsgType::FilenameRtableIdResponse,
            Message::Compaction { .. } => MsgType::Compaction,
            Message::CompactionResponse { .. } => MsgType::CompactionResponse,
        }
    }

    /// Serializes the message: `[tag][payload]`.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.msg_type().tag());
        match self {
            Message::RtableReadBlocks {
                handle,
                offset,
                size,
            } => {
                handle.encode(&mut buf);
                put_u64(&mut buf, *offset);
                put_u64(&mut buf, *size);
            }
            Message::ReadBlocks {
                rtable_id,
                offset,
                size,
            } => {
                put_u32(&mut buf, *rtable_id);
                put_u64(&mut buf, *offset);
                put_u64(&mut buf, *size);
            }
            Message::FlushSstable { file_number } => put_u64(&mut buf, *file_number),
            Message::FlushSstableBuf { rtable_id, persist } => {
                put_u32(&mut buf, *rtable_id);
                put_bool(&mut buf, *persist);
            }
            Message::FlushSstableSucc { handles } => {
                put_varint(&mut buf, handles.len() as u64);
                for h in handles {
                    h.encode(&mut buf);
                }
            }
            Message::AllocateSstableBuffer {
                dbname,
                file_number,
                size,
                is_meta,
            }
            | Message::RtableWriteSstable {
                dbname,
                file_number,
                size,
                is_meta,
            } => {
                put_str(&mut buf, dbname);
                put_u64(&mut buf, *file_number);
                put_u64(&mut buf, *size);
                put_bool(&mut buf, *is_meta);
            }
            Message::AllocateSstableBufferSucc { handle }
            | Message::RtableWriteSstableResponse { handle }
            | Message::RtablePersistResponse { handle } => handle.encode(&mut buf),
            Message::ReleaseSstableBuffer { rtable_id } => put_u32(&mut buf, *rtable_id),
            Message::AllocateLogBuffer { log_file, size } => {
                put_str(&mut buf, log_file);
                put_u64(&mut buf, *size);
            }
            Message::AllocateLogBufferSucc { offset, size } => {
                put_u64(&mut buf, *offset);
                put_u64(&mut buf, *size);
            }
            Message::DeleteLogFile { log_file } | Message::DeleteLogFileSucc { log_file } => {
                put_str(&mut buf, log_file)
            }
            Message::DeleteTables { tables } => {
                put_varint(&mut buf, tables.len() as u64);
                for t in tables {
                    put_u64(&mut buf, t.file_number);
                    put_u32(&mut buf, t.rtable_id);
                }
            }
            Message::ReadInMemoryLogFile { offset, size } => {
                put_u64(&mut buf, *offset);
                put_u64(&mut buf, *size);
            }
            Message::DcReadStats | Message::FilenameRtableIdResponse => {}
            Message::DcReadStatsResponse { stats } => {
                put_u64(&mut buf, stats.queue_depth);
                put_u64(&mut buf, stats.pending_read_bytes);
                put_u64(&mut buf, stats.pending_write_bytes);
            }
            Message::ReplicateLogRecords { log_file, records } => {
                put_str(&mut buf, log_file);
                encode_log_batch(&mut buf, records);
            }
            Message::QueryLogFiles { db_id } => put_u32(&mut buf, *db_id),
            Message::QueryLogFilesResponse { offsets } => {
                put_varint(&mut buf, offsets.len() as u64);
                for (name, off) in offsets {
                    put_str(&mut buf, name);
                    put_u64(&mut buf, *off);
                }
            }
            Message::FilenameRtableId { mapping } => {
                put_varint(&mut buf, mapping.len() as u64);
                for (name, id) in mapping {
                    put_str(&mut buf, name);
                    put_u32(&mut buf, *id);
                }
            }
            Message::Compaction { request } => request.encode_request(&mut buf),
            Message::CompactionResponse { outputs } => {
                CompactionRequest::encode_response(outputs, &mut buf)
            }
        }
        buf
    }

    /// Decodes one message from `buf`. Fails on unknown tags and truncated
    /// payloads; trailing bytes past the payload are ignored.
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        let mut pos = 0usize;
        let tag = *buf.first().ok_or(WireError::Truncated)?;
        pos += 1;
        let msg = match MsgType::from_tag(tag)? {
            MsgType::RtableReadBlocks => Message::RtableReadBlocks {
                handle: RTableHandle::decode(buf, &mut pos)?,
                offset: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
            },
            MsgType::ReadBlocks => Message::ReadBlocks {
                rtable_id: get_u32(buf, &mut pos)?,
                offset: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
            },
            MsgType::FlushSstable => Message::FlushSstable {
                file_number: get_u64(buf, &mut pos)?,
            },
            MsgType::FlushSstableBuf => Message::FlushSstableBuf {
                rtable_id: get_u32(buf, &mut pos)?,
                persist: get_bool(buf, &mut pos)?,
            },
            MsgType::FlushSstableSucc => {
                let n = get_varint(buf, &mut pos)? as usize;
                let mut handles = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    handles.push(RTableHandle::decode(buf, &mut pos)?);
                }
                Message::FlushSstableSucc { handles }
            }
            MsgType::AllocateSstableBuffer => Message::AllocateSstableBuffer {
                dbname: get_str(buf, &mut pos)?,
                file_number: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
                is_meta: get_bool(buf, &mut pos)?,
            },
            MsgType::AllocateSstableBufferSucc => Message::AllocateSstableBufferSucc {
                handle: RTableHandle::decode(buf, &mut pos)?,
            },
            MsgType::ReleaseSstableBuffer => Message::ReleaseSstableBuffer {
                rtable_id: get_u32(buf, &mut pos)?,
            },
            MsgType::AllocateLogBuffer => Message::AllocateLogBuffer {
                log_file: get_str(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
            },
            MsgType::AllocateLogBufferSucc => Message::AllocateLogBufferSucc {
                offset: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
            },
            MsgType::DeleteLogFile => Message::DeleteLogFile {
                log_file: get_str(buf, &mut pos)?,
            },
            MsgType::DeleteLogFileSucc => Message::DeleteLogFileSucc {
                log_file: get_str(buf, &mut pos)?,
            },
            MsgType::DeleteTables => {
                let n = get_varint(buf, &mut pos)? as usize;
                let mut tables = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    tables.push(SSTableRTablePair {
                        file_number: get_u64(buf, &mut pos)?,
                        rtable_id: get_u32(buf, &mut pos)?,
                    });
                }
                Message::DeleteTables { tables }
            }
            MsgType::ReadInMemoryLogFile => Message::ReadInMemoryLogFile {
                offset: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
            },
            MsgType::RtableWriteSstable => Message::RtableWriteSstable {
                dbname: get_str(buf, &mut pos)?,
                file_number: get_u64(buf, &mut pos)?,
                size: get_u64(buf, &mut pos)?,
                is_meta: get_bool(buf, &mut pos)?,
            },
            MsgType::RtableWriteSstableResponse => Message::RtableWriteSstableResponse {
                handle: RTableHandle::decode(buf, &mut pos)?,
            },
            MsgType::RtablePersistResponse => Message::RtablePersistResponse {
                handle: RTableHandle::decode(buf, &mut pos)?,
            },
            MsgType::DcReadStats => Message::DcReadStats,
            MsgType::DcReadStatsResponse => Message::DcReadStatsResponse {
                stats: DcStats {
                    queue_depth: get_u64(buf, &mut pos)?,
                    pending_read_bytes: get_u64(buf, &mut pos)?,
                    pending_write_bytes: get_u64(buf, &mut pos)?,
                },
            },
            MsgType::ReplicateLogRecords => Message::ReplicateLogRecords {
                log_file: get_str(buf, &mut pos)?,
                records: decode_log_batch(buf, &mut pos)?,
            },
            MsgType::QueryLogFiles => Message::QueryLogFiles {
                db_id: get_u32(buf, &mut pos)?,
            },
            MsgType::QueryLogFilesResponse => {
                let n = get_varint(buf, &mut pos)? as usize;
                let mut offsets = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let name = get_str(buf, &mut pos)?;
                    let off = get_u64(buf, &mut pos)?;
                    offsets.push((name, off));
                }
                Message::QueryLogFilesResponse { offsets }
            }
            MsgType::FilenameRtableId => {
                let n = get_varint(buf, &mut pos)? as usize;
                let mut mapping = Vec::with_capacity(n.min(1024));
                for _ in 0..n {
                    let name = get_str(buf, &mut pos)?;
                    let id = get_u32(buf, &mut pos)?;
                    mapping.push((name, id));
                }
                Message::FilenameRtableId { mapping }
            }
            MsgType::FilenameRtableIdResponse => Message::FilenameRtableIdResponse,
            MsgType::Compaction => Message::Compaction {
                request: CompactionRequest::decode_request(buf, &mut pos)?,
            },
            MsgType::CompactionResponse => Message::CompactionResponse {
                outputs: CompactionRequest::decode_response(buf, &mut pos)?,
            },
        };
        Ok(msg)
    }
}
