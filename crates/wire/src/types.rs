//! Shared protocol structs: remote byte-range handles, SSTable metadata,
//! compaction subranges and storage-node statistics.

use crate::codec::{
    get_bytes, get_u32, get_u64, get_u8, get_varint, put_bytes, put_u32, put_u64, put_u8,
    put_varint,
};
use crate::WireError;

/// Region id reserved for the log arena on every StoC; SSTable regions are
/// numbered from 1.
pub const LOG_ARENA_RTABLE_ID: u32 = 0;

/// A stable reference to a contiguous byte range on a specific StoC.
///
/// For a given `(server_id, rtable_id)`, bytes `[offset, offset + size)`
/// never change content once the handle has been issued; they may be read by
/// any number of readers until the owning SSTable is deleted.
///
/// A handle with `size == 0` is the "allocation failed" sentinel returned by
/// a StoC that could not satisfy a buffer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RTableHandle {
    /// Identity of the StoC owning the bytes.
    pub server_id: u32,
    /// Append region on that StoC. Region 0 is reserved for the log arena.
    pub rtable_id: u32,
    /// Byte offset within the region.
    pub offset: u64,
    /// Length of the range.
    pub size: u64,
}

impl RTableHandle {
    /// Fixed encoded length in bytes.
    pub const ENCODED_LEN: usize = 4 + 4 + 8 + 8;

    /// Returns `true` for the zero-sized "allocation failed" sentinel.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.size == 0
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.server_id);
        put_u32(buf, self.rtable_id);
        put_u64(buf, self.offset);
        put_u64(buf, self.size);
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, WireError> {
        Ok(Self {
            server_id: get_u32(buf, pos)?,
            rtable_id: get_u32(buf, pos)?,
            offset: get_u64(buf, pos)?,
            size: get_u64(buf, pos)?,
        })
    }
}

/// Compute-side handle to one remote SSTable.
///
/// The handle list is the file's on-StoC layout: data chunks first, in byte
/// order, then the filter/index/footer as one trailing meta handle. Readers
/// rely on that ordering for offset arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileMetaData {
    /// File number, owned by the compute node.
    pub number: u64,
    /// LSM level the file lives on.
    pub level: u32,
    /// Total byte size (data region + meta block).
    pub file_size: u64,
    /// Smallest user key in the file.
    pub smallest: Vec<u8>,
    /// Largest user key in the file.
    pub largest: Vec<u8>,
    /// Data chunk handles, in byte order.
    pub data_handles: Vec<RTableHandle>,
    /// The filter/index/footer chunk.
    pub meta_handle: Option<RTableHandle>,
}

impl FileMetaData {
    /// Iterates all handles in byte order (data chunks, then meta).
    pub fn handles(&self) -> impl Iterator<Item = &RTableHandle> {
        self.data_handles.iter().chain(self.meta_handle.iter())
    }

    /// Byte length of the data region (file size minus the meta block).
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_handles.iter().map(|h| h.size).sum()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u64(buf, self.number);
        put_u32(buf, self.level);
        put_u64(buf, self.file_size);
        put_bytes(buf, &self.smallest);
        put_bytes(buf, &self.largest);
        put_varint(buf, self.data_handles.len() as u64);
        for h in &self.data_handles {
            h.encode(buf);
        }
        match &self.meta_handle {
            Some(h) => {
                put_u8(buf, 1);
                h.encode(buf);
            }
            None => put_u8(buf, 0),
        }
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, WireError> {
        let number = get_u64(buf, pos)?;
        let level = get_u32(buf, pos)?;
        let file_size = get_u64(buf, pos)?;
        let smallest = get_bytes(buf, pos)?;
        let largest = get_bytes(buf, pos)?;
        let n = get_varint(buf, pos)? as usize;
        let mut data_handles = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            data_handles.push(RTableHandle::decode(buf, pos)?);
        }
        let meta_handle = if get_u8(buf, pos)? != 0 {
            Some(RTableHandle::decode(buf, pos)?)
        } else {
            None
        };
        Ok(Self {
            number,
            level,
            file_size,
            smallest,
            largest,
            data_handles,
            meta_handle,
        })
    }
}

/// A key interval used to partition compaction output files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubRange {
    /// Inclusive lower bound.
    pub lower: Vec<u8>,
    /// Exclusive upper bound.
    pub upper: Vec<u8>,
}

impl SubRange {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_bytes(buf, &self.lower);
        put_bytes(buf, &self.upper);
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, WireError> {
        Ok(Self {
            lower: get_bytes(buf, pos)?,
            upper: get_bytes(buf, pos)?,
        })
    }
}

/// One SSTable file's claim on a StoC region, used by DELETE_TABLES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SSTableRTablePair {
    pub file_number: u64,
    pub rtable_id: u32,
}

/// Storage-node load statistics returned by DC_READ_STATS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcStats {
    /// Requests queued but not yet served.
    pub queue_depth: u64,
    pub pending_read_bytes: u64,
    pub pending_write_bytes: u64,
}
