//! Compaction plan encoding.
//!
//! The plan is shipped from the compute node to a StoC as a self-describing
//! byte buffer; the responder decodes it without any out-of-band schema and
//! replies with the output file metadata.

use crate::codec::{get_str, get_u32, get_u64, get_varint, put_str, put_u32, put_u64, put_varint};
use crate::{get_bytes, put_bytes, FileMetaData, SubRange, WireError};

/// A remote compaction: merge the level-L and level-(L+1) inputs, split the
/// result at the guide anchors, and report the freshly written outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionRequest {
    pub dbname: String,
    /// Oldest snapshot still readable; tombstones at or below it may be
    /// dropped by the responder.
    pub smallest_snapshot: u64,
    pub source_level: u32,
    pub target_level: u32,
    /// `inputs[0]` holds the level-L files, `inputs[1]` the level-(L+1)
    /// files.
    pub inputs: [Vec<FileMetaData>; 2],
    /// Anchor keys at which the responder starts a new output file.
    pub guides: Vec<Vec<u8>>,
    /// Key intervals the compaction covers.
    pub subranges: Vec<SubRange>,
    /// Filled from the response: one entry per output file, each carrying
    /// its handle list.
    pub outputs: Vec<FileMetaData>,
}

fn put_files(buf: &mut Vec<u8>, files: &[FileMetaData]) {
    put_varint(buf, files.len() as u64);
    for f in files {
        f.encode(buf);
    }
}

fn get_files(buf: &[u8], pos: &mut usize) -> Result<Vec<FileMetaData>, WireError> {
    let n = get_varint(buf, pos)? as usize;
    let mut out = Vec::with_capacity(n.min(1024));
    for _ in 0..n {
        out.push(FileMetaData::decode(buf, pos)?);
    }
    Ok(out)
}

impl CompactionRequest {
    /// Encodes the request payload (everything after the `C` tag).
    pub fn encode_request(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.dbname);
        put_u64(buf, self.smallest_snapshot);
        put_u32(buf, self.source_level);
        put_u32(buf, self.target_level);
        put_files(buf, &self.inputs[0]);
        put_files(buf, &self.inputs[1]);
        put_varint(buf, self.guides.len() as u64);
        for g in &self.guides {
            put_bytes(buf, g);
        }
        put_varint(buf, self.subranges.len() as u64);
        for s in &self.subranges {
            s.encode(buf);
        }
    }

    /// Decodes a request payload produced by [`encode_request`]. The
    /// `outputs` field of the result is empty.
    pub fn decode_request(buf: &[u8], pos: &mut usize) -> Result<Self, WireError> {
        let dbname = get_str(buf, pos)?;
        let smallest_snapshot = get_u64(buf, pos)?;
        let source_level = get_u32(buf, pos)?;
        let target_level = get_u32(buf, pos)?;
        let level_inputs = get_files(buf, pos)?;
        let next_level_inputs = get_files(buf, pos)?;
        let nguides = get_varint(buf, pos)? as usize;
        let mut guides = Vec::with_capacity(nguides.min(1024));
        for _ in 0..nguides {
            guides.push(get_bytes(buf, pos)?);
        }
        let nsub = get_varint(buf, pos)? as usize;
        let mut subranges = Vec::with_capacity(nsub.min(1024));
        for _ in 0..nsub {
            subranges.push(SubRange::decode(buf, pos)?);
        }
        Ok(Self {
            dbname,
            smallest_snapshot,
            source_level,
            target_level,
            inputs: [level_inputs, next_level_inputs],
            guides,
            subranges,
            outputs: Vec::new(),
        })
    }

    /// Encodes the response payload (everything after the `R` tag).
    pub fn encode_response(outputs: &[FileMetaData], buf: &mut Vec<u8>) {
        put_files(buf, outputs);
    }

    /// Decodes a response payload into the output file list.
    pub fn decode_response(buf: &[u8], pos: &mut usize) -> Result<Vec<FileMetaData>, WireError> {
        get_files(buf, pos)
    }
}
