//! Log record framing for memtable replication.
//!
//! A replicated batch is written one-sided into a StoC log buffer, so the
//! bytes must be self-describing: a recovery scan has nothing but the buffer
//! contents to go on. Each record is framed as
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][sequence: u64][key_len: u32][key][val_len: u32][val]
//! ```
//!
//! `record_len` counts the CRC plus the body but not itself. The CRC covers
//! the body only. A batch is the `v` message tag, the log file name, a
//! record count, then the frames back to back — see
//! [`Message::ReplicateLogRecords`](crate::Message).

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

use crate::codec::{get_u32, get_u64, put_u32, put_u64};
use crate::WireError;

/// A single key/value mutation bound for a replica's log buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Sequence number assigned by the compute node.
    pub sequence: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogRecord {
    /// Encoded frame length for this record.
    #[must_use]
    pub fn framed_len(&self) -> usize {
        // len + crc + seq + key_len + key + val_len + val
        4 + 4 + 8 + 4 + self.key.len() + 4 + self.value.len()
    }
}

/// Total framed length of a batch of records (count header included).
#[must_use]
pub fn batch_len(records: &[LogRecord]) -> usize {
    4 + records.iter().map(LogRecord::framed_len).sum::<usize>()
}

/// Appends `[count: u32]` followed by one frame per record.
pub fn encode_log_batch(buf: &mut Vec<u8>, records: &[LogRecord]) {
    put_u32(buf, records.len() as u32);
    for rec in records {
        let body_start = buf.len() + 8;
        put_u32(buf, 0); // record_len, patched below
        put_u32(buf, 0); // crc32, patched below
        put_u64(buf, rec.sequence);
        put_u32(buf, rec.key.len() as u32);
        buf.extend_from_slice(&rec.key);
        put_u32(buf, rec.value.len() as u32);
        buf.extend_from_slice(&rec.value);

        let body_len = buf.len() - body_start;
        let mut hasher = Crc32::new();
        hasher.update(&buf[body_start..]);
        let crc = hasher.finalize();

        let header = body_start - 8;
        LittleEndian::write_u32(&mut buf[header..header + 4], (body_len + 4) as u32);
        LittleEndian::write_u32(&mut buf[header + 4..header + 8], crc);
    }
}

/// Decodes a batch written by [`encode_log_batch`], verifying every CRC.
pub fn decode_log_batch(buf: &[u8], pos: &mut usize) -> Result<Vec<LogRecord>, WireError> {
    let count = get_u32(buf, pos)? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let record_len = get_u32(buf, pos)? as usize;
        if record_len < 4 + 8 + 4 + 4 {
            return Err(WireError::Corrupt);
        }
        let crc = get_u32(buf, pos)?;
        let body_len = record_len - 4;
        let end = pos.checked_add(body_len).ok_or(WireError::Truncated)?;
        if end > buf.len() {
            return Err(WireError::Truncated);
        }
        let body = &buf[*pos..end];

        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != crc {
            return Err(WireError::Corrupt);
        }

        let mut p = 0usize;
        let sequence = get_u64(body, &mut p)?;
        let key_len = get_u32(body, &mut p)? as usize;
        if p + key_len > body.len() {
            return Err(WireError::Corrupt);
        }
        let key = body[p..p + key_len].to_vec();
        p += key_len;
        let val_len = get_u32(body, &mut p)? as usize;
        if p + val_len > body.len() {
            return Err(WireError::Corrupt);
        }
        let value = body[p..p + val_len].to_vec();

        out.push(LogRecord {
            sequence,
            key,
            value,
        });
        *pos = end;
    }
    Ok(out)
}
