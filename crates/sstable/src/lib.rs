//! # SSTable — remote sorted tables
//!
//! A DriftKV SSTable never touches the compute node's disk. The writer
//! builds the complete table image in a pooled memory buffer, then ships it
//! to a StoC in bounded chunks; the reader resolves block reads against the
//! resulting remote byte ranges, optionally prefetching the whole file.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA (sorted key/value entries)                               │
//! │ crc32 (u32) | key_len (u32) | key | seq (u64)                 │
//! │ present (u8) | [val_len (u32) | val]                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FILTER  num_bits (u64) | num_hashes (u32)                     │
//! │         bits_len (u32) | bits                                 │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX   key_len (u32) | key | entry_offset (u64)              │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER  filter_offset (u64) | index_offset (u64)              │
//! │         entry_count (u64) | magic (u32 = "DKV1")              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian; offsets in the index and footer are
//! logical offsets into the whole file image. The DATA region is chunked
//! across one or more remote regions; FILTER + INDEX + FOOTER travel as one
//! trailing meta chunk. Chunk order equals byte order, so
//! `concat(read(h) for h in handles)` reproduces the image exactly.

pub mod format;
mod merge;
mod reader;
mod writer;

pub use format::{KeyFilter, TableEntry, TableMeta};
pub use merge::MergeIterator;
pub use reader::RemoteSstReader;
pub use writer::{PersistStatus, SstMemFile};

#[cfg(test)]
mod tests;
