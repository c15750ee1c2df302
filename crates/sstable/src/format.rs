//! Entry records, the key filter, the index and the footer.
//!
//! Offsets stored in the index and footer are logical offsets into the
//! whole file image (data region + meta block), which is also the order the
//! chunk handles reproduce.

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher as Crc32;

/// Magic identifying a DriftKV table meta block (ASCII "DKV1").
pub const TABLE_MAGIC: u32 = 0x4456_4b31;

/// Footer length: filter_offset + index_offset + entry_count + magic.
pub const FOOTER_LEN: usize = 8 + 8 + 8 + 4;

/// Keys we refuse to decode (64 KiB) — bounds corrupt input.
const MAX_KEY_BYTES: usize = 64 * 1024;
/// Values we refuse to decode (10 MiB).
const MAX_VALUE_BYTES: usize = 10 * 1024 * 1024;

/// One table entry. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl TableEntry {
    /// Encoded length of this entry, CRC prefix included.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let val = self.value.as_ref().map_or(0, |v| 4 + v.len());
        4 + 4 + self.key.len() + 8 + 1 + val
    }
}

/// Appends one entry: `[crc32][key_len][key][seq][present][val_len][val]`.
/// The CRC covers everything after itself.
pub fn encode_entry(buf: &mut Vec<u8>, entry: &TableEntry) {
    let body_start = buf.len() + 4;
    buf.extend_from_slice(&[0u8; 4]); // crc placeholder
    buf.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.key);
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    match &entry.value {
        Some(v) => {
            buf.push(1);
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
        None => buf.push(0),
    }
    let mut hasher = Crc32::new();
    hasher.update(&buf[body_start..]);
    let crc = hasher.finalize();
    LittleEndian::write_u32(&mut buf[body_start - 4..body_start], crc);
}

/// Decodes one entry at `*pos`, verifying its CRC.
pub fn decode_entry(buf: &[u8], pos: &mut usize) -> Result<TableEntry> {
    let need = |p: usize, n: usize| -> Result<()> {
        if p + n > buf.len() {
            bail!("truncated table entry");
        }
        Ok(())
    };

    let mut p = *pos;
    need(p, 8)?;
    let crc = LittleEndian::read_u32(&buf[p..p + 4]);
    p += 4;
    let body_start = p;
    let key_len = LittleEndian::read_u32(&buf[p..p + 4]) as usize;
    p += 4;
    if key_len > MAX_KEY_BYTES {
        bail!("corrupt entry: key_len {} exceeds maximum", key_len);
    }
    need(p, key_len + 9)?;
    let key = buf[p..p + key_len].to_vec();
    p += key_len;
    let seq = LittleEndian::read_u64(&buf[p..p + 8]);
    p += 8;
    let present = buf[p];
    p += 1;
    let value = if present == 1 {
        need(p, 4)?;
        let val_len = LittleEndian::read_u32(&buf[p..p + 4]) as usize;
        p += 4;
        if val_len > MAX_VALUE_BYTES {
            bail!("corrupt entry: val_len {} exceeds maximum", val_len);
        }
        need(p, val_len)?;
        let v = buf[p..p + val_len].to_vec();
        p += val_len;
        Some(v)
    } else {
        None
    };

    let mut hasher = Crc32::new();
    hasher.update(&buf[body_start..p]);
    if hasher.finalize() != crc {
        bail!("entry CRC32 mismatch at offset {}", *pos);
    }

    *pos = p;
    Ok(TableEntry { seq, key, value })
}

/// Decodes the full run of entries in `buf`.
pub fn decode_entries(buf: &[u8]) -> Result<Vec<TableEntry>> {
    let mut pos = 0usize;
    let mut out = Vec::new();
    while pos < buf.len() {
        out.push(decode_entry(buf, &mut pos)?);
    }
    Ok(out)
}

/// Bit-vector key filter with double hashing, embedded in the meta block.
/// No false negatives; false positives at roughly the configured rate.
pub struct KeyFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
}

impl KeyFilter {
    /// Sizes the filter for `expected` keys at `fpr` false-positive rate.
    pub fn new(expected: usize, fpr: f64) -> Self {
        let n = expected.max(1) as f64;
        let fpr = fpr.clamp(1e-6, 0.5);
        let m = (-n * fpr.ln() / std::f64::consts::LN_2.powi(2)).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * std::f64::consts::LN_2).ceil() as u32;
        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            num_bits: m,
            num_hashes: k.max(1),
        }
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = hash_pair(key);
        for i in 0..self.num_hashes {
            let bit = h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// `[num_bits: u64][num_hashes: u32][bits_len: u32][bits]`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.bits.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.bits);
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self> {
        if *pos + 16 > buf.len() {
            bail!("truncated key filter");
        }
        let num_bits = LittleEndian::read_u64(&buf[*pos..*pos + 8]);
        let num_hashes = LittleEndian::read_u32(&buf[*pos + 8..*pos + 12]);
        let bits_len = LittleEndian::read_u32(&buf[*pos + 12..*pos + 16]) as usize;
        *pos += 16;
        if *pos + bits_len > buf.len() || num_bits == 0 || num_hashes == 0 {
            bail!("corrupt key filter");
        }
        let bits = buf[*pos..*pos + bits_len].to_vec();
        *pos += bits_len;
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        16 + self.bits.len()
    }
}

impl std::fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .finish()
    }
}

fn hash_pair(key: &[u8]) -> (u64, u64) {
    (
        fnv1a(key, 0xcbf29ce484222325),
        fnv1a(key, 0x517cc1b727220a95),
    )
}

fn fnv1a(data: &[u8], basis: u64) -> u64 {
    const FNV_PRIME: u64 = 0x00000100000001b3;
    let mut hash = basis;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Parsed meta block: filter + index + footer fields.
pub struct TableMeta {
    pub filter: KeyFilter,
    /// `(key, logical entry offset)`, ascending by key.
    pub index: Vec<(Vec<u8>, u64)>,
    pub entry_count: u64,
    /// Length of the data region; equals the footer's `filter_offset`.
    pub data_len: u64,
}

impl TableMeta {
    /// Offset and length of the entry holding `key`, if the index has it.
    /// The length is bounded by the next entry's offset (or the data end).
    pub fn locate(&self, key: &[u8]) -> Option<(u64, u64)> {
        let i = self
            .index
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()?;
        let offset = self.index[i].1;
        let end = self
            .index
            .get(i + 1)
            .map_or(self.data_len, |(_, next)| *next);
        Some((offset, end - offset))
    }
}

/// Builds the meta block for a table whose data region is `data_len` bytes:
/// filter, index, footer, with logical offsets.
pub fn build_meta(filter: &KeyFilter, index: &[(Vec<u8>, u64)], data_len: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(filter.encoded_len() + index.len() * 24 + FOOTER_LEN);
    filter.encode(&mut buf);
    let index_offset = data_len + buf.len() as u64;
    for (key, offset) in index {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    buf.extend_from_slice(&data_len.to_le_bytes()); // filter_offset
    buf.extend_from_slice(&index_offset.to_le_bytes());
    buf.extend_from_slice(&(index.len() as u64).to_le_bytes());
    buf.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
    buf
}

/// Parses a meta block produced by [`build_meta`].
pub fn parse_meta(meta: &[u8]) -> Result<TableMeta> {
    if meta.len() < FOOTER_LEN {
        bail!("meta block too small");
    }
    let footer = &meta[meta.len() - FOOTER_LEN..];
    let filter_offset = LittleEndian::read_u64(&footer[0..8]);
    let index_offset = LittleEndian::read_u64(&footer[8..16]);
    let entry_count = LittleEndian::read_u64(&footer[16..24]);
    let magic = LittleEndian::read_u32(&footer[24..28]);
    if magic != TABLE_MAGIC {
        bail!("bad table magic {:#010x}", magic);
    }
    if index_offset < filter_offset {
        bail!("index offset precedes filter offset");
    }
    // The meta block starts at logical offset `filter_offset`.
    let data_len = filter_offset;
    let index_start = (index_offset - filter_offset) as usize;
    if index_start > meta.len() - FOOTER_LEN {
        bail!("index offset outside meta block");
    }

    let mut pos = 0usize;
    let filter = KeyFilter::decode(&meta[..index_start], &mut pos)?;

    let mut index = Vec::with_capacity((entry_count as usize).min(1 << 20));
    let mut p = index_start;
    let index_end = meta.len() - FOOTER_LEN;
    while p < index_end {
        if p + 4 > index_end {
            bail!("truncated index entry");
        }
        let key_len = LittleEndian::read_u32(&meta[p..p + 4]) as usize;
        p += 4;
        if key_len > MAX_KEY_BYTES || p + key_len + 8 > index_end {
            bail!("corrupt index entry");
        }
        let key = meta[p..p + key_len].to_vec();
        p += key_len;
        let offset = LittleEndian::read_u64(&meta[p..p + 8]);
        p += 8;
        index.push((key, offset));
    }
    if index.len() as u64 != entry_count {
        bail!(
            "index holds {} entries, footer promises {}",
            index.len(),
            entry_count
        );
    }

    Ok(TableMeta {
        filter,
        index,
        entry_count,
        data_len,
    })
}
