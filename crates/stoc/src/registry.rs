//! The RTable registry: append regions, persistence, deletion.

use std::collections::{HashMap, HashSet};
use std::fs::{rename, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use thiserror::Error;

use dispatch::ServerId;
use wire::{get_str, get_u64, put_str, put_u64, RTableHandle, SSTableRTablePair};

/// Errors at the region seam. `Gone` is the defined response for reads
/// against deleted (or never-allocated) regions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StocError {
    #[error("region {0} is gone")]
    Gone(u32),
    #[error("range out of bounds in region {0}")]
    OutOfBounds(u32),
}

struct Region {
    dbname: String,
    file_number: u64,
    buf: Vec<u8>,
    persisted: bool,
}

struct Inner {
    regions: HashMap<u32, Region>,
    /// One append region per `(dbname, file_number)`: repeated allocations
    /// for the same file land in the same region at increasing offsets.
    by_file: HashMap<(String, u64), u32>,
    deleted: HashSet<u32>,
    bytes_used: u64,
}

/// StoC-side mapping of `rtable_id → backing bytes`.
pub struct RTableRegistry {
    server_id: ServerId,
    next_id: AtomicU32,
    inner: Mutex<Inner>,
    capacity: u64,
    /// Persist directory; `None` keeps the registry memory-only.
    dir: Option<PathBuf>,
}

impl RTableRegistry {
    pub fn new(server_id: ServerId, capacity: u64, dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating rtable dir {}", dir.display()))?;
        }
        Ok(Self {
            server_id,
            // Region 0 is the log arena.
            next_id: AtomicU32::new(1),
            inner: Mutex::new(Inner {
                regions: HashMap::new(),
                by_file: HashMap::new(),
                deleted: HashSet::new(),
                bytes_used: 0,
            }),
            capacity,
            dir,
        })
    }

    /// Reserves `size` bytes for a chunk of `(dbname, file_number)`.
    /// Returns the zero-sized sentinel when the capacity budget is spent.
    pub fn allocate(&self, dbname: &str, file_number: u64, size: u64) -> RTableHandle {
        let mut inner = self.inner.lock().unwrap();
        if inner.bytes_used + size > self.capacity {
            debug!(
                "stoc {}: allocation of {size} bytes refused ({} of {} used)",
                self.server_id, inner.bytes_used, self.capacity
            );
            return RTableHandle::default();
        }
        let key = (dbname.to_string(), file_number);
        let id = match inner.by_file.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                inner.by_file.insert(key, id);
                inner.regions.insert(
                    id,
                    Region {
                        dbname: dbname.to_string(),
                        file_number,
                        buf: Vec::new(),
                        persisted: false,
                    },
                );
                id
            }
        };
        inner.bytes_used += size;
        let region = inner.regions.get_mut(&id).expect("region just ensured");
        let offset = region.buf.len() as u64;
        region.buf.resize(region.buf.len() + size as usize, 0);
        RTableHandle {
            server_id: self.server_id,
            rtable_id: id,
            offset,
            size,
        }
    }

    pub fn write(&self, rtable_id: u32, offset: u64, data: &[u8]) -> Result<(), StocError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.deleted.contains(&rtable_id) {
            return Err(StocError::Gone(rtable_id));
        }
        let region = inner
            .regions
            .get_mut(&rtable_id)
            .ok_or(StocError::Gone(rtable_id))?;
        let end = offset as usize + data.len();
        if end > region.buf.len() {
            return Err(StocError::OutOfBounds(rtable_id));
        }
        region.buf[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, rtable_id: u32, offset: u64, size: u64) -> Result<Vec<u8>, StocError> {
        let inner = self.inner.lock().unwrap();
        if inner.deleted.contains(&rtable_id) {
            return Err(StocError::Gone(rtable_id));
        }
        let region = inner
            .regions
            .get(&rtable_id)
            .ok_or(StocError::Gone(rtable_id))?;
        let end = (offset + size) as usize;
        if end > region.buf.len() {
            return Err(StocError::OutOfBounds(rtable_id));
        }
        Ok(region.buf[offset as usize..end].to_vec())
    }

    /// Persists a region to its backing file and returns the handle
    /// covering everything appended so far. Idempotent.
    pub fn persist(&self, rtable_id: u32) -> Result<RTableHandle> {
        let mut inner = self.inner.lock().unwrap();
        let region = match inner.regions.get_mut(&rtable_id) {
            Some(r) => r,
            None => bail!("persist of unknown region {rtable_id}"),
        };
        if let Some(dir) = &self.dir {
            write_region_file(dir, rtable_id, region)?;
        }
        region.persisted = true;
        Ok(RTableHandle {
            server_id: self.server_id,
            rtable_id,
            offset: 0,
            size: region.buf.len() as u64,
        })
    }

    /// Persists every region belonging to `file_number` (FLUSH_SSTABLE).
    pub fn persist_file(&self, file_number: u64) -> Result<Vec<RTableHandle>> {
        let ids: Vec<u32> = {
            let inner = self.inner.lock().unwrap();
            inner
                .regions
                .iter()
                .filter(|(_, r)| r.file_number == file_number)
                .map(|(id, _)| *id)
                .collect()
        };
        ids.into_iter().map(|id| self.persist(id)).collect()
    }

    /// Failure-path release of an allocated, never-persisted buffer.
    /// Releasing a persisted region is a no-op.
    pub fn release(&self, rtable_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        let reclaim = match inner.regions.get(&rtable_id) {
            Some(r) if !r.persisted => r.buf.len() as u64,
            _ => return,
        };
        if let Some(region) = inner.regions.remove(&rtable_id) {
            inner
                .by_file
                .remove(&(region.dbname.clone(), region.file_number));
            inner.bytes_used = inner.bytes_used.saturating_sub(reclaim);
        }
        debug!("stoc {}: released region {rtable_id}", self.server_id);
    }

    /// Drops regions and their backing files; later reads answer `Gone`.
    pub fn delete(&self, tables: &[SSTableRTablePair]) {
        let mut inner = self.inner.lock().unwrap();
        for pair in tables {
            if let Some(region) = inner.regions.remove(&pair.rtable_id) {
                inner.bytes_used = inner.bytes_used.saturating_sub(region.buf.len() as u64);
                inner
                    .by_file
                    .remove(&(region.dbname.clone(), region.file_number));
                if let Some(dir) = &self.dir {
                    let _ = std::fs::remove_file(region_path(dir, pair.rtable_id));
                }
            }
            inner.deleted.insert(pair.rtable_id);
            debug!(
                "stoc {}: deleted region {} (file {})",
                self.server_id, pair.rtable_id, pair.file_number
            );
        }
    }

    /// Reloads persisted regions after a restart. Only regions that saw a
    /// persist response have files, so only those come back.
    pub fn recover(&self) -> Result<usize> {
        let dir = match &self.dir {
            Some(d) => d.clone(),
            None => return Ok(0),
        };
        let mut restored = 0usize;
        let mut max_id = 0u32;
        let mut inner = self.inner.lock().unwrap();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(id) = parse_region_filename(&path) else {
                continue;
            };
            let region = read_region_file(&path)
                .with_context(|| format!("recovering region file {}", path.display()))?;
            max_id = max_id.max(id);
            inner.bytes_used += region.buf.len() as u64;
            inner
                .by_file
                .insert((region.dbname.clone(), region.file_number), id);
            inner.regions.insert(id, region);
            restored += 1;
        }
        drop(inner);
        // Keep ids monotone past everything recovered.
        let next = self.next_id.load(Ordering::SeqCst);
        if max_id + 1 > next {
            self.next_id.store(max_id + 1, Ordering::SeqCst);
        }
        info!(
            "stoc {}: recovered {restored} persisted regions",
            self.server_id
        );
        Ok(restored)
    }

    pub fn bytes_used(&self) -> u64 {
        self.inner.lock().unwrap().bytes_used
    }

    pub fn region_count(&self) -> usize {
        self.inner.lock().unwrap().regions.len()
    }
}

fn region_path(dir: &Path, rtable_id: u32) -> PathBuf {
    dir.join(format!("rtable-{rtable_id:010}.rtb"))
}

fn parse_region_filename(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix("rtable-")?.strip_suffix(".rtb")?;
    id.parse().ok()
}

/// Region file: `[file_number: u64][dbname: varint str][bytes...]`,
/// written to a temp file, fsynced and atomically renamed into place.
fn write_region_file(dir: &Path, rtable_id: u32, region: &Region) -> Result<()> {
    let path = region_path(dir, rtable_id);
    let tmp_path = path.with_extension("rtb.tmp");

    let mut header = Vec::with_capacity(16 + region.dbname.len());
    put_u64(&mut header, region.file_number);
    put_str(&mut header, &region.dbname);

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    f.write_all(&header)?;
    f.write_all(&region.buf)?;
    f.sync_all()?;
    drop(f);

    rename(&tmp_path, &path)?;
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
    Ok(())
}

fn read_region_file(path: &Path) -> Result<Region> {
    let raw = std::fs::read(path)?;
    let mut pos = 0usize;
    let file_number = get_u64(&raw, &mut pos).map_err(|e| anyhow::anyhow!(e))?;
    let dbname = get_str(&raw, &mut pos).map_err(|e| anyhow::anyhow!(e))?;
    Ok(Region {
        dbname,
        file_number,
        buf: raw[pos..].to_vec(),
        persisted: true,
    })
}
