//! End-to-end scenarios over the loopback fabric: chunked writes, prefetch
//! reads, replica failure handling, concurrent read storms, remote
//! compaction, deletion and StoC restart.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client::{spawn_async_workers, CcClient, CcResponse, WriteState};
use mempool::MemPool;
use sstable::format::decode_entries;
use sstable::{RemoteSstReader, SstMemFile};
use stoc::{MemFabric, StocServer};
use wire::{CompactionRequest, LogRecord, Message, SSTableRTablePair};

const STOC_CAPACITY: u64 = 256 * 1024 * 1024;
const LOG_CAPACITY: u64 = 16 * 1024 * 1024;

fn boot(num_stocs: u32, num_workers: usize, dir: Option<&Path>) -> (MemFabric, CcClient) {
    let fabric = MemFabric::new();
    for i in 0..num_stocs {
        let id = i + 1;
        let stoc_dir = dir.map(|d| d.join(format!("stoc-{id}")));
        let server = StocServer::new(id, STOC_CAPACITY, LOG_CAPACITY, stoc_dir).unwrap();
        server.recover().unwrap();
        fabric.register(Arc::new(server));
    }
    let fabric_for_workers = fabric.clone();
    let workers = spawn_async_workers(
        num_workers,
        |_id| fabric_for_workers.store_for_worker(),
        64 * 1024,
        1024,
    );
    (fabric, CcClient::new(workers))
}

fn pattern_byte(i: usize) -> u8 {
    ((i * 7 + 13) % 251) as u8
}

/// Builds a table image of `data_len` patterned bytes in 4 KiB appends and
/// ships it with the given chunk size. Returns the writer, persisted.
fn write_patterned_file(
    cc: &mut CcClient,
    pool: &MemPool,
    file_number: u64,
    data_len: usize,
    chunk_size: usize,
) -> SstMemFile {
    let mut writer = SstMemFile::new(
        pool,
        "db0",
        file_number,
        1,
        data_len + 64 * 1024,
        16,
        chunk_size,
    );
    let mut block = vec![0u8; 4096];
    let mut written = 0usize;
    while written < data_len {
        let n = (data_len - written).min(4096);
        for (j, b) in block[..n].iter_mut().enumerate() {
            *b = pattern_byte(written + j);
        }
        writer.append(&block[..n]).unwrap();
        written += n;
    }
    writer.format().unwrap();
    writer.finalize(cc).unwrap();
    writer.wait_for_persisting_data_blocks(cc).unwrap();
    writer
}

// -------------------- S1: chunked write + byte-exact readback --------------------

#[test]
fn one_mib_file_chunks_persist_and_read_back() {
    let (_fabric, mut cc) = boot(1, 2, None);
    let pool = MemPool::with_default_classes();

    let data_len = 1024 * 1024;
    let writer = write_patterned_file(&mut cc, &pool, 1, data_len, 64 * 1024);

    // 16 data chunks + 1 meta chunk, handles in chunk order.
    let handles = writer.rhs();
    assert_eq!(handles.len(), 17);
    let meta = writer.into_file_meta(0).unwrap();
    assert_eq!(meta.data_handles.len(), 16);
    assert_eq!(
        meta.data_handles.iter().map(|h| h.size).sum::<u64>(),
        data_len as u64
    );

    // concat(read(h)) over the data handles reproduces the original image.
    let mut readback = Vec::with_capacity(data_len);
    for h in &meta.data_handles {
        let req = cc.initiate_rtable_read_data_block(h, 0, h.size).unwrap();
        let resp = cc.wait(req).unwrap();
        assert!(!resp.failed);
        readback.extend_from_slice(&resp.bytes);
    }
    assert_eq!(readback.len(), data_len);
    assert!(readback
        .iter()
        .enumerate()
        .all(|(i, b)| *b == pattern_byte(i)));
}

// -------------------- S2: prefetch-all pointer-math reads --------------------

#[test]
fn prefetch_read_resolves_logical_offsets_across_handles() {
    let (_fabric, mut cc) = boot(1, 2, None);
    let pool = MemPool::with_default_classes();

    // 256 KiB of data in 100/100/56 KiB chunks + 1 meta chunk.
    let writer = write_patterned_file(&mut cc, &pool, 2, 256 * 1024, 100 * 1024);
    let meta = writer.into_file_meta(0).unwrap();
    assert_eq!(meta.data_handles.len(), 3);
    assert_eq!(meta.data_handles[0].size, 100 * 1024);
    assert_eq!(meta.data_handles[2].size, 56 * 1024);

    let reader = RemoteSstReader::new(meta.clone(), &mut cc, &pool, true).unwrap();

    // The read crosses from the second into the third chunk; any handle
    // works because prefetched reads are logical.
    let any_handle = meta.data_handles[0];
    let bytes = reader.read(&mut cc, &any_handle, 120_000, 8).unwrap();
    let expected: Vec<u8> = (120_000..120_008).map(pattern_byte).collect();
    assert_eq!(bytes, expected);

    // Same answer straddling the 100 KiB boundary exactly.
    let bytes = reader.read(&mut cc, &any_handle, 102_396, 16).unwrap();
    let expected: Vec<u8> = (102_396..102_412).map(pattern_byte).collect();
    assert_eq!(bytes, expected);
}

// -------------------- S3: replica failure leaves the call incomplete --------------------

#[test]
fn replicate_with_one_failed_replica_completes_only_after_retry() {
    let (fabric, mut cc) = boot(3, 1, None);
    fabric.fail_next_writes(2, 1);

    let records: Vec<LogRecord> = (0..10)
        .map(|i| LogRecord {
            sequence: i + 1,
            key: format!("key{i}").into_bytes(),
            value: format!("value{i}").into_bytes(),
        })
        .collect();
    let states = Arc::new(Mutex::new(vec![WriteState::None; 3]));

    let req = cc
        .initiate_replicate_log_records("db0-mem1", &[1, 2, 3], records.clone(), states.clone())
        .unwrap();
    let mut resp = CcResponse::default();
    let done = cc
        .is_done(req, &mut resp, Some(Duration::from_millis(300)))
        .unwrap();
    assert!(!done, "the call must stay incomplete");
    {
        let s = states.lock().unwrap();
        assert_eq!(s[0], WriteState::WriteSuccess);
        assert_eq!(s[1], WriteState::None);
        assert_eq!(s[2], WriteState::WriteSuccess);
    }
    cc.abandon(req);

    // Retry re-drives only replica 2.
    let req = cc
        .initiate_replicate_log_records("db0-mem1", &[1, 2, 3], records.clone(), states.clone())
        .unwrap();
    let resp = cc.wait(req).unwrap();
    assert!(!resp.failed);
    assert!(states
        .lock()
        .unwrap()
        .iter()
        .all(|s| *s == WriteState::WriteSuccess));

    // Every replica now holds the self-describing batch. Replica 2's
    // first slot belongs to the failed write, so scan the latest one.
    for id in 1..=3 {
        let node = fabric.node(id).unwrap();
        assert!(node.arena().holds("db0-mem1"));
        let (offset, _) = *node.arena().slots("db0-mem1").last().unwrap();
        let staged = node
            .arena()
            .read(
                offset,
                Message::ReplicateLogRecords {
                    log_file: "db0-mem1".to_string(),
                    records: records.clone(),
                }
                .encode()
                .len() as u64,
            )
            .unwrap();
        match Message::decode(&staged).unwrap() {
            Message::ReplicateLogRecords { records: got, .. } => assert_eq!(got, records),
            other => panic!("unexpected staged bytes: {other:?}"),
        }
    }
}

// -------------------- S4: concurrent read storm --------------------

#[test]
fn thousand_concurrent_reads_across_workers_return_correct_payloads() {
    let (_fabric, mut cc) = boot(1, 4, None);
    let pool = MemPool::with_default_classes();

    let data_len = 512 * 1024;
    let writer = write_patterned_file(&mut cc, &pool, 3, data_len, 64 * 1024);
    let meta = writer.into_file_meta(0).unwrap();

    // Issue all reads before collecting any: offsets stride over the data
    // handles so every worker sees traffic.
    let mut pending = Vec::with_capacity(1000);
    for i in 0..1000usize {
        let handle = &meta.data_handles[i % meta.data_handles.len()];
        let offset = ((i * 131) % (64 * 1024 - 64)) as u64;
        let req = cc
            .initiate_rtable_read_data_block(handle, offset, 64)
            .unwrap();
        pending.push((req, *handle, offset));
    }
    for (req, handle, offset) in pending {
        let resp = cc.wait(req).unwrap();
        assert!(!resp.failed);
        // Translate the handle-relative offset back to the logical image.
        let logical = meta
            .data_handles
            .iter()
            .take_while(|h| h.rtable_id != handle.rtable_id || h.offset != handle.offset)
            .map(|h| h.size)
            .sum::<u64>()
            + offset;
        let expected: Vec<u8> = (logical..logical + 64)
            .map(|i| pattern_byte(i as usize))
            .collect();
        assert_eq!(resp.bytes, expected);
    }
}

// -------------------- S5: guided remote compaction --------------------

fn write_entry_file(
    cc: &mut CcClient,
    pool: &MemPool,
    file_number: u64,
    range: std::ops::Range<u32>,
    seq: u64,
    level: u32,
) -> wire::FileMetaData {
    let mut writer = SstMemFile::new(pool, "db0", file_number, 1, 1 << 20, range.len(), 64 * 1024);
    for i in range {
        writer
            .add(format!("{i:04}").as_bytes(), seq, Some(b"payload".as_slice()))
            .unwrap();
    }
    writer.format().unwrap();
    writer.finalize(cc).unwrap();
    writer.wait_for_persisting_data_blocks(cc).unwrap();
    writer.into_file_meta(level).unwrap()
}

#[test]
fn compaction_outputs_partition_the_key_space() {
    let (_fabric, mut cc) = boot(1, 2, None);
    let pool = MemPool::with_default_classes();

    let l0: Vec<_> = (0..4)
        .map(|i| {
            write_entry_file(
                &mut cc,
                &pool,
                i + 1,
                (i as u32) * 1000..(i as u32 + 1) * 1000,
                10,
                0,
            )
        })
        .collect();
    let l1 = vec![
        write_entry_file(&mut cc, &pool, 5, 0..2000, 1, 1),
        write_entry_file(&mut cc, &pool, 6, 2000..4000, 1, 1),
    ];

    let request = CompactionRequest {
        dbname: "db0".to_string(),
        smallest_snapshot: 0,
        source_level: 0,
        target_level: 1,
        inputs: [l0, l1],
        guides: vec![b"1000".to_vec(), b"2000".to_vec(), b"3000".to_vec()],
        subranges: Vec::new(),
        outputs: Vec::new(),
    };
    let req = cc.initiate_compaction(1, request).unwrap();
    let resp = cc.wait(req).unwrap();
    assert!(!resp.failed);

    let mut outputs = resp.outputs;
    outputs.sort_by(|a, b| a.smallest.cmp(&b.smallest));
    assert_eq!(outputs.len(), 4);
    for (i, out) in outputs.iter().enumerate() {
        assert_eq!(out.smallest, format!("{:04}", i * 1000).into_bytes());
        assert_eq!(out.largest, format!("{:04}", i * 1000 + 999).into_bytes());
        if i > 0 {
            assert!(
                outputs[i - 1].largest < out.smallest,
                "outputs must be pairwise non-overlapping"
            );
        }
    }

    // The winning entries are the seq-10 level-0 versions.
    let h = &outputs[0].data_handles[0];
    let req = cc.initiate_rtable_read_data_block(h, 0, h.size).unwrap();
    let resp = cc.wait(req).unwrap();
    let entries = decode_entries(&resp.bytes).unwrap();
    assert_eq!(entries.len(), 1000);
    assert!(entries.iter().all(|e| e.seq == 10));
}

// -------------------- S6: deletion makes handles gone --------------------

#[test]
fn deleted_table_reads_fail_with_gone() {
    let (_fabric, mut cc) = boot(1, 1, None);
    let pool = MemPool::with_default_classes();

    let writer = write_patterned_file(&mut cc, &pool, 7, 64 * 1024, 64 * 1024);
    let meta = writer.into_file_meta(0).unwrap();
    let handle = meta.data_handles[0];

    // Sanity: readable before deletion.
    let req = cc.initiate_rtable_read_data_block(&handle, 0, 64).unwrap();
    assert!(!cc.wait(req).unwrap().failed);

    let pairs: Vec<SSTableRTablePair> = meta
        .handles()
        .map(|h| SSTableRTablePair {
            file_number: meta.number,
            rtable_id: h.rtable_id,
        })
        .collect();
    let req = cc.initiate_delete_tables(1, pairs).unwrap();
    assert!(!cc.wait(req).unwrap().failed);

    let req = cc.initiate_rtable_read_data_block(&handle, 0, 64).unwrap();
    let resp = cc.wait(req).unwrap();
    assert!(resp.failed, "stale handle must read as gone");
}

// -------------------- Handle stability across StoC restart --------------------

#[test]
fn persisted_handles_survive_stoc_restart() {
    let dir = tempfile::tempdir().unwrap();
    let pool = MemPool::with_default_classes();

    let (meta, image) = {
        let (_fabric, mut cc) = boot(1, 1, Some(dir.path()));
        let writer = write_patterned_file(&mut cc, &pool, 11, 128 * 1024, 64 * 1024);
        let meta = writer.into_file_meta(0).unwrap();
        let image: Vec<u8> = (0..128 * 1024).map(pattern_byte).collect();
        (meta, image)
        // Dropping the client joins the workers; the fabric and its StoC
        // go down with this scope.
    };

    // A fresh StoC over the same directory recovers the persisted regions.
    let (_fabric, mut cc) = boot(1, 1, Some(dir.path()));
    let mut readback = Vec::new();
    for h in &meta.data_handles {
        let req = cc.initiate_rtable_read_data_block(h, 0, h.size).unwrap();
        let resp = cc.wait(req).unwrap();
        assert!(!resp.failed, "persisted handle must survive restart");
        readback.extend_from_slice(&resp.bytes);
    }
    assert_eq!(readback, image);
}

// -------------------- Recovery: query + scan a replica's log --------------------

#[test]
fn log_files_are_discoverable_and_scannable_after_replication() {
    let (_fabric, mut cc) = boot(2, 1, None);

    let records: Vec<LogRecord> = (0..5)
        .map(|i| LogRecord {
            sequence: i + 1,
            key: format!("k{i}").into_bytes(),
            value: format!("v{i}").into_bytes(),
        })
        .collect();
    let states = Arc::new(Mutex::new(vec![WriteState::None; 2]));
    let req = cc
        .initiate_replicate_log_records("db0-mem4", &[1, 2], records.clone(), states)
        .unwrap();
    assert!(!cc.wait(req).unwrap().failed);

    let req = cc.initiate_query_log_files(1, 0).unwrap();
    let resp = cc.wait(req).unwrap();
    let (name, offset) = resp.log_offsets[0].clone();
    assert_eq!(name, "db0-mem4");

    let batch_len = Message::ReplicateLogRecords {
        log_file: "db0-mem4".to_string(),
        records: records.clone(),
    }
    .encode()
    .len() as u64;
    let req = cc
        .initiate_read_in_memory_log_file(1, offset, batch_len)
        .unwrap();
    let resp = cc.wait(req).unwrap();
    match Message::decode(&resp.bytes).unwrap() {
        Message::ReplicateLogRecords { records: got, .. } => assert_eq!(got, records),
        other => panic!("unexpected log contents: {other:?}"),
    }

    // Closing the log deletes it on every replica.
    let req = cc.initiate_close_log_file("db0-mem4", &[1, 2]).unwrap();
    assert!(!cc.wait(req).unwrap().failed);
    let req = cc.initiate_query_log_files(1, 0).unwrap();
    assert!(cc.wait(req).unwrap().log_offsets.is_empty());
}
