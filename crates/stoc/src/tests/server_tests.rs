use sstable::format::{decode_entries, encode_entry, TableEntry};
use wire::{
    CompactionRequest, FileMetaData, LogRecord, Message, RTableHandle, SSTableRTablePair,
};

use crate::server::StocServer;

fn server() -> StocServer {
    StocServer::new(3, 1 << 24, 1 << 20, None).unwrap()
}

fn send(server: &StocServer, msg: Message) -> Option<Message> {
    server
        .handle_message(&msg.encode())
        .unwrap()
        .map(|bytes| Message::decode(&bytes).unwrap())
}

fn entry(key: &str, seq: u64, value: Option<&str>) -> TableEntry {
    TableEntry {
        seq,
        key: key.as_bytes().to_vec(),
        value: value.map(|v| v.as_bytes().to_vec()),
    }
}

/// Stages a table image on the server the way a compute-side writer would:
/// allocate, one-sided write, flush. Returns the file's metadata.
fn stage_table(server: &StocServer, number: u64, entries: &[TableEntry]) -> FileMetaData {
    let mut data = Vec::new();
    for e in entries {
        encode_entry(&mut data, e);
    }
    let handle = match send(
        server,
        Message::AllocateSstableBuffer {
            dbname: "db-0".to_string(),
            file_number: number,
            size: data.len() as u64,
            is_meta: false,
        },
    ) {
        Some(Message::AllocateSstableBufferSucc { handle }) => handle,
        other => panic!("unexpected alloc reply {other:?}"),
    };
    server
        .write_mem(handle.rtable_id, handle.offset, &data)
        .unwrap();
    match send(
        server,
        Message::FlushSstableBuf {
            rtable_id: handle.rtable_id,
            persist: false,
        },
    ) {
        Some(Message::RtablePersistResponse { .. }) => {}
        other => panic!("unexpected flush reply {other:?}"),
    }
    FileMetaData {
        number,
        level: 0,
        file_size: data.len() as u64,
        smallest: entries.first().unwrap().key.clone(),
        largest: entries.last().unwrap().key.clone(),
        data_handles: vec![handle],
        meta_handle: None,
    }
}

// -------------------- SSTable buffer protocol --------------------

#[test]
fn allocate_write_flush_roundtrip() {
    let server = server();
    let meta = stage_table(&server, 9, &[entry("a", 1, Some("v"))]);
    let h = &meta.data_handles[0];
    let bytes = server.read_mem(h.rtable_id, h.offset, h.size).unwrap();
    let decoded = decode_entries(&bytes).unwrap();
    assert_eq!(decoded[0].key, b"a");
}

#[test]
fn combined_write_variant_answers_with_r_tag() {
    let server = server();
    match send(
        &server,
        Message::RtableWriteSstable {
            dbname: "db-0".to_string(),
            file_number: 4,
            size: 128,
            is_meta: false,
        },
    ) {
        Some(Message::RtableWriteSstableResponse { handle }) => {
            assert!(!handle.is_null());
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn flush_sstable_persists_every_region_of_the_file() {
    let server = server();
    stage_table(&server, 12, &[entry("a", 1, Some("v"))]);
    match send(&server, Message::FlushSstable { file_number: 12 }) {
        Some(Message::FlushSstableSucc { handles }) => assert_eq!(handles.len(), 1),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn messaged_read_returns_raw_bytes() {
    let server = server();
    let meta = stage_table(&server, 5, &[entry("k", 2, Some("value"))]);
    let h = meta.data_handles[0];
    let reply = server
        .handle_message(
            &Message::RtableReadBlocks {
                handle: h,
                offset: 0,
                size: h.size,
            }
            .encode(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(decode_entries(&reply).unwrap()[0].key, b"k");

    let legacy = server
        .handle_message(
            &Message::ReadBlocks {
                rtable_id: h.rtable_id,
                offset: 0,
                size: h.size,
            }
            .encode(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(legacy, reply);
}

#[test]
fn delete_tables_makes_reads_gone() {
    let server = server();
    let meta = stage_table(&server, 6, &[entry("k", 1, Some("v"))]);
    let h = meta.data_handles[0];
    assert!(send(
        &server,
        Message::DeleteTables {
            tables: vec![SSTableRTablePair {
                file_number: 6,
                rtable_id: h.rtable_id,
            }],
        },
    )
    .is_none());
    assert!(server.read_mem(h.rtable_id, h.offset, h.size).is_err());
}

// -------------------- Log arena protocol --------------------

#[test]
fn log_buffer_allocate_write_query_read_delete() {
    let server = server();
    let batch = Message::ReplicateLogRecords {
        log_file: "db0-mem1".to_string(),
        records: vec![LogRecord {
            sequence: 1,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
        }],
    }
    .encode();

    let (offset, size) = match send(
        &server,
        Message::AllocateLogBuffer {
            log_file: "db0-mem1".to_string(),
            size: batch.len() as u64,
        },
    ) {
        Some(Message::AllocateLogBufferSucc { offset, size }) => (offset, size),
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(size, batch.len() as u64);
    server.write_mem(0, offset, &batch).unwrap();

    match send(&server, Message::QueryLogFiles { db_id: 0 }) {
        Some(Message::QueryLogFilesResponse { offsets }) => {
            assert_eq!(offsets, vec![("db0-mem1".to_string(), offset)]);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let raw = server
        .handle_message(
            &Message::ReadInMemoryLogFile {
                offset,
                size: batch.len() as u64,
            }
            .encode(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(raw, batch);

    match send(
        &server,
        Message::DeleteLogFile {
            log_file: "db0-mem1".to_string(),
        },
    ) {
        Some(Message::DeleteLogFileSucc { log_file }) => assert_eq!(log_file, "db0-mem1"),
        other => panic!("unexpected reply {other:?}"),
    }
    assert!(!server.arena().holds("db0-mem1"));
}

#[test]
fn replicate_fallback_stages_scannable_frames() {
    let server = server();
    let records = vec![LogRecord {
        sequence: 7,
        key: b"key".to_vec(),
        value: b"value".to_vec(),
    }];
    let msg = Message::ReplicateLogRecords {
        log_file: "db0-mem9".to_string(),
        records: records.clone(),
    };
    assert!(send(&server, msg.clone()).is_none());

    let offsets = server.arena().query("db0-");
    let (_, offset) = &offsets[0];
    let staged = server
        .arena()
        .read(*offset, msg.encode().len() as u64)
        .unwrap();
    match Message::decode(&staged).unwrap() {
        Message::ReplicateLogRecords { records: got, .. } => assert_eq!(got, records),
        other => panic!("unexpected staged bytes {other:?}"),
    }
}

// -------------------- Stats, mapping, violations --------------------

#[test]
fn dc_stats_reports_served_bytes() {
    let server = server();
    stage_table(&server, 1, &[entry("a", 1, Some("v"))]);
    match send(&server, Message::DcReadStats) {
        Some(Message::DcReadStatsResponse { stats }) => {
            assert!(stats.pending_write_bytes > 0);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn filename_mapping_is_retained() {
    let server = server();
    match send(
        &server,
        Message::FilenameRtableId {
            mapping: vec![("000004.sst".to_string(), 2)],
        },
    ) {
        Some(Message::FilenameRtableIdResponse) => {}
        other => panic!("unexpected reply {other:?}"),
    }
    assert_eq!(server.mapped_filenames(), 1);
}

#[test]
fn unknown_tag_is_a_protocol_violation() {
    let server = server();
    assert!(server.handle_message(&[0x7f, 1, 2, 3]).is_err());
}

#[test]
fn response_tagged_message_is_a_protocol_violation() {
    let server = server();
    let msg = Message::RtablePersistResponse {
        handle: RTableHandle::default(),
    };
    assert!(server.handle_message(&msg.encode()).is_err());
}

// -------------------- Remote compaction --------------------

fn numbered_entries(range: std::ops::Range<u32>, seq: u64) -> Vec<TableEntry> {
    range
        .map(|i| entry(&format!("{i:04}"), seq, Some("payload")))
        .collect()
}

fn compaction_outputs(server: &StocServer, req: &CompactionRequest) -> Vec<FileMetaData> {
    match send(
        server,
        Message::Compaction {
            request: req.clone(),
        },
    ) {
        Some(Message::CompactionResponse { outputs }) => outputs,
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn compaction_splits_outputs_at_guides() {
    let server = server();
    // Level 0: 4 files covering [0, 3999]; level 1: 2 files, older seq.
    let l0: Vec<FileMetaData> = (0..4)
        .map(|i| {
            stage_table(
                &server,
                i + 1,
                &numbered_entries((i as u32) * 1000..(i as u32 + 1) * 1000, 10),
            )
        })
        .collect();
    let l1 = vec![
        stage_table(&server, 5, &numbered_entries(0..2000, 1)),
        stage_table(&server, 6, &numbered_entries(2000..4000, 1)),
    ];

    let req = CompactionRequest {
        dbname: "db-0".to_string(),
        smallest_snapshot: 0,
        source_level: 0,
        target_level: 1,
        inputs: [l0, l1],
        guides: vec![b"1000".to_vec(), b"2000".to_vec(), b"3000".to_vec()],
        subranges: Vec::new(),
        outputs: Vec::new(),
    };

    let outputs = compaction_outputs(&server, &req);
    assert_eq!(outputs.len(), 4);

    // Pairwise non-overlapping, union covering [0, 3999], newest seq wins.
    let mut total_entries = 0u64;
    for (i, out) in outputs.iter().enumerate() {
        assert_eq!(out.level, 1);
        assert_eq!(out.smallest, format!("{:04}", i * 1000).into_bytes());
        assert_eq!(out.largest, format!("{:04}", i * 1000 + 999).into_bytes());
        let h = &out.data_handles[0];
        let data = server.registry().read(h.rtable_id, h.offset, h.size).unwrap();
        let entries = decode_entries(&data).unwrap();
        assert!(entries.iter().all(|e| e.seq == 10), "newest seq wins");
        total_entries += entries.len() as u64;
    }
    assert_eq!(total_entries, 4000);

    // Idempotence: an identical plan reproduces numbers and key ranges.
    let again = compaction_outputs(&server, &req);
    assert_eq!(again.len(), outputs.len());
    for (a, b) in outputs.iter().zip(&again) {
        assert_eq!(a.number, b.number);
        assert_eq!(a.smallest, b.smallest);
        assert_eq!(a.largest, b.largest);
    }
}

#[test]
fn compaction_drops_snapshot_dead_tombstones() {
    let server = server();
    let live = stage_table(&server, 1, &numbered_entries(0..10, 5));
    let tombstones: Vec<TableEntry> = (0..5u32)
        .map(|i| entry(&format!("{i:04}"), 8, None))
        .collect();
    let dead = stage_table(&server, 2, &tombstones);

    let req = CompactionRequest {
        dbname: "db-0".to_string(),
        // Every reader past seq 8 — the tombstones are dead.
        smallest_snapshot: 8,
        source_level: 0,
        target_level: 1,
        inputs: [vec![dead, live], Vec::new()],
        guides: Vec::new(),
        subranges: Vec::new(),
        outputs: Vec::new(),
    };
    let outputs = compaction_outputs(&server, &req);
    assert_eq!(outputs.len(), 1);
    let h = &outputs[0].data_handles[0];
    let entries =
        decode_entries(&server.registry().read(h.rtable_id, h.offset, h.size).unwrap()).unwrap();
    // Keys 0..5 were shadowed by dead tombstones and vanish entirely.
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.value.is_some()));
    assert_eq!(entries[0].key, b"0005");
}
