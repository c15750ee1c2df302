use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatch::RdmaStore;
use wire::{LogRecord, Message, SSTableRTablePair};

use super::mock::{MockFabric, MockNode};
use crate::{spawn_async_workers, CcClient, CcError, WriteState};

fn setup(nodes: &[Arc<MockNode>], num_workers: usize) -> CcClient {
    let nodes = nodes.to_vec();
    let workers = spawn_async_workers(
        num_workers,
        |_id| MockFabric::new(nodes.clone()) as Arc<dyn RdmaStore>,
        64 * 1024,
        256,
    );
    CcClient::new(workers)
}

fn records(n: u64) -> Vec<LogRecord> {
    (0..n)
        .map(|i| LogRecord {
            sequence: i + 1,
            key: format!("key{i}").into_bytes(),
            value: format!("value{i}").into_bytes(),
        })
        .collect()
}

// -------------------- SSTable chunk write + read --------------------

#[test]
fn write_data_blocks_persists_and_reads_back() {
    let node = MockNode::new(1);
    let mut client = setup(&[Arc::clone(&node)], 1);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let req = client
        .initiate_rtable_write_data_blocks(1, "db-0", 17, payload.clone(), false)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
    let handle = resp.handle.expect("persist response carries the handle");
    assert_eq!(handle.size, payload.len() as u64);
    assert_eq!(node.region_bytes(handle.rtable_id).unwrap(), payload);

    // Read a slice of it back through the one-sided read path.
    let req = client
        .initiate_rtable_read_data_block(&handle, 100, 200)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
    assert_eq!(resp.bytes, payload[100..300].to_vec());
}

#[test]
fn allocation_failure_is_retryable() {
    let node = MockNode::new(1);
    node.fail_allocs
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let mut client = setup(&[Arc::clone(&node)], 1);

    let req = client
        .initiate_rtable_write_data_blocks(1, "db-0", 1, vec![7u8; 128], false)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(resp.failed, "null handle must surface as a failure");

    // The caller's retry succeeds once the StoC has space again.
    let req = client
        .initiate_rtable_write_data_blocks(1, "db-0", 1, vec![7u8; 128], false)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
}

#[test]
fn read_of_deleted_region_reports_gone() {
    let node = MockNode::new(1);
    let mut client = setup(&[Arc::clone(&node)], 1);

    let req = client
        .initiate_rtable_write_data_blocks(1, "db-0", 5, vec![1u8; 256], false)
        .unwrap();
    let handle = client.wait(req).unwrap().handle.unwrap();

    node.delete_region(handle.rtable_id);

    let req = client
        .initiate_rtable_read_data_block(&handle, 0, 256)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(resp.failed, "stale handle read must fail with the gone kind");
}

// -------------------- Log replication --------------------

#[test]
fn replicate_reaches_all_replicas() {
    let nodes: Vec<_> = (1..=3).map(MockNode::new).collect();
    let mut client = setup(&nodes, 2);

    let states = Arc::new(Mutex::new(vec![WriteState::None; 3]));
    let recs = records(10);
    let req = client
        .initiate_replicate_log_records("db0-mem1", &[1, 2, 3], recs.clone(), Arc::clone(&states))
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
    assert!(states
        .lock()
        .unwrap()
        .iter()
        .all(|s| *s == WriteState::WriteSuccess));

    // Every replica's buffer holds the self-describing batch.
    for node in &nodes {
        let batch = Message::ReplicateLogRecords {
            log_file: "db0-mem1".to_string(),
            records: recs.clone(),
        }
        .encode();
        let written = node.log_bytes(0, batch.len());
        match Message::decode(&written).unwrap() {
            Message::ReplicateLogRecords { records, log_file } => {
                assert_eq!(log_file, "db0-mem1");
                assert_eq!(records, recs);
            }
            other => panic!("unexpected buffer contents: {other:?}"),
        }
    }
}

#[test]
fn replicate_with_failed_replica_stays_incomplete_then_retries() {
    let nodes: Vec<_> = (1..=3).map(MockNode::new).collect();
    nodes[1]
        .fail_writes
        .store(1, std::sync::atomic::Ordering::SeqCst);
    let mut client = setup(&nodes, 1);

    let states = Arc::new(Mutex::new(vec![WriteState::None; 3]));
    let req = client
        .initiate_replicate_log_records("db0-mem2", &[1, 2, 3], records(4), Arc::clone(&states))
        .unwrap();

    let mut resp = Default::default();
    let done = client
        .is_done(req, &mut resp, Some(Duration::from_millis(200)))
        .unwrap();
    assert!(!done, "call must not complete while a replica is short");
    {
        let s = states.lock().unwrap();
        assert_eq!(s[0], WriteState::WriteSuccess);
        assert_eq!(s[1], WriteState::None, "failed replica reverts");
        assert_eq!(s[2], WriteState::WriteSuccess);
    }
    client.abandon(req);

    // Retry drives only the failed replica; the call now completes.
    let req = client
        .initiate_replicate_log_records("db0-mem2", &[1, 2, 3], records(4), Arc::clone(&states))
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
    assert!(states
        .lock()
        .unwrap()
        .iter()
        .all(|s| *s == WriteState::WriteSuccess));
}

#[test]
fn close_log_file_awaits_every_ack() {
    let nodes: Vec<_> = (1..=3).map(MockNode::new).collect();
    let mut client = setup(&nodes, 1);

    let req = client
        .initiate_close_log_file("db0-mem1", &[1, 2, 3])
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
}

#[test]
fn query_and_read_log_file_roundtrip() {
    let node = MockNode::new(1);
    let mut client = setup(&[Arc::clone(&node)], 1);

    let recs = records(3);
    let states = Arc::new(Mutex::new(vec![WriteState::None]));
    let req = client
        .initiate_replicate_log_records("db0-mem7", &[1], recs.clone(), states)
        .unwrap();
    client.wait(req).unwrap();

    let req = client.initiate_query_log_files(1, 0).unwrap();
    let resp = client.wait(req).unwrap();
    let (name, offset) = resp.log_offsets[0].clone();
    assert_eq!(name, "db0-mem7");

    let batch = Message::ReplicateLogRecords {
        log_file: "db0-mem7".to_string(),
        records: recs.clone(),
    }
    .encode();
    let req = client
        .initiate_read_in_memory_log_file(1, offset, batch.len() as u64)
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
    match Message::decode(&resp.bytes).unwrap() {
        Message::ReplicateLogRecords { records, .. } => assert_eq!(records, recs),
        other => panic!("unexpected log contents: {other:?}"),
    }
}

// -------------------- Fire-and-forget + stats --------------------

#[test]
fn delete_tables_completes_at_send() {
    let node = MockNode::new(1);
    let mut client = setup(&[node], 1);

    let req = client
        .initiate_delete_tables(
            1,
            vec![SSTableRTablePair {
                file_number: 4,
                rtable_id: 2,
            }],
        )
        .unwrap();
    let resp = client.wait(req).unwrap();
    assert!(!resp.failed);
}

#[test]
fn dc_stats_round_trip() {
    let node = MockNode::new(1);
    let mut client = setup(&[node], 1);

    let req = client.initiate_read_dc_stats(1).unwrap();
    let resp = client.wait(req).unwrap();
    let stats = resp.stats.unwrap();
    assert_eq!(stats.queue_depth, 2);
    assert_eq!(stats.pending_read_bytes, 100);
}

// -------------------- Facade bookkeeping --------------------

#[test]
fn unknown_request_id_is_an_error() {
    let node = MockNode::new(1);
    let mut client = setup(&[node], 1);
    let mut resp = Default::default();
    assert_eq!(
        client.is_done(999, &mut resp, None),
        Err(CcError::UnknownRequest(999))
    );
}

#[test]
fn abandoned_requests_are_swept() {
    let node = MockNode::new(1);
    let mut client = setup(&[node], 1);

    let req = client.initiate_read_dc_stats(1).unwrap();
    client.abandon(req);
    std::thread::sleep(Duration::from_millis(100));

    // The next initiate sweeps the completed abandoned slot.
    let req2 = client.initiate_read_dc_stats(1).unwrap();
    assert_eq!(client.pending_requests(), 1);
    client.wait(req2).unwrap();
    assert_eq!(client.pending_requests(), 0);
}

#[test]
fn concurrent_reads_across_workers_keep_payloads_straight() {
    let node = MockNode::new(1);
    let mut client = setup(&[Arc::clone(&node)], 4);

    // Seed distinct regions.
    let mut handles = Vec::new();
    for i in 0..8u8 {
        let req = client
            .initiate_rtable_write_data_blocks(1, "db-0", u64::from(i), vec![i; 512], false)
            .unwrap();
        handles.push(client.wait(req).unwrap().handle.unwrap());
    }

    // Fire a burst of reads and collect them out of order.
    let reqs: Vec<(u32, u8)> = (0..64u32)
        .map(|i| {
            let which = (i % 8) as u8;
            let req = client
                .initiate_rtable_read_data_block(&handles[which as usize], 0, 512)
                .unwrap();
            (req, which)
        })
        .collect();
    for (req, which) in reqs {
        let resp = client.wait(req).unwrap();
        assert!(!resp.failed);
        assert!(resp.bytes.iter().all(|b| *b == which));
    }
}
