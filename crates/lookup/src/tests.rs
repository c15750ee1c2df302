use super::*;
use std::sync::Arc;
use std::thread;

#[test]
fn insert_then_lookup() {
    let idx = LookupIndex::new(128);
    let h = key_hash(b"user1000");
    assert_eq!(idx.lookup(h), NO_LOCATION);
    idx.insert(h, 7);
    assert_eq!(idx.lookup(h), 7);
}

#[test]
fn cas_succeeds_from_expected_value() {
    let idx = LookupIndex::new(128);
    let h = key_hash(b"k");
    idx.insert(h, 3);
    assert!(idx.cas(h, 3, 9));
    assert_eq!(idx.lookup(h), 9);
}

#[test]
fn cas_fails_on_stale_expectation() {
    let idx = LookupIndex::new(128);
    let h = key_hash(b"k");
    idx.insert(h, 3);
    assert!(!idx.cas(h, 1, 9));
    assert_eq!(idx.lookup(h), 3);
}

#[test]
fn concurrent_cas_has_exactly_one_winner() {
    // Both threads try to move the same slot 5 -> their id. Exactly one
    // compare-exchange may succeed, and the loser must then observe the
    // winner's value.
    for _ in 0..100 {
        let idx = Arc::new(LookupIndex::new(64));
        let h = key_hash(b"contended");
        idx.insert(h, 5);

        let a = {
            let idx = Arc::clone(&idx);
            thread::spawn(move || idx.cas(h, 5, 10))
        };
        let b = {
            let idx = Arc::clone(&idx);
            thread::spawn(move || idx.cas(h, 5, 20))
        };
        let won_a = a.join().unwrap();
        let won_b = b.join().unwrap();

        assert!(won_a ^ won_b, "exactly one CAS must win");
        let expected = if won_a { 10 } else { 20 };
        assert_eq!(idx.lookup(h), expected);
    }
}

#[test]
fn encode_decode_snapshot() {
    let idx = LookupIndex::new(16);
    idx.insert(key_hash(b"a"), 1);
    idx.insert(key_hash(b"b"), 2);

    let mut buf = Vec::new();
    idx.encode(&mut buf);
    let restored = LookupIndex::decode(&buf).unwrap();
    assert_eq!(restored.size(), 16);
    assert_eq!(restored.lookup(key_hash(b"a")), 1);
    assert_eq!(restored.lookup(key_hash(b"b")), 2);
}

#[test]
fn decode_rejects_short_buffer() {
    assert!(LookupIndex::decode(&[1, 0]).is_none());
    let mut buf = Vec::new();
    LookupIndex::new(8).encode(&mut buf);
    buf.truncate(buf.len() - 1);
    assert!(LookupIndex::decode(&buf).is_none());
}
