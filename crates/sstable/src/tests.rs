use super::format::{
    build_meta, decode_entries, decode_entry, encode_entry, parse_meta, KeyFilter, TableEntry,
};
use super::MergeIterator;

fn entry(key: &str, seq: u64, value: Option<&str>) -> TableEntry {
    TableEntry {
        seq,
        key: key.as_bytes().to_vec(),
        value: value.map(|v| v.as_bytes().to_vec()),
    }
}

// -------------------- Entry records --------------------

#[test]
fn entry_roundtrip() {
    let entries = vec![
        entry("alpha", 1, Some("one")),
        entry("beta", 2, None), // tombstone
        entry("gamma", 3, Some("")),
    ];
    let mut buf = Vec::new();
    for e in &entries {
        encode_entry(&mut buf, e);
    }
    let decoded = decode_entries(&buf).unwrap();
    assert_eq!(decoded, entries);
}

#[test]
fn entry_encoded_len_matches() {
    let e = entry("key", 9, Some("value"));
    let mut buf = Vec::new();
    encode_entry(&mut buf, &e);
    assert_eq!(buf.len(), e.encoded_len());
}

#[test]
fn entry_crc_detects_corruption() {
    let mut buf = Vec::new();
    encode_entry(&mut buf, &entry("key", 5, Some("value")));
    let last = buf.len() - 1;
    buf[last] ^= 0x40;
    let mut pos = 0;
    assert!(decode_entry(&buf, &mut pos).is_err());
}

#[test]
fn truncated_entry_is_rejected() {
    let mut buf = Vec::new();
    encode_entry(&mut buf, &entry("key", 5, Some("value")));
    buf.truncate(buf.len() - 2);
    let mut pos = 0;
    assert!(decode_entry(&buf, &mut pos).is_err());
}

// -------------------- Key filter --------------------

#[test]
fn filter_has_no_false_negatives() {
    let mut f = KeyFilter::new(1000, 0.01);
    for i in 0..1000 {
        f.insert(format!("key{i}").as_bytes());
    }
    for i in 0..1000 {
        assert!(f.may_contain(format!("key{i}").as_bytes()));
    }
}

#[test]
fn filter_rejects_most_absent_keys() {
    let mut f = KeyFilter::new(1000, 0.01);
    for i in 0..1000 {
        f.insert(format!("key{i}").as_bytes());
    }
    let false_positives = (0..1000)
        .filter(|i| f.may_contain(format!("absent{i}").as_bytes()))
        .count();
    // 1% target; allow generous slack.
    assert!(false_positives < 50, "{false_positives} false positives");
}

#[test]
fn filter_roundtrip() {
    let mut f = KeyFilter::new(100, 0.01);
    f.insert(b"present");
    let mut buf = Vec::new();
    f.encode(&mut buf);
    assert_eq!(buf.len(), f.encoded_len());
    let mut pos = 0;
    let decoded = KeyFilter::decode(&buf, &mut pos).unwrap();
    assert!(decoded.may_contain(b"present"));
    assert_eq!(pos, buf.len());
}

// -------------------- Meta block --------------------

#[test]
fn meta_roundtrip_and_locate() {
    let mut filter = KeyFilter::new(3, 0.01);
    let mut index = Vec::new();
    let mut data = Vec::new();
    for (key, seq) in [("aaa", 1u64), ("bbb", 2), ("ccc", 3)] {
        filter.insert(key.as_bytes());
        index.push((key.as_bytes().to_vec(), data.len() as u64));
        encode_entry(&mut data, &entry(key, seq, Some("v")));
    }

    let meta = build_meta(&filter, &index, data.len() as u64);
    let parsed = parse_meta(&meta).unwrap();
    assert_eq!(parsed.entry_count, 3);
    assert_eq!(parsed.data_len, data.len() as u64);

    // Each located span decodes to exactly its entry.
    for (key, _) in &index {
        let (off, len) = parsed.locate(key).unwrap();
        let mut pos = 0;
        let e = decode_entry(&data[off as usize..(off + len) as usize], &mut pos).unwrap();
        assert_eq!(&e.key, key);
    }
    assert!(parsed.locate(b"zzz").is_none());
}

#[test]
fn parse_meta_rejects_bad_magic() {
    let filter = KeyFilter::new(1, 0.01);
    let mut meta = build_meta(&filter, &[], 0);
    let last = meta.len() - 1;
    meta[last] ^= 0xff;
    assert!(parse_meta(&meta).is_err());
}

// -------------------- Merge --------------------

#[test]
fn merge_orders_and_dedups_by_seq() {
    let run_a = vec![entry("a", 1, Some("a1")), entry("c", 5, Some("c-new"))];
    let run_b = vec![entry("b", 2, Some("b1")), entry("c", 3, Some("c-old"))];

    let merged = MergeIterator::new(vec![run_a, run_b]).collect_all();
    let keys: Vec<&[u8]> = merged.iter().map(|e| e.key.as_slice()).collect();
    assert_eq!(keys, vec![b"a".as_slice(), b"b", b"c"]);
    assert_eq!(merged[2].value.as_deref(), Some(b"c-new".as_slice()));
    assert_eq!(merged[2].seq, 5);
}

#[test]
fn merge_keeps_newest_tombstone() {
    let run_a = vec![entry("k", 2, None)];
    let run_b = vec![entry("k", 1, Some("stale"))];
    let merged = MergeIterator::new(vec![run_a, run_b]).collect_all();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].value, None);
    assert_eq!(merged[0].seq, 2);
}

#[test]
fn merge_of_disjoint_runs_concatenates_sorted() {
    let runs: Vec<Vec<TableEntry>> = (0..4)
        .map(|r| {
            (0..10)
                .map(|i| entry(&format!("key{:02}", r * 10 + i), 1, Some("v")))
                .collect()
        })
        .collect();
    let merged = MergeIterator::new(runs).collect_all();
    assert_eq!(merged.len(), 40);
    let mut keys: Vec<Vec<u8>> = merged.iter().map(|e| e.key.clone()).collect();
    let sorted = {
        let mut s = keys.clone();
        s.sort();
        s
    };
    assert_eq!(keys, sorted);
    keys.dedup();
    assert_eq!(keys.len(), 40);
}

#[test]
fn merge_empty_runs() {
    assert!(MergeIterator::new(vec![]).collect_all().is_empty());
    assert!(MergeIterator::new(vec![vec![], vec![]])
        .collect_all()
        .is_empty());
}
