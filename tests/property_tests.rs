#![allow(missing_docs)]

use std::collections::BTreeMap;

use bigmap::{BigSortedMap, EngineOptions};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum MapOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Compact,
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    // a narrow alphabet so puts and deletes keep hitting the same keys
    prop::collection::vec(0u8..4, 1..6)
}

fn arb_op() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        6 => (arb_key(), prop::collection::vec(any::<u8>(), 0..48))
            .prop_map(|(key, value)| MapOp::Put { key, value }),
        3 => arb_key().prop_map(|key| MapOp::Delete { key }),
        1 => Just(MapOp::Compact),
    ]
}

fn small_engine() -> BigSortedMap {
    BigSortedMap::open(
        EngineOptions::new()
            .max_block_size(256)
            .initial_block_size(64)
            .track_allocations(true),
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_matches_btreemap_and_stays_ordered(ops in prop::collection::vec(arb_op(), 1..300)) {
        let engine = small_engine();
        let mut reference = BTreeMap::new();
        for op in ops {
            match op {
                MapOp::Put { key, value } => {
                    prop_assert!(engine.put(&key, &value).unwrap());
                    reference.insert(key, value);
                }
                MapOp::Delete { key } => {
                    prop_assert_eq!(engine.delete(&key).unwrap(), reference.remove(&key).is_some());
                }
                MapOp::Compact => {
                    engine.compact_all().unwrap();
                }
            }
        }

        let report = engine.verify().unwrap();
        prop_assert_eq!(report.live_records, reference.len());
        prop_assert_eq!(engine.stats().blocks as usize, engine.block_count());

        let mut scanned = Vec::new();
        if let Some(mut scanner) = engine.scanner(None, None, false).unwrap() {
            while let Some(entry) = scanner.next().unwrap() {
                scanned.push(entry);
            }
        }
        let expected: Vec<(Vec<u8>, Vec<u8>)> = reference.into_iter().collect();
        prop_assert_eq!(scanned, expected);
    }

    #[test]
    fn prop_round_trip(
        entries in prop::collection::btree_map(
            prop::collection::vec(any::<u8>(), 1..24),
            prop::collection::vec(any::<u8>(), 0..96),
            1..120,
        )
    ) {
        let engine = small_engine();
        for (key, value) in &entries {
            prop_assert!(engine.put(key, value).unwrap());
        }
        for (key, value) in &entries {
            let mut buf = vec![0u8; value.len()];
            prop_assert_eq!(engine.get(key, &mut buf).unwrap(), Some(value.len()));
            prop_assert_eq!(&buf, value);
        }
        prop_assert_eq!(engine.len().unwrap(), entries.len() as u64);
    }

    #[test]
    fn prop_bounded_scans_match_range(
        keys in prop::collection::btree_set(any::<u16>(), 1..400),
        a in any::<u16>(),
        b in any::<u16>(),
        reverse in any::<bool>(),
    ) {
        let engine = small_engine();
        for key in &keys {
            engine.put(&key.to_be_bytes(), b"v").unwrap();
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let expected: Vec<u16> = keys.range(lo..hi).copied().collect();
        let got: Vec<u16> = match engine
            .scanner(Some(&lo.to_be_bytes()), Some(&hi.to_be_bytes()), reverse)
            .unwrap()
        {
            None => Vec::new(),
            Some(mut scanner) => {
                let mut out = Vec::new();
                loop {
                    let next = if reverse { scanner.previous() } else { scanner.next() };
                    match next.unwrap() {
                        Some((key, _)) => out.push(u16::from_be_bytes([key[0], key[1]])),
                        None => break,
                    }
                }
                if reverse {
                    out.reverse();
                }
                out
            }
        };
        prop_assert_eq!(got, expected);
    }
}
