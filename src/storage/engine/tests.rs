use super::*;
use crate::storage::operation::{AppendOp, GetOp, IncrementOp};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;

fn small_engine() -> BigSortedMap {
    BigSortedMap::open(
        EngineOptions::new()
            .max_block_size(512)
            .track_allocations(true),
    )
    .unwrap()
}

fn k(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

/// Reports the record a floor lookup lands on.
struct FloorProbe {
    key: Vec<u8>,
    seen: Option<Vec<u8>>,
}

impl Operation for FloorProbe {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn floor_key(&self) -> bool {
        true
    }

    fn read_only(&self) -> bool {
        true
    }

    fn execute(&mut self, found: Option<FoundRecord<'_>>, _updates: &mut Updates) -> Result<bool> {
        self.seen = found.map(|rec| rec.key.to_vec());
        Ok(self.seen.is_some())
    }
}

/// Writes its own key and a second, derived key in one step.
struct PairWrite {
    key: Vec<u8>,
    other: Vec<u8>,
    value: Vec<u8>,
}

impl Operation for PairWrite {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, _found: Option<FoundRecord<'_>>, updates: &mut Updates) -> Result<bool> {
        updates.put(&self.key, &self.value)?;
        updates.put(&self.other, &self.value)?;
        Ok(true)
    }
}

#[test]
fn put_get_delete_round_trip() -> Result<()> {
    let engine = small_engine();
    assert!(engine.put(b"alpha", b"1")?);
    assert!(engine.put(b"beta", b"22")?);
    assert_eq!(engine.get_vec(b"alpha")?, Some(b"1".to_vec()));
    assert!(engine.exists(b"beta")?);
    assert!(!engine.exists(b"gamma")?);
    assert!(engine.put(b"alpha", b"one")?);
    assert_eq!(engine.get_vec(b"alpha")?, Some(b"one".to_vec()));
    assert!(engine.delete(b"alpha")?);
    assert!(!engine.delete(b"alpha")?);
    assert_eq!(engine.get_vec(b"alpha")?, None);
    assert_eq!(engine.len()?, 1);
    Ok(())
}

#[test]
fn get_reports_length_when_buffer_is_short() -> Result<()> {
    let engine = small_engine();
    engine.put(b"key", b"0123456789")?;
    let mut small = [0u8; 4];
    assert_eq!(engine.get(b"key", &mut small)?, Some(10));
    assert_eq!(small, [0u8; 4]);
    let mut exact = [0u8; 10];
    assert_eq!(engine.get(b"key", &mut exact)?, Some(10));
    assert_eq!(&exact, b"0123456789");
    assert_eq!(engine.get(b"missing", &mut exact)?, None);
    Ok(())
}

#[test]
fn invalid_keys_are_errors_and_huge_records_are_refused() -> Result<()> {
    let engine = small_engine();
    assert!(matches!(engine.put(b"", b"v"), Err(BigMapError::Invalid(_))));
    assert!(matches!(engine.get_vec(b""), Err(BigMapError::Invalid(_))));
    assert!(!engine.put(b"big", &[7u8; 600])?);
    assert_eq!(engine.get_vec(b"big")?, None);
    Ok(())
}

#[test]
fn sequential_inserts_split_and_stay_ordered() -> Result<()> {
    let engine = small_engine();
    for i in 0..2_000u32 {
        assert!(engine.put(&k(i), &k(i * 3))?);
    }
    assert!(engine.block_count() > 1);
    for i in 0..2_000u32 {
        assert_eq!(engine.get_vec(&k(i))?, Some(k(i * 3).to_vec()));
    }
    let report = engine.verify()?;
    assert_eq!(report.live_records, 2_000);
    assert_eq!(report.blocks, engine.block_count());
    assert_eq!(engine.total_used_bytes()?, 2_000 * 12);
    let stats = engine.stats();
    assert!(stats.splits > 0);
    assert_eq!(stats.blocks as usize, engine.block_count());
    assert_eq!(stats.live_records, 2_000);
    assert_eq!(stats.data_bytes, 2_000 * 12);
    assert_eq!(stats.allocated_bytes as usize, report.capacity_bytes);
    Ok(())
}

#[test]
fn single_record_blocks_hand_out_fresh_blocks() -> Result<()> {
    let engine = BigSortedMap::open(EngineOptions::new().max_block_size(256))?;
    let value = [1u8; 195];
    assert!(engine.put(b"b", &value)?);
    assert!(engine.put(b"c", &value)?);
    assert!(engine.put(b"a", &value)?);
    assert_eq!(engine.block_count(), 3);
    for key in [b"a", b"b", b"c"] {
        assert_eq!(engine.get_vec(key)?.as_deref(), Some(&value[..]));
    }
    let report = engine.verify()?;
    assert_eq!(report.live_records, 3);
    assert_eq!(engine.stats().blocks, 3);
    Ok(())
}

#[test]
fn memory_ceiling_refuses_writes() -> Result<()> {
    let engine = BigSortedMap::open(
        EngineOptions::new()
            .max_block_size(1024)
            .initial_block_size(64)
            .max_memory(8 * 1024),
    )?;
    let mut accepted = 0u32;
    for i in 0..10_000u32 {
        if !engine.put(&k(i), &[0u8; 8])? {
            break;
        }
        accepted += 1;
    }
    assert!(accepted > 0 && accepted < 10_000);
    assert!(engine.memory_allocated() >= 8 * 1024);
    assert!(engine.stats().rejected_writes >= 1);
    for i in 0..accepted {
        assert!(engine.exists(&k(i))?);
    }
    let mut ctx = WorkerContext::new();
    let mut incr = IncrementOp::new(b"counter", 1);
    assert!(!engine.execute(&mut incr, &mut ctx)?);
    assert!(engine.delete(&k(0))?);
    Ok(())
}

#[test]
fn built_in_operations_read_and_write() -> Result<()> {
    let engine = small_engine();
    let mut ctx = WorkerContext::new();

    let mut incr = IncrementOp::new(b"hits", 2);
    assert!(engine.execute(&mut incr, &mut ctx)?);
    let mut incr = IncrementOp::new(b"hits", 40);
    assert!(engine.execute(&mut incr, &mut ctx)?);
    assert_eq!(incr.result(), 42);
    assert_eq!(engine.get_vec(b"hits")?, Some(b"42".to_vec()));

    let mut append = AppendOp::new(b"log", b"ab");
    engine.execute(&mut append, &mut ctx)?;
    let mut append = AppendOp::new(b"log", b"cd");
    engine.execute(&mut append, &mut ctx)?;
    assert_eq!(append.new_len(), 4);

    let mut get = GetOp::new(b"log");
    assert!(engine.execute(&mut get, &mut ctx)?);
    assert_eq!(get.value(), Some(&b"abcd"[..]));
    let mut get = GetOp::new(b"nothing");
    assert!(!engine.execute(&mut get, &mut ctx)?);
    Ok(())
}

#[test]
fn floor_lookup_walks_left_past_deleted_blocks() -> Result<()> {
    let engine = small_engine();
    for i in 0..600u32 {
        engine.put(&k(i), b"v")?;
    }
    for i in 100..500u32 {
        engine.delete(&k(i))?;
    }
    let mut ctx = WorkerContext::new();
    let mut probe = FloorProbe {
        key: k(450).to_vec(),
        seen: None,
    };
    assert!(engine.execute(&mut probe, &mut ctx)?);
    assert_eq!(probe.seen, Some(k(99).to_vec()));

    let mut probe = FloorProbe {
        key: vec![0, 0, 0],
        seen: None,
    };
    assert!(!engine.execute(&mut probe, &mut ctx)?);
    engine.verify()?;
    Ok(())
}

#[test]
fn two_result_operations_apply_both_writes() -> Result<()> {
    let engine = small_engine();
    for i in 0..400u32 {
        engine.put(&k(i * 2), b"x")?;
    }
    let mut ctx = WorkerContext::new();
    let mut op = PairWrite {
        key: k(11).to_vec(),
        other: k(781).to_vec(),
        value: vec![5u8; 40],
    };
    assert!(engine.execute(&mut op, &mut ctx)?);
    assert_eq!(ctx.updates().len(), 2);
    assert_eq!(engine.get_vec(&k(11))?, Some(vec![5u8; 40]));
    assert_eq!(engine.get_vec(&k(781))?, Some(vec![5u8; 40]));
    engine.verify()?;
    Ok(())
}

#[test]
fn two_result_operations_reach_blocks_on_the_left() -> Result<()> {
    let engine = small_engine();
    for i in 0..400u32 {
        engine.put(&k(i * 2), b"x")?;
    }
    let mut ctx = WorkerContext::new();
    let mut op = PairWrite {
        key: k(781).to_vec(),
        other: k(3).to_vec(),
        value: vec![7u8; 40],
    };
    assert!(engine.execute(&mut op, &mut ctx)?);
    assert_eq!(engine.get_vec(&k(781))?, Some(vec![7u8; 40]));
    assert_eq!(engine.get_vec(&k(3))?, Some(vec![7u8; 40]));
    assert_eq!(engine.len()?, 402);
    engine.verify()?;
    Ok(())
}

fn ceiling_fixture(max_memory: Option<u64>) -> Result<BigSortedMap> {
    let mut options = EngineOptions::new().max_block_size(4096);
    options.max_memory = max_memory;
    let engine = BigSortedMap::open(options)?;
    assert!(engine.put(b"a", &[1u8; 100])?);
    assert!(engine.put(b"z", &[2u8; 4000])?);
    Ok(engine)
}

#[test]
fn ceiling_decides_once_for_all_updates_of_an_operation() -> Result<()> {
    let allocated = ceiling_fixture(None)?.memory_allocated();
    let engine = ceiling_fixture(Some(allocated + 1))?;
    assert_eq!(engine.memory_allocated(), allocated);

    let mut ctx = WorkerContext::new();
    let mut op = PairWrite {
        key: b"b".to_vec(),
        other: b"zz".to_vec(),
        value: vec![3u8; 4000],
    };
    assert!(engine.execute(&mut op, &mut ctx)?);
    assert_eq!(engine.get_vec(b"b")?, Some(vec![3u8; 4000]));
    assert_eq!(engine.get_vec(b"zz")?, Some(vec![3u8; 4000]));
    assert!(engine.memory_allocated() > allocated);

    let mut op = PairWrite {
        key: b"c".to_vec(),
        other: b"zzz".to_vec(),
        value: b"v".to_vec(),
    };
    assert!(!engine.execute(&mut op, &mut ctx)?);
    assert_eq!(engine.get_vec(b"c")?, None);
    assert_eq!(engine.get_vec(b"zzz")?, None);
    engine.verify()?;
    Ok(())
}

#[test]
fn deletes_merge_underfilled_blocks() -> Result<()> {
    let engine = small_engine();
    for i in 0..1_000u32 {
        engine.put(&k(i), &[1u8; 8])?;
    }
    let before = engine.block_count();
    for i in 0..1_000u32 {
        if i % 10 != 0 {
            assert!(engine.delete(&k(i))?);
        }
    }
    assert!(engine.block_count() < before);
    assert!(engine.stats().merges > 0);
    assert_eq!(engine.len()?, 100);
    assert_eq!(engine.stats().blocks as usize, engine.block_count());
    engine.verify()?;
    for i in (0..1_000u32).step_by(10) {
        assert!(engine.exists(&k(i))?);
    }
    Ok(())
}

#[test]
fn delete_range_and_compact_all() -> Result<()> {
    let engine = small_engine();
    for i in 0..300u32 {
        engine.put(&k(i), b"v")?;
    }
    assert_eq!(engine.delete_range(Some(&k(50)), Some(&k(150)))?, 100);
    assert_eq!(engine.delete_range(Some(&k(50)), Some(&k(150)))?, 0);
    assert_eq!(engine.len()?, 200);
    assert!(!engine.exists(&k(50))?);
    assert!(engine.exists(&k(150))?);
    engine.compact_all()?;
    let report = engine.verify()?;
    assert_eq!(report.live_records, 200);
    assert!(report.tombstones <= report.blocks);
    // records here are 4 header + 4 key + 1 value bytes
    assert_eq!(report.live_bytes, 200 * 9);
    assert_eq!(report.used_bytes, (200 + report.tombstones) * 9);
    assert_eq!(engine.delete_range(None, None)?, 200);
    assert!(engine.is_empty()?);
    Ok(())
}

#[test]
fn randomized_workload_matches_reference() -> Result<()> {
    let engine = small_engine();
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xb16_5eed);
    for _ in 0..20_000 {
        let key = k(rng.gen_range(0..2_000)).to_vec();
        if rng.gen_bool(0.35) {
            assert_eq!(engine.delete(&key)?, reference.remove(&key).is_some());
        } else {
            let value = vec![rng.gen::<u8>(); rng.gen_range(0..40)];
            assert!(engine.put(&key, &value)?);
            reference.insert(key, value);
        }
    }
    engine.verify()?;
    assert_eq!(engine.len()?, reference.len() as u64);
    let mut scanner = engine.scanner(None, None, false)?.unwrap();
    for (key, value) in &reference {
        let (got_key, got_value) = scanner.next()?.unwrap();
        assert_eq!(&got_key, key);
        assert_eq!(&got_value, value);
    }
    assert!(scanner.next()?.is_none());
    Ok(())
}
