//! End-to-end checks of `BitmapIndex` and `IndexScan` against a plain
//! `BTreeMap` model, plus scan composition and a file-backed image.

use bmx_bitmap::BitmapPage;
use bmx_error::ErrorKind;
use bmx_index::compose::{merge_and, merge_or, probe_and, sorted_positions};
use bmx_index::{
    BTreeValueIndex, BitmapIndex, ColumnStore, CompressedIndex, IndexOptions, RowSource,
    UncompressedIndex,
};
use bmx_page::{BufferPool, BytePageDevice, CacheConfig, DeviceConfig, FileByteDevice};
use bmx_types::{ColumnId, RowId, RowPosition};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const ROWS: u64 = 4000;

fn store() -> Arc<ColumnStore> {
    let store = ColumnStore::new(ColumnId(1));
    for row in 0..ROWS {
        store.append(RowId(row + 100_000)).expect("append");
    }
    Arc::new(store)
}

fn options() -> IndexOptions {
    IndexOptions {
        column: ColumnId(1),
        cache: CacheConfig { frames: 16 },
        ..IndexOptions::default()
    }
}

/// Value of row `pos` in a synthetic column: small cardinality, clustered.
fn value_of(pos: u64) -> u8 {
    ((pos / 37) % 5) as u8
}

fn build<P: BitmapPage>() -> BitmapIndex<u8, P> {
    let mut idx = BitmapIndex::<u8, P>::in_memory(store(), options()).expect("index");
    for pos in 0..ROWS {
        idx.insert(value_of(pos), RowPosition(pos)).expect("insert");
    }
    idx
}

fn expected(low: u8, high: u8) -> Vec<(u8, u64)> {
    let mut out: Vec<(u8, u64)> = (0..ROWS)
        .filter(|pos| (low..=high).contains(&value_of(*pos)))
        .map(|pos| (value_of(pos), pos))
        .collect();
    out.sort_unstable();
    out
}

fn scan_all<P: BitmapPage>(idx: &BitmapIndex<u8, P>, low: u8, high: u8) -> Vec<(u8, u64)> {
    let mut scan = idx.scan(Some(low), Some(high));
    let mut out = Vec::new();
    while let Some(entry) = scan.get_next().expect("get_next") {
        assert_eq!(entry.row_id, RowId(entry.position.0 + 100_000));
        out.push((entry.value, entry.position.0));
    }
    scan.close();
    out
}

#[test]
fn compressed_scan_is_complete_and_ordered() {
    let idx = build::<bmx_bitmap::CompressedBitPage>();
    idx.validate().expect("validate");
    assert_eq!(scan_all(&idx, 0, 4), expected(0, 4));
    assert_eq!(scan_all(&idx, 1, 2), expected(1, 2));
    assert_eq!(scan_all(&idx, 3, 3), expected(3, 3));
}

#[test]
fn uncompressed_scan_is_complete_and_ordered() {
    let idx = build::<bmx_bitmap::BitPage>();
    idx.validate().expect("validate");
    assert_eq!(scan_all(&idx, 0, 4), expected(0, 4));
    assert_eq!(scan_all(&idx, 2, 4), expected(2, 4));
}

#[test]
fn both_formats_agree_after_deletes_and_updates() {
    let mut plain = build::<bmx_bitmap::BitPage>();
    let mut packed = build::<bmx_bitmap::CompressedBitPage>();
    for pos in (0..ROWS).step_by(3) {
        let old = value_of(pos);
        let new = (old + 1) % 5;
        plain.update(&old, new, RowPosition(pos)).expect("update");
        packed.update(&old, new, RowPosition(pos)).expect("update");
    }
    for pos in (0..ROWS).step_by(7) {
        for value in 0..5 {
            plain.delete(&value, RowPosition(pos)).expect("delete");
            packed.delete(&value, RowPosition(pos)).expect("delete");
        }
    }
    packed.validate().expect("validate");
    assert_eq!(scan_all(&plain, 0, 4), scan_all(&packed, 0, 4));

    let plain_stats = plain.stats().expect("stats");
    let packed_stats = packed.stats().expect("stats");
    assert_eq!(plain_stats.ones, packed_stats.ones);
    assert_eq!(plain_stats.distinct_values, 5);
}

#[test]
fn get_position_matches_contains() {
    let idx = build::<bmx_bitmap::CompressedBitPage>();
    let mut scan = idx.scan(Some(1), Some(3));
    scan.reset_position_scan().expect("reset");
    for pos in 0..ROWS {
        let in_range = (1..=3).contains(&value_of(pos));
        assert_eq!(
            scan.get_position(RowPosition(pos)).expect("probe"),
            in_range,
            "position {pos}"
        );
    }
    // Probing backwards after a reset starts over.
    scan.reset_position_scan().expect("reset");
    assert_eq!(
        scan.get_position(RowPosition(37)).expect("probe"),
        value_of(37) == 1
    );
    assert!(!scan.get_position(RowPosition(ROWS * 4)).expect("probe"));
}

#[test]
fn uncompressed_get_position_matches_contains() {
    let mut idx = build::<bmx_bitmap::BitPage>();
    for pos in (0..ROWS).step_by(5) {
        idx.delete(&value_of(pos), RowPosition(pos)).expect("delete");
    }
    let mut scan = idx.scan(Some(0), Some(1));
    scan.reset_position_scan().expect("reset");
    for pos in 0..ROWS + 100 {
        let want = pos < ROWS && pos % 5 != 0 && value_of(pos) <= 1;
        assert_eq!(
            scan.get_position(RowPosition(pos)).expect("probe"),
            want,
            "position {pos}"
        );
    }
}

#[test]
fn probe_and_equals_merge_and() {
    let mut left = UncompressedIndex::<bool>::in_memory(store(), options()).expect("index");
    let mut right = CompressedIndex::<u8>::in_memory(store(), options()).expect("index");
    for pos in 0..ROWS {
        left.insert(pos % 2 == 0, RowPosition(pos)).expect("insert");
        right.insert(value_of(pos), RowPosition(pos)).expect("insert");
    }

    let mut driver = left.point_scan(true);
    let mut probe = right.scan(Some(2), Some(3));
    let probed: Vec<RowPosition> = probe_and(&mut driver, &mut probe)
        .expect("probe_and")
        .into_iter()
        .map(|entry| entry.position)
        .collect();

    let evens = sorted_positions(&mut left.point_scan(true)).expect("evens");
    let mids = sorted_positions(&mut right.scan(Some(2), Some(3))).expect("mids");
    let merged: Vec<RowPosition> = merge_and(evens.clone(), mids.clone()).collect();
    assert_eq!(probed, merged);
    assert!(
        merged
            .iter()
            .all(|p| p.0 % 2 == 0 && (2..=3).contains(&value_of(p.0)))
    );

    let union: Vec<RowPosition> = merge_or(evens.clone(), mids.clone()).collect();
    let model: BTreeSet<RowPosition> = evens.into_iter().chain(mids).collect();
    assert_eq!(union, model.into_iter().collect::<Vec<_>>());
}

#[test]
fn closed_scan_rejects_every_call() {
    let idx = build::<bmx_bitmap::CompressedBitPage>();
    let mut scan = idx.point_scan(0);
    assert!(scan.get_next().expect("get_next").is_some());
    scan.close();
    for err in [
        scan.get_next().map(|_| ()).unwrap_err(),
        scan.get_position(RowPosition(0)).map(|_| ()).unwrap_err(),
        scan.reset_position_scan().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Misuse);
        assert!(!err.is_fatal());
    }
}

#[test]
fn file_backed_index_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("index.img");
    let device = DeviceConfig { pages: 256 };

    let rows = store();
    let (head, allocated) = {
        let pool = BufferPool::new(
            BytePageDevice::new(FileByteDevice::create(&path, device).expect("create"))
                .expect("device"),
            CacheConfig { frames: 4 },
        )
        .expect("pool");
        let mut idx: BitmapIndex<u8, bmx_bitmap::CompressedBitPage> = BitmapIndex::with_parts(
            Box::new(pool),
            BTreeValueIndex::new(),
            Arc::clone(&rows) as Arc<dyn RowSource>,
            options(),
        );
        for pos in 0..ROWS {
            if value_of(pos) == 2 {
                idx.insert(2, RowPosition(pos)).expect("insert");
            }
        }
        idx.flush().expect("flush");
        (
            idx.chain(&2).expect("chain").head(),
            idx.cache().stats().allocated_pages,
        )
    };

    let pool = BufferPool::reopen(
        BytePageDevice::new(FileByteDevice::open(&path).expect("open")).expect("device"),
        CacheConfig { frames: 4 },
        allocated,
    )
    .expect("pool");
    let chain = bmx_chain::ChainManager::<bmx_bitmap::CompressedBitPage>::open(head);
    let mut cursor = chain.cursor();
    let mut found = Vec::new();
    while let Some(pos) = cursor.next_set(&pool).expect("next_set") {
        found.push(pos.0);
    }
    let want: Vec<u64> = (0..ROWS).filter(|pos| value_of(*pos) == 2).collect();
    assert_eq!(found, want);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_workload_matches_model(
        ops in prop::collection::vec((any::<bool>(), 0_u8..4, 0_u64..2500), 1..150),
        low in 0_u8..4,
        span in 0_u8..4,
    ) {
        let high = low.saturating_add(span);
        let mut idx = CompressedIndex::<u8>::in_memory(store(), options()).expect("index");
        let mut model: BTreeMap<u8, BTreeSet<u64>> = BTreeMap::new();
        for (set, value, pos) in ops {
            let changed = if set {
                idx.insert_changed(value, RowPosition(pos)).expect("insert")
            } else {
                idx.delete_changed(&value, RowPosition(pos)).expect("delete")
            };
            let bits = model.entry(value).or_default();
            let model_changed = if set { bits.insert(pos) } else { bits.remove(&pos) };
            prop_assert_eq!(changed, model_changed);
        }
        idx.validate().map_err(|err| TestCaseError::fail(err.to_string()))?;

        let want: Vec<(u8, u64)> = model
            .range(low..=high)
            .flat_map(|(value, bits)| bits.iter().map(move |pos| (*value, *pos)))
            .collect();
        let mut scan = idx.scan(Some(low), Some(high));
        let mut got = Vec::new();
        while let Some(entry) = scan.get_next().expect("get_next") {
            got.push((entry.value, entry.position.0));
        }
        prop_assert_eq!(got, want);

        scan.reset_position_scan().expect("reset");
        let union: BTreeSet<u64> = model.range(low..=high).flat_map(|(_, bits)| bits.iter().copied()).collect();
        for pos in (0..2500).step_by(11) {
            prop_assert_eq!(scan.get_position(RowPosition(pos)).expect("probe"), union.contains(&pos));
        }
    }
}
