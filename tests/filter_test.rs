//! Filter：块状态、区间操作、延迟修改、1 位迭代

use std::collections::BTreeSet;

use olap_multi_index::cache::{BlockCache, MemoryBlockCache};
use olap_multi_index::compression::CompressionType;
use olap_multi_index::filter::{BlockStatus, Filter, PendingEdits};
use olap_multi_index::pack_order::PackOrder;
use olap_multi_index::OlapError;
use proptest::prelude::*;

#[test]
fn reset_two_rows_of_a_single_pack() {
    let mut f = Filter::new(10, 4, true).unwrap();
    f.reset(3).unwrap();
    f.reset(7).unwrap();
    assert_eq!(f.count_ones(), 8);
    assert_eq!(f.ones().collect::<Vec<_>>(), vec![0, 1, 2, 4, 5, 6, 8, 9]);
    assert_eq!(f.num_blocks(), 1);
    assert_eq!(f.block_status(0), BlockStatus::Mixed);
}

#[test]
fn partial_last_block_and_normalization() {
    let mut f = Filter::new(40, 4, false).unwrap();
    assert_eq!(f.num_blocks(), 3);
    assert_eq!(f.block_len(2), 8);

    f.set_between(16, 31).unwrap();
    assert_eq!(f.block_status(1), BlockStatus::Full);
    assert_eq!(f.count_ones(), 16);

    for row in 32..40 {
        f.set(row).unwrap();
    }
    assert_eq!(f.block_status(2), BlockStatus::Full);
    f.reset(35).unwrap();
    assert_eq!(f.block_status(2), BlockStatus::Mixed);
    f.set(35).unwrap();
    assert_eq!(f.block_status(2), BlockStatus::Full);
    assert_eq!(f.count_ones(), 24);
    assert_eq!(f.count_ones_between(10, 20), 5);
    assert!(f.is_empty_between(0, 15));
    assert!(f.is_full_between(16, 39));
}

#[test]
fn rejects_power_out_of_range() {
    assert!(matches!(Filter::new(10, 0, true), Err(OlapError::InvalidArgument(_))));
    assert!(matches!(Filter::new(10, 40, true), Err(OlapError::InvalidArgument(_))));
}

#[test]
fn reading_past_extent_is_false() {
    let f = Filter::new(5, 2, true).unwrap();
    assert!(f.get(4));
    assert!(!f.get(5));
    assert!(!f.get(u64::MAX - 1));
}

#[test]
fn delayed_edits_apply_in_call_order() {
    let mut f = Filter::new(64, 4, false).unwrap();
    let mut edits = PendingEdits::new();
    edits.set_delayed(50);
    edits.set_delayed(3);
    edits.reset_delayed(3);
    edits.set_delayed(17);
    assert_eq!(edits.len(), 4);
    f.commit(edits).unwrap();
    assert_eq!(f.ones().collect::<Vec<_>>(), vec![17, 50]);
    assert_eq!(f.count_ones(), 2);
}

#[test]
fn bitmap_growth_past_the_byte_limit_leaves_filter_unchanged() {
    // 每块 16 行 = 8 字节，上限容纳两个 MIXED 块
    let mut f = Filter::new(64, 4, true).unwrap().with_byte_limit(16);
    f.reset(0).unwrap();
    f.reset(16).unwrap();
    assert_eq!(f.bitmap_bytes(), 16);
    let before = f.deep_copy();

    assert!(matches!(f.reset(32), Err(OlapError::OutOfMemory(_))));
    assert!(f.is_equal(&before));
    assert_eq!(f.block_status(2), BlockStatus::Full);

    // 批量提交要么全部生效，要么全不生效
    let mut edits = PendingEdits::new();
    edits.reset_delayed(1);
    edits.reset_delayed(40);
    edits.reset_delayed(50);
    assert!(matches!(f.commit(edits), Err(OlapError::OutOfMemory(_))));
    assert!(f.is_equal(&before));
    assert!(f.get(1));
    assert_eq!(f.count_ones(), 62);

    let mut other = Filter::new(64, 4, false).unwrap();
    other.set(60).unwrap();
    assert!(matches!(f.and_not(&other), Err(OlapError::OutOfMemory(_))));
    assert!(f.is_equal(&before));

    // 已是 MIXED 的块内修改、收缩为 EMPTY 的修改不受影响
    f.reset(1).unwrap();
    f.reset_between(16, 31).unwrap();
    assert_eq!(f.bitmap_bytes(), 8);
    f.reset(32).unwrap();
    assert_eq!(f.bitmap_bytes(), 16);
    assert_eq!(f.count_ones(), 64 - 19);
    f.set_all();
    assert_eq!(f.bitmap_bytes(), 0);
}

#[test]
fn logical_operations() {
    let mut a = Filter::new(48, 4, false).unwrap();
    a.set_between(0, 23).unwrap();
    let mut b = Filter::new(48, 4, false).unwrap();
    b.set_between(20, 47).unwrap();

    let mut and = a.clone();
    and.and(&b).unwrap();
    assert_eq!(and.ones().collect::<Vec<_>>(), vec![20, 21, 22, 23]);

    let mut or = a.clone();
    or.or(&b, None).unwrap();
    assert!(or.is_full());

    let mut diff = a.clone();
    diff.and_not(&b).unwrap();
    assert_eq!(diff.count_ones(), 20);

    let mut not = a.clone();
    not.not();
    assert_eq!(not.count_ones(), 24);
    assert!(!not.get(0));
    assert!(not.get(24));

    // 只对一个块 OR
    let mut one = Filter::new(48, 4, false).unwrap();
    one.or(&b, Some(2)).unwrap();
    assert_eq!(one.count_ones(), 16);
    assert!(one.is_full_block(2));
}

#[test]
fn copies_are_independent() {
    let mut a = Filter::new(32, 4, false).unwrap();
    a.set(5).unwrap();
    let shallow = a.clone();
    let deep = a.deep_copy();
    a.set(6).unwrap();
    assert!(!shallow.get(6));
    assert!(!deep.get(6));
    assert!(shallow.is_equal(&deep));
}

#[test]
fn copy_block_shares_content() {
    let mut src = Filter::new(32, 4, false).unwrap();
    src.set(17).unwrap();
    src.set(20).unwrap();
    let mut dst = Filter::new(32, 4, false).unwrap();
    dst.copy_block(&src, 1).unwrap();
    assert_eq!(dst.count_ones(), 2);
    assert_eq!(dst.count_ones_in_block(1), 2);
    assert!(dst.is_empty_block(0));
}

#[test]
fn ordered_iteration_skips_empty_blocks() {
    let mut f = Filter::new(64, 4, false).unwrap();
    f.set(1).unwrap();
    f.set(40).unwrap();
    f.set(41).unwrap();
    let order = PackOrder::new([2, 0, 1, 3]);
    let rows: Vec<u64> = olap_multi_index::filter::FilterOnesIterator::ordered(&f, &order).collect();
    assert_eq!(rows, vec![40, 41, 1]);
}

#[test]
fn density_weight_prefers_denser_filters() {
    let mut sparse = Filter::new(64, 4, false).unwrap();
    sparse.set(0).unwrap();
    sparse.set(20).unwrap();
    let mut dense = Filter::new(64, 4, false).unwrap();
    dense.set_between(0, 31).unwrap();
    assert!(dense.density_weight() > sparse.density_weight());
    // 只有一个非空块：最大权重
    let mut single = Filter::new(64, 4, false).unwrap();
    single.set(3).unwrap();
    assert_eq!(single.density_weight(), 65537);
}

#[test]
fn spilled_filter_restores_from_cache() {
    let cache = MemoryBlockCache::new();
    let mut f = Filter::new(100, 4, false).unwrap();
    f.set_between(16, 31).unwrap();
    f.set(40).unwrap();
    f.set(97).unwrap();
    f.store_blocks(&cache, 1000, CompressionType::Lz4).unwrap();
    // 清单 + 两个 Mixed 块
    assert_eq!(cache.len(), 3);

    let back = Filter::load_blocks(&cache, 1000).unwrap();
    assert!(back.is_equal(&f));
    assert_eq!(back.block_status(1), BlockStatus::Full);
    assert_eq!(back.ones().collect::<Vec<_>>(), f.ones().collect::<Vec<_>>());

    let mut bytes = cache.load(1003).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    cache.store(1003, bytes).unwrap();
    assert!(Filter::load_blocks(&cache, 1000).is_err());
    assert!(matches!(Filter::load_blocks(&cache, 5), Err(OlapError::BlockNotFound(5))));
}

// ── 随机模型对照 ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Set(u64),
    Reset(u64),
    SetRange(u64, u64),
    ResetRange(u64, u64),
    DelayedSet(u64),
    DelayedReset(u64),
    Commit,
}

fn op(extent: u64) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..extent).prop_map(Op::Set),
        (0..extent).prop_map(Op::Reset),
        (0..extent, 0..extent).prop_map(|(a, b)| Op::SetRange(a.min(b), a.max(b))),
        (0..extent, 0..extent).prop_map(|(a, b)| Op::ResetRange(a.min(b), a.max(b))),
        (0..extent).prop_map(Op::DelayedSet),
        (0..extent).prop_map(Op::DelayedReset),
        Just(Op::Commit),
    ]
}

/// 逐块对照状态：FULL 当且仅当全 1，EMPTY 当且仅当全 0
fn check_blocks(f: &Filter, model: &BTreeSet<u64>) -> Result<(), TestCaseError> {
    let mut mixed = 0u64;
    for b in 0..f.num_blocks() {
        let lo = (b as u64) << f.power();
        let hi = lo + f.block_len(b) as u64;
        let ones = model.range(lo..hi).count() as u64;
        let want = match ones {
            0 => BlockStatus::Empty,
            n if n == hi - lo => BlockStatus::Full,
            _ => BlockStatus::Mixed,
        };
        prop_assert_eq!(f.block_status(b), want, "block {}", b);
        prop_assert_eq!(f.count_ones_in_block(b) as u64, ones);
        if want == BlockStatus::Mixed {
            mixed += 1;
        }
    }
    // power 3：每个 MIXED 块一个 u64
    prop_assert_eq!(f.bitmap_bytes(), mixed * 8);
    Ok(())
}

fn apply(model: &mut BTreeSet<u64>, row: u64, value: bool) {
    if value { model.insert(row); } else { model.remove(&row); }
}

proptest! {
    #[test]
    fn matches_a_set_model(
        all_ones in any::<bool>(),
        ops in prop::collection::vec(op(100), 0..80),
    ) {
        let extent = 100u64;
        let mut f = Filter::new(extent, 3, all_ones).unwrap();
        let mut model: BTreeSet<u64> = if all_ones { (0..extent).collect() } else { BTreeSet::new() };
        let mut edits = PendingEdits::new();
        let mut pending: Vec<(u64, bool)> = Vec::new();
        for op in ops {
            match op {
                Op::Set(r)           => { f.set(r).unwrap(); model.insert(r); }
                Op::Reset(r)         => { f.reset(r).unwrap(); model.remove(&r); }
                Op::SetRange(a, b)   => { f.set_between(a, b).unwrap(); model.extend(a..=b); }
                Op::ResetRange(a, b) => { f.reset_between(a, b).unwrap(); model.retain(|r| *r < a || *r > b); }
                Op::DelayedSet(r)    => { edits.set_delayed(r); pending.push((r, true)); }
                Op::DelayedReset(r)  => { edits.reset_delayed(r); pending.push((r, false)); }
                Op::Commit => {
                    f.commit(std::mem::take(&mut edits)).unwrap();
                    for (r, v) in pending.drain(..) {
                        apply(&mut model, r, v);
                    }
                }
            }
            // 延迟修改在提交前不可见
            check_blocks(&f, &model)?;
        }
        f.commit(edits).unwrap();
        for (r, v) in pending {
            apply(&mut model, r, v);
        }
        check_blocks(&f, &model)?;
        prop_assert_eq!(f.count_ones(), model.len() as u64);
        prop_assert_eq!(f.ones().collect::<Vec<_>>(), model.iter().copied().collect::<Vec<_>>());
    }
}
