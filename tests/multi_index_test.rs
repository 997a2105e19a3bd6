//! MultiIndex：维度笛卡尔积、元组数、组划分、闸门与锁、过滤

use std::sync::Arc;

use olap_multi_index::pack_order::PackOrder;
use olap_multi_index::{
    DimensionVector, Filter, GroupKind, MIIterator, MultiIndex, MultiIndexConfig, OlapError, QueryContext,
};

fn ctx(power: u32) -> Arc<QueryContext> {
    QueryContext::new(MultiIndexConfig::default().with_pack_power(power).with_worker_threads(2)).unwrap()
}

fn exact_ctx(power: u32) -> Arc<QueryContext> {
    QueryContext::new(MultiIndexConfig::default().with_pack_power(power).with_rough_sort(false)).unwrap()
}

/// 每个维度恰好属于一个组，且逐个数出的元组数与 num_tuples 一致
fn assert_partition(mind: &MultiIndex) {
    let mut seen = vec![0usize; mind.num_dimensions()];
    for g in mind.groups() {
        for d in g.dims() {
            seen[d] += 1;
        }
    }
    assert!(seen.iter().all(|n| *n == 1), "dimension coverage {seen:?}");
    for d in 0..mind.num_dimensions() {
        let gi = mind.group_index(d).unwrap();
        assert!(mind.groups()[gi].dim_used(d));
    }
    if let Ok(n) = mind.num_tuples() {
        let mut it = MIIterator::over_all(mind).unwrap();
        let mut walked = 0u64;
        while it.is_valid() {
            walked += 1;
            it.advance();
        }
        assert_eq!(walked, n, "walked tuples vs num_tuples for {mind}");
    }
}

fn collect(mind: &MultiIndex) -> Vec<Vec<u64>> {
    let mut it = MIIterator::over_all(mind).unwrap();
    let mut out = Vec::new();
    while it.is_valid() {
        out.push(it.positions().to_vec());
        it.advance();
    }
    out
}

#[test]
fn cross_product_counts_tuples() {
    let mut mind = MultiIndex::new(ctx(16));
    assert_eq!(mind.add_dimension_cross(1000).unwrap(), 0);
    assert_eq!(mind.add_dimension_cross(30).unwrap(), 1);
    assert_eq!(mind.num_tuples().unwrap(), 30_000);
    assert_eq!(mind.num_groups(), 2);
    assert_eq!(mind.to_string(), "[ff]");
    assert_partition(&mind);
    assert_eq!(mind.orig_size(0), 1000);
    assert_eq!(mind.dim_size(1), 30);
}

#[test]
fn empty_dimension_zeroes_everything() {
    let mut mind = MultiIndex::new(ctx(16));
    mind.add_dimension_cross(1000).unwrap();
    mind.add_dimension_cross(0).unwrap();
    assert_eq!(mind.num_tuples().unwrap(), 0);
    assert!(mind.zero_tuples());
    assert!(mind.groups()[1].is_empty());
    assert_eq!(mind.orig_size(1), 1);

    let it = MIIterator::over_all(&mind).unwrap();
    assert!(!it.is_valid());
    assert_eq!(it.num_tuples(), 0);
}

#[test]
fn overflowing_product_is_too_big() {
    let mut mind = MultiIndex::new(ctx(16));
    mind.add_dimension_cross(1 << 32).unwrap();
    mind.add_dimension_cross(1 << 31).unwrap();
    assert!(mind.too_many_tuples());
    assert!(matches!(mind.num_tuples(), Err(OlapError::TooManyTuples)));

    let one = DimensionVector::from_dims(2, &[1]);
    assert_eq!(mind.num_tuples_for(&one, true).unwrap(), 1 << 31);
    let both = DimensionVector::all(2);
    assert_eq!(mind.num_tuples_for(&both, false).unwrap(), u64::MAX);
    assert!(matches!(mind.num_tuples_for(&both, true), Err(OlapError::TooManyTuples)));
}

#[test]
fn filter_updates_are_private_to_the_copy() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(40).unwrap();
    mind.add_dimension_cross(3).unwrap();

    let mut copy = mind.shallow_copy();
    let f = copy.updatable_filter(0).unwrap();
    f.reset_between(0, 19).unwrap();
    copy.update_num_tuples();

    assert_eq!(copy.num_tuples().unwrap(), 60);
    assert_eq!(mind.num_tuples().unwrap(), 120);
    assert_eq!(mind.filter(0).unwrap().count_ones(), 40);

    let deep = copy.deep_copy().unwrap();
    assert_eq!(deep.num_tuples().unwrap(), 60);
    assert_eq!(deep.to_string(), copy.to_string());
    assert_partition(&copy);
    assert_partition(&mind);
}

#[test]
fn iterators_lock_dimensions_and_gate() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(40).unwrap();
    let keep = Filter::new(40, 4, true).unwrap();
    {
        let it = MIIterator::over_all(&mind).unwrap();
        assert!(it.is_valid());
        assert_eq!(mind.lock_count(0), 1);
        let copy = it.try_clone().unwrap();
        assert_eq!(mind.lock_count(0), 2);
        drop(copy);

        // 还有其他读者时不能原地更新
        let mut mit = MIIterator::over_all(&mind).unwrap();
        assert!(matches!(mind.mi_filter_and(&mut mit, &keep), Err(OlapError::IteratorLocked)));
    }
    assert_eq!(mind.lock_count(0), 0);

    // 只有传入的迭代器自己登记时可以更新，结束后恢复它的登记
    let mut mit = MIIterator::over_all(&mind).unwrap();
    mind.mi_filter_and(&mut mit, &keep).unwrap();
    assert!(!mit.is_valid());
    assert_eq!(mind.num_tuples().unwrap(), 40);
    assert!(!mind.iterator_updating_lock());
    drop(mit);

    assert!(mind.iterator_updating_lock());
    assert!(!mind.iterator_lock());
    assert!(MIIterator::over_all(&mind).is_err());
    mind.iterator_unlock();
    assert!(MIIterator::over_all(&mind).is_ok());
}

#[test]
fn filter_and_on_single_dimension_narrows_in_place() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(40).unwrap();
    mind.updatable_filter(0).unwrap().reset_between(10, 19).unwrap();
    mind.update_num_tuples();

    // fd 按迭代顺序编号：只保留偶数序号
    let mut fd = Filter::new(30, 4, false).unwrap();
    for pos in (0..30).step_by(2) {
        fd.set(pos).unwrap();
    }
    let mut mit = MIIterator::over_all(&mind).unwrap();
    mind.mi_filter_and(&mut mit, &fd).unwrap();
    drop(mit);
    assert_eq!(mind.num_tuples().unwrap(), 15);
    assert_eq!(mind.groups()[0].kind(), GroupKind::Filter);
    let rows: Vec<u64> = collect(&mind).into_iter().map(|t| t[0]).collect();
    let want: Vec<u64> = (0..10).chain(20..40).step_by(2).collect();
    assert_eq!(rows, want);
}

#[test]
fn filter_and_over_two_dimensions_materializes() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(3).unwrap();
    mind.add_dimension_cross(4).unwrap();
    let before = collect(&mind);
    assert_eq!(before.len(), 12);

    let mut fd = Filter::new(12, 4, false).unwrap();
    for (k, t) in before.iter().enumerate() {
        if (t[0] + t[1]) % 2 == 0 {
            fd.set(k as u64).unwrap();
        }
    }
    let mut mit = MIIterator::new(&mind, &DimensionVector::all(2)).unwrap();
    mind.mi_filter_and(&mut mit, &fd).unwrap();
    drop(mit);

    assert_eq!(mind.num_groups(), 1);
    assert_eq!(mind.groups()[0].kind(), GroupKind::Materialized);
    assert_eq!(mind.to_string(), "[11]");
    assert_partition(&mind);
    let after = collect(&mind);
    let want: Vec<Vec<u64>> = before.into_iter().filter(|t| (t[0] + t[1]) % 2 == 0).collect();
    assert_eq!(after, want);
    assert_eq!(mind.lock_count(0), 0);
}

#[test]
fn filter_and_follows_the_iterator_pack_order() {
    let mut mind = MultiIndex::new(exact_ctx(4));
    mind.add_dimension_cross(40).unwrap();
    mind.add_dimension_cross(3).unwrap();
    let both = DimensionVector::all(2);
    let orders = vec![Some(PackOrder::new([2, 0, 1])), None];

    let mut before = Vec::new();
    {
        let mut it = MIIterator::ordered(&mind, &both, &orders).unwrap();
        while it.is_valid() {
            before.push(it.positions().to_vec());
            it.advance();
        }
    }
    assert_eq!(before.len(), 120);
    assert_eq!(before[0][0], 32);

    // 只保留偶数序号（序号按有序迭代器计）
    let mut fd = Filter::new(120, 4, false).unwrap();
    for pos in (0..120).step_by(2) {
        fd.set(pos).unwrap();
    }
    let mut mit = MIIterator::ordered(&mind, &both, &orders).unwrap();
    mind.mi_filter_and(&mut mit, &fd).unwrap();
    drop(mit);

    let want: Vec<Vec<u64>> = before.into_iter().step_by(2).collect();
    assert_eq!(collect(&mind), want);
    assert_partition(&mind);

    // 物化后的组不能只按其中一个维度过滤
    let mut partial = MIIterator::new(&mind, &DimensionVector::from_dims(2, &[0])).unwrap();
    assert!(matches!(mind.mi_filter_and(&mut partial, &fd), Err(OlapError::InvalidArgument(_))));
}

#[test]
fn in_place_filter_and_follows_the_iterator_pack_order() {
    let mut mind = MultiIndex::new(exact_ctx(4));
    mind.add_dimension_cross(40).unwrap();
    let orders = vec![Some(PackOrder::new([2, 0, 1]))];

    // 有序遍历：32..39, 0..15, 16..31；保留前 16 个位置
    let mut fd = Filter::new(40, 4, false).unwrap();
    fd.set_between(0, 15).unwrap();
    let mut mit = MIIterator::ordered(&mind, &DimensionVector::all(1), &orders).unwrap();
    mind.mi_filter_and(&mut mit, &fd).unwrap();
    drop(mit);

    assert_eq!(mind.groups()[0].kind(), GroupKind::Filter);
    let rows: Vec<u64> = collect(&mind).into_iter().map(|t| t[0]).collect();
    let want: Vec<u64> = (0..8).chain(32..40).collect();
    assert_eq!(rows, want);
    assert_partition(&mind);
}

#[test]
fn filter_bitmaps_respect_max_table_bytes() {
    // 每包 16 行，MIXED 块 8 字节；上限容纳 8 个 MIXED 块
    let ctx = QueryContext::new(MultiIndexConfig::default().with_pack_power(4).with_max_table_bytes(64)).unwrap();
    let mut mind = MultiIndex::new(ctx);
    mind.add_dimension_cross(4096).unwrap();
    {
        let f = mind.updatable_filter(0).unwrap();
        for b in 0..8u64 {
            f.reset(b * 16).unwrap();
        }
        assert_eq!(f.bitmap_bytes(), 64);
        assert!(matches!(f.reset(8 * 16), Err(OlapError::OutOfMemory(_))));
        assert!(f.get(8 * 16));
        // 整块清空不需要位表
        f.reset_between(8 * 16, 4095).unwrap();
    }
    mind.update_num_tuples();
    assert_eq!(mind.num_tuples().unwrap(), 8 * 15);
    assert_partition(&mind);
}

#[test]
fn marking_involved_groups_pulls_whole_groups() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(3).unwrap();
    mind.add_dimension_cross(4).unwrap();
    mind.add_dimension_cross(5).unwrap();
    mind.make_count_only(7, &DimensionVector::from_dims(3, &[0, 1]));
    assert_eq!(mind.num_tuples().unwrap(), 35);
    assert!(mind.is_forgotten(0));
    assert!(!mind.is_forgotten(2));
    assert_eq!(mind.to_string(), "[--f]");

    let mut v = DimensionVector::from_dims(3, &[1]);
    assert!(mind.mark_involved_dim_groups(&mut v));
    assert!(v.get(0) && v.get(1) && !v.get(2));
    assert!(!mind.mark_involved_dim_groups(&mut v));
    assert_eq!(mind.list_involved_groups(&v).len(), 1);
}

#[test]
fn emptying_a_dimension() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(10).unwrap();
    mind.add_dimension_cross(10).unwrap();
    mind.empty(Some(1));
    assert_eq!(mind.num_tuples().unwrap(), 0);
    assert_eq!(mind.dim_size(0), 10);
    assert_eq!(mind.dim_size(1), 0);
    mind.empty(None);
    assert_eq!(mind.dim_size(0), 0);
}

#[test]
fn distinctness_follows_single_large_dimension() {
    let mut mind = MultiIndex::new(ctx(4));
    mind.add_dimension_cross(1).unwrap();
    mind.add_dimension_cross(50).unwrap();
    assert!(mind.can_be_distinct(1));
    assert!(!mind.can_be_distinct(0));
    mind.add_dimension_cross(2).unwrap();
    assert!(!mind.can_be_distinct(1));
}
