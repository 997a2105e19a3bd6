//! 新内容构建：FilterForget / Virtual / Material 以及并行构建

use std::sync::Arc;

use olap_multi_index::mi_iterator::SliceKind;
use olap_multi_index::{
    ContentStrategy, DimensionVector, GroupKind, JoinTips, MIIterator, MINewContents, MultiIndex,
    MultiIndexBuilder, MultiIndexConfig, OlapError, QueryContext, RowId, NULL_ROW,
};
use proptest::prelude::*;

fn ctx_with(rough_sort: bool) -> Arc<QueryContext> {
    QueryContext::new(
        MultiIndexConfig::default()
            .with_pack_power(4)
            .with_rough_sort(rough_sort)
            .with_worker_threads(2),
    ).unwrap()
}

fn index(ctx: Arc<QueryContext>, sizes: &[u64]) -> MultiIndex {
    let mut mind = MultiIndex::new(ctx);
    for &s in sizes {
        mind.add_dimension_cross(s).unwrap();
    }
    mind
}

fn tuples(mind: &MultiIndex, dims: &DimensionVector) -> Vec<Vec<RowId>> {
    let mut it = MIIterator::new(mind, dims).unwrap();
    let mut out = Vec::new();
    while it.is_valid() {
        out.push(dims.iter().map(|d| it.get(d)).collect());
        it.advance();
    }
    out
}

fn sorted(mut v: Vec<Vec<RowId>>) -> Vec<Vec<RowId>> {
    v.sort();
    v
}

/// 单线程构建：依次提交 rows 中的元组
fn build(mind: &mut MultiIndex, tips: &JoinTips, rows: &[Vec<RowId>]) -> ContentStrategy {
    let n = mind.num_dimensions();
    let all = DimensionVector::all(n);
    let mut contents = MINewContents::new(mind, tips);
    contents.set_dimensions(mind, &all);
    contents.init(mind, rows.len() as u64).unwrap();
    for t in rows {
        for (d, r) in t.iter().enumerate() {
            contents.set_new_table_value(d, *r);
        }
        contents.commit_new_table_values().unwrap();
    }
    let strategy = contents.strategy();
    contents.commit(mind, rows.len() as u64).unwrap();
    strategy
}

// ── FilterForget ──────────────────────────────────────────────────────────────

#[test]
fn single_remembered_filter_dimension_stays_a_filter() {
    let mut mind = index(ctx_with(true), &[100, 50]);
    let tips = JoinTips::new(2).forget(1);
    let rows = vec![vec![3, 7], vec![10, 7], vec![42, 1]];
    let strategy = build(&mut mind, &tips, &rows);

    assert_eq!(strategy, ContentStrategy::FilterForget);
    assert_eq!(mind.to_string(), "[f-]");
    assert_eq!(mind.num_tuples().unwrap(), 3);
    assert!(mind.is_forgotten(1));
    let rows: Vec<RowId> = tuples(&mind, &DimensionVector::from_dims(2, &[0])).into_iter().map(|t| t[0]).collect();
    assert_eq!(rows, vec![3, 10, 42]);
    assert_eq!(mind.lock_count(0), 0);
}

#[test]
fn repeated_row_falls_back_to_material() {
    let mut mind = index(ctx_with(false), &[100, 50]);
    let tips = JoinTips::new(2).forget(1);
    let rows = vec![vec![3, 0], vec![10, 0], vec![10, 0], vec![64, 0]];
    let strategy = build(&mut mind, &tips, &rows);

    assert_eq!(strategy, ContentStrategy::Material);
    assert_eq!(mind.to_string(), "[1-]");
    assert_eq!(mind.num_tuples().unwrap(), 4);
    let rows: Vec<RowId> = tuples(&mind, &DimensionVector::from_dims(2, &[0])).into_iter().map(|t| t[0]).collect();
    assert_eq!(rows, vec![3, 10, 10, 64]);
}

#[test]
fn null_row_falls_back_to_material() {
    let mut mind = index(ctx_with(false), &[100, 50]);
    let tips = JoinTips::new(2).forget(1);
    let rows = vec![vec![3, 0], vec![NULL_ROW, 0], vec![5, 0]];
    build(&mut mind, &tips, &rows);
    assert_eq!(mind.num_tuples().unwrap(), 3);
    assert!(mind.nulls_exist(0));
    let rows: Vec<RowId> = tuples(&mind, &DimensionVector::from_dims(2, &[0])).into_iter().map(|t| t[0]).collect();
    assert_eq!(rows, vec![3, NULL_ROW, 5]);
}

#[test]
fn distinct_only_dimension_ignores_repeats() {
    let mut mind = index(ctx_with(true), &[10, 5]);
    let tips = JoinTips::new(2).forget(1).distinct(0);
    let all = DimensionVector::all(2);
    let mut contents = MINewContents::new(&mind, &tips);
    contents.set_dimensions(&mind, &all);
    contents.init(&mind, 16).unwrap();
    assert_eq!(contents.optimized_case_dimension(), Some(0));
    for round in 0..2 {
        for row in 0..10 {
            contents.set_new_table_value(0, row);
            contents.set_new_table_value(1, round);
            contents.commit_new_table_values().unwrap();
        }
        assert!(contents.no_more_tuples_possible());
    }
    assert_eq!(contents.num_committed(), 20);
    assert_eq!(contents.strategy(), ContentStrategy::FilterForget);
    contents.commit(&mut mind, 20).unwrap();
    assert_eq!(mind.num_tuples().unwrap(), 10);
}

#[test]
fn whole_pack_commit_copies_original_block() {
    let mut mind = index(ctx_with(true), &[100, 5]);
    mind.updatable_filter(0).unwrap().reset(40).unwrap();
    mind.update_num_tuples();
    let tips = JoinTips::new(2).forget(1);
    let mut contents = MINewContents::new(&mind, &tips);
    contents.set_dimensions(&mind, &DimensionVector::all(2));
    contents.init(&mind, 16).unwrap();

    assert!(contents.commit_pack(2).unwrap());
    assert!(!contents.commit_pack(2).unwrap());
    assert_eq!(contents.num_committed(), 15);
    contents.commit(&mut mind, 15).unwrap();

    let rows: Vec<RowId> = tuples(&mind, &DimensionVector::from_dims(2, &[0])).into_iter().map(|t| t[0]).collect();
    let want: Vec<RowId> = (32..48).filter(|r| *r != 40).collect();
    assert_eq!(rows, want);
}

// ── Virtual ───────────────────────────────────────────────────────────────────

#[test]
fn increasing_large_dimension_builds_virtual_group() {
    let mut mind = index(ctx_with(true), &[100, 10]);
    let rows: Vec<Vec<RowId>> = (0..100).step_by(3).map(|r| vec![r, r % 10]).collect();
    let strategy = build(&mut mind, &JoinTips::new(2), &rows);

    assert_eq!(strategy, ContentStrategy::Virtual);
    assert_eq!(mind.to_string(), "[Fv]");
    assert_eq!(mind.groups()[0].kind(), GroupKind::Virtual);
    assert_eq!(mind.num_tuples().unwrap(), rows.len() as u64);
    assert_eq!(tuples(&mind, &DimensionVector::all(2)), rows);
}

#[test]
fn virtual_falls_back_on_non_increasing_row() {
    let mut mind = index(ctx_with(false), &[100, 10]);
    let rows = vec![vec![5, 1], vec![20, 2], vec![20, 3], vec![7, NULL_ROW], vec![90, 4]];
    let strategy = build(&mut mind, &JoinTips::new(2), &rows);

    assert_eq!(strategy, ContentStrategy::Material);
    assert_eq!(mind.to_string(), "[11]");
    assert_eq!(tuples(&mind, &DimensionVector::all(2)), rows);
    assert!(mind.nulls_exist(1));
}

// ── 三种形态等价 ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// 同一串严格递增、互不重复的元组，三种形态给出同样的结果
    #[test]
    fn strategies_agree_on_the_same_tuple_stream(
        picks in prop::collection::btree_map(0u64..100, 0u64..10, 1..60),
    ) {
        let rows: Vec<Vec<RowId>> = picks.iter().map(|(r, v)| vec![*r, *v]).collect();
        let dim0: Vec<RowId> = rows.iter().map(|t| t[0]).collect();

        let mut forget = index(ctx_with(true), &[100, 10]);
        prop_assert_eq!(build(&mut forget, &JoinTips::new(2).forget(1), &rows), ContentStrategy::FilterForget);
        let mut virt = index(ctx_with(true), &[100, 10]);
        prop_assert_eq!(build(&mut virt, &JoinTips::new(2), &rows), ContentStrategy::Virtual);
        // 两个维度都跨多个包：没有可优化的维度
        let mut material = index(ctx_with(false), &[100, 40]);
        prop_assert_eq!(build(&mut material, &JoinTips::new(2), &rows), ContentStrategy::Material);

        let all = DimensionVector::all(2);
        prop_assert_eq!(tuples(&virt, &all), rows.clone());
        prop_assert_eq!(tuples(&material, &all), rows.clone());
        let first = DimensionVector::from_dims(2, &[0]);
        for mind in [&forget, &virt, &material] {
            prop_assert_eq!(mind.num_tuples().unwrap(), rows.len() as u64);
            let got: Vec<RowId> = tuples(mind, &first).into_iter().map(|t| t[0]).collect();
            prop_assert_eq!(got, dim0.clone());
        }
    }
}

// ── Material + 粗排序 ─────────────────────────────────────────────────────────

#[test]
fn material_rough_sort_keeps_tuples_aligned() {
    let ctx = QueryContext::new(
        MultiIndexConfig::default()
            .with_pack_power(4)
            .with_rough_sort_jump_threshold(1)
            .with_worker_threads(2),
    ).unwrap();
    let mut mind = index(ctx, &[1000, 1000, 1000]);
    let rows: Vec<Vec<RowId>> = (0..950u64)
        .map(|i| {
            let r = (i * 37) % 1000;
            vec![r, 999 - r, i]
        })
        .collect();
    let strategy = build(&mut mind, &JoinTips::new(3), &rows);
    assert_eq!(strategy, ContentStrategy::Material);

    let got = tuples(&mind, &DimensionVector::all(3));
    assert_eq!(got.len(), 950);
    assert!(got.iter().all(|t| t[1] == 999 - t[0] && (t[2] * 37) % 1000 == t[0]));
    assert_eq!(sorted(got.clone()), sorted(rows));
    // 单个窗口：按维度 0 的包号有序
    assert!(got.windows(2).all(|w| w[0][0] >> 4 <= w[1][0] >> 4));
}

// ── 其他 ──────────────────────────────────────────────────────────────────────

#[test]
fn dropping_uncommitted_contents_releases_locks() {
    let mind = index(ctx_with(true), &[20, 20]);
    {
        let mut contents = MINewContents::new(&mind, &JoinTips::new(2));
        contents.set_dimensions(&mind, &DimensionVector::all(2));
        contents.init(&mind, 16).unwrap();
        assert_eq!(mind.lock_count(0), 1);
        assert_eq!(mind.lock_count(1), 1);
    }
    assert_eq!(mind.lock_count(0), 0);
    assert_eq!(mind.lock_count(1), 0);
    assert_eq!(mind.to_string(), "[ff]");
}

#[test]
fn count_only_commit_keeps_just_the_count() {
    let mut mind = index(ctx_with(true), &[20, 20, 3]);
    let mut contents = MINewContents::new(&mind, &JoinTips::new(3).with_count_only());
    contents.set_dimensions(&mind, &DimensionVector::from_dims(3, &[0, 1]));
    contents.init(&mind, 16).unwrap();
    contents.commit_count_only(&mut mind, 42);
    assert_eq!(mind.num_tuples().unwrap(), 126);
    assert_eq!(mind.to_string(), "[--f]");
    assert_eq!(mind.lock_count(2), 0);
}

// ── 并行构建 ──────────────────────────────────────────────────────────────────

fn parallel_rows(task: usize) -> Vec<Vec<RowId>> {
    (task as u64 * 250..(task as u64 + 1) * 250)
        .map(|r| vec![r, if r % 100 == 0 { NULL_ROW } else { 999 - r }])
        .collect()
}

#[test]
fn parallel_builder_produces_multi_materialized_group() {
    let mut mind = index(ctx_with(true), &[1000, 1000]);
    let all = DimensionVector::all(2);
    let mut builder = MultiIndexBuilder::new(&mind, &JoinTips::new(2));
    builder.init(&mind, 256, &[all.clone()]);
    assert_eq!(mind.lock_count(0), 1);
    builder.fill_parallel(4, |task, item| {
        for t in parallel_rows(task) {
            item.set_table_value(0, t[0]);
            item.set_table_value(1, t[1]);
            item.commit_table_values()?;
        }
        Ok(())
    }).unwrap();
    builder.commit(&mut mind, 1000, false).unwrap();

    assert_eq!(mind.to_string(), "[11]");
    assert_eq!(mind.groups()[0].kind(), GroupKind::MultiMaterialized);
    assert_eq!(mind.num_tuples().unwrap(), 1000);
    assert!(mind.nulls_exist(1));
    assert_eq!(mind.lock_count(0), 0);

    let want: Vec<Vec<RowId>> = (0..4).flat_map(parallel_rows).collect();
    assert_eq!(sorted(tuples(&mind, &all)), sorted(want));

    let it = MIIterator::over_all(&mind).unwrap();
    let cap = it.slice_capability();
    assert_eq!(cap.kind, SliceKind::Fixed);
    assert_eq!(cap.slices.iter().sum::<u64>(), 1000);
    drop(it);

    // 按分片遍历
    let mut total = 0u64;
    for shard in 0..cap.slices.len() {
        let mut it = MIIterator::over_all(&mind).unwrap();
        assert!(it.rewind_to_pack(shard as u32));
        while it.is_valid() {
            total += 1;
            it.advance();
        }
    }
    assert_eq!(total, 1000);
}

#[test]
fn parallel_and_sequential_builds_agree() {
    let rows: Vec<Vec<RowId>> = (0..300u64).map(|i| vec![(i * 7) % 200, i % 50]).collect();

    let mut seq = index(ctx_with(true), &[200, 50]);
    build(&mut seq, &JoinTips::new(2), &rows);

    let mut par = index(ctx_with(true), &[200, 50]);
    let mut builder = MultiIndexBuilder::new(&par, &JoinTips::new(2));
    builder.init(&par, 64, &[DimensionVector::all(2)]);
    builder.fill_parallel(3, |task, item| {
        for t in rows.iter().skip(task * 100).take(100) {
            item.set_table_value(0, t[0]);
            item.set_table_value(1, t[1]);
            item.commit_table_values()?;
        }
        Ok(())
    }).unwrap();
    builder.commit(&mut par, 300, false).unwrap();

    let all = DimensionVector::all(2);
    assert_eq!(sorted(tuples(&seq, &all)), sorted(tuples(&par, &all)));
    assert_eq!(sorted(tuples(&seq, &all)), sorted(rows));
}

#[test]
fn parallel_count_only_and_forgotten_dimensions() {
    let mut mind = index(ctx_with(true), &[100, 100, 4]);
    let mut builder = MultiIndexBuilder::new(&mind, &JoinTips::new(3).forget(1));
    builder.init(&mind, 16, &[DimensionVector::from_dims(3, &[0, 1])]);
    builder.fill_parallel(2, |task, item| {
        for r in 0..10 {
            item.set_table_value(0, task as u64 * 10 + r);
            item.set_table_value(1, r);
            item.commit_table_values()?;
        }
        Ok(())
    }).unwrap();
    builder.commit(&mut mind, 20, false).unwrap();
    assert_eq!(mind.to_string(), "[1-f]");
    assert_eq!(mind.num_tuples().unwrap(), 80);

    let mut builder = MultiIndexBuilder::new(&mind, &JoinTips::new(3));
    builder.init(&mind, 16, &[DimensionVector::from_dims(3, &[2])]);
    builder.commit(&mut mind, 9, true).unwrap();
    assert_eq!(mind.num_tuples().unwrap(), 180);
    assert_eq!(mind.lock_count(0), 0);
}

#[test]
fn killed_parallel_build_releases_locks() {
    let ctx = ctx_with(true);
    let mind = index(ctx.clone(), &[100, 100]);
    let mut builder = MultiIndexBuilder::new(&mind, &JoinTips::new(2));
    builder.init(&mind, 16, &[DimensionVector::all(2)]);
    ctx.kill();
    let res = builder.fill_parallel(4, |_, item| {
        item.set_table_value(0, 1);
        item.set_table_value(1, 1);
        item.commit_table_values()
    });
    assert!(matches!(res, Err(OlapError::Killed)));
    drop(builder);
    assert_eq!(mind.lock_count(0), 0);
    assert_eq!(mind.lock_count(1), 0);
}
