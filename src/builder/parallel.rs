//! 并行构建：每个工作任务各自填充一个 BuildItem，提交时合并为 Multi-Materialized 组
//!
//! BuildItem 之间不共享任何表，工作线程之间无需加锁；只有取还 BuildItem 经过一个
//! 短临界区。归还的 BuildItem 会被下一个任务复用，继续追加。

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::debug;

use super::{append_tuple, JoinTips, RoughSorter};
use crate::common::{DimId, DimensionVector, Result, RowId, NULL_ROW};
use crate::config::QueryContext;
use crate::dim_group::{DimensionGroup, MultiMaterializedGroup, Shard};
use crate::index_table::IndexTable;
use crate::multi_index::MultiIndex;

// ── BuildItem ─────────────────────────────────────────────────────────────────

/// 一个分片的构建状态
pub struct BuildItem {
    tables: Vec<Option<IndexTable>>,
    nulls:  Vec<bool>,
    values: Vec<RowId>,
    count:  u64,
    rough:  Option<RoughSorter>,
}

impl BuildItem {
    fn new(layout: &ItemLayout, initial_size: u64) -> Result<Self> {
        let n = layout.orig_size.len();
        let size = initial_size.max(8);
        let mut tables: Vec<Option<IndexTable>> = (0..n).map(|_| None).collect();
        let mut cols = Vec::new();
        for d in layout.involved.iter() {
            if layout.forget_now[d] {
                continue;
            }
            tables[d] = Some(IndexTable::new(layout.ctx.clone(), size, layout.orig_size[d])?);
            cols.push((d, layout.orig_size[d]));
        }
        let rough = (size > (1u64 << layout.ctx.power()) && layout.ctx.config().rough_sort && !cols.is_empty())
            .then(|| {
                let shift = tables.iter().flatten().map(|t| t.block_shift()).min().unwrap_or(63);
                RoughSorter::new(layout.ctx.clone(), n, &cols, shift)
            });
        Ok(Self { tables, nulls: vec![false; n], values: vec![NULL_ROW; n], count: 0, rough })
    }

    pub fn set_table_value(&mut self, d: DimId, row: RowId) {
        self.values[d] = row;
    }

    pub fn commit_table_values(&mut self) -> Result<()> {
        append_tuple(&mut self.tables, &mut self.nulls, &self.values, self.count, self.rough.as_mut())?;
        self.count += 1;
        Ok(())
    }

    /// 完成未排完的粗排序窗口
    pub fn finish(&mut self) -> Result<()> {
        match self.rough.as_mut() {
            Some(r) => r.finish(self.count, &mut self.tables),
            None    => Ok(()),
        }
    }

    pub fn count(&self) -> u64 { self.count }

    pub fn null_existed(&self, d: DimId) -> bool { self.nulls.get(d).copied().unwrap_or(false) }

    fn into_shard(mut self) -> Result<Shard> {
        self.finish()?;
        let tables = std::mem::take(&mut self.tables);
        Ok(Shard::new(tables, std::mem::take(&mut self.nulls), self.count))
    }
}

impl std::fmt::Debug for BuildItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildItem").field("count", &self.count).finish()
    }
}

/// 创建 BuildItem 所需的不可变信息
struct ItemLayout {
    ctx:        Arc<QueryContext>,
    involved:   DimensionVector,
    forget_now: Vec<bool>,
    orig_size:  Vec<u64>,
}

// ── MultiIndexBuilder ─────────────────────────────────────────────────────────

pub struct MultiIndexBuilder {
    layout:       ItemLayout,
    initial_size: u64,
    /// 已归还、可复用的 BuildItem
    items:        Mutex<VecDeque<BuildItem>>,
    locked:       Vec<(Arc<DimensionGroup>, DimId)>,
}

impl MultiIndexBuilder {
    pub fn new(mind: &MultiIndex, tips: &JoinTips) -> Self {
        let n = mind.num_dimensions();
        Self {
            layout: ItemLayout {
                ctx:        mind.ctx().clone(),
                involved:   DimensionVector::new(n),
                forget_now: (0..n).map(|d| tips.is_forgotten(d)).collect(),
                orig_size:  (0..n).map(|d| mind.orig_size(d)).collect(),
            },
            initial_size: 0,
            items:        Mutex::new(VecDeque::new()),
            locked:       Vec::new(),
        }
    }

    /// 确定涉及的维度（按组整体加入）并锁住
    pub fn init(&mut self, mind: &MultiIndex, initial_size: u64, dims: &[DimensionVector]) {
        self.initial_size = initial_size;
        for v in dims {
            self.layout.involved.plus(v);
            mind.mark_involved_dim_groups(&mut self.layout.involved);
        }
        for d in self.layout.involved.iter() {
            if let Some(g) = mind.group(d) {
                g.lock(d, 1);
                self.locked.push((g.clone(), d));
            }
        }
    }

    pub fn involved(&self) -> &DimensionVector { &self.layout.involved }

    /// 取一个 BuildItem：优先复用已归还的
    pub fn create_build_item(&self) -> Result<BuildItem> {
        if let Some(item) = self.items.lock().pop_front() {
            return Ok(item);
        }
        BuildItem::new(&self.layout, self.initial_size)
    }

    pub fn add_build_item(&self, item: BuildItem) {
        self.items.lock().push_back(item);
    }

    /// 在查询线程池上并行执行 `tasks` 个任务；每个任务拿到任务号和一个 BuildItem
    pub fn fill_parallel<F>(&self, tasks: usize, fill: F) -> Result<()>
    where
        F: Fn(usize, &mut BuildItem) -> Result<()> + Sync,
    {
        let run = |task: usize| -> Result<()> {
            self.layout.ctx.check_killed()?;
            let mut item = self.create_build_item()?;
            let res = fill(task, &mut item);
            self.add_build_item(item);
            res
        };
        match self.layout.ctx.pool() {
            Some(pool) => pool.install(|| (0..tasks).into_par_iter().try_for_each(run)),
            None       => (0..tasks).try_for_each(run),
        }
    }

    /// 合并所有 BuildItem；`count_only` 时只保留元组数
    pub fn commit(mut self, mind: &mut MultiIndex, joined_tuples: u64, count_only: bool) -> Result<()> {
        if count_only {
            mind.make_count_only(joined_tuples, &self.layout.involved);
            self.release_locks();
            return Ok(());
        }
        let items: Vec<BuildItem> = self.items.lock().drain(..).filter(|i| i.count > 0).collect();
        let shards = items.into_iter()
            .map(BuildItem::into_shard)
            .collect::<Result<Vec<_>>>()?;
        let group = MultiMaterializedGroup::new(self.layout.involved.clone(), shards);
        debug!(
            shards = group.shards().len(), tuples = group.num_tuples, joined_tuples,
            "parallel build committed"
        );
        mind.install_groups(&self.layout.involved, vec![DimensionGroup::MultiMaterialized(group)]);
        self.release_locks();
        Ok(())
    }

    fn release_locks(&mut self) {
        for (g, d) in self.locked.drain(..) {
            g.unlock(d);
        }
    }
}

impl Drop for MultiIndexBuilder {
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl std::fmt::Debug for MultiIndexBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiIndexBuilder")
            .field("involved", &self.layout.involved)
            .field("initial_size", &self.initial_size)
            .finish()
    }
}
