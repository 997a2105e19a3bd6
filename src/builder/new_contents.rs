//! MINewContents：单线程构建器
//!
//! 三种输出形态，从最省到最通用：
//!
//! | 形态          | 条件                                      | 结果                         |
//! |---------------|-------------------------------------------|------------------------------|
//! | FilterForget  | 只有一个未遗忘维度，且它由 Filter 表示    | 新 Filter 组，不分配 Index Table |
//! | Virtual       | 只有一个未遗忘的"大"维度，且由 Filter 表示 | Virtual 组：Filter + 伴随表   |
//! | Material      | 其余情况                                   | Materialized 组               |
//!
//! 优化形态在遇到重复 / 非递增 / NULL 行号时自动退回 Material，已提交的值会重放进
//! Index Table，调用方无感知。

use std::sync::Arc;

use tracing::debug;

use super::{append_tuple, JoinTips, RoughSorter};
use crate::common::{DimId, DimensionVector, Result, RowId, NULL_ROW};
use crate::config::QueryContext;
use crate::dim_group::{DimensionGroup, FilterGroup, MaterializedGroup, VirtualGroup};
use crate::filter::{Filter, PendingEdits};
use crate::index_table::IndexTable;
use crate::multi_index::MultiIndex;

/// 最终采用的输出形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStrategy {
    Unspecified,
    Material,
    FilterForget,
    Virtual,
}

pub struct MINewContents {
    ctx:            Arc<QueryContext>,
    power:          u32,
    num_dims:       usize,
    orig_size:      Vec<u64>,
    strategy:       ContentStrategy,
    involved:       DimensionVector,
    forget_now:     Vec<bool>,
    /// 可忽略重复行号的维度
    ignore_repeats: Option<DimId>,
    t_new:          Vec<Option<IndexTable>>,
    nulls:          Vec<bool>,
    new_value:      Vec<RowId>,
    /// 已提交的元组数
    obj:            u64,
    optimized_dim:  Option<DimId>,
    f_opt:          Option<Filter>,
    /// Virtual 形态下 f_opt 的延迟修改
    f_pending:      PendingEdits,
    /// 优化形态下已接受的不同行号数
    opt_ones:       u64,
    /// 原 Filter（FilterForget 下 commit_pack 用）
    orig_filter:    Option<Arc<Filter>>,
    max_filter_val: Option<RowId>,
    rough:          Option<RoughSorter>,
    locked:         Vec<(Arc<DimensionGroup>, DimId)>,
}

impl MINewContents {
    pub fn new(mind: &MultiIndex, tips: &JoinTips) -> Self {
        let n = mind.num_dimensions();
        Self {
            ctx:            mind.ctx().clone(),
            power:          mind.power(),
            num_dims:       n,
            orig_size:      (0..n).map(|d| mind.orig_size(d)).collect(),
            strategy:       ContentStrategy::Unspecified,
            involved:       DimensionVector::new(n),
            forget_now:     (0..n).map(|d| tips.is_forgotten(d)).collect(),
            ignore_repeats: (0..n).find(|d| tips.distinct_only.get(*d).copied().unwrap_or(false)),
            t_new:          (0..n).map(|_| None).collect(),
            nulls:          vec![false; n],
            new_value:      vec![NULL_ROW; n],
            obj:            0,
            optimized_dim:  None,
            f_opt:          None,
            f_pending:      PendingEdits::new(),
            opt_ones:       0,
            orig_filter:    None,
            max_filter_val: None,
            rough:          None,
            locked:         Vec::new(),
        }
    }

    /// 加入涉及的维度（按组整体加入）
    pub fn set_dimensions(&mut self, mind: &MultiIndex, dims: &DimensionVector) {
        self.involved.plus(dims);
        mind.mark_involved_dim_groups(&mut self.involved);
    }

    pub fn strategy(&self) -> ContentStrategy { self.strategy }

    pub fn involved(&self) -> &DimensionVector { &self.involved }

    /// FilterForget 形态下保留为 Filter 的维度
    pub fn optimized_case_dimension(&self) -> Option<DimId> {
        match self.strategy {
            ContentStrategy::FilterForget => self.optimized_dim,
            _ => None,
        }
    }

    /// 已提交的元组数
    pub fn num_committed(&self) -> u64 { self.obj }

    /// 唯一未遗忘的候选维度（必须由 Filter 表示）
    fn single_candidate(&self, mind: &MultiIndex, pred: impl Fn(DimId) -> bool) -> Option<DimId> {
        let mut found = None;
        for d in self.involved.iter() {
            if self.forget_now[d] || !pred(d) {
                continue;
            }
            if found.is_some() {
                return None;
            }
            found = Some(d);
        }
        found.filter(|d| mind.filter(*d).is_some())
    }

    /// 选择形态、锁住涉及的维度并分配临时结构；`initial_size` 为预估元组数
    pub fn init(&mut self, mind: &MultiIndex, initial_size: u64) -> Result<()> {
        self.optimized_dim = self.single_candidate(mind, |_| true);
        if self.optimized_dim.is_some() {
            self.strategy = ContentStrategy::FilterForget;
        } else {
            self.optimized_dim = self.single_candidate(mind, |d| mind.max_num_packs(d) > 1);
            self.strategy = if self.optimized_dim.is_some() {
                ContentStrategy::Virtual
            } else {
                ContentStrategy::Material
            };
        }

        for d in self.involved.iter() {
            if let Some(g) = mind.group(d) {
                g.lock(d, 1);
                self.locked.push((g.clone(), d));
            }
        }

        for d in self.involved.iter() {
            self.t_new[d] = None;
            self.nulls[d] = false;
            if self.forget_now[d] {
                continue;
            }
            if Some(d) == self.optimized_dim {
                if let Some(f) = mind.filter(d) {
                    let limit = self.ctx.config().max_table_bytes;
                    self.f_opt       = Some(Filter::new(f.extent(), self.power, false)?.with_byte_limit(limit));
                    self.orig_filter = Some(f.clone());
                }
                continue;
            }
            self.t_new[d] = Some(IndexTable::new(self.ctx.clone(), initial_size.max(8), self.orig_size[d])?);
        }
        self.obj   = 0;
        self.rough = None;
        // 伴随表与基准 Filter 按位置对应，Virtual 形态不能重排
        if self.strategy == ContentStrategy::Material {
            self.start_rough_sort()?;
        }
        debug!(strategy = ?self.strategy, dims = self.involved.count(), initial_size, "new contents initialised");
        Ok(())
    }

    /// 设置当前元组中维度 d 的行号（NULL_ROW 为外连接补齐）
    pub fn set_new_table_value(&mut self, d: DimId, row: RowId) {
        self.new_value[d] = row;
    }

    /// 提交当前元组
    pub fn commit_new_table_values(&mut self) -> Result<()> {
        match (self.strategy, self.optimized_dim) {
            (ContentStrategy::FilterForget, Some(d)) => {
                let row = self.new_value[d];
                let repeated = self.f_opt.as_ref().is_some_and(|f| row != NULL_ROW && f.get(row));
                if row == NULL_ROW || (repeated && self.ignore_repeats != Some(d)) {
                    self.disable_optimized()?;
                    return self.commit_new_table_values();
                }
                if !repeated {
                    if let Some(f) = self.f_opt.as_mut() {
                        f.set(row)?;
                    }
                    self.opt_ones += 1;
                }
                self.obj += 1;
                return Ok(());
            }
            (ContentStrategy::Virtual, Some(d)) => {
                let row = self.new_value[d];
                if row == NULL_ROW || self.max_filter_val.is_some_and(|m| row <= m) {
                    self.disable_optimized()?;
                    return self.commit_new_table_values();
                }
                self.f_pending.set_delayed(row);
                self.max_filter_val = Some(row);
                self.opt_ones += 1;
            }
            _ => {}
        }
        append_tuple(&mut self.t_new, &mut self.nulls, &self.new_value, self.obj, self.rough.as_mut())?;
        self.obj += 1;
        Ok(())
    }

    /// FilterForget 形态下把包 `pack` 整块置为与原 Filter 相同；做不到时返回 false
    pub fn commit_pack(&mut self, pack: usize) -> Result<bool> {
        if self.strategy != ContentStrategy::FilterForget {
            return Ok(false);
        }
        let (Some(f), Some(orig)) = (self.f_opt.as_mut(), self.orig_filter.as_ref()) else {
            return Ok(false);
        };
        if pack >= f.num_blocks() || !f.is_empty_block(pack) {
            return Ok(false);
        }
        f.copy_block(orig, pack)?;
        let added = f.count_ones_in_block(pack) as u64;
        self.opt_ones += added;
        self.obj      += added;
        Ok(true)
    }

    /// 优化形态下所有可能的行都已出现（只在忽略重复的维度上成立）
    pub fn no_more_tuples_possible(&self) -> bool {
        matches!(self.strategy, ContentStrategy::FilterForget | ContentStrategy::Virtual)
            && self.optimized_dim.is_some()
            && self.optimized_dim == self.ignore_repeats
            && self.orig_filter.as_ref().is_some_and(|f| self.opt_ones >= f.count_ones())
    }

    /// 从优化形态退回 Material：把已接受的行号按位置重放进 Index Table
    fn disable_optimized(&mut self) -> Result<()> {
        let Some(d) = self.optimized_dim.take() else { return Ok(()) };
        let f = self.take_opt_filter(d)?;
        if !self.forget_now[d] {
            let mut t = IndexTable::new(self.ctx.clone(), f.count_ones().max(8), self.orig_size[d])?;
            t.set_by_filter(&f)?;
            // 忽略的重复行不再占位置
            self.obj = f.count_ones();
            self.t_new[d] = Some(t);
        }
        self.start_rough_sort()?;
        debug!(dim = d, from = ?self.strategy, committed = self.obj, "optimized new contents disabled, materializing");
        self.orig_filter    = None;
        self.max_filter_val = None;
        self.strategy       = ContentStrategy::Material;
        Ok(())
    }

    /// Material 形态下，有表的原始行数超过一个包时启用粗排序（从当前位置开始）
    fn start_rough_sort(&mut self) -> Result<()> {
        let cols: Vec<(DimId, u64)> = (0..self.num_dims)
            .filter(|d| self.t_new[*d].is_some())
            .map(|d| (d, self.orig_size[d]))
            .collect();
        let needed = cols.iter().any(|(_, size)| *size > (1u64 << self.power));
        if !needed || !self.ctx.config().rough_sort {
            return Ok(());
        }
        let shift = self.t_new.iter().flatten().map(|t| t.block_shift()).min().unwrap_or(63);
        let mut r = RoughSorter::new(self.ctx.clone(), self.num_dims, &cols, shift);
        r.commit(self.obj, &mut self.t_new)?;
        self.rough = Some(r);
        Ok(())
    }

    /// 用新内容替换 MultiIndex 中涉及的维度组
    pub fn commit(mut self, mind: &mut MultiIndex, joined_tuples: u64) -> Result<()> {
        let mut groups = Vec::new();
        match (self.strategy, self.optimized_dim) {
            (ContentStrategy::FilterForget, Some(d)) => {
                let f = self.take_opt_filter(d)?;
                groups.push(DimensionGroup::Filter(FilterGroup::new(d, f)));
                let mut forgotten = self.involved.clone();
                forgotten.set(d, false);
                if forgotten.count() > 0 {
                    // 只含被遗忘维度的组：大小记为 1，不影响元组数
                    groups.push(DimensionGroup::Materialized(MaterializedGroup::new(forgotten, 1)));
                }
            }
            (ContentStrategy::Virtual, Some(d)) => {
                let f = self.take_opt_filter(d)?;
                let mut g = VirtualGroup::new(self.involved.clone(), d, f);
                for x in self.involved.iter() {
                    if let Some(t) = self.t_new[x].take() {
                        g.new_dimension_content(x, t, self.nulls[x]);
                    }
                }
                groups.push(DimensionGroup::Virtual(g));
            }
            _ => {
                if let Some(r) = self.rough.as_mut() {
                    r.finish(self.obj, &mut self.t_new)?;
                }
                let mut g = MaterializedGroup::new(self.involved.clone(), self.obj);
                for x in self.involved.iter() {
                    if let Some(t) = self.t_new[x].take() {
                        g.new_dimension_content(x, t, self.nulls[x]);
                    }
                }
                groups.push(DimensionGroup::Materialized(g));
            }
        }
        debug!(strategy = ?self.strategy, committed = self.obj, joined_tuples, "new contents committed");
        mind.install_groups(&self.involved, groups);
        self.release_locks();
        Ok(())
    }

    /// 只提交元组数
    pub fn commit_count_only(mut self, mind: &mut MultiIndex, joined_tuples: u64) {
        mind.make_count_only(joined_tuples, &self.involved);
        self.release_locks();
    }

    fn take_opt_filter(&mut self, d: DimId) -> Result<Filter> {
        let mut f = match self.f_opt.take() {
            Some(f) => f,
            None    => Filter::new(self.orig_size[d].max(1), self.power, false)?
                .with_byte_limit(self.ctx.config().max_table_bytes),
        };
        f.commit(std::mem::take(&mut self.f_pending))?;
        Ok(f)
    }

    fn release_locks(&mut self) {
        for (g, d) in self.locked.drain(..) {
            g.unlock(d);
        }
    }
}

impl Drop for MINewContents {
    /// 未提交即丢弃：释放创建时的锁
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl std::fmt::Debug for MINewContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MINewContents")
            .field("strategy", &self.strategy)
            .field("optimized_dim", &self.optimized_dim)
            .field("committed", &self.obj)
            .finish()
    }
}
