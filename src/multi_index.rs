//! MultiIndex：覆盖查询全部维度的维度组集合（当前元组空间）
//!
//! ```text
//!   dims:    0    1    2    3
//!   groups: [F0] [ M(1,2) ] [F3]      每个维度恰好属于一个组
//!   num_tuples = |F0| * |M| * |F3|    超过 2^63 记为 too big
//! ```
//!
//! 组以 `Arc<DimensionGroup>` 持有：迭代器克隆 `Arc` 后与 MultiIndex 解耦，
//! 提交新一代内容时旧组在最后一个迭代器释放后才真正销毁。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::builder::{JoinTips, MINewContents};
use crate::common::{safe_multiply, DimId, DimensionVector, OlapError, Result};
use crate::config::QueryContext;
use crate::dim_group::{DimensionGroup, GroupKind, MaterializedGroup};
use crate::filter::{Filter, PendingEdits};
use crate::mi_iterator::MIIterator;

// ── IteratorGate ──────────────────────────────────────────────────────────────

/// 单写多读闸门：>0 为普通迭代器个数，-1 为正在原地更新
#[derive(Debug, Default)]
pub struct IteratorGate {
    state: Mutex<i64>,
}

impl IteratorGate {
    /// 注册普通迭代器；已处于更新模式时返回 false
    pub fn lock(&self) -> bool {
        let mut s = self.state.lock();
        if *s < 0 {
            return false;
        }
        *s += 1;
        true
    }

    /// 进入更新模式；有任何迭代器时返回 false
    pub fn updating_lock(&self) -> bool { self.exclusive_lock(0) }

    /// 进入更新模式；调用方自己持有的 `own` 个读者登记不算冲突
    pub fn exclusive_lock(&self, own: i64) -> bool {
        let mut s = self.state.lock();
        if *s != own {
            return false;
        }
        *s = -1;
        true
    }

    /// 退出 `exclusive_lock`，恢复调用方的读者登记
    pub fn exclusive_unlock(&self, own: i64) {
        *self.state.lock() = own;
    }

    pub fn unlock(&self) {
        let mut s = self.state.lock();
        if *s > 0 { *s -= 1 } else { *s = 0 }
    }

    pub fn readers(&self) -> i64 { (*self.state.lock()).max(0) }

    pub fn is_updating(&self) -> bool { *self.state.lock() < 0 }
}

// ── MultiIndex ────────────────────────────────────────────────────────────────

pub struct MultiIndex {
    ctx:             Arc<QueryContext>,
    power:           u32,
    /// 各维度原始行数
    dim_size:        Vec<u64>,
    groups:          Vec<Arc<DimensionGroup>>,
    group_for_dim:   Vec<Option<usize>>,
    num_tuples:      u64,
    too_big:         bool,
    can_be_distinct: Vec<bool>,
    used_in_output:  Vec<bool>,
    gate:            Arc<IteratorGate>,
}

impl MultiIndex {
    pub fn new(ctx: Arc<QueryContext>) -> Self {
        Self {
            power:           ctx.power(),
            ctx,
            dim_size:        Vec::new(),
            groups:          Vec::new(),
            group_for_dim:   Vec::new(),
            num_tuples:      0,
            too_big:         false,
            can_be_distinct: Vec::new(),
            used_in_output:  Vec::new(),
            gate:            Arc::new(IteratorGate::default()),
        }
    }

    /// 与 `self` 共享 Filter 块和 Index Table 的副本
    pub fn shallow_copy(&self) -> Self {
        self.copy_with(self.groups.iter().map(|g| Arc::new(DimensionGroup::clone(g))).collect())
    }

    /// 不共享任何存储的副本
    pub fn deep_copy(&self) -> Result<Self> {
        let groups = self.groups.iter()
            .map(|g| g.clone_group(false).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.copy_with(groups))
    }

    fn copy_with(&self, groups: Vec<Arc<DimensionGroup>>) -> Self {
        Self {
            ctx:             self.ctx.clone(),
            power:           self.power,
            dim_size:        self.dim_size.clone(),
            groups,
            group_for_dim:   self.group_for_dim.clone(),
            num_tuples:      self.num_tuples,
            too_big:         self.too_big,
            can_be_distinct: self.can_be_distinct.clone(),
            used_in_output:  self.used_in_output.clone(),
            gate:            Arc::new(IteratorGate::default()),
        }
    }

    /// 清空为没有任何维度的状态
    pub fn clear(&mut self) {
        self.dim_size.clear();
        self.groups.clear();
        self.group_for_dim.clear();
        self.can_be_distinct.clear();
        self.used_in_output.clear();
        self.num_tuples = 0;
        self.too_big    = false;
    }

    // ── 基本属性 ──────────────────────────────────────────────────────────────

    pub fn ctx(&self)            -> &Arc<QueryContext> { &self.ctx }
    pub fn power(&self)          -> u32   { self.power }
    pub fn num_dimensions(&self) -> usize { self.dim_size.len() }
    pub fn num_groups(&self)     -> usize { self.groups.len() }

    pub fn groups(&self) -> &[Arc<DimensionGroup>] { &self.groups }

    pub fn group_index(&self, d: DimId) -> Option<usize> {
        self.group_for_dim.get(d).copied().flatten()
    }

    pub fn group(&self, d: DimId) -> Option<&Arc<DimensionGroup>> {
        self.group_index(d).map(|g| &self.groups[g])
    }

    pub(crate) fn gate(&self) -> &Arc<IteratorGate> { &self.gate }

    // ── 构建 ──────────────────────────────────────────────────────────────────

    /// 与一个 size 行的新维度做笛卡尔积；size = 0 时加入一个行数为 1 的空维度
    pub fn add_dimension_cross(&mut self, size: u64) -> Result<DimId> {
        let dim = self.dim_size.len();
        let (extent, empty) = if size > 0 { (size, false) } else { (1, true) };
        let limit = self.ctx.config().max_table_bytes;
        let mut group = DimensionGroup::full_filter(dim, extent, self.power, limit)?;
        if empty {
            group.empty();
        }
        self.dim_size.push(extent);
        self.used_in_output.push(true);
        self.can_be_distinct.push(true);
        if dim == 0 {
            self.num_tuples = size;
            self.too_big    = false;
        } else {
            self.multiply_num_tuples(size);
        }
        self.groups.push(Arc::new(group));
        self.group_for_dim.push(Some(self.groups.len() - 1));
        self.check_if_virtual_can_be_distinct();
        debug!(dim, size, tuples = self.num_tuples, too_big = self.too_big, "dimension added");
        Ok(dim)
    }

    fn multiply_num_tuples(&mut self, factor: u64) {
        match safe_multiply(self.num_tuples, factor) {
            Some(n) => self.num_tuples = n,
            None    => self.too_big = true,
        }
    }

    /// 只有一个维度行数 > 1 时，只有它能保持 distinct
    fn check_if_virtual_can_be_distinct(&mut self) {
        if self.dim_size.len() <= 1 {
            return;
        }
        let non_one = self.dim_size.iter().filter(|s| **s > 1).count();
        if non_one == 1 {
            for (d, s) in self.dim_size.iter().enumerate() {
                self.can_be_distinct[d] = *s > 1;
            }
        } else if non_one > 1 {
            self.can_be_distinct.iter_mut().for_each(|c| *c = false);
        }
    }

    /// 压紧组表并重建 维度 → 组 映射
    fn fill_group_for_dim(&mut self) {
        self.group_for_dim = vec![None; self.dim_size.len()];
        for (i, g) in self.groups.iter().enumerate() {
            for d in g.dims() {
                if d < self.group_for_dim.len() {
                    debug_assert!(self.group_for_dim[d].is_none(), "dimension {d} in two groups");
                    self.group_for_dim[d] = Some(i);
                }
            }
        }
        debug_assert!(self.group_for_dim.iter().all(|g| g.is_some()), "dimension not covered by any group");
    }

    /// 用新组替换所有与 involved 相交的旧组
    pub(crate) fn install_groups(&mut self, involved: &DimensionVector, new_groups: Vec<DimensionGroup>) {
        let before = self.groups.len();
        self.groups.retain(|g| !g.dims().iter().any(|d| involved.get(*d)));
        let replaced = before - self.groups.len();
        let added = new_groups.len();
        self.groups.extend(new_groups.into_iter().map(Arc::new));
        self.fill_group_for_dim();
        self.update_num_tuples();
        debug!(replaced, added, tuples = self.num_tuples, layout = %self, "multi-index generation committed");
    }

    // ── 元组数 ────────────────────────────────────────────────────────────────

    pub fn num_tuples(&self) -> Result<u64> {
        if self.too_big { Err(OlapError::TooManyTuples) } else { Ok(self.num_tuples) }
    }

    /// dims 所涉及组的元组数之积；溢出时 fail_on_overflow 为 false 则返回 u64::MAX
    pub fn num_tuples_for(&self, dims: &DimensionVector, fail_on_overflow: bool) -> Result<u64> {
        let groups = self.list_involved_groups(dims);
        if groups.is_empty() {
            return Ok(0);
        }
        let mut n = 1u64;
        for g in groups {
            match safe_multiply(n, self.groups[g].num_tuples()) {
                Some(v) => n = v,
                None if fail_on_overflow => return Err(OlapError::TooManyTuples),
                None => return Ok(u64::MAX),
            }
        }
        Ok(n)
    }

    pub fn zero_tuples(&self)     -> bool { !self.too_big && self.num_tuples == 0 }
    pub fn too_many_tuples(&self) -> bool { self.too_big }

    pub fn update_num_tuples(&mut self) {
        self.too_big = false;
        if self.groups.is_empty() {
            self.num_tuples = 0;
            return;
        }
        self.num_tuples = 1;
        for i in 0..self.groups.len() {
            if matches!(self.groups[i].kind(), GroupKind::MultiMaterialized) {
                Arc::make_mut(&mut self.groups[i]).update_num_tuples();
            }
            let n = self.groups[i].num_tuples();
            self.multiply_num_tuples(n);
        }
    }

    // ── 查询维度 ──────────────────────────────────────────────────────────────

    pub fn filter(&self, d: DimId) -> Option<&Arc<Filter>> {
        self.group(d).and_then(|g| g.filter(d))
    }

    /// 可原地修改的 Filter（仅 Filter 组；其他持有者看到的内容不受影响）
    pub fn updatable_filter(&mut self, d: DimId) -> Option<&mut Filter> {
        let g = self.group_index(d)?;
        Arc::make_mut(&mut self.groups[g]).updatable_filter(d)
    }

    pub fn nulls_exist(&self, d: DimId) -> bool {
        self.group(d).is_some_and(|g| g.nulls_possible(d))
    }

    pub fn is_orderable(&self, d: DimId) -> bool {
        self.group(d).map_or(true, |g| g.is_orderable())
    }

    /// 当前存活的行数（组的元组数）
    pub fn dim_size(&self, d: DimId) -> u64 {
        self.group(d).map_or(0, |g| g.num_tuples())
    }

    /// 维度的原始行数
    pub fn orig_size(&self, d: DimId) -> u64 { self.dim_size[d] }

    pub fn can_be_distinct(&self, d: DimId) -> bool { self.can_be_distinct[d] }

    pub(crate) fn set_can_be_distinct(&mut self, d: DimId, v: bool) { self.can_be_distinct[d] = v; }

    /// 维度已被遗忘（不能再取行号）
    pub fn is_forgotten(&self, d: DimId) -> bool {
        self.group(d).is_some_and(|g| !g.dim_enabled(d))
    }

    pub fn is_used_in_output(&self, d: DimId) -> bool { self.used_in_output[d] }
    pub fn set_used_in_output(&mut self, d: DimId)    { self.used_in_output[d] = true; }
    pub fn reset_used_in_output(&mut self, d: DimId)  { self.used_in_output[d] = false; }

    /// 维度可能出现的非空包数上界
    pub fn max_num_packs(&self, d: DimId) -> u64 {
        if let Some(f) = self.filter(d) {
            return (0..f.num_blocks()).filter(|b| !f.is_empty_block(*b)).count() as u64;
        }
        ((self.dim_size[d] >> self.power) + 1).min(self.dim_size(d))
    }

    /// v 中任一维度被标记，则其所在组的所有维度都被标记；有新增标记时返回 true
    pub fn mark_involved_dim_groups(&self, v: &mut DimensionVector) -> bool {
        let mut added = false;
        for g in self.list_involved_groups(v) {
            for d in self.groups[g].dims() {
                if !v.get(d) {
                    v.set(d, true);
                    added = true;
                }
            }
        }
        added
    }

    /// v 涉及的组下标（按维度顺序首次出现）
    pub fn list_involved_groups(&self, v: &DimensionVector) -> Vec<usize> {
        let mut out = Vec::new();
        for d in v.iter() {
            if let Some(g) = self.group_index(d) {
                if !out.contains(&g) {
                    out.push(g);
                }
            }
        }
        out
    }

    // ── 锁 ────────────────────────────────────────────────────────────────────

    pub fn lock_for_get_index(&self, d: DimId) {
        if let Some(g) = self.group(d) {
            g.lock(d, 1);
        }
    }

    pub fn unlock_from_get_index(&self, d: DimId) {
        if let Some(g) = self.group(d) {
            g.unlock(d);
        }
    }

    pub fn lock_all_for_use(&self) {
        (0..self.num_dimensions()).for_each(|d| self.lock_for_get_index(d));
    }

    pub fn unlock_all_from_use(&self) {
        (0..self.num_dimensions()).for_each(|d| self.unlock_from_get_index(d));
    }

    pub fn lock_count(&self, d: DimId) -> usize {
        self.group(d).map_or(0, |g| g.lock_count(d))
    }

    /// 注册普通迭代器
    pub fn iterator_lock(&self) -> bool { self.gate.lock() }

    /// 注册更新迭代器
    pub fn iterator_updating_lock(&self) -> bool { self.gate.updating_lock() }

    pub fn iterator_unlock(&self) { self.gate.unlock() }

    // ── 变换 ──────────────────────────────────────────────────────────────────

    /// 只保留 fd 中为 1 的元组；fd 的下标是 `mit` 遍历顺序（含其包顺序）中的序号。
    ///
    /// `mit` 的维度必须覆盖完整的维度组。它会被重绕并走到末尾；
    /// 它自己在闸门上的读者登记不阻止原地更新。
    pub fn mi_filter_and(&mut self, mit: &mut MIIterator, fd: &Filter) -> Result<()> {
        let mut dims = mit.dims_used().clone();
        if dims.count() == 0 {
            return Err(OlapError::InvalidArgument("filter iterator uses no dimensions".into()));
        }
        if self.mark_involved_dim_groups(&mut dims) {
            return Err(OlapError::InvalidArgument(
                "filter iterator does not cover whole dimension groups".into(),
            ));
        }
        if self.num_dimensions() == 1 && self.groups.len() == 1
            && self.groups[0].kind() == GroupKind::Filter
        {
            return self.filter_and_in_place(mit, fd);
        }

        let new_tuples = fd.count_ones();
        let tips = JoinTips::new(self.num_dimensions());
        let mut contents = MINewContents::new(self, &tips);
        contents.set_dimensions(self, &dims);
        contents.init(self, new_tuples)?;
        mit.rewind();
        let mut f_pos = 0u64;
        while mit.is_valid() {
            if mit.packrow_started() {
                mit.check_killed()?;
            }
            if fd.get(f_pos) {
                for d in dims.iter() {
                    contents.set_new_table_value(d, mit.get(d));
                }
                contents.commit_new_table_values()?;
            }
            mit.advance();
            f_pos += 1;
        }
        contents.commit(self, new_tuples)
    }

    /// 单 Filter 维度：按 `mit` 的顺序收集要清除的行，批量提交，不重建维度组
    fn filter_and_in_place(&mut self, mit: &mut MIIterator, fd: &Filter) -> Result<()> {
        let own = i64::from(mit.reader_gate().is_some_and(|g| Arc::ptr_eq(g, &self.gate)));
        if !self.gate.exclusive_lock(own) {
            return Err(OlapError::IteratorLocked);
        }
        let result = (|| {
            let mut edits = PendingEdits::new();
            let mut f_pos = 0u64;
            mit.rewind();
            while mit.is_valid() {
                if mit.packrow_started() {
                    mit.check_killed()?;
                }
                if !fd.get(f_pos) {
                    edits.reset_delayed(mit.get(0));
                }
                mit.advance();
                f_pos += 1;
            }
            debug!(removed = edits.len(), "filter narrowed in place");
            self.updatable_filter(0)
                .ok_or_else(|| OlapError::InvalidArgument("dimension 0 is not filter-backed".into()))?
                .commit(edits)
        })();
        self.gate.exclusive_unlock(own);
        self.update_num_tuples();
        result
    }

    /// 丢弃 dims 所在组的逐行信息，只保留元组数
    pub fn make_count_only(&mut self, mat_tuples: u64, dims: &DimensionVector) {
        let mut dims = dims.clone();
        self.mark_involved_dim_groups(&mut dims);
        let group = MaterializedGroup::new(dims.clone(), mat_tuples);
        debug!(mat_tuples, dims = dims.count(), "multi-index collapsed to count only");
        self.install_groups(&dims, vec![DimensionGroup::Materialized(group)]);
    }

    /// 清空所有元组；给定 dim 时只清空该维度所在的组
    pub fn empty(&mut self, dim: Option<DimId>) {
        let targets: Vec<usize> = match dim {
            Some(d) => self.group_index(d).into_iter().collect(),
            None    => (0..self.groups.len()).collect(),
        };
        for g in targets {
            for d in self.groups[g].dims() {
                self.can_be_distinct[d] = true;
                self.used_in_output[d]  = true;
            }
            Arc::make_mut(&mut self.groups[g]).empty();
        }
        self.num_tuples = 0;
        self.too_big    = false;
    }
}

impl fmt::Display for MultiIndex {
    /// f = Filter，数字 = 第几个物化组，F / v = Virtual 的基准 / 伴随维度，- = 已遗忘
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut numbers = Vec::with_capacity(self.groups.len());
        let mut count = 0u32;
        for g in &self.groups {
            if matches!(g.kind(), GroupKind::Materialized | GroupKind::MultiMaterialized) {
                count += 1;
                numbers.push(count);
            } else {
                numbers.push(0);
            }
        }
        write!(f, "[")?;
        for d in 0..self.num_dimensions() {
            let Some(gi) = self.group_index(d) else {
                write!(f, "?")?;
                continue;
            };
            let g = &self.groups[gi];
            let c = if !g.dim_enabled(d) {
                '-'
            } else {
                match g.kind() {
                    GroupKind::Filter  => 'f',
                    GroupKind::Virtual => if g.filter(d).is_some() { 'F' } else { 'v' },
                    _ => char::from_digit(numbers[gi], 10).unwrap_or('T'),
                }
            };
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for MultiIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiIndex")
            .field("layout", &self.to_string())
            .field("num_tuples", &self.num_tuples)
            .field("too_big", &self.too_big)
            .finish()
    }
}
