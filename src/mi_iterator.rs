//! MultiIndex 迭代器
//!
//! 把若干维度组的迭代器拼成一个笛卡尔积迭代器，按包行（packrow）前进：
//!
//! ```text
//!   it[0]  it[1]  it[2]          it[0] 是最低位，变化最快
//!   ─────  ─────  ─────
//!   包内：先在 it[0] 当前包内走，回绕后 it[1] 包内前进 ……
//!   包间：it[0].next_packrow()；走完则 rewind 并推进 it[1] 的包 ……
//! ```
//!
//! 同一包行内所有子迭代器的当前包固定，包行大小 = 各子迭代器剩余包大小之积。
//! 只涉及一个 Filter 组时走单维快速路径，跳过级联。

use std::cmp::Reverse;
use std::sync::Arc;

use crate::common::{
    pack_of, safe_multiply, DimId, DimensionVector, OlapError, PackId, Result, RowId, NULL_PACK, NULL_ROW,
};
use crate::config::QueryContext;
use crate::dim_group::{DGIterator, DimensionGroup, GroupKind};
use crate::multi_index::{IteratorGate, MultiIndex};
use crate::pack_order::PackOrder;

/// 逐行取坐标的公共接口（表达式求值等只需要当前坐标）
pub trait TupleCursor {
    /// 维度 d 的当前行号；NULL_ROW 表示外连接补齐
    fn get(&self, d: DimId) -> RowId;
    fn cur_pack(&self, d: DimId) -> PackId;
    fn nulls_possible(&self, d: DimId) -> bool;
    fn power(&self) -> u32;

    /// 当前行在包内的偏移
    fn cur_inpack(&self, d: DimId) -> u32 {
        (self.get(d) & ((1u64 << self.power()) - 1)) as u32
    }
}

// ── 切分能力 ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    /// 不能切分
    Disabled,
    /// 单 Filter：按包号线性切分（rewind_to_pack + set_packs_to_go）
    Linear,
    /// 单 Multi-Materialized 组：按分片切分
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceCapability {
    pub kind:   SliceKind,
    /// 每段的元组数
    pub slices: Vec<u64>,
}

// ── MIIterator ────────────────────────────────────────────────────────────────

pub struct MIIterator {
    ctx:             Arc<QueryContext>,
    gate:            Arc<IteratorGate>,
    power:           u32,
    dims:            DimensionVector,
    /// 被迭代的组，与 its 一一对应
    groups:          Vec<Arc<DimensionGroup>>,
    its:             Vec<DGIterator>,
    it_for_dim:      Vec<Option<usize>>,
    cur_pos:         Vec<RowId>,
    cur_pack:        Vec<PackId>,
    valid:           bool,
    /// 未参与迭代的组的元组数之积（u64::MAX 表示过大）
    omitted_factor:  u64,
    num_tuples:      u64,
    /// 当前包行剩余步数（u64::MAX 表示过大）
    pack_size_left:  u64,
    packrow_started: bool,
    one_filter_dim:  Option<DimId>,
}

impl MIIterator {
    /// 遍历 dims 涉及的所有组
    pub fn new(mind: &MultiIndex, dims: &DimensionVector) -> Result<Self> {
        Self::build(mind, dims, None)
    }

    /// orders[d] 给出维度 d 的包访问顺序；组不支持时退回自然顺序
    pub fn ordered(mind: &MultiIndex, dims: &DimensionVector, orders: &[Option<PackOrder>]) -> Result<Self> {
        Self::build(mind, dims, Some(orders))
    }

    /// 遍历全部维度
    pub fn over_all(mind: &MultiIndex) -> Result<Self> {
        Self::new(mind, &DimensionVector::all(mind.num_dimensions()))
    }

    /// 只有一行的迭代器（常量表达式求值用）
    pub fn single_row(ctx: Arc<QueryContext>) -> Result<Self> {
        let mut mind = MultiIndex::new(ctx);
        mind.add_dimension_cross(1)?;
        Self::over_all(&mind)
    }

    fn build(mind: &MultiIndex, dims: &DimensionVector, orders: Option<&[Option<PackOrder>]>) -> Result<Self> {
        let n = mind.num_dimensions();
        let power = mind.power();
        let mut used = vec![false; mind.num_groups()];
        for d in dims.iter().filter(|d| *d < n) {
            if let Some(g) = mind.group_index(d) {
                used[g] = true;
            }
        }

        let mut num_tuples = 1u64;
        let mut omitted = 1u64;
        let mut any_used = false;
        for (i, g) in mind.groups().iter().enumerate() {
            let t = g.num_tuples();
            if used[i] {
                any_used = true;
                num_tuples = safe_multiply(num_tuples, t).unwrap_or(u64::MAX);
            } else {
                omitted = safe_multiply(omitted, t).unwrap_or(u64::MAX);
            }
        }
        if !any_used {
            num_tuples = 0;
        }

        let mut groups = Vec::new();
        let mut its    = Vec::new();

        // 有序的 Filter 组在最前
        if let Some(orders) = orders {
            for d in dims.iter().filter(|d| *d < n) {
                let Some(gi) = mind.group_index(d) else { continue };
                let Some(Some(order)) = orders.get(d) else { continue };
                let g = &mind.groups()[gi];
                if !used[gi] || g.filter(d).is_none() {
                    continue;
                }
                if let Some(it) = g.new_ordered_iterator(dims, order, power) {
                    groups.push(g.clone());
                    its.push(it);
                    used[gi] = false;
                }
            }
        }

        // 其余 Filter / Virtual 组按密度权重从高到低
        let mut filtered: Vec<(Reverse<u32>, usize)> = mind.groups().iter().enumerate()
            .filter(|(i, g)| used[*i] && matches!(g.kind(), GroupKind::Filter | GroupKind::Virtual))
            .map(|(i, g)| (Reverse(g.default_filter().map_or(0, |f| f.density_weight())), i))
            .collect();
        filtered.sort();
        for (_, gi) in filtered {
            let g = &mind.groups()[gi];
            its.push(g.new_iterator(dims, power));
            groups.push(g.clone());
            used[gi] = false;
        }

        // 物化组最后
        for (gi, g) in mind.groups().iter().enumerate() {
            if used[gi] {
                its.push(g.new_iterator(dims, power));
                groups.push(g.clone());
            }
        }

        let mut it_for_dim = vec![None; n];
        for d in dims.iter().filter(|d| *d < n) {
            it_for_dim[d] = groups.iter().position(|g| g.dim_used(d));
        }

        let gate = mind.gate().clone();
        if n > 0 && !gate.lock() {
            return Err(OlapError::IteratorLocked);
        }
        for d in dims.iter() {
            if let Some(i) = it_for_dim.get(d).copied().flatten() {
                groups[i].lock(d, 1);
            }
        }

        let one_filter_dim = match (groups.len(), groups.first().map(|g| g.kind())) {
            (1, Some(GroupKind::Filter)) => dims.iter().find(|d| *d < n),
            _ => None,
        };

        let mut it = Self {
            ctx:             mind.ctx().clone(),
            gate,
            power,
            dims:            dims.clone(),
            groups,
            its,
            it_for_dim,
            cur_pos:         vec![NULL_ROW; n],
            cur_pack:        vec![NULL_PACK; n],
            valid:           false,
            omitted_factor:  omitted,
            num_tuples,
            pack_size_left:  0,
            packrow_started: false,
            one_filter_dim,
        };
        it.rewind();
        if !it.valid {
            it.num_tuples = 0;
        }
        Ok(it)
    }

    /// 复制当前位置；重新登记迭代器闸门与维度锁
    pub fn try_clone(&self) -> Result<Self> {
        if !self.cur_pos.is_empty() && !self.gate.lock() {
            return Err(OlapError::IteratorLocked);
        }
        self.lock_dims();
        Ok(Self {
            ctx:             self.ctx.clone(),
            gate:            self.gate.clone(),
            power:           self.power,
            dims:            self.dims.clone(),
            groups:          self.groups.clone(),
            its:             self.its.clone(),
            it_for_dim:      self.it_for_dim.clone(),
            cur_pos:         self.cur_pos.clone(),
            cur_pack:        self.cur_pack.clone(),
            valid:           self.valid,
            omitted_factor:  self.omitted_factor,
            num_tuples:      self.num_tuples,
            pack_size_left:  self.pack_size_left,
            packrow_started: self.packrow_started,
            one_filter_dim:  self.one_filter_dim,
        })
    }

    fn lock_dims(&self) {
        for d in self.dims.iter() {
            if let Some(i) = self.it_for_dim.get(d).copied().flatten() {
                self.groups[i].lock(d, 1);
            }
        }
    }

    fn fill(&mut self, i: usize) {
        self.its[i].fill_current_pos(&mut self.cur_pos, &mut self.cur_pack, &self.dims);
    }

    // ── 遍历 ──────────────────────────────────────────────────────────────────

    pub fn rewind(&mut self) {
        self.valid = true;
        self.pack_size_left = 0;
        if self.its.is_empty() {
            self.valid = false;
            return;
        }
        for i in 0..self.its.len() {
            self.its[i].rewind();
            if !self.its[i].is_valid() {
                self.valid = false;
                return;
            }
            self.fill(i);
        }
        self.init_next_packrow();
    }

    fn init_next_packrow(&mut self) {
        if !self.valid {
            return;
        }
        let mut size = 1u64;
        for it in &self.its {
            size = safe_multiply(size, it.pack_size_left()).unwrap_or(u64::MAX);
        }
        self.pack_size_left  = size;
        self.packrow_started = true;
    }

    /// 前进一个元组
    pub fn advance(&mut self) {
        debug_assert!(self.valid, "advance past the end");
        if !self.valid {
            return;
        }
        self.packrow_started = false;
        if let Some(d) = self.one_filter_dim {
            let it = &mut self.its[0];
            it.advance();
            self.valid = it.is_valid();
            self.pack_size_left -= 1;
            if self.valid {
                self.cur_pos[d] = it.cur_pos(d);
                if self.pack_size_left == 0 {
                    self.cur_pack[d] = it.cur_pack(d);
                    self.init_next_packrow();
                }
            }
        } else {
            self.general_increment();
            if self.pack_size_left != u64::MAX {
                self.pack_size_left -= 1;
                if self.pack_size_left == 0 {
                    self.init_next_packrow();
                }
            }
        }
    }

    fn general_increment(&mut self) {
        let mut done = false;
        for i in 0..self.its.len() {
            done = self.its[i].next_inside_pack();
            self.fill(i);
            if done {
                break;
            }
        }
        if done {
            return;
        }
        for i in 0..self.its.len() {
            self.its[i].next_packrow();
            if self.its[i].is_valid() {
                done = true;
            } else {
                self.its[i].rewind();
                if !self.its[i].is_valid() {
                    break;
                }
            }
            self.fill(i);
            if done {
                break;
            }
        }
        if !done {
            self.valid = false;
        }
    }

    /// 跳到下一个包行的开头
    pub fn next_packrow(&mut self) {
        if !self.valid {
            return;
        }
        let last = self.its.len() - 1;
        let mut done = false;
        for i in 0..self.its.len() {
            self.its[i].next_packrow();
            if self.its[i].is_valid() {
                done = true;
                self.fill(i);
            } else if i < last {
                self.its[i].rewind();
                if !self.its[i].is_valid() {
                    break;
                }
                self.fill(i);
            }
            if done {
                break;
            }
        }
        if done {
            self.init_next_packrow();
        } else {
            self.valid = false;
        }
    }

    /// 跳过 offset 个元组（先整包跳，再逐个）
    pub fn skip(&mut self, offset: u64) {
        let mut skipped = 0u64;
        while self.valid && skipped.saturating_add(self.pack_size_left) < offset {
            skipped += self.pack_size_left;
            self.next_packrow();
        }
        while self.valid && skipped < offset {
            skipped += 1;
            self.advance();
        }
    }

    // ── 随机定位与切分 ────────────────────────────────────────────────────────

    /// 只对单 Filter 或单组迭代器有效；包为空时定位到下一个非空包并返回 false
    pub fn rewind_to_pack(&mut self, pack: PackId) -> bool {
        if self.groups.len() != 1 {
            return false;
        }
        let res = self.its[0].rewind_to_pack(pack);
        self.valid = self.its[0].is_valid();
        if self.valid {
            self.fill(0);
            self.init_next_packrow();
        }
        res
    }

    /// 单 Filter 迭代器定位到给定行（该行必须存活）
    pub fn rewind_to_row(&mut self, row: RowId) {
        debug_assert!(self.one_filter_dim.is_some(), "rewind_to_row needs a single filter dimension");
        if self.one_filter_dim.is_none() {
            return;
        }
        self.its[0].rewind_to_row(row);
        self.valid = self.its[0].is_valid();
        if self.valid {
            self.fill(0);
            self.init_next_packrow();
        }
    }

    /// 再访问 n 个包后失效（含当前包）；None 取消限制
    pub fn set_packs_to_go(&mut self, n: Option<usize>) {
        debug_assert!(self.groups.len() == 1, "packs-to-go needs a single group");
        if let Some(it) = self.its.first_mut() {
            it.set_packs_to_go(n);
        }
    }

    pub fn slice_capability(&self) -> SliceCapability {
        if self.one_filter_dim.is_some() {
            if let Some(slices) = self.its[0].slices() {
                return SliceCapability { kind: SliceKind::Linear, slices };
            }
        } else if self.its.len() == 1 {
            if let Some(slices) = self.its[0].slices() {
                return SliceCapability { kind: SliceKind::Fixed, slices };
            }
        }
        SliceCapability { kind: SliceKind::Disabled, slices: Vec::new() }
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    pub fn is_valid(&self) -> bool { self.valid }

    /// 维度 d 的当前行号；未参与迭代的维度为 NULL_ROW
    pub fn get(&self, d: DimId) -> RowId {
        debug_assert!(self.valid);
        self.cur_pos.get(d).copied().unwrap_or(NULL_ROW)
    }

    pub fn cur_pack(&self, d: DimId) -> PackId {
        self.cur_pack.get(d).copied().unwrap_or(NULL_PACK)
    }

    /// 所有维度的当前行号
    pub fn positions(&self) -> &[RowId] { &self.cur_pos }

    pub fn pack_size_left(&self) -> u64 { self.pack_size_left }

    /// 当前元组是包行的第一个
    pub fn packrow_started(&self) -> bool { self.packrow_started }

    /// 只迭代一个组，且当前包行恰是维度 d 的完整包
    pub fn whole_pack(&self, d: DimId) -> bool {
        self.its.len() == 1 && self.sub_iter(d).is_some_and(|it| it.whole_pack(d))
    }

    /// 当前包行中维度 d 可能出现 NULL 行号
    pub fn nulls_exist(&self, d: DimId) -> bool {
        self.sub_iter(d).is_some_and(|it| it.nulls_exist(d))
    }

    pub fn any_nulls_exist(&self) -> bool {
        self.dims.iter().any(|d| self.nulls_exist(d))
    }

    /// 并行执行时越过本包行前必须同步
    pub fn barrier_after_packrow(&self) -> bool {
        self.valid && self.its.iter().any(|it| it.barrier_after_packrow())
    }

    /// 维度 d 往后第 ahead 个包（预取用）；未知时 None
    pub fn next_packrow_ahead(&self, d: DimId, ahead: usize) -> Option<PackId> {
        self.sub_iter(d).and_then(|it| it.next_packrow_ahead(d, ahead))
    }

    fn sub_iter(&self, d: DimId) -> Option<&DGIterator> {
        self.it_for_dim.get(d).copied().flatten().map(|i| &self.its[i])
    }

    pub fn is_thread_safe(&self) -> bool { self.groups.iter().all(|g| g.is_thread_safe()) }

    /// 在闸门上登记为读者时返回该闸门
    pub(crate) fn reader_gate(&self) -> Option<&Arc<IteratorGate>> {
        (!self.cur_pos.is_empty()).then_some(&self.gate)
    }

    /// 协作取消点；同时报告 Index Table 换入失败
    pub fn check_killed(&self) -> Result<()> {
        self.ctx.check_killed()?;
        self.groups.iter().try_for_each(|g| g.check_fault())
    }

    /// 将要迭代的元组数（u64::MAX 表示过大）
    pub fn num_tuples(&self) -> u64 { self.num_tuples }

    /// 每一步省略掉的元组数（未参与迭代的组），用作 sum/count 的系数
    pub fn omitted_factor(&self) -> u64 { self.omitted_factor }

    pub fn dims_used(&self) -> &DimensionVector { &self.dims }
    pub fn dim_used(&self, d: DimId) -> bool { self.dims.get(d) }
    pub fn num_dimensions(&self) -> usize { self.cur_pos.len() }
    pub fn power(&self) -> u32 { self.power }
    pub fn one_filter_dim(&self) -> Option<DimId> { self.one_filter_dim }
    pub fn ctx(&self) -> &Arc<QueryContext> { &self.ctx }

    // ── 包内迭代（MIInpackIterator 使用）──────────────────────────────────────

    fn inpack_increment(&mut self) {
        self.packrow_started = false;
        if let Some(d) = self.one_filter_dim {
            let it = &mut self.its[0];
            self.valid = it.next_inside_pack() && it.is_valid();
            if self.valid {
                self.cur_pos[d] = it.cur_pos(d);
            }
        } else {
            let mut done = false;
            for i in 0..self.its.len() {
                done = self.its[i].next_inside_pack();
                self.fill(i);
                if done {
                    break;
                }
            }
            if !done {
                self.valid = false;
            }
        }
        self.pack_size_left = self.pack_size_left.saturating_sub(1);
        if self.pack_size_left == 0 {
            self.valid = false;
        }
    }
}

impl TupleCursor for MIIterator {
    fn get(&self, d: DimId) -> RowId { MIIterator::get(self, d) }
    fn cur_pack(&self, d: DimId) -> PackId { MIIterator::cur_pack(self, d) }
    fn nulls_possible(&self, d: DimId) -> bool { self.nulls_exist(d) }
    fn power(&self) -> u32 { self.power }
}

impl Drop for MIIterator {
    fn drop(&mut self) {
        if !self.cur_pos.is_empty() {
            self.gate.unlock();
        }
        for d in self.dims.iter() {
            if let Some(i) = self.it_for_dim.get(d).copied().flatten() {
                self.groups[i].unlock(d);
            }
        }
    }
}

impl std::fmt::Debug for MIIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MIIterator")
            .field("groups", &self.groups.len())
            .field("valid", &self.valid)
            .field("cur_pos", &self.cur_pos)
            .field("pack_size_left", &self.pack_size_left)
            .field("one_filter_dim", &self.one_filter_dim)
            .finish()
    }
}

// ── MIDummyIterator ───────────────────────────────────────────────────────────

/// 手工拼装的坐标：从其他迭代器合并或逐维设置，不能前进
#[derive(Debug, Clone)]
pub struct MIDummyIterator {
    power:    u32,
    cur_pos:  Vec<RowId>,
    cur_pack: Vec<PackId>,
}

impl MIDummyIterator {
    pub fn new(num_dims: usize, power: u32) -> Self {
        Self { power, cur_pos: vec![0; num_dims], cur_pack: vec![0; num_dims] }
    }

    pub fn for_index(mind: &MultiIndex) -> Self {
        Self {
            power:    mind.power(),
            cur_pos:  vec![NULL_ROW; mind.num_dimensions()],
            cur_pack: vec![NULL_PACK; mind.num_dimensions()],
        }
    }

    /// 当前位置的快照
    pub fn from_iterator(sec: &MIIterator) -> Self {
        Self { power: sec.power, cur_pos: sec.cur_pos.clone(), cur_pack: sec.cur_pack.clone() }
    }

    /// 复制 sec 所迭代维度的当前位置
    pub fn combine(&mut self, sec: &MIIterator) {
        let n = self.cur_pos.len().min(sec.cur_pos.len());
        for d in sec.dims_used().iter().filter(|d| *d < n) {
            self.cur_pos[d]  = sec.cur_pos[d];
            self.cur_pack[d] = sec.cur_pack[d];
        }
    }

    pub fn set(&mut self, d: DimId, row: RowId) {
        debug_assert!(d < self.cur_pos.len());
        self.cur_pos[d]  = row;
        self.cur_pack[d] = pack_of(row, self.power);
    }

    /// 定位到包 p 的第一行
    pub fn set_pack(&mut self, d: DimId, p: PackId) {
        debug_assert!(d < self.cur_pos.len());
        self.cur_pos[d]  = (p as u64) << self.power;
        self.cur_pack[d] = p;
    }

    pub fn any_nulls(&self) -> bool { self.cur_pos.iter().any(|r| *r == NULL_ROW) }

    pub fn num_dimensions(&self) -> usize { self.cur_pos.len() }

    pub fn pack_size_left(&self) -> u64 { 1 }
    pub fn num_tuples(&self) -> u64 { 1 }
    pub fn whole_pack(&self, _d: DimId) -> bool { false }

    pub fn next_packrow_ahead(&self, d: DimId, _ahead: usize) -> Option<PackId> {
        Some(self.cur_pack[d])
    }
}

impl TupleCursor for MIDummyIterator {
    fn get(&self, d: DimId) -> RowId { self.cur_pos[d] }
    fn cur_pack(&self, d: DimId) -> PackId { self.cur_pack[d] }
    fn nulls_possible(&self, d: DimId) -> bool { self.cur_pos[d] == NULL_ROW }
    fn power(&self) -> u32 { self.power }
}

// ── MIInpackIterator ──────────────────────────────────────────────────────────

/// 只走完源迭代器当前包行的剩余部分
#[derive(Debug)]
pub struct MIInpackIterator {
    inner: MIIterator,
}

impl MIInpackIterator {
    pub fn new(sec: &MIIterator) -> Result<Self> {
        Ok(Self { inner: sec.try_clone()? })
    }

    pub fn is_valid(&self) -> bool { self.inner.valid }

    pub fn advance(&mut self) {
        debug_assert!(self.inner.valid);
        if self.inner.valid {
            self.inner.inpack_increment();
        }
    }

    /// 不会进入下一个包行
    pub fn next_packrow(&mut self) { self.inner.valid = false; }

    pub fn get(&self, d: DimId) -> RowId { self.inner.get(d) }
    pub fn cur_pack(&self, d: DimId) -> PackId { self.inner.cur_pack(d) }
    pub fn pack_size_left(&self) -> u64 { self.inner.pack_size_left }
    pub fn packrow_started(&self) -> bool { self.inner.packrow_started }
    pub fn nulls_exist(&self, d: DimId) -> bool { self.inner.nulls_exist(d) }
    pub fn whole_pack(&self, d: DimId) -> bool { self.inner.whole_pack(d) }
    pub fn dims_used(&self) -> &DimensionVector { self.inner.dims_used() }

    /// 不据此预取
    pub fn next_packrow_ahead(&self, _d: DimId, _ahead: usize) -> Option<PackId> { None }
}

impl TupleCursor for MIInpackIterator {
    fn get(&self, d: DimId) -> RowId { self.inner.get(d) }
    fn cur_pack(&self, d: DimId) -> PackId { self.inner.cur_pack(d) }
    fn nulls_possible(&self, d: DimId) -> bool { self.inner.nulls_exist(d) }
    fn power(&self) -> u32 { self.inner.power }
}
