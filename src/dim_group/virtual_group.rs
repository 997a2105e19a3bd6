//! Virtual 维度组
//!
//! 基准维度由 Filter 驱动，伴随维度用同一个稠密位置查自己的 Index Table：
//!
//! ```text
//!   dense pos:  pack_start[b] + (块 b 内的秩)
//!   base dim:   filter 中第 pos 个 1
//!   other dim:  tables[d].get(pos)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::common::{DimId, DimensionVector, PackId, Result, RowId, NULL_PACK, NULL_ROW};
use crate::filter::{Filter, OnesCursor};
use crate::index_table::IndexTable;
use crate::pack_order::PackOrder;

#[derive(Debug)]
pub struct VirtualGroup {
    pub(crate) dims_used:  DimensionVector,
    pub(crate) base_dim:   DimId,
    pub(crate) filter:     Arc<Filter>,
    pub(crate) tables:     Vec<Option<Arc<IndexTable>>>,
    pub(crate) nulls:      Vec<bool>,
    /// 每个块第一个 1 的稠密位置（首次建迭代器时计算）
    pack_start:            OnceLock<Arc<[u64]>>,
    locks:                 AtomicUsize,
}

impl VirtualGroup {
    pub fn new(dims_used: DimensionVector, base_dim: DimId, filter: Filter) -> Self {
        Self::from_shared(dims_used, base_dim, Arc::new(filter))
    }

    pub(crate) fn from_shared(dims_used: DimensionVector, base_dim: DimId, filter: Arc<Filter>) -> Self {
        let n = dims_used.len();
        Self {
            dims_used, base_dim, filter,
            tables:     vec![None; n],
            nulls:      vec![false; n],
            pack_start: OnceLock::new(),
            locks:      AtomicUsize::new(0),
        }
    }

    pub fn base_dim(&self) -> DimId { self.base_dim }
    pub fn filter(&self) -> &Arc<Filter> { &self.filter }
    pub fn num_tuples(&self) -> u64 { self.filter.count_ones() }

    pub fn table(&self, dim: DimId) -> Option<&Arc<IndexTable>> {
        self.tables.get(dim).and_then(|t| t.as_ref())
    }

    pub fn new_dimension_content(&mut self, dim: DimId, table: IndexTable, nulls: bool) {
        debug_assert!(self.dims_used.get(dim) && dim != self.base_dim);
        if dim >= self.tables.len() {
            self.tables.resize(dim + 1, None);
            self.nulls.resize(dim + 1, false);
        }
        self.tables[dim] = Some(Arc::new(table));
        self.nulls[dim]  = nulls;
    }

    pub(crate) fn pack_start(&self) -> Arc<[u64]> {
        self.pack_start.get_or_init(|| {
            let mut acc = 0u64;
            (0..self.filter.num_blocks())
                .map(|b| {
                    let start = acc;
                    acc += self.filter.count_ones_in_block(b) as u64;
                    start
                })
                .collect::<Vec<_>>()
                .into()
        }).clone()
    }

    /// 所有伴随表都只有一页时块序与行序一致，才能按任意包序访问
    pub fn is_orderable(&self) -> bool {
        self.tables.iter().flatten().all(|t| t.end_of_block(0) >= t.size())
    }

    pub fn lock(&self, dim: DimId, n: usize) {
        match self.table(dim) {
            Some(t) => t.lock(n),
            None if dim == self.base_dim => { self.locks.fetch_add(n, Ordering::AcqRel); }
            None => {}
        }
    }

    pub fn unlock(&self, dim: DimId) {
        match self.table(dim) {
            Some(t) => t.unlock(),
            None if dim == self.base_dim => { self.locks.fetch_sub(1, Ordering::AcqRel); }
            None => {}
        }
    }

    pub fn lock_count(&self, dim: DimId) -> usize {
        match self.table(dim) {
            Some(t) => t.lock_count(),
            None if dim == self.base_dim => self.locks.load(Ordering::Acquire),
            None => 0,
        }
    }

    pub(crate) fn empty(&mut self) {
        Arc::make_mut(&mut self.filter).reset_all();
        self.tables.iter_mut().for_each(|t| *t = None);
        self.pack_start = OnceLock::new();
    }

    pub(crate) fn deep_copy(&self) -> Result<Self> {
        let mut g = Self::new(self.dims_used.clone(), self.base_dim, self.filter.deep_copy());
        for (d, t) in self.tables.iter().enumerate() {
            if let Some(t) = t {
                g.new_dimension_content(d, t.try_clone()?, self.nulls[d]);
            }
        }
        Ok(g)
    }
}

impl Clone for VirtualGroup {
    /// 共享 filter 与表；不继承锁计数
    fn clone(&self) -> Self {
        Self {
            dims_used:  self.dims_used.clone(),
            base_dim:   self.base_dim,
            filter:     self.filter.clone(),
            tables:     self.tables.clone(),
            nulls:      self.nulls.clone(),
            pack_start: self.pack_start.clone(),
            locks:      AtomicUsize::new(0),
        }
    }
}

// ── 迭代器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VirtualIter {
    power:      u32,
    base_dim:   DimId,
    filter:     Arc<Filter>,
    cursor:     OnesCursor,
    tables:     Vec<Option<Arc<IndexTable>>>,
    nulls:      Vec<bool>,
    pack_start: Arc<[u64]>,
    num_tuples: u64,
}

impl VirtualIter {
    pub fn new(group: &VirtualGroup, dims: &DimensionVector, power: u32) -> Self {
        Self::build(group, dims, power, OnesCursor::new(&group.filter))
    }

    pub fn ordered(group: &VirtualGroup, dims: &DimensionVector, power: u32, order: &PackOrder) -> Self {
        Self::build(group, dims, power, OnesCursor::ordered(&group.filter, order))
    }

    fn build(group: &VirtualGroup, dims: &DimensionVector, power: u32, cursor: OnesCursor) -> Self {
        let tables = group.tables.iter().enumerate()
            .map(|(d, t)| if dims.get(d) { t.clone() } else { None })
            .collect();
        Self {
            power,
            base_dim:   group.base_dim,
            filter:     group.filter.clone(),
            cursor,
            tables,
            nulls:      group.nulls.clone(),
            pack_start: group.pack_start(),
            num_tuples: group.num_tuples(),
        }
    }

    /// 当前稠密位置
    pub fn dense_pos(&self) -> u64 {
        let b = self.cursor.current_pack() as usize;
        let rank = self.filter.count_ones_in_block(b) as u64 - self.cursor.pack_size_left();
        self.pack_start[b] + rank
    }

    pub fn rewind(&mut self)                   { self.cursor.rewind(&self.filter) }
    pub fn advance(&mut self)                  { self.cursor.advance(&self.filter) }
    pub fn next_packrow(&mut self)             { self.cursor.next_pack(&self.filter) }
    pub fn next_inside_pack(&mut self) -> bool { self.cursor.next_inside_pack(&self.filter) }
    pub fn is_valid(&self) -> bool             { self.cursor.is_valid() }
    pub fn pack_size_left(&self) -> u64        { self.cursor.pack_size_left() }

    fn companion(&self, d: DimId) -> Option<&Arc<IndexTable>> {
        self.tables.get(d).and_then(|t| t.as_ref())
    }

    pub fn cur_pos(&self, d: DimId) -> RowId {
        if d == self.base_dim {
            return self.cursor.position();
        }
        match self.companion(d) {
            Some(t) => t.get(self.dense_pos()),
            None    => NULL_ROW,
        }
    }

    pub fn cur_pack(&self, d: DimId) -> PackId {
        if d == self.base_dim {
            return self.cursor.current_pack();
        }
        match self.cur_pos(d) {
            NULL_ROW => NULL_PACK,
            row      => (row >> self.power) as PackId,
        }
    }

    pub fn whole_pack(&self, d: DimId) -> bool {
        d == self.base_dim
            && self.cursor.is_valid()
            && self.filter.is_full_block(self.cursor.current_pack() as usize)
    }

    pub fn nulls_exist(&self, d: DimId) -> bool {
        d != self.base_dim && self.nulls.get(d).copied().unwrap_or(false)
    }

    /// 当前或下一个包行可能跨越伴随表的页边界时需要同步
    pub fn barrier_after_packrow(&self) -> bool {
        if self.cursor.is_ordered() || !self.cursor.is_valid() {
            return false;
        }
        let pos = self.dense_pos();
        let end = pos + self.cursor.pack_size_left();
        if end >= self.num_tuples {
            return true;
        }
        let next_two = end + (1u64 << self.power);
        self.tables.iter().flatten().any(|t| next_two >= t.end_of_block(pos))
    }

    pub fn next_packrow_ahead(&self, d: DimId, ahead: usize) -> Option<PackId> {
        if d == self.base_dim {
            self.cursor.lookahead(&self.filter, ahead)
        } else {
            Some(self.cur_pack(d))
        }
    }

    pub fn rewind_to_pack(&mut self, pack: PackId) -> bool {
        self.cursor.rewind_to_pack(&self.filter, pack)
    }

    pub fn rewind_to_row(&mut self, row: RowId) { self.cursor.rewind_to_row(&self.filter, row) }

    pub fn set_packs_to_go(&mut self, n: Option<usize>) { self.cursor.set_packs_to_go(n) }

    pub fn slices(&self) -> Vec<u64> { self.cursor.slices(&self.filter) }

    pub fn fill_current_pos(&self, cur_pos: &mut [RowId], cur_pack: &mut [PackId], dims: &DimensionVector) {
        if dims.get(self.base_dim) {
            cur_pos[self.base_dim]  = self.cursor.position();
            cur_pack[self.base_dim] = self.cursor.current_pack();
        }
        let pos = self.dense_pos();
        for (d, t) in self.tables.iter().enumerate() {
            if let (true, Some(t)) = (dims.get(d), t) {
                let row = t.get(pos);
                cur_pos[d]  = row;
                cur_pack[d] = if row == NULL_ROW { NULL_PACK } else { (row >> self.power) as PackId };
            }
        }
    }
}
