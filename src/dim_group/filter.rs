//! Filter 型维度组：单维度，稠密位置 = 1 位中的秩

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::common::{DimId, PackId, RowId};
use crate::filter::{Filter, OnesCursor};
use crate::pack_order::PackOrder;

#[derive(Debug)]
pub struct FilterGroup {
    pub(crate) dim:    DimId,
    pub(crate) filter: Arc<Filter>,
    locks:             AtomicUsize,
}

impl FilterGroup {
    pub fn new(dim: DimId, filter: Filter) -> Self {
        Self { dim, filter: Arc::new(filter), locks: AtomicUsize::new(0) }
    }

    /// 共享同一个 Filter 存储
    pub(crate) fn from_shared(dim: DimId, filter: Arc<Filter>) -> Self {
        Self { dim, filter, locks: AtomicUsize::new(0) }
    }

    pub fn dim(&self)         -> DimId        { self.dim }
    pub fn filter(&self)      -> &Arc<Filter> { &self.filter }
    pub fn num_tuples(&self)  -> u64          { self.filter.count_ones() }

    /// 写时复制：有其他持有者时先复制块表
    pub fn filter_mut(&mut self) -> &mut Filter { Arc::make_mut(&mut self.filter) }

    pub fn lock(&self, n: usize) { self.locks.fetch_add(n, Ordering::AcqRel); }
    pub fn unlock(&self)         { self.locks.fetch_sub(1, Ordering::AcqRel); }
    pub fn lock_count(&self) -> usize { self.locks.load(Ordering::Acquire) }
}

impl Clone for FilterGroup {
    /// 新组不继承锁计数
    fn clone(&self) -> Self {
        Self::from_shared(self.dim, self.filter.clone())
    }
}

// ── 迭代器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FilterIter {
    dim:    DimId,
    filter: Arc<Filter>,
    cursor: OnesCursor,
}

impl FilterIter {
    pub fn new(group: &FilterGroup) -> Self {
        Self {
            dim:    group.dim,
            cursor: OnesCursor::new(&group.filter),
            filter: group.filter.clone(),
        }
    }

    pub fn ordered(group: &FilterGroup, order: &PackOrder) -> Self {
        Self {
            dim:    group.dim,
            cursor: OnesCursor::ordered(&group.filter, order),
            filter: group.filter.clone(),
        }
    }

    pub fn dim(&self) -> DimId { self.dim }
    pub fn filter(&self) -> &Arc<Filter> { &self.filter }
    pub fn cursor(&self) -> &OnesCursor { &self.cursor }
    pub fn is_ordered(&self) -> bool { self.cursor.is_ordered() }

    pub fn rewind(&mut self)                 { self.cursor.rewind(&self.filter) }
    pub fn advance(&mut self)                { self.cursor.advance(&self.filter) }
    pub fn next_packrow(&mut self)           { self.cursor.next_pack(&self.filter) }
    pub fn next_inside_pack(&mut self) -> bool { self.cursor.next_inside_pack(&self.filter) }
    pub fn is_valid(&self) -> bool           { self.cursor.is_valid() }

    pub fn cur_pos(&self)  -> RowId  { self.cursor.position() }
    pub fn cur_pack(&self) -> PackId { self.cursor.current_pack() }
    pub fn pack_size_left(&self) -> u64 { self.cursor.pack_size_left() }

    pub fn whole_pack(&self) -> bool {
        self.cursor.is_valid() && self.filter.is_full_block(self.cursor.current_pack() as usize)
    }

    /// 乱序访问时必须在包边界同步
    pub fn barrier_after_packrow(&self) -> bool { self.cursor.is_ordered() }

    pub fn next_packrow_ahead(&self, ahead: usize) -> Option<PackId> {
        self.cursor.lookahead(&self.filter, ahead)
    }

    pub fn rewind_to_pack(&mut self, pack: PackId) -> bool {
        self.cursor.rewind_to_pack(&self.filter, pack)
    }

    pub fn rewind_to_row(&mut self, row: RowId) { self.cursor.rewind_to_row(&self.filter, row) }

    pub fn set_packs_to_go(&mut self, n: Option<usize>) { self.cursor.set_packs_to_go(n) }

    pub fn slices(&self) -> Vec<u64> { self.cursor.slices(&self.filter) }
}
