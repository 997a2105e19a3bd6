//! Filter 的 1 位游标
//!
//! `OnesCursor` 不持有对 Filter 的借用，所有方法都显式传入 `&Filter`，
//! 因此可以和 `Arc<Filter>` 一起放进迭代器结构体里（不会自引用）。
//! 需要标准 `Iterator` 时用 [`FilterOnesIterator`]。

use std::sync::Arc;

use crate::common::{PackId, RowId};
use crate::pack_order::PackOrder;

use super::{BlockStatus, Filter};

#[derive(Debug, Clone)]
pub struct OnesCursor {
    power:       u32,
    /// 访问序列（None = 自然顺序）
    order:       Option<Arc<[PackId]>>,
    /// 当前块在访问序列中的下标
    seq:         usize,
    block:       usize,
    in_block:    u32,
    /// 当前块内剩余的 1（含当前位置）
    left:        u32,
    valid:       bool,
    packs_to_go: Option<usize>,
    packs_done:  usize,
}

impl OnesCursor {
    /// 定位到第一个 1
    pub fn new(filter: &Filter) -> Self {
        let mut c = Self {
            power:       filter.power(),
            order:       None,
            seq:         0,
            block:       0,
            in_block:    0,
            left:        0,
            valid:       false,
            packs_to_go: None,
            packs_done:  0,
        };
        c.rewind(filter);
        c
    }

    /// 按给定包序访问非空块
    pub fn ordered(filter: &Filter, order: &PackOrder) -> Self {
        let mut c = Self::new(filter);
        c.order = Some(order.resolve(filter.num_blocks()));
        c.rewind(filter);
        c
    }

    pub fn is_ordered(&self) -> bool { self.order.is_some() }

    fn seq_len(&self, filter: &Filter) -> usize {
        self.order.as_ref().map_or(filter.num_blocks(), |o| o.len())
    }

    fn block_at(&self, seq: usize) -> usize {
        self.order.as_ref().map_or(seq, |o| o[seq] as usize)
    }

    fn seq_of(&self, pack: usize) -> Option<usize> {
        match &self.order {
            None    => Some(pack),
            Some(o) => o.iter().position(|p| *p as usize == pack),
        }
    }

    /// 进入序列中 >= seq 的第一个非空块
    fn enter(&mut self, filter: &Filter, mut seq: usize) {
        let len = self.seq_len(filter);
        while seq < len && filter.is_empty_block(self.block_at(seq)) {
            seq += 1;
        }
        if seq >= len || self.packs_to_go.is_some_and(|n| self.packs_done >= n) {
            self.valid = false;
            return;
        }
        self.packs_done += 1;
        self.seq   = seq;
        self.block = self.block_at(seq);
        self.start_of_block(filter);
        self.valid = true;
    }

    fn start_of_block(&mut self, filter: &Filter) {
        self.in_block = match filter.bit_block(self.block) {
            Some(bits) => bits.next_one(0).unwrap_or(0),
            None       => 0,
        };
        self.left = filter.count_ones_in_block(self.block);
    }

    fn step_in_block(&mut self, filter: &Filter) {
        self.in_block = match filter.bit_block(self.block) {
            Some(bits) => bits.next_one(self.in_block + 1).unwrap_or(self.in_block + 1),
            None       => self.in_block + 1,
        };
        self.left -= 1;
    }

    // ── 定位 ──────────────────────────────────────────────────────────────────

    /// 回到第一个 1；保留 packs_to_go 预算
    pub fn rewind(&mut self, filter: &Filter) {
        self.packs_done = 0;
        self.enter(filter, 0);
    }

    /// 下一个 1
    pub fn advance(&mut self, filter: &Filter) {
        if !self.valid {
            return;
        }
        if self.left > 1 {
            self.step_in_block(filter);
        } else {
            self.enter(filter, self.seq + 1);
        }
    }

    /// 跳到下一个非空块的第一个 1
    pub fn next_pack(&mut self, filter: &Filter) {
        if self.valid {
            self.enter(filter, self.seq + 1);
        }
    }

    /// 块内前进；到块尾时回绕到本块第一个 1 并返回 false
    pub fn next_inside_pack(&mut self, filter: &Filter) -> bool {
        if !self.valid {
            return false;
        }
        if self.left > 1 {
            self.step_in_block(filter);
            true
        } else {
            self.start_of_block(filter);
            false
        }
    }

    /// 定位到指定包的第一个 1。包为空时移到其后的下一个非空块并返回 false
    pub fn rewind_to_pack(&mut self, filter: &Filter, pack: PackId) -> bool {
        self.packs_done = 0;
        let Some(seq) = self.seq_of(pack as usize).filter(|s| *s < self.seq_len(filter)) else {
            self.valid = false;
            return false;
        };
        if filter.is_empty_block(pack as usize) {
            self.enter(filter, seq + 1);
            return false;
        }
        self.enter(filter, seq);
        true
    }

    /// 定位到指定行；该行不是 1 时游标失效
    pub fn rewind_to_row(&mut self, filter: &Filter, row: RowId) {
        self.packs_done = 0;
        if row >= filter.extent() || !filter.get(row) {
            self.valid = false;
            return;
        }
        let block = (row >> self.power) as usize;
        let Some(seq) = self.seq_of(block) else {
            self.valid = false;
            return;
        };
        let end = ((block as u64 + 1) << self.power).min(filter.extent()) - 1;
        self.seq        = seq;
        self.block      = block;
        self.in_block   = (row - ((block as u64) << self.power)) as u32;
        self.left       = filter.count_ones_between(row, end) as u32;
        self.packs_done = 1;
        self.valid      = true;
    }

    /// 只处理 n 个包（含当前包）后即失效；None 取消限制
    pub fn set_packs_to_go(&mut self, n: Option<usize>) {
        self.packs_to_go = n;
    }

    /// 从当前包起最多再处理 n 个包的副本
    pub fn copy_with_budget(&self, n: usize) -> Self {
        let mut c = self.clone();
        c.packs_to_go = Some(n);
        c.packs_done  = usize::from(c.valid);
        c
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    #[inline] pub fn is_valid(&self) -> bool { self.valid }

    #[inline]
    pub fn position(&self) -> RowId {
        ((self.block as u64) << self.power) + self.in_block as u64
    }

    #[inline] pub fn current_pack(&self)    -> PackId { self.block as PackId }
    #[inline] pub fn current_in_pack(&self) -> u32    { self.in_block }

    /// 当前块内剩余的 1（含当前位置）
    pub fn pack_size_left(&self) -> u64 {
        if self.valid { self.left as u64 } else { 0 }
    }

    /// 当前位置是否是本块的第一个 1
    pub fn at_pack_start(&self, filter: &Filter) -> bool {
        self.valid && self.left == filter.count_ones_in_block(self.block)
    }

    pub fn current_block_status(&self, filter: &Filter) -> BlockStatus {
        filter.block_status(self.block)
    }

    /// 向前看第 n 个非空块（不移动游标）；不足 n 个时返回最后一个
    pub fn lookahead(&self, filter: &Filter, n: usize) -> Option<PackId> {
        if !self.valid {
            return None;
        }
        let mut found = self.block;
        let mut todo  = n;
        let mut seq   = self.seq + 1;
        let len = self.seq_len(filter);
        while todo > 0 && seq < len {
            let b = self.block_at(seq);
            if !filter.is_empty_block(b) {
                found = b;
                todo -= 1;
            }
            seq += 1;
        }
        Some(found as PackId)
    }

    /// 按访问顺序列出每个非空块的 1 数（用于切分并行任务）
    pub fn slices(&self, filter: &Filter) -> Vec<u64> {
        (0..self.seq_len(filter))
            .map(|s| filter.count_ones_in_block(self.block_at(s)) as u64)
            .filter(|n| *n > 0)
            .collect()
    }
}

// ── FilterOnesIterator ────────────────────────────────────────────────────────

/// 标准迭代器形式：升序产出所有为 1 的行号
pub struct FilterOnesIterator<'a> {
    filter:  &'a Filter,
    cursor:  OnesCursor,
    started: bool,
}

impl<'a> FilterOnesIterator<'a> {
    pub fn new(filter: &'a Filter) -> Self {
        Self { filter, cursor: OnesCursor::new(filter), started: false }
    }

    pub fn ordered(filter: &'a Filter, order: &PackOrder) -> Self {
        Self { filter, cursor: OnesCursor::ordered(filter, order), started: false }
    }
}

impl Iterator for FilterOnesIterator<'_> {
    type Item = RowId;

    fn next(&mut self) -> Option<RowId> {
        if self.started {
            self.cursor.advance(self.filter);
        }
        self.started = true;
        self.cursor.is_valid().then(|| self.cursor.position())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.filter.count_ones() as usize;
        (0, Some(n))
    }
}
