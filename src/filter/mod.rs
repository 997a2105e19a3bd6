//! 位图过滤器（单个维度的存活行集合）
//!
//! 按包（2^power 行）分块，每块缓存 FULL / EMPTY / MIXED 状态：
//!
//! ```text
//!   rows:   0 ........ 2^p-1 | 2^p ...... 2^(p+1)-1 | ... | last (partial)
//!   blocks: [ FULL          ] [ MIXED -> Arc<BitBlock>] ... [ EMPTY ]
//! ```
//!
//! - FULL / EMPTY 块不分配位表，O(1) 跳过
//! - MIXED 块的位表以 `Arc` 共享：`Clone` 即浅拷贝，写时复制
//! - 延迟修改放在独立的 [`PendingEdits`] 中，`commit` 时按块批量应用
//! - MIXED 位表总字节数受 `byte_limit` 约束，超出时修改失败并返回 `OutOfMemory`，
//!   过滤器保持修改前的状态

mod block;
mod iter;

use std::sync::Arc;

use tracing::debug;

use crate::cache::BlockCache;
use crate::common::{BlockId, OlapError, PackId, Result, RowId};
use crate::compression::CompressionType;
use crate::config::{MAX_PACK_POWER, MIN_PACK_POWER};
use crate::page::{self, BlockHeader};

pub use block::BitBlock;
pub use iter::{FilterOnesIterator, OnesCursor};

/// 块状态（对外只读视图）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Full,
    Empty,
    Mixed,
}

impl BlockStatus {
    fn tag(self) -> u8 {
        match self {
            Self::Full  => 0,
            Self::Empty => 1,
            Self::Mixed => 2,
        }
    }
}

#[derive(Debug, Clone)]
enum BlockState {
    Full,
    Empty,
    Mixed(Arc<BitBlock>),
}

// ── Filter ────────────────────────────────────────────────────────────────────

/// `Clone` 共享 MIXED 块存储（写时复制），语义上仍是独立副本
#[derive(Debug, Clone)]
pub struct Filter {
    extent:      u64,
    power:       u32,
    blocks:      Vec<BlockState>,
    /// 最后一个块的位数
    last_len:    u32,
    ones:        u64,
    /// 所有 MIXED 位表的字节数（共享的块也计入）
    mixed_bytes: u64,
    byte_limit:  u64,
}

impl Filter {
    pub fn new(extent: u64, power: u32, all_ones: bool) -> Result<Self> {
        if !(MIN_PACK_POWER..=MAX_PACK_POWER).contains(&power) {
            return Err(OlapError::InvalidArgument(format!("filter power {power}")));
        }
        let pack = 1u64 << power;
        let nblocks = extent.div_ceil(pack);
        if nblocks >= PackId::MAX as u64 {
            return Err(OlapError::InvalidArgument(format!(
                "filter extent {extent} needs {nblocks} packs"
            )));
        }
        let last_len = match extent % pack {
            0 if extent > 0 => pack as u32,
            0 => 0,
            r => r as u32,
        };
        let state = if all_ones { BlockState::Full } else { BlockState::Empty };
        Ok(Self {
            extent, power,
            blocks:      vec![state; nblocks as usize],
            last_len,
            ones:        if all_ones { extent } else { 0 },
            mixed_bytes: 0,
            byte_limit:  u64::MAX,
        })
    }

    /// 限制 MIXED 位表的总字节数（通常取 `MultiIndexConfig::max_table_bytes`）
    pub fn with_byte_limit(mut self, bytes: u64) -> Self {
        self.byte_limit = bytes;
        self
    }

    pub fn byte_limit(&self)   -> u64 { self.byte_limit }
    pub fn bitmap_bytes(&self) -> u64 { self.mixed_bytes }

    /// 共享块存储的副本（并行扇出用）
    pub fn shallow_copy(&self) -> Self { self.clone() }

    /// 不与原对象共享任何块存储的副本
    pub fn deep_copy(&self) -> Self {
        let blocks = self.blocks.iter()
            .map(|b| match b {
                BlockState::Mixed(bits) => BlockState::Mixed(Arc::new(BitBlock::clone(bits))),
                other => other.clone(),
            })
            .collect();
        Self { blocks, ..self.clone() }
    }

    // ── 基本属性 ──────────────────────────────────────────────────────────────

    pub fn extent(&self)     -> u64   { self.extent }
    pub fn power(&self)      -> u32   { self.power }
    pub fn num_blocks(&self) -> usize { self.blocks.len() }

    #[inline]
    pub fn block_len(&self, b: usize) -> u32 {
        if b + 1 == self.blocks.len() { self.last_len } else { 1u32 << self.power }
    }

    #[inline]
    fn split(&self, row: RowId) -> (usize, u32) {
        debug_assert!(row < self.extent, "row {row} outside filter extent {}", self.extent);
        ((row >> self.power) as usize, (row & ((1u64 << self.power) - 1)) as u32)
    }

    pub fn block_status(&self, b: usize) -> BlockStatus {
        match &self.blocks[b] {
            BlockState::Full     => BlockStatus::Full,
            BlockState::Empty    => BlockStatus::Empty,
            BlockState::Mixed(_) => BlockStatus::Mixed,
        }
    }

    /// MIXED 块的位表
    pub fn bit_block(&self, b: usize) -> Option<&BitBlock> {
        match &self.blocks[b] {
            BlockState::Mixed(bits) => Some(bits),
            _ => None,
        }
    }

    // ── 读取 ──────────────────────────────────────────────────────────────────

    #[inline]
    pub fn get(&self, row: RowId) -> bool {
        if row >= self.extent {
            return false;
        }
        let (b, n) = self.split(row);
        match &self.blocks[b] {
            BlockState::Full        => true,
            BlockState::Empty       => false,
            BlockState::Mixed(bits) => bits.get(n),
        }
    }

    pub fn is_empty(&self) -> bool { self.ones == 0 }
    pub fn is_full(&self)  -> bool { self.ones == self.extent }

    pub fn is_empty_block(&self, b: usize) -> bool {
        matches!(self.blocks[b], BlockState::Empty)
    }

    pub fn is_full_block(&self, b: usize) -> bool {
        matches!(self.blocks[b], BlockState::Full)
    }

    pub fn count_ones(&self) -> u64 { self.ones }

    pub fn count_ones_in_block(&self, b: usize) -> u32 {
        match &self.blocks[b] {
            BlockState::Full        => self.block_len(b),
            BlockState::Empty       => 0,
            BlockState::Mixed(bits) => bits.ones(),
        }
    }

    /// [lo, hi] 闭区间内 1 的个数
    pub fn count_ones_between(&self, lo: RowId, hi: RowId) -> u64 {
        if lo > hi || lo >= self.extent {
            return 0;
        }
        let hi = hi.min(self.extent - 1);
        let (b1, n1) = self.split(lo);
        let (b2, n2) = self.split(hi);
        let mut total = 0u64;
        for b in b1..=b2 {
            let from = if b == b1 { n1 } else { 0 };
            let to   = if b == b2 { n2 } else { self.block_len(b) - 1 };
            total += match &self.blocks[b] {
                BlockState::Full        => (to - from + 1) as u64,
                BlockState::Empty       => 0,
                BlockState::Mixed(bits) => bits.count_between(from, to) as u64,
            };
        }
        total
    }

    pub fn is_empty_between(&self, lo: RowId, hi: RowId) -> bool {
        self.count_ones_between(lo, hi) == 0
    }

    pub fn is_full_between(&self, lo: RowId, hi: RowId) -> bool {
        lo <= hi && hi < self.extent && self.count_ones_between(lo, hi) == hi - lo + 1
    }

    /// 65537 表示空过滤器或只有一个非空块；否则为非空块的平均 1 数
    pub fn density_weight(&self) -> u32 {
        let nonempty = self.blocks.iter().filter(|b| !matches!(b, BlockState::Empty)).count();
        if self.ones == 0 || nonempty <= 1 {
            return 65537;
        }
        (self.ones / nonempty as u64).min(65536) as u32
    }

    pub fn is_equal(&self, other: &Filter) -> bool {
        if self.extent != other.extent || self.power != other.power || self.ones != other.ones {
            return false;
        }
        (0..self.blocks.len()).all(|b| match (&self.blocks[b], &other.blocks[b]) {
            (BlockState::Full, BlockState::Full)       => true,
            (BlockState::Empty, BlockState::Empty)     => true,
            (BlockState::Mixed(a), BlockState::Mixed(o)) => Arc::ptr_eq(a, o) || a == o,
            _ => false,
        })
    }

    // ── 立即修改 ──────────────────────────────────────────────────────────────

    pub fn set(&mut self, row: RowId) -> Result<()> {
        let (b, n) = self.split(row);
        let len = self.block_len(b);
        match &mut self.blocks[b] {
            BlockState::Full => Ok(()),
            BlockState::Mixed(bits) => {
                if Arc::make_mut(bits).set(n) {
                    self.ones += 1;
                }
                self.collapse(b);
                Ok(())
            }
            BlockState::Empty => {
                let mut bits = BitBlock::empty(len);
                bits.set(n);
                self.apply_blocks(vec![(b, BlockState::Mixed(Arc::new(bits)))])
            }
        }
    }

    pub fn reset(&mut self, row: RowId) -> Result<()> {
        let (b, n) = self.split(row);
        let len = self.block_len(b);
        match &mut self.blocks[b] {
            BlockState::Empty => Ok(()),
            BlockState::Mixed(bits) => {
                if Arc::make_mut(bits).reset(n) {
                    self.ones -= 1;
                }
                self.collapse(b);
                Ok(())
            }
            BlockState::Full => {
                let mut bits = BitBlock::full(len);
                bits.reset(n);
                self.apply_blocks(vec![(b, BlockState::Mixed(Arc::new(bits)))])
            }
        }
    }

    /// [lo, hi] 闭区间全部置 1
    pub fn set_between(&mut self, lo: RowId, hi: RowId) -> Result<()> {
        self.fill_between(lo, hi, true)
    }

    /// [lo, hi] 闭区间全部置 0
    pub fn reset_between(&mut self, lo: RowId, hi: RowId) -> Result<()> {
        self.fill_between(lo, hi, false)
    }

    fn fill_between(&mut self, lo: RowId, hi: RowId, value: bool) -> Result<()> {
        if lo > hi || lo >= self.extent {
            return Ok(());
        }
        let hi = hi.min(self.extent - 1);
        let (b1, n1) = self.split(lo);
        let (b2, n2) = self.split(hi);
        let mut updates = Vec::with_capacity(b2 - b1 + 1);
        for b in b1..=b2 {
            let len  = self.block_len(b);
            let from = if b == b1 { n1 } else { 0 };
            let to   = if b == b2 { n2 } else { len - 1 };
            if from == 0 && to == len - 1 {
                updates.push((b, if value { BlockState::Full } else { BlockState::Empty }));
                continue;
            }
            let mut bits = match &self.blocks[b] {
                BlockState::Full  if value  => continue,
                BlockState::Empty if !value => continue,
                BlockState::Full        => BitBlock::full(len),
                BlockState::Empty       => BitBlock::empty(len),
                BlockState::Mixed(bits) => BitBlock::clone(bits),
            };
            if value { bits.set_range(from, to) } else { bits.reset_range(from, to) }
            updates.push((b, BlockState::Mixed(Arc::new(bits))));
        }
        self.apply_blocks(updates)
    }

    /// 全部置 1
    pub fn set_all(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Full);
        self.ones        = self.extent;
        self.mixed_bytes = 0;
    }

    /// 全部置 0
    pub fn reset_all(&mut self) {
        self.blocks.iter_mut().for_each(|b| *b = BlockState::Empty);
        self.ones        = 0;
        self.mixed_bytes = 0;
    }

    pub fn reset_block(&mut self, b: usize) {
        self.ones        -= self.count_ones_in_block(b) as u64;
        self.mixed_bytes -= state_bytes(&self.blocks[b]);
        self.blocks[b] = BlockState::Empty;
    }

    /// 从另一个同形过滤器复制第 b 块（共享存储）
    pub fn copy_block(&mut self, other: &Filter, b: usize) -> Result<()> {
        debug_assert_eq!(self.block_len(b), other.block_len(b));
        self.apply_blocks(vec![(b, other.blocks[b].clone())])
    }

    // ── 延迟修改 ──────────────────────────────────────────────────────────────

    /// 按块批量应用缓冲的修改，每个被触及的块只重算一次状态
    pub fn commit(&mut self, mut edits: PendingEdits) -> Result<()> {
        if edits.ops.is_empty() {
            return Ok(());
        }
        // 稳定排序：同一块内保持调用顺序
        edits.ops.sort_by_key(|(row, _)| row >> self.power);
        let mut updates = Vec::new();
        let mut i = 0;
        while i < edits.ops.len() {
            let b = (edits.ops[i].0 >> self.power) as usize;
            let len = self.block_len(b);
            let mut bits = match &self.blocks[b] {
                BlockState::Full        => BitBlock::full(len),
                BlockState::Empty       => BitBlock::empty(len),
                BlockState::Mixed(bits) => BitBlock::clone(bits),
            };
            while i < edits.ops.len() && (edits.ops[i].0 >> self.power) as usize == b {
                let (row, value) = edits.ops[i];
                debug_assert!(row < self.extent);
                let n = (row & ((1u64 << self.power) - 1)) as u32;
                if value { bits.set(n); } else { bits.reset(n); }
                i += 1;
            }
            updates.push((b, BlockState::Mixed(Arc::new(bits))));
        }
        self.apply_blocks(updates)
    }

    // ── 逻辑运算（要求同样的 extent / power）─────────────────────────────────

    pub fn and(&mut self, other: &Filter) -> Result<()> {
        debug_assert!(self.same_shape(other));
        let mut updates = Vec::new();
        for (b, o) in other.blocks.iter().enumerate().take(self.blocks.len()) {
            let next = match (&self.blocks[b], o) {
                (BlockState::Empty, _)                         => continue,
                (_, BlockState::Empty)                         => BlockState::Empty,
                (_, BlockState::Full)                          => continue,
                (BlockState::Full, BlockState::Mixed(ob))      => BlockState::Mixed(ob.clone()),
                (BlockState::Mixed(sb), BlockState::Mixed(ob)) => {
                    let mut bits = BitBlock::clone(sb);
                    bits.and(ob);
                    BlockState::Mixed(Arc::new(bits))
                }
            };
            updates.push((b, next));
        }
        self.apply_blocks(updates)
    }

    /// `pack` 指定时只对该块做 OR
    pub fn or(&mut self, other: &Filter, pack: Option<usize>) -> Result<()> {
        debug_assert!(self.same_shape(other));
        let range = match pack {
            Some(p) => p..p + 1,
            None    => 0..self.blocks.len().min(other.blocks.len()),
        };
        let mut updates = Vec::new();
        for b in range {
            let next = match (&self.blocks[b], &other.blocks[b]) {
                (BlockState::Full, _)                          => continue,
                (_, BlockState::Full)                          => BlockState::Full,
                (_, BlockState::Empty)                         => continue,
                (BlockState::Empty, BlockState::Mixed(ob))     => BlockState::Mixed(ob.clone()),
                (BlockState::Mixed(sb), BlockState::Mixed(ob)) => {
                    let mut bits = BitBlock::clone(sb);
                    bits.or(ob);
                    BlockState::Mixed(Arc::new(bits))
                }
            };
            updates.push((b, next));
        }
        self.apply_blocks(updates)
    }

    /// 取反不改变 MIXED 块的个数，不受字节上限影响
    pub fn not(&mut self) {
        for b in 0..self.blocks.len() {
            self.blocks[b] = match &self.blocks[b] {
                BlockState::Full        => BlockState::Empty,
                BlockState::Empty       => BlockState::Full,
                BlockState::Mixed(bits) => {
                    let mut bits = BitBlock::clone(bits);
                    bits.not();
                    BlockState::Mixed(Arc::new(bits))
                }
            };
        }
        self.ones = self.extent - self.ones;
    }

    /// 清除 other 中为 1 的所有位置
    pub fn and_not(&mut self, other: &Filter) -> Result<()> {
        debug_assert!(self.same_shape(other));
        let mut updates = Vec::new();
        for (b, o) in other.blocks.iter().enumerate().take(self.blocks.len()) {
            let next = match (&self.blocks[b], o) {
                (BlockState::Empty, _)                         => continue,
                (_, BlockState::Full)                          => BlockState::Empty,
                (_, BlockState::Empty)                         => continue,
                (BlockState::Full, BlockState::Mixed(ob))      => {
                    let mut bits = BitBlock::clone(ob);
                    bits.not();
                    BlockState::Mixed(Arc::new(bits))
                }
                (BlockState::Mixed(sb), BlockState::Mixed(ob)) => {
                    let mut bits = BitBlock::clone(sb);
                    bits.and_not(ob);
                    BlockState::Mixed(Arc::new(bits))
                }
            };
            updates.push((b, next));
        }
        self.apply_blocks(updates)
    }

    fn same_shape(&self, other: &Filter) -> bool {
        self.extent == other.extent && self.power == other.power
    }

    // ── 内部 ──────────────────────────────────────────────────────────────────

    /// 替换若干块（块号互不相同）：先折叠全 1 / 全 0 的 MIXED，再检查字节上限，
    /// 全部通过后才写入
    fn apply_blocks(&mut self, updates: Vec<(usize, BlockState)>) -> Result<()> {
        let updates: Vec<(usize, BlockState)> = updates.into_iter().map(|(b, s)| (b, collapsed(s))).collect();
        let mut bytes = self.mixed_bytes;
        for (b, state) in &updates {
            bytes = bytes + state_bytes(state) - state_bytes(&self.blocks[*b]);
        }
        if bytes > self.byte_limit && bytes > self.mixed_bytes {
            return Err(OlapError::OutOfMemory(format!(
                "filter bitmap needs {bytes} bytes, limit is {}", self.byte_limit
            )));
        }
        for (b, state) in updates {
            self.ones -= self.count_ones_in_block(b) as u64;
            self.blocks[b] = state;
            self.ones += self.count_ones_in_block(b) as u64;
        }
        self.mixed_bytes = bytes;
        Ok(())
    }

    /// 原地修改后的 MIXED 块全 1 / 全 0 时折叠为 FULL / EMPTY
    fn collapse(&mut self, b: usize) {
        if matches!(&self.blocks[b], BlockState::Mixed(bits) if bits.is_empty() || bits.is_full()) {
            let old = std::mem::replace(&mut self.blocks[b], BlockState::Empty);
            self.mixed_bytes -= state_bytes(&old);
            self.blocks[b] = collapsed(old);
        }
    }

    fn recount(&mut self) {
        self.ones        = (0..self.blocks.len()).map(|b| self.count_ones_in_block(b) as u64).sum();
        self.mixed_bytes = self.blocks.iter().map(state_bytes).sum();
    }

    // ── 换出 / 换入 ───────────────────────────────────────────────────────────

    /// 把整个过滤器写入 block cache：`base` 存清单，`base + 1 + b` 存 MIXED 块
    pub fn store_blocks(
        &self,
        cache:       &dyn BlockCache,
        base:        BlockId,
        compression: CompressionType,
    ) -> Result<()> {
        let mut manifest = Vec::with_capacity(16 + self.blocks.len());
        manifest.extend_from_slice(&self.extent.to_le_bytes());
        manifest.extend_from_slice(&self.power.to_le_bytes());
        manifest.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        manifest.extend(self.blocks.iter().enumerate().map(|(b, _)| self.block_status(b).tag()));
        let header = BlockHeader { block_id: base, elem_count: self.blocks.len() as u32, width: 0 };
        cache.store(base, page::encode_block(header, &manifest, compression)?)?;

        for (b, state) in self.blocks.iter().enumerate() {
            if let BlockState::Mixed(bits) = state {
                let id = base + 1 + b as u64;
                let header = BlockHeader { block_id: id, elem_count: bits.len(), width: 0 };
                cache.store(id, page::encode_block(header, &bits.to_bytes(), compression)?)?;
            }
        }
        debug!(base, blocks = self.blocks.len(), ones = self.ones, "filter spilled to block cache");
        Ok(())
    }

    /// `store_blocks` 的逆操作
    pub fn load_blocks(cache: &dyn BlockCache, base: BlockId) -> Result<Self> {
        let (_, manifest) = page::decode_block(&cache.load(base)?)?;
        if manifest.len() < 16 {
            return Err(OlapError::Corrupted("filter manifest too short".into()));
        }
        let extent  = u64::from_le_bytes(manifest[0..8].try_into().map_err(corrupt)?);
        let power   = u32::from_le_bytes(manifest[8..12].try_into().map_err(corrupt)?);
        let nblocks = u32::from_le_bytes(manifest[12..16].try_into().map_err(corrupt)?) as usize;
        let mut f = Filter::new(extent, power, false)?;
        if manifest.len() != 16 + nblocks || f.blocks.len() != nblocks {
            return Err(OlapError::Corrupted("filter manifest block count mismatch".into()));
        }
        for b in 0..nblocks {
            f.blocks[b] = match manifest[16 + b] {
                0 => BlockState::Full,
                1 => BlockState::Empty,
                2 => {
                    let id = base + 1 + b as u64;
                    let (header, raw) = page::decode_block(&cache.load(id)?)?;
                    if header.elem_count != f.block_len(b) {
                        return Err(OlapError::Corrupted(format!("filter block {b} length")));
                    }
                    BlockState::Mixed(Arc::new(BitBlock::from_bytes(header.elem_count, &raw)?))
                }
                t => return Err(OlapError::Corrupted(format!("filter block status {t}"))),
            };
        }
        f.recount();
        debug!(base, blocks = nblocks, ones = f.ones, "filter restored from block cache");
        Ok(f)
    }

    // ── 迭代 ──────────────────────────────────────────────────────────────────

    /// 升序遍历所有 1
    pub fn ones(&self) -> FilterOnesIterator<'_> {
        FilterOnesIterator::new(self)
    }
}

fn collapsed(state: BlockState) -> BlockState {
    match state {
        BlockState::Mixed(bits) if bits.is_empty() => BlockState::Empty,
        BlockState::Mixed(bits) if bits.is_full()  => BlockState::Full,
        other => other,
    }
}

fn state_bytes(state: &BlockState) -> u64 {
    match state {
        BlockState::Mixed(bits) => bits.byte_size(),
        _ => 0,
    }
}

fn corrupt(_: std::array::TryFromSliceError) -> OlapError {
    OlapError::Corrupted("filter manifest".into())
}

// ── PendingEdits ──────────────────────────────────────────────────────────────

/// 尚未提交的延迟修改；通过 [`Filter::commit`] 应用
#[derive(Debug, Default, Clone)]
pub struct PendingEdits {
    ops: Vec<(RowId, bool)>,
}

impl PendingEdits {
    pub fn new() -> Self { Self::default() }

    pub fn set_delayed(&mut self, row: RowId) { self.ops.push((row, true)); }

    pub fn reset_delayed(&mut self, row: RowId) { self.ops.push((row, false)); }

    pub fn len(&self)      -> usize { self.ops.len() }
    pub fn is_empty(&self) -> bool  { self.ops.is_empty() }
}
