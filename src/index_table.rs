//! Index Table：稠密输出位置 → 源表行号
//!
//! ```text
//!  pos:   0      1      2      ...        (稠密位置，按页切分)
//!  value: row+1  0      row+1  ...        (0 = NULL)
//!         └─ page 0 (2^block_shift 个元素) ─┘└─ page 1 ─┘ ...
//! ```
//!
//! - 元素宽度 2 / 4 / 8 字节，由最大行号在构造时决定，之后不变
//! - 页按需分配；挂载 block cache 且未被锁定时，常驻页数超限即换出，
//!   `get` 透明换入
//! - 页内读写走 `byteorder::LittleEndian`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::common::{BlockId, OlapError, Result, RowId, NULL_ROW};
use crate::config::QueryContext;
use crate::filter::Filter;
use crate::page::{self, BlockHeader};

/// 元素宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemWidth {
    U16,
    U32,
    U64,
}

impl ElemWidth {
    /// `orig_size` 为最大行号（不含）；存储值最大为 orig_size
    pub fn for_rows(orig_size: u64) -> Self {
        if orig_size < u16::MAX as u64 {
            Self::U16
        } else if orig_size < u32::MAX as u64 {
            Self::U32
        } else {
            Self::U64
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    #[inline]
    fn read(self, buf: &[u8], i: usize) -> u64 {
        match self {
            Self::U16 => LittleEndian::read_u16(&buf[i * 2..]) as u64,
            Self::U32 => LittleEndian::read_u32(&buf[i * 4..]) as u64,
            Self::U64 => LittleEndian::read_u64(&buf[i * 8..]),
        }
    }

    #[inline]
    fn write(self, buf: &mut [u8], i: usize, v: u64) {
        match self {
            Self::U16 => LittleEndian::write_u16(&mut buf[i * 2..], v as u16),
            Self::U32 => LittleEndian::write_u32(&mut buf[i * 4..], v as u32),
            Self::U64 => LittleEndian::write_u64(&mut buf[i * 8..], v),
        }
    }
}

#[inline]
fn encode_row(row: RowId) -> u64 {
    if row == NULL_ROW { 0 } else { row + 1 }
}

#[inline]
fn decode_row(v: u64) -> RowId {
    if v == 0 { NULL_ROW } else { v - 1 }
}

// ── 页 ────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PageSlot {
    /// None：未分配（全 NULL）或已换出
    data:    RwLock<Option<Vec<u8>>>,
    spilled: AtomicBool,
}

// ── IndexTable ────────────────────────────────────────────────────────────────

pub struct IndexTable {
    ctx:         Arc<QueryContext>,
    width:       ElemWidth,
    orig_size:   u64,
    size:        u64,
    block_shift: u32,
    pages:       Vec<PageSlot>,
    /// 常驻页（换出按 FIFO）
    resident:    Mutex<VecDeque<usize>>,
    table_id:    BlockId,
    locks:       AtomicUsize,
    /// `get` 换入失败时记录，由迭代器在包边界检查
    fault:       Mutex<Option<OlapError>>,
}

impl IndexTable {
    /// `size` 个位置（初始全 NULL），行号取值范围 [0, orig_size)
    pub fn new(ctx: Arc<QueryContext>, size: u64, orig_size: u64) -> Result<Self> {
        let width = ElemWidth::for_rows(orig_size);
        let page_elems = (ctx.config().index_page_bytes / width.bytes()).max(1);
        let block_shift = page_elems.trailing_zeros();
        let table_id = ctx.allocate_table_id();
        let mut t = Self {
            ctx, width, orig_size,
            size:     0,
            block_shift,
            pages:    Vec::new(),
            resident: Mutex::new(VecDeque::new()),
            table_id,
            locks:    AtomicUsize::new(0),
            fault:    Mutex::new(None),
        };
        t.resize_exact(size)?;
        Ok(t)
    }

    pub fn size(&self)        -> u64       { self.size }
    pub fn orig_size(&self)   -> u64       { self.orig_size }
    pub fn width(&self)       -> ElemWidth { self.width }
    pub fn block_shift(&self) -> u32       { self.block_shift }
    pub fn num_pages(&self)   -> usize     { self.pages.len() }

    pub fn resident_pages(&self) -> usize { self.resident.lock().len() }

    /// 当前页的上界（到达此位置会触发换页）
    #[inline]
    pub fn end_of_block(&self, pos: u64) -> u64 {
        ((pos >> self.block_shift) + 1) << self.block_shift
    }

    #[inline]
    fn locate(&self, pos: u64) -> (usize, usize) {
        ((pos >> self.block_shift) as usize, (pos & ((1u64 << self.block_shift) - 1)) as usize)
    }

    /// 第 p 页的有效元素数
    fn page_len(&self, p: usize) -> usize {
        let start = (p as u64) << self.block_shift;
        (self.size - start).min(1u64 << self.block_shift) as usize
    }

    fn block_id(&self, p: usize) -> BlockId { self.table_id | p as u64 }

    // ── 读写 ──────────────────────────────────────────────────────────────────

    /// 迭代热路径用的读取：换入失败（block cache 错误）时返回 NULL_ROW，
    /// 错误记在表上，不会丢失。
    ///
    /// 调用方必须在检查点调用 [`check_fault`](Self::check_fault)（`MIIterator::check_killed`
    /// 会对所有组做这件事）；需要立即得到错误的地方用 [`try_get`](Self::try_get)。
    #[inline]
    pub fn get(&self, pos: u64) -> RowId {
        match self.try_get(pos) {
            Ok(row) => row,
            Err(e)  => {
                self.fault.lock().get_or_insert(e);
                NULL_ROW
            }
        }
    }

    pub fn try_get(&self, pos: u64) -> Result<RowId> {
        debug_assert!(pos < self.size, "index table position {pos} >= size {}", self.size);
        let (p, off) = self.locate(pos);
        let slot = &self.pages[p];
        {
            let data = slot.data.read();
            if let Some(buf) = data.as_ref() {
                return Ok(decode_row(self.width.read(buf, off)));
            }
        }
        if !slot.spilled.load(Ordering::Acquire) {
            return Ok(NULL_ROW);
        }
        let row = {
            let mut data = slot.data.write();
            if data.is_none() {
                *data = Some(self.load_page(p)?);
                self.resident.lock().push_back(p);
            }
            let buf = data.as_ref().map(|b| self.width.read(b, off)).unwrap_or(0);
            decode_row(buf)
        };
        self.maybe_evict(p)?;
        Ok(row)
    }

    pub fn set(&mut self, pos: u64, row: RowId) -> Result<()> {
        debug_assert!(pos < self.size, "index table position {pos} >= size {}", self.size);
        debug_assert!(row == NULL_ROW || row < self.orig_size);
        let (p, off) = self.locate(pos);
        let width = self.width;
        let fresh = self.pages[p].data.get_mut().is_none();
        if fresh {
            let buf = if *self.pages[p].spilled.get_mut() {
                self.load_page(p)?
            } else {
                vec![0u8; self.page_len(p) * width.bytes()]
            };
            *self.pages[p].data.get_mut() = Some(buf);
            self.resident.get_mut().push_back(p);
        }
        if let Some(buf) = self.pages[p].data.get_mut().as_mut() {
            width.write(buf, off, encode_row(row));
        }
        if fresh {
            self.maybe_evict(p)?;
        }
        Ok(())
    }

    /// 位置 0..count_ones 依次填入 filter 中为 1 的行号
    pub fn set_by_filter(&mut self, filter: &Filter) -> Result<()> {
        let n = filter.count_ones();
        if n > self.size {
            self.expand_to(n)?;
        }
        for (pos, row) in filter.ones().enumerate() {
            self.set(pos as u64, row)?;
        }
        Ok(())
    }

    /// 扩容（保留内容，几何增长）
    pub fn expand_to(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size {
            return Ok(());
        }
        let target = new_size.max(self.size + self.size / 2);
        self.resize_exact(target)
    }

    fn resize_exact(&mut self, new_size: u64) -> Result<()> {
        let bytes = new_size.saturating_mul(self.width.bytes() as u64);
        self.ctx.check_table_bytes("index table", bytes)?;
        let old_pages = self.pages.len();
        self.size = new_size;
        let pages = new_size.div_ceil(1u64 << self.block_shift) as usize;
        self.pages.resize_with(pages, PageSlot::default);
        // 原最后一页变长
        if old_pages > 0 {
            let p = old_pages - 1;
            let len = self.page_len(p) * self.width.bytes();
            if let Some(buf) = self.pages[p].data.get_mut().as_mut() {
                buf.resize(len, 0);
            }
        }
        Ok(())
    }

    /// 深拷贝（新块号空间，不共享页）
    pub fn try_clone(&self) -> Result<Self> {
        let mut t = IndexTable::new(self.ctx.clone(), self.size, self.orig_size)?;
        for pos in 0..self.size {
            let row = self.try_get(pos)?;
            if row != NULL_ROW {
                t.set(pos, row)?;
            }
        }
        Ok(t)
    }

    // ── 锁与换出 ──────────────────────────────────────────────────────────────

    pub fn lock(&self, n: usize) { self.locks.fetch_add(n, Ordering::AcqRel); }

    pub fn unlock(&self) {
        let prev = self.locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "index table unlocked more times than locked");
    }

    pub fn lock_count(&self) -> usize { self.locks.load(Ordering::Acquire) }

    pub fn is_locked(&self) -> bool { self.lock_count() > 0 }

    /// 由 `get` 记录的换入错误
    pub fn check_fault(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(e) => Err(e.clone()),
            None    => Ok(()),
        }
    }

    fn load_page(&self, p: usize) -> Result<Vec<u8>> {
        let cache = self.ctx.cache()
            .ok_or_else(|| OlapError::BlockNotFound(self.block_id(p)))?;
        let (header, mut raw) = page::decode_block(&cache.load(self.block_id(p))?)?;
        if header.block_id != self.block_id(p) || header.width as usize != self.width.bytes() {
            return Err(OlapError::Corrupted(format!("index table page {p}")));
        }
        raw.resize(self.page_len(p) * self.width.bytes(), 0);
        Ok(raw)
    }

    fn maybe_evict(&self, keep: usize) -> Result<()> {
        let (Some(cache), Some(limit)) = (self.ctx.cache(), self.ctx.config().max_resident_pages) else {
            return Ok(());
        };
        if self.is_locked() {
            return Ok(());
        }
        loop {
            let victim = {
                let mut resident = self.resident.lock();
                if resident.len() <= limit {
                    return Ok(());
                }
                let Some(i) = resident.iter().position(|p| *p != keep) else {
                    return Ok(());
                };
                resident.remove(i)
            };
            let Some(victim) = victim else { return Ok(()) };
            let slot = &self.pages[victim];
            let mut data = slot.data.write();
            if let Some(buf) = data.take() {
                let header = BlockHeader {
                    block_id:   self.block_id(victim),
                    elem_count: self.page_len(victim) as u32,
                    width:      self.width.bytes() as u8,
                };
                let bytes = page::encode_block(header, &buf, self.ctx.config().spill_compression)?;
                cache.store(header.block_id, bytes)?;
                slot.spilled.store(true, Ordering::Release);
                debug!(table = self.table_id >> 32, page = victim, "index table page spilled");
            }
        }
    }
}

impl Drop for IndexTable {
    fn drop(&mut self) {
        if let Some(cache) = self.ctx.cache() {
            for (p, slot) in self.pages.iter_mut().enumerate() {
                if *slot.spilled.get_mut() {
                    cache.remove(self.table_id | p as u64);
                }
            }
        }
    }
}

impl std::fmt::Debug for IndexTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTable")
            .field("size", &self.size)
            .field("orig_size", &self.orig_size)
            .field("width", &self.width)
            .field("pages", &self.pages.len())
            .field("locks", &self.lock_count())
            .finish()
    }
}
