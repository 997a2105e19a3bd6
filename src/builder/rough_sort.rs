//! 新内容的粗排序
//!
//! 构建器按连接/过滤的访问顺序追加元组，目标行号可能在多个包之间来回跳。
//! 粗排序器统计"回到之前见过的包组合"的次数（919 槽的小哈希表），超过阈值时
//! 把最近一段窗口按各维度的包号排序，使结果 Index Table 的包局部性足够好。
//!
//! 排序在查询线程池上后台执行：窗口拷贝出来发给工作线程，结果经 channel 回传，
//! `barrier` 时写回。窗口与正在追加的位置不重叠。

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::trace;

use crate::common::{pack_of, DimId, OlapError, PackId, Result, RowId, NULL_PACK, NULL_ROW};
use crate::config::QueryContext;
use crate::index_table::IndexTable;

/// 窗口已有序时，积累这么多行后放弃本窗口
const OMIT_IF_SORTED: u64 = 500;
/// 需要排序时，积累到这么多行就排
const OPT_SORT_SIZE:  u64 = 60_000;
/// 一次最多排这么多行
const MAX_SORT_SIZE:  u64 = 200_000;

const MINIHASH_SLOTS: usize = 919;

/// 等待后台排序时检查取消的间隔
const KILL_POLL: Duration = Duration::from_millis(10);

struct SortedWindow {
    start: u64,
    /// 按元组展开，每个元组 `sort_dims.len()` 个行号
    rows:  Vec<RowId>,
}

pub struct RoughSorter {
    ctx:              Arc<QueryContext>,
    power:            u32,
    /// 需要随排序移动的维度
    sort_dims:        Vec<DimId>,
    /// 参与比较的维度（原始行数超过一个包）
    comp_dims:        Vec<DimId>,
    last_pack:        Vec<Option<PackId>>,
    anything_changed: bool,
    sorting_needed:   bool,
    jumps:            usize,
    jump_threshold:   usize,
    block_size:       u64,
    start_sorting:    u64,
    seen:             Box<[bool; MINIHASH_SLOTS]>,
    pending:          Option<Receiver<SortedWindow>>,
    passes:           u64,
}

impl RoughSorter {
    /// `columns`：(维度, 该维度原始行数)；`min_block_shift` 为各表最小页容量的对数
    pub fn new(ctx: Arc<QueryContext>, num_dims: usize, columns: &[(DimId, u64)], min_block_shift: u32) -> Self {
        let power = ctx.power();
        let jump_threshold = ctx.config().rough_sort_jump_threshold.max(1);
        let mut s = Self {
            ctx,
            power,
            sort_dims:        Vec::new(),
            comp_dims:        Vec::new(),
            last_pack:        vec![None; num_dims],
            anything_changed: false,
            sorting_needed:   false,
            jumps:            0,
            jump_threshold,
            block_size:       1u64 << min_block_shift.min(63),
            start_sorting:    0,
            seen:             Box::new([false; MINIHASH_SLOTS]),
            pending:          None,
            passes:           0,
        };
        for &(d, orig_size) in columns {
            s.add_column(d, orig_size);
        }
        s
    }

    /// 加入一个新列（调用前需已 `barrier`）
    pub fn add_column(&mut self, d: DimId, orig_size: u64) {
        debug_assert!(self.pending.is_none());
        debug_assert!(!self.sort_dims.contains(&d));
        self.sort_dims.push(d);
        if orig_size > (1u64 << self.power) {
            self.comp_dims.push(d);
        }
        if d >= self.last_pack.len() {
            self.last_pack.resize(d + 1, None);
        }
    }

    /// 已完成的排序次数
    pub fn passes(&self) -> u64 { self.passes }

    fn reset_stats(&mut self) {
        self.last_pack.iter_mut().for_each(|p| *p = None);
        self.anything_changed = false;
        self.sorting_needed   = false;
        self.jumps            = 0;
        self.seen.fill(false);
    }

    /// 在追加位置 `obj` 的元组之前调用
    pub fn commit_values(&mut self, values: &[RowId], obj: u64, tables: &mut [Option<IndexTable>]) -> Result<()> {
        let window = obj.saturating_sub(self.start_sorting);
        let block_end = obj > 0 && obj % self.block_size == 0;
        if block_end
            || (self.anything_changed && window > MAX_SORT_SIZE)
            || (!self.anything_changed && window > OMIT_IF_SORTED)
        {
            self.commit(obj, tables)?;
            if block_end {
                self.barrier(tables)?;
            }
        }

        let mut changed_now = false;
        for &d in &self.comp_dims {
            let row = values.get(d).copied().unwrap_or(NULL_ROW);
            if row == NULL_ROW {
                continue;
            }
            let pack = pack_of(row, self.power);
            if self.last_pack[d] != Some(pack) {
                if self.last_pack[d].is_some() {
                    self.anything_changed = true;
                }
                changed_now = true;
                self.last_pack[d] = Some(pack);
            }
        }
        if !changed_now {
            return Ok(());
        }

        if self.sorting_needed && obj.saturating_sub(self.start_sorting) > OPT_SORT_SIZE {
            self.commit(obj, tables)?;
            for &d in &self.comp_dims {
                let row = values.get(d).copied().unwrap_or(NULL_ROW);
                if row != NULL_ROW {
                    self.last_pack[d] = Some(pack_of(row, self.power));
                }
            }
        }
        if !self.sorting_needed {
            let slot = self.last_pack.iter().fold(0u64, |h, p| {
                (443 * h + p.map_or(0, |p| p as u64 + 1)) % MINIHASH_SLOTS as u64
            }) as usize;
            if self.seen[slot] {
                self.jumps += 1;
                if self.jumps >= self.jump_threshold {
                    self.sorting_needed = true;
                }
            }
            self.seen[slot] = true;
        }
        Ok(())
    }

    /// 结束当前窗口 [start_sorting, obj)：需要时排序，并开始新窗口
    pub fn commit(&mut self, obj: u64, tables: &mut [Option<IndexTable>]) -> Result<()> {
        if self.sorting_needed && obj > self.start_sorting + 1 {
            self.barrier(tables)?;
            self.spawn_sort(self.start_sorting, obj, tables)?;
        }
        self.reset_stats();
        self.start_sorting = obj;
        Ok(())
    }

    fn spawn_sort(&mut self, start: u64, stop: u64, tables: &mut [Option<IndexTable>]) -> Result<()> {
        let stride = self.sort_dims.len();
        let mut rows = Vec::with_capacity((stop - start) as usize * stride);
        for pos in start..stop {
            for &d in &self.sort_dims {
                let row = match tables.get(d).and_then(|t| t.as_ref()) {
                    Some(t) => t.try_get(pos)?,
                    None    => NULL_ROW,
                };
                rows.push(row);
            }
        }
        let key_cols: Vec<usize> = self.comp_dims.iter()
            .filter_map(|d| self.sort_dims.iter().position(|s| s == d))
            .collect();
        let power = self.power;
        trace!(start, stop, cols = stride, "rough sort pass scheduled");
        self.passes += 1;

        let job = move || SortedWindow { start, rows: rough_sort_rows(rows, stride, &key_cols, power) };
        match self.ctx.pool() {
            Some(pool) => {
                let (tx, rx) = bounded(1);
                pool.spawn(move || {
                    let _ = tx.send(job());
                });
                self.pending = Some(rx);
            }
            None => {
                let window = job();
                self.write_back(window, tables)?;
            }
        }
        Ok(())
    }

    /// 等待后台排序完成并写回；查询被取消时放弃该窗口并返回 `Killed`
    pub fn barrier(&mut self, tables: &mut [Option<IndexTable>]) -> Result<()> {
        let Some(rx) = self.pending.take() else { return Ok(()) };
        let window = loop {
            self.ctx.check_killed()?;
            match rx.recv_timeout(KILL_POLL) {
                Ok(window) => break window,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(OlapError::Corrupted("rough sort worker exited without a result".into()));
                }
            }
        };
        self.write_back(window, tables)
    }

    fn write_back(&self, window: SortedWindow, tables: &mut [Option<IndexTable>]) -> Result<()> {
        let stride = self.sort_dims.len();
        if stride == 0 {
            return Ok(());
        }
        for (i, tuple) in window.rows.chunks_exact(stride).enumerate() {
            let pos = window.start + i as u64;
            for (c, &d) in self.sort_dims.iter().enumerate() {
                if let Some(t) = tables.get_mut(d).and_then(|t| t.as_mut()) {
                    t.set(pos, tuple[c])?;
                }
            }
        }
        trace!(start = window.start, rows = window.rows.len() / stride, "rough sort pass applied");
        Ok(())
    }

    /// 排完所有未完成的窗口
    pub fn finish(&mut self, obj: u64, tables: &mut [Option<IndexTable>]) -> Result<()> {
        self.commit(obj, tables)?;
        self.barrier(tables)
    }
}

/// 按比较列的包号稳定排序元组（NULL 行排在最后）
fn rough_sort_rows(rows: Vec<RowId>, stride: usize, key_cols: &[usize], power: u32) -> Vec<RowId> {
    if stride == 0 || key_cols.is_empty() {
        return rows;
    }
    let n = rows.len() / stride;
    let key = |i: usize, c: usize| -> PackId {
        match rows[i * stride + c] {
            NULL_ROW => NULL_PACK,
            row      => pack_of(row, power),
        }
    };
    let mut perm: Vec<usize> = (0..n).collect();
    perm.sort_by(|&a, &b| {
        key_cols.iter()
            .map(|&c| key(a, c).cmp(&key(b, c)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
    let mut out = Vec::with_capacity(rows.len());
    for i in perm {
        out.extend_from_slice(&rows[i * stride..(i + 1) * stride]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MultiIndexConfig;

    #[test]
    fn sorts_by_pack_and_keeps_tuples_together() {
        // power = 2：包号 = row >> 2
        let rows = vec![
            9, 100,
            1, 101,
            NULL_ROW, 102,
            5, 103,
            2, 104,
        ];
        let out = rough_sort_rows(rows, 2, &[0], 2);
        assert_eq!(out, vec![1, 101, 2, 104, 5, 103, 9, 100, NULL_ROW, 102]);
    }

    #[test]
    fn jumping_input_is_sorted_per_window() {
        let ctx = QueryContext::new(
            MultiIndexConfig::default()
                .with_pack_power(2)
                .with_rough_sort_jump_threshold(1)
                .with_worker_threads(2),
        ).unwrap();
        let n = 64u64;
        let mut tables = vec![Some(IndexTable::new(ctx.clone(), n, 1024).unwrap())];
        let mut sorter = RoughSorter::new(ctx, 1, &[(0, 1024)], 20);
        // 在包 0 与包 10 之间来回跳
        for obj in 0..n {
            let row = if obj % 2 == 0 { obj % 4 } else { 40 + obj % 4 };
            sorter.commit_values(&[row], obj, &mut tables).unwrap();
            tables[0].as_mut().unwrap().set(obj, row).unwrap();
        }
        sorter.finish(n, &mut tables).unwrap();
        assert!(sorter.passes() >= 1);

        let t = tables[0].as_ref().unwrap();
        let rows: Vec<RowId> = (0..n).map(|p| t.get(p)).collect();
        let mut expected = rows.clone();
        expected.sort_by_key(|r| r >> 2);
        assert_eq!(rows.iter().map(|r| r >> 2).collect::<Vec<_>>(),
                   expected.iter().map(|r| r >> 2).collect::<Vec<_>>());
        let mut all = rows;
        all.sort_unstable();
        let mut want: Vec<RowId> = (0..n).map(|o| if o % 2 == 0 { o % 4 } else { 40 + o % 4 }).collect();
        want.sort_unstable();
        assert_eq!(all, want);
    }

    #[test]
    fn barrier_observes_kill_while_a_pass_is_pending() {
        let ctx = QueryContext::new(
            MultiIndexConfig::default()
                .with_pack_power(2)
                .with_rough_sort_jump_threshold(1)
                .with_worker_threads(2),
        ).unwrap();
        let n = 16u64;
        let mut tables = vec![Some(IndexTable::new(ctx.clone(), n, 1024).unwrap())];
        let mut sorter = RoughSorter::new(ctx.clone(), 1, &[(0, 1024)], 20);
        for obj in 0..n {
            let row = if obj % 2 == 0 { obj % 4 } else { 40 + obj % 4 };
            sorter.commit_values(&[row], obj, &mut tables).unwrap();
            tables[0].as_mut().unwrap().set(obj, row).unwrap();
        }
        sorter.commit(n, &mut tables).unwrap();
        assert!(sorter.pending.is_some());

        ctx.kill();
        assert!(matches!(sorter.barrier(&mut tables), Err(OlapError::Killed)));
        assert!(sorter.pending.is_none());
    }
}
