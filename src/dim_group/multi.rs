//! Multi-Materialized 维度组：多个分片（每个并行构建任务一个）逻辑上首尾相接
//!
//! 每个分片内各维度的 Index Table 按包号大致有序；迭代时包行不跨分片。

use std::sync::Arc;

use crate::common::{DimId, DimensionVector, PackId, Result, RowId, NULL_PACK, NULL_ROW};
use crate::index_table::IndexTable;

/// 一个分片：同一批稠密位置上各维度的表
#[derive(Debug, Clone)]
pub struct Shard {
    pub(crate) tables: Vec<Option<Arc<IndexTable>>>,
    pub(crate) nulls:  Vec<bool>,
    pub(crate) count:  u64,
}

impl Shard {
    pub fn new(tables: Vec<Option<IndexTable>>, nulls: Vec<bool>, count: u64) -> Self {
        Self { tables: tables.into_iter().map(|t| t.map(Arc::new)).collect(), nulls, count }
    }

    pub fn count(&self) -> u64 { self.count }

    fn table(&self, d: DimId) -> Option<&Arc<IndexTable>> {
        self.tables.get(d).and_then(|t| t.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct MultiMaterializedGroup {
    pub(crate) dims_used:  DimensionVector,
    pub(crate) shards:     Arc<[Shard]>,
    pub(crate) num_tuples: u64,
}

impl MultiMaterializedGroup {
    pub fn new(dims_used: DimensionVector, shards: Vec<Shard>) -> Self {
        let num_tuples = shards.iter().map(|s| s.count).sum();
        Self { dims_used, shards: shards.into(), num_tuples }
    }

    /// 只有计数、没有任何表的组
    pub fn count_only(dims_used: DimensionVector, num_tuples: u64) -> Self {
        let n = dims_used.len();
        let shard = Shard { tables: vec![None; n], nulls: vec![false; n], count: num_tuples };
        Self { dims_used, shards: vec![shard].into(), num_tuples }
    }

    pub fn shards(&self) -> &[Shard] { &self.shards }

    pub fn dim_enabled(&self, d: DimId) -> bool {
        self.shards.iter().any(|s| s.table(d).is_some())
    }

    pub fn nulls_possible(&self, d: DimId) -> bool {
        self.shards.iter().any(|s| s.nulls.get(d).copied().unwrap_or(false))
    }

    pub fn lock(&self, d: DimId, n: usize) {
        self.shards.iter().filter_map(|s| s.table(d)).for_each(|t| t.lock(n));
    }

    pub fn unlock(&self, d: DimId) {
        self.shards.iter().filter_map(|s| s.table(d)).for_each(|t| t.unlock());
    }

    pub fn lock_count(&self, d: DimId) -> usize {
        self.shards.iter().find_map(|s| s.table(d)).map_or(0, |t| t.lock_count())
    }

    pub(crate) fn deep_copy(&self) -> Result<Self> {
        let shards = self.shards.iter()
            .map(|s| {
                let tables = s.tables.iter()
                    .map(|t| t.as_ref().map(|t| t.try_clone().map(Arc::new)).transpose())
                    .collect::<Result<Vec<_>>>()?;
                Ok(Shard { tables, nulls: s.nulls.clone(), count: s.count })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { dims_used: self.dims_used.clone(), shards: shards.into(), num_tuples: self.num_tuples })
    }
}

// ── 迭代器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MultiIter {
    power:          u32,
    shards:         Arc<[Shard]>,
    dims:           DimensionVector,
    shard:          usize,
    /// 分片内位置
    pos:            u64,
    pack_start:     u64,
    pack_size_left: u64,
    cur_pack:       Vec<PackId>,
    nulls_found:    Vec<bool>,
    /// rewind_to_pack 之后只遍历这一个分片
    fixed:          bool,
    valid:          bool,
}

impl MultiIter {
    pub fn new(group: &MultiMaterializedGroup, dims: &DimensionVector, power: u32) -> Self {
        let n = group.dims_used.len().max(dims.len());
        let mut it = Self {
            power,
            shards:         group.shards.clone(),
            dims:           dims.clone(),
            shard:          0,
            pos:            0,
            pack_start:     0,
            pack_size_left: 0,
            cur_pack:       vec![NULL_PACK; n],
            nulls_found:    vec![false; n],
            fixed:          false,
            valid:          false,
        };
        it.rewind();
        it
    }

    pub fn rewind(&mut self) {
        self.shard = 0;
        self.pos   = 0;
        self.fixed = false;
        self.valid = true;
        self.init_packrow();
    }

    fn iterated_tables(&self) -> impl Iterator<Item = (DimId, &Arc<IndexTable>)> + '_ {
        let shard = &self.shards[self.shard];
        shard.tables.iter().enumerate()
            .filter(|(d, _)| self.dims.get(*d))
            .filter_map(|(d, t)| t.as_ref().map(|t| (d, t)))
    }

    fn init_packrow(&mut self) {
        while self.shard < self.shards.len() && self.pos >= self.shards[self.shard].count {
            if self.fixed {
                self.shard = self.shards.len();
                break;
            }
            self.pos -= self.shards[self.shard].count;
            self.shard += 1;
        }
        if self.shard >= self.shards.len() {
            self.valid = false;
            self.pack_size_left = 0;
            return;
        }
        let count = self.shards[self.shard].count;
        let mut end = count.min(self.pos + (1u64 << self.power));
        let found: Vec<(DimId, PackId, u64, bool)> = self.iterated_tables()
            .map(|(d, t)| {
                let (pack, next, nulls) = find_pack_end(t, self.pos, count, self.power);
                (d, pack, next, nulls)
            })
            .collect();
        for (d, pack, next, nulls) in found {
            self.cur_pack[d]    = pack;
            self.nulls_found[d] = nulls;
            end = end.min(next);
        }
        self.pack_size_left = end - self.pos;
        self.pack_start     = self.pos;
    }

    pub fn advance(&mut self) {
        if !self.valid {
            return;
        }
        self.pos += 1;
        self.pack_size_left -= 1;
        if self.pack_size_left == 0 {
            self.init_packrow();
        }
    }

    pub fn next_inside_pack(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.pos += 1;
        self.pack_size_left -= 1;
        if self.pack_size_left == 0 {
            self.pack_size_left = self.pos - self.pack_start;
            self.pos = self.pack_start;
            return false;
        }
        true
    }

    pub fn next_packrow(&mut self) {
        if !self.valid {
            return;
        }
        self.pos += self.pack_size_left;
        self.init_packrow();
    }

    pub fn is_valid(&self) -> bool { self.valid }
    pub fn pack_size_left(&self) -> u64 { if self.valid { self.pack_size_left } else { 0 } }

    pub fn cur_pos(&self, d: DimId) -> RowId {
        if !self.valid || !self.dims.get(d) {
            return NULL_ROW;
        }
        match self.shards[self.shard].table(d) {
            Some(t) => t.get(self.pos),
            None    => NULL_ROW,
        }
    }

    pub fn cur_pack(&self, d: DimId) -> PackId {
        self.cur_pack.get(d).copied().unwrap_or(NULL_PACK)
    }

    pub fn nulls_exist(&self, d: DimId) -> bool {
        self.nulls_found.get(d).copied().unwrap_or(false)
    }

    /// 包行到达分片末尾或页边界时需要同步
    pub fn barrier_after_packrow(&self) -> bool {
        if !self.valid {
            return false;
        }
        let next_start = self.pos + self.pack_size_left;
        if next_start >= self.shards[self.shard].count {
            return true;
        }
        self.iterated_tables().any(|(_, t)| next_start >= t.end_of_block(self.pos))
    }

    pub fn next_packrow_ahead(&self, d: DimId, ahead: usize) -> Option<PackId> {
        (ahead == 0).then(|| self.cur_pack(d))
    }

    /// 只遍历第 `shard` 个分片
    pub fn rewind_to_pack(&mut self, shard: PackId) -> bool {
        self.shard = shard as usize;
        self.pos   = 0;
        self.fixed = true;
        self.valid = true;
        self.init_packrow();
        self.valid
    }

    /// 每个分片的元组数
    pub fn slices(&self) -> Vec<u64> {
        self.shards.iter().map(|s| s.count).collect()
    }

    pub fn fill_current_pos(&self, cur_pos: &mut [RowId], cur_pack: &mut [PackId], dims: &DimensionVector) {
        if !self.valid {
            return;
        }
        for (d, t) in self.iterated_tables() {
            if dims.get(d) {
                cur_pos[d]  = t.get(self.pos);
                cur_pack[d] = self.cur_pack[d];
            }
        }
    }
}

/// 分片内从 pos 起扫描到包号变化处（不跨页）：返回 (包号, 结束位置, 是否见到 NULL)
fn find_pack_end(t: &IndexTable, pos: u64, count: u64, power: u32) -> (PackId, u64, bool) {
    let limit = count.min(t.end_of_block(pos));
    let mut loc = pos;
    let mut nulls = false;
    while loc < limit && t.get(loc) == NULL_ROW {
        nulls = true;
        loc += 1;
    }
    if loc >= limit {
        return (NULL_PACK, limit, nulls);
    }
    let pack = (t.get(loc) >> power) as PackId;
    loc += 1;
    while loc < limit {
        match t.get(loc) {
            NULL_ROW => nulls = true,
            row if (row >> power) as PackId != pack => break,
            _ => {}
        }
        loc += 1;
    }
    (pack, loc, nulls)
}
