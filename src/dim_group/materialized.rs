//! Materialized 维度组：每个维度一张 Index Table，稠密位置在组内共享
//!
//! 所有表都为 None 时是 "count only" 组：只保留元组数。

use std::sync::Arc;

use crate::common::{DimId, DimensionVector, PackId, Result, RowId, NULL_PACK, NULL_ROW};
use crate::index_table::IndexTable;

#[derive(Debug, Clone)]
pub struct MaterializedGroup {
    pub(crate) dims_used:  DimensionVector,
    pub(crate) tables:     Vec<Option<Arc<IndexTable>>>,
    pub(crate) nulls:      Vec<bool>,
    pub(crate) num_tuples: u64,
}

impl MaterializedGroup {
    pub fn new(dims_used: DimensionVector, num_tuples: u64) -> Self {
        let n = dims_used.len();
        Self { dims_used, tables: vec![None; n], nulls: vec![false; n], num_tuples }
    }

    /// 为维度 d 挂上新内容（替换旧表）
    pub fn new_dimension_content(&mut self, dim: DimId, table: IndexTable, nulls: bool) {
        debug_assert!(self.dims_used.get(dim));
        if dim >= self.tables.len() {
            self.tables.resize(dim + 1, None);
            self.nulls.resize(dim + 1, false);
        }
        self.tables[dim] = Some(Arc::new(table));
        self.nulls[dim]  = nulls;
    }

    pub fn table(&self, dim: DimId) -> Option<&Arc<IndexTable>> {
        self.tables.get(dim).and_then(|t| t.as_ref())
    }

    pub fn set_num_tuples(&mut self, n: u64) { self.num_tuples = n; }

    pub(crate) fn deep_copy(&self) -> Result<Self> {
        let tables = self.tables.iter()
            .map(|t| t.as_ref().map(|t| t.try_clone().map(Arc::new)).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tables, ..self.clone() })
    }
}

// ── 迭代器 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MaterializedIter {
    power:          u32,
    num_tuples:     u64,
    /// 只含被请求的维度
    tables:         Vec<Option<Arc<IndexTable>>>,
    nulls_possible: Vec<bool>,
    cur_pos:        u64,
    pack_start:     u64,
    pack_size_left: u64,
    /// 各维度当前包结束的位置
    next_pack:      Vec<u64>,
    cur_pack:       Vec<PackId>,
    nulls_found:    Vec<bool>,
    valid:          bool,
}

impl MaterializedIter {
    pub fn new(group: &MaterializedGroup, dims: &DimensionVector, power: u32) -> Self {
        let n = group.tables.len();
        let tables = (0..n)
            .map(|d| if dims.get(d) { group.tables[d].clone() } else { None })
            .collect();
        let mut it = Self {
            power,
            num_tuples:     group.num_tuples,
            tables,
            nulls_possible: group.nulls.clone(),
            cur_pos:        0,
            pack_start:     0,
            pack_size_left: 0,
            next_pack:      vec![0; n],
            cur_pack:       vec![NULL_PACK; n],
            nulls_found:    vec![false; n],
            valid:          false,
        };
        it.rewind();
        it
    }

    pub fn rewind(&mut self) {
        self.cur_pos = 0;
        self.next_pack.iter_mut().for_each(|p| *p = 0);
        self.valid = true;
        self.init_packrow();
    }

    fn init_packrow(&mut self) {
        if self.cur_pos >= self.num_tuples {
            self.valid = false;
            self.pack_size_left = 0;
            return;
        }
        let mut end = self.num_tuples.min(self.cur_pos + (1u64 << self.power));
        for d in 0..self.tables.len() {
            if self.tables[d].is_none() {
                continue;
            }
            if self.cur_pos >= self.next_pack[d] {
                self.find_pack_end(d);
            }
            end = end.min(self.next_pack[d]);
        }
        self.pack_size_left = end - self.cur_pos;
        self.pack_start     = self.cur_pos;
    }

    /// 从当前位置向后扫描到维度 d 的包号变化处（不跨页）
    fn find_pack_end(&mut self, d: usize) {
        let Some(t) = self.tables[d].as_ref() else { return };
        let limit = self.num_tuples.min(t.end_of_block(self.cur_pos));
        let mut loc = self.cur_pos;
        let mut nulls = false;
        while loc < limit && t.get(loc) == NULL_ROW {
            nulls = true;
            loc += 1;
        }
        let mut pack = NULL_PACK;
        if loc < limit {
            pack = (t.get(loc) >> self.power) as PackId;
            loc += 1;
            while loc < limit {
                let row = t.get(loc);
                if row == NULL_ROW {
                    nulls = true;
                } else if (row >> self.power) as PackId != pack {
                    break;
                }
                loc += 1;
            }
        }
        self.cur_pack[d]    = pack;
        self.next_pack[d]   = loc;
        self.nulls_found[d] = nulls;
    }

    pub fn advance(&mut self) {
        if !self.valid {
            return;
        }
        self.cur_pos += 1;
        self.pack_size_left -= 1;
        if self.pack_size_left == 0 {
            self.init_packrow();
        }
    }

    pub fn next_inside_pack(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.cur_pos += 1;
        self.pack_size_left -= 1;
        if self.pack_size_left == 0 {
            self.pack_size_left = self.cur_pos - self.pack_start;
            self.cur_pos = self.pack_start;
            return false;
        }
        true
    }

    pub fn next_packrow(&mut self) {
        if !self.valid {
            return;
        }
        self.cur_pos += self.pack_size_left;
        self.init_packrow();
    }

    pub fn is_valid(&self) -> bool { self.valid }
    pub fn pack_size_left(&self) -> u64 { if self.valid { self.pack_size_left } else { 0 } }
    pub fn position(&self) -> u64 { self.cur_pos }

    pub fn cur_pos(&self, d: DimId) -> RowId {
        match self.tables.get(d).and_then(|t| t.as_ref()) {
            Some(t) => t.get(self.cur_pos),
            None    => NULL_ROW,
        }
    }

    pub fn cur_pack(&self, d: DimId) -> PackId {
        self.cur_pack.get(d).copied().unwrap_or(NULL_PACK)
    }

    pub fn nulls_exist(&self, d: DimId) -> bool {
        self.nulls_possible.get(d).copied().unwrap_or(false)
            && self.nulls_found.get(d).copied().unwrap_or(false)
    }

    pub fn has_table(&self, d: DimId) -> bool {
        self.tables.get(d).is_some_and(|t| t.is_some())
    }

    /// 下一个包行落在另一页（或已到结尾）时需要同步
    pub fn barrier_after_packrow(&self) -> bool {
        let next_start = self.cur_pos + self.pack_size_left;
        if next_start >= self.num_tuples {
            return true;
        }
        self.tables.iter().flatten().any(|t| next_start >= t.end_of_block(self.cur_pos))
    }

    /// 在当前页内向前看第 ahead 个包；未知时返回 None
    pub fn next_packrow_ahead(&self, d: DimId, ahead: usize) -> Option<PackId> {
        if ahead == 0 {
            return Some(self.cur_pack(d));
        }
        let t = self.tables.get(d)?.as_ref()?;
        let limit = self.num_tuples.min(t.end_of_block(self.cur_pos));
        let mut loc  = self.cur_pos + self.pack_size_left;
        let mut pack = self.cur_pack(d);
        for _ in 0..ahead {
            while loc < limit {
                let row = t.get(loc);
                if row != NULL_ROW && (row >> self.power) as PackId != pack {
                    break;
                }
                loc += 1;
            }
            if loc >= limit {
                return None;
            }
            pack = (t.get(loc) >> self.power) as PackId;
        }
        Some(pack)
    }

    pub fn fill_current_pos(&self, cur_pos: &mut [RowId], cur_pack: &mut [PackId], dims: &DimensionVector) {
        for (d, t) in self.tables.iter().enumerate() {
            if let (true, Some(t)) = (dims.get(d), t) {
                cur_pos[d]  = t.get(self.cur_pos);
                cur_pack[d] = self.cur_pack[d];
            }
        }
    }
}
