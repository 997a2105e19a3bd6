//! 维度组（Dimension Group）
//!
//! 一个维度组记录一个或多个维度"哪些行存活"以及"稠密位置 → 行号"的映射，
//! 四种表示在内存与通用性之间取舍：
//!
//! ```text
//!   Filter            单维度，Filter 的 1 位即存活行        (最省)
//!   Virtual           基准维度用 Filter，伴随维度用 Index Table
//!   Materialized      每个维度一张 Index Table，共享稠密位置
//!   MultiMaterialized 多个分片的 Index Table 首尾相接        (并行构建)
//! ```
//!
//! 迭代器 [`DGIterator`] 持有底层存储的 `Arc`，不借用维度组本身。

mod filter;
mod materialized;
mod multi;
mod virtual_group;

use std::sync::Arc;

use crate::common::{DimId, DimensionVector, PackId, Result, RowId, NULL_PACK, NULL_ROW};
use crate::filter::Filter;
use crate::pack_order::PackOrder;

pub use filter::{FilterGroup, FilterIter};
pub use materialized::{MaterializedGroup, MaterializedIter};
pub use multi::{MultiIter, MultiMaterializedGroup, Shard};
pub use virtual_group::{VirtualGroup, VirtualIter};

/// 维度组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Filter,
    Materialized,
    Virtual,
    MultiMaterialized,
}

#[derive(Debug, Clone)]
pub enum DimensionGroup {
    Filter(FilterGroup),
    Materialized(MaterializedGroup),
    Virtual(VirtualGroup),
    MultiMaterialized(MultiMaterializedGroup),
}

impl DimensionGroup {
    /// 全 1 的 Filter 组（新加入的维度），位表总字节数不超过 `byte_limit`
    pub fn full_filter(dim: DimId, size: u64, power: u32, byte_limit: u64) -> Result<Self> {
        let f = Filter::new(size, power, true)?.with_byte_limit(byte_limit);
        Ok(Self::Filter(FilterGroup::new(dim, f)))
    }

    pub fn kind(&self) -> GroupKind {
        match self {
            Self::Filter(_)            => GroupKind::Filter,
            Self::Materialized(_)      => GroupKind::Materialized,
            Self::Virtual(_)           => GroupKind::Virtual,
            Self::MultiMaterialized(_) => GroupKind::MultiMaterialized,
        }
    }

    pub fn num_tuples(&self) -> u64 {
        match self {
            Self::Filter(g)            => g.num_tuples(),
            Self::Materialized(g)      => g.num_tuples,
            Self::Virtual(g)           => g.num_tuples(),
            Self::MultiMaterialized(g) => g.num_tuples,
        }
    }

    pub fn is_empty(&self) -> bool { self.num_tuples() == 0 }

    /// 重算元组数（Filter 型组随 Filter 变化，不需要缓存）
    pub fn update_num_tuples(&mut self) {
        if let Self::MultiMaterialized(g) = self {
            g.num_tuples = g.shards.iter().map(|s| s.count).sum();
        }
    }

    /// 维度 d 属于本组
    pub fn dim_used(&self, d: DimId) -> bool {
        match self {
            Self::Filter(g)            => g.dim == d,
            Self::Materialized(g)      => g.dims_used.get(d),
            Self::Virtual(g)           => g.base_dim == d || g.dims_used.get(d),
            Self::MultiMaterialized(g) => g.dims_used.get(d),
        }
    }

    /// 维度 d 属于本组且有行号可取（未被遗忘）
    pub fn dim_enabled(&self, d: DimId) -> bool {
        match self {
            Self::Filter(g)            => g.dim == d,
            Self::Materialized(g)      => g.table(d).is_some(),
            Self::Virtual(g)           => g.base_dim == d || g.table(d).is_some(),
            Self::MultiMaterialized(g) => g.dim_enabled(d),
        }
    }

    pub fn nulls_possible(&self, d: DimId) -> bool {
        match self {
            Self::Filter(_)            => false,
            Self::Materialized(g)      => g.nulls.get(d).copied().unwrap_or(false),
            Self::Virtual(g)           => g.nulls.get(d).copied().unwrap_or(false),
            Self::MultiMaterialized(g) => g.nulls_possible(d),
        }
    }

    /// 维度 d 背后的 Filter（Filter 组或 Virtual 组的基准维度）
    pub fn filter(&self, d: DimId) -> Option<&Arc<Filter>> {
        match self {
            Self::Filter(g) if g.dim == d       => Some(&g.filter),
            Self::Virtual(g) if g.base_dim == d => Some(&g.filter),
            _ => None,
        }
    }

    /// 驱动本组迭代的 Filter（不论维度）
    pub fn default_filter(&self) -> Option<&Arc<Filter>> {
        match self {
            Self::Filter(g)  => Some(&g.filter),
            Self::Virtual(g) => Some(&g.filter),
            _ => None,
        }
    }

    /// 可原地修改的 Filter：只有 Filter 组提供
    pub fn updatable_filter(&mut self, d: DimId) -> Option<&mut Filter> {
        match self {
            Self::Filter(g) if g.dim == d => Some(g.filter_mut()),
            _ => None,
        }
    }

    /// 本组涉及的维度（升序）
    pub fn dims(&self) -> Vec<DimId> {
        match self {
            Self::Filter(g)            => vec![g.dim],
            Self::Materialized(g)      => g.dims_used.iter().collect(),
            Self::Virtual(g)           => {
                let mut v: Vec<DimId> = g.dims_used.iter().collect();
                if !v.contains(&g.base_dim) {
                    v.push(g.base_dim);
                    v.sort_unstable();
                }
                v
            }
            Self::MultiMaterialized(g) => g.dims_used.iter().collect(),
        }
    }

    // ── 锁计数 ────────────────────────────────────────────────────────────────

    pub fn lock(&self, d: DimId, n: usize) {
        match self {
            Self::Filter(g)            => g.lock(n),
            Self::Materialized(g)      => { if let Some(t) = g.table(d) { t.lock(n) } }
            Self::Virtual(g)           => g.lock(d, n),
            Self::MultiMaterialized(g) => g.lock(d, n),
        }
    }

    pub fn unlock(&self, d: DimId) {
        match self {
            Self::Filter(g)            => g.unlock(),
            Self::Materialized(g)      => { if let Some(t) = g.table(d) { t.unlock() } }
            Self::Virtual(g)           => g.unlock(d),
            Self::MultiMaterialized(g) => g.unlock(d),
        }
    }

    pub fn lock_count(&self, d: DimId) -> usize {
        match self {
            Self::Filter(g)            => g.lock_count(),
            Self::Materialized(g)      => g.table(d).map_or(0, |t| t.lock_count()),
            Self::Virtual(g)           => g.lock_count(d),
            Self::MultiMaterialized(g) => g.lock_count(d),
        }
    }

    /// 所有变体都支持并行只读（Materialized 需配合 barrier_after_packrow）
    pub fn is_thread_safe(&self) -> bool { true }

    pub fn is_orderable(&self) -> bool {
        match self {
            Self::Filter(_)  => true,
            Self::Virtual(g) => g.is_orderable(),
            _                => false,
        }
    }

    /// 使本组为空（0 个元组）
    pub fn empty(&mut self) {
        match self {
            Self::Filter(g)            => g.filter_mut().reset_all(),
            Self::Virtual(g)           => g.empty(),
            Self::Materialized(g)      => {
                g.tables.iter_mut().for_each(|t| *t = None);
                g.num_tuples = 0;
            }
            Self::MultiMaterialized(g) => {
                *g = MultiMaterializedGroup::count_only(g.dims_used.clone(), 0);
            }
        }
    }

    /// shallow = true 时共享 Filter 块与 Index Table
    pub fn clone_group(&self, shallow: bool) -> Result<Self> {
        if shallow {
            return Ok(self.clone());
        }
        Ok(match self {
            Self::Filter(g)            => Self::Filter(FilterGroup::new(g.dim, g.filter.deep_copy())),
            Self::Materialized(g)      => Self::Materialized(g.deep_copy()?),
            Self::Virtual(g)           => Self::Virtual(g.deep_copy()?),
            Self::MultiMaterialized(g) => Self::MultiMaterialized(g.deep_copy()?),
        })
    }

    /// 换入失败等延迟报告的错误
    pub fn check_fault(&self) -> Result<()> {
        let tables: Vec<_> = match self {
            Self::Filter(_)            => return Ok(()),
            Self::Materialized(g)      => g.tables.iter().flatten().collect(),
            Self::Virtual(g)           => g.tables.iter().flatten().collect(),
            Self::MultiMaterialized(g) => g.shards.iter().flat_map(|s| s.tables.iter().flatten()).collect(),
        };
        tables.into_iter().try_for_each(|t| t.check_fault())
    }

    // ── 迭代器 ────────────────────────────────────────────────────────────────

    pub fn new_iterator(&self, dims: &DimensionVector, power: u32) -> DGIterator {
        match self {
            Self::Filter(g)            => DGIterator::Filter(FilterIter::new(g)),
            Self::Materialized(g)      => DGIterator::Materialized(MaterializedIter::new(g, dims, power)),
            Self::Virtual(g)           => DGIterator::Virtual(VirtualIter::new(g, dims, power)),
            Self::MultiMaterialized(g) => DGIterator::Multi(MultiIter::new(g, dims, power)),
        }
    }

    /// 按给定包序访问；不支持时返回 None
    pub fn new_ordered_iterator(&self, dims: &DimensionVector, order: &PackOrder, power: u32) -> Option<DGIterator> {
        match self {
            Self::Filter(g) => Some(DGIterator::Filter(FilterIter::ordered(g, order))),
            Self::Virtual(g) if g.is_orderable() => {
                Some(DGIterator::Virtual(VirtualIter::ordered(g, dims, power, order)))
            }
            _ => None,
        }
    }
}

// ── DGIterator ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum DGIterator {
    Filter(FilterIter),
    Materialized(MaterializedIter),
    Virtual(VirtualIter),
    Multi(MultiIter),
}

macro_rules! dispatch {
    ($self:expr, $it:ident => $e:expr) => {
        match $self {
            DGIterator::Filter($it)       => $e,
            DGIterator::Materialized($it) => $e,
            DGIterator::Virtual($it)      => $e,
            DGIterator::Multi($it)        => $e,
        }
    };
}

impl DGIterator {
    pub fn rewind(&mut self)                   { dispatch!(self, it => it.rewind()) }
    pub fn advance(&mut self)                  { dispatch!(self, it => it.advance()) }
    pub fn next_packrow(&mut self)             { dispatch!(self, it => it.next_packrow()) }
    pub fn is_valid(&self) -> bool             { dispatch!(self, it => it.is_valid()) }
    pub fn pack_size_left(&self) -> u64        { dispatch!(self, it => it.pack_size_left()) }

    /// 块内前进；到块尾回绕到本包行开头并返回 false
    pub fn next_inside_pack(&mut self) -> bool { dispatch!(self, it => it.next_inside_pack()) }

    pub fn cur_pos(&self, d: DimId) -> RowId {
        match self {
            Self::Filter(it)       => if d == it.dim() { it.cur_pos() } else { NULL_ROW },
            Self::Materialized(it) => it.cur_pos(d),
            Self::Virtual(it)      => it.cur_pos(d),
            Self::Multi(it)        => it.cur_pos(d),
        }
    }

    pub fn cur_pack(&self, d: DimId) -> PackId {
        match self {
            Self::Filter(it)       => if d == it.dim() { it.cur_pack() } else { NULL_PACK },
            Self::Materialized(it) => it.cur_pack(d),
            Self::Virtual(it)      => it.cur_pack(d),
            Self::Multi(it)        => it.cur_pack(d),
        }
    }

    /// 当前包行恰好是维度 d 的一个完整包（无重复、无 NULL）
    pub fn whole_pack(&self, d: DimId) -> bool {
        match self {
            Self::Filter(it)  => d == it.dim() && it.whole_pack(),
            Self::Virtual(it) => it.whole_pack(d),
            _ => false,
        }
    }

    pub fn nulls_exist(&self, d: DimId) -> bool {
        match self {
            Self::Filter(_)        => false,
            Self::Materialized(it) => it.nulls_exist(d),
            Self::Virtual(it)      => it.nulls_exist(d),
            Self::Multi(it)        => it.nulls_exist(d),
        }
    }

    pub fn barrier_after_packrow(&self) -> bool {
        dispatch!(self, it => it.barrier_after_packrow())
    }

    /// ahead = 0 为当前包，1 为下一个包行的包……；未知时 None
    pub fn next_packrow_ahead(&self, d: DimId, ahead: usize) -> Option<PackId> {
        match self {
            Self::Filter(it)       => it.next_packrow_ahead(ahead),
            Self::Materialized(it) => it.next_packrow_ahead(d, ahead),
            Self::Virtual(it)      => it.next_packrow_ahead(d, ahead),
            Self::Multi(it)        => it.next_packrow_ahead(d, ahead),
        }
    }

    /// 随机定位到一个包（Multi：一个分片）；不支持或包为空时返回 false
    pub fn rewind_to_pack(&mut self, pack: PackId) -> bool {
        match self {
            Self::Filter(it)       => it.rewind_to_pack(pack),
            Self::Virtual(it)      => it.rewind_to_pack(pack),
            Self::Multi(it)        => it.rewind_to_pack(pack),
            Self::Materialized(_)  => false,
        }
    }

    pub fn rewind_to_row(&mut self, row: RowId) {
        match self {
            Self::Filter(it)  => it.rewind_to_row(row),
            Self::Virtual(it) => it.rewind_to_row(row),
            _ => {}
        }
    }

    pub fn set_packs_to_go(&mut self, n: Option<usize>) {
        match self {
            Self::Filter(it)  => it.set_packs_to_go(n),
            Self::Virtual(it) => it.set_packs_to_go(n),
            _ => {}
        }
    }

    /// 切分并行任务用的分段大小；不支持时 None
    pub fn slices(&self) -> Option<Vec<u64>> {
        match self {
            Self::Filter(it)       => Some(it.slices()),
            Self::Virtual(it)      => Some(it.slices()),
            Self::Multi(it)        => Some(it.slices()),
            Self::Materialized(_)  => None,
        }
    }

    /// 只填写 dims 中、且本迭代器能提供的维度
    pub fn fill_current_pos(&self, cur_pos: &mut [RowId], cur_pack: &mut [PackId], dims: &DimensionVector) {
        match self {
            Self::Filter(it) => {
                let d = it.dim();
                if dims.get(d) {
                    cur_pos[d]  = it.cur_pos();
                    cur_pack[d] = it.cur_pack();
                }
            }
            Self::Materialized(it) => it.fill_current_pos(cur_pos, cur_pack, dims),
            Self::Virtual(it)      => it.fill_current_pos(cur_pos, cur_pack, dims),
            Self::Multi(it)        => it.fill_current_pos(cur_pos, cur_pack, dims),
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::Filter(it) if it.is_ordered())
    }
}
