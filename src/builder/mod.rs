//! 新一代 MultiIndex 内容的构建
//!
//! 连接 / 过滤算子对每个输出元组给出 (维度 → 行号)，构建器把它们累积成新的维度组：
//!
//! ```text
//!   MINewContents        单线程；自动在 FilterForget / Virtual / Material 间选择
//!   MultiIndexBuilder    多个 BuildItem 并行追加，提交为 Multi-Materialized 组
//! ```
//!
//! 两者都在初始化时锁住涉及的维度，提交或 drop 时释放。

mod new_contents;
mod parallel;
mod rough_sort;

use crate::common::{DimId, Result, RowId, NULL_ROW};
use crate::index_table::IndexTable;

pub use new_contents::{ContentStrategy, MINewContents};
pub use parallel::{BuildItem, MultiIndexBuilder};
pub use rough_sort::RoughSorter;

/// 连接提示：哪些维度之后不再需要、哪些维度只关心不同的行号
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTips {
    /// 不物化该维度（后续算子不再取其行号）
    pub forget_now:    Vec<bool>,
    /// 该维度上重复的行号可以忽略
    pub distinct_only: Vec<bool>,
    /// 只需要元组数
    pub count_only:    bool,
}

impl JoinTips {
    pub fn new(num_dims: usize) -> Self {
        Self {
            forget_now:    vec![false; num_dims],
            distinct_only: vec![false; num_dims],
            count_only:    false,
        }
    }

    pub fn forget(mut self, d: DimId) -> Self {
        self.forget_now[d] = true;
        self
    }

    pub fn distinct(mut self, d: DimId) -> Self {
        self.distinct_only[d] = true;
        self
    }

    pub fn with_count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    pub fn is_forgotten(&self, d: DimId) -> bool {
        self.forget_now.get(d).copied().unwrap_or(false)
    }
}

/// 表扩容时的目标大小
fn grown_size(obj: u64) -> u64 {
    if obj < 2048 { 2048 } else { obj * 4 }
}

/// 在位置 `obj` 追加一个元组到所有存在的表中
fn append_tuple(
    tables: &mut [Option<IndexTable>],
    nulls:  &mut [bool],
    values: &[RowId],
    obj:    u64,
    mut rough: Option<&mut RoughSorter>,
) -> Result<()> {
    if let Some(r) = rough.as_deref_mut() {
        r.commit_values(values, obj, tables)?;
    }
    if tables.iter().flatten().any(|t| obj >= t.size()) {
        if let Some(r) = rough.as_deref_mut() {
            r.barrier(tables)?;
        }
    }
    for (d, slot) in tables.iter_mut().enumerate() {
        let Some(t) = slot.as_mut() else { continue };
        if obj >= t.size() {
            t.expand_to(grown_size(obj))?;
        }
        let row = values.get(d).copied().unwrap_or(NULL_ROW);
        if row == NULL_ROW {
            nulls[d] = true;
        }
        t.set(obj, row)?;
    }
    Ok(())
}
