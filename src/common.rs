//! 全局基础类型、常量与错误定义

use thiserror::Error;

// ── ID 类型别名 ───────────────────────────────────────────────────────────────

/// 维度编号（参与查询的源表序号，0..N-1）
pub type DimId    = usize;
/// 维度原始范围内的行号（0 起）
pub type RowId    = u64;
/// 包号（row >> power）
pub type PackId   = u32;
/// Block cache 中的块标识
pub type BlockId  = u64;

// ── 常量 ──────────────────────────────────────────────────────────────────────

/// "无对应行"（outer join 补齐）
pub const NULL_ROW:  RowId  = u64::MAX;
/// NULL 行所在的包
pub const NULL_PACK: PackId = u32::MAX;

/// 元组数上限 2^63，超过即视为 "too many tuples"
pub const MAX_TUPLES: u64 = 1 << 63;

/// 饱和乘法：结果 >= 2^63 时返回 None
pub fn safe_multiply(a: u64, b: u64) -> Option<u64> {
    if a == 0 || b == 0 {
        return Some(0);
    }
    match a.checked_mul(b) {
        Some(v) if v < MAX_TUPLES => Some(v),
        _ => None,
    }
}

#[inline]
pub fn pack_of(row: RowId, power: u32) -> PackId {
    if row == NULL_ROW { NULL_PACK } else { (row >> power) as PackId }
}

// ── DimensionVector ───────────────────────────────────────────────────────────

/// 维度集合（bool 位向量，下标 = DimId）
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DimensionVector {
    v: Vec<bool>,
}

impl DimensionVector {
    pub fn new(size: usize) -> Self { Self { v: vec![false; size] } }

    pub fn all(size: usize) -> Self { Self { v: vec![true; size] } }

    pub fn from_dims(size: usize, dims: &[DimId]) -> Self {
        let mut out = Self::new(size);
        for &d in dims {
            out.set(d, true);
        }
        out
    }

    pub fn len(&self)      -> usize { self.v.len() }
    pub fn is_empty(&self) -> bool  { self.v.is_empty() }

    #[inline]
    pub fn get(&self, dim: DimId) -> bool { self.v.get(dim).copied().unwrap_or(false) }

    pub fn set(&mut self, dim: DimId, value: bool) {
        if dim >= self.v.len() {
            self.v.resize(dim + 1, false);
        }
        self.v[dim] = value;
    }

    pub fn set_all(&mut self) { self.v.iter_mut().for_each(|b| *b = true); }

    pub fn clean(&mut self) { self.v.iter_mut().for_each(|b| *b = false); }

    /// 并集
    pub fn plus(&mut self, other: &DimensionVector) {
        if other.len() > self.len() {
            self.v.resize(other.len(), false);
        }
        for (i, &b) in other.v.iter().enumerate() {
            if b { self.v[i] = true; }
        }
    }

    pub fn intersects(&self, other: &DimensionVector) -> bool {
        self.iter().any(|d| other.get(d))
    }

    pub fn count(&self) -> usize { self.v.iter().filter(|b| **b).count() }

    /// 按升序遍历被标记的维度
    pub fn iter(&self) -> impl Iterator<Item = DimId> + '_ {
        self.v.iter().enumerate().filter(|(_, b)| **b).map(|(i, _)| i)
    }

    /// 追加一个（未标记的）维度
    pub fn push(&mut self, value: bool) { self.v.push(value); }
}

// ── 错误 ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum OlapError {
    #[error("too many tuples (exceeds 2^63)")]
    TooManyTuples,
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("query killed")]
    Killed,
    #[error("multi-index iterator lock is held in a conflicting mode")]
    IteratorLocked,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("block not found in cache: block_id={0}")]
    BlockNotFound(BlockId),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupted block: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, OlapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_multiply_saturates_at_two_pow_63() {
        assert_eq!(safe_multiply(1 << 31, 1 << 31), Some(1 << 62));
        assert_eq!(safe_multiply(1 << 32, 1 << 31), None);
        assert_eq!(safe_multiply(u64::MAX, 0), Some(0));
    }

    #[test]
    fn dimension_vector_plus_grows() {
        let mut a = DimensionVector::from_dims(2, &[0]);
        let b = DimensionVector::from_dims(4, &[3]);
        a.plus(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(a.len(), 4);
    }
}
