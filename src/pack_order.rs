//! 包访问顺序
//!
//! 有序迭代器按外部给定的包序访问 Filter 的非空块，块内仍保持行号升序。
//! 典型用法：按包统计（min/max）排序，把最可能命中的包排到前面，
//! 使 LIMIT / EXISTS 之类的算子尽早结束。

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::PackId;
use crate::filter::Filter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOrder {
    packs: Arc<[PackId]>,
}

impl PackOrder {
    /// 显式给定的包序；重复的包号只保留第一次出现
    pub fn new(order: impl IntoIterator<Item = PackId>) -> Self {
        let mut seen = HashSet::new();
        let packs: Vec<PackId> = order.into_iter().filter(|p| seen.insert(*p)).collect();
        Self { packs: packs.into() }
    }

    /// 自然顺序 0..num_packs
    pub fn natural(num_packs: usize) -> Self {
        Self { packs: (0..num_packs as PackId).collect::<Vec<_>>().into() }
    }

    /// 按 key 升序（稳定），降序用 `std::cmp::Reverse` 包装 key
    pub fn by_key<K: Ord>(num_packs: usize, key: impl Fn(PackId) -> K) -> Self {
        let mut packs: Vec<PackId> = (0..num_packs as PackId).collect();
        packs.sort_by_key(|p| key(*p));
        Self { packs: packs.into() }
    }

    /// 1 最多的块优先
    pub fn densest_first(filter: &Filter) -> Self {
        Self::by_key(filter.num_blocks(), |p| {
            std::cmp::Reverse(filter.count_ones_in_block(p as usize))
        })
    }

    pub fn len(&self)      -> usize { self.packs.len() }
    pub fn is_empty(&self) -> bool  { self.packs.is_empty() }
    pub fn as_slice(&self) -> &[PackId] { &self.packs }

    /// 剩余部分是否已是升序
    pub fn is_natural(&self) -> bool {
        self.packs.windows(2).all(|w| w[0] < w[1])
    }

    /// 针对 num_blocks 个块的完整访问序列：
    /// 去掉越界的包号，未出现的包按升序补在末尾
    pub fn resolve(&self, num_blocks: usize) -> Arc<[PackId]> {
        let mut listed = vec![false; num_blocks];
        let mut out = Vec::with_capacity(num_blocks);
        for &p in self.packs.iter() {
            if (p as usize) < num_blocks && !listed[p as usize] {
                listed[p as usize] = true;
                out.push(p);
            }
        }
        out.extend((0..num_blocks).filter(|b| !listed[*b]).map(|b| b as PackId));
        out.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_appends_missing_packs() {
        let order = PackOrder::new([3, 1, 3, 9]);
        assert_eq!(&*order.resolve(5), &[3, 1, 0, 2, 4]);
        assert!(!order.is_natural());
        assert!(PackOrder::natural(4).is_natural());
    }

    #[test]
    fn densest_first_prefers_full_blocks() {
        let mut f = Filter::new(64, 4, false).unwrap();
        f.set(1).unwrap();
        f.set_between(32, 47).unwrap();
        f.set(50).unwrap();
        f.set(51).unwrap();
        let order = PackOrder::densest_first(&f);
        assert_eq!(order.as_slice(), &[2, 3, 0, 1]);
    }
}
