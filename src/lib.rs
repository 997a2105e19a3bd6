//! # olap-multi-index
//!
//! 列式分析引擎的元组空间核心：把若干张表（维度）上的行号组合表示为 MultiIndex，
//! 并按包行（packrow）遍历。合并两部分：
//! - **存储层**：位图 Filter、Index Table（分页、可溢出到块缓存）
//! - **元组层**：维度组、MultiIndex、packrow 迭代器、新内容构建器
//!
//! ## 整体架构
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         MultiIndex                             │
//! │   groups: [Filter | Materialized | Virtual | MultiMaterialized]│
//! │   group_for_dim: 维度 → 组（划分）                              │
//! │        │                                   ▲                   │
//! │        │ new_iterator                      │ install_groups    │
//! │        ▼                                   │                   │
//! │   MIIterator (组间里程表)          MINewContents / Builder     │
//! │   ├─ MIDummyIterator                ├─ FilterForget / Virtual  │
//! │   └─ MIInpackIterator               ├─ Material + RoughSorter  │
//! │                                     └─ BuildItem × N (并行)    │
//! │   ┌──────────────────────────────────────────────────────┐    │
//! │   │  Filter (按包分块的位图)   IndexTable (分页行号表)     │    │
//! │   │        └──── page: 块头 + CRC32 + LZ4 ────┘          │    │
//! │   │                 BlockCache (溢出页)                   │    │
//! │   └──────────────────────────────────────────────────────┘    │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ── 基础 ─────────────────────────────────────────────────────────────────────
pub mod common;
pub mod config;
pub mod compression;
pub mod page;
pub mod cache;

// ── 存储层 ───────────────────────────────────────────────────────────────────
pub mod filter;
pub mod pack_order;
pub mod index_table;

// ── 元组层 ───────────────────────────────────────────────────────────────────
pub mod dim_group;
pub mod multi_index;
pub mod mi_iterator;
pub mod builder;

pub use builder::{BuildItem, ContentStrategy, JoinTips, MINewContents, MultiIndexBuilder};
pub use common::{DimId, DimensionVector, OlapError, PackId, Result, RowId, NULL_PACK, NULL_ROW};
pub use config::{MultiIndexConfig, QueryContext};
pub use dim_group::{DimensionGroup, GroupKind};
pub use filter::Filter;
pub use index_table::IndexTable;
pub use mi_iterator::{MIDummyIterator, MIInpackIterator, MIIterator, TupleCursor};
pub use multi_index::MultiIndex;
pub use pack_order::PackOrder;
