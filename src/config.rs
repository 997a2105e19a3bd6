//! 引擎配置与查询上下文
//!
//! `MultiIndexConfig` 是纯数据；`QueryContext` 把配置、block cache、
//! kill 标志和工作线程池绑定到一次查询，替代进程级全局状态。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use rayon::ThreadPool;

use crate::cache::BlockCache;
use crate::common::{BlockId, OlapError, Result};
use crate::compression::CompressionType;

pub const DEFAULT_PACK_POWER: u32 = 16;
pub const MIN_PACK_POWER:     u32 = 1;
pub const MAX_PACK_POWER:     u32 = 24;

// ── MultiIndexConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MultiIndexConfig {
    /// 每包 2^pack_power 行，整个 MultiIndex 生命周期内固定
    pub pack_power:                u32,
    /// Index Table 每页字节数（2 的幂）
    pub index_page_bytes:          usize,
    /// 单个 Index Table / Filter 的工作集上限
    pub max_table_bytes:           u64,
    /// 挂载 block cache 时，单表常驻页数超过此值即换出
    pub max_resident_pages:        Option<usize>,
    pub spill_compression:         CompressionType,
    pub rough_sort:                bool,
    /// 窗口内跨包跳转次数超过此值触发 rough sort
    pub rough_sort_jump_threshold: usize,
    /// 0 = 使用硬件并行度
    pub worker_threads:            usize,
}

impl Default for MultiIndexConfig {
    fn default() -> Self {
        Self {
            pack_power:                DEFAULT_PACK_POWER,
            index_page_bytes:          1 << 20,
            max_table_bytes:           1 << 36,
            max_resident_pages:        None,
            spill_compression:         CompressionType::Lz4,
            rough_sort:                true,
            rough_sort_jump_threshold: 16,
            worker_threads:            0,
        }
    }
}

impl MultiIndexConfig {
    pub fn new() -> Self { Self::default() }

    /// 默认值 + 环境变量覆盖（MI_PACK_POWER / MI_WORKER_THREADS）
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("MI_PACK_POWER") {
            cfg.pack_power = v.trim().parse()
                .map_err(|_| OlapError::InvalidArgument(format!("MI_PACK_POWER={v}")))?;
        }
        if let Ok(v) = std::env::var("MI_WORKER_THREADS") {
            cfg.worker_threads = v.trim().parse()
                .map_err(|_| OlapError::InvalidArgument(format!("MI_WORKER_THREADS={v}")))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_pack_power(mut self, power: u32) -> Self {
        self.pack_power = power; self
    }
    pub fn with_index_page_bytes(mut self, bytes: usize) -> Self {
        self.index_page_bytes = bytes; self
    }
    pub fn with_max_table_bytes(mut self, bytes: u64) -> Self {
        self.max_table_bytes = bytes; self
    }
    pub fn with_max_resident_pages(mut self, pages: usize) -> Self {
        self.max_resident_pages = Some(pages); self
    }
    pub fn with_spill_compression(mut self, c: CompressionType) -> Self {
        self.spill_compression = c; self
    }
    pub fn with_rough_sort(mut self, enabled: bool) -> Self {
        self.rough_sort = enabled; self
    }
    pub fn with_rough_sort_jump_threshold(mut self, jumps: usize) -> Self {
        self.rough_sort_jump_threshold = jumps; self
    }
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n; self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PACK_POWER..=MAX_PACK_POWER).contains(&self.pack_power) {
            return Err(OlapError::InvalidArgument(format!(
                "pack_power {} outside [{MIN_PACK_POWER}, {MAX_PACK_POWER}]", self.pack_power
            )));
        }
        if !self.index_page_bytes.is_power_of_two() || self.index_page_bytes < 64 {
            return Err(OlapError::InvalidArgument(format!(
                "index_page_bytes {} must be a power of two >= 64", self.index_page_bytes
            )));
        }
        if self.max_resident_pages == Some(0) {
            return Err(OlapError::InvalidArgument("max_resident_pages must be > 0".into()));
        }
        Ok(())
    }

    /// 有效工作线程数
    pub fn effective_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

// ── QueryContext ──────────────────────────────────────────────────────────────

/// 单次查询的运行时上下文
pub struct QueryContext {
    config:     MultiIndexConfig,
    cache:      Option<Arc<dyn BlockCache>>,
    killed:     AtomicBool,
    next_table: AtomicU64,
    pool:       OnceLock<Option<ThreadPool>>,
}

impl QueryContext {
    pub fn new(config: MultiIndexConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            cache:      None,
            killed:     AtomicBool::new(false),
            next_table: AtomicU64::new(1),
            pool:       OnceLock::new(),
        }))
    }

    pub fn with_cache(config: MultiIndexConfig, cache: Arc<dyn BlockCache>) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            cache:      Some(cache),
            killed:     AtomicBool::new(false),
            next_table: AtomicU64::new(1),
            pool:       OnceLock::new(),
        }))
    }

    /// 默认配置（pack_power 指定）
    pub fn with_power(power: u32) -> Result<Arc<Self>> {
        Self::new(MultiIndexConfig::default().with_pack_power(power))
    }

    pub fn config(&self) -> &MultiIndexConfig { &self.config }
    pub fn power(&self)  -> u32 { self.config.pack_power }
    pub fn cache(&self)  -> Option<&Arc<dyn BlockCache>> { self.cache.as_ref() }

    // ── 取消 ──────────────────────────────────────────────────────────────────

    pub fn kill(&self) { self.killed.store(true, Ordering::Release); }

    pub fn is_killed(&self) -> bool { self.killed.load(Ordering::Acquire) }

    /// 在包边界轮询
    pub fn check_killed(&self) -> Result<()> {
        if self.is_killed() { Err(OlapError::Killed) } else { Ok(()) }
    }

    // ── 资源 ──────────────────────────────────────────────────────────────────

    /// 为一个新表分配块号空间：高 32 位为表号，低 32 位为页号
    pub fn allocate_table_id(&self) -> BlockId {
        self.next_table.fetch_add(1, Ordering::Relaxed) << 32
    }

    /// 检查一个结构的字节数是否超出工作集上限
    pub fn check_table_bytes(&self, what: &str, bytes: u64) -> Result<()> {
        if bytes > self.config.max_table_bytes {
            return Err(OlapError::OutOfMemory(format!(
                "{what} needs {bytes} bytes, limit is {}", self.config.max_table_bytes
            )));
        }
        Ok(())
    }

    /// 查询级线程池；无法创建时返回 None，调用方退化为单线程
    pub fn pool(&self) -> Option<&ThreadPool> {
        self.pool.get_or_init(|| {
            let requested = self.config.effective_threads().max(1);
            let try_build = |n| rayon::ThreadPoolBuilder::new().num_threads(n).build();
            match try_build(requested) {
                Ok(pool) => Some(pool),
                Err(_) if requested > 1 => try_build(1).ok(),
                Err(_) => None,
            }
        }).as_ref()
    }
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("config", &self.config)
            .field("has_cache", &self.cache.is_some())
            .field("killed", &self.is_killed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_power() {
        let cfg = MultiIndexConfig::default().with_pack_power(40);
        assert!(matches!(cfg.validate(), Err(OlapError::InvalidArgument(_))));
        assert!(MultiIndexConfig::default().with_pack_power(4).validate().is_ok());
    }

    #[test]
    fn kill_flag_is_observed() {
        let ctx = QueryContext::with_power(4).unwrap();
        assert!(ctx.check_killed().is_ok());
        ctx.kill();
        assert!(matches!(ctx.check_killed(), Err(OlapError::Killed)));
    }

    #[test]
    fn table_ids_do_not_overlap() {
        let ctx = QueryContext::with_power(4).unwrap();
        let a = ctx.allocate_table_id();
        let b = ctx.allocate_table_id();
        assert_eq!(b - a, 1 << 32);
    }
}
