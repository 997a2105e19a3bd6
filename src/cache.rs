//! 外部 block cache 接口
//!
//! Index Table 页和 Filter 块通过 `load` / `store` 换入换出。
//! 本层只要求在单个查询生命周期内可用，不要求持久化。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::common::{BlockId, OlapError, Result};

pub trait BlockCache: Send + Sync {
    fn load(&self, id: BlockId) -> Result<Vec<u8>>;
    fn store(&self, id: BlockId, bytes: Vec<u8>) -> Result<()>;
    /// 块不再需要（所属结构已销毁或块已换回内存）
    fn remove(&self, id: BlockId);
}

/// 进程内存实现，测试和单机场景使用
#[derive(Default)]
pub struct MemoryBlockCache {
    blocks: Mutex<HashMap<BlockId, Vec<u8>>>,
    loads:  AtomicU64,
    stores: AtomicU64,
}

impl MemoryBlockCache {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self)      -> usize { self.blocks.lock().len() }
    pub fn is_empty(&self) -> bool  { self.blocks.lock().is_empty() }
    pub fn loads(&self)    -> u64   { self.loads.load(Ordering::Relaxed) }
    pub fn stores(&self)   -> u64   { self.stores.load(Ordering::Relaxed) }

    /// 已缓存的字节总数
    pub fn resident_bytes(&self) -> usize {
        self.blocks.lock().values().map(|b| b.len()).sum()
    }
}

impl BlockCache for MemoryBlockCache {
    fn load(&self, id: BlockId) -> Result<Vec<u8>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock()
            .get(&id)
            .cloned()
            .ok_or(OlapError::BlockNotFound(id))
    }

    fn store(&self, id: BlockId, bytes: Vec<u8>) -> Result<()> {
        self.stores.fetch_add(1, Ordering::Relaxed);
        self.blocks.lock().insert(id, bytes);
        Ok(())
    }

    fn remove(&self, id: BlockId) {
        self.blocks.lock().remove(&id);
    }
}
