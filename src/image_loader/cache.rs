//! # 结果缓存模块
//!
//! ## 设计思路
//!
//! 以 `(url, size)` 为键缓存解码后的 RGBA 图像，容量固定，按最近最少使用淘汰。
//! 值以 `Arc` 共享，命中回放时不复制像素缓冲。
//!
//! ## 实现思路
//!
//! `Mutex<LruCache>` 保证多 worker 并发 `get/put` 时内部状态与容量计数一致；
//! 锁中毒时继续使用恢复出的数据，不让单个 worker 的 panic 拖垮整个缓存。

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::lock_or_recover;
use super::source::{CacheKey, DecodedImage};

pub struct ImageCache {
    entries: Mutex<LruCache<CacheKey, Arc<DecodedImage>>>,
    capacity: NonZeroUsize,
}

impl ImageCache {
    /// 创建指定容量的缓存，容量为 0 时按 1 处理。
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity,
        }
    }

    /// 读取并刷新最近使用时间。
    pub fn get(&self, key: &CacheKey) -> Option<Arc<DecodedImage>> {
        lock_or_recover(&self.entries, "图片缓存").get(key).cloned()
    }

    /// 写入（覆盖同键旧值并刷新最近使用时间），超出容量时淘汰最久未使用的条目。
    pub fn put(&self, key: CacheKey, image: Arc<DecodedImage>) {
        let evicted = lock_or_recover(&self.entries, "图片缓存").push(key.clone(), image);

        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                log::debug!(
                    "♻️ 缓存已满，淘汰最久未使用条目：{} @ {}",
                    super::fetcher::redact_url_for_log(&evicted_key.url),
                    evicted_key.size
                );
            }
        }
    }

    /// 仅检查是否存在，不影响淘汰顺序。
    pub fn contains(&self, key: &CacheKey) -> bool {
        lock_or_recover(&self.entries, "图片缓存").contains(key)
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries, "图片缓存").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn clear(&self) {
        lock_or_recover(&self.entries, "图片缓存").clear();
    }
}
