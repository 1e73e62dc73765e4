//! 处理中的缓存键集合。
//!
//! 键在入队时被“认领”，worker 处理结束后释放；认领期间相同键的请求会被合并，
//! 保证同一 (url, size) 不会同时触发两次下载与解码。

use std::collections::HashSet;
use std::sync::Mutex;

use super::lock_or_recover;
use super::source::CacheKey;

#[derive(Default)]
pub(crate) struct PendingSet {
    keys: Mutex<HashSet<CacheKey>>,
}

impl PendingSet {
    /// 认领键；已被认领时返回 `false`。
    pub(crate) fn try_claim(&self, key: &CacheKey) -> bool {
        let mut keys = lock_or_recover(&self.keys, "处理中集合");
        if keys.contains(key) {
            return false;
        }
        keys.insert(key.clone())
    }

    pub(crate) fn release(&self, key: &CacheKey) {
        lock_or_recover(&self.keys, "处理中集合").remove(key);
    }

    pub(crate) fn len(&self) -> usize {
        lock_or_recover(&self.keys, "处理中集合").len()
    }

    pub(crate) fn clear(&self) {
        lock_or_recover(&self.keys, "处理中集合").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_loader::TargetSize;

    #[test]
    fn claim_is_exclusive_until_released() {
        let pending = PendingSet::default();
        let key = CacheKey::new("https://cdn.example.com/a.jpg", TargetSize::new(280, 380));

        assert!(pending.try_claim(&key));
        assert!(!pending.try_claim(&key));
        assert_eq!(pending.len(), 1);

        pending.release(&key);
        assert!(pending.try_claim(&key));
    }

    #[test]
    fn different_sizes_are_claimed_independently() {
        let pending = PendingSet::default();
        let url = "https://cdn.example.com/a.jpg";

        assert!(pending.try_claim(&CacheKey::new(url, TargetSize::new(280, 380))));
        assert!(pending.try_claim(&CacheKey::new(url, TargetSize::new(400, 600))));
        assert_eq!(pending.len(), 2);

        pending.clear();
        assert_eq!(pending.len(), 0);
    }
}
