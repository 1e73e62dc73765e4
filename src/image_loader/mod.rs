//! # 番剧封面异步加载模块
//!
//! ## 设计思路
//!
//! 列表滚动时会在短时间内请求大量封面，UI 线程不能被网络或解码阻塞。
//! 模块拆分为职责单一的几层，由 `ImageLoader` 统一对外：
//!
//! ```text
//! enqueue(url, size)
//!     │  校验 → 认领处理中键（重复请求合并）
//!     ▼
//! flume 有界队列 ──► worker × N
//!                      │
//!                      ├─ cache   命中直接回放
//!                      ├─ fetcher 下载（指数退避重试）
//!                      └─ pipeline 签名校验 → 像素限制 → 解码 → 缩放 → 居中画布
//!                      │
//!                      ▼
//!                 dispatcher ──► 回调 / 通道订阅者
//! ```
//!
//! ## 实现思路
//!
//! - 错误按类别建模（`ErrorKind`），只有网络类错误会被重试。
//! - 结果缓存与处理中集合都是实例字段，不使用全局单例。
//! - 锁中毒统一通过 `lock_or_recover` 恢复，单个 worker 的 panic 不影响其他 worker。

mod cache;
mod config;
mod dispatcher;
mod error;
mod fetcher;
mod pending;
mod pipeline;
mod service;
mod source;
mod worker;

use std::sync::{Mutex, MutexGuard};

pub use cache::ImageCache;
pub use config::{FitMode, LoaderConfig, ResizeFilter};
pub use dispatcher::{Dispatcher, Subscription, SubscriptionId};
pub use error::{ErrorKind, ImageError};
pub use fetcher::{Fetch, HttpFetcher, RetryPolicy};
pub use pipeline::{center_offset, decode_and_resize, fit_dimensions, place_on_canvas, scale_factor};
pub use service::ImageLoader;
pub use source::{
    CacheKey, DecodedImage, EnqueueOutcome, ImageReady, LoadFailure, RejectReason, TargetSize,
};
pub use worker::StatsSnapshot;

/// 获取互斥锁；锁中毒时记录警告并继续使用内部数据。
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("{}锁中毒，继续使用恢复数据", what);
            poisoned.into_inner()
        }
    }
}
