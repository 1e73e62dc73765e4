//! # 服务层（加载器门面）
//!
//! ## 设计思路
//!
//! `ImageLoader` 是 UI 层唯一需要持有的对象，替代“线程子类 + 全局队列 + 运行标志”的写法：
//! 1. 生命周期清晰：创建即启动 worker，`stop()` 或 `Drop` 时关闭
//! 2. 所有共享状态集中在 `WorkerContext`，测试可创建独立实例
//! 3. 下载能力通过 `Fetch` 注入，便于替换与测试
//!
//! ## 实现思路
//!
//! - `enqueue`：校验参数 → 认领处理中键（重复请求直接合并）→ 非阻塞写入有界队列。
//! - `stop`：清运行标志 → 每个 worker 一个关闭哨兵 → 断开队列 → join →
//!   关闭分发器并清空缓存。幂等；在 worker 回调中调用时只发信号不 join。

use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

use super::dispatcher::{Subscription, SubscriptionId};
use super::fetcher::{Fetch, HttpFetcher, redact_url_for_log};
use super::source::{CacheKey, EnqueueOutcome, ImageReady, LoadFailure, LoadRequest, RejectReason, TargetSize};
use super::worker::{self, Job, LoaderStats, StatsSnapshot, WorkerContext, WorkerPool};
use super::{LoaderConfig, lock_or_recover};
use crate::error::LoaderError;

/// 异步图片加载器。
pub struct ImageLoader {
    context: Arc<WorkerContext>,
    sender: Mutex<Option<flume::Sender<Job>>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl ImageLoader {
    /// 使用默认 HTTP 下载器创建并启动加载器。
    ///
    /// # 示例
    /// ```rust,no_run
    /// use anime_cover_loader::image_loader::{ImageLoader, LoaderConfig, TargetSize};
    ///
    /// let loader = ImageLoader::new(LoaderConfig::default())?;
    /// let covers = loader.subscribe_channel();
    /// loader.enqueue("https://cdn.myanimelist.net/images/anime/1015/138006.jpg", TargetSize::new(280, 380));
    ///
    /// // UI 线程在自己的刷新节拍里拉取结果。
    /// for ready in covers.drain() {
    ///     println!("{} -> {:?}", ready.url, ready.image.dimensions());
    /// }
    /// loader.stop();
    /// # Ok::<(), anime_cover_loader::LoaderError>(())
    /// ```
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        config.validate()?;
        let fetcher = HttpFetcher::new(&config)?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    /// 使用自定义下载器创建并启动加载器。
    pub fn with_fetcher(config: LoaderConfig, fetcher: Arc<dyn Fetch>) -> Result<Self, LoaderError> {
        config.validate()?;

        let (sender, receiver) = flume::bounded(config.queue_capacity);
        let context = Arc::new(WorkerContext::new(config, fetcher));
        let pool = WorkerPool::spawn(&context, &receiver)?;

        Ok(Self {
            context,
            sender: Mutex::new(Some(sender)),
            pool: Mutex::new(Some(pool)),
        })
    }

    /// 提交加载请求，立即返回。
    ///
    /// 空白 URL 静默忽略（返回 `Rejected(EmptyUrl)`）；相同 (url, size) 正在处理时合并，
    /// 不会重复下载，也不会产生第二个事件。URL 原样作为缓存键与事件中的 `url`。
    pub fn enqueue(&self, url: &str, size: impl Into<TargetSize>) -> EnqueueOutcome {
        let size = size.into();

        if url.trim().is_empty() {
            return self.reject(RejectReason::EmptyUrl);
        }
        if size.is_empty() {
            log::warn!("⚠️ 拒绝加载请求：目标尺寸无效 {} - URL: {}", size, redact_url_for_log(url));
            return self.reject(RejectReason::InvalidSize);
        }
        if !self.context.is_running() {
            return self.reject(RejectReason::Stopped);
        }

        let key = CacheKey::new(url, size);
        if !self.context.pending.try_claim(&key) {
            LoaderStats::bump(&self.context.stats.coalesced);
            log::debug!("🔗 合并重复请求 - URL: {} 尺寸: {}", redact_url_for_log(url), size);
            return EnqueueOutcome::Coalesced;
        }

        let sent = {
            let guard = lock_or_recover(&self.sender, "请求队列发送端");
            match guard.as_ref() {
                Some(sender) => sender.try_send(Job::Load(LoadRequest::new(key.clone()))),
                None => Err(flume::TrySendError::Disconnected(Job::Shutdown)),
            }
        };

        match sent {
            Ok(()) => {
                LoaderStats::bump(&self.context.stats.accepted);
                EnqueueOutcome::Queued
            }
            Err(flume::TrySendError::Full(_)) => {
                self.context.pending.release(&key);
                log::warn!("⚠️ 请求队列已满，丢弃请求 - URL: {}", redact_url_for_log(url));
                self.reject(RejectReason::QueueFull)
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                self.context.pending.release(&key);
                self.reject(RejectReason::Stopped)
            }
        }
    }

    fn reject(&self, reason: RejectReason) -> EnqueueOutcome {
        LoaderStats::bump(&self.context.stats.rejected);
        EnqueueOutcome::Rejected(reason)
    }

    /// 注册完成回调（在 worker 线程上执行）。
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ImageReady) + Send + Sync + 'static,
    {
        self.context.dispatcher.subscribe(callback)
    }

    /// 注册完成事件通道，由调用方线程自行拉取。通道无界，订阅方需要持续拉取。
    pub fn subscribe_channel(&self) -> Subscription<ImageReady> {
        self.context.dispatcher.subscribe_channel()
    }

    /// 注册有界完成事件通道，通道满时新事件被丢弃。
    pub fn subscribe_channel_bounded(&self, capacity: usize) -> Subscription<ImageReady> {
        self.context.dispatcher.subscribe_channel_bounded(capacity)
    }

    /// 注册失败回调，失败分类见 `LoadFailure::error.kind()`。
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LoadFailure) + Send + Sync + 'static,
    {
        self.context.dispatcher.on_error(callback)
    }

    pub fn subscribe_failures(&self) -> Subscription<LoadFailure> {
        self.context.dispatcher.subscribe_failures()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.context.dispatcher.unsubscribe(id)
    }

    /// 停止加载器并等待全部 worker 退出。返回后不会再有任何事件。
    pub fn stop(&self) {
        let was_running = self.context.running.swap(false, Ordering::AcqRel);

        if let Some(sender) = lock_or_recover(&self.sender, "请求队列发送端").take() {
            for _ in 0..self.context.config.worker_count {
                if sender.try_send(Job::Shutdown).is_err() {
                    // 队列已满：worker 会在处理完当前任务后观察到运行标志。
                    break;
                }
            }
        }

        if worker::is_worker_thread() {
            // 在 worker 回调里调用：只发信号，由持有者线程完成 join。
            // 最后一个句柄在回调里被丢弃时不会再有第二次 stop，资源在这里释放。
            self.context.dispatcher.close();
            self.context.cache.clear();
            self.context.pending.clear();
            log::warn!("🛑 在 worker 线程内请求停止加载器，已发出关闭信号");
            return;
        }

        {
            let mut pool = lock_or_recover(&self.pool, "worker 池");
            if let Some(pool) = pool.take() {
                let count = pool.len();
                pool.join();
                log::info!("🛑 图片加载器已停止，{} 个 worker 已退出", count);
            }
        }

        self.context.dispatcher.close();
        self.context.cache.clear();
        self.context.pending.clear();

        if was_running {
            let stats = self.context.stats.snapshot();
            log::info!(
                "📊 加载统计 - accepted={} coalesced={} cache_hits={} fetches={} loaded={} failed={}",
                stats.accepted,
                stats.coalesced,
                stats.cache_hits,
                stats.fetches,
                stats.loaded,
                stats.failed
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.context.is_running()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.context.stats.snapshot()
    }

    pub fn cached_len(&self) -> usize {
        self.context.cache.len()
    }

    /// 排队中与处理中的键数量。
    pub fn pending_len(&self) -> usize {
        self.context.pending.len()
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.context.config
    }
}

impl Drop for ImageLoader {
    fn drop(&mut self) {
        self.stop();
    }
}
