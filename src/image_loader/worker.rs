//! # 工作线程池模块
//!
//! ## 设计思路
//!
//! 固定数量的同构 worker 共享一个 `WorkerContext`（缓存、处理中集合、分发器、下载器、配置），
//! 通过 `Arc` 显式传入，不依赖任何全局状态。
//!
//! ## 实现思路
//!
//! 每个 worker 循环：
//! 1. 以有界超时从请求队列取任务，期间检查运行标志
//! 2. 缓存命中直接回放，不发网络请求
//! 3. 未命中：下载 → 解码 → 入缓存
//! 4. 无论成败先释放处理中键，再分发完成/失败事件
//!
//! 下载与解码中的 panic 在 worker 边界被捕获并转成解码错误，worker 继续处理下一个任务。

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::cache::ImageCache;
use super::dispatcher::Dispatcher;
use super::fetcher::{Fetch, redact_url_for_log};
use super::pending::PendingSet;
use super::pipeline::decode_and_resize;
use super::source::{DecodedImage, ImageReady, LoadFailure, LoadRequest};
use super::{ImageError, LoaderConfig};
use crate::error::LoaderError;

thread_local! {
    static IS_LOADER_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// 当前线程是否为加载器 worker（用于避免在回调里 join 自己）。
pub(crate) fn is_worker_thread() -> bool {
    IS_LOADER_WORKER.with(Cell::get)
}

/// 请求队列中的任务。
pub(crate) enum Job {
    Load(LoadRequest),
    /// 关闭哨兵：每个 worker 收到一个后退出循环。
    Shutdown,
}

/// 加载器运行统计。
#[derive(Debug, Default)]
pub(crate) struct LoaderStats {
    pub(crate) accepted: AtomicU64,
    pub(crate) coalesced: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) fetches: AtomicU64,
    pub(crate) loaded: AtomicU64,
    pub(crate) failed: AtomicU64,
}

/// 统计快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub coalesced: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub fetches: u64,
    pub loaded: u64,
    pub failed: u64,
}

impl LoaderStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            loaded: self.loaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// 所有 worker 共享的句柄集合。
pub(crate) struct WorkerContext {
    pub(crate) config: LoaderConfig,
    pub(crate) cache: ImageCache,
    pub(crate) pending: PendingSet,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) fetcher: Arc<dyn Fetch>,
    pub(crate) running: AtomicBool,
    pub(crate) stats: LoaderStats,
}

impl WorkerContext {
    pub(crate) fn new(config: LoaderConfig, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            cache: ImageCache::new(config.cache_capacity),
            pending: PendingSet::default(),
            dispatcher: Dispatcher::new(),
            fetcher,
            running: AtomicBool::new(true),
            stats: LoaderStats::default(),
            config,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// 启动 `worker_count` 个命名线程。任一线程创建失败时回收已启动的线程。
    pub(crate) fn spawn(
        context: &Arc<WorkerContext>,
        jobs: &flume::Receiver<Job>,
    ) -> Result<Self, LoaderError> {
        let worker_count = context.config.worker_count;
        let mut handles = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let worker_context = Arc::clone(context);
            let jobs = jobs.clone();
            let spawned = thread::Builder::new()
                .name(format!("image-loader-{}", index))
                .spawn(move || run_worker(index, worker_context, jobs));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // 已启动的 worker 会在下一次轮询时观察到运行标志并退出。
                    context.running.store(false, Ordering::Release);
                    Self { handles }.join();
                    return Err(LoaderError::Spawn(format!("第 {} 个 worker 启动失败: {}", index, e)));
                }
            }
        }

        log::info!("🚀 图片加载 worker 已启动：{} 个", worker_count);
        Ok(Self { handles })
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// 等待全部 worker 退出；跳过当前线程自身，避免自我 join。
    pub(crate) fn join(self) {
        let current = thread::current().id();
        for handle in self.handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().unwrap_or("image-loader").to_string();
            if handle.join().is_err() {
                log::error!("❌ worker {} 异常退出", name);
            }
        }
    }
}

fn run_worker(index: usize, context: Arc<WorkerContext>, jobs: flume::Receiver<Job>) {
    IS_LOADER_WORKER.with(|flag| flag.set(true));
    let poll_interval = context.config.queue_poll_interval();
    log::debug!("worker {} 进入循环", index);

    loop {
        if !context.is_running() {
            break;
        }

        match jobs.recv_timeout(poll_interval) {
            Ok(Job::Load(request)) => {
                if !context.is_running() {
                    context.pending.release(&request.key);
                    break;
                }
                process_request(&context, request);
            }
            Ok(Job::Shutdown) => break,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::debug!("worker {} 已退出", index);
}

fn process_request(context: &WorkerContext, request: LoadRequest) {
    let key = request.key;
    let queued_ms = request.enqueued_at.elapsed().as_millis();

    if let Some(image) = context.cache.get(&key) {
        LoaderStats::bump(&context.stats.cache_hits);
        context.pending.release(&key);
        log::debug!(
            "♻️ 命中结果缓存 - URL: {} 尺寸: {}",
            redact_url_for_log(&key.url),
            key.size
        );
        if context.is_running() {
            context.dispatcher.publish(ImageReady {
                url: key.url,
                size: key.size,
                image,
                from_cache: true,
            });
        }
        return;
    }

    let total_start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| load_uncached(context, &key.url, key.size)))
        .unwrap_or_else(|_| {
            log::error!("❌ 加载过程中发生 panic - URL: {}", redact_url_for_log(&key.url));
            Err(ImageError::Decode("加载过程中发生内部错误".to_string()))
        });

    match outcome {
        Ok((image, fetch_ms, decode_ms)) => {
            let image = Arc::new(image);
            // 停止后缓存已清空，不再回填。
            if context.is_running() {
                context.cache.put(key.clone(), Arc::clone(&image));
            }
            context.pending.release(&key);
            LoaderStats::bump(&context.stats.loaded);

            log::info!(
                "✅ 图片加载完成 - URL: {} 尺寸: {} queued={}ms fetch={}ms decode={}ms total={}ms",
                redact_url_for_log(&key.url),
                key.size,
                queued_ms,
                fetch_ms,
                decode_ms,
                total_start.elapsed().as_millis()
            );

            if context.is_running() {
                context.dispatcher.publish(ImageReady {
                    url: key.url,
                    size: key.size,
                    image,
                    from_cache: false,
                });
            }
        }
        Err(ImageError::Cancelled(reason)) => {
            context.pending.release(&key);
            log::debug!("🛑 加载已取消 - URL: {}（{}）", redact_url_for_log(&key.url), reason);
        }
        Err(error) => {
            context.pending.release(&key);
            LoaderStats::bump(&context.stats.failed);
            log::warn!(
                "⚠️ 图片加载失败 - URL: {} 尺寸: {}：{}",
                redact_url_for_log(&key.url),
                key.size,
                error
            );

            if context.is_running() {
                context.dispatcher.report_failure(LoadFailure {
                    url: key.url,
                    size: key.size,
                    error,
                });
            }
        }
    }
}

/// 下载并解码，返回结果与两个阶段的耗时（毫秒）。
fn load_uncached(
    context: &WorkerContext,
    url: &str,
    size: super::TargetSize,
) -> Result<(DecodedImage, u128, u128), ImageError> {
    let is_cancelled = || !context.is_running();

    let fetch_start = Instant::now();
    LoaderStats::bump(&context.stats.fetches);
    let bytes = context.fetcher.fetch(url, &is_cancelled)?;
    let fetch_ms = fetch_start.elapsed().as_millis();

    if is_cancelled() {
        return Err(ImageError::Cancelled("下载完成时加载器已停止".to_string()));
    }

    let decode_start = Instant::now();
    let image = decode_and_resize(&bytes, size, &context.config)?;
    let decode_ms = decode_start.elapsed().as_millis();

    Ok((image, fetch_ms, decode_ms))
}
