//! # 完成事件分发模块
//!
//! ## 设计思路
//!
//! 替代信号/槽式的回调绑定：订阅者可以注册回调（在 worker 线程上同步调用），
//! 也可以拿到一个通道，由 UI 所在线程按自己的节奏拉取，避免阻塞交互线程。
//! 成功事件与失败事件走两套独立的注册表。
//!
//! ## 实现思路
//!
//! - 注册表为 `RwLock<Vec<(id, Arc<Sink>)>>`，分发时先复制快照再逐个投递，
//!   因此回调内部再订阅/退订不会死锁。
//! - 回调 panic 被捕获并记录，不会中断 worker。
//! - 通道接收端被丢弃的订阅在下一次分发时自动清理。
//! - `close` 之后不再投递任何事件，并断开所有通道。

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use super::source::{ImageReady, LoadFailure};

/// 订阅句柄，用于 `unsubscribe`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// 通道式订阅：UI 线程自行拉取事件。
pub struct Subscription<T> {
    id: SubscriptionId,
    receiver: flume::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// 非阻塞读取一个事件。
    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// 取出当前已到达的全部事件。
    pub fn drain(&self) -> Vec<T> {
        self.receiver.try_iter().collect()
    }

    /// 底层接收端，异步宿主可使用 `recv_async`。
    pub fn receiver(&self) -> &flume::Receiver<T> {
        &self.receiver
    }
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

enum Sink<T> {
    Callback(Callback<T>),
    Channel(flume::Sender<T>),
}

struct Registry<T> {
    sinks: RwLock<Vec<(SubscriptionId, Arc<Sink<T>>)>>,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(SubscriptionId, Arc<Sink<T>>)>> {
        match self.sinks.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("订阅表读锁中毒，继续使用恢复数据");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(SubscriptionId, Arc<Sink<T>>)>> {
        match self.sinks.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("订阅表写锁中毒，继续使用恢复数据");
                poisoned.into_inner()
            }
        }
    }

    fn add(&self, id: SubscriptionId, sink: Sink<T>) {
        self.write().push((id, Arc::new(sink)));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut sinks = self.write();
        let before = sinks.len();
        sinks.retain(|(existing, _)| *existing != id);
        sinks.len() != before
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear();
    }

    /// 向快照中的每个订阅者投递事件，返回成功投递数。
    fn emit(&self, event: &T, label: &str) -> usize {
        let snapshot: Vec<(SubscriptionId, Arc<Sink<T>>)> = self.read().clone();
        let mut delivered = 0;
        let mut disconnected = Vec::new();

        for (id, sink) in snapshot {
            match sink.as_ref() {
                Sink::Callback(callback) => {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
                    match outcome {
                        Ok(()) => delivered += 1,
                        Err(_) => log::error!("❌ {}回调 panic（订阅 {:?}），已忽略", label, id),
                    }
                }
                Sink::Channel(sender) => match sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(flume::TrySendError::Full(_)) => {
                        log::warn!("⚠️ {}通道已满（订阅 {:?}），丢弃本次事件", label, id);
                    }
                    Err(flume::TrySendError::Disconnected(_)) => disconnected.push(id),
                },
            }
        }

        if !disconnected.is_empty() {
            log::debug!("清理 {} 个已断开的{}通道订阅", disconnected.len(), label);
            self.write().retain(|(id, _)| !disconnected.contains(id));
        }

        delivered
    }
}

/// 完成事件分发器。
pub struct Dispatcher {
    ready: Registry<ImageReady>,
    failures: Registry<LoadFailure>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            ready: Registry::new(),
            failures: Registry::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// 注册完成回调。回调在 worker 线程上执行，应尽快返回。
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ImageReady) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.ready.add(id, Sink::Callback(Box::new(callback)));
        id
    }

    /// 注册完成事件通道。
    ///
    /// 通道无界，投递不会阻塞 worker；但订阅方若从不拉取，事件会一直堆积在内存里。
    /// 拉取节奏不可控时使用 [`Dispatcher::subscribe_channel_bounded`]。
    pub fn subscribe_channel(&self) -> Subscription<ImageReady> {
        let id = self.allocate_id();
        let (sender, receiver) = flume::unbounded();
        self.ready.add(id, Sink::Channel(sender));
        Subscription { id, receiver }
    }

    /// 注册有界完成事件通道：通道满时丢弃新事件并记录警告，worker 不会被阻塞。
    /// 容量为 0 时按 1 处理。
    pub fn subscribe_channel_bounded(&self, capacity: usize) -> Subscription<ImageReady> {
        let id = self.allocate_id();
        let (sender, receiver) = flume::bounded(capacity.max(1));
        self.ready.add(id, Sink::Channel(sender));
        Subscription { id, receiver }
    }

    /// 注册失败回调。
    pub fn on_error<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&LoadFailure) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.failures.add(id, Sink::Callback(Box::new(callback)));
        id
    }

    pub fn subscribe_failures(&self) -> Subscription<LoadFailure> {
        let id = self.allocate_id();
        let (sender, receiver) = flume::unbounded();
        self.failures.add(id, Sink::Channel(sender));
        Subscription { id, receiver }
    }

    /// 移除任一类订阅，不存在时返回 `false`。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.ready.remove(id) || self.failures.remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.ready.len() + self.failures.len()
    }

    /// 分发完成事件，返回成功投递的订阅者数量。
    pub fn publish(&self, event: ImageReady) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.ready.emit(&event, "完成事件")
    }

    pub fn report_failure(&self, failure: LoadFailure) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        self.failures.emit(&failure, "失败事件")
    }

    /// 关闭分发器：丢弃全部订阅，之后的事件一律不再投递。
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.clear();
        self.failures.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_loader::{DecodedImage, ImageError, TargetSize};
    use std::sync::atomic::AtomicUsize;

    fn ready(url: &str) -> ImageReady {
        ImageReady {
            url: url.to_string(),
            size: TargetSize::new(1, 1),
            image: Arc::new(DecodedImage::from_raw(1, 1, vec![0; 4]).expect("1x1 buffer")),
            from_cache: false,
        }
    }

    #[test]
    fn callback_and_channel_both_receive_event() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        dispatcher.subscribe(move |event| {
            if event.url == "https://cdn.example.com/a.jpg" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let subscription = dispatcher.subscribe_channel();

        let delivered = dispatcher.publish(ready("https://cdn.example.com/a.jpg"));

        assert_eq!(delivered, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let event = subscription.try_recv().expect("channel should hold the event");
        assert_eq!(event.url, "https://cdn.example.com/a.jpg");
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn unsubscribed_callback_stops_receiving() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = dispatcher.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.publish(ready("a"));
        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        dispatcher.publish(ready("b"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_channel_is_pruned() {
        let dispatcher = Dispatcher::new();
        let subscription = dispatcher.subscribe_channel();
        assert_eq!(dispatcher.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(dispatcher.publish(ready("a")), 0);
        assert_eq!(dispatcher.subscriber_count(), 0);
    }

    #[test]
    fn panicking_callback_does_not_block_other_subscribers() {
        let dispatcher = Dispatcher::new();
        dispatcher.subscribe(|_| panic!("subscriber bug"));
        let subscription = dispatcher.subscribe_channel();

        assert_eq!(dispatcher.publish(ready("a")), 1);
        assert!(subscription.try_recv().is_some());
    }

    #[test]
    fn subscribing_from_inside_callback_does_not_deadlock() {
        let dispatcher = Arc::new(Dispatcher::new());
        let inner = Arc::clone(&dispatcher);
        dispatcher.subscribe(move |_| {
            let id = inner.subscribe(|_| {});
            inner.unsubscribe(id);
        });

        assert_eq!(dispatcher.publish(ready("a")), 1);
        assert_eq!(dispatcher.subscriber_count(), 1);
    }

    #[test]
    fn failures_go_to_error_subscribers_only() {
        let dispatcher = Dispatcher::new();
        let successes = dispatcher.subscribe_channel();
        let failures = dispatcher.subscribe_failures();

        dispatcher.report_failure(LoadFailure {
            url: "a".into(),
            size: TargetSize::new(1, 1),
            error: ImageError::Fetch("HTTP 404: 未找到".into()),
        });

        assert!(successes.try_recv().is_none());
        let failure = failures.try_recv().expect("failure event");
        assert!(matches!(failure.error, ImageError::Fetch(_)));
    }

    #[test]
    fn bounded_channel_drops_events_when_full() {
        let dispatcher = Dispatcher::new();
        let bounded = dispatcher.subscribe_channel_bounded(2);
        let unbounded = dispatcher.subscribe_channel();

        for n in 0..5 {
            dispatcher.publish(ready(&format!("https://cdn.example.com/{n}.jpg")));
        }

        let kept: Vec<String> = bounded.drain().into_iter().map(|event| event.url).collect();
        assert_eq!(kept, vec!["https://cdn.example.com/0.jpg", "https://cdn.example.com/1.jpg"]);
        assert_eq!(unbounded.drain().len(), 5);
        // 满载不算断开，订阅仍然保留。
        assert_eq!(dispatcher.subscriber_count(), 2);

        assert_eq!(dispatcher.publish(ready("https://cdn.example.com/5.jpg")), 2);
    }

    #[test]
    fn closed_dispatcher_delivers_nothing() {
        let dispatcher = Dispatcher::new();
        let subscription = dispatcher.subscribe_channel();

        dispatcher.close();

        assert_eq!(dispatcher.publish(ready("a")), 0);
        assert!(dispatcher.is_closed());
        assert!(subscription.try_recv().is_none());
        assert!(subscription.receiver().is_disconnected());
    }
}
