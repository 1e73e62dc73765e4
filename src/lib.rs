//! # 番剧封面加载器：库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                UI 宿主（列表 / 网格视图）                  │
//! │                                                          │
//! │   enqueue(url, size)          subscribe / 通道拉取        │
//! └───────┼──────────────────────────────────▲───────────────┘
//!         ▼                                  │ ImageReady / LoadFailure
//! ┌───────┼──────────────────────────────────┼───────────────┐
//! │       ▼            image_loader          │               │
//! │                                          │               │
//! │  ImageLoader ── 有界请求队列 ── worker × N ── Dispatcher  │
//! │                                   │                      │
//! │                   ┌───────────────┼───────────────┐      │
//! │                   ▼               ▼               ▼      │
//! │              ImageCache      HttpFetcher      pipeline   │
//! │              (LRU 结果)      (退避重试)     (解码·缩放)   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 加载器级错误 `LoaderError`（配置、I/O、worker 启动） |
//! | [`image_loader`] | 请求队列、worker 池、下载、解码缩放、结果缓存、完成分发 |

pub mod error;
pub mod image_loader;

pub use error::LoaderError;
