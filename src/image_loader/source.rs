//! # 请求与中间模型
//!
//! ## 设计思路
//!
//! 将“外部请求”“缓存键”“解码结果”“对外事件”解耦：
//! - `LoadRequest` 表示调用方提交的一次加载
//! - `CacheKey` 表示一份解码结果的唯一标识（URL 与尺寸都参与比较）
//! - `DecodedImage` 表示统一为 RGBA8 的像素数据
//! - `ImageReady` / `LoadFailure` 表示分发给订阅者的事件

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;

use super::ImageError;

/// 目标显示尺寸（像素）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetSize {
    pub width: u32,
    pub height: u32,
}

impl TargetSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// 任一边为 0 时无法缩放，请求会被拒绝。
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for TargetSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for TargetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// 缓存键：同一 URL 的不同尺寸是不同的条目。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub url: String,
    pub size: TargetSize,
}

impl CacheKey {
    pub fn new(url: impl Into<String>, size: TargetSize) -> Self {
        Self {
            url: url.into(),
            size,
        }
    }
}

/// 已入队的加载请求，由 worker 消费后丢弃。
#[derive(Debug, Clone)]
pub(crate) struct LoadRequest {
    pub(crate) key: CacheKey,
    pub(crate) enqueued_at: Instant,
}

impl LoadRequest {
    pub(crate) fn new(key: CacheKey) -> Self {
        Self {
            key,
            enqueued_at: Instant::now(),
        }
    }
}

/// 解码阶段输出：RGBA8 像素数据。
///
/// 不变式：`pixels.len() == width * height * 4`。
#[derive(Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// 从 `image` 的 RGBA 缓冲构造，长度不变式由 `RgbaImage` 保证。
    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            pixels: image.into_raw(),
        }
    }

    /// 从裸字节构造，长度不匹配时返回 `None`。
    pub fn from_raw(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(4)?;
        (pixels.len() == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// RGBA 字节数组（行优先，`width * height * 4`）。
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// 读取单个像素，越界返回 `None`。
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 4;
        let px = self.pixels.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// 像素缓冲字节数。
    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// 加载完成事件。订阅者自行按 `url` 过滤。
#[derive(Debug, Clone)]
pub struct ImageReady {
    pub url: String,
    pub size: TargetSize,
    pub image: Arc<DecodedImage>,
    /// 是否直接由缓存回放（未发生网络请求）。
    pub from_cache: bool,
}

/// 加载失败事件，与正常完成事件分开分发。
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub url: String,
    pub size: TargetSize,
    pub error: ImageError,
}

/// `enqueue` 的即时结果，调用方永远不会被阻塞。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// 已进入请求队列。
    Queued,
    /// 相同 (url, size) 已在处理中，本次请求并入已有请求，不会产生额外事件。
    Coalesced,
    Rejected(RejectReason),
}

impl EnqueueOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Queued | Self::Coalesced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyUrl,
    InvalidSize,
    Stopped,
    QueueFull,
}
