//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `LoaderConfig`，保证运行时行为可观测、可调整、可测试。
//! 配置可由宿主程序直接构造，也可从 JSON 设置文件读取（缺省字段走默认值）。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的配置（4 个 worker、100 条缓存、10 秒超时、3 次重试）。
//! - `validate` 在加载器创建时执行范围校验，尽早拒绝不合理的参数。
//! - `FitMode` / `ResizeFilter` 用稳定的小写字符串序列化，便于写进设置文件。

use std::path::Path;
use std::time::Duration;

use fast_image_resize as fr;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::LoaderError;

/// 缩放后图像如何落到目标尺寸上。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// 等比缩放后居中放入目标尺寸的透明画布，输出恰好为目标尺寸（封面展示用）。
    Canvas,
    /// 只降采样不放大，输出为缩放后的实际尺寸（入缓存前的“优化”版本）。
    Scale,
    /// 直接拉伸到目标尺寸，不保持宽高比。
    Stretch,
}

/// 缩放滤镜。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Bilinear,
    CatmullRom,
    Lanczos3,
}

impl ResizeFilter {
    pub(crate) fn to_fast_filter(self) -> fr::FilterType {
        match self {
            Self::Nearest => fr::FilterType::Box,
            Self::Bilinear => fr::FilterType::Bilinear,
            Self::CatmullRom => fr::FilterType::CatmullRom,
            Self::Lanczos3 => fr::FilterType::Lanczos3,
        }
    }

    /// `fast_image_resize` 失败时回退到 `image` 自带缩放使用的滤镜。
    pub(crate) fn to_image_filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Bilinear => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// 图片加载器配置。
///
/// 字段覆盖了队列、工作线程、下载重试、解码限制与缩放五个方面。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// 并发 worker 数量。
    pub worker_count: usize,
    /// 请求队列容量，队列满时 `enqueue` 直接拒绝而不阻塞调用方。
    pub queue_capacity: usize,
    /// 结果缓存最大条目数（LRU 淘汰）。
    pub cache_capacity: usize,
    /// 单次请求超时（秒）。
    pub request_timeout_secs: u64,
    /// 建立连接超时（秒）。
    pub connect_timeout_secs: u64,
    /// 传输层失败的最大尝试次数。
    pub max_retries: u32,
    /// 首次退避延迟（毫秒），之后每次翻倍。
    pub retry_base_delay_ms: u64,
    /// 单次退避延迟上限（毫秒）。
    pub retry_max_delay_ms: u64,
    /// worker 空闲轮询队列的间隔（毫秒），决定关闭信号最迟多久被观察到。
    pub queue_poll_interval_ms: u64,
    /// 最大重定向次数。
    pub max_redirects: usize,
    /// 响应体最大字节数。
    pub max_file_size: u64,
    /// 解码前按图片头检查的像素上限（`width * height`）。
    pub max_decoded_pixels: u64,
    pub fit_mode: FitMode,
    pub resize_filter: ResizeFilter,
    pub user_agent: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 256,
            cache_capacity: 100,
            request_timeout_secs: 10,
            connect_timeout_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            queue_poll_interval_ms: 1_000,
            max_redirects: 5,
            max_file_size: 20 * 1024 * 1024,
            max_decoded_pixels: 40_000_000,
            fit_mode: FitMode::Canvas,
            resize_filter: ResizeFilter::Lanczos3,
            user_agent: concat!("anime-cover-loader/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl LoaderConfig {
    /// 从 JSON 文本解析配置，缺省字段使用默认值。
    ///
    /// # 示例
    /// ```rust
    /// use anime_cover_loader::image_loader::{FitMode, LoaderConfig};
    ///
    /// let config = LoaderConfig::from_json_str(r#"{ "worker_count": 2, "fit_mode": "scale" }"#)?;
    /// assert_eq!(config.worker_count, 2);
    /// assert_eq!(config.fit_mode, FitMode::Scale);
    /// assert_eq!(config.cache_capacity, 100);
    /// # Ok::<(), anime_cover_loader::LoaderError>(())
    /// ```
    pub fn from_json_str(text: &str) -> Result<Self, LoaderError> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| LoaderError::Config(format!("解析加载器配置失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 设置文件读取配置。
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// 校验参数范围。
    pub fn validate(&self) -> Result<(), LoaderError> {
        if !(1..=64).contains(&self.worker_count) {
            return Err(LoaderError::Config("worker_count 必须在 1~64 之间".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(LoaderError::Config("queue_capacity 不能为 0".to_string()));
        }
        if self.cache_capacity == 0 {
            return Err(LoaderError::Config("cache_capacity 不能为 0".to_string()));
        }
        if !(1..=120).contains(&self.request_timeout_secs) {
            return Err(LoaderError::Config("request_timeout_secs 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout_secs) {
            return Err(LoaderError::Config("connect_timeout_secs 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=10).contains(&self.max_retries) {
            return Err(LoaderError::Config("max_retries 必须在 1~10 之间".to_string()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(LoaderError::Config(
                "retry_base_delay_ms 不能大于 retry_max_delay_ms".to_string(),
            ));
        }
        if !(10..=5_000).contains(&self.queue_poll_interval_ms) {
            return Err(LoaderError::Config(
                "queue_poll_interval_ms 必须在 10~5000 毫秒之间".to_string(),
            ));
        }
        if self.max_file_size == 0 || self.max_decoded_pixels == 0 {
            return Err(LoaderError::Config("体积与像素上限不能为 0".to_string()));
        }
        Ok(())
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub(crate) fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LoaderConfig::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.cache_capacity, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.request_timeout_secs, 10);
        assert_eq!(config.retry_base_delay_ms, 1_000);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = LoaderConfig::from_json_str(
            r#"{ "cache_capacity": 8, "resize_filter": "catmull_rom" }"#,
        )
        .expect("partial config should parse");

        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.resize_filter, ResizeFilter::CatmullRom);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.fit_mode, FitMode::Canvas);
    }

    #[test]
    fn json_rejects_out_of_range_values() {
        let result = LoaderConfig::from_json_str(r#"{ "worker_count": 0 }"#);
        assert!(matches!(result, Err(LoaderError::Config(_))));

        let result = LoaderConfig::from_json_str(r#"{ "max_retries": 0 }"#);
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn json_rejects_malformed_text() {
        let result = LoaderConfig::from_json_str("{ worker_count: ");
        assert!(matches!(result, Err(LoaderError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_backoff_bounds() {
        let mut config = LoaderConfig::default();
        config.retry_base_delay_ms = 5_000;
        config.retry_max_delay_ms = 1_000;
        assert!(matches!(config.validate(), Err(LoaderError::Config(_))));
    }

    #[test]
    fn config_round_trips_through_settings_file() {
        let mut config = LoaderConfig::default();
        config.worker_count = 6;
        config.fit_mode = FitMode::Stretch;

        let path = std::env::temp_dir().join(format!(
            "anime-cover-loader-config-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, serde_json::to_string_pretty(&config).expect("serialize"))
            .expect("write settings file");

        let loaded = LoaderConfig::from_json_file(&path).expect("load settings file");
        let _ = std::fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_settings_file_is_io_error() {
        let result = LoaderConfig::from_json_file("/nonexistent/anime-cover-loader.json");
        assert!(matches!(result, Err(LoaderError::Io(_))));
    }
}
