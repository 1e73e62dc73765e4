//! # 下载模块
//!
//! ## 设计思路
//!
//! 把“取回字节”抽象为 `Fetch` trait，worker 只依赖该接口；
//! 生产环境使用基于 reqwest 阻塞客户端的 `HttpFetcher`，测试可注入内存实现。
//!
//! ## 实现思路
//!
//! - URL：仅允许 HTTP/HTTPS，解析失败直接按协议层错误返回。
//! - 传输层错误（连接失败、超时、读流中断）按指数退避重试：1s、2s、4s……
//! - 非 2xx 状态码立即失败，不重试。
//! - 响应体按 `max_file_size` 限流读取，超限返回 `ResourceLimit`。
//! - 退避等待按小片切分并检查取消标志，加载器关闭时能尽快退出。

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::{ImageError, LoaderConfig};

const BUFFER_INITIAL_CAPACITY: usize = 64 * 1024;
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// 取回图片原始字节的能力。
///
/// 实现必须是阻塞的；`is_cancelled` 返回 `true` 时应尽快以 `ImageError::Cancelled` 返回。
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str, is_cancelled: &dyn Fn() -> bool) -> Result<Bytes, ImageError>;
}

/// 指数退避重试策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）。
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LoaderConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的等待时间：`base * 2^(attempt-1)`，不超过上限。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }

    /// 重试耗尽前累计的退避时间。
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_attempts.max(1))
            .map(|attempt| self.delay_for(attempt))
            .sum()
    }

    /// 执行 `op`，仅对 `ImageError::Network` 重试。
    ///
    /// 每次传输失败后都会按退避时间等待，因此耗尽 3 次尝试总共等待约
    /// `base * (1 + 2 + 4)`，随后返回携带最后一次失败原因的 `Network` 错误。
    pub fn run<T, F>(&self, url: &str, is_cancelled: &dyn Fn() -> bool, mut op: F) -> Result<T, ImageError>
    where
        F: FnMut(u32) -> Result<T, ImageError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            if is_cancelled() {
                return Err(ImageError::Cancelled("下载已取消".to_string()));
            }

            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(ImageError::Network { message, .. }) => {
                    let delay = self.delay_for(attempt);
                    if attempt < max_attempts {
                        log::warn!(
                            "⚠️ 网络请求失败（第 {}/{} 次，可重试）：{}；{}ms 后重试 - URL: {}",
                            attempt,
                            max_attempts,
                            message,
                            delay.as_millis(),
                            redact_url_for_log(url)
                        );
                    } else {
                        log::warn!(
                            "⚠️ 网络请求失败（第 {}/{} 次）：{}；{}ms 后放弃 - URL: {}",
                            attempt,
                            max_attempts,
                            message,
                            delay.as_millis(),
                            redact_url_for_log(url)
                        );
                    }
                    last_message = message;

                    if !sleep_unless_cancelled(delay, is_cancelled) {
                        return Err(ImageError::Cancelled("退避等待期间下载被取消".to_string()));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(ImageError::Network {
            attempts: max_attempts,
            message: last_message,
        })
    }
}

/// 分片睡眠，期间被取消返回 `false`。
fn sleep_unless_cancelled(total: Duration, is_cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK_SLICE));
    }
}

/// 基于 reqwest 阻塞客户端的下载器。
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    retry: RetryPolicy,
    max_file_size: u64,
}

impl HttpFetcher {
    /// 根据配置构建复用型 HTTP 客户端。
    pub fn new(config: &LoaderConfig) -> Result<Self, ImageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ImageError::Fetch(format!("无法创建 HTTP 客户端：{}", e)))?;

        Ok(Self {
            client,
            retry: RetryPolicy::from_config(config),
            max_file_size: config.max_file_size,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn fetch_once(&self, url: &reqwest::Url) -> Result<Bytes, ImageError> {
        let response = self
            .client
            .get(url.clone())
            .header(
                reqwest::header::ACCEPT,
                "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
            )
            .send()
            .map_err(|e| Self::map_reqwest_error(e, url.as_str()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Fetch(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status_message(status.as_u16())
            )));
        }

        let declared_len = response.content_length();
        if let Some(len) = declared_len {
            if len > self.max_file_size {
                return Err(ImageError::ResourceLimit(format!(
                    "文件过大：{:.2} MB（限制：{:.2} MB）",
                    len as f64 / 1024.0 / 1024.0,
                    self.max_file_size as f64 / 1024.0 / 1024.0
                )));
            }
        }

        let initial_capacity = declared_len
            .map(|len| len.min(self.max_file_size) as usize)
            .filter(|len| *len > 0)
            .unwrap_or(BUFFER_INITIAL_CAPACITY);
        let mut buffer = Vec::with_capacity(initial_capacity);

        response
            .take(self.max_file_size.saturating_add(1))
            .read_to_end(&mut buffer)
            .map_err(|e| ImageError::transient(format!("读取响应体失败：{}", e)))?;

        if buffer.len() as u64 > self.max_file_size {
            return Err(ImageError::ResourceLimit("下载后文件超过大小限制".to_string()));
        }

        log::debug!("📡 下载完成 - {} bytes", buffer.len());
        Ok(Bytes::from(buffer))
    }

    /// 统一映射 reqwest 错误：构建/重定向类错误不可重试，其余视为传输层失败。
    fn map_reqwest_error(e: reqwest::Error, url: &str) -> ImageError {
        let message = sanitize_error_message(&e.to_string(), url);

        if e.is_builder() {
            ImageError::Fetch(format!("请求构建失败：{}", message))
        } else if e.is_redirect() {
            ImageError::Fetch(format!("重定向失败：{}", message))
        } else if e.is_timeout() {
            ImageError::transient(format!("请求超时：{}", message))
        } else if e.is_connect() {
            ImageError::transient(format!("无法连接：{}", message))
        } else {
            ImageError::transient(format!("请求失败：{}", message))
        }
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, is_cancelled: &dyn Fn() -> bool) -> Result<Bytes, ImageError> {
        log::info!("🌐 开始下载图片 - URL: {}", redact_url_for_log(url));
        let parsed = validate_url(url)?;
        self.retry.run(url, is_cancelled, |_| self.fetch_once(&parsed))
    }
}

/// 仅允许 HTTP/HTTPS。
fn validate_url(url: &str) -> Result<reqwest::Url, ImageError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ImageError::Fetch(format!("URL 格式错误：{}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ImageError::Fetch("仅支持 HTTP/HTTPS".to_string()));
    }

    Ok(parsed)
}

/// 日志中去掉 query 与 fragment，避免泄露签名参数。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();

    format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
}

fn sanitize_error_message(error_msg: &str, url: &str) -> String {
    error_msg.replace(url, &redact_url_for_log(url))
}

fn status_message(code: u16) -> &'static str {
    match code {
        404 => "未找到",
        403 => "访问被拒绝",
        429 => "请求过于频繁",
        500..=599 => "服务器错误",
        _ => "请求失败",
    }
}
