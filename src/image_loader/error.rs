//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 使用单一错误枚举承载加载链路中的所有失败来源，避免字符串拼接式错误处理。
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配。
//!
//! 只有 `Network` 属于可重试错误；其余分支一经出现立即终止本次加载。

/// 加载失败的分类，随失败事件一起交给订阅者。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Fetch,
    Decode,
    ResourceLimit,
    Cancelled,
}

/// 图片加载统一错误类型。
///
/// 在 worker 边界被捕获并转换为 `LoadFailure` 事件，不会中断工作线程。
#[derive(Debug, Clone, thiserror::Error)]
pub enum ImageError {
    /// 传输层失败（连接、超时、读流中断），重试耗尽后携带最后一次失败原因。
    #[error("网络错误（已尝试 {attempts} 次）：{message}")]
    Network { attempts: u32, message: String },

    /// 协议层失败（非 2xx、URL 非法、重定向超限），不重试。
    #[error("请求失败：{0}")]
    Fetch(String),

    #[error("解码错误：{0}")]
    Decode(String),

    #[error("资源限制：{0}")]
    ResourceLimit(String),

    /// 加载器关闭时中断的请求，不会通知订阅者。
    #[error("已取消：{0}")]
    Cancelled(String),
}

impl ImageError {
    /// 单次传输失败（重试循环内部使用）。
    pub(crate) fn transient(message: impl Into<String>) -> Self {
        Self::Network {
            attempts: 1,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Decode(_) => ErrorKind::Decode,
            Self::ResourceLimit(_) => ErrorKind::ResourceLimit,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_errors_are_retryable() {
        assert!(ImageError::transient("reset").is_retryable());
        assert!(!ImageError::Fetch("HTTP 404".into()).is_retryable());
        assert!(!ImageError::Decode("bad".into()).is_retryable());
        assert!(!ImageError::ResourceLimit("big".into()).is_retryable());
    }

    #[test]
    fn kind_matches_variant() {
        let err = ImageError::Network {
            attempts: 3,
            message: "connection refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(ImageError::Decode("x".into()).kind(), ErrorKind::Decode);
        assert!(err.to_string().contains("3"));
    }
}
