//! 统一错误类型模块
//!
//! # 设计思路
//!
//! `LoaderError` 覆盖加载器生命周期内的“硬”错误：配置非法、worker 无法启动、
//! 配置文件读取失败。单个请求的下载/解码失败不走这里，而是以 `LoadFailure`
//! 事件的形式分发给错误订阅者。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息。
//! - 为 `ImageError` 与 `std::io::Error` 提供 `From` 转换，可直接使用 `?`。
//! - 实现 `Serialize` 将错误序列化为字符串，宿主可以原样转发给前端。

use serde::Serialize;

use crate::image_loader::ImageError;

/// 加载器级错误类型
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// 配置值非法或配置文本无法解析
    #[error("配置无效: {0}")]
    Config(String),

    /// 图片流水线错误（例如 HTTP 客户端无法创建）
    #[error("{0}")]
    Image(#[from] ImageError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// worker 线程启动失败
    #[error("worker 启动失败: {0}")]
    Spawn(String),
}

/// 将错误序列化为人类可读的字符串。
impl Serialize for LoaderError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_display_string() {
        let error = LoaderError::Config("worker_count 必须大于 0".to_string());
        let json = serde_json::to_string(&error).expect("serialize");
        assert_eq!(json, "\"配置无效: worker_count 必须大于 0\"");
    }

    #[test]
    fn image_error_converts_transparently() {
        let error: LoaderError = ImageError::Fetch("HTTP 404: 未找到".to_string()).into();
        assert!(matches!(error, LoaderError::Image(ImageError::Fetch(_))));
        assert_eq!(error.to_string(), ImageError::Fetch("HTTP 404: 未找到".to_string()).to_string());
    }
}
