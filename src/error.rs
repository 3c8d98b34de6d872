//! 错误类型定义
//!
//! 所有公开操作统一返回 [`RatResult`]

use thiserror::Error;

/// RAT HTTP Core 错误类型
#[derive(Debug, Error)]
pub enum RatError {
    /// 请求行或请求头格式错误，连接会被静默关闭
    #[error("解析错误: {0}")]
    ParseError(String),

    /// 绑定 / 监听失败
    #[error("传输层错误: {0}")]
    TransportError(String),

    /// 证书、私钥或 TLS 握手相关错误
    #[error("TLS错误: {0}")]
    TlsError(String),

    /// 回复写出过程中对端断开
    #[error("写入错误: {0}")]
    WriteError(String),

    /// 关闭时处理任务超过宽限期
    #[error("关闭超时: {0}")]
    ShutdownTimeout(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 服务器已在运行
    #[error("服务器已在运行")]
    AlreadyRunning,

    /// 服务器已关闭，实例不可再次启动
    #[error("服务器已关闭")]
    Closed,

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// 统一结果类型
pub type RatResult<T> = Result<T, RatError>;

impl From<toml::de::Error> for RatError {
    fn from(e: toml::de::Error) -> Self {
        RatError::ConfigError(e.to_string())
    }
}

impl From<rustls::Error> for RatError {
    fn from(e: rustls::Error) -> Self {
        RatError::TlsError(e.to_string())
    }
}
