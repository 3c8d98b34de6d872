//! 服务器管理器配置
//!
//! 可以直接构造、使用链式 setter，或者从 TOML 加载（时长字段以毫秒为单位）

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RatError, RatResult};
use crate::utils::logger::LogConfig;

/// 管理器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManageConfig {
    /// 处理线程池最大线程数
    pub handle_max_thread_count: usize,
    /// 处理线程池队列容量
    pub handle_queue_capacity: usize,
    /// 接受线程池（tokio 运行时）工作线程数
    pub accept_thread_count: usize,
    /// 会话超时（毫秒）：从连接建立到完成回复的最长时间
    pub session_timeout_ms: u64,
    /// 回复写出的最长等待（毫秒）
    pub write_timeout_ms: u64,
    /// TLS 握手超时（毫秒）
    pub handshake_timeout_ms: u64,
    /// 关闭时等待处理任务的宽限期（毫秒）
    pub shutdown_grace_ms: u64,
    /// 请求行 + 请求头的最大字节数
    pub max_header_bytes: usize,
    /// 请求体最大字节数
    pub max_body_bytes: usize,
    /// 单次读取缓冲区大小
    pub read_buffer_size: usize,
    /// 日志配置，为 None 时不初始化日志
    pub log: Option<LogConfig>,
}

impl Default for ManageConfig {
    fn default() -> Self {
        Self {
            handle_max_thread_count: 2,
            handle_queue_capacity: 1024,
            accept_thread_count: 1,
            session_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 5_000,
            max_header_bytes: 64 * 1024,
            max_body_bytes: 16 * 1024 * 1024,
            read_buffer_size: 8 * 1024,
            log: None,
        }
    }
}

impl ManageConfig {
    /// 以指定的处理线程数创建配置
    pub fn with_handle_threads(count: usize) -> Self {
        Self::default().handle_max_thread_count(count)
    }

    /// 从 TOML 字符串加载
    pub fn from_toml_str(content: &str) -> RatResult<Self> {
        let config: ManageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 TOML 文件加载
    pub fn from_file(path: impl AsRef<Path>) -> RatResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RatError::ConfigError(format!("读取配置文件 {} 失败: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 校验配置
    pub fn validate(&self) -> RatResult<()> {
        if self.handle_max_thread_count == 0 {
            return Err(RatError::ConfigError("handle_max_thread_count 必须大于 0".to_string()));
        }
        if self.handle_queue_capacity == 0 {
            return Err(RatError::ConfigError("handle_queue_capacity 必须大于 0".to_string()));
        }
        if self.accept_thread_count == 0 {
            return Err(RatError::ConfigError("accept_thread_count 必须大于 0".to_string()));
        }
        if self.session_timeout_ms == 0 || self.write_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(RatError::ConfigError("超时时间必须大于 0".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(RatError::ConfigError("read_buffer_size 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn handle_max_thread_count(mut self, count: usize) -> Self {
        self.handle_max_thread_count = count.max(1);
        self
    }

    pub fn handle_queue_capacity(mut self, capacity: usize) -> Self {
        self.handle_queue_capacity = capacity.max(1);
        self
    }

    pub fn accept_thread_count(mut self, count: usize) -> Self {
        self.accept_thread_count = count.max(1);
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = (timeout.as_millis() as u64).max(1);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn max_header_bytes(mut self, size: usize) -> Self {
        self.max_header_bytes = size;
        self
    }

    pub fn max_body_bytes(mut self, size: usize) -> Self {
        self.max_body_bytes = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// 自定义日志配置
    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log = Some(log_config);
        self
    }

    pub fn session_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn write_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
