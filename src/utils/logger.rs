//! 日志模块
//!
//! 对 rat_logger 的薄封装：统一导出日志宏，并提供一次性初始化入口

use std::sync::atomic::{AtomicBool, Ordering};

use rat_logger::handler::term::TermConfig;
use rat_logger::{LevelFilter, LoggerBuilder};
use serde::Deserialize;

pub use rat_logger::{debug, error, info, warn};

static LOGGER_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 是否启用日志
    pub enabled: bool,
    /// 日志级别
    pub level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
        }
    }
}

/// 日志初始化器
pub struct Logger;

impl Logger {
    /// 初始化终端日志输出
    ///
    /// 重复调用直接返回 `Ok(())`，方便多个服务器实例共用一个进程
    pub fn init(config: LogConfig) -> Result<(), String> {
        if !config.enabled {
            return Ok(());
        }
        if LOGGER_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = LoggerBuilder::new()
            .with_level(config.level.to_filter())
            .add_terminal_with_config(TermConfig::default())
            .init_global_logger();

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already initialized") => Ok(()),
            Err(e) => {
                LOGGER_INITIALIZED.store(false, Ordering::SeqCst);
                Err(format!("日志系统初始化失败: {}", e))
            }
        }
    }

    pub fn is_initialized() -> bool {
        LOGGER_INITIALIZED.load(Ordering::SeqCst)
    }
}
