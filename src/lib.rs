//! # RAT HTTP Core
//!
//! 可嵌入的轻量 HTTP/1.x 服务器核心。
//!
//! - 增量解析请求，数据任意分片到达结果都相同
//! - 每个会话只能回复一次：文本、JSON、文件、图片、重定向、OPTIONS
//! - 接受连接与处理请求使用两个相互独立的线程池
//! - 传输层可选 TCP、TLS（rustls + ring）和本地套接字
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use rat_http_core::TcpServerManage;
//!
//! let manage = TcpServerManage::new(2);
//! manage.set_http_accepted_callback(|session| {
//!     session.reply_text(&format!("url: {}", session.request_url()));
//! });
//! manage.listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080).unwrap();
//! ```

pub mod error;
pub mod server;
pub mod utils;

pub use error::{RatError, RatResult};
#[cfg(unix)]
pub use server::LocalServerManage;
pub use server::{
    HttpAcceptedCallback, ImageFormat, ManageConfig, ManageState, PeerAddr, ServerManage, Session, SessionId,
    SslServerManage, TcpServerManage, Transport,
};
pub use utils::logger::{LogConfig, LogLevel, Logger};
