//! RAT HTTP Core 服务器模块
//!
//! - [`manage`]：生命周期、接受循环、处理线程池与会话登记
//! - [`session`]：请求解析、一次性回复与连接 IO
//! - [`transport`]：TCP / TLS / 本地套接字三种传输

pub mod config;
pub mod manage;
pub mod registry;
pub mod session;
pub mod transport;
pub mod worker_pool;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

pub use config::ManageConfig;
#[cfg(unix)]
pub use manage::LocalServerManage;
pub use manage::{HttpAcceptedCallback, ManageState, ServerManage, SslServerManage, TcpServerManage};
pub use session::{ImageFormat, Session};
pub use transport::Transport;

/// 会话编号，单个管理器内递增唯一
pub type SessionId = u64;

/// 对端地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// TCP / TLS 连接的远端地址
    Tcp(SocketAddr),
    /// 本地套接字名称
    Local(String),
}

impl PeerAddr {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Tcp(addr) => Some(*addr),
            PeerAddr::Local(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{}", addr),
            PeerAddr::Local(name) => write!(f, "local:{}", name),
        }
    }
}

/// 获取互斥锁；持锁线程 panic 后继续使用内部数据
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
