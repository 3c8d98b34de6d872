//! 传输层策略
//!
//! 管理器只依赖 [`Transport`] trait；TCP、TLS、本地套接字各自实现绑定、
//! 接受和释放的细节，其余逻辑全部复用 [`ServerManage`](crate::server::ServerManage)。

pub mod tcp;
pub mod tls;
pub mod tls_config;
#[cfg(unix)]
pub mod local;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RatResult;
use crate::server::PeerAddr;

pub use tcp::TcpTransport;
pub use tls::TlsTransport;
#[cfg(unix)]
pub use local::LocalTransport;

/// 会话可用的双向字节流
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> SessionStream for S where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn SessionStream>;

/// 传输层策略
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// 传输名称，用于日志
    fn name(&self) -> &'static str;

    /// 端点当前是否已绑定
    fn is_running(&self) -> bool;

    /// 绑定并开始监听
    async fn on_start(&self) -> RatResult<()>;

    /// 接受一个原始连接
    async fn accept(&self) -> std::io::Result<(BoxedStream, PeerAddr)>;

    /// 在建立会话之前完成传输层握手，默认直接返回原始流
    async fn handshake(&self, stream: BoxedStream, _peer: &PeerAddr) -> RatResult<BoxedStream> {
        Ok(stream)
    }

    /// 解除绑定，释放监听资源
    fn on_finish(&self);

    /// 实际绑定的地址
    fn local_addr(&self) -> Option<PeerAddr>;
}
