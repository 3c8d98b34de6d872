//! TCP 传输

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::TcpListener;

use super::{BoxedStream, Transport};
use crate::error::{RatError, RatResult};
use crate::server::{PeerAddr, lock_unpoisoned};
use crate::utils::logger::info;

/// 共享的 TCP 监听器状态，TLS 传输复用它完成绑定和接受
#[derive(Debug, Default)]
pub(crate) struct TcpListenerSlot {
    endpoint: Mutex<Option<SocketAddr>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    bound: Mutex<Option<SocketAddr>>,
}

impl TcpListenerSlot {
    pub(crate) fn set_endpoint(&self, addr: SocketAddr) -> RatResult<()> {
        if self.is_bound() {
            return Err(RatError::AlreadyRunning);
        }
        *lock_unpoisoned(&self.endpoint) = Some(addr);
        Ok(())
    }

    pub(crate) fn is_bound(&self) -> bool {
        lock_unpoisoned(&self.listener).is_some()
    }

    pub(crate) async fn bind(&self) -> RatResult<SocketAddr> {
        let endpoint = (*lock_unpoisoned(&self.endpoint))
            .ok_or_else(|| RatError::InvalidArgument("未设置监听地址".to_string()))?;

        let listener = TcpListener::bind(endpoint)
            .await
            .map_err(|e| RatError::TransportError(format!("绑定 {} 失败: {}", endpoint, e)))?;
        let bound = listener.local_addr()?;

        *lock_unpoisoned(&self.listener) = Some(Arc::new(listener));
        *lock_unpoisoned(&self.bound) = Some(bound);
        Ok(bound)
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
        let listener = lock_unpoisoned(&self.listener)
            .clone()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "监听器未启动"))?;
        let (stream, remote_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok((stream, remote_addr))
    }

    pub(crate) fn release(&self) {
        lock_unpoisoned(&self.listener).take();
        lock_unpoisoned(&self.bound).take();
    }

    pub(crate) fn bound_addr(&self) -> Option<SocketAddr> {
        *lock_unpoisoned(&self.bound)
    }
}

/// 纯 TCP 传输
#[derive(Debug, Default)]
pub struct TcpTransport {
    slot: TcpListenerSlot,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址，监听开始后不可修改
    pub fn set_endpoint(&self, address: IpAddr, port: u16) -> RatResult<()> {
        self.slot.set_endpoint(SocketAddr::new(address, port))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "TCP"
    }

    fn is_running(&self) -> bool {
        self.slot.is_bound()
    }

    async fn on_start(&self) -> RatResult<()> {
        let bound = self.slot.bind().await?;
        info!("🌐 [TCP] 开始监听 http://{}", bound);
        Ok(())
    }

    async fn accept(&self) -> std::io::Result<(BoxedStream, PeerAddr)> {
        let (stream, remote_addr) = self.slot.accept().await?;
        Ok((Box::new(stream), PeerAddr::Tcp(remote_addr)))
    }

    fn on_finish(&self) {
        self.slot.release();
    }

    fn local_addr(&self) -> Option<PeerAddr> {
        self.slot.bound_addr().map(PeerAddr::Tcp)
    }
}
