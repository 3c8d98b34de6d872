//! TLS 传输
//!
//! 复用 TCP 监听器，在会话建立之前用 tokio-rustls 完成握手。
//! 握手失败的连接直接丢弃，不会产生会话。

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_rustls::TlsAcceptor;

use super::tcp::TcpListenerSlot;
use super::tls_config::TlsMaterial;
use super::{BoxedStream, Transport};
use crate::error::{RatError, RatResult};
use crate::server::{PeerAddr, lock_unpoisoned};
use crate::utils::logger::{debug, info};

#[derive(Default)]
pub struct TlsTransport {
    slot: TcpListenerSlot,
    material: Mutex<Option<TlsMaterial>>,
    acceptor: Mutex<Option<TlsAcceptor>>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("slot", &self.slot)
            .field("material", &*lock_unpoisoned(&self.material))
            .finish()
    }
}

impl TlsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_endpoint(&self, address: IpAddr, port: u16) -> RatResult<()> {
        self.slot.set_endpoint(SocketAddr::new(address, port))
    }

    /// 设置证书材料，证书在开始监听时才会真正加载
    pub fn set_tls_material(&self, material: TlsMaterial) -> RatResult<()> {
        if self.slot.is_bound() {
            return Err(RatError::AlreadyRunning);
        }
        material.validate()?;
        *lock_unpoisoned(&self.material) = Some(material);
        Ok(())
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &'static str {
        "TLS"
    }

    fn is_running(&self) -> bool {
        self.slot.is_bound()
    }

    async fn on_start(&self) -> RatResult<()> {
        let material = lock_unpoisoned(&self.material)
            .clone()
            .ok_or_else(|| RatError::InvalidArgument("未设置 TLS 证书".to_string()))?;

        // 证书加载失败时不绑定端口
        let server_config = material.build_server_config()?;
        *lock_unpoisoned(&self.acceptor) = Some(TlsAcceptor::from(server_config));

        match self.slot.bind().await {
            Ok(bound) => {
                info!("🔐 [TLS] 开始监听 https://{}", bound);
                Ok(())
            }
            Err(e) => {
                lock_unpoisoned(&self.acceptor).take();
                Err(e)
            }
        }
    }

    async fn accept(&self) -> std::io::Result<(BoxedStream, PeerAddr)> {
        let (stream, remote_addr) = self.slot.accept().await?;
        Ok((Box::new(stream), PeerAddr::Tcp(remote_addr)))
    }

    async fn handshake(&self, stream: BoxedStream, peer: &PeerAddr) -> RatResult<BoxedStream> {
        let acceptor = lock_unpoisoned(&self.acceptor)
            .clone()
            .ok_or_else(|| RatError::TlsError("TLS 未初始化".to_string()))?;

        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                debug!("🔐 [TLS] 与 {} 握手成功", peer);
                Ok(Box::new(tls_stream))
            }
            Err(e) => Err(RatError::TlsError(format!("与 {} 握手失败: {}", peer, e))),
        }
    }

    fn on_finish(&self) {
        self.slot.release();
        lock_unpoisoned(&self.acceptor).take();
    }

    fn local_addr(&self) -> Option<PeerAddr> {
        self.slot.bound_addr().map(PeerAddr::Tcp)
    }
}
