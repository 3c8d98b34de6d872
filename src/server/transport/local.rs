//! 本地套接字传输（Unix 域套接字）
//!
//! 名称中含 `/` 时视为路径，否则放在系统临时目录下。

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UnixListener;

use super::{BoxedStream, Transport};
use crate::error::{RatError, RatResult};
use crate::server::{PeerAddr, lock_unpoisoned};
use crate::utils::logger::{info, warn};

#[derive(Debug, Default)]
pub struct LocalTransport {
    name: Mutex<Option<String>>,
    listener: Mutex<Option<Arc<UnixListener>>>,
    socket_path: Mutex<Option<PathBuf>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_name(&self, name: &str) -> RatResult<()> {
        if name.is_empty() {
            return Err(RatError::InvalidArgument("本地套接字名称不能为空".to_string()));
        }
        if lock_unpoisoned(&self.listener).is_some() {
            return Err(RatError::AlreadyRunning);
        }
        *lock_unpoisoned(&self.name) = Some(name.to_string());
        Ok(())
    }

    /// 名称对应的套接字路径
    pub fn socket_path_for(name: &str) -> PathBuf {
        if name.contains('/') {
            PathBuf::from(name)
        } else {
            std::env::temp_dir().join(name)
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &'static str {
        "Local"
    }

    fn is_running(&self) -> bool {
        lock_unpoisoned(&self.listener).is_some()
    }

    async fn on_start(&self) -> RatResult<()> {
        let name = lock_unpoisoned(&self.name)
            .clone()
            .ok_or_else(|| RatError::InvalidArgument("未设置本地套接字名称".to_string()))?;
        let path = Self::socket_path_for(&name);

        // 清理上次异常退出留下的套接字文件
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("⚠️ [Local] 清理旧套接字 {} 失败: {}", path.display(), e);
            }
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| RatError::TransportError(format!("绑定本地套接字 {} 失败: {}", path.display(), e)))?;
        info!("🔌 [Local] 开始监听 {}", path.display());

        *lock_unpoisoned(&self.listener) = Some(Arc::new(listener));
        *lock_unpoisoned(&self.socket_path) = Some(path);
        Ok(())
    }

    async fn accept(&self) -> std::io::Result<(BoxedStream, PeerAddr)> {
        let listener = lock_unpoisoned(&self.listener)
            .clone()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "监听器未启动"))?;
        let (stream, _) = listener.accept().await?;
        let name = lock_unpoisoned(&self.name).clone().unwrap_or_default();
        Ok((Box::new(stream), PeerAddr::Local(name)))
    }

    fn on_finish(&self) {
        lock_unpoisoned(&self.listener).take();
        if let Some(path) = lock_unpoisoned(&self.socket_path).take() {
            let _ = std::fs::remove_file(path);
        }
    }

    fn local_addr(&self) -> Option<PeerAddr> {
        if !self.is_running() {
            return None;
        }
        lock_unpoisoned(&self.name).clone().map(PeerAddr::Local)
    }
}
