//! 连接 IO 任务
//!
//! 负责一个连接的完整生命周期：读取并解析请求、在超时前等待应用回复、
//! 写出回复并关闭流。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::Session;
use super::parser::{ParseStatus, RequestParser};
use crate::error::RatError;
use crate::server::config::ManageConfig;
use crate::server::{PeerAddr, SessionId};
use crate::utils::logger::{debug, warn};

/// 连接结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// 回复已完整写出
    Replied,
    /// 请求格式错误，静默关闭
    ParseFailed,
    /// 超时前没有收到完整请求
    IdleTimeout,
    /// 对端在请求完成前关闭
    PeerClosed,
    ReadFailed,
    /// 应用释放了会话但没有回复
    NoReply,
    /// 应用在超时前没有回复
    ReplyTimeout,
    /// 写出回复时失败，不重试
    WriteFailed,
    /// 对端迟迟不读取，写出超时
    WriteTimeout,
}

/// 运行单个连接
///
/// `on_complete` 在请求完整解析后恰好调用一次；解析失败或超时时不会调用。
pub async fn run_connection<S, F>(
    mut stream: S,
    id: SessionId,
    peer: PeerAddr,
    config: Arc<ManageConfig>,
    on_complete: F,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(Arc<Session>),
{
    let deadline = Instant::now() + config.session_timeout_duration();
    let mut parser = RequestParser::new(config.max_header_bytes, config.max_body_bytes);
    let mut read_buf = vec![0u8; config.read_buffer_size];

    let request = loop {
        let read = match tokio::time::timeout_at(deadline, stream.read(&mut read_buf)).await {
            Err(_) => {
                debug!("⏰ [会话 {}] 超时前未收到完整请求，关闭连接: {}", id, peer);
                return SessionOutcome::IdleTimeout;
            }
            Ok(Err(e)) => {
                debug!("🔌 [会话 {}] 读取失败: {} ({})", id, peer, e);
                return SessionOutcome::ReadFailed;
            }
            Ok(Ok(0)) => {
                debug!("🔌 [会话 {}] 对端在请求完成前关闭: {}", id, peer);
                return SessionOutcome::PeerClosed;
            }
            Ok(Ok(n)) => n,
        };

        match parser.feed(&read_buf[..read]) {
            Ok(ParseStatus::Partial) => continue,
            Ok(ParseStatus::Complete(request)) => break request,
            Err(e) => {
                debug!("🚫 [会话 {}] 请求解析失败，静默关闭: {} ({})", id, peer, e);
                return SessionOutcome::ParseFailed;
            }
        }
    };
    drop(read_buf);

    debug!("📥 [会话 {}] {} {} {}", id, request.method, request.url, request.crlf);

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
    on_complete(Arc::new(Session::new(id, peer.clone(), request, reply_tx)));

    let frame = match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
        Err(_) => {
            warn!("⏰ [会话 {}] 应用在超时前没有回复，关闭连接: {}", id, peer);
            return SessionOutcome::ReplyTimeout;
        }
        Ok(None) => {
            debug!("🔌 [会话 {}] 会话被释放但没有回复: {}", id, peer);
            return SessionOutcome::NoReply;
        }
        Ok(Some(frame)) => frame,
    };

    write_reply(&mut stream, id, &frame, config.write_timeout_duration()).await
}

/// 写出回复并关闭写端
///
/// 所有字节写出并 flush 后关闭；超过 `write_timeout` 仍未写完则放弃，
/// 以回收那些从不读取数据的对端所占用的资源。
async fn write_reply<S>(stream: &mut S, id: SessionId, frame: &Bytes, write_timeout: Duration) -> SessionOutcome
where
    S: AsyncWrite + Unpin,
{
    let mut written = 0usize;
    let result = tokio::time::timeout(write_timeout, async {
        while written < frame.len() {
            let n = stream.write(&frame[written..]).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero));
            }
            written += n;
        }
        stream.flush().await
    })
    .await;

    let wait_written_byte_count = frame.len() - written;
    let outcome = match result {
        Ok(Ok(())) => SessionOutcome::Replied,
        Ok(Err(e)) => {
            let err = RatError::WriteError(format!("剩余 {} 字节: {}", wait_written_byte_count, e));
            debug!("❌ [会话 {}] {}", id, err);
            return SessionOutcome::WriteFailed;
        }
        Err(_) => {
            warn!("⏰ [会话 {}] 写出回复超时，剩余 {} 字节未被对端接收", id, wait_written_byte_count);
            return SessionOutcome::WriteTimeout;
        }
    };

    // TLS 会在这里发送 close_notify，同样需要有上限
    let _ = tokio::time::timeout(write_timeout, stream.shutdown()).await;
    debug!("📤 [会话 {}] 回复已写出 {} 字节", id, frame.len());
    outcome
}
