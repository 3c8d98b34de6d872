//! 会话模块
//!
//! 一个会话对应一个连接上的一次请求与一次回复：
//! - [`parser`]：增量解析请求
//! - [`connection`]：连接 IO 任务（读、超时、写回、关闭）
//! - [`reply`]：回复报文构建
//!
//! 解析阶段的可变状态只属于连接 IO 任务；请求完成后解析结果被封装成
//! [`Session`] 交给处理线程池，回复报文再通过通道交还给 IO 任务写出。
//! 两边不共享可变状态，因此会话本身不需要锁。

pub mod connection;
pub mod parser;
pub mod reply;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::{RatError, RatResult};
use crate::server::{PeerAddr, SessionId};
use crate::utils::logger::debug;
use parser::{ParsedRequest, find_header};
use reply::{CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, CONTENT_TYPE_TEXT, build_response};

pub use reply::ImageFormat;

/// 已完成解析的请求及其一次性回复接口
pub struct Session {
    id: SessionId,
    peer: PeerAddr,
    request: ParsedRequest,
    already_replied: AtomicBool,
    reply_tx: UnboundedSender<Bytes>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("method", &self.request.method)
            .field("url", &self.request.url)
            .field("already_replied", &self.already_replied())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(id: SessionId, peer: PeerAddr, request: ParsedRequest, reply_tx: UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            peer,
            request,
            already_replied: AtomicBool::new(false),
            reply_tx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 请求方法，例如 `GET`
    pub fn request_method_token(&self) -> &str {
        &self.request.method
    }

    /// 原始请求 URL
    pub fn request_url(&self) -> &str {
        &self.request.url
    }

    /// 协议标记，例如 `HTTP/1.1`
    pub fn request_crlf(&self) -> &str {
        &self.request.crlf
    }

    pub fn headers_data(&self) -> &HashMap<String, String> {
        &self.request.headers
    }

    /// 原始请求体
    pub fn request_raw_data(&self) -> &Bytes {
        &self.request.body
    }

    /// 对端地址
    pub fn request_source(&self) -> &PeerAddr {
        &self.peer
    }

    /// 大小写无关地读取请求头
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.request.headers, name)
    }

    pub fn content_length(&self) -> usize {
        self.request.body.len()
    }

    /// URL 路径部分（不含查询串），同时兼容绝对形式的请求目标
    pub fn request_url_path(&self) -> String {
        match self.absolute_url() {
            Some(url) => url.path().to_string(),
            None => self
                .request
                .url
                .split_once('?')
                .map(|(path, _)| path)
                .unwrap_or(&self.request.url)
                .to_string(),
        }
    }

    /// 解码后的查询参数；重复的键保留最后一个值
    pub fn request_url_query(&self) -> HashMap<String, String> {
        let query = match self.absolute_url() {
            Some(url) => url.query().map(str::to_string),
            None => self.request.url.split_once('?').map(|(_, query)| query.to_string()),
        };

        query
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn absolute_url(&self) -> Option<url::Url> {
        let url = &self.request.url;
        if url.starts_with("http://") || url.starts_with("https://") {
            url::Url::parse(url).ok()
        } else {
            None
        }
    }

    /// 是否已经回复过
    pub fn already_replied(&self) -> bool {
        self.already_replied.load(Ordering::Acquire)
    }

    pub fn reply_text(&self, text: &str) -> bool {
        self.reply_text_with_status(text, 200)
    }

    pub fn reply_text_with_status(&self, text: &str, status: u16) -> bool {
        self.reply_bytes(text.as_bytes(), CONTENT_TYPE_TEXT, status)
    }

    pub fn reply_json_object(&self, object: &Map<String, Value>) -> RatResult<bool> {
        self.reply_json_object_with_status(object, 200)
    }

    pub fn reply_json_object_with_status(&self, object: &Map<String, Value>, status: u16) -> RatResult<bool> {
        self.reply_json_with_status(object, status)
    }

    pub fn reply_json_array(&self, array: &[Value]) -> RatResult<bool> {
        self.reply_json_with_status(array, 200)
    }

    /// 回复任意可序列化的值
    pub fn reply_json<T: Serialize + ?Sized>(&self, value: &T) -> RatResult<bool> {
        self.reply_json_with_status(value, 200)
    }

    fn reply_json_with_status<T: Serialize + ?Sized>(&self, value: &T, status: u16) -> RatResult<bool> {
        if self.already_replied() {
            return Ok(false);
        }
        let body = serde_json::to_vec(value)?;
        Ok(self.reply_bytes(&body, CONTENT_TYPE_JSON, status))
    }

    /// 回复文件内容
    ///
    /// 文件读取失败时返回错误，会话保持未回复状态，调用方仍可改用其他回复。
    pub fn reply_file(&self, path: impl AsRef<Path>) -> RatResult<bool> {
        if self.already_replied() {
            return Ok(false);
        }
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|e| {
            debug!("📁 [会话 {}] 读取文件 {} 失败: {}", self.id, path.display(), e);
            RatError::IoError(e)
        })?;
        Ok(self.reply_bytes(&content, CONTENT_TYPE_OCTET_STREAM, 200))
    }

    /// 回复已编码的图片
    pub fn reply_image(&self, encoded: &[u8], format: ImageFormat) -> bool {
        self.reply_bytes(encoded, format.content_type(), 200)
    }

    /// 302 重定向
    pub fn reply_redirects(&self, location: &str) -> bool {
        self.reply_frame(|| build_response(302, None, &[("Location", location.to_string())], b""))
    }

    /// 回复 CORS 预检请求
    pub fn reply_options(&self) -> bool {
        self.reply_frame(|| {
            build_response(
                204,
                None,
                &[
                    ("Allow", "OPTIONS, GET, POST, PUT, HEAD, DELETE".to_string()),
                    ("Access-Control-Allow-Methods", "OPTIONS, GET, POST, PUT, HEAD, DELETE".to_string()),
                    ("Access-Control-Allow-Headers", "*".to_string()),
                ],
                b"",
            )
        })
    }

    /// 以指定的内容类型和状态码回复原始字节
    pub fn reply_bytes(&self, body: &[u8], content_type: &str, status: u16) -> bool {
        self.reply_frame(|| build_response(status, Some(content_type), &[], body))
    }

    /// 一次性回复的唯一入口：第一次调用生效，之后全部忽略
    fn reply_frame(&self, build: impl FnOnce() -> Bytes) -> bool {
        if self.already_replied.swap(true, Ordering::AcqRel) {
            debug!("🔁 [会话 {}] 已经回复过，忽略重复回复", self.id);
            return false;
        }

        let frame = build();
        if self.reply_tx.send(frame).is_err() {
            // 连接已被关闭（超时或服务器关闭），回复无处可写
            debug!("🔌 [会话 {}] 连接已关闭，回复被丢弃", self.id);
        }
        true
    }
}
