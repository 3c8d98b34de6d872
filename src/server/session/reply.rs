//! HTTP 回复报文构建

use std::fmt::Write as _;
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

pub const CONTENT_TYPE_TEXT: &str = "text/plain;charset=UTF-8";
pub const CONTENT_TYPE_JSON: &str = "application/json;charset=UTF-8";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// 已编码图片的格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }
}

/// 常见状态码的原因短语
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// 构建完整的回复报文
///
/// 始终带上 `Content-Length` 和 `Connection: close`，每个连接只回复一次。
pub fn build_response(status: u16, content_type: Option<&str>, extra_headers: &[(&str, String)], body: &[u8]) -> Bytes {
    let mut head = String::with_capacity(256);
    // 写入 String 不会失败
    let _ = write!(head, "HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
    if let Some(content_type) = content_type {
        let _ = write!(head, "Content-Type: {}\r\n", content_type);
    }
    let _ = write!(head, "Content-Length: {}\r\n", body.len());
    let _ = write!(head, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    for (name, value) in extra_headers {
        let _ = write!(head, "{}: {}\r\n", name, value);
    }
    head.push_str("Connection: close\r\n\r\n");

    let mut frame = BytesMut::with_capacity(head.len() + body.len());
    frame.put_slice(head.as_bytes());
    frame.put_slice(body);
    frame.freeze()
}
