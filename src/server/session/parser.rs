//! HTTP/1.x 增量请求解析器
//!
//! 不做任何 IO，只消费字节。解析分三个阶段依次推进：
//! 请求行 → 请求头 → 可选的定长请求体（由 `Content-Length` 决定）。
//! 每个阶段只扫描尚未扫描过的字节，整体开销与收到的字节数成线性关系，
//! 与数据被拆成多少块到达无关。

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::error::{RatError, RatResult};

/// 解析完成的请求
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub url: String,
    /// 协议标记，例如 `HTTP/1.1`
    pub crlf: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// 单次 feed 的结果
#[derive(Debug)]
pub enum ParseStatus {
    /// 数据不足，需要继续读取
    Partial,
    /// 请求完整
    Complete(ParsedRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    RequestLine,
    Headers,
    Body,
    Done,
    Failed,
}

/// 增量解析器
#[derive(Debug)]
pub struct RequestParser {
    buffer: BytesMut,
    /// buffer 中已确认不含换行符的前缀长度
    scan_pos: usize,
    /// 请求行 + 请求头已消费的字节数
    header_bytes: usize,
    stage: Stage,
    request: ParsedRequest,
    body_len: usize,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl RequestParser {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            scan_pos: 0,
            header_bytes: 0,
            stage: Stage::RequestLine,
            request: ParsedRequest::default(),
            body_len: 0,
            max_header_bytes,
            max_body_bytes,
        }
    }

    /// 请求头是否已解析完成
    pub fn header_parsed(&self) -> bool {
        matches!(self.stage, Stage::Body | Stage::Done)
    }

    /// 追加字节并尽可能推进解析
    ///
    /// 返回 `Err` 后解析器进入失败状态，之后的 feed 都会返回错误。
    pub fn feed(&mut self, data: &[u8]) -> RatResult<ParseStatus> {
        match self.stage {
            Stage::Failed => return Err(RatError::ParseError("解析器已处于失败状态".to_string())),
            Stage::Done => return Err(RatError::ParseError("请求已解析完成，不支持同一连接上的后续请求".to_string())),
            _ => {}
        }

        self.buffer.extend_from_slice(data);
        match self.advance() {
            Ok(status) => Ok(status),
            Err(e) => {
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }

    fn advance(&mut self) -> RatResult<ParseStatus> {
        loop {
            match self.stage {
                Stage::RequestLine => {
                    let Some(line) = self.next_line()? else {
                        return Ok(ParseStatus::Partial);
                    };
                    // 请求行之前的空行直接忽略
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_request_line(&line)?;
                    self.stage = Stage::Headers;
                }
                Stage::Headers => {
                    let Some(line) = self.next_line()? else {
                        return Ok(ParseStatus::Partial);
                    };
                    if line.is_empty() {
                        self.body_len = self.declared_body_len()?;
                        self.stage = Stage::Body;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                Stage::Body => {
                    if self.buffer.len() < self.body_len {
                        return Ok(ParseStatus::Partial);
                    }
                    self.request.body = self.buffer.split_to(self.body_len).freeze();
                    self.stage = Stage::Done;
                    return Ok(ParseStatus::Complete(std::mem::take(&mut self.request)));
                }
                Stage::Done | Stage::Failed => return Ok(ParseStatus::Partial),
            }
        }
    }

    /// 取出下一行（去掉 `\n` 与可选的 `\r`），不完整时返回 None
    fn next_line(&mut self) -> RatResult<Option<String>> {
        let newline = self.buffer[self.scan_pos..].iter().position(|&b| b == b'\n');

        let Some(offset) = newline else {
            self.scan_pos = self.buffer.len();
            if self.header_bytes + self.buffer.len() > self.max_header_bytes {
                return Err(RatError::ParseError(format!(
                    "请求头超过上限 {} 字节",
                    self.max_header_bytes
                )));
            }
            return Ok(None);
        };

        let line_len = self.scan_pos + offset + 1;
        self.header_bytes += line_len;
        if self.header_bytes > self.max_header_bytes {
            return Err(RatError::ParseError(format!(
                "请求头超过上限 {} 字节",
                self.max_header_bytes
            )));
        }

        let raw = self.buffer.split_to(line_len);
        self.scan_pos = 0;

        let mut end = raw.len() - 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
        Ok(Some(String::from_utf8_lossy(&raw[..end]).into_owned()))
    }

    fn parse_request_line(&mut self, line: &str) -> RatResult<()> {
        let mut parts = line.split(' ');
        let (Some(method), Some(url), Some(crlf), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(RatError::ParseError(format!("请求行格式错误: {:?}", line)));
        };

        if method.is_empty() || !method.bytes().all(is_token_byte) {
            return Err(RatError::ParseError(format!("无效的请求方法: {:?}", method)));
        }
        if url.is_empty() {
            return Err(RatError::ParseError("请求 URL 为空".to_string()));
        }
        if !crlf.starts_with("HTTP/") {
            return Err(RatError::ParseError(format!("无效的协议标记: {:?}", crlf)));
        }

        self.request.method = method.to_string();
        self.request.url = url.to_string();
        self.request.crlf = crlf.to_string();
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> RatResult<()> {
        // 不支持 obs-fold 续行
        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(RatError::ParseError(format!("不支持的折叠请求头: {:?}", line)));
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(RatError::ParseError(format!("请求头缺少冒号: {:?}", line)));
        };

        let name = name.trim();
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            return Err(RatError::ParseError(format!("无效的请求头名称: {:?}", name)));
        }

        // 同名请求头（大小写无关）只保留最后一次出现的值
        self.request.headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
        self.request.headers.insert(name.to_string(), value.trim().to_string());
        Ok(())
    }

    fn declared_body_len(&self) -> RatResult<usize> {
        let Some(value) = find_header(&self.request.headers, "content-length") else {
            return Ok(0);
        };

        let len = if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            value.parse::<usize>().ok()
        } else {
            None
        };
        let Some(len) = len else {
            return Err(RatError::ParseError(format!("无效的 Content-Length: {:?}", value)));
        };
        if len > self.max_body_bytes {
            return Err(RatError::ParseError(format!(
                "请求体 {} 字节超过上限 {} 字节",
                len, self.max_body_bytes
            )));
        }
        Ok(len)
    }
}

/// 大小写无关地查找请求头
pub(crate) fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
