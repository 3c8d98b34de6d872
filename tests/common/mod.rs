//! 集成测试公共工具

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use rat_http_core::{ManageConfig, TcpServerManage};

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// 适合测试的配置：较短的宽限期
pub fn test_config() -> ManageConfig {
    ManageConfig::default().shutdown_grace(Duration::from_secs(3))
}

pub fn tcp_addr(manage: &TcpServerManage) -> SocketAddr {
    manage
        .local_addr()
        .and_then(|addr| addr.socket_addr())
        .expect("服务器未绑定地址")
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("连接服务器失败");
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// 发送完整请求并读取到对端关闭为止
pub fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    read_all(&mut stream)
}

pub fn read_all(stream: &mut impl Read) -> String {
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response);
    String::from_utf8_lossy(&response).into_owned()
}

/// 拆分出状态行和正文
pub fn split_response(response: &str) -> (&str, &str) {
    let status_line = response.lines().next().unwrap_or_default();
    let body = response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or_default();
    (status_line, body)
}
