//! 本地套接字服务器集成测试
#![cfg(unix)]

mod common;

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use common::{read_all, split_response, test_config};
use rat_http_core::{LocalServerManage, PeerAddr};

#[test]
fn test_local_socket_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("rat_http_core.sock");
    let name = socket_path.to_str().unwrap().to_string();

    let manage = LocalServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|session| {
        let source = match session.request_source() {
            PeerAddr::Local(_) => "local",
            PeerAddr::Tcp(_) => "tcp",
        };
        session.reply_text(&format!("{} {}", source, session.request_url()));
    });
    manage.listen(&name).unwrap();
    assert_eq!(manage.local_addr(), Some(PeerAddr::Local(name.clone())));
    assert!(socket_path.exists());

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(b"GET /local HTTP/1.1\r\n\r\n").unwrap();
    let response = read_all(&mut stream);
    let (status_line, body) = split_response(&response);
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    assert_eq!(body, "local /local");

    manage.close();
    assert!(!socket_path.exists(), "关闭后应删除套接字文件");
}

#[test]
fn test_stale_socket_file_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("stale.sock");
    std::fs::write(&socket_path, b"left over").unwrap();

    let manage = LocalServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|session| {
        session.reply_text("fresh");
    });
    manage.listen(socket_path.to_str().unwrap()).unwrap();

    let mut stream = UnixStream::connect(&socket_path).unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert_eq!(split_response(&read_all(&mut stream)).1, "fresh");
}
