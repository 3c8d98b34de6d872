//! TCP 服务器集成测试
//!
//! 使用标准库阻塞套接字作为客户端

mod common;

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use common::{connect, localhost, read_all, roundtrip, split_response, tcp_addr, test_config};
use rat_http_core::{ManageState, Session, TcpServerManage};
use serde_json::{Value, json};

fn echo_server() -> TcpServerManage {
    let manage = TcpServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|session| {
        let reply = json!({
            "method": session.request_method_token(),
            "url": session.request_url(),
            "protocol": session.request_crlf(),
            "host": session.header("host"),
            "body": String::from_utf8_lossy(session.request_raw_data()),
        });
        session.reply_json(&reply).unwrap();
    });
    manage.listen(localhost(), 0).unwrap();
    manage
}

#[test]
fn test_reply_text_end_to_end() {
    let manage = TcpServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|session| {
        assert!(session.reply_text("ok"));
        assert!(!session.reply_text("again"));
    });
    manage.listen(localhost(), 0).unwrap();

    let response = roundtrip(tcp_addr(&manage), b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n");
    let (status_line, body) = split_response(&response);
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    assert!(response.contains("Content-Type: text/plain;charset=UTF-8"));
    assert!(response.contains("Content-Length: 2\r\n"));
    assert_eq!(body, "ok");

    manage.close();
}

#[test]
fn test_request_delivered_one_byte_at_a_time() {
    let manage = echo_server();
    let mut stream = connect(tcp_addr(&manage));
    stream.set_nodelay(true).unwrap();
    for byte in b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n" {
        stream.write_all(&[*byte]).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let response = read_all(&mut stream);
    let (status_line, body) = split_response(&response);
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    let parsed: Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["method"], "GET");
    assert_eq!(parsed["url"], "/x");
    assert_eq!(parsed["protocol"], "HTTP/1.1");
    assert_eq!(parsed["host"], "h");
    assert_eq!(parsed["body"], "");
}

#[test]
fn test_post_body_with_content_length() {
    let manage = echo_server();
    let response = roundtrip(
        tcp_addr(&manage),
        b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world",
    );
    let (_, body) = split_response(&response);
    let parsed: Value = serde_json::from_str(body).unwrap();
    assert_eq!(parsed["method"], "POST");
    assert_eq!(parsed["body"], "hello world");
}

#[test]
fn test_malformed_request_closed_without_callback() {
    let manage = TcpServerManage::with_config(test_config());
    let called = Arc::new(AtomicUsize::new(0));
    let counter = called.clone();
    manage.set_http_accepted_callback(move |session| {
        counter.fetch_add(1, Ordering::SeqCst);
        session.reply_text("unexpected");
    });
    manage.listen(localhost(), 0).unwrap();

    let response = roundtrip(tcp_addr(&manage), b"GARBAGE\r\nHost: h\r\n\r\n");
    assert!(response.is_empty(), "解析失败应静默关闭，实际收到: {}", response);

    let response = roundtrip(tcp_addr(&manage), b"GET /x HTTP/1.1\r\nbroken header\r\n\r\n");
    assert!(response.is_empty());
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[test]
fn test_callback_without_reply_closes_connection() {
    let manage = TcpServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|_session| {});
    manage.listen(localhost(), 0).unwrap();

    let started = Instant::now();
    let response = roundtrip(tcp_addr(&manage), b"GET / HTTP/1.1\r\n\r\n");
    assert!(response.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_idle_session_evicted() {
    let manage = TcpServerManage::with_config(test_config().session_timeout(Duration::from_millis(200)));
    manage.set_http_accepted_callback(|session| {
        session.reply_text("ok");
    });
    manage.listen(localhost(), 0).unwrap();

    // 只发送半个请求
    let mut stream = connect(tcp_addr(&manage));
    stream.write_all(b"GET /slow HTTP/1.1\r\nHo").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while manage.active_session_count() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manage.active_session_count(), 1);

    let response = read_all(&mut stream);
    assert!(response.is_empty());

    let deadline = Instant::now() + Duration::from_secs(2);
    while manage.active_session_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manage.active_session_count(), 0);
}

#[test]
fn test_unanswered_session_times_out() {
    let manage = TcpServerManage::with_config(test_config().session_timeout(Duration::from_millis(300)));
    let parked: Arc<Mutex<Vec<Arc<Session>>>> = Arc::new(Mutex::new(Vec::new()));
    let parked_in_callback = parked.clone();
    manage.set_http_accepted_callback(move |session| {
        parked_in_callback.lock().unwrap().push(session);
    });
    manage.listen(localhost(), 0).unwrap();

    let started = Instant::now();
    let response = roundtrip(tcp_addr(&manage), b"GET / HTTP/1.1\r\n\r\n");
    assert!(response.is_empty());
    assert!(started.elapsed() < Duration::from_secs(3));

    // 超时之后的回复不会出错，只是无处可写
    let session = parked.lock().unwrap().pop().unwrap();
    assert!(session.reply_text("too late"));
}

#[test]
fn test_empty_shutdown_fires_ready_to_close() {
    let manage = echo_server();
    let (tx, rx) = mpsc::channel();
    manage.set_ready_to_close_callback(move || {
        tx.send(()).unwrap();
    });

    let started = Instant::now();
    manage.close();
    assert!(started.elapsed() < Duration::from_secs(1));
    rx.recv_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(manage.state(), ManageState::Closed);
    assert_eq!(manage.active_session_count(), 0);
}

#[test]
fn test_drained_shutdown_completes_in_flight_sessions() {
    const SESSIONS: usize = 4;

    let manage = TcpServerManage::with_config(test_config().handle_max_thread_count(SESSIONS));
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    manage.set_http_accepted_callback(move |session| {
        entered_tx.lock().unwrap().send(()).unwrap();
        thread::sleep(Duration::from_millis(200));
        session.reply_text(session.request_url());
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    let clients: Vec<_> = (0..SESSIONS)
        .map(|i| thread::spawn(move || roundtrip(addr, format!("GET /{} HTTP/1.1\r\n\r\n", i).as_bytes())))
        .collect();
    for _ in 0..SESSIONS {
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    manage.close();
    assert_eq!(manage.active_session_count(), 0);

    let mut bodies: Vec<String> = clients
        .into_iter()
        .map(|client| {
            let response = client.join().unwrap();
            let (status_line, body) = split_response(&response);
            assert_eq!(status_line, "HTTP/1.1 200 OK");
            body.to_string()
        })
        .collect();
    bodies.sort();
    assert_eq!(bodies, vec!["/0", "/1", "/2", "/3"]);
}

#[test]
fn test_close_from_callback_still_replies() {
    let manage = Arc::new(TcpServerManage::with_config(test_config()));
    let (closed_tx, closed_rx) = mpsc::channel();
    manage.set_ready_to_close_callback(move || {
        closed_tx.send(()).unwrap();
    });
    let weak = Arc::downgrade(&manage);
    manage.set_http_accepted_callback(move |session| {
        if let Some(manage) = weak.upgrade() {
            let started = Instant::now();
            manage.close();
            assert!(started.elapsed() < Duration::from_millis(500));
            assert_eq!(manage.state(), ManageState::Stopping);
        }
        session.reply_text("bye");
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    let started = Instant::now();
    let response = roundtrip(addr, b"GET /shutdown HTTP/1.1\r\n\r\n");
    let (status_line, body) = split_response(&response);
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    assert_eq!(body, "bye");
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(manage.wait_closed(Duration::from_secs(2)));
    closed_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(manage.state(), ManageState::Closed);
    assert_eq!(manage.active_session_count(), 0);
    assert!(manage.local_addr().is_none());
}

#[test]
fn test_close_abandons_callback_past_grace() {
    let grace = Duration::from_millis(300);
    let manage = TcpServerManage::with_config(test_config().shutdown_grace(grace));
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    manage.set_http_accepted_callback(move |session| {
        entered_tx.lock().unwrap().send(()).unwrap();
        thread::sleep(Duration::from_secs(2));
        session.reply_text("too slow");
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    let client = thread::spawn(move || roundtrip(addr, b"GET /slow HTTP/1.1\r\n\r\n"));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let started = Instant::now();
    manage.close();
    let elapsed = started.elapsed();
    assert!(elapsed >= grace - Duration::from_millis(50), "close 返回过早: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "close 等待了整个回调: {:?}", elapsed);
    assert_eq!(manage.state(), ManageState::Closed);
    assert_eq!(manage.active_session_count(), 0);

    // 被驱逐的会话收不到回复
    assert!(!client.join().unwrap().contains("too slow"));
}

#[test]
fn test_full_handle_queue_answers_503() {
    let manage = TcpServerManage::with_config(test_config().handle_max_thread_count(1).handle_queue_capacity(1));
    let (entered_tx, entered_rx) = mpsc::channel();
    let entered_tx = Mutex::new(entered_tx);
    let (release_tx, release_rx) = crossbeam::channel::unbounded::<()>();
    manage.set_http_accepted_callback(move |session| {
        entered_tx.lock().unwrap().send(()).unwrap();
        let _ = release_rx.recv_timeout(Duration::from_secs(5));
        session.reply_text("done");
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    // 第一个请求占住唯一的工作线程
    let busy = thread::spawn(move || roundtrip(addr, b"GET /busy HTTP/1.1\r\n\r\n"));
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // 第二个请求占满队列
    let queued = thread::spawn(move || roundtrip(addr, b"GET /queued HTTP/1.1\r\n\r\n"));
    thread::sleep(Duration::from_millis(300));

    let response = roundtrip(addr, b"GET /rejected HTTP/1.1\r\n\r\n");
    let (status_line, body) = split_response(&response);
    assert_eq!(status_line, "HTTP/1.1 503 Service Unavailable");
    assert_eq!(body, "Service Unavailable");

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
    assert_eq!(split_response(&busy.join().unwrap()).1, "done");
    assert_eq!(split_response(&queued.join().unwrap()).1, "done");
}

#[test]
fn test_callback_panic_does_not_leak_session() {
    let manage = TcpServerManage::with_config(test_config().handle_max_thread_count(1));
    manage.set_http_accepted_callback(|session| {
        if session.request_url() == "/panic" {
            panic!("callback failure");
        }
        session.reply_text("alive");
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    let response = roundtrip(addr, b"GET /panic HTTP/1.1\r\n\r\n");
    assert!(response.is_empty());

    // 唯一的工作线程仍然可用
    let response = roundtrip(addr, b"GET /next HTTP/1.1\r\n\r\n");
    assert_eq!(split_response(&response).1, "alive");

    let deadline = Instant::now() + Duration::from_secs(2);
    while manage.active_session_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manage.active_session_count(), 0);
}

#[test]
fn test_query_and_json_reply() {
    let manage = TcpServerManage::with_config(test_config());
    manage.set_http_accepted_callback(|session| {
        let query = session.request_url_query();
        let object = json!({
            "path": session.request_url_path(),
            "name": query.get("name"),
        });
        session.reply_json_object(object.as_object().unwrap()).unwrap();
    });
    manage.listen(localhost(), 0).unwrap();

    let response = roundtrip(tcp_addr(&manage), b"GET /api/user?name=rat%20core&id=1 HTTP/1.1\r\n\r\n");
    assert!(response.contains("Content-Type: application/json;charset=UTF-8"));
    let parsed: Value = serde_json::from_str(split_response(&response).1).unwrap();
    assert_eq!(parsed["path"], "/api/user");
    assert_eq!(parsed["name"], "rat core");
}

#[test]
fn test_reply_file_and_redirect() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = dir.path().join("data.bin");
    std::fs::write(&file_path, b"file-content").unwrap();

    let manage = TcpServerManage::with_config(test_config());
    manage.set_http_accepted_callback(move |session| match session.request_url() {
        "/file" => {
            session.reply_file(&file_path).unwrap();
        }
        _ => {
            session.reply_redirects("/file");
        }
    });
    manage.listen(localhost(), 0).unwrap();
    let addr = tcp_addr(&manage);

    let response = roundtrip(addr, b"GET /file HTTP/1.1\r\n\r\n");
    assert_eq!(split_response(&response).1, "file-content");

    let response = roundtrip(addr, b"GET /old HTTP/1.1\r\n\r\n");
    assert_eq!(split_response(&response).0, "HTTP/1.1 302 Found");
    assert!(response.contains("Location: /file\r\n"));
}
