/*
 * h1_exchange.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * HTTP/1.1 integration tests against an in-process scripted server:
 * request/response framing, connection reuse through the pool, redirects,
 * chunked bodies, the 101 upgrade hand-off, and failure paths.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use staffetta_core::{ClientConfig, HttpClient, HttpUrl, Method, Request};

/// Read one request head off the socket; returns the request line.
async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match socket.read(&mut byte).await {
            Ok(0) => return None,
            Ok(_) => head.push(byte[0]),
            Err(_) => return None,
        }
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&head);
    text.lines().next().map(|l| l.to_string())
}

fn client() -> HttpClient {
    let mut config = ClientConfig::default();
    config.read_timeout = Duration::from_secs(5);
    config.connect_timeout = Duration::from_secs(5);
    HttpClient::new(config).unwrap()
}

fn get(url: &str) -> Request {
    Request::new(Method::Get, HttpUrl::parse(url).unwrap())
}

#[tokio::test]
async fn get_with_fixed_body_and_connection_reuse() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_in_server = accepted.clone();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            accepted_in_server.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                while read_request_head(&mut socket).await.is_some() {
                    socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                        .await
                        .unwrap();
                }
            });
        }
    });

    let client = client();
    let url = format!("http://127.0.0.1:{}/", port);

    let response = client.execute(get(&url)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().await.unwrap().as_ref(), b"hello");

    // Give the body driver a moment to return the connection to the pool.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let response = client.execute(get(&url)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().await.unwrap().as_ref(), b"hello");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "second call must reuse the connection");
}

#[tokio::test]
async fn chunked_body_with_trailers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await.unwrap();
        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\nX-Checksum: abc\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let client = client();
    let response = client
        .execute(get(&format!("http://127.0.0.1:{}/", port)))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    let mut body = response.body;
    let mut collected = Vec::new();
    while let Some(chunk) = body.chunk().await.unwrap() {
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"hello world");
    let trailers = body.trailers().expect("trailers after chunked body");
    assert_eq!(trailers.get("X-Checksum"), Some("abc"));
}

#[tokio::test]
async fn redirect_followed_on_same_connection_family() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                while let Some(line) = read_request_head(&mut socket).await {
                    if line.starts_with("GET /next") {
                        socket
                            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                            .await
                            .unwrap();
                    } else {
                        socket
                            .write_all(
                                b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n",
                            )
                            .await
                            .unwrap();
                    }
                }
            });
        }
    });

    let client = client();
    let response = client
        .execute(get(&format!("http://127.0.0.1:{}/start", port)))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().await.unwrap().as_ref(), b"ok");
}

#[tokio::test]
async fn upgrade_yields_raw_socket_and_skips_pool() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_in_server = accepted.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            accepted_in_server.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let line = read_request_head(&mut socket).await.unwrap();
                if line.starts_with("GET /raw") {
                    socket
                        .write_all(
                            b"HTTP/1.1 101 Switching Protocols\r\n\
                              Connection: Upgrade\r\nUpgrade: foo\r\n\r\n",
                        )
                        .await
                        .unwrap();
                    // Echo whatever arrives on the raw socket.
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        socket.write_all(&buf[..n]).await.unwrap();
                    }
                } else {
                    socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                        .await
                        .unwrap();
                }
            });
        }
    });

    let client = client();
    let request = get(&format!("http://127.0.0.1:{}/raw", port))
        .header("Connection", "Upgrade")
        .header("Upgrade", "foo");
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, 101);
    let mut socket = response.socket.expect("101 must yield the raw transport");

    socket.write_all(b"ping over raw").await.unwrap();
    let mut echoed = [0u8; 13];
    socket.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping over raw");
    drop(socket);

    // The upgraded connection must not be reused for the next call.
    let response = client
        .execute(get(&format!("http://127.0.0.1:{}/plain", port)))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn premature_eof_surfaces_as_body_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort")
            .await
            .unwrap();
        // Close with half the promised body missing.
    });

    let client = client();
    let response = client
        .execute(get(&format!("http://127.0.0.1:{}/", port)))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.bytes().await.is_err());
}

#[tokio::test]
async fn malformed_status_line_is_a_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await.unwrap();
        socket.write_all(b"HTTP/1.1 2x0 Weird\r\n\r\n").await.unwrap();
    });

    let client = client();
    let result = client.execute(get(&format!("http://127.0.0.1:{}/", port))).await;
    match result {
        Err(staffetta_core::HttpError::Protocol(_)) => {}
        other => panic!("expected protocol error, got {:?}", other.map(|r| r.status)),
    }
}

#[tokio::test]
async fn icy_status_line_is_tolerated() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request_head(&mut socket).await.unwrap();
        socket
            .write_all(b"ICY 200 OK\r\nContent-Length: 4\r\n\r\ncast")
            .await
            .unwrap();
    });

    let client = client();
    let response = client
        .execute(get(&format!("http://127.0.0.1:{}/stream", port)))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().await.unwrap().as_ref(), b"cast");
}

#[tokio::test]
async fn post_with_buffered_body_sends_content_length() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel::<Vec<u8>>();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Read head + exactly 11 body bytes.
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            seen.extend_from_slice(&buf[..n]);
            if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                let body_so_far = seen.len() - (pos + 4);
                if body_so_far >= 11 {
                    break;
                }
            }
        }
        tx.send(seen).unwrap();
        socket
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .await
            .unwrap();
    });

    let client = client();
    let mut request = Request::new(
        Method::Post,
        HttpUrl::parse(&format!("http://127.0.0.1:{}/submit", port)).unwrap(),
    );
    request.body = staffetta_core::RequestBody::buffered("text/plain", "hello world");
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, 204);

    let seen = rx.await.unwrap();
    let text = String::from_utf8_lossy(&seen);
    assert!(text.contains("Content-Length: 11\r\n"));
    assert!(text.ends_with("hello world"));
}
