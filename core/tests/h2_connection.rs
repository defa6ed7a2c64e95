/*
 * h2_connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * HTTP/2 integration tests against an in-process scripted peer built on
 * the crate's own frame parser/writer and HPACK codec: concurrent stream
 * multiplexing with interleaved DATA, flow-control back-pressure on
 * uploads, REFUSED_STREAM retry, and the :authority pseudo-header for a
 * punycoded host. Cleartext prior-knowledge (protocols = [h2]) keeps TLS
 * out of the harness.
 */

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use staffetta_core::protocol::http::h2::frame::{
    ERROR_REFUSED_STREAM, SETTINGS_INITIAL_WINDOW_SIZE,
};
use staffetta_core::protocol::http::h2::{H2FrameHandler, H2Parser, H2Writer, CONNECTION_PREFACE};
use staffetta_core::protocol::http::hpack;
use staffetta_core::route::DnsResolver;
use staffetta_core::{ClientConfig, HttpClient, HttpUrl, Method, Protocol, Request, RequestBody};

#[derive(Default)]
struct FrameLog {
    headers: Vec<(u32, bool, Bytes)>,
    data: Vec<(u32, bool, Bytes)>,
    settings: Vec<(bool, Vec<(u16, u32)>)>,
    window_updates: Vec<(u32, u32)>,
    pings: Vec<(bool, u64)>,
    rst: Vec<(u32, u32)>,
}

impl H2FrameHandler for FrameLog {
    fn data_frame_received(&mut self, stream_id: u32, end_stream: bool, data: Bytes) {
        self.data.push((stream_id, end_stream, data));
    }
    fn headers_frame_received(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        _end_headers: bool,
        _dep: u32,
        _excl: bool,
        _weight: u8,
        block: Bytes,
    ) {
        self.headers.push((stream_id, end_stream, block));
    }
    fn priority_frame_received(&mut self, _id: u32, _dep: u32, _excl: bool, _weight: u8) {}
    fn rst_stream_frame_received(&mut self, stream_id: u32, error_code: u32) {
        self.rst.push((stream_id, error_code));
    }
    fn settings_frame_received(&mut self, ack: bool, settings: Vec<(u16, u32)>) {
        self.settings.push((ack, settings));
    }
    fn push_promise_frame_received(&mut self, _id: u32, _promised: u32, _eh: bool, _block: Bytes) {}
    fn ping_frame_received(&mut self, ack: bool, opaque: u64) {
        self.pings.push((ack, opaque));
    }
    fn goaway_frame_received(&mut self, _last: u32, _code: u32, _debug: Bytes) {}
    fn window_update_frame_received(&mut self, stream_id: u32, increment: u32) {
        self.window_updates.push((stream_id, increment));
    }
    fn continuation_frame_received(&mut self, _id: u32, _eh: bool, _block: Bytes) {}
    fn frame_error(&mut self, code: u32, stream_id: u32, message: String) {
        panic!("peer saw bad frame: {} on {} ({})", code, stream_id, message);
    }
}

/// Server side of one h2 connection, scripted frame by frame.
struct ScriptedPeer {
    socket: TcpStream,
    buf: BytesMut,
    parser: H2Parser,
    log: FrameLog,
    writer: H2Writer,
    /// One decoder per connection: the client's encoder builds a dynamic
    /// table, so blocks must decode in arrival order with shared state.
    decoder: hpack::Decoder,
}

impl ScriptedPeer {
    /// Accept a connection and consume the client preface.
    async fn accept(listener: &TcpListener) -> io::Result<ScriptedPeer> {
        let (mut socket, _) = listener.accept().await?;
        let mut preface = [0u8; 24];
        socket.read_exact(&mut preface).await?;
        assert_eq!(&preface, CONNECTION_PREFACE);
        Ok(ScriptedPeer {
            socket,
            buf: BytesMut::with_capacity(65536),
            parser: H2Parser::new(),
            log: FrameLog::default(),
            writer: H2Writer::new(),
            decoder: hpack::Decoder::new(4096),
        })
    }

    async fn pump(&mut self) -> io::Result<()> {
        let mut tmp = [0u8; 16384];
        let n = self.socket.read(&mut tmp).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client gone"));
        }
        self.buf.extend_from_slice(&tmp[..n]);
        self.parser.receive(&mut self.buf, &mut self.log)
    }

    async fn pump_until(&mut self, mut done: impl FnMut(&FrameLog) -> bool) -> io::Result<()> {
        while !done(&self.log) {
            self.pump().await?;
        }
        Ok(())
    }

    async fn send(&mut self, build: impl FnOnce(&mut H2Writer)) -> io::Result<()> {
        build(&mut self.writer);
        let frames = self.writer.take_buffer();
        self.socket.write_all(&frames).await?;
        self.socket.flush().await
    }

    fn decode_headers(&mut self, block: &Bytes) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut cursor: &[u8] = block;
        self.decoder.decode(&mut cursor, &mut out).unwrap();
        out
    }
}

fn h2_client() -> HttpClient {
    let mut config = ClientConfig::default();
    config.protocols = vec![Protocol::H2];
    config.read_timeout = Duration::from_secs(5);
    config.max_connects_per_address = 1;
    HttpClient::new(config).unwrap()
}

fn status_block(status: &str) -> BytesMut {
    let mut encoder = hpack::Encoder::new(4096);
    let mut block = BytesMut::new();
    encoder.encode(&[(":status".to_string(), status.to_string())], &mut block);
    block
}

#[tokio::test]
async fn concurrent_streams_with_interleaved_data() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(&listener).await.unwrap();
        peer.send(|w| {
            w.write_settings(&[]).unwrap();
            w.write_settings_ack().unwrap();
        })
        .await
        .unwrap();
        peer.pump_until(|log| log.headers.len() >= 2).await.unwrap();

        // Which stream asked for which path?
        let header_frames: Vec<(u32, Bytes)> = peer
            .log
            .headers
            .iter()
            .map(|(id, _, block)| (*id, block.clone()))
            .collect();
        let mut streams: Vec<(u32, String)> = Vec::new();
        for (id, block) in &header_frames {
            let headers = peer.decode_headers(block);
            let path = headers
                .iter()
                .find(|(n, _)| n == ":path")
                .map(|(_, v)| v.clone())
                .unwrap();
            streams.push((*id, path));
        }

        let block = status_block("200");
        let ids: Vec<u32> = streams.iter().map(|(id, _)| *id).collect();
        peer.send(|w| {
            for id in &ids {
                w.write_headers(*id, &block, false, 16384).unwrap();
            }
        })
        .await
        .unwrap();

        // Interleave DATA between the two streams, split mid-body.
        let payload_for = |path: &str| format!("body-of-{}", path);
        let (first, second) = (streams[0].clone(), streams[1].clone());
        let p1 = payload_for(&first.1);
        let p2 = payload_for(&second.1);
        peer.send(|w| {
            w.write_data(first.0, &p1.as_bytes()[..4], false).unwrap();
            w.write_data(second.0, &p2.as_bytes()[..4], false).unwrap();
            w.write_data(first.0, &p1.as_bytes()[4..], true).unwrap();
            w.write_data(second.0, &p2.as_bytes()[4..], true).unwrap();
        })
        .await
        .unwrap();
        // Hold the socket open until the client is done reading.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let client = h2_client();
    let url_a = format!("http://127.0.0.1:{}/a", port);
    let url_b = format!("http://127.0.0.1:{}/b", port);
    let (ra, rb) = tokio::join!(
        client.execute(Request::new(Method::Get, HttpUrl::parse(&url_a).unwrap())),
        client.execute(Request::new(Method::Get, HttpUrl::parse(&url_b).unwrap())),
    );
    let ra = ra.unwrap();
    let rb = rb.unwrap();
    assert_eq!(ra.status, 200);
    assert_eq!(rb.status, 200);
    assert_eq!(ra.body.bytes().await.unwrap().as_ref(), b"body-of-/a");
    assert_eq!(rb.body.bytes().await.unwrap().as_ref(), b"body-of-/b");
    server.await.unwrap();
}

#[tokio::test]
async fn upload_blocks_on_flow_control_and_completes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    const UPLOAD_SIZE: usize = 128 * 1024;

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(&listener).await.unwrap();
        // Small stream windows force the client to wait for credit.
        peer.send(|w| {
            w.write_settings(&[(SETTINGS_INITIAL_WINDOW_SIZE, 16384)]).unwrap();
            w.write_settings_ack().unwrap();
        })
        .await
        .unwrap();

        let mut received: Vec<u8> = Vec::new();
        let mut stream_id = 0u32;
        let mut granted_after: usize = 0;
        loop {
            peer.pump().await.unwrap();
            let mut ended = false;
            {
                let data = std::mem::take(&mut peer.log.data);
                for (id, end, chunk) in data {
                    stream_id = id;
                    received.extend_from_slice(&chunk);
                    ended |= end;
                }
            }
            // Grant credit back for everything consumed since last grant.
            let consumed = received.len() - granted_after;
            if consumed > 0 && stream_id != 0 {
                granted_after = received.len();
                let id = stream_id;
                peer.send(|w| {
                    w.write_window_update(0, consumed as u32).unwrap();
                    w.write_window_update(id, consumed as u32).unwrap();
                })
                .await
                .unwrap();
            }
            if ended {
                break;
            }
        }
        assert_eq!(received.len(), UPLOAD_SIZE);
        // Bytes must arrive in order.
        for (i, b) in received.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8, "byte {} out of order", i);
        }
        // The client must have acked our SETTINGS.
        assert!(peer.log.settings.iter().any(|(ack, _)| *ack));

        let block = status_block("200");
        let id = stream_id;
        let size = received.len().to_string();
        peer.send(|w| {
            w.write_headers(id, &block, false, 16384).unwrap();
            w.write_data(id, size.as_bytes(), true).unwrap();
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let body: Vec<u8> = (0..UPLOAD_SIZE).map(|i| (i % 251) as u8).collect();
    let client = h2_client();
    let mut request = Request::new(
        Method::Post,
        HttpUrl::parse(&format!("http://127.0.0.1:{}/upload", port)).unwrap(),
    );
    request.body = RequestBody::buffered("application/octet-stream", body);
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(
        response.body.bytes().await.unwrap().as_ref(),
        UPLOAD_SIZE.to_string().as_bytes()
    );
    server.await.unwrap();
}

#[tokio::test]
async fn refused_stream_is_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(&listener).await.unwrap();
        peer.send(|w| {
            w.write_settings(&[]).unwrap();
            w.write_settings_ack().unwrap();
        })
        .await
        .unwrap();
        // Refuse the first stream outright.
        peer.pump_until(|log| !log.headers.is_empty()).await.unwrap();
        let first = peer.log.headers[0].0;
        peer.send(|w| w.write_rst_stream(first, ERROR_REFUSED_STREAM).unwrap())
            .await
            .unwrap();
        // Serve the replay.
        peer.pump_until(|log| log.headers.len() >= 2).await.unwrap();
        let second = peer.log.headers[1].0;
        assert!(second > first, "replayed stream must get a fresh id");
        let block = status_block("200");
        peer.send(|w| {
            w.write_headers(second, &block, false, 16384).unwrap();
            w.write_data(second, b"after retry", true).unwrap();
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = h2_client();
    let response = client
        .execute(Request::new(
            Method::Get,
            HttpUrl::parse(&format!("http://127.0.0.1:{}/flaky", port)).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.bytes().await.unwrap().as_ref(), b"after retry");
    server.await.unwrap();
}

struct LoopbackDns;

impl DnsResolver for LoopbackDns {
    fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

#[tokio::test]
async fn punycoded_host_appears_in_authority() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut peer = ScriptedPeer::accept(&listener).await.unwrap();
        peer.send(|w| {
            w.write_settings(&[]).unwrap();
            w.write_settings_ack().unwrap();
        })
        .await
        .unwrap();
        peer.pump_until(|log| !log.headers.is_empty()).await.unwrap();
        let (id, _, block) = peer.log.headers[0].clone();
        let headers = peer.decode_headers(&block);
        let authority = headers
            .iter()
            .find(|(n, _)| n == ":authority")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(authority, format!("xn--n3h.net:{}", port));
        let block = status_block("204");
        peer.send(|w| w.write_headers(id, &block, true, 16384).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = h2_client().with_resolver(Arc::new(LoopbackDns));
    let response = client
        .execute(Request::new(
            Method::Get,
            HttpUrl::parse(&format!("http://xn--n3h.net:{}/", port)).unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status, 204);
    server.await.unwrap();
}
