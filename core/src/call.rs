/*
 * call.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an HTTP client library.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Call driver: acquire a connection via the pool and route planner, run
//! one exchange (H1 or H2), then handle follow-ups (redirects, auth
//! challenges, a single 408 retry) and the retry policy. Errors before the
//! first response byte may be retried on another route when the body is
//! replayable; errors after it never are.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::{ClientConfig, Protocol};
use crate::error::{HttpError, HttpResult, TimeoutKind};
use crate::events::{EventListener, NoopEventListener};
use crate::net::{connect_tcp, HttpStream, RustlsTransport, TlsTransport};
use crate::pool::ConnectionPool;
use crate::protocol::http::connection::{ConnProtocol, Connection, HttpVersion};
use crate::protocol::http::h1::exchange::{
    response_body_kind, BodyKind, ExchangeFinisher, Http1Exchange,
};
use crate::protocol::http::h2::connection::{H2Connection, H2StreamHandle};
use crate::protocol::http::h2::stream::StreamEvent;
use crate::protocol::http::h2::frame;
use crate::protocol::http::headers::Headers;
use crate::protocol::http::request::{Method, Request, RequestBody};
use crate::protocol::http::response::{Body, Response, UpgradedStream};
use crate::route::{Address, ConnectPlan, DnsResolver, Plan, Proxy, RoutePlanner, SystemDns};

/// Delay before the second connect attempt of a two-plan race.
const CONNECT_RACE_DELAY: Duration = Duration::from_millis(250);

/// Supplies credentials for 401/407 challenges: returns the header to
/// attach ("Authorization" or "Proxy-Authorization") or None to give up.
pub trait Authenticator: Send + Sync {
    fn authenticate(
        &self,
        proxy: bool,
        request: &Request,
        response_headers: &Headers,
    ) -> Option<(String, String)>;
}

/// Cancellation flag shared between a call and anyone holding its handle.
/// Idempotent and safe from any thread; blocked operations observe it at
/// their next suspension point.
pub struct CancelHandle {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

async fn with_cancel<T>(
    cancel: &CancelHandle,
    fut: impl Future<Output = HttpResult<T>>,
) -> HttpResult<T> {
    tokio::select! {
        _ = cancel.wait() => Err(HttpError::Canceled),
        r = fut => r,
    }
}

/// The client: configuration plus the shared pool and pluggable
/// collaborators. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct HttpClient {
    config: ClientConfig,
    pool: ConnectionPool,
    tls: Arc<dyn TlsTransport>,
    resolver: Arc<dyn DnsResolver>,
    events: Arc<dyn EventListener>,
    authenticator: Option<Arc<dyn Authenticator>>,
    proxies: Vec<Proxy>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> HttpResult<Self> {
        config.validate()?;
        let pool = ConnectionPool::with_connect_cap(
            config.max_idle_connections,
            config.keep_alive_duration,
            config.max_connects_per_address,
        );
        Ok(Self {
            config,
            pool,
            tls: Arc::new(RustlsTransport::new()),
            resolver: Arc::new(SystemDns),
            events: Arc::new(NoopEventListener),
            authenticator: None,
            proxies: Vec::new(),
        })
    }

    pub fn with_tls_transport(mut self, tls: Arc<dyn TlsTransport>) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_event_listener(mut self, events: Arc<dyn EventListener>) -> Self {
        self.events = events;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<Proxy>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn new_call(&self, request: Request) -> Call {
        Call {
            client: self.clone(),
            request: Some(request),
            cancel: Arc::new(CancelHandle::new()),
        }
    }

    /// Convenience: build a call and run it.
    pub async fn execute(&self, request: Request) -> HttpResult<Response> {
        self.new_call(request).execute().await
    }

    /// Everything that must match for connection sharing. Upgrade requests
    /// are pinned to HTTP/1.1: the upgrade mechanism does not exist in H2.
    fn address_for(&self, request: &Request) -> Address {
        let protocols = if request.is_upgrade() {
            vec![Protocol::Http11]
        } else {
            self.config.protocols.clone()
        };
        let proxies = if self.proxies.is_empty() {
            vec![Proxy::Direct]
        } else {
            self.proxies.clone()
        };
        Address {
            scheme: request.url.scheme,
            host: request.url.host.clone(),
            port: request.url.port,
            protocols,
            proxies,
        }
    }
}

/// One logical request plus its follow-ups.
pub struct Call {
    client: HttpClient,
    request: Option<Request>,
    cancel: Arc<CancelHandle>,
}

impl Call {
    /// Handle for cancelling this call from another task.
    pub fn cancel_handle(&self) -> Arc<CancelHandle> {
        self.cancel.clone()
    }

    pub async fn execute(mut self) -> HttpResult<Response> {
        let request = match self.request.take() {
            Some(r) => r,
            None => return Err(HttpError::MalformedRequest("call already executed".into())),
        };
        let events = self.client.events.clone();
        events.call_start(&request.url.to_string());

        let call_timeout = self.client.config.call_timeout;
        let drive = drive(&self.client, request, &self.cancel);
        let result = if call_timeout.is_zero() {
            drive.await
        } else {
            match timeout(call_timeout, drive).await {
                Ok(r) => r,
                Err(_) => {
                    self.cancel.cancel();
                    Err(HttpError::Timeout(TimeoutKind::Call))
                }
            }
        };
        match &result {
            Ok(_) => events.call_end(),
            Err(e) => events.call_failed(e),
        }
        result
    }
}

/// Follow-up decision after a completed exchange.
enum Followup {
    Done,
    Next(Request),
    Retry408,
}

async fn drive(
    client: &HttpClient,
    mut request: Request,
    cancel: &Arc<CancelHandle>,
) -> HttpResult<Response> {
    request.validate()?;
    let mut redirects = 0u32;
    let mut auth_attempts = 0u32;
    let mut retried_408 = false;

    loop {
        if cancel.is_cancelled() {
            return Err(HttpError::Canceled);
        }
        let response = send_over_network(client, &mut request, cancel).await?;

        match decide_followup(client, &mut request, &response, &mut auth_attempts)? {
            Followup::Done => return Ok(response),
            Followup::Next(next) => {
                redirects += 1;
                if redirects > client.config.max_redirects {
                    return Err(HttpError::Protocol(format!(
                        "too many redirects: {}",
                        redirects
                    )));
                }
                tracing::debug!(url = %next.url, "following redirect");
                // The interim body is dropped; its driver will discard the
                // connection if anything was left unread.
                request = next;
            }
            Followup::Retry408 => {
                if retried_408 || !request.method.is_idempotent() {
                    return Ok(response);
                }
                retried_408 = true;
            }
        }
    }
}

fn decide_followup(
    client: &HttpClient,
    request: &mut Request,
    response: &Response,
    auth_attempts: &mut u32,
) -> HttpResult<Followup> {
    match response.status {
        301 | 302 | 303 | 307 | 308 if client.config.follow_redirects => {
            let location = match response.header("Location") {
                Some(l) => l.to_string(),
                None => return Ok(Followup::Done),
            };
            let next_url = request.url.resolve_location(&location)?;
            if next_url.scheme != request.url.scheme && !client.config.follow_ssl_redirects {
                return Ok(Followup::Done);
            }
            // 303 (and the historical 301/302-on-POST behavior) rewrites to
            // a bodyless GET; 307/308 preserve method and body, which then
            // must be replayable.
            let rewrite_to_get = response.status == 303
                || ((response.status == 301 || response.status == 302)
                    && request.method == Method::Post);
            let (method, body) = if rewrite_to_get {
                (Method::Get, RequestBody::Empty)
            } else {
                if !request.body.is_replayable() {
                    return Ok(Followup::Done);
                }
                (
                    request.method,
                    std::mem::replace(&mut request.body, RequestBody::Empty),
                )
            };
            let mut headers = request.headers.clone();
            if !next_url.same_host_and_port(&request.url) {
                // Never forward credentials across hosts.
                headers.remove("Authorization");
                headers.remove("Proxy-Authorization");
                headers.remove("Cookie");
            }
            let mut next = Request::new(method, next_url);
            next.headers = headers;
            next.body = body;
            next.attachments = request.attachments.clone();
            Ok(Followup::Next(next))
        }
        401 | 407 => {
            let proxy = response.status == 407;
            let authenticator = match &client.authenticator {
                Some(a) => a,
                None => return Ok(Followup::Done),
            };
            *auth_attempts += 1;
            if *auth_attempts > 2 {
                return Ok(Followup::Done);
            }
            match authenticator.authenticate(proxy, request, &response.headers) {
                Some((name, value)) => {
                    let mut next = request.clone_head();
                    next.body = std::mem::replace(&mut request.body, RequestBody::Empty);
                    next.headers.set(&name, value);
                    Ok(Followup::Next(next))
                }
                None => Ok(Followup::Done),
            }
        }
        408 if client.config.retry_on_connection_failure => Ok(Followup::Retry408),
        _ => Ok(Followup::Done),
    }
}

/// Acquire a connection and run one exchange, retrying across routes while
/// the retry policy allows.
async fn send_over_network(
    client: &HttpClient,
    request: &mut Request,
    cancel: &Arc<CancelHandle>,
) -> HttpResult<Response> {
    let address = client.address_for(request);
    let mut planner = RoutePlanner::new(
        address.clone(),
        client.resolver.clone(),
        client.events.clone(),
    );
    let mut last_error: Option<HttpError> = None;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(HttpError::Canceled);
        }
        attempts += 1;
        if attempts > 20 {
            return Err(last_error.unwrap_or_else(|| {
                HttpError::Protocol("too many connection attempts".into())
            }));
        }
        let plan = match planner.plan(&client.pool)? {
            Some(p) => p,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    HttpError::Connect {
                        addr: format!("{}:{}", address.host, address.port),
                        source: io::Error::new(io::ErrorKind::NotFound, "no route"),
                    }
                }))
            }
        };

        let conn = match plan {
            Plan::Reused(conn) => {
                tracing::trace!(id = conn.id(), "reusing pooled connection");
                client.events.connection_acquired(conn.id());
                conn
            }
            Plan::Connect(connect_plan) => {
                let permit = client.pool.acquire_connect_permit(&address).await;
                // While we waited on the permit another call may have put a
                // shareable connection into the pool.
                if let Some(conn) = client.pool.get(&address) {
                    drop(permit);
                    planner.defer(connect_plan);
                    client.events.connection_acquired(conn.id());
                    conn
                } else {
                    let established = with_cancel(
                        cancel,
                        establish(client, &address, connect_plan, &mut planner),
                    )
                    .await;
                    match established {
                        Ok(conn) => {
                            // Pool before releasing the permit so herd
                            // waiters coalesce instead of dialing again.
                            client.pool.put(conn.clone());
                            drop(permit);
                            client.events.connection_acquired(conn.id());
                            conn
                        }
                        Err(e) => {
                            if e.retryable_on_new_route()
                                && client.config.retry_on_connection_failure
                                && planner.has_more()
                            {
                                last_error = Some(e);
                                continue;
                            }
                            return Err(e);
                        }
                    }
                }
            }
        };

        match run_exchange(client, conn, request, cancel).await {
            Ok(response) => return Ok(response),
            Err(e) => {
                let retryable = e.retryable_on_new_route()
                    && request.body.is_replayable()
                    && client.config.retry_on_connection_failure
                    && planner.has_more();
                if retryable {
                    tracing::debug!(error = %e, "retrying on another route");
                    last_error = Some(e);
                    continue;
                }
                return Err(e);
            }
        }
    }
}

/// TCP + TLS for a fresh plan, optionally racing a second plan with a
/// 250 ms head start for the first. The losing plan stays available as a
/// deferred attempt.
async fn establish(
    client: &HttpClient,
    address: &Address,
    plan: ConnectPlan,
    planner: &mut RoutePlanner,
) -> HttpResult<Arc<Connection>> {
    let second = planner.next_connect().ok().flatten();
    match second {
        None => match connect_route(client, address, &plan).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                planner.note_failure(&plan);
                Err(e)
            }
        },
        Some(alternate) => {
            // The raced futures own copies of the plans; the originals stay
            // free for the planner bookkeeping in the handlers.
            let primary = plan.clone();
            let fallback = alternate.clone();
            tokio::select! {
                first = async { connect_route(client, address, &primary).await } => match first {
                    Ok(conn) => {
                        planner.defer(alternate);
                        Ok(conn)
                    }
                    Err(e) => {
                        planner.note_failure(&plan);
                        tracing::debug!(error = %e, "first connect failed, trying alternate");
                        match connect_route(client, address, &alternate).await {
                            Ok(conn) => Ok(conn),
                            Err(e2) => {
                                planner.note_failure(&alternate);
                                Err(e2)
                            }
                        }
                    }
                },
                second = async {
                    tokio::time::sleep(CONNECT_RACE_DELAY).await;
                    connect_route(client, address, &fallback).await
                } => match second {
                    Ok(conn) => {
                        planner.defer(plan);
                        Ok(conn)
                    }
                    Err(e) => {
                        planner.note_failure(&alternate);
                        match connect_route(client, address, &plan).await {
                            Ok(conn) => Ok(conn),
                            Err(e2) => {
                                planner.note_failure(&plan);
                                tracing::debug!(error = %e, "alternate connect also failed");
                                Err(e2)
                            }
                        }
                    }
                },
            }
        }
    }
}

/// One TCP connect plus TLS handshake; wraps the result into a pooled
/// Connection (H2 connections start their reader immediately).
async fn connect_route(
    client: &HttpClient,
    address: &Address,
    plan: &ConnectPlan,
) -> HttpResult<Arc<Connection>> {
    let events = &client.events;
    let addr = plan.route.socket_addr;
    events.connect_start(addr);
    let tcp = connect_tcp(addr, client.config.connect_timeout)
        .await
        .map_err(|e| HttpError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
    events.connect_end(addr);

    let (stream, alpn) = if address.is_secure() {
        events.secure_connect_start();
        let alpn_protocols: Vec<Vec<u8>> = address
            .protocols
            .iter()
            .map(|p| p.as_alpn().to_vec())
            .collect();
        let handshake = client.tls.handshake(tcp, &address.host, &alpn_protocols);
        let result = if client.config.connect_timeout.is_zero() {
            handshake.await
        } else {
            timeout(client.config.connect_timeout, handshake)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))
                .and_then(|r| r)
        };
        let tls = result.map_err(|e| HttpError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        let alpn_str = tls.alpn.as_deref().map(|p| String::from_utf8_lossy(p).to_string());
        events.secure_connect_end(alpn_str.as_deref());
        (tls.stream, tls.alpn)
    } else {
        (HttpStream::Plain(tcp), None)
    };

    let is_h2 = match (&alpn, address.is_secure()) {
        (Some(p), _) => p.as_slice() == b"h2",
        // Cleartext prior knowledge only when h2 is the sole protocol.
        (None, false) => address.protocols == [Protocol::H2],
        (None, true) => false,
    };

    let conn = if is_h2 {
        let h2 = H2Connection::start(
            stream,
            client.config.ping_interval,
            client.config.settings_timeout,
        )
        .await
        .map_err(|e| HttpError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
        Connection::new_h2(address.clone(), plan.route.clone(), h2)
    } else {
        Connection::new_h1(address.clone(), plan.route.clone(), stream)
    };
    tracing::debug!(id = conn.id(), protocol = ?conn.protocol(), addr = %addr, "connection established");
    Ok(Arc::new(conn))
}

async fn run_exchange(
    client: &HttpClient,
    conn: Arc<Connection>,
    request: &mut Request,
    cancel: &Arc<CancelHandle>,
) -> HttpResult<Response> {
    match conn.protocol() {
        ConnProtocol::H1 => run_h1_exchange(client, conn, request, cancel).await,
        ConnProtocol::H2 => run_h2_exchange(client, conn, request, cancel).await,
    }
}

// ---------------------------------------------------------------------------
// HTTP/1.1

async fn run_h1_exchange(
    client: &HttpClient,
    conn: Arc<Connection>,
    request: &mut Request,
    cancel: &Arc<CancelHandle>,
) -> HttpResult<Response> {
    let events = client.events.clone();
    let stream = match conn.take_h1_stream() {
        Some(s) => s,
        None => {
            // Lost a race for the exclusive exchange; behave like a
            // refused connection so the driver picks another plan.
            client.pool.release(&conn);
            return Err(HttpError::Connect {
                addr: conn.address().host.clone(),
                source: io::Error::new(io::ErrorKind::WouldBlock, "connection busy"),
            });
        }
    };
    let mut exchange = Http1Exchange::new(
        stream,
        client.config.read_timeout,
        client.config.write_timeout,
    );

    let sent = with_cancel(cancel, async {
        exchange
            .send_request(request, &*events)
            .await
            .map_err(HttpError::from)
    })
    .await;
    if let Err(e) = sent {
        conn.mark_not_reusable();
        client.pool.evict(&conn);
        return Err(e);
    }

    events.response_headers_start();
    let head = loop {
        let head = with_cancel(cancel, async {
            exchange.read_response_head().await.map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => HttpError::Protocol(e.to_string()),
                _ => HttpError::from(e),
            })
        })
        .await;
        match head {
            Ok(h) if (100..200).contains(&h.status) && h.status != 101 => {
                // Interim response (100 Continue, 103 Early Hints); the
                // definitive head follows on the same connection.
                exchange.reset_interim();
                continue;
            }
            Ok(h) => break h,
            Err(e) => {
                conn.mark_not_reusable();
                client.pool.evict(&conn);
                return Err(e);
            }
        }
    };
    events.response_headers_end(head.status);

    // 101 Switching Protocols: hand the raw transport to the caller.
    if head.status == 101 {
        if !(request.is_upgrade() && head.headers.has_token("Connection", "upgrade")) {
            conn.mark_not_reusable();
            client.pool.evict(&conn);
            return Err(HttpError::Protocol(
                "unexpected 101 without a matching upgrade".into(),
            ));
        }
        conn.mark_not_reusable();
        client.pool.evict(&conn);
        events.socket_sink_start();
        events.socket_source_start();
        let (stream, leftover) = exchange.into_upgrade();
        return Ok(Response {
            status: head.status,
            reason: head.reason,
            protocol: head.version,
            headers: head.headers,
            body: Body::empty(),
            socket: Some(UpgradedStream::new(stream, leftover)),
        });
    }

    let kind = response_body_kind(request.method == Method::Head, head.status, &head.headers);
    exchange.begin_body(kind);
    let finisher = ExchangeFinisher {
        conn: conn.clone(),
        pool: client.pool.clone(),
        events: events.clone(),
    };

    let body = match kind {
        BodyKind::None => {
            exchange.finish_no_body(finisher);
            Body::empty()
        }
        _ => {
            events.response_body_start();
            let content_length = match kind {
                BodyKind::Fixed(n) => Some(n),
                _ => None,
            };
            let content_type = head.headers.get("Content-Type").map(|s| s.to_string());
            let (tx, body) = Body::channel(content_length, content_type);
            if kind == BodyKind::UntilClose {
                conn.mark_not_reusable();
            }
            exchange.spawn_body_driver(tx, finisher, cancel.clone());
            body
        }
    };

    Ok(Response {
        status: head.status,
        reason: head.reason,
        protocol: head.version,
        headers: head.headers,
        body,
        socket: None,
    })
}

// ---------------------------------------------------------------------------
// HTTP/2

/// Hop-by-hop headers never travel on H2.
fn h2_header_excluded(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("te")
}

fn h2_request_headers(request: &Request) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::with_capacity(request.headers.len() + 4);
    headers.push((":method".into(), request.method.as_str().to_string()));
    headers.push((":scheme".into(), request.url.scheme.as_str().to_string()));
    headers.push((":authority".into(), request.url.authority()));
    headers.push((":path".into(), request.url.path_and_query.clone()));
    for (name, value) in request.headers.iter() {
        if h2_header_excluded(name) {
            continue;
        }
        headers.push((name.to_ascii_lowercase(), value.to_string()));
    }
    if let Some(ct) = request.body.content_type() {
        if !request.headers.contains("Content-Type") {
            headers.push(("content-type".into(), ct.to_string()));
        }
    }
    if let Some(len) = request.body.content_length() {
        if len > 0 && !matches!(request.body, RequestBody::Empty) {
            headers.push(("content-length".into(), len.to_string()));
        }
    }
    headers
}

/// Wait for the next stream event under the read deadline; a timeout also
/// fires a liveness probe on the connection.
async fn next_event_timed(
    handle: &mut H2StreamHandle,
    read_timeout: Duration,
) -> HttpResult<Option<StreamEvent>> {
    if read_timeout.is_zero() {
        return Ok(handle.next_event().await);
    }
    match timeout(read_timeout, handle.next_event()).await {
        Ok(event) => Ok(event),
        Err(_) => {
            handle.connection().clone().note_stream_timeout();
            Err(HttpError::Timeout(TimeoutKind::Read))
        }
    }
}

async fn run_h2_exchange(
    client: &HttpClient,
    conn: Arc<Connection>,
    request: &mut Request,
    cancel: &Arc<CancelHandle>,
) -> HttpResult<Response> {
    let events = client.events.clone();
    let h2 = match conn.h2() {
        Some(h2) => h2.clone(),
        None => return Err(HttpError::Protocol("not an HTTP/2 connection".into())),
    };

    let wire_headers = h2_request_headers(request);
    let end_stream = !request.body.is_present();

    events.request_headers_start();
    let mut handle = with_cancel(cancel, h2.clone().start_stream(wire_headers, end_stream)).await?;
    events.request_headers_end();

    // Request body. Duplex bodies keep flowing concurrently with the
    // response; everything else completes before we read headers.
    match std::mem::replace(&mut request.body, RequestBody::Empty) {
        RequestBody::Empty => {}
        RequestBody::Buffered { data, content_type } => {
            events.request_body_start();
            let sent = with_cancel(cancel, handle.send_data(&data, true)).await;
            let len = data.len() as u64;
            // Restore before error-propagation so retries can replay.
            request.body = RequestBody::Buffered { data, content_type };
            sent?;
            events.request_body_end(len);
        }
        RequestBody::Stream {
            mut source,
            len,
            content_type,
        } => {
            events.request_body_start();
            let mut written = 0u64;
            let sent: HttpResult<()> = with_cancel(cancel, async {
                while let Some(chunk) = source.next_chunk().await {
                    written += chunk.len() as u64;
                    handle.send_data(&chunk, false).await?;
                }
                handle.send_data(&[], true).await
            })
            .await;
            // The exhausted source goes back so the body stays
            // non-replayable for the retry policy.
            request.body = RequestBody::Stream {
                source,
                len,
                content_type,
            };
            sent?;
            events.request_body_end(written);
        }
        RequestBody::Duplex { mut source, content_type } => {
            events.request_body_start();
            let conn_for_body = h2.clone();
            let stream_id = handle.id();
            tokio::spawn(async move {
                while let Some(chunk) = source.next_chunk().await {
                    if conn_for_body.send_data(stream_id, &chunk, false).await.is_err() {
                        return;
                    }
                }
                let _ = conn_for_body.send_data(stream_id, &[], true).await;
            });
            // A closed placeholder keeps the body non-replayable.
            let (_closed_tx, placeholder) = crate::protocol::http::request::body_channel();
            request.body = RequestBody::Duplex {
                source: placeholder,
                content_type,
            };
        }
    }

    // Response headers; 1xx interim responses are skipped.
    events.response_headers_start();
    let (status, response_headers, headers_end_stream) = loop {
        let event = with_cancel(
            cancel,
            next_event_timed(&mut handle, client.config.read_timeout),
        )
        .await;
        let event = match event {
            Ok(e) => e,
            Err(e) => {
                handle.cancel();
                return Err(e);
            }
        };
        match event {
            Some(StreamEvent::Headers { headers, end_stream }) => {
                let mut status: Option<u16> = None;
                let mut plain = Headers::new();
                for (name, value) in headers {
                    if name == ":status" {
                        status = value.parse::<u16>().ok().filter(|s| (100..1000).contains(s));
                    } else if !name.starts_with(':') {
                        plain.add(name, value);
                    }
                }
                let status = match status {
                    Some(s) => s,
                    None => {
                        handle.cancel();
                        return Err(HttpError::Protocol("missing or malformed :status".into()));
                    }
                };
                if (100..200).contains(&status) {
                    continue;
                }
                break (status, plain, end_stream);
            }
            Some(StreamEvent::Reset { code }) => {
                return Err(HttpError::StreamReset { code });
            }
            Some(StreamEvent::GoAway) => {
                // Never processed by the peer; retryable on a fresh
                // connection.
                return Err(HttpError::StreamReset {
                    code: frame::ERROR_REFUSED_STREAM,
                });
            }
            Some(StreamEvent::Failed(reason)) => {
                return Err(HttpError::Io(io::Error::new(io::ErrorKind::BrokenPipe, reason)));
            }
            None => {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection closed before response headers",
                )));
            }
            Some(StreamEvent::Data { .. }) | Some(StreamEvent::Trailers(_)) => {
                handle.cancel();
                return Err(HttpError::Protocol("DATA before response headers".into()));
            }
        }
    };
    events.response_headers_end(status);

    let content_length = response_headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    let content_type = response_headers.get("content-type").map(|s| s.to_string());

    let body = if headers_end_stream {
        client.pool.release(&conn);
        events.connection_released(conn.id());
        Body::empty()
    } else {
        events.response_body_start();
        let (tx, body) = Body::channel(content_length, content_type);
        spawn_h2_body_forwarder(
            handle,
            tx,
            conn.clone(),
            client.pool.clone(),
            events.clone(),
            client.config.read_timeout,
            cancel.clone(),
        );
        body
    };

    Ok(Response {
        status,
        reason: None,
        protocol: HttpVersion::Http2,
        headers: response_headers,
        body,
        socket: None,
    })
}

fn spawn_h2_body_forwarder(
    mut handle: H2StreamHandle,
    tx: crate::protocol::http::response::BodyTx,
    conn: Arc<Connection>,
    pool: ConnectionPool,
    events: Arc<dyn EventListener>,
    read_timeout: Duration,
    cancel: Arc<CancelHandle>,
) {
    tokio::spawn(async move {
        let mut total = 0u64;
        let release = |pool: &ConnectionPool, conn: &Arc<Connection>| {
            pool.release(conn);
            events.connection_released(conn.id());
        };
        loop {
            let event = tokio::select! {
                _ = cancel.wait() => {
                    handle.cancel();
                    tx.error(io::Error::new(io::ErrorKind::Interrupted, "call canceled")).await;
                    release(&pool, &conn);
                    return;
                }
                e = next_event_timed(&mut handle, read_timeout) => e,
            };
            match event {
                Ok(Some(StreamEvent::Data { data, end_stream })) => {
                    total += data.len() as u64;
                    if !data.is_empty() && !tx.data(data).await {
                        handle.cancel();
                        release(&pool, &conn);
                        return;
                    }
                    if end_stream {
                        events.response_body_end(total);
                        release(&pool, &conn);
                        return;
                    }
                }
                Ok(Some(StreamEvent::Trailers(trailers))) => {
                    tx.set_trailers(Headers::from_pairs(trailers));
                    events.response_body_end(total);
                    release(&pool, &conn);
                    return;
                }
                Ok(Some(StreamEvent::Reset { code })) => {
                    tx.error(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        format!("stream reset: {}", frame::error_to_string(code)),
                    ))
                    .await;
                    release(&pool, &conn);
                    return;
                }
                Ok(Some(StreamEvent::Failed(reason))) => {
                    tx.error(io::Error::new(io::ErrorKind::BrokenPipe, reason)).await;
                    conn.mark_not_reusable();
                    release(&pool, &conn);
                    return;
                }
                Ok(Some(StreamEvent::GoAway)) | Ok(None) => {
                    tx.error(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection went away mid-body",
                    ))
                    .await;
                    release(&pool, &conn);
                    return;
                }
                Ok(Some(StreamEvent::Headers { .. })) => {
                    handle.cancel();
                    tx.error(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected headers mid-body",
                    ))
                    .await;
                    release(&pool, &conn);
                    return;
                }
                Err(e) => {
                    handle.cancel();
                    tx.error(io::Error::new(io::ErrorKind::TimedOut, e.to_string())).await;
                    release(&pool, &conn);
                    return;
                }
            }
        }
    });
}
