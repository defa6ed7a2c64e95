/*
 * route.rs
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

//! Route planning: an `Address` groups everything that must match for two
//! calls to share a connection; the planner turns an address into an
//! ordered sequence of plans (reuse a pooled connection, resume a deferred
//! attempt, or connect a fresh proxy × IP × connection-spec combination).
//!
//! DNS is resolved lazily, once per proxy candidate, and cached for the
//! call. Failed (IP, spec) pairs are skipped on retries. Advancement order
//! on failure: next IP, then next connection spec, then next proxy.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::config::Protocol;
use crate::error::HttpError;
use crate::events::EventListener;
use crate::pool::ConnectionPool;
use crate::protocol::http::connection::Connection;
use crate::uri::Scheme;

/// Proxy candidate for a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    Direct,
    Http { host: String, port: u16 },
}

impl Proxy {
    /// Host the connect actually dials.
    fn connect_host<'a>(&'a self, origin: &'a str) -> &'a str {
        match self {
            Proxy::Direct => origin,
            Proxy::Http { host, .. } => host,
        }
    }

    fn connect_port(&self, origin: u16) -> u16 {
        match self {
            Proxy::Direct => origin,
            Proxy::Http { port, .. } => *port,
        }
    }
}

/// TLS configuration fallback step. The default transport applies the same
/// safe rustls defaults to both TLS specs; a fallback step simply retries
/// the handshake once more before the next IP is tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSpec {
    ModernTls,
    CompatibleTls,
    Cleartext,
}

/// Everything that must be equal for two calls to share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub protocols: Vec<Protocol>,
    pub proxies: Vec<Proxy>,
}

impl Address {
    pub fn connection_specs(&self) -> Vec<ConnectionSpec> {
        match self.scheme {
            Scheme::Https => vec![ConnectionSpec::ModernTls, ConnectionSpec::CompatibleTls],
            Scheme::Http => vec![ConnectionSpec::Cleartext],
        }
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

/// A concrete connect target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub proxy: Proxy,
    pub socket_addr: SocketAddr,
}

/// One attempt the driver may execute.
pub enum Plan {
    /// Pooled connection, ready immediately; TCP and TLS are no-ops.
    Reused(Arc<Connection>),
    /// A fresh or deferred connect attempt.
    Connect(ConnectPlan),
}

#[derive(Debug, Clone)]
pub struct ConnectPlan {
    pub route: Route,
    pub spec: ConnectionSpec,
    spec_index: usize,
}

/// Pluggable name resolution. Implementations may block; calls run on the
/// caller's task.
pub trait DnsResolver: Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
pub struct SystemDns;

impl DnsResolver for SystemDns {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs: Vec<IpAddr> = (host, 0u16)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {}", host),
            ));
        }
        Ok(addrs)
    }
}

/// Produces the ordered sequence of plans for one call.
pub struct RoutePlanner {
    address: Address,
    resolver: Arc<dyn DnsResolver>,
    events: Arc<dyn EventListener>,
    specs: Vec<ConnectionSpec>,
    proxy_index: usize,
    resolved: bool,
    current_ips: Vec<IpAddr>,
    spec_index: usize,
    ip_index: usize,
    failed: HashSet<(SocketAddr, usize)>,
    deferred: VecDeque<ConnectPlan>,
}

impl RoutePlanner {
    pub fn new(
        address: Address,
        resolver: Arc<dyn DnsResolver>,
        events: Arc<dyn EventListener>,
    ) -> Self {
        let specs = address.connection_specs();
        Self {
            address,
            resolver,
            events,
            specs,
            proxy_index: 0,
            resolved: false,
            current_ips: Vec::new(),
            spec_index: 0,
            ip_index: 0,
            failed: HashSet::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Next plan: pooled connection first, then a deferred attempt, then a
    /// fresh route.
    pub fn plan(&mut self, pool: &ConnectionPool) -> Result<Option<Plan>, HttpError> {
        if let Some(conn) = pool.get(&self.address) {
            return Ok(Some(Plan::Reused(conn)));
        }
        if let Some(p) = self.deferred.pop_front() {
            return Ok(Some(Plan::Connect(p)));
        }
        Ok(self.next_connect()?.map(Plan::Connect))
    }

    /// Next fresh connect attempt, resolving DNS lazily per proxy. A DNS
    /// failure advances to the next proxy; with none left it surfaces.
    pub fn next_connect(&mut self) -> Result<Option<ConnectPlan>, HttpError> {
        loop {
            if self.proxy_index >= self.proxies().len() {
                return Ok(None);
            }
            if !self.resolved {
                let proxy = self.proxies()[self.proxy_index].clone();
                let host = proxy.connect_host(&self.address.host).to_string();
                self.events.dns_start(&host);
                match self.resolver.resolve(&host) {
                    Ok(ips) => {
                        self.events.dns_end(&host, &ips);
                        self.current_ips = ips;
                        self.resolved = true;
                        self.spec_index = 0;
                        self.ip_index = 0;
                    }
                    Err(e) => {
                        tracing::debug!(host = %host, error = %e, "DNS lookup failed");
                        self.proxy_index += 1;
                        self.resolved = false;
                        if self.proxy_index >= self.proxies().len() {
                            return Err(HttpError::Dns { host, source: e });
                        }
                        continue;
                    }
                }
            }
            // IP advances fastest, then the connection spec.
            while self.spec_index < self.specs.len() {
                while self.ip_index < self.current_ips.len() {
                    let proxy = self.proxies()[self.proxy_index].clone();
                    let ip = self.current_ips[self.ip_index];
                    let port = proxy.connect_port(self.address.port);
                    let addr = SocketAddr::new(ip, port);
                    let spec_index = self.spec_index;
                    self.ip_index += 1;
                    if self.failed.contains(&(addr, spec_index)) {
                        continue;
                    }
                    return Ok(Some(ConnectPlan {
                        route: Route {
                            proxy,
                            socket_addr: addr,
                        },
                        spec: self.specs[spec_index],
                        spec_index,
                    }));
                }
                self.spec_index += 1;
                self.ip_index = 0;
            }
            self.proxy_index += 1;
            self.resolved = false;
        }
    }

    /// Record a connect failure so retries skip this (IP, spec) pair.
    pub fn note_failure(&mut self, plan: &ConnectPlan) {
        self.failed.insert((plan.route.socket_addr, plan.spec_index));
    }

    /// Keep a half-attempted plan for later (e.g. the loser of a connect
    /// race).
    pub fn defer(&mut self, plan: ConnectPlan) {
        self.deferred.push_back(plan);
    }

    /// True when another plan might still be produced.
    pub fn has_more(&self) -> bool {
        if !self.deferred.is_empty() {
            return true;
        }
        if self.proxy_index >= self.proxies().len() {
            return false;
        }
        if !self.resolved {
            return true;
        }
        // Any unfailed (spec, ip) combination at or past the cursor?
        for s in self.spec_index..self.specs.len() {
            let start = if s == self.spec_index { self.ip_index } else { 0 };
            for i in start..self.current_ips.len() {
                let proxy = &self.proxies()[self.proxy_index];
                let addr = SocketAddr::new(self.current_ips[i], proxy.connect_port(self.address.port));
                if !self.failed.contains(&(addr, s)) {
                    return true;
                }
            }
        }
        self.proxy_index + 1 < self.proxies().len()
    }

    fn proxies(&self) -> &[Proxy] {
        &self.address.proxies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventListener;

    struct FixedDns(Vec<IpAddr>);

    impl DnsResolver for FixedDns {
        fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
            if self.0.is_empty() {
                Err(io::Error::new(io::ErrorKind::NotFound, "no records"))
            } else {
                Ok(self.0.clone())
            }
        }
    }

    fn address(proxies: Vec<Proxy>) -> Address {
        Address {
            scheme: Scheme::Https,
            host: "example.com".into(),
            port: 443,
            protocols: vec![Protocol::H2, Protocol::Http11],
            proxies,
        }
    }

    fn planner(ips: Vec<IpAddr>) -> RoutePlanner {
        RoutePlanner::new(
            address(vec![Proxy::Direct]),
            Arc::new(FixedDns(ips)),
            Arc::new(NoopEventListener),
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn plans_iterate_ips_before_specs() {
        let mut p = planner(vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        let a = p.next_connect().unwrap().unwrap();
        let b = p.next_connect().unwrap().unwrap();
        let c = p.next_connect().unwrap().unwrap();
        assert_eq!(a.route.socket_addr.ip(), ip("10.0.0.1"));
        assert_eq!(a.spec, ConnectionSpec::ModernTls);
        assert_eq!(b.route.socket_addr.ip(), ip("10.0.0.2"));
        assert_eq!(b.spec, ConnectionSpec::ModernTls);
        assert_eq!(c.route.socket_addr.ip(), ip("10.0.0.1"));
        assert_eq!(c.spec, ConnectionSpec::CompatibleTls);
    }

    #[test]
    fn failed_pairs_are_skipped() {
        let mut p = planner(vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        let first = p.next_connect().unwrap().unwrap();
        p.note_failure(&first);
        // Reset the cursor as a fresh retry loop would.
        let mut retry = planner(vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        retry.failed = p.failed.clone();
        let next = retry.next_connect().unwrap().unwrap();
        assert_eq!(next.route.socket_addr.ip(), ip("10.0.0.2"));
    }

    #[test]
    fn deferred_plans_take_priority_over_fresh() {
        let mut p = planner(vec![ip("10.0.0.1"), ip("10.0.0.2")]);
        let first = p.next_connect().unwrap().unwrap();
        p.defer(first.clone());
        let pool = ConnectionPool::new(4, std::time::Duration::from_secs(300));
        match p.plan(&pool).unwrap().unwrap() {
            Plan::Connect(c) => assert_eq!(c.route.socket_addr, first.route.socket_addr),
            Plan::Reused(_) => panic!("unexpected reuse"),
        }
    }

    #[test]
    fn dns_failure_with_single_proxy_surfaces() {
        let mut p = planner(vec![]);
        match p.next_connect() {
            Err(HttpError::Dns { .. }) => {}
            other => panic!("expected DNS error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut p = planner(vec![ip("10.0.0.1")]);
        // 1 IP x 2 specs for https.
        assert!(p.next_connect().unwrap().is_some());
        assert!(p.next_connect().unwrap().is_some());
        assert!(p.next_connect().unwrap().is_none());
        assert!(!p.has_more());
    }

    #[test]
    fn cleartext_address_has_single_spec() {
        let addr = Address {
            scheme: Scheme::Http,
            host: "example.com".into(),
            port: 80,
            protocols: vec![Protocol::Http11],
            proxies: vec![Proxy::Direct],
        };
        assert_eq!(addr.connection_specs(), vec![ConnectionSpec::Cleartext]);
    }
}
