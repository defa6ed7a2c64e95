/*
 * pool.rs
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

//! Connection pool. Live connections are indexed by their `Address`; `get`
//! prefers an unsaturated HTTP/2 connection (fewest active streams), then
//! the most recently idle HTTP/1 connection that passes the health probe.
//! Eviction is opportunistic: every mutation sweeps connections idle past
//! the keep-alive and enforces the idle-connection cap LRU-wise. A
//! per-address semaphore caps simultaneous opening connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::protocol::http::connection::Connection;
use crate::route::Address;

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_idle: usize,
    keep_alive: Duration,
    connections: Mutex<Vec<Arc<Connection>>>,
    connect_permits: Mutex<HashMap<Address, Arc<Semaphore>>>,
    max_connects_per_address: usize,
}

impl ConnectionPool {
    pub fn new(max_idle: usize, keep_alive: Duration) -> Self {
        Self::with_connect_cap(max_idle, keep_alive, 2)
    }

    pub fn with_connect_cap(
        max_idle: usize,
        keep_alive: Duration,
        max_connects_per_address: usize,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_idle,
                keep_alive,
                connections: Mutex::new(Vec::new()),
                connect_permits: Mutex::new(HashMap::new()),
                max_connects_per_address: max_connects_per_address.max(1),
            }),
        }
    }

    /// An eligible live connection for the address, or None. H2 connections
    /// win over idle H1 connections; among H2 candidates the one with the
    /// fewest active streams is picked, so coexisting ramp-up connections
    /// drain towards one.
    pub fn get(&self, address: &Address) -> Option<Arc<Connection>> {
        let evicted;
        let found;
        {
            let mut conns = self.inner.connections.lock().unwrap();
            evicted = Self::sweep(&mut conns, self.inner.keep_alive, self.inner.max_idle);

            let mut best_h2: Option<Arc<Connection>> = None;
            let mut best_h1: Option<Arc<Connection>> = None;
            let mut dead: Vec<u64> = Vec::new();
            for conn in conns.iter() {
                if conn.address() != address {
                    continue;
                }
                if conn.is_multiplexed() {
                    if conn.is_eligible(address) {
                        let better = match &best_h2 {
                            None => true,
                            Some(b) => conn.active_streams() < b.active_streams(),
                        };
                        if better {
                            best_h2 = Some(conn.clone());
                        }
                    }
                } else if conn.active_streams() == 0 {
                    if conn.is_eligible(address) {
                        let better = match &best_h1 {
                            None => true,
                            Some(b) => conn.idle_duration() < b.idle_duration(),
                        };
                        if better {
                            best_h1 = Some(conn.clone());
                        }
                    } else if conn.is_reusable() {
                        // Probe saw a FIN or stray bytes on an idle socket.
                        dead.push(conn.id());
                    }
                }
            }
            if !dead.is_empty() {
                conns.retain(|c| !dead.contains(&c.id()));
            }
            found = best_h2.or(best_h1);
        }
        for conn in evicted {
            conn.close("idle eviction");
        }
        if let Some(conn) = &found {
            conn.touch();
        }
        found
    }

    /// Insert a newly opened connection, or return an H1 connection to idle.
    /// H2 connections should be inserted as soon as their protocol is
    /// confirmed so concurrent calls can coalesce onto them.
    pub fn put(&self, conn: Arc<Connection>) {
        let evicted;
        {
            let mut conns = self.inner.connections.lock().unwrap();
            if !conns.iter().any(|c| c.id() == conn.id()) {
                conns.push(conn.clone());
            }
            evicted = Self::sweep(&mut conns, self.inner.keep_alive, self.inner.max_idle);
        }
        conn.touch();
        for c in evicted {
            c.close("idle eviction");
        }
    }

    /// Note that a holder released the connection (exchange finished).
    pub fn release(&self, conn: &Arc<Connection>) {
        conn.touch();
        if !conn.is_reusable() {
            self.evict(conn);
        }
    }

    /// Drop a connection from the pool and close it.
    pub fn evict(&self, conn: &Arc<Connection>) {
        {
            let mut conns = self.inner.connections.lock().unwrap();
            conns.retain(|c| c.id() != conn.id());
        }
        conn.close("evicted");
    }

    /// Connections currently tracked (test hook).
    pub fn len(&self) -> usize {
        self.inner.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the right to open a connection to `address`. At most
    /// `max_connects_per_address` permits exist per address; the rest of a
    /// thundering herd waits here and then usually coalesces via `get`.
    pub async fn acquire_connect_permit(&self, address: &Address) -> OwnedSemaphorePermit {
        let sem = {
            let mut permits = self.inner.connect_permits.lock().unwrap();
            permits
                .entry(address.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.inner.max_connects_per_address)))
                .clone()
        };
        // The semaphore is never closed, so acquire cannot fail.
        sem.acquire_owned().await.expect("connect semaphore closed")
    }

    /// Remove connections idle past keep-alive, then enforce the idle cap
    /// LRU-wise. Returns what must be closed outside the lock.
    fn sweep(
        conns: &mut Vec<Arc<Connection>>,
        keep_alive: Duration,
        max_idle: usize,
    ) -> Vec<Arc<Connection>> {
        let mut evicted = Vec::new();
        conns.retain(|c| {
            let idle = c.active_streams() == 0;
            let expired = idle && c.idle_duration() > keep_alive;
            let broken = !c.is_reusable() && idle;
            if expired || broken {
                tracing::debug!(id = c.id(), "evicting idle connection");
                evicted.push(c.clone());
                false
            } else {
                true
            }
        });

        let mut idle: Vec<Arc<Connection>> = conns
            .iter()
            .filter(|c| c.active_streams() == 0)
            .cloned()
            .collect();
        if idle.len() > max_idle {
            // Oldest first.
            idle.sort_by_key(|c| std::cmp::Reverse(c.idle_duration()));
            for victim in idle.iter().take(idle.len() - max_idle) {
                evicted.push(victim.clone());
                conns.retain(|c| c.id() != victim.id());
            }
        }
        evicted
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::net::HttpStream;
    use crate::route::{Proxy, Route};
    use crate::uri::Scheme;
    use tokio::net::{TcpListener, TcpStream};

    fn test_address(port: u16) -> Address {
        Address {
            scheme: Scheme::Http,
            host: "localhost".into(),
            port,
            protocols: vec![Protocol::Http11],
            proxies: vec![Proxy::Direct],
        }
    }

    async fn h1_conn(address: &Address) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let conn = Arc::new(Connection::new_h1(
            address.clone(),
            Route {
                proxy: Proxy::Direct,
                socket_addr: addr,
            },
            HttpStream::Plain(client),
        ));
        (conn, server)
    }

    #[tokio::test]
    async fn repeated_get_returns_same_connection() {
        let pool = ConnectionPool::new(4, Duration::from_secs(300));
        let address = test_address(8080);
        let (conn, _server) = h1_conn(&address).await;
        pool.put(conn.clone());
        let a = pool.get(&address).unwrap();
        let b = pool.get(&address).unwrap();
        assert_eq!(a.id(), conn.id());
        assert_eq!(b.id(), conn.id());
    }

    #[tokio::test]
    async fn get_misses_for_other_address() {
        let pool = ConnectionPool::new(4, Duration::from_secs(300));
        let address = test_address(8080);
        let (conn, _server) = h1_conn(&address).await;
        pool.put(conn);
        assert!(pool.get(&test_address(9090)).is_none());
    }

    #[tokio::test]
    async fn idle_timeout_evicts() {
        let pool = ConnectionPool::new(4, Duration::ZERO);
        let address = test_address(8080);
        let (conn, _server) = h1_conn(&address).await;
        pool.put(conn);
        // Keep-alive of zero expires the connection on the next sweep.
        assert!(pool.get(&address).is_none());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn closed_peer_socket_is_evicted_by_probe() {
        let pool = ConnectionPool::new(4, Duration::from_secs(300));
        let address = test_address(8080);
        let (conn, server) = h1_conn(&address).await;
        pool.put(conn);
        drop(server); // peer FIN
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.get(&address).is_none());
    }

    #[tokio::test]
    async fn max_idle_enforced_lru() {
        let pool = ConnectionPool::new(1, Duration::from_secs(300));
        let address = test_address(8080);
        let (a, _sa) = h1_conn(&address).await;
        let (b, _sb) = h1_conn(&address).await;
        pool.put(a.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.put(b.clone());
        assert_eq!(pool.len(), 1);
        // The older connection was the LRU victim.
        assert!(!a.is_reusable() || pool.get(&address).map(|c| c.id()) == Some(b.id()));
    }

    #[tokio::test]
    async fn connect_permits_cap_concurrency() {
        let pool = ConnectionPool::with_connect_cap(4, Duration::from_secs(300), 1);
        let address = test_address(8080);
        let permit = pool.acquire_connect_permit(&address).await;
        let pool2 = pool.clone();
        let address2 = address.clone();
        let waiter = tokio::spawn(async move {
            let _p = pool2.acquire_connect_permit(&address2).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(permit);
        waiter.await.unwrap();
    }
}
