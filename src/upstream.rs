/// Upstream resolver pool
///
/// Rotates round-robin over the enabled resolvers, tracks per-resolver
/// health, and owns creation of the single upstream UDP socket. The
/// socket is handed to a protector callback before it enters the
/// runtime so the host can pin it to the underlying physical link and
/// keep engine traffic out of its own tunnel.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Consecutive failures within the window that degrade a resolver.
pub const DEGRADE_AFTER_FAILURES: u32 = 3;
pub const FAILURE_WINDOW: Duration = Duration::from_secs(30);
/// How long a degraded resolver rests before a probe query.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// One configured upstream resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolver {
    pub name: String,
    pub addr: SocketAddr,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded,
}

#[derive(Debug)]
struct ResolverState {
    resolver: Resolver,
    health: Health,
    consecutive_failures: u32,
    first_failure: Option<Instant>,
    last_probe: Option<Instant>,
}

impl ResolverState {
    fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            health: Health::Healthy,
            consecutive_failures: 0,
            first_failure: None,
            last_probe: None,
        }
    }

    fn probe_due(&self, now: Instant) -> bool {
        match self.last_probe {
            Some(at) => now.duration_since(at) >= PROBE_INTERVAL,
            None => true,
        }
    }
}

/// Round-robin pool over the enabled resolvers.
#[derive(Debug)]
pub struct UpstreamPool {
    entries: Vec<ResolverState>,
    cursor: usize,
}

impl UpstreamPool {
    /// Build the pool from the configured list; when no configured
    /// entry is enabled, fall back to the resolvers inherited from the
    /// underlying link.
    pub fn new(configured: Vec<Resolver>, system: Vec<SocketAddr>) -> Self {
        let mut enabled: Vec<ResolverState> = configured
            .into_iter()
            .filter(|r| r.enabled)
            .map(ResolverState::new)
            .collect();

        if enabled.is_empty() {
            enabled = system
                .into_iter()
                .enumerate()
                .map(|(i, addr)| {
                    ResolverState::new(Resolver {
                        name: format!("system-{i}"),
                        addr,
                        enabled: true,
                    })
                })
                .collect();
        }

        Self {
            entries: enabled,
            cursor: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pick the resolver for the next query.
    ///
    /// Healthy entries rotate round-robin; degraded entries are
    /// skipped until their probe interval elapses, at which point one
    /// query is let through as the health probe. With every entry
    /// degraded and no probe due, there is nothing to pick and the
    /// query is dropped like any other send failure.
    pub fn next_resolver(&mut self, now: Instant) -> Option<SocketAddr> {
        if self.entries.is_empty() {
            return None;
        }

        let len = self.entries.len();

        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if self.entries[idx].health == Health::Healthy {
                self.cursor = (idx + 1) % len;
                return Some(self.entries[idx].resolver.addr);
            }
        }

        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            if self.entries[idx].probe_due(now) {
                debug!(
                    "Probing degraded resolver {}",
                    self.entries[idx].resolver.addr
                );
                self.entries[idx].last_probe = Some(now);
                self.cursor = (idx + 1) % len;
                return Some(self.entries[idx].resolver.addr);
            }
        }

        None
    }

    /// Record a timeout or send failure against a resolver.
    pub fn record_failure(&mut self, addr: SocketAddr, now: Instant) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.resolver.addr == addr) else {
            return;
        };

        // Failures only accumulate within the window
        match entry.first_failure {
            Some(first) if now.duration_since(first) < FAILURE_WINDOW => {
                entry.consecutive_failures += 1;
            }
            _ => {
                entry.first_failure = Some(now);
                entry.consecutive_failures = 1;
            }
        }

        if entry.consecutive_failures >= DEGRADE_AFTER_FAILURES && entry.health == Health::Healthy {
            warn!(
                "Upstream resolver {} degraded after {} consecutive failures",
                addr, entry.consecutive_failures
            );
            entry.health = Health::Degraded;
            entry.last_probe = Some(now);
        }
    }

    /// Record a successful round-trip; restores health.
    pub fn record_success(&mut self, addr: SocketAddr) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.resolver.addr == addr) else {
            return;
        };

        if entry.health == Health::Degraded {
            debug!("Upstream resolver {} healthy again", addr);
        }
        entry.health = Health::Healthy;
        entry.consecutive_failures = 0;
        entry.first_failure = None;
        entry.last_probe = None;
    }

    pub fn health(&self, addr: SocketAddr) -> Option<Health> {
        self.entries
            .iter()
            .find(|e| e.resolver.addr == addr)
            .map(|e| e.health)
    }
}

/// Callback that pins the upstream socket to the underlying network
/// before it enters the runtime.
pub type SocketProtector = dyn Fn(&Socket) -> io::Result<()> + Send + Sync;

/// A protector that does nothing; for hosts where the routing table
/// already keeps engine traffic off the tunnel.
pub fn no_protection() -> std::sync::Arc<SocketProtector> {
    std::sync::Arc::new(|_| Ok(()))
}

/// Bind the upstream socket to a physical interface by name.
#[cfg(target_os = "linux")]
pub fn bind_to_device(interface: String) -> std::sync::Arc<SocketProtector> {
    std::sync::Arc::new(move |socket| socket.bind_device(Some(interface.as_bytes())))
}

/// Create the engine's single upstream UDP socket: dual-stack where
/// the host supports it, unbound port, protected from the tunnel.
pub fn bind_upstream_socket(protect: &SocketProtector) -> io::Result<tokio::net::UdpSocket> {
    match bind_socket(Domain::IPV6, "[::]:0", protect) {
        Ok(socket) => Ok(socket),
        Err(e) => {
            debug!("Dual-stack upstream socket unavailable ({e}), falling back to IPv4");
            bind_socket(Domain::IPV4, "0.0.0.0:0", protect)
        }
    }
}

fn bind_socket(
    domain: Domain,
    local: &str,
    protect: &SocketProtector,
) -> io::Result<tokio::net::UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
    }
    socket.set_nonblocking(true)?;
    protect(&socket)?;

    let local: SocketAddr = local.parse().expect("literal address");
    socket.bind(&local.into())?;

    tokio::net::UdpSocket::from_std(socket.into())
}

/// Map a resolver address onto the upstream socket's address family;
/// a dual-stack socket reaches v4 resolvers via their v6-mapped form.
pub fn socket_target(addr: SocketAddr, socket_is_v6: bool) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if socket_is_v6 => {
            SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
        }
        _ => addr,
    }
}
