/// The tunnel pump
///
/// Single cooperative loop that owns the tunnel device and the
/// upstream socket for one engine run. Tunnel reads are drained in
/// bounded batches so upstream responses stay responsive; writes that
/// would block drop the frame (DNS clients retransmit).
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::blocklog::BlockLog;
use crate::dns::{self, DNS_PORT, Question};
use crate::packet::{self, PacketError, UdpDatagram};
use crate::rules::{Disposition, RuleTable};
use crate::stats::EngineStats;
use crate::tracker::{QueryRecord, QueryTracker};
use crate::tun::TunDevice;
use crate::upstream::{self, UpstreamPool};

/// Frames drained from the tunnel per wake.
pub(crate) const TUN_BATCH: usize = 32;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SEND_FAILURE_WINDOW: Duration = Duration::from_secs(5);
const SEND_FAILURE_LIMIT: u32 = 3;

// MTU 1500 plus slack; the upstream buffer matches what a resolver
// may send us over UDP with EDNS.
const TUN_BUF_SIZE: usize = 2048;
const UPSTREAM_BUF_SIZE: usize = 4096;

/// Feedback from the pump to the lifecycle. Tagged with the pump
/// generation by the sender so reports from a superseded pump are
/// discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PumpEvent {
    /// The loop is entered and the tunnel fd is being serviced.
    Entered,
    /// First successful upstream send of this pump run.
    UpstreamOk,
    /// First matched response round-trip of this pump run.
    RoundTrip,
    /// Repeated upstream send failures within the window.
    NetworkError,
    /// The tunnel fd failed; the engine must stop.
    Fatal(String),
}

pub(crate) struct PumpContext {
    pub tun: Arc<dyn TunDevice>,
    pub upstream: Arc<UdpSocket>,
    pub rules: Arc<RuleTable>,
    pub pool: UpstreamPool,
    pub block_log: Arc<Mutex<BlockLog>>,
    pub stats: Arc<EngineStats>,
    pub events: mpsc::Sender<(u64, PumpEvent)>,
    pub generation: u64,
    pub shutdown: watch::Receiver<bool>,
    pub ipv6_enabled: bool,
    pub block_logging: bool,
}

pub(crate) struct Pump {
    tun: Arc<dyn TunDevice>,
    upstream: Arc<UdpSocket>,
    rules: Arc<RuleTable>,
    pool: UpstreamPool,
    tracker: QueryTracker,
    block_log: Arc<Mutex<BlockLog>>,
    stats: Arc<EngineStats>,
    events: mpsc::Sender<(u64, PumpEvent)>,
    generation: u64,
    shutdown: watch::Receiver<bool>,
    ipv6_enabled: bool,
    block_logging: bool,
    upstream_is_v6: bool,
    send_failures: u32,
    first_send_failure: Option<Instant>,
    upstream_confirmed: bool,
    round_trip_confirmed: bool,
}

impl Pump {
    pub(crate) fn new(ctx: PumpContext) -> Pump {
        let upstream_is_v6 = ctx
            .upstream
            .local_addr()
            .map(|a| a.is_ipv6())
            .unwrap_or(false);

        Pump {
            tun: ctx.tun,
            upstream: ctx.upstream,
            rules: ctx.rules,
            pool: ctx.pool,
            tracker: QueryTracker::new(),
            block_log: ctx.block_log,
            stats: ctx.stats,
            events: ctx.events,
            generation: ctx.generation,
            shutdown: ctx.shutdown,
            ipv6_enabled: ctx.ipv6_enabled,
            block_logging: ctx.block_logging,
            upstream_is_v6,
            send_failures: 0,
            first_send_failure: None,
            upstream_confirmed: false,
            round_trip_confirmed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        self.emit(PumpEvent::Entered);

        let tun = Arc::clone(&self.tun);
        let upstream = Arc::clone(&self.upstream);
        let mut shutdown = self.shutdown.clone();

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut tun_buf = vec![0u8; TUN_BUF_SIZE];
        let mut upstream_buf = vec![0u8; UPSTREAM_BUF_SIZE];

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = sweep.tick() => {
                    self.sweep_tracker();
                }

                result = crate::tun::recv(tun.as_ref(), &mut tun_buf) => {
                    match result {
                        Ok(n) => {
                            if !self.drain_tunnel(&tun, &mut tun_buf, n) {
                                break;
                            }
                        }
                        Err(e) => {
                            self.emit(PumpEvent::Fatal(format!("tunnel read failed: {e}")));
                            break;
                        }
                    }
                }

                result = upstream.recv_from(&mut upstream_buf) => {
                    match result {
                        Ok((n, _)) => {
                            if !self.drain_upstream(&upstream, &mut upstream_buf, n) {
                                break;
                            }
                        }
                        Err(e) => {
                            // Transient; often an ICMP error bounced back
                            debug!("Upstream receive failed: {e}");
                        }
                    }
                }
            }
        }

        debug!("Pump loop exited (generation {})", self.generation);
    }

    /// Process the frame just read plus up to a batch more, without
    /// waiting.
    fn drain_tunnel(&mut self, tun: &Arc<dyn TunDevice>, buf: &mut [u8], first: usize) -> bool {
        let now = Instant::now();

        if !self.handle_tun_frame(&buf[..first], now) {
            return false;
        }

        for _ in 1..TUN_BATCH {
            match tun.try_recv(buf) {
                Ok(n) => {
                    if !self.handle_tun_frame(&buf[..n], now) {
                        return false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.emit(PumpEvent::Fatal(format!("tunnel read failed: {e}")));
                    return false;
                }
            }
        }

        true
    }

    /// Process the datagram just received plus anything else queued on
    /// the upstream socket.
    fn drain_upstream(&mut self, upstream: &Arc<UdpSocket>, buf: &mut [u8], first: usize) -> bool {
        if !self.handle_upstream_datagram(&buf[..first]) {
            return false;
        }

        loop {
            match upstream.try_recv_from(buf) {
                Ok((n, _)) => {
                    if !self.handle_upstream_datagram(&buf[..n]) {
                        return false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Upstream receive failed: {e}");
                    break;
                }
            }
        }

        true
    }

    /// Classify one outbound frame and dispatch it. Returns false on a
    /// fatal tunnel error.
    fn handle_tun_frame(&mut self, frame: &[u8], now: Instant) -> bool {
        let datagram = match packet::parse(frame, self.ipv6_enabled) {
            Ok(d) => d,
            Err(PacketError::Ipv6Disabled) => {
                self.stats.ipv6_dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(PacketError::NotUdp) => {
                self.stats.non_dns_dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Err(e) => {
                trace!("Dropping unparseable frame: {e}");
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        // The tunnel is a DNS-only sinkhole
        if datagram.dst.port() != DNS_PORT {
            self.stats.non_dns_dropped.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let question = match Question::parse(datagram.payload) {
            Ok(q) => q,
            Err(e) => {
                debug!("Dropping malformed DNS query from {}: {e}", datagram.src);
                self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        match self.rules.lookup(&question.name) {
            Disposition::Deny => self.deny(&datagram, &question),
            Disposition::Allow | Disposition::Ignore => self.forward(&datagram, &question, now),
        }
    }

    /// Answer a denied query locally with NXDOMAIN.
    fn deny(&mut self, datagram: &UdpDatagram<'_>, question: &Question) -> bool {
        trace!("Denied {} for {}", question.name, datagram.src);
        self.stats.queries_blocked.fetch_add(1, Ordering::Relaxed);
        if self.block_logging {
            self.block_log
                .lock()
                .append(&question.name, Disposition::Deny);
        }

        let payload = match question.nxdomain_response() {
            Ok(p) => p,
            Err(e) => {
                debug!("Failed to synthesize response: {e}");
                return true;
            }
        };
        let frame = match packet::build_udp_response(datagram, &payload) {
            Ok(f) => f,
            Err(e) => {
                debug!("Failed to frame response: {e}");
                return true;
            }
        };

        self.write_tun(&frame)
    }

    /// Hand an allowed query to the next upstream resolver.
    fn forward(&mut self, datagram: &UdpDatagram<'_>, question: &Question, now: Instant) -> bool {
        let Some(resolver) = self.pool.next_resolver(now) else {
            warn!("No upstream resolver available, dropping query");
            self.stats
                .upstream_send_failures
                .fetch_add(1, Ordering::Relaxed);
            self.note_send_failure(now);
            return true;
        };

        let Some(upstream_id) = self.tracker.allocate_id() else {
            debug!("Upstream id space congested, dropping query");
            self.stats
                .upstream_send_failures
                .fetch_add(1, Ordering::Relaxed);
            return true;
        };

        let mut payload = datagram.payload.to_vec();
        dns::rewrite_id(&mut payload, upstream_id);

        let target = upstream::socket_target(resolver, self.upstream_is_v6);
        match self.upstream.try_send_to(&payload, target) {
            Ok(_) => {
                self.stats.queries_forwarded.fetch_add(1, Ordering::Relaxed);
                self.send_failures = 0;
                self.first_send_failure = None;
                if !self.upstream_confirmed {
                    self.upstream_confirmed = true;
                    self.emit(PumpEvent::UpstreamOk);
                }

                let evicted = self.tracker.register(QueryRecord {
                    client_src: datagram.src,
                    client_dst: datagram.dst,
                    client_id: question.id,
                    upstream_id,
                    resolver,
                    name: question.name.clone(),
                    sent_at: now,
                });
                if let Some(old) = evicted {
                    trace!("Tracker full, evicted query for {}", old.name);
                    self.stats.tracker_evictions.fetch_add(1, Ordering::Relaxed);
                }

                if self.block_logging {
                    self.block_log
                        .lock()
                        .append(&question.name, Disposition::Allow);
                }
            }
            Err(e) => {
                debug!("Upstream send to {resolver} failed: {e}");
                self.stats
                    .upstream_send_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.pool.record_failure(resolver, now);
                self.note_send_failure(now);
            }
        }

        true
    }

    /// Relay an upstream response back through the tunnel.
    fn handle_upstream_datagram(&mut self, payload: &[u8]) -> bool {
        let Some(upstream_id) = dns::message_id(payload) else {
            self.stats.parse_failures.fetch_add(1, Ordering::Relaxed);
            return true;
        };

        let Some(record) = self.tracker.match_response(upstream_id) else {
            trace!("Discarding unmatched upstream response {upstream_id:#06x}");
            self.stats
                .unmatched_responses
                .fetch_add(1, Ordering::Relaxed);
            return true;
        };

        self.pool.record_success(record.resolver);
        if !self.round_trip_confirmed {
            self.round_trip_confirmed = true;
            self.emit(PumpEvent::RoundTrip);
        }

        let mut response = payload.to_vec();
        dns::rewrite_id(&mut response, record.client_id);

        let frame = match packet::build_udp_frame(record.client_dst, record.client_src, &response) {
            Ok(f) => f,
            Err(e) => {
                debug!("Failed to frame upstream response: {e}");
                return true;
            }
        };

        self.stats.responses_relayed.fetch_add(1, Ordering::Relaxed);
        self.write_tun(&frame)
    }

    /// Expire outstanding queries; a timeout counts against its
    /// resolver's health.
    fn sweep_tracker(&mut self) {
        let now = Instant::now();
        for record in self.tracker.sweep(now) {
            debug!("Query {} via {} timed out", record.name, record.resolver);
            self.stats.queries_timed_out.fetch_add(1, Ordering::Relaxed);
            self.pool.record_failure(record.resolver, now);
        }
    }

    /// Write one frame to the tunnel, dropping on backpressure.
    /// Returns false on a fatal device error.
    fn write_tun(&mut self, frame: &[u8]) -> bool {
        match self.tun.try_send(frame) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Tunnel write would block, dropping frame");
                self.stats.tunnel_write_drops.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.emit(PumpEvent::Fatal(format!("tunnel write failed: {e}")));
                false
            }
        }
    }

    /// Track consecutive upstream send failures within the window;
    /// enough of them mean the underlying network is gone.
    fn note_send_failure(&mut self, now: Instant) {
        match self.first_send_failure {
            Some(first) if now.duration_since(first) < SEND_FAILURE_WINDOW => {
                self.send_failures += 1;
                if self.send_failures >= SEND_FAILURE_LIMIT {
                    self.send_failures = 0;
                    self.first_send_failure = None;
                    self.emit(PumpEvent::NetworkError);
                }
            }
            _ => {
                self.first_send_failure = Some(now);
                self.send_failures = 1;
            }
        }
    }

    fn emit(&self, event: PumpEvent) {
        if self.events.try_send((self.generation, event)).is_err() {
            warn!("Engine event queue full, dropping pump event");
        }
    }
}
