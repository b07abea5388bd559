//! UDP request engine: accept loop, spoof-vs-forward decision, run state.

use crate::config::RcodePolicy;
use crate::events::{Action, EventLog, LogEntry};
use crate::forward::Forwarder;
use crate::mappings::MappingTable;
use crate::wire::{self, Message, RData, ResourceRecord, FLAGS_RESPONSE, TYPE_A, TYPE_AAAA};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// TTL stamped on synthesized answers. Advice to the client cache only.
const SPOOF_TTL: u32 = 300;
const RECV_RETRY_PAUSE: Duration = Duration::from_millis(100);
/// How long `stop` waits for in-flight query handlers before giving up.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub is_running: bool,
    pub port: u16,
    pub upstream_dns: String,
    pub total_mappings: usize,
    pub requests_processed: u64,
    pub log_entries_count: usize,
    pub start_time: Option<DateTime<Utc>>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept: tokio::task::JoinHandle<()>,
}

#[derive(Clone, Copy)]
struct Snapshot {
    running: bool,
    port: u16,
    started_at: Option<DateTime<Utc>>,
}

pub struct DnsServer {
    port: u16,
    rcode_policy: RcodePolicy,
    forwarder: Forwarder,
    mappings: Arc<MappingTable>,
    events: Arc<EventLog>,
    requests_processed: AtomicU64,
    state: tokio::sync::Mutex<Option<Running>>,
    // Mirrors the run state for `status`, which must never wait on the
    // accept loop or on a start/stop in progress.
    snapshot: std::sync::Mutex<Snapshot>,
}

impl DnsServer {
    pub fn new(
        port: u16,
        upstream: SocketAddr,
        forward_timeout: Duration,
        rcode_policy: RcodePolicy,
        mappings: Arc<MappingTable>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            port,
            rcode_policy,
            forwarder: Forwarder::new(upstream, forward_timeout),
            mappings,
            events,
            requests_processed: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(None),
            snapshot: std::sync::Mutex::new(Snapshot {
                running: false,
                port,
                started_at: None,
            }),
        }
    }

    /// Bind the listening socket and begin accepting queries. Calling start
    /// on a running server is a no-op; a bind failure leaves it stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            tracing::warn!("DNS server already running");
            return Ok(());
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| StartError::Bind {
                port: self.port,
                source: e,
            })?;
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(self.port);
        let socket = Arc::new(socket);

        self.requests_processed.store(0, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let accept = tokio::spawn(Self::accept_loop(
            self.clone(),
            socket,
            cancel.clone(),
            tracker.clone(),
        ));
        *state = Some(Running {
            cancel,
            tracker,
            accept,
        });
        *self.snapshot.lock().unwrap() = Snapshot {
            running: true,
            port: local_port,
            started_at: Some(Utc::now()),
        };

        tracing::info!("DNS server started on port {}", local_port);
        tracing::info!("Upstream DNS: {}", self.forwarder.upstream());
        Ok(())
    }

    /// Signal shutdown, close the socket and wait (bounded) for in-flight
    /// query handlers. A no-op when not running.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return;
        };
        *self.snapshot.lock().unwrap() = Snapshot {
            running: false,
            port: self.port,
            started_at: None,
        };

        running.cancel.cancel();
        let _ = running.accept.await;
        running.tracker.close();
        if tokio::time::timeout(STOP_GRACE, running.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "Stop timed out with {} query handler(s) still in flight",
                running.tracker.len()
            );
        }
        tracing::info!("DNS server stopped");
    }

    /// Point-in-time snapshot of the run state.
    pub fn status(&self) -> ServerStatus {
        let snap = *self.snapshot.lock().unwrap();
        ServerStatus {
            is_running: snap.running,
            port: snap.port,
            upstream_dns: self.forwarder.upstream().to_string(),
            total_mappings: self.mappings.len(),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            log_entries_count: self.events.len(),
            start_time: snap.started_at,
        }
    }

    async fn accept_loop(
        server: Arc<Self>,
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) {
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                res = socket.recv_from(&mut buf) => match res {
                    Ok((size, peer)) => {
                        let query = buf[..size].to_vec();
                        let server = server.clone();
                        let socket = socket.clone();
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            server.handle_query(socket, peer, query, cancel).await;
                        });
                    }
                    Err(e) => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tracing::error!("Error receiving DNS request: {}", e);
                        tokio::time::sleep(RECV_RETRY_PAUSE).await;
                    }
                }
            }
        }
    }

    async fn handle_query(
        &self,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        data: Vec<u8>,
        cancel: CancellationToken,
    ) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Received DNS request from {}", peer);
        self.events.record(
            LogEntry::new("debug", format!("Received DNS request from {}", peer))
                .action(Action::Received)
                .client(peer),
        );

        let request = match wire::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                // No reply for malformed input; the client will time out.
                tracing::debug!("Dropping malformed query from {}: {}", peer, e);
                return;
            }
        };

        let mut flags = FLAGS_RESPONSE;
        let mut answers: Vec<ResourceRecord> = Vec::new();

        for question in &request.questions {
            let qtype_label = query_type_label(question.qtype);
            let mapping = self.mappings.get(&question.name);

            match mapping {
                Some(m) if m.enabled => {
                    if let Some(rdata) = spoofed_rdata(question.qtype, m.address) {
                        answers.push(ResourceRecord {
                            name: question.name.clone(),
                            rtype: question.qtype,
                            rclass: question.qclass,
                            ttl: SPOOF_TTL,
                            rdata,
                        });
                        tracing::info!("Spoofed DNS: {} -> {}", question.name, m.address);
                        self.events.record(
                            LogEntry::new(
                                "info",
                                format!("Spoofed {} -> {}", question.name, m.address),
                            )
                            .action(Action::Spoofed)
                            .domain(&question.name)
                            .address(m.address)
                            .client(peer)
                            .query_type(qtype_label),
                        );
                        continue;
                    }
                    // Wrong address family for the query type; treat like an
                    // unmapped name.
                    self.forward_question(&data, question, peer, &mut answers, &mut flags)
                        .await;
                }
                _ => {
                    self.forward_question(&data, question, peer, &mut answers, &mut flags)
                        .await;
                }
            }
        }

        let response = Message {
            id: request.id,
            flags,
            questions: request.questions,
            answers,
            authority_count: 0,
            additional_count: 0,
        };
        let bytes = wire::encode(&response);
        if let Err(e) = socket.send_to(&bytes, peer).await {
            // A stop that raced this handler closed the socket; drop silently.
            if !cancel.is_cancelled() {
                tracing::debug!("Failed to send response to {}: {}", peer, e);
            }
        }
    }

    /// Relay the original raw query and splice the upstream's answers into
    /// the composed response. On failure the question is left unanswered;
    /// the rest of the response still goes out.
    async fn forward_question(
        &self,
        raw_query: &[u8],
        question: &wire::Question,
        peer: SocketAddr,
        answers: &mut Vec<ResourceRecord>,
        flags: &mut u16,
    ) {
        let qtype_label = query_type_label(question.qtype);
        match self.forwarder.forward(raw_query).await {
            Ok(raw_reply) => match wire::decode(&raw_reply) {
                Ok(reply) => {
                    if self.rcode_policy == RcodePolicy::Upstream {
                        *flags = FLAGS_RESPONSE | reply.rcode();
                    }
                    answers.extend(reply.answers);
                    tracing::debug!("Forwarded DNS: {}", question.name);
                    self.events.record(
                        LogEntry::new("debug", format!("Forwarded {}", question.name))
                            .action(Action::Forwarded)
                            .domain(&question.name)
                            .client(peer)
                            .query_type(qtype_label),
                    );
                }
                Err(e) => {
                    tracing::warn!("Unparseable upstream reply for {}: {}", question.name, e);
                    self.events.record(
                        LogEntry::new(
                            "error",
                            format!("Unparseable upstream reply for {}: {}", question.name, e),
                        )
                        .action(Action::Error)
                        .domain(&question.name)
                        .client(peer)
                        .query_type(qtype_label),
                    );
                }
            },
            Err(e) => {
                tracing::warn!("Forwarding {} failed: {}", question.name, e);
                self.events.record(
                    LogEntry::new("error", format!("Forwarding {} failed: {}", question.name, e))
                        .action(Action::Error)
                        .domain(&question.name)
                        .client(peer)
                        .query_type(qtype_label),
                );
            }
        }
    }
}

/// An override only answers a query whose type matches its address family;
/// anything else falls through to forwarding.
fn spoofed_rdata(qtype: u16, addr: IpAddr) -> Option<RData> {
    match (qtype, addr) {
        (TYPE_A, IpAddr::V4(v4)) => Some(RData::A(v4)),
        (TYPE_AAAA, IpAddr::V6(v6)) => Some(RData::Raw(v6.octets().to_vec())),
        _ => None,
    }
}

fn query_type_label(qtype: u16) -> String {
    match qtype {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        6 => "SOA".to_string(),
        12 => "PTR".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        33 => "SRV".to_string(),
        255 => "ANY".to_string(),
        other => format!("TYPE{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Question, CLASS_IN};
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    const CLIENT_WAIT: Duration = Duration::from_secs(3);

    fn server_with(
        upstream: SocketAddr,
        forward_timeout: Duration,
    ) -> (Arc<DnsServer>, Arc<MappingTable>, Arc<EventLog>) {
        let mappings = Arc::new(MappingTable::new());
        let events = Arc::new(EventLog::new());
        let server = Arc::new(DnsServer::new(
            0,
            upstream,
            forward_timeout,
            RcodePolicy::Fixed,
            mappings.clone(),
            events.clone(),
        ));
        (server, mappings, events)
    }

    fn a_query(id: u16, name: &str) -> Vec<u8> {
        wire::encode(&Message {
            id,
            flags: 0x0100,
            questions: vec![Question {
                name: name.to_string(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            }],
            ..Default::default()
        })
    }

    async fn exchange(port: u16, query: &[u8]) -> Message {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(query, ("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4096];
        let (n, _) = timeout(CLIENT_WAIT, client.recv_from(&mut buf))
            .await
            .expect("no reply from server")
            .unwrap();
        wire::decode(&buf[..n]).unwrap()
    }

    /// A fake resolver that answers every A query with the given address.
    async fn scripted_upstream(addr4: Ipv4Addr, ttl: u32) -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let Ok(query) = wire::decode(&buf[..n]) else {
                    continue;
                };
                let answers = query
                    .questions
                    .iter()
                    .map(|q| ResourceRecord {
                        name: q.name.clone(),
                        rtype: TYPE_A,
                        rclass: CLASS_IN,
                        ttl,
                        rdata: RData::A(addr4),
                    })
                    .collect();
                let reply = Message {
                    id: query.id,
                    flags: FLAGS_RESPONSE,
                    questions: query.questions,
                    answers,
                    ..Default::default()
                };
                let _ = sock.send_to(&wire::encode(&reply), peer).await;
            }
        });
        addr
    }

    fn unreachable_upstream() -> SocketAddr {
        // Reserved for documentation, nothing listens there.
        "192.0.2.1:53".parse().unwrap()
    }

    #[tokio::test]
    async fn spoofs_enabled_mapping_for_a_query() {
        let (server, mappings, events) =
            server_with(unreachable_upstream(), Duration::from_millis(100));
        mappings.upsert("blocked.test", "127.0.0.1").unwrap();
        server.start().await.unwrap();
        let port = server.status().port;

        let reply = exchange(port, &a_query(0x4242, "blocked.test")).await;
        assert_eq!(reply.id, 0x4242);
        assert_eq!(reply.flags, FLAGS_RESPONSE);
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].ttl, SPOOF_TTL);
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::LOCALHOST));

        let stats = events.stats();
        assert_eq!(stats.spoofed_count, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn spoof_lookup_ignores_query_case() {
        let (server, mappings, _) =
            server_with(unreachable_upstream(), Duration::from_millis(100));
        mappings.upsert("Blocked.Test", "10.1.2.3").unwrap();
        server.start().await.unwrap();

        let reply = exchange(server.status().port, &a_query(1, "BLOCKED.TEST")).await;
        assert_eq!(
            reply.answers[0].rdata,
            RData::A(Ipv4Addr::new(10, 1, 2, 3))
        );
        server.stop().await;
    }

    #[tokio::test]
    async fn forwards_unmapped_query_and_relays_answers() {
        let upstream = scripted_upstream(Ipv4Addr::new(93, 184, 216, 34), 1234).await;
        let (server, _, events) = server_with(upstream, Duration::from_secs(2));
        server.start().await.unwrap();

        let reply = exchange(server.status().port, &a_query(7, "example.org")).await;
        assert_eq!(reply.answers.len(), 1);
        assert_eq!(reply.answers[0].name, "example.org");
        assert_eq!(reply.answers[0].ttl, 1234);
        assert_eq!(
            reply.answers[0].rdata,
            RData::A(Ipv4Addr::new(93, 184, 216, 34))
        );
        assert_eq!(events.stats().forwarded_count, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn disabled_mapping_is_forwarded_not_spoofed() {
        let upstream = scripted_upstream(Ipv4Addr::new(9, 9, 9, 9), 60).await;
        let (server, mappings, _) = server_with(upstream, Duration::from_secs(2));
        mappings.upsert("blocked.test", "127.0.0.1").unwrap();
        mappings.set_enabled("blocked.test", false);
        server.start().await.unwrap();

        let reply = exchange(server.status().port, &a_query(3, "blocked.test")).await;
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::new(9, 9, 9, 9)));
        server.stop().await;
    }

    #[tokio::test]
    async fn unreachable_upstream_leaves_question_unanswered() {
        let (server, _, events) =
            server_with(unreachable_upstream(), Duration::from_millis(100));
        server.start().await.unwrap();

        let reply = exchange(server.status().port, &a_query(5, "example.org")).await;
        assert_eq!(reply.flags, FLAGS_RESPONSE);
        assert!(reply.answers.is_empty());
        assert_eq!(reply.questions.len(), 1);
        assert!(events.stats().error_count >= 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn ipv6_mapping_does_not_answer_a_query() {
        let upstream = scripted_upstream(Ipv4Addr::new(8, 8, 4, 4), 60).await;
        let (server, mappings, _) = server_with(upstream, Duration::from_secs(2));
        mappings.upsert("six.test", "2001:db8::1").unwrap();
        server.start().await.unwrap();

        // The A query cannot be satisfied by the v6 override, so it goes
        // upstream instead.
        let reply = exchange(server.status().port, &a_query(11, "six.test")).await;
        assert_eq!(reply.answers[0].rdata, RData::A(Ipv4Addr::new(8, 8, 4, 4)));
        server.stop().await;
    }

    #[tokio::test]
    async fn upstream_policy_propagates_nxdomain() {
        // A resolver that answers everything with NXDOMAIN and no records.
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let Ok(query) = wire::decode(&buf[..n]) else {
                    continue;
                };
                let reply = Message {
                    id: query.id,
                    flags: FLAGS_RESPONSE | 3,
                    questions: query.questions,
                    ..Default::default()
                };
                let _ = sock.send_to(&wire::encode(&reply), peer).await;
            }
        });

        let mappings = Arc::new(MappingTable::new());
        let events = Arc::new(EventLog::new());
        let server = Arc::new(DnsServer::new(
            0,
            upstream,
            Duration::from_secs(2),
            RcodePolicy::Upstream,
            mappings,
            events,
        ));
        server.start().await.unwrap();

        let reply = exchange(server.status().port, &a_query(9, "missing.example")).await;
        assert_eq!(reply.rcode(), 3);
        server.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_counter_resets_on_restart() {
        let (server, mappings, _) =
            server_with(unreachable_upstream(), Duration::from_millis(100));
        mappings.upsert("blocked.test", "127.0.0.1").unwrap();

        server.start().await.unwrap();
        server.start().await.unwrap(); // no-op
        let port = server.status().port;
        assert_ne!(port, 0);

        exchange(port, &a_query(1, "blocked.test")).await;
        assert_eq!(server.status().requests_processed, 1);

        server.stop().await;
        let status = server.status();
        assert!(!status.is_running);
        assert!(status.start_time.is_none());
        server.stop().await; // no-op

        server.start().await.unwrap();
        assert_eq!(server.status().requests_processed, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_fails_start_and_stays_stopped() {
        let holder = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mappings = Arc::new(MappingTable::new());
        let events = Arc::new(EventLog::new());
        let server = Arc::new(DnsServer::new(
            port,
            unreachable_upstream(),
            Duration::from_millis(100),
            RcodePolicy::Fixed,
            mappings,
            events,
        ));

        assert!(matches!(
            server.start().await,
            Err(StartError::Bind { .. })
        ));
        assert!(!server.status().is_running);
    }

    #[tokio::test]
    async fn malformed_query_gets_no_reply() {
        let (server, _, _) = server_with(unreachable_upstream(), Duration::from_millis(100));
        server.start().await.unwrap();
        let port = server.status().port;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&[0xFF; 5], ("127.0.0.1", port))
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        let res = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
        assert!(res.is_err(), "malformed input must be dropped silently");
        server.stop().await;
    }
}
