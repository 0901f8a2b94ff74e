//! UDP transport for DNS queries.
//!
//! A single receive loop owns the read side of the socket. Every datagram is
//! handed to its own task, which decodes and filters the query, then either
//! answers with a deny response or forwards it over DoH and relays the answer.
//! Each datagram gets exactly zero or one reply.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::resolver::{QueryAction, Resolver};
use crate::stats::Stats;

use super::doh::DohClient;
use super::{MAX_DNS_PACKET_SIZE, QueryLogger};

/// What happened to a single datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The upstream answer was relayed to the client.
    Forwarded,
    /// A deny response was sent to the client.
    Denied,
    /// Nothing was sent; the client will time out.
    Dropped,
}

/// Per-datagram query pipeline, shared by all handling tasks.
pub struct QueryHandler<C> {
    resolver: Resolver,
    upstream: C,
    stats: Arc<Stats>,
    logger: QueryLogger,
}

impl<C: DohClient> QueryHandler<C> {
    pub fn new(resolver: Resolver, upstream: C, stats: Arc<Stats>) -> Self {
        Self {
            resolver,
            upstream,
            stats,
            logger: QueryLogger,
        }
    }

    /// Run one datagram through decode, filter, forward or deny, and reply.
    ///
    /// Errors never escape: they are logged and the datagram is dropped.
    pub async fn handle_datagram(
        &self,
        socket: &UdpSocket,
        src: SocketAddr,
        query: &[u8],
    ) -> Outcome {
        let start_time = Instant::now();
        let outcome = self.respond(socket, src, query, start_time).await;
        let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Outcome::Forwarded => self.stats.record_forwarded(elapsed_ms),
            Outcome::Denied => self.stats.record_denied(elapsed_ms),
            Outcome::Dropped => self.stats.record_dropped(elapsed_ms),
        }

        outcome
    }

    async fn respond(
        &self,
        socket: &UdpSocket,
        src: SocketAddr,
        query: &[u8],
        start_time: Instant,
    ) -> Outcome {
        let action = match self.resolver.process_query(query) {
            Ok(action) => action,
            Err(e) => {
                self.logger
                    .dropped(src, &format_args!("could not read request: {e}"));
                return Outcome::Dropped;
            }
        };

        match action {
            QueryAction::Deny { response, denied } => {
                if let Err(e) = socket.send_to(&response, src).await {
                    self.logger
                        .dropped(src, &format_args!("could not send deny response: {e}"));
                    return Outcome::Dropped;
                }
                let elapsed = start_time.elapsed().as_secs_f64() * 1000.0;
                self.logger.denied(src, &denied, elapsed);

                Outcome::Denied
            }
            QueryAction::Forward { domains } => {
                let upstream_start = Instant::now();
                let response = match self.upstream.query(query).await {
                    Ok(r) => r,
                    Err(e) => {
                        self.logger.dropped(src, &e);
                        return Outcome::Dropped;
                    }
                };
                let upstream_ms = upstream_start.elapsed().as_secs_f64() * 1000.0;

                if let Err(e) = socket.send_to(&response, src).await {
                    self.logger.dropped(
                        src,
                        &format_args!("could not write to udp connection: {e}"),
                    );
                    return Outcome::Dropped;
                }
                let total_ms = start_time.elapsed().as_secs_f64() * 1000.0;
                self.logger.forwarded(src, &domains, total_ms, upstream_ms);

                Outcome::Forwarded
            }
        }
    }
}

/// UDP transport for the DoH proxy.
///
/// Binds to a local address and spawns a handling task per datagram.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    in_flight: Option<Arc<Semaphore>>,
}

impl UdpTransport {
    /// Bind the listening socket.
    ///
    /// `max_in_flight` caps concurrently handled datagrams; `None` leaves the
    /// number of handling tasks unbounded.
    pub async fn bind(addr: SocketAddr, max_in_flight: Option<usize>) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let in_flight = max_in_flight
            .filter(|&n| n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));

        Ok(Self { socket, in_flight })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until `shutdown` resolves.
    ///
    /// Read errors are logged and the loop keeps going. When the in-flight
    /// cap is reached the loop waits for a slot before reading again.
    /// Tasks already spawned run to completion after shutdown.
    pub async fn serve<C, F>(self, handler: Arc<QueryHandler<C>>, shutdown: F)
    where
        C: DohClient + 'static,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];

        loop {
            let permit = match &self.in_flight {
                Some(semaphore) => tokio::select! {
                    _ = &mut shutdown => break,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let (len, src) = tokio::select! {
                _ = &mut shutdown => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "could not read");
                        continue;
                    }
                },
            };

            let query = buf[..len].to_vec();
            let socket = self.socket.clone();
            let handler = handler.clone();

            tokio::spawn(async move {
                handler.handle_datagram(&socket, src, &query).await;
                drop(permit);
            });
        }

        info!("UDP receive loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::build_query;
    use crate::dns::{FLAG_RESPONSE, HEADER_LEN, Message};
    use crate::filter::Allowlist;
    use crate::transport::doh::UpstreamError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    /// Upstream that records queries and replies with a fixed answer.
    struct FakeUpstream {
        answer: Option<Vec<u8>>,
        seen: Mutex<Vec<Vec<u8>>>,
        calls: AtomicUsize,
    }

    impl FakeUpstream {
        fn answering(answer: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(answer),
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                seen: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl DohClient for FakeUpstream {
        async fn query(&self, raw: &[u8]) -> Result<Vec<u8>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(raw.to_vec());
            self.answer.clone().ok_or(UpstreamError::Timeout)
        }
    }

    fn handler(upstream: Arc<FakeUpstream>) -> QueryHandler<Arc<FakeUpstream>> {
        let resolver = Resolver::new(Allowlist::builtin().unwrap());
        QueryHandler::new(resolver, upstream, Arc::new(Stats::new()))
    }

    async fn socket_pair() -> (UdpSocket, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (server, client)
    }

    async fn recv(client: &UdpSocket) -> Option<Vec<u8>> {
        let mut buf = [0u8; 4096];
        match tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await {
            Ok(Ok(n)) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn allowed_query_is_forwarded_verbatim() {
        let answer = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 1, 0, 0, 0, 0, 0xAA, 0xBB];
        let upstream = FakeUpstream::answering(answer.clone());
        let handler = handler(upstream.clone());
        let (server, client) = socket_pair().await;
        let query = build_query(0x1234, &[("www.adobe.com", 1, 1)]);

        let outcome = handler
            .handle_datagram(&server, client.local_addr().unwrap(), &query)
            .await;

        assert_eq!(outcome, Outcome::Forwarded);
        assert_eq!(recv(&client).await, Some(answer));
        assert_eq!(*upstream.seen.lock().unwrap(), vec![query]);
    }

    #[tokio::test]
    async fn disallowed_query_gets_deny_response() {
        let upstream = FakeUpstream::answering(vec![0xFF]);
        let handler = handler(upstream.clone());
        let (server, client) = socket_pair().await;
        let query = build_query(0xABCD, &[("evil.example.com", 1, 1)]);

        let outcome = handler
            .handle_datagram(&server, client.local_addr().unwrap(), &query)
            .await;

        assert_eq!(outcome, Outcome::Denied);
        let response = recv(&client).await.unwrap();
        assert_eq!(&response[..HEADER_LEN], &[0xAB, 0xCD, 0x80, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&response[HEADER_LEN..], &query[HEADER_LEN..]);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mixed_query_is_denied_as_a_whole() {
        let upstream = FakeUpstream::answering(vec![0xFF]);
        let handler = handler(upstream.clone());
        let (server, client) = socket_pair().await;
        let query = build_query(7, &[("www.adobe.com", 1, 1), ("evil.example.com", 1, 1)]);

        let outcome = handler
            .handle_datagram(&server, client.local_addr().unwrap(), &query)
            .await;

        assert_eq!(outcome, Outcome::Denied);
        let response = Message::decode(&recv(&client).await.unwrap()).unwrap();
        assert_eq!(response.header.flags, FLAG_RESPONSE);
        assert_eq!(response.questions.len(), 2);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_query_gets_no_reply() {
        let upstream = FakeUpstream::answering(vec![0xFF]);
        let handler = handler(upstream.clone());
        let (server, client) = socket_pair().await;

        let outcome = handler
            .handle_datagram(&server, client.local_addr().unwrap(), &[0x00, 0x01, 0x02])
            .await;

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(recv(&client).await, None);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upstream_failure_gets_no_reply() {
        let upstream = FakeUpstream::failing();
        let handler = handler(upstream.clone());
        let (server, client) = socket_pair().await;
        let query = build_query(0x1234, &[("genuine.adobe.com", 1, 1)]);

        let outcome = handler
            .handle_datagram(&server, client.local_addr().unwrap(), &query)
            .await;

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(recv(&client).await, None);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_deny_write_is_dropped() {
        let upstream = FakeUpstream::answering(vec![0xFF]);
        let stats = Arc::new(Stats::new());
        let resolver = Resolver::new(Allowlist::builtin().unwrap());
        let handler = QueryHandler::new(resolver, upstream.clone(), stats.clone());
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // An IPv4 socket cannot send to an IPv6 address.
        let unreachable: SocketAddr = "[::1]:53".parse().unwrap();

        let outcome = handler
            .handle_datagram(
                &server,
                unreachable,
                &build_query(0xABCD, &[("evil.example.com", 1, 1)]),
            )
            .await;

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(stats.snapshot_and_reset().dropped, 1);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_forward_write_is_dropped() {
        let upstream = FakeUpstream::answering(vec![0x12, 0x34, 0x81, 0x80]);
        let stats = Arc::new(Stats::new());
        let resolver = Resolver::new(Allowlist::builtin().unwrap());
        let handler = QueryHandler::new(resolver, upstream.clone(), stats.clone());
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let unreachable: SocketAddr = "[::1]:53".parse().unwrap();

        let outcome = handler
            .handle_datagram(
                &server,
                unreachable,
                &build_query(0x1234, &[("www.adobe.com", 1, 1)]),
            )
            .await;

        assert_eq!(outcome, Outcome::Dropped);
        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.dropped, 1);
        assert_eq!(snapshot.forwarded, 0);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn outcomes_are_counted() {
        let upstream = FakeUpstream::answering(vec![0xFF]);
        let stats = Arc::new(Stats::new());
        let resolver = Resolver::new(Allowlist::builtin().unwrap());
        let handler = QueryHandler::new(resolver, upstream, stats.clone());
        let (server, client) = socket_pair().await;
        let addr = client.local_addr().unwrap();

        handler
            .handle_datagram(&server, addr, &build_query(1, &[("www.adobe.com", 1, 1)]))
            .await;
        handler
            .handle_datagram(&server, addr, &build_query(2, &[("evil.example.com", 1, 1)]))
            .await;
        handler.handle_datagram(&server, addr, &[0u8; 5]).await;

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.forwarded, 1);
        assert_eq!(snapshot.denied, 1);
        assert_eq!(snapshot.dropped, 1);
    }

    async fn start(
        max_in_flight: Option<usize>,
        upstream: Arc<FakeUpstream>,
    ) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), max_in_flight)
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handler = Arc::new(handler(upstream));
        let task = tokio::spawn(transport.serve(handler, async {
            let _ = rx.await;
        }));

        (addr, tx, task)
    }

    #[tokio::test]
    async fn serve_answers_clients() {
        let answer = vec![0x12, 0x34, 0x81, 0x80, 0, 0, 0, 0, 0, 0, 0, 0];
        let (addr, shutdown, task) = start(None, FakeUpstream::answering(answer.clone())).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        client
            .send(&build_query(0x1234, &[("www.adobe.com", 1, 1)]))
            .await
            .unwrap();
        assert_eq!(recv(&client).await, Some(answer));

        client
            .send(&build_query(0xABCD, &[("evil.example.com", 1, 1)]))
            .await
            .unwrap();
        let denied = recv(&client).await.unwrap();
        assert_eq!(&denied[..4], &[0xAB, 0xCD, 0x80, 0x00]);

        shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn serve_keeps_going_after_bad_datagram() {
        let (addr, shutdown, task) = start(Some(1), FakeUpstream::answering(vec![1, 2, 3])).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();

        client.send(&[0xDE, 0xAD]).await.unwrap();
        assert_eq!(recv(&client).await, None);

        for id in 0..3u16 {
            client
                .send(&build_query(id, &[("auth.services.adobe.com", 28, 1)]))
                .await
                .unwrap();
            assert_eq!(recv(&client).await, Some(vec![1, 2, 3]));
        }

        shutdown.send(()).unwrap();
        task.await.unwrap();
    }
}
