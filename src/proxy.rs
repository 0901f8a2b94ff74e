//! DoH proxy orchestration.
//!
//! Binds the UDP transport, builds the upstream client and runs the proxy
//! until shutdown.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::filter::Allowlist;
use crate::resolver::Resolver;
use crate::stats::Stats;
use crate::transport::doh::{HttpsUpstream, UpstreamError};
use crate::transport::udp::{QueryHandler, UdpTransport};

/// Configuration for the DoH proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// DoH endpoint queries are forwarded to
    pub endpoint: String,
    /// Deadline for each upstream request
    pub upstream_timeout: Option<Duration>,
    /// Cap on concurrently handled datagrams, `None` for unbounded
    pub max_in_flight: Option<usize>,
    /// How often to log statistics, `None` to disable
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    /// Reporting period for statistics; a zero interval disables reporting.
    pub fn stats_period(&self) -> Option<Duration> {
        self.stats_interval.filter(|period| !period.is_zero())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Run the DoH proxy with the given configuration and allowlist.
///
/// Serves until `shutdown` resolves. The allowlist is never modified once
/// serving starts.
pub async fn run<F>(config: ProxyConfig, allowlist: Allowlist, shutdown: F) -> Result<(), ProxyError>
where
    F: Future<Output = ()>,
{
    let upstream = HttpsUpstream::new(&config.endpoint, config.upstream_timeout)?;
    let transport = UdpTransport::bind(config.bind_addr, config.max_in_flight)
        .await
        .map_err(|source| ProxyError::Bind {
            addr: config.bind_addr,
            source,
        })?;

    let resolver = Resolver::new(allowlist);
    let local_addr = transport.local_addr().unwrap_or(config.bind_addr);
    info!(
        addr = %local_addr,
        patterns = resolver.pattern_count(),
        "DoH proxy listening"
    );
    info!(endpoint = %upstream.endpoint(), "Forwarding allowed queries");

    let stats = Arc::new(Stats::new());
    let handler = Arc::new(QueryHandler::new(resolver, upstream, stats.clone()));

    let reporter = config
        .stats_period()
        .map(|period| tokio::spawn(report_stats(stats, period)));

    transport.serve(handler, shutdown).await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    Ok(())
}

/// Log a snapshot of the counters every `period`.
async fn report_stats(stats: Arc<Stats>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let s = stats.snapshot_and_reset();
        info!(
            uptime_secs = s.uptime_secs,
            requests = s.requests,
            forwarded = s.forwarded,
            denied = s.denied,
            dropped = s.dropped,
            avg_response_ms = s.avg_response_ms,
            "stats"
        );
    }
}
