//! Transport layer implementations for the DoH proxy.
//!
//! The UDP transport receives queries from clients; the DoH transport
//! forwards allowed queries to the upstream HTTPS endpoint.

pub mod doh;
pub mod udp;

/// Maximum size of a DNS message read from a client. EDNS0 is not negotiated.
pub const MAX_DNS_PACKET_SIZE: usize = 512;

use std::net::SocketAddr;

use tracing::{debug, info, warn};

/// Logger for DNS query events.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryLogger;

impl QueryLogger {
    pub fn denied(&self, from: SocketAddr, names: &[String], elapsed_ms: f64) {
        for name in names {
            info!(%from, domain = %name, "query DENIED");
        }
        debug!(%from, total_ms = elapsed_ms, "deny response sent");
    }

    pub fn forwarded(&self, from: SocketAddr, names: &[String], total_ms: f64, upstream_ms: f64) {
        debug!(
            %from,
            domains = %names.join(","),
            total_ms,
            upstream_ms,
            "query FORWARDED"
        );
    }

    pub fn dropped(&self, from: SocketAddr, reason: &dyn std::fmt::Display) {
        warn!(%from, %reason, "query DROPPED");
    }
}
