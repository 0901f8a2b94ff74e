//! adns - a DNS-over-UDP to DNS-over-HTTPS proxy with a domain allowlist.
//!
//! Queries whose names all match the allowlist are forwarded to a DoH
//! endpoint; anything else is answered locally with an empty response.

pub mod dns;
pub mod filter;
pub mod proxy;
pub mod resolver;
pub mod stats;
pub mod transport;
