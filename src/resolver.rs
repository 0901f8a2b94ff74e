//! DNS query resolution logic.
//!
//! Handles the decision half of the query pipeline:
//! 1. Decode the datagram
//! 2. Filter every question through the allowlist
//! 3. Decide whether to forward the raw query or answer with a deny response
//!
//! Transports handle the actual I/O, resolver handles decisions.

use crate::dns::{DnsError, Message};
use crate::filter::{Allowlist, denied_names};

/// Action to take for a DNS query.
#[derive(Debug)]
pub enum QueryAction {
    /// At least one name is not allowed, send this response back immediately.
    Deny {
        response: Vec<u8>,
        denied: Vec<String>,
    },
    /// Every name is allowed, forward the raw query upstream.
    Forward { domains: Vec<String> },
}

/// Resolver handles DNS query processing decisions.
///
/// Shared read-only between all in-flight queries.
pub struct Resolver {
    allowlist: Allowlist,
}

impl Resolver {
    /// Create a new resolver with the given allowlist.
    pub fn new(allowlist: Allowlist) -> Self {
        Self { allowlist }
    }

    /// Process a raw DNS query and decide what action to take.
    ///
    /// A single disallowed name denies the whole query, and the deny response
    /// echoes every original question.
    pub fn process_query(&self, query: &[u8]) -> Result<QueryAction, DnsError> {
        let message = Message::decode(query)?;
        let denied = denied_names(&self.allowlist, &message.questions);

        if denied.is_empty() {
            return Ok(QueryAction::Forward {
                domains: message.questions.into_iter().map(|q| q.name).collect(),
            });
        }

        let denied = denied.into_iter().map(str::to_string).collect();
        let response = message.deny_response()?;

        Ok(QueryAction::Deny { response, denied })
    }

    /// Returns the number of allowlist patterns.
    pub fn pattern_count(&self) -> usize {
        self.allowlist.len()
    }
}
