//! DNS query filtering module.
//!
//! Decides which questions of a query may be forwarded by checking each name
//! against the allowlist.

mod allowlist;

pub use allowlist::{Allowlist, AllowlistError};

use crate::dns::Question;

/// Return the names in `questions` that the allowlist does not permit.
///
/// An empty result means every question may be forwarded.
pub fn denied_names<'a>(allowlist: &Allowlist, questions: &'a [Question]) -> Vec<&'a str> {
    questions
        .iter()
        .filter(|q| !allowlist.is_allowed(&q.name))
        .map(|q| q.name.as_str())
        .collect()
}
