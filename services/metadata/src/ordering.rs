//! Ordering guard.
//!
//! The sequencer is the only recency oracle; event timestamps are ignored
//! because of clock skew and coalesced delivery.

use crate::event::Sequencer;

/// Whether an event advances the persisted state of its identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Current,
    Stale,
}

impl Freshness {
    pub fn is_stale(self) -> bool {
        self == Freshness::Stale
    }
}

/// Decide whether `incoming` supersedes `persisted`.
///
/// Used both as the pre-check before extraction and, re-evaluated atomically
/// by each store backend, as the commit gate.
pub fn check(incoming: &Sequencer, persisted: Option<&Sequencer>) -> Freshness {
    match persisted {
        None => Freshness::Current,
        Some(persisted) if incoming > persisted => Freshness::Current,
        Some(_) => Freshness::Stale,
    }
}
