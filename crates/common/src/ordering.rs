// Monotonic timestamp gate.
//
// Every timestamped field of the dirty-state projection is written through
// `accept`, whether the write came from the push channel or from an
// optimistic local update. A candidate must be strictly newer than what is
// stored; equal or older values are stale echoes and are dropped.
//
// Ordering relies on wall-clock timestamps issued by the server. There is no
// logical clock, so heavy clock skew between writers can reject a change that
// really is newer.

use tracing::{debug, warn};

use crate::types::Timestamp;

/// Decide whether `candidate` may replace `current`.
///
/// `context` names the field being written and is only used for logging.
pub fn accept(candidate: &Timestamp, current: Option<&Timestamp>, context: &str) -> bool {
    let candidate_at = match candidate.parse() {
        Ok(at) => at,
        Err(error) => {
            warn!(context, candidate = %candidate, %error, "rejected timestamp write");
            return false;
        }
    };

    let Some(current) = current else {
        return true;
    };

    let current_at = match current.parse() {
        Ok(at) => at,
        Err(error) => {
            debug!(context, current = %current, %error, "stored timestamp unreadable, replacing");
            return true;
        }
    };

    if candidate_at <= current_at {
        warn!(
            context,
            candidate = %candidate,
            current = %current,
            "rejected stale timestamp write"
        );
        return false;
    }

    true
}
