use std::time::Duration;

use drover_core::ConnectionId;

/// Biases reservation toward the connection that answered fastest last
/// time. If a connection returns a job right away it probably has more
/// queued; if it takes a while it is probably empty. So the preference
/// sticks only while the connection stays fast, and is dropped entirely
/// the moment anything goes wrong with it. Best-effort: correctness never
/// depends on it.
#[derive(Debug)]
pub struct ConnectionHint {
    brief_threshold: Duration,
    preferred: Option<ConnectionId>,
}

impl ConnectionHint {
    pub fn new(brief_threshold: Duration) -> Self {
        ConnectionHint {
            brief_threshold,
            preferred: None,
        }
    }

    pub fn preferred(&self) -> Option<&ConnectionId> {
        self.preferred.as_ref()
    }

    /// Record the outcome of a reservation attempt: a brief attempt that
    /// returned a job sets the hint to that job's connection, anything
    /// else clears it.
    pub fn observe(&mut self, elapsed: Duration, conn: Option<&ConnectionId>) {
        self.preferred = match conn {
            Some(conn) if elapsed < self.brief_threshold => Some(conn.clone()),
            _ => None,
        };
    }

    /// Reservation error path: the failing connection must not stay
    /// preferred.
    pub fn clear(&mut self) {
        self.preferred = None;
    }
}
