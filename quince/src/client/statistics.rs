use crate::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(crate) struct RawStatistics {
    in_messages: AtomicU64,
    in_bytes: AtomicU64,
    out_messages: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

/// Traffic counters of a [`Client`]
///
/// Obtained from [`Client::statistics`]. Counters cover the whole life of
/// the client, across reconnects.
///
/// [`Client`]: crate::core::Client
/// [`Client::statistics`]: crate::core::Client::statistics
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    in_messages: u64,
    in_bytes: u64,
    out_messages: u64,
    out_bytes: u64,
    reconnects: u64,
}

impl RawStatistics {
    pub(crate) fn record_in(&self, bytes: usize) {
        self.in_messages.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.out_messages.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Statistics {
        Statistics {
            in_messages: self.in_messages.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_messages: self.out_messages.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Statistics {
    /// Messages received from the server, including dropped ones
    #[must_use]
    pub fn in_messages(&self) -> u64 {
        self.in_messages
    }

    /// Payload bytes received from the server
    #[must_use]
    pub fn in_bytes(&self) -> u64 {
        self.in_bytes
    }

    /// Messages written to the server
    #[must_use]
    pub fn out_messages(&self) -> u64 {
        self.out_messages
    }

    /// Payload bytes written to the server
    #[must_use]
    pub fn out_bytes(&self) -> u64 {
        self.out_bytes
    }

    /// Successful reconnects
    #[must_use]
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }
}

#[cfg(test)]
mod tests {
    use super::RawStatistics;

    #[test]
    fn counts() {
        let stats = RawStatistics::default();
        stats.record_in(10);
        stats.record_in(5);
        stats.record_out(7);
        stats.record_reconnect();

        let snapshot = stats.snapshot();
        assert_eq!(2, snapshot.in_messages());
        assert_eq!(15, snapshot.in_bytes());
        assert_eq!(1, snapshot.out_messages());
        assert_eq!(7, snapshot.out_bytes());
        assert_eq!(1, snapshot.reconnects());
    }
}
