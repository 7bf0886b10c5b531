use std::time::Duration;

use quince_proto::{Protocol, ServerAddr};
use rand::{seq::SliceRandom, Rng};
use tokio::time::Instant;

/// How many times in a row a server may fail before it's forgotten
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaxReconnect {
    /// Give up on a server after this many consecutive failed attempts
    Attempts(u32),
    /// Retry every server forever
    Forever,
}

/// A server the client knows about
///
/// Obtained from [`Client::servers`].
///
/// [`Client::servers`]: crate::core::Client::servers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownServer {
    addr: ServerAddr,
    discovered: bool,
    failed_attempts: u32,
}

/// Ordered set of servers the client may connect to
///
/// Owned by the connection actor. Explicitly configured servers are only
/// ever removed after exceeding [`MaxReconnect`], servers learned through
/// `INFO` are also removed once the cluster stops advertising them.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: Vec<ServerEntry>,
    cursor: usize,
    randomize: bool,
}

#[derive(Debug)]
struct ServerEntry {
    addr: ServerAddr,
    discovered: bool,
    failed_attempts: u32,
    last_attempt: Option<Instant>,
}

impl ServerPool {
    pub(crate) fn new(explicit: Vec<ServerAddr>, randomize: bool) -> Self {
        let mut servers = Vec::<ServerEntry>::with_capacity(explicit.len());
        for addr in explicit {
            if servers.iter().all(|entry| !entry.addr.same_endpoint(&addr)) {
                servers.push(ServerEntry::new(addr, false));
            }
        }
        if randomize {
            servers.shuffle(&mut rand::thread_rng());
        }

        Self {
            servers,
            cursor: 0,
            randomize,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.servers.len()
    }

    /// The next server to try, round robin
    pub(crate) fn next_candidate(&mut self) -> Option<ServerAddr> {
        if self.servers.is_empty() {
            return None;
        }

        let index = self.cursor % self.servers.len();
        self.cursor = index + 1;
        Some(self.servers[index].addr.clone())
    }

    /// How long to wait before trying `addr` again
    ///
    /// Attempts to the same server are spaced by `wait` plus a random
    /// jitter, picked from `jitter_tls` for `tls://` servers.
    pub(crate) fn delay_before(
        &self,
        addr: &ServerAddr,
        wait: Duration,
        jitter: Duration,
        jitter_tls: Duration,
    ) -> Duration {
        let Some(last_attempt) = self.find(addr).and_then(|entry| entry.last_attempt) else {
            return Duration::ZERO;
        };

        let jitter = match addr.protocol() {
            Protocol::Plain => jitter,
            Protocol::Tls => jitter_tls,
        };
        let jitter = if jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..jitter)
        };
        (last_attempt + wait + jitter).saturating_duration_since(Instant::now())
    }

    pub(crate) fn record_attempt(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.find_mut(addr) {
            entry.last_attempt = Some(Instant::now());
        }
    }

    pub(crate) fn record_success(&mut self, addr: &ServerAddr) {
        if let Some(entry) = self.find_mut(addr) {
            entry.failed_attempts = 0;
        }
    }

    /// Counts a failed attempt, returning `true` if the server was removed
    pub(crate) fn record_failure(&mut self, addr: &ServerAddr, max_reconnect: MaxReconnect) -> bool {
        let Some(index) = self.position(addr) else {
            return false;
        };

        let entry = &mut self.servers[index];
        entry.failed_attempts = entry.failed_attempts.saturating_add(1);
        match max_reconnect {
            MaxReconnect::Attempts(max) if entry.failed_attempts > max => {
                self.remove(index);
                true
            }
            MaxReconnect::Attempts(_) | MaxReconnect::Forever => false,
        }
    }

    /// Merges the servers advertised by the cluster
    ///
    /// New servers are appended (in random order unless randomization is
    /// disabled) and returned. Discovered servers that are no longer
    /// advertised are pruned, unless `current` is one of them.
    pub(crate) fn update_discovered(
        &mut self,
        advertised: &[ServerAddr],
        current: &ServerAddr,
    ) -> Vec<ServerAddr> {
        let mut index = 0;
        while index < self.servers.len() {
            let entry = &self.servers[index];
            let keep = !entry.discovered
                || entry.addr.same_endpoint(current)
                || advertised.iter().any(|addr| addr.same_endpoint(&entry.addr));
            if keep {
                index += 1;
            } else {
                self.remove(index);
            }
        }

        let mut added = Vec::new();
        for addr in advertised {
            let known = self
                .servers
                .iter()
                .any(|entry| entry.addr.same_endpoint(addr))
                || added.iter().any(|other: &ServerAddr| other.same_endpoint(addr));
            if !known {
                added.push(addr.clone());
            }
        }

        let mut appended = added.clone();
        if self.randomize {
            appended.shuffle(&mut rand::thread_rng());
        }
        self.servers
            .extend(appended.into_iter().map(|addr| ServerEntry::new(addr, true)));
        added
    }

    pub(crate) fn snapshot(&self) -> Vec<KnownServer> {
        self.servers
            .iter()
            .map(|entry| KnownServer {
                addr: entry.addr.clone(),
                discovered: entry.discovered,
                failed_attempts: entry.failed_attempts,
            })
            .collect()
    }

    fn remove(&mut self, index: usize) {
        self.servers.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
    }

    fn position(&self, addr: &ServerAddr) -> Option<usize> {
        self.servers
            .iter()
            .position(|entry| entry.addr.same_endpoint(addr))
    }

    fn find(&self, addr: &ServerAddr) -> Option<&ServerEntry> {
        self.position(addr).map(|index| &self.servers[index])
    }

    fn find_mut(&mut self, addr: &ServerAddr) -> Option<&mut ServerEntry> {
        self.position(addr).map(|index| &mut self.servers[index])
    }
}

impl ServerEntry {
    fn new(addr: ServerAddr, discovered: bool) -> Self {
        Self {
            addr,
            discovered,
            failed_attempts: 0,
            last_attempt: None,
        }
    }
}

impl KnownServer {
    #[must_use]
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Returns `true` if the server was advertised by the cluster instead
    /// of being configured
    #[must_use]
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    /// Consecutive failed connection attempts
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}
