use std::{
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

use quince_net::{AuthenticationMethod, ConnectOptions};
use quince_proto::{ServerAddr, Subject};

#[cfg(feature = "from-env")]
use super::from_env::{FromEnv, FromEnvError};
use super::ClientConnectError;
use crate::{
    core::{Client, EventListener, MaxReconnect, PendingLimits},
    handler::HandlerConfig,
    supervisor::ReconnectConfig,
};

/// A builder for [`Client`]
///
/// Obtained from [`Client::builder`].
pub struct ClientBuilder {
    pub(crate) servers: Vec<ServerAddr>,
    pub(crate) auth_method: Option<AuthenticationMethod>,
    pub(crate) require_tls: bool,
    pub(crate) client_name: Option<String>,
    pub(crate) connect_timeout: Duration,
    pub(crate) allow_reconnect: bool,
    pub(crate) max_reconnect: MaxReconnect,
    pub(crate) reconnect_wait: Duration,
    pub(crate) reconnect_jitter: Duration,
    pub(crate) reconnect_jitter_tls: Duration,
    pub(crate) reconnect_buffer: ReconnectBuffer,
    pub(crate) no_randomize: bool,
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) flush_interval: Duration,
    pub(crate) inbox_prefix: Subject,
    pub(crate) echo: Echo,
    pub(crate) default_response_timeout: Duration,
    pub(crate) check_max_payload: bool,
    pub(crate) pending_limits: PendingLimits,
    pub(crate) subscriber_delivery_task_count: usize,
    pub(crate) event_listeners: Vec<Arc<dyn EventListener>>,
}

/// Whether or not to allow messages published by this client to be echoed back to it's own subscriptions
#[derive(Debug, Copy, Clone, Default)]
pub enum Echo {
    /// Do not allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[default]
    Prevent,
    /// Allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// [`Subscription`]: crate::core::Subscription
    Allow,
}

/// What happens to publishes while the client is reconnecting
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReconnectBuffer {
    /// Publishing fails with [`PublishError::ReconnectBufferExceeded`]
    ///
    /// [`PublishError::ReconnectBufferExceeded`]: crate::core::error::PublishError::ReconnectBufferExceeded
    Disabled,
    /// Publishes are buffered until the command channel is full, after
    /// which they wait
    Unbounded,
    /// Publishes are buffered up to this many payload bytes
    Sized(usize),
}

impl ClientBuilder {
    pub(super) fn new() -> Self {
        Self {
            servers: Vec::new(),
            auth_method: None,
            require_tls: false,
            client_name: None,
            connect_timeout: Duration::from_secs(2),
            allow_reconnect: true,
            max_reconnect: MaxReconnect::Attempts(60),
            reconnect_wait: Duration::from_secs(2),
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_secs(1),
            reconnect_buffer: ReconnectBuffer::Sized(8 * 1024 * 1024),
            no_randomize: false,
            ping_interval: Duration::from_secs(2 * 60),
            max_pings_out: 2,
            flush_interval: Duration::ZERO,
            inbox_prefix: Subject::from_static("_INBOX"),
            echo: Echo::Prevent,
            default_response_timeout: Duration::from_secs(5),
            check_max_payload: true,
            pending_limits: PendingLimits::default(),
            subscriber_delivery_task_count: 0,
            event_listeners: Vec::new(),
        }
    }

    /// Construct [`ClientBuilder`] from environment variables
    ///
    /// Reads the following environment variables into [`ClientBuilder`]:
    ///
    /// * `NATS_URL`: comma separated list of servers
    /// * `NATS_USERNAME` and `NATS_PASSWORD`: use username and password authentication
    /// * `NATS_TOKEN`: use token authentication
    /// * `NATS_INBOX_PREFIX`: see [`ClientBuilder::inbox_prefix`]
    ///
    /// # Errors
    ///
    /// It returns an error if a variable can't be parsed.
    #[cfg(feature = "from-env")]
    pub fn from_env() -> Result<Self, FromEnvError> {
        Self::from_vars(std::env::vars())
    }

    #[cfg(feature = "from-env")]
    pub(super) fn from_vars<I>(vars: I) -> Result<Self, FromEnvError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let env = FromEnv::from_vars(vars)?;
        let mut this = Self::new().servers(env.servers()?);

        if let Some(auth) = env.auth.into_authentication_method() {
            this = this.authentication_method(Some(auth));
        }
        if let Some(inbox_prefix) = env.inbox_prefix {
            this = this.inbox_prefix(inbox_prefix);
        }

        Ok(this)
    }

    /// The servers to connect to
    ///
    /// Unless [`ClientBuilder::no_randomize`] is set they are tried in
    /// random order. More servers may be learned from the cluster once
    /// connected.
    #[must_use]
    pub fn servers<I>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = ServerAddr>,
    {
        self.servers = servers.into_iter().collect();
        self
    }

    /// Define an authentication method
    ///
    /// Credentials embedded in a server address take precedence.
    #[must_use]
    pub fn authentication_method(mut self, auth_method: Option<AuthenticationMethod>) -> Self {
        self.auth_method = auth_method;
        self
    }

    /// Refuse to connect to servers which don't offer TLS
    ///
    /// Default: `false`
    #[must_use]
    pub fn require_tls(mut self, require_tls: bool) -> Self {
        self.require_tls = require_tls;
        self
    }

    /// The name presented to the server in `CONNECT`
    #[must_use]
    pub fn client_name(mut self, client_name: Option<String>) -> Self {
        self.client_name = client_name;
        self
    }

    /// How long a single connection attempt, handshake included, may take
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Whether to reconnect after losing the connection
    ///
    /// When disabled, the client closes as soon as the connection fails.
    ///
    /// Default: `true`
    #[must_use]
    pub fn allow_reconnect(mut self, allow_reconnect: bool) -> Self {
        self.allow_reconnect = allow_reconnect;
        self
    }

    /// How many times in a row a server may fail before it's forgotten
    ///
    /// The client closes once every server has been forgotten.
    ///
    /// Default: 60 attempts.
    #[must_use]
    pub fn max_reconnect(mut self, max_reconnect: MaxReconnect) -> Self {
        self.max_reconnect = max_reconnect;
        self
    }

    /// Minimum time between two connection attempts to the same server
    ///
    /// Default: 2 seconds.
    #[must_use]
    pub fn reconnect_wait(mut self, reconnect_wait: Duration) -> Self {
        self.reconnect_wait = reconnect_wait;
        self
    }

    /// Upper bound of the random delay added to [`ClientBuilder::reconnect_wait`]
    ///
    /// `jitter_tls` applies to `tls://` servers instead of `jitter`.
    ///
    /// Default: 100 milliseconds and 1 second.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: Duration, jitter_tls: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self.reconnect_jitter_tls = jitter_tls;
        self
    }

    /// Default: 8 MiB.
    #[must_use]
    pub fn reconnect_buffer(mut self, reconnect_buffer: ReconnectBuffer) -> Self {
        self.reconnect_buffer = reconnect_buffer;
        self
    }

    /// Try servers in the order they were configured or discovered
    ///
    /// Default: `false`
    #[must_use]
    pub fn no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    /// How often to check the connection with a `PING` when the server is quiet
    ///
    /// Default: 2 minutes.
    #[must_use]
    pub fn ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Unanswered keepalive `PING`s after which the connection is considered stale
    ///
    /// Default: 2
    #[must_use]
    pub fn max_pings_out(mut self, max_pings_out: u32) -> Self {
        self.max_pings_out = max_pings_out;
        self
    }

    /// Define a flush interval
    ///
    /// Setting a non-zero flush interval allows the client to generate
    /// larger TLS and TCP packets at the cost of increased latency. Using
    /// a value greater than a few seconds may break the client in
    /// unexpected ways.
    ///
    /// Setting this to [`Duration::ZERO`] causes the client to send messages
    /// as fast as the network will allow, trading off smaller packets for
    /// lower latency.
    ///
    /// Default: 0
    #[must_use]
    pub fn flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Configure the inbox prefix to which replies from the NATS server will be received
    ///
    /// Default: `_INBOX`
    #[must_use]
    pub fn inbox_prefix(mut self, inbox_prefix: Subject) -> Self {
        self.inbox_prefix = inbox_prefix;
        self
    }

    /// Whether or not to allow messages published by this client to be echoed back to it's own [`Subscription`]s
    ///
    /// Default: [`Echo::Prevent`].
    ///
    /// [`Subscription`]: crate::core::Subscription
    #[must_use]
    pub fn echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    /// The default timeout for [`ResponseFut`]
    ///
    /// Default: 5 seconds.
    ///
    /// [`ResponseFut`]: crate::core::request::ResponseFut
    #[must_use]
    pub fn default_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = timeout;
        self
    }

    /// Reject messages larger than the server's `max_payload` before sending them
    ///
    /// When disabled the server rejects oversized messages by closing the
    /// connection.
    ///
    /// Default: `true`
    #[must_use]
    pub fn check_max_payload(mut self, check_max_payload: bool) -> Self {
        self.check_max_payload = check_max_payload;
        self
    }

    /// How much each new subscription may buffer
    ///
    /// Default: see [`PendingLimits::default`].
    #[must_use]
    pub fn pending_limits(mut self, pending_limits: PendingLimits) -> Self {
        self.pending_limits = pending_limits;
        self
    }

    /// Number of tasks running the callbacks of [`Client::subscribe_with_handler`]
    ///
    /// `0` runs every subscription on its own task. Any other value shares
    /// that many tasks between all subscriptions.
    ///
    /// Default: 0
    #[must_use]
    pub fn subscriber_delivery_task_count(mut self, count: usize) -> Self {
        self.subscriber_delivery_task_count = count;
        self
    }

    /// Register a listener for connection events
    #[must_use]
    pub fn event_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.event_listeners.push(listener);
        self
    }

    /// Creates a new [`Client`], connecting to the first available server
    ///
    /// # Errors
    ///
    /// It returns an error if none of the servers accept the connection.
    pub async fn connect(self) -> Result<Client, ClientConnectError> {
        Client::connect(self).await
    }

    pub(super) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            client_name: self.client_name.clone(),
            echo: matches!(self.echo, Echo::Allow),
            verbose: true,
            auth: self.auth_method.clone(),
            require_tls: self.require_tls,
            connect_timeout: self.connect_timeout,
        }
    }

    pub(super) fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            ping_interval: self.ping_interval,
            max_pings_out: self.max_pings_out,
            flush_interval: self.flush_interval,
        }
    }

    pub(super) fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            allow_reconnect: self.allow_reconnect,
            max_reconnect: self.max_reconnect,
            reconnect_wait: self.reconnect_wait,
            reconnect_jitter: self.reconnect_jitter,
            reconnect_jitter_tls: self.reconnect_jitter_tls,
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("servers", &self.servers)
            .field("auth_method", &self.auth_method)
            .field("allow_reconnect", &self.allow_reconnect)
            .field("max_reconnect", &self.max_reconnect)
            .field("reconnect_buffer", &self.reconnect_buffer)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("echo", &self.echo)
            .field("event_listeners", &self.event_listeners.len())
            .finish_non_exhaustive()
    }
}
