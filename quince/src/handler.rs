use std::{
    collections::VecDeque,
    future::Future,
    num::NonZeroU64,
    ops::ControlFlow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use quince_net::{Connection, ConnectionSecurity};
use quince_proto::{
    error::ServerError,
    headers::HeaderMap,
    proto::{ClientOp, ServerOp},
    MessageBase, QueueGroup, ServerAddr, ServerInfo, ServerMessage, Subject, SubscriptionId,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{self, Instant, Sleep},
};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, warn};

use crate::{
    atomic::Ordering,
    client::ClientShared,
    dispatch::{DispatchTable, RouteOutcome, MULTIPLEXED_SUBSCRIPTION_ID},
    events::{AsyncError, Event},
    queue::{CloseReason, DeliveryQueue},
    server_pool::ServerPool,
};

pub(crate) type Transport = Connection<ConnectionSecurity<TcpStream>>;

const RECV_BUF: usize = 16;

/// The connection actor
///
/// Owns the socket, the dispatch table and the server pool. Resolves once
/// the connection fails or the client is closed, see [`HandlerOutput`].
#[derive(Debug)]
pub(crate) struct Handler {
    conn: Transport,
    addr: ServerAddr,
    shared: Arc<ClientShared>,
    config: HandlerConfig,
    delayed_flusher: Option<DelayedFlusher>,
    flushing: bool,
    closing: bool,
    commands_done: bool,

    ping_interval: Pin<Box<Sleep>>,
    pings_out: u32,

    close_requested: Pin<Box<WaitForCancellationFutureOwned>>,
    commands: mpsc::Receiver<HandlerCommand>,
    recv_buf: Vec<HandlerCommand>,
    in_flight_commands: VecDeque<InFlightCommand>,
    pong_waiters: VecDeque<PongWaiter>,

    multiplexed_subscription_prefix: Subject,
    table: DispatchTable,
    pool: ServerPool,
    reported_lame_duck: bool,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct HandlerConfig {
    pub(crate) ping_interval: Duration,
    pub(crate) max_pings_out: u32,
    pub(crate) flush_interval: Duration,
}

#[derive(Debug)]
struct DelayedFlusher {
    // INVARIANT: `interval != Duration::ZERO`
    interval: Duration,
    delay: Pin<Box<Option<Sleep>>>,
}

/// What survives a connection
#[derive(Debug)]
pub(crate) struct RecycledHandler {
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) pool: ServerPool,
    config: HandlerConfig,
    commands: mpsc::Receiver<HandlerCommand>,
    pong_waiters: VecDeque<PongWaiter>,
    multiplexed_subscription_prefix: Subject,
    table: DispatchTable,
}

#[derive(Debug)]
pub(crate) enum HandlerCommand {
    Publish {
        message: MessageBase,
        /// Bytes accounted against the reconnect buffer
        reserved: usize,
    },
    RequestMultiplexed {
        subject: Subject,
        reply_subject: Subject,
        headers: HeaderMap,
        payload: Bytes,
        reply: oneshot::Sender<ServerMessage>,
        reserved: usize,
    },
    UnsubscribeMultiplexed {
        reply_subject: Subject,
    },
    Subscribe {
        id: SubscriptionId,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        queue: Arc<DeliveryQueue>,
        callback: bool,
    },
    Unsubscribe {
        id: SubscriptionId,
        max_messages: Option<NonZeroU64>,
    },
    Drain {
        target: DrainTarget,
        done: oneshot::Sender<Vec<Arc<DeliveryQueue>>>,
    },
    Flush {
        done: oneshot::Sender<()>,
    },
    Rtt {
        reply: oneshot::Sender<Duration>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum DrainTarget {
    One(SubscriptionId),
    All,
}

#[derive(Debug)]
pub(crate) enum InFlightCommand {
    Unimportant,
    Subscribe { id: SubscriptionId },
}

/// Waits for the `PONG` answering one of our `PING`s
#[derive(Debug)]
enum PongWaiter {
    Keepalive,
    Flush(oneshot::Sender<()>),
    Rtt {
        sent: Instant,
        reply: oneshot::Sender<Duration>,
    },
    /// Every message sent before the `UNSUB`s of these subscriptions has arrived
    Barrier {
        ids: Vec<SubscriptionId>,
        done: oneshot::Sender<Vec<Arc<DeliveryQueue>>>,
    },
}

#[derive(Debug)]
pub(crate) enum HandlerOutput {
    ServerError(ServerError),
    UnexpectedState,
    StaleConnection,
    Disconnected,
    Closed,
}

impl Handler {
    pub(crate) fn new(
        mut conn: Transport,
        info: Box<ServerInfo>,
        addr: ServerAddr,
        mut recycle: RecycledHandler,
    ) -> Self {
        let shared = Arc::clone(&recycle.shared);
        recycle.pool.record_success(&addr);
        recycle.pool.update_discovered(&info.connect_urls, &addr);
        shared.servers.store(Arc::new(recycle.pool.snapshot()));
        shared.state.store_is_lameduck(info.lame_duck_mode);
        shared.server.store(Arc::new(addr.clone()));
        shared.info.store(Arc::from(info));

        let mut in_flight_commands = VecDeque::new();
        if recycle.table.has_reply_inbox() {
            in_flight_commands.push_back(InFlightCommand::Subscribe {
                id: MULTIPLEXED_SUBSCRIPTION_ID,
            });
            conn.enqueue_write_op(&multiplexed_subscribe_op(
                &recycle.multiplexed_subscription_prefix,
            ));
        }
        for (id, subscription, remaining) in recycle.table.resubscriptions() {
            in_flight_commands.push_back(InFlightCommand::Subscribe { id });
            conn.enqueue_write_op(&ClientOp::Subscribe {
                id,
                subject: subscription.subject.clone(),
                queue_group: subscription.queue_group.clone(),
            });

            if remaining.is_some() {
                in_flight_commands.push_back(InFlightCommand::Unimportant);
                conn.enqueue_write_op(&ClientOp::Unsubscribe {
                    id,
                    max_messages: remaining,
                });
            }
        }

        // flushes, rtt measurements and drains outlive the connection
        let mut pong_waiters = recycle.pong_waiters;
        pong_waiters.retain(|waiter| !matches!(waiter, PongWaiter::Keepalive));
        for waiter in &mut pong_waiters {
            if let PongWaiter::Rtt { sent, .. } = waiter {
                *sent = Instant::now();
            }
            conn.enqueue_write_op(&ClientOp::Ping);
        }

        let delayed_flusher = if recycle.config.flush_interval.is_zero() {
            None
        } else {
            Some(DelayedFlusher {
                interval: recycle.config.flush_interval,
                delay: Box::pin(None),
            })
        };

        let mut this = Self {
            conn,
            addr,
            close_requested: Box::pin(shared.close_requested.clone().cancelled_owned()),
            shared,
            config: recycle.config,
            delayed_flusher,
            flushing: false,
            closing: false,
            commands_done: false,
            ping_interval: Box::pin(time::sleep(recycle.config.ping_interval)),
            pings_out: 0,
            commands: recycle.commands,
            recv_buf: Vec::with_capacity(RECV_BUF),
            in_flight_commands,
            pong_waiters,
            multiplexed_subscription_prefix: recycle.multiplexed_subscription_prefix,
            table: recycle.table,
            pool: recycle.pool,
            reported_lame_duck: false,
        };
        if this.shared.state.is_lameduck() {
            this.report_lame_duck();
        }
        this
    }

    pub(crate) async fn recycle(mut self) -> RecycledHandler {
        let _ = self.conn.shutdown().await;

        RecycledHandler {
            shared: self.shared,
            pool: self.pool,
            config: self.config,
            commands: self.commands,
            pong_waiters: self.pong_waiters,
            multiplexed_subscription_prefix: self.multiplexed_subscription_prefix,
            table: self.table,
        }
    }

    pub(crate) fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    fn handle_server_op(&mut self, server_op: ServerOp) -> ControlFlow<HandlerOutput, ()> {
        match server_op {
            ServerOp::Message { message } => {
                self.shared
                    .stats
                    .record_in(message.base.wire_payload_len());
                let subscription_id = message.subscription_id;

                match self.table.route(message) {
                    RouteOutcome::Queued | RouteOutcome::Dropped | RouteOutcome::Unknown => {}
                    RouteOutcome::SlowConsumer { subject } => {
                        debug!(?subscription_id, %subject, "slow consumer, dropping messages");
                        self.shared.events.emit(Event::AsyncError(AsyncError::SlowConsumer {
                            subscription_id,
                            subject,
                        }));
                    }
                    RouteOutcome::Detached => {
                        self.in_flight_commands
                            .push_back(InFlightCommand::Unimportant);
                        self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                            id: subscription_id,
                            max_messages: None,
                        });
                    }
                }
            }
            ServerOp::Success => {
                if self.in_flight_commands.pop_front().is_none() {
                    return ControlFlow::Break(HandlerOutput::UnexpectedState);
                }
            }
            ServerOp::Error { error } if !error.is_fatal() => {
                let Some(in_flight_command) = self.in_flight_commands.pop_front() else {
                    return ControlFlow::Break(HandlerOutput::UnexpectedState);
                };

                match in_flight_command {
                    InFlightCommand::Subscribe { id } if self.table.contains(id) => {
                        debug!(?id, %error, "subscription rejected");
                        if let Some(subscription) = self.table.get(id) {
                            subscription.queue.push_error(error);
                        }
                        self.table.deregister(id, CloseReason::Unsubscribed);
                    }
                    InFlightCommand::Unimportant | InFlightCommand::Subscribe { .. } => {
                        self.shared
                            .events
                            .emit(Event::AsyncError(AsyncError::Server(error)));
                    }
                }
            }
            ServerOp::Error { error } => {
                warn!(server = %self.addr, %error, "server closed the connection");
                return ControlFlow::Break(HandlerOutput::ServerError(error));
            }
            ServerOp::Ping => {
                self.conn.enqueue_write_op(&ClientOp::Pong);
            }
            ServerOp::Pong => {
                self.pings_out = 0;
                self.handle_pong();
            }
            ServerOp::Info { info } => {
                self.shared.state.store_is_lameduck(info.lame_duck_mode);
                if info.lame_duck_mode {
                    self.report_lame_duck();
                }

                let added = self.pool.update_discovered(&info.connect_urls, &self.addr);
                if !added.is_empty() {
                    debug!(servers = added.len(), "discovered new servers");
                    self.shared.events.emit(Event::ServerDiscovered(added));
                }
                self.shared.servers.store(Arc::new(self.pool.snapshot()));
                self.shared.info.store(Arc::from(info));
            }
        }

        ControlFlow::Continue(())
    }

    fn handle_pong(&mut self) {
        match self.pong_waiters.pop_front() {
            None | Some(PongWaiter::Keepalive) => {}
            Some(PongWaiter::Flush(done)) => {
                let _ = done.send(());
            }
            Some(PongWaiter::Rtt { sent, reply }) => {
                let _ = reply.send(sent.elapsed());
            }
            Some(PongWaiter::Barrier { ids, done }) => {
                let queues = self.table.finish_drain(&ids);
                let _ = done.send(queues);
            }
        }
    }

    fn report_lame_duck(&mut self) {
        if !self.reported_lame_duck {
            self.reported_lame_duck = true;
            warn!(server = %self.addr, "server entered lame duck mode");
            self.shared
                .events
                .emit(Event::LameDuckMode(self.addr.clone()));
        }
    }

    fn send_ping(&mut self, waiter: PongWaiter) {
        self.conn.enqueue_write_op(&ClientOp::Ping);
        self.pong_waiters.push_back(waiter);
    }

    #[cold]
    fn ping(&mut self, cx: &mut Context<'_>) -> Result<(), HandlerOutput> {
        if self.pings_out >= self.config.max_pings_out {
            warn!(server = %self.addr, pings_out = self.pings_out, "stale connection");
            return Err(HandlerOutput::StaleConnection);
        }

        loop {
            self.reset_ping_interval();
            if Pin::new(&mut self.ping_interval).poll(cx).is_pending() {
                break;
            }
        }

        self.send_ping(PongWaiter::Keepalive);
        self.pings_out += 1;
        Ok(())
    }

    #[cold]
    fn failed_unsubscribe(&mut self) {
        self.shared.state.store_is_failed_unsubscribe(false);

        for id in self.table.remove_detached() {
            self.in_flight_commands
                .push_back(InFlightCommand::Unimportant);
            self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                id,
                max_messages: None,
            });
        }
    }

    #[cold]
    fn begin_closing(&mut self) {
        debug!(server = %self.addr, "closing connection");
        self.closing = true;
        self.commands.close();
    }

    fn reset_ping_interval(&mut self) {
        Sleep::reset(
            self.ping_interval.as_mut(),
            Instant::now() + self.config.ping_interval,
        );
    }
}

impl Future for Handler {
    type Output = HandlerOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.closing && this.close_requested.as_mut().poll(cx).is_ready() {
            this.begin_closing();
        }

        if Pin::new(&mut this.ping_interval).poll(cx).is_ready() {
            if let Err(output) = this.ping(cx) {
                return Poll::Ready(output);
            }
        }

        if this.shared.state.is_failed_unsubscribe() {
            this.failed_unsubscribe();
        }

        let mut handled_server_op = false;
        loop {
            match this.conn.poll_read_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Ok(server_op)) => {
                    if let ControlFlow::Break(output) = this.handle_server_op(server_op) {
                        return Poll::Ready(output);
                    }
                    handled_server_op = true;
                }
                Poll::Ready(Err(err)) => {
                    debug!(server = %this.addr, error = %err, "connection lost");
                    return Poll::Ready(HandlerOutput::Disconnected);
                }
            }
        }
        if handled_server_op {
            this.reset_ping_interval();
        }

        loop {
            this.receive_commands(cx);

            let write_blocked = if this.conn.has_pending_writes() {
                match this.conn.poll_write_next(cx) {
                    Poll::Pending => true,
                    Poll::Ready(Ok(_n)) => false,
                    Poll::Ready(Err(err)) => {
                        debug!(server = %this.addr, error = %err, "write failed");
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            } else {
                true
            };

            if write_blocked {
                // No more progress can be made until either the socket or
                // the command channel wakes us up
                break;
            }
        }

        if this.conn.should_flush() {
            this.flushing = true;
            if let Some(delayed_flusher) = &mut this.delayed_flusher {
                if delayed_flusher.delay.is_none() && !this.closing {
                    delayed_flusher
                        .delay
                        .set(Some(time::sleep(delayed_flusher.interval)));
                }
            }
        } else {
            this.flushing = false;
        }

        if this.flushing {
            let mut can_flush = true;
            if let Some(delayed_flusher) = &mut this.delayed_flusher {
                if let Some(delay) = delayed_flusher.delay.as_mut().as_pin_mut() {
                    if this.closing || delay.poll(cx).is_ready() {
                        delayed_flusher.delay.set(None);
                    } else {
                        can_flush = false;
                    }
                }
            }

            if can_flush {
                match this.conn.poll_flush(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => this.flushing = false,
                    Poll::Ready(Err(err)) => {
                        debug!(server = %this.addr, error = %err, "flush failed");
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            }
        }

        if this.closing
            && this.commands_done
            && !this.flushing
            && !this.conn.has_pending_writes()
        {
            Poll::Ready(HandlerOutput::Closed)
        } else {
            Poll::Pending
        }
    }
}

impl Handler {
    fn receive_commands(&mut self, cx: &mut Context<'_>) {
        while self.conn.may_enqueue_more_ops() && !self.commands_done {
            debug_assert!(self.recv_buf.is_empty());

            match self
                .commands
                .poll_recv_many(cx, &mut self.recv_buf, RECV_BUF)
            {
                Poll::Pending => return,
                Poll::Ready(1..) => {
                    let mut recv_buf = std::mem::take(&mut self.recv_buf);
                    for cmd in recv_buf.drain(..) {
                        self.handle_command(cmd);
                    }
                    self.recv_buf = recv_buf;
                }
                Poll::Ready(0) => {
                    // every `Client` is gone or `close` was requested
                    self.commands_done = true;
                    if !self.closing {
                        self.begin_closing();
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: HandlerCommand) {
        match cmd {
            HandlerCommand::Publish { message, reserved } => {
                self.release_reserved(reserved);
                self.shared.stats.record_out(message.wire_payload_len());
                self.in_flight_commands
                    .push_back(InFlightCommand::Unimportant);
                self.conn.enqueue_write_op(&ClientOp::Publish { message });
            }
            HandlerCommand::RequestMultiplexed {
                subject,
                reply_subject,
                headers,
                payload,
                reply,
                reserved,
            } => {
                debug_assert!(reply_subject.starts_with(&*self.multiplexed_subscription_prefix));
                self.release_reserved(reserved);

                if self.table.register_reply(reply_subject.clone(), reply) {
                    self.in_flight_commands.push_back(InFlightCommand::Subscribe {
                        id: MULTIPLEXED_SUBSCRIPTION_ID,
                    });
                    self.conn.enqueue_write_op(&multiplexed_subscribe_op(
                        &self.multiplexed_subscription_prefix,
                    ));
                }

                let message = MessageBase {
                    subject,
                    reply_subject: Some(reply_subject),
                    headers,
                    payload,
                };
                self.shared.stats.record_out(message.wire_payload_len());
                self.in_flight_commands
                    .push_back(InFlightCommand::Unimportant);
                self.conn.enqueue_write_op(&ClientOp::Publish { message });
            }
            HandlerCommand::UnsubscribeMultiplexed { reply_subject } => {
                self.table.remove_reply(&reply_subject);
            }
            HandlerCommand::Subscribe {
                id,
                subject,
                queue_group,
                queue,
                callback,
            } => {
                self.table
                    .register(id, subject.clone(), queue_group.clone(), queue, callback);
                self.in_flight_commands
                    .push_back(InFlightCommand::Subscribe { id });
                self.conn.enqueue_write_op(&ClientOp::Subscribe {
                    id,
                    subject,
                    queue_group,
                });
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: Some(max_messages),
            } => {
                if self.table.contains(id) {
                    let remaining = self.table.close_after(id, max_messages);
                    self.in_flight_commands
                        .push_back(InFlightCommand::Unimportant);
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: remaining,
                    });
                }
            }
            HandlerCommand::Unsubscribe {
                id,
                max_messages: None,
            } => {
                if self.table.deregister(id, CloseReason::Unsubscribed) {
                    self.in_flight_commands
                        .push_back(InFlightCommand::Unimportant);
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }
            }
            HandlerCommand::Drain { target, done } => {
                let ids = match target {
                    DrainTarget::One(id) => vec![id],
                    DrainTarget::All => self.table.ids(),
                };
                let ids = self.table.begin_drain(&ids);
                for &id in &ids {
                    self.in_flight_commands
                        .push_back(InFlightCommand::Unimportant);
                    self.conn.enqueue_write_op(&ClientOp::Unsubscribe {
                        id,
                        max_messages: None,
                    });
                }
                self.send_ping(PongWaiter::Barrier { ids, done });
            }
            HandlerCommand::Flush { done } => self.send_ping(PongWaiter::Flush(done)),
            HandlerCommand::Rtt { reply } => self.send_ping(PongWaiter::Rtt {
                sent: Instant::now(),
                reply,
            }),
        }
    }

    fn release_reserved(&self, reserved: usize) {
        if reserved > 0 {
            self.shared
                .reconnect_buffered
                .fetch_sub(reserved, Ordering::AcqRel);
        }
    }
}

impl RecycledHandler {
    pub(crate) fn new(
        shared: Arc<ClientShared>,
        pool: ServerPool,
        config: HandlerConfig,
        commands: mpsc::Receiver<HandlerCommand>,
        multiplexed_subscription_prefix: Subject,
    ) -> Self {
        Self {
            shared,
            pool,
            config,
            commands,
            pong_waiters: VecDeque::new(),
            multiplexed_subscription_prefix,
            table: DispatchTable::new(),
        }
    }

    /// Fails everything still waiting on the connection
    ///
    /// Commands that were never received are dropped, closing the queues
    /// of subscriptions created in the meantime.
    pub(crate) fn shutdown(mut self) {
        self.table.close_all(CloseReason::ConnectionClosed);
        self.pong_waiters.clear();
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                HandlerCommand::Subscribe { queue, .. } => {
                    queue.close(CloseReason::ConnectionClosed);
                }
                HandlerCommand::Publish { reserved, .. }
                | HandlerCommand::RequestMultiplexed { reserved, .. } => {
                    self.shared
                        .reconnect_buffered
                        .fetch_sub(reserved, Ordering::AcqRel);
                }
                HandlerCommand::UnsubscribeMultiplexed { .. }
                | HandlerCommand::Unsubscribe { .. }
                | HandlerCommand::Drain { .. }
                | HandlerCommand::Flush { .. }
                | HandlerCommand::Rtt { .. } => {}
            }
        }
    }
}

fn multiplexed_subscribe_op(prefix: &Subject) -> ClientOp {
    ClientOp::Subscribe {
        id: MULTIPLEXED_SUBSCRIPTION_ID,
        subject: Subject::from_dangerous_value(format!("{prefix}.*").into()),
        queue_group: None,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use bytes::Bytes;
    use claims::{assert_matches, assert_ok};
    use quince_proto::{headers::HeaderMap, MessageBase, Subject, SubscriptionId};
    use tokio::{sync::oneshot, time::timeout};

    use super::{DrainTarget, HandlerCommand, HandlerOutput};
    use crate::{
        queue::{DeliveryQueue, PendingLimits},
        tests::handler_pair,
    };

    fn subscribe(id: u64, subject: &'static str, queue: &Arc<DeliveryQueue>) -> HandlerCommand {
        HandlerCommand::Subscribe {
            id: SubscriptionId::from(id),
            subject: Subject::from_static(subject),
            queue_group: None,
            queue: Arc::clone(queue),
            callback: true,
        }
    }

    #[tokio::test]
    async fn subscribe_route_and_unsubscribe() {
        let (handler, sender, mut server) = handler_pair().await;
        let queue = Arc::new(DeliveryQueue::new(PendingLimits::default()));
        sender.send(subscribe(2, "orders.*", &queue)).await.unwrap();

        let handler_task = tokio::spawn(handler);
        assert_eq!("SUB orders.* 2", server.read_line().await);
        server.write(b"+OK\r\nMSG orders.new 2 5\r\nhello\r\n").await;

        timeout(Duration::from_secs(1), async {
            while queue.pending().0 == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!((1, 5), queue.pending());

        sender
            .send(HandlerCommand::Unsubscribe {
                id: SubscriptionId::from(2),
                max_messages: None,
            })
            .await
            .unwrap();
        assert_eq!("UNSUB 2", server.read_line().await);
        assert!(queue.is_closed());

        // every client handle is gone
        drop(sender);
        let output = timeout(Duration::from_secs(1), handler_task)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(output, HandlerOutput::Closed);
    }

    #[tokio::test]
    async fn flush_and_drain_barriers() {
        let (handler, sender, mut server) = handler_pair().await;
        tokio::spawn(handler);

        let queue = Arc::new(DeliveryQueue::new(PendingLimits::default()));
        sender.send(subscribe(2, "jobs", &queue)).await.unwrap();
        assert_eq!("SUB jobs 2", server.read_line().await);
        server.write(b"+OK\r\n").await;

        let (done, drained) = oneshot::channel();
        sender
            .send(HandlerCommand::Drain {
                target: DrainTarget::All,
                done,
            })
            .await
            .unwrap();
        assert_eq!("UNSUB 2", server.read_line().await);
        assert_eq!("PING", server.read_line().await);

        // sent by the server before it processed the UNSUB
        server.write(b"+OK\r\nMSG jobs 2 3\r\nabc\r\nPONG\r\n").await;
        let queues = timeout(Duration::from_secs(1), drained)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(1, queues.len());
        assert!(queue.is_closed());
        assert_eq!((1, 3), queue.pending());

        let (done, flushed) = oneshot::channel();
        sender.send(HandlerCommand::Flush { done }).await.unwrap();
        assert_eq!("PING", server.read_line().await);
        server.write(b"PONG\r\n").await;
        assert_ok!(timeout(Duration::from_secs(1), flushed).await.unwrap());
    }

    #[tokio::test]
    async fn answers_server_ping_and_fails_on_fatal_error() {
        let (handler, sender, mut server) = handler_pair().await;
        let handler_task = tokio::spawn(handler);

        server.write(b"PING\r\n").await;
        assert_eq!("PONG", server.read_line().await);

        sender
            .send(HandlerCommand::Publish {
                message: MessageBase {
                    subject: Subject::from_static("a"),
                    reply_subject: None,
                    headers: HeaderMap::new(),
                    payload: Bytes::from_static(b"x"),
                },
                reserved: 0,
            })
            .await
            .unwrap();
        assert_eq!("PUB a 1", server.read_line().await);
        assert_eq!("x", server.read_line().await);

        server.write(b"-ERR 'Maximum Payload Violation'\r\n").await;
        let output = timeout(Duration::from_secs(1), handler_task)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(output, HandlerOutput::ServerError(_));
    }

    #[tokio::test]
    async fn rejected_subscription_gets_the_error() {
        let (handler, sender, mut server) = handler_pair().await;
        tokio::spawn(handler);

        let queue = Arc::new(DeliveryQueue::new(PendingLimits::default()));
        sender.send(subscribe(2, "secret", &queue)).await.unwrap();
        assert_eq!("SUB secret 2", server.read_line().await);
        server
            .write(b"-ERR 'Permissions Violation for Subscription to \"secret\"'\r\n")
            .await;

        timeout(Duration::from_secs(1), async {
            while !queue.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(1, queue.pending().0);
    }

    #[tokio::test]
    async fn info_updates_pool_and_lame_duck() {
        let (handler, _sender, mut server) = handler_pair().await;
        let shared = Arc::clone(&handler.shared);
        tokio::spawn(handler);

        server
            .write(b"INFO {\"connect_urls\":[\"127.0.0.1:5001\"],\"ldm\":true}\r\n")
            .await;
        timeout(Duration::from_secs(1), async {
            while !shared.state.is_lameduck() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let servers = shared.servers.load();
        assert!(servers
            .iter()
            .any(|server| server.addr().port() == 5001 && server.is_discovered()));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_pings_make_the_connection_stale() {
        let (handler, _sender, mut server) = handler_pair().await;
        let handler_task = tokio::spawn(handler);

        // max_pings_out is 2 in the test configuration
        assert_eq!("PING", server.read_line().await);
        assert_eq!("PING", server.read_line().await);
        let output = timeout(Duration::from_secs(600), handler_task)
            .await
            .unwrap()
            .unwrap();
        assert_matches!(output, HandlerOutput::StaleConnection);
    }
}
