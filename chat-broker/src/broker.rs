use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::{
    select,
    sync::{Mutex, mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::BrokerConfig,
    error::{BrokerError, ConfigError},
    mailbox::Mailbox,
    message::{Message, UserId},
    registry::Registry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Routes chat messages from producers to registered mailboxes.
///
/// Cloning is cheap and every clone shares the same registry, ingress queue
/// and shutdown token. Exactly one clone should drive [`Broker::run`].
///
/// Deliveries block on full mailboxes with no timeout or drop policy, so a
/// consumer that stops draining stalls dispatch for everyone until it catches
/// up or the shutdown token fires.
#[derive(Debug, Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    shutdown: CancellationToken,
    stopped: CancellationToken,
    ingress: mpsc::Sender<Message>,
    // Taken by the first `run` call.
    dispatch: Mutex<Option<mpsc::Receiver<Message>>>,
    started: AtomicBool,
    registry: Registry,
    accepted: AtomicU64,
    routed: watch::Sender<u64>,
}

impl Broker {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self::build(shutdown, BrokerConfig::default())
    }

    pub fn with_config(
        shutdown: CancellationToken,
        config: BrokerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(shutdown, config))
    }

    fn build(shutdown: CancellationToken, config: BrokerConfig) -> Self {
        let (ingress, dispatch) = mpsc::channel(config.ingress_capacity);
        Self {
            inner: Arc::new(BrokerInner {
                shutdown,
                stopped: CancellationToken::new(),
                ingress,
                dispatch: Mutex::new(Some(dispatch)),
                started: AtomicBool::new(false),
                registry: Registry::new(),
                accepted: AtomicU64::new(0),
                routed: watch::Sender::new(0),
            }),
        }
    }

    pub async fn register_user(&self, id: impl Into<UserId>, mailbox: impl Into<Mailbox>) {
        let id = id.into();
        let replaced = self.inner.registry.register(id.clone(), mailbox.into()).await;
        debug!(user = %id, replaced, "registered mailbox");
    }

    pub async fn unregister_user(&self, id: &str) {
        let removed = self.inner.registry.unregister(id).await;
        debug!(user = %id, removed, "unregistered mailbox");
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.contains(id).await
    }

    pub async fn registered_users(&self) -> Vec<UserId> {
        self.inner.registry.user_ids().await
    }

    /// Queues `message` for dispatch, waiting for room if the ingress queue is
    /// full.
    ///
    /// Returns [`BrokerError::ShutDown`] if the shutdown token fired before or
    /// while waiting. A successful return only means the message was queued;
    /// routing happens later on the dispatch task.
    pub async fn send_message(&self, message: Message) -> Result<(), BrokerError> {
        let shutdown = &self.inner.shutdown;
        if shutdown.is_cancelled() {
            return Err(BrokerError::ShutDown);
        }

        select! {
            biased;
            _ = shutdown.cancelled() => return Err(BrokerError::ShutDown),
            sent = self.inner.ingress.send(message) => sent.map_err(|_| BrokerError::ShutDown)?,
        }
        self.inner.accepted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Messages waiting in the ingress queue.
    pub fn pending(&self) -> usize {
        self.inner.ingress.max_capacity() - self.inner.ingress.capacity()
    }

    /// Resolves once every message accepted before the call has been routed,
    /// or as soon as the shutdown token fires.
    pub async fn flushed(&self) {
        let target = self.inner.accepted.load(Ordering::Acquire);
        let mut routed = self.inner.routed.subscribe();
        select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {}
            _ = routed.wait_for(|count| *count >= target) => {}
        }
    }

    /// Drives the dispatch loop until the shutdown token fires.
    ///
    /// Messages still queued at shutdown are dropped. Fails with
    /// [`BrokerError::AlreadyStarted`] on every call after the first.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let mut ingress = {
            let mut slot = self.inner.dispatch.lock().await;
            let Some(ingress) = slot.take() else {
                warn!("broker dispatch loop already started");
                return Err(BrokerError::AlreadyStarted);
            };
            self.inner.started.store(true, Ordering::Release);
            ingress
        };
        info!("broker dispatch loop started");

        let shutdown = &self.inner.shutdown;
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = ingress.recv() => {
                    let Some(message) = next else { break };
                    self.dispatch(message).await;
                    self.inner.routed.send_modify(|count| *count += 1);
                }
            }
        }

        let dropped = ingress.len();
        drop(ingress);
        self.inner.stopped.cancel();
        info!(dropped, "broker stopped");
        Ok(())
    }

    pub fn state(&self) -> BrokerState {
        if self.inner.stopped.is_cancelled() {
            BrokerState::Stopped
        } else if self.inner.shutdown.is_cancelled() {
            BrokerState::ShuttingDown
        } else if self.inner.started.load(Ordering::Acquire) {
            BrokerState::Running
        } else {
            BrokerState::Created
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the dispatch loop has exited.
    pub async fn stopped(&self) {
        self.inner.stopped.cancelled().await;
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    async fn dispatch(&self, message: Message) {
        if message.is_broadcast() {
            self.fan_out(message).await;
        } else {
            self.route_direct(message).await;
        }
    }

    async fn fan_out(&self, message: Message) {
        // The read lock is held for the whole fan-out so the recipient set is
        // exactly the membership at dispatch time.
        let mailboxes = self.inner.registry.read().await;
        trace!(sender = %message.sender, recipients = mailboxes.len(), "broadcasting message");

        for (user, mailbox) in mailboxes.iter() {
            if !deliver(&self.inner.shutdown, user, mailbox, message.clone()).await {
                return;
            }
        }
    }

    async fn route_direct(&self, message: Message) {
        let Some(recipient) = message.recipient.clone() else {
            debug!(sender = %message.sender, "discarding unicast message without recipient");
            return;
        };

        let Some(mailbox) = self.inner.registry.lookup(&recipient).await else {
            debug!(sender = %message.sender, %recipient, "discarding message for unknown recipient");
            return;
        };

        trace!(sender = %message.sender, %recipient, "routing direct message");
        deliver(&self.inner.shutdown, &recipient, &mailbox, message).await;
    }
}

/// Returns `false` when delivery was abandoned because shutdown fired.
async fn deliver(
    shutdown: &CancellationToken,
    user: &str,
    mailbox: &Mailbox,
    message: Message,
) -> bool {
    select! {
        biased;
        _ = shutdown.cancelled() => {
            debug!(user, "delivery abandoned on shutdown");
            false
        }
        delivered = mailbox.deliver(message) => {
            if let Err(error) = delivered {
                debug!(user, %error, "skipping mailbox");
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn construction_does_not_start_dispatch() {
        let broker = Broker::new(CancellationToken::new());
        assert_eq!(broker.state(), BrokerState::Created);
        assert!(broker.registered_users().await.is_empty());
    }

    #[tokio::test]
    async fn zero_capacity_config_is_rejected() {
        let result = Broker::with_config(
            CancellationToken::new(),
            BrokerConfig::with_ingress_capacity(0),
        );
        assert!(matches!(result, Err(ConfigError::ZeroCapacity)));
    }

    #[tokio::test]
    async fn lifecycle_moves_through_every_state() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        // A round trip through a mailbox proves the loop is live.
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.register_user("alice", tx).await;
        broker
            .send_message(Message::direct("bob", "alice", "ping", 1))
            .await
            .expect("send while running");
        timeout(WAIT, rx.recv()).await.expect("dispatch in time");
        assert_eq!(broker.state(), BrokerState::Running);

        broker.shutdown_token().cancel();
        assert!(token.is_cancelled());
        timeout(WAIT, broker.stopped()).await.expect("loop stops");
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn shutdown_before_run_reports_shutting_down() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());
        token.cancel();
        assert_eq!(broker.state(), BrokerState::ShuttingDown);

        broker.run().await.expect("run exits immediately");
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });
        // Wait until the first call owns the ingress receiver.
        while broker.state() == BrokerState::Created {
            tokio::task::yield_now().await;
        }

        assert_eq!(broker.run().await, Err(BrokerError::AlreadyStarted));

        token.cancel();
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
        assert_eq!(broker.run().await, Err(BrokerError::AlreadyStarted));
    }

    #[tokio::test]
    async fn blocked_sender_fails_when_shutdown_fires() {
        let token = CancellationToken::new();
        let broker = Broker::with_config(token.clone(), BrokerConfig::with_ingress_capacity(1))
            .expect("valid config");

        broker
            .send_message(Message::broadcast("alice", "first", 1))
            .await
            .expect("queue has room");

        let blocked = tokio::spawn({
            let broker = broker.clone();
            async move { broker.send_message(Message::broadcast("alice", "second", 2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        token.cancel();
        let result = timeout(WAIT, blocked).await.expect("sender unblocks");
        assert_eq!(result.expect("join"), Err(BrokerError::ShutDown));
    }

    #[tokio::test]
    async fn blocked_sender_resumes_once_dispatch_drains() {
        let token = CancellationToken::new();
        let broker = Broker::with_config(token.clone(), BrokerConfig::with_ingress_capacity(1))
            .expect("valid config");
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.register_user("bob", tx).await;

        let first = Message::direct("alice", "bob", "first", 1);
        let second = Message::direct("alice", "bob", "second", 2);
        broker.send_message(first.clone()).await.expect("queue has room");
        assert_eq!(broker.pending(), 1);

        let blocked = tokio::spawn({
            let broker = broker.clone();
            let second = second.clone();
            async move { broker.send_message(second).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        let result = timeout(WAIT, blocked).await.expect("sender resumes");
        assert_eq!(result.expect("join"), Ok(()));
        assert_eq!(timeout(WAIT, rx.recv()).await.expect("first in time"), Some(first));
        assert_eq!(timeout(WAIT, rx.recv()).await.expect("second in time"), Some(second));

        token.cancel();
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn claimed_receiver_implies_running_state() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        // Once the receiver slot is empty the broker must already report
        // itself as running.
        loop {
            if broker.inner.dispatch.lock().await.is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.state(), BrokerState::Running);
        assert_eq!(broker.run().await, Err(BrokerError::AlreadyStarted));

        token.cancel();
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
    }

    #[tokio::test]
    async fn flushed_waits_for_routing() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());
        let (tx, mut rx) = mpsc::channel(8);
        broker.register_user("bob", tx).await;

        for i in 0..5 {
            broker
                .send_message(Message::direct("alice", "bob", format!("msg {i}"), i))
                .await
                .expect("queue has room");
        }
        broker
            .send_message(Message::direct("alice", "nobody", "lost", 5))
            .await
            .expect("queue has room");

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });
        timeout(WAIT, broker.flushed()).await.expect("routing finishes");
        assert_eq!(broker.pending(), 0);

        token.cancel();
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
        for i in 0..5 {
            assert_eq!(rx.try_recv().map(|message| message.timestamp), Ok(i));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn flushed_returns_on_shutdown_without_dispatcher() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());
        broker
            .send_message(Message::broadcast("alice", "queued", 1))
            .await
            .expect("queue has room");

        token.cancel();
        timeout(WAIT, broker.flushed()).await.expect("shutdown releases waiters");
    }

    #[tokio::test]
    async fn shutdown_interrupts_stalled_delivery() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());

        // Nobody drains this mailbox, so the second delivery stalls dispatch.
        let (tx, _rx) = mpsc::channel(1);
        broker.register_user("slow", tx).await;

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        for i in 0..3 {
            broker
                .send_message(Message::broadcast("alice", format!("msg {i}"), i))
                .await
                .expect("queue has room");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_finished());

        token.cancel();
        let result = timeout(WAIT, dispatcher).await.expect("run returns");
        assert_eq!(result.expect("join"), Ok(()));
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn closed_mailbox_does_not_stop_fan_out() {
        let token = CancellationToken::new();
        let broker = Broker::new(token.clone());

        let (gone_tx, gone_rx) = mpsc::unbounded_channel();
        let (live_tx, mut live_rx) = mpsc::unbounded_channel();
        broker.register_user("gone", gone_tx).await;
        broker.register_user("live", live_tx).await;
        drop(gone_rx);

        let dispatcher = tokio::spawn({
            let broker = broker.clone();
            async move { broker.run().await }
        });

        let message = Message::broadcast("live", "still here", 1);
        broker.send_message(message.clone()).await.expect("send");
        let received = timeout(WAIT, live_rx.recv()).await.expect("delivered in time");
        assert_eq!(received, Some(message));

        token.cancel();
        assert_eq!(dispatcher.await.expect("join"), Ok(()));
    }
}
