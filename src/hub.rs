//! Registry of live connections and the broadcast path into them.
//!
//! The registry is owned by one task (the hub loop). Every mutation
//! (admit, remove, broadcast) arrives over a single command channel, so
//! commands are applied in the order the loop accepts them and no lock is
//! needed. Each member's outbound queue has exactly one sender, held in the
//! registry; dropping a member is what closes its queue, which makes a double
//! close impossible.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Default capacity of each connection's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Capacity of the hub's command channel.
const COMMAND_CAPACITY: usize = 256;

pub type ConnectionId = Uuid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is shutting down")]
    ShuttingDown,
}

enum Command {
    Admit {
        id: ConnectionId,
        session_id: String,
        outbound: mpsc::Sender<Bytes>,
        admitted: oneshot::Sender<()>,
    },
    Remove(ConnectionId),
    Broadcast {
        target: String,
        payload: Bytes,
    },
    Count(oneshot::Sender<usize>),
}

struct Member {
    session_id: String,
    outbound: mpsc::Sender<Bytes>,
}

/// A connection's place in the hub, returned by [`Hub::register`].
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    /// Receiving half of the outbound queue. Yields `None` once the hub has
    /// dropped the connection (unregister, saturation, or shutdown).
    pub outbound: mpsc::Receiver<Bytes>,
}

/// Cloneable handle to the hub loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
    outbound_capacity: usize,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("shutting_down", &self.shutdown.is_cancelled())
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

impl Hub {
    /// Start the hub loop with the default outbound capacity.
    pub fn spawn() -> Self {
        Self::spawn_with_capacity(OUTBOUND_CAPACITY)
    }

    /// Start the hub loop; each registered connection gets an outbound queue
    /// holding at most `outbound_capacity` payloads.
    pub fn spawn_with_capacity(outbound_capacity: usize) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let shutdown = CancellationToken::new();
        let stopped = CancellationToken::new();
        tokio::spawn(run(rx, shutdown.clone(), stopped.clone()));
        Self {
            commands,
            shutdown,
            stopped,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Admit a connection for `session_id`.
    ///
    /// Returns only after the loop has inserted the connection. An admit
    /// still queued when shutdown begins is refused with
    /// [`HubError::ShuttingDown`].
    pub async fn register(&self, session_id: &str) -> Result<Registration, HubError> {
        let id = Uuid::new_v4();
        let (outbound, rx) = mpsc::channel(self.outbound_capacity);
        let (admitted, ack) = oneshot::channel();
        let command = Command::Admit {
            id,
            session_id: session_id.to_string(),
            outbound,
            admitted,
        };
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(HubError::ShuttingDown),
            sent = self.commands.send(command) => {
                if sent.is_err() {
                    return Err(HubError::ShuttingDown);
                }
            }
        }
        // The loop answers or drops every admit it receives before it exits.
        match ack.await {
            Ok(()) => Ok(Registration { id, outbound: rx }),
            Err(_) => Err(HubError::ShuttingDown),
        }
    }

    /// Remove a connection and close its outbound queue. Unknown ids are
    /// ignored. Returns early if the hub stops first.
    pub async fn unregister(&self, id: ConnectionId) {
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => {}
            _ = self.commands.send(Command::Remove(id)) => {}
        }
    }

    /// Queue `payload` for every connection whose session id equals `target`,
    /// or for every connection when `target` is empty.
    ///
    /// Waits until the hub accepts the request or has stopped. An accepted
    /// request is applied even if shutdown begins before the loop reaches it.
    /// A connection whose queue is full is dropped instead of slowing the
    /// caller down.
    pub async fn broadcast(&self, target: &str, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        let command = Command::Broadcast {
            target: target.to_string(),
            payload,
        };
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => {}
            _ = self.commands.send(command) => {}
        }
    }

    /// Number of registered connections, or zero once the hub has stopped.
    pub async fn connection_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = self.stopped.cancelled() => return 0,
            sent = self.commands.send(Command::Count(tx)) => {
                if sent.is_err() {
                    return 0;
                }
            }
        }
        rx.await.unwrap_or(0)
    }

    /// Ask the loop to close every queue and exit, then wait for it up to
    /// `deadline`. Safe to call any number of times, concurrently.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown.cancel();
        if tokio::time::timeout(deadline, self.stopped.cancelled())
            .await
            .is_err()
        {
            tracing::warn!(
                deadline_ms = deadline.as_millis() as u64,
                "hub did not stop before the deadline; it will finish in the background"
            );
        }
    }

    /// True once [`Hub::shutdown`] has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the hub loop has exited.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

async fn run(
    mut commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
    stopped: CancellationToken,
) {
    let _stopped = stopped.drop_guard();
    let mut registry: HashMap<ConnectionId, Member> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => apply(&mut registry, command),
                None => break,
            },
        }
    }

    // Nothing new gets in. Accepted broadcasts and removals are still applied
    // so they reach the queues before those close; pending admits are refused.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Admit { id, session_id, .. } => {
                tracing::debug!(connection = %id, session = %session_id, "admit refused, hub stopping");
            }
            command => apply(&mut registry, command),
        }
    }

    let remaining = registry.len();
    registry.clear();
    tracing::debug!(remaining, "hub loop stopped");
}

fn apply(registry: &mut HashMap<ConnectionId, Member>, command: Command) {
    match command {
        Command::Admit {
            id,
            session_id,
            outbound,
            admitted,
        } => {
            // A caller that gave up waiting never sees its registration.
            if admitted.send(()).is_err() {
                return;
            }
            tracing::debug!(connection = %id, session = %session_id, "connection admitted");
            registry.insert(id, Member { session_id, outbound });
        }
        Command::Remove(id) => {
            if let Some(member) = registry.remove(&id) {
                tracing::debug!(connection = %id, session = %member.session_id, "connection removed");
            }
        }
        Command::Broadcast { target, payload } => {
            let mut dropped = Vec::new();
            for (id, member) in registry.iter() {
                if !target.is_empty() && member.session_id != target {
                    continue;
                }
                match member.outbound.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            connection = %id,
                            session = %member.session_id,
                            "outbound queue full, dropping slow connection"
                        );
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dropped.push(*id);
                    }
                }
            }
            for id in dropped {
                registry.remove(&id);
            }
        }
        Command::Count(reply) => {
            let _ = reply.send(registry.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn broadcast_without_match_is_noop() {
        let hub = Hub::spawn();
        let mut reg = hub.register("a").await.unwrap();

        tokio::time::timeout(DEADLINE, hub.broadcast("nobody", Bytes::from("x")))
            .await
            .expect("broadcast should not block");

        assert_eq!(hub.connection_count().await, 1);
        assert!(reg.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_targets_matching_session() {
        let hub = Hub::spawn();
        let mut a = hub.register("a").await.unwrap();
        let mut b = hub.register("b").await.unwrap();

        hub.broadcast("a", Bytes::from("for-a")).await;
        hub.broadcast("", Bytes::from("for-all")).await;
        assert_eq!(hub.connection_count().await, 2);

        assert_eq!(a.outbound.recv().await.unwrap(), Bytes::from("for-a"));
        assert_eq!(a.outbound.recv().await.unwrap(), Bytes::from("for-all"));
        assert_eq!(b.outbound.recv().await.unwrap(), Bytes::from("for-all"));
        assert!(b.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_session_ids_all_receive() {
        let hub = Hub::spawn();
        let mut first = hub.register("shared").await.unwrap();
        let mut second = hub.register("shared").await.unwrap();

        hub.broadcast("shared", Bytes::from("out")).await;

        assert_eq!(first.outbound.recv().await.unwrap(), Bytes::from("out"));
        assert_eq!(second.outbound.recv().await.unwrap(), Bytes::from("out"));
    }

    #[tokio::test]
    async fn broadcasts_keep_order() {
        let hub = Hub::spawn();
        let mut reg = hub.register("a").await.unwrap();

        for i in 0..50 {
            hub.broadcast("a", Bytes::from(format!("msg-{i}"))).await;
        }
        for i in 0..50 {
            assert_eq!(reg.outbound.recv().await.unwrap(), Bytes::from(format!("msg-{i}")));
        }
    }

    #[tokio::test]
    async fn empty_payload_is_not_forwarded() {
        let hub = Hub::spawn();
        let mut reg = hub.register("a").await.unwrap();

        hub.broadcast("a", Bytes::new()).await;
        hub.broadcast("a", Bytes::from("real")).await;

        assert_eq!(reg.outbound.recv().await.unwrap(), Bytes::from("real"));
    }

    #[tokio::test]
    async fn saturated_connection_is_dropped() {
        let hub = Hub::spawn();
        let mut slow = hub.register("slow").await.unwrap();
        let mut other = hub.register("other").await.unwrap();

        for i in 0..OUTBOUND_CAPACITY {
            hub.broadcast("slow", Bytes::from(format!("{i}"))).await;
        }
        assert_eq!(hub.connection_count().await, 2);

        hub.broadcast("slow", Bytes::from("overflow")).await;
        assert_eq!(hub.connection_count().await, 1);

        // Already-queued payloads are still readable, then the queue is closed.
        let mut drained = 0;
        while slow.outbound.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, OUTBOUND_CAPACITY);

        hub.broadcast("slow", Bytes::from("late")).await;
        assert_eq!(hub.connection_count().await, 1);

        hub.broadcast("other", Bytes::from("fine")).await;
        assert_eq!(other.outbound.recv().await.unwrap(), Bytes::from("fine"));
    }

    #[tokio::test]
    async fn unregister_closes_queue_once() {
        let hub = Hub::spawn();
        let mut reg = hub.register("a").await.unwrap();

        hub.unregister(reg.id).await;
        hub.unregister(reg.id).await;

        assert_eq!(hub.connection_count().await, 0);
        assert!(reg.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_is_ignored() {
        let hub = Hub::spawn();
        let _reg = hub.register("a").await.unwrap();
        hub.unregister(Uuid::new_v4()).await;
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_twice_concurrently() {
        let hub = Hub::spawn();
        let mut regs = Vec::new();
        for i in 0..5 {
            regs.push(hub.register(&format!("s{i}")).await.unwrap());
        }

        let first = hub.clone();
        let second = hub.clone();
        tokio::join!(first.shutdown(DEADLINE), second.shutdown(DEADLINE));

        assert!(hub.is_stopped());
        for reg in &mut regs {
            assert!(reg.outbound.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn shutdown_with_no_connections() {
        let hub = Hub::spawn();
        hub.shutdown(DEADLINE).await;
        assert!(hub.is_stopped());
        hub.shutdown(DEADLINE).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn register_racing_shutdown_is_refused() {
        let hub = Hub::spawn();
        tokio::task::yield_now().await;

        let (registered, ()) = tokio::join!(hub.register("a"), hub.shutdown(DEADLINE));

        assert_eq!(registered.unwrap_err(), HubError::ShuttingDown);
        assert!(hub.is_stopped());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn broadcast_accepted_before_shutdown_is_delivered() {
        let hub = Hub::spawn();
        let mut reg = hub.register("a").await.unwrap();

        tokio::join!(
            hub.broadcast("a", Bytes::from("last words")),
            hub.shutdown(DEADLINE)
        );

        assert_eq!(reg.outbound.recv().await, Some(Bytes::from("last words")));
        assert!(reg.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn register_returns_after_admission() {
        let hub = Hub::spawn();
        let _reg = hub.register("a").await.unwrap();
        assert!(!hub.is_shutting_down());
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn operations_after_shutdown_do_not_block() {
        let hub = Hub::spawn();
        hub.shutdown(DEADLINE).await;
        assert!(hub.is_shutting_down());

        assert_eq!(hub.register("a").await.unwrap_err(), HubError::ShuttingDown);
        tokio::time::timeout(DEADLINE, async {
            hub.broadcast("a", Bytes::from("x")).await;
            hub.unregister(Uuid::new_v4()).await;
        })
        .await
        .expect("should return immediately once stopped");
        assert_eq!(hub.connection_count().await, 0);
    }
}
