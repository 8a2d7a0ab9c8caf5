//! Admission control for freshly accepted connections.
//!
//! The acceptor pushes every accepted socket into an [`AuthQueue`] — a
//! [`ManagedList`] whose workers repeatedly walk the queue giving each
//! pending connection a small receive budget. A connection gets admitted by
//! sending a valid `AUTH` message within its grace period; anything else
//! (wrong secret, wrong message kind, malformed frame, socket error, or
//! silence past the deadline) marks the entry inactive, and the overseer's
//! next compaction pass removes it, dropping the connection.
//!
//! Admitted connections are appended to the authenticated-node list, from
//! which the broker drains them into its node registry. Appending transfers
//! ownership of the connection handle out of the queue entry.

mod authenticator;
mod entry;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use meridian_core::managed::{ListError, ManagedList, Steward};
use meridian_core::protocol::{Message, RecvStatus, Transport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tracing::debug;

pub use authenticator::{Authenticator, SharedSecret};
pub use entry::{AuthEntry, ConnectedNode};

use crate::config::AdmissionConfig;

/// Queue depth one worker is expected to keep up with; the worker heuristic
/// asks for one worker per this many active entries.
const ENTRIES_PER_WORKER: usize = 8;

/// The steward of the admission queue: walks entries, receives with a
/// bounded budget, and applies the admission decision.
pub struct Admission<S, A> {
    authenticator: A,
    admitted: Arc<StdMutex<Vec<ConnectedNode<S>>>>,
    cutoff: usize,
    iterator_budget: Duration,
}

impl<S, A> Admission<S, A> {
    /// Count inactive entries, stopping at the compaction cutoff. The
    /// heuristic never needs a more precise answer, so it does not pay for
    /// one.
    fn inactive_reached_cutoff(&self, entries: &[Arc<AuthEntry<S>>]) -> bool {
        entries
            .iter()
            .filter(|entry| !entry.is_active())
            .take(self.cutoff)
            .count()
            >= self.cutoff
    }
}

#[async_trait]
impl<S, A> Steward for Admission<S, A>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A: Authenticator,
{
    type Entry = AuthEntry<S>;

    /// One admission pass over the queue.
    ///
    /// Worker-local failures never escape: every error path converts into
    /// the entry's terminal state.
    async fn manage(&self, entries: &[Arc<AuthEntry<S>>]) {
        for entry in entries {
            if !entry.is_active() {
                continue;
            }
            // Another worker is on this entry; skip rather than wait.
            let Ok(mut slot) = entry.slot().try_lock() else {
                continue;
            };
            // The flag may have flipped while we took the lock.
            if !entry.is_active() {
                continue;
            }
            let Some(mut transport) = slot.take() else {
                entry.deactivate();
                continue;
            };

            match transport.recv_for(self.iterator_budget).await {
                Err(err) => {
                    debug!(error = %err, "connection failed during admission");
                    entry.deactivate();
                }
                Ok(RecvStatus::Pending) => {
                    if Instant::now() >= entry.deadline() {
                        debug!("admission grace period expired");
                        entry.deactivate();
                    } else {
                        // Keep the partial frame; a later pass resumes it.
                        *slot = Some(transport);
                    }
                }
                Ok(RecvStatus::Ready(frame)) => {
                    match Message::decode(&frame) {
                        Ok(Message::Auth(auth)) => {
                            if self.authenticator.verify(&auth.credential) {
                                self.admitted
                                    .lock()
                                    .expect("lock poisoned")
                                    .push(ConnectedNode::new(transport));
                                debug!("node admitted");
                            } else {
                                debug!("admission denied");
                            }
                        }
                        Ok(msg) => {
                            debug!(tag = msg.tag(), "expected an auth message");
                        }
                        Err(err) => {
                            debug!(error = %err, "undecodable admission frame");
                        }
                    }
                    // Terminal either way: admitted entries gave up their
                    // transport, everything else gets dropped.
                    entry.deactivate();
                }
            }
        }
    }

    fn should_compact(&self, entries: &[Arc<AuthEntry<S>>]) -> bool {
        self.inactive_reached_cutoff(entries)
    }

    fn desired_workers(&self, entries: &[Arc<AuthEntry<S>>], _live: usize) -> usize {
        let active = entries.iter().filter(|entry| entry.is_active()).count();
        active.div_ceil(ENTRIES_PER_WORKER)
    }

    fn should_remove(&self, entry: &AuthEntry<S>) -> bool {
        !entry.is_active()
    }
}

/// The admission queue the acceptor feeds and the broker drains.
pub struct AuthQueue<S, A = SharedSecret>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A: Authenticator,
{
    list: ManagedList<Admission<S, A>>,
    admitted: Arc<StdMutex<Vec<ConnectedNode<S>>>>,
    grace_period: Duration,
    overseer_period: Duration,
}

impl<S, A> AuthQueue<S, A>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A: Authenticator,
{
    /// Build a queue that admits against `authenticator`, tuned by
    /// `config`.
    pub fn new(authenticator: A, config: &AdmissionConfig) -> Self {
        let admitted = Arc::new(StdMutex::new(Vec::new()));
        let steward = Admission {
            authenticator,
            admitted: Arc::clone(&admitted),
            cutoff: config.cutoff,
            iterator_budget: config.iterator_budget,
        };
        Self {
            list: ManagedList::new(steward, config.max_workers),
            admitted,
            grace_period: config.grace_period,
            overseer_period: config.overseer_period,
        }
    }

    /// Queue an accepted connection, giving it the configured grace period
    /// to authenticate. Blocks only on the queue's structural lock.
    pub async fn insert(&self, transport: Transport<S>) {
        self.insert_with_deadline(transport, Instant::now() + self.grace_period)
            .await;
    }

    /// Queue an accepted connection with an explicit deadline.
    pub async fn insert_with_deadline(&self, transport: Transport<S>, deadline: Instant) {
        self.list.insert(AuthEntry::new(transport, deadline)).await;
    }

    /// Synchronous mode: one admission pass on the caller's task, then a
    /// compaction attempt.
    pub async fn spin(&self) {
        self.list.spin().await;
    }

    /// One overseer pass (compaction heuristic + worker rescaling).
    ///
    /// # Errors
    ///
    /// See [`ManagedList::oversee`].
    pub async fn oversee(&self) -> Result<(), ListError> {
        self.list.oversee().await
    }

    /// Start the queue's overseer at the configured period.
    ///
    /// # Errors
    ///
    /// See [`ManagedList::start`].
    pub async fn start(&self) -> Result<(), ListError> {
        self.list.start(self.overseer_period).await
    }

    /// Stop the overseer and workers and drop every queued connection.
    ///
    /// # Errors
    ///
    /// See [`ManagedList::shutdown`].
    pub async fn shutdown(&self) -> Result<(), ListError> {
        self.list.shutdown().await
    }

    /// Take every node admitted since the last drain.
    pub fn drain_admitted(&self) -> Vec<ConnectedNode<S>> {
        std::mem::take(&mut *self.admitted.lock().expect("lock poisoned"))
    }

    /// Entries currently queued, terminal ones included until compaction.
    pub async fn len(&self) -> usize {
        self.list.len().await
    }

    /// Whether the queue holds no entries at all.
    pub async fn is_empty(&self) -> bool {
        self.list.is_empty().await
    }

    /// Snapshot of the queued entries.
    pub async fn entries(&self) -> Vec<Arc<AuthEntry<S>>> {
        self.list.snapshot().await
    }

    /// Number of admission workers currently registered.
    pub async fn live_workers(&self) -> usize {
        self.list.live_workers().await
    }
}

#[cfg(test)]
mod tests {
    use meridian_core::protocol::Credential;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::config::AdmissionConfig;

    const READ_TIMEOUT: Duration = Duration::from_millis(50);

    fn test_config() -> AdmissionConfig {
        AdmissionConfig {
            cutoff: 1,
            iterator_budget: Duration::from_millis(100),
            grace_period: Duration::from_secs(60),
            max_workers: 3,
            overseer_period: Duration::from_millis(200),
        }
    }

    fn queue(secret: &[u8]) -> AuthQueue<DuplexStream> {
        AuthQueue::new(SharedSecret::new(secret.to_vec()), &test_config())
    }

    async fn connect(queue: &AuthQueue<DuplexStream>) -> Transport<DuplexStream> {
        let (server, client) = tokio::io::duplex(4096);
        let transport = Transport::new(server, READ_TIMEOUT).unwrap();
        queue.insert(transport).await;
        Transport::new(client, READ_TIMEOUT).unwrap()
    }

    #[tokio::test]
    async fn valid_secret_is_admitted() {
        let queue = queue(b" ");
        let mut client = connect(&queue).await;
        client
            .send(&Message::auth(Credential::Password(b" ".to_vec())))
            .await
            .unwrap();

        queue.spin().await;

        let admitted = queue.drain_admitted();
        assert_eq!(admitted.len(), 1);
        // The entry went terminal and the spin's compaction removed it.
        assert!(queue.is_empty().await);

        // The admitted transport is the same connection the client holds.
        let node = admitted.into_iter().next().unwrap();
        let mut transport = node.into_transport();
        transport.send(&Message::shutdown(0)).await.unwrap();
        let RecvStatus::Ready(frame) = client
            .recv_for(Duration::from_millis(500))
            .await
            .unwrap()
        else {
            panic!("client never saw the broker's frame");
        };
        assert_eq!(Message::decode(&frame).unwrap(), Message::shutdown(0));
    }

    #[tokio::test]
    async fn wrong_secret_is_denied() {
        let queue = queue(b"x");
        let mut client = connect(&queue).await;
        client
            .send(&Message::auth(Credential::Password(b" ".to_vec())))
            .await
            .unwrap();

        queue.spin().await;

        assert!(queue.drain_admitted().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn non_auth_message_is_dropped() {
        let queue = queue(b" ");
        let mut client = connect(&queue).await;
        client.send(&Message::shutdown(0)).await.unwrap();

        queue.spin().await;

        assert!(queue.drain_admitted().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn expired_entry_is_abandoned_within_one_pass() {
        let queue = queue(b" ");
        let (server, _client) = tokio::io::duplex(64);
        let transport = Transport::new(server, READ_TIMEOUT).unwrap();
        queue
            .insert_with_deadline(transport, Instant::now())
            .await;

        let entries = queue.entries().await;
        queue.spin().await;

        assert!(!entries[0].is_active());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn hung_up_peer_is_dropped() {
        let queue = queue(b" ");
        let (server, client) = tokio::io::duplex(64);
        queue
            .insert(Transport::new(server, READ_TIMEOUT).unwrap())
            .await;
        drop(client);

        queue.spin().await;

        assert!(queue.drain_admitted().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn partial_frame_survives_across_passes() {
        let queue = queue(b"pw");
        let (server, mut client) = tokio::io::duplex(4096);
        queue
            .insert(Transport::new(server, READ_TIMEOUT).unwrap())
            .await;

        let msg = Message::auth(Credential::Password(b"pw".to_vec()));
        let mut wire = bytes::BytesMut::new();
        msg.frame(&mut wire).unwrap();
        let half = wire.len() / 2;

        // First half of the frame, one pass: still pending and active.
        client.write_all(&wire[..half]).await.unwrap();
        queue.spin().await;
        let entries = queue.entries().await;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_active());

        // Second half completes the exchange.
        client.write_all(&wire[half..]).await.unwrap();
        queue.spin().await;
        assert_eq!(queue.drain_admitted().len(), 1);
    }
}
