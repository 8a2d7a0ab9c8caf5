//! Queue entries and their terminal form.

use std::sync::atomic::{AtomicBool, Ordering};

use meridian_core::protocol::Transport;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A connection that has been accepted but not yet authenticated.
///
/// Entries are shared between the acceptor (creator), the admission workers
/// (mutators), and the overseer (destroyer), so all mutable state sits
/// behind the per-entry lock or an atomic:
///
/// - the transport lives in a slot behind an async mutex; a worker that
///   cannot take the lock without blocking skips the entry,
/// - `active` flips to false exactly once, when the entry becomes terminal
///   (authenticated, denied, errored, or expired), and is never mutated
///   again,
/// - `deadline` is immutable.
///
/// The connection handle is owned by the transport in the slot. Taking the
/// slot's contents is how ownership transfers on successful admission; an
/// entry that still holds its transport when compaction removes it closes
/// the connection by dropping it.
#[derive(Debug)]
pub struct AuthEntry<S> {
    slot: Mutex<Option<Transport<S>>>,
    deadline: Instant,
    active: AtomicBool,
}

impl<S> AuthEntry<S> {
    /// Wrap an accepted transport, to be abandoned at `deadline` if still
    /// unauthenticated.
    pub fn new(transport: Transport<S>, deadline: Instant) -> Self {
        Self {
            slot: Mutex::new(Some(transport)),
            deadline,
            active: AtomicBool::new(true),
        }
    }

    /// Whether the entry still awaits an admission decision.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark the entry terminal. Workers never touch inactive entries; the
    /// next compaction pass removes them.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// When the admission grace period runs out for this connection.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// The per-entry lock: exclusive access to the transport slot.
    pub(crate) fn slot(&self) -> &Mutex<Option<Transport<S>>> {
        &self.slot
    }
}

/// An authenticated node, fresh off the admission queue.
///
/// Owns the connection handle its admission entry gave up. Topic
/// registrations are recorded against the node's id in the directory once
/// the broker adopts it; the node record itself stays lean.
#[derive(Debug)]
pub struct ConnectedNode<S> {
    transport: Transport<S>,
}

impl<S> ConnectedNode<S> {
    pub(crate) fn new(transport: Transport<S>) -> Self {
        Self { transport }
    }

    /// Shared access to the owned transport.
    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    /// Take the connection out of the node, for wrapping in a framed
    /// service loop.
    pub fn into_transport(self) -> Transport<S> {
        self.transport
    }
}
