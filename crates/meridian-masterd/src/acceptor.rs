//! Connection listener feeding the admission queue.
//!
//! Accepts every inbound connection and queues it for authentication; the
//! admission queue is the only judge of who stays. Accept errors are logged
//! and the loop keeps going — a transient failure on one accept must not
//! take the listener down.

use std::sync::Arc;
use std::time::Duration;

use meridian_core::protocol::Transport;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::admission::{AuthQueue, Authenticator};

/// Accept connections on `listener` until `shutdown` flips, wrapping each
/// in a read-timeout transport and inserting it into `queue`.
pub async fn run<A>(
    listener: UnixListener,
    queue: Arc<AuthQueue<tokio::net::UnixStream, A>>,
    read_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    A: Authenticator,
{
    info!("acceptor listening");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => match Transport::new(stream, read_timeout) {
                        Ok(transport) => {
                            debug!("connection accepted; queued for admission");
                            queue.insert(transport).await;
                        }
                        Err(err) => error!(error = %err, "misconfigured transport"),
                    },
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                    }
                }
            }
        }
    }
    info!("acceptor stopped");
}
