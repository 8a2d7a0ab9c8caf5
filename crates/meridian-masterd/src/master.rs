//! The broker itself: listener, admission queue, directory, and node
//! registry, assembled.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use meridian_core::managed::ListError;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::admission::{AuthQueue, SharedSecret};
use crate::config::MasterConfig;
use crate::directory::{NodeId, TopicTree};
use crate::acceptor;
use crate::node::{self, NodeHandle, Registry, ServeContext};

/// How often the broker moves freshly admitted nodes from the
/// authenticated list into its registry.
const ADOPTION_PERIOD: Duration = Duration::from_millis(50);

/// Outbox depth per serviced node.
const NODE_OUTBOX_DEPTH: usize = 32;

/// Errors that stop the broker.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    /// Socket setup or teardown failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The admission queue's machinery failed.
    #[error(transparent)]
    List(#[from] ListError),
}

/// The discovery broker. One instance per listening socket.
pub struct Master {
    config: MasterConfig,
    queue: Arc<AuthQueue<UnixStream, SharedSecret>>,
    directory: Arc<Mutex<TopicTree>>,
    registry: Registry,
    next_node: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Master {
    /// Assemble a broker from configuration. Nothing is bound or spawned
    /// until [`run`](Self::run).
    #[must_use]
    pub fn new(config: MasterConfig) -> Self {
        let authenticator = SharedSecret::new(config.secret.clone());
        let queue = Arc::new(AuthQueue::new(authenticator, &config.admission));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            queue,
            directory: Arc::new(Mutex::new(TopicTree::new())),
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_node: AtomicU64::new(1),
            shutdown,
        }
    }

    /// The broker's configuration.
    #[must_use]
    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// The shared topic directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<Mutex<TopicTree>> {
        &self.directory
    }

    /// Bind the socket and run until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// [`MasterError::Io`] when the socket cannot be bound,
    /// [`MasterError::List`] when the admission machinery fails.
    pub async fn run(&self) -> Result<(), MasterError> {
        let socket_path = &self.config.socket_path;
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), "master listening");

        self.queue.start().await?;
        let acceptor = tokio::spawn(acceptor::run(
            listener,
            Arc::clone(&self.queue),
            self.config.read_timeout,
            self.shutdown.subscribe(),
        ));

        let mut stopped = self.shutdown.subscribe();
        loop {
            tokio::select! {
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(ADOPTION_PERIOD) => {
                    self.adopt_admitted().await;
                }
            }
        }

        // Teardown: acceptor first (no new entries), then the queue (drops
        // everything unauthenticated), then the serviced nodes.
        if let Err(err) = acceptor.await {
            warn!(error = %err, "acceptor terminated abnormally");
        }
        self.queue.shutdown().await?;
        let handles: Vec<NodeHandle> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.task.abort();
            let _ = handle.task.await;
        }
        let _ = std::fs::remove_file(socket_path);
        info!("master stopped");
        Ok(())
    }

    /// Ask a running [`run`](Self::run) to stop and tear down.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Move every newly admitted node into the registry and start
    /// servicing it.
    async fn adopt_admitted(&self) {
        for admitted in self.queue.drain_admitted() {
            let id = NodeId(self.next_node.fetch_add(1, Ordering::Relaxed));
            let addr = id.to_string();
            let (outbox_tx, outbox_rx) = mpsc::channel(NODE_OUTBOX_DEPTH);
            let ctx = ServeContext {
                id,
                addr: addr.clone(),
                directory: Arc::clone(&self.directory),
                registry: Arc::clone(&self.registry),
                own_outbox: outbox_tx.clone(),
            };
            let task = tokio::spawn(node::serve(admitted.into_transport(), outbox_rx, ctx));
            self.registry.lock().await.insert(
                id,
                NodeHandle {
                    addr,
                    outbox: outbox_tx,
                    task,
                },
            );
            debug!(node = %id, "node adopted into registry");
        }
    }

    /// Number of nodes currently being serviced.
    pub async fn serviced_nodes(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Registrations a given topic currently has, for introspection.
    pub async fn topic_census(&self, path: &str) -> Option<(usize, usize)> {
        let directory = self.directory.lock().await;
        directory
            .topic_at(path)
            .map(|topic| (topic.publishers().len(), topic.subscribers().len()))
    }
}
