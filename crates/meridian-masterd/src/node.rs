//! Per-node service loop, run for every connection that passes admission.
//!
//! Each admitted node gets its own task reading framed messages off the
//! connection and applying them to the topic directory. Cross-node
//! notifications ride an outbox channel per node: whichever task causes an
//! update looks up the interested nodes in the registry and queues a
//! `TOPIC_UPD` frame on their outboxes; each owning task writes its own
//! socket.

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use meridian_core::protocol::{
    Message, MessageCodec, RegistrationOp, TopicKind, TopicRegistration, TopicUpdate, Transport,
    UpdateOp,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::directory::{NodeId, Registrar, TopicTree};

/// A serviced node, as the broker's registry sees it.
#[derive(Debug)]
pub struct NodeHandle {
    /// Address handed to peers that want to reach this node directly.
    pub addr: String,
    /// Queue of frames the owning task will write to the node.
    pub outbox: mpsc::Sender<Message>,
    /// The service task itself.
    pub task: JoinHandle<()>,
}

/// Registry of serviced nodes, shared by every service task.
pub type Registry = Arc<Mutex<HashMap<NodeId, NodeHandle>>>;

/// Everything a service task needs besides its connection.
pub struct ServeContext {
    /// Identity of the node being serviced.
    pub id: NodeId,
    /// Address advertised for this node in topic updates.
    pub addr: String,
    /// The shared topic directory.
    pub directory: Arc<Mutex<TopicTree>>,
    /// The shared node registry.
    pub registry: Registry,
    /// This node's own outbox, for updates it triggers on itself.
    pub own_outbox: mpsc::Sender<Message>,
}

/// Errors that end a node's service loop.
#[derive(Debug, thiserror::Error)]
enum ServeError {
    /// Topic or registrar names must be valid UTF-8 above the wire layer.
    #[error("name is not valid utf-8")]
    BadName(#[from] std::str::Utf8Error),

    /// A message kind that has no business arriving after admission.
    #[error("unexpected message kind: tag {tag}")]
    UnexpectedKind {
        /// Tag of the offending message.
        tag: u8,
    },
}

/// Service one node until it hangs up, misbehaves, or announces shutdown.
///
/// On exit the node is swept out of the directory and its counterparts are
/// told about every publication that disappeared with it.
pub async fn serve<S>(transport: Transport<S>, mut outbox: mpsc::Receiver<Message>, ctx: ServeContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(transport.into_inner(), MessageCodec);
    debug!(node = %ctx.id, "servicing admitted node");

    loop {
        tokio::select! {
            Some(msg) = outbox.recv() => {
                if let Err(err) = framed.send(&msg).await {
                    warn!(node = %ctx.id, error = %err, "failed to write to node");
                    break;
                }
            }
            frame = framed.next() => {
                match frame {
                    None => {
                        debug!(node = %ctx.id, "node hung up");
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(node = %ctx.id, error = %err, "dropping node");
                        break;
                    }
                    Some(Ok(Message::TopicReg(reg))) => {
                        if let Err(err) = handle_registration(&ctx, reg).await {
                            warn!(node = %ctx.id, error = %err, "dropping node");
                            break;
                        }
                    }
                    Some(Ok(Message::Shutdown(notice))) => {
                        debug!(node = %ctx.id, code = notice.code, "node announced shutdown");
                        break;
                    }
                    Some(Ok(msg)) => {
                        warn!(
                            node = %ctx.id,
                            error = %ServeError::UnexpectedKind { tag: msg.tag() },
                            "dropping node"
                        );
                        break;
                    }
                }
            }
        }
    }

    sweep(&ctx).await;
}

/// Apply one `TOPIC_REG` to the directory and fan out the updates it
/// implies.
async fn handle_registration(ctx: &ServeContext, reg: TopicRegistration) -> Result<(), ServeError> {
    let path = std::str::from_utf8(&reg.name)?.to_string();
    let name = std::str::from_utf8(&reg.registrar)?.to_string();

    match reg.op {
        RegistrationOp::Insert => {
            let effect = ctx.directory.lock().await.register(
                &path,
                reg.kind,
                Registrar {
                    name: name.clone(),
                    addr: ctx.addr.clone(),
                    node: ctx.id,
                },
            );
            if !effect.changed {
                return Ok(());
            }
            debug!(node = %ctx.id, topic = %path, kind = ?reg.kind, "registered");
            match reg.kind {
                // A new publisher: tell every subscriber where it is.
                TopicKind::Publish => {
                    let update = Message::TopicUpd(TopicUpdate {
                        op: UpdateOp::Add,
                        registrar: name.into_bytes(),
                        addr: ctx.addr.clone().into_bytes(),
                    });
                    for counterpart in &effect.counterparts {
                        notify(&ctx.registry, counterpart.node, update.clone()).await;
                    }
                }
                // A new subscriber: tell it about the existing publishers.
                TopicKind::Subscribe => {
                    for publisher in &effect.counterparts {
                        let update = Message::TopicUpd(TopicUpdate {
                            op: UpdateOp::Add,
                            registrar: publisher.name.clone().into_bytes(),
                            addr: publisher.addr.clone().into_bytes(),
                        });
                        let _ = ctx.own_outbox.send(update).await;
                    }
                }
            }
        }
        RegistrationOp::Delete => {
            let effect =
                ctx.directory
                    .lock()
                    .await
                    .deregister(&path, reg.kind, name.as_bytes(), ctx.id);
            if !effect.changed {
                return Ok(());
            }
            debug!(node = %ctx.id, topic = %path, kind = ?reg.kind, "deregistered");
            if reg.kind == TopicKind::Publish {
                let update = Message::TopicUpd(TopicUpdate {
                    op: UpdateOp::Remove,
                    registrar: name.into_bytes(),
                    addr: ctx.addr.clone().into_bytes(),
                });
                for counterpart in &effect.counterparts {
                    notify(&ctx.registry, counterpart.node, update.clone()).await;
                }
            }
        }
    }
    Ok(())
}

/// Remove a departed node from the registry and the directory, notifying
/// subscribers of every publication that vanished with it.
async fn sweep(ctx: &ServeContext) {
    let notifications = {
        let mut directory = ctx.directory.lock().await;
        let removed = directory.deregister_node(ctx.id);
        let mut notifications = Vec::new();
        for (path, kind, registrar) in removed {
            if kind != TopicKind::Publish {
                continue;
            }
            if let Some(topic) = directory.topic_at(&path) {
                let update = Message::TopicUpd(TopicUpdate {
                    op: UpdateOp::Remove,
                    registrar: registrar.name.clone().into_bytes(),
                    addr: registrar.addr.clone().into_bytes(),
                });
                for subscriber in topic.subscribers() {
                    notifications.push((subscriber.node, update.clone()));
                }
            }
        }
        notifications
    };
    for (node, update) in notifications {
        notify(&ctx.registry, node, update).await;
    }
    ctx.registry.lock().await.remove(&ctx.id);
    debug!(node = %ctx.id, "node swept");
}

/// Queue `msg` on a node's outbox, if it is still registered.
async fn notify(registry: &Registry, node: NodeId, msg: Message) {
    let outbox = registry
        .lock()
        .await
        .get(&node)
        .map(|handle| handle.outbox.clone());
    if let Some(outbox) = outbox {
        if outbox.send(msg).await.is_err() {
            debug!(node = %node, "notification dropped; node is gone");
        }
    }
}
