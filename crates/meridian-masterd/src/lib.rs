//! # meridian-masterd
//!
//! The meridian Master: a publish/subscribe service-discovery broker.
//!
//! Nodes connect over a unix socket, authenticate through the admission
//! queue, and then register publishers and subscribers on hierarchical
//! topic paths. The Master maintains the authoritative directory of who
//! publishes and subscribes to what, and notifies interested nodes with
//! topic updates so they can establish direct peer connections. No payload
//! traffic ever crosses the broker.
//!
//! The pipeline, stage by stage:
//!
//! 1. [`acceptor`] — accepts connections and queues them for admission.
//! 2. [`admission`] — workers over a managed list give each pending
//!    connection bounded receive slices until it authenticates or its
//!    grace period runs out.
//! 3. [`master`] — adopts admitted nodes into the registry and owns the
//!    shared state.
//! 4. [`node`] — one service task per admitted node, applying topic
//!    registrations to the [`directory`] and fanning out updates.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod admission;
pub mod config;
pub mod directory;
pub mod master;
pub mod node;

pub use admission::{AuthQueue, Authenticator, SharedSecret};
pub use config::{AdmissionConfig, ConfigError, MasterConfig};
pub use master::{Master, MasterError};
