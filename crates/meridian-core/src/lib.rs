//! # meridian-core
//!
//! Core library for meridian — the control plane of a publish/subscribe
//! service-discovery broker.
//!
//! Nodes of a distributed system connect to the broker (the *Master*),
//! authenticate, and register themselves as publishers or subscribers of
//! hierarchically-named topics. The Master only performs discovery: it tells
//! interested nodes about each other so they can open direct peer
//! connections. Payload traffic never crosses the broker.
//!
//! This crate provides the two building blocks the broker is made of:
//!
//! - **Wire protocol** ([`protocol`]): the four message kinds, a 2-byte
//!   little-endian length-prefixed frame format, and a transport whose
//!   receiver can be driven in bounded time slices and resumed mid-frame.
//! - **Managed list** ([`managed`]): a concurrently-iterated collection with
//!   an elastic worker pool and barrier-synchronized compaction, used by the
//!   daemon to run admission control over not-yet-authenticated connections.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meridian_core::protocol::{Message, Transport};
//! use std::time::Duration;
//!
//! # async fn demo(stream: tokio::net::UnixStream) -> Result<(), Box<dyn std::error::Error>> {
//! let mut transport = Transport::new(stream, Duration::from_millis(100))?;
//! transport.send(&Message::shutdown(0)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod managed;
pub mod protocol;

pub use managed::{ListError, ManagedList, Steward};
pub use protocol::{Message, ProtocolError, RecvStatus, Transport, TransportError};
