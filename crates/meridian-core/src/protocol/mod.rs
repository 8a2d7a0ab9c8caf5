//! Wire protocol for broker/node communication.
//!
//! The protocol stack, bottom up:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Typed messages (4 kinds)          │  message
//! ├─────────────────────────────────────────┤
//! │   Framing: [u16 LE len][tag][payload]    │  message / transport
//! ├─────────────────────────────────────────┤
//! │   Byte stream (unix or tcp socket)       │  tokio::net
//! └─────────────────────────────────────────┘
//! ```
//!
//! Two ways to drive it:
//!
//! - [`Transport`] owns the stream and offers [`Transport::recv_for`], a
//!   receive bounded by a caller-supplied time budget that resumes partial
//!   frames across calls. The admission pipeline uses this so one slow peer
//!   cannot monopolize a worker.
//! - [`MessageCodec`] plugs the same wire format into
//!   [`tokio_util::codec::Framed`] for connections that have passed
//!   admission and are serviced by an ordinary stream loop.

pub mod error;
pub mod message;
pub mod transport;

pub use error::{HEADER_LEN, MAX_FRAME_LEN, MAX_FRAME_SIZE, ProtocolError, TransportError};
pub use message::{
    Auth, Credential, MAX_CREDENTIAL_LEN, Message, MessageCodec, RegistrationOp, Shutdown,
    TopicKind, TopicRegistration, TopicUpdate, UpdateOp,
};
pub use transport::{RecvStatus, Transport};
