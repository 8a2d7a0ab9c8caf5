//! Framed transport with a resumable, bounded-time receiver.
//!
//! Sending writes a whole frame. Receiving is different: the admission
//! pipeline gives each pending connection only a small time slice per pass,
//! so the receiver keeps its progress (`IDLE → HEADER → BODY → IDLE`) inside
//! the [`Transport`] and a timed-out [`recv_for`](Transport::recv_for) can
//! be re-entered later, picking up exactly where it left off.
//!
//! The transport requires a non-zero per-read timeout. The inner read loop
//! uses it to wake up and compare the monotonic clock against the caller's
//! budget; without it a silent peer would pin a worker indefinitely.
//!
//! A receive that has begun must not be abandoned: either keep calling
//! `recv_for` until it yields a frame, or drop the transport (closing the
//! connection). Dropping mid-frame is how terminal protocol errors are
//! handled.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::error::{MAX_FRAME_LEN, ProtocolError, TransportError};
use super::message::Message;

/// Outcome of a bounded-time receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvStatus {
    /// A complete frame (tag byte + payload). The receiver is idle again.
    ///
    /// Decoding is deliberately left to the caller so that a transport-level
    /// success can still be discriminated from a codec-level failure.
    Ready(Bytes),
    /// The budget ran out mid-frame (or before any byte arrived). Receiver
    /// state is retained; call `recv_for` again to continue.
    Pending,
}

/// Receiver progress, preserved across `recv_for` calls.
#[derive(Debug)]
enum RecvState {
    /// Between frames.
    Idle,
    /// Partway through the 2-byte length prefix.
    Header { buf: [u8; 2], got: usize },
    /// Header parsed; reading the announced number of body bytes.
    Body { body: Vec<u8>, got: usize },
}

/// Length-prefixed message transport over any async byte stream.
#[derive(Debug)]
pub struct Transport<S> {
    stream: S,
    read_timeout: Duration,
    state: RecvState,
}

impl<S> Transport<S> {
    /// Wrap `stream` with the given per-read timeout.
    ///
    /// # Errors
    ///
    /// [`TransportError::ZeroReadTimeout`] when `read_timeout` is zero; the
    /// receive loop depends on reads waking up on their own.
    pub fn new(stream: S, read_timeout: Duration) -> Result<Self, TransportError> {
        if read_timeout.is_zero() {
            return Err(TransportError::ZeroReadTimeout(read_timeout));
        }
        Ok(Self {
            stream,
            read_timeout,
            state: RecvState::Idle,
        })
    }

    /// Whether a frame is currently in flight.
    #[must_use]
    pub fn is_mid_frame(&self) -> bool {
        !matches!(self.state, RecvState::Idle)
    }

    /// Body bytes still missing from the frame in flight, once the header
    /// has been parsed.
    #[must_use]
    pub fn remaining(&self) -> Option<usize> {
        match &self.state {
            RecvState::Body { body, got } => Some(body.len() - got),
            _ => None,
        }
    }

    /// Shared access to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap the underlying stream.
    ///
    /// Only meaningful while the receiver is idle; a frame in flight is
    /// abandoned (its buffered bytes are dropped with the state).
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    /// Frame `msg` and write it out completely.
    ///
    /// Partial writes are retried until the whole frame is on the wire.
    ///
    /// # Errors
    ///
    /// Codec errors for unencodable messages, [`TransportError::Io`] on an
    /// unrecoverable socket error.
    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let mut buf = BytesMut::new();
        msg.frame(&mut buf)?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive for at most `budget`, resuming any frame in flight.
    ///
    /// Returns [`RecvStatus::Ready`] with the raw frame when it completes,
    /// or [`RecvStatus::Pending`] when the budget elapses first. A per-read
    /// timeout firing while budget remains simply re-enters the read, as
    /// does a transient `EAGAIN`/`EWOULDBLOCK`-class error.
    ///
    /// Successive calls on the same transport yield exactly one `Ready` per
    /// frame sent, regardless of how the bytes were chunked in transit.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] when the peer hangs up mid-stream,
    /// [`TransportError::Protocol`] when the length prefix exceeds the frame
    /// limit, [`TransportError::Io`] for any other socket error. All are
    /// terminal for the connection.
    pub async fn recv_for(&mut self, budget: Duration) -> Result<RecvStatus, TransportError> {
        let deadline = Instant::now() + budget;
        loop {
            if Instant::now() >= deadline {
                // An empty header slot means no byte of the frame has
                // arrived; report that as a clean idle state.
                if matches!(self.state, RecvState::Header { got: 0, .. }) {
                    self.state = RecvState::Idle;
                }
                return Ok(RecvStatus::Pending);
            }
            match &mut self.state {
                RecvState::Idle => {
                    self.state = RecvState::Header {
                        buf: [0u8; 2],
                        got: 0,
                    };
                }
                RecvState::Header { buf, got } => {
                    let mut window = [0u8; 2];
                    let want = 2 - *got;
                    let Some(n) = timed_read(
                        &mut self.stream,
                        self.read_timeout,
                        &mut window[..want],
                    )
                    .await?
                    else {
                        continue;
                    };
                    buf[*got..*got + n].copy_from_slice(&window[..n]);
                    *got += n;
                    if *got == 2 {
                        let len = usize::from(u16::from_le_bytes(*buf));
                        if len > MAX_FRAME_LEN {
                            return Err(ProtocolError::LengthOverflow {
                                len,
                                max: MAX_FRAME_LEN,
                            }
                            .into());
                        }
                        self.state = RecvState::Body {
                            body: vec![0u8; len],
                            got: 0,
                        };
                    }
                }
                RecvState::Body { body, got } => {
                    if *got < body.len() {
                        let Some(n) =
                            timed_read(&mut self.stream, self.read_timeout, &mut body[*got..])
                                .await?
                        else {
                            continue;
                        };
                        *got += n;
                    }
                    if *got == body.len() {
                        let frame = std::mem::take(body);
                        self.state = RecvState::Idle;
                        return Ok(RecvStatus::Ready(Bytes::from(frame)));
                    }
                }
            }
        }
    }
}

/// One read attempt bounded by the transport's per-read timeout.
///
/// `Ok(None)` means "nothing this time, check the budget and retry": the
/// timeout elapsed or the socket reported a transient would-block condition.
async fn timed_read<S: AsyncRead + Unpin>(
    stream: &mut S,
    read_timeout: Duration,
    dst: &mut [u8],
) -> Result<Option<usize>, TransportError> {
    match tokio::time::timeout(read_timeout, stream.read(dst)).await {
        Err(_elapsed) => Ok(None),
        Ok(Ok(0)) => Err(TransportError::Closed),
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ) =>
        {
            Ok(None)
        }
        Ok(Err(e)) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::protocol::message::Credential;

    const READ_TIMEOUT: Duration = Duration::from_millis(50);

    fn pair() -> (Transport<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        (Transport::new(a, READ_TIMEOUT).unwrap(), b)
    }

    #[tokio::test]
    async fn round_trips_an_auth_frame() {
        let (mut rx, peer) = pair();
        let mut tx = Transport::new(peer, READ_TIMEOUT).unwrap();

        let msg = Message::auth(Credential::Password(b"samplepasswd\0".to_vec()));
        tx.send(&msg).await.unwrap();

        let status = rx.recv_for(Duration::from_secs(1)).await.unwrap();
        let RecvStatus::Ready(frame) = status else {
            panic!("expected a complete frame, got {status:?}");
        };
        assert_eq!(Message::decode(&frame).unwrap(), msg);
        assert!(!rx.is_mid_frame());
    }

    #[tokio::test]
    async fn partial_frame_is_pending_and_resumable() {
        let (mut rx, mut peer) = pair();

        // A length of 23 and a single body byte, then silence.
        peer.write_all(&[23, 0, 13]).await.unwrap();

        let status = rx.recv_for(Duration::from_millis(300)).await.unwrap();
        assert_eq!(status, RecvStatus::Pending);
        assert!(rx.is_mid_frame());
        assert_eq!(rx.remaining(), Some(22));

        // The remaining 22 bytes complete the frame on the next call.
        peer.write_all(&[7u8; 22]).await.unwrap();
        let status = rx.recv_for(Duration::from_millis(300)).await.unwrap();
        let RecvStatus::Ready(frame) = status else {
            panic!("expected completion, got {status:?}");
        };
        assert_eq!(frame.len(), 23);
        assert_eq!(frame[0], 13);
        assert_eq!(rx.remaining(), None);
    }

    #[tokio::test]
    async fn arbitrary_chunking_yields_each_frame_exactly_once() {
        let (mut rx, mut peer) = pair();

        let msgs = vec![
            Message::auth(Credential::SessionId(b"sess-7".to_vec())),
            Message::shutdown(1),
            Message::auth(Credential::Password(Vec::new())),
        ];
        let mut wire = BytesMut::new();
        for m in &msgs {
            m.frame(&mut wire).unwrap();
        }

        // Dribble the stream out in uneven chunks.
        tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                peer.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Keep the peer open so the receiver sees silence, not EOF.
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(peer);
        });

        let mut seen = Vec::new();
        while seen.len() < msgs.len() {
            match rx.recv_for(Duration::from_millis(100)).await.unwrap() {
                RecvStatus::Ready(frame) => seen.push(Message::decode(&frame).unwrap()),
                RecvStatus::Pending => {}
            }
        }
        assert_eq!(seen, msgs);
    }

    #[tokio::test]
    async fn silence_is_pending_not_an_error() {
        let (mut rx, _peer) = pair();
        let started = std::time::Instant::now();
        let status = rx.recv_for(Duration::from_millis(120)).await.unwrap();
        assert_eq!(status, RecvStatus::Pending);
        assert!(!rx.is_mid_frame());
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn peer_hangup_mid_frame_is_terminal() {
        let (mut rx, mut peer) = pair();
        peer.write_all(&[10, 0, 1, 2]).await.unwrap();
        drop(peer);

        let err = rx.recv_for(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_terminal() {
        let (mut rx, mut peer) = pair();
        peer.write_all(&2000u16.to_le_bytes()).await.unwrap();

        let err = rx.recv_for(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(ProtocolError::LengthOverflow { len: 2000, .. })
        ));
    }

    #[tokio::test]
    async fn zero_read_timeout_is_rejected() {
        let (a, _b) = tokio::io::duplex(16);
        assert!(matches!(
            Transport::new(a, Duration::ZERO),
            Err(TransportError::ZeroReadTimeout(_))
        ));
    }
}
