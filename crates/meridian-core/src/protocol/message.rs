//! Typed message kinds and their wire codec.
//!
//! Every message is a tagged sum: one tag byte selects the kind, the rest of
//! the frame is the kind-specific payload. All integer fields are
//! little-endian. Length fields are truthful byte counts of the sequence
//! that immediately follows them; identifiers, topic names, and addresses
//! are opaque byte strings at this layer.
//!
//! Framing wraps the encoded message in a 2-byte little-endian length
//! prefix counting the tag byte plus payload:
//!
//! ```text
//! +----------------+-----------+------------------+
//! | len (u16, LE)  | tag (u8)  | payload          |
//! +----------------+-----------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{
    HEADER_LEN, MAX_FRAME_LEN, ProtocolError, ProtocolResult, TransportError,
};

/// Tag byte for authentication messages.
const TAG_AUTH: u8 = 0;
/// Tag byte for topic registrations.
const TAG_TOPIC_REG: u8 = 1;
/// Tag byte for topic updates.
const TAG_TOPIC_UPD: u8 = 2;
/// Tag byte for shutdown notices.
const TAG_SHUTDOWN: u8 = 3;

/// Maximum credential length an `AUTH` message can carry.
///
/// The sign of the length byte discriminates password from session id, so
/// the magnitude must fit in an `i8`.
pub const MAX_CREDENTIAL_LEN: usize = i8::MAX as usize;

/// Credential carried by an [`Message::Auth`] message.
///
/// On the wire the discriminant is the sign of the length byte: positive for
/// a master password, negative for a previously issued session id. A length
/// of zero is valid; zero has no sign, so an empty credential always decodes
/// as a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Shared-secret password presented on first contact.
    Password(Vec<u8>),
    /// Session id issued by a previous authentication.
    SessionId(Vec<u8>),
}

impl Credential {
    /// The raw credential bytes, whichever kind they are.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Password(b) | Self::SessionId(b) => b,
        }
    }
}

/// Direction of a topic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationOp {
    /// Register the sender to the topic.
    Insert = 0,
    /// Remove the sender from the topic.
    Delete = 1,
}

/// Which side of a topic a registrar sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TopicKind {
    /// The registrar publishes to the topic.
    Publish = 0,
    /// The registrar subscribes to the topic.
    Subscribe = 1,
}

/// Direction of a topic update notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateOp {
    /// A registrar appeared on the topic.
    Add = 0,
    /// A registrar left the topic.
    Remove = 1,
}

/// Payload of an `AUTH` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    /// The credential the connecting node presents.
    pub credential: Credential,
}

/// Payload of a `TOPIC_REG` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRegistration {
    /// Insert or delete.
    pub op: RegistrationOp,
    /// Publisher or subscriber registration.
    pub kind: TopicKind,
    /// Topic path, `/`-separated.
    pub name: Vec<u8>,
    /// Name the registering node uses for this endpoint.
    pub registrar: Vec<u8>,
}

/// Payload of a `TOPIC_UPD` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicUpdate {
    /// Add or remove.
    pub op: UpdateOp,
    /// Registrar the update refers to.
    pub registrar: Vec<u8>,
    /// Address where the registrar can be reached directly.
    pub addr: Vec<u8>,
}

/// Payload of a `SHUTDOWN` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shutdown {
    /// Reason code for the shutdown.
    pub code: u8,
}

/// A protocol message, one variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Admission credential, sent once per connection before anything else.
    Auth(Auth),
    /// Register or deregister a publisher/subscriber on a topic.
    TopicReg(TopicRegistration),
    /// Notify a node that a topic's registrar set changed.
    TopicUpd(TopicUpdate),
    /// Orderly disconnect notice.
    Shutdown(Shutdown),
}

impl Message {
    /// Convenience constructor for an `AUTH` message.
    #[must_use]
    pub fn auth(credential: Credential) -> Self {
        Self::Auth(Auth { credential })
    }

    /// Convenience constructor for a `SHUTDOWN` message.
    #[must_use]
    pub fn shutdown(code: u8) -> Self {
        Self::Shutdown(Shutdown { code })
    }

    /// The wire tag of this message.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Auth(_) => TAG_AUTH,
            Self::TopicReg(_) => TAG_TOPIC_REG,
            Self::TopicUpd(_) => TAG_TOPIC_UPD,
            Self::Shutdown(_) => TAG_SHUTDOWN,
        }
    }

    /// Number of bytes [`encode`](Self::encode) will write: the tag byte
    /// plus the kind-specific payload.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Auth(a) => 1 + a.credential.bytes().len(),
            Self::TopicReg(r) => 2 + 2 + r.name.len() + 2 + r.registrar.len(),
            Self::TopicUpd(u) => 1 + 2 + u.registrar.len() + 2 + u.addr.len(),
            Self::Shutdown(_) => 1,
        }
    }

    /// Serialize this message (tag byte then payload) into `out`.
    ///
    /// Returns the total number of bytes written. The caller is responsible
    /// for prepending the length prefix; use [`frame`](Self::frame) for the
    /// full wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::LengthOverflow`] when a variable-length
    /// field does not fit its wire-format length field.
    pub fn encode(&self, out: &mut BytesMut) -> ProtocolResult<usize> {
        let start = out.len();
        out.put_u8(self.tag());
        match self {
            Self::Auth(a) => {
                let bytes = a.credential.bytes();
                if bytes.len() > MAX_CREDENTIAL_LEN {
                    return Err(ProtocolError::LengthOverflow {
                        len: bytes.len(),
                        max: MAX_CREDENTIAL_LEN,
                    });
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                let size = match &a.credential {
                    Credential::Password(_) => bytes.len() as i8,
                    Credential::SessionId(_) => -(bytes.len() as i8),
                };
                out.put_i8(size);
                out.put_slice(bytes);
            }
            Self::TopicReg(r) => {
                out.put_u8(r.op as u8);
                out.put_u8(r.kind as u8);
                put_len_prefixed(out, &r.name)?;
                put_len_prefixed(out, &r.registrar)?;
            }
            Self::TopicUpd(u) => {
                out.put_u8(u.op as u8);
                put_len_prefixed(out, &u.registrar)?;
                put_len_prefixed(out, &u.addr)?;
            }
            Self::Shutdown(s) => out.put_u8(s.code),
        }
        Ok(out.len() - start)
    }

    /// Deserialize a message from `bytes` (tag byte then payload).
    ///
    /// Requires the kind-specific payload to be complete; trailing bytes are
    /// rejected as untruthful length accounting.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownKind`] for an unrecognized tag,
    /// [`ProtocolError::Truncated`] when the buffer ends before the
    /// advertised field lengths are satisfied (or extends past them).
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut cursor = bytes;
        let tag = take_u8(&mut cursor)?;
        let msg = match tag {
            TAG_AUTH => {
                let size = take_u8(&mut cursor)? as i8;
                let len = usize::from(size.unsigned_abs());
                let identifier = take_bytes(&mut cursor, len)?.to_vec();
                let credential = if size < 0 {
                    Credential::SessionId(identifier)
                } else {
                    Credential::Password(identifier)
                };
                Self::Auth(Auth { credential })
            }
            TAG_TOPIC_REG => {
                let op = match take_u8(&mut cursor)? {
                    0 => RegistrationOp::Insert,
                    1 => RegistrationOp::Delete,
                    tag => return Err(ProtocolError::UnknownKind { tag }),
                };
                let kind = match take_u8(&mut cursor)? {
                    0 => TopicKind::Publish,
                    1 => TopicKind::Subscribe,
                    tag => return Err(ProtocolError::UnknownKind { tag }),
                };
                let name = take_len_prefixed(&mut cursor)?;
                let registrar = take_len_prefixed(&mut cursor)?;
                Self::TopicReg(TopicRegistration {
                    op,
                    kind,
                    name,
                    registrar,
                })
            }
            TAG_TOPIC_UPD => {
                let op = match take_u8(&mut cursor)? {
                    0 => UpdateOp::Add,
                    1 => UpdateOp::Remove,
                    tag => return Err(ProtocolError::UnknownKind { tag }),
                };
                let registrar = take_len_prefixed(&mut cursor)?;
                let addr = take_len_prefixed(&mut cursor)?;
                Self::TopicUpd(TopicUpdate {
                    op,
                    registrar,
                    addr,
                })
            }
            TAG_SHUTDOWN => Self::Shutdown(Shutdown {
                code: take_u8(&mut cursor)?,
            }),
            tag => return Err(ProtocolError::UnknownKind { tag }),
        };
        if !cursor.is_empty() {
            return Err(ProtocolError::Truncated {
                needed: bytes.len() - cursor.len(),
                have: bytes.len(),
            });
        }
        Ok(msg)
    }

    /// Write the full wire form (`[u16 len][tag][payload]`) into `out`.
    ///
    /// Returns the total number of bytes written, header included.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::LengthOverflow`] when the encoded message exceeds
    /// the frame limit.
    pub fn frame(&self, out: &mut BytesMut) -> ProtocolResult<usize> {
        let len = self.encoded_len();
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::LengthOverflow {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        out.reserve(HEADER_LEN + len);
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_LEN
        out.put_u16_le(len as u16);
        let written = self.encode(out)?;
        debug_assert_eq!(written, len);
        Ok(HEADER_LEN + written)
    }

    /// Inverse of [`frame`](Self::frame): parse `[u16 len][tag][payload]`.
    ///
    /// Requires `bytes` to hold exactly `len` bytes after the header.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Truncated`] when the buffer does not match the
    /// announced length, [`ProtocolError::LengthOverflow`] when the prefix
    /// exceeds the frame limit, plus any [`decode`](Self::decode) error.
    pub fn unframe(bytes: &[u8]) -> ProtocolResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN,
                have: bytes.len(),
            });
        }
        let len = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::LengthOverflow {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if bytes.len() != HEADER_LEN + len {
            return Err(ProtocolError::Truncated {
                needed: HEADER_LEN + len,
                have: bytes.len(),
            });
        }
        Self::decode(&bytes[HEADER_LEN..])
    }
}

/// Write a `u16 LE` length prefix followed by the bytes themselves.
fn put_len_prefixed(out: &mut BytesMut, bytes: &[u8]) -> ProtocolResult<()> {
    if bytes.len() > usize::from(u16::MAX) {
        return Err(ProtocolError::LengthOverflow {
            len: bytes.len(),
            max: usize::from(u16::MAX),
        });
    }
    #[allow(clippy::cast_possible_truncation)] // checked above
    out.put_u16_le(bytes.len() as u16);
    out.put_slice(bytes);
    Ok(())
}

fn take_u8(cursor: &mut &[u8]) -> ProtocolResult<u8> {
    if cursor.is_empty() {
        return Err(ProtocolError::Truncated { needed: 1, have: 0 });
    }
    Ok(cursor.get_u8())
}

fn take_bytes<'a>(cursor: &mut &'a [u8], len: usize) -> ProtocolResult<&'a [u8]> {
    if cursor.len() < len {
        return Err(ProtocolError::Truncated {
            needed: len,
            have: cursor.len(),
        });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn take_len_prefixed(cursor: &mut &[u8]) -> ProtocolResult<Vec<u8>> {
    if cursor.len() < 2 {
        return Err(ProtocolError::Truncated {
            needed: 2,
            have: cursor.len(),
        });
    }
    let len = usize::from(cursor.get_u16_le());
    Ok(take_bytes(cursor, len)?.to_vec())
}

/// Frame codec for use with [`tokio_util::codec::Framed`].
///
/// The admission pipeline drives its own resumable receiver (it needs a time
/// budget per entry); once a node is admitted, its connection is wrapped in
/// `Framed<_, MessageCodec>` for the ordinary request/notify loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, TransportError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(u16::from_le_bytes([src[0], src[1]]));

        // Validate the announced length before buffering the body.
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::LengthOverflow {
                len,
                max: MAX_FRAME_LEN,
            }
            .into());
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body: Bytes = src.split_to(len).freeze();
        Ok(Some(Message::decode(&body)?))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        item.frame(dst)?;
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), TransportError> {
        self.encode(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.frame(&mut buf).unwrap();
        buf
    }

    #[test]
    fn auth_password_wire_layout() {
        let msg = Message::auth(Credential::Password(b"samplepasswd\0".to_vec()));
        let buf = framed(&msg);

        // len = tag + size byte + 13 identifier bytes
        assert_eq!(&buf[..2], &[15, 0]);
        assert_eq!(buf[2], TAG_AUTH);
        assert_eq!(buf[3] as i8, 13);
        assert_eq!(&buf[4..], b"samplepasswd\0");

        assert_eq!(Message::unframe(&buf).unwrap(), msg);
    }

    #[test]
    fn auth_session_id_is_negative_on_the_wire() {
        let msg = Message::auth(Credential::SessionId(b"sess".to_vec()));
        let buf = framed(&msg);
        assert_eq!(buf[3] as i8, -4);
        assert_eq!(Message::unframe(&buf).unwrap(), msg);
    }

    #[test]
    fn auth_empty_credential_decodes_as_password() {
        // Zero has no sign, so an empty session id collapses to an empty
        // password after a round trip.
        let msg = Message::auth(Credential::SessionId(Vec::new()));
        let buf = framed(&msg);
        assert_eq!(
            Message::unframe(&buf).unwrap(),
            Message::auth(Credential::Password(Vec::new()))
        );
    }

    #[test]
    fn auth_credential_too_long_overflows() {
        let msg = Message::auth(Credential::Password(vec![0u8; 128]));
        let mut buf = BytesMut::new();
        assert_eq!(
            msg.encode(&mut buf),
            Err(ProtocolError::LengthOverflow { len: 128, max: 127 })
        );
    }

    #[test]
    fn topic_registration_round_trip() {
        let msg = Message::TopicReg(TopicRegistration {
            op: RegistrationOp::Insert,
            kind: TopicKind::Subscribe,
            name: b"/sensors/imu".to_vec(),
            registrar: b"nav-node".to_vec(),
        });
        let buf = framed(&msg);
        assert_eq!(Message::unframe(&buf).unwrap(), msg);

        // Spot-check the length fields are little-endian truthful counts.
        assert_eq!(buf[2], TAG_TOPIC_REG);
        assert_eq!(&buf[5..7], &[12, 0]);
    }

    #[test]
    fn topic_update_round_trip() {
        let msg = Message::TopicUpd(TopicUpdate {
            op: UpdateOp::Remove,
            registrar: b"cam0".to_vec(),
            addr: b"10.0.0.7:4310".to_vec(),
        });
        assert_eq!(Message::unframe(&framed(&msg)).unwrap(), msg);
    }

    #[test]
    fn shutdown_round_trip() {
        let msg = Message::shutdown(2);
        let buf = framed(&msg);
        assert_eq!(&buf[..], &[2, 0, TAG_SHUTDOWN, 2]);
        assert_eq!(Message::unframe(&buf).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(
            Message::decode(&[9, 0]),
            Err(ProtocolError::UnknownKind { tag: 9 })
        );
    }

    #[test]
    fn truncated_body_is_rejected() {
        // AUTH announcing 5 credential bytes but carrying 2.
        let err = Message::decode(&[TAG_AUTH, 5, b'a', b'b']).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { needed: 5, have: 2 });
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let err = Message::decode(&[TAG_SHUTDOWN, 0, 0xff]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn unframe_requires_exact_length() {
        let msg = Message::shutdown(0);
        let mut buf = framed(&msg);
        buf.put_u8(0);
        assert!(matches!(
            Message::unframe(&buf),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_decoding() {
        let msg = Message::TopicReg(TopicRegistration {
            op: RegistrationOp::Insert,
            kind: TopicKind::Publish,
            name: vec![b'a'; 600],
            registrar: vec![b'b'; 600],
        });
        let mut buf = BytesMut::new();
        assert!(matches!(
            msg.frame(&mut buf),
            Err(ProtocolError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn codec_decodes_a_split_stream() {
        let mut codec = MessageCodec;
        let first = Message::auth(Credential::Password(b" ".to_vec()));
        let second = Message::shutdown(1);

        let mut wire = BytesMut::new();
        first.frame(&mut wire).unwrap();
        second.frame(&mut wire).unwrap();

        // Feed the stream one byte at a time; exactly two messages emerge.
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire {
            buf.put_u8(byte);
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                out.push(msg);
            }
        }
        assert_eq!(out, vec![first, second]);
    }

    #[test]
    fn codec_rejects_oversized_announcement() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u16_le(2000);
        buf.put_u8(0);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(TransportError::Protocol(ProtocolError::LengthOverflow { .. }))
        ));
    }
}
