use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Msg, MAX_MESSAGE_SIZE};

/// Length prefix plus type tag.
const HEADER_SIZE: usize = 5;

/// Frames [`Msg`]s on a byte stream as `[4 bytes BE len][1 byte tag][payload]`.
///
/// `len` counts the tag and the bincode payload. The tag is redundant with
/// the payload's own variant index and is checked against it on decode.
#[derive(Clone, Copy, Debug)]
pub struct MsgCodec {
    max_size: usize,
}

impl Default for MsgCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MsgCodec {
    /// A codec refusing payloads above `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encode a message with framing.
    pub fn encode(&self, msg: &Msg) -> ProtocolResult<Vec<u8>> {
        let payload =
            bincode::serialize(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if payload.len() > self.max_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_size,
            });
        }
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32((payload.len() + 1) as u32);
        buf.put_u8(msg.type_tag());
        buf.put_slice(&payload);
        Ok(buf.to_vec())
    }

    /// Decode one framed message. Returns the message and the number of
    /// bytes it occupied.
    pub fn decode(&self, data: &[u8]) -> ProtocolResult<(Msg, usize)> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Framing("too short".into()));
        }
        let len = self.frame_len(&data[..4])?;
        let total = 4 + len;
        if data.len() < total {
            return Err(ProtocolError::Framing(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        let msg = self.decode_body(data[4], &data[HEADER_SIZE..total])?;
        Ok((msg, total))
    }

    /// Take one message off the front of `buf`, or `None` if a whole frame
    /// has not arrived yet.
    pub fn decode_buf(&self, buf: &mut BytesMut) -> ProtocolResult<Option<Msg>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = self.frame_len(&buf[..4])?;
        if buf.len() < 4 + len {
            buf.reserve(4 + len - buf.len());
            return Ok(None);
        }
        buf.advance(4);
        let frame = buf.split_to(len);
        self.decode_body(frame[0], &frame[1..]).map(Some)
    }

    /// Read one message. `Ok(None)` on a clean end of stream.
    pub async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R) -> ProtocolResult<Option<Msg>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = self.frame_len(&len_buf)?;
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        let msg = self.decode_body(frame[0], &frame[1..])?;
        trace!(kind = msg.type_name(), size = len, "frame read");
        Ok(Some(msg))
    }

    /// Write one message and flush.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W, msg: &Msg) -> ProtocolResult<()> {
        let frame = self.encode(msg)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        trace!(kind = msg.type_name(), size = frame.len(), "frame written");
        Ok(())
    }

    fn frame_len(&self, prefix: &[u8]) -> ProtocolResult<usize> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(prefix);
        let len = u32::from_be_bytes(raw) as usize;
        if len < 1 {
            return Err(ProtocolError::Framing("zero-length frame".into()));
        }
        if len - 1 > self.max_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len - 1,
                max: self.max_size,
            });
        }
        Ok(len)
    }

    fn decode_body(&self, tag: u8, payload: &[u8]) -> ProtocolResult<Msg> {
        let msg: Msg = bincode::deserialize(payload)
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::TagMismatch {
                tag,
                payload: msg.type_tag(),
            });
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use cxo_crypto::SecretKey;
    use cxo_skyobject::Root;
    use cxo_types::Hash;

    use super::*;
    use crate::message::PROTOCOL_VERSION;

    macro_rules! roundtrip_test {
        ($name:ident, $msg:expr) => {
            #[test]
            fn $name() {
                let codec = MsgCodec::default();
                let msg = $msg;
                let encoded = codec.encode(&msg).unwrap();
                let (decoded, consumed) = codec.decode(&encoded).unwrap();
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
        };
    }

    roundtrip_test!(hello_roundtrip, Msg::Hello { version: PROTOCOL_VERSION });
    roundtrip_test!(reject_roundtrip, Msg::Reject { reason: "version".into() });
    roundtrip_test!(subscribe_roundtrip, Msg::Subscribe {
        feed: SecretKey::generate().pub_key(),
    });
    roundtrip_test!(list_of_feeds_roundtrip, Msg::ListOfFeeds {
        feeds: vec![SecretKey::generate().pub_key(), SecretKey::generate().pub_key()],
    });
    roundtrip_test!(root_roundtrip, Msg::Root {
        root: Root::sign(&SecretKey::generate(), 7, 1, Hash::sum(b"prev"), Hash::sum(b"top")),
    });
    roundtrip_test!(data_roundtrip, Msg::Data {
        hash: Hash::sum(b"payload"),
        bytes: b"payload".to_vec(),
    });
    roundtrip_test!(dont_have_roundtrip, Msg::DontHave { hash: Hash::sum(b"x") });

    fn all() -> Vec<Msg> {
        let feed = SecretKey::generate().pub_key();
        let h = Hash::sum(b"h");
        vec![
            Msg::Hello { version: 1 },
            Msg::Accept,
            Msg::Reject { reason: String::new() },
            Msg::Ping,
            Msg::Pong,
            Msg::Subscribe { feed },
            Msg::Unsubscribe { feed },
            Msg::AcceptSubscription { feed },
            Msg::RejectSubscription { feed },
            Msg::RequestListOfFeeds,
            Msg::ListOfFeeds { feeds: vec![] },
            Msg::NonPublicServer,
            Msg::Root {
                root: Root::sign(&SecretKey::generate(), 0, 0, Hash::blank(), h),
            },
            Msg::RootDone { feed, seq: 0 },
            Msg::Request { hash: h },
            Msg::Data { hash: h, bytes: vec![] },
            Msg::DontHave { hash: h },
        ]
    }

    #[test]
    fn type_tags_unique() {
        let mut tags: Vec<u8> = all().iter().map(|m| m.type_tag()).collect();
        let len = tags.len();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), len, "type tags should be unique");
    }

    #[test]
    fn type_names_correct() {
        assert_eq!(Msg::Ping.type_name(), "Ping");
        assert_eq!(Msg::Request { hash: Hash::blank() }.type_name(), "Request");
    }

    #[test]
    fn decode_truncated() {
        let err = MsgCodec::default().decode(&[0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn decode_zero_length() {
        let data = [0u8, 0, 0, 0, 0];
        let err = MsgCodec::default().decode(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing(_)));
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let codec = MsgCodec::default();
        let mut frame = codec.encode(&Msg::Ping).unwrap();
        frame[4] = Msg::Pong.type_tag();
        assert!(matches!(
            codec.decode(&frame),
            Err(ProtocolError::TagMismatch { .. })
        ));
    }

    #[test]
    fn size_limit_applies_both_ways() {
        let small = MsgCodec::new(64);
        let big = Msg::Data {
            hash: Hash::blank(),
            bytes: vec![0; 128],
        };
        assert!(matches!(
            small.encode(&big),
            Err(ProtocolError::FrameTooLarge { max: 64, .. })
        ));
        let frame = MsgCodec::default().encode(&big).unwrap();
        assert!(matches!(
            small.decode(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decode_buf_waits_for_whole_frames() {
        let codec = MsgCodec::default();
        let mut stream = Vec::new();
        for msg in all() {
            stream.extend(codec.encode(&msg).unwrap());
        }

        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for chunk in stream.chunks(7) {
            buf.extend_from_slice(chunk);
            while let Some(msg) = codec.decode_buf(&mut buf).unwrap() {
                out.push(msg.type_tag());
            }
        }
        assert!(buf.is_empty());
        assert_eq!(out, all().iter().map(Msg::type_tag).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn async_read_write() {
        let codec = MsgCodec::default();
        let (mut a, mut b) = tokio::io::duplex(1024);
        codec.write(&mut a, &Msg::Ping).await.unwrap();
        codec
            .write(&mut a, &Msg::Request { hash: Hash::sum(b"x") })
            .await
            .unwrap();
        drop(a);

        assert_eq!(codec.read(&mut b).await.unwrap(), Some(Msg::Ping));
        assert!(matches!(
            codec.read(&mut b).await.unwrap(),
            Some(Msg::Request { .. })
        ));
        assert_eq!(codec.read(&mut b).await.unwrap(), None);
    }
}
