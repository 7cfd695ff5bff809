use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use memchr::memchr;
use serde::{Deserialize, Serialize};

/// Size of the big-endian length header used by [`Framing::LengthPrefixed`]
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// How a continuous byte stream is split into messages
///
/// `Nul` is the native format: `payload, 0x00` repeated with no length
/// prefix. Payloads must not contain a NUL byte. `LengthPrefixed` carries
/// arbitrary binary payloads behind a 4-byte big-endian length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Nul,
    LengthPrefixed,
}

/// Location of one complete message at the front of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the first payload byte
    pub offset: usize,
    /// Payload length
    pub len: usize,
    /// Total bytes to erase from the buffer, framing overhead included
    pub consumed: usize,
}

impl Framing {
    /// Find the first complete message in `buf`
    ///
    /// Returns `None` while the message is still incomplete.
    #[inline]
    pub fn next_frame(&self, buf: &[u8]) -> Option<Frame> {
        match self {
            Framing::Nul => memchr(0, buf).map(|end| Frame {
                offset: 0,
                len: end,
                consumed: end + 1,
            }),
            Framing::LengthPrefixed => {
                let len = declared_len(buf)?;
                let consumed = LENGTH_PREFIX_SIZE.checked_add(len)?;
                (buf.len() >= consumed).then_some(Frame {
                    offset: LENGTH_PREFIX_SIZE,
                    len,
                    consumed,
                })
            }
        }
    }

    /// Payload size the incomplete message at the front of `buf` will reach
    ///
    /// Compared against the configured maximum message size after every
    /// drain. For length-prefixed frames the declared length counts as soon
    /// as the header has arrived.
    pub fn pending_len(&self, buf: &[u8]) -> usize {
        match self {
            Framing::Nul => buf.len(),
            Framing::LengthPrefixed => match declared_len(buf) {
                Some(len) => len.max(buf.len() - LENGTH_PREFIX_SIZE),
                None => buf.len(),
            },
        }
    }

    /// Append `payload` to `dst` as a single frame
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        match self {
            Framing::Nul => {
                if let Some(pos) = memchr(0, payload) {
                    return Err(Error::Protocol(format!(
                        "payload contains a NUL byte at offset {}",
                        pos
                    )));
                }
                dst.reserve(payload.len() + 1);
                dst.extend_from_slice(payload);
                dst.put_u8(0);
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| {
                    Error::Protocol(format!("payload of {} bytes is too large", payload.len()))
                })?;
                dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
                dst.put_u32(len);
                dst.extend_from_slice(payload);
            }
        }
        Ok(())
    }
}

#[inline]
fn declared_len(buf: &[u8]) -> Option<usize> {
    let header: [u8; LENGTH_PREFIX_SIZE] = buf.get(..LENGTH_PREFIX_SIZE)?.try_into().ok()?;
    usize::try_from(u32::from_be_bytes(header)).ok()
}
