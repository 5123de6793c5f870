//! Store channel protocol
//!
//! Every message is one frame: an 8-byte header followed by a MessagePack
//! payload.
//!
//! ```text
//! ┌──────────┬─────────┬──────┬────────────┬──────────────────────┐
//! │ magic u16│ version │ kind │ length u32 │ payload (length B)   │
//! │  0x5753  │   u8    │  u8  │    LE      │ rmp-serde, named     │
//! └──────────┴─────────┴──────┴────────────┴──────────────────────┘
//! ```
//!
//! The client sends one [`Request`] and blocks until the matching
//! [`Response`]; requests on a connection are never pipelined.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ShmError, ShmResult};
use crate::id::ObjectId;
use crate::segment::SegmentInfo;
use crate::tensor::TensorMeta;

/// Frame magic ("WS")
pub const FRAME_MAGIC: u16 = 0x5753;
/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame kinds
pub mod frame_kind {
    /// Client to store
    pub const REQUEST: u8 = 0x01;
    /// Store to client
    pub const RESPONSE: u8 = 0x02;
}

/// Frame header (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame kind
    pub kind: u8,
    /// Payload length
    pub length: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(FRAME_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind);
        buf.put_u32_le(self.length);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut impl Buf) -> ShmResult<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(ShmError::Protocol("incomplete frame header".into()));
        }
        let magic = buf.get_u16_le();
        if magic != FRAME_MAGIC {
            return Err(ShmError::Protocol(format!("bad frame magic {magic:#06x}")));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ShmError::Protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        Ok(Self {
            kind: buf.get_u8(),
            length: buf.get_u32_le(),
        })
    }
}

/// Client to store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum Request {
    /// Open a session
    Hello {
        /// Client process id
        pid: u32,
    },
    /// Allocate an unsealed object
    Create {
        /// Object identifier
        id: ObjectId,
        /// Tensor metadata stored with the object
        meta: TensorMeta,
        /// Byte length
        nbytes: u64,
    },
    /// Publish an object created on this connection
    Seal {
        /// Object identifier
        id: ObjectId,
    },
    /// Discard an unsealed object created on this connection
    Abort {
        /// Object identifier
        id: ObjectId,
    },
    /// Register `id` as another name for the bytes of `source`
    Link {
        /// New identifier
        id: ObjectId,
        /// Existing sealed object
        source: ObjectId,
    },
    /// Resolve a sealed object
    Get {
        /// Object identifier
        id: ObjectId,
    },
    /// Whether a sealed object exists
    Contains {
        /// Object identifier
        id: ObjectId,
    },
    /// Enumerate sealed objects
    List,
    /// Remove an object from the index
    Delete {
        /// Object identifier
        id: ObjectId,
    },
    /// Store usage
    Stats,
}

impl Request {
    /// Short operation name for logs and errors
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Create { .. } => "create",
            Request::Seal { .. } => "seal",
            Request::Abort { .. } => "abort",
            Request::Link { .. } => "link",
            Request::Get { .. } => "get",
            Request::Contains { .. } => "contains",
            Request::List => "list",
            Request::Delete { .. } => "delete",
            Request::Stats => "stats",
        }
    }
}

/// Store usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Sealed identifiers
    pub objects: usize,
    /// Distinct segments, including unsealed ones
    pub segments: usize,
    /// Bytes allocated
    pub used_bytes: u64,
    /// Capacity in bytes
    pub capacity_bytes: u64,
}

/// Failure category carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Unknown identifier
    NotFound,
    /// Identifier already used
    Duplicate,
    /// Store is full
    Capacity,
    /// Request not valid in the current state
    InvalidRequest,
    /// Store-side failure
    Internal,
}

/// Store to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body")]
pub enum Response {
    /// Session opened
    Welcome {
        /// Random token identifying this store instance
        store_id: u64,
        /// Arena directory
        shm_dir: std::path::PathBuf,
        /// Capacity in bytes
        capacity_bytes: u64,
    },
    /// An object and where its bytes live
    Segment {
        /// Tensor metadata
        meta: TensorMeta,
        /// Segment location
        segment: SegmentInfo,
    },
    /// Boolean answer
    Bool(bool),
    /// Identifier listing
    Ids(Vec<ObjectId>),
    /// Usage counters
    Stats(StoreStats),
    /// Request completed
    Done,
    /// Request failed
    Error {
        /// Failure category
        kind: ErrorKind,
        /// Identifier involved, if any
        id: Option<ObjectId>,
        /// Store-side description
        message: String,
        /// Bytes requested, for capacity failures
        requested: u64,
        /// Bytes available, for capacity failures
        available: u64,
    },
}

impl Response {
    /// Error response for a typed store error
    pub fn from_error(err: &ShmError) -> Self {
        let (kind, id, requested, available) = match err {
            ShmError::NotFound(id) => (ErrorKind::NotFound, Some(id.clone()), 0, 0),
            ShmError::DuplicateIdentifier(id) => (ErrorKind::Duplicate, Some(id.clone()), 0, 0),
            ShmError::Capacity {
                requested,
                available,
            } => (ErrorKind::Capacity, None, *requested, *available),
            ShmError::InvalidIdentifier(_)
            | ShmError::InvalidDescriptor(_)
            | ShmError::InvalidLayout(_)
            | ShmError::DeviceIncompatible { .. }
            | ShmError::Protocol(_) => (ErrorKind::InvalidRequest, None, 0, 0),
            _ => (ErrorKind::Internal, None, 0, 0),
        };
        Response::Error {
            kind,
            id,
            message: err.to_string(),
            requested,
            available,
        }
    }

    /// Turn an error response back into the typed error
    pub fn into_result(self) -> ShmResult<Self> {
        match self {
            Response::Error {
                kind,
                id,
                message,
                requested,
                available,
            } => Err(match (kind, id) {
                (ErrorKind::NotFound, Some(id)) => ShmError::NotFound(id),
                (ErrorKind::Duplicate, Some(id)) => ShmError::DuplicateIdentifier(id),
                (ErrorKind::Capacity, _) => ShmError::Capacity {
                    requested,
                    available,
                },
                (ErrorKind::InvalidRequest, _) => ShmError::Protocol(message),
                _ => ShmError::Protocol(format!("store error: {message}")),
            }),
            other => Ok(other),
        }
    }
}

/// Encode one frame
pub fn encode_frame<T: Serialize>(kind: u8, msg: &T) -> ShmResult<BytesMut> {
    let payload = rmp_serde::to_vec_named(msg)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| ShmError::Protocol(format!("frame of {} bytes", payload.len())))?;
    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + payload.len());
    FrameHeader { kind, length }.encode(&mut buf);
    buf.put_slice(&payload);
    Ok(buf)
}

fn decode_payload<T: DeserializeOwned>(
    header: FrameHeader,
    expected_kind: u8,
    payload: &[u8],
) -> ShmResult<T> {
    if header.kind != expected_kind {
        return Err(ShmError::Protocol(format!(
            "expected frame kind {expected_kind:#04x}, got {:#04x}",
            header.kind
        )));
    }
    Ok(rmp_serde::from_slice(payload)?)
}

fn check_length(header: &FrameHeader, max_frame_bytes: u32) -> ShmResult<()> {
    if header.length > max_frame_bytes {
        return Err(ShmError::Protocol(format!(
            "frame of {} bytes exceeds limit of {max_frame_bytes}",
            header.length
        )));
    }
    Ok(())
}

/// Write one frame to a blocking stream
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, kind: u8, msg: &T) -> std::io::Result<()> {
    let frame = encode_frame(kind, msg).map_err(std::io::Error::other)?;
    w.write_all(&frame)?;
    w.flush()
}

/// Read one frame of `expected_kind` from a blocking stream
pub fn read_frame<R: Read, T: DeserializeOwned>(
    r: &mut R,
    expected_kind: u8,
    max_frame_bytes: u32,
) -> ShmResult<T> {
    let mut head = [0u8; FrameHeader::SIZE];
    r.read_exact(&mut head)
        .map_err(|e| ShmError::from_channel_io(e, "read frame header"))?;
    let header = FrameHeader::decode(&mut &head[..])?;
    check_length(&header, max_frame_bytes)?;

    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload)
        .map_err(|e| ShmError::from_channel_io(e, "read frame payload"))?;
    decode_payload(header, expected_kind, &payload)
}

/// Read one frame of `expected_kind` from an async stream.
///
/// Returns `Ok(None)` on a clean end of stream before a header.
pub async fn read_frame_async<R, T>(
    r: &mut R,
    expected_kind: u8,
    max_frame_bytes: u32,
) -> ShmResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut head = [0u8; FrameHeader::SIZE];
    match r.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let header = FrameHeader::decode(&mut &head[..])?;
    check_length(&header, max_frame_bytes)?;

    let mut payload = vec![0u8; header.length as usize];
    r.read_exact(&mut payload).await?;
    decode_payload(header, expected_kind, &payload).map(Some)
}

/// Write one frame to an async stream
pub async fn write_frame_async<W, T>(w: &mut W, kind: u8, msg: &T) -> ShmResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(kind, msg)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::dtype::DataType;

    fn sample_meta() -> TensorMeta {
        TensorMeta::contiguous(Device::CPU, DataType::INT64, &[2, 3])
    }

    #[test]
    fn test_header_encode_decode() {
        let mut buf = BytesMut::new();
        FrameHeader {
            kind: frame_kind::REQUEST,
            length: 42,
        }
        .encode(&mut buf);
        assert_eq!(buf.len(), FrameHeader::SIZE);

        let header = FrameHeader::decode(&mut buf.freeze()).unwrap();
        assert_eq!(header.kind, frame_kind::REQUEST);
        assert_eq!(header.length, 42);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = &[0xffu8, 0xff, 1, 1, 0, 0, 0, 0][..];
        assert!(matches!(
            FrameHeader::decode(&mut bytes),
            Err(ShmError::Protocol(_))
        ));
        let mut short = &[0x53u8, 0x57][..];
        assert!(FrameHeader::decode(&mut short).is_err());
    }

    #[test]
    fn test_blocking_frame_roundtrip() {
        let req = Request::Create {
            id: ObjectId::new("test111").unwrap(),
            meta: sample_meta(),
            nbytes: 48,
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, frame_kind::REQUEST, &req).unwrap();

        let decoded: Request = read_frame(&mut &wire[..], frame_kind::REQUEST, 1 << 20).unwrap();
        assert_eq!(decoded, req);

        // wrong direction
        let err = read_frame::<_, Response>(&mut &wire[..], frame_kind::RESPONSE, 1 << 20)
            .unwrap_err();
        assert!(matches!(err, ShmError::Protocol(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame_kind::RESPONSE, &Response::Ids(vec![])).unwrap();
        let err = read_frame::<_, Response>(&mut &wire[..], frame_kind::RESPONSE, 1).unwrap_err();
        assert!(matches!(err, ShmError::Protocol(_)));
    }

    #[test]
    fn test_truncated_stream_is_connection_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, frame_kind::RESPONSE, &Response::Done).unwrap();
        wire.truncate(wire.len() - 1);
        let err = read_frame::<_, Response>(&mut &wire[..], frame_kind::RESPONSE, 1 << 20)
            .unwrap_err();
        assert!(matches!(err, ShmError::Connection(_)));
    }

    #[test]
    fn test_error_response_maps_to_typed_error() {
        let id = ObjectId::new("nonexistent").unwrap();
        let resp = Response::from_error(&ShmError::NotFound(id.clone()));
        assert!(matches!(resp.into_result(), Err(ShmError::NotFound(got)) if got == id));

        let resp = Response::from_error(&ShmError::DuplicateIdentifier(id.clone()));
        assert!(matches!(resp.into_result(), Err(ShmError::DuplicateIdentifier(_))));

        let resp = Response::from_error(&ShmError::Capacity {
            requested: 10,
            available: 3,
        });
        assert!(matches!(
            resp.into_result(),
            Err(ShmError::Capacity {
                requested: 10,
                available: 3
            })
        ));

        assert!(Response::Done.into_result().is_ok());
    }

    #[tokio::test]
    async fn test_async_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let resp = Response::Segment {
            meta: sample_meta(),
            segment: SegmentInfo {
                path: "/dev/shm/warp-shm/seg-1".into(),
                nbytes: 48,
            },
        };
        write_frame_async(&mut a, frame_kind::RESPONSE, &resp).await.unwrap();
        drop(a);

        let got: Option<Response> = read_frame_async(&mut b, frame_kind::RESPONSE, 1 << 20)
            .await
            .unwrap();
        assert_eq!(got, Some(resp));

        let eof: Option<Response> = read_frame_async(&mut b, frame_kind::RESPONSE, 1 << 20)
            .await
            .unwrap();
        assert!(eof.is_none());
    }
}
