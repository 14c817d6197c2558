//! Binary frame codec
//!
//! Wire format (all multi-byte integers big-endian):
//!
//! ```text
//! [Length:4][Checksum:4][Version:1][Status:1][Cmd:2][ServiceId:2][Seq:4][Body:0..4096]
//! ```
//!
//! - `Length` counts the bytes that follow it (checksum + header + body)
//! - `Checksum` is CRC-32 (IEEE) over header + body
//!
//! Size, checksum and header errors are fatal to the connection.

use std::sync::Arc;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::net::buffer::{shared_pool, BufferPool};
use crate::net::transport::{split_stream, BoxedReader, BoxedWriter, Deadline};

pub const FIELD_SIZE_LEN: usize = 4;
pub const FIELD_SIZE_CHECKSUM: usize = 4;

/// Header size: version(1) + status(1) + cmd(2) + service_id(2) + seq(4)
pub const HEADER_SIZE: usize = 10;

/// Fixed per-frame overhead: length prefix + checksum + header
pub const FRAME_OVERHEAD: usize = FIELD_SIZE_LEN + FIELD_SIZE_CHECKSUM + HEADER_SIZE;

/// Maximum body size (4KB)
pub const MAX_BODY_SIZE: usize = 1 << 12;

/// Maximum size of a complete frame on the wire
pub const MAX_FRAME_SIZE: usize = FRAME_OVERHEAD + MAX_BODY_SIZE;

/// Smallest legal value of the length prefix
pub const MIN_PAYLOAD_SIZE: usize = FIELD_SIZE_CHECKSUM + HEADER_SIZE;

/// Largest legal value of the length prefix
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FIELD_SIZE_LEN;

// Offsets into a complete frame buffer
const OFFSET_CHECKSUM: usize = FIELD_SIZE_LEN;
const OFFSET_HEADER: usize = OFFSET_CHECKSUM + FIELD_SIZE_CHECKSUM;
const OFFSET_BODY: usize = OFFSET_HEADER + HEADER_SIZE;

/// Login request (first frame of every TCP session)
pub const CMD_LOGIN: u16 = 1;
/// Client heartbeat, echoed back by the server
pub const CMD_HEARTBEAT: u16 = 2;
/// Application message forwarded upstream
pub const CMD_POST: u16 = 3;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// One wire-level message
///
/// Constructed fresh per send/receive and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub status: u8,
    pub cmd: u16,
    pub service_id: u16,
    pub seq: u32,
    pub data: Vec<u8>,
}

impl Message {
    /// Create a message with version 1 and status OK
    pub fn new(cmd: u16, seq: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            version: 1,
            status: STATUS_OK,
            cmd,
            service_id: 0,
            seq,
            data: data.into(),
        }
    }

    /// Same header with a different status and body
    pub fn reply(&self, status: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            data: data.into(),
            ..self.clone()
        }
    }

    /// Checksum + header + body
    #[inline]
    pub fn payload_size(&self) -> usize {
        FIELD_SIZE_CHECKSUM + HEADER_SIZE + self.data.len()
    }

    /// Complete frame size including the length prefix
    #[inline]
    pub fn frame_size(&self) -> usize {
        FRAME_OVERHEAD + self.data.len()
    }
}

/// Validate a declared length prefix
pub fn check_payload_size(size: usize) -> std::result::Result<(), ProtocolError> {
    if size < MIN_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooSmall {
            size,
            min: MIN_PAYLOAD_SIZE,
        });
    }
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Encode a complete frame into `buf`, returning the frame length
pub fn encode_into(msg: &Message, buf: &mut [u8]) -> std::result::Result<usize, ProtocolError> {
    let frame_size = msg.frame_size();
    if frame_size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame_size,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: frame_size,
            max: buf.len(),
        });
    }

    let frame = &mut buf[..frame_size];
    {
        let mut cursor = &mut frame[..];
        cursor.put_u32(msg.payload_size() as u32);
        cursor.put_u32(0); // checksum, filled in below
        cursor.put_u8(msg.version);
        cursor.put_u8(msg.status);
        cursor.put_u16(msg.cmd);
        cursor.put_u16(msg.service_id);
        cursor.put_u32(msg.seq);
        cursor.put_slice(&msg.data);
    }

    let checksum = crc32fast::hash(&frame[OFFSET_HEADER..]);
    (&mut frame[OFFSET_CHECKSUM..OFFSET_HEADER]).put_u32(checksum);

    Ok(frame_size)
}

/// Decode checksum + header + body (everything after the length prefix)
///
/// The body is copied out, so `payload` may live in a pooled buffer.
pub fn decode_payload(payload: &[u8]) -> std::result::Result<Message, ProtocolError> {
    check_payload_size(payload.len())?;

    let (mut checksum_bytes, data) = payload.split_at(FIELD_SIZE_CHECKSUM);
    let expected = checksum_bytes.get_u32();
    let actual = crc32fast::hash(data);
    if expected != actual {
        return Err(ProtocolError::ChecksumFailed { expected, actual });
    }

    let (mut header, body) = data.split_at(HEADER_SIZE);
    Ok(Message {
        version: header.get_u8(),
        status: header.get_u8(),
        cmd: header.get_u16(),
        service_id: header.get_u16(),
        seq: header.get_u32(),
        data: body.to_vec(),
    })
}

/// Read one validated frame
pub async fn read_frame<R>(reader: &mut R, pool: &Arc<BufferPool>) -> Result<Message>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; FIELD_SIZE_LEN];
    reader.read_exact(&mut len_buf).await?;
    let payload_size = u32::from_be_bytes(len_buf) as usize;
    check_payload_size(payload_size)?;

    let mut buf = pool.acquire();
    let payload = &mut buf[..payload_size];
    reader.read_exact(payload).await?;

    let msg = decode_payload(payload)?;
    trace!(
        cmd = msg.cmd,
        seq = msg.seq,
        len = msg.data.len(),
        "Frame received"
    );
    Ok(msg)
}

/// Write one frame with a single write call
pub async fn write_frame<W>(writer: &mut W, pool: &Arc<BufferPool>, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = pool.acquire();
    let frame_size = encode_into(msg, &mut buf)?;
    writer.write_all(&buf[..frame_size]).await?;
    writer.flush().await?;
    trace!(cmd = msg.cmd, seq = msg.seq, frame_size, "Frame sent");
    Ok(())
}

/// Frame codec bound to one connection
///
/// Reads and writes are independently serialised, so one task may block in
/// `receive` while another sends.
pub struct Codec {
    reader: AsyncMutex<BoxedReader>,
    writer: AsyncMutex<BoxedWriter>,
    pool: Arc<BufferPool>,
    read_deadline: Deadline,
    write_deadline: Deadline,
}

impl Codec {
    /// Create a codec over any bidirectional stream using the shared pool
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_pool(stream, shared_pool())
    }

    /// Create a codec with a dedicated buffer pool
    pub fn with_pool<S>(stream: S, pool: Arc<BufferPool>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = split_stream(stream);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            pool,
            read_deadline: Deadline::new(),
            write_deadline: Deadline::new(),
        }
    }

    pub fn set_read_deadline(&self, at: Instant) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&self, at: Instant) {
        self.write_deadline.set(at);
    }

    /// Block until one complete, validated frame is read
    pub async fn receive(&self) -> Result<Message> {
        self.read_deadline
            .run(async {
                let mut reader = self.reader.lock().await;
                read_frame(&mut *reader, &self.pool).await
            })
            .await
    }

    /// Block until the frame is fully written
    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.write_deadline
            .run(async {
                let mut writer = self.writer.lock().await;
                write_frame(&mut *writer, &self.pool, msg).await
            })
            .await
    }

    /// Shut down the write side of the stream
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("read_deadline", &self.read_deadline.get())
            .field("write_deadline", &self.write_deadline.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeehiveError;
    use pretty_assertions::assert_eq;

    fn sample_message(data: &[u8]) -> Message {
        Message {
            version: 1,
            status: 0,
            cmd: 100,
            service_id: 200,
            seq: 12345,
            data: data.to_vec(),
        }
    }

    fn encode(msg: &Message) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let n = encode_into(msg, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    async fn decode(bytes: &[u8]) -> Result<Message> {
        let pool = Arc::new(BufferPool::new(2));
        let mut reader = bytes;
        read_frame(&mut reader, &pool).await
    }

    #[test]
    fn test_size_constants() {
        assert_eq!(HEADER_SIZE, 10);
        assert_eq!(FRAME_OVERHEAD, 18);
        assert_eq!(MAX_FRAME_SIZE, 4114);
    }

    #[test]
    fn test_message_helpers() {
        let msg = sample_message(b"test");
        assert_eq!(msg.payload_size(), FIELD_SIZE_CHECKSUM + HEADER_SIZE + 4);
        assert_eq!(msg.frame_size(), FRAME_OVERHEAD + 4);
    }

    #[test]
    fn test_encode_layout() {
        let msg = sample_message(b"hi");
        let bytes = encode(&msg);

        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], &16u32.to_be_bytes());
        assert_eq!(bytes[8], 1);
        assert_eq!(bytes[9], 0);
        assert_eq!(&bytes[10..12], &100u16.to_be_bytes());
        assert_eq!(&bytes[12..14], &200u16.to_be_bytes());
        assert_eq!(&bytes[14..18], &12345u32.to_be_bytes());
        assert_eq!(&bytes[18..], b"hi");

        let checksum = crc32fast::hash(&bytes[8..]);
        assert_eq!(&bytes[4..8], &checksum.to_be_bytes());
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = sample_message(b"Hello, Beehive!");
        let decoded = decode(&encode(&msg)).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_roundtrip_empty_body() {
        let msg = sample_message(b"");
        let decoded = decode(&encode(&msg)).await.unwrap();
        assert!(decoded.data.is_empty());
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_roundtrip_max_body() {
        let data: Vec<u8> = (0..MAX_BODY_SIZE).map(|i| (i % 256) as u8).collect();
        let msg = sample_message(&data);
        let bytes = encode(&msg);
        assert_eq!(bytes.len(), MAX_FRAME_SIZE);

        let decoded = decode(&bytes).await.unwrap();
        assert_eq!(decoded.data, data);
    }

    #[test]
    fn test_encode_body_too_large() {
        let msg = sample_message(&vec![0u8; MAX_BODY_SIZE + 1]);
        let mut buf = vec![0u8; MAX_FRAME_SIZE + 16];
        let err = encode_into(&msg, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_every_single_bit_flip_fails_checksum() {
        let msg = sample_message(b"flip me");
        let bytes = encode(&msg);

        for byte in OFFSET_HEADER..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte] ^= 1 << bit;
                let err = decode(&corrupted).await.unwrap_err();
                assert!(
                    matches!(
                        err,
                        BeehiveError::Protocol(ProtocolError::ChecksumFailed { .. })
                    ),
                    "byte {} bit {} produced {:?}",
                    byte,
                    bit,
                    err
                );
            }
        }
    }

    #[tokio::test]
    async fn test_declared_size_too_small() {
        let bytes = ((MIN_PAYLOAD_SIZE - 1) as u32).to_be_bytes();
        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(
            err,
            BeehiveError::Protocol(ProtocolError::FrameTooSmall { size: 13, .. })
        ));
    }

    #[tokio::test]
    async fn test_declared_size_too_large() {
        let bytes = ((MAX_FRAME_SIZE + 1000) as u32).to_be_bytes();
        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(
            err,
            BeehiveError::Protocol(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_short_read_is_io_error() {
        let mut bytes = ((MIN_PAYLOAD_SIZE + 10) as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);

        let err = decode(&bytes).await.unwrap_err();
        match err {
            BeehiveError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected I/O error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_checksum_constructed_by_hand() {
        let mut bytes = Vec::new();
        bytes.put_u32((MIN_PAYLOAD_SIZE + 10) as u32);
        bytes.put_u32(0xDEAD_BEEF);
        bytes.put_u8(1);
        bytes.put_u8(0);
        bytes.put_u16(100);
        bytes.put_u16(200);
        bytes.put_u32(12345);
        bytes.put_slice(b"test data!");

        let err = decode(&bytes).await.unwrap_err();
        assert!(matches!(
            err,
            BeehiveError::Protocol(ProtocolError::ChecksumFailed {
                expected: 0xDEAD_BEEF,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_codec_over_duplex() {
        let (client, server) = tokio::io::duplex(MAX_FRAME_SIZE * 2);
        let client = Codec::new(client);
        let server = Codec::new(server);

        let first = sample_message(b"one");
        let second = Message::new(CMD_HEARTBEAT, 2, Vec::new());
        client.send(&first).await.unwrap();
        client.send(&second).await.unwrap();

        assert_eq!(server.receive().await.unwrap(), first);
        assert_eq!(server.receive().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_codec_close_ends_peer_stream() {
        let (client, server) = tokio::io::duplex(256);
        let client = Codec::new(client);
        let server = Codec::new(server);

        client.close().await.unwrap();
        let err = server.receive().await.unwrap_err();
        assert!(matches!(err, BeehiveError::Io(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_codec_read_deadline() {
        let (_client, server) = tokio::io::duplex(256);
        let server = Codec::new(server);

        server.set_read_deadline(Instant::now() + std::time::Duration::from_millis(10));
        let err = server.receive().await.unwrap_err();
        assert!(matches!(
            err,
            BeehiveError::Network(crate::error::NetworkError::Timeout)
        ));
    }

    #[test]
    fn test_reply_keeps_header() {
        let msg = sample_message(b"login");
        let reply = msg.reply(STATUS_ERROR, "nope");
        assert_eq!(reply.cmd, msg.cmd);
        assert_eq!(reply.seq, msg.seq);
        assert_eq!(reply.status, STATUS_ERROR);
        assert_eq!(reply.data, b"nope".to_vec());
    }
}
