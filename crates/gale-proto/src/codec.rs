//! Length-prefixed frame codec.
//!
//! Wire unit: `[4-byte big-endian length][1-byte type][payload]`. The length
//! covers the type byte plus payload and is capped at [`MAX_FRAME_LEN`].
//! The codec is generic over the transport so TCP and TLS connections share
//! one implementation, and it splits into independent read/write halves so a
//! dedicated reader task and a single writer task can own them separately.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::frame::Frame;

/// Frames larger than this are rejected before any allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors produced by the frame codec. All of them are fatal to the
/// connection they occurred on.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("frame has no type byte")]
    EmptyFrame,

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("frame payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Read one frame. `Ok(None)` means the peer closed the connection cleanly
/// on a frame boundary; EOF mid-frame is [`ProtoError::Truncated`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(Frame, u64)>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtoError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProtoError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtoError::Truncated
        } else {
            ProtoError::Io(e)
        }
    })?;

    let frame = Frame::decode(body[0], &body[1..])?;
    Ok(Some((frame, (4 + len) as u64)))
}

/// Write one frame. The frame is written as a single buffer so it is atomic
/// with respect to other frames from the same producer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<u64, ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.encode_payload()?;
    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.push(frame.frame_type().as_u8());
    buf.extend_from_slice(&payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(buf.len() as u64)
}

/// A framed control connection, used whole during the handshake and split
/// into halves for the serving loop.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ProtoError> {
        write_frame(&mut self.stream, frame).await.map(|_| ())
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, ProtoError> {
        Ok(read_frame(&mut self.stream).await?.map(|(f, _)| f))
    }

    pub fn into_split(self) -> (FramedReader<ReadHalf<S>>, FramedWriter<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (FramedReader::new(r), FramedWriter::new(w))
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Read half of a framed connection. Tracks bytes consumed for counters.
pub struct FramedReader<R> {
    inner: R,
    bytes_read: u64,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, ProtoError> {
        match read_frame(&mut self.inner).await? {
            Some((frame, n)) => {
                self.bytes_read += n;
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Write half of a framed connection. Tracks bytes produced for counters.
pub struct FramedWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W> FramedWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), ProtoError> {
        let n = write_frame(&mut self.inner, frame).await?;
        self.bytes_written += n;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}
