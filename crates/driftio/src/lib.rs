//! `driftio`: newline-framed transport for the driftd protocol.
//!
//! A frame is everything up to a `\n`; payloads are delimiter-encoded
//! text and can never contain one, so the terminator doubles as the
//! whole framing layer. `\r\n` terminators are accepted and the `\r`
//! removed.

use std::io;

use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// An unterminated run longer than this is a protocol violation, not
/// a frame still in flight.
const DEFAULT_FRAME_LIMIT: usize = 16 * 1024;

#[derive(Debug)]
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
    /// How far into `buf` previous scans got without finding a
    /// terminator; the next scan starts here instead of rescanning.
    scanned: usize,
    limit: usize,
}

impl<R> FrameReader<R> {
    pub fn new(io: R) -> Self {
        Self::with_limit(io, DEFAULT_FRAME_LIMIT)
    }

    pub fn with_limit(io: R, limit: usize) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(4 * 1024),
            scanned: 0,
            limit: limit.max(1),
        }
    }

    pub fn into_inner(self) -> R {
        self.io
    }

    /// Pop the next terminated frame out of the buffer, if one is
    /// fully buffered. Errors once the unterminated run passes the
    /// limit.
    fn take_buffered(&mut self) -> io::Result<Option<Bytes>> {
        match memchr(b'\n', &self.buf[self.scanned..]) {
            Some(off) => {
                let mut frame = self.buf.split_to(self.scanned + off + 1);
                self.scanned = 0;
                frame.truncate(frame.len() - 1);
                if frame.last() == Some(&b'\r') {
                    frame.truncate(frame.len() - 1);
                }
                Ok(Some(frame.freeze()))
            }
            None => {
                self.scanned = self.buf.len();
                if self.scanned > self.limit {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unterminated frame past size limit",
                    ));
                }
                Ok(None)
            }
        }
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Next frame off the wire, terminator removed. An empty line is a
    /// valid empty frame. A shutdown between frames yields `Ok(None)`;
    /// bytes left dangling without a terminator are an
    /// `UnexpectedEof`.
    pub async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.take_buffered()? {
                return Ok(Some(frame));
            }
            if self.io.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(io::ErrorKind::UnexpectedEof.into())
                };
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write one frame: payload plus the `\n` terminator.
    pub async fn write_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(payload).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}
