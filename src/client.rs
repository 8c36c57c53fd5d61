//! Client side of the bus.
//!
//! Used by the `announce` and `listen` subcommands and by tests. A client
//! writes length-prefixed payloads and reassembles incoming frames with the
//! same [`FrameBuffer`] the relay uses.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::framing::{Frame, FrameBuffer};
use crate::message::Message;

/// A connection to a running bus relay.
#[derive(Debug)]
pub struct BusClient {
    stream: UnixStream,
    decoder: FrameBuffer,
    read_buf: Vec<u8>,
}

impl BusClient {
    /// Connect to the relay listening at `socket_path`.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to bus: {}", socket_path.display()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: FrameBuffer::new(),
            read_buf: vec![0u8; 64 * 1024], // 64KB read buffer
        }
    }

    /// Send `payload` as one frame.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(&Frame::from_payload(payload)?).await
    }

    /// Send an already-framed record.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.stream
            .write_all(frame.as_bytes())
            .await
            .context("Failed to write frame to bus")
    }

    /// Encode and send a message.
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.send_payload(&message.encode()).await
    }

    /// Wait for the next frame from another client.
    ///
    /// Returns `Ok(None)` once the relay closes the connection.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.extract_all().next() {
                return Ok(Some(frame));
            }

            let n = self
                .stream
                .read(&mut self.read_buf)
                .await
                .context("Failed to read from bus")?;
            if n == 0 {
                if self.decoder.has_partial() {
                    log::warn!(
                        "[Bus] Connection closed with {} bytes of a partial frame",
                        self.decoder.buffered_len()
                    );
                }
                return Ok(None);
            }
            self.decoder.append(&self.read_buf[..n])?;
        }
    }

    /// Close the write side, telling the relay this client is done.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await.context("Failed to close bus connection")
    }
}
