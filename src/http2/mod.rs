// Jackson Coxson

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use tokio::io::AsyncWriteExt;

use crate::{ReadWrite, RemoteXpcError};

pub mod frame;
pub use frame::{Frame, HttpFrame, Setting};

const HTTP2_MAGIC: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Minimal HTTP/2 client, sufficient to carry the RSD catalog
///
/// Implements only the frame types observed on the wire. Inbound DATA for
/// other streams is cached so interleaved streams don't lose messages, and
/// the receive window is replenished as payloads are consumed so the peer
/// never stalls.
pub struct Http2Client<R: ReadWrite> {
    inner: R,
    cache: HashMap<u32, VecDeque<Vec<u8>>>,
    closed: bool,
}

impl<R: ReadWrite> Http2Client<R> {
    /// Writes the connection preface and inits the caches
    pub async fn new(mut inner: R) -> Result<Self, RemoteXpcError> {
        inner.write_all(HTTP2_MAGIC).await?;
        inner.flush().await?;
        Ok(Self {
            inner,
            cache: HashMap::new(),
            closed: false,
        })
    }

    pub async fn set_settings(&mut self, settings: Vec<Setting>) -> Result<(), RemoteXpcError> {
        let frame = frame::SettingsFrame {
            settings,
            stream_id: 0,
            flags: 0,
        }
        .serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
    ) -> Result<(), RemoteXpcError> {
        let frame = frame::WindowUpdateFrame {
            stream_id,
            increment,
        }
        .serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Opens a stream with an empty HEADERS frame
    pub async fn open_stream(&mut self, stream_id: u32) -> Result<(), RemoteXpcError> {
        // Sometimes the device sends data to a stream that isn't open yet
        self.cache.entry(stream_id).or_default();
        let frame = frame::HeadersFrame::open(stream_id).serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn send(&mut self, stream_id: u32, payload: Vec<u8>) -> Result<(), RemoteXpcError> {
        let frame = frame::DataFrame::new(stream_id, payload).serialize();
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Reads the next DATA payload for the given stream
    ///
    /// Other frame types are handled inline: SETTINGS are acknowledged,
    /// DATA for other streams is cached, HEADERS are opaque and dropped.
    pub async fn read(&mut self, stream_id: u32) -> Result<Vec<u8>, RemoteXpcError> {
        // See if we already have a cached message from another read
        if let Some(cached) = self.cache.get_mut(&stream_id).and_then(|c| c.pop_front()) {
            return Ok(cached);
        }
        self.cache.entry(stream_id).or_default();

        // handle frames until we get what we want
        loop {
            let frame = Frame::read(&mut self.inner).await?;
            match frame {
                Frame::Settings(settings_frame) => {
                    if settings_frame.flags & frame::FLAG_ACK == 0 {
                        let ack = frame::SettingsFrame::ack().serialize();
                        self.inner.write_all(&ack).await?;
                        self.inner.flush().await?;
                    }
                }
                Frame::Data(data_frame) => {
                    debug!(
                        "Got data frame for stream {} with {} bytes",
                        data_frame.stream_id,
                        data_frame.payload.len()
                    );

                    // Keep the receive window open as we consume
                    if !data_frame.payload.is_empty() {
                        self.window_update(0, data_frame.payload.len() as u32)
                            .await?;
                        self.window_update(data_frame.stream_id, data_frame.payload.len() as u32)
                            .await?;
                    }

                    if data_frame.stream_id == stream_id {
                        return Ok(data_frame.payload);
                    }
                    if !self.cache.contains_key(&data_frame.stream_id) {
                        warn!(
                            "Received message for stream {} before it was opened",
                            data_frame.stream_id
                        );
                    }
                    self.cache
                        .entry(data_frame.stream_id)
                        .or_default()
                        .push_back(data_frame.payload);
                }
                Frame::Headers(_) | Frame::WindowUpdate(_) => {
                    // headers are opaque; our outbound window stays ample
                }
            }
        }
    }

    /// Shuts down the transport. Safe to call multiple times.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.inner.shutdown().await;
        }
    }
}
