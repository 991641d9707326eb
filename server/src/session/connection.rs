//! Individual client session handling

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use fleet_shared::codec::{self, Frame, FrameDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

/// Handle to push frames to a connected client
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: u64,
    pub addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl SessionHandle {
    /// Send a frame to this client
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let encoded = codec::encode(frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        Ok(())
    }
}

/// A connected control-plane client
pub struct Session {
    handle: SessionHandle,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl Session {
    pub fn new(stream: TcpStream, addr: SocketAddr, session_id: u64) -> Self {
        let (reader, writer) = stream.into_split();

        Self {
            handle: SessionHandle {
                session_id,
                addr,
                writer: Arc::new(Mutex::new(writer)),
            },
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending frames
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Read the next frame; `None` once the connection is closed or corrupt
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(frame)) => return Some(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!("Decode error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }

            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                Err(e) => {
                    warn!("Read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}
