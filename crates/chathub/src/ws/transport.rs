//! Abstract frame transport consumed by the hub.
//!
//! The hub never touches sockets directly. An upgraded connection is handed
//! over as a reader half and a writer half; `handler` adapts axum WebSockets
//! and [`memory`] provides an in-process pair for tests and embedding.

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failure on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(String),
}

/// Read half of a connection.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Wait for the next text frame. `None` once the peer has closed.
    async fn read_frame(&mut self) -> Option<Result<String, TransportError>>;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one text frame.
    async fn write_frame(&mut self, frame: String) -> Result<(), TransportError>;

    /// Release the underlying transport.
    async fn close(&mut self) -> Result<(), TransportError>;
}

pub type BoxFrameReader = Box<dyn FrameReader>;
pub type BoxFrameWriter = Box<dyn FrameWriter>;

/// Channel-backed transport.
pub mod memory {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{BoxFrameReader, BoxFrameWriter, FrameReader, FrameWriter, TransportError};
    use crate::ws::types::{ClientCommand, ServerEvent};

    /// Frames the server may write before a peer that never reads stalls the writer.
    pub const DEFAULT_PEER_BUFFER: usize = 256;

    /// Create a connected pair with the default peer buffer.
    pub fn pair() -> (MemoryPeer, BoxFrameReader, BoxFrameWriter) {
        pair_with_buffer(DEFAULT_PEER_BUFFER)
    }

    /// Create a connected pair whose server-to-peer direction holds at most
    /// `buffer` unread frames. Once full, the server's writes block until the
    /// peer reads, like a socket whose remote stopped reading.
    pub fn pair_with_buffer(buffer: usize) -> (MemoryPeer, BoxFrameReader, BoxFrameWriter) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
        let closes = Arc::new(AtomicUsize::new(0));

        let peer = MemoryPeer {
            to_server: Some(inbound_tx),
            from_server: outbound_rx,
            closes: closes.clone(),
        };
        let reader = MemoryReader { rx: inbound_rx };
        let writer = MemoryWriter {
            tx: Some(outbound_tx),
            closes,
        };

        (peer, Box::new(reader), Box::new(writer))
    }

    /// The client end of an in-memory connection.
    pub struct MemoryPeer {
        to_server: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
        from_server: mpsc::Receiver<String>,
        closes: Arc<AtomicUsize>,
    }

    impl MemoryPeer {
        /// Send a raw text frame. Returns false once the peer side is closed
        /// or the server dropped its reader.
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            match &self.to_server {
                Some(tx) => tx.send(Ok(text.into())).is_ok(),
                None => false,
            }
        }

        /// Send a structured command.
        pub fn send_command(&self, command: &ClientCommand) -> bool {
            match serde_json::to_string(command) {
                Ok(json) => self.send_text(json),
                Err(_) => false,
            }
        }

        /// Inject a transport error into the server's read half.
        pub fn fail(&mut self, message: impl Into<String>) {
            if let Some(tx) = self.to_server.take() {
                let _ = tx.send(Err(TransportError::Io(message.into())));
            }
        }

        /// Close the client-to-server direction, as a peer-initiated close.
        pub fn close(&mut self) {
            self.to_server = None;
        }

        /// Next raw frame written by the server. `None` once the server
        /// released the transport and every written frame was read.
        pub async fn recv_text(&mut self) -> Option<String> {
            self.from_server.recv().await
        }

        /// Next frame decoded as a server event. Undecodable frames are skipped.
        pub async fn recv_event(&mut self) -> Option<ServerEvent> {
            while let Some(text) = self.from_server.recv().await {
                if let Ok(event) = serde_json::from_str(&text) {
                    return Some(event);
                }
            }
            None
        }

        /// Next event that is not a keepalive ping.
        pub async fn recv_non_ping(&mut self) -> Option<ServerEvent> {
            loop {
                match self.recv_event().await? {
                    ServerEvent::Ping => continue,
                    event => return Some(event),
                }
            }
        }

        /// Drain everything the server wrote until it released the transport.
        pub async fn collect_until_closed(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Some(event) = self.recv_event().await {
                events.push(event);
            }
            events
        }

        /// How many times the server closed its write half.
        pub fn server_close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct MemoryReader {
        rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    }

    #[async_trait]
    impl FrameReader for MemoryReader {
        async fn read_frame(&mut self) -> Option<Result<String, TransportError>> {
            self.rx.recv().await
        }
    }

    struct MemoryWriter {
        tx: Option<mpsc::Sender<String>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameWriter for MemoryWriter {
        async fn write_frame(&mut self, frame: String) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
            tx.send(frame).await.map_err(|_| TransportError::Closed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            if self.tx.take().is_some() {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

}
