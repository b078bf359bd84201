//! Transport seam for agent sessions.
//!
//! A session only needs to write and read text frames; the binary plugs a
//! WebSocket in here, tests use the in-memory pair below.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{AgentFrame, CoordinatorFrame};

/// Outbound half of an agent transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Best-effort close; errors are not interesting at this point.
    async fn close(&mut self);
}

/// Inbound half of an agent transport.
#[async_trait]
pub trait FrameSource: Send {
    /// The next text frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String>>;
}

// ---------------------------------------------------------------------------
// In-memory transport
// ---------------------------------------------------------------------------

pub struct MemorySink {
    tx: Option<mpsc::Sender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("sink closed"))?;
        tx.send(text).await.map_err(|_| anyhow!("agent end dropped"))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

pub struct MemorySource {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<String>> {
        self.rx.recv().await.map(Ok)
    }
}

/// The agent's side of an in-memory connection.
pub struct MemoryAgent {
    to_coordinator: Option<mpsc::Sender<String>>,
    from_coordinator: mpsc::Receiver<String>,
}

impl MemoryAgent {
    pub async fn send(&self, frame: &AgentFrame) -> Result<()> {
        self.send_raw(frame.encode()?).await
    }

    /// Send arbitrary text, e.g. a garbled frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<()> {
        let tx = self
            .to_coordinator
            .as_ref()
            .ok_or_else(|| anyhow!("agent already disconnected"))?;
        tx.send(text.into())
            .await
            .map_err(|_| anyhow!("coordinator end dropped"))
    }

    /// Next frame written by the coordinator; `None` once the session's
    /// writer has shut down.
    pub async fn recv(&mut self) -> Option<CoordinatorFrame> {
        let text = self.from_coordinator.recv().await?;
        CoordinatorFrame::decode(&text).ok()
    }

    pub fn try_recv(&mut self) -> Option<CoordinatorFrame> {
        let text = self.from_coordinator.try_recv().ok()?;
        CoordinatorFrame::decode(&text).ok()
    }

    /// Close the agent's write side, which the session reads as a peer close.
    pub fn disconnect(&mut self) {
        self.to_coordinator = None;
    }
}

/// Build a connected in-memory transport. `outbound_buffer` bounds how many
/// written frames may sit unread on the agent's side before the session's
/// writer blocks.
pub fn memory_transport(
    outbound_buffer: usize,
) -> (MemoryAgent, Box<dyn FrameSink>, Box<dyn FrameSource>) {
    let (out_tx, out_rx) = mpsc::channel(outbound_buffer.max(1));
    let (in_tx, in_rx) = mpsc::channel(64);
    let agent = MemoryAgent {
        to_coordinator: Some(in_tx),
        from_coordinator: out_rx,
    };
    (
        agent,
        Box::new(MemorySink { tx: Some(out_tx) }),
        Box::new(MemorySource { rx: in_rx }),
    )
}
