//! axum WebSocket adapter for agent sessions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use corral_core::session::transport::{FrameSink, FrameSource};

pub struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .context("websocket send failed")
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
    }
}

pub struct WsSource(SplitStream<WebSocket>);

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                // Binary frames go through the same decoder; invalid UTF-8
                // surfaces there as a malformed frame.
                Ok(Message::Binary(bytes)) => {
                    return Some(Ok(String::from_utf8_lossy(&bytes).into_owned()));
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("websocket read failed"))),
            }
        }
    }
}

/// Split an upgraded socket into the halves a session drives.
pub fn split(socket: WebSocket) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
    let (sink, stream) = socket.split();
    (Box::new(WsSink(sink)), Box::new(WsSource(stream)))
}
