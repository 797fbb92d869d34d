// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seam for the signaling channel.
//!
//! A connection is split into an outbound [`SignalSink`] and an inbound
//! [`SignalStream`] so the driver can read and write from one task.
//! [`WsTransport`] is the production implementation over tokio-tungstenite.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::SignalError;

/// One inbound event from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Orderly close by the server. Not followed by a reconnect.
    Closed,
    /// Connection lost.
    Dropped(String),
}

#[async_trait]
pub trait SignalSink: Send {
    async fn send(&mut self, text: String) -> Result<(), SignalError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait SignalStream: Send {
    /// Next meaningful frame. Control frames are handled internally.
    async fn next_frame(&mut self) -> Frame;
}

pub struct SignalSocket {
    pub sink: Box<dyn SignalSink>,
    pub stream: Box<dyn SignalStream>,
}

#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalSocket, SignalError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink(SplitSink<WsStream, Message>);
struct WsReader(SplitStream<WsStream>);

#[async_trait]
impl SignalSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), SignalError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| SignalError::Send(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

#[async_trait]
impl SignalStream for WsReader {
    async fn next_frame(&mut self) -> Frame {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Text(text))) => return Frame::Text(text),
                Some(Ok(Message::Close(_))) => return Frame::Closed,
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Frame::Dropped(e.to_string()),
                None => return Frame::Dropped("connection ended without close frame".into()),
            }
        }
    }
}

/// WebSocket transport (`ws://` or `wss://`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl SignalTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<SignalSocket, SignalError> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| SignalError::Connect(e.to_string()))?;
        let (sink, stream) = socket.split();
        Ok(SignalSocket {
            sink: Box::new(WsSink(sink)),
            stream: Box::new(WsReader(stream)),
        })
    }
}
