// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Full-duplex message transport to the backend.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use url::Url;

use printwatch_core::error::{PrintwatchError, Result};

/// Credentials presented on the upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub agent_id: String,
    pub token: String,
}

/// Something the backend sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Transport-level sign of life (ping, pong, binary) without a payload
    /// the agent cares about.
    Liveness,
}

/// Opens channels to the backend.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &Url, credentials: &Credentials) -> Result<Box<dyn Channel>>;
}

/// One open connection.
///
/// `recv` must be cancel-safe: the connector polls it inside `select!`.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// `None` once the peer has closed the channel.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &Url, credentials: &Credentials) -> Result<Box<dyn Channel>> {
        info!(url = %url, "connecting to backend");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| PrintwatchError::ChannelFault(e.to_string()))?;

        let request = ClientRequestBuilder::new(uri)
            .with_header("Authorization", format!("Bearer {}", credentials.token))
            .with_header("X-Agent-ID", credentials.agent_id.clone());

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| PrintwatchError::ChannelFault(e.to_string()))?;

        info!("backend channel open");
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(tungstenite::Message::Text(text.into()))
            .await
            .map_err(|e| PrintwatchError::ChannelFault(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame>> {
        match self.stream.next().await? {
            Ok(tungstenite::Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(tungstenite::Message::Close(frame)) => {
                if let Some(cf) = frame {
                    info!(code = %cf.code, reason = %cf.reason, "backend sent close frame");
                } else {
                    info!("backend sent close frame");
                }
                None
            }
            Ok(tungstenite::Message::Ping(_)) => {
                // tungstenite answers pings itself
                trace!("backend ping");
                Some(Ok(Frame::Liveness))
            }
            Ok(_) => Some(Ok(Frame::Liveness)),
            Err(e) => Some(Err(PrintwatchError::ChannelFault(e.to_string()))),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "close handshake failed");
        }
    }
}
