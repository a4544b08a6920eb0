//! WebSocket link carrying socket.io v1 frames

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use super::frame::Frame;
use super::{Connector, Link};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Opens WebSocket links to the push endpoint.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Endpoint URL for one connection. http(s) schemes are mapped to ws(s).
    fn endpoint(&self, session_token: &str) -> Result<Url> {
        let mut url = self.url.clone();
        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| anyhow::anyhow!("Cannot use {} as a socket URL", self.url))?;
        }
        url.query_pairs_mut().append_pair("token", session_token);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session_token: &str) -> Result<Box<dyn Link>> {
        let url = self.endpoint(session_token)?;
        tracing::info!("Connecting WebSocket to {}", self.url);

        let (stream, response) = connect_async(url.as_str())
            .await
            .context("WebSocket connection failed")?;
        tracing::info!("WebSocket connected (status={})", response.status());

        let mut link = WsLink { stream };

        // First frame should be the socket.io handshake.
        match link.recv().await? {
            Some(Frame::Connect) => tracing::debug!("Received handshake frame"),
            Some(other) => tracing::warn!("Expected 1:: handshake, got: {}", other.encode()),
            None => anyhow::bail!("Connection closed before handshake"),
        }

        Ok(Box::new(link))
    }
}

pub struct WsLink {
    stream: WsStream,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let text = frame.encode();
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(WsMessage::Text(text))
            .await
            .context("Failed to send WebSocket message")
    }

    /// Next frame, ignoring pings and pongs.
    ///
    /// Event frames that request an ack are acked here. Unacked events are
    /// redelivered by the server.
    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    let frame = Frame::decode(&text);
                    if let Frame::Event {
                        ack_id: Some(id), ..
                    } = &frame
                    {
                        let ack = Frame::Ack { id: *id }.encode();
                        if let Err(e) = self.stream.send(WsMessage::Text(ack)).await {
                            tracing::warn!("Failed to send socket.io ack: {:#}", e);
                        }
                    }
                    return Ok(Some(frame));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    self.stream
                        .send(WsMessage::Pong(data))
                        .await
                        .context("Failed to send pong")?;
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket receive error");
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .close(None)
            .await
            .context("Failed to close WebSocket")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_maps_scheme_and_adds_token() {
        let connector = WsConnector::new(Url::parse("https://push.example.com/socket.io/1/").unwrap());
        let url = connector.endpoint("tok en").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.query(), Some("token=tok+en"));

        let connector = WsConnector::new(Url::parse("ws://localhost:3000/").unwrap());
        assert_eq!(connector.endpoint("t").unwrap().as_str(), "ws://localhost:3000/?token=t");
    }
}
