// WebSocket push transport (tokio-tungstenite).

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::PushTransport;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Text frames carry one JSON message each. Credentials travel as a cookie.
#[derive(Default)]
pub struct WsTransport {
    cookie: Option<String>,
    socket: Option<Socket>,
}

impl WsTransport {
    pub fn new(cookie: Option<String>) -> Self {
        Self { cookie, socket: None }
    }
}

impl PushTransport for WsTransport {
    async fn open(&mut self, endpoint: &Url) -> Result<()> {
        let mut request =
            endpoint.as_str().into_client_request().context("invalid push endpoint")?;
        if let Some(cookie) = &self.cookie {
            let value =
                HeaderValue::from_str(cookie).context("cookie is not a valid header value")?;
            request.headers_mut().insert(COOKIE, value);
        }

        let (socket, response) = connect_async(request)
            .await
            .with_context(|| format!("failed to open push websocket at `{endpoint}`"))?;
        debug!(status = %response.status(), "push websocket upgraded");
        self.socket = Some(socket);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let socket = self.socket.as_mut().ok_or_else(|| anyhow!("push websocket is not open"))?;

        while let Some(frame) = socket.next().await {
            match frame.context("push websocket read failed")? {
                Message::Text(text) => return Ok(Some(text.to_string())),
                Message::Binary(payload) => match String::from_utf8(payload.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => warn!(len = payload.len(), "dropping non UTF-8 push frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "push websocket closed by server");
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }

        Ok(None)
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(error) = socket.close(None).await {
                debug!(%error, "push websocket close handshake failed");
            }
        }
    }
}
