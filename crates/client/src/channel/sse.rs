// Server-sent events push transport (reqwest streaming GET).
//
// Each event's `data:` lines are joined with `\n` and handed up as one
// payload. Event names, ids and retry hints are ignored; the payload carries
// its own `type` discriminator and reconnects are owned by the manager.

use std::collections::VecDeque;

use anyhow::{anyhow, Context, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, COOKIE};
use tracing::debug;
use url::Url;

use super::PushTransport;

pub struct SseTransport {
    client: reqwest::Client,
    cookie: Option<String>,
    stream: Option<BoxStream<'static, reqwest::Result<Vec<u8>>>>,
    decoder: SseDecoder,
}

impl SseTransport {
    pub fn new(cookie: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), cookie)
    }

    pub fn with_client(client: reqwest::Client, cookie: Option<String>) -> Self {
        Self { client, cookie, stream: None, decoder: SseDecoder::default() }
    }
}

impl PushTransport for SseTransport {
    async fn open(&mut self, endpoint: &Url) -> Result<()> {
        let mut request = self
            .client
            .get(endpoint.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to open push stream at `{endpoint}`"))?
            .error_for_status()
            .context("push stream rejected")?;
        debug!(status = %response.status(), "push stream opened");

        self.decoder = SseDecoder::default();
        self.stream = Some(response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(payload) = self.decoder.next_event() {
                return Ok(Some(payload));
            }

            let stream = self.stream.as_mut().ok_or_else(|| anyhow!("push stream is not open"))?;
            match stream.next().await {
                Some(chunk) => self.decoder.push(&chunk.context("push stream read failed")?),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.stream = None;
    }
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
    ready: VecDeque<String>,
}

impl SseDecoder {
    /// Feed raw bytes. Chunks may split lines and UTF-8 sequences anywhere.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            self.feed_line(line.trim_end_matches(['\n', '\r']));
        }
    }

    /// Pop the next complete event payload.
    pub fn next_event(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    fn feed_line(&mut self, line: &str) {
        if line.is_empty() {
            if !self.data.is_empty() {
                self.ready.push_back(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }

        // Comment lines double as keep-alives.
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }
}
