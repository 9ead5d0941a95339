// Scripted transport and refetcher shared by the client's unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::time::Instant;
use url::Url;

use statesync_common::types::Timestamp;

use super::PushTransport;
use crate::project::ProjectRefetcher;

#[derive(Debug, Default)]
struct MockState {
    /// Items returned by recv() in order. Once empty, recv() pends forever.
    recv_queue: VecDeque<Result<Option<String>, String>>,
    failing_opens: usize,
    open_times: Vec<Instant>,
    closes: usize,
}

/// Cloneable so a test can keep a handle after the manager takes ownership.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().failing_opens = count;
    }

    pub(crate) fn queue_message(&self, payload: &str) {
        self.state.lock().unwrap().recv_queue.push_back(Ok(Some(payload.to_string())));
    }

    pub(crate) fn queue_close(&self) {
        self.state.lock().unwrap().recv_queue.push_back(Ok(None));
    }

    pub(crate) fn queue_error(&self, message: &str) {
        self.state.lock().unwrap().recv_queue.push_back(Err(message.to_string()));
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().unwrap().open_times.len()
    }

    pub(crate) fn open_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().open_times.clone()
    }

    pub(crate) fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

impl PushTransport for MockTransport {
    async fn open(&mut self, _endpoint: &Url) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.open_times.push(Instant::now());
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        let next = self.state.lock().unwrap().recv_queue.pop_front();
        match next {
            Some(item) => item.map_err(|message| anyhow!(message)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

#[derive(Debug, Default)]
pub(crate) struct MockRefetcher {
    requests: Mutex<Vec<Timestamp>>,
}

impl MockRefetcher {
    pub(crate) fn requests(&self) -> Vec<Timestamp> {
        self.requests.lock().unwrap().clone()
    }
}

impl ProjectRefetcher for MockRefetcher {
    fn request_refetch(&self, last_updated: &Timestamp) {
        self.requests.lock().unwrap().push(last_updated.clone());
    }
}
