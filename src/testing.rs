//! Scripted network for unit tests.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::FetchError;
use crate::fetch::{FetchFuture, Fetcher};
use crate::http::{Request, Response, StatusCode};

#[derive(Debug, Clone)]
enum Reply {
    Respond { status: u16, body: String },
    Fail,
    Delay { after: Duration, body: String },
    Stall { after: Duration },
}

/// Answers by exact URL. Unscripted URLs fail like an unreachable host.
#[derive(Debug, Default)]
pub(crate) struct StubFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StubFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &str, status: u16, body: &str) {
        self.replies.lock().insert(
            url.to_owned(),
            Reply::Respond {
                status,
                body: body.to_owned(),
            },
        );
    }

    pub(crate) fn fail(&self, url: &str) {
        self.replies.lock().insert(url.to_owned(), Reply::Fail);
    }

    /// Responds `200` with `body`, but only after `after` has elapsed.
    pub(crate) fn delay(&self, url: &str, after: Duration, body: &str) {
        self.replies.lock().insert(
            url.to_owned(),
            Reply::Delay {
                after,
                body: body.to_owned(),
            },
        );
    }

    /// Fails like a dead host, but only after `after` has elapsed.
    pub(crate) fn stall(&self, url: &str, after: Duration) {
        self.replies
            .lock()
            .insert(url.to_owned(), Reply::Stall { after });
    }

    pub(crate) fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

impl Fetcher for StubFetcher {
    fn fetch(&self, request: Request) -> FetchFuture<'_> {
        let url = request.url().to_string();
        *self.calls.lock().entry(url.clone()).or_default() += 1;
        let reply = self.replies.lock().get(&url).cloned().unwrap_or(Reply::Fail);
        Box::pin(async move {
            match reply {
                Reply::Respond { status, body } => {
                    Ok(Response::new(StatusCode::from_u16(status)).body(body))
                }
                Reply::Fail => Err(FetchError::Transport {
                    url,
                    message: "connection refused".to_owned(),
                }),
                Reply::Delay { after, body } => {
                    tokio::time::sleep(after).await;
                    Ok(Response::new(StatusCode::OK).body(body))
                }
                Reply::Stall { after } => {
                    tokio::time::sleep(after).await;
                    Err(FetchError::Timeout {
                        url,
                        after_ms: after.as_millis() as u64,
                    })
                }
            }
        })
    }
}
