//! Instance log retrieval, including the cancellable live tail.

use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uniprov_common::{ErrorKind, Result};

pub enum InstanceLogs {
    /// Log text available at the time of the call.
    Snapshot(String),
    /// Unbounded live tail.
    Follow(LogTail),
}

impl InstanceLogs {
    pub fn into_snapshot(self) -> Option<String> {
        match self {
            InstanceLogs::Snapshot(text) => Some(text),
            InstanceLogs::Follow(_) => None,
        }
    }
}

impl std::fmt::Debug for InstanceLogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceLogs::Snapshot(text) => f.debug_tuple("Snapshot").field(&text.len()).finish(),
            InstanceLogs::Follow(_) => f.write_str("Follow(..)"),
        }
    }
}

/// Stream of new log chunks. Ends only after cancellation or a fatal error.
///
/// Cancelling (explicitly, through a cloned token, or by dropping the tail)
/// stops the poller task and releases whatever it holds open.
pub struct LogTail {
    inner: ReceiverStream<Result<String>>,
    cancel: CancellationToken,
}

impl LogTail {
    /// Spawn a poller that calls `fetch` every `interval` and forwards the
    /// text appended since the previous call.
    ///
    /// `fetch` returns the full log text each time. `LogsNotYetAvailable` is
    /// swallowed (the tail keeps waiting), `BackendUnreachable` is forwarded
    /// and polling continues, any other error is forwarded and ends the tail.
    pub fn spawn<F, Fut>(interval: Duration, mut fetch: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut seen = String::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let fetched = tokio::select! {
                    _ = token.cancelled() => break,
                    res = fetch() => res,
                };

                let (item, fatal) = match fetched {
                    Ok(text) => {
                        let chunk = next_chunk(&seen, &text);
                        seen = text;
                        match chunk {
                            Some(chunk) => (Ok(chunk), false),
                            None => continue,
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::LogsNotYetAvailable => continue,
                    Err(e) if e.is_retryable() => (Err(e), false),
                    Err(e) => (Err(e), true),
                };

                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    res = tx.send(item) => res.is_ok(),
                };
                if !sent || fatal {
                    break;
                }
            }
            tracing::debug!("[logs] tail stopped");
        });

        Self {
            inner: ReceiverStream::new(rx),
            cancel,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this tail from elsewhere (e.g. a Ctrl-C handler).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for LogTail {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Text appended to `current` since `seen`. A log that shrank or no longer
/// starts with what was seen (rotation, console ring buffer) is re-sent whole.
fn next_chunk(seen: &str, current: &str) -> Option<String> {
    if current == seen || current.is_empty() {
        return None;
    }
    match current.strip_prefix(seen) {
        Some(rest) => Some(rest.to_string()),
        None => Some(current.to_string()),
    }
}
