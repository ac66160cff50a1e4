//! Token sinks for streaming generation
//!
//! Callbacks are invoked from the native worker thread, so they must not
//! block for long. [`ChannelCallback`] bridges tokens into an async
//! stream with bounded capacity.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Receives generated tokens as they arrive
pub trait StreamingCallback: Send + Sync {
    /// Called for each generated token, stop markers excluded
    fn on_token(&self, token: &str);

    /// Called with an advisory message that is not part of the response
    fn on_notice(&self, notice: &str) {
        self.on_token(notice);
    }
}

impl<F> StreamingCallback for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_token(&self, token: &str) {
        self(token)
    }
}

pub type TokenCallback = Arc<dyn StreamingCallback>;

/// Forwards tokens into a bounded channel
pub struct ChannelCallback {
    sender: mpsc::Sender<String>,
    dropped: AtomicUsize,
}

impl ChannelCallback {
    /// Create the callback and the stream its tokens come out of
    pub fn channel(capacity: usize) -> (Self, ReceiverStream<String>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                dropped: AtomicUsize::new(0),
            },
            ReceiverStream::new(receiver),
        )
    }

    /// Tokens discarded because the consumer fell behind
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl StreamingCallback for ChannelCallback {
    fn on_token(&self, token: &str) {
        match self.sender.try_send(token.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "Token stream consumer is behind, dropping token");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Token stream closed by consumer");
            }
        }
    }
}

/// Accumulates tokens in memory
#[derive(Default)]
pub struct CollectingCallback {
    text: Mutex<String>,
    tokens: AtomicUsize,
}

impl CollectingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.text.lock().clone()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.load(Ordering::Relaxed)
    }
}

impl StreamingCallback for CollectingCallback {
    fn on_token(&self, token: &str) {
        self.text.lock().push_str(token);
        self.tokens.fetch_add(1, Ordering::Relaxed);
    }
}
