//! A single prompt-to-response generation
//!
//! A session is created for one prompt and settles exactly once. Three
//! parties can settle it:
//! - the native side, when generation returns or a stop token arrives
//! - a caller-initiated stop
//! - a failure in the native call
//!
//! Whoever fills the [`ResultSlot`] first decides the result. The slow
//! generation watchdog never settles a session; it only emits a notice.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::handle::BackendHandle;
use super::slot::ResultSlot;
use super::streaming::TokenCallback;
use super::worker::NativeWorker;
use super::BackendKind;
use crate::constants::responses::{LLM_ERROR_RESPONSE, SLOW_GENERATION_NOTICE, STOPPED_PLACEHOLDER};
use crate::error::{InferError, LifecycleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
    /// The watchdog fired; generation may still finish
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Whole response returned at the end
    Blocking,
    /// Tokens forwarded to the callback as they arrive
    Streaming,
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub prompt: String,
    pub mode: SessionMode,
    pub max_tokens: usize,
    /// Delay before the slow generation notice
    pub generation_timeout: Duration,
}

/// Remove every stop marker from `text`
pub fn strip_stop_tokens(text: &str, stop_tokens: &[String]) -> String {
    stop_tokens
        .iter()
        .fold(text.to_string(), |acc, token| acc.replace(token.as_str(), ""))
}

pub struct GenerationSession {
    id: u64,
    handle: Arc<BackendHandle>,
    stop_tokens: Vec<String>,
    buffer: Mutex<String>,
    generating: AtomicBool,
    state: Mutex<SessionState>,
    result: ResultSlot<String>,
    receiver: Mutex<Option<oneshot::Receiver<String>>>,
    on_token: Mutex<Option<TokenCallback>>,
}

impl GenerationSession {
    pub fn new(
        id: u64,
        handle: Arc<BackendHandle>,
        stop_tokens: Vec<String>,
        on_token: Option<TokenCallback>,
    ) -> Arc<Self> {
        let (result, receiver) = ResultSlot::new();
        Arc::new(Self {
            id,
            handle,
            stop_tokens,
            buffer: Mutex::new(String::new()),
            generating: AtomicBool::new(false),
            state: Mutex::new(SessionState::Idle),
            result,
            receiver: Mutex::new(Some(receiver)),
            on_token: Mutex::new(on_token),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BackendKind {
        self.handle.kind()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// True until the result has been decided
    pub fn is_active(&self) -> bool {
        !self.result.is_done()
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::Acquire)
    }

    /// Text accumulated from streamed tokens so far
    pub fn partial_text(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Queue the generation on `worker` and arm the slow generation watchdog
    pub fn start(
        self: &Arc<Self>,
        worker: &NativeWorker,
        request: SessionRequest,
    ) -> Result<PendingResult, LifecycleError> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Idle {
                return Err(LifecycleError::SessionBusy);
            }
            *state = SessionState::Running;
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(LifecycleError::SessionBusy)?;
        self.generating.store(true, Ordering::Release);

        let SessionRequest {
            prompt,
            mode,
            max_tokens,
            generation_timeout,
        } = request;

        let session = Arc::clone(self);
        let queued = worker.execute(move || session.run_native(&prompt, mode, max_tokens));
        if let Err(e) = queued {
            self.finish(Err(InferError::Lifecycle(e.clone())));
            return Err(e);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let watched = Arc::downgrade(self);
                runtime.spawn(async move {
                    tokio::time::sleep(generation_timeout).await;
                    if let Some(session) = Weak::upgrade(&watched) {
                        session.on_generation_timeout();
                    }
                });
            }
            Err(_) => debug!(session = self.id, "No async runtime, slow generation notice disabled"),
        }

        debug!(session = self.id, backend = %self.kind(), ?mode, "Generation started");
        Ok(PendingResult {
            session_id: self.id,
            receiver,
        })
    }

    fn run_native(&self, prompt: &str, mode: SessionMode, max_tokens: usize) {
        let outcome = match mode {
            SessionMode::Streaming => {
                self.handle
                    .infer_streaming(prompt, max_tokens, &mut |token: &str| {
                        self.accept_token(token)
                    })
            }
            SessionMode::Blocking => self
                .handle
                .infer(prompt, max_tokens)
                .map(|text| strip_stop_tokens(&text, &self.stop_tokens)),
        };
        self.finish(outcome);
    }

    /// Handle one token from the native side
    pub fn accept_token(&self, token: &str) {
        if token.is_empty() || !self.is_generating() {
            return;
        }
        if self.stop_tokens.iter().any(|t| t == token) {
            debug!(session = self.id, "Stop token received");
            self.generating.store(false, Ordering::Release);
            let text = self.partial_text();
            self.settle(text, SessionState::Completed);
            return;
        }

        self.buffer.lock().push_str(token);
        if let Some(callback) = self.callback() {
            callback.on_token(token);
        }
    }

    /// Settle from the native call's return
    pub fn finish(&self, outcome: Result<String, InferError>) {
        self.generating.store(false, Ordering::Release);
        let partial = self.partial_text();
        match outcome {
            Ok(text) => {
                let text = if partial.is_empty() {
                    strip_stop_tokens(&text, &self.stop_tokens)
                } else {
                    partial
                };
                self.settle(text, SessionState::Completed);
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "Generation failed");
                let text = if partial.is_empty() {
                    LLM_ERROR_RESPONSE.to_string()
                } else {
                    partial
                };
                self.settle(text, SessionState::Failed);
            }
        }
        // Native side is done; nothing more goes to the caller's sink
        self.on_token.lock().take();
    }

    /// Stop generation and settle with whatever has been produced.
    ///
    /// The native interrupt is queued on `worker`; it runs inline only when
    /// the worker is gone.
    pub fn stop(&self, worker: &NativeWorker) {
        self.generating.store(false, Ordering::Release);
        let handle = Arc::clone(&self.handle);
        if let Err(e) = worker.execute(move || handle.stop()) {
            debug!(session = self.id, "Interrupting inline: {}", e);
            self.handle.stop();
        }

        let partial = self.partial_text();
        let text = if partial.is_empty() {
            STOPPED_PLACEHOLDER.to_string()
        } else {
            partial
        };
        if self.settle(text, SessionState::Stopped) {
            info!(session = self.id, "Generation stopped");
        }
        self.on_token.lock().take();
    }

    /// Emit the slow generation notice. Does not cancel or settle.
    pub fn on_generation_timeout(&self) -> bool {
        if !self.is_active() || !self.is_generating() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if *state == SessionState::Running {
                *state = SessionState::TimedOut;
            }
        }
        warn!(session = self.id, "Generation is taking longer than expected");
        if let Some(callback) = self.callback() {
            callback.on_notice(SLOW_GENERATION_NOTICE);
        }
        true
    }

    fn settle(&self, text: String, terminal: SessionState) -> bool {
        if !self.result.complete(text) {
            return false;
        }
        let mut state = self.state.lock();
        // A timed-out session keeps its state once settled
        if *state == SessionState::Running {
            *state = terminal;
        }
        true
    }

    fn callback(&self) -> Option<TokenCallback> {
        self.on_token.lock().clone()
    }
}

/// Resolves to the session's final text
///
/// Never fails: a session that vanished without settling resolves to the
/// error response.
pub struct PendingResult {
    session_id: u64,
    receiver: oneshot::Receiver<String>,
}

impl PendingResult {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

impl Future for PendingResult {
    type Output = String;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| LLM_ERROR_RESPONSE.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::InitError;
    use crate::runtime::handle::NativeBackend;
    use crate::runtime::streaming::CollectingCallback;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        tokens: Vec<&'static str>,
        stops: AtomicUsize,
    }

    impl NativeBackend for Scripted {
        fn kind(&self) -> BackendKind {
            BackendKind::Cpu
        }
        fn init(&self, _config: &EngineConfig) -> Result<(), InitError> {
            Ok(())
        }
        fn infer(&self, _prompt: &str, _max_tokens: usize) -> Result<String, InferError> {
            Ok(self.tokens.concat())
        }
        fn infer_streaming(
            &self,
            _prompt: &str,
            _max_tokens: usize,
            sink: &mut dyn FnMut(&str),
        ) -> Result<String, InferError> {
            for token in &self.tokens {
                sink(token);
            }
            Ok(String::new())
        }
        fn reset(&self) -> Result<(), InferError> {
            Ok(())
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&self) {}
    }

    fn session(tokens: Vec<&'static str>, callback: Option<TokenCallback>) -> Arc<GenerationSession> {
        let backend = Arc::new(Scripted {
            tokens,
            stops: AtomicUsize::new(0),
        });
        let handle = Arc::new(BackendHandle::open(backend, &EngineConfig::default()).unwrap());
        GenerationSession::new(1, handle, EngineConfig::default().stop_tokens, callback)
    }

    fn request(mode: SessionMode) -> SessionRequest {
        SessionRequest {
            prompt: "hi".to_string(),
            mode,
            max_tokens: 16,
            generation_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_strip_stop_tokens() {
        let stops = EngineConfig::default().stop_tokens;
        assert_eq!(strip_stop_tokens("Hi<|eot_id|>", &stops), "Hi");
        assert_eq!(strip_stop_tokens("<|end_of_text|>a<|eot_id|>b", &stops), "ab");
    }

    #[tokio::test]
    async fn test_stop_token_settles_and_is_not_forwarded() {
        let collector = Arc::new(CollectingCallback::new());
        let session = session(
            vec!["Hel", "", "lo", "<|eot_id|>", "after"],
            Some(collector.clone() as TokenCallback),
        );
        let worker = NativeWorker::spawn("session-test").unwrap();

        let pending = session.start(&worker, request(SessionMode::Streaming)).unwrap();
        assert_eq!(pending.await, "Hello");
        assert_eq!(collector.text(), "Hello");
        assert_eq!(collector.token_count(), 2);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_blocking_mode_strips_markers() {
        let session = session(vec!["Hi", " there", "<|end_of_text|>"], None);
        let worker = NativeWorker::spawn("session-blocking").unwrap();
        let pending = session.start(&worker, request(SessionMode::Blocking)).unwrap();
        assert_eq!(pending.await, "Hi there");
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let session = session(vec![], None);
        session.generating.store(true, Ordering::Release);
        *session.state.lock() = SessionState::Running;

        let worker = NativeWorker::spawn("session-stop").unwrap();
        session.accept_token("partial");
        session.stop(&worker);
        session.finish(Ok("late native text".to_string()));

        let receiver = session.receiver.lock().take().unwrap();
        assert_eq!(receiver.await.unwrap(), "partial");
        assert_eq!(session.state(), SessionState::Stopped);

        // Tokens after a stop are ignored
        session.accept_token("more");
        assert_eq!(session.partial_text(), "partial");
    }

    #[tokio::test]
    async fn test_stop_before_tokens_yields_placeholder() {
        let session = session(vec![], None);
        session.generating.store(true, Ordering::Release);
        *session.state.lock() = SessionState::Running;
        let worker = NativeWorker::spawn("session-placeholder").unwrap();
        session.stop(&worker);

        let receiver = session.receiver.lock().take().unwrap();
        assert_eq!(receiver.await.unwrap(), STOPPED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_text() {
        let session = session(vec![], None);
        session.generating.store(true, Ordering::Release);
        *session.state.lock() = SessionState::Running;
        session.accept_token("half an ans");
        session.finish(Err(InferError::NativeFault("npu hang".into())));

        let receiver = session.receiver.lock().take().unwrap();
        assert_eq!(receiver.await.unwrap(), "half an ans");
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_timeout_notice_does_not_settle() {
        let collector = Arc::new(CollectingCallback::new());
        let session = session(vec![], Some(collector.clone() as TokenCallback));
        session.generating.store(true, Ordering::Release);
        *session.state.lock() = SessionState::Running;

        assert!(session.on_generation_timeout());
        assert_eq!(session.state(), SessionState::TimedOut);
        assert!(session.is_active());
        assert_eq!(collector.text(), SLOW_GENERATION_NOTICE);

        session.accept_token("done");
        session.finish(Ok(String::new()));
        let receiver = session.receiver.lock().take().unwrap();
        assert_eq!(receiver.await.unwrap(), "done");
        assert_eq!(session.state(), SessionState::TimedOut);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let session = session(vec!["x"], None);
        let worker = NativeWorker::spawn("session-twice").unwrap();
        let pending = session.start(&worker, request(SessionMode::Streaming)).unwrap();
        assert_eq!(
            session.start(&worker, request(SessionMode::Streaming)).err(),
            Some(LifecycleError::SessionBusy)
        );
        assert_eq!(pending.await, "x");
    }

    #[test]
    fn test_start_outside_runtime() {
        let session = session(vec!["Hi", "<|eot_id|>"], None);
        let worker = NativeWorker::spawn("session-no-runtime").unwrap();
        let pending = session.start(&worker, request(SessionMode::Streaming)).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        assert_eq!(runtime.block_on(pending), "Hi");
    }

    #[tokio::test]
    async fn test_stop_interrupts_on_worker() {
        let backend = Arc::new(Scripted {
            tokens: vec![],
            stops: AtomicUsize::new(0),
        });
        let handle = Arc::new(BackendHandle::open(backend.clone(), &EngineConfig::default()).unwrap());
        let session = GenerationSession::new(1, handle, EngineConfig::default().stop_tokens, None);
        session.generating.store(true, Ordering::Release);
        *session.state.lock() = SessionState::Running;

        let worker = NativeWorker::spawn("session-interrupt").unwrap();
        session.stop(&worker);
        worker.run(|| ()).await.unwrap();
        assert_eq!(backend.stops.load(Ordering::SeqCst), 1);

        // With the worker gone the interrupt still happens
        worker.shutdown();
        session.stop(&worker);
        assert_eq!(backend.stops.load(Ordering::SeqCst), 2);
    }
}
