//! Process-wide owner of the native backend
//!
//! The coordinator holds the only live [`BackendHandle`], the active
//! session, the accelerator counters and the cleanup latch, all behind a
//! single lock. Two worker threads do the blocking work: one for
//! init and generation, one for cleanup, so a wedged generation cannot
//! block teardown.
//!
//! While the cleanup latch is set, init and generation requests fail fast
//! with [`LifecycleError::CleanupInProgress`]. Initialize calls run one at
//! a time; a second call queues behind the first, bounded by its own init
//! timeout.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::handle::{guard_native, BackendHandle, NativeBackend};
use super::selector::{BackendSelector, Selection};
use super::session::{GenerationSession, PendingResult, SessionMode, SessionRequest};
use super::slot::ResultSlot;
use super::streaming::TokenCallback;
use super::worker::NativeWorker;
use super::BackendKind;
use crate::config::EngineConfig;
use crate::constants::timing::FORCED_CLEANUP_ROUNDS;
use crate::error::{EngineError, InferError, InitError, LifecycleError, Result};

type InitOutcome = std::result::Result<BackendKind, InitError>;

struct CoordinatorState {
    current: BackendKind,
    handle: Option<Arc<BackendHandle>>,
    active_session: Option<Arc<GenerationSession>>,
    /// Settings of the latest initialize call
    config: EngineConfig,
    accelerator_init_count: u32,
    consecutive_failures: u32,
    cleaning_up: bool,
    next_session_id: u64,
}

/// Holds the cleanup latch for as long as it lives
struct CleanupGuard<'a> {
    state: &'a Mutex<CoordinatorState>,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().cleaning_up = false;
    }
}

/// What a forced cleanup round tears down
#[derive(Clone)]
enum CleanupTarget {
    /// The installed backend, taken out of the coordinator
    Handle(Arc<BackendHandle>),
    /// Process-wide accelerator state with no handle behind it
    Global(Arc<dyn NativeBackend>),
}

impl CleanupTarget {
    fn with_native<T>(&self, f: impl FnOnce(&dyn NativeBackend) -> T) -> T {
        match self {
            CleanupTarget::Handle(handle) => {
                handle.mark_released();
                handle.teardown(f)
            }
            CleanupTarget::Global(native) => f(native.as_ref()),
        }
    }
}

#[derive(Clone, Copy)]
struct Timings {
    op_timeout: Duration,
    pause: Duration,
    shutdown_budget: Duration,
}

pub struct LifecycleCoordinator {
    state: Mutex<CoordinatorState>,
    init_lock: tokio::sync::Mutex<()>,
    selector: BackendSelector,
    native: NativeWorker,
    cleanup: NativeWorker,
}

impl LifecycleCoordinator {
    /// Create a coordinator and start its worker threads.
    ///
    /// `defaults` governs cleanup timing until the first initialize call.
    pub fn new(selector: BackendSelector, defaults: EngineConfig) -> Result<Arc<Self>> {
        let native = NativeWorker::spawn("llm-native")?;
        let cleanup = NativeWorker::spawn("llm-cleanup")?;
        Ok(Arc::new(Self {
            state: Mutex::new(CoordinatorState {
                current: BackendKind::None,
                handle: None,
                active_session: None,
                config: defaults,
                accelerator_init_count: 0,
                consecutive_failures: 0,
                cleaning_up: false,
                next_session_id: 0,
            }),
            init_lock: tokio::sync::Mutex::new(()),
            selector,
            native,
            cleanup,
        }))
    }

    pub fn current_backend(&self) -> BackendKind {
        self.state.lock().current
    }

    pub fn current_handle(&self) -> Option<Arc<BackendHandle>> {
        self.state.lock().handle.clone()
    }

    pub fn active_session(&self) -> Option<Arc<GenerationSession>> {
        self.state.lock().active_session.clone()
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.handle.is_some() && !state.cleaning_up
    }

    pub fn is_cleaning_up(&self) -> bool {
        self.state.lock().cleaning_up
    }

    pub fn accelerator_init_count(&self) -> u32 {
        self.state.lock().accelerator_init_count
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub fn ensure_not_cleaning(&self) -> std::result::Result<(), LifecycleError> {
        if self.is_cleaning_up() {
            return Err(LifecycleError::CleanupInProgress);
        }
        Ok(())
    }

    pub(crate) fn native_worker(&self) -> &NativeWorker {
        &self.native
    }

    pub(crate) fn needs_forced_cleanup(&self, config: &EngineConfig) -> bool {
        let state = self.state.lock();
        state.accelerator_init_count >= config.max_accelerator_init_attempts
            || state.consecutive_failures >= config.max_consecutive_failures
    }

    pub(crate) fn record_accelerator_success(&self) -> u32 {
        let mut state = self.state.lock();
        state.accelerator_init_count += 1;
        state.consecutive_failures = 0;
        state.accelerator_init_count
    }

    pub(crate) fn record_accelerator_failure(&self) -> u32 {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;
        state.consecutive_failures
    }

    fn begin_cleanup(&self) -> std::result::Result<CleanupGuard<'_>, LifecycleError> {
        let mut state = self.state.lock();
        if state.cleaning_up {
            return Err(LifecycleError::CleanupInProgress);
        }
        state.cleaning_up = true;
        Ok(CleanupGuard { state: &self.state })
    }

    fn timings(&self) -> Timings {
        let state = self.state.lock();
        Timings {
            op_timeout: state.config.native_op_timeout(),
            pause: state.config.cleanup_pause(),
            shutdown_budget: state.config.shutdown_budget(),
        }
    }

    /// Tear down any current backend, then select and initialize a new one.
    ///
    /// The attempt races a timer; whichever finishes first decides the
    /// result. An attempt that succeeds after the timer fired is released
    /// and never installed.
    pub async fn initialize(self: &Arc<Self>, config: EngineConfig) -> InitOutcome {
        self.ensure_not_cleaning()?;
        self.state.lock().config = config.clone();

        let limit = config.init_timeout();
        let (slot, receiver) = ResultSlot::<InitOutcome>::new();
        let slot = Arc::new(slot);

        let timer = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if slot.complete(Err(InitError::Timeout(limit))) {
                    error!("Backend initialization timed out after {:?}", limit);
                }
            })
        };

        let this = Arc::clone(self);
        let attempt_slot = Arc::clone(&slot);
        tokio::spawn(async move {
            let _serial = this.init_lock.lock().await;
            if attempt_slot.is_done() {
                debug!("Initialization timed out while queued, skipping attempt");
                return;
            }
            match this.attempt_initialize(&config).await {
                Ok(selection) => this.install(selection, &attempt_slot).await,
                Err(e) => {
                    if !attempt_slot.complete(Err(e)) {
                        debug!("Discarding initialization failure that arrived after the timeout");
                    }
                }
            }
        });

        let result = receiver.await.unwrap_or_else(|_| {
            Err(InitError::AllBackendsFailed(
                "initialization task aborted".to_string(),
            ))
        });
        timer.abort();
        result
    }

    async fn attempt_initialize(
        &self,
        config: &EngineConfig,
    ) -> std::result::Result<Selection, InitError> {
        self.release_all().await;
        self.ensure_not_cleaning()?;
        info!(preferred = %config.preferred_backend, "Initializing backend");
        self.selector.select(self, config).await
    }

    async fn install(
        &self,
        selection: Selection,
        slot: &ResultSlot<InitOutcome>,
    ) {
        let Selection { kind, handle } = selection;
        let (installed, orphan) = {
            let mut state = self.state.lock();
            if slot.complete(Ok(kind)) {
                state.current = kind;
                (true, state.handle.replace(handle))
            } else {
                (false, Some(handle))
            }
        };

        if installed {
            info!("{} backend installed", kind);
        } else {
            warn!("{} backend finished initializing after the timeout, releasing it", kind);
        }
        let Some(orphan) = orphan else {
            return;
        };
        if installed {
            warn!("Replacing a {} backend that was installed concurrently", orphan.kind());
        }
        let timings = self.timings();
        let orphan_kind = orphan.kind();
        let release = move || orphan.release();
        if let Err(e) = self.cleanup.run_bounded(release, timings.op_timeout).await {
            warn!("Releasing orphaned {} backend failed: {}", orphan_kind, e);
        }
    }

    /// Stop the active session, then release the backend and reset to NONE.
    ///
    /// Idempotent. Skipped if another cleanup holds the latch.
    pub async fn release_all(&self) {
        let _guard = match self.begin_cleanup() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Cleanup already in progress, skipping release");
                return;
            }
        };

        let (session, handle) = {
            let mut state = self.state.lock();
            state.current = BackendKind::None;
            (state.active_session.take(), state.handle.take())
        };

        // Queued ahead of the teardown so the stop reaches a live handle
        if let Some(session) = session.filter(|s| s.is_active()) {
            session.stop(&self.cleanup);
        }

        let Some(handle) = handle else {
            debug!("No backend to release");
            return;
        };

        let kind = handle.kind();
        let timings = self.timings();
        let teardown = move || {
            if !handle.mark_released() {
                return None;
            }
            Some(handle.teardown(|native: &dyn NativeBackend| {
                if kind == BackendKind::Accelerator {
                    thread::sleep(timings.pause);
                    match guard_native(|| native.reset()) {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Reset before release failed: {}", e),
                        Err(msg) => warn!("Reset before release panicked: {}", msg),
                    }
                    thread::sleep(timings.pause);
                }
                guard_native(|| native.release())
            }))
        };

        match self.cleanup.run_bounded(teardown, timings.op_timeout).await {
            Ok(Some(Ok(()))) => {
                let mut state = self.state.lock();
                state.accelerator_init_count = 0;
                info!("{} backend released", kind);
            }
            Ok(None) => debug!("{} backend already released", kind),
            Ok(Some(Err(msg))) => error!("{} release panicked: {}", kind, msg),
            Err(e) => error!("{} release did not complete: {}", kind, e),
        }
    }

    /// Reset and release native state several times over, then zero the
    /// accelerator counters. Used when the accelerator looks wedged.
    pub async fn force_cleanup(&self) {
        self.cleanup_rounds(FORCED_CLEANUP_ROUNDS).await;
    }

    async fn cleanup_rounds(&self, rounds: usize) {
        let _guard = match self.begin_cleanup() {
            Ok(guard) => guard,
            Err(_) => {
                info!("Cleanup already in progress, skipping forced cleanup");
                return;
            }
        };

        let timings = self.timings();
        let (session, target) = {
            let mut state = self.state.lock();
            state.current = BackendKind::None;
            let session = state.active_session.take();
            let target = match state.handle.take() {
                Some(handle) => Some(CleanupTarget::Handle(handle)),
                None => self
                    .selector
                    .accelerator_target(&state.config)
                    .map(CleanupTarget::Global),
            };
            (session, target)
        };

        if let Some(session) = session.filter(|s| s.is_active()) {
            session.stop(&self.cleanup);
        }

        match target {
            Some(target) => {
                info!(rounds, "Forcing native cleanup");
                for round in 1..=rounds {
                    let target = target.clone();
                    let job = move || {
                        target.with_native(|native: &dyn NativeBackend| {
                            if let Err(msg) = guard_native(|| native.reset()) {
                                warn!(round, "Reset panicked: {}", msg);
                            }
                            thread::sleep(timings.pause);
                            if let Err(msg) = guard_native(|| native.release()) {
                                warn!(round, "Release panicked: {}", msg);
                            }
                        })
                    };
                    match self.cleanup.run_bounded(job, timings.op_timeout).await {
                        Ok(()) => debug!(round, "Cleanup round finished"),
                        Err(e) => warn!(round, "Cleanup round failed: {}", e),
                    }
                    if round < rounds {
                        tokio::time::sleep(timings.pause * 2).await;
                    }
                }
            }
            None => debug!("No native state to clean up"),
        }

        let mut state = self.state.lock();
        state.accelerator_init_count = 0;
        state.consecutive_failures = 0;
        info!("Forced cleanup finished");
    }

    /// Best-effort teardown when the host process is going away.
    ///
    /// Runs one emergency cleanup round and a full release, bounded by the
    /// shutdown budget, then stops the worker threads.
    pub async fn on_process_shutdown(&self) {
        let budget = self.timings().shutdown_budget;
        let teardown = async {
            self.cleanup_rounds(1).await;
            self.release_all().await;
        };
        if tokio::time::timeout(budget, teardown).await.is_err() {
            warn!("Shutdown cleanup exceeded {:?}, abandoning it", budget);
        }
        self.native.shutdown();
        self.cleanup.shutdown();
        info!("Lifecycle coordinator shut down");
    }

    /// Start a generation session on the installed backend
    pub fn start_session(
        &self,
        prompt: impl Into<String>,
        mode: SessionMode,
        on_token: Option<TokenCallback>,
    ) -> Result<(Arc<GenerationSession>, PendingResult)> {
        let (session, request) = {
            let mut state = self.state.lock();
            if state.cleaning_up {
                return Err(LifecycleError::CleanupInProgress.into());
            }
            let handle = state
                .handle
                .clone()
                .ok_or(EngineError::Infer(InferError::BackendNotReady))?;
            if state.active_session.as_ref().is_some_and(|s| s.is_active()) {
                return Err(LifecycleError::SessionBusy.into());
            }

            state.next_session_id += 1;
            let session = GenerationSession::new(
                state.next_session_id,
                handle,
                state.config.stop_tokens.clone(),
                on_token,
            );
            state.active_session = Some(Arc::clone(&session));
            let request = SessionRequest {
                prompt: prompt.into(),
                mode,
                max_tokens: state.config.max_response_tokens,
                generation_timeout: state.config.generation_timeout(),
            };
            (session, request)
        };

        let pending = session.start(&self.native, request)?;
        Ok((session, pending))
    }

    /// Stop the active session, if any. Returns whether one was running.
    ///
    /// The session settles right away; the native interrupt runs on the
    /// cleanup worker.
    pub fn stop_generation(&self) -> bool {
        match self.active_session() {
            Some(session) if session.is_active() => {
                session.stop(&self.cleanup);
                true
            }
            _ => false,
        }
    }
}
