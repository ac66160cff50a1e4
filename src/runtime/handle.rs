//! Owned handle over an initialized native backend

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::BackendKind;
use crate::config::EngineConfig;
use crate::error::{panic_message, InferError, InitError, LifecycleError};

/// Operations every native runtime adapter exposes
///
/// Implementations call straight into foreign code and may block for
/// seconds. They are only ever invoked from a dedicated worker thread.
pub trait NativeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn init(&self, config: &EngineConfig) -> Result<(), InitError>;

    /// Run a full generation and return the raw text
    fn infer(&self, prompt: &str, max_tokens: usize) -> Result<String, InferError>;

    /// Run a generation, handing each piece to `sink` as it is produced
    fn infer_streaming(
        &self,
        prompt: &str,
        max_tokens: usize,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String, InferError>;

    /// Clear native generation state. Safe after a failed init.
    fn reset(&self) -> Result<(), InferError>;

    /// Restore native state once a generation has returned
    fn after_generation(&self) {}

    /// Interrupt an in-flight generation
    fn stop(&self);

    fn release(&self);
}

/// Runs a native call, turning a panic into an error message.
pub(crate) fn guard_native<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

/// An initialized backend. Released exactly once; any call after that
/// fails with [`LifecycleError::UseAfterRelease`].
///
/// A release that lands while a generation is returning waits for the
/// post-generation step, and that step is skipped once the handle is
/// released.
pub struct BackendHandle {
    backend: Arc<dyn NativeBackend>,
    released: AtomicBool,
    teardown: Mutex<()>,
}

impl BackendHandle {
    /// Initialize `backend` and wrap it on success
    pub fn open(backend: Arc<dyn NativeBackend>, config: &EngineConfig) -> Result<Self, InitError> {
        let kind = backend.kind();
        match guard_native(|| backend.init(config)) {
            Ok(Ok(())) => {
                info!("{} backend initialized", kind);
                Ok(Self {
                    backend,
                    released: AtomicBool::new(false),
                    teardown: Mutex::new(()),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(msg) => Err(InitError::ModelLoadFailed(format!(
                "{} init panicked: {}",
                kind, msg
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<(), InferError> {
        if self.is_released() {
            return Err(LifecycleError::UseAfterRelease.into());
        }
        Ok(())
    }

    pub fn infer(&self, prompt: &str, max_tokens: usize) -> Result<String, InferError> {
        self.ensure_live()?;
        let outcome = guard_native(|| self.backend.infer(prompt, max_tokens));
        self.finish_generation();
        outcome.map_err(InferError::NativeFault)?
    }

    pub fn infer_streaming(
        &self,
        prompt: &str,
        max_tokens: usize,
        sink: &mut dyn FnMut(&str),
    ) -> Result<String, InferError> {
        self.ensure_live()?;
        let outcome = guard_native(|| self.backend.infer_streaming(prompt, max_tokens, sink));
        self.finish_generation();
        outcome.map_err(InferError::NativeFault)?
    }

    fn finish_generation(&self) {
        let _teardown = self.teardown.lock();
        if self.is_released() {
            debug!("{} backend released mid-generation, skipping post-generation step", self.kind());
            return;
        }
        if let Err(msg) = guard_native(|| self.backend.after_generation()) {
            warn!("{} post-generation step panicked: {}", self.kind(), msg);
        }
    }

    pub fn reset(&self) -> Result<(), InferError> {
        self.ensure_live()?;
        guard_native(|| self.backend.reset()).map_err(InferError::NativeFault)?
    }

    /// Interrupt generation. No-op once released.
    pub fn stop(&self) {
        if self.is_released() {
            return;
        }
        if let Err(msg) = guard_native(|| self.backend.stop()) {
            warn!("{} stop panicked: {}", self.kind(), msg);
        }
    }

    /// Release the native backend. Only the first call reaches native code.
    pub fn release(&self) {
        if !self.mark_released() {
            debug!("{} backend already released", self.kind());
            return;
        }
        let _teardown = self.teardown.lock();
        if let Err(msg) = guard_native(|| self.backend.release()) {
            warn!("{} release panicked: {}", self.kind(), msg);
        }
    }

    /// Flip the handle to released without touching native code.
    ///
    /// Returns false if it was already released. The caller becomes
    /// responsible for tearing down [`Self::native`].
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Run a teardown step against the native backend of a handle the
    /// caller has already marked released.
    pub(crate) fn teardown<T>(&self, f: impl FnOnce(&dyn NativeBackend) -> T) -> T {
        let _teardown = self.teardown.lock();
        f(self.backend.as_ref())
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        // Handles orphaned by a timed-out init still own native state
        if self.mark_released() {
            debug!("Releasing dropped {} handle", self.kind());
            if let Err(msg) = guard_native(|| self.backend.release()) {
                warn!("{} release on drop panicked: {}", self.kind(), msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Stub {
        fail_init: bool,
        panic_infer: bool,
        releases: AtomicUsize,
        restores: AtomicUsize,
    }

    impl NativeBackend for Stub {
        fn kind(&self) -> BackendKind {
            BackendKind::Cpu
        }
        fn init(&self, _config: &EngineConfig) -> Result<(), InitError> {
            if self.fail_init {
                Err(InitError::ModelLoadFailed("status 3".into()))
            } else {
                Ok(())
            }
        }
        fn infer(&self, prompt: &str, _max_tokens: usize) -> Result<String, InferError> {
            if self.panic_infer {
                panic!("segfault in runner");
            }
            Ok(format!("echo: {}", prompt))
        }
        fn infer_streaming(
            &self,
            prompt: &str,
            max_tokens: usize,
            sink: &mut dyn FnMut(&str),
        ) -> Result<String, InferError> {
            sink(prompt);
            self.infer(prompt, max_tokens)
        }
        fn reset(&self) -> Result<(), InferError> {
            Ok(())
        }
        fn after_generation(&self) {
            self.restores.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {}
        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_is_idempotent_and_blocks_later_calls() {
        let stub = Arc::new(Stub::default());
        let handle = BackendHandle::open(stub.clone(), &EngineConfig::default()).unwrap();
        assert_eq!(handle.infer("hi", 8).unwrap(), "echo: hi");

        handle.release();
        handle.release();
        assert_eq!(stub.releases.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.infer("hi", 8),
            Err(InferError::Lifecycle(LifecycleError::UseAfterRelease))
        );
        assert!(handle.reset().is_err());

        drop(handle);
        assert_eq!(stub.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_becomes_native_fault() {
        let stub = Arc::new(Stub {
            panic_infer: true,
            ..Default::default()
        });
        let handle = BackendHandle::open(stub, &EngineConfig::default()).unwrap();
        match handle.infer("hi", 8) {
            Err(InferError::NativeFault(msg)) => assert!(msg.contains("segfault")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_failed_open_and_drop_release() {
        let stub = Arc::new(Stub {
            fail_init: true,
            ..Default::default()
        });
        assert!(BackendHandle::open(stub.clone(), &EngineConfig::default()).is_err());
        assert_eq!(stub.releases.load(Ordering::SeqCst), 0);

        let stub = Arc::new(Stub::default());
        let handle = BackendHandle::open(stub.clone(), &EngineConfig::default()).unwrap();
        drop(handle);
        assert_eq!(stub.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_post_generation_step_skipped_after_release() {
        let stub = Arc::new(Stub::default());
        let handle = BackendHandle::open(stub.clone(), &EngineConfig::default()).unwrap();
        handle.infer("hi", 8).unwrap();
        assert_eq!(stub.restores.load(Ordering::SeqCst), 1);

        // A generation that returns after the release must not touch native state
        assert!(handle.mark_released());
        handle.finish_generation();
        assert_eq!(stub.restores.load(Ordering::SeqCst), 1);

        let released = handle.teardown(|native| {
            native.release();
            true
        });
        assert!(released);
        assert_eq!(stub.releases.load(Ordering::SeqCst), 1);
    }
}
