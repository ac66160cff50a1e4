//! Backend selection with accelerator retries and CPU fallback

use std::sync::Arc;
use tracing::{info, warn};

use super::accelerator::AcceleratorBackend;
use super::cpu::CpuBackend;
use super::handle::{BackendHandle, NativeBackend};
use super::lifecycle::LifecycleCoordinator;
use super::provider::{AcceleratorProvider, CpuProvider};
use super::worker::WorkerError;
use super::BackendKind;
use crate::config::EngineConfig;
use crate::error::InitError;

/// A successfully initialized backend
pub struct Selection {
    pub kind: BackendKind,
    pub handle: Arc<BackendHandle>,
}

/// Chooses and initializes a backend from the registered runtimes
pub struct BackendSelector {
    accelerator: Option<Arc<dyn AcceleratorProvider>>,
    cpu: Option<Arc<dyn CpuProvider>>,
}

impl BackendSelector {
    pub fn new(
        accelerator: Option<Arc<dyn AcceleratorProvider>>,
        cpu: Option<Arc<dyn CpuProvider>>,
    ) -> Self {
        Self { accelerator, cpu }
    }

    pub fn has_accelerator(&self) -> bool {
        self.accelerator.is_some()
    }

    pub fn has_cpu(&self) -> bool {
        self.cpu.is_some()
    }

    /// The accelerator's global native state, for cleanup when no handle
    /// is installed. None if the vendor library never loaded.
    pub(crate) fn accelerator_target(
        &self,
        config: &EngineConfig,
    ) -> Option<Arc<dyn NativeBackend>> {
        let provider = self.accelerator.as_ref()?;
        if !provider.is_available() {
            return None;
        }
        Some(Arc::new(AcceleratorBackend::new(Arc::clone(provider), config)))
    }

    /// Initialize the preferred backend, falling back to CPU when allowed
    pub async fn select(
        &self,
        coordinator: &LifecycleCoordinator,
        config: &EngineConfig,
    ) -> Result<Selection, InitError> {
        coordinator.ensure_not_cleaning()?;
        let mut failures = Vec::new();

        match config.preferred_backend {
            BackendKind::Accelerator => {
                match self.try_accelerator(coordinator, config).await {
                    Ok(selection) => return Ok(selection),
                    Err(e @ InitError::Lifecycle(_)) => return Err(e),
                    Err(e) => {
                        warn!("Accelerator backend unavailable: {}", e);
                        failures.push(format!("accelerator: {}", e));
                    }
                }
                if !config.fallback_to_cpu {
                    return Err(InitError::AllBackendsFailed(failures.join("; ")));
                }
                tokio::time::sleep(config.settle_delay()).await;
                info!("Falling back to CPU backend");
            }
            BackendKind::Cpu => {}
            BackendKind::None => {
                return Err(InitError::AllBackendsFailed(
                    "no backend preferred".to_string(),
                ))
            }
        }

        match self.try_cpu(coordinator, config).await {
            Ok(selection) => Ok(selection),
            Err(e @ InitError::Lifecycle(_)) => Err(e),
            Err(e) => {
                warn!("CPU backend failed: {}", e);
                failures.push(format!("cpu: {}", e));
                Err(InitError::AllBackendsFailed(failures.join("; ")))
            }
        }
    }

    async fn try_accelerator(
        &self,
        coordinator: &LifecycleCoordinator,
        config: &EngineConfig,
    ) -> Result<Selection, InitError> {
        let provider = self.accelerator.clone().ok_or_else(|| {
            InitError::NativeLibraryUnavailable("no accelerator runtime registered".to_string())
        })?;
        if !config.accelerator_enabled {
            return Err(InitError::NativeLibraryUnavailable(
                "accelerator backend disabled".to_string(),
            ));
        }
        if !provider.is_available() {
            return Err(InitError::NativeLibraryUnavailable(
                "vendor runtime library not loaded".to_string(),
            ));
        }

        let mut last_error = None;
        for attempt in 1..=config.max_accelerator_init_attempts {
            if coordinator.needs_forced_cleanup(config) {
                warn!(
                    init_count = coordinator.accelerator_init_count(),
                    consecutive_failures = coordinator.consecutive_failures(),
                    "Accelerator limits reached, forcing cleanup"
                );
                coordinator.force_cleanup().await;
            }
            coordinator.ensure_not_cleaning()?;

            // The vendor runtime needs a moment between teardown and init
            tokio::time::sleep(config.settle_delay()).await;

            let backend: Arc<dyn NativeBackend> =
                Arc::new(AcceleratorBackend::new(Arc::clone(&provider), config));
            // Init is bounded by the init budget, not the native op timeout
            let init_config = config.clone();
            let outcome = coordinator
                .native_worker()
                .run_bounded(
                    move || BackendHandle::open(backend, &init_config),
                    config.init_timeout(),
                )
                .await;

            let error = match outcome {
                Ok(Ok(handle)) => {
                    let init_count = coordinator.record_accelerator_success();
                    info!(attempt, init_count, "Accelerator backend ready");
                    return Ok(Selection {
                        kind: BackendKind::Accelerator,
                        handle: Arc::new(handle),
                    });
                }
                Ok(Err(e)) => e,
                Err(WorkerError::TimedOut(limit)) => {
                    // The hung init still owns the native worker; a retry
                    // would only queue behind it
                    coordinator.record_accelerator_failure();
                    warn!(attempt, "Accelerator init timed out after {:?}", limit);
                    return Err(InitError::Timeout(limit));
                }
                Err(WorkerError::Aborted) => {
                    InitError::ModelLoadFailed("accelerator init aborted".to_string())
                }
                Err(WorkerError::Unavailable(e)) => return Err(e.into()),
            };

            let failures = coordinator.record_accelerator_failure();
            warn!(attempt, consecutive_failures = failures, "Accelerator init failed: {}", error);
            last_error = Some(error);
        }

        Err(last_error.unwrap_or_else(|| {
            InitError::ModelLoadFailed("no accelerator init attempts configured".to_string())
        }))
    }

    async fn try_cpu(
        &self,
        coordinator: &LifecycleCoordinator,
        config: &EngineConfig,
    ) -> Result<Selection, InitError> {
        let provider = self.cpu.clone().ok_or_else(|| {
            InitError::NativeLibraryUnavailable("no CPU runtime registered".to_string())
        })?;
        coordinator.ensure_not_cleaning()?;

        let backend: Arc<dyn NativeBackend> =
            Arc::new(CpuBackend::new(provider, config.stop_tokens.clone()));
        let init_config = config.clone();
        let outcome = coordinator
            .native_worker()
            .run(move || BackendHandle::open(backend, &init_config))
            .await;

        match outcome {
            Ok(Ok(handle)) => {
                info!("CPU backend ready");
                Ok(Selection {
                    kind: BackendKind::Cpu,
                    handle: Arc::new(handle),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(WorkerError::Unavailable(e)) => Err(e.into()),
            Err(e) => Err(InitError::ModelLoadFailed(e.to_string())),
        }
    }
}
