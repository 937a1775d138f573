//! Backend Router
//!
//! Owns the single inference engine. The engine is loaded lazily on first
//! use behind a load gate, and every generation runs through one global
//! execution slot so at most one call is inside the engine at a time.
//! Waiters are served FIFO (tokio's semaphore is fair).

use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::device::{probe_cuda, GpuInfo};
use super::format_detector::{BackendSelection, FormatDetector};
use super::runtime_trait::*;
use super::{GGUFRuntime, HostedRuntime};
use crate::config::Config;
use crate::error::{CareError, CareResult};
use crate::memory::Turn;
use crate::metrics;

/// Builds an unloaded engine adapter for a format.
pub type RuntimeFactory = Arc<dyn Fn(ModelFormat) -> Box<dyn ModelRuntime> + Send + Sync>;

pub fn default_factory() -> RuntimeFactory {
    Arc::new(|format| -> Box<dyn ModelRuntime> {
        match format {
            ModelFormat::GGUF => Box::new(GGUFRuntime::new()),
            ModelFormat::Transformers => Box::new(HostedRuntime::new()),
        }
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RouterTimeouts {
    pub slot_wait: Duration,
    pub generation: Duration,
}

impl RouterTimeouts {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            slot_wait: Duration::from_secs(cfg.slot_wait_timeout_seconds),
            generation: Duration::from_secs(cfg.generate_timeout_seconds),
        }
    }
}

/// Resolves backend and device for the configured model.
pub fn plan_runtime(cfg: &Config) -> CareResult<RuntimeConfig> {
    plan_runtime_with(cfg, probe_cuda)
}

pub fn plan_runtime_with<P>(cfg: &Config, probe: P) -> CareResult<RuntimeConfig>
where
    P: FnOnce() -> Option<GpuInfo>,
{
    let device = cfg.device.resolve_with(probe)?;
    let selection = FormatDetector::select(cfg.model_path.as_deref(), &cfg.model_name);
    let base = RuntimeConfig {
        device,
        context_size: cfg.max_context_length as u32,
        threads: cfg.threads,
        load_timeout: Duration::from_secs(cfg.load_timeout_seconds),
        ..Default::default()
    };

    let plan = match selection {
        BackendSelection::Quantized { artifact } => RuntimeConfig {
            model_path: artifact,
            model_id: cfg.model_name.clone(),
            format: ModelFormat::GGUF,
            host: cfg.llama_host.clone(),
            port: cfg.llama_port,
            base_url: None,
            runtime_binary: cfg.llama_bin.as_ref().map(PathBuf::from),
            ..base
        },
        BackendSelection::Repository { model_id } => {
            let url = reqwest::Url::parse(&cfg.hosted_url)
                .map_err(|e| CareError::InvalidConfig(format!("HOSTED_URL '{}': {}", cfg.hosted_url, e)))?;
            RuntimeConfig {
                model_path: PathBuf::from(&model_id),
                model_id,
                format: ModelFormat::Transformers,
                host: url.host_str().unwrap_or("127.0.0.1").to_string(),
                port: url.port_or_known_default().unwrap_or(80),
                base_url: Some(cfg.hosted_url.clone()),
                runtime_binary: cfg.hosted_bin.as_ref().map(PathBuf::from),
                ..base
            }
        }
    };
    info!(
        "Backend plan: {} for {} on {}",
        plan.format.name(),
        plan.model_id,
        plan.device
    );
    Ok(plan)
}

struct RuntimeHolder {
    runtime: Option<Arc<dyn ModelRuntime>>,
}

impl RuntimeHolder {
    fn empty() -> Arc<Self> {
        Arc::new(Self { runtime: None })
    }
}

pub struct BackendRouter {
    holder: ArcSwap<RuntimeHolder>,
    plan: ArcSwap<RuntimeConfig>,
    load_gate: Mutex<()>,
    slot: Semaphore,
    factory: RuntimeFactory,
    timeouts: RouterTimeouts,
    loads: AtomicU64,
}

impl BackendRouter {
    pub fn new(plan: RuntimeConfig, timeouts: RouterTimeouts) -> Self {
        Self::with_factory(plan, timeouts, default_factory())
    }

    pub fn with_factory(plan: RuntimeConfig, timeouts: RouterTimeouts, factory: RuntimeFactory) -> Self {
        Self {
            holder: ArcSwap::new(RuntimeHolder::empty()),
            plan: ArcSwap::from_pointee(plan),
            load_gate: Mutex::new(()),
            slot: Semaphore::new(1),
            factory,
            timeouts,
            loads: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &Config) -> CareResult<Self> {
        Ok(Self::new(plan_runtime(cfg)?, RouterTimeouts::from_config(cfg)))
    }

    pub fn is_loaded(&self) -> bool {
        self.holder.load().runtime.is_some()
    }

    /// Number of load attempts so far, successful or not.
    pub fn load_attempts(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn current_plan(&self) -> RuntimeConfig {
        self.plan.load_full().as_ref().clone()
    }

    pub fn metadata(&self) -> Option<RuntimeMetadata> {
        self.holder.load().runtime.as_ref().map(|r| r.metadata())
    }

    fn loaded_runtime(&self) -> Option<Arc<dyn ModelRuntime>> {
        self.holder.load_full().runtime.clone()
    }

    /// Returns the loaded engine, loading it once if necessary. A failed
    /// load is reported to this caller; the next caller tries again.
    pub async fn ensure_loaded(&self) -> CareResult<Arc<dyn ModelRuntime>> {
        if let Some(runtime) = self.loaded_runtime() {
            return Ok(runtime);
        }

        let _gate = self.load_gate.lock().await;
        if let Some(runtime) = self.loaded_runtime() {
            return Ok(runtime);
        }

        let plan = self.current_plan();
        self.loads.fetch_add(1, Ordering::Relaxed);
        info!("Loading {} engine for {}", plan.format.name(), plan.model_id);
        let started = Instant::now();

        let mut runtime = (self.factory)(plan.format);
        if let Err(e) = runtime.initialize(plan.clone()).await {
            error!("Failed to initialize {} runtime: {:#}", plan.format.name(), e);
            metrics::inc_model_load("error");
            return Err(match e.downcast::<CareError>() {
                Ok(care) => care,
                Err(other) => CareError::ModelUnavailable(format!("failed to load {}: {}", plan.model_id, other)),
            });
        }

        let runtime: Arc<dyn ModelRuntime> = Arc::from(runtime);
        let metadata = runtime.metadata();
        info!(
            "Runtime ready in {:.1}s: {} serving {} on {}",
            started.elapsed().as_secs_f32(),
            metadata.runtime_name,
            metadata.model_id,
            metadata.device
        );
        self.holder.store(Arc::new(RuntimeHolder {
            runtime: Some(Arc::clone(&runtime)),
        }));
        metrics::inc_model_load("ok");
        metrics::set_model_loaded(true);
        Ok(runtime)
    }

    /// Runs one generation through the global slot.
    pub async fn generate(&self, turns: Vec<Turn>, params: GenerationParams) -> CareResult<String> {
        let wait_started = Instant::now();
        metrics::inc_slot_queue();
        let permit = timeout(self.timeouts.slot_wait, self.slot.acquire()).await;
        metrics::dec_slot_queue();
        let waited = wait_started.elapsed();
        metrics::observe_slot_wait(waited.as_secs_f64());

        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(CareError::ModelUnavailable("backend router is shutting down".to_string()))
            }
            Err(_) => {
                warn!("Gave up waiting for the generation slot after {:?}", waited);
                metrics::inc_generation("slot_timeout");
                return Err(CareError::GenerationTimeout {
                    stage: "slot_wait",
                    waited_ms: waited.as_millis() as u64,
                });
            }
        };

        let runtime = self.ensure_loaded().await?;
        let request = InferenceRequest { turns, params };
        debug!("Generating with {} turns", request.turns.len());

        let started = Instant::now();
        let outcome = timeout(self.timeouts.generation, runtime.generate(&request)).await;
        let elapsed = started.elapsed();
        metrics::observe_generation(elapsed.as_secs_f64());

        match outcome {
            Ok(Ok(response)) => {
                metrics::inc_generation("ok");
                Ok(response.content)
            }
            Ok(Err(e)) => {
                metrics::inc_generation("error");
                match e.downcast::<CareError>() {
                    Ok(care) => Err(care),
                    Err(other) => {
                        error!("Generation failed: {:#}", other);
                        if !runtime.is_ready().await {
                            warn!("Engine stopped answering; it will be reloaded on next use");
                            self.drop_runtime().await;
                        }
                        Err(CareError::ModelUnavailable("the engine failed to produce a reply".to_string()))
                    }
                }
            }
            Err(_) => {
                warn!("Generation exceeded {:?}, abandoning call", self.timeouts.generation);
                metrics::inc_generation("timeout");
                Err(CareError::GenerationTimeout {
                    stage: "generation",
                    waited_ms: elapsed.as_millis() as u64,
                })
            }
        }
    }

    pub async fn health_check(&self) -> CareResult<String> {
        match self.loaded_runtime() {
            Some(runtime) => runtime
                .health_check()
                .await
                .map_err(|e| CareError::ModelUnavailable(e.to_string())),
            None => Ok("not loaded".to_string()),
        }
    }

    async fn drop_runtime(&self) {
        let old = self.holder.swap(RuntimeHolder::empty());
        metrics::set_model_loaded(false);
        match Arc::try_unwrap(old) {
            Ok(holder) => {
                if let Some(mut runtime) = holder.runtime {
                    match Arc::get_mut(&mut runtime) {
                        Some(runtime) => {
                            if let Err(e) = runtime.shutdown().await {
                                warn!("Runtime shutdown reported: {}", e);
                            }
                        }
                        // Last clone going away drops the engine process.
                        None => debug!("Runtime still referenced; shutdown deferred to drop"),
                    }
                }
            }
            Err(_) => debug!("Runtime holder still referenced; shutdown deferred to drop"),
        }
    }

    /// Stops the engine after any in-flight generation finishes.
    pub async fn unload(&self) {
        // Same order as `generate`: slot, then gate.
        let _slot = self.slot.acquire().await;
        let _gate = self.load_gate.lock().await;
        if self.is_loaded() {
            info!("Unloading engine");
            self.drop_runtime().await;
        }
    }

    /// Swaps in a new backend plan; the next call loads it.
    pub async fn reconfigure(&self, plan: RuntimeConfig) {
        let _slot = self.slot.acquire().await;
        let _gate = self.load_gate.lock().await;
        info!("Reconfiguring backend to {} ({})", plan.model_id, plan.format.name());
        self.drop_runtime().await;
        self.plan.store(Arc::new(plan));
    }
}
