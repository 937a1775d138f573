//! Scripted engine shared by the context engine and scheduler tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::memory::Turn;
use crate::model_runtime::*;

pub(crate) type Responder = Arc<dyn Fn(&[Turn]) -> anyhow::Result<String> + Send + Sync>;

#[derive(Default)]
pub(crate) struct Recorder {
    requests: Mutex<Vec<InferenceRequest>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Recorder {
    pub(crate) fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ScriptedRuntime {
    recorder: Arc<Recorder>,
    responder: Responder,
    delay: Duration,
}

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    fn supported_format(&self) -> ModelFormat {
        ModelFormat::GGUF
    }

    async fn initialize(&mut self, _config: RuntimeConfig) -> anyhow::Result<()> {
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        true
    }

    async fn health_check(&self) -> anyhow::Result<String> {
        Ok("healthy".to_string())
    }

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.recorder.requests.lock().unwrap().push(request.clone());
        let now = self.recorder.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.recorder.active.fetch_sub(1, Ordering::SeqCst);
        let content = (self.responder)(&request.turns)?;
        Ok(InferenceResponse {
            content,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            format: ModelFormat::GGUF,
            runtime_name: "scripted".to_string(),
            model_id: "scripted-model".to_string(),
            device: ResolvedDevice::Cpu,
        }
    }
}

pub(crate) fn replying(text: &'static str) -> Responder {
    Arc::new(move |_| Ok(text.to_string()))
}

pub(crate) fn scripted_router(responder: Responder) -> (Arc<BackendRouter>, Arc<Recorder>) {
    scripted_router_with_delay(responder, Duration::ZERO)
}

pub(crate) fn scripted_router_with_delay(
    responder: Responder,
    delay: Duration,
) -> (Arc<BackendRouter>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let factory_recorder = Arc::clone(&recorder);
    let factory: RuntimeFactory = Arc::new(move |_| -> Box<dyn ModelRuntime> {
        Box::new(ScriptedRuntime {
            recorder: Arc::clone(&factory_recorder),
            responder: Arc::clone(&responder),
            delay,
        })
    });
    let timeouts = RouterTimeouts {
        slot_wait: Duration::from_secs(60),
        generation: Duration::from_secs(60),
    };
    let router = BackendRouter::with_factory(RuntimeConfig::default(), timeouts, factory);
    (Arc::new(router), recorder)
}
