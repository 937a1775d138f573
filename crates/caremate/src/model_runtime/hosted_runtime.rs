//! Full-precision runtime adapter.
//!
//! Serves a repository-referenced model through an OpenAI-compatible
//! text-generation server. When `runtime_binary` is set the server is
//! launched with the repository id; otherwise the adapter attaches to the
//! server already listening at `base_url`.

use async_trait::async_trait;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

use super::completion_client;
use super::device::ResolvedDevice;
use super::runtime_trait::*;

pub struct HostedRuntime {
    config: Option<RuntimeConfig>,
    server_process: Option<Child>,
    http_client: reqwest::Client,
    base_url: String,
}

impl HostedRuntime {
    pub fn new() -> Self {
        Self {
            config: None,
            server_process: None,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            base_url: String::new(),
        }
    }

    fn launch(&mut self, config: &RuntimeConfig) -> anyhow::Result<()> {
        let Some(binary) = config.runtime_binary.as_ref() else {
            return Ok(());
        };
        info!("Launching text-generation server: {}", binary.display());
        info!("  Model: {}", config.model_id);
        info!("  Device: {}", config.device);

        let mut cmd = Command::new(binary);
        cmd.arg("--model-id").arg(&config.model_id)
            .arg("--hostname").arg(&config.host)
            .arg("--port").arg(config.port.to_string())
            .arg("--max-total-tokens").arg(config.context_size.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let ResolvedDevice::Cpu = config.device {
            cmd.env("CUDA_VISIBLE_DEVICES", "");
        }

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn {}: {}", binary.display(), e))?;
        self.server_process = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            if let Err(e) = child.kill() {
                warn!("Failed to stop text-generation server: {}", e);
            }
            let _ = child.wait();
        }
    }
}

impl Default for HostedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelRuntime for HostedRuntime {
    fn supported_format(&self) -> ModelFormat {
        ModelFormat::Transformers
    }

    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()> {
        info!("Initializing full-precision runtime for {}", config.model_id);

        if config.format != ModelFormat::Transformers {
            return Err(anyhow::anyhow!(
                "Hosted runtime received wrong format: {:?}",
                config.format
            ));
        }

        self.base_url = match (&config.base_url, &config.runtime_binary) {
            (Some(url), None) => url.trim_end_matches('/').to_string(),
            _ => format!("http://{}:{}", config.host, config.port),
        };
        self.launch(&config)?;

        let http = self.http_client.clone();
        let base_url = self.base_url.clone();
        let process = &mut self.server_process;
        let result = completion_client::wait_until_healthy(&http, &base_url, config.load_timeout, || {
            let child = process.as_mut()?;
            match child.try_wait() {
                Ok(Some(status)) => Some(anyhow::anyhow!(
                    "text-generation server exited during load ({})",
                    status
                )),
                _ => None,
            }
        })
        .await;

        match result {
            Ok(waited) => {
                info!("Full-precision runtime ready at {} after {:.1}s", self.base_url, waited.as_secs_f32());
                self.config = Some(config);
                Ok(())
            }
            Err(e) => {
                self.stop();
                self.base_url.clear();
                Err(e)
            }
        }
    }

    async fn is_ready(&self) -> bool {
        if self.base_url.is_empty() {
            return false;
        }
        completion_client::probe_health(&self.http_client, &self.base_url).await
    }

    async fn health_check(&self) -> anyhow::Result<String> {
        if self.base_url.is_empty() {
            return Err(anyhow::anyhow!("Runtime not initialized"));
        }
        if self.is_ready().await {
            Ok("healthy".to_string())
        } else {
            Err(anyhow::anyhow!("text-generation server at {} is not answering", self.base_url))
        }
    }

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let model_id = self
            .config
            .as_ref()
            .map(|c| c.model_id.as_str())
            .unwrap_or("tgi");
        completion_client::chat_completion(&self.http_client, &url, model_id, request).await
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        info!("Shutting down full-precision runtime");
        self.stop();
        self.config = None;
        self.base_url.clear();
        Ok(())
    }

    fn metadata(&self) -> RuntimeMetadata {
        let config = self.config.clone().unwrap_or_default();
        RuntimeMetadata {
            format: ModelFormat::Transformers,
            runtime_name: "text-generation server".to_string(),
            model_id: config.model_id,
            device: config.device,
        }
    }
}

impl Drop for HostedRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
