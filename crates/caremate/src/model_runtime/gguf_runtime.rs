//! GGUF Runtime Adapter
//!
//! Spawns llama-server (llama.cpp) for a quantized artifact and proxies
//! chat completions to it over HTTP.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info, warn};

use super::completion_client::{self, looks_like_oom};
use super::runtime_trait::*;
use crate::error::CareError;

const STDERR_TAIL_LINES: usize = 20;

pub struct GGUFRuntime {
    config: Option<RuntimeConfig>,
    server_process: Option<Child>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    http_client: reqwest::Client,
    base_url: String,
}

impl GGUFRuntime {
    pub fn new() -> Self {
        Self {
            config: None,
            server_process: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            base_url: String::new(),
        }
    }

    /// Explicit binary first, then `llama-server` on PATH.
    pub fn locate_binary(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(path) = configured {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(anyhow::anyhow!(
                "llama-server binary not found at: {}",
                path.display()
            ));
        }
        which::which("llama-server")
            .map_err(|_| anyhow::anyhow!("llama-server not found on PATH; set LLAMA_BIN"))
    }

    /// Refuses to load a CPU model bigger than the free RAM.
    fn check_memory(artifact: &Path, device_is_gpu: bool) -> anyhow::Result<()> {
        if device_is_gpu {
            return Ok(());
        }
        let needed = std::fs::metadata(artifact)?.len();
        let mut sys = System::new();
        sys.refresh_memory();
        let available = sys.available_memory();
        if available > 0 && needed > available {
            return Err(CareError::ResourceExhausted(format!(
                "model needs {} MB but only {} MB of memory is available",
                needed / 1024 / 1024,
                available / 1024 / 1024
            ))
            .into());
        }
        Ok(())
    }

    fn spawn_stderr_reader(&self, child: &mut Child) {
        let Some(stderr) = child.stderr.take() else {
            return;
        };
        let tail = Arc::clone(&self.stderr_tail);
        std::thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                debug!(target: "llama_server", "{}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });
    }

    fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    async fn start_server(&mut self, config: &RuntimeConfig) -> anyhow::Result<()> {
        let binary_path = Self::locate_binary(config.runtime_binary.as_deref())?;
        let gpu_layers = config.device.gpu_layers();

        info!("Starting llama-server for GGUF model: {}", config.model_path.display());
        info!("  Binary: {}", binary_path.display());
        info!("  Port: {}", config.port);
        info!("  Context Size: {}", config.context_size);
        info!("  Device: {} ({} GPU layers)", config.device, gpu_layers);

        let mut cmd = Command::new(&binary_path);
        cmd.arg("--model").arg(&config.model_path)
            .arg("--host").arg(&config.host)
            .arg("--port").arg(config.port.to_string())
            .arg("--ctx-size").arg(config.context_size.to_string())
            .arg("--threads").arg(config.threads.to_string())
            .arg("--n-gpu-layers").arg(gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn llama-server: {}", e))?;
        self.spawn_stderr_reader(&mut child);
        self.server_process = Some(child);
        self.base_url = format!("http://{}:{}", config.host, config.port);

        info!("llama-server process started, waiting for health check...");

        let http = self.http_client.clone();
        let base_url = self.base_url.clone();
        let tail = Arc::clone(&self.stderr_tail);
        let process = &mut self.server_process;
        let result = completion_client::wait_until_healthy(&http, &base_url, config.load_timeout, || {
            let child = process.as_mut()?;
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = tail
                        .lock()
                        .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
                        .unwrap_or_default();
                    if looks_like_oom(&stderr) {
                        Some(CareError::ResourceExhausted("llama-server ran out of memory while loading".to_string()).into())
                    } else {
                        Some(anyhow::anyhow!("llama-server exited during load ({}): {}", status, stderr))
                    }
                }
                _ => None,
            }
        })
        .await;

        match result {
            Ok(waited) => {
                info!("GGUF runtime ready after {:.1}s", waited.as_secs_f32());
                Ok(())
            }
            Err(e) => {
                self.kill_server();
                Err(e)
            }
        }
    }

    fn kill_server(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            match child.kill() {
                Ok(_) => {
                    info!("llama-server process killed successfully");
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to kill llama-server process: {}", e),
            }
        }
    }
}

impl Default for GGUFRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelRuntime for GGUFRuntime {
    fn supported_format(&self) -> ModelFormat {
        ModelFormat::GGUF
    }

    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()> {
        info!("Initializing GGUF runtime");

        if config.format != ModelFormat::GGUF {
            return Err(anyhow::anyhow!(
                "GGUF runtime received wrong format: {:?}",
                config.format
            ));
        }

        if !config.model_path.exists() {
            return Err(anyhow::anyhow!(
                "Model file not found: {}",
                config.model_path.display()
            ));
        }

        Self::check_memory(&config.model_path, config.device.is_gpu())?;

        self.config = Some(config.clone());
        self.start_server(&config).await
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
            Err(anyhow::anyhow!("llama-server at {} is not answering", self.base_url))
        }
    }

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let model_id = self
            .config
            .as_ref()
            .map(|c| c.model_id.as_str())
            .unwrap_or("local-llm");
        completion_client::chat_completion(&self.http_client, &url, model_id, request)
            .await
            .map_err(|e| {
                let tail = self.stderr_tail();
                if looks_like_oom(&tail) {
                    CareError::ResourceExhausted("llama-server ran out of memory".to_string()).into()
                } else {
                    e
                }
            })
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        info!("Shutting down GGUF runtime");
        self.kill_server();
        self.config = None;
        self.base_url.clear();
        Ok(())
    }

    fn metadata(&self) -> RuntimeMetadata {
        let config = self.config.clone().unwrap_or_default();
        RuntimeMetadata {
            format: ModelFormat::GGUF,
            runtime_name: "llama.cpp (llama-server)".to_string(),
            model_id: config.model_id,
            device: config.device,
        }
    }
}

impl Drop for GGUFRuntime {
    fn drop(&mut self) {
        if let Some(mut child) = self.server_process.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uninitialized_runtime_is_not_ready() {
        let runtime = GGUFRuntime::new();
        assert!(!runtime.is_ready().await);
        assert!(runtime.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_rejected() {
        let mut runtime = GGUFRuntime::new();
        let config = RuntimeConfig {
            model_path: PathBuf::from("/nonexistent/model.gguf"),
            ..Default::default()
        };
        let err = runtime.initialize(config).await.unwrap_err();
        assert!(err.to_string().contains("Model file not found"));
    }

    #[tokio::test]
    async fn test_wrong_format_is_rejected() {
        let mut runtime = GGUFRuntime::new();
        let config = RuntimeConfig {
            format: ModelFormat::Transformers,
            ..Default::default()
        };
        assert!(runtime.initialize(config).await.is_err());
    }

    #[test]
    fn test_configured_binary_must_exist() {
        let err = GGUFRuntime::locate_binary(Some(Path::new("/nonexistent/llama-server"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_small_artifact_fits_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("tiny.gguf");
        std::fs::write(&artifact, b"GGUF").unwrap();
        assert!(GGUFRuntime::check_memory(&artifact, false).is_ok());
    }

    #[tokio::test]
    async fn test_generate_proxies_to_server() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"ok"},"finish_reason":"stop"}]}"#)
            .create_async()
            .await;

        let mut runtime = GGUFRuntime::new();
        runtime.base_url = server.url();
        let request = InferenceRequest {
            turns: vec![crate::memory::Turn::user("hi")],
            params: GenerationParams::default(),
        };
        let resp = runtime.generate(&request).await.unwrap();
        assert_eq!(resp.content, "ok");
    }
}
