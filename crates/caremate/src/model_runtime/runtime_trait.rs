use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::device::ResolvedDevice;
use crate::memory::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    /// Quantized weights served locally by llama.cpp.
    GGUF,
    /// Full-precision weights referenced by repository id.
    Transformers,
}

impl ModelFormat {
    /// File extensions that mark a quantized artifact.
    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::GGUF => &["gguf", "ggml", "bin"],
            ModelFormat::Transformers => &[],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::GGUF => "GGUF (llama.cpp)",
            ModelFormat::Transformers => "Transformers (full precision)",
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, ModelFormat::GGUF)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Quantized artifact on disk, or the repository id for full-precision weights.
    pub model_path: PathBuf,
    pub model_id: String,
    pub format: ModelFormat,
    pub device: ResolvedDevice,
    pub host: String,
    pub port: u16,
    /// Attach to an already running engine instead of spawning one.
    pub base_url: Option<String>,
    pub context_size: u32,
    pub threads: u32,
    pub runtime_binary: Option<PathBuf>,
    pub load_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            model_id: "local-llm".to_string(),
            format: ModelFormat::GGUF,
            device: ResolvedDevice::Cpu,
            host: "127.0.0.1".to_string(),
            port: 8081,
            base_url: None,
            context_size: 2048,
            threads: 4,
            runtime_binary: None,
            load_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.5,
            top_p: 0.85,
            stop_sequences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub turns: Vec<Turn>,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub content: String,
    pub finish_reason: Option<String>,
}

/// One concrete inference engine. Stateless per call once initialized.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    fn supported_format(&self) -> ModelFormat;

    /// Expensive: spawns or attaches to the engine and waits for it to be healthy.
    async fn initialize(&mut self, config: RuntimeConfig) -> anyhow::Result<()>;

    async fn is_ready(&self) -> bool;

    async fn health_check(&self) -> anyhow::Result<String>;

    async fn generate(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse>;

    async fn shutdown(&mut self) -> anyhow::Result<()>;

    fn metadata(&self) -> RuntimeMetadata;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub format: ModelFormat,
    pub runtime_name: String,
    pub model_id: String,
    pub device: ResolvedDevice,
}
