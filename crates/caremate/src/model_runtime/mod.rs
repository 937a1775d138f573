//! Model runtime layer.
//!
//! Two engine adapters share one trait: llama.cpp for quantized artifacts
//! and an OpenAI-compatible text-generation server for full-precision
//! weights. Both are reached over HTTP. [`BackendRouter`] picks one,
//! loads it lazily and serializes generations through a single slot.
pub mod completion_client;
pub mod device;
pub mod format_detector;
pub mod gguf_runtime;
pub mod hosted_runtime;
pub mod runtime_manager;
pub mod runtime_trait;

pub use device::{DeviceSelector, GpuInfo, ResolvedDevice};
pub use format_detector::{BackendSelection, FormatDetector};
pub use gguf_runtime::GGUFRuntime;
pub use hosted_runtime::HostedRuntime;
pub use runtime_manager::{plan_runtime, BackendRouter, RouterTimeouts, RuntimeFactory};
pub use runtime_trait::{
    GenerationParams, InferenceRequest, InferenceResponse, ModelFormat, ModelRuntime, RuntimeConfig,
    RuntimeMetadata,
};
