//! Decides which backend serves a model reference.
//!
//! A quantized artifact (a `.gguf` file, or a directory holding one) is
//! served locally by llama.cpp; anything else is treated as a repository
//! reference for full-precision weights.
use super::runtime_trait::ModelFormat;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    Quantized { artifact: PathBuf },
    Repository { model_id: String },
}

impl BackendSelection {
    pub fn format(&self) -> ModelFormat {
        match self {
            BackendSelection::Quantized { .. } => ModelFormat::GGUF,
            BackendSelection::Repository { .. } => ModelFormat::Transformers,
        }
    }
}

pub struct FormatDetector;

impl FormatDetector {
    /// Format of a single file, judged by extension.
    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = match extension.as_str() {
            "gguf" | "ggml" => Some(ModelFormat::GGUF),
            // Legacy ggml dumps often ship as `*.bin`; only trust the name.
            "bin" => path
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|name| name.to_lowercase().contains("ggml"))
                .map(|_| ModelFormat::GGUF),
            _ => None,
        };
        if let Some(fmt) = format {
            info!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    /// The artifact itself, or the first quantized file inside a directory.
    pub fn find_quantized_artifact(path: &Path) -> Option<PathBuf> {
        if path.is_file() {
            return Self::detect_from_path(path).map(|_| path.to_path_buf());
        }
        if !path.is_dir() {
            return None;
        }

        let mut candidates: Vec<PathBuf> = std::fs::read_dir(path)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .filter(|p| Self::detect_from_path(p).is_some())
            .collect();
        // Prefer .gguf over legacy formats, then alphabetical for determinism.
        candidates.sort_by_key(|p| {
            let is_gguf = p
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false);
            (!is_gguf, p.clone())
        });
        candidates.into_iter().next()
    }

    /// Picks the backend for a configured model. Quantized wins whenever an
    /// artifact can be found at `model_path`.
    pub fn select(model_path: Option<&str>, model_name: &str) -> BackendSelection {
        if let Some(raw) = model_path {
            if let Some(artifact) = Self::find_quantized_artifact(Path::new(raw)) {
                return BackendSelection::Quantized { artifact };
            }
            info!("No quantized artifact under {}, using repository reference", raw);
        }
        BackendSelection::Repository {
            model_id: model_name.to_string(),
        }
    }

    pub fn supported_extensions() -> Vec<String> {
        ModelFormat::GGUF
            .extensions()
            .iter()
            .map(|e| e.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_gguf_detection() {
        let path = PathBuf::from("model.gguf");
        assert_eq!(FormatDetector::detect_from_path(&path), Some(ModelFormat::GGUF));
    }

    #[test]
    fn test_bin_requires_ggml_in_name() {
        assert_eq!(
            FormatDetector::detect_from_path(Path::new("ggml-model-q4.bin")),
            Some(ModelFormat::GGUF)
        );
        assert_eq!(FormatDetector::detect_from_path(Path::new("pytorch_model.bin")), None);
        assert_eq!(FormatDetector::detect_from_path(Path::new("model.safetensors")), None);
    }

    #[test]
    fn test_directory_with_artifact_selects_quantized() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{}").unwrap();
        fs::write(dir.path().join("llama3-q5.gguf"), b"GGUF").unwrap();

        let selection = FormatDetector::select(dir.path().to_str(), "Llama3-8B");
        assert_eq!(
            selection,
            BackendSelection::Quantized {
                artifact: dir.path().join("llama3-q5.gguf")
            }
        );
        assert_eq!(selection.format(), ModelFormat::GGUF);
    }

    #[test]
    fn test_directory_prefers_gguf_over_ggml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a-ggml.bin"), b"x").unwrap();
        fs::write(dir.path().join("z.gguf"), b"x").unwrap();

        let found = FormatDetector::find_quantized_artifact(dir.path()).unwrap();
        assert_eq!(found, dir.path().join("z.gguf"));
    }

    #[test]
    fn test_missing_path_falls_back_to_repository() {
        let selection = FormatDetector::select(Some("/nonexistent/caremate/model"), "Qwen/Qwen2-1.5B");
        assert_eq!(
            selection,
            BackendSelection::Repository {
                model_id: "Qwen/Qwen2-1.5B".to_string()
            }
        );
    }

    #[test]
    fn test_no_path_is_repository() {
        let selection = FormatDetector::select(None, "org/model");
        assert_eq!(selection.format(), ModelFormat::Transformers);
    }
}
