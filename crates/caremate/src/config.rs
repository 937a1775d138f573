// caremate/crates/caremate/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

use crate::model_runtime::DeviceSelector;
use crate::safety::RuleSet;

#[derive(Debug, Clone)]
pub struct Config {
    pub model_name: String,
    pub model_path: Option<String>,
    pub device: DeviceSelector,
    pub llama_bin: Option<String>,
    pub llama_host: String,
    pub llama_port: u16,
    pub hosted_bin: Option<String>,
    pub hosted_url: String,
    pub threads: u32,
    pub max_context_length: usize,
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub summary_max_tokens: u32,
    pub generate_timeout_seconds: u64,
    pub slot_wait_timeout_seconds: u64,
    pub load_timeout_seconds: u64,
    pub scheduler_poll_seconds: u64,
    pub scheduler_timezone: String,
    pub session_retention_days: i64,
    /// Age after which an owner's long-term memory digest is rebuilt.
    pub memory_refresh_hours: i64,
    pub memory_max_messages: usize,
    pub safety_ruleset_version: String,
    pub persona_prompt: Option<String>,
    pub db_path: PathBuf,
    pub api_host: String,
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_name: "Llama3-8B-Chinese-Chat-Q5".to_string(),
            model_path: Some("data/models/Llama3-8B-Chinese-Chat-Q5".to_string()),
            device: DeviceSelector::Auto,
            llama_bin: None,
            llama_host: "127.0.0.1".to_string(),
            llama_port: 8081,
            hosted_bin: None,
            hosted_url: "http://127.0.0.1:8082".to_string(),
            threads: 4,
            max_context_length: 2048,
            max_new_tokens: 256,
            temperature: 0.5,
            top_p: 0.85,
            summary_max_tokens: 200,
            generate_timeout_seconds: 120,
            slot_wait_timeout_seconds: 60,
            load_timeout_seconds: 120,
            scheduler_poll_seconds: 60,
            scheduler_timezone: "Asia/Shanghai".to_string(),
            session_retention_days: 30,
            memory_refresh_hours: 6,
            memory_max_messages: 200,
            safety_ruleset_version: RuleSet::LATEST.to_string(),
            persona_prompt: None,
            db_path: PathBuf::from("./data/caremate.db"),
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let model_path = match lookup("MODEL_PATH") {
            // An explicitly empty MODEL_PATH selects the repository reference.
            Some(v) if v.trim().is_empty() => None,
            Some(v) => Some(v),
            None => defaults.model_path.clone(),
        };

        let device = match get("DEVICE") {
            Some(raw) => DeviceSelector::from_str(&raw)?,
            None => defaults.device,
        };

        let threads = match get("THREADS").as_deref() {
            None | Some("auto") => Self::auto_detect_threads(),
            Some(raw) => raw.parse().with_context(|| format!("THREADS must be a number, got {}", raw))?,
        };

        let safety_ruleset_version = get("SAFETY_RULESET_VERSION")
            .unwrap_or(defaults.safety_ruleset_version.clone());
        if RuleSet::load(&safety_ruleset_version).is_none() {
            return Err(anyhow::anyhow!(
                "Unknown SAFETY_RULESET_VERSION '{}'. Known versions: {:?}",
                safety_ruleset_version,
                RuleSet::KNOWN_VERSIONS
            ));
        }

        let scheduler_timezone = get("SCHEDULER_TIMEZONE").unwrap_or(defaults.scheduler_timezone.clone());
        if scheduler_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(anyhow::anyhow!("Unknown SCHEDULER_TIMEZONE '{}'", scheduler_timezone));
        }

        let cfg = Self {
            model_name: get("MODEL_NAME").unwrap_or(defaults.model_name),
            model_path,
            device,
            llama_bin: get("LLAMA_BIN"),
            llama_host: get("LLAMA_HOST").unwrap_or(defaults.llama_host),
            llama_port: parse_or(&get, "LLAMA_PORT", defaults.llama_port)?,
            hosted_bin: get("HOSTED_BIN"),
            hosted_url: get("HOSTED_URL").unwrap_or(defaults.hosted_url),
            threads,
            max_context_length: parse_or(&get, "MAX_CONTEXT_LENGTH", defaults.max_context_length)?,
            max_new_tokens: parse_or(&get, "MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            temperature: parse_or(&get, "TEMPERATURE", defaults.temperature)?,
            top_p: parse_or(&get, "TOP_P", defaults.top_p)?,
            summary_max_tokens: parse_or(&get, "SUMMARY_MAX_TOKENS", defaults.summary_max_tokens)?,
            generate_timeout_seconds: parse_or(&get, "GENERATE_TIMEOUT_SECONDS", defaults.generate_timeout_seconds)?,
            slot_wait_timeout_seconds: parse_or(&get, "SLOT_WAIT_TIMEOUT_SECONDS", defaults.slot_wait_timeout_seconds)?,
            load_timeout_seconds: parse_or(&get, "LOAD_TIMEOUT_SECONDS", defaults.load_timeout_seconds)?,
            scheduler_poll_seconds: parse_or(&get, "SCHEDULER_POLL_SECONDS", defaults.scheduler_poll_seconds)?,
            scheduler_timezone,
            session_retention_days: parse_or(&get, "SESSION_RETENTION_DAYS", defaults.session_retention_days)?,
            memory_refresh_hours: parse_or(&get, "MEMORY_REFRESH_HOURS", defaults.memory_refresh_hours)?,
            memory_max_messages: parse_or(&get, "MEMORY_MAX_MESSAGES", defaults.memory_max_messages)?,
            safety_ruleset_version,
            persona_prompt: get("PERSONA_PROMPT"),
            db_path: get("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            api_host: get("API_HOST").unwrap_or(defaults.api_host),
            api_port: parse_or(&get, "API_PORT", defaults.api_port)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_context_length < 256 {
            return Err(anyhow::anyhow!(
                "MAX_CONTEXT_LENGTH must be at least 256, got {}",
                self.max_context_length
            ));
        }
        if (self.max_new_tokens as usize) * 2 > self.max_context_length {
            return Err(anyhow::anyhow!(
                "MAX_NEW_TOKENS ({}) must leave at least half of MAX_CONTEXT_LENGTH ({}) for the prompt",
                self.max_new_tokens,
                self.max_context_length
            ));
        }
        if self.summary_max_tokens == 0 || (self.summary_max_tokens as usize) * 2 > self.max_context_length {
            return Err(anyhow::anyhow!(
                "SUMMARY_MAX_TOKENS must be positive and at most half of MAX_CONTEXT_LENGTH"
            ));
        }
        if self.generate_timeout_seconds == 0 || self.slot_wait_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("generation and slot timeouts must be positive"));
        }
        if self.scheduler_poll_seconds == 0 {
            return Err(anyhow::anyhow!("SCHEDULER_POLL_SECONDS must be positive"));
        }
        if self.memory_refresh_hours <= 0 || self.memory_max_messages == 0 {
            return Err(anyhow::anyhow!(
                "MEMORY_REFRESH_HOURS and MEMORY_MAX_MESSAGES must be positive"
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) || !(0.0..=1.0).contains(&self.top_p) {
            return Err(anyhow::anyhow!(
                "sampling out of range: temperature={} top_p={}",
                self.temperature,
                self.top_p
            ));
        }
        Ok(())
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;
        info!("Auto-detected CPU cores: {}", num_cpus);

        match num_cpus {
            1..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Model Name: {}", self.model_name);
        info!("- Model Path: {}", self.model_path.as_deref().unwrap_or("<repository reference>"));
        info!("- Device: {}", self.device);
        info!("- Threads: {}", self.threads);
        info!("- Max Context Length: {}", self.max_context_length);
        info!("- Generate Timeout: {}s (slot wait {}s)", self.generate_timeout_seconds, self.slot_wait_timeout_seconds);
        info!("- Scheduler: every {}s, tz {}", self.scheduler_poll_seconds, self.scheduler_timezone);
        info!("- Long-term Memory: refresh after {}h, up to {} messages", self.memory_refresh_hours, self.memory_max_messages);
        info!("- Safety Rule Set: {}", self.safety_ruleset_version);
        info!("- Database: {}", self.db_path.display());
        info!("- API: {}:{}", self.api_host, self.api_port);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = Config::from_lookup(lookup_from(&[("THREADS", "2")])).unwrap();
        assert_eq!(cfg.max_context_length, 2048);
        assert_eq!(cfg.device, DeviceSelector::Auto);
        assert_eq!(cfg.threads, 2);
        assert_eq!(cfg.safety_ruleset_version, RuleSet::LATEST);
    }

    #[test]
    fn test_recognized_options_are_read() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("MODEL_NAME", "Qwen/Qwen2-1.5B-Instruct"),
            ("MODEL_PATH", ""),
            ("DEVICE", "cpu"),
            ("MAX_CONTEXT_LENGTH", "4096"),
            ("GENERATE_TIMEOUT_SECONDS", "30"),
            ("SCHEDULER_POLL_SECONDS", "15"),
            ("SAFETY_RULESET_VERSION", "v1"),
            ("MEMORY_REFRESH_HOURS", "12"),
            ("THREADS", "8"),
        ]))
        .unwrap();

        assert_eq!(cfg.model_name, "Qwen/Qwen2-1.5B-Instruct");
        assert!(cfg.model_path.is_none());
        assert_eq!(cfg.device, DeviceSelector::Cpu);
        assert_eq!(cfg.max_context_length, 4096);
        assert_eq!(cfg.generate_timeout_seconds, 30);
        assert_eq!(cfg.scheduler_poll_seconds, 15);
        assert_eq!(cfg.threads, 8);
        assert_eq!(cfg.memory_refresh_hours, 12);
        assert_eq!(cfg.memory_max_messages, 200);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let err = Config::from_lookup(lookup_from(&[("DEVICE", "tpu"), ("THREADS", "1")])).unwrap_err();
        assert!(err.to_string().contains("tpu"));
    }

    #[test]
    fn test_unknown_ruleset_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("SAFETY_RULESET_VERSION", "v99"),
            ("THREADS", "1"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_number_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("MAX_CONTEXT_LENGTH", "lots"),
            ("THREADS", "1"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_tiny_context_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("MAX_CONTEXT_LENGTH", "16"),
            ("THREADS", "1"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_reply_budget_must_leave_room_for_prompt() {
        let result = Config::from_lookup(lookup_from(&[
            ("MAX_CONTEXT_LENGTH", "512"),
            ("MAX_NEW_TOKENS", "400"),
            ("THREADS", "1"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_api_addr_parsing() {
        let mut cfg = Config::default();
        cfg.api_port = 3000;
        let addr = cfg.api_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(addr.port(), 3000);
    }

    #[test]
    fn test_auto_detect_threads_returns_positive() {
        assert!(Config::auto_detect_threads() > 0);
    }
}
