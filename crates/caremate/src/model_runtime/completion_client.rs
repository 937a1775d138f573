//! OpenAI-compatible chat completion calls shared by the engine adapters.

use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

use super::runtime_trait::{InferenceRequest, InferenceResponse};
use crate::error::CareError;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Engine error text that means the model does not fit in memory.
pub fn looks_like_oom(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("cuda error 2")
        || lower.contains("oom")
}

pub async fn chat_completion(
    http: &reqwest::Client,
    url: &str,
    model: &str,
    request: &InferenceRequest,
) -> anyhow::Result<InferenceResponse> {
    let mut payload = serde_json::json!({
        "model": model,
        "messages": request.turns,
        "max_tokens": request.params.max_new_tokens,
        "temperature": request.params.temperature,
        "top_p": request.params.top_p,
        "stream": false,
    });
    if !request.params.stop_sequences.is_empty() {
        payload["stop"] = serde_json::json!(request.params.stop_sequences);
    }

    let resp = http
        .post(url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Inference request failed: {}", e))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if looks_like_oom(&body) {
            return Err(CareError::ResourceExhausted(format!(
                "engine ran out of memory during generation ({})",
                status
            ))
            .into());
        }
        return Err(anyhow::anyhow!("Inference failed ({}): {}", status, body));
    }

    let response: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

    let content = response["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Response carried no message content"))?
        .trim()
        .to_string();

    let finish_reason = response["choices"][0]["finish_reason"]
        .as_str()
        .map(|s| s.to_string());

    debug!("Completion finished: {} chars, reason {:?}", content.len(), finish_reason);
    Ok(InferenceResponse {
        content,
        finish_reason,
    })
}

pub async fn probe_health(http: &reqwest::Client, base_url: &str) -> bool {
    match http.get(format!("{}/health", base_url)).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Polls `/health` until it answers, the deadline passes, or `exited`
/// reports that the engine process died.
pub async fn wait_until_healthy<F>(
    http: &reqwest::Client,
    base_url: &str,
    timeout: Duration,
    mut exited: F,
) -> anyhow::Result<Duration>
where
    F: FnMut() -> Option<anyhow::Error>,
{
    let started = Instant::now();
    let mut next_report = Duration::from_secs(10);
    loop {
        if probe_health(http, base_url).await {
            return Ok(started.elapsed());
        }
        if let Some(err) = exited() {
            return Err(err);
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(anyhow::anyhow!(
                "engine at {} not healthy within {}s",
                base_url,
                timeout.as_secs()
            ));
        }
        if waited >= next_report {
            info!("Still waiting for engine at {}... ({}s)", base_url, waited.as_secs());
            next_report += Duration::from_secs(10);
        }
        sleep(HEALTH_POLL_INTERVAL).await;
    }
}
