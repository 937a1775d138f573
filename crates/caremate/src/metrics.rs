use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static GENERATION_LATENCY: OnceLock<Histogram> = OnceLock::new();
static SLOT_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static SLOT_WAIT_TIME: OnceLock<Histogram> = OnceLock::new();
static MODEL_LOADED: OnceLock<IntGauge> = OnceLock::new();
static MODEL_LOADS: OnceLock<IntCounterVec> = OnceLock::new();
static SAFETY_VERDICTS: OnceLock<IntCounterVec> = OnceLock::new();
static SUMMARIZATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static SCHEDULE_FIRES: OnceLock<IntCounterVec> = OnceLock::new();
static MESSAGES: OnceLock<IntCounterVec> = OnceLock::new();

fn install<M>(cell: &OnceLock<M>, build: impl FnOnce() -> prometheus::Result<M>)
where
    M: Collector + Clone + 'static,
{
    if cell.get().is_some() {
        return;
    }
    match build() {
        Ok(metric) => {
            if cell.set(metric.clone()).is_ok() {
                REGISTRY.register(Box::new(metric)).ok();
            }
        }
        Err(e) => warn!("Failed to create metric: {}", e),
    }
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(prometheus::opts!(name, help), labels)
}

pub fn init_metrics() {
    install(&REQ_COUNTER, || counter_vec("requests_total", "Total requests per route", &["route", "status"]));
    install(&GENERATIONS, || {
        counter_vec("caremate_generations_total", "Backend generation calls by outcome", &["outcome"])
    });
    install(&GENERATION_LATENCY, || {
        Histogram::with_opts(HistogramOpts::new(
            "caremate_generation_seconds",
            "Time spent inside the engine per generation",
        ))
    });
    install(&SLOT_QUEUE_DEPTH, || {
        IntGauge::new("caremate_slot_queue_depth", "Callers waiting for the generation slot")
    });
    install(&SLOT_WAIT_TIME, || {
        Histogram::with_opts(HistogramOpts::new(
            "caremate_slot_wait_seconds",
            "Time spent waiting for the generation slot",
        ))
    });
    install(&MODEL_LOADED, || IntGauge::new("caremate_model_loaded", "1 while an engine is loaded"));
    install(&MODEL_LOADS, || counter_vec("caremate_model_loads_total", "Engine load attempts", &["outcome"]));
    install(&SAFETY_VERDICTS, || {
        counter_vec("caremate_safety_verdicts_total", "Safety verdicts by role", &["role", "category"])
    });
    install(&SUMMARIZATIONS, || {
        counter_vec("caremate_summarizations_total", "Summarization runs", &["outcome"])
    });
    install(&SCHEDULE_FIRES, || {
        counter_vec("caremate_schedule_fires_total", "Scheduled check-ins fired", &["outcome"])
    });
    install(&MESSAGES, || counter_vec("caremate_messages_total", "Messages persisted", &["role"]));
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_generation(outcome: &str) {
    if let Some(counter) = GENERATIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn observe_generation(seconds: f64) {
    if let Some(histogram) = GENERATION_LATENCY.get() {
        histogram.observe(seconds);
    }
}

pub fn inc_slot_queue() {
    if let Some(gauge) = SLOT_QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_slot_queue() {
    if let Some(gauge) = SLOT_QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub fn observe_slot_wait(seconds: f64) {
    if let Some(histogram) = SLOT_WAIT_TIME.get() {
        histogram.observe(seconds);
    }
}

pub fn set_model_loaded(loaded: bool) {
    if let Some(gauge) = MODEL_LOADED.get() {
        gauge.set(i64::from(loaded));
    }
}

pub fn inc_model_load(outcome: &str) {
    if let Some(counter) = MODEL_LOADS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_safety_verdict(role: &str, category: &str) {
    if let Some(counter) = SAFETY_VERDICTS.get() {
        counter.with_label_values(&[role, category]).inc();
    }
}

pub fn inc_summarization(outcome: &str) {
    if let Some(counter) = SUMMARIZATIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_schedule_fire(outcome: &str) {
    if let Some(counter) = SCHEDULE_FIRES.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_message(role: &str) {
    if let Some(counter) = MESSAGES.get() {
        counter.with_label_values(&[role]).inc();
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_counts() {
        init_metrics();
        init_metrics();
        inc_generation("ok");
        inc_safety_verdict("user", "crisis");
        let families = REGISTRY.gather();
        assert!(families.iter().any(|f| f.get_name() == "caremate_generations_total"));
        assert!(families.iter().any(|f| f.get_name() == "caremate_safety_verdicts_total"));
    }
}
