//! Shared application state: runtime configuration, request metrics, and the
//! live relay-session gauge.
//!
//! One [`AppState`] is created at startup and cloned into every worker. All
//! mutable pieces sit behind `Arc<RwLock<..>>` so request handlers, the
//! metrics middleware, and WebSocket actors can touch them concurrently.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across all HTTP handlers and WebSocket actors.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Runtime configuration, updatable through the config endpoint.
    pub config: Arc<RwLock<AppConfig>>,
    /// Counters updated by the middleware and the WebSocket layer.
    pub metrics: Arc<RwLock<AppMetrics>>,
    /// Server start instant, for uptime reporting.
    pub start_time: Instant,
}

/// Process-wide counters exposed through the metrics endpoint.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total HTTP requests since start.
    pub request_count: u64,
    /// Total failed requests since start.
    pub error_count: u64,
    /// Relay sessions currently connected.
    pub active_sessions: u32,
    /// Per-endpoint counters, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Request counters for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Snapshot of the current configuration. Cloning keeps the lock window
    /// short; handlers never hold it across an await point.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Fold one finished request into the per-endpoint counters.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a relay-session slot. Checks the configured ceiling and
    /// increments the gauge in one lock acquisition so two connections
    /// racing for the last slot cannot both win.
    pub fn try_begin_session(&self) -> bool {
        let max_sessions = self.config.read().unwrap().limits.max_concurrent_sessions;
        let mut metrics = self.metrics.write().unwrap();
        if (metrics.active_sessions as usize) < max_sessions {
            metrics.active_sessions += 1;
            true
        } else {
            false
        }
    }

    /// Release a relay-session slot. Saturates at zero so a double release
    /// cannot poison the gauge.
    pub fn end_session(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> u32 {
        self.metrics.read().unwrap().active_sessions
    }

    /// Consistent copy of the counters for serialization.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_sessions: metrics.active_sessions,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
