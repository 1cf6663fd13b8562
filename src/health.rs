//! Health and metrics endpoints.
//!
//! `/health` doubles as the probe capture clients hit before choosing a
//! transport: it reports whether speech credentials are present and how much
//! session capacity is left, so a client can fail over to another server
//! without opening a doomed WebSocket first.

use crate::engine::RecognitionEngine;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(
    state: web::Data<AppState>,
    engine: web::Data<dyn RecognitionEngine>,
) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let memory_info = get_memory_info();
    let system_status = get_system_status(&config, &metrics);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "speech": {
            "provider": engine.provider_name(),
            "configured": engine.is_configured()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "max": config.limits.max_concurrent_sessions
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "memory": memory_info,
        "system": system_status
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "active_sessions": metrics.active_sessions,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "limits": {
            "max_concurrent_sessions": config.limits.max_concurrent_sessions,
            "max_upload_bytes": config.limits.max_upload_bytes
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(
    config: &crate::config::AppConfig,
    metrics: &crate::state::AppMetrics,
) -> serde_json::Value {
    let session_usage = if config.limits.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.limits.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.limits.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["Relay session capacity nearly exhausted; raise limits.max_concurrent_sessions or add replicas"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::AppMetrics;

    fn metrics_with_sessions(active: u32) -> AppMetrics {
        AppMetrics {
            active_sessions: active,
            ..AppMetrics::default()
        }
    }

    #[test]
    fn test_load_status_thresholds() {
        let mut config = AppConfig::default();
        config.limits.max_concurrent_sessions = 10;

        let normal = get_system_status(&config, &metrics_with_sessions(3));
        assert_eq!(normal["status"], "normal");

        let moderate = get_system_status(&config, &metrics_with_sessions(8));
        assert_eq!(moderate["status"], "moderate_load");

        let high = get_system_status(&config, &metrics_with_sessions(10));
        assert_eq!(high["status"], "high_load");
        assert!(!high["load_warnings"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_zero_capacity_does_not_divide_by_zero() {
        let mut config = AppConfig::default();
        config.limits.max_concurrent_sessions = 0;
        let status = get_system_status(&config, &metrics_with_sessions(0));
        assert_eq!(status["status"], "normal");
    }
}
