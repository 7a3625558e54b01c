//! Derived metrics
//!
//! Everything here is computed on demand from the request-record ring;
//! nothing is precomputed or persisted.

use super::{ActiveModel, GatewayState, RequestRecord, RequestStatus};
use serde::Serialize;

/// Aggregate request timing and error figures.
#[derive(Debug, Serialize)]
pub struct PerformanceStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate_percent: f64,
    pub completed_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_response_time_ms: Option<f64>,
}

/// Token throughput over the recent window, present only when the backend
/// reported usage for at least one request.
#[derive(Debug, Serialize)]
pub struct TokenStats {
    pub avg_tokens_per_second: f64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
}

#[derive(Debug, Serialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub dropped_events: u64,
}

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub uptime_seconds: u64,
    pub platform: &'static str,
    pub arch: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
}

/// Full `/debug/metrics` report.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    pub performance: PerformanceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_stats: Option<TokenStats>,
    pub model: ActiveModel,
    pub bus: BusStats,
    pub system: SystemStats,
}

/// Round to two decimal places, the precision all percentages and
/// averages are reported at.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn build_report(state: &GatewayState, bus: &crate::bus::EventBus) -> MetricsReport {
    let (records, total_requests, total_errors, model) = state.metrics_view();

    MetricsReport {
        performance: performance_stats(&records, total_requests, total_errors),
        token_stats: token_stats(&records),
        model,
        bus: BusStats {
            subscribers: bus.subscriber_count(),
            dropped_events: bus.dropped_total(),
        },
        system: SystemStats {
            uptime_seconds: state.uptime_seconds(),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            memory_rss_bytes: read_rss_bytes(),
        },
    }
}

fn performance_stats(
    records: &[RequestRecord],
    total_requests: u64,
    total_errors: u64,
) -> PerformanceStats {
    let mut times: Vec<u64> = records
        .iter()
        .filter(|r| r.status == RequestStatus::Completed)
        .filter_map(|r| r.time_ms)
        .collect();
    times.sort_unstable();

    let completed_count = records
        .iter()
        .filter(|r| r.status == RequestStatus::Completed)
        .count();

    let error_rate_percent = if total_requests > 0 {
        round2(total_errors as f64 / total_requests as f64 * 100.0)
    } else {
        0.0
    };

    let (min, median, max, avg) = if times.is_empty() {
        (None, None, None, None)
    } else {
        let sum: u64 = times.iter().sum();
        (
            Some(times[0]),
            Some(times[times.len() / 2]),
            Some(times[times.len() - 1]),
            Some(round2(sum as f64 / times.len() as f64)),
        )
    };

    PerformanceStats {
        total_requests,
        total_errors,
        error_rate_percent,
        completed_count,
        min_response_time_ms: min,
        median_response_time_ms: median,
        max_response_time_ms: max,
        avg_response_time_ms: avg,
    }
}

fn token_stats(records: &[RequestRecord]) -> Option<TokenStats> {
    let with_usage: Vec<&RequestRecord> = records
        .iter()
        .filter(|r| r.token_usage.is_some())
        .collect();
    if with_usage.is_empty() {
        return None;
    }

    let total_prompt: u64 = with_usage
        .iter()
        .map(|r| r.token_usage.unwrap().prompt)
        .sum();
    let total_completion: u64 = with_usage
        .iter()
        .map(|r| r.token_usage.unwrap().completion)
        .sum();

    // Tokens/sec averaged over requests with usage and positive time.
    let rates: Vec<f64> = with_usage
        .iter()
        .filter_map(|r| {
            let time_ms = r.time_ms?;
            if time_ms == 0 {
                return None;
            }
            Some(r.token_usage.unwrap().completion as f64 / (time_ms as f64 / 1000.0))
        })
        .collect();
    let avg_tokens_per_second = if rates.is_empty() {
        0.0
    } else {
        round2(rates.iter().sum::<f64>() / rates.len() as f64)
    };

    let n = with_usage.len() as f64;
    Some(TokenStats {
        avg_tokens_per_second,
        total_prompt_tokens: total_prompt,
        total_completion_tokens: total_completion,
        avg_prompt_tokens: round2(total_prompt as f64 / n),
        avg_completion_tokens: round2(total_completion as f64 / n),
    })
}

/// Resident set size from /proc on Linux; None elsewhere.
fn read_rss_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(rss_pages * 4096)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::state::TokenUsage;

    #[test]
    fn test_empty_report() {
        let state = GatewayState::new();
        let bus = EventBus::new();
        let report = build_report(&state, &bus);

        assert_eq!(report.performance.total_requests, 0);
        assert_eq!(report.performance.error_rate_percent, 0.0);
        assert!(report.performance.avg_response_time_ms.is_none());
        assert!(report.token_stats.is_none());
    }

    #[test]
    fn test_timing_stats() {
        let state = GatewayState::new();
        let bus = EventBus::new();
        for (i, ms) in [100u64, 200, 300].iter().enumerate() {
            state.record_completed(format!("req_{}", i), *ms, None);
        }

        let report = build_report(&state, &bus);
        let perf = &report.performance;
        assert_eq!(perf.total_requests, 3);
        assert_eq!(perf.completed_count, 3);
        assert_eq!(perf.min_response_time_ms, Some(100));
        assert_eq!(perf.median_response_time_ms, Some(200));
        assert_eq!(perf.max_response_time_ms, Some(300));
        assert_eq!(perf.avg_response_time_ms, Some(200.0));
    }

    #[test]
    fn test_error_rate_rounded() {
        let state = GatewayState::new();
        let bus = EventBus::new();
        state.record_completed("req_0".to_string(), 10, None);
        state.record_completed("req_1".to_string(), 10, None);
        state.record_failed("req_2".to_string(), Some(10));

        let report = build_report(&state, &bus);
        // 1 error out of 3 requests.
        assert_eq!(report.performance.error_rate_percent, 33.33);
    }

    #[test]
    fn test_token_stats_present_only_with_usage() {
        let state = GatewayState::new();
        let bus = EventBus::new();
        state.record_completed("req_0".to_string(), 1000, None);
        assert!(build_report(&state, &bus).token_stats.is_none());

        state.record_completed(
            "req_1".to_string(),
            2000,
            Some(TokenUsage {
                prompt: 10,
                completion: 50,
                total: 60,
            }),
        );
        let stats = build_report(&state, &bus).token_stats.unwrap();
        assert_eq!(stats.total_prompt_tokens, 10);
        assert_eq!(stats.total_completion_tokens, 50);
        // 50 completion tokens over 2 seconds.
        assert_eq!(stats.avg_tokens_per_second, 25.0);
    }

    #[test]
    fn test_zero_time_excluded_from_rate() {
        let state = GatewayState::new();
        let bus = EventBus::new();
        state.record_completed(
            "req_0".to_string(),
            0,
            Some(TokenUsage {
                prompt: 1,
                completion: 100,
                total: 101,
            }),
        );

        let stats = build_report(&state, &bus).token_stats.unwrap();
        assert_eq!(stats.avg_tokens_per_second, 0.0);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(33.333333), 33.33);
        assert_eq!(round2(66.666666), 66.67);
        assert_eq!(round2(0.0), 0.0);
    }
}
