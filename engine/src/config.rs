use serde::Deserialize;

/// Runtime tuning for the engine. Everything has a sensible default; deploys
/// override the fields they care about.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Scheduler tick driving due-lot closes, in milliseconds.
    pub close_tick_ms: u64,
    /// Idle time before a subscription heartbeat frame, in seconds.
    pub heartbeat_secs: u64,
    /// Frames buffered per subscriber before a slow consumer is detached.
    pub subscriber_buffer: usize,
    /// Backoff schedule for serialization-conflict retries, in milliseconds.
    /// The list length bounds the retry count.
    pub retry_backoff_ms: Vec<u64>,
    /// Sliding-window rate limit applied per identity by the API layer:
    /// at most `rate_limit_max` bid calls per `rate_limit_window_secs`.
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            close_tick_ms: 1_000,
            heartbeat_secs: 30,
            subscriber_buffer: 64,
            retry_backoff_ms: vec![1, 5, 25],
            rate_limit_max: 30,
            rate_limit_window_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_retry_schedule() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_backoff_ms, vec![1, 5, 25]);
        assert_eq!(config.heartbeat_secs, 30);
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"close_tick_ms": 250}"#).unwrap();
        assert_eq!(config.close_tick_ms, 250);
        assert_eq!(config.subscriber_buffer, 64);
    }
}
