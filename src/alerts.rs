//! Best-effort operator alerts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Fire-and-forget alert channel. Implementations must not block.
pub trait AlertSink: Send + Sync {
    fn alert(&self, severity: Severity, message: &str);
}

/// Default sink: alerts become log records under `flowhost::alerts`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn alert(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => tracing::info!(target: "flowhost::alerts", alert = message),
            Severity::Warning => tracing::warn!(target: "flowhost::alerts", alert = message),
            Severity::Error => tracing::error!(target: "flowhost::alerts", alert = message),
        }
    }
}

/// Forwards at most one alert per `interval`; the rest are dropped.
pub struct RateLimitedAlerts {
    inner: Arc<dyn AlertSink>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimitedAlerts {
    pub fn new(inner: Arc<dyn AlertSink>, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last: Mutex::new(None),
        }
    }
}

impl AlertSink for RateLimitedAlerts {
    fn alert(&self, severity: Severity, message: &str) {
        let now = Instant::now();
        {
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            if last.is_some_and(|t| now.duration_since(t) < self.interval) {
                tracing::debug!(target: "flowhost::alerts", alert = message, "alert suppressed");
                return;
            }
            *last = Some(now);
        }
        self.inner.alert(severity, message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Sink that records every alert it receives.
    #[derive(Default)]
    pub struct RecordingAlerts {
        pub seen: Mutex<Vec<(Severity, String)>>,
    }

    impl AlertSink for RecordingAlerts {
        fn alert(&self, severity: Severity, message: &str) {
            self.seen
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push((severity, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingAlerts;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limit_drops_within_interval() {
        let sink = Arc::new(RecordingAlerts::default());
        let limited = RateLimitedAlerts::new(sink.clone(), Duration::from_secs(60));

        limited.alert(Severity::Error, "first");
        limited.alert(Severity::Error, "second");
        tokio::time::advance(Duration::from_secs(61)).await;
        limited.alert(Severity::Warning, "third");

        let seen = sink.seen.lock().unwrap();
        let messages: Vec<_> = seen.iter().map(|(_, m)| m.as_str()).collect();
        assert_eq!(messages, vec!["first", "third"]);
    }
}
