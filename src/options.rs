use std::collections::HashMap;
use std::time::Duration;

/// Host configuration.
///
/// Every field has a production default; tests shorten the timing knobs with
/// the `with_*` builders.
///
/// ```rust
/// use std::time::Duration;
/// use flowhost::HostOptions;
///
/// let options = HostOptions::default()
///     .with_host_id("worker-a")
///     .with_bump_wait(Duration::from_secs(30))
///     .with_setting("region", "eu-west");
/// assert_eq!(options.host_id, "worker-a");
/// ```
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Identity of this host; its queues are bound to it.
    pub host_id: String,
    /// Load-balanced exchange carrying jobs and instance creation.
    pub direct_exchange: String,
    /// Fanout exchange carrying trigger notices to every host.
    pub broadcast_exchange: String,
    /// Route key every host's direct queue is bound to, for load-balanced delivery.
    pub any_host_route: String,
    /// Page size when an agent reads its pending triggers.
    pub trigger_page_size: usize,
    /// Longest an idle agent waits for a bump before polling again.
    pub bump_wait: Duration,
    /// How long instance creation waits for the instance lock.
    pub new_instance_lock_timeout: Duration,
    /// Wake delay after a nap when a machine has an activation trigger.
    pub nap_wake_delay: Duration,
    /// Bounds of the random interval between grooming passes.
    pub groom_interval: (Duration, Duration),
    /// Bounds of the random delay between reconciliation acquisition attempts.
    pub reconcile_delay: (Duration, Duration),
    /// Listener poll timeout; `None` uses the transport's suggestion.
    pub listener_poll_timeout: Option<Duration>,
    /// Minimum spacing of agent loop failure alerts.
    pub alert_interval: Duration,
    /// Upper bound on triggers chained from one fire (auto-next, exception, retry).
    pub max_chained_triggers: usize,
    /// Values for `config(key)` route references. Missing keys fall back to
    /// environment variables.
    pub settings: HashMap<String, String>,
}

impl Default for HostOptions {
    fn default() -> Self {
        let short_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self {
            host_id: format!("host-{short_id}"),
            direct_exchange: "flowhost.direct".to_string(),
            broadcast_exchange: "flowhost.broadcast".to_string(),
            any_host_route: "flowhost.any".to_string(),
            trigger_page_size: 50,
            bump_wait: Duration::from_secs(5 * 60),
            new_instance_lock_timeout: Duration::from_secs(300),
            nap_wake_delay: Duration::from_secs(60 * 60),
            groom_interval: (Duration::from_secs(60), Duration::from_secs(31 * 60)),
            reconcile_delay: (Duration::from_millis(50), Duration::from_millis(500)),
            listener_poll_timeout: None,
            alert_interval: Duration::from_secs(60),
            max_chained_triggers: 64,
            settings: HashMap::new(),
        }
    }
}

impl HostOptions {
    pub fn with_host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }

    pub fn with_exchanges(mut self, direct: impl Into<String>, broadcast: impl Into<String>) -> Self {
        self.direct_exchange = direct.into();
        self.broadcast_exchange = broadcast.into();
        self
    }

    pub fn with_trigger_page_size(mut self, size: usize) -> Self {
        self.trigger_page_size = size.max(1);
        self
    }

    pub fn with_bump_wait(mut self, wait: Duration) -> Self {
        self.bump_wait = wait;
        self
    }

    pub fn with_new_instance_lock_timeout(mut self, timeout: Duration) -> Self {
        self.new_instance_lock_timeout = timeout;
        self
    }

    pub fn with_nap_wake_delay(mut self, delay: Duration) -> Self {
        self.nap_wake_delay = delay;
        self
    }

    pub fn with_groom_interval(mut self, min: Duration, max: Duration) -> Self {
        self.groom_interval = (min, max.max(min));
        self
    }

    pub fn with_reconcile_delay(mut self, min: Duration, max: Duration) -> Self {
        self.reconcile_delay = (min, max.max(min));
        self
    }

    pub fn with_listener_poll_timeout(mut self, timeout: Duration) -> Self {
        self.listener_poll_timeout = Some(timeout);
        self
    }

    pub fn with_alert_interval(mut self, interval: Duration) -> Self {
        self.alert_interval = interval;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Setting for a `config(key)` reference: explicit settings first, then the environment.
    pub fn setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).cloned().or_else(|| std::env::var(key).ok())
    }
}

/// Uniform random duration in `[min, max]`.
pub(crate) fn random_between(min: Duration, max: Duration) -> Duration {
    use rand::Rng;
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = HostOptions::default();
        assert!(o.host_id.starts_with("host-"));
        assert_eq!(o.bump_wait, Duration::from_secs(300));
        assert_eq!(o.new_instance_lock_timeout, Duration::from_secs(300));
        assert_eq!(o.nap_wake_delay, Duration::from_secs(3600));
        assert_eq!(o.groom_interval, (Duration::from_secs(60), Duration::from_secs(1860)));
        assert_ne!(HostOptions::default().host_id, o.host_id);
    }

    #[test]
    fn settings_fall_back_to_environment() {
        let o = HostOptions::default().with_setting("flowhost_test_region", "eu");
        assert_eq!(o.setting("flowhost_test_region").as_deref(), Some("eu"));
        assert_eq!(o.setting("PATH"), std::env::var("PATH").ok());
        assert_eq!(o.setting("flowhost_definitely_unset_key"), None);
    }

    #[test]
    fn random_between_stays_in_range() {
        for _ in 0..100 {
            let d = random_between(Duration::from_millis(10), Duration::from_millis(20));
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        assert_eq!(random_between(Duration::from_secs(2), Duration::from_secs(1)), Duration::from_secs(2));
    }
}
