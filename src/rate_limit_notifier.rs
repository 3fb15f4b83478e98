use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const QUIET_PERIOD: Duration = Duration::from_secs(600);

static RATE_LIMIT_NOTIFIER: Lazy<RateLimitNotifier> = Lazy::new(RateLimitNotifier::new);

/// Reports a rate-limit hit. Repeats for the same context within ten
/// minutes are dropped. Returns whether a warning was emitted.
pub fn notify_rate_limit(context: &str, detail: &str) -> bool {
    RATE_LIMIT_NOTIFIER.notify(context, detail, Instant::now())
}

struct RateLimitNotifier {
    account_tag: String,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl RateLimitNotifier {
    fn new() -> Self {
        let account_tag = std::env::var("PAIRBOT_ACCOUNT_TAG").unwrap_or_default();
        Self {
            account_tag,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn notify(&self, context: &str, detail: &str, now: Instant) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return false;
        };
        if let Some(previous) = last_sent.get(context) {
            if now.duration_since(*previous) < QUIET_PERIOD {
                return false;
            }
        }
        last_sent.insert(context.to_string(), now);
        drop(last_sent);

        if self.account_tag.is_empty() {
            log::warn!("[RateLimit] throttled while {} (detail: {})", context, detail);
        } else {
            log::warn!(
                "[RateLimit] [{}] throttled while {} (detail: {})",
                self.account_tag,
                context,
                detail
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_within_quiet_period_are_suppressed() {
        let notifier = RateLimitNotifier {
            account_tag: String::new(),
            last_sent: Mutex::new(HashMap::new()),
        };
        let start = Instant::now();
        assert!(notifier.notify("submit_order (AAPL)", "429", start));
        assert!(!notifier.notify("submit_order (AAPL)", "429", start + Duration::from_secs(60)));
        assert!(notifier.notify("get_latest_quote (AAPL)", "429", start + Duration::from_secs(60)));
        assert!(notifier.notify("submit_order (AAPL)", "429", start + QUIET_PERIOD));
    }
}
