use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Injectable time source so window-reset behavior is testable without
/// touching the system clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Premium-engine quota profile. Limits are audio seconds per window.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    #[default]
    Free,
    Developer,
}

impl RateLimitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitTier::Free => "free",
            RateLimitTier::Developer => "developer",
        }
    }

    fn hourly_limit_seconds(self) -> i64 {
        match self {
            RateLimitTier::Free => 7_200,
            RateLimitTier::Developer => 28_800,
        }
    }

    fn daily_limit_seconds(self) -> i64 {
        match self {
            RateLimitTier::Free => 28_800,
            RateLimitTier::Developer => 115_200,
        }
    }
}

#[derive(Debug, Clone)]
struct UsageWindow {
    limit_seconds: i64,
    used_seconds: i64,
    resets_at: DateTime<Utc>,
    length: ChronoDuration,
}

impl UsageWindow {
    fn new(limit_seconds: i64, now: DateTime<Utc>, length: ChronoDuration) -> Self {
        Self {
            limit_seconds,
            used_seconds: 0,
            resets_at: now + length,
            length,
        }
    }

    /// Lazy, window-boundary-aligned reset. Long idle periods advance the
    /// boundary by whole windows until it lies in the future.
    fn apply_pending_reset(&mut self, now: DateTime<Utc>) {
        if now < self.resets_at {
            return;
        }
        self.used_seconds = 0;
        while self.resets_at <= now {
            self.resets_at = self.resets_at + self.length;
        }
    }

    /// May be negative once the backend reports more usage than the limit;
    /// negative remaining keeps admission denying until the reset.
    fn remaining_seconds(&self) -> i64 {
        self.limit_seconds - self.used_seconds
    }

    fn stats(&self) -> WindowStats {
        WindowStats {
            limit_seconds: self.limit_seconds,
            used_seconds: self.used_seconds,
            remaining_seconds: self.remaining_seconds(),
            resets_at: self.resets_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub hourly_remaining_seconds: i64,
    pub daily_remaining_seconds: i64,
    /// Time until the binding window resets, present only on denial.
    pub estimated_wait: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WindowStats {
    pub limit_seconds: i64,
    pub used_seconds: i64,
    pub remaining_seconds: i64,
    pub resets_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitStats {
    pub tier: RateLimitTier,
    pub hourly: WindowStats,
    pub daily: WindowStats,
}

impl RateLimitStats {
    /// Renders the binding window as the `rateLimits` payload of a
    /// 429-style response.
    pub fn to_denial_details(&self, now: DateTime<Utc>) -> serde_json::Value {
        let binding = if self.hourly.remaining_seconds <= self.daily.remaining_seconds {
            &self.hourly
        } else {
            &self.daily
        };
        let resets_in = (binding.resets_at - now).to_std().unwrap_or_default();

        serde_json::json!({
            "used": binding.used_seconds,
            "limit": binding.limit_seconds,
            "remaining": binding.remaining_seconds,
            "resetsIn": format!("{} minutes", wait_display_minutes(resets_in)),
            "resetTime": binding.resets_at.to_rfc3339(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLimitSync {
    pub used_seconds: i64,
    pub reset_delay: Duration,
    pub estimated_reset_at: DateTime<Utc>,
}

/// Rounds a wait up to whole minutes for user-facing display.
pub fn wait_display_minutes(wait: Duration) -> u64 {
    wait.as_secs().div_ceil(60).max(1)
}

/// In-memory premium-quota accounting. All mutation goes through one owner;
/// share it as [`SharedRateLimitTracker`] and keep admission plus usage
/// tracking inside a single lock guard.
pub struct RateLimitTracker {
    tier: RateLimitTier,
    hourly: UsageWindow,
    daily: UsageWindow,
    clock: Arc<dyn Clock>,
}

pub type SharedRateLimitTracker = Arc<tokio::sync::Mutex<RateLimitTracker>>;

impl RateLimitTracker {
    pub fn new(tier: RateLimitTier, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            tier,
            hourly: UsageWindow::new(tier.hourly_limit_seconds(), now, ChronoDuration::hours(1)),
            daily: UsageWindow::new(tier.daily_limit_seconds(), now, ChronoDuration::days(1)),
            clock,
        }
    }

    pub fn shared(tier: RateLimitTier, clock: Arc<dyn Clock>) -> SharedRateLimitTracker {
        Arc::new(tokio::sync::Mutex::new(Self::new(tier, clock)))
    }

    /// Predictive admission: a transcription of `duration_seconds` is
    /// admissible iff it fits the hourly and the daily window.
    pub fn can_process(&mut self, duration_seconds: i64) -> AdmissionDecision {
        let now = self.clock.now();
        self.hourly.apply_pending_reset(now);
        self.daily.apply_pending_reset(now);

        let hourly_remaining = self.hourly.remaining_seconds();
        let daily_remaining = self.daily.remaining_seconds();
        let hourly_ok = duration_seconds <= hourly_remaining;
        let daily_ok = duration_seconds <= daily_remaining;

        let estimated_wait = if hourly_ok && daily_ok {
            None
        } else {
            // Wait until every binding window has reset.
            let mut until = None::<DateTime<Utc>>;
            if !hourly_ok {
                until = Some(self.hourly.resets_at);
            }
            if !daily_ok {
                until = Some(match until {
                    Some(t) => t.max(self.daily.resets_at),
                    None => self.daily.resets_at,
                });
            }
            until.map(|t| (t - now).to_std().unwrap_or_default())
        };

        AdmissionDecision {
            allowed: hourly_ok && daily_ok,
            hourly_remaining_seconds: hourly_remaining,
            daily_remaining_seconds: daily_remaining,
            estimated_wait,
        }
    }

    /// Records consumed audio seconds in both windows. Counters are not
    /// clamped to the limit: overruns surface as negative remaining.
    pub fn track_usage(&mut self, duration_seconds: i64) {
        let now = self.clock.now();
        self.hourly.apply_pending_reset(now);
        self.daily.apply_pending_reset(now);
        self.hourly.used_seconds += duration_seconds;
        self.daily.used_seconds += duration_seconds;
    }

    /// Resynchronizes local bookkeeping after the premium backend rejected a
    /// call as rate-limited despite the pre-check. The backend is
    /// authoritative: mark the hourly window exhausted, honor its retry
    /// hint when one can be parsed, and spill into the daily window when the
    /// hint reaches past the hourly boundary.
    pub fn handle_rate_limit_error(&mut self, backend_message: &str) -> BackendLimitSync {
        let now = self.clock.now();
        self.hourly.apply_pending_reset(now);
        self.daily.apply_pending_reset(now);

        let reset_delay = parse_retry_after(backend_message)
            .unwrap_or_else(|| (self.hourly.resets_at - now).to_std().unwrap_or_default());

        self.hourly.used_seconds = self.hourly.used_seconds.max(self.hourly.limit_seconds);
        let estimated_reset_at = now
            + ChronoDuration::from_std(reset_delay).unwrap_or_else(|_| ChronoDuration::hours(1));
        if estimated_reset_at > self.hourly.resets_at {
            self.daily.used_seconds = self.daily.used_seconds.max(self.daily.limit_seconds);
        }

        BackendLimitSync {
            used_seconds: self.hourly.used_seconds,
            reset_delay,
            estimated_reset_at,
        }
    }

    /// Read-only snapshot after lazy resets; repeated calls within a window
    /// return identical counters.
    pub fn usage_stats(&mut self) -> RateLimitStats {
        let now = self.clock.now();
        self.hourly.apply_pending_reset(now);
        self.daily.apply_pending_reset(now);

        RateLimitStats {
            tier: self.tier,
            hourly: self.hourly.stats(),
            daily: self.daily.stats(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Extracts the backend's "try again in 1h2m3.5s" hint, when present.
fn parse_retry_after(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    let marker = "try again in ";
    let start = lower.find(marker)? + marker.len();
    let token: String = lower
        .get(start..)?
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | 'h' | 'm' | 's'))
        .collect();
    parse_compound_duration(&token)
}

/// Parses compound duration tokens such as "1h2m", "7m59.56s" or "450ms".
fn parse_compound_duration(token: &str) -> Option<Duration> {
    let mut total_seconds = 0_f64;
    let mut number = String::new();
    let mut chars = token.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let value: f64 = number.parse().ok()?;
        number.clear();
        match c {
            'h' => total_seconds += value * 3600.0,
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    total_seconds += value / 1000.0;
                } else {
                    total_seconds += value * 60.0;
                }
            }
            's' => total_seconds += value,
            _ => return None,
        }
    }

    if !number.is_empty() {
        // Trailing number without a unit.
        return None;
    }
    (total_seconds > 0.0).then(|| Duration::from_secs_f64(total_seconds))
}
