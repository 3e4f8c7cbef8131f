use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("too many requests in bucket {bucket}")]
pub struct RateLimited {
    pub bucket: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateBucket {
    Moves,
    Chat,
    SetUsername,
    General,
}

impl RateBucket {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Moves => "moves",
            Self::Chat => "chat",
            Self::SetUsername => "set_username",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub max_requests: u32,
    pub window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    pub moves: WindowLimit,
    pub chat: WindowLimit,
    pub set_username: WindowLimit,
    pub general: WindowLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            moves: WindowLimit {
                max_requests: 30,
                window: Duration::from_secs(10),
            },
            chat: WindowLimit {
                max_requests: 20,
                window: Duration::from_secs(60),
            },
            set_username: WindowLimit {
                max_requests: 5,
                window: Duration::from_secs(60),
            },
            general: WindowLimit {
                max_requests: 30,
                window: Duration::from_secs(60),
            },
        }
    }
}

impl RateLimits {
    #[must_use]
    fn limit_for(&self, bucket: RateBucket) -> WindowLimit {
        match bucket {
            RateBucket::Moves => self.moves,
            RateBucket::Chat => self.chat,
            RateBucket::SetUsername => self.set_username,
            RateBucket::General => self.general,
        }
    }
}

/// Fixed-window counters keyed by `(subject, bucket)`. Windows reset
/// lazily on the first request past their horizon; `sweep` drops expired
/// entries wholesale so the map stays bounded.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limits: RateLimits,
    state: Mutex<HashMap<(String, &'static str), (Instant, u32)>>,
}

impl FixedWindowLimiter {
    #[must_use]
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_record(
        &self,
        subject: &str,
        bucket: RateBucket,
    ) -> Result<(), RateLimited> {
        let limit = self.limits.limit_for(bucket);
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = guard
            .entry((subject.to_string(), bucket.name()))
            .or_insert((now, 0));
        if now.duration_since(entry.0) >= limit.window {
            *entry = (now, 0);
        }
        if entry.1 >= limit.max_requests {
            return Err(RateLimited {
                bucket: bucket.name(),
            });
        }
        entry.1 += 1;
        Ok(())
    }

    /// Drops every window whose horizon has passed. Scheduled by the app
    /// server every few minutes to bound memory.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|(_, bucket_name), (start, _)| {
            let window = match *bucket_name {
                "moves" => self.limits.moves.window,
                "chat" => self.limits.chat.window,
                "set_username" => self.limits.set_username.window,
                _ => self.limits.general.window,
            };
            now.duration_since(*start) < window
        });
    }

    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
