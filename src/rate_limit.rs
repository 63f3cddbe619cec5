use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::GameError;

/// Pass/fail gate applied to each inbound client event.
pub trait RateLimiter: Send {
    fn check(&mut self, now: Instant) -> Result<(), GameError>;
}

/// At most `max_events` per fixed window, counted per connection.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    window: Duration,
    max_events: u32,
    window_start: Option<Instant>,
    count: u32,
}

impl FixedWindowLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms.max(1)),
            max_events: config.max_events.max(1),
            window_start: None,
            count: 0,
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&mut self, now: Instant) -> Result<(), GameError> {
        match self.window_start {
            Some(start) if now.duration_since(start) < self.window => {}
            _ => {
                self.window_start = Some(now);
                self.count = 0;
            }
        }
        if self.count >= self.max_events {
            return Err(GameError::RateLimitExceeded);
        }
        self.count += 1;
        Ok(())
    }
}
