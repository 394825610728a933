//! Request rate limits for translation engines, written like `10/s` or `500/m`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which a rate limit is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
}

impl RateLimitPeriod {
    fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// How often a single request token is returned to the bucket.
    fn refill_interval(&self) -> Duration {
        self.per_period.to_duration() / u32::try_from(self.max_requests).unwrap_or(u32::MAX)
    }

    /// Build a limiter which allows a burst of `max_requests`, then trickles
    /// one request at a time back in. Trickling keeps per-minute limits from
    /// stalling the whole pipeline for a minute at a stretch.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.max_requests)
            .max(self.max_requests)
            .refill(1)
            .interval(self.refill_interval().max(Duration::from_millis(1)))
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (count, period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected COUNT/PERIOD"))?;
            let max_requests = count.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            let per_period = period.trim().parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

/// An optional rate limiter shared by every request to one engine.
#[derive(Default)]
pub struct Throttle {
    limiter: Option<RateLimiter>,
}

impl Throttle {
    /// Create a throttle. `None` means "unlimited".
    pub fn new(limit: Option<&RateLimit>) -> Self {
        Self {
            limiter: limit.map(RateLimit::to_rate_limiter),
        }
    }

    /// Wait until we're allowed to send another request.
    pub async fn wait(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_one().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let rate_limit = RateLimit::from_str("10/s").unwrap();
        assert_eq!(rate_limit.max_requests, 10);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Second);
        assert_eq!(rate_limit.to_string(), "10/s");

        let rate_limit = RateLimit::from_str("500/m").unwrap();
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Minute);
        assert_eq!(rate_limit.to_string(), "500/m");
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(RateLimit::from_str("10/invalid").is_err());
        assert!(RateLimit::from_str("invalid").is_err());
        assert!(RateLimit::from_str("0/s").is_err());
    }

    #[test]
    fn refill_interval_spreads_requests() {
        let rate_limit = RateLimit::from_str("60/m").unwrap();
        assert_eq!(rate_limit.refill_interval(), Duration::from_secs(1));
        let rate_limit = RateLimit::from_str("4/s").unwrap();
        assert_eq!(rate_limit.refill_interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn unlimited_throttle_never_waits() {
        let throttle = Throttle::new(None);
        for _ in 0..100 {
            throttle.wait().await;
        }
        let throttle = Throttle::new(Some(&RateLimit::from_str("3/s").unwrap()));
        // The initial burst is available immediately.
        for _ in 0..3 {
            throttle.wait().await;
        }
    }
}
