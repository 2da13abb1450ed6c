//! Rate expressions and the numeric parameters handed to limiters.
//!
//! A rate is written as `<count>/<interval>`, for example `10/1s`, `5K/m`
//! or `2M/10m`. The count accepts an optional `K` (thousand) or `M`
//! (million) suffix; the interval is an optional integer followed by one of
//! `s`, `m` or `h`, where a missing integer means one unit.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Shortest tick a limiter will run with.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A quantity of requests per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    /// Requests per interval
    pub requests: NonZeroUsize,
    /// Length of one interval
    pub interval: Duration,
}

impl Rate {
    /// Create a rate from already parsed parts.
    pub fn new(requests: usize, interval: Duration) -> Result<Self> {
        let requests = NonZeroUsize::new(requests)
            .ok_or_else(|| GatewayError::InvalidRate(format!("{}/{:?}", requests, interval)))?;
        if interval.is_zero() {
            return Err(GatewayError::InvalidRate(format!(
                "{}/{:?}",
                requests, interval
            )));
        }
        Ok(Self { requests, interval })
    }
}

impl FromStr for Rate {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidRate(s.to_string());

        let (count, interval) = s.trim().split_once('/').ok_or_else(invalid)?;
        let requests = parse_count(count.trim()).ok_or_else(invalid)?;
        let interval = parse_interval(interval.trim()).ok_or_else(invalid)?;

        Rate::new(requests, interval).map_err(|_| invalid())
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.requests,
            humantime::format_duration(self.interval)
        )
    }
}

fn parse_count(s: &str) -> Option<usize> {
    let (digits, multiplier) = match s.chars().last()? {
        'K' => (&s[..s.len() - 1], 1_000),
        'M' => (&s[..s.len() - 1], 1_000_000),
        _ => (s, 1),
    };
    let value: usize = digits.parse().ok()?;
    value.checked_mul(multiplier)
}

fn parse_interval(s: &str) -> Option<Duration> {
    let unit = s.chars().last()?;
    let digits = &s[..s.len() - unit.len_utf8()];
    let unit_secs = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        _ => return None,
    };
    let value: u64 = if digits.is_empty() {
        1
    } else {
        digits.parse().ok()?
    };
    Some(Duration::from_secs(value.checked_mul(unit_secs)?))
}

/// Numeric parameters for one limiter instance.
///
/// `capacity` is the bucket size for the bucket algorithms; `quantity` is
/// the amount released (or allowed) per `interval` tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitParams {
    pub capacity: NonZeroUsize,
    pub quantity: NonZeroUsize,
    pub interval: Duration,
}

impl LimitParams {
    /// Build parameters from a rate and an optional explicit capacity.
    ///
    /// Without an explicit capacity the bucket holds one tick's worth.
    pub fn new(rate: Rate, capacity: Option<usize>) -> Result<Self> {
        let capacity = match capacity {
            Some(value) => NonZeroUsize::new(value).ok_or_else(|| {
                GatewayError::Config("capacity must be greater than zero".to_string())
            })?,
            None => rate.requests,
        };
        Ok(Self {
            capacity,
            quantity: rate.requests,
            interval: rate.interval.max(MIN_INTERVAL),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(s: &str) -> Rate {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_plain_rate() {
        let r = rate("10/1s");
        assert_eq!(r.requests.get(), 10);
        assert_eq!(r.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_unit_without_value() {
        assert_eq!(rate("3/s").interval, Duration::from_secs(1));
        assert_eq!(rate("3/m").interval, Duration::from_secs(60));
        assert_eq!(rate("3/h").interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_count_suffixes() {
        assert_eq!(rate("5K/10m").requests.get(), 5_000);
        assert_eq!(rate("2M/h").requests.get(), 2_000_000);
        assert_eq!(rate("5K/10m").interval, Duration::from_secs(600));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "10", "10/", "/s", "10/1d", "x/s", "10G/s", "0/s", "10/0s", "10/-1s"] {
            assert!(bad.parse::<Rate>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn test_rate_display() {
        assert_eq!(rate("10/1s").to_string(), "10/1s");
        assert_eq!(rate("7/2m").to_string(), "7/2m");
    }

    #[test]
    fn test_params_default_capacity_to_quantity() {
        let params = LimitParams::new(rate("4/s"), None).unwrap();
        assert_eq!(params.capacity.get(), 4);
        assert_eq!(params.quantity.get(), 4);

        let params = LimitParams::new(rate("4/s"), Some(20)).unwrap();
        assert_eq!(params.capacity.get(), 20);
        assert_eq!(params.quantity.get(), 4);
    }

    #[test]
    fn test_params_reject_zero_capacity() {
        assert!(LimitParams::new(rate("4/s"), Some(0)).is_err());
    }
}
