use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{fmt, str::FromStr, time::Duration};

/// A duration written the way Go's `time.ParseDuration` reads it: a sequence
/// of decimal numbers with unit suffixes (`300ms`, `1m30s`, `-1.5h`).
/// Unlike `std::time::Duration` it keeps its sign so validation can reject
/// negative values instead of failing to parse them.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct GoDuration {
    duration: Duration,
    negative: bool,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DurationError {
    #[error("invalid duration {0:?}: unknown unit, {EXPECTED_UNITS}")]
    InvalidUnit(String),
    #[error("invalid duration {0:?}: missing unit, {EXPECTED_UNITS}")]
    MissingUnit(String),
    #[error("invalid duration {0:?}: malformed number")]
    InvalidNumber(String),
    #[error("invalid duration {0:?}: out of range")]
    OutOfRange(String),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', 'ms', 's', 'm', 'h'";

impl GoDuration {
    pub const fn from_duration(duration: Duration) -> Self {
        Self {
            duration,
            negative: false,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.negative && !self.duration.is_zero()
    }

    pub fn is_zero(&self) -> bool {
        self.duration.is_zero()
    }

    /// The magnitude. Callers validate the sign first.
    pub fn as_duration(&self) -> Duration {
        self.duration
    }
}

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

fn unit_scale(unit: &str) -> Option<Duration> {
    Some(match unit {
        "ns" => Duration::from_nanos(1),
        // micro sign and greek mu are both accepted
        "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
        "ms" => Duration::from_millis(1),
        "s" => Duration::from_secs(1),
        "m" => Duration::from_secs(60),
        "h" => Duration::from_secs(3600),
        _ => return None,
    })
}

impl FromStr for GoDuration {
    type Err = DurationError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let negative = input.starts_with('-');
        let mut rest = input.strip_prefix(['-', '+']).unwrap_or(input);

        if rest == "0" {
            return Ok(Self {
                duration: Duration::ZERO,
                negative,
            });
        }
        if rest.is_empty() {
            return Err(DurationError::InvalidNumber(input.to_string()));
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let number_end = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| DurationError::MissingUnit(input.to_string()))?;
            let (number, tail) = rest.split_at(number_end);
            let value: f64 = number
                .parse()
                .map_err(|_| DurationError::InvalidNumber(input.to_string()))?;

            let unit_end = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_end);
            let scale =
                unit_scale(unit).ok_or_else(|| DurationError::InvalidUnit(input.to_string()))?;

            let out_of_range = || DurationError::OutOfRange(input.to_string());
            let part = Duration::try_from_secs_f64(scale.as_secs_f64() * value)
                .map_err(|_| out_of_range())?;
            total = total.checked_add(part).ok_or_else(out_of_range)?;
            rest = tail;
        }

        Ok(Self {
            duration: total,
            negative,
        })
    }
}

impl fmt::Debug for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_negative() {
            f.write_str("-")?;
        }
        fmt::Debug::fmt(&self.duration, f)
    }
}

impl Serialize for GoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
