use serde::{Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A proxy timeout in annotation form.
///
/// Accepts either a bare number of seconds (`"10"`) or a Go-style duration with unit suffixes
/// (`"500ms"`, `"1m30s"`). A bare number is normalized to an explicit unit (`"10"` becomes
/// `"10s"`); any other accepted value keeps its trimmed spelling so that re-encoding it yields
/// the same text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Timeout {
    duration: Duration,
    text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    #[error("duration is empty")]
    Empty,

    #[error("invalid duration {0:?}: missing a unit")]
    MissingUnit(String),

    #[error("invalid duration {0:?}: unknown unit {1:?}")]
    InvalidUnit(String, String),

    #[error("invalid duration {0:?}: {1:?} is not a number")]
    InvalidNumber(String, String),

    #[error("invalid duration {0:?}: out of range")]
    Overflow(String),
}

const NANOS_PER_SEC: u64 = 1_000_000_000;

// === impl Timeout ===

impl Timeout {
    pub fn from_secs(secs: u64) -> Self {
        Self {
            duration: Duration::from_secs(secs),
            text: format!("{secs}s"),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl From<Timeout> for Duration {
    fn from(Timeout { duration, .. }: Timeout) -> Self {
        duration
    }
}

impl FromStr for Timeout {
    type Err = TimeoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TimeoutError::Empty);
        }

        if s.bytes().all(|b| b.is_ascii_digit()) {
            let secs = s
                .parse::<u64>()
                .map_err(|_| TimeoutError::Overflow(s.to_string()))?;
            return Ok(Self::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(|| TimeoutError::MissingUnit(s.to_string()))?;
            let (number, tail) = rest.split_at(number_len);
            if number.is_empty() {
                return Err(TimeoutError::InvalidNumber(s.to_string(), rest.to_string()));
            }

            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);
            let nanos_per_unit = match unit {
                "ns" => 1,
                // U+00B5 is the micro sign; U+03BC is the Greek letter mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => 1_000,
                "ms" => 1_000_000,
                "s" => NANOS_PER_SEC,
                "m" => 60 * NANOS_PER_SEC,
                "h" => 60 * 60 * NANOS_PER_SEC,
                unit => return Err(TimeoutError::InvalidUnit(s.to_string(), unit.to_string())),
            };

            let nanos = scale(number, nanos_per_unit)
                .ok_or_else(|| TimeoutError::InvalidNumber(s.to_string(), number.to_string()))?;
            total = total
                .checked_add(Duration::from_nanos(nanos))
                .ok_or_else(|| TimeoutError::Overflow(s.to_string()))?;
            rest = tail;
        }

        Ok(Self {
            duration: total,
            text: s.to_string(),
        })
    }
}

/// Multiplies a decimal number by `unit` nanoseconds without going through floating point.
///
/// Fractional digits finer than a nanosecond are dropped.
fn scale(number: &str, unit: u64) -> Option<u64> {
    let (int, frac) = number.split_once('.').unwrap_or((number, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int = if int.is_empty() {
        0
    } else {
        int.parse::<u64>().ok()?
    };
    let mut nanos = int.checked_mul(unit)?;
    let mut place = unit;
    for digit in frac.bytes() {
        place /= 10;
        if place == 0 {
            break;
        }
        nanos = nanos.checked_add(u64::from(digit - b'0') * place)?;
    }
    Some(nanos)
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.text.fmt(f)
    }
}

impl Serialize for Timeout {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
