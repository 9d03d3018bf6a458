// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Human-readable configuration values: `"96MB"` sizes and `"10s"`
//! durations, serializable in both directions.

use std::fmt::{self, Display, Formatter};
use std::ops::{Div, Mul};
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const UNIT: u64 = 1;
const KB: u64 = UNIT * 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

const MS: u64 = 1;
const SECOND: u64 = 1000 * MS;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableSize(pub u64);

impl ReadableSize {
    pub const fn kb(count: u64) -> ReadableSize {
        ReadableSize(count * KB)
    }

    pub const fn mb(count: u64) -> ReadableSize {
        ReadableSize(count * MB)
    }

    pub const fn gb(count: u64) -> ReadableSize {
        ReadableSize(count * GB)
    }

    pub const fn as_mb(self) -> u64 {
        self.0 / MB
    }
}

impl Div<u64> for ReadableSize {
    type Output = ReadableSize;

    fn div(self, rhs: u64) -> ReadableSize {
        ReadableSize(self.0 / rhs)
    }
}

impl Mul<u64> for ReadableSize {
    type Output = ReadableSize;

    fn mul(self, rhs: u64) -> ReadableSize {
        ReadableSize(self.0 * rhs)
    }
}

impl Display for ReadableSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let size = self.0;
        if size == 0 {
            write!(f, "{}KB", size)
        } else if size % GB == 0 {
            write!(f, "{}GB", size / GB)
        } else if size % MB == 0 {
            write!(f, "{}MB", size / MB)
        } else if size % KB == 0 {
            write!(f, "{}KB", size / KB)
        } else {
            write!(f, "{}B", size)
        }
    }
}

impl FromStr for ReadableSize {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableSize, String> {
        let size_str = s.trim();
        if size_str.is_empty() {
            return Err(format!("{:?} is not a valid size", s));
        }
        let split = size_str
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(size_str.len());
        let (num, unit) = size_str.split_at(split);
        let number: f64 = num
            .parse()
            .map_err(|_| format!("{:?} is not a valid size", s))?;
        let mul = match unit.trim().to_uppercase().as_str() {
            "" | "B" => UNIT,
            "KB" | "KIB" => KB,
            "MB" | "MIB" => MB,
            "GB" | "GIB" => GB,
            _ => return Err(format!("{:?} has an unknown unit", s)),
        };
        Ok(ReadableSize((number * mul as f64) as u64))
    }
}

impl Serialize for ReadableSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ReadableSize, D::Error> {
        struct SizeVisitor;

        impl<'de> Visitor<'de> for SizeVisitor {
            type Value = ReadableSize;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a size string or a number of bytes")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ReadableSize, E> {
                Ok(ReadableSize(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ReadableSize, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(SizeVisitor)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadableDuration(pub Duration);

impl ReadableDuration {
    pub const fn millis(millis: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_millis(millis))
    }

    pub const fn secs(secs: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_secs(secs))
    }

    pub const fn minutes(minutes: u64) -> ReadableDuration {
        ReadableDuration::secs(minutes * 60)
    }

    pub const fn hours(hours: u64) -> ReadableDuration {
        ReadableDuration::minutes(hours * 60)
    }

    pub fn as_millis(self) -> u64 {
        self.0.as_millis() as u64
    }

    pub fn is_zero(self) -> bool {
        self.0.as_nanos() == 0
    }
}

impl From<ReadableDuration> for Duration {
    fn from(d: ReadableDuration) -> Duration {
        d.0
    }
}

impl Display for ReadableDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut ms = self.as_millis();
        if ms == 0 {
            return write!(f, "0s");
        }
        let mut written = false;
        for (unit, name) in [(HOUR, "h"), (MINUTE, "m"), (SECOND, "s"), (MS, "ms")] {
            if ms >= unit {
                write!(f, "{}{}", ms / unit, name)?;
                ms %= unit;
                written = true;
            }
        }
        debug_assert!(written);
        Ok(())
    }
}

impl FromStr for ReadableDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<ReadableDuration, String> {
        let mut dur_str = s.trim();
        if dur_str.is_empty() {
            return Err(format!("{:?} is not a valid duration", s));
        }
        let mut total = 0u64;
        while !dur_str.is_empty() {
            let split = dur_str
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| format!("{:?} is missing a time unit", s))?;
            let (num, rest) = dur_str.split_at(split);
            let number: f64 = num
                .parse()
                .map_err(|_| format!("{:?} is not a valid duration", s))?;
            let (unit, rest) = if rest.starts_with("ms") {
                (MS, &rest[2..])
            } else if rest.starts_with('h') {
                (HOUR, &rest[1..])
            } else if rest.starts_with('m') {
                (MINUTE, &rest[1..])
            } else if rest.starts_with('s') {
                (SECOND, &rest[1..])
            } else {
                return Err(format!("{:?} has an unknown time unit", s));
            };
            total += (number * unit as f64) as u64;
            dur_str = rest.trim_start();
        }
        Ok(ReadableDuration(Duration::from_millis(total)))
    }
}

impl Serialize for ReadableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ReadableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ReadableDuration, D::Error> {
        struct DurVisitor;

        impl<'de> Visitor<'de> for DurVisitor {
            type Value = ReadableDuration;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ReadableDuration, E> {
                v.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(DurVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_size() {
        assert_eq!("1KB".parse::<ReadableSize>().unwrap(), ReadableSize::kb(1));
        assert_eq!("96MB".parse::<ReadableSize>().unwrap(), ReadableSize::mb(96));
        assert_eq!(
            "1.5GB".parse::<ReadableSize>().unwrap(),
            ReadableSize(GB + 512 * MB)
        );
        assert_eq!("512".parse::<ReadableSize>().unwrap(), ReadableSize(512));
        assert!("12PB".parse::<ReadableSize>().is_err());
        assert!("".parse::<ReadableSize>().is_err());

        assert_eq!(ReadableSize::mb(96) / 8, ReadableSize::mb(12));
        assert_eq!(ReadableSize::mb(2).to_string(), "2MB");
    }

    #[test]
    fn test_readable_duration() {
        assert_eq!(
            "10s".parse::<ReadableDuration>().unwrap(),
            ReadableDuration::secs(10)
        );
        assert_eq!(
            "100ms".parse::<ReadableDuration>().unwrap(),
            ReadableDuration::millis(100)
        );
        assert_eq!(
            "1m30s".parse::<ReadableDuration>().unwrap(),
            ReadableDuration::secs(90)
        );
        assert!("10x".parse::<ReadableDuration>().is_err());
        assert!("s".parse::<ReadableDuration>().is_err());

        assert_eq!(ReadableDuration::secs(90).to_string(), "1m30s");
        assert_eq!(ReadableDuration::millis(150).to_string(), "150ms");
    }
}
