//! 人性化时长格式
//!
//! 支持 "200ms"、"3s"、"1h30m"、"2d" 等写法，既用于 `ManagerConfig`
//! 的反序列化，也用于绑定 `Duration` 类型的字段。

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub use serde_with::{serde_as, DeserializeAs, SerializeAs};

/// `serde_with` 适配器：`Duration` <-> "1h30m"
pub struct HumanDur;

impl SerializeAs<Duration> for HumanDur {
    fn serialize_as<S>(source: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*source))
    }
}

impl<'de> DeserializeAs<'de, Duration> for HumanDur {
    fn deserialize_as<D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

fn unit_nanos(unit: &str) -> Option<f64> {
    let nanos = match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        "d" => 86400e9,
        _ => return None,
    };
    Some(nanos)
}

/// 解析时长字符串: "1h30m45s" -> Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        bail!("empty duration");
    }

    let mut total_nanos = 0f64;
    let mut rest = s.as_str();
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_end);
        if number.is_empty() {
            bail!("expected a number in duration {:?}", s);
        }
        let value: f64 = number
            .parse()
            .map_err(|_| anyhow!("invalid number {:?} in duration {:?}", number, s))?;

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);
        if unit.is_empty() {
            bail!("missing unit in duration {:?}", s);
        }
        let scale =
            unit_nanos(unit).ok_or_else(|| anyhow!("unknown unit {:?} in duration {:?}", unit, s))?;

        total_nanos += value * scale;
        rest = next;
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// 格式化时长: Duration -> "1h30m45s"
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let nanos = duration.subsec_nanos();
    let mut secs = duration.as_secs();
    if secs == 0 {
        return match nanos {
            n if n % 1_000_000 == 0 => format!("{}ms", n / 1_000_000),
            n if n % 1_000 == 0 => format!("{}us", n / 1_000),
            n => format!("{}ns", n),
        };
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    match (secs, nanos) {
        (0, 0) => {}
        (s, 0) => out.push_str(&format!("{}s", s)),
        (s, n) => out.push_str(&format!("{}ms", s * 1000 + u64::from(n) / 1_000_000)),
    }
    out
}
