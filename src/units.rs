use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde_json::Value;
use std::error::Error;

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// 1024-based; bytes print whole, larger units with two decimals.
pub fn size2str(size: f64) -> String {
    let mut size = size;
    let mut unit = 0;
    while size.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", size as i64, UNITS[0])
    } else {
        format!("{:.2}{}", size, UNITS[unit])
    }
}

/// Accepts unix seconds (number or numeric string) or a local date/datetime.
pub fn str2timestamp(value: &Value) -> Result<i64, Box<dyn Error>> {
    if let Some(ts) = value.as_i64() {
        return Ok(ts);
    }
    if let Some(ts) = value.as_f64() {
        return Ok(ts as i64);
    }
    let text = value.as_str().ok_or("expire is neither number nor string")?;
    let text = text.trim();
    if let Ok(ts) = text.parse::<i64>() {
        return Ok(ts);
    }

    let datetime = match NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        Ok(dt) => dt,
        Err(_) => {
            let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")?;
            NaiveDateTime::new(date, NaiveTime::from_hms_opt(0, 0, 0).ok_or("Invalid time")?)
        }
    };
    let local = Local
        .from_local_datetime(&datetime)
        .earliest()
        .ok_or("Invalid local time")?;

    Ok(local.timestamp())
}

pub fn timestamp2str(ts: i64) -> String {
    match DateTime::from_timestamp(ts, 0) {
        Some(dt) => dt
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => ts.to_string(),
    }
}

pub fn duration2str(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let secs = secs.unsigned_abs();
    let days = secs / 86400;
    let rest = secs % 86400;
    format!(
        "{sign}{days}d {:02}:{:02}:{:02}",
        rest / 3600,
        rest % 3600 / 60,
        rest % 60
    )
}

/// Numbers in panel payloads show up both as JSON numbers and as strings.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n: &f64| n.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sizes() {
        assert_eq!(size2str(0.0), "0B");
        assert_eq!(size2str(1023.0), "1023B");
        assert_eq!(size2str(1536.0), "1.50KB");
        assert_eq!(size2str(10.0 * 1024.0 * 1024.0 * 1024.0), "10.00GB");
        assert_eq!(size2str(-2048.0), "-2.00KB");
    }

    #[test]
    fn timestamps_roundtrip_through_local_format() {
        let ts = str2timestamp(&json!("2030-01-02 03:04:05")).unwrap();
        assert_eq!(timestamp2str(ts), "2030-01-02 03:04:05");
        assert_eq!(str2timestamp(&json!(1700000000)).unwrap(), 1700000000);
        assert_eq!(str2timestamp(&json!("1700000000")).unwrap(), 1700000000);
        assert!(str2timestamp(&json!("soon")).is_err());
        assert!(str2timestamp(&json!(null)).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(duration2str(90061), "1d 01:01:01");
        assert_eq!(duration2str(-59), "-0d 00:00:59");
    }

    #[test]
    fn numbers_from_strings() {
        assert_eq!(as_number(&json!("12")), Some(12.0));
        assert_eq!(as_number(&json!(3.5)), Some(3.5));
        assert_eq!(as_number(&json!("x")), None);
        assert_eq!(as_number(&json!("NaN")), None);
        assert_eq!(as_number(&json!("inf")), None);
        assert_eq!(as_number(&json!("-infinity")), None);
    }
}
