//! ISO-8601 durations (`PT5M`, `P1DT12H`, `PT0.5S`, `P2W`).
//!
//! Only calendar-independent designators are accepted: weeks, days, hours,
//! minutes and (fractional) seconds. Years and months have no fixed length
//! and are rejected.

use chrono::Duration;

use crate::error::CoreError;

/// Longest accepted duration: 100 years of 365 days. Anything longer cannot be
/// added to a timestamp reliably.
pub const MAX_DURATION_MS: i64 = 100 * 365 * 86_400_000;

/// [`MAX_DURATION_MS`] as a [`chrono::Duration`].
pub fn max_duration() -> Duration {
    Duration::milliseconds(MAX_DURATION_MS)
}

/// Parse an ISO-8601 duration into a [`chrono::Duration`].
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, CoreError> {
    let s = input.trim();
    let rest = s
        .strip_prefix('P')
        .ok_or_else(|| CoreError::invalid_duration(input, "must start with 'P'"))?;
    if rest.is_empty() {
        return Err(CoreError::invalid_duration(input, "no components"));
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return Err(CoreError::invalid_duration(input, "empty time part after 'T'"));
            }
            (date, Some(time))
        }
        None => (rest, None),
    };

    let mut total_ms: i64 = 0;
    let mut add = |value_ms: i64| -> Result<(), CoreError> {
        total_ms = total_ms
            .checked_add(value_ms)
            .ok_or_else(|| CoreError::invalid_duration(input, "overflow"))?;
        Ok(())
    };

    for (value, unit) in components(input, date_part)? {
        let ms_per_unit: f64 = match unit {
            'W' => 7.0 * 86_400_000.0,
            'D' => 86_400_000.0,
            'Y' | 'M' => {
                return Err(CoreError::invalid_duration(
                    input,
                    "years and months have no fixed length",
                ));
            }
            other => {
                return Err(CoreError::invalid_duration(
                    input,
                    format!("unknown date designator '{other}'"),
                ));
            }
        };
        add(to_millis(input, value, ms_per_unit)?)?;
    }

    if let Some(time_part) = time_part {
        for (value, unit) in components(input, time_part)? {
            let ms_per_unit: f64 = match unit {
                'H' => 3_600_000.0,
                'M' => 60_000.0,
                'S' => 1_000.0,
                other => {
                    return Err(CoreError::invalid_duration(
                        input,
                        format!("unknown time designator '{other}'"),
                    ));
                }
            };
            add(to_millis(input, value, ms_per_unit)?)?;
        }
    }

    if total_ms > MAX_DURATION_MS {
        return Err(CoreError::invalid_duration(input, "longer than 100 years"));
    }
    Ok(Duration::milliseconds(total_ms))
}

/// Render a duration in the canonical `PnDTnHnMnS` form.
pub fn format_iso8601_duration(duration: Duration) -> String {
    let total_ms = duration.num_milliseconds().max(0);
    if total_ms == 0 {
        return "PT0S".to_string();
    }

    let days = total_ms / 86_400_000;
    let hours = (total_ms % 86_400_000) / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let millis = total_ms % 60_000;

    let mut out = String::from("P");
    if days > 0 {
        out.push_str(&format!("{days}D"));
    }
    if hours > 0 || minutes > 0 || millis > 0 {
        out.push('T');
        if hours > 0 {
            out.push_str(&format!("{hours}H"));
        }
        if minutes > 0 {
            out.push_str(&format!("{minutes}M"));
        }
        if millis > 0 {
            if millis % 1_000 == 0 {
                out.push_str(&format!("{}S", millis / 1_000));
            } else {
                out.push_str(&format!("{}.{:03}S", millis / 1_000, millis % 1_000));
            }
        }
    }
    out
}

fn components(input: &str, part: &str) -> Result<Vec<(f64, char)>, CoreError> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
            continue;
        }
        if number.is_empty() {
            return Err(CoreError::invalid_duration(
                input,
                format!("designator '{c}' without a value"),
            ));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| CoreError::invalid_duration(input, format!("bad number '{number}'")))?;
        out.push((value, c));
        number.clear();
    }
    if !number.is_empty() {
        return Err(CoreError::invalid_duration(input, "trailing number without designator"));
    }
    Ok(out)
}

fn to_millis(input: &str, value: f64, ms_per_unit: f64) -> Result<i64, CoreError> {
    let ms = (value * ms_per_unit).round();
    if !ms.is_finite() || ms > i64::MAX as f64 {
        return Err(CoreError::invalid_duration(input, "overflow"));
    }
    Ok(ms as i64)
}
