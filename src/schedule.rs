// schedule.rs

use std::{collections::BTreeSet, path::Path};

use chrono::{FixedOffset, Offset, Timelike, Utc};
use log::*;
use tokio::time::{sleep, Duration};

pub const DEFAULT_MAX_TEMP: f32 = 47.0;
/// California
pub const DEFAULT_TIMEZONE: i32 = -7;
pub const SCHEDULE_FALLBACK_DELAY: Duration = Duration::from_secs(300);

/// Time-of-day table and limits, built once at boot and read-only afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleTable {
    /// Minutes the relay should be on, as `hour * 100 + minute` local time.
    pub on_minutes: BTreeSet<u16>,
    pub max_temperature: f32,
    pub timezone_offset_hours: i32,
}

impl Default for ScheduleTable {
    fn default() -> Self {
        Self {
            on_minutes: BTreeSet::new(),
            max_temperature: DEFAULT_MAX_TEMP,
            timezone_offset_hours: DEFAULT_TIMEZONE,
        }
    }
}

/// `HHMM` key of a wall-clock time.
pub fn minute_key<T: Timelike>(t: &T) -> u16 {
    (t.hour() * 100 + t.minute()) as u16
}

impl ScheduleTable {
    /// Parse the line-oriented schedule file.
    ///
    /// Blank lines and `#` comments are skipped, `@maxtemp <n>` and
    /// `@timezone <n>` set the limits, every other line is an `HHMM` entry.
    /// Bad lines are logged and ignored.
    pub fn parse(text: &str) -> Self {
        let mut table = Self::default();

        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(arg) = line.strip_prefix("@maxtemp") {
                match arg.trim().parse::<f32>() {
                    Ok(t) if t.is_finite() => table.max_temperature = t,
                    _ => warn!("times.dat:{}: bad @maxtemp {arg:?}", n + 1),
                }
            } else if let Some(arg) = line.strip_prefix("@timezone") {
                match arg.trim().parse::<i32>() {
                    Ok(tz) if (-12..=14).contains(&tz) => table.timezone_offset_hours = tz,
                    _ => warn!("times.dat:{}: bad @timezone {arg:?}", n + 1),
                }
            } else {
                match parse_hhmm(line) {
                    Some(key) => {
                        table.on_minutes.insert(key);
                    }
                    None => warn!("times.dat:{}: skipping {line:?}", n + 1),
                }
            }
        }
        table
    }

    /// Read the schedule file. A missing or unreadable file is not fatal: after
    /// `fallback_delay` the built-in defaults are used.
    pub async fn load(path: &Path, fallback_delay: Duration) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let table = Self::parse(&text);
                info!(
                    "Schedule: {} slots, max {:.1}°C, UTC{:+}",
                    table.on_minutes.len(),
                    table.max_temperature,
                    table.timezone_offset_hours
                );
                table
            }
            Err(e) => {
                error!("No scheduling {path:?} file read error {e}");
                sleep(fallback_delay).await;
                Self::default()
            }
        }
    }

    pub fn is_on_at(&self, key: u16) -> bool {
        self.on_minutes.contains(&key)
    }

    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix())
    }
}

fn parse_hhmm(s: &str) -> Option<u16> {
    let key = s.parse::<u16>().ok()?;
    (key / 100 < 24 && key % 100 < 60).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_times_file() {
        let table = ScheduleTable::parse("@maxtemp 35\n0800\n#comment\n\n1730");
        assert_eq!(table.max_temperature, 35.0);
        assert_eq!(table.on_minutes, BTreeSet::from([800, 1730]));
        assert_eq!(table.timezone_offset_hours, DEFAULT_TIMEZONE);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let table = ScheduleTable::parse("@timezone 2\n@maxtemp hot\nnoon\n-100\n2460\n2500\n 0001 \n2359\r\n");
        assert_eq!(table.timezone_offset_hours, 2);
        assert_eq!(table.max_temperature, DEFAULT_MAX_TEMP);
        assert_eq!(table.on_minutes, BTreeSet::from([1, 2359]));
    }

    #[test]
    fn minute_key_matches_file_format() {
        let t = NaiveTime::from_hms_opt(8, 5, 59).unwrap();
        assert_eq!(minute_key(&t), 805);
        let t = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        assert_eq!(minute_key(&t), 0);
    }

    #[test]
    fn utc_offset_from_timezone() {
        let table = ScheduleTable {
            timezone_offset_hours: -7,
            ..Default::default()
        };
        assert_eq!(table.utc_offset().local_minus_utc(), -7 * 3600);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_falls_back_after_delay() {
        let start = tokio::time::Instant::now();
        let table = ScheduleTable::load(
            Path::new("/nonexistent/esp32relay/times.dat"),
            Duration::from_secs(300),
        )
        .await;
        assert_eq!(table, ScheduleTable::default());
        assert!(start.elapsed() >= Duration::from_secs(300));
    }
}

// EOF
